/**
 * ============================================================================
 * RECORDER CONFIG MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration for one recording session
 *
 * FUNCTIONALITY:
 * - serde round-trip so front ends can persist and edit settings
 * - Defaults suitable for 60fps gameplay capture
 * - Validation before a session starts
 *
 * Config file loading/saving lives in the front ends; the engine only
 * consumes the struct.
 *
 * ============================================================================
 */

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DeviceClass;

// Valid FFmpeg presets for encoding
const VALID_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow",
];

// Video codec for the session. H.264/H.265 stream through an external
// encoder process; Raw writes uncompressed frames with a JSON sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Raw,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Raw => "rawvideo",
        }
    }

    // File extension for the video sink output
    pub fn extension(&self) -> &'static str {
        match self {
            VideoCodec::H264 | VideoCodec::H265 => "mp4",
            VideoCodec::Raw => "raw",
        }
    }

    pub fn needs_external_encoder(&self) -> bool {
        matches!(self, VideoCodec::H264 | VideoCodec::H265)
    }
}

// Configuration for a recording session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    // Game or application being recorded (used for the session directory name)
    pub game_name: String,

    // Base directory under which per-session directories are created
    pub sessions_dir: PathBuf,

    // Input device class to record
    pub input_type: DeviceClass,

    // Capture pointer events alongside the keyboard (keyboard mode only)
    #[serde(default = "default_true")]
    pub capture_pointer: bool,

    // Target framerate for video capture (fps)
    #[serde(default = "default_fps")]
    pub fps: u32,

    // Monitor to capture (0 = primary)
    #[serde(default)]
    pub monitor_index: u32,

    // Video codec
    #[serde(default = "default_codec")]
    pub codec: VideoCodec,

    // CRF quality for external encoding (0-51, lower = better quality)
    #[serde(default = "default_crf")]
    pub crf: u8,

    // FFmpeg preset for external encoding
    #[serde(default = "default_preset")]
    pub preset: String,

    // Audio sample rate (Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    // Audio channels (1 = mono, 2 = stereo)
    #[serde(default = "default_channels")]
    pub channels: u16,

    // Record system audio output (loopback device required)
    #[serde(default = "default_true")]
    pub capture_system_audio: bool,

    // Record the default microphone
    #[serde(default = "default_true")]
    pub capture_microphone: bool,

    // Signed millisecond shift applied to input timestamps to compensate
    // measured input/video lag (positive shifts input later)
    #[serde(default)]
    pub latency_offset_ms: i64,

    // Seconds between health snapshots while recording (0 disables sampling)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            game_name: "unknown".to_string(),
            sessions_dir: PathBuf::from("sessions"),
            input_type: DeviceClass::Keyboard,
            capture_pointer: true,
            fps: default_fps(),
            monitor_index: 0,
            codec: default_codec(),
            crf: default_crf(),
            preset: default_preset(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            capture_system_audio: true,
            capture_microphone: true,
            latency_offset_ms: 0,
            health_interval_secs: default_health_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fps() -> u32 {
    60
}

fn default_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_crf() -> u8 {
    20 // Visually near-lossless for gameplay
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_channels() -> u16 {
    2
}

fn default_health_interval() -> u64 {
    30
}

impl RecorderConfig {
    // Validate configuration before a session starts
    pub fn validate(&self) -> Result<()> {
        if self.game_name.trim().is_empty() {
            return Err(Error::Config("game_name must not be empty".to_string()));
        }

        if self.fps < 1 || self.fps > 240 {
            return Err(Error::Config("fps must be between 1 and 240".to_string()));
        }

        if self.crf > 51 {
            return Err(Error::Config("crf must be between 0 and 51".to_string()));
        }

        if !VALID_PRESETS.contains(&self.preset.as_str()) {
            return Err(Error::Config(format!(
                "invalid preset '{}'; must be one of: {}",
                self.preset,
                VALID_PRESETS.join(", ")
            )));
        }

        if self.sample_rate < 8_000 || self.sample_rate > 192_000 {
            return Err(Error::Config(
                "sample_rate must be between 8000 and 192000".to_string(),
            ));
        }

        if self.channels == 0 || self.channels > 8 {
            return Err(Error::Config("channels must be between 1 and 8".to_string()));
        }

        Ok(())
    }

    // Directory-safe slug of the game name
    pub fn game_slug(&self) -> String {
        self.game_name.replace([' ', '/', '\\'], "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = RecorderConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: RecorderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RecorderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RecorderConfig::default();
        config.fps = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.crf = 52;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.preset = "turbo".to_string();
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.game_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_game_slug() {
        let mut config = RecorderConfig::default();
        config.game_name = "Half Life/2".to_string();
        assert_eq!(config.game_slug(), "Half_Life_2");
    }

    #[test]
    fn test_codec_properties() {
        assert!(VideoCodec::H264.needs_external_encoder());
        assert!(VideoCodec::H265.needs_external_encoder());
        assert!(!VideoCodec::Raw.needs_external_encoder());
        assert_eq!(VideoCodec::H264.extension(), "mp4");
        assert_eq!(VideoCodec::Raw.extension(), "raw");
    }
}
