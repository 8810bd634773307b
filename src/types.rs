/**
 * ============================================================================
 * TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Data structures shared across the capture engine
 *
 * TYPES:
 * - DeviceClass / ActionKind: stable string-keyed enums for input events
 * - RawInputEvent: one buffered input occurrence (pre-persistence)
 * - SessionRecord / SessionStatus: one recording run in the store
 * - ActionCode: stable small-integer encoding of a raw control
 * - FrameTiming / HealthSample: pipeline audit records
 * - StopSummary / SessionInfo: orchestrator API results
 *
 * ============================================================================
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Input events
// =============================================================================

// Device class an input event originates from. The string forms are part of
// the durable schema and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Keyboard,
    Mouse,
    Xbox,
    Playstation,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Keyboard => "keyboard",
            DeviceClass::Mouse => "mouse",
            DeviceClass::Xbox => "xbox",
            DeviceClass::Playstation => "playstation",
        }
    }

    pub fn from_str(s: &str) -> Option<DeviceClass> {
        match s {
            "keyboard" => Some(DeviceClass::Keyboard),
            "mouse" => Some(DeviceClass::Mouse),
            "xbox" => Some(DeviceClass::Xbox),
            "playstation" => Some(DeviceClass::Playstation),
            _ => None,
        }
    }

    // Gamepad classes are captured by the polling task rather than OS hooks
    pub fn is_gamepad(&self) -> bool {
        matches!(self, DeviceClass::Xbox | DeviceClass::Playstation)
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// What happened to the control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Press,
    Release,
    Move,
    Scroll,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Press => "press",
            ActionKind::Release => "release",
            ActionKind::Move => "move",
            ActionKind::Scroll => "scroll",
        }
    }

    pub fn from_str(s: &str) -> Option<ActionKind> {
        match s {
            "press" => Some(ActionKind::Press),
            "release" => Some(ActionKind::Release),
            "move" => Some(ActionKind::Move),
            "scroll" => Some(ActionKind::Scroll),
            _ => None,
        }
    }
}

// One discrete input occurrence, buffered in memory until the session stops.
//
// `timestamp_ms` is relative to session start with the configured latency
// offset already applied; it may be negative for events delivered before the
// offset-shifted origin. It is never wall-clock.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInputEvent {
    pub timestamp_ms: i64,
    pub device: DeviceClass,
    pub control: String,
    pub action: ActionKind,
    pub value: Option<f64>,
    pub x_position: Option<f64>,
    pub y_position: Option<f64>,
}

// A persisted input event row, including its assigned action code.
#[derive(Debug, Clone)]
pub struct StoredInputEvent {
    pub id: i64,
    pub session_id: i64,
    pub event: RawInputEvent,
    pub action_code_id: i64,
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Recording => "recording",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<SessionStatus> {
        match s {
            "recording" => Some(SessionStatus::Recording),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

// One recording run. `end_time` and `duration_seconds` stay `None` while the
// status is `Recording`; both are set once the run completes or fails.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub game_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub video_path: Option<String>,
    pub system_audio_path: Option<String>,
    pub microphone_audio_path: Option<String>,
    pub input_type: DeviceClass,
    pub fps: u32,
    pub latency_offset_ms: i64,
    pub status: SessionStatus,
    pub monitor_index: u32,
    pub notes: Option<String>,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    pub video_codec: Option<String>,
    pub total_frames: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

// =============================================================================
// Action codes
// =============================================================================

// Stable mapping from (device class, raw control) to a small integer used as
// an ML label. `encoded_value` is contiguous from 0 within each device class
// and is never renumbered once assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCode {
    pub id: i64,
    pub device: DeviceClass,
    pub raw_input: String,
    pub encoded_value: i64,
    pub description: Option<String>,
    pub category: Option<String>,
}

// =============================================================================
// Pipeline audit records
// =============================================================================

// Per-frame capture/write timing for one session. A `dropped` row has no
// write timestamp; the frame never reached the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTiming {
    pub frame_number: u64,
    pub capture_timestamp_ms: i64,
    pub write_timestamp_ms: Option<i64>,
    pub dropped: bool,
}

// Periodic health snapshot taken while a session records.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub check_time: DateTime<Utc>,
    pub disk_space_gb: f64,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
}

// =============================================================================
// Orchestrator API results
// =============================================================================

// Returned by `stop_recording`
#[derive(Debug, Clone, Serialize)]
pub struct StopSummary {
    pub session_id: i64,
    pub duration_seconds: i64,
    pub event_count: usize,
}

// Returned by `get_session_info` while a recording is active
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: i64,
    pub game_name: String,
    pub is_recording: bool,
    pub start_time: DateTime<Utc>,
    pub session_path: String,
}

// Aggregate store statistics for front ends
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatistics {
    pub total_sessions: u64,
    pub completed_sessions: u64,
    pub unique_games: u64,
    pub total_duration_seconds: i64,
    pub total_input_events: u64,
    pub total_frames: u64,
    pub total_storage_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_class_round_trip() {
        for device in [
            DeviceClass::Keyboard,
            DeviceClass::Mouse,
            DeviceClass::Xbox,
            DeviceClass::Playstation,
        ] {
            assert_eq!(DeviceClass::from_str(device.as_str()), Some(device));
        }
        assert_eq!(DeviceClass::from_str("steering_wheel"), None);
    }

    #[test]
    fn test_action_kind_round_trip() {
        for action in [
            ActionKind::Press,
            ActionKind::Release,
            ActionKind::Move,
            ActionKind::Scroll,
        ] {
            assert_eq!(ActionKind::from_str(action.as_str()), Some(action));
        }
    }

    #[test]
    fn test_gamepad_classes() {
        assert!(DeviceClass::Xbox.is_gamepad());
        assert!(DeviceClass::Playstation.is_gamepad());
        assert!(!DeviceClass::Keyboard.is_gamepad());
        assert!(!DeviceClass::Mouse.is_gamepad());
    }
}
