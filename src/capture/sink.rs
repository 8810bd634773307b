/**
 * ============================================================================
 * VIDEO SINK MODULE
 * ============================================================================
 *
 * PURPOSE: Destinations for the raw BGRA frame stream
 *
 * SINKS:
 * - FfmpegSink: long-lived child encoder process; the fixed-format header
 *   (dimensions, rate, pixel layout) is declared once via arguments, then
 *   raw frame bytes stream over its stdin in presentation order
 * - RawSink: built-in uncompressed writer with a JSON metadata sidecar,
 *   used when the encoder process cannot be started
 *
 * `open_sink` owns the fallback policy: encoder unavailability downgrades
 * the codec with a warning, it never aborts the session.
 *
 * ============================================================================
 */

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::capture::screen::PIXEL_FORMAT;
use crate::config::VideoCodec;
use crate::error::{Error, Result};

// One-time stream declaration shared by every sink
#[derive(Debug, Clone, Copy)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

// Destination for a continuous stream of raw BGRA frames. Implementations
// must tolerate `finish` being called with zero frames written.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    // Flush and close the sink; returns total bytes on disk
    fn finish(&mut self) -> Result<u64>;

    fn codec_name(&self) -> &'static str;
    fn output_path(&self) -> &Path;
}

// Open the configured sink for a session directory, falling back to the
// uncompressed writer if the external encoder cannot be spawned.
pub fn open_sink(
    codec: VideoCodec,
    crf: u8,
    preset: &str,
    info: StreamInfo,
    session_dir: &Path,
) -> Result<Box<dyn FrameSink>> {
    if codec.needs_external_encoder() {
        let path = session_dir.join(format!("video.{}", codec.extension()));
        match FfmpegSink::spawn(codec, crf, preset, info, &path) {
            Ok(sink) => return Ok(Box::new(sink)),
            Err(e) => {
                log::warn!(
                    "External encoder unavailable ({}), falling back to uncompressed writer",
                    e
                );
            }
        }
    }

    let path = session_dir.join(format!("video.{}", VideoCodec::Raw.extension()));
    Ok(Box::new(RawSink::create(info, &path)?))
}

// =============================================================================
// External encoder sink
// =============================================================================

pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    path: PathBuf,
    codec: VideoCodec,
}

impl FfmpegSink {
    pub fn spawn(
        codec: VideoCodec,
        crf: u8,
        preset: &str,
        info: StreamInfo,
        output_path: &Path,
    ) -> Result<FfmpegSink> {
        let codec_args: &[&str] = match codec {
            VideoCodec::H264 => &["-c:v", "libx264", "-movflags", "+faststart"],
            VideoCodec::H265 => &["-c:v", "libx265", "-tag:v", "hvc1"],
            VideoCodec::Raw => {
                return Err(Error::VideoSink(
                    "raw codec does not use the external encoder".to_string(),
                ))
            }
        };

        log::info!(
            "Spawning encoder: {}x{} @ {} fps, {} CRF {}, preset {} -> {:?}",
            info.width,
            info.height,
            info.fps,
            codec.as_str(),
            crf,
            preset,
            output_path
        );

        let mut child = Command::new("ffmpeg")
            .args([
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                PIXEL_FORMAT,
                "-s",
                &format!("{}x{}", info.width, info.height),
                "-r",
                &info.fps.to_string(),
                "-i",
                "pipe:0",
            ])
            .args(codec_args)
            .args(["-preset", preset, "-crf", &crf.to_string()])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null()) // Discard to prevent pipe buffer blocking
            .spawn()
            .map_err(|e| Error::VideoSink(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::VideoSink("failed to open encoder stdin".to_string()))?;

        Ok(FfmpegSink {
            child,
            stdin: Some(stdin),
            path: output_path.to_path_buf(),
            codec,
        })
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::VideoSink("encoder sink already closed".to_string()))?;
        stdin
            .write_all(frame)
            .map_err(|e| Error::VideoSink(format!("failed to write frame to encoder: {}", e)))
    }

    fn finish(&mut self) -> Result<u64> {
        // Closing stdin signals EOF; the encoder finalizes the container
        drop(self.stdin.take());

        let status = self
            .child
            .wait()
            .map_err(|e| Error::VideoSink(format!("failed to wait for encoder: {}", e)))?;

        if !status.success() {
            return Err(Error::VideoSink(format!(
                "encoder exited with error: {:?}",
                status.code()
            )));
        }

        Ok(std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0))
    }

    fn codec_name(&self) -> &'static str {
        self.codec.as_str()
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        // Close the pipe on every exit path so the child never outlives us
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

// =============================================================================
// Uncompressed fallback sink
// =============================================================================

// Sidecar describing the raw stream so it stays decodable later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSidecar {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pixel_format: String,
    pub frame_count: u64,
}

pub struct RawSink {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    info: StreamInfo,
    frame_count: u64,
    bytes_written: u64,
}

impl RawSink {
    pub fn create(info: StreamInfo, output_path: &Path) -> Result<RawSink> {
        let file = File::create(output_path)?;
        Ok(RawSink {
            writer: Some(BufWriter::new(file)),
            path: output_path.to_path_buf(),
            info,
            frame_count: 0,
            bytes_written: 0,
        })
    }

    fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

impl FrameSink for RawSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::VideoSink("raw sink already closed".to_string()))?;
        writer.write_all(frame)?;
        self.frame_count += 1;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let sidecar = RawSidecar {
            width: self.info.width,
            height: self.info.height,
            fps: self.info.fps,
            pixel_format: PIXEL_FORMAT.to_string(),
            frame_count: self.frame_count,
        };
        let contents = serde_json::to_string_pretty(&sidecar)
            .map_err(|e| Error::VideoSink(format!("failed to serialize sidecar: {}", e)))?;
        std::fs::write(self.sidecar_path(), contents)?;

        Ok(self.bytes_written)
    }

    fn codec_name(&self) -> &'static str {
        VideoCodec::Raw.as_str()
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            width: 4,
            height: 2,
            fps: 30,
        }
    }

    #[test]
    fn test_raw_sink_writes_frames_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.raw");

        let mut sink = RawSink::create(info(), &path).unwrap();
        let frame = vec![7u8; 4 * 2 * 4];
        sink.write_frame(&frame).unwrap();
        sink.write_frame(&frame).unwrap();
        let bytes = sink.finish().unwrap();

        assert_eq!(bytes, frame.len() as u64 * 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), bytes);

        let sidecar: RawSidecar =
            serde_json::from_str(&std::fs::read_to_string(path.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(sidecar.frame_count, 2);
        assert_eq!(sidecar.width, 4);
        assert_eq!(sidecar.pixel_format, "bgra");
    }

    #[test]
    fn test_raw_sink_finish_with_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawSink::create(info(), &dir.path().join("video.raw")).unwrap();
        assert_eq!(sink.finish().unwrap(), 0);
    }

    #[test]
    fn test_write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawSink::create(info(), &dir.path().join("video.raw")).unwrap();
        sink.finish().unwrap();
        assert!(sink.write_frame(&[0u8; 32]).is_err());
    }
}
