/**
 * ============================================================================
 * ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: Crate-wide error taxonomy for the capture engine
 *
 * Failure classes (see individual components for policy):
 * - Device-unavailable and transient I/O errors are handled locally and
 *   never surface through this type; they degrade or retry.
 * - Critical start failures and persistence failures propagate as `Error`.
 *
 * ============================================================================
 */

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("screen capture error: {0}")]
    ScreenCapture(String),

    #[error("video sink error: {0}")]
    VideoSink(String),

    #[error("input capture error: {0}")]
    InputCapture(String),

    #[error("recording already in progress")]
    AlreadyRecording,

    #[error("no recording in progress")]
    NotRecording,

    #[error("session directory could not be created: {0:?}")]
    SessionDirectory(PathBuf),
}
