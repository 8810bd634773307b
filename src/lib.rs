/**
 * ============================================================================
 * GAMETRACE - SYNCHRONIZED CAPTURE ENGINE
 * ============================================================================
 *
 * PURPOSE: Record screen video, audio and input events against one shared
 * monotonic clock and persist them as an ML-ready session dataset
 *
 * ARCHITECTURE:
 * - capture:  concurrent pipelines (screen frames, encoder sinks, audio
 *             streams, input hooks and gamepad polling)
 * - store:    SQLite persistence (sessions, input events, action codes,
 *             frame timings, health samples)
 * - session:  orchestrator tying the pipelines and the store together
 * - config:   per-session recorder settings with validation
 *
 * Front ends drive recording through SessionOrchestrator and query data
 * through EventStore.
 *
 * ============================================================================
 */

pub mod capture;
pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod types;

pub use config::{RecorderConfig, VideoCodec};
pub use error::{Error, Result};
pub use session::SessionOrchestrator;
pub use store::{EventStore, SessionCompletion};
pub use types::{
    ActionCode, ActionKind, DeviceClass, FrameTiming, HealthSample, RawInputEvent, SessionInfo,
    SessionRecord, SessionStatus, StopSummary, StoreStatistics, StoredInputEvent,
};
