/**
 * ============================================================================
 * SESSION ORCHESTRATOR MODULE
 * ============================================================================
 *
 * PURPOSE: Lifecycle of one recording session across all capture components
 *
 * START ORDER: session row -> video pipeline (critical) -> audio recorders
 * (best-effort) -> input recorder (critical) -> health sampler. A critical
 * start failure tears down everything already running and marks the session
 * failed with the error in its notes.
 *
 * STOP ORDER is the reverse. The input snapshot and frame timings are
 * persisted in bounded batches, then the session row is finalized. Files
 * already flushed to the session directory are preserved even if the final
 * batch insert fails.
 *
 * ============================================================================
 */

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};

use crate::capture::audio::{AudioRecorder, AudioStreamKind};
use crate::capture::input::{EventTap, InputRecorder};
use crate::capture::join_timeout;
use crate::capture::screen::{open_frame_source, FrameSource};
use crate::capture::sink::{open_sink, FrameSink, StreamInfo};
use crate::capture::video::{PipelineCounters, VideoPipeline};
use crate::config::RecorderConfig;
use crate::error::{Error, Result};
use crate::store::{EventStore, SessionCompletion};
use crate::types::{HealthSample, SessionInfo, StopSummary};

// Input events are persisted in chunks of this size
const EVENT_BATCH_SIZE: usize = 1_000;

const HEALTH_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

// Factories for the video endpoints, overridable for tooling and tests
pub type SourceFactory = Box<dyn Fn(&RecorderConfig) -> Result<Box<dyn FrameSource>> + Send>;
pub type SinkFactory =
    Box<dyn Fn(&RecorderConfig, StreamInfo, &Path) -> Result<Box<dyn FrameSink>> + Send>;

struct ActiveSession {
    session_id: i64,
    game_name: String,
    start_time: DateTime<Utc>,
    session_dir: PathBuf,
    video: VideoPipeline,
    system_audio: Option<AudioRecorder>,
    microphone: Option<AudioRecorder>,
    input: InputRecorder,
    health: Option<HealthSampler>,
}

pub struct SessionOrchestrator {
    store: Arc<EventStore>,
    config: RecorderConfig,
    source_factory: SourceFactory,
    sink_factory: SinkFactory,
    active: Option<ActiveSession>,
    attach_input_sources: bool,
}

impl SessionOrchestrator {
    pub fn new(store: Arc<EventStore>, config: RecorderConfig) -> SessionOrchestrator {
        Self::with_factories(
            store,
            config,
            Box::new(|config| open_frame_source(config.monitor_index, config.fps)),
            Box::new(|config, info, dir| {
                open_sink(config.codec, config.crf, &config.preset, info, dir)
            }),
        )
    }

    // Construct with custom video endpoints instead of the live screen and
    // encoder backends
    pub fn with_factories(
        store: Arc<EventStore>,
        config: RecorderConfig,
        source_factory: SourceFactory,
        sink_factory: SinkFactory,
    ) -> SessionOrchestrator {
        SessionOrchestrator {
            store,
            config,
            source_factory,
            sink_factory,
            active: None,
            attach_input_sources: true,
        }
    }

    #[cfg(test)]
    fn without_os_input_sources(mut self) -> SessionOrchestrator {
        self.attach_input_sources = false;
        self
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    // Tap for injecting synthetic input events into the running session
    pub fn input_tap(&self) -> Option<EventTap> {
        self.active.as_ref().and_then(|active| active.input.tap())
    }

    pub fn get_session_info(&self) -> Option<SessionInfo> {
        self.active.as_ref().map(|active| SessionInfo {
            session_id: active.session_id,
            game_name: active.game_name.clone(),
            is_recording: true,
            start_time: active.start_time,
            session_path: active.session_dir.display().to_string(),
        })
    }

    // Start a new recording session, returning its id.
    pub fn start_recording(&mut self) -> Result<i64> {
        if self.active.is_some() {
            return Err(Error::AlreadyRecording);
        }
        self.config.validate()?;

        let session_dir = self.allocate_session_dir()?;
        let session_id = self.store.create_session(
            &self.config.game_name,
            self.config.input_type,
            self.config.fps,
            self.config.latency_offset_ms,
            self.config.monitor_index,
        )?;
        log::info!(
            "Starting session {} in {:?}",
            session_id,
            session_dir
        );

        // Shared monotonic origin for every timestamp in this session
        let start_instant = Instant::now();
        let start_time = Utc::now();

        // Video is session-critical
        let video = match self.start_video(start_instant, &session_dir) {
            Ok(video) => video,
            Err(e) => {
                self.abort_start(session_id, &e);
                return Err(e);
            }
        };

        // Audio is best-effort; a stream that cannot start is skipped
        let system_audio = self.start_audio(AudioStreamKind::SystemLoopback, &session_dir);
        let microphone = self.start_audio(AudioStreamKind::Microphone, &session_dir);

        // Input is session-critical
        let mut input = InputRecorder::new(
            self.config.input_type,
            self.config.capture_pointer,
            self.config.latency_offset_ms,
        );
        if let Err(e) = input.arm(start_instant, self.attach_input_sources) {
            drop(system_audio);
            drop(microphone);
            video.stop();
            self.abort_start(session_id, &e);
            return Err(e);
        }

        let health = if self.config.health_interval_secs > 0 {
            Some(HealthSampler::start(
                self.store.clone(),
                session_id,
                video.counters(),
                session_dir.clone(),
                Duration::from_secs(self.config.health_interval_secs),
            ))
        } else {
            None
        };

        self.active = Some(ActiveSession {
            session_id,
            game_name: self.config.game_name.clone(),
            start_time,
            session_dir,
            video,
            system_audio,
            microphone,
            input,
            health,
        });
        Ok(session_id)
    }

    // Stop the active session, persist its data, and finalize the row.
    pub fn stop_recording(&mut self) -> Result<StopSummary> {
        let mut active = self.active.take().ok_or(Error::NotRecording)?;
        log::info!("Stopping session {}", active.session_id);

        if let Some(mut health) = active.health.take() {
            health.stop();
        }

        let events = active.input.stop();

        let system_audio_path = active.system_audio.take().map(|mut recorder| {
            let path = recorder.output_path().display().to_string();
            recorder.stop();
            path
        });
        let microphone_audio_path = active.microphone.take().map(|mut recorder| {
            let path = recorder.output_path().display().to_string();
            recorder.stop();
            path
        });

        let stats = active.video.stop();

        // Media files are on disk at this point; persistence failures below
        // propagate but leave the directory intact for manual recovery
        self.store
            .add_frame_timings_batch(active.session_id, &stats.timings)?;

        let mut event_count = 0usize;
        for chunk in events.chunks(EVENT_BATCH_SIZE) {
            event_count += self.store.add_events_batch(active.session_id, chunk)?;
        }

        self.store.complete_session(
            active.session_id,
            &SessionCompletion {
                end_time: Some(Utc::now()),
                video_path: Some(stats.output_path.display().to_string()),
                system_audio_path,
                microphone_audio_path,
                notes: None,
                video_width: Some(stats.width),
                video_height: Some(stats.height),
                video_codec: Some(stats.codec.clone()),
                total_frames: Some(stats.frames_written),
                file_size_bytes: Some(stats.bytes_written),
            },
        )?;

        let duration_seconds = self
            .store
            .get_session(active.session_id)?
            .and_then(|record| record.duration_seconds)
            .unwrap_or(0);

        log::info!(
            "Session {} completed: {}s, {} events, {} frames",
            active.session_id,
            duration_seconds,
            event_count,
            stats.frames_written
        );

        Ok(StopSummary {
            session_id: active.session_id,
            duration_seconds,
            event_count,
        })
    }

    fn allocate_session_dir(&self) -> Result<PathBuf> {
        let dir = self.config.sessions_dir.join(format!(
            "{}_{}",
            self.config.game_slug(),
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::create_dir_all(&dir).map_err(|_| Error::SessionDirectory(dir.clone()))?;
        Ok(dir)
    }

    fn start_video(&self, start_instant: Instant, session_dir: &Path) -> Result<VideoPipeline> {
        let source = (self.source_factory)(&self.config)?;
        let (width, height) = source.dimensions();
        let sink = (self.sink_factory)(
            &self.config,
            StreamInfo {
                width,
                height,
                fps: self.config.fps,
            },
            session_dir,
        )?;
        VideoPipeline::start(source, sink, self.config.fps, start_instant)
    }

    fn start_audio(&self, kind: AudioStreamKind, session_dir: &Path) -> Option<AudioRecorder> {
        let (enabled, file_name) = match kind {
            AudioStreamKind::SystemLoopback => {
                (self.config.capture_system_audio, "system_audio.wav")
            }
            AudioStreamKind::Microphone => (self.config.capture_microphone, "microphone_audio.wav"),
        };
        if !enabled {
            return None;
        }

        match AudioRecorder::start(
            kind,
            self.config.sample_rate,
            self.config.channels,
            &session_dir.join(file_name),
        ) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                log::warn!("Audio stream unavailable, continuing without it: {}", e);
                None
            }
        }
    }

    fn abort_start(&self, session_id: i64, error: &Error) {
        if let Err(e) = self
            .store
            .mark_session_failed(session_id, &error.to_string())
        {
            log::error!("Failed to record session {} failure: {}", session_id, e);
        }
    }
}

// =============================================================================
// Health sampler
// =============================================================================

// Periodic resource snapshots written to the store while a session records
struct HealthSampler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthSampler {
    fn start(
        store: Arc<EventStore>,
        session_id: i64,
        counters: Arc<PipelineCounters>,
        session_dir: PathBuf,
        interval: Duration,
    ) -> HealthSampler {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("health-sampler".to_string())
                .spawn(move || {
                    sample_loop(store, session_id, counters, session_dir, interval, shutdown);
                })
                .ok()
        };
        if handle.is_none() {
            log::warn!("Health sampler could not be spawned, continuing without it");
        }
        HealthSampler { shutdown, handle }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            join_timeout(handle, HEALTH_JOIN_TIMEOUT, "health-sampler");
        }
    }
}

fn sample_loop(
    store: Arc<EventStore>,
    session_id: i64,
    counters: Arc<PipelineCounters>,
    session_dir: PathBuf,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut system = sysinfo::System::new();

    loop {
        // Sleep in short slices so stop stays responsive
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        system.refresh_cpu();
        system.refresh_memory();

        let sample = HealthSample {
            check_time: Utc::now(),
            disk_space_gb: available_disk_gb(&session_dir),
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_mb: system.used_memory() as f64 / (1024.0 * 1024.0),
            frames_captured: counters.frames_captured.load(Ordering::SeqCst),
            frames_dropped: counters.frames_dropped.load(Ordering::SeqCst),
        };

        // A failed sample is log-only; sampling must never disturb recording
        if let Err(e) = store.add_health_sample(session_id, &sample) {
            log::warn!("Failed to persist health sample: {}", e);
        }
    }
}

// Free space on the filesystem holding the session directory, matched by
// the longest mount-point prefix
fn available_disk_gb(session_dir: &Path) -> f64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| session_dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() as f64 / 1_000_000_000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testutil::{CountingSource, RecordingSink};
    use crate::config::VideoCodec;
    use crate::types::{ActionKind, SessionStatus};

    fn test_config(dir: &Path) -> RecorderConfig {
        RecorderConfig {
            game_name: "Test Game".to_string(),
            sessions_dir: dir.to_path_buf(),
            codec: VideoCodec::Raw,
            capture_system_audio: false,
            capture_microphone: false,
            health_interval_secs: 0,
            ..RecorderConfig::default()
        }
    }

    fn fake_orchestrator(store: Arc<EventStore>, config: RecorderConfig) -> SessionOrchestrator {
        SessionOrchestrator::with_factories(
            store,
            config,
            Box::new(|_| Ok(Box::new(CountingSource::new(8, 8)))),
            Box::new(|_, _, _| Ok(Box::new(RecordingSink::new()))),
        )
        .without_os_input_sources()
    }

    #[test]
    fn test_full_session_cycle_with_injected_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut orchestrator = fake_orchestrator(store.clone(), test_config(dir.path()));

        let session_id = orchestrator.start_recording().unwrap();
        assert!(orchestrator.is_recording());

        let info = orchestrator.get_session_info().unwrap();
        assert_eq!(info.session_id, session_id);
        assert!(info.is_recording);
        assert_eq!(info.game_name, "Test Game");

        let tap = orchestrator.input_tap().unwrap();
        tap.key_press("KeyW");
        std::thread::sleep(Duration::from_millis(50));
        tap.key_release("KeyW");
        std::thread::sleep(Duration::from_millis(150));

        let summary = orchestrator.stop_recording().unwrap();
        assert_eq!(summary.session_id, session_id);
        assert_eq!(summary.event_count, 2);
        assert!(!orchestrator.is_recording());

        let record = store.get_session(session_id).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert!(record.end_time.unwrap() >= record.start_time);
        assert!(record.total_frames.unwrap() > 0);
        assert_eq!(record.video_width, Some(8));
        assert_eq!(record.video_height, Some(8));

        // Press and release share one action code, ~50ms apart
        let events = store.get_input_events(session_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.action, ActionKind::Press);
        assert_eq!(events[1].event.action, ActionKind::Release);
        assert_eq!(events[0].action_code_id, events[1].action_code_id);
        let delta = events[1].event.timestamp_ms - events[0].event.timestamp_ms;
        assert!((40..=120).contains(&delta), "delta was {} ms", delta);

        // Frame timings were persisted alongside the events
        let timings = store.get_frame_timings(session_id).unwrap();
        assert_eq!(timings.len() as u64, record.total_frames.unwrap());
        assert!(timings.iter().all(|t| !t.dropped));
    }

    #[test]
    fn test_failing_sink_marks_session_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut orchestrator = SessionOrchestrator::with_factories(
            store.clone(),
            test_config(dir.path()),
            Box::new(|_| Ok(Box::new(CountingSource::new(8, 8)))),
            Box::new(|_, _, _| Err(Error::VideoSink("sink always fails".to_string()))),
        )
        .without_os_input_sources();

        let result = orchestrator.start_recording();
        assert!(result.is_err());
        assert!(!orchestrator.is_recording());
        assert!(orchestrator.input_tap().is_none());

        let sessions = store.get_all_sessions(None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);
        assert!(sessions[0]
            .notes
            .as_deref()
            .unwrap()
            .contains("sink always fails"));
    }

    #[test]
    fn test_double_start_and_stop_without_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut orchestrator = fake_orchestrator(store, test_config(dir.path()));

        assert!(matches!(
            orchestrator.stop_recording(),
            Err(Error::NotRecording)
        ));

        orchestrator.start_recording().unwrap();
        assert!(matches!(
            orchestrator.start_recording(),
            Err(Error::AlreadyRecording)
        ));
        orchestrator.stop_recording().unwrap();
    }

    #[test]
    fn test_session_dir_uses_game_slug() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut orchestrator = fake_orchestrator(store, test_config(dir.path()));

        orchestrator.start_recording().unwrap();
        let info = orchestrator.get_session_info().unwrap();
        assert!(info.session_path.contains("Test_Game_"));
        orchestrator.stop_recording().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected_before_any_session_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut config = test_config(dir.path());
        config.fps = 0;
        let mut orchestrator = fake_orchestrator(store.clone(), config);

        assert!(orchestrator.start_recording().is_err());
        assert!(store.get_all_sessions(None).unwrap().is_empty());
    }
}
