/**
 * ============================================================================
 * VIDEO PIPELINE MODULE
 * ============================================================================
 *
 * PURPOSE: Paced frame acquisition and ordered sink writing
 *
 * PIPELINE:
 * - Capture thread: paces grabs to the target rate, stamps each frame with
 *   the monotonic session clock and enqueues into a bounded queue. A full
 *   queue drops the frame and counts it; capture cadence is never blocked
 *   by the writer.
 * - Writer thread: drains the queue in order into a FrameSink, recording a
 *   FrameTiming row per written frame. Dropped frames get synthetic rows
 *   via a side channel so the audit trail stays complete.
 *
 * Lifecycle is typestate-shaped: `start` returns a running pipeline,
 * `stop` consumes it and returns aggregate stats. Joins are bounded; a
 * thread that refuses to exit is abandoned and logged rather than hanging
 * the stop call.
 *
 * ============================================================================
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::capture::screen::{CapturedFrame, FrameSource};
use crate::capture::sink::FrameSink;
use crate::capture::{elapsed_ms, join_timeout};
use crate::error::Result;
use crate::types::FrameTiming;

// Queue capacity in seconds of frames at the target rate
const QUEUE_SECONDS: u32 = 2;

const CAPTURE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const WRITER_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

// Live counters shared with the health sampler
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
}

// Aggregate result of one pipeline run
#[derive(Debug)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub bytes_written: u64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub output_path: std::path::PathBuf,
    // Per-frame audit rows, ordered by frame number
    pub timings: Vec<FrameTiming>,
}

struct QueuedFrame {
    frame: CapturedFrame,
    frame_number: u64,
    capture_timestamp_ms: i64,
}

struct WriterOutcome {
    frames_written: u64,
    bytes_written: u64,
    timings: Vec<FrameTiming>,
}

// A running video pipeline
pub struct VideoPipeline {
    shutdown: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    capture_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<WriterOutcome>>,
    width: u32,
    height: u32,
    codec: String,
    output_path: std::path::PathBuf,
}

impl VideoPipeline {
    // Spawn the capture and writer threads. `session_start` is the shared
    // monotonic origin for all timestamps in this session.
    pub fn start(
        mut source: Box<dyn FrameSource>,
        mut sink: Box<dyn FrameSink>,
        target_fps: u32,
        session_start: Instant,
    ) -> Result<VideoPipeline> {
        let (width, height) = source.dimensions();
        let codec = sink.codec_name().to_string();
        let output_path = sink.output_path().to_path_buf();

        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(PipelineCounters::default());

        let capacity = (target_fps * QUEUE_SECONDS).max(1) as usize;
        let (frame_tx, frame_rx) = bounded::<QueuedFrame>(capacity);
        // Dropped-frame notices bypass the bounded queue so the audit trail
        // survives exactly the condition that caused the drop
        let (drop_tx, drop_rx) = unbounded::<FrameTiming>();

        let capture_handle = {
            let shutdown = shutdown.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("video-capture".to_string())
                .spawn(move || {
                    capture_loop(
                        source.as_mut(),
                        frame_tx,
                        drop_tx,
                        target_fps,
                        session_start,
                        shutdown,
                        counters,
                    );
                })?
        };

        let writer_handle = std::thread::Builder::new()
            .name("video-writer".to_string())
            .spawn(move || write_loop(sink.as_mut(), frame_rx, drop_rx, session_start))?;

        log::info!(
            "Video pipeline started: {}x{} @ {} fps, codec {}, queue {} frames",
            width,
            height,
            target_fps,
            codec,
            capacity
        );

        Ok(VideoPipeline {
            shutdown,
            counters,
            capture_handle: Some(capture_handle),
            writer_handle: Some(writer_handle),
            width,
            height,
            codec,
            output_path,
        })
    }

    // Counter handle for the health sampler
    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    // Signal both threads to exit, join with bounded timeouts, and collect
    // aggregate stats. The writer drains whatever is still queued before
    // closing the sink.
    pub fn stop(mut self) -> PipelineStats {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.capture_handle.take() {
            join_timeout(handle, CAPTURE_JOIN_TIMEOUT, "video-capture");
        }

        let outcome = self
            .writer_handle
            .take()
            .and_then(|handle| join_timeout(handle, WRITER_JOIN_TIMEOUT, "video-writer"));

        let frames_captured = self.counters.frames_captured.load(Ordering::SeqCst);
        let frames_dropped = self.counters.frames_dropped.load(Ordering::SeqCst);

        let (frames_written, bytes_written, mut timings) = match outcome {
            Some(outcome) => (
                outcome.frames_written,
                outcome.bytes_written,
                outcome.timings,
            ),
            None => (0, 0, Vec::new()),
        };
        timings.sort_by_key(|t| t.frame_number);

        log::info!(
            "Video pipeline stopped: {} captured, {} written, {} dropped, {} bytes",
            frames_captured,
            frames_written,
            frames_dropped,
            bytes_written
        );

        PipelineStats {
            frames_captured,
            frames_written,
            frames_dropped,
            bytes_written,
            width: self.width,
            height: self.height,
            codec: self.codec,
            output_path: self.output_path,
            timings,
        }
    }
}

// Paced acquisition loop. Sleeps the remainder of each frame period rather
// than spinning; drops (and counts) when the queue is full.
fn capture_loop(
    source: &mut dyn FrameSource,
    frame_tx: Sender<QueuedFrame>,
    drop_tx: Sender<FrameTiming>,
    target_fps: u32,
    session_start: Instant,
    shutdown: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
) {
    let period = Duration::from_secs_f64(1.0 / f64::from(target_fps.max(1)));
    // Back-date the first tick so a frame is captured immediately
    let mut last_capture = Instant::now().checked_sub(period).unwrap_or_else(Instant::now);
    let mut frame_number: u64 = 0;

    while !shutdown.load(Ordering::SeqCst) {
        let elapsed = last_capture.elapsed();
        if elapsed < period {
            std::thread::sleep((period - elapsed).max(Duration::from_millis(1)));
            continue;
        }
        last_capture = Instant::now();

        // A failed grab is "no frame this tick"; retry on the next cycle
        let Some(frame) = source.grab() else {
            continue;
        };

        let capture_timestamp_ms = elapsed_ms(session_start);
        let queued = QueuedFrame {
            frame,
            frame_number,
            capture_timestamp_ms,
        };
        frame_number += 1;
        counters.frames_captured.fetch_add(1, Ordering::SeqCst);

        match frame_tx.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => {
                counters.frames_dropped.fetch_add(1, Ordering::SeqCst);
                let _ = drop_tx.send(FrameTiming {
                    frame_number: queued.frame_number,
                    capture_timestamp_ms: queued.capture_timestamp_ms,
                    write_timestamp_ms: None,
                    dropped: true,
                });
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("Frame queue disconnected, stopping capture");
                break;
            }
        }
    }

    log::info!("Video capture stopped after {} frames", frame_number);
}

// Ordered writer loop. Exits once the capture side hangs up and the queue
// is drained, then closes the sink.
fn write_loop(
    sink: &mut dyn FrameSink,
    frame_rx: Receiver<QueuedFrame>,
    drop_rx: Receiver<FrameTiming>,
    session_start: Instant,
) -> WriterOutcome {
    let mut frames_written: u64 = 0;
    let mut timings: Vec<FrameTiming> = Vec::new();

    loop {
        match frame_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(queued) => {
                if let Err(e) = sink.write_frame(&queued.frame.data) {
                    log::error!("Failed to write frame to sink: {}", e);
                    break;
                }
                frames_written += 1;
                timings.push(FrameTiming {
                    frame_number: queued.frame_number,
                    capture_timestamp_ms: queued.capture_timestamp_ms,
                    write_timestamp_ms: Some(elapsed_ms(session_start)),
                    dropped: false,
                });
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        while let Ok(timing) = drop_rx.try_recv() {
            timings.push(timing);
        }
    }

    // Collect any drop notices that raced with the final frames
    while let Ok(timing) = drop_rx.try_recv() {
        timings.push(timing);
    }

    let bytes_written = match sink.finish() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to finalize video sink: {}", e);
            0
        }
    };

    log::info!("Video writer stopped after {} frames", frames_written);

    WriterOutcome {
        frames_written,
        bytes_written,
        timings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sink::StreamInfo;
    use crate::capture::testutil::{CountingSource, GatedSink, RecordingSink};
    use crate::capture::sink::RawSink;

    #[test]
    fn test_pipeline_writes_frames_in_order() {
        let source = CountingSource::new(8, 8);
        let sink = RecordingSink::new();
        let written = sink.written();

        let pipeline = VideoPipeline::start(
            Box::new(source),
            Box::new(sink),
            120,
            Instant::now(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let stats = pipeline.stop();

        assert!(stats.frames_written > 0);
        let sequence = written.lock().clone();
        assert_eq!(sequence.len() as u64, stats.frames_written);
        // Strictly increasing frame numbers: in order, nothing written twice
        for pair in sequence.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_backpressure_drops_are_counted_exactly() {
        let source = CountingSource::new(4, 4);
        let sink = GatedSink::new();
        let gate = sink.gate();
        let written = sink.written();

        let pipeline = VideoPipeline::start(
            Box::new(source),
            Box::new(sink),
            100,
            Instant::now(),
        )
        .unwrap();

        // Writer blocked: the queue fills, then every further frame drops
        std::thread::sleep(Duration::from_millis(600));
        gate.store(false, Ordering::SeqCst);
        let stats = pipeline.stop();

        assert!(stats.frames_dropped > 0, "expected overflow drops");
        // Exact accounting: every captured frame was either written or dropped
        assert_eq!(
            stats.frames_captured,
            stats.frames_written + stats.frames_dropped
        );

        // No frame was written twice
        let sequence = written.lock().clone();
        for pair in sequence.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_timing_rows_cover_written_and_dropped_frames() {
        let source = CountingSource::new(4, 4);
        let sink = GatedSink::new();
        let gate = sink.gate();

        let pipeline = VideoPipeline::start(
            Box::new(source),
            Box::new(sink),
            100,
            Instant::now(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(500));
        gate.store(false, Ordering::SeqCst);
        let stats = pipeline.stop();

        assert_eq!(
            stats.timings.len() as u64,
            stats.frames_written + stats.frames_dropped
        );
        for timing in &stats.timings {
            if timing.dropped {
                assert!(timing.write_timestamp_ms.is_none());
            } else {
                let write_ms = timing.write_timestamp_ms.expect("written frame has write ts");
                assert!(write_ms >= timing.capture_timestamp_ms);
            }
        }
        // Rows come back ordered by frame number
        for pair in stats.timings.windows(2) {
            assert!(pair[1].frame_number > pair[0].frame_number);
        }
    }

    #[test]
    fn test_stop_with_raw_sink_flushes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let source = CountingSource::new(2, 2);
        let sink = RawSink::create(
            StreamInfo {
                width: 2,
                height: 2,
                fps: 60,
            },
            &dir.path().join("video.raw"),
        )
        .unwrap();

        let pipeline =
            VideoPipeline::start(Box::new(source), Box::new(sink), 60, Instant::now()).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let stats = pipeline.stop();

        assert!(stats.bytes_written > 0);
        assert_eq!(
            std::fs::metadata(dir.path().join("video.raw")).unwrap().len(),
            stats.bytes_written
        );
    }
}
