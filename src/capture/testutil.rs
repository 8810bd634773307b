// Shared fakes for pipeline unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::screen::{CapturedFrame, FrameSource, BYTES_PER_PIXEL};
use crate::capture::sink::FrameSink;
use crate::error::Result;

// Frame source producing frames whose first 8 bytes encode a counter.
pub struct CountingSource {
    width: u32,
    height: u32,
    next: u64,
}

impl CountingSource {
    pub fn new(width: u32, height: u32) -> CountingSource {
        CountingSource {
            width,
            height,
            next: 0,
        }
    }
}

impl FrameSource for CountingSource {
    fn grab(&mut self) -> Option<CapturedFrame> {
        let mut data = vec![0u8; self.width as usize * self.height as usize * BYTES_PER_PIXEL];
        data[..8].copy_from_slice(&self.next.to_le_bytes());
        self.next += 1;
        Some(CapturedFrame { data })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}

fn frame_counter(frame: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&frame[..8]);
    u64::from_le_bytes(bytes)
}

// Sink that records the counter of every written frame.
pub struct RecordingSink {
    written: Arc<Mutex<Vec<u64>>>,
    bytes: u64,
    path: PathBuf,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink {
            written: Arc::new(Mutex::new(Vec::new())),
            bytes: 0,
            path: PathBuf::from("recording-sink"),
        }
    }

    pub fn written(&self) -> Arc<Mutex<Vec<u64>>> {
        self.written.clone()
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.written.lock().push(frame_counter(frame));
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        Ok(self.bytes)
    }

    fn codec_name(&self) -> &'static str {
        "test"
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}

// Sink whose writes block while the gate flag is set, forcing the frame
// queue to overflow.
pub struct GatedSink {
    gate: Arc<AtomicBool>,
    written: Arc<Mutex<Vec<u64>>>,
    bytes: u64,
    path: PathBuf,
}

impl GatedSink {
    pub fn new() -> GatedSink {
        GatedSink {
            gate: Arc::new(AtomicBool::new(true)),
            written: Arc::new(Mutex::new(Vec::new())),
            bytes: 0,
            path: PathBuf::from("gated-sink"),
        }
    }

    pub fn gate(&self) -> Arc<AtomicBool> {
        self.gate.clone()
    }

    pub fn written(&self) -> Arc<Mutex<Vec<u64>>> {
        self.written.clone()
    }
}

impl FrameSink for GatedSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        // Escape hatch after 30s so a broken test cannot deadlock
        for _ in 0..6000 {
            if !self.gate.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.written.lock().push(frame_counter(frame));
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        Ok(self.bytes)
    }

    fn codec_name(&self) -> &'static str {
        "test"
    }

    fn output_path(&self) -> &Path {
        &self.path
    }
}
