/**
 * ============================================================================
 * CAPTURE MODULE
 * ============================================================================
 *
 * PURPOSE: Concurrent capture pipelines for one recording session
 *
 * SUBMODULES:
 * - screen: frame-source backends (hardware-accelerated + generic fallback)
 * - sink:   encoder-process and uncompressed frame sinks
 * - video:  paced capture thread + queued writer thread
 * - audio:  independent system-loopback and microphone recorders
 * - input:  OS hook and gamepad-poll event recorders
 *
 * ============================================================================
 */

pub mod audio;
pub mod input;
pub mod screen;
pub mod sink;
pub mod video;

#[cfg(test)]
pub(crate) mod testutil;

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// Milliseconds elapsed since the shared monotonic session origin
pub(crate) fn elapsed_ms(origin: Instant) -> i64 {
    Instant::now().duration_since(origin).as_millis() as i64
}

// Join a worker thread with a bounded wait. A thread that does not exit in
// time is abandoned (its resources leak intentionally) so stop calls can
// never hang; the condition is logged.
pub(crate) fn join_timeout<T>(
    handle: JoinHandle<T>,
    timeout: Duration,
    name: &str,
) -> Option<T> {
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!(
                "{} thread did not exit within {:?}, abandoning it",
                name,
                timeout
            );
            return None;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("{} thread panicked", name);
            None
        }
    }
}
