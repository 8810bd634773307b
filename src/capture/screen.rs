/**
 * ============================================================================
 * SCREEN FRAME SOURCE MODULE
 * ============================================================================
 *
 * PURPOSE: Abstract over screen-grab backends behind one trait
 *
 * BACKENDS:
 * - ScapSource: hardware-accelerated capture (ScreenCaptureKit / DXGI /
 *   PipeWire) via scap, preferred when supported and permitted
 * - XcapSource: generic cross-platform screenshot fallback via xcap
 *
 * All frames leave this module as tightly-packed BGRA so downstream
 * consumers are backend-agnostic. A failed grab is "no frame this tick",
 * never a pipeline error.
 *
 * ============================================================================
 */

use std::time::{Duration, Instant};

use scap::{
    capturer::{Capturer, Options, Resolution},
    frame::{Frame, FrameType},
    Target,
};

use crate::error::{Error, Result};

// Canonical pixel layout for everything downstream of this module
pub const PIXEL_FORMAT: &str = "bgra";
pub const BYTES_PER_PIXEL: usize = 4;

// A single captured frame in canonical BGRA layout
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
}

// Contract for screen-grab backends. `grab` may block up to roughly one
// frame interval but never indefinitely.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Option<CapturedFrame>;
    fn dimensions(&self) -> (u32, u32);
    fn backend_name(&self) -> &'static str;
}

// Open a frame source for the given monitor, preferring the
// hardware-accelerated backend and falling back silently to the generic one.
// The choice is logged once here; the orchestrator does not re-decide.
pub fn open_frame_source(monitor_index: u32, fps: u32) -> Result<Box<dyn FrameSource>> {
    if scap::is_supported() && scap::has_permission() {
        match ScapSource::open(monitor_index, fps) {
            Ok(source) => {
                log::info!(
                    "Using hardware-accelerated screen backend for monitor {}",
                    monitor_index
                );
                return Ok(Box::new(source));
            }
            Err(e) => {
                log::warn!("Hardware-accelerated backend unavailable: {}", e);
            }
        }
    }

    let source = XcapSource::open(monitor_index)?;
    log::info!(
        "Using generic screen backend for monitor {}",
        monitor_index
    );
    Ok(Box::new(source))
}

// =============================================================================
// Pixel normalization
// =============================================================================

// Expand 3-byte RGB pixels to BGRA
fn rgb_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0], 255]);
    }
    out
}

// Swizzle 4-byte RGBA/RGBx pixels to BGRA
fn rgbx_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        out.extend_from_slice(&[px[2], px[1], px[0], 255]);
    }
    out
}

// Drop the leading pad byte of XBGR pixels; the BGR tail is already in
// output order
fn xbgr_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        out.extend_from_slice(&[px[1], px[2], px[3], 255]);
    }
    out
}

// Force the alpha byte of BGRx data to opaque
fn bgrx_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for px in out.chunks_exact_mut(4) {
        px[3] = 255;
    }
    out
}

// Normalize a scap frame to (width, height, BGRA bytes). Unknown variants
// (e.g. planar YUV) yield None.
fn normalize_scap_frame(frame: Frame) -> Option<(u32, u32, Vec<u8>)> {
    match frame {
        Frame::BGRA(f) => Some((f.width as u32, f.height as u32, f.data)),
        Frame::BGRx(f) => Some((f.width as u32, f.height as u32, bgrx_to_bgra(&f.data))),
        Frame::BGR0(f) => Some((f.width as u32, f.height as u32, bgrx_to_bgra(&f.data))),
        Frame::RGB(f) => Some((f.width as u32, f.height as u32, rgb_to_bgra(&f.data))),
        Frame::RGBx(f) => Some((f.width as u32, f.height as u32, rgbx_to_bgra(&f.data))),
        Frame::XBGR(f) => Some((f.width as u32, f.height as u32, xbgr_to_bgra(&f.data))),
        _ => None,
    }
}

// =============================================================================
// Hardware-accelerated backend (scap)
// =============================================================================

pub struct ScapSource {
    capturer: Capturer,
    width: u32,
    height: u32,
    // Last complete frame, re-used when the backend delivers an empty buffer
    last_good: Vec<u8>,
    wrong_size_count: u64,
}

impl ScapSource {
    pub fn open(monitor_index: u32, fps: u32) -> Result<ScapSource> {
        let target = scap::get_all_targets()
            .into_iter()
            .filter(|t| matches!(t, Target::Display(_)))
            .nth(monitor_index as usize)
            .ok_or_else(|| {
                Error::ScreenCapture(format!("display {} not found", monitor_index))
            })?;

        let options = Options {
            fps,
            target: Some(target),
            show_cursor: true,
            show_highlight: false,
            excluded_targets: None,
            output_type: FrameType::BGRAFrame,
            output_resolution: Resolution::Captured,
            ..Default::default()
        };

        let mut capturer = Capturer::build(options).map_err(|e| {
            Error::ScreenCapture(format!(
                "failed to create capturer for display {}: {:?}",
                monitor_index, e
            ))
        })?;

        capturer.start_capture();

        // Dimensions are only known from the first delivered frame
        let (width, height, first) = wait_for_first_frame(&mut capturer)?;
        log::info!("Capture initialized: {}x{}", width, height);

        Ok(ScapSource {
            capturer,
            width,
            height,
            last_good: first,
            wrong_size_count: 0,
        })
    }
}

// Wait for the first frame to learn the capture dimensions
fn wait_for_first_frame(capturer: &mut Capturer) -> Result<(u32, u32, Vec<u8>)> {
    let start = Instant::now();
    let timeout = Duration::from_secs(10);

    while start.elapsed() < timeout {
        match capturer.get_next_frame() {
            Ok(frame) => {
                if let Some((width, height, data)) = normalize_scap_frame(frame) {
                    if !data.is_empty() {
                        return Ok((width, height, data));
                    }
                }
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    Err(Error::ScreenCapture(format!(
        "timeout waiting for first frame after {:.1}s; check screen recording permissions",
        timeout.as_secs_f32()
    )))
}

impl FrameSource for ScapSource {
    fn grab(&mut self) -> Option<CapturedFrame> {
        let frame = match self.capturer.get_next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Frame grab error: {:?}", e);
                return None;
            }
        };

        let (_, _, data) = normalize_scap_frame(frame)?;
        let expected = self.width as usize * self.height as usize * BYTES_PER_PIXEL;

        if data.len() == expected {
            self.last_good = data;
        } else if data.is_empty() {
            // Backend signals "unchanged screen" with an empty buffer
        } else {
            self.wrong_size_count += 1;
            if self.wrong_size_count <= 3 {
                log::warn!(
                    "Wrong frame size: expected {} bytes, got {}",
                    expected,
                    data.len()
                );
            }
            return None;
        }

        Some(CapturedFrame {
            data: self.last_good.clone(),
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn backend_name(&self) -> &'static str {
        "scap"
    }
}

// =============================================================================
// Generic fallback backend (xcap)
// =============================================================================

pub struct XcapSource {
    monitor: xcap::Monitor,
    width: u32,
    height: u32,
}

impl XcapSource {
    pub fn open(monitor_index: u32) -> Result<XcapSource> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| Error::ScreenCapture(format!("failed to enumerate monitors: {}", e)))?;

        let monitor = monitors
            .into_iter()
            .nth(monitor_index as usize)
            .ok_or_else(|| {
                Error::ScreenCapture(format!("display {} not found", monitor_index))
            })?;

        let width = monitor.width();
        let height = monitor.height();

        Ok(XcapSource {
            monitor,
            width,
            height,
        })
    }
}

impl FrameSource for XcapSource {
    fn grab(&mut self) -> Option<CapturedFrame> {
        let image = match self.monitor.capture_image() {
            Ok(image) => image,
            Err(e) => {
                log::debug!("Frame grab error: {}", e);
                return None;
            }
        };

        if image.width() != self.width || image.height() != self.height {
            // Resolution changed mid-session; skip this tick
            return None;
        }

        Some(CapturedFrame {
            data: rgbx_to_bgra(&image.into_raw()),
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn backend_name(&self) -> &'static str {
        "xcap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_bgra() {
        // One red pixel, one blue pixel
        let rgb = [255u8, 0, 0, 0, 0, 255];
        assert_eq!(
            rgb_to_bgra(&rgb),
            vec![0, 0, 255, 255, 255, 0, 0, 255]
        );
    }

    #[test]
    fn test_rgbx_to_bgra() {
        let rgbx = [10u8, 20, 30, 0];
        assert_eq!(rgbx_to_bgra(&rgbx), vec![30, 20, 10, 255]);
    }

    #[test]
    fn test_xbgr_to_bgra() {
        // One pure-red pixel: bytes are [pad, B, G, R]
        let xbgr = [0u8, 0, 0, 255];
        assert_eq!(xbgr_to_bgra(&xbgr), vec![0, 0, 255, 255]);

        let xbgr = [9u8, 30, 20, 10];
        assert_eq!(xbgr_to_bgra(&xbgr), vec![30, 20, 10, 255]);
    }

    #[test]
    fn test_bgrx_forces_opaque_alpha() {
        let bgrx = [1u8, 2, 3, 0, 4, 5, 6, 9];
        assert_eq!(bgrx_to_bgra(&bgrx), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }
}
