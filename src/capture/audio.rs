/**
 * ============================================================================
 * AUDIO RECORDER MODULE
 * ============================================================================
 *
 * PURPOSE: Independent duplex recorders for system loopback and microphone
 *
 * Each recorder owns one real-time input stream whose device callback
 * appends samples to a WAV sink. The stream handle is not Send, so each
 * recorder runs it on a dedicated thread and controls it with a shutdown
 * flag. Audio is best-effort: a recorder that cannot start disables only
 * its own stream, never the session.
 *
 * ============================================================================
 */

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use crate::capture::join_timeout;
use crate::error::{Error, Result};

const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type WavSink = Arc<Mutex<Option<hound::WavWriter<BufWriter<File>>>>>;

// Which physical stream this recorder captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStreamKind {
    SystemLoopback,
    Microphone,
}

impl AudioStreamKind {
    fn label(&self) -> &'static str {
        match self {
            AudioStreamKind::SystemLoopback => "system audio",
            AudioStreamKind::Microphone => "microphone",
        }
    }
}

// A running audio recorder bound to one device stream
pub struct AudioRecorder {
    kind: AudioStreamKind,
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioRecorder {
    // Open the device, start streaming samples to `sink_path`, and return
    // once the stream is confirmed live. `sample_rate`/`channels` are the
    // requested format; if the device cannot honor it, its native format is
    // used and logged (the WAV header always matches what is written).
    pub fn start(
        kind: AudioStreamKind,
        sample_rate: u32,
        channels: u16,
        sink_path: &Path,
    ) -> Result<AudioRecorder> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let handle = {
            let shutdown = shutdown.clone();
            let path = sink_path.to_path_buf();
            std::thread::Builder::new()
                .name(format!("audio-{}", kind.label().replace(' ', "-")))
                .spawn(move || {
                    stream_thread(kind, sample_rate, channels, path, shutdown, init_tx);
                })?
        };

        match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => Ok(AudioRecorder {
                kind,
                path: sink_path.to_path_buf(),
                shutdown,
                handle: Some(handle),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Config(format!(
                "{} stream did not initialize within {:?}",
                kind.label(),
                INIT_TIMEOUT
            ))),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.path
    }

    // Halt the stream and finalize the WAV file
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            join_timeout(handle, STREAM_JOIN_TIMEOUT, self.kind.label());
        }
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

// Thread owning the cpal stream for its whole lifetime
fn stream_thread(
    kind: AudioStreamKind,
    requested_rate: u32,
    requested_channels: u16,
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    init_tx: crossbeam_channel::Sender<Result<()>>,
) {
    let setup = (|| -> Result<(cpal::Stream, WavSink)> {
        let host = cpal::default_host();

        let device = match kind {
            AudioStreamKind::Microphone => host.default_input_device().ok_or_else(|| {
                Error::Config("no default input device available".to_string())
            })?,
            AudioStreamKind::SystemLoopback => find_loopback_device(&host).ok_or_else(|| {
                Error::Config("no loopback-capable device found".to_string())
            })?,
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| Error::Config(format!("no input config for {}: {}", device_name, e)))?;

        let native_rate = supported.sample_rate().0;
        let native_channels = supported.channels();
        if native_rate != requested_rate || native_channels != requested_channels {
            log::warn!(
                "{}: device {} uses {} Hz / {} ch (requested {} Hz / {} ch)",
                kind.label(),
                device_name,
                native_rate,
                native_channels,
                requested_rate,
                requested_channels
            );
        }

        let spec = hound::WavSpec {
            channels: native_channels,
            sample_rate: native_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| Error::Config(format!("failed to open {:?}: {}", path, e)))?;
        let sink: WavSink = Arc::new(Mutex::new(Some(writer)));

        let stream = build_stream(&device, &supported, sink.clone(), kind)?;
        stream
            .play()
            .map_err(|e| Error::Config(format!("failed to start {}: {}", kind.label(), e)))?;

        log::info!(
            "{} recording started: {} ({} Hz, {} ch) -> {:?}",
            kind.label(),
            device_name,
            native_rate,
            native_channels,
            path
        );

        Ok((stream, sink))
    })();

    let (stream, sink) = match setup {
        Ok(pair) => pair,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok(()));

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);

    if let Some(writer) = sink.lock().take() {
        if let Err(e) = writer.finalize() {
            log::warn!("Failed to finalize {} file: {}", kind.label(), e);
        } else {
            log::info!("{} saved: {:?}", kind.label(), path);
        }
    };
}

// Build an input stream in the device's native sample format, converting
// samples to f32 on the way into the WAV sink
fn build_stream(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    sink: WavSink,
    kind: AudioStreamKind,
) -> Result<cpal::Stream> {
    let config: cpal::StreamConfig = supported.clone().into();
    let err_label = kind.label();
    let err_fn = move |e| log::warn!("{} stream error: {}", err_label, e);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                write_samples(&sink, data.iter().copied());
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                write_samples(&sink, data.iter().map(|s| f32::from(*s) / 32_768.0));
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                write_samples(
                    &sink,
                    data.iter().map(|s| (f32::from(*s) - 32_768.0) / 32_768.0),
                );
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Config(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| Error::Config(format!("failed to build {} stream: {}", kind.label(), e)))
}

fn write_samples(sink: &WavSink, samples: impl Iterator<Item = f32>) {
    let mut guard = sink.lock();
    if let Some(writer) = guard.as_mut() {
        for sample in samples {
            // A failed sample write is transient; the finalize path reports
            // anything persistent
            let _ = writer.write_sample(sample);
        }
    }
}

// Scan input devices for a loopback-capable one (WASAPI loopback endpoints,
// PulseAudio/PipeWire monitor sources). Hosts without one simply have no
// system-audio stream.
fn find_loopback_device(host: &cpal::Host) -> Option<cpal::Device> {
    let devices = host.input_devices().ok()?;
    for device in devices {
        if let Ok(name) = device.name() {
            if is_loopback_name(&name) {
                log::info!("Found system audio device: {}", name);
                return Some(device);
            }
        }
    }
    None
}

fn is_loopback_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("loopback") || lower.contains("monitor") || lower.contains("stereo mix")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_name_matching() {
        assert!(is_loopback_name("Monitor of Built-in Audio"));
        assert!(is_loopback_name("Speakers (Loopback)"));
        assert!(is_loopback_name("Stereo Mix (Realtek)"));
        assert!(!is_loopback_name("Built-in Microphone"));
    }

    #[test]
    fn test_stream_kind_labels() {
        assert_eq!(AudioStreamKind::SystemLoopback.label(), "system audio");
        assert_eq!(AudioStreamKind::Microphone.label(), "microphone");
    }
}
