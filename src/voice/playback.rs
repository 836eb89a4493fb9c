//! Speaker output via cpal with per-block level telemetry.

use super::capture::{device_label, device_matches};
use crate::error::{CompanionError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

const POLL: Duration = Duration::from_millis(10);

/// Mono output at a fixed sample rate.
pub struct CpalPlayback {
    device: cpal::Device,
    stream_config: StreamConfig,
}

impl CpalPlayback {
    /// Open `device_name` (or the default output) at `sample_rate`.
    ///
    /// # Errors
    ///
    /// [`CompanionError::SpeechSynthesis`] when no matching device exists.
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| playback_error(format!("cannot enumerate devices: {e}")))?
                .find(|d| device_matches(d, name))
                .ok_or_else(|| playback_error(format!("output device '{name}' not found")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| playback_error("no default output device"))?,
        };
        info!(device = %device_label(&device), sample_rate, "output device opened");

        Ok(Self {
            device,
            stream_config: StreamConfig {
                channels: 1,
                sample_rate,
                buffer_size: cpal::BufferSize::Default,
            },
        })
    }

    /// Play `samples` to completion or until `stop` is set, reporting the RMS
    /// of every block handed to the device. Blocks the calling thread.
    pub fn play_blocking(
        &self,
        samples: Vec<f32>,
        levels: &mpsc::UnboundedSender<f32>,
        stop: &AtomicBool,
    ) -> Result<()> {
        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples,
            position: 0,
            finished: false,
        }));
        let shared = Arc::clone(&buffer);
        let level_tx = levels.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let Ok(mut buf) = shared.lock() else {
                        return;
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                    let _ = level_tx.send(rms(data));
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| playback_error(format!("failed to build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| playback_error(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(POLL);
            if stop.load(Ordering::Acquire) {
                info!("playback stopped early");
                break;
            }
            let buf = buffer
                .lock()
                .map_err(|e| playback_error(format!("playback buffer lock poisoned: {e}")))?;
            if buf.finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }
}

struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn playback_error(message: impl Into<String>) -> CompanionError {
    CompanionError::SpeechSynthesis(message.into())
}

/// Root-mean-square level of a block.
pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
