//! Microphone capture via cpal, resampled to 16 kHz mono.

use crate::error::{CompanionError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// How often the capture thread checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Microphone input bound to one device.
///
/// cpal streams are not `Send`, so [`CpalCapture::run_blocking`] is meant to
/// own a dedicated thread for the lifetime of one recognition session.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
}

impl CpalCapture {
    /// Open `device_name` (or the default input) for capture at its native
    /// configuration.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Recognition`] when no matching device exists.
    pub fn new(device_name: Option<&str>, target_sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| audio_error(format!("cannot enumerate devices: {e}")))?
                .find(|d| device_matches(d, name))
                .ok_or_else(|| audio_error(format!("input device '{name}' not found")))?,
            None => host
                .default_input_device()
                .ok_or_else(|| audio_error("no default input device"))?,
        };

        let default_config = device
            .default_input_config()
            .map_err(|e| audio_error(format!("no default input config: {e}")))?;
        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = %device_label(&device),
            native_rate = stream_config.sample_rate,
            channels = stream_config.channels,
            target_sample_rate,
            "input device opened"
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate,
        })
    }

    /// Stream mono chunks at the target rate into `tx` until `stop` is set
    /// or the receiver is dropped. Blocks the calling thread.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Recognition`] if the stream cannot be built or
    /// started.
    pub fn run_blocking(&self, tx: mpsc::UnboundedSender<Vec<f32>>, stop: &AtomicBool) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let sink = tx.clone();

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, channels);
                    let samples = resample_linear(&mono, native_rate, target_rate);
                    // The receiver going away is observed by the outer loop.
                    let _ = sink.send(samples);
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| audio_error(format!("failed to build input stream: {e}")))?;
        stream
            .play()
            .map_err(|e| audio_error(format!("failed to start input stream: {e}")))?;
        info!("audio capture started");

        while !stop.load(Ordering::Acquire) && !tx.is_closed() {
            std::thread::sleep(STOP_POLL);
        }

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }

    /// Names of the available input devices.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| audio_error(format!("cannot enumerate devices: {e}")))?;
        Ok(devices
            .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
            .collect())
    }
}

pub(crate) fn device_matches(device: &cpal::Device, name: &str) -> bool {
    device
        .description()
        .map(|desc| desc.name() == name)
        .unwrap_or(false)
}

pub(crate) fn device_label(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

fn audio_error(message: impl Into<String>) -> CompanionError {
    CompanionError::Recognition(message.into())
}

/// Average interleaved frames down to one channel.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech, whose energy sits
/// well below the 8 kHz Nyquist limit of the 16 kHz target.
pub(crate) fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            if idx < last {
                (f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac) as f32
            } else {
                samples[idx.min(last)]
            }
        })
        .collect()
}
