//! Kokoro speech synthesizer with speaker playback.

pub mod engine;
pub mod phonemize;

pub use engine::{BundleFingerprint, KokoroTts, SAMPLE_RATE, VoiceBundle};

use super::playback::CpalPlayback;
use super::synthesis::{SpeechSynthesizer, Utterance};
use crate::config::TtsConfig;
use crate::error::{CompanionError, Result};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Engine built from one voice bundle, rebuilt whenever the bundle on disk
/// changes.
struct EngineSlot<T> {
    cached: Option<(BundleFingerprint, T)>,
}

impl<T> EngineSlot<T> {
    fn new() -> Self {
        Self { cached: None }
    }

    fn get_or_load(
        &mut self,
        dir: &Path,
        load: impl FnOnce(&VoiceBundle) -> Result<T>,
    ) -> Result<&mut T> {
        let bundle = VoiceBundle::locate(dir)?;
        let fingerprint = bundle.fingerprint();
        if self.cached.as_ref().is_none_or(|(f, _)| *f != fingerprint) {
            info!(voice = %bundle.voice_id(), "loading voice engine");
            self.cached = None;
            self.cached = Some((fingerprint, load(&bundle)?));
        }
        self.cached
            .as_mut()
            .map(|(_, engine)| engine)
            .ok_or_else(|| CompanionError::SpeechSynthesis("voice engine unavailable".into()))
    }
}

/// [`SpeechSynthesizer`] that renders with Kokoro and plays through cpal.
///
/// The engine is initialised on first use of a voice bundle and kept until
/// the bundle is replaced, for example by a voice change.
pub struct KokoroSynthesizer {
    config: TtsConfig,
    engine: tokio::sync::Mutex<EngineSlot<KokoroTts>>,
    playing: std::sync::Mutex<Option<Arc<AtomicBool>>>,
}

impl KokoroSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            config: config.clone(),
            engine: tokio::sync::Mutex::new(EngineSlot::new()),
            playing: std::sync::Mutex::new(None),
        }
    }

    fn stop_playback(&self) {
        let previous = self.playing.lock().ok().and_then(|mut slot| slot.take());
        if let Some(stop) = previous {
            stop.store(true, Ordering::Release);
        }
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for KokoroSynthesizer {
    async fn begin(&self, voice_model: &Path, text: &str) -> Result<Utterance> {
        self.stop_playback();

        let speed = self.config.speed;
        let mut slot = self.engine.lock().await;
        let samples = tokio::task::block_in_place(|| {
            slot.get_or_load(voice_model, |bundle| KokoroTts::load(bundle, speed))?
                .synthesize(text)
        })?;
        drop(slot);

        let playback = CpalPlayback::new(self.config.output_device.as_deref(), SAMPLE_RATE)?;
        let stop = Arc::new(AtomicBool::new(false));
        if let Ok(mut playing) = self.playing.lock() {
            *playing = Some(Arc::clone(&stop));
        }

        let (level_tx, level_rx) = mpsc::unbounded_channel();
        let audio_secs = samples.len() as f32 / SAMPLE_RATE as f32;
        std::thread::Builder::new()
            .name("sam-playback".into())
            .spawn(move || {
                if let Err(e) = playback.play_blocking(samples, &level_tx, &stop) {
                    warn!(error = %e, "playback failed");
                }
                // Dropping `level_tx` closes the telemetry channel.
            })
            .map_err(|e| CompanionError::SpeechSynthesis(format!("cannot spawn playback thread: {e}")))?;

        info!(audio_secs, "speaking");
        Ok(Utterance {
            levels: Some(level_rx),
        })
    }

    async fn cancel(&self) {
        self.stop_playback();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn write_bundle(dir: &Path, voice: &str) {
        for entry in std::fs::read_dir(dir).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        for name in ["kokoro.onnx", "tokenizer.json", &format!("{voice}.bin")] {
            std::fs::write(dir.join(name), b"x").unwrap();
        }
    }

    #[test]
    fn same_bundle_reuses_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "af_heart");
        let mut slot = EngineSlot::new();
        let mut loads = 0;
        for _ in 0..3 {
            slot.get_or_load(dir.path(), |b| {
                loads += 1;
                Ok(b.voice_id())
            })
            .unwrap();
        }
        assert_eq!(loads, 1);
    }

    #[test]
    fn replaced_bundle_in_same_directory_builds_a_new_engine() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "af_heart");
        let mut slot = EngineSlot::new();
        let first = slot.get_or_load(dir.path(), |b| Ok(b.voice_id())).unwrap().clone();
        assert_eq!(first, "af_heart");

        write_bundle(dir.path(), "bm_george");
        let second = slot.get_or_load(dir.path(), |b| Ok(b.voice_id())).unwrap().clone();
        assert_eq!(second, "bm_george");
    }

    #[test]
    fn failed_load_leaves_no_stale_engine() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "af_heart");
        let mut slot = EngineSlot::new();
        slot.get_or_load(dir.path(), |b| Ok(b.voice_id())).unwrap();

        write_bundle(dir.path(), "bf_emma");
        let err = slot
            .get_or_load(dir.path(), |_| -> Result<String> {
                Err(CompanionError::SpeechSynthesis("bad model".into()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("bad model"));
        assert!(slot.cached.is_none());
    }
}
