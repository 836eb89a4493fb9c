//! Windowed whisper.cpp recognizer over live microphone audio.
//!
//! Whisper is not a streaming model, so partial results come from
//! re-transcribing the current audio window every `step_ms`. When the window
//! fills it is transcribed one last time and a fresh window begins; the new
//! hypothesis then no longer overlaps the old one and the transcript tracker
//! appends it as a new segment. There is no end-of-utterance detection: the
//! caller stops recognition after a silence timeout.

use super::capture::CpalCapture;
use super::playback::rms;
use super::recognition::{RecognitionEvent, RecognitionOptions, SpeechRecognizer};
use crate::config::SttConfig;
use crate::error::{CompanionError, Result};
use crate::models::ArtifactKind;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Windows quieter than this are not worth a whisper pass.
const SPEECH_RMS_FLOOR: f32 = 0.005;
/// Whisper rejects inputs shorter than one second; pad up to this.
const MIN_INPUT_SECS: f32 = 1.05;
/// Non-speech markers whisper emits for silence and noise.
const NON_SPEECH_MARKERS: &[&str] = &["[BLANK_AUDIO]", "[MUSIC]", "(music)", "[NOISE]", "(silence)"];

/// Recognizer backed by a `ggml` whisper model.
pub struct WhisperRecognizer {
    ctx: Arc<WhisperContext>,
    config: SttConfig,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

struct ActiveSession {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl WhisperRecognizer {
    /// Load the whisper model at `weights`.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Load`] if whisper.cpp rejects the file.
    pub fn load(weights: &Path, config: &SttConfig) -> Result<Self> {
        let path = weights
            .to_str()
            .ok_or_else(|| CompanionError::load(ArtifactKind::Stt, "model path is not UTF-8"))?;
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| CompanionError::load(ArtifactKind::Stt, e.to_string()))?;
        info!(path, "whisper model loaded");
        Ok(Self {
            ctx: Arc::new(ctx),
            config: config.clone(),
            active: tokio::sync::Mutex::new(None),
        })
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for WhisperRecognizer {
    async fn start(
        &self,
        options: &RecognitionOptions,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|s| !s.worker.is_finished()) {
            return Err(CompanionError::Busy("recognition already running".into()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();

        let device = self.config.input_device.clone();
        let sample_rate = self.config.sample_rate;
        let capture_stop = Arc::clone(&stop);
        let capture_events = events.clone();
        std::thread::Builder::new()
            .name("sam-capture".into())
            .spawn(move || {
                let outcome = CpalCapture::new(device.as_deref(), sample_rate)
                    .and_then(|capture| capture.run_blocking(audio_tx, &capture_stop));
                if let Err(e) = outcome {
                    warn!(error = %e, "audio capture failed");
                    let _ = capture_events.send(RecognitionEvent::Error(e.to_string()));
                }
            })
            .map_err(|e| CompanionError::Recognition(format!("cannot spawn capture thread: {e}")))?;

        let language = language_code(&options.locale);
        let window = Window::new(&self.config);
        let worker = tokio::spawn(transcribe_loop(
            Arc::clone(&self.ctx),
            language,
            window,
            audio_rx,
            events.clone(),
            Arc::clone(&stop),
        ));

        let _ = events.send(RecognitionEvent::Started);
        *active = Some(ActiveSession { stop, worker });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(session) = self.active.lock().await.take() else {
            return Ok(());
        };
        session.stop.store(true, Ordering::Release);
        if let Err(e) = session.worker.await {
            warn!(error = %e, "transcription worker ended abnormally");
        }
        Ok(())
    }

    fn detects_end_of_utterance(&self) -> bool {
        false
    }
}

/// Rolling audio window parameters.
struct Window {
    capacity: usize,
    min_len: usize,
    sample_rate: u32,
    step: Duration,
}

impl Window {
    fn new(config: &SttConfig) -> Self {
        let rate = config.sample_rate.max(1);
        Self {
            capacity: (config.window_secs.max(1.0) * rate as f32) as usize,
            min_len: (rate / 2) as usize,
            sample_rate: rate,
            step: Duration::from_millis(config.step_ms.max(100)),
        }
    }
}

async fn transcribe_loop(
    ctx: Arc<WhisperContext>,
    language: String,
    window: Window,
    mut audio_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut audio: Vec<f32> = Vec::with_capacity(window.capacity);
    let mut fresh = false;
    let mut last = String::new();
    let mut ticker = tokio::time::interval(window.step);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = audio_rx.recv() => match chunk {
                Some(samples) => {
                    audio.extend_from_slice(&samples);
                    fresh = true;
                    if audio.len() >= window.capacity {
                        let text = transcribe_window(&ctx, &language, &audio, window.sample_rate, &events).await;
                        if let Some(text) = text.filter(|t| *t != last) {
                            let _ = events.send(RecognitionEvent::Partial(text));
                        }
                        debug!(samples = audio.len(), "recognition window rolled over");
                        audio.clear();
                        last.clear();
                        fresh = false;
                    }
                }
                // Capture thread exited (stopped or failed).
                None => break,
            },
            _ = ticker.tick() => {
                if events.is_closed() {
                    stop.store(true, Ordering::Release);
                }
                if fresh && audio.len() >= window.min_len {
                    fresh = false;
                    let text = transcribe_window(&ctx, &language, &audio, window.sample_rate, &events).await;
                    if let Some(text) = text.filter(|t| *t != last) {
                        last = text.clone();
                        let _ = events.send(RecognitionEvent::Partial(text));
                    }
                }
            }
        }
    }

    let final_text = if fresh && !audio.is_empty() {
        transcribe_window(&ctx, &language, &audio, window.sample_rate, &events)
            .await
            .unwrap_or_else(|| last.clone())
    } else {
        last
    };
    info!(chars = final_text.len(), "recognition ended");
    let _ = events.send(RecognitionEvent::End(final_text));
}

/// Transcribe `audio` off the async runtime. Errors are reported as events.
async fn transcribe_window(
    ctx: &Arc<WhisperContext>,
    language: &str,
    audio: &[f32],
    sample_rate: u32,
    events: &mpsc::UnboundedSender<RecognitionEvent>,
) -> Option<String> {
    if rms(audio) < SPEECH_RMS_FLOOR {
        return None;
    }
    let ctx = Arc::clone(ctx);
    let language = language.to_owned();
    let mut samples = audio.to_vec();
    let min_len = (MIN_INPUT_SECS * sample_rate as f32) as usize;
    if samples.len() < min_len {
        samples.resize(min_len, 0.0);
    }

    match tokio::task::spawn_blocking(move || transcribe(&ctx, &language, &samples)).await {
        Ok(Ok(text)) if !text.is_empty() => Some(text),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            warn!(error = %e, "whisper pass failed");
            let _ = events.send(RecognitionEvent::Error(e.to_string()));
            None
        }
        Err(e) => {
            warn!(error = %e, "whisper task panicked");
            None
        }
    }
}

fn transcribe(ctx: &WhisperContext, language: &str, samples: &[f32]) -> Result<String> {
    let mut state = ctx
        .create_state()
        .map_err(|e| CompanionError::Recognition(format!("failed to create whisper state: {e}")))?;
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(Some(language));
    params.set_n_threads(num_cpus::get().min(8) as i32);
    params.set_translate(false);
    params.set_no_context(true);
    params.set_print_progress(false);
    params.set_print_timestamps(false);
    params.set_print_special(false);
    params.set_print_realtime(false);
    params.set_token_timestamps(false);
    state
        .full(params, samples)
        .map_err(|e| CompanionError::Recognition(format!("whisper inference failed: {e}")))?;

    let segments = state
        .full_n_segments()
        .map_err(|e| CompanionError::Recognition(format!("cannot read segments: {e}")))?;
    let mut text = String::new();
    for i in 0..segments.max(0) {
        match state.full_get_segment_text_lossy(i) {
            Ok(segment) => text.push_str(&segment),
            Err(e) => debug!(segment = i, error = %e, "unreadable whisper segment"),
        }
    }
    Ok(clean_transcript(&text))
}

/// Drop non-speech markers and normalize whitespace.
fn clean_transcript(raw: &str) -> String {
    let mut text = raw.to_owned();
    for marker in NON_SPEECH_MARKERS {
        text = text.replace(marker, " ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"en-GB"` -> `"en"`.
fn language_code(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("en")
        .to_ascii_lowercase()
}
