//! Speech synthesis seam and playback-completion detection.
//!
//! Synthesizers do not reliably signal when audio has actually finished on
//! the output device, so completion is inferred: a run of quiet level
//! samples after audible output, or a text-length estimate as fallback,
//! whichever comes first.

use crate::config::{SpeechTimingConfig, VolumeCompletionConfig};
use crate::error::Result;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Punctuation that adds a pause to the duration estimate.
const PAUSE_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

/// Handle to one utterance that has started playing.
#[derive(Debug, Default)]
pub struct Utterance {
    /// Output level telemetry (RMS per audio block, `0.0..=1.0`). Closed
    /// when playback finishes. `None` when the engine offers no telemetry.
    pub levels: Option<mpsc::UnboundedReceiver<f32>>,
}

/// A speech synthesizer bound to an output device.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start speaking `text` with the voice bundle at `voice_model`.
    ///
    /// Returns once audio has started; completion is observed through the
    /// returned [`Utterance`].
    async fn begin(&self, voice_model: &Path, text: &str) -> Result<Utterance>;

    /// Stop any audio in progress.
    async fn cancel(&self);
}

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechCompletion {
    /// Output went quiet after audible speech (or telemetry closed).
    Silence,
    /// The fallback timer elapsed first.
    Estimate,
    Cancelled,
}

/// Upper-bound playback estimate for `text`.
pub fn estimate_duration(text: &str, timing: &SpeechTimingConfig) -> Duration {
    let words = text.split_whitespace().count() as u64;
    let pauses = text.chars().filter(|c| PAUSE_PUNCTUATION.contains(c)).count() as u64;
    let ms = words * timing.per_word_ms + pauses * timing.per_punctuation_ms;
    Duration::from_millis(ms.max(timing.floor_ms))
}

/// Counts consecutive quiet level samples once speech has been heard.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    required: usize,
    heard_speech: bool,
    quiet_run: usize,
}

impl SilenceDetector {
    pub fn new(config: &VolumeCompletionConfig) -> Self {
        Self {
            threshold: config.silence_threshold,
            required: config.silent_samples.max(1) as usize,
            heard_speech: false,
            quiet_run: 0,
        }
    }

    /// Feed one level sample. Returns `true` once the output is judged done.
    pub fn push(&mut self, level: f32) -> bool {
        if level >= self.threshold {
            self.heard_speech = true;
            self.quiet_run = 0;
            return false;
        }
        if !self.heard_speech {
            return false;
        }
        self.quiet_run += 1;
        self.quiet_run >= self.required
    }
}

/// Wait until the utterance is over. Resolves exactly once.
///
/// Without telemetry the estimate is the only signal. With telemetry the
/// estimate is stretched by `estimate_cap_factor` and acts as a safety net
/// for output that never goes quiet.
pub async fn wait_for_completion(
    utterance: Utterance,
    estimate: Duration,
    config: &VolumeCompletionConfig,
    cancel: &CancellationToken,
) -> SpeechCompletion {
    let Some(mut levels) = utterance.levels else {
        return tokio::select! {
            biased;
            () = cancel.cancelled() => SpeechCompletion::Cancelled,
            () = tokio::time::sleep(estimate) => SpeechCompletion::Estimate,
        };
    };

    let cap = estimate.mul_f32(config.estimate_cap_factor.max(1.0));
    let deadline = tokio::time::sleep(cap);
    tokio::pin!(deadline);
    let mut detector = SilenceDetector::new(config);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return SpeechCompletion::Cancelled,
            () = &mut deadline => {
                debug!(cap_ms = cap.as_millis() as u64, "speech completion by estimate");
                return SpeechCompletion::Estimate;
            }
            level = levels.recv() => match level {
                Some(level) => {
                    if detector.push(level) {
                        return SpeechCompletion::Silence;
                    }
                }
                None => return SpeechCompletion::Silence,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn timing() -> SpeechTimingConfig {
        SpeechTimingConfig {
            per_word_ms: 380,
            per_punctuation_ms: 250,
            floor_ms: 1500,
        }
    }

    fn volume() -> VolumeCompletionConfig {
        VolumeCompletionConfig {
            silence_threshold: 0.01,
            silent_samples: 3,
            estimate_cap_factor: 3.0,
        }
    }

    #[test]
    fn estimate_scales_with_words_and_punctuation() {
        assert_eq!(estimate_duration("Hi.", &timing()), Duration::from_millis(1500));
        let text = "Sure, I can help with that today. Ask me anything!";
        // 10 words, 3 pauses
        assert_eq!(estimate_duration(text, &timing()), Duration::from_millis(4550));
    }

    #[test]
    fn leading_silence_does_not_complete() {
        let mut d = SilenceDetector::new(&volume());
        for _ in 0..10 {
            assert!(!d.push(0.0));
        }
        assert!(!d.push(0.2));
        assert!(!d.push(0.001));
        assert!(!d.push(0.001));
        assert!(d.push(0.001));
    }

    #[test]
    fn speech_resets_quiet_run() {
        let mut d = SilenceDetector::new(&volume());
        d.push(0.3);
        d.push(0.0);
        d.push(0.0);
        assert!(!d.push(0.5));
        d.push(0.0);
        d.push(0.0);
        assert!(d.push(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn no_telemetry_uses_estimate() {
        let cancel = CancellationToken::new();
        let out = wait_for_completion(
            Utterance::default(),
            Duration::from_secs(2),
            &volume(),
            &cancel,
        )
        .await;
        assert_eq!(out, SpeechCompletion::Estimate);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_tail_completes_before_estimate() {
        let (tx, rx) = mpsc::unbounded_channel();
        for level in [0.0, 0.4, 0.3, 0.0, 0.0, 0.0] {
            tx.send(level).unwrap();
        }
        let cancel = CancellationToken::new();
        let utterance = Utterance { levels: Some(rx) };
        let out =
            wait_for_completion(utterance, Duration::from_secs(60), &volume(), &cancel).await;
        assert_eq!(out, SpeechCompletion::Silence);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_output_falls_back_to_capped_estimate() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(0.5).unwrap();
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let out = wait_for_completion(
            Utterance { levels: Some(rx) },
            Duration::from_secs(1),
            &volume(),
            &cancel,
        )
        .await;
        assert_eq!(out, SpeechCompletion::Estimate);
        assert!(started.elapsed() >= Duration::from_secs(3));
        drop(tx);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let (_tx, rx) = mpsc::unbounded_channel::<f32>();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = wait_for_completion(
            Utterance { levels: Some(rx) },
            Duration::from_secs(60),
            &volume(),
            &cancel,
        )
        .await;
        assert_eq!(out, SpeechCompletion::Cancelled);
    }
}
