//! Voice I/O: speech recognition, speech synthesis and their coordination.
//!
//! [`VoiceSession`] keeps the microphone and the speaker mutually exclusive.
//! Starting recognition cancels speech in progress, and speaking stops an
//! active recognizer first, so SAM never transcribes its own voice.

pub mod capture;
pub mod kokoro;
pub mod playback;
pub mod recognition;
pub mod synthesis;
pub mod whisper;

pub use kokoro::KokoroSynthesizer;
pub use recognition::{
    RecognitionEvent, RecognitionOptions, RecognitionSubscription, SpeechRecognizer,
    TranscriptTracker, VoiceEvent,
};
pub use synthesis::{SpeechCompletion, SpeechSynthesizer, Utterance, estimate_duration};
pub use whisper::WhisperRecognizer;

use crate::config::TtsConfig;
use crate::error::{CompanionError, Result};
use crate::permissions::PermissionGate;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mediates access to the microphone and the speaker.
pub struct VoiceSession {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    permission: PermissionGate,
    tts: TtsConfig,
    recognizer: tokio::sync::Mutex<Option<Arc<dyn SpeechRecognizer>>>,
    listening: AtomicBool,
    speaking: AtomicBool,
    speech_cancel: std::sync::Mutex<CancellationToken>,
}

impl VoiceSession {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        permission: PermissionGate,
        tts: &TtsConfig,
    ) -> Self {
        Self {
            synthesizer,
            permission,
            tts: tts.clone(),
            recognizer: tokio::sync::Mutex::new(None),
            listening: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            speech_cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    /// Start a recognition session on `recognizer`.
    ///
    /// Speech in progress is cancelled and any previous recognizer stopped
    /// before capture begins.
    ///
    /// # Errors
    ///
    /// [`CompanionError::PermissionDenied`] without microphone access, or
    /// the recognizer's own start error.
    pub async fn start_recognition(
        &self,
        recognizer: Arc<dyn SpeechRecognizer>,
        options: &RecognitionOptions,
    ) -> Result<RecognitionSubscription> {
        self.permission.ensure_granted().await?;
        self.cancel_speech().await;

        let mut active = self.recognizer.lock().await;
        if let Some(previous) = active.take()
            && let Err(e) = previous.stop().await
        {
            warn!(error = %e, "previous recognizer did not stop cleanly");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        recognizer.start(options, tx).await?;
        *active = Some(recognizer);
        self.listening.store(true, Ordering::Release);
        info!(locale = %options.locale, "listening");
        Ok(RecognitionSubscription::new(rx))
    }

    /// Stop the active recognizer. Its final transcript arrives on the
    /// subscription. A no-op when not listening.
    pub async fn stop_recognition(&self) -> Result<()> {
        let active = self.recognizer.lock().await.take();
        self.listening.store(false, Ordering::Release);
        match active {
            Some(recognizer) => recognizer.stop().await,
            None => Ok(()),
        }
    }

    /// Record that the subscription observed the end of recognition.
    pub async fn recognition_ended(&self) {
        *self.recognizer.lock().await = None;
        self.listening.store(false, Ordering::Release);
    }

    /// Speak `text` and wait until playback is judged complete.
    ///
    /// # Errors
    ///
    /// [`CompanionError::SpeechSynthesis`] if the engine cannot start.
    pub async fn speak(&self, voice_model: &Path, text: &str) -> Result<SpeechCompletion> {
        if let Err(e) = self.stop_recognition().await {
            warn!(error = %e, "recognizer did not stop before speaking");
        }

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.speech_cancel.lock() {
            *slot = cancel.clone();
        }

        self.speaking.store(true, Ordering::Release);
        let _reset = FlagReset(&self.speaking);

        let utterance = self
            .synthesizer
            .begin(voice_model, text)
            .await
            .map_err(|e| match e {
                CompanionError::SpeechSynthesis(_) => e,
                other => CompanionError::SpeechSynthesis(other.to_string()),
            })?;

        let estimate = estimate_duration(text, &self.tts.timing);
        let outcome =
            synthesis::wait_for_completion(utterance, estimate, &self.tts.volume, &cancel).await;
        if outcome == SpeechCompletion::Cancelled {
            self.synthesizer.cancel().await;
        }
        info!(?outcome, "speech finished");
        Ok(outcome)
    }

    /// Cut off speech in progress. The pending `speak` resolves as
    /// [`SpeechCompletion::Cancelled`].
    pub async fn cancel_speech(&self) {
        if !self.is_speaking() {
            return;
        }
        if let Ok(token) = self.speech_cancel.lock() {
            token.cancel();
        }
        self.synthesizer.cancel().await;
    }
}

struct FlagReset<'a>(&'a AtomicBool);

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::testing::{RecordingSynthesizer, ScriptedRecognizer};
    use super::*;
    use crate::permissions::testing::FixedPermission;
    use crate::permissions::PermissionStatus;
    use std::time::Duration;

    fn session(synth: Arc<dyn SpeechSynthesizer>) -> Arc<VoiceSession> {
        Arc::new(VoiceSession::new(
            synth,
            PermissionGate::default(),
            &TtsConfig::default(),
        ))
    }

    #[tokio::test]
    async fn recognition_yields_final_transcript_on_stop() {
        let voice = session(Arc::new(RecordingSynthesizer::default()));
        let rec = Arc::new(ScriptedRecognizer::default());
        let mut sub = voice
            .start_recognition(rec.clone(), &RecognitionOptions::default())
            .await
            .unwrap();
        assert!(voice.is_listening());

        rec.say("good");
        rec.say("good morning");
        voice.stop_recognition().await.unwrap();
        assert!(!voice.is_listening());

        assert_eq!(sub.next().await, Some(VoiceEvent::Started));
        assert_eq!(sub.next().await, Some(VoiceEvent::Transcript("good".into())));
        assert_eq!(
            sub.next().await,
            Some(VoiceEvent::Transcript("good morning".into()))
        );
        assert_eq!(sub.next().await, Some(VoiceEvent::Final("good morning".into())));
    }

    #[tokio::test]
    async fn denied_permission_blocks_recognition() {
        let provider = Arc::new(FixedPermission::new(PermissionStatus::Denied, false));
        let voice = VoiceSession::new(
            Arc::new(RecordingSynthesizer::default()),
            PermissionGate::new(provider),
            &TtsConfig::default(),
        );
        let rec = Arc::new(ScriptedRecognizer::default());
        let err = voice
            .start_recognition(rec.clone(), &RecognitionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CompanionError::PermissionDenied));
        assert_eq!(rec.starts.load(Ordering::SeqCst), 0);
        assert!(!voice.is_listening());
    }

    #[tokio::test]
    async fn speaking_stops_the_recognizer_first() {
        let synth = Arc::new(RecordingSynthesizer::default());
        let voice = session(synth.clone());
        let rec = Arc::new(ScriptedRecognizer::default());
        let _sub = voice
            .start_recognition(rec.clone(), &RecognitionOptions::default())
            .await
            .unwrap();

        let outcome = voice.speak(Path::new("/voices/bf_emma"), "Hello.").await.unwrap();
        assert_eq!(outcome, SpeechCompletion::Silence);
        assert_eq!(rec.stops.load(Ordering::SeqCst), 1);
        assert!(!voice.is_listening());
        assert!(!voice.is_speaking());
        assert_eq!(*synth.spoken.lock().unwrap(), vec!["Hello."]);
    }

    #[tokio::test]
    async fn listening_cancels_speech_in_progress() {
        let synth = Arc::new(RecordingSynthesizer::holding());
        let voice = session(synth.clone());
        let speaking = {
            let voice = Arc::clone(&voice);
            tokio::spawn(async move {
                voice
                    .speak(Path::new("/voices/af_heart"), "A long answer.")
                    .await
            })
        };
        while !voice.is_speaking() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let rec = Arc::new(ScriptedRecognizer::default());
        let _sub = voice
            .start_recognition(rec, &RecognitionOptions::default())
            .await
            .unwrap();
        assert_eq!(speaking.await.unwrap().unwrap(), SpeechCompletion::Cancelled);
        assert!(synth.cancels.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn synthesizer_failure_is_a_speech_error() {
        let voice = session(Arc::new(RecordingSynthesizer::failing()));
        let err = voice
            .speak(Path::new("/voices/am_michael"), "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CompanionError::SpeechSynthesis(_)));
        assert!(!voice.is_speaking());
    }
}
