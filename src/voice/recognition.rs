//! Speech recognition seam and transcript reconciliation.
//!
//! Engines report hypotheses as they refine them. Some engines (notably the
//! windowed whisper recognizer) restart their hypothesis after a pause, so a
//! new result may either revise the current segment or begin a fresh one.
//! [`TranscriptTracker`] folds both cases into one monotonic transcript.

use crate::error::Result;
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw event emitted by a recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Audio capture is live.
    Started,
    /// Current hypothesis for the segment being spoken.
    Partial(String),
    /// Recognition ended. Carries the engine's last hypothesis.
    End(String),
    /// Non-fatal engine error; an `End` still follows.
    Error(String),
}

/// Options for one recognition session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    /// BCP-47 locale, e.g. `"en-GB"`.
    pub locale: String,
    pub interim_results: bool,
    /// Trailing silence after which the caller stops recognition itself
    /// when the engine has no end-of-utterance detection.
    pub silence_window: Duration,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            locale: "en-US".to_owned(),
            interim_results: true,
            silence_window: Duration::from_millis(2000),
        }
    }
}

/// A loaded speech recognizer.
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Begin capturing and recognizing. Events are sent on `events` until an
    /// [`RecognitionEvent::End`] is emitted or the sender is dropped.
    async fn start(
        &self,
        options: &RecognitionOptions,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<()>;

    /// Stop capturing. The engine emits `End` with its final hypothesis.
    async fn stop(&self) -> Result<()>;

    /// Whether the engine ends a session by itself once the speaker pauses.
    fn detects_end_of_utterance(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Transcript reconciliation
// ---------------------------------------------------------------------------

/// Accumulates engine hypotheses into a single transcript.
#[derive(Debug, Default, Clone)]
pub struct TranscriptTracker {
    committed: String,
    segment: String,
}

impl TranscriptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the engine's current hypothesis. Returns the full transcript
    /// when it changed.
    pub fn update(&mut self, hypothesis: &str) -> Option<String> {
        let hypothesis = hypothesis.trim();
        if hypothesis.is_empty() || hypothesis == self.segment {
            return None;
        }
        if !self.segment.is_empty() && !revises(&self.segment, hypothesis) {
            self.commit();
        }
        self.segment = hypothesis.to_owned();
        Some(self.transcript())
    }

    /// Committed segments followed by the current one.
    pub fn transcript(&self) -> String {
        match (self.committed.is_empty(), self.segment.is_empty()) {
            (true, _) => self.segment.clone(),
            (false, true) => self.committed.clone(),
            (false, false) => format!("{} {}", self.committed, self.segment),
        }
    }

    fn commit(&mut self) {
        if self.committed.is_empty() {
            self.committed = std::mem::take(&mut self.segment);
        } else {
            self.committed.push(' ');
            self.committed.push_str(&self.segment);
            self.segment.clear();
        }
    }
}

/// Whether `next` refines `previous` rather than starting a new segment.
fn revises(previous: &str, next: &str) -> bool {
    let previous = previous.to_lowercase();
    let next = next.to_lowercase();
    if next.starts_with(&previous) || previous.starts_with(&next) || next.contains(&previous) {
        return true;
    }
    let first = |s: &str| {
        s.split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_owned())
    };
    matches!((first(&previous), first(&next)), (Some(a), Some(b)) if !a.is_empty() && a == b)
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Event observed by the turn loop while listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Started,
    /// Full transcript so far.
    Transcript(String),
    /// Recognition ended with this full transcript (possibly empty).
    Final(String),
    Error(String),
}

/// Reconciled view over one recognition session's events.
pub struct RecognitionSubscription {
    rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    tracker: TranscriptTracker,
    ended: bool,
}

impl RecognitionSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<RecognitionEvent>) -> Self {
        Self {
            rx,
            tracker: TranscriptTracker::new(),
            ended: false,
        }
    }

    /// Next event. Yields exactly one [`VoiceEvent::Final`], after which it
    /// returns `None`. A recognizer that drops its sender without `End`
    /// still produces the final transcript.
    pub async fn next(&mut self) -> Option<VoiceEvent> {
        if self.ended {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Some(RecognitionEvent::Started) => return Some(VoiceEvent::Started),
                Some(RecognitionEvent::Partial(text)) => {
                    if let Some(full) = self.tracker.update(&text) {
                        return Some(VoiceEvent::Transcript(full));
                    }
                }
                Some(RecognitionEvent::Error(message)) => return Some(VoiceEvent::Error(message)),
                Some(RecognitionEvent::End(text)) => {
                    self.tracker.update(&text);
                    return Some(self.finish());
                }
                None => return Some(self.finish()),
            }
        }
    }

    fn finish(&mut self) -> VoiceEvent {
        self.ended = true;
        self.rx.close();
        VoiceEvent::Final(self.tracker.transcript())
    }
}
