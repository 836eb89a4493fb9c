//! Language model inference.
//!
//! [`CompletionEngine`] is the seam to the model runtime (the local GGUF
//! engine lives in [`local`]). [`InferenceSession`] wraps one loaded engine
//! and adds single-flight streaming with client-side stop sequences and the
//! visible-text [`Sanitizer`].

pub mod local;
pub mod sanitize;

pub use local::LocalEngine;
pub use sanitize::{Sanitizer, sanitize};

use crate::config::LlmConfig;
use crate::error::{CompanionError, Result};
use crate::message::ChatMessage;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Raw token stream produced by an engine.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Sampling and termination options for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_sequences: Vec<String>,
}

impl From<&LlmConfig> for CompletionOptions {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            stop_sequences: config.stop_sequences.clone(),
        }
    }
}

/// A loaded language model that can stream a chat completion.
#[async_trait::async_trait]
pub trait CompletionEngine: Send + Sync {
    /// Start streaming a completion for `messages`.
    ///
    /// Items are raw text fragments in emission order. Engines may ignore
    /// `stop_sequences`; the session enforces them on the accumulated text.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream>;
}

/// Why a completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// The engine closed its stream (token budget or end-of-turn).
    EndOfStream,
    /// A configured stop sequence was produced.
    StopSequence(String),
    /// [`InferenceSession::cancel`] was called.
    Cancelled,
}

/// Result of a finished completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Sanitized final text.
    pub text: String,
    /// Number of raw fragments received.
    pub fragments: usize,
    pub finish: FinishReason,
}

/// One loaded language model with single-flight streaming.
pub struct InferenceSession {
    engine: Arc<dyn CompletionEngine>,
    flight: tokio::sync::Mutex<()>,
    in_flight: AtomicBool,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl InferenceSession {
    pub fn new(engine: Arc<dyn CompletionEngine>) -> Self {
        Self {
            engine,
            flight: tokio::sync::Mutex::new(()),
            in_flight: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether a completion is currently streaming.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Best-effort cancellation of the in-flight completion.
    ///
    /// The stream stops being polled; the engine may keep computing briefly.
    /// When no completion has started streaming yet, the next one to start
    /// finishes immediately as [`FinishReason::Cancelled`].
    pub fn cancel(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Stream a completion, calling `on_visible` with the full sanitized text
    /// every time it changes.
    ///
    /// A second concurrent call waits until the first returns.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Inference`] if the engine fails to start or
    /// errors mid-stream. Text already passed to `on_visible` stays valid.
    pub async fn complete<F>(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        mut on_visible: F,
    ) -> Result<Completion>
    where
        F: FnMut(&str) + Send,
    {
        let _flight = self.flight.lock().await;
        self.in_flight.store(true, Ordering::Release);
        let _reset = FlightReset(self);

        let token = self
            .cancel
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_default();

        let started = Instant::now();
        let mut sanitizer = Sanitizer::new(&options.stop_sequences);
        let mut stream = self.engine.stream(messages, options).await?;
        let mut fragments = 0usize;

        let mut finish = FinishReason::EndOfStream;
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    info!(fragments, "completion cancelled");
                    finish = FinishReason::Cancelled;
                    break;
                }
                next = stream.next() => match next {
                    None => break,
                    Some(Ok(fragment)) => {
                        fragments += 1;
                        if let Some(visible) = sanitizer.push(&fragment) {
                            on_visible(visible);
                        }
                        if let Some(seq) = sanitizer.stop_sequence() {
                            finish = FinishReason::StopSequence(seq.to_owned());
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(fragments, error = %e, "completion stream failed");
                        return Err(match e {
                            CompanionError::Inference(_) => e,
                            other => CompanionError::Inference(other.to_string()),
                        });
                    }
                }
            }
        }

        let before = sanitizer.visible().to_owned();
        let text = sanitizer.finish();
        if text != before {
            on_visible(&text);
        }

        info!(
            fragments,
            chars = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?finish,
            "completion finished"
        );
        Ok(Completion {
            text,
            fragments,
            finish,
        })
    }
}

/// Ends a completion: clears the busy flag and arms a fresh token for the
/// next one.
struct FlightReset<'a>(&'a InferenceSession);

impl Drop for FlightReset<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.cancel.lock() {
            *slot = CancellationToken::new();
        }
        self.0.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engines shared by unit tests across the crate.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// One scripted stream item.
    #[derive(Debug, Clone)]
    pub(crate) enum Step {
        Token(&'static str),
        Fail(&'static str),
        Pause(Duration),
    }

    /// Replays one script per `stream` call and records the prompts.
    #[derive(Default)]
    pub(crate) struct ScriptedEngine {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        pub(crate) prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedEngine {
        pub(crate) fn new(scripts: Vec<Vec<Step>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn tokens(tokens: &[&'static str]) -> Self {
            Self::new(vec![tokens.iter().map(|t| Step::Token(*t)).collect()])
        }
    }

    #[async_trait::async_trait]
    impl CompletionEngine for ScriptedEngine {
        async fn stream(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<TokenStream> {
            if let Ok(mut p) = self.prompts.lock() {
                p.push(messages.to_vec());
            }
            let script = self
                .scripts
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or_default();
            Ok(Box::pin(async_stream::stream! {
                for step in script {
                    match step {
                        Step::Token(t) => yield Ok(t.to_owned()),
                        Step::Fail(msg) => yield Err(CompanionError::Inference(msg.to_owned())),
                        Step::Pause(d) => tokio::time::sleep(d).await,
                    }
                }
            }))
        }
    }
}
