//! Turn orchestrator: the state machine that owns the message log.
//!
//! Typed and spoken input both end up in [`TurnOrchestrator::finalize_user_message`],
//! which runs one turn start to finish:
//!
//! 1. replace the user draft with the final user message and persist it
//! 2. apply remember/forget keywords
//! 3. assemble the prompt window
//! 4. stream the reply into a single assistant draft
//! 5. finalize and persist the reply
//! 6. in talking mode, speak it and re-arm listening exactly once
//!
//! Only one turn may be generating at a time. A second request while one is
//! in flight is rejected, not queued.

use crate::error::{CompanionError, Presentation, Result};
use crate::llm::{CompletionOptions, FinishReason};
use crate::message::{Message, Role};
use crate::models::{ArtifactKind, ModelAssetManager};
use crate::pipeline::memory::MemoryKeywords;
use crate::pipeline::messages::MessageLog;
use crate::pipeline::window::build_prompt_window;
use crate::profile::UserProfile;
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::runtime::{FlagSnapshot, RuntimeEvent, RuntimeFlags};
use crate::session::SessionContext;
use crate::store::ConversationStore;
use crate::voice::{RecognitionSubscription, SpeechCompletion, VoiceEvent, VoiceSession};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Where the turn loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    ListeningOrTyping,
    DraftingUser,
    Generating,
    Speaking,
}

/// Result of [`TurnOrchestrator::finalize_user_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing to send (blank input).
    Ignored,
    /// Another turn is generating.
    Busy,
    /// The reply was finalized (possibly empty or cut short by cancellation).
    Completed { reply: String },
    /// Generation failed; any partial reply stays visible.
    Failed(String),
}

/// Owns the conversation log and drives turns across the engines.
pub struct TurnOrchestrator {
    ctx: Arc<SessionContext>,
    store: Arc<ConversationStore>,
    assets: Arc<ModelAssetManager>,
    voice: Arc<VoiceSession>,
    log: Mutex<MessageLog>,
    state: Mutex<TurnState>,
    flags: Arc<RuntimeFlags>,
    keywords: MemoryKeywords,
    options: CompletionOptions,
    window_size: usize,
    events: broadcast::Sender<RuntimeEvent>,
}

impl TurnOrchestrator {
    /// Build the orchestrator and restore the log from the store.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Store`] if the stored log cannot be read.
    pub fn new(
        ctx: Arc<SessionContext>,
        store: Arc<ConversationStore>,
        assets: Arc<ModelAssetManager>,
        voice: Arc<VoiceSession>,
    ) -> Result<Arc<Self>> {
        let restored = store.all_messages()?;
        info!(messages = restored.len(), "conversation restored");
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let config = ctx.config();
        let orchestrator = Self {
            keywords: MemoryKeywords::from(&config.conversation),
            options: CompletionOptions::from(&config.llm),
            window_size: config.conversation.window_size,
            ctx: Arc::clone(&ctx),
            store,
            assets,
            voice,
            log: Mutex::new(MessageLog::from_messages(restored)),
            state: Mutex::new(TurnState::Idle),
            flags: Arc::new(RuntimeFlags::default()),
            events,
        };
        orchestrator.refresh_flags();
        Ok(Arc::new(orchestrator))
    }

    /// Subscribe to log and flag updates.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Copy of the current log, drafts included.
    pub fn messages(&self) -> Vec<Message> {
        self.log().messages().to_vec()
    }

    pub fn flags(&self) -> FlagSnapshot {
        self.refresh_flags();
        self.flags.snapshot()
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn assets(&self) -> &Arc<ModelAssetManager> {
        &self.assets
    }

    // -----------------------------------------------------------------------
    // Presentation entry points
    // -----------------------------------------------------------------------

    /// Send a typed message.
    pub async fn send_text(self: &Arc<Self>, text: &str) -> TurnOutcome {
        self.finalize_user_message(text).await
    }

    /// Toggle the microphone: start listening, or stop and submit what was
    /// heard so far.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Busy`] while a reply is generating,
    /// [`CompanionError::PermissionDenied`] without microphone access, or
    /// [`CompanionError::Load`] when no recognizer is available.
    pub async fn press_mic(self: &Arc<Self>) -> Result<()> {
        if self.voice.is_listening() {
            return self.stop_listening().await;
        }
        self.start_listening().await
    }

    /// Stop listening. The transcript heard so far is submitted.
    pub async fn stop_listening(&self) -> Result<()> {
        let result = self.voice.stop_recognition().await;
        if let Err(e) = &result {
            self.notify(e);
        }
        self.publish_flags();
        result
    }

    /// Flip hands-free mode. Turning it on starts listening when nothing
    /// else is happening; turning it off stops listening and speech.
    pub async fn toggle_talking_mode(self: &Arc<Self>) -> bool {
        let enabled = !self.flags.talking_mode.fetch_xor(true, Ordering::AcqRel);
        info!(enabled, "talking mode toggled");
        if enabled {
            let idle = !self.flags.is_generating()
                && !self.voice.is_listening()
                && !self.voice.is_speaking();
            if idle && self.start_listening().await.is_err() {
                self.flags.talking_mode.store(false, Ordering::Release);
            }
        } else {
            self.voice.cancel_speech().await;
            if self.voice.is_listening() {
                let _ = self.stop_listening().await;
            }
        }
        self.publish_flags();
        self.flags.talking_mode()
    }

    /// Best-effort stop of the reply being generated. The turn still
    /// finalizes whatever text had arrived.
    pub fn cancel_generation(&self) {
        // A stop pressed while idle must not cut off the next reply.
        if !self.flags.is_generating() {
            return;
        }
        if let Some(session) = self.assets.inference() {
            session.cancel();
        }
    }

    /// Replace the user profile.
    ///
    /// A new name appends the regenerated persona as a system message. A new
    /// companion voice forces the voice bundle to be fetched again.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Store`] if the profile cannot be written, or the
    /// download/load error of the new voice bundle.
    pub async fn update_profile(&self, profile: UserProfile) -> Result<()> {
        self.store.replace_profile(&profile)?;
        let previous = self.ctx.set_profile(profile.clone());
        info!(name = profile.display_name(), voice = %profile.voice(), "profile updated");

        if previous.name.trim() != profile.name.trim() && !profile.name.trim().is_empty() {
            // The stored instructions follow the new name.
            let persona = Message::new(Role::System, self.ctx.system_prompt());
            self.append_and_persist(persona);
        }

        if previous.voice() != profile.voice() {
            self.voice.cancel_speech().await;
            self.assets.set_voice(profile.voice().id());
            let reporter = self.progress_reporter();
            let result = match self
                .assets
                .force_redownload(ArtifactKind::Tts, Some(reporter))
                .await
            {
                Ok(_) => self.assets.load(ArtifactKind::Tts).await.map(|_| ()),
                Err(e) => Err(e),
            };
            self.publish_flags();
            if let Err(e) = result {
                self.notify(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Progress callback that mirrors download progress into the flags and
    /// the event stream.
    pub fn progress_reporter(&self) -> ProgressCallback {
        let events = self.events.clone();
        let flags = Arc::clone(&self.flags);
        Box::new(move |event| {
            if let ProgressEvent::DownloadProgress { artifact, percent } = event {
                flags.download_progress.store(percent, Ordering::Release);
                let _ = events.send(RuntimeEvent::DownloadProgress { artifact, percent });
            }
        })
    }

    // -----------------------------------------------------------------------
    // Turn lifecycle
    // -----------------------------------------------------------------------

    /// Run one turn for a finalized user message, typed or spoken.
    pub async fn finalize_user_message(self: &Arc<Self>, text: &str) -> TurnOutcome {
        let text = text.trim();
        if text.is_empty() {
            self.discard_user_draft();
            self.return_to_idle();
            return TurnOutcome::Ignored;
        }
        if self
            .flags
            .generating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("turn rejected, a reply is already generating");
            self.discard_user_draft();
            return TurnOutcome::Busy;
        }
        let guard = GeneratingGuard(self);
        self.publish_flags();

        let turn = uuid::Uuid::new_v4();
        info!(%turn, chars = text.len(), "turn started");

        self.commit_user_message(text);
        let outcome = self.generate_reply(turn).await;
        drop(guard);

        if let TurnOutcome::Completed { reply } = &outcome
            && !reply.is_empty()
            && self.flags.talking_mode()
        {
            self.speak_reply(reply).await;
        }
        if !self.voice.is_listening() {
            self.return_to_idle();
        }
        info!(%turn, "turn finished");
        outcome
    }

    /// Replace the user draft with the final message, persist it, and apply
    /// the memory keywords. No await happens in between, so the store and
    /// the log never disagree about the message existing.
    fn commit_user_message(&self, text: &str) {
        self.set_state(TurnState::DraftingUser);
        self.discard_user_draft();

        let remember = self.keywords.should_remember(text);
        let message = Message::new(Role::User, text).remembered(remember);
        self.append_and_persist(message);
        if remember {
            debug!("user message tagged to remember");
        }

        if self.keywords.is_forget_request(text) {
            let cleared = self.log().clear_remember_flags();
            if let Err(e) = self.store.clear_remember_flags() {
                self.notify(&CompanionError::from(e));
            }
            info!(cleared, "remembered messages forgotten");
            self.emit(RuntimeEvent::LogReset {
                messages: self.messages(),
            });
        }
    }

    async fn generate_reply(&self, turn: uuid::Uuid) -> TurnOutcome {
        let Some(session) = self.ensure_language_model().await else {
            let e = CompanionError::load(ArtifactKind::Llm, "the language model is not ready");
            self.notify(&e);
            return TurnOutcome::Failed(e.to_string());
        };

        let prompt = {
            let log = self.log();
            build_prompt_window(log.messages(), &self.ctx.system_prompt(), self.window_size)
        };
        debug!(%turn, prompt_messages = prompt.len(), "prompt window built");

        self.set_state(TurnState::Generating);
        self.upsert_draft(Role::Assistant, "");

        let result = session
            .complete(&prompt, &self.options, |visible| {
                self.upsert_draft(Role::Assistant, visible);
            })
            .await;

        match result {
            Ok(completion) => {
                if completion.finish == FinishReason::Cancelled {
                    info!(%turn, "reply cancelled");
                }
                self.finalize_assistant(&completion.text);
                TurnOutcome::Completed {
                    reply: completion.text,
                }
            }
            Err(e) => {
                error!(%turn, error = %e, "reply generation failed");
                self.keep_partial_reply();
                self.notify(&e);
                TurnOutcome::Failed(e.to_string())
            }
        }
    }

    fn finalize_assistant(&self, text: &str) {
        let mut log = self.log();
        let Some(index) = log.draft_index(Role::Assistant) else {
            return;
        };
        if text.is_empty() {
            log.remove(index);
            drop(log);
            self.emit(RuntimeEvent::MessageRemoved { index });
            return;
        }
        let Some(message) = log.finalize(index, text).cloned() else {
            return;
        };
        let stored = self.store.add_message(&message);
        if let Ok(id) = stored {
            log.set_id(index, id);
        }
        let message = log.get(index).cloned();
        drop(log);
        if let Err(e) = stored {
            self.notify(&CompanionError::from(e));
        }
        if let Some(message) = message {
            self.emit(RuntimeEvent::MessageUpserted { index, message });
        }
    }

    /// After a failure the partial reply stays on screen, frozen, but is not
    /// persisted. An empty placeholder is removed.
    fn keep_partial_reply(&self) {
        let mut log = self.log();
        let Some(index) = log.draft_index(Role::Assistant) else {
            return;
        };
        let partial = log.get(index).map(|m| m.content.clone()).unwrap_or_default();
        if partial.is_empty() {
            log.remove(index);
            drop(log);
            self.emit(RuntimeEvent::MessageRemoved { index });
        } else if let Some(message) = log.finalize(index, &partial).cloned() {
            drop(log);
            self.emit(RuntimeEvent::MessageUpserted { index, message });
        }
    }

    async fn ensure_language_model(&self) -> Option<Arc<crate::llm::InferenceSession>> {
        if let Some(session) = self.assets.inference() {
            return Some(session);
        }
        info!("language model not loaded, loading on demand");
        self.assets.try_load(ArtifactKind::Llm).await?;
        self.publish_flags();
        self.assets.inference()
    }

    // -----------------------------------------------------------------------
    // Voice
    // -----------------------------------------------------------------------

    async fn speak_reply(self: &Arc<Self>, reply: &str) {
        let Some(voice_dir) = self.ensure_voice_model().await else {
            self.flags.talking_mode.store(false, Ordering::Release);
            self.notify(&CompanionError::SpeechSynthesis(
                "the voice model is not ready".into(),
            ));
            return;
        };

        self.set_state(TurnState::Speaking);
        self.flags.speaking.store(true, Ordering::Release);
        self.emit(RuntimeEvent::Flags(self.flags.snapshot()));
        let outcome = self.voice.speak(&voice_dir, reply).await;
        self.publish_flags();

        match outcome {
            Ok(SpeechCompletion::Cancelled) => {
                info!("speech cut off, listening not re-armed");
            }
            Ok(completion) => {
                debug!(?completion, "speech complete");
                if self.flags.talking_mode()
                    && let Err(e) = self.start_listening().await
                {
                    warn!(error = %e, "could not resume listening");
                    self.flags.talking_mode.store(false, Ordering::Release);
                }
            }
            Err(e) => {
                warn!(error = %e, "speech failed, talking mode disabled");
                self.flags.talking_mode.store(false, Ordering::Release);
                self.notify(&e);
            }
        }
        self.publish_flags();
    }

    async fn ensure_voice_model(&self) -> Option<std::path::PathBuf> {
        if let Some(dir) = self.assets.voice_model_dir() {
            return Some(dir);
        }
        self.assets.try_load(ArtifactKind::Tts).await?;
        self.assets.voice_model_dir()
    }

    async fn start_listening(self: &Arc<Self>) -> Result<()> {
        if self.flags.is_generating() {
            return Err(CompanionError::Busy("a reply is generating".into()));
        }
        let recognizer = match self.assets.recognizer() {
            Some(r) => r,
            None => {
                self.assets.try_load(ArtifactKind::Stt).await;
                self.assets.recognizer().ok_or_else(|| {
                    CompanionError::load(
                        ArtifactKind::Stt,
                        "the speech recognition model is not ready",
                    )
                })?
            }
        };

        let options = self.ctx.recognition_options();
        let manual_timeout =
            (!recognizer.detects_end_of_utterance()).then_some(options.silence_window);
        let subscription = match self.voice.start_recognition(recognizer, &options).await {
            Ok(s) => s,
            Err(e) => {
                if matches!(e, CompanionError::PermissionDenied) {
                    self.flags.talking_mode.store(false, Ordering::Release);
                }
                self.notify(&e);
                self.publish_flags();
                return Err(e);
            }
        };

        self.set_state(TurnState::ListeningOrTyping);
        self.publish_flags();
        spawn_listener(Arc::clone(self), subscription, manual_timeout);
        Ok(())
    }

    /// Follow one recognition session: mirror the transcript into the user
    /// draft and submit the final transcript.
    ///
    /// Without engine end-of-utterance detection the silence timer is
    /// re-armed on every transcript update and its expiry stops recognition.
    async fn listen(self: Arc<Self>, mut subscription: RecognitionSubscription, timeout: Option<Duration>) {
        let rearm = || timeout.map(|t| Instant::now() + t);
        let mut deadline = rearm();

        loop {
            let wait = deadline;
            let silence = async move {
                match wait {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = subscription.next() => match event {
                    None => break,
                    Some(VoiceEvent::Started) => debug!("recognition started"),
                    Some(VoiceEvent::Transcript(text)) => {
                        self.upsert_draft(Role::User, &text);
                        deadline = rearm();
                    }
                    Some(VoiceEvent::Error(message)) => {
                        self.notify(&CompanionError::Recognition(message));
                    }
                    Some(VoiceEvent::Final(text)) => {
                        self.voice.recognition_ended().await;
                        self.publish_flags();
                        info!(chars = text.len(), "utterance finished");
                        self.finalize_user_message(&text).await;
                        break;
                    }
                },
                () = silence => {
                    info!("silence timeout, ending utterance");
                    deadline = None;
                    if let Err(e) = self.voice.stop_recognition().await {
                        warn!(error = %e, "recognizer did not stop on silence");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn log(&self) -> MutexGuard<'_, MessageLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upsert_draft(&self, role: Role, content: &str) {
        let mut log = self.log();
        let index = log.upsert_draft(role, content);
        let message = log.get(index).cloned();
        drop(log);
        if let Some(message) = message {
            self.emit(RuntimeEvent::MessageUpserted { index, message });
        }
    }

    fn discard_user_draft(&self) {
        let removed = self.log().take_draft(Role::User);
        if let Some((index, _)) = removed {
            self.emit(RuntimeEvent::MessageRemoved { index });
        }
    }

    /// Append a final message to the log and the store. A store failure is
    /// reported but the log keeps the message.
    fn append_and_persist(&self, message: Message) {
        let stored = self.store.add_message(&message);
        let mut log = self.log();
        let index = log.push(message);
        if let Ok(id) = stored {
            log.set_id(index, id);
        }
        let message = log.get(index).cloned();
        drop(log);
        if let Err(e) = stored {
            self.notify(&CompanionError::from(e));
        }
        if let Some(message) = message {
            self.emit(RuntimeEvent::MessageUpserted { index, message });
        }
    }

    fn set_state(&self, next: TurnState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = ?*state, to = ?next, "turn state");
            *state = next;
        }
    }

    fn return_to_idle(&self) {
        self.set_state(TurnState::Idle);
        self.publish_flags();
    }

    fn refresh_flags(&self) {
        let f = &self.flags;
        f.listening.store(self.voice.is_listening(), Ordering::Release);
        f.speaking.store(self.voice.is_speaking(), Ordering::Release);
        f.model_ready
            .store(self.assets.inference().is_some(), Ordering::Release);
    }

    fn publish_flags(&self) {
        self.refresh_flags();
        self.emit(RuntimeEvent::Flags(self.flags.snapshot()));
    }

    fn notify(&self, e: &CompanionError) {
        match e.presentation() {
            Presentation::Silent => debug!(error = %e, "suppressed error"),
            presentation => {
                warn!(error = %e, ?presentation, "error surfaced to user");
                self.emit(RuntimeEvent::Notice {
                    presentation,
                    message: e.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Clears the generating flag however the turn ends.
struct GeneratingGuard<'a>(&'a TurnOrchestrator);

impl Drop for GeneratingGuard<'_> {
    fn drop(&mut self) {
        self.0.flags.generating.store(false, Ordering::Release);
        self.0.publish_flags();
    }
}

type ListenFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Spawn the listener for one recognition session. Boxed because a turn
/// started by the listener may itself re-arm listening.
fn spawn_listener(
    orchestrator: Arc<TurnOrchestrator>,
    subscription: RecognitionSubscription,
    timeout: Option<Duration>,
) {
    let listener: ListenFuture = Box::pin(orchestrator.listen(subscription, timeout));
    tokio::spawn(listener);
}
