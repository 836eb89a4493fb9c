//! Scripted engines and fixtures shared by the integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use sam::config::CompanionConfig;
use sam::llm::{CompletionEngine, CompletionOptions, TokenStream};
use sam::message::ChatMessage;
use sam::models::{EngineFactory, ModelAssetManager, TargetPlatform};
use sam::permissions::PermissionGate;
use sam::pipeline::TurnOrchestrator;
use sam::profile::UserProfile;
use sam::session::SessionContext;
use sam::store::ConversationStore;
use sam::voice::{
    RecognitionEvent, RecognitionOptions, SpeechRecognizer, SpeechSynthesizer, Utterance,
    VoiceSession,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Replays one token list per completion, optionally pausing between tokens.
#[derive(Default)]
pub struct TokenEngine {
    replies: Mutex<VecDeque<Vec<&'static str>>>,
    pause: Duration,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl TokenEngine {
    pub fn new(replies: Vec<Vec<&'static str>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

#[async_trait::async_trait]
impl CompletionEngine for TokenEngine {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> sam::Result<TokenStream> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let tokens = self.replies.lock().unwrap().pop_front().unwrap_or_default();
        let pause = self.pause;
        Ok(Box::pin(async_stream::stream! {
            for token in tokens {
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                yield Ok(token.to_owned());
            }
        }))
    }
}

/// Recognizer the test speaks through.
#[derive(Default)]
pub struct PushRecognizer {
    sender: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
    heard: Mutex<String>,
    pub starts: AtomicUsize,
}

impl PushRecognizer {
    pub fn hear(&self, text: &str) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(RecognitionEvent::Partial(text.to_owned()));
        }
        *self.heard.lock().unwrap() = text.to_owned();
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for PushRecognizer {
    async fn start(
        &self,
        _options: &RecognitionOptions,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> sam::Result<()> {
        self.heard.lock().unwrap().clear();
        let _ = events.send(RecognitionEvent::Started);
        *self.sender.lock().unwrap() = Some(events);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> sam::Result<()> {
        if let Some(tx) = self.sender.lock().unwrap().take() {
            let _ = tx.send(RecognitionEvent::End(self.heard.lock().unwrap().clone()));
        }
        Ok(())
    }

    fn detects_end_of_utterance(&self) -> bool {
        false
    }
}

/// Synthesizer without level telemetry, so completion falls back to the
/// duration estimate.
#[derive(Default)]
pub struct MuteSynthesizer {
    pub spoken: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SpeechSynthesizer for MuteSynthesizer {
    async fn begin(&self, _voice_model: &Path, text: &str) -> sam::Result<Utterance> {
        self.spoken.lock().unwrap().push(text.to_owned());
        Ok(Utterance::default())
    }

    async fn cancel(&self) {}
}

pub struct Engines {
    pub llm: Arc<TokenEngine>,
    pub recognizer: Arc<PushRecognizer>,
    pub llm_loads: AtomicUsize,
}

#[async_trait::async_trait]
impl EngineFactory for Engines {
    async fn load_language_model(&self, _weights: &Path) -> sam::Result<Arc<dyn CompletionEngine>> {
        self.llm_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.llm.clone() as Arc<dyn CompletionEngine>)
    }

    async fn load_recognizer(&self, _weights: &Path) -> sam::Result<Arc<dyn SpeechRecognizer>> {
        Ok(self.recognizer.clone() as Arc<dyn SpeechRecognizer>)
    }
}

/// Write files that satisfy every default validity rule. The weight files
/// are sparse, so nothing large is actually written.
pub fn stage_models(dir: &Path, voice: &str) {
    std::fs::create_dir_all(dir).unwrap();
    for (name, len) in [
        ("Llama-3.2-1B-Instruct-Q4_0.gguf", 500_000_001u64),
        ("ggml-base.en.bin", 100_000_001),
    ] {
        std::fs::File::create(dir.join(name))
            .unwrap()
            .set_len(len)
            .unwrap();
    }
    let bundle = dir.join("tts_models");
    std::fs::create_dir_all(&bundle).unwrap();
    for name in ["kokoro.onnx", "tokenizer.json", &format!("{voice}.bin")] {
        std::fs::write(bundle.join(name), b"x").unwrap();
    }
}

/// Zip holding a complete voice bundle.
pub fn voice_bundle_zip(voice: &str) -> Vec<u8> {
    use std::io::Write as _;
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in [
            ("kokoro.onnx".to_owned(), b"onnx".as_slice()),
            ("tokenizer.json".to_owned(), b"{}".as_slice()),
            (format!("{voice}.bin"), b"0000".as_slice()),
        ] {
            zip.start_file(name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }
    buf.into_inner()
}

pub struct Fixture {
    pub orch: Arc<TurnOrchestrator>,
    pub store: Arc<ConversationStore>,
    pub assets: Arc<ModelAssetManager>,
    pub engines: Arc<Engines>,
    pub synth: Arc<MuteSynthesizer>,
    pub dir: tempfile::TempDir,
}

pub async fn fixture(llm: TokenEngine, base_url: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CompanionConfig::default();
    config.models.models_dir = dir.path().join("models");
    config.models.base_url = base_url.to_owned();
    config.store.database_path = dir.path().join("chatSam.db");
    config.stt.silence_timeout_ms = 150;
    config.tts.timing.per_word_ms = 5;
    config.tts.timing.per_punctuation_ms = 0;
    config.tts.timing.floor_ms = 20;

    let profile = UserProfile::new("Ada", "kind", "curious", "female", "us");
    let voice_id = profile.voice().id();
    stage_models(&config.models.models_dir, voice_id);

    let engines = Arc::new(Engines {
        llm: Arc::new(llm),
        recognizer: Arc::new(PushRecognizer::default()),
        llm_loads: AtomicUsize::new(0),
    });
    let assets = Arc::new(
        ModelAssetManager::new(&config.models, voice_id, engines.clone())
            .unwrap()
            .with_platform(TargetPlatform::Other),
    );
    let report = sam::startup::prepare(&assets, None).await;
    assert!(report.is_ready(), "{:?}", report.messages());

    let store = Arc::new(ConversationStore::open(&config.store.database_path).unwrap());
    store.replace_profile(&profile).unwrap();
    let synth = Arc::new(MuteSynthesizer::default());
    let voice = Arc::new(VoiceSession::new(
        synth.clone(),
        PermissionGate::default(),
        &config.tts,
    ));
    let ctx = Arc::new(SessionContext::new(config, profile));
    let orch = TurnOrchestrator::new(ctx, store.clone(), assets.clone(), voice).unwrap();
    Fixture {
        orch,
        store,
        assets,
        engines,
        synth,
        dir,
    }
}

/// Poll `cond` until it holds.
pub async fn until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
