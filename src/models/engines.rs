//! Construction of engines from validated artifacts.

use crate::config::{LlmConfig, SttConfig};
use crate::error::{CompanionError, Result};
use crate::llm::{CompletionEngine, LocalEngine};
use crate::models::ArtifactKind;
use crate::voice::{SpeechRecognizer, WhisperRecognizer};
use std::path::Path;
use std::sync::Arc;

/// Builds engines from artifact paths. Tests swap in fakes here.
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    async fn load_language_model(&self, weights: &Path) -> Result<Arc<dyn CompletionEngine>>;
    async fn load_recognizer(&self, weights: &Path) -> Result<Arc<dyn SpeechRecognizer>>;
}

/// mistral.rs for the language model, whisper.cpp for recognition.
pub struct NativeEngines {
    llm: LlmConfig,
    stt: SttConfig,
}

impl NativeEngines {
    pub fn new(llm: &LlmConfig, stt: &SttConfig) -> Self {
        Self {
            llm: llm.clone(),
            stt: stt.clone(),
        }
    }
}

#[async_trait::async_trait]
impl EngineFactory for NativeEngines {
    async fn load_language_model(&self, weights: &Path) -> Result<Arc<dyn CompletionEngine>> {
        let engine = LocalEngine::load(weights, &self.llm).await?;
        Ok(Arc::new(engine))
    }

    async fn load_recognizer(&self, weights: &Path) -> Result<Arc<dyn SpeechRecognizer>> {
        let weights = weights.to_path_buf();
        let config = self.stt.clone();
        let recognizer = tokio::task::spawn_blocking(move || WhisperRecognizer::load(&weights, &config))
            .await
            .map_err(|e| CompanionError::load(ArtifactKind::Stt, format!("load task failed: {e}")))??;
        Ok(Arc::new(recognizer))
    }
}
