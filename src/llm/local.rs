//! Local GGUF inference via `mistralrs`.

use super::{CompletionEngine, CompletionOptions, TokenStream};
use crate::config::LlmConfig;
use crate::error::{CompanionError, Result};
use crate::message::{ChatMessage, Role};
use crate::models::ArtifactKind;
use mistralrs::{
    GgufModelBuilder, MemoryGpuConfig, Model, PagedAttentionMetaBuilder, RequestBuilder, Response,
    TextMessageRole, TextMessages,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Minimum allowed local context size.
const MIN_CONTEXT_SIZE_TOKENS: usize = 1024;

/// A GGUF model loaded into memory.
pub struct LocalEngine {
    model: Arc<Model>,
}

impl LocalEngine {
    /// Load the GGUF file at `weights` onto the best available device
    /// (Metal on Apple Silicon, CPU otherwise).
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Load`] with the engine's message if the
    /// file cannot be parsed or the model cannot be built.
    pub async fn load(weights: &Path, config: &LlmConfig) -> Result<Self> {
        let dir = weights
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| CompanionError::load(ArtifactKind::Llm, "weights path has no parent"))?;
        let file = weights
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| CompanionError::load(ArtifactKind::Llm, "weights path has no file name"))?;

        let context_size = config.context_size_tokens.max(MIN_CONTEXT_SIZE_TOKENS);
        info!(dir = %dir, file = %file, context_size, "loading local LLM");

        let model = GgufModelBuilder::new(&dir, vec![&file])
            .with_logging()
            .with_paged_attn(|| {
                PagedAttentionMetaBuilder::default()
                    .with_gpu_memory(MemoryGpuConfig::ContextSize(context_size))
                    .build()
            })
            .map_err(|e| {
                CompanionError::load(ArtifactKind::Llm, format!("paged attention config failed: {e}"))
            })?
            .build()
            .await
            .map_err(|e| CompanionError::load(ArtifactKind::Llm, format!("model build failed: {e}")))?;

        info!("local LLM loaded");
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

fn role_of(role: Role) -> TextMessageRole {
    match role {
        Role::System => TextMessageRole::System,
        Role::User => TextMessageRole::User,
        Role::Assistant => TextMessageRole::Assistant,
    }
}

#[async_trait::async_trait]
impl CompletionEngine for LocalEngine {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream> {
        let mut text_messages = TextMessages::new().enable_thinking(false);
        for m in messages {
            text_messages = text_messages.add_message(role_of(m.role), &m.content);
        }

        let request = RequestBuilder::from(text_messages)
            .set_sampler_temperature(options.temperature)
            .set_sampler_topp(options.top_p)
            .set_sampler_max_len(options.max_tokens)
            .enable_thinking(false);

        let model = Arc::clone(&self.model);
        let tokens = async_stream::stream! {
            let mut stream = match model.stream_chat_request(request).await {
                Ok(s) => s,
                Err(e) => {
                    yield Err(CompanionError::Inference(format!("stream request failed: {e}")));
                    return;
                }
            };

            while let Some(response) = stream.next().await {
                match response {
                    Response::Chunk(chunk) => {
                        if let Some(content) = chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_deref())
                            .filter(|c| !c.is_empty())
                        {
                            yield Ok(content.to_owned());
                        }
                    }
                    Response::Done(done) => {
                        if let Some(content) = done
                            .choices
                            .first()
                            .and_then(|c| c.message.content.as_deref())
                            .filter(|c| !c.is_empty())
                        {
                            yield Ok(content.to_owned());
                        }
                        break;
                    }
                    Response::ModelError(msg, _) => {
                        yield Err(CompanionError::Inference(format!("model error: {msg}")));
                        break;
                    }
                    Response::InternalError(e) => {
                        yield Err(CompanionError::Inference(format!("internal error: {e}")));
                        break;
                    }
                    Response::ValidationError(e) => {
                        yield Err(CompanionError::Inference(format!("validation error: {e}")));
                        break;
                    }
                    _ => {}
                }
            }
        };

        Ok(Box::pin(tokens))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn roles_map_to_chat_template_roles() {
        assert!(matches!(role_of(Role::System), TextMessageRole::System));
        assert!(matches!(role_of(Role::User), TextMessageRole::User));
        assert!(matches!(role_of(Role::Assistant), TextMessageRole::Assistant));
    }
}
