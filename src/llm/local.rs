//! Local GGUF inference backend via `mistralrs`.

use crate::error::{Result, UmebotError};
use crate::llm::{ChatMessage, ChatRole, LanguageModel};
use async_trait::async_trait;
use mistralrs::{
    GgufModelBuilder, MemoryGpuConfig, Model, PagedAttentionMetaBuilder, RequestBuilder, Response,
    TextMessageRole, TextMessages,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Minimum allowed context size for the local engine.
const MIN_CONTEXT_SIZE_TOKENS: usize = 1024;

/// In-process GGUF adapter.
pub struct LocalBackend {
    model: Arc<Model>,
    model_label: String,
    max_tokens: usize,
    temperature: f64,
}

impl LocalBackend {
    /// Load a GGUF model from `model_path`.
    ///
    /// `chat_format` is informational: mistralrs reads the chat template from
    /// GGUF metadata, so a mismatching hint only produces a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or the engine fails to load.
    pub async fn load(
        model_path: &Path,
        context_size: usize,
        chat_format: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<Self> {
        if !model_path.is_file() {
            return Err(UmebotError::Config(format!(
                "local model file not found: {}",
                model_path.display()
            )));
        }
        let dir = model_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_owned());
        let file = model_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UmebotError::Config(format!("invalid model path: {}", model_path.display()))
            })?;

        let context_size = context_size.max(MIN_CONTEXT_SIZE_TOKENS);
        info!("loading local GGUF model {file} (context {context_size} tokens)");
        if !chat_format.is_empty() {
            warn!("chat_format '{chat_format}' is a hint only; the GGUF chat template wins");
        }

        let model = GgufModelBuilder::new(&dir, vec![&file])
            .with_logging()
            .with_paged_attn(|| {
                PagedAttentionMetaBuilder::default()
                    .with_gpu_memory(MemoryGpuConfig::ContextSize(context_size))
                    .build()
            })
            .map_err(|e| UmebotError::Llm(format!("paged attention config failed: {e}")))?
            .build()
            .await
            .map_err(|e| UmebotError::Llm(format!("GGUF model load failed: {e}")))?;

        info!("local model loaded");
        Ok(Self {
            model: Arc::new(model),
            model_label: file,
            max_tokens,
            temperature,
        })
    }
}

fn to_engine_role(role: ChatRole) -> TextMessageRole {
    match role {
        ChatRole::System => TextMessageRole::System,
        ChatRole::User => TextMessageRole::User,
        ChatRole::Assistant => TextMessageRole::Assistant,
    }
}

#[async_trait]
impl LanguageModel for LocalBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<Option<String>> {
        // Image parts are dropped; the local engine is text-only.
        let mut engine_messages = TextMessages::new();
        for message in messages {
            engine_messages = engine_messages.add_message(
                to_engine_role(message.role),
                message.content.flattened_text(),
            );
        }

        let request = RequestBuilder::from(engine_messages)
            .set_sampler_temperature(self.temperature)
            .set_sampler_max_len(self.max_tokens);

        let started = Instant::now();
        let model = Arc::clone(&self.model);
        let mut stream = model
            .stream_chat_request(request)
            .await
            .map_err(|e| UmebotError::Llm(format!("stream request failed: {e}")))?;

        let mut generated = String::new();
        while let Some(response) = stream.next().await {
            match response {
                Response::Chunk(chunk) => {
                    if let Some(choice) = chunk.choices.first() {
                        if let Some(content) = choice.delta.content.as_deref() {
                            generated.push_str(content);
                        }
                    }
                }
                Response::Done(done) => {
                    if let Some(choice) = done.choices.first() {
                        if let Some(content) = choice.message.content.as_deref() {
                            if generated.is_empty() {
                                generated.push_str(content);
                            }
                        }
                    }
                    break;
                }
                Response::ModelError(msg, _) => {
                    return Err(UmebotError::Llm(format!("model error: {msg}")));
                }
                Response::InternalError(e) => {
                    return Err(UmebotError::Llm(format!("internal error: {e}")));
                }
                Response::ValidationError(e) => {
                    return Err(UmebotError::Llm(format!("validation error: {e}")));
                }
                _ => {}
            }
        }

        info!(
            "local generation finished in {:.1}s ({} chars)",
            started.elapsed().as_secs_f64(),
            generated.len()
        );

        let trimmed = generated.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.to_owned()))
    }

    fn descriptor(&self) -> String {
        format!("local_{}", self.model_label)
    }
}
