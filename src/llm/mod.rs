//! Language model backends.
//!
//! The conversation core talks to exactly one active backend through the
//! [`LanguageModel`] trait: a remote chat-completions API ([`cloud`]), an
//! in-process GGUF engine ([`local`]), or none at all. Switching backends
//! disposes the previous adapter.

pub mod cloud;
pub mod local;

use crate::config::LlmConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Chat role for prompt messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Wire name used by chat-completions APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One content part of a multimodal user message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text { text: String },
    /// Image reference, typically a `data:` URI from the tablet.
    ImageUrl { url: String },
}

/// Message content: plain text, or parts when images are attached.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text-only view of the content; image parts are skipped.
    pub fn flattened_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One ordered prompt message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// A black-box text generator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a response for the ordered message sequence.
    ///
    /// Returns `None` when the backend produced an empty response.
    ///
    /// # Errors
    ///
    /// Returns an error when generation fails; callers convert this into a
    /// spoken apology rather than propagating it.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<Option<String>>;

    /// `<backend>_<model>` label recorded on persisted assistant turns.
    fn descriptor(&self) -> String;

    /// Whether image content parts are forwarded to the model.
    fn supports_images(&self) -> bool {
        false
    }
}

/// Backend selection with its per-variant settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LmBackendSpec {
    Cloud {
        api_key: String,
        model_name: String,
    },
    Local {
        model_path: PathBuf,
        context_size: usize,
        chat_format: String,
    },
    None,
}

impl LmBackendSpec {
    /// Spec for the backend named in the startup config.
    pub fn from_config(config: &LlmConfig) -> Self {
        match config.backend {
            crate::config::LmBackendKind::Cloud => Self::Cloud {
                api_key: config.api_key.clone(),
                model_name: config.model_name.clone(),
            },
            crate::config::LmBackendKind::Local => Self::Local {
                model_path: config.model_path.clone(),
                context_size: config.context_size,
                chat_format: config.chat_format.clone(),
            },
            crate::config::LmBackendKind::None => Self::None,
        }
    }

    /// Wire name (`"cloud"`, `"local"`, `"none"`).
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Cloud { .. } => "cloud",
            Self::Local { .. } => "local",
            Self::None => "none",
        }
    }
}

/// Build the adapter for a backend spec. `None` yields no adapter.
///
/// # Errors
///
/// Returns an error when the backend cannot be constructed (for the local
/// variant, when the model fails to load).
pub async fn build_backend(
    spec: &LmBackendSpec,
    config: &LlmConfig,
) -> Result<Option<Arc<dyn LanguageModel>>> {
    match spec {
        LmBackendSpec::Cloud {
            api_key,
            model_name,
        } => {
            let backend = cloud::CloudBackend::new(
                config.api_url.clone(),
                api_key.clone(),
                model_name.clone(),
                config.max_tokens,
                config.temperature,
            );
            Ok(Some(Arc::new(backend)))
        }
        LmBackendSpec::Local {
            model_path,
            context_size,
            chat_format,
        } => {
            let backend = local::LocalBackend::load(
                model_path,
                *context_size,
                chat_format,
                config.max_tokens,
                config.temperature,
            )
            .await?;
            Ok(Some(Arc::new(backend)))
        }
        LmBackendSpec::None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattened_text_skips_images() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "mira esto".to_owned(),
            },
            ContentPart::ImageUrl {
                url: "data:image/png;base64,xxxx".to_owned(),
            },
        ]);
        assert_eq!(content.flattened_text(), "mira esto");
    }

    #[test]
    fn spec_kind_names() {
        assert_eq!(LmBackendSpec::None.kind_str(), "none");
        let cloud = LmBackendSpec::Cloud {
            api_key: String::new(),
            model_name: "m".to_owned(),
        };
        assert_eq!(cloud.kind_str(), "cloud");
    }
}
