//! Cloud chat-completions backend.
//!
//! Talks to any server exposing the OpenAI-compatible `/chat/completions`
//! endpoint. User messages may carry multimodal content lists when the tablet
//! attaches images.

use crate::error::{Result, UmebotError};
use crate::llm::{ChatMessage, ContentPart, LanguageModel, MessageContent};
use async_trait::async_trait;
use tracing::{debug, info};

/// Remote chat-completions adapter.
pub struct CloudBackend {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model_name: String,
    max_tokens: usize,
    temperature: f64,
}

impl CloudBackend {
    pub fn new(
        api_url: String,
        api_key: String,
        model_name: String,
        max_tokens: usize,
        temperature: f64,
    ) -> Self {
        info!("cloud backend ready: {model_name} via {api_url}");
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_key,
            model_name,
            max_tokens,
            temperature,
        }
    }

    fn render_content(content: &MessageContent) -> serde_json::Value {
        match content {
            MessageContent::Text(text) => serde_json::Value::String(text.clone()),
            MessageContent::Parts(parts) => {
                let rendered: Vec<serde_json::Value> = parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => serde_json::json!({
                            "type": "text",
                            "text": text,
                        }),
                        ContentPart::ImageUrl { url } => serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": url },
                        }),
                    })
                    .collect();
                serde_json::Value::Array(rendered)
            }
        }
    }

    fn build_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .map(|message| {
                serde_json::json!({
                    "role": message.role.as_str(),
                    "content": Self::render_content(&message.content),
                })
            })
            .collect();

        serde_json::json!({
            "model": self.model_name,
            "messages": rendered,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl LanguageModel for CloudBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<Option<String>> {
        let base = self.api_url.trim_end_matches('/');
        let url = format!("{base}/chat/completions");
        let body = self.build_body(messages);
        debug!("cloud request: {} messages to {url}", messages.len());

        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UmebotError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| UmebotError::Llm(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let detail = payload["error"]["message"]
                .as_str()
                .unwrap_or("no detail")
                .to_owned();
            return Err(UmebotError::Llm(format!("API status {status}: {detail}")));
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_owned();

        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    fn descriptor(&self) -> String {
        format!("cloud_{}", self.model_name)
    }

    fn supports_images(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::llm::ChatRole;

    #[test]
    fn body_renders_parts_for_multimodal_turns() {
        let backend = CloudBackend::new(
            "https://example.invalid/v1".to_owned(),
            "key".to_owned(),
            "test-model".to_owned(),
            128,
            0.5,
        );
        let messages = vec![
            ChatMessage::text(ChatRole::System, "sys"),
            ChatMessage {
                role: ChatRole::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "que ves".to_owned(),
                    },
                    ContentPart::ImageUrl {
                        url: "data:image/jpeg;base64,abcd".to_owned(),
                    },
                ]),
            },
        ];
        let body = backend.build_body(&messages);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(body["model"], "test-model");
    }
}
