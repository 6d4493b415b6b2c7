//! Contextual prompt assembly.
//!
//! Builds the ordered message sequence sent to the active LM backend: one
//! system message (personality, retrieved knowledge, file context, footer),
//! the recent interaction history, and the new user message. Building is
//! CPU-bound and runs off the orchestrator loop.

use crate::llm::{ChatMessage, ChatRole, ContentPart, MessageContent};
use crate::personality::Personality;
use crate::store::{Role, StoredInteraction};
use chrono::Local;

/// Instruction footer appended to every system message.
///
/// Keeps the animation-tag convention a plain string contract between the
/// prompt and the expression controller.
fn footer(robot_name: &str) -> String {
    let now = Local::now();
    format!(
        "Intercala tags de animacion con la forma ^runTag(nombre_animacion) \
         donde suene natural, por ejemplo ^runTag(affirmative_context) al asentir. \
         Responde siempre como {robot_name}.\n\
         Fecha y hora actual: {} {}",
        now.format("%Y-%m-%d"),
        now.format("%H:%M")
    )
}

/// Assemble the system message content.
pub fn system_message(
    personality: &Personality,
    knowledge_snippets: &[String],
    file_context: Option<&str>,
) -> String {
    let mut parts = vec![personality.system_prompt.clone()];

    if !knowledge_snippets.is_empty() {
        parts.push(format!(
            "[INFORMACION DE CONTEXTO ADICIONAL (usar si es relevante)]:\n{}",
            knowledge_snippets.join("\n")
        ));
    }
    if let Some(context) = file_context {
        let context = context.trim();
        if !context.is_empty() {
            parts.push(format!(
                "[INFORMACION DE ARCHIVOS ADJUNTOS EN ESTA CONVERSACION]:\n{context}"
            ));
        }
    }
    parts.push(footer(&personality.robot_name));
    parts.join("\n\n")
}

/// Extract the display text from a stored interaction's opaque content JSON.
///
/// Content blobs are `{type, timestamp_original, payload_data: {text, ...}}`;
/// anything unparseable falls back to the raw string so old rows still show.
pub fn interaction_text(content: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
        return content.to_owned();
    };
    value["payload_data"]["text"]
        .as_str()
        .map(str::to_owned)
        .unwrap_or_else(|| content.to_owned())
}

/// Build the full prompt sequence for one request.
///
/// `history` is chronological. When `images` is non-empty and the backend is
/// multimodal, the user turn becomes a content-part list; otherwise images
/// are dropped and the turn is plain text.
pub fn build_messages(
    personality: &Personality,
    knowledge_snippets: &[String],
    file_context: Option<&str>,
    history: &[StoredInteraction],
    user_input: &str,
    images: &[String],
    multimodal: bool,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::text(
        ChatRole::System,
        system_message(personality, knowledge_snippets, file_context),
    ));

    for interaction in history {
        let role = match interaction.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
            Role::System => ChatRole::System,
        };
        messages.push(ChatMessage::text(role, interaction_text(&interaction.content)));
    }

    let user_content = if multimodal && !images.is_empty() {
        let mut parts = vec![ContentPart::Text {
            text: user_input.to_owned(),
        }];
        parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
            url: url.clone(),
        }));
        MessageContent::Parts(parts)
    } else {
        MessageContent::Text(user_input.to_owned())
    };
    messages.push(ChatMessage {
        role: ChatRole::User,
        content: user_content,
    });

    messages
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn personality() -> Personality {
        Personality {
            key: "test".to_owned(),
            display_name: "Test".to_owned(),
            robot_name: "Testbot".to_owned(),
            system_prompt: "Eres un robot de prueba.".to_owned(),
        }
    }

    #[test]
    fn system_message_carries_footer_and_context() {
        let text = system_message(
            &personality(),
            &["Contexto relevante (x)".to_owned()],
            Some("archivo.txt: hola"),
        );
        assert!(text.starts_with("Eres un robot de prueba."));
        assert!(text.contains("Contexto relevante"));
        assert!(text.contains("archivo.txt"));
        assert!(text.contains("^runTag(nombre_animacion)"));
        assert!(text.contains("Testbot"));
    }

    #[test]
    fn interaction_text_unwraps_payload() {
        let content = r#"{"type":"input","timestamp_original":"t","payload_data":{"text":"hola","source":"gui"}}"#;
        assert_eq!(interaction_text(content), "hola");
        assert_eq!(interaction_text("not json"), "not json");
    }

    #[test]
    fn images_become_parts_only_when_multimodal() {
        let images = vec!["data:image/png;base64,x".to_owned()];
        let with = build_messages(&personality(), &[], None, &[], "mira", &images, true);
        assert!(matches!(
            with.last().unwrap().content,
            MessageContent::Parts(_)
        ));

        let without = build_messages(&personality(), &[], None, &[], "mira", &images, false);
        assert!(matches!(
            without.last().unwrap().content,
            MessageContent::Text(_)
        ));
    }

    #[test]
    fn history_precedes_user_turn() {
        let history = vec![
            StoredInteraction {
                role: Role::User,
                content: r#"{"payload_data":{"text":"antes"}}"#.to_owned(),
            },
            StoredInteraction {
                role: Role::Assistant,
                content: r#"{"payload_data":{"text":"respuesta"}}"#.to_owned(),
            },
        ];
        let messages = build_messages(&personality(), &[], None, &history, "ahora", &[], false);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].content.flattened_text(), "antes");
        assert_eq!(messages[3].content.flattened_text(), "ahora");
    }
}
