//! Conversation core: current conversation, personality, LM backend.
//!
//! Owns the conversational state and turns recognized utterances or GUI text
//! into annotated responses. Every failure on this path comes back as a
//! spoken, animation-tagged sentence; only a missing store propagates as an
//! error at construction time.

pub mod knowledge;
pub mod prompt;

use crate::config::{ConversationConfig, LlmConfig};
use crate::error::{Result, UmebotError};
use crate::llm::{build_backend, LanguageModel, LmBackendSpec};
use crate::personality::Personality;
use crate::store::{InteractionStore, Role};
use chrono::{SecondsFormat, Utc};
use knowledge::KnowledgeBase;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Spoken fallback when no backend is configured.
const NO_BACKEND_REPLY: &str = "^runTag(explanation_1) Lo siento, ahora mismo no tengo un \
                                modelo de lenguaje configurado, asi que no puedo responder a eso.";

/// Spoken fallback when no conversation is active.
const NO_CONVERSATION_REPLY: &str = "^runTag(embarrassed_1) Perdona, todavia no he podido \
                                     abrir una conversacion. Intentalo de nuevo en un momento.";

/// Spoken apology when the backend fails or returns nothing.
const BACKEND_ERROR_REPLY: &str = "^runTag(embarrassed_1) Vaya, he tenido un problema al \
                                   pensar mi respuesta. Puedes repetirmelo?";

/// Label recorded when no model produced the persisted assistant turn.
const FALLBACK_MODEL_LABEL: &str = "fallback_empty";

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn user_content_json(text: &str, source: &str) -> String {
    serde_json::json!({
        "type": "input",
        "timestamp_original": now_iso(),
        "payload_data": { "text": text, "source": source },
    })
    .to_string()
}

fn assistant_content_json(text: &str, model_used: &str) -> String {
    serde_json::json!({
        "type": "output",
        "timestamp_original": now_iso(),
        "payload_data": { "text": text, "model_used": model_used },
    })
    .to_string()
}

/// Conversation state owner (current conversation, personality, backend).
pub struct ConversationCore {
    store: Arc<InteractionStore>,
    knowledge: Arc<KnowledgeBase>,
    personalities: BTreeMap<String, Personality>,
    config: ConversationConfig,
    llm_config: LlmConfig,
    current_personality: Mutex<String>,
    current_conversation: Mutex<Option<i64>>,
    backend: RwLock<Option<Arc<dyn LanguageModel>>>,
    backend_kind: Mutex<&'static str>,
}

impl ConversationCore {
    /// Build the core with its catalogue and store.
    ///
    /// # Errors
    ///
    /// Returns an error if the default personality key is unknown.
    pub fn new(
        config: ConversationConfig,
        llm_config: LlmConfig,
        store: Arc<InteractionStore>,
        personalities: BTreeMap<String, Personality>,
        knowledge: KnowledgeBase,
    ) -> Result<Self> {
        if !personalities.contains_key(&config.default_personality) {
            return Err(UmebotError::Config(format!(
                "unknown default personality '{}'",
                config.default_personality
            )));
        }
        let default_personality = config.default_personality.clone();
        Ok(Self {
            store,
            knowledge: Arc::new(knowledge),
            personalities,
            config,
            llm_config,
            current_personality: Mutex::new(default_personality),
            current_conversation: Mutex::new(None),
            backend: RwLock::new(None),
            backend_kind: Mutex::new("none"),
        })
    }

    /// Keys of all loaded personalities.
    pub fn available_personalities(&self) -> Vec<String> {
        self.personalities.keys().cloned().collect()
    }

    /// Key of the active personality.
    pub fn current_personality_key(&self) -> String {
        self.current_personality
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Wire name of the active backend (`"cloud"`, `"local"`, `"none"`).
    pub fn current_backend_kind(&self) -> &'static str {
        self.backend_kind.lock().map(|guard| *guard).unwrap_or("none")
    }

    /// Switch the active personality. Does not start a new conversation.
    ///
    /// Returns false when the key is unknown; the previous personality stays.
    pub fn set_personality(&self, key: &str) -> bool {
        if !self.personalities.contains_key(key) {
            warn!("rejecting unknown personality '{key}'");
            return false;
        }
        if let Ok(mut guard) = self.current_personality.lock() {
            *guard = key.to_owned();
            info!("active personality: {key}");
            return true;
        }
        false
    }

    /// Switch the active LM backend, disposing the previous adapter.
    ///
    /// Returns false when construction fails; the previous backend stays.
    pub async fn set_backend(&self, spec: LmBackendSpec) -> bool {
        let kind = spec.kind_str();
        match build_backend(&spec, &self.llm_config).await {
            Ok(adapter) => {
                *self.backend.write().await = adapter;
                if let Ok(mut guard) = self.backend_kind.lock() {
                    *guard = kind;
                }
                info!("active LM backend: {kind}");
                true
            }
            Err(e) => {
                error!("backend switch to '{kind}' failed: {e}");
                false
            }
        }
    }

    /// Start a new conversation and make it current.
    ///
    /// # Errors
    ///
    /// Returns an error if the store insert fails.
    pub async fn start_new_conversation(&self, summary: Option<String>) -> Result<i64> {
        let store = Arc::clone(&self.store);
        let user_id = self.config.user_id.clone();
        let id = tokio::task::spawn_blocking(move || {
            store.start_conversation(summary.as_deref(), &user_id)
        })
        .await
        .map_err(|e| UmebotError::Conversation(format!("store task failed: {e}")))??;

        if let Ok(mut guard) = self.current_conversation.lock() {
            *guard = Some(id);
        }
        info!("conversation {id} started");
        Ok(id)
    }

    /// Id of the current conversation, if one is active.
    pub fn current_conversation_id(&self) -> Option<i64> {
        self.current_conversation.lock().ok().and_then(|guard| *guard)
    }

    fn active_personality(&self) -> Personality {
        let key = self.current_personality_key();
        self.personalities
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.personalities.values().next().cloned().unwrap_or(
                Personality {
                    key: "umebot".to_owned(),
                    display_name: "Umebot".to_owned(),
                    robot_name: "Umebot".to_owned(),
                    system_prompt: String::new(),
                },
            ))
    }

    async fn persist(&self, conversation_id: i64, role: Role, content: String) {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || {
            store.add_interaction(conversation_id, role, &content)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to persist {} turn: {e}", role.as_str()),
            Err(e) => error!("persist task failed: {e}"),
        }
    }

    /// Produce the annotated response for one user input.
    ///
    /// Always returns something to say. When a conversation is active, the
    /// user turn and the assistant turn (including apologies) are persisted
    /// in that order before this returns.
    pub async fn get_response(&self, user_input: &str, source: &str, images: &[String]) -> String {
        let Some(conversation_id) = self.current_conversation_id() else {
            warn!("input with no active conversation, replying with fallback");
            return NO_CONVERSATION_REPLY.to_owned();
        };

        let backend = self.backend.read().await.clone();
        let Some(backend) = backend else {
            self.persist(
                conversation_id,
                Role::User,
                user_content_json(user_input, source),
            )
            .await;
            self.persist(
                conversation_id,
                Role::Assistant,
                assistant_content_json(NO_BACKEND_REPLY, FALLBACK_MODEL_LABEL),
            )
            .await;
            return NO_BACKEND_REPLY.to_owned();
        };

        // Prompt assembly is CPU-bound (store read + retrieval) and runs off
        // the orchestrator loop. It reads history before the new user turn is
        // recorded, so the input appears in the prompt exactly once.
        let store = Arc::clone(&self.store);
        let knowledge = Arc::clone(&self.knowledge);
        let personality = self.active_personality();
        let history_limit = self.config.history_limit;
        let top_k = self.config.knowledge_top_k;
        let file_context = self.config.file_context.clone();
        let input_for_prompt = user_input.to_owned();
        let images_for_prompt = images.to_vec();
        let multimodal = backend.supports_images();

        let messages = tokio::task::spawn_blocking(move || {
            let history = store
                .get_interactions(conversation_id, history_limit)
                .unwrap_or_else(|e| {
                    warn!("history read failed, prompting without it: {e}");
                    Vec::new()
                });
            let snippets = knowledge.retrieve(&input_for_prompt, top_k);
            prompt::build_messages(
                &personality,
                &snippets,
                file_context.as_deref(),
                &history,
                &input_for_prompt,
                &images_for_prompt,
                multimodal,
            )
        })
        .await;

        // User turn recorded after prompt assembly, in strict request order
        // (the caller's busy interlock serializes turns).
        self.persist(
            conversation_id,
            Role::User,
            user_content_json(user_input, source),
        )
        .await;

        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                error!("prompt build task failed: {e}");
                self.persist(
                    conversation_id,
                    Role::Assistant,
                    assistant_content_json(BACKEND_ERROR_REPLY, FALLBACK_MODEL_LABEL),
                )
                .await;
                return BACKEND_ERROR_REPLY.to_owned();
            }
        };

        let (reply, model_used) = match backend.generate(&messages).await {
            Ok(Some(text)) => (text, backend.descriptor()),
            Ok(None) => {
                warn!("backend returned an empty response");
                (BACKEND_ERROR_REPLY.to_owned(), FALLBACK_MODEL_LABEL.to_owned())
            }
            Err(e) => {
                error!("backend generation failed: {e}");
                (BACKEND_ERROR_REPLY.to_owned(), backend.descriptor())
            }
        };

        self.persist(
            conversation_id,
            Role::Assistant,
            assistant_content_json(&reply, &model_used),
        )
        .await;

        reply
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::llm::ChatMessage;
    use async_trait::async_trait;

    struct CannedBackend {
        reply: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for CannedBackend {
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<Option<String>> {
            if self.fail {
                return Err(UmebotError::Llm("boom".to_owned()));
            }
            Ok(self.reply.clone())
        }

        fn descriptor(&self) -> String {
            "test_model".to_owned()
        }
    }

    fn core_with_store() -> (tempfile::TempDir, ConversationCore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InteractionStore::open(&dir.path().join("c.db")).unwrap());
        let personalities =
            crate::personality::load_catalogue(std::path::Path::new("/nonexistent")).unwrap();
        let core = ConversationCore::new(
            ConversationConfig::default(),
            LlmConfig::default(),
            store,
            personalities,
            KnowledgeBase::empty(),
        )
        .unwrap();
        (dir, core)
    }

    async fn install(core: &ConversationCore, backend: CannedBackend) {
        *core.backend.write().await = Some(Arc::new(backend));
        *core.backend_kind.lock().unwrap() = "cloud";
    }

    #[tokio::test]
    async fn reply_without_conversation_is_canned_and_unpersisted() {
        let (_dir, core) = core_with_store();
        let reply = core.get_response("hola", "gui", &[]).await;
        assert_eq!(reply, NO_CONVERSATION_REPLY);
        assert!(core.current_conversation_id().is_none());
    }

    #[tokio::test]
    async fn each_input_persists_user_then_assistant() {
        let (_dir, core) = core_with_store();
        let conv = core.start_new_conversation(None).await.unwrap();
        install(
            &core,
            CannedBackend {
                reply: Some("^runTag(hello) hola!".to_owned()),
                fail: false,
            },
        )
        .await;

        core.get_response("buenas", "stt_auto", &[]).await;
        let rows = core.store.get_interactions(conv, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[1].role, Role::Assistant);
        assert!(rows[1].content.contains("test_model"));
    }

    #[tokio::test]
    async fn backend_failure_still_persists_an_apology_turn() {
        let (_dir, core) = core_with_store();
        let conv = core.start_new_conversation(None).await.unwrap();
        install(
            &core,
            CannedBackend {
                reply: None,
                fail: true,
            },
        )
        .await;

        let reply = core.get_response("hola", "gui", &[]).await;
        assert_eq!(reply, BACKEND_ERROR_REPLY);
        let rows = core.store.get_interactions(conv, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].content.contains("test_model"));
    }

    #[tokio::test]
    async fn empty_reply_records_fallback_label() {
        let (_dir, core) = core_with_store();
        let conv = core.start_new_conversation(None).await.unwrap();
        install(
            &core,
            CannedBackend {
                reply: None,
                fail: false,
            },
        )
        .await;

        core.get_response("hola", "gui", &[]).await;
        let rows = core.store.get_interactions(conv, 10).unwrap();
        assert!(rows[1].content.contains(FALLBACK_MODEL_LABEL));
    }

    #[test]
    fn unknown_personality_is_rejected() {
        let (_dir, core) = core_with_store();
        assert!(!core.set_personality("nope"));
        assert!(core.set_personality(crate::personality::BUILTIN_KEY));
    }
}
