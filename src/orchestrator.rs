//! Orchestrator: component wiring, busy interlock, lifecycle.
//!
//! The only component holding references to all others. Events from the
//! recognition pipeline, the tablet gateway and the motion arbiter arrive on
//! channels installed at composition time; every cross-component edge runs
//! through the handlers here. The event loop never blocks: blocking work is
//! pushed onto worker tasks, and conversational turns are serialized by the
//! busy gate rather than by the loop.

use crate::audio::AudioMultiplexer;
use crate::config::{AudioSourceKind, BackendConfig, LmBackendKind};
use crate::conversation::{knowledge::KnowledgeBase, ConversationCore};
use crate::error::{Result, UmebotError};
use crate::expression::ExpressionController;
use crate::gateway::protocol::{self, SettingsSnapshot, SystemLevel};
use crate::gateway::{GatewayEvent, GatewayHandle, TabletGateway};
use crate::llm::LmBackendSpec;
use crate::motion::{ArbiterAction, MotionArbiter};
use crate::robot::services::{AnimationPlayer, QianimPlayer, RobotBase, RobotSpeech};
use crate::robot::RobotHardware;
use crate::store::InteractionStore;
use crate::stt::{RecognitionPipeline, SttEvent, StreamingRecognizer};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Size of the gateway-to-orchestrator event channel.
const GATEWAY_EVENT_CHANNEL_SIZE: usize = 64;

/// Bound on each worker join during shutdown.
const SHUTDOWN_JOIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Notice broadcast when input is dropped by the interlock.
const BUSY_NOTICE: &str = "Ocupado procesando la peticion anterior; entrada descartada.";

/// Await a shutdown step, abandoning it past [`SHUTDOWN_JOIN_TIMEOUT`].
///
/// The leaked worker keeps blocking on its own thread; only shutdown
/// completion is protected.
async fn join_bounded(name: &str, task: tokio::task::JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} shutdown task failed: {e}"),
        Err(_) => warn!(
            "{name} did not stop within {}s, abandoning it",
            SHUTDOWN_JOIN_TIMEOUT.as_secs()
        ),
    }
}

/// Strip `^runTag(...)`-style animation tags for GUI display.
///
/// The annotated original is what the robot speaks; the stripped text is
/// what clients render.
pub fn strip_animation_tags(text: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| {
        Regex::new(r"\s*\^(run|start|wait)Tag\([^)]*\)\s*").expect("static pattern")
    });
    let replaced = re.replace_all(text, " ");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Binary busy condition with set/clear/wait semantics.
///
/// Set means available. `try_acquire` atomically tests and clears so two
/// concurrent inputs can never both pass the interlock.
pub struct BusyGate {
    available: Mutex<bool>,
    notify: Notify,
}

impl Default for BusyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyGate {
    /// New gate, set (available).
    pub fn new() -> Self {
        Self {
            available: Mutex::new(true),
            notify: Notify::new(),
        }
    }

    /// Whether the system is available for new input.
    pub fn is_set(&self) -> bool {
        self.available.lock().map(|guard| *guard).unwrap_or(false)
    }

    /// Atomically take the gate. Returns false when already busy.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut guard) = self.available.lock() else {
            return false;
        };
        if *guard {
            *guard = false;
            true
        } else {
            false
        }
    }

    /// Mark available again and wake waiters.
    pub fn set(&self) {
        if let Ok(mut guard) = self.available.lock() {
            *guard = true;
        }
        self.notify.notify_waiters();
    }

    /// Wait until the gate is set.
    pub async fn wait_set(&self) {
        loop {
            let waiter = self.notify.notified();
            if self.is_set() {
                return;
            }
            waiter.await;
        }
    }
}

/// Robot service bindings injected at composition time.
pub struct RobotServices {
    pub base: Arc<dyn RobotBase>,
    pub speech: Arc<dyn RobotSpeech>,
    pub animation_player: Option<Arc<dyn AnimationPlayer>>,
    pub qianim_player: Option<Arc<dyn QianimPlayer>>,
}

struct EventReceivers {
    stt: mpsc::UnboundedReceiver<SttEvent>,
    gateway: mpsc::Receiver<GatewayEvent>,
    actions: mpsc::UnboundedReceiver<ArbiterAction>,
}

/// Component wiring and lifecycle owner (C8).
pub struct Orchestrator {
    config: BackendConfig,
    busy: BusyGate,
    robot_gate: Arc<AtomicBool>,
    mux: Arc<AudioMultiplexer>,
    pipeline: Arc<RecognitionPipeline>,
    conversation: Arc<ConversationCore>,
    expression: Arc<ExpressionController>,
    arbiter: Arc<MotionArbiter>,
    hardware: Arc<RobotHardware>,
    gateway: GatewayHandle,
    server: Mutex<Option<TabletGateway>>,
    receivers: Mutex<Option<EventReceivers>>,
    local_addr: SocketAddr,
}

impl Orchestrator {
    /// Compose all components and run the startup sequence.
    ///
    /// `recognizer` is required when audio ingestion is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error for fatal startup failures: unusable store, bad
    /// catalogue, unbound ports, missing configured model, or a robot that
    /// cannot be woken.
    pub async fn start(
        config: BackendConfig,
        services: RobotServices,
        recognizer: Option<Box<dyn StreamingRecognizer>>,
    ) -> Result<Arc<Self>> {
        // Persistence and catalogues load from disk; keep it off the loop.
        let store_path = config.store.resolved_db_path();
        let personalities_path = config.conversation.personalities_path.clone();
        let knowledge_path = config.conversation.knowledge_base_path.clone();
        let (store, personalities, knowledge) = tokio::task::spawn_blocking(move || {
            let store = InteractionStore::open(&store_path)?;
            let personalities = crate::personality::load_catalogue(&personalities_path)?;
            let knowledge = match knowledge_path {
                Some(ref path) => KnowledgeBase::load(path)?,
                None => KnowledgeBase::empty(),
            };
            Ok::<_, UmebotError>((store, personalities, knowledge))
        })
        .await
        .map_err(|e| UmebotError::Config(format!("startup load task failed: {e}")))??;

        let conversation = Arc::new(ConversationCore::new(
            config.conversation.clone(),
            config.llm.clone(),
            Arc::new(store),
            personalities,
            knowledge,
        )?);

        let expression = Arc::new(ExpressionController::new(
            &config.expression.animations_dir,
            services.speech,
            services.animation_player,
            services.qianim_player,
        ));

        let hardware = Arc::new(RobotHardware::new(services.base).with_stabilization_wait(
            std::time::Duration::from_millis(config.robot.stabilization_wait_ms),
        ));

        let robot_gate = Arc::new(AtomicBool::new(false));
        let (mux, audio_rx) = AudioMultiplexer::new(config.audio.clone(), Arc::clone(&robot_gate));
        let mux = Arc::new(mux);
        let pipeline = Arc::new(RecognitionPipeline::new(config.stt.clone()));

        let (gateway_tx, gateway_rx) = mpsc::channel(GATEWAY_EVENT_CHANNEL_SIZE);
        let (stt_tx, stt_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        let arbiter = Arc::new(MotionArbiter::new(
            config.motion.clone(),
            Arc::clone(&hardware),
            action_tx,
        ));

        // (a) open the robot-audio gate iff the initial source is the robot.
        let initial_source = config.stt.default_source;
        robot_gate.store(initial_source == AudioSourceKind::Robot, Ordering::SeqCst);

        // (b) tablet server.
        let server = TabletGateway::serve(&config.gateway, gateway_tx).await?;
        let local_addr = server.local_addr();
        let gateway = server.handle();

        // (c) audio ingestion workers.
        if config.audio.enabled {
            let robot_config = config.robot_audio.clone();
            let mux_for_start = Arc::clone(&mux);
            tokio::task::spawn_blocking(move || mux_for_start.start(&robot_config))
                .await
                .map_err(|e| UmebotError::Audio(format!("audio start task failed: {e}")))??;

            let mux_for_source = Arc::clone(&mux);
            let source_result =
                tokio::task::spawn_blocking(move || mux_for_source.set_source(initial_source))
                    .await
                    .map_err(|e| UmebotError::Audio(format!("source task failed: {e}")))?;
            if let Err(e) = source_result {
                // Mic trouble degrades to no source; the GUI can retry later.
                warn!("initial audio source unavailable: {e}");
            }

            // (d) recognition.
            let Some(recognizer) = recognizer else {
                return Err(UmebotError::Config(
                    "audio enabled but no recognizer provided".to_owned(),
                ));
            };
            pipeline.start(audio_rx, recognizer, stt_tx, config.audio.target_sample_rate)?;
        }

        // Activate the configured LM backend; a broken configured backend is
        // a startup error, an explicit `none` is not.
        let backend_spec = LmBackendSpec::from_config(&config.llm);
        if backend_spec != LmBackendSpec::None && !conversation.set_backend(backend_spec).await {
            return Err(UmebotError::Config(
                "configured LM backend failed to initialize".to_owned(),
            ));
        }
        conversation.start_new_conversation(None).await?;

        // (e) motion.
        let hardware_for_init = Arc::clone(&hardware);
        tokio::task::spawn_blocking(move || hardware_for_init.initialize())
            .await
            .map_err(|e| UmebotError::Robot(format!("init task failed: {e}")))?
            .map_err(|e| {
                UmebotError::Robot(format!("cannot wake robot, aborting startup: {e}"))
            })?;
        arbiter.start();

        // (f) optional gamepad control.
        if config.motion.activate_on_start {
            arbiter.activate_gamepad();
        }

        info!("orchestrator started (gateway {local_addr})");
        Ok(Arc::new(Self {
            config,
            busy: BusyGate::new(),
            robot_gate,
            mux,
            pipeline,
            conversation,
            expression,
            arbiter,
            hardware,
            gateway,
            server: Mutex::new(Some(server)),
            receivers: Mutex::new(Some(EventReceivers {
                stt: stt_rx,
                gateway: gateway_rx,
                actions: action_rx,
            })),
            local_addr,
        }))
    }

    /// Address the tablet gateway bound.
    pub fn gateway_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The conversation core (state reads, tests).
    pub fn conversation(&self) -> &Arc<ConversationCore> {
        &self.conversation
    }

    /// The motion arbiter (state reads, tests).
    pub fn arbiter(&self) -> &Arc<MotionArbiter> {
        &self.arbiter
    }

    /// Whether the interlock currently admits new input.
    pub fn is_available(&self) -> bool {
        self.busy.is_set()
    }

    /// Drive the event loop until cancelled.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let receivers = {
            let Ok(mut guard) = self.receivers.lock() else {
                return;
            };
            guard.take()
        };
        let Some(mut receivers) = receivers else {
            warn!("orchestrator event loop already consumed");
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = receivers.stt.recv() => self.handle_stt_event(event).await,
                Some(event) = receivers.gateway.recv() => self.handle_gateway_event(event).await,
                Some(action) = receivers.actions.recv() => self.handle_arbiter_action(action).await,
                else => break,
            }
        }
        info!("orchestrator event loop finished");
    }

    /// Adapt one recognition event.
    pub async fn handle_stt_event(self: &Arc<Self>, event: SttEvent) {
        match event {
            SttEvent::Partial(text) => {
                self.gateway
                    .broadcast(&protocol::partial_stt_result(&text, false))
                    .await;
            }
            SttEvent::Final(text) => {
                if text.trim().is_empty() {
                    return;
                }
                self.gateway
                    .broadcast(&protocol::partial_stt_result(&text, true))
                    .await;
                self.process_input(text, "stt_auto".to_owned(), Vec::new());
            }
            SttEvent::SpeakingChanged(user_speaking) => {
                // Barge-in: one "please wait" while busy and not already
                // talking over the user.
                if user_speaking && !self.busy.is_set() && !self.expression.is_speaking() {
                    let utterance = self.config.expression.busy_utterance.clone();
                    if let Err(e) = self.expression.say(&utterance, false).await {
                        warn!("busy utterance failed: {e}");
                    }
                }
            }
        }
    }

    /// Adapt one gateway event.
    pub async fn handle_gateway_event(self: &Arc<Self>, event: GatewayEvent) {
        match event {
            GatewayEvent::ClientConnected(client) => {
                let snapshot = self.settings_snapshot();
                self.gateway
                    .send_to(client, &protocol::current_configuration(&snapshot))
                    .await;
            }
            GatewayEvent::ClientDisconnected(_) => {}
            GatewayEvent::Input {
                text,
                source,
                images,
                ..
            } => {
                let source = source.unwrap_or_else(|| "gui".to_owned());
                self.process_input(text, source, images);
            }
            GatewayEvent::Config {
                config_item, value, ..
            } => {
                self.apply_config(&config_item, value).await;
            }
            GatewayEvent::Gamepad { payload, .. } => {
                self.arbiter.submit_payload(payload);
            }
            GatewayEvent::GamepadEmergencyStop { .. } => {
                // Safety path: hardware calls are blocking, keep them off-loop.
                let arbiter = Arc::clone(&self.arbiter);
                let joined = tokio::task::spawn_blocking(move || arbiter.emergency_stop()).await;
                if joined.is_err() {
                    error!("emergency stop task failed");
                }
                self.gateway
                    .broadcast(&protocol::system(
                        self.gateway.sender_name(),
                        SystemLevel::Warning,
                        "Parada de emergencia activada desde el gamepad.",
                        None,
                    ))
                    .await;
            }
        }
    }

    /// Dispatch one arbiter animation/speech request to the expression layer.
    pub async fn handle_arbiter_action(self: &Arc<Self>, action: ArbiterAction) {
        let result = match action {
            ArbiterAction::LocalAnim { category, name } => {
                self.expression
                    .play_local_animation(&category, name.as_deref(), false)
                    .await
            }
            ArbiterAction::StandardTag { tag } => {
                self.expression.play_standard_tag(&tag, false).await
            }
            ArbiterAction::SpeakAnnotated { text } => self.expression.say(&text, false).await,
        };
        if let Err(e) = result {
            warn!("arbiter action dispatch failed: {e}");
        }
    }

    /// Run one conversational turn under the busy interlock.
    ///
    /// Never blocks the caller: when the gate is free the turn runs on its
    /// own task; when busy the input is dropped with a broadcast notice.
    pub fn process_input(self: &Arc<Self>, text: String, source: String, images: Vec<String>) {
        let text = text.trim().to_owned();
        if text.is_empty() {
            return;
        }

        if !self.busy.try_acquire() {
            info!("busy, dropping input from '{source}'");
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.gateway
                    .broadcast(&protocol::system(
                        this.gateway.sender_name(),
                        SystemLevel::Info,
                        BUSY_NOTICE,
                        None,
                    ))
                    .await;
            });
            return;
        }

        // Self-hearing guard: the robot's own voice must not reach the
        // recognizer while it speaks.
        let recognition_paused = self.pipeline.is_running();
        if recognition_paused {
            self.pipeline.pause();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.gateway
                .broadcast(&protocol::input_echo(&text, &source))
                .await;

            let annotated = this.conversation.get_response(&text, &source, &images).await;
            let stripped = strip_animation_tags(&annotated);
            this.gateway
                .broadcast(&protocol::output(
                    this.gateway.sender_name(),
                    &stripped,
                    &source,
                ))
                .await;

            if let Err(e) = this.expression.say(&annotated, true).await {
                warn!("speech for response failed: {e}");
            }

            this.busy.set();
            if recognition_paused {
                this.pipeline.resume();
            }
        });
    }

    fn settings_snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            stt_audio_source: self.mux.get_source().as_str().to_owned(),
            ai_personality: self.conversation.current_personality_key(),
            ai_model_backend: self.conversation.current_backend_kind().to_owned(),
            available_personalities: self.conversation.available_personalities(),
            available_ai_backends: vec![
                LmBackendKind::Cloud.as_str().to_owned(),
                LmBackendKind::Local.as_str().to_owned(),
                LmBackendKind::None.as_str().to_owned(),
            ],
        }
    }

    /// Apply one `config` request and broadcast exactly one confirmation.
    async fn apply_config(self: &Arc<Self>, config_item: &str, value: serde_json::Value) {
        let requested = value.as_str().map(str::to_owned).unwrap_or_else(|| {
            value.to_string().trim_matches('"').to_owned()
        });

        let (success, current_value, message) = match config_item {
            "stt_audio_source" => self.apply_audio_source(&requested).await,
            "ai_personality" => {
                let ok = self.conversation.set_personality(&requested);
                let current = self.conversation.current_personality_key();
                let message = if ok {
                    format!("Personalidad activa: {current}")
                } else {
                    format!("Personalidad desconocida '{requested}'")
                };
                (ok, current, message)
            }
            "ai_model_backend" => match LmBackendKind::parse(&requested) {
                Some(kind) => {
                    let spec = self.backend_spec_for(kind);
                    let ok = self.conversation.set_backend(spec).await;
                    let current = self.conversation.current_backend_kind().to_owned();
                    let message = if ok {
                        format!("Backend activo: {current}")
                    } else {
                        format!("No se pudo activar el backend '{requested}'")
                    };
                    (ok, current, message)
                }
                None => (
                    false,
                    self.conversation.current_backend_kind().to_owned(),
                    format!("Backend desconocido '{requested}'"),
                ),
            },
            other => (
                false,
                String::new(),
                format!("Elemento de configuracion desconocido '{other}'"),
            ),
        };

        self.gateway
            .broadcast(&protocol::config_confirmation(
                config_item,
                success,
                &current_value,
                &message,
            ))
            .await;
    }

    fn backend_spec_for(&self, kind: LmBackendKind) -> LmBackendSpec {
        let llm = &self.config.llm;
        match kind {
            LmBackendKind::Cloud => LmBackendSpec::Cloud {
                api_key: llm.api_key.clone(),
                model_name: llm.model_name.clone(),
            },
            LmBackendKind::Local => LmBackendSpec::Local {
                model_path: llm.model_path.clone(),
                context_size: llm.context_size,
                chat_format: llm.chat_format.clone(),
            },
            LmBackendKind::None => LmBackendSpec::None,
        }
    }

    async fn apply_audio_source(self: &Arc<Self>, requested: &str) -> (bool, String, String) {
        let Some(kind) = AudioSourceKind::parse(requested) else {
            return (
                false,
                self.mux.get_source().as_str().to_owned(),
                format!("Fuente de audio desconocida '{requested}'"),
            );
        };

        // Gate first so the robot path can accept as soon as it activates.
        self.robot_gate
            .store(kind == AudioSourceKind::Robot, Ordering::SeqCst);

        let mux = Arc::clone(&self.mux);
        let switched = tokio::task::spawn_blocking(move || mux.set_source(kind)).await;
        let ok = matches!(switched, Ok(Ok(())));
        if let Ok(Err(ref e)) = switched {
            warn!("audio source switch failed: {e}");
        }
        self.pipeline.notify_source_change();

        let current = self.mux.get_source().as_str().to_owned();
        let message = if ok {
            format!("Fuente de audio activa: {current}")
        } else {
            format!("No se pudo activar la fuente '{requested}'")
        };
        (ok, current, message)
    }

    /// Shut everything down in strict reverse of the startup order.
    ///
    /// Every step tolerates an already-stopped subcomponent, and each worker
    /// join is bounded: a wedged thread is abandoned with a log line rather
    /// than blocking shutdown completion.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("orchestrator shutting down");

        // (f)/(e) motion first: no commands may outlive the arbiter.
        let arbiter = Arc::clone(&self.arbiter);
        join_bounded(
            "motion arbiter",
            tokio::task::spawn_blocking(move || {
                arbiter.deactivate_gamepad();
                arbiter.stop();
            }),
        )
        .await;
        let hardware = Arc::clone(&self.hardware);
        join_bounded(
            "hardware release",
            tokio::task::spawn_blocking(move || hardware.release()),
        )
        .await;

        // (d) recognition.
        let pipeline = Arc::clone(&self.pipeline);
        join_bounded(
            "recognition pipeline",
            tokio::task::spawn_blocking(move || pipeline.stop()),
        )
        .await;

        // (c) audio ingestion.
        let mux = Arc::clone(&self.mux);
        join_bounded(
            "audio multiplexer",
            tokio::task::spawn_blocking(move || mux.stop()),
        )
        .await;

        // (b) tablet server.
        let server = {
            let Ok(mut guard) = self.server.lock() else {
                return;
            };
            guard.take()
        };
        if let Some(server) = server {
            server.shutdown().await;
        }

        // (a) robot-audio gate.
        self.robot_gate.store(false, Ordering::SeqCst);
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn tag_stripping_removes_all_variants() {
        let annotated =
            "^runTag(hello) Hola ^startTag(think)  que tal ^waitTag(x) estas ^runTag(bye)";
        assert_eq!(strip_animation_tags(annotated), "Hola que tal estas");
    }

    #[test]
    fn tag_stripping_leaves_plain_text_alone() {
        assert_eq!(strip_animation_tags("sin tags"), "sin tags");
        assert_eq!(strip_animation_tags(""), "");
    }

    #[test]
    fn busy_gate_acquire_is_exclusive() {
        let gate = BusyGate::new();
        assert!(gate.is_set());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.set();
        assert!(gate.try_acquire());
    }

    #[tokio::test]
    async fn busy_gate_wait_returns_after_set() {
        let gate = Arc::new(BusyGate::new());
        assert!(gate.try_acquire());

        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move { waiter.wait_set().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        gate.set();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
