//! End-to-end orchestrator behavior through a live gateway connection:
//! settings snapshot, input round trips, the busy interlock, barge-in
//! speech, config confirmations, malformed frames and the gamepad estop.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use umebot_backend::config::BackendConfig;
use umebot_backend::motion::MotionMode;
use umebot_backend::robot::services::{RobotBase, RobotSpeech};
use umebot_backend::store::{InteractionStore, Role};
use umebot_backend::stt::SttEvent;
use umebot_backend::{Orchestrator, Result, RobotServices};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct QuietBase;

impl RobotBase for QuietBase {
    fn wake_up(&self) -> Result<()> {
        Ok(())
    }
    fn rest(&self) -> Result<()> {
        Ok(())
    }
    fn set_autonomous_life(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
    fn stop_move(&self) -> Result<()> {
        Ok(())
    }
    fn kill_move(&self) -> Result<()> {
        Ok(())
    }
    fn go_to_posture(&self, _posture: &str, _speed: f32) -> Result<()> {
        Ok(())
    }
    fn move_toward(&self, _vx: f32, _vy: f32, _vtheta: f32) -> Result<()> {
        Ok(())
    }
    fn set_collision_protection(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
    fn stop_all_gestures(&self) -> Result<()> {
        Ok(())
    }
}

/// Speech fake: records utterances, optionally holds each one for a while.
struct SlowSpeech {
    spoken: Mutex<Vec<String>>,
    hold: Duration,
}

impl SlowSpeech {
    fn new(hold: Duration) -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            hold,
        }
    }

    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl RobotSpeech for SlowSpeech {
    fn animated_say(&self, annotated_text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(annotated_text.to_owned());
        std::thread::sleep(self.hold);
        Ok(())
    }
    fn stop_all_speech(&self) -> Result<()> {
        Ok(())
    }
}

fn test_config(dir: &Path) -> BackendConfig {
    let mut config = BackendConfig::default();
    config.audio.enabled = false;
    config.gateway.host = "127.0.0.1".to_owned();
    config.gateway.port = 0;
    config.store.db_path = Some(dir.join("store.db"));
    config.conversation.personalities_path = dir.join("personalities.toml");
    config.conversation.default_personality = "umebot".to_owned();
    config.robot.stabilization_wait_ms = 1;
    config
}

struct Rig {
    orchestrator: Arc<Orchestrator>,
    speech: Arc<SlowSpeech>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start_rig(speech_hold: Duration) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let speech = Arc::new(SlowSpeech::new(speech_hold));
    let services = RobotServices {
        base: Arc::new(QuietBase),
        speech: Arc::clone(&speech) as Arc<dyn RobotSpeech>,
        animation_player: None,
        qianim_player: None,
    };
    let orchestrator = Orchestrator::start(config, services, None).await.unwrap();

    let cancel = CancellationToken::new();
    let runner_cancel = cancel.clone();
    let runner = Arc::clone(&orchestrator);
    tokio::spawn(async move { runner.run(runner_cancel).await });

    Rig {
        orchestrator,
        speech,
        cancel,
        _dir: dir,
    }
}

async fn connect(orchestrator: &Orchestrator) -> WsClient {
    let url = format!("ws://{}/ws_bidirectional", orchestrator.gateway_addr());
    let (ws, _) = connect_async(&url).await.unwrap();
    ws
}

/// Next frame of the given type, skipping others.
async fn wait_frame(ws: &mut WsClient, frame_type: &str) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == frame_type {
                return value;
            }
        }
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn store_rows(rig: &Rig) -> Vec<(Role, String)> {
    let conversation_id = rig
        .orchestrator
        .conversation()
        .current_conversation_id()
        .unwrap();
    let store = InteractionStore::open(&rig._dir.path().join("store.db")).unwrap();
    store
        .get_interactions(conversation_id, 50)
        .unwrap()
        .into_iter()
        .map(|row| (row.role, row.content))
        .collect()
}

#[tokio::test]
async fn new_client_receives_settings_snapshot() {
    let rig = start_rig(Duration::ZERO).await;
    let mut ws = connect(&rig.orchestrator).await;

    let frame = wait_frame(&mut ws, "currentConfiguration").await;
    let settings = &frame["payload"]["settings"];
    assert_eq!(settings["stt_audio_source"], "none");
    assert_eq!(settings["ai_model_backend"], "none");
    assert!(settings["available_personalities"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p == "umebot"));
    assert!(settings["available_ai_backends"]
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b == "cloud"));

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn input_round_trip_persists_user_then_assistant() {
    let rig = start_rig(Duration::ZERO).await;
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({"type": "input", "payload": {"text": "hola", "source": "gui"}}),
    )
    .await;

    let echo = wait_frame(&mut ws, "input").await;
    assert_eq!(echo["payload"]["text"], "hola");
    assert_eq!(echo["payload"]["source"], "gui");

    let output = wait_frame(&mut ws, "output").await;
    assert_eq!(output["payload"]["original_input_source"], "gui");
    let shown = output["payload"]["text"].as_str().unwrap();
    // GUI text is tag-free; the spoken text keeps its animation tags.
    assert!(!shown.contains("^runTag"));

    // Exactly two interactions, user first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rows = store_rows(&rig);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, Role::User);
    assert_eq!(rows[1].0, Role::Assistant);
    assert!(rows[0].1.contains("hola"));

    // The robot spoke the annotated original.
    let spoken = rig.speech.spoken();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].contains("^runTag"));

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn final_while_busy_is_dropped_with_notice() {
    let rig = start_rig(Duration::from_millis(400)).await;
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({"type": "input", "payload": {"text": "hola", "source": "gui"}}),
    )
    .await;
    wait_frame(&mut ws, "output").await;

    // The robot is still speaking: the interlock is held.
    assert!(!rig.orchestrator.is_available());
    rig.orchestrator
        .handle_stt_event(SttEvent::Final("test".to_owned()))
        .await;

    let notice = wait_frame(&mut ws, "system").await;
    assert_eq!(notice["payload"]["level"], "info");

    // Only the first input produced output and interactions.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let rows = store_rows(&rig);
    assert_eq!(rows.len(), 2);
    assert!(rows[0].1.contains("hola"));
    assert!(!rows.iter().any(|(_, content)| content.contains("test")));

    // The interlock recovered once speech completed.
    assert!(rig.orchestrator.is_available());

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn barge_in_queues_exactly_one_busy_utterance() {
    let rig = start_rig(Duration::from_millis(400)).await;
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({"type": "input", "payload": {"text": "hola", "source": "gui"}}),
    )
    .await;
    wait_frame(&mut ws, "output").await;

    // User starts talking while the response is being spoken.
    rig.orchestrator
        .handle_stt_event(SttEvent::SpeakingChanged(true))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.orchestrator
        .handle_stt_event(SttEvent::SpeakingChanged(true))
        .await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let spoken = rig.speech.spoken();
    let busy_utterances = spoken
        .iter()
        .filter(|text| text.contains("Un momento"))
        .count();
    assert_eq!(busy_utterances, 1, "spoken: {spoken:?}");

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn config_request_yields_exactly_one_confirmation() {
    let rig = start_rig(Duration::ZERO).await;
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({"type": "config", "payload": {"config_item": "ai_personality", "value": "umebot"}}),
    )
    .await;
    let confirmation = wait_frame(&mut ws, "config_confirmation").await;
    assert_eq!(confirmation["payload"]["config_item"], "ai_personality");
    assert_eq!(confirmation["payload"]["success"], true);
    assert_eq!(confirmation["payload"]["current_value"], "umebot");

    // Unknown values are rejected but still confirmed exactly once.
    send_json(
        &mut ws,
        json!({"type": "config", "payload": {"config_item": "ai_personality", "value": "nadie"}}),
    )
    .await;
    let rejection = wait_frame(&mut ws, "config_confirmation").await;
    assert_eq!(rejection["payload"]["success"], false);
    assert_eq!(rejection["payload"]["current_value"], "umebot");

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn malformed_gamepad_gets_error_and_changes_nothing() {
    let rig = start_rig(Duration::ZERO).await;
    rig.orchestrator.arbiter().activate_gamepad();
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({"type": "gamepad_state", "payload": {"left_stick": {"x": 0}}}),
    )
    .await;
    let error = wait_frame(&mut ws, "system").await;
    assert_eq!(error["payload"]["level"], "error");
    let detail = error["payload"]["detail"].as_str().unwrap();
    assert!(detail.contains("payload.left_stick"), "detail: {detail}");
    assert!(detail.contains("'y'"), "detail: {detail}");

    assert_eq!(rig.orchestrator.arbiter().mode(), MotionMode::Gamepad);

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn gamepad_estop_frame_trips_the_arbiter() {
    let rig = start_rig(Duration::ZERO).await;
    rig.orchestrator.arbiter().activate_gamepad();
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(
        &mut ws,
        json!({
            "type": "gamepad_state",
            "payload": {
                "left_stick": {"x": 0.5, "y": 0.5},
                "right_stick": {"x": 0.0, "y": 0.0},
                "stick_button_states": {"l3_pressed": true, "r3_pressed": false}
            }
        }),
    )
    .await;

    let warning = wait_frame(&mut ws, "system").await;
    assert_eq!(warning["payload"]["level"], "warning");
    assert_eq!(rig.orchestrator.arbiter().mode(), MotionMode::EmergencyStopped);

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_frame_type_is_answered_with_error() {
    let rig = start_rig(Duration::ZERO).await;
    let mut ws = connect(&rig.orchestrator).await;
    wait_frame(&mut ws, "currentConfiguration").await;

    send_json(&mut ws, json!({"type": "bogus", "payload": {}})).await;
    let error = wait_frame(&mut ws, "system").await;
    assert_eq!(error["payload"]["level"], "error");

    // The connection survives and keeps serving.
    send_json(
        &mut ws,
        json!({"type": "config", "payload": {"config_item": "ai_personality", "value": "umebot"}}),
    )
    .await;
    wait_frame(&mut ws, "config_confirmation").await;

    rig.cancel.cancel();
    rig.orchestrator.shutdown().await;
}
