//! Tablet wire protocol.
//!
//! UTF-8 JSON frames, every one shaped `{type, timestamp, payload}` with an
//! ISO-8601 UTC timestamp. Outbound builders return ready-to-send strings;
//! inbound parsing validates structure and reports the offending path.

use crate::error::{Result, UmebotError};
use crate::motion::{
    ActionButtonState, DpadState, GamepadPayload, StickButtonState, StickPosition,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

/// Frame type names.
pub const TYPE_INPUT: &str = "input";
pub const TYPE_OUTPUT: &str = "output";
pub const TYPE_SYSTEM: &str = "system";
pub const TYPE_CURRENT_CONFIGURATION: &str = "currentConfiguration";
pub const TYPE_CONFIG_CONFIRMATION: &str = "config_confirmation";
pub const TYPE_PARTIAL_STT_RESULT: &str = "partial_stt_result";
pub const TYPE_CONFIG: &str = "config";
pub const TYPE_GAMEPAD_STATE: &str = "gamepad_state";

/// Severity levels for `system` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

impl SystemLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn frame(frame_type: &str, payload: Value) -> String {
    json!({
        "type": frame_type,
        "timestamp": timestamp(),
        "payload": payload,
    })
    .to_string()
}

/// Echo of an accepted input back to the clients.
pub fn input_echo(text: &str, source: &str) -> String {
    frame(TYPE_INPUT, json!({ "text": text, "source": source }))
}

/// Assistant output (tag-stripped text for GUI display).
pub fn output(sender: &str, text: &str, original_input_source: &str) -> String {
    frame(
        TYPE_OUTPUT,
        json!({
            "sender": sender,
            "text": text,
            "original_input_source": original_input_source,
        }),
    )
}

/// System notice at a given level, with optional machine-readable detail.
pub fn system(sender: &str, level: SystemLevel, text: &str, detail: Option<&str>) -> String {
    let mut payload = json!({
        "sender": sender,
        "level": level.as_str(),
        "text": text,
    });
    if let Some(detail) = detail {
        payload["detail"] = Value::String(detail.to_owned());
    }
    frame(TYPE_SYSTEM, payload)
}

/// Snapshot of the adjustable settings, sent to newly connected clients.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub stt_audio_source: String,
    pub ai_personality: String,
    pub ai_model_backend: String,
    pub available_personalities: Vec<String>,
    pub available_ai_backends: Vec<String>,
}

/// Current settings snapshot frame.
pub fn current_configuration(settings: &SettingsSnapshot) -> String {
    frame(
        TYPE_CURRENT_CONFIGURATION,
        json!({
            "settings": {
                "stt_audio_source": settings.stt_audio_source,
                "ai_personality": settings.ai_personality,
                "ai_model_backend": settings.ai_model_backend,
                "available_personalities": settings.available_personalities,
                "available_ai_backends": settings.available_ai_backends,
            }
        }),
    )
}

/// Result of applying one `config` request.
pub fn config_confirmation(
    config_item: &str,
    success: bool,
    current_value: &str,
    message_to_display: &str,
) -> String {
    frame(
        TYPE_CONFIG_CONFIRMATION,
        json!({
            "config_item": config_item,
            "success": success,
            "current_value": current_value,
            "message_to_display": message_to_display,
        }),
    )
}

/// In-progress (or just-committed) transcript for live display.
pub fn partial_stt_result(text: &str, is_final: bool) -> String {
    frame(
        TYPE_PARTIAL_STT_RESULT,
        json!({ "text": text, "is_final": is_final }),
    )
}

/// A validated inbound client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Input {
        text: String,
        source: Option<String>,
        images: Vec<String>,
    },
    Config {
        config_item: String,
        value: Value,
    },
    Gamepad(GamepadPayload),
}

fn protocol_error(message: impl Into<String>) -> UmebotError {
    UmebotError::Protocol(message.into())
}

fn require_object<'a>(value: &'a Value, path: &str) -> Result<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| protocol_error(format!("'{path}' is not an object")))
}

fn stick(payload: &serde_json::Map<String, Value>, name: &str) -> Result<StickPosition> {
    let path = format!("payload.{name}");
    let value = payload
        .get(name)
        .ok_or_else(|| protocol_error(format!("'{path}' is missing")))?;
    let object = require_object(value, &path)?;
    let axis = |axis: &str| -> Result<f32> {
        object
            .get(axis)
            .ok_or_else(|| protocol_error(format!("'{path}' missing '{axis}'")))?
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| protocol_error(format!("'{path}.{axis}' is not a number")))
    };
    Ok(StickPosition {
        x: axis("x")?,
        y: axis("y")?,
    })
}

fn flag(
    group: Option<&Value>,
    group_path: &str,
    key: &str,
) -> Result<bool> {
    let Some(group) = group else {
        return Ok(false);
    };
    let object = require_object(group, group_path)?;
    match object.get(key) {
        None => Ok(false),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(protocol_error(format!(
            "'{group_path}.{key}' is not a boolean"
        ))),
    }
}

fn parse_gamepad(payload: &Value) -> Result<GamepadPayload> {
    let object = require_object(payload, "payload")?;

    let dpad = object.get("dpad_events");
    let buttons = object.get("action_button_events");
    let sticks = object.get("stick_button_states");

    Ok(GamepadPayload {
        left_stick: stick(object, "left_stick")?,
        right_stick: stick(object, "right_stick")?,
        dpad_events: DpadState {
            up: flag(dpad, "payload.dpad_events", "up")?,
            down: flag(dpad, "payload.dpad_events", "down")?,
            left: flag(dpad, "payload.dpad_events", "left")?,
            right: flag(dpad, "payload.dpad_events", "right")?,
        },
        action_button_events: ActionButtonState {
            a: flag(buttons, "payload.action_button_events", "a")?,
            b: flag(buttons, "payload.action_button_events", "b")?,
            x: flag(buttons, "payload.action_button_events", "x")?,
            y: flag(buttons, "payload.action_button_events", "y")?,
        },
        stick_button_states: StickButtonState {
            l3_pressed: flag(sticks, "payload.stick_button_states", "l3_pressed")?,
            r3_pressed: flag(sticks, "payload.stick_button_states", "r3_pressed")?,
        },
    })
}

/// Parse and validate one inbound text frame.
///
/// # Errors
///
/// Returns a protocol error naming the offending field; callers answer the
/// sender with a `system:error` frame and keep the connection alive.
pub fn parse_client_frame(raw: &str) -> Result<ClientMessage> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| protocol_error(format!("frame is not valid JSON: {e}")))?;

    let frame_type = value["type"]
        .as_str()
        .ok_or_else(|| protocol_error("'type' is missing or not a string"))?;

    let payload = value
        .get("payload")
        .ok_or_else(|| protocol_error(format!("'payload' is missing for type '{frame_type}'")))?;

    match frame_type {
        TYPE_INPUT => {
            let object = require_object(payload, "payload")?;
            let text = object
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| protocol_error("'payload.text' is missing or not a string"))?;
            let source = object
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let images = object
                .get("images")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            Ok(ClientMessage::Input {
                text: text.to_owned(),
                source,
                images,
            })
        }
        TYPE_CONFIG => {
            let object = require_object(payload, "payload")?;
            let config_item = object
                .get("config_item")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    protocol_error("'payload.config_item' is missing or not a string")
                })?;
            let value = object.get("value").cloned().ok_or_else(|| {
                protocol_error("'payload.value' is missing")
            })?;
            Ok(ClientMessage::Config {
                config_item: config_item.to_owned(),
                value,
            })
        }
        TYPE_GAMEPAD_STATE => Ok(ClientMessage::Gamepad(parse_gamepad(payload)?)),
        other => Err(protocol_error(format!("unknown message type '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn outbound_frames_carry_type_timestamp_payload() {
        let raw = output("Umebot", "hola", "gui");
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "output");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(value["payload"]["sender"], "Umebot");
        assert_eq!(value["payload"]["original_input_source"], "gui");
    }

    #[test]
    fn system_detail_is_optional() {
        let with: Value =
            serde_json::from_str(&system("U", SystemLevel::Error, "mal", Some("d"))).unwrap();
        assert_eq!(with["payload"]["detail"], "d");
        let without: Value =
            serde_json::from_str(&system("U", SystemLevel::Info, "ok", None)).unwrap();
        assert!(without["payload"].get("detail").is_none());
    }

    #[test]
    fn input_frame_parses_with_images() {
        let raw = r#"{"type":"input","payload":{"text":"hola","source":"gui","images":["data:image/png;base64,x"]}}"#;
        let message = parse_client_frame(raw).unwrap();
        assert_eq!(
            message,
            ClientMessage::Input {
                text: "hola".to_owned(),
                source: Some("gui".to_owned()),
                images: vec!["data:image/png;base64,x".to_owned()],
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"bogus","payload":{}}"#;
        let error = parse_client_frame(raw).unwrap_err();
        assert!(error.to_string().contains("unknown message type"));
    }

    #[test]
    fn gamepad_missing_stick_axis_names_the_path() {
        let raw = r#"{"type":"gamepad_state","payload":{"left_stick":{"x":0}}}"#;
        let error = parse_client_frame(raw).unwrap_err();
        let text = error.to_string();
        assert!(text.contains("payload.left_stick"), "got: {text}");
        assert!(text.contains("'y'"), "got: {text}");
    }

    #[test]
    fn full_gamepad_frame_parses() {
        let raw = r#"{
            "type": "gamepad_state",
            "payload": {
                "left_stick": {"x": 0.5, "y": -0.5},
                "right_stick": {"x": 0.0, "y": 0.0},
                "dpad_events": {"up": true, "down": false, "left": false, "right": false},
                "action_button_events": {"a": true, "b": false, "x": false, "y": false},
                "stick_button_states": {"l3_pressed": false, "r3_pressed": false}
            }
        }"#;
        let ClientMessage::Gamepad(payload) = parse_client_frame(raw).unwrap() else {
            panic!("expected gamepad message");
        };
        assert!((payload.left_stick.x - 0.5).abs() < f32::EPSILON);
        assert!(payload.dpad_events.up);
        assert!(payload.action_button_events.a);
        assert!(!payload.requests_estop());
    }

    #[test]
    fn gamepad_wrong_flag_type_is_rejected() {
        let raw = r#"{
            "type": "gamepad_state",
            "payload": {
                "left_stick": {"x": 0, "y": 0},
                "right_stick": {"x": 0, "y": 0},
                "stick_button_states": {"l3_pressed": "yes"}
            }
        }"#;
        let error = parse_client_frame(raw).unwrap_err();
        assert!(error
            .to_string()
            .contains("payload.stick_button_states.l3_pressed"));
    }
}
