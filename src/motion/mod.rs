//! Motion arbiter: gamepad telemetry to base-velocity commands.
//!
//! A state machine over {idle, gamepad, emergency-stopped} running on one
//! dedicated worker thread. Payloads arrive through a single-slot
//! latest-value mailbox: a newer payload supersedes an unread older one, and
//! the timed wait on the slot doubles as the dead-man watchdog.

use crate::config::{GamepadAction, MotionConfig};
use crate::robot::RobotHardware;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Speed modifier bounds and D-pad step.
const SPEED_MODIFIER_MIN: f32 = 0.1;
const SPEED_MODIFIER_MAX: f32 = 1.0;
const SPEED_MODIFIER_STEP: f32 = 0.1;
/// Minimum per-axis change before a new velocity triple is emitted.
const VELOCITY_EPSILON: f32 = 0.001;

/// One joystick position, raw in [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StickPosition {
    pub x: f32,
    pub y: f32,
}

/// D-pad state sampled by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DpadState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

/// Action button state sampled by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionButtonState {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
}

/// Stick click state sampled by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StickButtonState {
    pub l3_pressed: bool,
    pub r3_pressed: bool,
}

/// One gamepad telemetry payload from the tablet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GamepadPayload {
    pub left_stick: StickPosition,
    pub right_stick: StickPosition,
    pub dpad_events: DpadState,
    pub action_button_events: ActionButtonState,
    pub stick_button_states: StickButtonState,
}

impl GamepadPayload {
    /// Whether either stick button requests an emergency stop.
    pub fn requests_estop(&self) -> bool {
        self.stick_button_states.l3_pressed || self.stick_button_states.r3_pressed
    }
}

/// Arbiter state machine mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    /// Payloads are discarded; no motion commands are emitted.
    Idle,
    /// Payloads drive the base; the dead-man watchdog is active.
    Gamepad,
    /// Zero velocity until a payload shows both stick buttons released.
    EmergencyStopped,
}

/// Animation/speech request produced by an action-button edge.
#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterAction {
    LocalAnim {
        category: String,
        name: Option<String>,
    },
    StandardTag {
        tag: String,
    },
    SpeakAnnotated {
        text: String,
    },
}

/// Latest-value slot shared with the worker.
struct Mailbox {
    payload: Option<GamepadPayload>,
    shutdown: bool,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    cond: Condvar,
    mode: Mutex<MotionMode>,
}

/// Gamepad-to-base motion arbiter.
pub struct MotionArbiter {
    config: MotionConfig,
    hardware: Arc<RobotHardware>,
    actions: mpsc::UnboundedSender<ArbiterAction>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Worker-local processing state.
struct WorkerState {
    speed_modifier: f32,
    layer_position: usize,
    previous_dpad: DpadState,
    previous_buttons: ActionButtonState,
    last_emitted: (f32, f32, f32),
}

impl MotionArbiter {
    pub fn new(
        config: MotionConfig,
        hardware: Arc<RobotHardware>,
        actions: mpsc::UnboundedSender<ArbiterAction>,
    ) -> Self {
        let initial = config
            .initial_speed_modifier
            .clamp(SPEED_MODIFIER_MIN, SPEED_MODIFIER_MAX);
        info!(
            "motion arbiter ready: {} animation layers, speed modifier {initial:.1}",
            config.layers.len()
        );
        Self {
            config,
            hardware,
            actions,
            shared: Arc::new(Shared {
                mailbox: Mutex::new(Mailbox {
                    payload: None,
                    shutdown: false,
                }),
                cond: Condvar::new(),
                mode: Mutex::new(MotionMode::Idle),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current state machine mode.
    pub fn mode(&self) -> MotionMode {
        self.shared
            .mode
            .lock()
            .map(|guard| *guard)
            .unwrap_or(MotionMode::Idle)
    }

    fn set_mode(&self, mode: MotionMode) {
        if let Ok(mut guard) = self.shared.mode.lock() {
            *guard = mode;
        }
    }

    /// Start the worker thread. Idempotent.
    pub fn start(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if worker.is_some() {
            return;
        }
        if let Ok(mut mailbox) = self.shared.mailbox.lock() {
            mailbox.shutdown = false;
            mailbox.payload = None;
        }

        let shared = Arc::clone(&self.shared);
        let hardware = Arc::clone(&self.hardware);
        let actions = self.actions.clone();
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("motion-arbiter".to_owned())
            .spawn(move || worker_loop(&shared, &hardware, &actions, &config))
            .ok();
        if handle.is_none() {
            warn!("failed to spawn motion arbiter worker");
        }
        *worker = handle;
    }

    /// Stop the worker thread, emitting a final zero velocity. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut mailbox) = self.shared.mailbox.lock() {
            mailbox.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    warn!("motion arbiter worker panicked");
                }
            }
        }
        self.emit_zero();
        self.set_mode(MotionMode::Idle);
    }

    /// Enter gamepad mode, clearing any residual emergency stop.
    pub fn activate_gamepad(&self) {
        self.set_mode(MotionMode::Gamepad);
        info!("gamepad control active");
    }

    /// Leave gamepad (or estop) mode and command zero velocity.
    pub fn deactivate_gamepad(&self) {
        self.set_mode(MotionMode::Idle);
        self.emit_zero();
        info!("gamepad control inactive");
    }

    /// Explicit emergency stop, equivalent to an L3/R3 payload.
    pub fn emergency_stop(&self) {
        self.set_mode(MotionMode::EmergencyStopped);
        self.emit_zero();
        self.hardware.trigger_hardware_emergency_stop();
        warn!("emergency stop engaged");
    }

    /// Submit a telemetry payload. A newer payload supersedes an unread one.
    pub fn submit_payload(&self, payload: GamepadPayload) {
        if let Ok(mut mailbox) = self.shared.mailbox.lock() {
            mailbox.payload = Some(payload);
        }
        self.shared.cond.notify_all();
    }

    fn emit_zero(&self) {
        if let Err(e) = self.hardware.set_base_velocities(0.0, 0.0, 0.0) {
            warn!("zero velocity emission failed: {e}");
        }
    }
}

fn worker_loop(
    shared: &Shared,
    hardware: &RobotHardware,
    actions: &mpsc::UnboundedSender<ArbiterAction>,
    config: &MotionConfig,
) {
    let deadman = Duration::from_millis(config.deadman_timeout_ms);
    let mut state = WorkerState {
        speed_modifier: config
            .initial_speed_modifier
            .clamp(SPEED_MODIFIER_MIN, SPEED_MODIFIER_MAX),
        layer_position: 0,
        previous_dpad: DpadState::default(),
        previous_buttons: ActionButtonState::default(),
        last_emitted: (0.0, 0.0, 0.0),
    };

    loop {
        let taken = {
            let Ok(guard) = shared.mailbox.lock() else {
                return;
            };
            let Ok((mut guard, _timeout)) = shared
                .cond
                .wait_timeout_while(guard, deadman, |mailbox| {
                    !mailbox.shutdown && mailbox.payload.is_none()
                })
            else {
                return;
            };
            if guard.shutdown {
                return;
            }
            // None after the wait means the dead-man window expired.
            guard.payload.take()
        };

        let mode = shared.mode.lock().map(|g| *g).unwrap_or(MotionMode::Idle);

        match taken {
            None => {
                // Dead-man expiry: one zero emission, then quiet.
                if mode == MotionMode::Gamepad && state.last_emitted != (0.0, 0.0, 0.0) {
                    debug!("dead-man timeout, commanding zero velocity");
                    emit(hardware, &mut state, (0.0, 0.0, 0.0));
                }
            }
            Some(payload) => {
                process_payload(shared, hardware, actions, config, &mut state, mode, payload);
            }
        }
    }
}

fn process_payload(
    shared: &Shared,
    hardware: &RobotHardware,
    actions: &mpsc::UnboundedSender<ArbiterAction>,
    config: &MotionConfig,
    state: &mut WorkerState,
    mode: MotionMode,
    payload: GamepadPayload,
) {
    if mode == MotionMode::Idle {
        return;
    }

    if payload.requests_estop() {
        emit(hardware, state, (0.0, 0.0, 0.0));
        if mode != MotionMode::EmergencyStopped {
            if let Ok(mut guard) = shared.mode.lock() {
                *guard = MotionMode::EmergencyStopped;
            }
            hardware.trigger_hardware_emergency_stop();
            warn!("emergency stop from gamepad stick buttons");
        }
        state.previous_dpad = payload.dpad_events;
        state.previous_buttons = payload.action_button_events;
        return;
    }

    if mode == MotionMode::EmergencyStopped {
        // Both stick buttons released: resume and process this same payload.
        if let Ok(mut guard) = shared.mode.lock() {
            *guard = MotionMode::Gamepad;
        }
        info!("emergency stop released, gamepad control resumed");
    }

    handle_dpad(config.layers.len(), state, payload.dpad_events);
    dispatch_button_edges(config, actions, state, payload.action_button_events);

    let velocities = map_sticks(config, state.speed_modifier, &payload);
    let was_stopped = state.last_emitted == (0.0, 0.0, 0.0);
    let now_moving = velocities != (0.0, 0.0, 0.0);
    if differs(velocities, state.last_emitted) || (was_stopped && now_moving) {
        emit(hardware, state, velocities);
    }
}

fn handle_dpad(layer_count: usize, state: &mut WorkerState, dpad: DpadState) {
    if dpad.up && !state.previous_dpad.up {
        state.speed_modifier =
            (state.speed_modifier + SPEED_MODIFIER_STEP).min(SPEED_MODIFIER_MAX);
        info!("speed modifier raised to {:.1}", state.speed_modifier);
    }
    if dpad.down && !state.previous_dpad.down {
        state.speed_modifier =
            (state.speed_modifier - SPEED_MODIFIER_STEP).max(SPEED_MODIFIER_MIN);
        info!("speed modifier lowered to {:.1}", state.speed_modifier);
    }
    if layer_count > 0 {
        if dpad.left && !state.previous_dpad.left {
            state.layer_position = (state.layer_position + layer_count - 1) % layer_count;
            info!("animation layer now {}", state.layer_position);
        }
        if dpad.right && !state.previous_dpad.right {
            state.layer_position = (state.layer_position + 1) % layer_count;
            info!("animation layer now {}", state.layer_position);
        }
    }
    state.previous_dpad = dpad;
}

fn dispatch_button_edges(
    config: &MotionConfig,
    actions: &mpsc::UnboundedSender<ArbiterAction>,
    state: &mut WorkerState,
    buttons: ActionButtonState,
) {
    let edges = [
        ("a", buttons.a && !state.previous_buttons.a),
        ("b", buttons.b && !state.previous_buttons.b),
        ("x", buttons.x && !state.previous_buttons.x),
        ("y", buttons.y && !state.previous_buttons.y),
    ];
    state.previous_buttons = buttons;

    let Some(layer) = config.layers.get(state.layer_position) else {
        return;
    };

    for (button, rising) in edges {
        if !rising {
            continue;
        }
        let dispatched = match layer.action(button) {
            GamepadAction::LocalAnim { category, name } => Some(ArbiterAction::LocalAnim {
                category: category.clone(),
                name: name.clone(),
            }),
            GamepadAction::StandardTag { tag } => Some(ArbiterAction::StandardTag {
                tag: tag.clone(),
            }),
            GamepadAction::SpeakAnnotated { text } => Some(ArbiterAction::SpeakAnnotated {
                text: text.clone(),
            }),
            GamepadAction::None => None,
        };
        if let Some(action) = dispatched {
            debug!("button '{button}' dispatching {action:?}");
            if actions.send(action).is_err() {
                warn!("arbiter action channel closed");
            }
        }
    }
}

/// Map raw sticks to `(vx, vy, vtheta)` with dead-zone and speed scaling.
fn map_sticks(config: &MotionConfig, speed_modifier: f32, payload: &GamepadPayload) -> (f32, f32, f32) {
    let raw_ly = payload.left_stick.y;
    let raw_lx = payload.left_stick.x;
    let raw_rx = payload.right_stick.x;

    let vx = if raw_ly.abs() > config.deadzone {
        config.axis_sign_vx * raw_ly * speed_modifier
    } else {
        0.0
    };
    let vy = if raw_lx.abs() > config.deadzone {
        config.axis_sign_vy * raw_lx * speed_modifier
    } else {
        0.0
    };
    let vtheta = if raw_rx.abs() > config.deadzone {
        config.axis_sign_vtheta * raw_rx * speed_modifier
    } else {
        0.0
    };
    (vx, vy, vtheta)
}

fn differs(a: (f32, f32, f32), b: (f32, f32, f32)) -> bool {
    (a.0 - b.0).abs() > VELOCITY_EPSILON
        || (a.1 - b.1).abs() > VELOCITY_EPSILON
        || (a.2 - b.2).abs() > VELOCITY_EPSILON
}

fn emit(hardware: &RobotHardware, state: &mut WorkerState, velocities: (f32, f32, f32)) {
    if let Err(e) = hardware.set_base_velocities(velocities.0, velocities.1, velocities.2) {
        warn!("velocity emission failed: {e}");
        return;
    }
    state.last_emitted = velocities;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadzone_suppresses_small_inputs() {
        let config = MotionConfig::default();
        let payload = GamepadPayload {
            left_stick: StickPosition { x: 0.05, y: 0.07 },
            right_stick: StickPosition { x: -0.03, y: 0.0 },
            ..GamepadPayload::default()
        };
        assert_eq!(map_sticks(&config, 1.0, &payload), (0.0, 0.0, 0.0));
    }

    #[test]
    fn mapping_applies_signs_and_modifier() {
        let config = MotionConfig::default();
        let payload = GamepadPayload {
            left_stick: StickPosition { x: 0.5, y: 1.0 },
            right_stick: StickPosition { x: 1.0, y: 0.0 },
            ..GamepadPayload::default()
        };
        let (vx, vy, vtheta) = map_sticks(&config, 0.5, &payload);
        assert!((vx - 0.5).abs() < f32::EPSILON);
        assert!((vy - -0.25).abs() < f32::EPSILON);
        assert!((vtheta - -0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn differs_uses_epsilon() {
        assert!(!differs((0.0, 0.0, 0.0), (0.0005, 0.0, 0.0)));
        assert!(differs((0.0, 0.0, 0.0), (0.002, 0.0, 0.0)));
    }

    #[test]
    fn estop_flag_reads_either_stick_button() {
        let mut payload = GamepadPayload::default();
        assert!(!payload.requests_estop());
        payload.stick_button_states.l3_pressed = true;
        assert!(payload.requests_estop());
        payload.stick_button_states = StickButtonState {
            l3_pressed: false,
            r3_pressed: true,
        };
        assert!(payload.requests_estop());
    }
}
