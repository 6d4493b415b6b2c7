//! Robot hardware facade.
//!
//! Wraps the base locomotion service with the wake/rest lifecycle the
//! backend needs and the emergency-stop path the motion arbiter calls.

pub mod services;

use crate::error::Result;
use services::RobotBase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Posture driven to during initialization.
const STAND_POSTURE: &str = "Stand";
/// Fraction of maximum speed for the initialization posture move.
const STAND_SPEED: f32 = 0.6;
/// Wait for physical stabilization after the posture move.
const STABILIZE_WAIT: Duration = Duration::from_millis(2500);

/// Lifecycle and velocity passthrough over the base service.
pub struct RobotHardware {
    base: Arc<dyn RobotBase>,
    initialized: AtomicBool,
    stabilize_wait: Duration,
}

impl RobotHardware {
    pub fn new(base: Arc<dyn RobotBase>) -> Self {
        Self {
            base,
            initialized: AtomicBool::new(false),
            stabilize_wait: STABILIZE_WAIT,
        }
    }

    /// Override the post-posture stabilization wait.
    pub fn with_stabilization_wait(mut self, wait: Duration) -> Self {
        self.stabilize_wait = wait;
        self
    }

    /// Wake the robot and drive it to a known standing state.
    ///
    /// Blocks for the stabilization wait; run on a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if any lifecycle RPC fails; the robot is left
    /// un-initialized in that case.
    pub fn initialize(&self) -> Result<()> {
        info!("initializing robot hardware");
        self.base.wake_up()?;
        self.base.set_autonomous_life(false)?;
        self.base.stop_move()?;
        self.base.go_to_posture(STAND_POSTURE, STAND_SPEED)?;
        std::thread::sleep(self.stabilize_wait);
        self.base.set_collision_protection(true)?;
        self.initialized.store(true, Ordering::SeqCst);
        info!("robot hardware initialized");
        Ok(())
    }

    /// Stop motion and rest the motors.
    pub fn release(&self) {
        if let Err(e) = self.base.stop_move() {
            warn!("stop_move during release failed: {e}");
        }
        if let Err(e) = self.base.rest() {
            warn!("rest during release failed: {e}");
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!("robot hardware released");
    }

    /// Continuous velocity passthrough. Rejected while un-initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the RPC fails.
    pub fn set_base_velocities(&self, vx: f32, vy: f32, vtheta: f32) -> Result<()> {
        if !self.is_initialized() {
            warn!("velocity command dropped: hardware not initialized");
            return Ok(());
        }
        self.base.move_toward(vx, vy, vtheta)
    }

    /// Immediate stop plus interruption of scripted gestures.
    ///
    /// Never propagates RPC errors; safety-critical callers cannot retry.
    pub fn trigger_hardware_emergency_stop(&self) {
        warn!("hardware emergency stop");
        if let Err(e) = self.base.kill_move() {
            warn!("kill_move failed during estop: {e}");
        }
        if let Err(e) = self.base.stop_all_gestures() {
            warn!("stop_all_gestures failed during estop: {e}");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBase {
        calls: Mutex<Vec<String>>,
    }

    impl RobotBase for FakeBase {
        fn wake_up(&self) -> Result<()> {
            self.calls.lock().unwrap().push("wake_up".into());
            Ok(())
        }
        fn rest(&self) -> Result<()> {
            self.calls.lock().unwrap().push("rest".into());
            Ok(())
        }
        fn set_autonomous_life(&self, enabled: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("autonomous_life:{enabled}"));
            Ok(())
        }
        fn stop_move(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop_move".into());
            Ok(())
        }
        fn kill_move(&self) -> Result<()> {
            self.calls.lock().unwrap().push("kill_move".into());
            Ok(())
        }
        fn go_to_posture(&self, posture: &str, _speed: f32) -> Result<()> {
            self.calls.lock().unwrap().push(format!("posture:{posture}"));
            Ok(())
        }
        fn move_toward(&self, vx: f32, vy: f32, vtheta: f32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("move:{vx},{vy},{vtheta}"));
            Ok(())
        }
        fn set_collision_protection(&self, enabled: bool) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("collision:{enabled}"));
            Ok(())
        }
        fn stop_all_gestures(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop_gestures".into());
            Ok(())
        }
    }

    #[test]
    fn velocity_is_dropped_until_initialized() {
        let base = Arc::new(FakeBase::default());
        let hardware = RobotHardware::new(Arc::clone(&base) as Arc<dyn RobotBase>)
            .with_stabilization_wait(Duration::from_millis(1));

        hardware.set_base_velocities(0.5, 0.0, 0.0).unwrap();
        assert!(base.calls.lock().unwrap().is_empty());

        hardware.initialize().unwrap();
        hardware.set_base_velocities(0.5, 0.0, 0.0).unwrap();
        assert!(base
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|call| call == "move:0.5,0,0"));
    }

    #[test]
    fn estop_kills_motion_and_gestures() {
        let base = Arc::new(FakeBase::default());
        let hardware = RobotHardware::new(Arc::clone(&base) as Arc<dyn RobotBase>);
        hardware.trigger_hardware_emergency_stop();
        let calls = base.calls.lock().unwrap();
        assert!(calls.contains(&"kill_move".to_owned()));
        assert!(calls.contains(&"stop_gestures".to_owned()));
    }
}
