//! Robot RPC service surfaces.
//!
//! The actual robot binding lives outside this crate; these traits are the
//! seams the backend drives. Calls are blocking RPC round-trips, so async
//! callers run them on `spawn_blocking` and the motion arbiter calls them
//! straight from its worker thread.

use crate::error::Result;
use std::path::Path;

/// Base locomotion and lifecycle service.
pub trait RobotBase: Send + Sync {
    /// Wake the motors.
    fn wake_up(&self) -> Result<()>;

    /// Rest the motors.
    fn rest(&self) -> Result<()>;

    /// Enable or disable the robot's autonomous-life behaviors.
    fn set_autonomous_life(&self, enabled: bool) -> Result<()>;

    /// Stop any in-progress base motion.
    fn stop_move(&self) -> Result<()>;

    /// Immediately kill base motion (emergency path).
    fn kill_move(&self) -> Result<()>;

    /// Drive to a named posture at the given fraction of maximum speed.
    fn go_to_posture(&self, posture: &str, speed: f32) -> Result<()>;

    /// Continuous base velocity command. Positive `vx` is forward, positive
    /// `vy` strafes left, positive `vtheta` rotates counter-clockwise.
    fn move_toward(&self, vx: f32, vy: f32, vtheta: f32) -> Result<()>;

    /// Enable or disable external collision protection.
    fn set_collision_protection(&self, enabled: bool) -> Result<()>;

    /// Interrupt any in-progress scripted gesture.
    fn stop_all_gestures(&self) -> Result<()>;
}

/// Animated speech service (text with inline animation tags).
pub trait RobotSpeech: Send + Sync {
    /// Speak annotated text; blocks until the utterance completes.
    fn animated_say(&self, annotated_text: &str) -> Result<()>;

    /// Stop all in-progress and queued speech.
    fn stop_all_speech(&self) -> Result<()>;
}

/// Built-in animation player, addressed by string tag.
pub trait AnimationPlayer: Send + Sync {
    /// Run a tagged animation; blocks until it completes.
    fn run_tag(&self, tag: &str) -> Result<()>;
}

/// Player for `.qianim` animation files.
pub trait QianimPlayer: Send + Sync {
    /// Play one animation file; blocks until it completes.
    fn play_file(&self, path: &Path) -> Result<()>;
}
