//! Umebot backend daemon.
//!
//! Loads configuration, wires the orchestrator and runs until interrupted.
//! Robot service bindings are injected here; without real hardware on the
//! network the log-only bindings below let the backend run headless for
//! development against the tablet GUI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use umebot_backend::config::BackendConfig;
use umebot_backend::robot::services::{AnimationPlayer, QianimPlayer, RobotBase, RobotSpeech};
use umebot_backend::stt::parakeet::ParakeetRecognizer;
use umebot_backend::stt::StreamingRecognizer;
use umebot_backend::{Orchestrator, RobotServices};

/// Log-only robot base for running without hardware.
struct LoggingBase;

impl RobotBase for LoggingBase {
    fn wake_up(&self) -> umebot_backend::Result<()> {
        info!("robot: wake_up");
        Ok(())
    }
    fn rest(&self) -> umebot_backend::Result<()> {
        info!("robot: rest");
        Ok(())
    }
    fn set_autonomous_life(&self, enabled: bool) -> umebot_backend::Result<()> {
        info!("robot: autonomous life {enabled}");
        Ok(())
    }
    fn stop_move(&self) -> umebot_backend::Result<()> {
        info!("robot: stop_move");
        Ok(())
    }
    fn kill_move(&self) -> umebot_backend::Result<()> {
        info!("robot: kill_move");
        Ok(())
    }
    fn go_to_posture(&self, posture: &str, speed: f32) -> umebot_backend::Result<()> {
        info!("robot: posture {posture} at {speed}");
        Ok(())
    }
    fn move_toward(&self, vx: f32, vy: f32, vtheta: f32) -> umebot_backend::Result<()> {
        info!("robot: move_toward({vx:.3}, {vy:.3}, {vtheta:.3})");
        Ok(())
    }
    fn set_collision_protection(&self, enabled: bool) -> umebot_backend::Result<()> {
        info!("robot: collision protection {enabled}");
        Ok(())
    }
    fn stop_all_gestures(&self) -> umebot_backend::Result<()> {
        info!("robot: stop_all_gestures");
        Ok(())
    }
}

/// Log-only animated speech.
struct LoggingSpeech;

impl RobotSpeech for LoggingSpeech {
    fn animated_say(&self, annotated_text: &str) -> umebot_backend::Result<()> {
        info!("robot says: {annotated_text}");
        Ok(())
    }
    fn stop_all_speech(&self) -> umebot_backend::Result<()> {
        info!("robot: stop_all_speech");
        Ok(())
    }
}

/// Log-only animation player.
struct LoggingAnimations;

impl AnimationPlayer for LoggingAnimations {
    fn run_tag(&self, tag: &str) -> umebot_backend::Result<()> {
        info!("robot animation tag: {tag}");
        Ok(())
    }
}

impl QianimPlayer for LoggingAnimations {
    fn play_file(&self, path: &Path) -> umebot_backend::Result<()> {
        info!("robot animation file: {}", path.display());
        Ok(())
    }
}

fn config_path() -> PathBuf {
    if let Some(arg) = std::env::args().nth(1) {
        return PathBuf::from(arg);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("umebot")
        .join("backend.toml")
}

fn init_tracing() {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let log_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("umebot")
        .join("logs");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "backend.log");
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender.and(std::io::stderr))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = config_path();
    let config = if path.exists() {
        BackendConfig::load(&path)?
    } else {
        warn!("config file {} not found, using defaults", path.display());
        BackendConfig::default()
    };

    let recognizer: Option<Box<dyn StreamingRecognizer>> = if config.audio.enabled {
        let recognizer = ParakeetRecognizer::load(
            &config.stt.model_dir,
            config.audio.target_sample_rate,
        )?;
        Some(Box::new(recognizer))
    } else {
        None
    };

    let animations = Arc::new(LoggingAnimations);
    let services = RobotServices {
        base: Arc::new(LoggingBase),
        speech: Arc::new(LoggingSpeech),
        animation_player: Some(animations.clone()),
        qianim_player: Some(animations),
    };

    let orchestrator = Orchestrator::start(config, services, recognizer)
        .await
        .map_err(|e| anyhow::anyhow!("startup failed: {e}"))?;

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(loop_cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    cancel.cancel();
    let _ = runner.await;
    orchestrator.shutdown().await;

    info!("backend stopped");
    Ok(())
}
