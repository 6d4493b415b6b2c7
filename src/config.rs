//! Configuration types for the robot backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Local microphone capture settings.
    pub audio: AudioConfig,
    /// Robot-streamed audio ingestion settings.
    pub robot_audio: RobotAudioConfig,
    /// Speech recognition settings.
    pub stt: SttConfig,
    /// Conversation core settings.
    pub conversation: ConversationConfig,
    /// Language model backend settings.
    pub llm: LlmConfig,
    /// Expression controller settings.
    pub expression: ExpressionConfig,
    /// Motion arbiter and gamepad settings.
    pub motion: MotionConfig,
    /// Robot hardware lifecycle settings.
    pub robot: RobotConfig,
    /// Tablet gateway settings.
    pub gateway: GatewayConfig,
    /// Interaction store settings.
    pub store: StoreConfig,
}

/// Robot hardware lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Wait after the initialization posture move, in ms, for the physical
    /// platform to stabilize before motion commands are accepted.
    pub stabilization_wait_ms: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            stabilization_wait_ms: 2500,
        }
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::UmebotError::Config(format!(
                "cannot read config file {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&raw)
            .map_err(|e| crate::error::UmebotError::Config(format!("invalid config: {e}")))
    }
}

/// Which audio source feeds the recognition pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    /// Local microphone attached to the backend host.
    Local,
    /// PCM streamed from the robot's head microphones over TCP.
    #[default]
    Robot,
    /// No audio source active.
    None,
}

impl AudioSourceKind {
    /// Parse the wire-protocol name for a source (`"local"`, `"robot"`, `"none"`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "robot" => Some(Self::Robot),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Wire-protocol name for this source.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Robot => "robot",
            Self::None => "none",
        }
    }
}

/// Local microphone capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Whether audio ingestion workers start at all.
    pub enabled: bool,
    /// Substring matched against input device names (None = system default).
    pub input_device_substring: Option<String>,
    /// Preferred capture rate probed before the target rate.
    pub preferred_sample_rate: Option<u32>,
    /// Pipeline sample rate in Hz. The recognizer is fed at this rate.
    pub target_sample_rate: u32,
    /// Bounded intake queue length (raw capture frames). Oldest dropped on overflow.
    pub intake_queue_frames: usize,
    /// Device-open retry attempts before giving up.
    pub open_retry_attempts: u32,
    /// Delay between device-open retries, in seconds.
    pub open_retry_delay_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_device_substring: None,
            preferred_sample_rate: None,
            target_sample_rate: 16_000,
            intake_queue_frames: 64,
            open_retry_attempts: 3,
            open_retry_delay_secs: 5,
        }
    }
}

/// Robot-streamed audio ingestion configuration.
///
/// The robot pushes raw interleaved signed 16-bit little-endian PCM over a
/// plain TCP connection with no framing headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotAudioConfig {
    /// TCP port the ingestion listener binds to.
    pub port: u16,
    /// Sample rate of the incoming stream in Hz.
    pub incoming_sample_rate: u32,
    /// Channel count of the incoming stream.
    pub incoming_channels: u16,
    /// Bounded intake queue length (half-second segments).
    pub intake_queue_segments: usize,
}

impl Default for RobotAudioConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            incoming_sample_rate: 16_000,
            incoming_channels: 2,
            intake_queue_segments: 16,
        }
    }
}

impl RobotAudioConfig {
    /// Bytes in one half-second segment of the incoming stream.
    pub fn segment_bytes(&self) -> usize {
        self.incoming_channels as usize * 2 * self.incoming_sample_rate as usize / 2
    }
}

/// Speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Audio source selected at startup.
    pub default_source: AudioSourceKind,
    /// Directory holding the recognizer model files.
    pub model_dir: PathBuf,
    /// Whether voice-activity gating is enabled.
    pub vad_enabled: bool,
    /// VAD aggressiveness, 0 (permissive) to 3 (aggressive).
    pub vad_aggressiveness: u8,
    /// VAD frame duration in ms (10, 20 or 30).
    pub vad_frame_ms: u32,
    /// Seconds of silence after speech before the utterance is force-finalized.
    pub silence_timeout_secs: f32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            default_source: AudioSourceKind::Robot,
            model_dir: PathBuf::from("models/parakeet-tdt"),
            vad_enabled: true,
            vad_aggressiveness: 2,
            vad_frame_ms: 30,
            silence_timeout_secs: 2.0,
        }
    }
}

/// Conversation core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// User identity recorded on conversations.
    pub user_id: String,
    /// Maximum prior interactions included in the prompt.
    pub history_limit: usize,
    /// Path to the Q&A knowledge base JSON (optional).
    pub knowledge_base_path: Option<PathBuf>,
    /// Free-text context appended to the system prompt (optional).
    pub file_context: Option<String>,
    /// Path to the personality catalogue TOML.
    pub personalities_path: PathBuf,
    /// Key of the personality active at startup.
    pub default_personality: String,
    /// Snippets retrieved from the knowledge base per request.
    pub knowledge_top_k: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            user_id: "default_user".to_owned(),
            history_limit: 10,
            knowledge_base_path: None,
            file_context: None,
            personalities_path: PathBuf::from("personalities.toml"),
            default_personality: "umebot".to_owned(),
            knowledge_top_k: 3,
        }
    }
}

/// Which LM backend is active at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmBackendKind {
    /// Remote chat-completions API.
    Cloud,
    /// In-process GGUF inference.
    Local,
    /// No backend; conversational input gets a canned reply.
    #[default]
    None,
}

impl LmBackendKind {
    /// Parse the wire-protocol name for a backend (`"cloud"`, `"local"`, `"none"`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cloud" => Some(Self::Cloud),
            "local" => Some(Self::Local),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Wire-protocol name for this backend.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
            Self::None => "none",
        }
    }
}

/// Language model backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend activated at startup.
    pub backend: LmBackendKind,
    /// Cloud API base URL (must expose `/chat/completions`).
    pub api_url: String,
    /// Cloud API key. Empty means unauthenticated (local proxies).
    pub api_key: String,
    /// Cloud model name.
    pub model_name: String,
    /// GGUF model file path for the local backend.
    pub model_path: PathBuf,
    /// Context window in tokens for the local backend.
    pub context_size: usize,
    /// Chat template hint for the local backend (informational; mistralrs
    /// reads the template from GGUF metadata).
    pub chat_format: String,
    /// Sampling limit for both backends.
    pub max_tokens: usize,
    /// Sampling temperature for both backends.
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LmBackendKind::None,
            api_url: "https://api.openai.com/v1".to_owned(),
            api_key: String::new(),
            model_name: "gpt-4o-mini".to_owned(),
            model_path: PathBuf::from("models/local.gguf"),
            context_size: 4096,
            chat_format: String::new(),
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Expression controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpressionConfig {
    /// Base directory scanned for local-animation categories.
    ///
    /// Each subdirectory is a category containing `.qianim` files.
    pub animations_dir: PathBuf,
    /// Utterance spoken when the user talks while the backend is busy.
    pub busy_utterance: String,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            animations_dir: PathBuf::from("animations"),
            busy_utterance: "^runTag(thinking) Un momento por favor, sigo con lo anterior."
                .to_owned(),
        }
    }
}

/// One action bound to a gamepad button on a given animation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GamepadAction {
    /// Play a `.qianim` file from a category (random pick when `name` is unset).
    LocalAnim {
        category: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Run a tag known to the robot's built-in animation player.
    StandardTag { tag: String },
    /// Speak annotated text through the expression controller.
    SpeakAnnotated { text: String },
    /// Button bound to nothing on this layer.
    #[default]
    None,
}

/// Button-to-action bindings for one animation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GamepadLayer {
    pub a: GamepadAction,
    pub b: GamepadAction,
    pub x: GamepadAction,
    pub y: GamepadAction,
}

impl GamepadLayer {
    /// Look up the action bound to a button key (`"a"`, `"b"`, `"x"`, `"y"`).
    pub fn action(&self, button: &str) -> &GamepadAction {
        match button {
            "a" => &self.a,
            "b" => &self.b,
            "x" => &self.x,
            "y" => &self.y,
            _ => &GamepadAction::None,
        }
    }
}

/// Motion arbiter and gamepad mapping configuration.
///
/// Velocity conventions follow the robot base: positive `vx` is forward,
/// positive `vy` strafes left, positive `vtheta` rotates counter-clockwise.
/// Axis signs are configurable because gamepad drivers disagree on stick
/// polarity; verify per hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Stick dead-zone; raw values with magnitude below this are treated as 0.
    pub deadzone: f32,
    /// Dead-man timeout in ms; no payload within this window forces zero velocity.
    pub deadman_timeout_ms: u64,
    /// Speed modifier applied at startup, clamped to [0.1, 1.0].
    pub initial_speed_modifier: f32,
    /// Sign applied to left-stick Y when mapping to `vx`.
    pub axis_sign_vx: f32,
    /// Sign applied to left-stick X when mapping to `vy`.
    pub axis_sign_vy: f32,
    /// Sign applied to right-stick X when mapping to `vtheta`.
    pub axis_sign_vtheta: f32,
    /// Whether gamepad control activates during startup.
    pub activate_on_start: bool,
    /// Button bindings per animation layer; D-pad left/right rotates through
    /// them in order.
    pub layers: Vec<GamepadLayer>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            deadzone: 0.08,
            deadman_timeout_ms: 350,
            initial_speed_modifier: 0.5,
            axis_sign_vx: 1.0,
            axis_sign_vy: -1.0,
            axis_sign_vtheta: -1.0,
            activate_on_start: false,
            layers: Vec::new(),
        }
    }
}

/// Tablet gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind host for the HTTP + WebSocket server.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Sender name stamped on outbound `output` and `system` frames.
    pub sender_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8765,
            sender_name: "Umebot".to_owned(),
        }
    }
}

/// Interaction store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file path. None resolves to the platform data directory.
    pub db_path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the platform data directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(ref path) = self.db_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("umebot")
            .join("interactions.db")
    }
}
