//! Error types for the robot backend.

/// Top-level error type for the orchestration backend.
#[derive(Debug, thiserror::Error)]
pub enum UmebotError {
    /// Audio device, stream, or ingestion error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model backend error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Conversation state error.
    #[error("conversation error: {0}")]
    Conversation(String),

    /// Interaction store error.
    #[error("store error: {0}")]
    Store(String),

    /// Robot expression (speech/animation) error.
    #[error("expression error: {0}")]
    Expression(String),

    /// Motion arbiter error.
    #[error("motion error: {0}")]
    Motion(String),

    /// Robot hardware RPC error.
    #[error("robot error: {0}")]
    Robot(String),

    /// Tablet gateway error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UmebotError>;
