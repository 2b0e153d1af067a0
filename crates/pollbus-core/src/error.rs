//! Centralized error types for the bus.

use thiserror::Error;

/// Main error type for bus operations.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus.Bus only string channels are allowed.")]
    InvalidChannel,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed control message: {0}")]
    MalformedMessage(String),

    #[error("Consumer backlog exceeded {limit} pending notifications")]
    BacklogExceeded { limit: usize },

    #[error("Session closed")]
    SessionClosed,

    #[error("bus.Bus unavailable: dispatcher is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a malformed control message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error was caused by the caller's input rather than the bus.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannel | Self::InvalidInput(_) | Self::MalformedMessage(_)
        )
    }
}
