//! Error types for Testscope

use thiserror::Error;

/// Result type alias using Testscope Error
pub type Result<T> = std::result::Result<T, Error>;

/// Testscope error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Domain-level failure reported by the inspector for a command.
    #[error("Inspector error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Inspector connection closed")]
    ConnectionClosed,

    #[error("Inspector not connected")]
    NotConnected,

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this is the inspector refusing to enable a domain twice.
    pub fn is_already_enabled(&self) -> bool {
        match self {
            Error::Remote { message, .. } => message.contains("already enabled"),
            _ => false,
        }
    }

    /// Whether the failure came from the transport rather than the remote domain.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_) | Error::ConnectionClosed | Error::NotConnected | Error::Io(_)
        )
    }
}
