use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Why a broker session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connection closed by broker")]
    Closed,
    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("token rejected: {0}")]
    TokenRejected(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("unexpected frame during handshake: {0}")]
    UnexpectedFrame(String),
    #[error("no frame received within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("outbound writer stopped")]
    WriterGone,
}

impl SessionError {
    /// Explicit rejection unrelated to token expiry. Never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }

    /// Classify an `auth_fail` reason.
    pub fn from_auth_fail(reason: String) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("invalid token") || lower.contains("token invalid") || lower.contains("expired") {
            Self::TokenRejected(reason)
        } else {
            Self::AuthRejected(reason)
        }
    }
}
