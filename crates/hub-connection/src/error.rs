//! Error types for the hub connection.

use tokio_tungstenite::tungstenite;

use crate::types::ConnectionState;

/// Errors surfaced to callers of the hub connection.
///
/// `Clone` because one failure (a drain on connection loss) is delivered to
/// every pending call at once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("not connected")]
    NotConnected,

    #[error("operation not allowed while {0}")]
    InvalidState(ConnectionState),

    #[error("invocation id {0} is already registered")]
    DuplicateId(String),

    #[error("no active stream with invocation id {0}")]
    NoSuchStream(String),

    #[error("connection closed{}", .0.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    ConnectionClosed(Option<String>),

    #[error("connection stopped")]
    Stopped,

    #[error("stream cancelled")]
    StreamCancelled,

    #[error("server error: {0}")]
    Server(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<TransportError> for HubError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => HubError::ConnectionClosed(None),
            other => HubError::Transport(other.to_string()),
        }
    }
}

/// Errors from a transport link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}
