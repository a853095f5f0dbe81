//! WebSocket server for chat hubs.
//!
//! Accepts any number of concurrent sessions over WebSocket, performs the
//! protocol handshake, dispatches invocations to a [`Hub`] implementation,
//! and runs each stream invocation as its own cancellable task.

mod chat;
mod hub;
mod server;
mod session;

pub use chat::{ChatHub, ChatHubConfig};
pub use hub::{
    ClientProxy, Clients, Hub, HubContext, HubFuture, HubMethods, MethodKind, MethodSpec,
    StreamWriter,
};
pub use server::{HubServer, ServerConfig};
pub use session::{SendError, Sender};

/// Send buffer capacity per session.
///
/// Push events use `try_send`; a slow client that fills the buffer loses
/// events instead of stalling every other session.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("stream cancelled")]
    StreamCancelled,

    #[error("session closed")]
    SessionClosed,
}
