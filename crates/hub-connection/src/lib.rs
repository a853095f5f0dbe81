//! Client connection to a chat hub.
//!
//! Provides the connection state machine with automatic reconnect,
//! request/response and fire-and-forget invocations, typed push-event
//! handlers, and cancellable server-to-client streams.

pub mod args;
mod connection;
mod dispatcher;
pub mod error;
mod pumps;
pub mod reconnection;
pub mod registry;
mod stream;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use args::HubArgs;
pub use connection::{HubConnection, HubConnectionBuilder};
pub use error::{HubError, TransportError};
pub use reconnection::{
    DefaultReconnectPolicy, ExponentialBackoff, NoReconnect, ReconnectPolicy, RetryContext,
};
pub use stream::StreamHandle;
pub use transport::{Link, Transport, WebSocketTransport};
pub use types::{ConnectionEvent, ConnectionState, EventSink};
