//! Public types for the hub connection.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::error::HubError;

/// Lifecycle state of a [`HubConnection`](crate::HubConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial and terminal state. No transport is open.
    Disconnected,
    /// Transport open and handshake in progress.
    Connecting,
    /// Handshake done; sends are accepted.
    Connected,
    /// Transport lost, retrying per the reconnect policy.
    Reconnecting { attempt: u32 },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
        }
    }
}

/// Lifecycle notifications emitted by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The state machine moved to a new state.
    StateChanged(ConnectionState),
    /// `start()` completed the handshake.
    Connected,
    /// `start()` could not open the transport. No retry is attempted.
    ConnectionFailed { error: HubError },
    /// The transport was lost and a reconnect attempt is scheduled.
    Reconnecting {
        attempt: u32,
        next_retry: Duration,
        error: HubError,
    },
    /// A reconnect attempt succeeded; pending calls survived.
    Reconnected,
    /// The connection reached `Disconnected`. `None` after a manual stop.
    Closed { error: Option<HubError> },
}

/// Receives [`ConnectionEvent`]s.
///
/// Called synchronously from the connection's own task; implementations
/// must not block and are responsible for moving work onto their own
/// execution context.
pub trait EventSink: Send + Sync + 'static {
    fn on_event(&self, event: ConnectionEvent);
}

/// Drops events the receiver has no room for. An untaken receiver fills
/// up and stays full, so overflow is only traced.
impl EventSink for mpsc::Sender<ConnectionEvent> {
    fn on_event(&self, event: ConnectionEvent) {
        match self.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                trace!(?event, "event channel full, dropping connection event");
            }
        }
    }
}

impl EventSink for mpsc::UnboundedSender<ConnectionEvent> {
    fn on_event(&self, event: ConnectionEvent) {
        let _ = self.send(event);
    }
}

/// Capacity of the default event channel.
pub(crate) const EVENT_BUFFER_SIZE: usize = 64;
