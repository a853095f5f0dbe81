use std::fmt;
use std::time::Duration;

/// Terminates every JSON record on the wire.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Hub protocol name negotiated in the handshake.
pub const PROTOCOL_NAME: &str = "json";

/// Hub protocol version negotiated in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default path the chat hub is mounted at.
pub const DEFAULT_HUB_PATH: &str = "/chat";

/// How often either side sends a `Ping` record when otherwise idle.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Client-side read deadline.
///
/// If *nothing* arrives from the server within this window (no ping, no
/// completion, no push event) the transport is considered lost.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side read deadline for a single session.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for the handshake exchange after the transport opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum WebSocket message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Client → server: fire-and-forget broadcast of a chat message.
pub const METHOD_BROADCAST: &str = "Broadcast";

/// Client → server: request-response joke.
pub const METHOD_DAD_JOKE: &str = "DadJoke";

/// Client → server: countdown stream.
pub const METHOD_COUNT_DOWN: &str = "CountDown";

/// Server → client: push event carrying a chat message.
pub const EVENT_NEW_MESSAGE: &str = "NewMessage";

/// Numeric `type` tag of a hub message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    /// Returns `true` for kinds that must carry an `invocationId`.
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            MessageType::StreamItem
                | MessageType::Completion
                | MessageType::StreamInvocation
                | MessageType::CancelInvocation
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Invocation,
            2 => MessageType::StreamItem,
            3 => MessageType::Completion,
            4 => MessageType::StreamInvocation,
            5 => MessageType::CancelInvocation,
            6 => MessageType::Ping,
            7 => MessageType::Close,
            other => return Err(other),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Invocation => "Invocation",
            MessageType::StreamItem => "StreamItem",
            MessageType::Completion => "Completion",
            MessageType::StreamInvocation => "StreamInvocation",
            MessageType::CancelInvocation => "CancelInvocation",
            MessageType::Ping => "Ping",
            MessageType::Close => "Close",
        };
        f.write_str(name)
    }
}
