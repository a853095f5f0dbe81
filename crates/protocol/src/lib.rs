//! Wire protocol for the chat hub.
//!
//! JSON records terminated by `0x1E`: a one-off handshake followed by
//! invocation, stream, completion and control messages.

pub mod constants;
pub mod envelope;
pub mod handshake;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{DecodeError, HubMessage, decode, decode_frame, encode, records};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use messages::ChatMessage;
