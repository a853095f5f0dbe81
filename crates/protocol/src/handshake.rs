//! Handshake records exchanged once, right after the transport opens.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{PROTOCOL_NAME, PROTOCOL_VERSION, RECORD_SEPARATOR};
use crate::envelope::DecodeError;

/// First record sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_NAME.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

impl HandshakeRequest {
    /// Returns an error message if the requested protocol is unsupported.
    pub fn validate(&self) -> Result<(), String> {
        if self.protocol != PROTOCOL_NAME {
            return Err(format!(
                "The protocol '{}' is not supported.",
                self.protocol
            ));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(format!(
                "The server does not support version {} of the '{}' protocol.",
                self.version, self.protocol
            ));
        }
        Ok(())
    }
}

/// Server reply to the handshake. `{}` on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

/// Encodes a handshake record with its trailing separator.
pub fn encode_handshake<T: Serialize>(record: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(record)?;
    buf.push(RECORD_SEPARATOR);
    Ok(buf)
}

/// Parses the handshake record at the front of a frame.
///
/// Returns the record and whatever follows it; a server may pack its first
/// hub messages into the same frame as the handshake response.
pub fn parse_handshake<T: DeserializeOwned>(frame: &[u8]) -> Result<(T, &[u8]), DecodeError> {
    let end = frame
        .iter()
        .position(|&b| b == RECORD_SEPARATOR)
        .ok_or(DecodeError::Incomplete)?;
    let record = serde_json::from_slice(&frame[..end])?;
    Ok((record, &frame[end + 1..]))
}
