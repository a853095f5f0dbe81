//! Hub message envelope and its JSON record codec.
//!
//! Every message is a JSON object with a numeric `type` tag, terminated by
//! [`RECORD_SEPARATOR`]. A single transport frame may carry several records.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::{MessageType, RECORD_SEPARATOR};

/// Errors produced while decoding a record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("{0} message is missing its invocationId")]
    MissingInvocationId(MessageType),

    #[error("{kind} message is missing required field '{field}'")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },

    #[error("completion carries both a result and an error")]
    ConflictingCompletion,

    #[error("record is not terminated by the record separator")]
    Incomplete,
}

/// One decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Method call. Without an id it is fire-and-forget.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Request for a server-to-client stream.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },
    /// One item of an active stream.
    StreamItem { invocation_id: String, item: Value },
    /// Terminal signal for a request or stream.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Client asks the server to stop producing a stream.
    CancelInvocation { invocation_id: String },
    /// Keep-alive.
    Ping,
    /// Server is closing the connection.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    /// Creates a correlated request-response invocation.
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Creates a fire-and-forget invocation (no id, no completion).
    pub fn send(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Creates a successful completion, optionally carrying a result.
    pub fn completion(invocation_id: impl Into<String>, result: Option<Value>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result,
            error: None,
        }
    }

    /// Creates a failed completion.
    pub fn completion_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        HubMessage::Completion {
            invocation_id: invocation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Returns the wire tag for this message.
    pub fn msg_type(&self) -> MessageType {
        match self {
            HubMessage::Invocation { .. } => MessageType::Invocation,
            HubMessage::StreamInvocation { .. } => MessageType::StreamInvocation,
            HubMessage::StreamItem { .. } => MessageType::StreamItem,
            HubMessage::Completion { .. } => MessageType::Completion,
            HubMessage::CancelInvocation { .. } => MessageType::CancelInvocation,
            HubMessage::Ping => MessageType::Ping,
            HubMessage::Close { .. } => MessageType::Close,
        }
    }

    /// Returns the correlation id, if the message carries one.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            HubMessage::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            HubMessage::StreamInvocation { invocation_id, .. }
            | HubMessage::StreamItem { invocation_id, .. }
            | HubMessage::Completion { invocation_id, .. }
            | HubMessage::CancelInvocation { invocation_id } => Some(invocation_id),
            HubMessage::Ping | HubMessage::Close { .. } => None,
        }
    }
}

/// Flat wire shape shared by all message kinds.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    msg_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    item: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

/// Keeps an explicit `null` distinguishable from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl From<&HubMessage> for RawMessage {
    fn from(msg: &HubMessage) -> Self {
        let mut raw = RawMessage {
            msg_type: msg.msg_type() as u8,
            ..RawMessage::default()
        };
        match msg {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                raw.invocation_id = invocation_id.clone();
                raw.target = Some(target.clone());
                raw.arguments = Some(arguments.clone());
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => {
                raw.invocation_id = Some(invocation_id.clone());
                raw.target = Some(target.clone());
                raw.arguments = Some(arguments.clone());
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                raw.invocation_id = Some(invocation_id.clone());
                raw.item = Some(item.clone());
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                raw.invocation_id = Some(invocation_id.clone());
                raw.result = result.clone();
                raw.error = error.clone();
            }
            HubMessage::CancelInvocation { invocation_id } => {
                raw.invocation_id = Some(invocation_id.clone());
            }
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                raw.error = error.clone();
                raw.allow_reconnect = allow_reconnect.then_some(true);
            }
        }
        raw
    }
}

impl TryFrom<RawMessage> for HubMessage {
    type Error = DecodeError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let kind = MessageType::try_from(raw.msg_type).map_err(DecodeError::UnknownType)?;

        let invocation_id = raw.invocation_id;
        if kind.is_correlated() && invocation_id.is_none() {
            return Err(DecodeError::MissingInvocationId(kind));
        }
        let id = || invocation_id.clone().unwrap_or_default();
        let target = || {
            raw.target
                .clone()
                .ok_or(DecodeError::MissingField { kind, field: "target" })
        };

        Ok(match kind {
            MessageType::Invocation => HubMessage::Invocation {
                invocation_id: invocation_id.clone(),
                target: target()?,
                arguments: raw.arguments.clone().unwrap_or_default(),
            },
            MessageType::StreamInvocation => HubMessage::StreamInvocation {
                invocation_id: id(),
                target: target()?,
                arguments: raw.arguments.clone().unwrap_or_default(),
            },
            MessageType::StreamItem => HubMessage::StreamItem {
                invocation_id: id(),
                item: raw
                    .item
                    .ok_or(DecodeError::MissingField { kind, field: "item" })?,
            },
            MessageType::Completion => {
                if raw.result.is_some() && raw.error.is_some() {
                    return Err(DecodeError::ConflictingCompletion);
                }
                HubMessage::Completion {
                    invocation_id: id(),
                    result: raw.result,
                    error: raw.error,
                }
            }
            MessageType::CancelInvocation => HubMessage::CancelInvocation {
                invocation_id: id(),
            },
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            },
        })
    }
}

/// Encodes a message as one separator-terminated JSON record.
pub fn encode(msg: &HubMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(&RawMessage::from(msg))?;
    buf.push(RECORD_SEPARATOR);
    Ok(buf)
}

/// Decodes a single record (without its trailing separator).
pub fn decode(record: &[u8]) -> Result<HubMessage, DecodeError> {
    let raw: RawMessage = serde_json::from_slice(record)?;
    HubMessage::try_from(raw)
}

/// Splits a transport frame into its records.
///
/// Empty records are skipped. Trailing bytes without a separator yield a
/// single [`DecodeError::Incomplete`].
pub fn records(frame: &[u8]) -> Records<'_> {
    Records { rest: frame }
}

/// Iterator returned by [`records`].
pub struct Records<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            match self.rest.iter().position(|&b| b == RECORD_SEPARATOR) {
                Some(0) => {
                    self.rest = &self.rest[1..];
                }
                Some(end) => {
                    let record = &self.rest[..end];
                    self.rest = &self.rest[end + 1..];
                    return Some(Ok(record));
                }
                None => {
                    self.rest = &[];
                    return Some(Err(DecodeError::Incomplete));
                }
            }
        }
    }
}

/// Decodes every record in a frame, preserving order.
pub fn decode_frame(frame: &[u8]) -> Vec<Result<HubMessage, DecodeError>> {
    records(frame)
        .map(|record| record.and_then(decode))
        .collect()
}
