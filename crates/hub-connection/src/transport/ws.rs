//! WebSocket transport.
//!
//! Each link runs a read pump and a write pump over a split
//! `tokio-tungstenite` stream; the [`Link`] only sees byte frames.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chathub_protocol::constants::WS_MAX_MESSAGE_SIZE;

use super::{Link, Transport, TransportFuture};

/// Frames buffered in each direction per link.
const LINK_BUFFER_SIZE: usize = 256;

/// Opens WebSocket links (`ws://` / `wss://`).
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    max_message_size: usize,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the maximum inbound message size.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(&'a self, url: &'a str) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(self.max_message_size);
            ws_config.max_frame_size = Some(self.max_message_size);
            let (ws_stream, _) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
            debug!(url, "WebSocket opened");
            let (write, read) = ws_stream.split();

            let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(LINK_BUFFER_SIZE);
            let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER_SIZE);
            let cancel = CancellationToken::new();

            tokio::spawn(crate::pumps::write::write_pump(write, out_rx, cancel.clone()));
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                in_tx,
                self.max_message_size,
                cancel.clone(),
            ));

            Ok(Link::new(out_tx, in_rx, cancel))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_protocol_limit() {
        let t = WebSocketTransport::default();
        assert_eq!(t.max_message_size, WS_MAX_MESSAGE_SIZE);
        let t = WebSocketTransport::new().with_max_message_size(10);
        assert_eq!(t.max_message_size, 10);
    }

    #[tokio::test]
    async fn open_unreachable_endpoint_fails() {
        let t = WebSocketTransport::default();
        // Port 9 (discard) on localhost is almost never listening.
        let result = t.open("ws://127.0.0.1:9/chat").await;
        assert!(result.is_err());
    }
}
