//! WebSocket read pump: forwards inbound frames to the link.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Reads messages from the WebSocket and forwards their payloads in order.
///
/// Exits on cancellation, a close frame, a read error or end of stream.
/// Dropping `inbound` on exit is the link's closed signal.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound: mpsc::Sender<Result<Vec<u8>, TransportError>>,
    max_message_size: usize,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = read.next() => {
                let frame = match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(tungstenite::Message::Binary(data))) => data.to_vec(),
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        trace!("received ping");
                        continue;
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        trace!("received pong");
                        continue;
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        debug!(?frame, "received close frame");
                        break;
                    }
                    Some(Ok(tungstenite::Message::Frame(_))) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        let _ = inbound.send(Err(e.into())).await;
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };

                if frame.len() > max_message_size {
                    warn!("message too large ({} bytes), dropping", frame.len());
                    continue;
                }
                if inbound.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
}
