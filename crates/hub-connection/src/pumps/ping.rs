//! Keep-alive pump: periodic `Ping` records.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chathub_protocol::{HubMessage, encode};

/// Sends a `Ping` record every `period` until cancelled or the link closes.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<Vec<u8>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let Ok(ping) = encode(&HubMessage::Ping) else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if write_tx.send(ping.clone()).await.is_err() {
                    break;
                }
            }
        }
    }
}
