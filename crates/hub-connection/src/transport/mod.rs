//! Transport boundary.
//!
//! A [`Transport`] opens [`Link`]s: ordered, reliable pipes of opaque byte
//! frames. The connection owns at most one link at a time and is the only
//! writer to it.

mod ws;

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

pub use ws::WebSocketTransport;

/// Boxed future returned by [`Transport::open`].
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send + 'a>>;

/// Opens links to a hub endpoint.
pub trait Transport: Send + Sync + 'static {
    fn open<'a>(&'a self, url: &'a str) -> TransportFuture<'a>;
}

/// One open transport link.
///
/// Inbound frames arrive in order on [`recv`](Self::recv); the stream ends
/// (`None`) when the link closes. Dropping the link closes it.
pub struct Link {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    cancel: CancellationToken,
}

impl Link {
    /// Wraps the channel ends of a transport's pumps.
    ///
    /// Cancelling `cancel` must stop the pumps and release the underlying
    /// connection.
    pub fn new(
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { tx, rx, cancel }
    }

    /// Returns a sender for outbound frames.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    /// Queues one outbound frame.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Receives the next inbound frame, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await
    }

    /// Token cancelled when the link closes; for helper tasks bound to it.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Closes the link.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
