//! In-memory transport for state machine tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chathub_protocol::handshake::{encode_handshake, parse_handshake};
use chathub_protocol::{HandshakeRequest, HandshakeResponse, HubMessage, decode_frame, encode};

use crate::error::TransportError;
use crate::transport::{Link, Transport, TransportFuture};
use crate::types::ConnectionEvent;

const WAIT: Duration = Duration::from_secs(120);

struct Shared {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    fail_next: AtomicU32,
    opens: AtomicU32,
}

/// Client half: every `open` hands a fresh [`ServerEnd`] to the server.
pub(crate) struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Server half: accepts links opened by the client.
pub(crate) struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
    shared: Arc<Shared>,
}

pub(crate) fn memory_transport() -> (MemoryTransport, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accept_tx,
        fail_next: AtomicU32::new(0),
        opens: AtomicU32::new(0),
    });
    (
        MemoryTransport {
            shared: Arc::clone(&shared),
        },
        MemoryServer { accept_rx, shared },
    )
}

impl Transport for MemoryTransport {
    fn open<'a>(&'a self, _url: &'a str) -> TransportFuture<'a> {
        Box::pin(async move {
            self.shared.opens.fetch_add(1, Ordering::SeqCst);
            let refuse = self
                .shared
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(TransportError::Other("connection refused".into()));
            }

            let cancel = CancellationToken::new();
            let (client_tx, client_out) = mpsc::channel::<Vec<u8>>(64);
            let (server_in_tx, server_in) = mpsc::channel::<Vec<u8>>(64);
            let (server_tx, server_out) = mpsc::channel::<Result<Vec<u8>, TransportError>>(64);
            let (client_in_tx, client_rx) = mpsc::channel(64);

            tokio::spawn(forward(client_out, server_in_tx, cancel.clone()));
            tokio::spawn(forward(server_out, client_in_tx, cancel.clone()));

            self.shared
                .accept_tx
                .send(ServerEnd {
                    rx: server_in,
                    tx: server_tx,
                    buffered: VecDeque::new(),
                })
                .map_err(|_| TransportError::Other("server gone".into()))?;
            Ok(Link::new(client_tx, client_rx, cancel))
        })
    }
}

/// Moves frames until either side hangs up or the link is closed; dropping
/// both ends then tells the peer the link is gone.
async fn forward<T>(mut rx: mpsc::Receiver<T>, tx: mpsc::Sender<T>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

impl MemoryServer {
    pub(crate) async fn accept(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.accept_rx.recv())
            .await
            .expect("timed out waiting for open")
            .expect("transport dropped")
    }

    /// Makes the next `n` opens fail.
    pub(crate) fn fail_next_opens(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

/// Server side of one memory link. Dropping it closes the link.
pub(crate) struct ServerEnd {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Result<Vec<u8>, TransportError>>,
    buffered: VecDeque<HubMessage>,
}

impl ServerEnd {
    pub(crate) async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Reads the handshake request and accepts it.
    pub(crate) async fn handshake(&mut self) {
        self.handshake_with(&[]).await;
    }

    /// Accepts the handshake, packing `messages` into the same frame.
    pub(crate) async fn handshake_with(&mut self, messages: &[HubMessage]) {
        let request = self.read_handshake().await;
        assert_eq!(request, HandshakeRequest::default());
        let mut frame = encode_handshake(&HandshakeResponse::ok()).unwrap();
        for msg in messages {
            frame.extend(encode(msg).unwrap());
        }
        self.send_raw(frame).await;
    }

    pub(crate) async fn reject_handshake(&mut self, error: &str) {
        self.read_handshake().await;
        self.send_raw(encode_handshake(&HandshakeResponse::error(error)).unwrap())
            .await;
    }

    async fn read_handshake(&mut self) -> HandshakeRequest {
        let frame = self.recv_frame().await.expect("link closed before handshake");
        let (request, rest) = parse_handshake::<HandshakeRequest>(&frame).unwrap();
        assert!(rest.is_empty());
        request
    }

    /// Next non-ping message from the client.
    pub(crate) async fn recv_message(&mut self) -> Option<HubMessage> {
        loop {
            if let Some(msg) = self.buffered.pop_front() {
                if msg != HubMessage::Ping {
                    return Some(msg);
                }
                continue;
            }
            let frame = self.recv_frame().await?;
            for msg in decode_frame(&frame) {
                self.buffered.push_back(msg.unwrap());
            }
        }
    }

    pub(crate) async fn send(&self, msg: &HubMessage) {
        self.send_raw(encode(msg).unwrap()).await;
    }

    pub(crate) async fn send_raw(&self, frame: Vec<u8>) {
        let _ = self.tx.send(Ok(frame)).await;
    }
}

/// Waits for the first event matching `pred`, skipping the rest.
pub(crate) async fn wait_for(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}
