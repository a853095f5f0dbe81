//! Session management: read/write pumps, keep-alive, client timeout,
//! invocation dispatch and stream tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use chathub_protocol::constants::WS_MAX_MESSAGE_SIZE;
use chathub_protocol::{HubMessage, decode_frame, encode};

use crate::hub::{Hub, HubContext, MethodKind, Sessions, StreamWriter};
use crate::{SEND_BUFFER_SIZE, ServerError};

/// Handle for sending messages to one session.
///
/// Cloneable and cheap; wraps an `mpsc::Sender` of encoded records.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Sender {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues a message without waiting.
    ///
    /// Returns `Err` if the buffer is full or the session is gone.
    pub fn send_msg(&self, msg: &HubMessage) -> Result<(), SendError> {
        let frame = encode(msg).map_err(|_| SendError)?;
        self.tx.try_send(frame).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Queues a message, waiting for buffer space.
    pub async fn deliver(&self, msg: &HubMessage) -> Result<(), ServerError> {
        let frame = encode(msg)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| ServerError::SessionClosed)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Timing for one session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionTiming {
    pub(crate) keep_alive_interval: Duration,
    pub(crate) client_timeout: Duration,
}

/// Shared state of one session, owned by its read pump.
struct Session<H: Hub> {
    id: String,
    hub: Arc<H>,
    sessions: Sessions,
    sender: Sender,
    /// Cancellation tokens of active stream invocations.
    streams: Arc<Mutex<HashMap<String, CancellationToken>>>,
    cancel: CancellationToken,
}

impl<H: Hub> Session<H> {
    fn context(&self) -> HubContext {
        HubContext::new(&self.id, Arc::clone(&self.sessions))
    }

    /// Reports a rejected invocation: a `Completion` error when the caller
    /// waits for one, a log line otherwise.
    fn reject(&self, invocation_id: Option<&str>, target: &str, error: String) {
        match invocation_id {
            Some(id) => {
                tracing::debug!(session = %self.id, id, target, "rejecting invocation: {error}");
                let _ = self.sender.send_msg(&HubMessage::completion_error(id, error));
            }
            None => {
                tracing::warn!(session = %self.id, target, "dropping invocation: {error}");
            }
        }
    }

    /// Dispatches one record. Returns `false` when the session should end.
    async fn dispatch(&self, msg: HubMessage) -> bool {
        match msg {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => self.invoke(invocation_id, target, arguments).await,
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => self.start_stream(invocation_id, target, arguments),
            HubMessage::CancelInvocation { invocation_id } => {
                let token = self
                    .streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&invocation_id);
                match token {
                    Some(token) => {
                        tracing::debug!(session = %self.id, id = %invocation_id, "stream cancelled by client");
                        token.cancel();
                    }
                    None => {
                        tracing::debug!(session = %self.id, id = %invocation_id, "cancel for unknown stream");
                    }
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close { .. } => {
                tracing::info!(session = %self.id, "client sent close");
                return false;
            }
            other => {
                tracing::warn!(session = %self.id, msg_type = %other.msg_type(), "unexpected message from client");
            }
        }
        true
    }

    async fn invoke(&self, invocation_id: Option<String>, target: String, args: Vec<Value>) {
        let id = invocation_id.as_deref();
        if let Err(e) = self
            .hub
            .methods()
            .check(&target, MethodKind::Unary, args.len())
        {
            self.reject(id, &target, e);
            return;
        }

        let result = self.hub.invoke(self.context(), &target, args).await;
        let Some(id) = id else {
            if let Err(e) = result {
                tracing::warn!(session = %self.id, target = %target, "fire-and-forget invocation failed: {e}");
            }
            return;
        };
        let completion = match result {
            Ok(value) => HubMessage::completion(id, value),
            Err(e) => HubMessage::completion_error(id, e),
        };
        if let Err(e) = self.sender.deliver(&completion).await {
            tracing::debug!(session = %self.id, id, "completion not sent: {e}");
        }
    }

    /// Spawns the producer task for a stream invocation.
    fn start_stream(&self, invocation_id: String, target: String, args: Vec<Value>) {
        if let Err(e) = self
            .hub
            .methods()
            .check(&target, MethodKind::Stream, args.len())
        {
            self.reject(Some(&invocation_id), &target, e);
            return;
        }

        let token = self.cancel.child_token();
        {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            if streams.contains_key(&invocation_id) {
                drop(streams);
                self.reject(
                    Some(&invocation_id),
                    &target,
                    format!("Invocation id '{invocation_id}' is already in use."),
                );
                return;
            }
            streams.insert(invocation_id.clone(), token.clone());
        }

        let hub = Arc::clone(&self.hub);
        let ctx = self.context();
        let sender = self.sender.clone();
        let streams = Arc::clone(&self.streams);
        let session_id = self.id.clone();
        tracing::debug!(session = %session_id, id = %invocation_id, target = %target, "stream started");

        tokio::spawn(async move {
            let writer = StreamWriter::new(&invocation_id, sender.clone(), token);
            let result = hub.stream(ctx, &target, args, writer).await;
            streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&invocation_id);

            let completion = match result {
                Ok(()) => HubMessage::completion(&invocation_id, None),
                Err(e) => HubMessage::completion_error(&invocation_id, e),
            };
            if let Err(e) = sender.deliver(&completion).await {
                tracing::debug!(session = %session_id, id = %invocation_id, "stream completion not sent: {e}");
            }
            tracing::debug!(session = %session_id, id = %invocation_id, "stream finished");
        });
    }
}

/// Runs the pumps for a session whose handshake already completed.
///
/// Registers the session in `sessions`, calls the hub's connect hook, and
/// returns immediately. Everything after `leftover` is read from `ws_stream`.
pub(crate) fn spawn_session<S, H>(
    ws_stream: S,
    leftover: Vec<u8>,
    hub: Arc<H>,
    sessions: Sessions,
    timing: SessionTiming,
    server_cancel: &CancellationToken,
) -> String
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Hub,
{
    let id = uuid::Uuid::new_v4().to_string();
    let (sender, rx) = Sender::channel(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();

    sessions
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), sender.clone());

    let session = Arc::new(Session {
        id: id.clone(),
        hub,
        sessions,
        sender,
        streams: Arc::default(),
        cancel: cancel.clone(),
    });

    let (ws_sink, ws_stream) = ws_stream.split();
    tokio::spawn(write_pump(ws_sink, rx, timing.keep_alive_interval, cancel.clone()));

    tokio::spawn(async move {
        session.hub.on_connected(session.context()).await;
        tracing::info!(session = %session.id, "session connected");

        read_pump(ws_stream, &session, leftover, timing.client_timeout).await;
        // When the read pump exits, stop the write pump and every stream.
        session.cancel.cancel();
        session
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session.id);
        session.hub.on_disconnected(session.context()).await;
        tracing::info!(session = %session.id, "session disconnected");
    });

    id
}

/// Write pump: drains the send channel and sends keep-alive pings.
///
/// Queued frames are flushed before a cancellation is honoured so a final
/// `Close` record reaches the client.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Vec<u8>>,
    keep_alive: Duration,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let ping = match encode(&HubMessage::Ping) {
        Ok(ping) => ping,
        Err(e) => {
            tracing::error!("failed to encode ping: {e}");
            return;
        }
    };
    let mut ping_interval = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(text_frame(frame)).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                        ping_interval.reset();
                    }
                    None => break, // Channel closed.
                }
            }

            _ = cancel.cancelled() => break,

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(text_frame(ping.clone())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    // Best-effort close frame.
    let _ = sink.close().await;
}

fn text_frame(frame: Vec<u8>) -> WsMessage {
    match String::from_utf8(frame) {
        Ok(text) => WsMessage::Text(text.into()),
        Err(e) => WsMessage::Binary(e.into_bytes().into()),
    }
}

/// Read pump: reads WS frames and dispatches their records in order.
async fn read_pump<S, H>(
    mut stream: S,
    session: &Session<H>,
    leftover: Vec<u8>,
    client_timeout: Duration,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Hub,
{
    if !dispatch_frame(session, &leftover).await {
        return;
    }

    let deadline = tokio::time::sleep(client_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,

            _ = &mut deadline => {
                tracing::warn!(session = %session.id, "client timeout, closing session");
                break;
            }

            frame = stream.next() => {
                let data: Vec<u8> = match frame {
                    Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!(session = %session.id, "received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite; still activity.
                        deadline.as_mut().reset(Instant::now() + client_timeout);
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::error!(session = %session.id, "read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                };
                deadline.as_mut().reset(Instant::now() + client_timeout);

                if data.len() > WS_MAX_MESSAGE_SIZE {
                    tracing::error!("message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                    continue;
                }
                if !dispatch_frame(session, &data).await {
                    break;
                }
            }
        }
    }
}

/// Dispatches every record of a frame. Returns `false` when the session
/// should end.
async fn dispatch_frame<H: Hub>(session: &Session<H>, frame: &[u8]) -> bool {
    for decoded in decode_frame(frame) {
        match decoded {
            Ok(msg) => {
                if !session.dispatch(msg).await {
                    return false;
                }
            }
            Err(e) => tracing::error!(session = %session.id, "invalid message: {e}"),
        }
    }
    true
}
