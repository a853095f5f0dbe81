//! Connection state machine.
//!
//! [`HubConnection`] owns at most one transport link at a time. A spawned
//! session task reads the link, dispatches inbound frames, and runs the
//! reconnect loop when the link is lost. Outbound sends go straight to the
//! link's write channel and are only accepted while `Connected`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chathub_protocol::constants::{HANDSHAKE_TIMEOUT, KEEP_ALIVE_INTERVAL, SERVER_TIMEOUT};
use chathub_protocol::handshake::{encode_handshake, parse_handshake};
use chathub_protocol::{HandshakeRequest, HandshakeResponse};

use crate::dispatcher::{Dispatcher, ServerClose};
use crate::error::HubError;
use crate::pumps::ping::ping_pump;
use crate::reconnection::{self, NoReconnect, Reconnect, ReconnectPolicy};
use crate::registry::{PendingCall, PendingCalls};
use crate::transport::{Link, Transport, WebSocketTransport};
use crate::types::{ConnectionEvent, ConnectionState, EVENT_BUFFER_SIZE, EventSink};

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    keep_alive_interval: Duration,
    server_timeout: Duration,
    handshake_timeout: Duration,
}

struct Session {
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

struct Shared {
    state: ConnectionState,
    session: Option<Session>,
    /// Write channel of the current link; `Some` only while `Connected`.
    outbound: Option<mpsc::Sender<Vec<u8>>>,
}

pub(crate) struct Inner {
    url: String,
    transport: Box<dyn Transport>,
    pub(crate) policy: Box<dyn ReconnectPolicy>,
    timeouts: Timeouts,
    shared: Mutex<Shared>,
    pub(crate) calls: PendingCalls,
    pub(crate) dispatcher: Dispatcher,
    next_id: AtomicU64,
    events: Box<dyn EventSink>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.events.on_event(event);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared().state
    }

    pub(crate) fn ensure_disconnected(&self) -> Result<(), HubError> {
        match self.state() {
            ConnectionState::Disconnected => Ok(()),
            state => Err(HubError::InvalidState(state)),
        }
    }

    /// Returns the write channel if the connection is `Connected`.
    pub(crate) fn connected_sender(&self) -> Result<mpsc::Sender<Vec<u8>>, HubError> {
        let shared = self.shared();
        match (&shared.state, &shared.outbound) {
            (ConnectionState::Connected, Some(tx)) => Ok(tx.clone()),
            _ => Err(HubError::NotConnected),
        }
    }

    /// Registers a pending call while `Connected` and returns the write
    /// channel to send its request on.
    ///
    /// Registration happens under the state lock so a concurrent teardown
    /// either rejects the call or drains it.
    pub(crate) fn register_call(
        &self,
        id: &str,
        call: PendingCall,
    ) -> Result<mpsc::Sender<Vec<u8>>, HubError> {
        let shared = self.shared();
        let tx = match (&shared.state, &shared.outbound) {
            (ConnectionState::Connected, Some(tx)) => tx.clone(),
            _ => return Err(HubError::NotConnected),
        };
        self.calls.register(id, call)?;
        Ok(tx)
    }

    pub(crate) fn next_invocation_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Moves the session owning `cancel` to `state`.
    ///
    /// Returns `false` without touching anything if the session was stopped.
    pub(crate) fn transition(
        &self,
        cancel: &CancellationToken,
        state: ConnectionState,
        outbound: Option<mpsc::Sender<Vec<u8>>>,
    ) -> bool {
        {
            let mut shared = self.shared();
            if cancel.is_cancelled() {
                return false;
            }
            shared.state = state;
            shared.outbound = outbound;
        }
        self.emit(ConnectionEvent::StateChanged(state));
        true
    }

    /// Opens a link and completes the handshake.
    ///
    /// Returns the link and any bytes that followed the handshake response
    /// in the same frame.
    pub(crate) async fn open_link(&self) -> Result<(Link, Vec<u8>), HubError> {
        let mut link = self.transport.open(&self.url).await?;
        link.send(encode_handshake(&HandshakeRequest::default())?)
            .await?;

        let frame = match tokio::time::timeout(self.timeouts.handshake_timeout, link.recv()).await
        {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                return Err(HubError::Handshake(
                    "connection closed before handshake response".into(),
                ));
            }
            Err(_) => {
                return Err(HubError::Handshake(format!(
                    "no handshake response within {:?}",
                    self.timeouts.handshake_timeout
                )));
            }
        };

        let (response, leftover) = parse_handshake::<HandshakeResponse>(&frame)
            .map_err(|e| HubError::Handshake(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(HubError::Handshake(error));
        }
        debug!(url = %self.url, "handshake complete");
        Ok((link, leftover.to_vec()))
    }

    /// Terminal transition after the link is gone for good.
    ///
    /// Drains every pending call and emits `Closed`. Does nothing if
    /// `stop()` already owns the teardown.
    fn finish(&self, cancel: &CancellationToken, error: Option<HubError>) {
        {
            let mut shared = self.shared();
            if cancel.is_cancelled() {
                return;
            }
            shared.state = ConnectionState::Disconnected;
            shared.outbound = None;
            shared.session = None;
        }
        let drained = self
            .calls
            .drain_all(error.clone().unwrap_or(HubError::ConnectionClosed(None)));
        match &error {
            Some(e) => warn!(drained, error = %e, "connection closed"),
            None => info!(drained, "connection closed"),
        }
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        self.emit(ConnectionEvent::Closed { error });
    }
}

/// How a link ended.
enum LinkEnd {
    Stopped,
    Lost(HubError),
    Closed(ServerClose),
}

/// Session task: drives links until stopped or closed for good.
async fn run_session(inner: Arc<Inner>, link: Link, leftover: Vec<u8>, cancel: CancellationToken) {
    let mut link = link;
    let mut server_close = inner.dispatcher.on_frame(&leftover);

    loop {
        let end = match server_close.take() {
            Some(close) => LinkEnd::Closed(close),
            None => drive_link(&inner, &mut link, &cancel).await,
        };
        link.close();

        let reason = match end {
            LinkEnd::Stopped => return,
            LinkEnd::Lost(error) => {
                warn!(error = %error, "transport lost");
                error
            }
            LinkEnd::Closed(ServerClose {
                error,
                allow_reconnect: false,
            }) => {
                inner.finish(&cancel, error.map(|e| HubError::ConnectionClosed(Some(e))));
                return;
            }
            LinkEnd::Closed(ServerClose {
                error,
                allow_reconnect: true,
            }) => HubError::ConnectionClosed(error),
        };

        match reconnection::reconnect(&inner, &cancel, reason).await {
            Reconnect::Linked {
                link: next,
                leftover,
            } => {
                link = next;
                server_close = inner.dispatcher.on_frame(&leftover);
            }
            Reconnect::Stopped => return,
            Reconnect::Exhausted(error) => {
                inner.finish(&cancel, Some(error));
                return;
            }
        }
    }
}

/// Reads one link until it ends. Sends keep-alive pings while it runs and
/// treats `server_timeout` of inbound silence as a loss.
async fn drive_link(inner: &Inner, link: &mut Link, cancel: &CancellationToken) -> LinkEnd {
    let server_timeout = inner.timeouts.server_timeout;
    tokio::spawn(ping_pump(
        link.sender(),
        inner.timeouts.keep_alive_interval,
        link.closed_token(),
    ));

    let deadline = tokio::time::sleep(server_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return LinkEnd::Stopped,
            frame = link.recv() => match frame {
                Some(Ok(frame)) => {
                    deadline.as_mut().reset(Instant::now() + server_timeout);
                    if let Some(close) = inner.dispatcher.on_frame(&frame) {
                        return LinkEnd::Closed(close);
                    }
                }
                Some(Err(e)) => return LinkEnd::Lost(e.into()),
                None => return LinkEnd::Lost(HubError::ConnectionClosed(None)),
            },
            _ = &mut deadline => {
                return LinkEnd::Lost(HubError::Transport(format!(
                    "server timeout elapsed without receiving a message ({server_timeout:?})"
                )));
            }
        }
    }
}

/// Client connection to a hub endpoint.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct HubConnection {
    pub(crate) inner: Arc<Inner>,
}

impl HubConnection {
    pub fn builder(url: impl Into<String>) -> HubConnectionBuilder {
        HubConnectionBuilder::new(url)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Takes the event receiver. Returns `None` after the first call, or
    /// when a custom [`EventSink`] was configured.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Opens the transport and performs the handshake.
    ///
    /// Only valid while `Disconnected`. A failure here is reported once
    /// and not retried; the reconnect policy only applies to links lost
    /// after a successful start.
    pub async fn start(&self) -> Result<(), HubError> {
        let cancel = {
            let mut shared = self.inner.shared();
            if shared.state != ConnectionState::Disconnected {
                return Err(HubError::InvalidState(shared.state));
            }
            let cancel = CancellationToken::new();
            shared.state = ConnectionState::Connecting;
            shared.session = Some(Session {
                cancel: cancel.clone(),
                driver: None,
            });
            cancel
        };
        self.inner
            .emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        info!(url = %self.inner.url, "connecting");

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Stopped),
            opened = self.inner.open_link() => opened,
        };

        let (link, leftover) = match opened {
            Ok(opened) => opened,
            Err(error) => {
                {
                    let mut shared = self.inner.shared();
                    if cancel.is_cancelled() {
                        return Err(HubError::Stopped);
                    }
                    shared.state = ConnectionState::Disconnected;
                    shared.session = None;
                }
                warn!(url = %self.inner.url, error = %error, "connection failed");
                self.inner
                    .emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
                self.inner.emit(ConnectionEvent::ConnectionFailed {
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        if !self
            .inner
            .transition(&cancel, ConnectionState::Connected, Some(link.sender()))
        {
            link.close();
            return Err(HubError::Stopped);
        }
        self.inner.emit(ConnectionEvent::Connected);
        info!(url = %self.inner.url, "connected");

        let driver = tokio::spawn(run_session(
            Arc::clone(&self.inner),
            link,
            leftover,
            cancel.clone(),
        ));
        let mut shared = self.inner.shared();
        if !cancel.is_cancelled()
            && let Some(session) = shared.session.as_mut()
        {
            session.driver = Some(driver);
        }
        Ok(())
    }

    /// Closes the transport and fails every pending call with
    /// [`HubError::Stopped`]. Idempotent.
    pub async fn stop(&self) {
        let session = {
            let mut shared = self.inner.shared();
            let Some(session) = shared.session.take() else {
                return;
            };
            session.cancel.cancel();
            shared.state = ConnectionState::Disconnected;
            shared.outbound = None;
            session
        };
        info!(url = %self.inner.url, "stopping connection");

        if let Some(driver) = session.driver
            && let Err(e) = driver.await
        {
            warn!("session task failed: {e}");
        }
        let drained = self.inner.calls.drain_all(HubError::Stopped);
        debug!(drained, "drained pending calls");

        self.inner
            .emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        self.inner.emit(ConnectionEvent::Closed { error: None });
    }
}

/// Configures a [`HubConnection`].
pub struct HubConnectionBuilder {
    url: String,
    transport: Option<Box<dyn Transport>>,
    policy: Box<dyn ReconnectPolicy>,
    timeouts: Timeouts,
    events: Option<Box<dyn EventSink>>,
}

impl HubConnectionBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: None,
            policy: Box::new(NoReconnect),
            timeouts: Timeouts {
                keep_alive_interval: KEEP_ALIVE_INTERVAL,
                server_timeout: SERVER_TIMEOUT,
                handshake_timeout: HANDSHAKE_TIMEOUT,
            },
            events: None,
        }
    }

    /// Replaces the default WebSocket transport.
    pub fn with_transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Enables auto-reconnect with the default `0s, 2s, 10s, 30s` delays.
    pub fn with_automatic_reconnect(self) -> Self {
        self.with_reconnect_policy(reconnection::DefaultReconnectPolicy::default())
    }

    pub fn with_reconnect_policy(mut self, policy: impl ReconnectPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keep_alive_interval = interval;
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.server_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake_timeout = timeout;
        self
    }

    /// Routes lifecycle events to `sink` instead of the default channel.
    pub fn with_event_sink(mut self, sink: impl EventSink) -> Self {
        self.events = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> HubConnection {
        let (events, events_rx): (Box<dyn EventSink>, _) = match self.events {
            Some(sink) => (sink, None),
            None => {
                let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
                (Box::new(tx), Some(rx))
            }
        };
        let calls = PendingCalls::new();
        HubConnection {
            inner: Arc::new(Inner {
                url: self.url,
                transport: self
                    .transport
                    .unwrap_or_else(|| Box::new(WebSocketTransport::default())),
                policy: self.policy,
                timeouts: self.timeouts,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    session: None,
                    outbound: None,
                }),
                dispatcher: Dispatcher::new(calls.clone()),
                calls,
                next_id: AtomicU64::new(0),
                events,
                events_rx: Mutex::new(events_rx),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnection::DefaultReconnectPolicy;
    use crate::testing::{MemoryServer, ServerEnd, memory_transport, wait_for};
    use chathub_protocol::{ChatMessage, HubMessage};
    use serde_json::{Value, json};

    const LONG: Duration = Duration::from_secs(3600);

    fn fast_reconnect(attempts: usize) -> DefaultReconnectPolicy {
        DefaultReconnectPolicy::with_delays(vec![Duration::from_millis(10); attempts])
    }

    fn build(policy: impl ReconnectPolicy) -> (HubConnection, MemoryServer) {
        let (transport, server) = memory_transport();
        let conn = HubConnection::builder("memory://chat")
            .with_transport(transport)
            .with_reconnect_policy(policy)
            .with_keep_alive_interval(LONG)
            .with_server_timeout(LONG)
            .build();
        (conn, server)
    }

    async fn start(conn: &HubConnection, server: &mut MemoryServer) -> ServerEnd {
        let starting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.start().await }
        });
        let mut end = server.accept().await;
        end.handshake().await;
        starting.await.unwrap().unwrap();
        end
    }

    async fn started(
        policy: impl ReconnectPolicy,
    ) -> (
        HubConnection,
        MemoryServer,
        ServerEnd,
        mpsc::Receiver<ConnectionEvent>,
    ) {
        let (conn, mut server) = build(policy);
        let events = conn.take_events().unwrap();
        let end = start(&conn, &mut server).await;
        (conn, server, end, events)
    }

    fn spawn_invoke(
        conn: &HubConnection,
        method: &str,
    ) -> JoinHandle<Result<Value, HubError>> {
        let conn = conn.clone();
        let method = method.to_string();
        tokio::spawn(async move { conn.invoke_raw(&method, vec![]).await })
    }

    async fn recv_invocation_id(end: &mut ServerEnd) -> String {
        match end.recv_message().await {
            Some(HubMessage::Invocation {
                invocation_id: Some(id),
                ..
            }) => id,
            other => panic!("expected invocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_emits_connecting_then_connected() {
        let (conn, _server, _end, mut events) = started(NoReconnect).await;

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::StateChanged(ConnectionState::Connected)
        );
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
        assert!(conn.take_events().is_none());
    }

    #[tokio::test]
    async fn start_failure_is_not_retried() {
        let (conn, server) = build(DefaultReconnectPolicy::default());
        let mut events = conn.take_events().unwrap();
        server.fail_next_opens(1);

        let err = conn.start().await.unwrap_err();
        assert!(matches!(err, HubError::Transport(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(server.open_count(), 1);

        let event = wait_for(&mut events, |e| {
            matches!(e, ConnectionEvent::ConnectionFailed { .. })
        })
        .await;
        assert_eq!(event, ConnectionEvent::ConnectionFailed { error: err });
    }

    #[tokio::test]
    async fn handshake_error_fails_start() {
        let (conn, mut server) = build(NoReconnect);
        let starting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.start().await }
        });
        let mut end = server.accept().await;
        end.reject_handshake("The protocol 'xml' is not supported.")
            .await;

        let err = starting.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            HubError::Handshake("The protocol 'xml' is not supported.".into())
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn sends_fail_when_not_connected() {
        let (conn, _server) = build(NoReconnect);
        assert_eq!(
            conn.send("Broadcast", (ChatMessage::new("a", "b"),)).await,
            Err(HubError::NotConnected)
        );
        assert_eq!(
            conn.invoke::<String, _>("DadJoke", ()).await,
            Err(HubError::NotConnected)
        );
        assert!(conn.inner.calls.is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let (conn, _server, _end, _events) = started(NoReconnect).await;
        assert_eq!(
            conn.start().await,
            Err(HubError::InvalidState(ConnectionState::Connected))
        );
    }

    #[tokio::test]
    async fn handlers_only_change_while_disconnected() {
        let (conn, _server, _end, _events) = started(NoReconnect).await;
        let err = conn.on("NewMessage", |(_m,): (ChatMessage,)| {}).unwrap_err();
        assert_eq!(err, HubError::InvalidState(ConnectionState::Connected));
        assert!(conn.off("NewMessage").is_err());
    }

    #[tokio::test]
    async fn send_and_invoke_round_trip() {
        let (conn, _server, mut end, _events) = started(NoReconnect).await;

        conn.send("Broadcast", (ChatMessage::new("Alice", "hi"),))
            .await
            .unwrap();
        assert_eq!(
            end.recv_message().await,
            Some(HubMessage::send(
                "Broadcast",
                vec![json!({"name": "Alice", "text": "hi"})]
            ))
        );

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.invoke::<String, _>("DadJoke", ()).await }
        });
        let id = recv_invocation_id(&mut end).await;
        assert_eq!(id, "1");
        end.send(&HubMessage::completion(&id, Some(json!("a joke"))))
            .await;
        assert_eq!(call.await.unwrap(), Ok("a joke".to_string()));
    }

    #[tokio::test]
    async fn push_events_reach_handlers_in_order() {
        let (conn, mut server) = build(NoReconnect);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on("NewMessage", move |(msg,): (ChatMessage,)| {
            let _ = tx.send(msg.text);
        })
        .unwrap();
        let end = start(&conn, &mut server).await;

        for text in ["one", "two", "three"] {
            end.send(&HubMessage::send(
                "NewMessage",
                vec![json!({"name": "Bob", "text": text})],
            ))
            .await;
        }
        for text in ["one", "two", "three"] {
            assert_eq!(rx.recv().await.unwrap(), text);
        }
    }

    #[tokio::test]
    async fn stop_drains_pending_calls_and_is_idempotent() {
        let (conn, _server, mut end, mut events) = started(DefaultReconnectPolicy::default()).await;
        let call = spawn_invoke(&conn, "DadJoke");
        recv_invocation_id(&mut end).await;

        conn.stop().await;
        assert_eq!(call.await.unwrap(), Err(HubError::Stopped));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        wait_for(&mut events, |e| *e == ConnectionEvent::Closed { error: None }).await;

        conn.stop().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn transport_loss_without_reconnect_closes() {
        let (conn, _server, mut end, mut events) = started(NoReconnect).await;
        let call = spawn_invoke(&conn, "DadJoke");
        recv_invocation_id(&mut end).await;

        drop(end);
        assert_eq!(
            call.await.unwrap(),
            Err(HubError::ConnectionClosed(None))
        );
        let closed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert_eq!(
            closed,
            ConnectionEvent::Closed {
                error: Some(HubError::ConnectionClosed(None))
            }
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn pending_calls_survive_reconnect() {
        let (conn, mut server, mut end, mut events) = started(fast_reconnect(3)).await;
        let first = spawn_invoke(&conn, "DadJoke");
        let id1 = recv_invocation_id(&mut end).await;
        let second = spawn_invoke(&conn, "DadJoke");
        let id2 = recv_invocation_id(&mut end).await;

        drop(end);
        let reconnecting = wait_for(&mut events, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        assert!(matches!(
            reconnecting,
            ConnectionEvent::Reconnecting { attempt: 1, .. }
        ));

        let mut end = server.accept().await;
        end.handshake().await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Reconnected).await;
        assert_eq!(conn.state(), ConnectionState::Connected);

        end.send(&HubMessage::completion(&id1, Some(json!("a"))))
            .await;
        end.send(&HubMessage::completion(&id2, Some(json!("b"))))
            .await;
        assert_eq!(first.await.unwrap(), Ok(json!("a")));
        assert_eq!(second.await.unwrap(), Ok(json!("b")));

        // Ids keep counting across reconnects.
        let third = spawn_invoke(&conn, "DadJoke");
        assert_eq!(recv_invocation_id(&mut end).await, "3");
        conn.stop().await;
        assert_eq!(third.await.unwrap(), Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn exhausted_reconnect_fails_pending_calls() {
        let (conn, mut server, mut end, mut events) = started(fast_reconnect(2)).await;
        let first = spawn_invoke(&conn, "DadJoke");
        recv_invocation_id(&mut end).await;
        let second = spawn_invoke(&conn, "DadJoke");
        recv_invocation_id(&mut end).await;

        server.fail_next_opens(2);
        drop(end);

        assert!(matches!(
            first.await.unwrap(),
            Err(HubError::ConnectionClosed(_))
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(HubError::ConnectionClosed(_))
        ));
        wait_for(&mut events, |e| {
            matches!(e, ConnectionEvent::Closed { error: Some(_) })
        })
        .await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(server.open_count(), 3);

        // A manual start still works after exhaustion.
        let _end = start(&conn, &mut server).await;
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn server_close_without_reconnect_goes_disconnected() {
        let (conn, server, end, mut events) = started(fast_reconnect(3)).await;
        end.send(&HubMessage::Close {
            error: Some("shutting down".into()),
            allow_reconnect: false,
        })
        .await;

        let closed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert_eq!(
            closed,
            ConnectionEvent::Closed {
                error: Some(HubError::ConnectionClosed(Some("shutting down".into())))
            }
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(server.open_count(), 1);
    }

    #[tokio::test]
    async fn server_close_with_allow_reconnect_reconnects() {
        let (conn, mut server, end, mut events) = started(fast_reconnect(3)).await;
        end.send(&HubMessage::Close {
            error: None,
            allow_reconnect: true,
        })
        .await;

        let mut end = server.accept().await;
        end.handshake().await;
        wait_for(&mut events, |e| *e == ConnectionEvent::Reconnected).await;
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_silence_is_a_transport_loss() {
        let (transport, mut server) = memory_transport();
        let conn = HubConnection::builder("memory://chat")
            .with_transport(transport)
            .build();
        let mut events = conn.take_events().unwrap();
        let _end = start(&conn, &mut server).await;
        let call = spawn_invoke(&conn, "DadJoke");

        let closed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
        assert!(matches!(
            closed,
            ConnectionEvent::Closed {
                error: Some(HubError::ConnectionClosed(Some(_)))
            }
        ));
        assert!(matches!(
            call.await.unwrap(),
            Err(HubError::ConnectionClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_are_sent() {
        let (transport, mut server) = memory_transport();
        let conn = HubConnection::builder("memory://chat")
            .with_transport(transport)
            .build();
        let mut end = start(&conn, &mut server).await;

        let frame = end.recv_frame().await.unwrap();
        assert_eq!(
            chathub_protocol::decode_frame(&frame)[0].as_ref().unwrap(),
            &HubMessage::Ping
        );
    }

    #[tokio::test]
    async fn messages_after_handshake_in_same_frame_are_dispatched() {
        let (conn, mut server) = build(NoReconnect);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on("NewMessage", move |(msg,): (ChatMessage,)| {
            let _ = tx.send(msg);
        })
        .unwrap();

        let starting = tokio::spawn({
            let conn = conn.clone();
            async move { conn.start().await }
        });
        let mut end = server.accept().await;
        end.handshake_with(&[HubMessage::send(
            "NewMessage",
            vec![json!({"name": "srv", "text": "welcome"})],
        )])
        .await;
        starting.await.unwrap().unwrap();

        assert_eq!(rx.recv().await.unwrap(), ChatMessage::new("srv", "welcome"));
    }
}
