//! Hub WebSocket server.
//!
//! Listens on a TCP address, upgrades HTTP GET requests for the hub path
//! to WebSocket, completes the protocol handshake, and runs one session per
//! client.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tokio_util::sync::CancellationToken;

use chathub_protocol::constants::{
    CLIENT_TIMEOUT, DEFAULT_HUB_PATH, HANDSHAKE_TIMEOUT, KEEP_ALIVE_INTERVAL, WS_MAX_MESSAGE_SIZE,
};
use chathub_protocol::handshake::{encode_handshake, parse_handshake};
use chathub_protocol::{HandshakeRequest, HandshakeResponse, HubMessage};

use crate::ServerError;
use crate::hub::{ClientProxy, Hub, HubContext, Sessions};
use crate::session::{self, SessionTiming};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// HTTP path of the hub endpoint.
    pub path: String,
    /// Idle time after which a `Ping` record is sent.
    pub keep_alive_interval: Duration,
    /// Inbound silence after which a session is considered dead.
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 0).into(),
            path: DEFAULT_HUB_PATH.into(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            client_timeout: CLIENT_TIMEOUT,
        }
    }
}

/// The hub WebSocket server.
///
/// Serves any number of concurrent sessions and dispatches their
/// invocations to the provided [`Hub`].
pub struct HubServer<H: Hub> {
    config: ServerConfig,
    hub: Arc<H>,
    sessions: Sessions,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Hub> HubServer<H> {
    pub fn new(config: ServerConfig, hub: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub: Arc::new(hub),
            sessions: Arc::default(),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &H {
        &self.hub
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of sessions that completed the handshake and are still open.
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sends a push event to every connected client.
    pub fn broadcast(&self, target: &str, args: Vec<Value>) -> usize {
        let all: ClientProxy = HubContext::new("", Arc::clone(&self.sessions))
            .clients()
            .all();
        all.send(target, args)
    }

    /// Gracefully shuts down the server.
    ///
    /// Every session receives a `Close` record before its transport is
    /// closed.
    pub async fn shutdown(&self) {
        let senders: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let close = HubMessage::Close {
            error: None,
            allow_reconnect: false,
        };
        for sender in senders {
            let _ = sender.deliver(&close).await;
        }
        self.cancel.cancel();
    }

    /// Runs the server until shutdown.
    ///
    /// Binds to the configured address and accepts WebSocket connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(path = %self.config.path, "hub server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: upgrades to WS, runs the protocol
    /// handshake, then hands the stream to a session.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let hub_path = self.config.path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == hub_path {
                return Ok(resp);
            }
            tracing::debug!(path = %req.uri().path(), "rejecting upgrade for unknown path");
            let mut not_found = ErrorResponse::new(Some("Not Found".into()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Err(not_found)
        };

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let mut ws_stream = accept_hdr_async_with_config(stream, check_path, Some(ws_config)).await?;
        tracing::debug!(%peer_addr, "WebSocket connection established");

        let leftover = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut ws_stream)).await
        {
            Ok(Ok(leftover)) => leftover,
            Ok(Err(e)) => {
                let _ = ws_stream.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws_stream.close(None).await;
                return Err(ServerError::Handshake("timed out".into()));
            }
        };

        let session_id = session::spawn_session(
            ws_stream,
            leftover,
            Arc::clone(&self.hub),
            Arc::clone(&self.sessions),
            SessionTiming {
                keep_alive_interval: self.config.keep_alive_interval,
                client_timeout: self.config.client_timeout,
            },
            &self.cancel,
        );
        tracing::info!(%peer_addr, session = %session_id, "client connected");
        Ok(())
    }
}

/// Reads the client's handshake request and answers it.
///
/// Returns whatever followed the request in the same frame.
async fn handshake(
    ws_stream: &mut WebSocketStream<tokio::net::TcpStream>,
) -> Result<Vec<u8>, ServerError> {
    let frame = loop {
        match ws_stream.next().await {
            Some(Ok(WsMessage::Text(text))) => break text.as_bytes().to_vec(),
            Some(Ok(WsMessage::Binary(data))) => break data.to_vec(),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ServerError::Handshake(
                    "connection closed before handshake".into(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let (request, rest) = match parse_handshake::<HandshakeRequest>(&frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            let reply = HandshakeResponse::error(format!("Invalid handshake request: {e}"));
            send_handshake(ws_stream, &reply).await?;
            return Err(ServerError::Handshake(e.to_string()));
        }
    };
    if let Err(msg) = request.validate() {
        send_handshake(ws_stream, &HandshakeResponse::error(msg.clone())).await?;
        return Err(ServerError::Handshake(msg));
    }

    send_handshake(ws_stream, &HandshakeResponse::ok()).await?;
    Ok(rest.to_vec())
}

async fn send_handshake(
    ws_stream: &mut WebSocketStream<tokio::net::TcpStream>,
    response: &HandshakeResponse,
) -> Result<(), ServerError> {
    let bytes = encode_handshake(response)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    ws_stream.send(WsMessage::Text(text.into())).await?;
    Ok(())
}
