//! Hub trait and the handles passed to hub methods.
//!
//! Implementors provide the methods clients can call; the server framework
//! handles sessions, argument-count checks, completions and stream
//! lifetimes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use chathub_protocol::HubMessage;

use crate::ServerError;
use crate::session::Sender;

/// A boxed future returned by hub methods.
pub type HubFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a method is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// `Invocation`, answered by one `Completion` when an id is present.
    Unary,
    /// `StreamInvocation`, answered by `StreamItem`s and one `Completion`.
    Stream,
}

/// Declared shape of a hub method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub kind: MethodKind,
    pub arity: usize,
}

/// Method table of a hub: name to kind and declared argument count.
#[derive(Debug, Clone, Default)]
pub struct HubMethods {
    methods: HashMap<String, MethodSpec>,
}

impl HubMethods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unary(mut self, name: &str, arity: usize) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                kind: MethodKind::Unary,
                arity,
            },
        );
        self
    }

    pub fn stream(mut self, name: &str, arity: usize) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodSpec {
                kind: MethodKind::Stream,
                arity,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<MethodSpec> {
        self.methods.get(name).copied()
    }

    /// Checks an invocation against the table.
    ///
    /// The error text is sent back verbatim in the `Completion`.
    pub fn check(&self, name: &str, kind: MethodKind, args: usize) -> Result<(), String> {
        let Some(spec) = self.get(name) else {
            return Err(format!("Unknown hub method '{name}'"));
        };
        if spec.kind != kind {
            return Err(match spec.kind {
                MethodKind::Stream => {
                    format!("The client attempted to invoke the streaming '{name}' method with a non-streaming invocation.")
                }
                MethodKind::Unary => {
                    format!("The client attempted to invoke the non-streaming '{name}' method with a streaming invocation.")
                }
            });
        }
        if spec.arity != args {
            return Err(format!(
                "Invocation provides {args} argument(s) but target expects {}.",
                spec.arity
            ));
        }
        Ok(())
    }
}

/// Trait implemented by hubs served by [`HubServer`](crate::HubServer).
///
/// Arguments have already been checked against [`Hub::methods`] when
/// `invoke` or `stream` is called. Errors are returned as plain strings and
/// reach the caller verbatim.
pub trait Hub: Send + Sync + 'static {
    /// Method table used to validate invocations.
    fn methods(&self) -> &HubMethods;

    /// Handles a unary method. `Ok(None)` completes without a result.
    fn invoke<'a>(
        &'a self,
        ctx: HubContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> HubFuture<'a, Result<Option<Value>, String>>;

    /// Handles a stream method, emitting items through `writer`.
    ///
    /// The framework sends the final `Completion` once this returns.
    fn stream<'a>(
        &'a self,
        ctx: HubContext,
        method: &'a str,
        args: Vec<Value>,
        writer: StreamWriter,
    ) -> HubFuture<'a, Result<(), String>> {
        let _ = (ctx, args, writer);
        Box::pin(async move { Err(format!("'{method}' does not support streaming")) })
    }

    /// Called once the session has completed the handshake.
    fn on_connected(&self, ctx: HubContext) -> HubFuture<'_, ()> {
        let _ = ctx;
        Box::pin(async {})
    }

    /// Called after the session has ended (cleanup hook).
    fn on_disconnected(&self, ctx: HubContext) -> HubFuture<'_, ()> {
        let _ = ctx;
        Box::pin(async {})
    }
}

/// Live sessions keyed by session id.
pub(crate) type Sessions = Arc<RwLock<HashMap<String, Sender>>>;

/// Per-call context: who is calling and how to reach other clients.
#[derive(Clone)]
pub struct HubContext {
    session_id: String,
    clients: Clients,
}

impl HubContext {
    pub(crate) fn new(session_id: &str, sessions: Sessions) -> Self {
        Self {
            session_id: session_id.to_string(),
            clients: Clients {
                caller_id: session_id.to_string(),
                sessions,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }
}

/// Selects which connected clients receive a push event.
#[derive(Clone)]
pub struct Clients {
    caller_id: String,
    sessions: Sessions,
}

impl Clients {
    fn select(&self, keep: impl Fn(&str) -> bool) -> ClientProxy {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        ClientProxy {
            targets: sessions
                .iter()
                .filter(|(id, _)| keep(id))
                .map(|(_, sender)| sender.clone())
                .collect(),
        }
    }

    /// Every connected client, the caller included.
    pub fn all(&self) -> ClientProxy {
        self.select(|_| true)
    }

    /// Only the calling client.
    pub fn caller(&self) -> ClientProxy {
        self.select(|id| id == self.caller_id)
    }

    /// Every connected client except the caller.
    pub fn others(&self) -> ClientProxy {
        self.select(|id| id != self.caller_id)
    }
}

/// A snapshot of target sessions for one push event.
pub struct ClientProxy {
    targets: Vec<Sender>,
}

impl ClientProxy {
    /// Sends a fire-and-forget invocation of `target` to every selected
    /// client. Returns how many sessions accepted it.
    pub fn send(&self, target: &str, args: Vec<Value>) -> usize {
        let msg = HubMessage::send(target, args);
        self.targets
            .iter()
            .filter(|sender| sender.send_msg(&msg).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Emits the items of one stream invocation.
pub struct StreamWriter {
    invocation_id: String,
    sender: Sender,
    cancel: CancellationToken,
}

impl StreamWriter {
    pub(crate) fn new(invocation_id: &str, sender: Sender, cancel: CancellationToken) -> Self {
        Self {
            invocation_id: invocation_id.to_string(),
            sender,
            cancel,
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Sends one item, waiting for buffer space.
    ///
    /// Fails once the client cancelled the stream or the session ended.
    pub async fn emit<T: Serialize>(&self, item: T) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::StreamCancelled);
        }
        let msg = HubMessage::StreamItem {
            invocation_id: self.invocation_id.clone(),
            item: serde_json::to_value(item)?,
        };
        self.sender.deliver(&msg).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the client cancels the stream or the session ends.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
