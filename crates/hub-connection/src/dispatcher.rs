//! Inbound message dispatch and outbound calls.
//!
//! Inbound frames are decoded and routed either to a push-event handler
//! (uncorrelated invocations) or to the pending call registry (stream items
//! and completions). Dispatch runs on the connection's single session task,
//! so handlers never interleave.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use chathub_protocol::{HubMessage, decode_frame, encode};

use crate::args::{HubArgs, to_arguments};
use crate::connection::HubConnection;
use crate::error::HubError;
use crate::registry::{CallKind, PendingCall, PendingCalls};

/// Type-erased push-event handler.
type HandlerFn = Arc<dyn Fn(Vec<Value>) -> Result<(), HubError> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    arity: usize,
    handler: HandlerFn,
}

/// A `Close` record received from the server.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerClose {
    pub(crate) error: Option<String>,
    pub(crate) allow_reconnect: bool,
}

/// Routes decoded messages to handlers and pending calls.
pub(crate) struct Dispatcher {
    handlers: RwLock<HashMap<String, Registration>>,
    calls: PendingCalls,
}

impl Dispatcher {
    pub(crate) fn new(calls: PendingCalls) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            calls,
        }
    }

    /// Registers a typed handler, replacing any previous one for `name`.
    pub(crate) fn register<A, F>(&self, name: &str, handler: F)
    where
        A: HubArgs + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let registration = Registration {
            arity: A::ARITY,
            handler: Arc::new(move |arguments| {
                handler(A::from_arguments(arguments)?);
                Ok(())
            }),
        };
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), registration)
            .is_some();
        debug!(name, arity = A::ARITY, replaced, "registered handler");
    }

    pub(crate) fn unregister(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Dispatches every record in an inbound frame, in order.
    ///
    /// Malformed records are logged and skipped. Returns the server's
    /// `Close` request if the frame contained one; records after it are
    /// ignored.
    pub(crate) fn on_frame(&self, frame: &[u8]) -> Option<ServerClose> {
        for decoded in decode_frame(frame) {
            match decoded {
                Ok(msg) => {
                    if let Some(close) = self.on_message(msg) {
                        return Some(close);
                    }
                }
                Err(e) => warn!("dropping malformed message: {e}"),
            }
        }
        None
    }

    fn on_message(&self, msg: HubMessage) -> Option<ServerClose> {
        trace!(msg_type = %msg.msg_type(), id = ?msg.invocation_id(), "received message");
        match msg {
            HubMessage::Invocation {
                target, arguments, ..
            } => self.dispatch_event(&target, arguments),
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                if !self.calls.deliver_stream_item(&invocation_id, item) {
                    debug!(id = %invocation_id, "discarding stream item for unknown invocation");
                }
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => self.dispatch_completion(&invocation_id, result, error),
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                debug!(?error, allow_reconnect, "server requested close");
                return Some(ServerClose {
                    error,
                    allow_reconnect,
                });
            }
            HubMessage::StreamInvocation { invocation_id, .. }
            | HubMessage::CancelInvocation { invocation_id } => {
                warn!(id = %invocation_id, "ignoring client-bound stream request");
            }
        }
        None
    }

    fn dispatch_event(&self, target: &str, arguments: Vec<Value>) {
        let registration = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned();
        let Some(registration) = registration else {
            debug!(target, "no handler registered, dropping push event");
            return;
        };
        if arguments.len() != registration.arity {
            warn!(
                target,
                expected = registration.arity,
                got = arguments.len(),
                "rejecting push event with wrong argument count"
            );
            return;
        }
        if let Err(e) = (registration.handler)(arguments) {
            warn!(target, "rejecting push event: {e}");
        }
    }

    fn dispatch_completion(&self, id: &str, result: Option<Value>, error: Option<String>) {
        let delivered = match self.calls.kind(id) {
            Some(CallKind::RequestResponse) => match error {
                Some(error) => self.calls.fail(id, HubError::Server(error)),
                None => self.calls.resolve(id, result.unwrap_or(Value::Null)),
            },
            Some(CallKind::Stream) => self.calls.complete(id, error.map(HubError::Server)),
            None => false,
        };
        if !delivered {
            debug!(id, "discarding completion for unknown invocation");
        }
    }
}

impl HubConnection {
    /// Registers a push-event handler for `name`.
    ///
    /// Handlers may only be changed while the connection is disconnected.
    /// Registering the same name again replaces the previous handler.
    ///
    /// ```ignore
    /// conn.on("NewMessage", |(msg,): (ChatMessage,)| println!("{}: {}", msg.name, msg.text))?;
    /// ```
    pub fn on<A, F>(&self, name: &str, handler: F) -> Result<(), HubError>
    where
        A: HubArgs + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.inner.ensure_disconnected()?;
        self.inner.dispatcher.register(name, handler);
        Ok(())
    }

    /// Removes the handler for `name`. Only allowed while disconnected.
    pub fn off(&self, name: &str) -> Result<bool, HubError> {
        self.inner.ensure_disconnected()?;
        Ok(self.inner.dispatcher.unregister(name))
    }

    /// Fire-and-forget invocation. Returns once the frame is queued.
    pub async fn send<A: Serialize>(&self, method: &str, args: A) -> Result<(), HubError> {
        let frame = encode(&HubMessage::send(method, to_arguments(args)?))?;
        let tx = self.inner.connected_sender()?;
        tx.send(frame).await.map_err(|_| HubError::NotConnected)?;
        trace!(method, "sent invocation");
        Ok(())
    }

    /// Request-response invocation, decoding the result into `R`.
    ///
    /// No timeout is applied; wrap the future if one is needed.
    pub async fn invoke<R, A>(&self, method: &str, args: A) -> Result<R, HubError>
    where
        R: DeserializeOwned,
        A: Serialize,
    {
        let value = self.invoke_raw(method, to_arguments(args)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Request-response invocation with an untyped argument list and result.
    pub async fn invoke_raw(&self, method: &str, arguments: Vec<Value>) -> Result<Value, HubError> {
        let id = self.inner.next_invocation_id();
        let frame = encode(&HubMessage::invocation(&id, method, arguments))?;

        let (tx, rx) = oneshot::channel();
        let outbound = self.inner.register_call(&id, PendingCall::Invoke(tx))?;
        if outbound.send(frame).await.is_err() {
            self.inner.calls.remove(&id);
            return Err(HubError::NotConnected);
        }
        trace!(method, id = %id, "sent invocation");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::ConnectionClosed(None)),
        }
    }
}
