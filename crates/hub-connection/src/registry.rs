//! Pending call registry.
//!
//! Tracks outstanding request-response invocations and streams by
//! invocation id and delivers their results. Every registered call receives
//! exactly one terminal signal: a resolution, a failure, a stream
//! completion, or the error passed to [`PendingCalls::drain_all`].
//!
//! Callbacks always run after the registry lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::HubError;

/// Receives stream items.
pub type ItemCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Receives the single terminal signal of a stream.
pub type CompleteCallback = Box<dyn FnOnce(Result<(), HubError>) + Send>;

/// Kind of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    RequestResponse,
    Stream,
}

/// Result callback owned by a registered call.
pub enum PendingCall {
    /// Request-response: resolved at most once.
    Invoke(oneshot::Sender<Result<Value, HubError>>),
    /// Stream: zero or more items, then exactly one completion.
    Stream {
        on_item: ItemCallback,
        on_complete: CompleteCallback,
    },
}

impl PendingCall {
    pub fn kind(&self) -> CallKind {
        match self {
            PendingCall::Invoke(_) => CallKind::RequestResponse,
            PendingCall::Stream { .. } => CallKind::Stream,
        }
    }

    /// Delivers a terminal signal, consuming the callback.
    fn finish(self, outcome: Result<Value, HubError>) {
        match self {
            PendingCall::Invoke(tx) => {
                let _ = tx.send(outcome);
            }
            PendingCall::Stream { on_complete, .. } => on_complete(outcome.map(|_| ())),
        }
    }
}

struct Entry {
    call: PendingCall,
    cancelled: bool,
}

/// Shared registry of outstanding calls, keyed by invocation id.
#[derive(Clone, Default)]
pub struct PendingCalls {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a call. Fails if the id is already outstanding.
    pub fn register(&self, id: &str, call: PendingCall) -> Result<(), HubError> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(HubError::DuplicateId(id.to_string()));
        }
        trace!(id, kind = ?call.kind(), "registered pending call");
        entries.insert(
            id.to_string(),
            Entry {
                call,
                cancelled: false,
            },
        );
        Ok(())
    }

    /// Returns the kind of an outstanding call.
    pub fn kind(&self, id: &str) -> Option<CallKind> {
        self.entries().get(id).map(|e| e.call.kind())
    }

    /// Removes a request-response entry if it has the given kind.
    fn take_kind(&self, id: &str, kind: CallKind) -> Option<Entry> {
        let mut entries = self.entries();
        if entries.get(id)?.call.kind() != kind {
            return None;
        }
        entries.remove(id)
    }

    /// Resolves a request-response call. Returns `false` if no such call.
    pub fn resolve(&self, id: &str, result: Value) -> bool {
        match self.take_kind(id, CallKind::RequestResponse) {
            Some(entry) => {
                entry.call.finish(Ok(result));
                true
            }
            None => false,
        }
    }

    /// Fails a request-response call. Returns `false` if no such call.
    pub fn fail(&self, id: &str, error: HubError) -> bool {
        match self.take_kind(id, CallKind::RequestResponse) {
            Some(entry) => {
                entry.call.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Delivers one item to an active stream.
    ///
    /// Items still in flight after a cancel request are delivered; only the
    /// completion ends delivery. Returns `false` if no such stream.
    pub fn deliver_stream_item(&self, id: &str, item: Value) -> bool {
        let on_item = match self.entries().get(id) {
            Some(Entry {
                call: PendingCall::Stream { on_item, .. },
                ..
            }) => Arc::clone(on_item),
            _ => return false,
        };
        on_item(item);
        true
    }

    /// Completes a stream: its single terminal signal.
    ///
    /// A stream that was cancelled always completes with
    /// [`HubError::StreamCancelled`].
    pub fn complete(&self, id: &str, error: Option<HubError>) -> bool {
        let Some(entry) = self.take_kind(id, CallKind::Stream) else {
            return false;
        };
        let outcome = if entry.cancelled {
            Err(HubError::StreamCancelled)
        } else {
            error.map_or(Ok(Value::Null), Err)
        };
        entry.call.finish(outcome);
        true
    }

    /// Marks a stream cancelled.
    ///
    /// Fails with [`HubError::NoSuchStream`] if the stream is unknown,
    /// already completed, or already cancelled.
    pub fn cancel(&self, id: &str) -> Result<(), HubError> {
        match self.entries().get_mut(id) {
            Some(entry) if entry.call.kind() == CallKind::Stream && !entry.cancelled => {
                entry.cancelled = true;
                Ok(())
            }
            _ => Err(HubError::NoSuchStream(id.to_string())),
        }
    }

    /// Clears the cancelled mark after a cancel request failed to go out.
    pub(crate) fn reactivate(&self, id: &str) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.cancelled = false;
        }
    }

    /// Returns `true` while a stream is registered and not cancelled.
    pub fn is_active(&self, id: &str) -> bool {
        self.entries()
            .get(id)
            .is_some_and(|e| e.call.kind() == CallKind::Stream && !e.cancelled)
    }

    /// Removes an entry without signalling it.
    ///
    /// Used when the request never reached the transport; the caller reports
    /// the failure directly.
    pub(crate) fn remove(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Fails every outstanding call with `error`. Returns how many were drained.
    pub fn drain_all(&self, error: HubError) -> usize {
        let drained: Vec<(String, Entry)> = self.entries().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            trace!(%id, "draining pending call");
            entry.call.finish(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
