//! Client side of server-to-client result streams.
//!
//! Items are pushed to a callback in arrival order; the completion callback
//! fires exactly once. Cancellation is cooperative: items the server already
//! sent may still arrive, followed by a completion carrying
//! [`HubError::StreamCancelled`].

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use chathub_protocol::{HubMessage, encode};

use crate::args::to_arguments;
use crate::connection::HubConnection;
use crate::error::HubError;
use crate::registry::{CompleteCallback, ItemCallback, PendingCall, PendingCalls};

/// Handle to an active stream invocation.
pub struct StreamHandle {
    invocation_id: String,
    calls: PendingCalls,
}

impl StreamHandle {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// `true` until the stream completes or is cancelled.
    pub fn is_active(&self) -> bool {
        self.calls.is_active(&self.invocation_id)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("invocation_id", &self.invocation_id)
            .finish()
    }
}

impl HubConnection {
    /// Starts a stream invocation, decoding each item into `T`.
    ///
    /// Items that fail to decode are logged and dropped.
    pub async fn stream<T, A, I, C>(
        &self,
        method: &str,
        args: A,
        on_item: I,
        on_complete: C,
    ) -> Result<StreamHandle, HubError>
    where
        T: DeserializeOwned,
        A: Serialize,
        I: Fn(T) + Send + Sync + 'static,
        C: FnOnce(Result<(), HubError>) + Send + 'static,
    {
        let target = method.to_string();
        let on_item: ItemCallback = Arc::new(move |value: Value| {
            match serde_json::from_value::<T>(value) {
                Ok(item) => on_item(item),
                Err(e) => warn!(method = %target, "dropping undecodable stream item: {e}"),
            }
        });
        self.stream_raw(method, to_arguments(args)?, on_item, Box::new(on_complete))
            .await
    }

    /// Starts a stream invocation with untyped arguments and items.
    pub async fn stream_raw(
        &self,
        method: &str,
        arguments: Vec<Value>,
        on_item: ItemCallback,
        on_complete: CompleteCallback,
    ) -> Result<StreamHandle, HubError> {
        let id = self.inner.next_invocation_id();
        let frame = encode(&HubMessage::StreamInvocation {
            invocation_id: id.clone(),
            target: method.to_string(),
            arguments,
        })?;

        let outbound = self
            .inner
            .register_call(&id, PendingCall::Stream { on_item, on_complete })?;
        if outbound.send(frame).await.is_err() {
            self.inner.calls.remove(&id);
            return Err(HubError::NotConnected);
        }
        debug!(method, id = %id, "stream started");

        Ok(StreamHandle {
            invocation_id: id,
            calls: self.inner.calls.clone(),
        })
    }

    /// Asks the server to stop producing items.
    ///
    /// Fails with [`HubError::NoSuchStream`] if the stream already
    /// completed or was cancelled; no frame is sent in that case.
    ///
    /// Fails with [`HubError::NotConnected`] outside `Connected`; the
    /// stream stays active and the cancel can be retried.
    pub async fn cancel_stream(&self, handle: &StreamHandle) -> Result<(), HubError> {
        let id = &handle.invocation_id;
        if !self.inner.calls.is_active(id) {
            return Err(HubError::NoSuchStream(id.clone()));
        }
        let tx = self.inner.connected_sender()?;
        let frame = encode(&HubMessage::CancelInvocation {
            invocation_id: id.clone(),
        })?;

        // Only one concurrent cancel gets past here.
        self.inner.calls.cancel(id)?;
        if tx.send(frame).await.is_err() {
            self.inner.calls.reactivate(id);
            return Err(HubError::NotConnected);
        }
        trace!(id = %id, "sent cancel invocation");
        Ok(())
    }
}
