//! Server-side representation of one connected client.
//!
//! A [`Session`] owns exactly one registration in the [`SessionRegistry`]
//! (accessed through the bridge) and releases it when closed or dropped, so
//! the id never outlives its owner.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::bridge::{BridgeError, BridgeHandle};
use crate::client::PeerSink;
use crate::message::{Payload, SessionId};
use crate::registry::{DeliveryCallback, DeliveryError};

pub struct Session {
    id: SessionId,
    bridge: BridgeHandle,
    closed: bool,
}

impl Session {
    /// Registers `callback` and returns the session that owns the registration.
    pub fn open(bridge: &BridgeHandle, callback: DeliveryCallback) -> Self {
        let id = bridge.registry().register(callback);
        Self {
            id,
            bridge: bridge.clone(),
            closed: false,
        }
    }

    /// Opens a session whose deliveries are handed off through a channel to
    /// whichever context owns the receiver.
    pub fn channel(bridge: &BridgeHandle) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self::open(bridge, channel_callback(tx));
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Forwards a raw request to the engine. Responses arrive later through
    /// the delivery callback, never through this call.
    pub fn handle_request(&self, request: &[u8]) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        self.bridge.submit(self.id, request.to_vec())
    }

    /// Requests one engine processing step, flushing queued responses.
    pub fn poll(&self) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        self.bridge.schedule_poll()
    }

    /// Unregisters the session and releases its engine resources. Idempotent.
    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.bridge.registry().unregister(self.id);
        if self.bridge.is_running() {
            let _ = self.bridge.close_session(self.id);
        }
        tracing::debug!(session = %self.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Lets a client talk to the engine through this session.
impl PeerSink for Session {
    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), DeliveryError>> {
        async move {
            let bytes = payload
                .into_bytes()
                .map_err(|err| DeliveryError::Other(err.into()))?;
            self.handle_request(&bytes)
                .map_err(|err| DeliveryError::Other(err.into()))?;
            self.poll().map_err(|err| DeliveryError::Other(err.into()))
        }
        .boxed()
    }
}

/// Builds a delivery callback that pushes into `tx`.
pub fn channel_callback(tx: mpsc::UnboundedSender<Vec<u8>>) -> DeliveryCallback {
    std::sync::Arc::new(move |bytes| {
        let res = tx.send(bytes).map_err(|_| DeliveryError::Closed);
        async move { res }.boxed()
    })
}
