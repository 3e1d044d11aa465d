//! Mapping of live sessions to the callbacks that deliver their messages.
//!
//! The registry is the only place sessions are looked up by id. It holds a
//! non-owning association: the [`Session`](crate::session::Session) owns its id
//! and removes it when closed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::message::SessionId;

/// Delivers raw bytes to the owner of a session.
pub type DeliveryCallback =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The hosting context of the session is no longer receiving.
    #[error("delivery channel closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("delivery to session {id} failed: {source}")]
    Delivery {
        id: SessionId,
        #[source]
        source: DeliveryError,
    },
}

/// Process-wide session table. Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    callbacks: DashMap<SessionId, DeliveryCallback>,
    next_id: AtomicU32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                callbacks: DashMap::new(),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Stores `callback` under a fresh id and returns it.
    pub fn register(&self, callback: DeliveryCallback) -> SessionId {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner.callbacks.insert(id, callback);
        tracing::debug!(session = %id, live = self.inner.callbacks.len(), "registered session");
        id
    }

    /// Registers a callback built from an async closure.
    pub fn register_fn<F, Fut>(&self, f: F) -> SessionId
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        self.register(Arc::new(
            move |bytes| -> BoxFuture<'static, Result<(), DeliveryError>> { Box::pin(f(bytes)) },
        ))
    }

    /// Removes the mapping for `id`. Returns whether it was present.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.inner.callbacks.remove(&id).is_some();
        if removed {
            tracing::debug!(session = %id, "unregistered session");
        } else {
            tracing::debug!(session = %id, "unregister of unknown session ignored");
        }
        removed
    }

    /// Hands `bytes` to the callback registered for `id`.
    ///
    /// Failures are logged here; callers on the dispatch path may ignore the
    /// returned error.
    pub async fn delegate(&self, id: SessionId, bytes: Vec<u8>) -> Result<(), RegistryError> {
        // clone out so the shard lock is not held across the await
        let callback = self
            .inner
            .callbacks
            .get(&id)
            .map(|entry| entry.value().clone());
        let Some(callback) = callback else {
            tracing::warn!(session = %id, len = bytes.len(), "dropping message for unknown session");
            return Err(RegistryError::NotFound(id));
        };
        callback(bytes).await.map_err(|source| {
            tracing::error!(session = %id, error = %source, "session delivery failed");
            RegistryError::Delivery { id, source }
        })
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.callbacks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.callbacks.is_empty()
    }
}
