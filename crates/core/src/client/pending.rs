//! Outstanding requests of one client, keyed by correlation id.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use super::ClientError;
use crate::message::MessageId;

/// Maximum number of in-flight requests per client. New requests beyond this
/// are rejected instead of growing the table without bound.
pub(crate) const MAX_PENDING_REQUESTS: usize = 10_000;

pub(crate) type RequestResult = Result<Value, ClientError>;

#[derive(Default)]
pub(crate) struct PendingRequests {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<MessageId, oneshot::Sender<RequestResult>>,
    closed: bool,
}

impl PendingRequests {
    /// Inserts a completion slot for `id`.
    pub fn insert(&self, id: MessageId) -> Result<oneshot::Receiver<RequestResult>, ClientError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClientError::Terminated);
        }
        if state.entries.len() >= MAX_PENDING_REQUESTS {
            tracing::warn!(
                msg_id = %id,
                max = MAX_PENDING_REQUESTS,
                "too many pending requests, rejecting"
            );
            return Err(ClientError::AtCapacity);
        }
        let (tx, rx) = oneshot::channel();
        if state.entries.insert(id, tx).is_some() {
            // ids come from a monotonic counter
            tracing::error!(msg_id = %id, "correlation id reused while in flight");
        }
        Ok(rx)
    }

    /// Completes and removes the entry for `id`. Returns `false` when no such
    /// entry exists (already completed, abandoned or never issued).
    pub fn complete(&self, id: MessageId, result: RequestResult) -> bool {
        let Some(tx) = self.state.lock().entries.remove(&id) else {
            return false;
        };
        if tx.send(result).is_err() {
            tracing::debug!(msg_id = %id, "caller stopped waiting before completion");
        }
        true
    }

    /// Drops the entry for `id` without completing it.
    pub fn abandon(&self, id: MessageId) -> bool {
        self.state.lock().entries.remove(&id).is_some()
    }

    /// Refuses further inserts and cancels every outstanding entry.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            tracing::debug!(msg_id = %id, "cancelling pending request");
            let _ = tx.send(Err(ClientError::Cancelled));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_exactly_once() {
        let pending = PendingRequests::default();
        let id = MessageId::new(1);
        let rx = pending.insert(id).unwrap();

        assert!(pending.complete(id, Ok(json!(1))));
        assert!(!pending.complete(id, Ok(json!(2))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn close_cancels_everything() {
        let pending = PendingRequests::default();
        let a = pending.insert(MessageId::new(1)).unwrap();
        let b = pending.insert(MessageId::new(2)).unwrap();

        assert_eq!(pending.close(), 2);
        assert!(matches!(a.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(matches!(b.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(matches!(
            pending.insert(MessageId::new(3)),
            Err(ClientError::Terminated)
        ));
    }

    #[test]
    fn abandoned_entries_ignore_late_completion() {
        let pending = PendingRequests::default();
        let id = MessageId::new(4);
        let rx = pending.insert(id).unwrap();
        drop(rx);
        assert!(pending.abandon(id));
        assert!(!pending.complete(id, Ok(Value::Null)));
    }

    #[test]
    fn rejects_beyond_capacity() {
        let pending = PendingRequests::default();
        let receivers: Vec<_> = (0..MAX_PENDING_REQUESTS as u64)
            .map(|i| pending.insert(MessageId::new(i)).unwrap())
            .collect();
        assert!(matches!(
            pending.insert(MessageId::new(u64::MAX)),
            Err(ClientError::AtCapacity)
        ));
        drop(receivers);
    }
}
