//! Async client issuing method calls to a remote viewer and correlating the
//! replies.
//!
//! Each call allocates a [`MessageId`], parks a completion slot in the
//! client's pending table and sends a `viewer_method` envelope through a
//! [`PeerSink`]. Replies come back through [`AsyncClient::on_response`] (or
//! [`AsyncClient::handle_message`] for raw frames) and complete the matching
//! [`ResponseHandle`].

mod pending;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::BridgeHandle;
use crate::message::{Envelope, MessageId, Payload};
use crate::registry::DeliveryError;
use crate::session::Session;
use pending::{PendingRequests, RequestResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("no scheduler available to host the request")]
    NoScheduler,
    #[error("`{operation}` is not supported by this client")]
    Unsupported { operation: &'static str },
    #[error("request cancelled")]
    Cancelled,
    #[error("client terminated")]
    Terminated,
    #[error("request timed out")]
    Timeout,
    #[error("too many pending requests")]
    AtCapacity,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("failed to send request: {0}")]
    Send(String),
}

/// Outbound path towards the peer that executes the calls.
pub trait PeerSink: Send + Sync + 'static {
    /// Writes `payload` as a binary frame when [`Payload::is_binary`], else as
    /// a text frame.
    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), DeliveryError>>;
}

impl PeerSink for mpsc::UnboundedSender<Payload> {
    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let res = mpsc::UnboundedSender::send(self, payload).map_err(|_| DeliveryError::Closed);
        async move { res }.boxed()
    }
}

/// Cheaply cloneable; the client terminates when the last clone is dropped.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    sink: Arc<dyn PeerSink>,
}

impl ClientInner {
    fn terminate(&self) -> usize {
        let cancelled = self.pending.close();
        if cancelled > 0 {
            tracing::info!(client = %self.name, cancelled, "client terminated with pending requests");
        }
        cancelled
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl AsyncClient {
    pub fn new(sink: impl PeerSink) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: format!("viewer_{}", rand::random::<u32>()),
                next_id: AtomicU64::new(1),
                pending: Arc::default(),
                sink: Arc::new(sink),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.pending.is_closed()
    }

    pub fn request(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<ResponseHandle, ClientError> {
        self.request_with_kwargs(method, args, serde_json::Map::new())
    }

    /// Calls `method` on the viewer. Fails immediately with
    /// [`ClientError::NoScheduler`] outside a tokio runtime.
    pub fn request_with_kwargs(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<ResponseHandle, ClientError> {
        let method = method.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            tracing::error!(client = %self.inner.name, %method, "no running runtime to host request");
            ClientError::NoScheduler
        })?;

        let id = MessageId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let receiver = self.inner.pending.insert(id)?;
        tracing::debug!(client = %self.inner.name, msg_id = %id, %method, "issuing viewer request");

        let payload = Envelope::viewer_method(id, method, args, kwargs).into_payload();
        let sink = self.inner.sink.clone();
        let pending = self.inner.pending.clone();
        runtime.spawn(async move {
            if let Err(err) = sink.send(payload).await {
                tracing::warn!(msg_id = %id, error = %err, "failed to send request");
                pending.complete(id, Err(ClientError::Send(err.to_string())));
            }
        });

        Ok(ResponseHandle {
            id,
            receiver,
            pending: Arc::downgrade(&self.inner.pending),
        })
    }

    /// Asks the viewer to serialize its current configuration.
    pub fn viewer_save(&self) -> Result<ResponseHandle, ClientError> {
        self.request("save", vec![])
    }

    /// Matches a response envelope against the pending table. Returns whether
    /// a pending request was completed.
    pub fn on_response(&self, envelope: Envelope) -> bool {
        let (id, result): (MessageId, RequestResult) = match envelope {
            Envelope::Response { id: Some(id), data } => (id, Ok(data)),
            Envelope::Error { id: Some(id), data } => {
                (id, Err(ClientError::Remote(error_detail(data))))
            }
            other => {
                tracing::debug!(
                    client = %self.inner.name,
                    kind = other.kind(),
                    id = ?other.id(),
                    "ignoring envelope that answers no request"
                );
                return false;
            }
        };
        if self.inner.pending.complete(id, result) {
            true
        } else {
            tracing::warn!(client = %self.inner.name, msg_id = %id, "dropping stale response");
            false
        }
    }

    /// Parses a text frame and routes it to [`AsyncClient::on_response`].
    pub fn handle_message(&self, bytes: &[u8]) -> bool {
        match Envelope::from_slice(bytes) {
            Ok(envelope) => self.on_response(envelope),
            Err(error) => {
                tracing::warn!(client = %self.inner.name, %error, "dropping unparseable message");
                false
            }
        }
    }

    /// Cancels every pending request and refuses new ones.
    pub fn terminate(&self) -> usize {
        self.inner.terminate()
    }

    pub fn open_table(&self) -> Result<(), ClientError> {
        Err(ClientError::Unsupported {
            operation: "open_table",
        })
    }

    pub fn table(&self) -> Result<(), ClientError> {
        Err(ClientError::Unsupported { operation: "table" })
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }
}

pub(crate) struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    pub fn upgrade(&self) -> Option<AsyncClient> {
        self.0.upgrade().map(|inner| AsyncClient { inner })
    }
}

fn error_detail(data: Value) -> String {
    match data {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Resolves with the reply to one request.
///
/// Dropping the handle abandons the request; a reply arriving afterwards is
/// discarded as stale.
pub struct ResponseHandle {
    id: MessageId,
    receiver: oneshot::Receiver<RequestResult>,
    pending: Weak<PendingRequests>,
}

impl ResponseHandle {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits at most `duration`, abandoning the request on expiry.
    pub async fn with_timeout(mut self, duration: Duration) -> Result<Value, ClientError> {
        match tokio::time::timeout(duration, &mut self).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(msg_id = %self.id, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }
}

impl Future for ResponseHandle {
    type Output = Result<Value, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ClientError::Cancelled)))
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending.abandon(self.id);
        }
    }
}

/// Connects a client to the engine through a fresh [`Session`]: requests go
/// in through the session, and whatever the engine delivers to the session is
/// fed back into the client.
pub fn connect_local(bridge: &BridgeHandle) -> Result<AsyncClient, ClientError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoScheduler)?;
    let (session, mut deliveries) = Session::channel(bridge);
    let session_id = session.id();
    let client = AsyncClient::new(session);
    let weak = client.downgrade();
    runtime.spawn(async move {
        while let Some(bytes) = deliveries.recv().await {
            let Some(client) = weak.upgrade() else {
                break;
            };
            client.handle_message(&bytes);
        }
        tracing::debug!(session = %session_id, "local client delivery loop finished");
    });
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (AsyncClient, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AsyncClient::new(tx), rx)
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<Payload>) -> (MessageId, String) {
        match rx.recv().await.expect("request sent") {
            Payload::Text(Envelope::ViewerMethod { id: Some(id), data }) => (id, data.method),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_completes_the_matching_request() {
        let (client, mut rx) = client();
        let first = client.request("save", vec![]).unwrap();
        let second = client.request("restore", vec![json!({})]).unwrap();

        let (id1, m1) = next_call(&mut rx).await;
        let (id2, m2) = next_call(&mut rx).await;
        assert_eq!((m1.as_str(), m2.as_str()), ("save", "restore"));
        assert_ne!(id1, id2);

        // answer out of order
        assert!(client.on_response(Envelope::response(id2, json!("restored"))));
        assert!(client.on_response(Envelope::response(id1, json!({"plugin": "grid"}))));

        assert_eq!(first.await.unwrap(), json!({"plugin": "grid"}));
        assert_eq!(second.await.unwrap(), json!("restored"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_envelope_rejects_the_request() {
        let (client, mut rx) = client();
        let handle = client.viewer_save().unwrap();
        let (id, _) = next_call(&mut rx).await;
        client.on_response(Envelope::error(id, "viewer not ready"));
        assert_eq!(
            handle.await,
            Err(ClientError::Remote("viewer not ready".into()))
        );
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let (client, mut rx) = client();
        let handle = client.viewer_save().unwrap();
        let (id, _) = next_call(&mut rx).await;
        assert!(client.on_response(Envelope::response(id, json!(1))));
        assert!(!client.on_response(Envelope::response(id, json!(2))));
        assert_eq!(handle.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn unknown_and_uncorrelated_messages_are_ignored() {
        let (client, _rx) = client();
        assert!(!client.on_response(Envelope::response(MessageId::new(99), json!(null))));
        assert!(!client.on_response(Envelope::Response {
            id: None,
            data: json!("notification"),
        }));
        assert!(!client.handle_message(b"not json"));
    }

    #[tokio::test]
    async fn handle_message_parses_text_frames() {
        let (client, mut rx) = client();
        let handle = client.viewer_save().unwrap();
        let (id, _) = next_call(&mut rx).await;
        let frame = Envelope::response(id, json!("ok")).to_bytes().unwrap();
        assert!(client.handle_message(&frame));
        assert_eq!(handle.await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn terminate_cancels_pending_requests() {
        let (client, _rx) = client();
        let handle = client.viewer_save().unwrap();
        assert_eq!(client.terminate(), 1);

        let res = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("handle must not hang after terminate");
        assert_eq!(res, Err(ClientError::Cancelled));
        assert_eq!(client.viewer_save().err(), Some(ClientError::Terminated));
        assert!(client.is_terminated());
    }

    #[tokio::test]
    async fn dropping_the_client_cancels_pending_requests() {
        let (client, _rx) = client();
        let handle = client.viewer_save().unwrap();
        drop(client);
        assert_eq!(handle.await, Err(ClientError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_abandons_the_entry() {
        let (client, mut rx) = client();
        let handle = client.viewer_save().unwrap();
        let (id, _) = next_call(&mut rx).await;

        let res = handle.with_timeout(Duration::from_millis(10)).await;
        assert_eq!(res, Err(ClientError::Timeout));
        assert_eq!(client.pending_count(), 0);
        // late reply is a no-op
        assert!(!client.on_response(Envelope::response(id, json!("late"))));
    }

    #[tokio::test]
    async fn closed_sink_fails_the_request() {
        let (client, rx) = client();
        drop(rx);
        let handle = client.viewer_save().unwrap();
        assert!(matches!(handle.await, Err(ClientError::Send(_))));
    }

    #[test]
    fn request_without_runtime_fails_fast() {
        let (client, _rx) = client();
        assert_eq!(
            client.request("save", vec![]).err(),
            Some(ClientError::NoScheduler)
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn table_operations_are_unsupported() {
        let (client, _rx) = client();
        assert_eq!(
            client.open_table(),
            Err(ClientError::Unsupported {
                operation: "open_table"
            })
        );
        assert_eq!(
            client.table(),
            Err(ClientError::Unsupported { operation: "table" })
        );
    }

    #[tokio::test]
    async fn kwargs_are_sent_as_trailing_argument() {
        let (client, mut rx) = client();
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("columns".into(), json!(["x"]));
        let _handle = client
            .request_with_kwargs("restore", vec![json!(1)], kwargs)
            .unwrap();
        match rx.recv().await.unwrap() {
            Payload::Text(Envelope::ViewerMethod { data, .. }) => {
                assert_eq!(data.args, vec![json!(1), json!({"columns": ["x"]})]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
