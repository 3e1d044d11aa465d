//! WebSocket transport: one [`Session`] and one [`AsyncClient`] per connection.
//!
//! Binary frames from the peer are engine requests. Text frames are replies
//! to viewer method calls issued through the connection's client. Engine
//! deliveries go back as binary frames; client calls go out as text frames.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Extension, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::bridge::BridgeHandle;
use crate::client::AsyncClient;
use crate::config::ConfigArgs;
use crate::message::{Payload, SessionId};
use crate::session::Session;

/// Invoked once per accepted connection with the client bound to it.
pub type ClientHook = Arc<dyn Fn(SessionId, AsyncClient) + Send + Sync + 'static>;

#[derive(Clone)]
struct ServerState {
    bridge: BridgeHandle,
    on_client: Option<ClientHook>,
}

pub fn router(bridge: BridgeHandle) -> Router {
    build_router(ServerState {
        bridge,
        on_client: None,
    })
}

/// Like [`router`], handing every connection's client to `hook`.
pub fn router_with_client_hook(bridge: BridgeHandle, hook: ClientHook) -> Router {
    build_router(ServerState {
        bridge,
        on_client: Some(hook),
    })
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(websocket_session))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: &ConfigArgs, bridge: BridgeHandle) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.socket_addr()).await?;
    serve_on(listener, router(bridge)).await
}

pub async fn serve_on(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "websocket endpoint listening");
    axum::serve(listener, router).await.map_err(|e| {
        tracing::error!("Error while running websocket server: {e}");
        e.into()
    })
}

async fn websocket_session(
    ws: WebSocketUpgrade,
    Extension(state): Extension<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(error) = websocket_interface(state, socket).await {
            tracing::warn!(%error, "websocket connection ended with error");
        }
    })
}

async fn websocket_interface(state: ServerState, ws: WebSocket) -> anyhow::Result<()> {
    let (mut session, mut deliveries) = Session::channel(&state.bridge);
    let (client_tx, mut outbound) = mpsc::unbounded_channel::<Payload>();
    let client = AsyncClient::new(client_tx);
    let session_id = session.id();
    tracing::debug!(session = %session_id, client = client.name(), "websocket connection established");
    if let Some(hook) = &state.on_client {
        hook(session_id, client.clone());
    }

    let (mut server_sink, mut client_stream) = ws.split();
    let res: anyhow::Result<()> = async {
        loop {
            tokio::select! { biased;
                delivery = deliveries.recv() => {
                    let Some(bytes) = delivery else { return Ok(()) };
                    server_sink.send(Message::Binary(bytes.into())).await?;
                }
                payload = outbound.recv() => {
                    let Some(payload) = payload else { return Ok(()) };
                    let frame = match payload {
                        Payload::Binary(bytes) => Message::Binary(bytes.into()),
                        Payload::Text(envelope) => {
                            Message::Text(serde_json::to_string(&envelope)?.into())
                        }
                    };
                    server_sink.send(frame).await?;
                }
                msg = client_stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            session.handle_request(&data)?;
                            session.poll()?;
                        }
                        Some(Ok(Message::Text(text))) => {
                            client.handle_message(text.as_bytes());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!(session = %session_id, "client closed the connection");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }
    .await;

    client.terminate();
    session.close();
    let _ = server_sink.send(Message::Close(None)).await;
    res
}
