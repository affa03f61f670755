//! Que endpoint: upgrade, admit, then relay inbound frames.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use k8mq_core::{Transport, TransportError};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::health::NOT_RUNNING_BODY;
use crate::metrics::{QUE_CONNECTIONS_TOTAL, QUE_DISCONNECTIONS_TOTAL};
use crate::server::AppState;
use crate::websocket::transport::SocketTransport;

/// GET on the que path.
pub async fn que_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, NOT_RUNNING_BODY).into_response();
    }
    let max = state.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Whether a read error is an ordinary way for a connection to end: a normal
/// or status-less close, an abrupt reset (what a load balancer does to idle
/// connections), or our own side closing.
pub fn is_normal_close(err: &TransportError) -> bool {
    match err {
        TransportError::Closed => true,
        TransportError::Connect(_) => false,
        TransportError::Io(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("without closing handshake")
                || msg.contains("connection reset")
                || msg.contains("closed")
        }
    }
}

#[instrument(skip_all, fields(conn_id))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = format!("conn_{}", uuid::Uuid::now_v7());
    let _ = tracing::Span::current().record("conn_id", conn_id.as_str());
    let transport = Arc::new(SocketTransport::new(conn_id, socket));

    // Ends when this handler returns, however it returns.
    let liveness = CancellationToken::new();
    let _alive = liveness.clone().drop_guard();

    counter!(QUE_CONNECTIONS_TOTAL).increment(1);
    if let Err(e) = state.registry.admit(transport.clone(), liveness).await {
        debug!(error = %e, "registry closed, refusing connection");
        transport.close().await;
        counter!(QUE_DISCONNECTIONS_TOTAL).increment(1);
        return;
    }
    debug!("connection admitted");

    loop {
        let read = tokio::select! {
            biased;
            () = state.cancel.cancelled() => break,
            read = transport.read() => read,
        };
        match read {
            Ok(message) => {
                debug!(len = message.len(), "received message");
                if let Some(reader) = &state.reader {
                    reader(message);
                } else if let Err(e) = state.registry.broadcast(message).await {
                    debug!(error = %e, "registry closed, dropping message");
                }
            }
            Err(e) => {
                if is_normal_close(&e) {
                    debug!(error = %e, "connection closed");
                } else {
                    warn!(error = %e, "k8mq wss error");
                }
                break;
            }
        }
    }

    transport.close().await;
    counter!(QUE_DISCONNECTIONS_TOTAL).increment(1);
}
