//! Subscriber WebSocket Server
//!
//! axum server exposing `GET /ws`. The handshake is refused with 503 when
//! the connection limit is reached. A token may be passed as `?token=` or
//! as a `Bearer` authorization header; a rejected token gets an
//! `auth_failed` error frame before the socket is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connection::CloseReason;
use super::manager::ConnectionManager;
use super::protocol::{ErrorCode, ServerMessage};
use crate::application::ports::TokenValidator;
use crate::infrastructure::metrics;

/// Shared state for WebSocket handlers.
pub struct WsServerState {
    manager: Arc<ConnectionManager>,
    tokens: Arc<dyn TokenValidator>,
}

impl WsServerState {
    /// State serving `manager`, admitting tokens accepted by `tokens`.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>, tokens: Arc<dyn TokenValidator>) -> Self {
        Self { manager, tokens }
    }
}

/// Subscriber WebSocket server.
pub struct WsServer {
    port: u16,
    state: Arc<WsServerState>,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a server for `port`.
    #[must_use]
    pub const fn new(port: u16, state: Arc<WsServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Router with the `/ws` route.
    pub fn router(state: Arc<WsServerState>) -> Router {
        Router::new().route("/ws", get(ws_handler)).with_state(state)
    }

    /// Bind `0.0.0.0:port` and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if binding fails or the server stops with an
    /// error.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "WebSocket server listening");
        serve(listener, self.state, self.cancel).await?;
        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

/// Serve subscribers on an already-bound listener until cancelled.
///
/// # Errors
///
/// Returns [`ServerError::ServerFailed`] if the server stops with an error.
pub async fn serve(
    listener: TcpListener,
    state: Arc<WsServerState>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, WsServer::router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ServerError::ServerFailed(e.to_string()))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// Token from an `Authorization: Bearer` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if !state.manager.has_capacity() {
        tracing::warn!(
            max_connections = state.manager.settings().max_connections,
            "Refusing subscriber, connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let token = params.token.or_else(|| bearer_token(&headers));
    let authorized = state.tokens.validate(token.as_deref());

    ws.on_upgrade(move |socket| async move {
        if authorized {
            handle_socket(socket, state).await;
        } else {
            reject(socket).await;
        }
    })
}

async fn reject(mut socket: WebSocket) {
    tracing::warn!("Subscriber token rejected");
    metrics::record_connection_closed(CloseReason::AuthFailed.as_str());

    if let Ok(frame) = ServerMessage::error(ErrorCode::AuthFailed, "invalid or missing token").encode()
    {
        let _ = socket.send(Message::Text(frame)).await;
    }
    let _ = socket.close().await;
}

async fn handle_socket(mut socket: WebSocket, state: Arc<WsServerState>) {
    let manager = Arc::clone(&state.manager);

    let conn = match manager.open() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Refusing subscriber");
            let _ = socket.close().await;
            return;
        }
    };
    manager.activate(&conn);

    let (sink, mut stream) = socket.split();
    let writer = {
        let manager = Arc::clone(&manager);
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { manager.drive_outbound(&conn, sink).await })
    };

    let reason = loop {
        tokio::select! {
            () = conn.cancel_token().cancelled() => break None,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => manager.handle_text(&conn, text.as_str()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.ping().record_pong(),
                Some(Ok(Message::Binary(_))) => {
                    conn.send(&ServerMessage::error(
                        ErrorCode::InvalidRequest,
                        "binary frames are not supported",
                    ));
                }
                Some(Ok(Message::Close(_))) | None => break Some(CloseReason::ClientClosed),
                Some(Err(e)) => {
                    tracing::debug!(connection_id = conn.id(), error = %e, "Socket read failed");
                    break Some(CloseReason::ConnectionError);
                }
            },
        }
    };

    if let Some(reason) = reason {
        manager.close(conn.id(), reason);
    }
    if let Err(e) = writer.await {
        tracing::error!(connection_id = conn.id(), error = %e, "Writer task failed");
    }
}

// =============================================================================
// Errors
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_header_is_read() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);
    }
}
