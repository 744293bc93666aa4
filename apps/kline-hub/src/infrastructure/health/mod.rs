//! Health, Metrics and Data Endpoints
//!
//! HTTP server on the operational port. Used by container orchestrators,
//! load balancers, monitoring systems, and clients that want a snapshot
//! without holding a WebSocket open.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON status; 200 while the upstream is connected, 503 otherwise
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (upstream connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /klines/{symbol}/{interval}?limit=` - Cached bars, oldest first
//! - `GET /ticker/{symbol}` - Latest ticker for one symbol
//! - `GET /tickers` - Latest ticker for every symbol
//!
//! The data endpoints require the API token (`X-API-Key` header or
//! `Authorization: Bearer`) when one is configured; the rest stay open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{AllowAll, TokenValidator};
use crate::domain::streaming::{Bar, Channel, Interval, Ticker, is_valid_symbol};
use crate::domain::upstream::{UpstreamHealth, UpstreamMonitor, UpstreamSnapshot};
use crate::infrastructure::broadcast::FanOutEngine;
use crate::infrastructure::cache::CacheStats;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::ws::ConnectionManager;
use crate::infrastructure::ws::server::bearer_token;

/// Header carrying the API token on data requests.
const API_KEY_HEADER: &str = "x-api-key";

/// Default `limit` for `/klines`.
const DEFAULT_KLINES_LIMIT: usize = 100;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Hub version.
    pub version: String,
    /// Process instance id.
    pub instance_id: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Exchange link.
    pub upstream: UpstreamSnapshot,
    /// Subscriber connections.
    pub clients: ClientStatus,
    /// Cache counters.
    pub cache: CacheStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream connected and caught up.
    Healthy,
    /// Upstream connected, backfill still running.
    Degraded,
    /// Upstream not connected.
    Unhealthy,
}

impl From<UpstreamHealth> for HealthStatus {
    fn from(health: UpstreamHealth) -> Self {
        match health {
            UpstreamHealth::Connected => Self::Healthy,
            UpstreamHealth::Recovering => Self::Degraded,
            UpstreamHealth::Disconnected => Self::Unhealthy,
        }
    }
}

/// Subscriber connection counts.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Open connections.
    pub connections: usize,
    /// Channels with a fan-out slot.
    pub channels: usize,
    /// Subscriptions across all connections.
    pub subscriptions: usize,
}

/// Cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Raw counters.
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Hit ratio since start.
    pub hit_ratio: f64,
}

/// `/klines` response.
#[derive(Debug, Clone, Serialize)]
pub struct KlinesResponse {
    /// Symbol.
    pub symbol: String,
    /// Interval.
    pub interval: Interval,
    /// Bars, oldest first.
    pub klines: Vec<Bar>,
    /// Number of bars.
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    instance_id: uuid::Uuid,
    started_at: Instant,
    monitor: Arc<UpstreamMonitor>,
    fanout: Arc<FanOutEngine>,
    connections: Arc<ConnectionManager>,
    tokens: Arc<dyn TokenValidator>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        monitor: Arc<UpstreamMonitor>,
        fanout: Arc<FanOutEngine>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            version,
            instance_id: uuid::Uuid::new_v4(),
            started_at: Instant::now(),
            monitor,
            fanout,
            connections,
            tokens: Arc::new(AllowAll),
        }
    }

    /// Guard the data endpoints with `tokens`.
    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenValidator>) -> Self {
        self.tokens = tokens;
        self
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Router with every endpoint.
    pub fn router(state: Arc<HealthServerState>) -> Router {
        let data = Router::new()
            .route("/klines/{symbol}/{interval}", get(klines_handler))
            .route("/ticker/{symbol}", get(ticker_handler))
            .route("/tickers", get(tickers_handler))
            .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_token));

        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .merge(data)
            .with_state(state)
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|token| token.trim().to_string())
}

async fn require_token(State(state): State<Arc<HealthServerState>>, request: Request, next: Next) -> Response {
    let token = api_key(request.headers()).or_else(|| bearer_token(request.headers()));
    if state.tokens.validate(token.as_deref()) {
        return next.run(request).await;
    }
    tracing::debug!(path = %request.uri().path(), "Data request rejected, invalid or missing token");
    error_response(StatusCode::UNAUTHORIZED, "invalid or missing token")
}

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.monitor.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

#[derive(Debug, Default, Deserialize)]
struct KlinesParams {
    limit: Option<usize>,
}

async fn klines_handler(
    State(state): State<Arc<HealthServerState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(params): Query<KlinesParams>,
) -> Response {
    if !is_valid_symbol(&symbol) {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid symbol: {symbol}"));
    }
    let Ok(interval) = interval.parse::<Interval>() else {
        return error_response(StatusCode::BAD_REQUEST, format!("unknown interval: {interval}"));
    };

    let cache = state.fanout.cache();
    let limit = params
        .limit
        .unwrap_or(DEFAULT_KLINES_LIMIT)
        .min(cache.max_retained());
    let channel = Channel::kline(&symbol, interval);
    let klines = cache.range(&channel, limit);

    Json(KlinesResponse {
        symbol: channel.symbol().to_string(),
        interval,
        count: klines.len(),
        klines,
    })
    .into_response()
}

async fn ticker_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
) -> Response {
    state.fanout.cache().ticker(&symbol).map_or_else(
        || error_response(StatusCode::NOT_FOUND, format!("no ticker for {symbol}")),
        |ticker| Json(ticker).into_response(),
    )
}

async fn tickers_handler(State(state): State<Arc<HealthServerState>>) -> Json<Vec<Ticker>> {
    Json(state.fanout.cache().tickers())
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let upstream = state.monitor.snapshot();
    let fanout = state.fanout.stats();
    let cache = state.fanout.cache().stats();

    HealthResponse {
        status: upstream.health.into(),
        version: state.version.clone(),
        instance_id: state.instance_id.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream,
        clients: ClientStatus {
            connections: state.connections.connection_count(),
            channels: fanout.channels,
            subscriptions: fanout.subscriptions,
        },
        cache: CacheStatus {
            hit_ratio: cache.hit_ratio(),
            stats: cache,
        },
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
