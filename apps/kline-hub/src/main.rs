//! Kline Hub Binary
//!
//! Starts the kline distribution hub.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kline-hub
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//!
//! - `HUB_SYMBOLS`: Always-on symbols, comma separated
//! - `HUB_INTERVALS`: Always-on intervals, comma separated (default: 1m,5m,15m,1h)
//! - `HUB_WS_PORT`: Subscriber WebSocket port (default: 8080)
//! - `HUB_HTTP_PORT`: Health, metrics and snapshot port (default: 8082)
//! - `HUB_API_TOKEN`: Require this token at the WebSocket handshake
//! - `BINANCE_WS_URL` / `BINANCE_REST_URL`: Exchange endpoints
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
//! - `LOG_FORMAT`: `json` or `pretty`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use kline_hub::application::ports::{AllowAll, BackfillScheduler, StaticToken, TokenValidator};
use kline_hub::domain::validation::Validator;
use kline_hub::infrastructure::binance::{BinanceRestClient, BinanceStreamClient, StreamClientConfig};
use kline_hub::infrastructure::telemetry;
use kline_hub::infrastructure::ws::CloseReason;
use kline_hub::{
    BackfillConfig, CacheConfig, ConnectionManager, DemandTracker, FanOutEngine, HealthServer,
    HealthServerState, HistoricalCache, HubConfig, IngestPipeline, Scheduler, UpstreamMonitor,
    WsServer, WsServerState, backfill_channel, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Exchange name reported in status messages and health.
const EXCHANGE: &str = "binance";

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exchange events buffered between the stream client and the pipeline.
const EVENT_CHANNEL_CAPACITY: usize = 4_096;

#[tokio::main]
#[allow(clippy::expect_used, clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Kline Hub");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Shared state
    let monitor = Arc::new(UpstreamMonitor::new(EXCHANGE));
    let cache = Arc::new(HistoricalCache::new(CacheConfig::from_settings(&config.cache)));
    let fanout = Arc::new(FanOutEngine::new(cache));

    // REST backfill
    let rest_client = BinanceRestClient::new(&config.exchange.rest_url, config.backfill.request_timeout)?;
    let (backfill_handle, backfill_worker) = backfill_channel(
        Arc::new(rest_client),
        Arc::clone(&fanout),
        Arc::clone(&monitor),
        BackfillConfig::from_settings(&config.backfill),
    );
    let backfill: Arc<dyn BackfillScheduler> = Arc::new(backfill_handle);

    // Subscriber connections
    let connections = Arc::new(
        ConnectionManager::new(
            config.connections.clone(),
            Arc::clone(&fanout),
            DemandTracker::new(config.markets.base_channels()),
        )
        .with_backfill(Arc::clone(&backfill)),
    );

    // Exchange stream
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let stream_client = BinanceStreamClient::new(
        StreamClientConfig::from_settings(&config.exchange, &config.websocket),
        connections.upstream_demand(),
        event_tx,
        Arc::clone(&monitor),
        shutdown_token.clone(),
    );
    let pipeline = IngestPipeline::new(
        Validator::new(config.anomaly_threshold),
        Arc::clone(&fanout),
        Arc::clone(&monitor),
    )
    .with_backfill(backfill);

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        config.cache.channel_idle_ttl,
        Arc::clone(&connections),
        Arc::clone(&monitor),
    );

    // Servers
    let tokens: Arc<dyn TokenValidator> = match &config.api_token {
        Some(token) => Arc::new(StaticToken::new(token.expose().to_string())),
        None => Arc::new(AllowAll),
    };
    let ws_server = WsServer::new(
        config.server.ws_port,
        Arc::new(WsServerState::new(Arc::clone(&connections), Arc::clone(&tokens))),
        shutdown_token.clone(),
    );
    let health_server = HealthServer::new(
        config.server.http_port,
        Arc::new(
            HealthServerState::new(
                env!("CARGO_PKG_VERSION").to_string(),
                Arc::clone(&monitor),
                Arc::clone(&fanout),
                Arc::clone(&connections),
            )
            .with_tokens(Arc::clone(&tokens)),
        ),
        shutdown_token.clone(),
    );

    // Spawn tasks
    tracker.spawn(pipeline.run(event_rx, shutdown_token.clone()));
    tracker.spawn(backfill_worker.run(shutdown_token.clone()));
    tracker.spawn(scheduler.run(shutdown_token.clone()));

    tracker.spawn(async move {
        if let Err(e) = stream_client.run().await {
            tracing::error!(error = %e, "Stream client error");
        }
    });

    tracker.spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let ws_shutdown = shutdown_token.clone();
    tracker.spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
            ws_shutdown.cancel();
        }
    });

    tracker.close();
    tracing::info!("Kline hub ready");

    await_shutdown(&shutdown_token).await;
    drain_subscribers(&connections).await;
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait()).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Tasks did not stop in time"
        );
    }

    tracing::info!("Kline hub stopped");
    Ok(())
}

/// Tell subscribers to reconnect elsewhere, give them the grace period,
/// then close whatever is left.
async fn drain_subscribers(connections: &ConnectionManager) {
    let grace = connections.settings().shutdown_grace;
    let notified = connections.broadcast_shutdown();
    tracing::info!(notified, grace_secs = grace.as_secs(), "Draining subscribers");

    if notified > 0 {
        tokio::time::sleep(grace).await;
    }
    let closed = connections.close_all(CloseReason::Shutdown);
    tracing::info!(closed, "Subscribers closed");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        symbols = config.markets.symbols.len(),
        intervals = ?config.markets.intervals,
        ws_port = config.server.ws_port,
        http_port = config.server.http_port,
        max_connections = config.connections.max_connections,
        max_retained = config.cache.max_retained,
        auth = config.api_token.is_some(),
        "Configuration loaded"
    );
    tracing::debug!(
        ws_url = %config.exchange.ws_url,
        rest_url = %config.exchange.rest_url,
        "Exchange endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT) or an internal cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: &CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Internal failure, initiating shutdown");
        }
    }
}
