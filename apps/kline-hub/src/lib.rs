#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_wrap
    )
)]

//! Kline Hub - Market Data Distribution
//!
//! Holds a single connection to Binance's market stream and serves klines
//! and 24h tickers to many WebSocket subscribers. New subscribers get the
//! cached history for a channel before any live update; bars missed while
//! the upstream link was down are backfilled over REST.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market data logic and types
//!   - `streaming`: Bars, tickers and channel keys
//!   - `subscription`: Per-connection sets and upstream demand
//!   - `upstream`: Exchange link state machine
//!   - `validation`: Shape, sequencing, gap and anomaly checks
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Kline source, backfill scheduling, token validation
//!   - `services`: Ingest pipeline, backfill worker, scheduler
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Stream and REST clients
//!   - `cache`: Historical cache
//!   - `broadcast`: Fan-out engine
//!   - `ws`: Subscriber server and connection manager
//!   - `health`: Health, metrics and snapshot endpoints
//!
//! # Data Flow
//!
//! ```text
//!                   ┌────────────┐    ┌───────────┐    ┌──────────┐
//! Binance WS ──────►│  Ingest    │───►│  Fan-Out  │───►│ Conn Mgr │──► Client 1
//!                   │  Pipeline  │    │  + Cache  │    │          │──► Client N
//!                   └─────┬──────┘    └─────▲─────┘    └──────────┘
//!                         │ gaps            │ backfilled bars
//!                         ▼                 │
//!                   ┌────────────┐          │
//! Binance REST ◄────│  Backfill  │──────────┘
//!                   └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Bar, Channel, Interval, Ticker};
pub use domain::subscription::{ConnectionId, DemandTracker, SubscriptionChanges};
pub use domain::upstream::{UpstreamHealth, UpstreamMonitor};

// Application services
pub use application::services::{
    BackfillConfig, BackfillHandle, BackfillWorker, IngestPipeline, Scheduler, backfill_channel,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, HubConfig};

// Core engines (for integration tests)
pub use infrastructure::broadcast::{FanOutEngine, SharedFanOut};
pub use infrastructure::cache::{CacheConfig, HistoricalCache};
pub use infrastructure::ws::{ConnectionManager, WsServer, WsServerState};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{MessageType as MetricsMessageType, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
