//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance WebSocket and REST adapters.
pub mod binance;

/// Channel fan-out with atomic replay.
pub mod broadcast;

/// Bounded per-channel bar history and latest tickers.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Health, metrics and snapshot HTTP endpoints.
pub mod health;

/// Ping/pong bookkeeping shared by upstream and subscriber sockets.
pub mod heartbeat;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Subscriber WebSocket server.
pub mod ws;
