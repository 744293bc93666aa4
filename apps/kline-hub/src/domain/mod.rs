//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the core domain types for kline distribution with
//! no I/O. Everything here is unit-testable without a runtime.

/// Market data types (bars, tickers, channels).
pub mod streaming;

/// Per-connection subscriptions and upstream demand.
pub mod subscription;

/// Exchange link state machine and shared monitor.
pub mod upstream;

/// Kline and ticker validation.
pub mod validation;
