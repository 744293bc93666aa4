//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with the exchange, the cache
//! and subscribers.

/// Port interfaces for external systems (kline source, backfill, auth).
pub mod ports;

/// Application services: ingest, backfill and periodic maintenance.
pub mod services;
