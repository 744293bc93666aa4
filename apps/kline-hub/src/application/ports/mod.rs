//! Port Interfaces
//!
//! Contracts between the hub's services and the outside world. Adapters in
//! the infrastructure layer implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`KlineSource`]: historical klines over REST, used for backfill
//! - [`BackfillScheduler`]: queue for backfill work, fed by the ingest path
//!   and by cold-start subscriptions
//!
//! ## Driver Ports (Inbound)
//!
//! - [`TokenValidator`]: admission check for subscriber handshakes

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::streaming::{Channel, Interval, RawKline};

// =============================================================================
// Kline Source
// =============================================================================

/// Maximum rows per klines request.
pub const MAX_KLINES_PER_REQUEST: u16 = 1_000;

/// Historical klines request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineQuery {
    /// Upper-case exchange symbol.
    pub symbol: String,
    /// Bar interval.
    pub interval: Interval,
    /// Earliest open time, inclusive (epoch ms).
    pub start_time: i64,
    /// Latest open time, inclusive (epoch ms).
    pub end_time: i64,
    /// Maximum rows, at most [`MAX_KLINES_PER_REQUEST`].
    pub limit: u16,
}

/// Kline source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The exchange asked us to slow down.
    #[error("rate limited by exchange")]
    RateLimited {
        /// Wait requested by the exchange, if any.
        retry_after: Option<Duration>,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Transport failure or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not decode.
    #[error("decode error: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether the same request may succeed if repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Port for fetching historical klines.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Fetch klines in `[start_time, end_time]`, oldest first.
    async fn fetch_klines(&self, query: &KlineQuery) -> Result<Vec<RawKline>, SourceError>;
}

// =============================================================================
// Backfill Scheduling
// =============================================================================

/// Why a backfill was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackfillKind {
    /// Fill bars missed between two live bars.
    Gap,
    /// Populate an empty channel for its first subscriber.
    Bootstrap,
}

impl BackfillKind {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gap => "gap",
            Self::Bootstrap => "bootstrap",
        }
    }
}

/// One unit of backfill work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackfillRequest {
    /// Kline channel to fill.
    pub channel: Channel,
    /// Interval of `channel`.
    pub interval: Interval,
    /// Earliest open time, inclusive.
    pub start_time: i64,
    /// Latest open time, inclusive.
    pub end_time: i64,
    /// Maximum rows.
    pub limit: u16,
    /// Gap fill or bootstrap.
    pub kind: BackfillKind,
}

impl BackfillRequest {
    /// Request for the bars in `[from_open_time, until_open_time)`.
    #[must_use]
    pub fn gap(channel: Channel, interval: Interval, from_open_time: i64, until_open_time: i64) -> Self {
        let steps = (until_open_time - from_open_time) / interval.duration_ms();
        let limit = u16::try_from(steps.max(1)).map_or(MAX_KLINES_PER_REQUEST, |n| {
            n.min(MAX_KLINES_PER_REQUEST)
        });
        Self {
            channel,
            interval,
            start_time: from_open_time,
            end_time: until_open_time - 1,
            limit,
            kind: BackfillKind::Gap,
        }
    }

    /// Request for the `count` most recent bars ending at `now_ms`.
    #[must_use]
    pub fn bootstrap(channel: Channel, interval: Interval, count: usize, now_ms: i64) -> Self {
        let limit = u16::try_from(count.max(1)).map_or(MAX_KLINES_PER_REQUEST, |n| {
            n.min(MAX_KLINES_PER_REQUEST)
        });
        Self {
            channel,
            interval,
            start_time: now_ms - i64::from(limit) * interval.duration_ms(),
            end_time: now_ms,
            limit,
            kind: BackfillKind::Bootstrap,
        }
    }

    /// REST query for this request.
    #[must_use]
    pub fn query(&self) -> KlineQuery {
        KlineQuery {
            symbol: self.channel.symbol().to_string(),
            interval: self.interval,
            start_time: self.start_time,
            end_time: self.end_time,
            limit: self.limit,
        }
    }
}

/// Port for queueing backfill work without blocking the caller.
#[cfg_attr(test, mockall::automock)]
pub trait BackfillScheduler: Send + Sync {
    /// Queue `request`. Returns `false` if it was dropped (queue full,
    /// duplicate of an in-flight request, or worker gone).
    fn schedule(&self, request: BackfillRequest) -> bool;
}

// =============================================================================
// Token Validator
// =============================================================================

/// Port for admitting subscriber connections.
pub trait TokenValidator: Send + Sync {
    /// Whether `token` (absent if the client sent none) is acceptable.
    fn validate(&self, token: Option<&str>) -> bool;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl TokenValidator for AllowAll {
    fn validate(&self, _token: Option<&str>) -> bool {
        true
    }
}

/// Accepts connections presenting one shared token.
#[derive(Clone)]
pub struct StaticToken {
    expected: String,
}

impl StaticToken {
    /// Require `expected`.
    #[must_use]
    pub const fn new(expected: String) -> Self {
        Self { expected }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken([REDACTED])")
    }
}

impl TokenValidator for StaticToken {
    fn validate(&self, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };
        // Compare every byte so the time taken does not reveal the prefix length.
        token.len() == self.expected.len()
            && token
                .bytes()
                .zip(self.expected.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}
