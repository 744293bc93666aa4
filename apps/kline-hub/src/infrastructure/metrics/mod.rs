//! Prometheus Metrics Module
//!
//! Exposes hub metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingest**: accepted, rejected and stale bars; gaps; backfills
//! - **Delivery**: messages delivered and dropped, fan-out latency
//! - **Connections**: active subscribers, closes by reason, per-connection drops
//! - **Cache**: channel and bar counts, hit ratio
//! - **Upstream**: link state and reconnects
//! - **Errors**: every internal error by kind
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!("kline_hub_bars_accepted_total", "Bars accepted by the validator");
    describe_counter!(
        "kline_hub_bars_rejected_total",
        "Bars rejected by the validator, by reason"
    );
    describe_counter!(
        "kline_hub_bars_stale_total",
        "Out-of-order or redelivered bars dropped"
    );
    describe_counter!("kline_hub_tickers_accepted_total", "Ticker updates accepted");
    describe_counter!("kline_hub_gaps_detected_total", "Sequence gaps detected");
    describe_counter!(
        "kline_hub_backfill_requests_total",
        "REST backfill requests by kind and outcome"
    );

    describe_counter!(
        "kline_hub_messages_delivered_total",
        "Messages enqueued for subscribers, by type"
    );
    describe_counter!(
        "kline_hub_messages_dropped_total",
        "Messages dropped from full subscriber queues"
    );
    describe_histogram!(
        "kline_hub_fanout_seconds",
        "Time to enqueue one published message to all subscribers"
    );

    describe_gauge!("kline_hub_connections_active", "Active subscriber connections");
    describe_counter!(
        "kline_hub_connections_closed_total",
        "Closed subscriber connections, by reason"
    );
    describe_gauge!(
        "kline_hub_connection_dropped_messages",
        "Messages dropped per subscriber connection"
    );
    describe_gauge!("kline_hub_channel_subscribers", "Subscribers per channel");
    describe_gauge!("kline_hub_subscriptions_total", "Total active subscriptions");

    describe_gauge!("kline_hub_cache_channels", "Channels held in the cache");
    describe_gauge!("kline_hub_cache_bars", "Bars held in the cache");
    describe_gauge!("kline_hub_cache_hit_ratio", "Cache range hit ratio since start");

    describe_gauge!(
        "kline_hub_upstream_state",
        "Upstream link state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting)"
    );
    describe_counter!(
        "kline_hub_upstream_reconnects_total",
        "Upstream reconnection attempts"
    );

    describe_counter!("kline_hub_errors_total", "Internal errors by kind");
}

// =============================================================================
// Labels
// =============================================================================

/// Error kinds surfaced as metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Exchange or subscriber connection failure.
    Connection,
    /// Bar or ticker failed validation.
    Validation,
    /// Sequence gap detected.
    Gap,
    /// Slow subscriber disconnected.
    Backpressure,
    /// Exchange rate limit hit.
    RateLimit,
    /// Undecodable exchange or client message.
    Codec,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Validation => "validation",
            Self::Gap => "gap",
            Self::Backpressure => "backpressure",
            Self::RateLimit => "rate_limit",
            Self::Codec => "codec",
        }
    }
}

/// Message types delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Historical replay batch.
    Historical,
    /// Live kline.
    Kline,
    /// Live ticker.
    Ticker,
    /// Exchange status broadcast.
    ExchangeStatus,
    /// Control message (ping, pong, error, reconnect).
    Control,
}

impl MessageType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Kline => "kline",
            Self::Ticker => "ticker",
            Self::ExchangeStatus => "exchange_status",
            Self::Control => "control",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an internal error.
pub fn record_error(kind: ErrorKind) {
    counter!("kline_hub_errors_total", "kind" => kind.as_str()).increment(1);
}

/// Record an accepted bar.
pub fn record_bar_accepted() {
    counter!("kline_hub_bars_accepted_total").increment(1);
}

/// Record a rejected bar.
pub fn record_bar_rejected(reason: &'static str) {
    counter!("kline_hub_bars_rejected_total", "reason" => reason).increment(1);
    record_error(ErrorKind::Validation);
}

/// Record a stale bar.
pub fn record_bar_stale() {
    counter!("kline_hub_bars_stale_total").increment(1);
}

/// Record an accepted ticker.
pub fn record_ticker_accepted() {
    counter!("kline_hub_tickers_accepted_total").increment(1);
}

/// Record a detected gap.
pub fn record_gap() {
    counter!("kline_hub_gaps_detected_total").increment(1);
    record_error(ErrorKind::Gap);
}

/// Record a backfill request outcome.
pub fn record_backfill(kind: &'static str, outcome: &'static str) {
    counter!(
        "kline_hub_backfill_requests_total",
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record messages enqueued to subscribers.
pub fn record_delivered(msg_type: MessageType, count: u64) {
    counter!(
        "kline_hub_messages_delivered_total",
        "message_type" => msg_type.as_str()
    )
    .increment(count);
}

/// Record messages dropped from full queues.
pub fn record_dropped(count: u64) {
    counter!("kline_hub_messages_dropped_total").increment(count);
}

/// Record fan-out duration.
pub fn record_fanout_duration(duration: Duration) {
    histogram!("kline_hub_fanout_seconds").record(duration.as_secs_f64());
}

/// Record a closed connection.
pub fn record_connection_closed(reason: &'static str) {
    counter!("kline_hub_connections_closed_total", "reason" => reason).increment(1);
}

/// Update the active connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_connections(count: usize) {
    gauge!("kline_hub_connections_active").set(count as f64);
}

/// Update the drop count of one connection.
#[allow(clippy::cast_precision_loss)]
pub fn set_connection_dropped(connection_id: u64, dropped: u64) {
    gauge!(
        "kline_hub_connection_dropped_messages",
        "connection" => connection_id.to_string()
    )
    .set(dropped as f64);
}

/// Update the subscriber count of one channel.
#[allow(clippy::cast_precision_loss)]
pub fn set_channel_subscribers(channel: String, count: usize) {
    gauge!("kline_hub_channel_subscribers", "channel" => channel).set(count as f64);
}

/// Update the total subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("kline_hub_subscriptions_total").set(count as f64);
}

/// Update cache gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_cache_stats(channels: usize, bars: usize, hit_ratio: f64) {
    gauge!("kline_hub_cache_channels").set(channels as f64);
    gauge!("kline_hub_cache_bars").set(bars as f64);
    gauge!("kline_hub_cache_hit_ratio").set(hit_ratio);
}

/// Update the upstream state gauge.
pub fn set_upstream_state(code: u8) {
    gauge!("kline_hub_upstream_state").set(f64::from(code));
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("kline_hub_upstream_reconnects_total").increment(1);
    record_error(ErrorKind::Connection);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_as_str() {
        assert_eq!(ErrorKind::Connection.as_str(), "connection");
        assert_eq!(ErrorKind::Validation.as_str(), "validation");
        assert_eq!(ErrorKind::Gap.as_str(), "gap");
        assert_eq!(ErrorKind::Backpressure.as_str(), "backpressure");
        assert_eq!(ErrorKind::RateLimit.as_str(), "rate_limit");
        assert_eq!(ErrorKind::Codec.as_str(), "codec");
    }

    #[test]
    fn message_type_as_str() {
        assert_eq!(MessageType::Historical.as_str(), "historical");
        assert_eq!(MessageType::ExchangeStatus.as_str(), "exchange_status");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_bar_accepted();
        record_delivered(MessageType::Kline, 3);
        set_channel_subscribers("kline.BTCUSDT.1m".to_string(), 2);
    }
}
