//! Backfill Worker
//!
//! REST backfill runs on its own task so the ingest path never waits on
//! HTTP. Producers hold a [`BackfillHandle`] and queue requests without
//! blocking; the [`BackfillWorker`] drains the queue one request at a
//! time, spending one token from the REST budget per attempt.
//!
//! Identical requests are collapsed while one is queued or in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BackfillRequest, BackfillScheduler, KlineSource, SourceError};
use crate::domain::streaming::{Bar, RawKline};
use crate::domain::upstream::UpstreamMonitor;
use crate::domain::validation::Validator;
use crate::infrastructure::binance::RestRateLimiter;
use crate::infrastructure::broadcast::FanOutEngine;
use crate::infrastructure::config::BackfillSettings;
use crate::infrastructure::metrics::{self, ErrorKind};

/// Upper bound on the wait between attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Backfill worker configuration.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// REST token bucket refill rate.
    pub requests_per_second: u32,
    /// Pending request capacity.
    pub queue_capacity: usize,
    /// Bound on a single REST call.
    pub request_timeout: Duration,
    /// Attempts per request.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self::from_settings(&BackfillSettings::default())
    }
}

impl BackfillConfig {
    /// Build from hub settings.
    #[must_use]
    pub const fn from_settings(settings: &BackfillSettings) -> Self {
        Self {
            requests_per_second: settings.requests_per_second,
            queue_capacity: settings.queue_capacity,
            request_timeout: settings.request_timeout,
            max_attempts: settings.max_attempts,
            retry_backoff: Duration::from_millis(500),
        }
    }

    fn retry_delay(&self, attempt: u32, error: &SourceError) -> Duration {
        if let SourceError::RateLimited {
            retry_after: Some(wait),
        } = error
        {
            return (*wait).min(MAX_RETRY_DELAY);
        }
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

type InFlight = Arc<Mutex<HashSet<BackfillRequest>>>;

/// Create a connected handle and worker.
#[must_use]
pub fn backfill_channel(
    source: Arc<dyn KlineSource>,
    fanout: Arc<FanOutEngine>,
    monitor: Arc<UpstreamMonitor>,
    config: BackfillConfig,
) -> (BackfillHandle, BackfillWorker) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let in_flight: InFlight = Arc::default();

    let handle = BackfillHandle {
        tx,
        monitor: Arc::clone(&monitor),
        in_flight: Arc::clone(&in_flight),
    };
    let worker = BackfillWorker {
        source,
        limiter: RestRateLimiter::per_second(config.requests_per_second),
        fanout,
        monitor,
        rx,
        config,
        in_flight,
    };
    (handle, worker)
}

// =============================================================================
// Handle
// =============================================================================

/// Non-blocking producer side of the backfill queue.
#[derive(Debug, Clone)]
pub struct BackfillHandle {
    tx: mpsc::Sender<BackfillRequest>,
    monitor: Arc<UpstreamMonitor>,
    in_flight: InFlight,
}

impl BackfillScheduler for BackfillHandle {
    fn schedule(&self, request: BackfillRequest) -> bool {
        let kind = request.kind.as_str();
        if !self.in_flight.lock().insert(request.clone()) {
            tracing::debug!(channel = %request.channel, "Backfill already pending");
            return false;
        }

        match self.tx.try_send(request.clone()) {
            Ok(()) => {
                self.monitor.backfill_queued();
                metrics::record_backfill(kind, "queued");
                true
            }
            Err(e) => {
                self.in_flight.lock().remove(&request);
                metrics::record_backfill(kind, "dropped");
                match e {
                    TrySendError::Full(_) => {
                        tracing::warn!(channel = %request.channel, "Backfill queue full");
                    }
                    TrySendError::Closed(_) => {
                        tracing::warn!(channel = %request.channel, "Backfill worker stopped");
                    }
                }
                false
            }
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Consumer side: fetches, validates and publishes backfilled bars.
pub struct BackfillWorker {
    source: Arc<dyn KlineSource>,
    limiter: RestRateLimiter,
    fanout: Arc<FanOutEngine>,
    monitor: Arc<UpstreamMonitor>,
    rx: mpsc::Receiver<BackfillRequest>,
    config: BackfillConfig,
    in_flight: InFlight,
}

impl BackfillWorker {
    /// Process requests until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            requests_per_second = self.limiter.requests_per_second(),
            "Backfill worker started"
        );
        loop {
            let request = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    self.finish(&request);
                    break;
                }
                () = self.process(&request) => self.finish(&request),
            }
        }

        while let Ok(request) = self.rx.try_recv() {
            self.finish(&request);
        }
        tracing::info!("Backfill worker stopped");
    }

    /// Fetch until success, a permanent error, or the attempt cap.
    ///
    /// Only network and server failures spend an attempt. A rate-limited
    /// response waits for `Retry-After` (or the backoff) and tries again.
    async fn process(&self, request: &BackfillRequest) {
        let kind = request.kind.as_str();
        let query = request.query();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        let mut throttled = 0_u32;

        loop {
            self.limiter.acquire().await;

            let result = tokio::time::timeout(self.config.request_timeout, self.source.fetch_klines(&query))
                .await
                .unwrap_or_else(|_| Err(SourceError::Network("request timed out".into())));

            let e = match result {
                Ok(rows) => {
                    let bars = Self::accept_rows(request, &rows);
                    let fetched = bars.len();
                    let delivery = self.fanout.publish_backfill(&request.channel, bars);
                    metrics::record_backfill(kind, "completed");
                    tracing::info!(
                        channel = %request.channel,
                        kind,
                        fetched,
                        delivered = delivery.delivered,
                        "Backfill completed"
                    );
                    return;
                }
                Err(e) => e,
            };

            let delay = if matches!(e, SourceError::RateLimited { .. }) {
                metrics::record_error(ErrorKind::RateLimit);
                throttled = throttled.saturating_add(1);
                self.config.retry_delay(throttled, &e)
            } else {
                if !e.is_retryable() || attempt >= max_attempts {
                    metrics::record_backfill(kind, "failed");
                    tracing::error!(channel = %request.channel, kind, attempt, error = %e, "Backfill failed");
                    return;
                }
                let delay = self.config.retry_delay(attempt, &e);
                attempt += 1;
                delay
            };

            tracing::warn!(
                channel = %request.channel,
                attempt,
                throttled,
                delay_ms = delay.as_millis(),
                error = %e,
                "Backfill attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Structurally valid rows for the requested channel and window.
    fn accept_rows(request: &BackfillRequest, rows: &[RawKline]) -> Vec<Bar> {
        rows.iter()
            .filter_map(|row| match Validator::check_shape(row) {
                Ok((channel, bar)) if channel == request.channel => Some(bar),
                Ok(_) => None,
                Err(e) => {
                    metrics::record_bar_rejected(e.reason());
                    tracing::debug!(channel = %request.channel, error = %e, "Rejected backfill row");
                    None
                }
            })
            .filter(|bar| (request.start_time..=request.end_time).contains(&bar.open_time))
            .collect()
    }

    fn finish(&self, request: &BackfillRequest) {
        self.in_flight.lock().remove(request);
        self.monitor.backfill_finished();
    }
}
