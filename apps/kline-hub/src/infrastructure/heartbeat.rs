//! Heartbeat Tracking
//!
//! Ping/pong liveness shared by both sides of the hub:
//!
//! - The upstream exchange client runs a [`HeartbeatManager`] that asks for
//!   a ping every interval and reports a timeout when nothing came back.
//! - Each subscriber connection owns a [`PingTracker`]; the scheduler pings
//!   every connection and evicts the ones whose pong is overdue.
//!
//! Times use `tokio::time::Instant` so paused-clock tests can drive them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::WebSocketSettings;

// =============================================================================
// Ping Tracker
// =============================================================================

/// Outstanding-ping bookkeeping for one connection.
#[derive(Debug)]
pub struct PingTracker {
    last_pong: Mutex<Instant>,
    ping_sent_at: Mutex<Option<Instant>>,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PingTracker {
    /// New tracker with no ping outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_pong: Mutex::new(Instant::now()),
            ping_sent_at: Mutex::new(None),
        }
    }

    /// Record that a ping went out. An earlier unanswered ping keeps its
    /// timestamp so the grace period is not extended.
    pub fn mark_ping_sent(&self) {
        let mut sent = self.ping_sent_at.lock();
        if sent.is_none() {
            *sent = Some(Instant::now());
        }
    }

    /// Record a pong (or any other proof of life).
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
        *self.ping_sent_at.lock() = None;
    }

    /// Whether a ping is waiting for its pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.lock().is_some()
    }

    /// Whether the outstanding ping has gone unanswered for longer than `grace`.
    #[must_use]
    pub fn is_overdue(&self, grace: Duration) -> bool {
        self.ping_sent_at
            .lock()
            .is_some_and(|sent| sent.elapsed() > grace)
    }

    /// Time since the last pong.
    #[must_use]
    pub fn time_since_pong(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Forget any outstanding ping.
    pub fn reset(&self) {
        *self.last_pong.lock() = Instant::now();
        *self.ping_sent_at.lock() = None;
    }
}

// =============================================================================
// Heartbeat Manager (upstream)
// =============================================================================

/// Configuration for the upstream heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Time without a pong before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create configuration from [`WebSocketSettings`].
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// No pong within the timeout; the connection should be restarted.
    Timeout,
}

/// Periodic liveness check for one upstream connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    tracker: Arc<PingTracker>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        tracker: Arc<PingTracker>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            tracker,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is reported.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so a fresh
        // connection is not pinged before it has said anything.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if !self.check_and_ping().await {
                        break;
                    }
                }
            }
        }
    }

    async fn check_and_ping(&self) -> bool {
        if self.tracker.is_overdue(self.config.pong_timeout) {
            tracing::warn!(
                silent_secs = self.tracker.time_since_pong().as_secs(),
                timeout_secs = self.config.pong_timeout.as_secs(),
                "Upstream heartbeat timeout"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
            return false;
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Heartbeat receiver dropped");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tracker_overdue_after_grace() {
        let tracker = PingTracker::new();
        assert!(!tracker.is_overdue(Duration::from_secs(10)));

        tracker.mark_ping_sent();
        assert!(tracker.is_waiting_for_pong());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!tracker.is_overdue(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.is_overdue(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ping_keeps_first_timestamp() {
        let tracker = PingTracker::new();
        tracker.mark_ping_sent();
        tokio::time::advance(Duration::from_secs(8)).await;
        tracker.mark_ping_sent();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tracker.is_overdue(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_clears_outstanding_ping() {
        let tracker = PingTracker::new();
        tracker.mark_ping_sent();
        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.record_pong();
        assert!(!tracker.is_waiting_for_pong());
        assert!(!tracker.is_overdue(Duration::from_secs(10)));
        assert_eq!(tracker.time_since_pong(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_requests_pings() {
        let config = HeartbeatConfig {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        };
        let tracker = Arc::new(PingTracker::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(HeartbeatManager::new(config, tracker, tx, cancel.clone()).run());

        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn manager_reports_timeout() {
        let config = HeartbeatConfig {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(45),
        };
        let tracker = Arc::new(PingTracker::new());
        let (tx, mut rx) = mpsc::channel(4);
        let handle = tokio::spawn(
            HeartbeatManager::new(config, tracker.clone(), tx, CancellationToken::new()).run(),
        );

        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
        tracker.mark_ping_sent();
        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(rx.recv().await, Some(HeartbeatEvent::Timeout));

        handle.await.unwrap();
    }
}
