//! Upstream Exchange Link
//!
//! Explicit state machine for the single exchange connection, plus the
//! shared [`UpstreamMonitor`] that health checks and metrics read from.
//!
//! ```text
//! Disconnected ──Dial──► Connecting ──Established──► Connected
//!                            │                          │
//!                         Dropped                    Dropped
//!                            ▼                          ▼
//!                       Reconnecting ◄──Dial/Dropped──  │
//!                            │                          │
//!                            └──────Established─────────┘
//! ```
//!
//! Any state moves to `Disconnected` on `Shutdown`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

// =============================================================================
// State Machine
// =============================================================================

/// Connection state of the exchange link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Not connected and not trying.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Streaming.
    Connected,
    /// Lost the connection; retrying under backoff.
    Reconnecting,
}

impl LinkState {
    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Numeric code exported as a gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
        }
    }
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A dial attempt starts.
    Dial,
    /// The socket is open and subscriptions were sent.
    Established,
    /// The socket failed or closed.
    Dropped,
    /// The process is shutting down.
    Shutdown,
}

/// Transition rejected by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid link transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    /// State before the event.
    pub from: LinkState,
    /// Rejected event.
    pub event: LinkEvent,
}

/// Applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: LinkState,
    /// State after the event.
    pub to: LinkState,
    /// How long the link had been connected, for `Connected → Reconnecting`.
    pub connected_for: Option<Duration>,
}

/// Exchange link state machine.
#[derive(Debug, Clone)]
pub struct UpstreamLink {
    state: LinkState,
    connected_since: Option<Instant>,
    recovering_since: Option<Instant>,
}

impl Default for UpstreamLink {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamLink {
    /// Create a link in `Disconnected`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            connected_since: None,
            recovering_since: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Apply `event` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when the event is not allowed in the
    /// current state; the state is unchanged.
    pub fn apply(&mut self, event: LinkEvent, now: Instant) -> Result<Transition, InvalidTransition> {
        use LinkEvent as E;
        use LinkState as S;

        let from = self.state;
        let to = match (from, event) {
            (_, E::Shutdown) => S::Disconnected,
            (S::Disconnected, E::Dial) => S::Connecting,
            (S::Reconnecting, E::Dial | E::Dropped) | (S::Connecting | S::Connected, E::Dropped) => {
                S::Reconnecting
            }
            (S::Connecting | S::Reconnecting, E::Established) => S::Connected,
            _ => return Err(InvalidTransition { from, event }),
        };

        let connected_for = if from == S::Connected {
            self.connected_since.map(|since| now.duration_since(since))
        } else {
            None
        };

        match to {
            S::Connected => {
                self.connected_since = Some(now);
                if from == S::Reconnecting {
                    self.recovering_since = Some(now);
                }
            }
            S::Disconnected => {
                self.connected_since = None;
                self.recovering_since = None;
            }
            S::Connecting | S::Reconnecting => {
                self.connected_since = None;
            }
        }

        self.state = to;
        Ok(Transition {
            from,
            to,
            connected_for,
        })
    }

    /// Whether the link reconnected and has not yet settled.
    #[must_use]
    pub const fn is_recovering(&self) -> bool {
        self.recovering_since.is_some()
    }

    /// Clear the recovering flag once no backfill is pending and `settle`
    /// has elapsed since the reconnect. Returns `true` if it was cleared.
    pub fn settle(&mut self, now: Instant, settle: Duration, pending_backfills: usize) -> bool {
        match self.recovering_since {
            Some(since) if pending_backfills == 0 && now.duration_since(since) >= settle => {
                self.recovering_since = None;
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Shared Monitor
// =============================================================================

/// Health summary of the exchange link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamHealth {
    /// Connected and not catching up.
    Connected,
    /// Connected but backfilling after a reconnect.
    Recovering,
    /// Not connected.
    Disconnected,
}

/// Point-in-time view of the upstream link.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSnapshot {
    /// Exchange name.
    pub exchange: &'static str,
    /// Link state.
    pub state: LinkState,
    /// Health summary.
    pub health: UpstreamHealth,
    /// Messages received since start.
    pub messages_received: u64,
    /// Reconnect attempts since start.
    pub reconnects: u64,
    /// Backfill requests queued or in flight.
    pub pending_backfills: usize,
    /// Time of the last exchange message.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Last error reported by the exchange client.
    pub last_error: Option<String>,
}

/// Shared, thread-safe view of the exchange link.
///
/// The exchange client drives the state machine; the ingest pipeline and
/// backfill worker maintain the pending-backfill count; health and metrics
/// read snapshots.
#[derive(Debug)]
pub struct UpstreamMonitor {
    exchange: &'static str,
    link: Mutex<UpstreamLink>,
    pending_backfills: AtomicUsize,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    last_message_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl UpstreamMonitor {
    /// Create a monitor for `exchange`.
    #[must_use]
    pub fn new(exchange: &'static str) -> Self {
        Self {
            exchange,
            link: Mutex::new(UpstreamLink::new()),
            pending_backfills: AtomicUsize::new(0),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Exchange name.
    #[must_use]
    pub const fn exchange(&self) -> &'static str {
        self.exchange
    }

    /// Apply a state machine event now.
    ///
    /// # Errors
    ///
    /// Propagates [`InvalidTransition`].
    pub fn apply(&self, event: LinkEvent) -> Result<Transition, InvalidTransition> {
        let transition = self.link.lock().apply(event, Instant::now())?;
        if transition.from == LinkState::Reconnecting && event == LinkEvent::Dial {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        Ok(transition)
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.link.lock().state()
    }

    /// Health summary.
    #[must_use]
    pub fn health(&self) -> UpstreamHealth {
        let link = self.link.lock();
        match link.state() {
            LinkState::Connected if link.is_recovering() => UpstreamHealth::Recovering,
            LinkState::Connected => UpstreamHealth::Connected,
            _ => UpstreamHealth::Disconnected,
        }
    }

    /// Whether the link is connected (recovering included).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Clear the recovering flag when settled.
    pub fn settle(&self, settle: Duration) -> bool {
        let pending = self.pending_backfills();
        self.link.lock().settle(Instant::now(), settle, pending)
    }

    /// Record a received exchange message.
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message_at.write() = Some(Utc::now());
    }

    /// Record an exchange-side error.
    pub fn record_error(&self, error: impl Into<String>) {
        *self.last_error.write() = Some(error.into());
    }

    /// A backfill request was queued.
    pub fn backfill_queued(&self) {
        self.pending_backfills.fetch_add(1, Ordering::AcqRel);
    }

    /// A backfill request finished (successfully or not).
    pub fn backfill_finished(&self) {
        let _ = self
            .pending_backfills
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Backfill requests queued or in flight.
    #[must_use]
    pub fn pending_backfills(&self) -> usize {
        self.pending_backfills.load(Ordering::Acquire)
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> UpstreamSnapshot {
        UpstreamSnapshot {
            exchange: self.exchange,
            state: self.state(),
            health: self.health(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            pending_backfills: self.pending_backfills(),
            last_message_at: *self.last_message_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn happy_path() {
        let t0 = Instant::now();
        let mut link = UpstreamLink::new();

        assert_eq!(link.apply(LinkEvent::Dial, t0).unwrap().to, LinkState::Connecting);
        assert_eq!(
            link.apply(LinkEvent::Established, t0).unwrap().to,
            LinkState::Connected
        );
        assert!(!link.is_recovering());
    }

    #[test]
    fn drop_reports_connected_duration() {
        let t0 = Instant::now();
        let mut link = UpstreamLink::new();
        link.apply(LinkEvent::Dial, t0).unwrap();
        link.apply(LinkEvent::Established, t0).unwrap();

        let transition = link.apply(LinkEvent::Dropped, at(t0, 90)).unwrap();
        assert_eq!(transition.to, LinkState::Reconnecting);
        assert_eq!(transition.connected_for, Some(Duration::from_secs(90)));
    }

    #[test]
    fn reconnect_marks_recovering_until_settled() {
        let t0 = Instant::now();
        let mut link = UpstreamLink::new();
        link.apply(LinkEvent::Dial, t0).unwrap();
        link.apply(LinkEvent::Established, t0).unwrap();
        link.apply(LinkEvent::Dropped, at(t0, 1)).unwrap();
        link.apply(LinkEvent::Dial, at(t0, 6)).unwrap();
        link.apply(LinkEvent::Established, at(t0, 6)).unwrap();

        assert!(link.is_recovering());
        assert!(!link.settle(at(t0, 8), Duration::from_secs(5), 0));
        assert!(!link.settle(at(t0, 20), Duration::from_secs(5), 1));
        assert!(link.settle(at(t0, 20), Duration::from_secs(5), 0));
        assert!(!link.is_recovering());
    }

    #[test]
    fn failed_first_dial_goes_to_reconnecting() {
        let t0 = Instant::now();
        let mut link = UpstreamLink::new();
        link.apply(LinkEvent::Dial, t0).unwrap();

        let transition = link.apply(LinkEvent::Dropped, t0).unwrap();
        assert_eq!(transition.to, LinkState::Reconnecting);
        assert_eq!(transition.connected_for, None);

        assert_eq!(
            link.apply(LinkEvent::Dial, t0).unwrap().to,
            LinkState::Reconnecting
        );
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let t0 = Instant::now();
        let mut link = UpstreamLink::new();

        let err = link.apply(LinkEvent::Established, t0).unwrap_err();
        assert_eq!(err.from, LinkState::Disconnected);
        assert_eq!(link.state(), LinkState::Disconnected);

        assert!(link.apply(LinkEvent::Dropped, t0).is_err());

        link.apply(LinkEvent::Dial, t0).unwrap();
        link.apply(LinkEvent::Established, t0).unwrap();
        assert!(link.apply(LinkEvent::Dial, t0).is_err());
    }

    #[test]
    fn shutdown_from_any_state() {
        let t0 = Instant::now();
        for events in [
            vec![],
            vec![LinkEvent::Dial],
            vec![LinkEvent::Dial, LinkEvent::Established],
            vec![LinkEvent::Dial, LinkEvent::Dropped],
        ] {
            let mut link = UpstreamLink::new();
            for event in events {
                link.apply(event, t0).unwrap();
            }
            assert_eq!(
                link.apply(LinkEvent::Shutdown, t0).unwrap().to,
                LinkState::Disconnected
            );
        }
    }

    #[test]
    fn monitor_health_and_counters() {
        let monitor = UpstreamMonitor::new("binance");
        assert_eq!(monitor.health(), UpstreamHealth::Disconnected);

        monitor.apply(LinkEvent::Dial).unwrap();
        monitor.apply(LinkEvent::Established).unwrap();
        assert_eq!(monitor.health(), UpstreamHealth::Connected);

        monitor.apply(LinkEvent::Dropped).unwrap();
        monitor.apply(LinkEvent::Dial).unwrap();
        monitor.apply(LinkEvent::Established).unwrap();
        assert_eq!(monitor.health(), UpstreamHealth::Recovering);
        assert_eq!(monitor.snapshot().reconnects, 1);

        monitor.backfill_queued();
        assert!(!monitor.settle(Duration::ZERO));
        monitor.backfill_finished();
        monitor.backfill_finished();
        assert_eq!(monitor.pending_backfills(), 0);
        assert!(monitor.settle(Duration::ZERO));
        assert_eq!(monitor.health(), UpstreamHealth::Connected);
    }

    #[test]
    fn state_codes_are_distinct() {
        let codes = [
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Connected,
            LinkState::Reconnecting,
        ]
        .map(LinkState::code);
        assert_eq!(codes, [0, 1, 2, 3]);
    }
}
