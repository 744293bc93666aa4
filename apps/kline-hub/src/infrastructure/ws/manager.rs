//! Connection Manager
//!
//! Owns every subscriber connection: admission, request handling,
//! heartbeats, eviction and the per-connection writer loop.
//!
//! # Backpressure
//!
//! Publishers only ever append to a connection's bounded queue. The writer
//! loop sends one frame at a time with a timeout; each timeout counts as a
//! lost frame, and after `max_consecutive_timeouts` in a row the connection
//! is closed as a slow client.
//!
//! # Lock order
//!
//! Subscription set, then fan-out slot. Changes to a connection's channel
//! set, its fan-out registrations and the upstream demand counts happen
//! under its subscription-set lock, so a concurrent close always releases
//! exactly what was acquired.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt};
use tokio::sync::watch;

use super::connection::{ClientConnection, CloseReason};
use super::outbound::PushOutcome;
use super::protocol::{ClientMessage, ErrorCode, ServerMessage, parse_channels};
use crate::application::ports::{BackfillRequest, BackfillScheduler};
use crate::domain::streaming::Channel;
use crate::domain::subscription::{ConnectionId, DemandTracker, SubscriptionChanges};
use crate::infrastructure::broadcast::FanOutEngine;
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::metrics::{self, ErrorKind};

/// Connection admission errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// Too many open connections.
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),
}

/// Registry and policy for subscriber connections.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    next_id: AtomicU64,
    fanout: Arc<FanOutEngine>,
    demand: DemandTracker,
    backfill: Option<Arc<dyn BackfillScheduler>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("max_connections", &self.settings.max_connections)
            .field("demanded_channels", &self.demand.active_channels())
            .field("backfill", &self.backfill.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager publishing through `fanout`.
    ///
    /// `demand` holds the base channels that are always streamed; other
    /// channels are requested upstream once a connection wants them.
    #[must_use]
    pub fn new(settings: ConnectionSettings, fanout: Arc<FanOutEngine>, demand: DemandTracker) -> Self {
        Self {
            settings,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            fanout,
            demand,
            backfill: None,
        }
    }

    /// Channels the exchange client should stream, kept current as
    /// connections come and go.
    #[must_use]
    pub fn upstream_demand(&self) -> watch::Receiver<BTreeSet<Channel>> {
        self.demand.upstream()
    }

    /// Bootstrap empty kline channels through `scheduler`.
    #[must_use]
    pub fn with_backfill(mut self, scheduler: Arc<dyn BackfillScheduler>) -> Self {
        self.backfill = Some(scheduler);
        self
    }

    /// Connection policy.
    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Fan-out engine.
    #[must_use]
    pub const fn fanout(&self) -> &Arc<FanOutEngine> {
        &self.fanout
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Whether another connection may be admitted.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.settings.max_connections
    }

    /// Admit a new connection in the `Connecting` state.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::AtCapacity`] at the connection limit.
    pub fn open(&self) -> Result<Arc<ClientConnection>, AdmissionError> {
        if !self.has_capacity() {
            return Err(AdmissionError::AtCapacity(self.settings.max_connections));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(ClientConnection::new(
            id,
            self.settings.send_queue_capacity,
            self.settings.max_subscriptions,
        ));
        self.connections.insert(id, Arc::clone(&conn));
        self.fanout.register(id, Arc::clone(conn.queue()));
        metrics::set_active_connections(self.connections.len());

        tracing::debug!(connection_id = id, "Connection opened");
        Ok(conn)
    }

    /// Start exchanging frames on `conn`.
    pub fn activate(&self, conn: &ClientConnection) -> bool {
        let activated = conn.activate();
        if activated {
            tracing::info!(
                connection_id = conn.id(),
                active = self.connections.len(),
                "Subscriber connected"
            );
        }
        activated
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Close `id`, release its subscriptions and forget it. Returns `false`
    /// if it was already gone.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };
        conn.mark_closed(reason);
        self.fanout.unregister(id);

        let released = {
            let mut subscriptions = conn.subscriptions();
            let channels = subscriptions.drain();
            for channel in &channels {
                self.fanout.unsubscribe(channel, id);
            }
            self.demand.release(&channels)
        };
        Self::forward_demand(&released);

        metrics::record_connection_closed(reason.as_str());
        metrics::set_connection_dropped(id, conn.queue().dropped());
        metrics::set_active_connections(self.connections.len());

        match reason {
            CloseReason::SlowClient | CloseReason::IdleTimeout | CloseReason::ConnectionError => {
                tracing::warn!(
                    connection_id = id,
                    reason = reason.as_str(),
                    dropped = conn.queue().dropped(),
                    "Subscriber closed"
                );
            }
            _ => {
                tracing::info!(connection_id = id, reason = reason.as_str(), "Subscriber closed");
            }
        }
        true
    }

    /// Close every connection.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        ids.into_iter().filter(|id| self.close(*id, reason)).count()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Handle one text frame from `conn`.
    pub fn handle_text(&self, conn: &Arc<ClientConnection>, text: &str) {
        conn.ping().record_pong();

        match ClientMessage::parse(text) {
            Ok(ClientMessage::Subscribe { channels }) => {
                self.subscribe(conn, &channels);
            }
            Ok(ClientMessage::Unsubscribe { channels }) => {
                self.unsubscribe(conn, &channels);
            }
            Ok(ClientMessage::Ping) => {
                conn.send(&ServerMessage::Pong);
            }
            Ok(ClientMessage::Pong) => {}
            Err(e) => {
                tracing::debug!(connection_id = conn.id(), error = %e, "Invalid client message");
                metrics::record_error(ErrorKind::Codec);
                conn.send(&ServerMessage::error(
                    ErrorCode::InvalidRequest,
                    format!("invalid message: {e}"),
                ));
            }
        }
    }

    /// Subscribe `conn` to the named channels. Returns the newly added ones.
    ///
    /// Each new channel gets its replay enqueued before live frames. Unknown
    /// names are answered with `invalid_request`, channels beyond the quota
    /// with `quota_exceeded`.
    pub fn subscribe(&self, conn: &Arc<ClientConnection>, names: &[String]) -> Vec<Channel> {
        let (channels, rejected) = parse_channels(names);
        if !rejected.is_empty() {
            conn.send(&ServerMessage::error(
                ErrorCode::InvalidRequest,
                format!("unknown channels: {}", rejected.join(", ")),
            ));
        }
        if channels.is_empty() {
            return Vec::new();
        }

        let mut cold = Vec::new();
        let (added, over_quota, demand) = {
            let mut subscriptions = conn.subscriptions();
            if conn.is_closed() {
                return Vec::new();
            }
            let outcome = subscriptions.add(channels);
            let demand = self.demand.acquire(&outcome.added);
            for channel in &outcome.added {
                let replayed = self.fanout.subscribe(channel, conn.id(), conn.queue());
                if replayed == 0 && channel.is_kline() {
                    cold.push(channel.clone());
                }
            }
            (outcome.added, outcome.over_quota, demand)
        };

        if !over_quota.is_empty() {
            let refused: Vec<String> = over_quota.iter().map(ToString::to_string).collect();
            conn.send(&ServerMessage::error(
                ErrorCode::QuotaExceeded,
                format!(
                    "subscription limit of {} reached, refused: {}",
                    self.settings.max_subscriptions,
                    refused.join(", ")
                ),
            ));
        }

        Self::forward_demand(&demand);
        for channel in cold {
            self.bootstrap(channel);
        }

        if !added.is_empty() {
            tracing::debug!(
                connection_id = conn.id(),
                channels = added.len(),
                "Subscribed"
            );
        }
        added
    }

    /// Unsubscribe `conn` from the named channels. Returns the removed ones.
    pub fn unsubscribe(&self, conn: &Arc<ClientConnection>, names: &[String]) -> Vec<Channel> {
        let (channels, rejected) = parse_channels(names);
        if !rejected.is_empty() {
            conn.send(&ServerMessage::error(
                ErrorCode::InvalidRequest,
                format!("unknown channels: {}", rejected.join(", ")),
            ));
        }

        let (removed, demand) = {
            let mut subscriptions = conn.subscriptions();
            let removed = subscriptions.remove(&channels);
            for channel in &removed {
                self.fanout.unsubscribe(channel, conn.id());
            }
            let demand = self.demand.release(&removed);
            (removed, demand)
        };
        Self::forward_demand(&demand);
        removed
    }

    fn forward_demand(changes: &SubscriptionChanges) {
        if !changes.is_empty() {
            tracing::debug!(
                subscribe = changes.subscribe.len(),
                unsubscribe = changes.unsubscribe.len(),
                "Upstream demand changed"
            );
        }
    }

    fn bootstrap(&self, channel: Channel) {
        let (Some(scheduler), Some(interval)) = (&self.backfill, channel.interval()) else {
            return;
        };
        let request = BackfillRequest::bootstrap(
            channel,
            interval,
            self.fanout.cache().max_retained(),
            chrono::Utc::now().timestamp_millis(),
        );
        let channel_name = request.channel.to_string();
        if scheduler.schedule(request) {
            tracing::debug!(channel = %channel_name, "Bootstrap backfill queued");
        }
    }

    // =========================================================================
    // Heartbeats
    // =========================================================================

    /// Ping every active connection. Returns how many were pinged.
    pub fn ping_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.is_active())
            .filter(|conn| {
                conn.ping().mark_ping_sent();
                conn.send(&ServerMessage::Ping) != PushOutcome::Closed
            })
            .count()
    }

    /// Close connections whose ping went unanswered past the grace period.
    pub fn evict_dead(&self) -> usize {
        let grace = self.settings.pong_grace;
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.is_active() && conn.ping().is_overdue(grace))
            .filter(|conn| self.close(conn.id(), CloseReason::IdleTimeout))
            .count()
    }

    /// Tell every connection the hub is going away.
    pub fn broadcast_shutdown(&self) -> usize {
        let message = ServerMessage::Reconnect {
            reason: "shutdown".to_string(),
            grace_period_seconds: self.settings.shutdown_grace.as_secs(),
        };
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.send(&message) != PushOutcome::Closed)
            .count()
    }

    /// Refresh per-connection gauges.
    pub fn refresh_metrics(&self) {
        let connections = self.snapshot();
        metrics::set_active_connections(connections.len());
        for conn in connections {
            metrics::set_connection_dropped(conn.id(), conn.queue().dropped());
        }
    }

    // =========================================================================
    // Writer
    // =========================================================================

    /// Drain `conn`'s queue into `sink` until the connection closes.
    ///
    /// Every send is bounded by the send timeout. After too many consecutive
    /// timeouts the connection is closed as a slow client and a
    /// `slow_client` error is attempted on the way out.
    pub async fn drive_outbound<S>(&self, conn: &Arc<ClientConnection>, mut sink: S)
    where
        S: Sink<Message> + Unpin,
        S::Error: fmt::Display,
    {
        let send_timeout = self.settings.send_timeout;
        let max_timeouts = self.settings.max_consecutive_timeouts.max(1);
        let mut consecutive_timeouts = 0u32;

        loop {
            let frame = tokio::select! {
                biased;
                () = conn.cancel_token().cancelled() => break,
                frame = conn.queue().pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match tokio::time::timeout(send_timeout, sink.send(Message::Text(frame))).await {
                Ok(Ok(())) => consecutive_timeouts = 0,
                Ok(Err(e)) => {
                    tracing::debug!(connection_id = conn.id(), error = %e, "Send failed");
                    self.close(conn.id(), CloseReason::ConnectionError);
                    break;
                }
                Err(_) => {
                    consecutive_timeouts += 1;
                    conn.queue().record_drop();
                    tracing::debug!(
                        connection_id = conn.id(),
                        consecutive_timeouts,
                        "Send timed out"
                    );
                    if consecutive_timeouts >= max_timeouts {
                        metrics::record_error(ErrorKind::Backpressure);
                        self.close(conn.id(), CloseReason::SlowClient);
                        let notice = ServerMessage::error(
                            ErrorCode::SlowClient,
                            format!("{consecutive_timeouts} consecutive send timeouts"),
                        );
                        if let Ok(frame) = notice.encode() {
                            let _ = tokio::time::timeout(send_timeout, sink.send(Message::Text(frame)))
                                .await;
                        }
                        break;
                    }
                }
            }
        }

        let _ = tokio::time::timeout(send_timeout, sink.close()).await;
    }
}
