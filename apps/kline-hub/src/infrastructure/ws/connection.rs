//! Client Connection
//!
//! State owned by one subscriber socket: lifecycle, outbound queue,
//! subscription set and heartbeat bookkeeping.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::outbound::{OutboundQueue, PushOutcome};
use super::protocol::ServerMessage;
use crate::domain::subscription::{ConnectionId, SubscriptionSet};
use crate::infrastructure::heartbeat::PingTracker;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet admitted.
    Connecting,
    /// Exchanging frames.
    Active,
    /// Torn down; subscriptions released.
    Closed,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Ping went unanswered past the grace period.
    IdleTimeout,
    /// Too many consecutive send timeouts.
    SlowClient,
    /// Client closed the socket.
    ClientClosed,
    /// Hub shutting down.
    Shutdown,
    /// Socket error.
    ConnectionError,
    /// Handshake token rejected.
    AuthFailed,
}

impl CloseReason {
    /// Metric and log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::SlowClient => "slow_client",
            Self::ClientClosed => "client_closed",
            Self::Shutdown => "shutdown",
            Self::ConnectionError => "connection_error",
            Self::AuthFailed => "auth_failed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subscriber socket.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    state: Mutex<ConnectionState>,
    queue: Arc<OutboundQueue>,
    subscriptions: Mutex<SubscriptionSet>,
    ping: PingTracker,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// New connection in [`ConnectionState::Connecting`].
    #[must_use]
    pub fn new(id: ConnectionId, queue_capacity: usize, max_subscriptions: usize) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            subscriptions: Mutex::new(SubscriptionSet::new(max_subscriptions)),
            ping: PingTracker::new(),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether frames are flowing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Whether the connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Move from `Connecting` to `Active`. Returns `false` in any other state.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Active;
            self.ping.reset();
            true
        } else {
            false
        }
    }

    /// Move to `Closed`, close the queue and wake the socket tasks.
    /// Only the first call wins; later calls return `false`.
    pub fn mark_closed(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }
        let _ = self.close_reason.set(reason);
        self.queue.close();
        self.cancel.cancel();
        true
    }

    /// Reason given to the first [`Self::mark_closed`].
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Outbound queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Encode and enqueue `message`.
    pub fn send(&self, message: &ServerMessage) -> PushOutcome {
        match message.encode() {
            Ok(frame) => self.queue.push(frame),
            Err(e) => {
                tracing::error!(connection_id = self.id, error = %e, "Failed to encode message");
                PushOutcome::Closed
            }
        }
    }

    /// Subscription set.
    pub fn subscriptions(&self) -> parking_lot::MutexGuard<'_, SubscriptionSet> {
        self.subscriptions.lock()
    }

    /// Heartbeat bookkeeping.
    #[must_use]
    pub const fn ping(&self) -> &PingTracker {
        &self.ping
    }

    /// Token cancelled when the connection closes.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::{Channel, Interval};

    #[test]
    fn lifecycle() {
        let conn = ClientConnection::new(1, 8, 4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.activate());
        assert!(!conn.activate());
        assert!(conn.is_active());

        assert!(conn.mark_closed(CloseReason::IdleTimeout));
        assert!(!conn.mark_closed(CloseReason::SlowClient));
        assert_eq!(conn.close_reason(), Some(CloseReason::IdleTimeout));
        assert!(conn.cancel_token().is_cancelled());
        assert!(conn.queue().is_closed());
        assert!(!conn.activate());
    }

    #[test]
    fn send_after_close_is_discarded() {
        let conn = ClientConnection::new(1, 8, 4);
        conn.activate();
        assert_eq!(conn.send(&ServerMessage::Pong), PushOutcome::Queued);
        conn.mark_closed(CloseReason::ClientClosed);
        assert_eq!(conn.send(&ServerMessage::Pong), PushOutcome::Closed);
    }

    #[test]
    fn subscription_quota_applies() {
        let conn = ClientConnection::new(1, 8, 1);
        let outcome = conn.subscriptions().add([
            Channel::kline("BTCUSDT", Interval::OneMinute),
            Channel::ticker("BTCUSDT"),
        ]);
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.over_quota.len(), 1);
    }

    #[test]
    fn close_reason_labels() {
        assert_eq!(CloseReason::SlowClient.to_string(), "slow_client");
        assert_eq!(CloseReason::AuthFailed.as_str(), "auth_failed");
    }
}
