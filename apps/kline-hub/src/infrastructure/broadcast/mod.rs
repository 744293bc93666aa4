//! Fan-Out Engine
//!
//! Maps each channel to the outbound queues of its subscribers and pushes
//! published frames into them. Nothing here touches a socket; writer tasks
//! drain the queues.
//!
//! # Ordering
//!
//! Every channel has a slot guarded by its own mutex. Publishing a bar
//! writes it to the [`HistoricalCache`] and enqueues it while holding the
//! slot lock, and subscribing reads the replay batch and registers the
//! queue under the same lock. A new subscriber therefore sees each bar
//! exactly once: either inside its `historical` batch or as a live frame
//! after it.
//!
//! Lock order is slot, then cache entry, then queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::streaming::{Bar, Channel, Ticker};
use crate::domain::subscription::ConnectionId;
use crate::infrastructure::cache::HistoricalCache;
use crate::infrastructure::metrics::{self, ErrorKind};
use crate::infrastructure::ws::outbound::{OutboundQueue, PushOutcome};
use crate::infrastructure::ws::protocol::ServerMessage;

// =============================================================================
// Delivery Accounting
// =============================================================================

/// What one publish did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Queues the frame was appended to.
    pub delivered: usize,
    /// Of those, queues that had to drop their oldest frame.
    pub dropped: usize,
}

impl Delivery {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => self.delivered += 1,
            PushOutcome::DroppedOldest => {
                self.delivered += 1;
                self.dropped += 1;
            }
            PushOutcome::Closed => {}
        }
    }
}

/// Subscriber counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutStats {
    /// Channels with a live slot.
    pub channels: usize,
    /// Subscriptions across all channels.
    pub subscriptions: usize,
    /// Registered connections.
    pub connections: usize,
    /// Subscribers per channel, by channel name.
    pub per_channel: Vec<(String, usize)>,
}

// =============================================================================
// Channel Slot
// =============================================================================

#[derive(Debug)]
struct SlotState {
    subscribers: HashMap<ConnectionId, Arc<OutboundQueue>>,
    idle_since: Option<Instant>,
    retired: bool,
}

#[derive(Debug)]
struct ChannelSlot {
    state: Mutex<SlotState>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                subscribers: HashMap::new(),
                idle_since: Some(Instant::now()),
                retired: false,
            }),
        }
    }
}

// =============================================================================
// Fan-Out Engine
// =============================================================================

/// Channel → subscriber fan-out with atomic replay.
#[derive(Debug)]
pub struct FanOutEngine {
    cache: Arc<HistoricalCache>,
    channels: DashMap<Channel, Arc<ChannelSlot>>,
    connections: DashMap<ConnectionId, Arc<OutboundQueue>>,
}

/// Shared fan-out engine.
pub type SharedFanOut = Arc<FanOutEngine>;

impl FanOutEngine {
    /// Engine writing through to `cache`.
    #[must_use]
    pub fn new(cache: Arc<HistoricalCache>) -> Self {
        Self {
            cache,
            channels: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    /// The backing cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<HistoricalCache> {
        &self.cache
    }

    /// Lock the slot for `channel`, creating it if needed, and run `f`.
    fn with_slot<R>(&self, channel: &Channel, mut f: impl FnMut(&mut SlotState) -> R) -> R {
        loop {
            let slot = match self.channels.get(channel) {
                Some(slot) => Arc::clone(slot.value()),
                None => Arc::clone(
                    self.channels
                        .entry(channel.clone())
                        .or_insert_with(|| Arc::new(ChannelSlot::new()))
                        .value(),
                ),
            };
            let mut state = slot.state.lock();
            if state.retired {
                continue;
            }
            return f(&mut state);
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Make `queue` reachable by [`Self::broadcast`].
    pub fn register(&self, id: ConnectionId, queue: Arc<OutboundQueue>) {
        self.connections.insert(id, queue);
    }

    /// Forget a connection for broadcasts.
    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register `queue` on `channel` after enqueuing the channel's replay:
    /// a `historical` batch for klines, the latest ticker (if any) for
    /// tickers. Returns the number of replayed items.
    pub fn subscribe(&self, channel: &Channel, id: ConnectionId, queue: &Arc<OutboundQueue>) -> usize {
        self.with_slot(channel, |state| {
            let (replay, replayed) = match channel {
                Channel::Kline { symbol, interval } => {
                    let klines = self.cache.range(channel, self.cache.max_retained());
                    let n = klines.len();
                    (Some(ServerMessage::historical(symbol, *interval, klines)), n)
                }
                Channel::Ticker { symbol } => self
                    .cache
                    .ticker(symbol)
                    .map_or((None, 0), |ticker| (Some(ServerMessage::ticker(ticker)), 1)),
            };

            if let Some(message) = replay
                && let Some(frame) = encode(&message)
            {
                let outcome = queue.push(frame);
                metrics::record_delivered(message.message_type(), 1);
                if outcome == PushOutcome::DroppedOldest {
                    metrics::record_dropped(1);
                }
            }

            state.subscribers.insert(id, Arc::clone(queue));
            state.idle_since = None;
            replayed
        })
    }

    /// Remove `id` from `channel`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, channel: &Channel, id: ConnectionId) -> bool {
        let Some(slot) = self.channels.get(channel).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut state = slot.state.lock();
        let removed = state.subscribers.remove(&id).is_some();
        if state.subscribers.is_empty() && state.idle_since.is_none() {
            state.idle_since = Some(Instant::now());
        }
        removed
    }

    /// Subscribers currently on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .get(channel)
            .map(|s| Arc::clone(s.value()))
            .map_or(0, |slot| slot.state.lock().subscribers.len())
    }

    /// Whether `id` is subscribed to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &Channel, id: ConnectionId) -> bool {
        self.channels
            .get(channel)
            .map(|s| Arc::clone(s.value()))
            .is_some_and(|slot| slot.state.lock().subscribers.contains_key(&id))
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Cache `bar` and deliver it to the channel's subscribers.
    pub fn publish_bar(&self, channel: &Channel, bar: Bar) -> Delivery {
        let Some(interval) = channel.interval() else {
            return Delivery::default();
        };
        let started = std::time::Instant::now();

        let delivery = self.with_slot(channel, |state| {
            self.cache.append(channel, bar.clone());
            if state.subscribers.is_empty() {
                return Delivery::default();
            }
            let message = ServerMessage::kline(channel.symbol(), interval, bar.clone());
            deliver(state, &message)
        });

        metrics::record_fanout_duration(started.elapsed());
        delivery
    }

    /// Cache `ticker` and deliver it unless a newer one is already cached.
    pub fn publish_ticker(&self, ticker: Ticker) -> Delivery {
        let channel = Channel::ticker(&ticker.symbol);
        self.with_slot(&channel, |state| {
            if !self.cache.upsert_ticker(ticker.clone()) || state.subscribers.is_empty() {
                return Delivery::default();
            }
            deliver(state, &ServerMessage::ticker(ticker.clone()))
        })
    }

    /// Merge backfilled bars and deliver the ones inserted as a
    /// `historical` batch.
    ///
    /// Subscribers already hold every other cached bar, from replay or the
    /// live stream, so nothing already cached is sent again. Nothing is sent
    /// when the merge inserted nothing.
    pub fn publish_backfill(&self, channel: &Channel, bars: Vec<Bar>) -> Delivery {
        let Some(interval) = channel.interval() else {
            return Delivery::default();
        };

        self.with_slot(channel, |state| {
            let inserted = self.cache.merge_backfill(channel, bars.clone());
            if inserted.is_empty() || state.subscribers.is_empty() {
                return Delivery::default();
            }
            deliver(state, &ServerMessage::historical(channel.symbol(), interval, inserted))
        })
    }

    /// Deliver `message` to every registered connection.
    pub fn broadcast(&self, message: &ServerMessage) -> Delivery {
        let Some(frame) = encode(message) else {
            return Delivery::default();
        };
        let queues: Vec<Arc<OutboundQueue>> =
            self.connections.iter().map(|q| Arc::clone(q.value())).collect();

        let mut delivery = Delivery::default();
        for queue in queues {
            delivery.record(queue.push(frame.clone()));
        }
        account(message, delivery);
        delivery
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Drop slots that have had no subscribers for at least `ttl`.
    pub fn collect_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.channels.len();
        self.channels.retain(|_, slot| {
            let mut state = slot.state.lock();
            let idle = state.subscribers.is_empty()
                && state
                    .idle_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= ttl);
            if idle {
                state.retired = true;
            }
            !idle
        });
        before.saturating_sub(self.channels.len())
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> FanOutStats {
        let slots: Vec<(Channel, Arc<ChannelSlot>)> = self
            .channels
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut per_channel: Vec<(String, usize)> = slots
            .iter()
            .map(|(channel, slot)| (channel.to_string(), slot.state.lock().subscribers.len()))
            .collect();
        per_channel.sort();

        FanOutStats {
            channels: slots.len(),
            subscriptions: per_channel.iter().map(|(_, n)| n).sum(),
            connections: self.connections.len(),
            per_channel,
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Utf8Bytes> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode outbound message");
            metrics::record_error(ErrorKind::Codec);
            None
        }
    }
}

fn deliver(state: &SlotState, message: &ServerMessage) -> Delivery {
    let Some(frame) = encode(message) else {
        return Delivery::default();
    };
    let mut delivery = Delivery::default();
    for (id, queue) in &state.subscribers {
        let outcome = queue.push(frame.clone());
        if outcome == PushOutcome::DroppedOldest {
            tracing::debug!(connection_id = id, "Send queue full, dropped oldest frame");
        }
        delivery.record(outcome);
    }
    account(message, delivery);
    delivery
}

fn account(message: &ServerMessage, delivery: Delivery) {
    metrics::record_delivered(message.message_type(), delivery.delivered as u64);
    if delivery.dropped > 0 {
        metrics::record_dropped(delivery.dropped as u64);
    }
}
