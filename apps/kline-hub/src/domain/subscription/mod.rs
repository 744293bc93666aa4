//! Subscription Management Types
//!
//! Domain types for tracking which channels each connection listens to
//! and how much upstream demand exists per channel.
//!
//! # Design
//!
//! Two concerns are tracked separately:
//! - [`SubscriptionSet`]: the channels one connection is subscribed to,
//!   bounded by a per-connection quota.
//! - [`DemandTracker`]: reference counts across all connections, so the
//!   exchange stream for a channel outside the configured base set is only
//!   requested while somebody listens to it. The full desired upstream set
//!   is published on a `watch` channel, so the stream client can always
//!   resync from the latest state instead of replaying deltas.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::watch;

use super::streaming::Channel;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber connection.
pub type ConnectionId = u64;

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to upstream exchange subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Channels to subscribe to upstream.
    pub subscribe: BTreeSet<Channel>,
    /// Channels to unsubscribe from upstream.
    pub unsubscribe: BTreeSet<Channel>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            subscribe: channels.into_iter().collect(),
            unsubscribe: BTreeSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            subscribe: BTreeSet::new(),
            unsubscribe: channels.into_iter().collect(),
        }
    }
}

// =============================================================================
// Per-connection Subscription Set
// =============================================================================

/// Result of adding channels to a [`SubscriptionSet`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// Channels newly added.
    pub added: Vec<Channel>,
    /// Channels that were already present.
    pub existing: Vec<Channel>,
    /// Channels refused because the quota is exhausted.
    pub over_quota: Vec<Channel>,
}

/// Channels one connection is subscribed to.
#[derive(Debug, Clone)]
pub struct SubscriptionSet {
    channels: HashSet<Channel>,
    limit: usize,
}

impl SubscriptionSet {
    /// Create an empty set allowing at most `limit` channels.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            channels: HashSet::new(),
            limit,
        }
    }

    /// Add channels, honoring the quota in request order.
    pub fn add(&mut self, channels: impl IntoIterator<Item = Channel>) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        for channel in channels {
            if self.channels.contains(&channel) {
                outcome.existing.push(channel);
            } else if self.channels.len() >= self.limit {
                outcome.over_quota.push(channel);
            } else {
                self.channels.insert(channel.clone());
                outcome.added.push(channel);
            }
        }
        outcome
    }

    /// Remove channels; returns the ones that were present.
    pub fn remove<'a>(&mut self, channels: impl IntoIterator<Item = &'a Channel>) -> Vec<Channel> {
        channels
            .into_iter()
            .filter(|channel| self.channels.remove(*channel))
            .cloned()
            .collect()
    }

    /// Remove and return every channel.
    pub fn drain(&mut self) -> Vec<Channel> {
        self.channels.drain().collect()
    }

    /// Whether the connection listens to `channel`.
    #[must_use]
    pub fn contains(&self, channel: &Channel) -> bool {
        self.channels.contains(channel)
    }

    /// Number of subscribed channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// =============================================================================
// Upstream Demand
// =============================================================================

/// Reference counts of downstream interest per channel.
///
/// Base channels are always streamed from the exchange and never produce
/// subscription changes. Any other channel is requested upstream when its
/// count goes 0→1 and released when it goes 1→0.
///
/// # Example
///
/// ```rust
/// use kline_hub::domain::streaming::{Channel, Interval};
/// use kline_hub::domain::subscription::DemandTracker;
///
/// let tracker = DemandTracker::new([Channel::kline("BTCUSDT", Interval::OneMinute)]);
/// let extra = Channel::kline("DOTUSDT", Interval::OneMinute);
///
/// // First listener requests the upstream stream
/// let changes = tracker.acquire(&[extra.clone()]);
/// assert!(changes.subscribe.contains(&extra));
///
/// // Second listener shares it
/// assert!(tracker.acquire(&[extra.clone()]).is_empty());
///
/// tracker.release(&[extra.clone()]);
/// let changes = tracker.release(&[extra.clone()]);
/// assert!(changes.unsubscribe.contains(&extra));
/// assert_eq!(tracker.upstream().borrow().len(), 1);
/// ```
#[derive(Debug)]
pub struct DemandTracker {
    base: HashSet<Channel>,
    refcounts: RwLock<HashMap<Channel, usize>>,
    desired: watch::Sender<BTreeSet<Channel>>,
}

impl Default for DemandTracker {
    fn default() -> Self {
        Self::new([])
    }
}

impl DemandTracker {
    /// Create a tracker with the always-on base channels.
    #[must_use]
    pub fn new(base: impl IntoIterator<Item = Channel>) -> Self {
        let base: HashSet<Channel> = base.into_iter().collect();
        let (desired, _) = watch::channel(base.iter().cloned().collect());
        Self {
            base,
            refcounts: RwLock::new(HashMap::new()),
            desired,
        }
    }

    /// Follow the full set of channels that should be streamed upstream:
    /// the base channels plus every channel with a listener.
    #[must_use]
    pub fn upstream(&self) -> watch::Receiver<BTreeSet<Channel>> {
        self.desired.subscribe()
    }

    /// Register one listener on each channel.
    pub fn acquire(&self, channels: &[Channel]) -> SubscriptionChanges {
        let mut refcounts = self.refcounts.write();
        let mut new_upstream = Vec::new();

        for channel in channels {
            let count = refcounts.entry(channel.clone()).or_insert(0);
            *count += 1;
            if *count == 1 && !self.base.contains(channel) {
                new_upstream.push(channel.clone());
            }
        }

        let changes = SubscriptionChanges::subscribe_only(new_upstream);
        self.publish(&changes);
        changes
    }

    /// Drop one listener from each channel.
    pub fn release(&self, channels: &[Channel]) -> SubscriptionChanges {
        let mut refcounts = self.refcounts.write();
        let mut remove_upstream = Vec::new();

        for channel in channels {
            let Some(count) = refcounts.get_mut(channel) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 {
                refcounts.remove(channel);
                if !self.base.contains(channel) {
                    remove_upstream.push(channel.clone());
                }
            }
        }

        let changes = SubscriptionChanges::unsubscribe_only(remove_upstream);
        self.publish(&changes);
        changes
    }

    // Called with the refcount lock held so published sets never go back
    // in time.
    fn publish(&self, changes: &SubscriptionChanges) {
        if changes.is_empty() {
            return;
        }
        self.desired.send_modify(|desired| {
            for channel in &changes.subscribe {
                desired.insert(channel.clone());
            }
            for channel in &changes.unsubscribe {
                desired.remove(channel);
            }
        });
    }

    /// Whether `channel` is part of the configured base set.
    #[must_use]
    pub fn is_base(&self, channel: &Channel) -> bool {
        self.base.contains(channel)
    }

    /// Current listener count for `channel`.
    #[must_use]
    pub fn listeners(&self, channel: &Channel) -> usize {
        self.refcounts.read().get(channel).copied().unwrap_or(0)
    }

    /// Number of channels with at least one listener.
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.refcounts.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
