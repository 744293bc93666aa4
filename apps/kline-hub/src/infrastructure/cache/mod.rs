//! Historical Cache
//!
//! Bounded per-channel store of the most recent bars plus the latest ticker
//! per symbol.
//!
//! # Locking
//!
//! Channels live in a sharded `DashMap`; each entry carries its own
//! `RwLock`. Callers clone the entry handle and release the map shard
//! before locking the entry, so a read of one channel never waits on a
//! write to another. Expiry marks an entry retired under its lock before
//! removing it, and writers that find a retired entry start over with a
//! fresh one.
//!
//! # Backfill Merge Rule
//!
//! Backfilled bars only fill holes: an open time that is already cached is
//! never overwritten, and nothing at or after the newest cached open time
//! is inserted. A channel with no bars at all accepts the whole batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::streaming::{Bar, Channel, Ticker};
use crate::infrastructure::config::CacheSettings;

/// Cache limits.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Bars retained per channel.
    pub max_retained: usize,
    /// Time since last write after which a channel is dropped.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_settings(&CacheSettings::default())
    }
}

impl CacheConfig {
    /// Build from hub settings.
    #[must_use]
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            max_retained: settings.max_retained.max(1),
            ttl: settings.ttl,
        }
    }
}

/// Result of [`HistoricalCache::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New open time.
    Inserted,
    /// Existing open time updated in place.
    Replaced,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Channels with at least one entry.
    pub channels: usize,
    /// Bars across all channels.
    pub bars: usize,
    /// Symbols with a cached ticker.
    pub tickers: usize,
    /// Range requests that found bars.
    pub hits: u64,
    /// Range requests against an empty or unknown channel.
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of range requests that found bars (0 when none were made).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    bars: BTreeMap<i64, Bar>,
    last_write: Instant,
    retired: bool,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            bars: BTreeMap::new(),
            last_write: Instant::now(),
            retired: false,
        }
    }

    fn trim(&mut self, max_retained: usize) {
        while self.bars.len() > max_retained {
            self.bars.pop_first();
        }
    }
}

/// Per-channel bar store.
#[derive(Debug)]
pub struct HistoricalCache {
    config: CacheConfig,
    channels: DashMap<Channel, Arc<RwLock<CacheEntry>>>,
    tickers: DashMap<String, Ticker>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HistoricalCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            tickers: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Bars retained per channel.
    #[must_use]
    pub const fn max_retained(&self) -> usize {
        self.config.max_retained
    }

    fn entry(&self, channel: &Channel) -> Option<Arc<RwLock<CacheEntry>>> {
        self.channels.get(channel).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_create(&self, channel: &Channel) -> Arc<RwLock<CacheEntry>> {
        if let Some(entry) = self.entry(channel) {
            return entry;
        }
        Arc::clone(
            self.channels
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(RwLock::new(CacheEntry::new())))
                .value(),
        )
    }

    /// Insert `bar` at its open time, replacing an existing bar there, and
    /// drop the oldest bars beyond the retention limit.
    pub fn append(&self, channel: &Channel, bar: Bar) -> AppendOutcome {
        loop {
            let entry = self.entry_or_create(channel);
            let mut guard = entry.write();
            if guard.retired {
                continue;
            }
            let outcome = match guard.bars.insert(bar.open_time, bar) {
                Some(_) => AppendOutcome::Replaced,
                None => AppendOutcome::Inserted,
            };
            guard.trim(self.config.max_retained);
            guard.last_write = Instant::now();
            return outcome;
        }
    }

    /// Merge backfilled bars and return the ones actually inserted, oldest
    /// first.
    pub fn merge_backfill(&self, channel: &Channel, bars: Vec<Bar>) -> Vec<Bar> {
        if bars.is_empty() {
            return Vec::new();
        }
        loop {
            let entry = self.entry_or_create(channel);
            let mut guard = entry.write();
            if guard.retired {
                continue;
            }

            let newest = guard.bars.last_key_value().map(|(t, _)| *t);
            let mut inserted: Vec<i64> = Vec::new();
            for bar in &bars {
                let fills_hole = newest.is_none_or(|newest| bar.open_time < newest)
                    && !guard.bars.contains_key(&bar.open_time);
                if fills_hole {
                    inserted.push(bar.open_time);
                    guard.bars.insert(bar.open_time, bar.clone());
                }
            }
            if inserted.is_empty() {
                return Vec::new();
            }

            guard.trim(self.config.max_retained);
            guard.last_write = Instant::now();

            inserted.sort_unstable();
            inserted.dedup();
            return inserted
                .into_iter()
                .filter_map(|t| guard.bars.get(&t).cloned())
                .collect();
        }
    }

    /// Up to `limit` most recent bars, oldest first. Empty for a channel
    /// that was never written.
    #[must_use]
    pub fn range(&self, channel: &Channel, limit: usize) -> Vec<Bar> {
        let bars: Vec<Bar> = self.entry(channel).map_or_else(Vec::new, |entry| {
            let guard = entry.read();
            let skip = guard.bars.len().saturating_sub(limit);
            guard.bars.values().skip(skip).cloned().collect()
        });

        if bars.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        bars
    }

    /// Open time of the newest cached bar.
    #[must_use]
    pub fn latest_open_time(&self, channel: &Channel) -> Option<i64> {
        self.entry(channel)
            .and_then(|entry| entry.read().bars.last_key_value().map(|(t, _)| *t))
    }

    /// Number of cached bars for `channel`.
    #[must_use]
    pub fn len(&self, channel: &Channel) -> usize {
        self.entry(channel).map_or(0, |entry| entry.read().bars.len())
    }

    /// Whether `channel` has no cached bars.
    #[must_use]
    pub fn is_empty(&self, channel: &Channel) -> bool {
        self.len(channel) == 0
    }

    /// Drop channels not written within the TTL. Returns how many were dropped.
    pub fn expire(&self) -> usize {
        self.expire_at(Instant::now())
    }

    /// [`Self::expire`] against an explicit clock reading.
    pub fn expire_at(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let before = self.channels.len();
        self.channels.retain(|channel, entry| {
            let mut guard = entry.write();
            let stale = now.saturating_duration_since(guard.last_write) > ttl;
            if stale {
                tracing::debug!(channel = %channel, bars = guard.bars.len(), "Expiring cache channel");
                guard.retired = true;
            }
            !stale
        });
        before.saturating_sub(self.channels.len())
    }

    /// Store `ticker` unless a newer one is already cached.
    pub fn upsert_ticker(&self, ticker: Ticker) -> bool {
        let mut slot = self
            .tickers
            .entry(ticker.symbol.clone())
            .or_insert_with(|| ticker.clone());
        if slot.updated_at > ticker.updated_at {
            return false;
        }
        *slot = ticker;
        true
    }

    /// Latest ticker for `symbol`.
    #[must_use]
    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.tickers
            .get(&symbol.to_ascii_uppercase())
            .map(|t| t.value().clone())
    }

    /// All cached tickers, ordered by symbol.
    #[must_use]
    pub fn tickers(&self) -> Vec<Ticker> {
        let mut tickers: Vec<Ticker> = self.tickers.iter().map(|t| t.value().clone()).collect();
        tickers.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        tickers
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries: Vec<Arc<RwLock<CacheEntry>>> =
            self.channels.iter().map(|e| Arc::clone(e.value())).collect();
        let bars = entries.iter().map(|entry| entry.read().bars.len()).sum();

        CacheStats {
            channels: entries.len(),
            bars,
            tickers: self.tickers.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::streaming::Interval;

    fn bar(open_time: i64, close: i64) -> Bar {
        let close = Decimal::from(close);
        Bar {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ONE,
            close_time: open_time + 59_999,
            quote_volume: close,
            trade_count: 1,
            is_final: true,
        }
    }

    fn cache(max_retained: usize) -> HistoricalCache {
        HistoricalCache::new(CacheConfig {
            max_retained,
            ttl: Duration::from_secs(90_000),
        })
    }

    fn channel() -> Channel {
        Channel::kline("BTCUSDT", Interval::OneMinute)
    }

    fn open_times(bars: &[Bar]) -> Vec<i64> {
        bars.iter().map(|b| b.open_time).collect()
    }

    #[test]
    fn append_keeps_order_and_trims() {
        let cache = cache(3);
        for t in [3, 1, 4, 2, 5] {
            cache.append(&channel(), bar(t, 10));
        }
        assert_eq!(open_times(&cache.range(&channel(), 10)), vec![3, 4, 5]);
    }

    #[test]
    fn append_same_open_time_replaces() {
        let cache = cache(10);
        assert_eq!(cache.append(&channel(), bar(60, 10)), AppendOutcome::Inserted);
        assert_eq!(cache.append(&channel(), bar(60, 11)), AppendOutcome::Replaced);

        let bars = cache.range(&channel(), 10);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, Decimal::from(11));
    }

    #[test]
    fn range_returns_most_recent() {
        let cache = cache(10);
        for t in 1..=6 {
            cache.append(&channel(), bar(t, 10));
        }
        assert_eq!(open_times(&cache.range(&channel(), 2)), vec![5, 6]);
        assert_eq!(open_times(&cache.range(&channel(), 0)), Vec::<i64>::new());
    }

    #[test]
    fn unknown_channel_is_empty_not_error() {
        let cache = cache(10);
        assert!(cache.range(&channel(), 100).is_empty());
        assert!(cache.is_empty(&channel()));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn backfill_fills_holes_only() {
        let cache = cache(10);
        cache.append(&channel(), bar(100, 1));
        cache.append(&channel(), bar(400, 4));

        let inserted = cache.merge_backfill(
            &channel(),
            vec![bar(100, 99), bar(200, 2), bar(300, 3), bar(400, 99), bar(500, 99)],
        );

        assert_eq!(open_times(&inserted), vec![200, 300]);
        let bars = cache.range(&channel(), 10);
        assert_eq!(open_times(&bars), vec![100, 200, 300, 400]);
        assert_eq!(bars[0].close, Decimal::from(1));
        assert_eq!(bars[3].close, Decimal::from(4));
    }

    #[test]
    fn backfill_into_empty_channel_takes_everything() {
        let cache = cache(2);
        let inserted = cache.merge_backfill(&channel(), vec![bar(1, 1), bar(2, 2), bar(3, 3)]);
        assert_eq!(open_times(&inserted), vec![2, 3]);
        assert_eq!(cache.len(&channel()), 2);
    }

    #[test]
    fn expire_drops_stale_channels() {
        let cache = cache(10);
        let other = Channel::kline("ETHUSDT", Interval::OneMinute);
        cache.append(&channel(), bar(1, 1));
        cache.append(&other, bar(1, 1));

        assert_eq!(cache.expire_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(90_001);
        assert_eq!(cache.expire_at(later), 2);
        assert!(cache.range(&channel(), 10).is_empty());

        cache.append(&channel(), bar(2, 2));
        assert_eq!(cache.len(&channel()), 1);
    }

    #[test]
    fn ticker_keeps_newest() {
        let cache = cache(10);
        let ticker = |updated_at, price| Ticker {
            symbol: "BTCUSDT".to_string(),
            last_price: Decimal::from(price),
            change_percent: Decimal::ZERO,
            quote_volume: Decimal::ZERO,
            volume: None,
            high_price: None,
            low_price: None,
            updated_at,
        };

        assert!(cache.upsert_ticker(ticker(10, 100)));
        assert!(!cache.upsert_ticker(ticker(5, 90)));
        assert!(cache.upsert_ticker(ticker(11, 101)));
        assert_eq!(cache.ticker("btcusdt").unwrap().last_price, Decimal::from(101));
        assert_eq!(cache.tickers().len(), 1);
    }

    #[test]
    fn stats_count_hits_and_bars() {
        let cache = cache(10);
        cache.append(&channel(), bar(1, 1));
        cache.append(&channel(), bar(2, 1));
        let _ = cache.range(&channel(), 5);
        let _ = cache.range(&Channel::kline("ETHUSDT", Interval::OneHour), 5);

        let stats = cache.stats();
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.bars, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn range_is_strictly_increasing_and_bounded(
            times in prop::collection::vec(0i64..200, 0..400),
            max_retained in 1usize..50,
        ) {
            let cache = cache(max_retained);
            for t in &times {
                cache.append(&channel(), bar(*t, 1));
            }

            let got = open_times(&cache.range(&channel(), usize::MAX));
            prop_assert!(got.len() <= max_retained);
            prop_assert!(got.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn in_order_appends_retain_newest(
            count in 0usize..300,
            max_retained in 1usize..50,
        ) {
            let cache = cache(max_retained);
            for t in 0..count {
                cache.append(&channel(), bar(i64::try_from(t).unwrap(), 1));
            }
            let expected: Vec<i64> = (0..count)
                .skip(count.saturating_sub(max_retained))
                .map(|t| i64::try_from(t).unwrap())
                .collect();
            prop_assert_eq!(open_times(&cache.range(&channel(), usize::MAX)), expected);
        }

        #[test]
        fn redelivery_is_idempotent(t in 0i64..1_000, first in 1i64..100, second in 1i64..100) {
            let cache = cache(10);
            cache.append(&channel(), bar(t, first));
            cache.append(&channel(), bar(t, second));
            let bars = cache.range(&channel(), 10);
            prop_assert_eq!(bars.len(), 1);
            prop_assert_eq!(bars[0].close, Decimal::from(second));
        }
    }
}
