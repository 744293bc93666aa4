//! Periodic Maintenance
//!
//! One task drives every timer the hub needs:
//!
//! | Timer   | Work                                                        |
//! |---------|-------------------------------------------------------------|
//! | ping    | Ping every active subscriber                                |
//! | sweep   | Close subscribers past the pong grace; settle recovery      |
//! | expiry  | Drop idle cache entries and fan-out slots                   |
//! | metrics | Publish gauges for cache, subscriptions and the upstream    |

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::domain::upstream::UpstreamMonitor;
use crate::infrastructure::config::SchedulerSettings;
use crate::infrastructure::metrics;
use crate::infrastructure::ws::ConnectionManager;

/// Timer-driven maintenance task.
pub struct Scheduler {
    settings: SchedulerSettings,
    channel_idle_ttl: Duration,
    connections: Arc<ConnectionManager>,
    monitor: Arc<UpstreamMonitor>,
}

impl Scheduler {
    /// Scheduler for `connections` and `monitor`.
    #[must_use]
    pub const fn new(
        settings: SchedulerSettings,
        channel_idle_ttl: Duration,
        connections: Arc<ConnectionManager>,
        monitor: Arc<UpstreamMonitor>,
    ) -> Self {
        Self {
            settings,
            channel_idle_ttl,
            connections,
            monitor,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ping = interval(self.connections.settings().ping_interval);
        let mut sweep = interval(self.settings.sweep_interval);
        let mut expiry = interval(self.settings.expiry_interval);
        let mut report = interval(self.settings.metrics_interval);
        for timer in [&mut ping, &mut sweep, &mut expiry, &mut report] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The first tick of an interval completes immediately.
        ping.tick().await;

        tracing::info!("Scheduler started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ping.tick() => {
                    self.ping_tick();
                }
                _ = sweep.tick() => {
                    self.sweep_tick();
                }
                _ = expiry.tick() => {
                    self.expiry_tick();
                }
                _ = report.tick() => self.metrics_tick(),
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Ping every active subscriber.
    pub fn ping_tick(&self) -> usize {
        let pinged = self.connections.ping_all();
        tracing::trace!(pinged, "Ping sent");
        pinged
    }

    /// Evict dead subscribers and settle upstream recovery.
    pub fn sweep_tick(&self) -> usize {
        let evicted = self.connections.evict_dead();
        if evicted > 0 {
            tracing::info!(evicted, "Evicted unresponsive subscribers");
        }
        if self.monitor.settle(self.settings.recovery_settle) {
            tracing::info!(exchange = self.monitor.exchange(), "Upstream recovery complete");
        }
        evicted
    }

    /// Expire stale cache entries and collect idle fan-out slots.
    pub fn expiry_tick(&self) -> (usize, usize) {
        let fanout = self.connections.fanout();
        let expired = fanout.cache().expire();
        let collected = fanout.collect_idle(self.channel_idle_ttl);
        if expired > 0 || collected > 0 {
            tracing::debug!(expired, collected, "Expired idle channels");
        }
        (expired, collected)
    }

    /// Publish gauges.
    pub fn metrics_tick(&self) {
        let fanout = self.connections.fanout();
        let cache = fanout.cache().stats();
        metrics::set_cache_stats(cache.channels, cache.bars, cache.hit_ratio());

        let stats = fanout.stats();
        metrics::set_subscriptions(stats.subscriptions);
        for (channel, count) in stats.per_channel {
            metrics::set_channel_subscribers(channel, count);
        }

        self.connections.refresh_metrics();
        metrics::set_upstream_state(self.monitor.state().code());
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::streaming::{Bar, Channel, Interval};
    use crate::domain::subscription::DemandTracker;
    use crate::domain::upstream::{LinkEvent, UpstreamHealth};
    use crate::infrastructure::broadcast::FanOutEngine;
    use crate::infrastructure::cache::{CacheConfig, HistoricalCache};
    use crate::infrastructure::config::ConnectionSettings;
    use crate::infrastructure::ws::CloseReason;

    fn scheduler(ttl: Duration) -> (Scheduler, Arc<ConnectionManager>, Arc<UpstreamMonitor>) {
        let fanout = Arc::new(FanOutEngine::new(Arc::new(HistoricalCache::new(CacheConfig {
            max_retained: 10,
            ttl,
        }))));
        let connections = Arc::new(ConnectionManager::new(
            ConnectionSettings::default(),
            fanout,
            DemandTracker::default(),
        ));
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let settings = SchedulerSettings {
            recovery_settle: Duration::ZERO,
            ..SchedulerSettings::default()
        };
        let scheduler = Scheduler::new(settings, ttl, Arc::clone(&connections), Arc::clone(&monitor));
        (scheduler, connections, monitor)
    }

    fn bar(open_time: i64) -> Bar {
        Bar {
            open_time,
            open: Decimal::ONE,
            high: Decimal::ONE,
            low: Decimal::ONE,
            close: Decimal::ONE,
            volume: Decimal::ONE,
            close_time: open_time + 59_999,
            quote_volume: Decimal::ONE,
            trade_count: 1,
            is_final: true,
        }
    }

    #[test]
    fn ping_tick_reaches_active_connections() {
        let (scheduler, connections, _) = scheduler(Duration::from_secs(60));
        let conn = connections.open().unwrap();
        connections.activate(&conn);

        assert_eq!(scheduler.ping_tick(), 1);
        assert!(conn.ping().is_waiting_for_pong());
        let frame = conn.queue().try_pop().unwrap();
        assert!(frame.as_str().contains("\"ping\""));
    }

    #[test]
    fn expiry_tick_collects_idle_channels() {
        let (scheduler, connections, _) = scheduler(Duration::ZERO);
        let channel = Channel::kline("BTCUSDT", Interval::OneMinute);
        connections.fanout().publish_bar(&channel, bar(0));
        std::thread::sleep(Duration::from_millis(5));

        let (expired, collected) = scheduler.expiry_tick();
        assert_eq!(expired, 1);
        assert_eq!(collected, 1);
        assert!(connections.fanout().cache().is_empty(&channel));
    }

    #[test]
    fn sweep_tick_settles_recovery() {
        let (scheduler, _, monitor) = scheduler(Duration::from_secs(60));
        monitor.apply(LinkEvent::Dial).unwrap();
        monitor.apply(LinkEvent::Established).unwrap();
        monitor.apply(LinkEvent::Dropped).unwrap();
        monitor.apply(LinkEvent::Dial).unwrap();
        monitor.apply(LinkEvent::Established).unwrap();

        scheduler.sweep_tick();
        assert_eq!(monitor.health(), UpstreamHealth::Connected);
    }

    #[test]
    fn metrics_tick_runs_without_recorder() {
        let (scheduler, connections, _) = scheduler(Duration::from_secs(60));
        let conn = connections.open().unwrap();
        connections.activate(&conn);
        connections.subscribe(&conn, &["ticker.BTCUSDT".to_string()]);

        scheduler.metrics_tick();
        connections.close(conn.id(), CloseReason::ClientClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let (scheduler, _, _) = scheduler(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(120)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
