//! Ingest Pipeline
//!
//! Consumes [`ExchangeEvent`]s from the stream client in arrival order,
//! validates them, and hands accepted data to the fan-out engine. Gaps
//! revealed by a live bar are queued for REST backfill; link status
//! changes are announced to every subscriber.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BackfillRequest, BackfillScheduler};
use crate::domain::streaming::{RawKline, RawTicker};
use crate::domain::upstream::UpstreamMonitor;
use crate::domain::validation::{AcceptedBar, Validator, Verdict};
use crate::infrastructure::binance::ExchangeEvent;
use crate::infrastructure::broadcast::FanOutEngine;
use crate::infrastructure::metrics;
use crate::infrastructure::ws::{ExchangeStatus, ServerMessage};

/// Validates exchange events and publishes the accepted ones.
pub struct IngestPipeline {
    validator: Validator,
    fanout: Arc<FanOutEngine>,
    monitor: Arc<UpstreamMonitor>,
    backfill: Option<Arc<dyn BackfillScheduler>>,
}

impl IngestPipeline {
    /// Pipeline publishing into `fanout`.
    #[must_use]
    pub fn new(validator: Validator, fanout: Arc<FanOutEngine>, monitor: Arc<UpstreamMonitor>) -> Self {
        Self {
            validator,
            fanout,
            monitor,
            backfill: None,
        }
    }

    /// Queue detected gaps on `scheduler`.
    #[must_use]
    pub fn with_backfill(mut self, scheduler: Arc<dyn BackfillScheduler>) -> Self {
        self.backfill = Some(scheduler);
        self
    }

    /// Drain `rx` until it closes or `cancel` fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ExchangeEvent>, cancel: CancellationToken) {
        tracing::info!("Ingest pipeline started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        tracing::info!("Ingest pipeline stopped");
    }

    /// Process one event.
    pub fn handle_event(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Kline(raw) => self.on_kline(&raw),
            ExchangeEvent::Ticker(raw) => self.on_ticker(&raw),
            ExchangeEvent::Connected => {
                tracing::info!(exchange = self.monitor.exchange(), "Exchange connected");
                self.announce(ExchangeStatus::Connected);
            }
            ExchangeEvent::Disconnected { reason } => {
                tracing::warn!(exchange = self.monitor.exchange(), %reason, "Exchange disconnected");
                self.announce(ExchangeStatus::Disconnected);
            }
            ExchangeEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Exchange reconnect scheduled");
            }
            ExchangeEvent::Subscribed { id } => {
                tracing::debug!(request_id = id, "Stream request acknowledged");
            }
            ExchangeEvent::Error(message) => {
                tracing::warn!(%message, "Exchange reported an error");
                self.monitor.record_error(message);
            }
        }
    }

    fn on_kline(&mut self, raw: &RawKline) {
        match self.validator.check_kline(raw) {
            Ok(Verdict::Accepted(accepted)) => self.publish(accepted),
            Ok(Verdict::Stale { channel, open_time }) => {
                tracing::trace!(%channel, open_time, "Dropping stale kline");
                metrics::record_bar_stale();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Rejected kline");
                metrics::record_bar_rejected(e.reason());
            }
        }
    }

    fn publish(&self, accepted: AcceptedBar) {
        let AcceptedBar {
            channel,
            bar,
            gap,
            anomaly,
        } = accepted;

        if let Some(anomaly) = anomaly {
            tracing::warn!(
                %channel,
                open_time = bar.open_time,
                previous_close = %anomaly.previous_close,
                close = %anomaly.close,
                change = %anomaly.change,
                "Price anomaly"
            );
        }

        // The revealing bar must be cached before its backfill is queued.
        self.fanout.publish_bar(&channel, bar);
        metrics::record_bar_accepted();

        if let Some(gap) = gap {
            metrics::record_gap();
            tracing::warn!(
                channel = %gap.channel,
                missing = gap.missing_count,
                from = gap.from_open_time,
                until = gap.until_open_time,
                "Gap detected"
            );
            if let (Some(scheduler), Some(interval)) = (&self.backfill, gap.channel.interval()) {
                let request = BackfillRequest::gap(
                    gap.channel,
                    interval,
                    gap.from_open_time,
                    gap.until_open_time,
                );
                if !scheduler.schedule(request) {
                    tracing::warn!(%channel, "Gap backfill not queued");
                }
            }
        }
    }

    fn on_ticker(&mut self, raw: &RawTicker) {
        match self.validator.check_ticker(raw) {
            Ok(Some(ticker)) => {
                self.fanout.publish_ticker(ticker);
                metrics::record_ticker_accepted();
            }
            Ok(None) => metrics::record_bar_stale(),
            Err(e) => {
                tracing::debug!(error = %e, "Rejected ticker");
                metrics::record_bar_rejected(e.reason());
            }
        }
    }

    fn announce(&self, status: ExchangeStatus) {
        let message = ServerMessage::exchange_status(self.monitor.exchange(), status);
        let delivery = self.fanout.broadcast(&message);
        tracing::debug!(delivered = delivery.delivered, ?status, "Exchange status broadcast");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{BackfillKind, MockBackfillScheduler};
    use crate::domain::streaming::{Bar, Channel, Interval};
    use crate::domain::validation::DEFAULT_ANOMALY_THRESHOLD;
    use crate::infrastructure::cache::{CacheConfig, HistoricalCache};
    use crate::infrastructure::ws::OutboundQueue;

    const MINUTE: i64 = 60_000;

    fn fanout() -> Arc<FanOutEngine> {
        Arc::new(FanOutEngine::new(Arc::new(HistoricalCache::new(CacheConfig {
            max_retained: 100,
            ttl: Duration::from_secs(3_600),
        }))))
    }

    fn pipeline(fanout: &Arc<FanOutEngine>) -> IngestPipeline {
        IngestPipeline::new(
            Validator::new(DEFAULT_ANOMALY_THRESHOLD),
            Arc::clone(fanout),
            Arc::new(UpstreamMonitor::new("binance")),
        )
    }

    fn kline(open_time: i64, close: i64, is_final: bool) -> ExchangeEvent {
        let price = Decimal::from(close);
        let bar = Bar {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
            close_time: open_time + MINUTE - 1,
            quote_volume: price,
            trade_count: 1,
            is_final,
        };
        ExchangeEvent::Kline(RawKline::from_bar("BTCUSDT", Interval::OneMinute, &bar))
    }

    fn channel() -> Channel {
        Channel::kline("BTCUSDT", Interval::OneMinute)
    }

    fn drain(queue: &OutboundQueue) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|frame| serde_json::from_str(frame.as_str()).unwrap())
            .collect()
    }

    #[test]
    fn accepted_bars_reach_cache_and_subscribers() {
        let fanout = fanout();
        let queue = Arc::new(OutboundQueue::new(16));
        fanout.register(1, Arc::clone(&queue));
        fanout.subscribe(&channel(), 1, &queue);
        let _ = drain(&queue);

        let mut pipeline = pipeline(&fanout);
        pipeline.handle_event(kline(0, 100, true));
        pipeline.handle_event(kline(MINUTE, 101, false));

        assert_eq!(fanout.cache().len(&channel()), 2);
        let frames = drain(&queue);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["type"], "kline");
        assert_eq!(frames[1]["data"]["openTime"], MINUTE);
    }

    #[test]
    fn stale_and_invalid_klines_are_dropped() {
        let fanout = fanout();
        let mut pipeline = pipeline(&fanout);

        pipeline.handle_event(kline(MINUTE, 100, true));
        pipeline.handle_event(kline(0, 100, true));
        pipeline.handle_event(ExchangeEvent::Kline(RawKline::default()));

        assert_eq!(fanout.cache().range(&channel(), 10).len(), 1);
    }

    #[test]
    fn gap_schedules_backfill() {
        let fanout = fanout();
        let mut scheduler = MockBackfillScheduler::new();
        scheduler
            .expect_schedule()
            .withf(|request| {
                request.kind == BackfillKind::Gap
                    && request.start_time == MINUTE
                    && request.end_time == 4 * MINUTE - 1
                    && request.limit == 3
            })
            .times(1)
            .return_const(true);

        let mut pipeline = pipeline(&fanout).with_backfill(Arc::new(scheduler));
        pipeline.handle_event(kline(0, 100, true));
        pipeline.handle_event(kline(4 * MINUTE, 100, true));

        assert_eq!(fanout.cache().len(&channel()), 2);
    }

    #[test]
    fn pipeline_leaves_message_counting_to_the_stream_client() {
        let fanout = fanout();
        let monitor = Arc::new(UpstreamMonitor::new("binance"));
        let mut pipeline = IngestPipeline::new(
            Validator::new(DEFAULT_ANOMALY_THRESHOLD),
            Arc::clone(&fanout),
            Arc::clone(&monitor),
        );

        pipeline.handle_event(kline(0, 100, true));
        pipeline.handle_event(kline(MINUTE, 100, true));

        assert_eq!(fanout.cache().len(&channel()), 2);
        assert_eq!(monitor.snapshot().messages_received, 0);
    }

    #[test]
    fn tickers_are_published() {
        let fanout = fanout();
        let mut pipeline = pipeline(&fanout);

        pipeline.handle_event(ExchangeEvent::Ticker(RawTicker {
            symbol: Some("BTCUSDT".into()),
            last_price: Some(Decimal::from(50_000)),
            change_percent: Some(Decimal::ONE),
            quote_volume: Some(Decimal::from(1_000)),
            event_time: Some(1),
            ..RawTicker::default()
        }));

        let ticker = fanout.cache().ticker("BTCUSDT").unwrap();
        assert_eq!(ticker.last_price, Decimal::from(50_000));
    }

    #[test]
    fn link_changes_are_broadcast() {
        let fanout = fanout();
        let queue = Arc::new(OutboundQueue::new(16));
        fanout.register(7, Arc::clone(&queue));

        let mut pipeline = pipeline(&fanout);
        pipeline.handle_event(ExchangeEvent::Disconnected {
            reason: "reset".into(),
        });
        pipeline.handle_event(ExchangeEvent::Connected);

        let frames = drain(&queue);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "exchange_status");
        assert_eq!(frames[0]["status"], "disconnected");
        assert_eq!(frames[1]["status"], "connected");
        assert_eq!(frames[1]["exchange"], "binance");
    }

    #[tokio::test]
    async fn run_stops_when_sender_dropped() {
        let fanout = fanout();
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(pipeline(&fanout).run(rx, CancellationToken::new()));

        tx.send(kline(0, 100, true)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(fanout.cache().len(&channel()), 1);
    }
}
