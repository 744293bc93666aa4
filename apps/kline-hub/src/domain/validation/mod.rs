//! Bar and Ticker Validation
//!
//! Every kline coming from the exchange passes through [`Validator`] before
//! it reaches the cache or any subscriber. Rules are applied in order:
//!
//! 1. Required fields present, else [`ValidationError::MissingField`].
//! 2. Price sanity (`high >= low`, `high >= open/close`, `low <= open/close`).
//! 3. Sequencing: a bar must open after the channel's last accepted bar, or
//!    at the same open time while that bar is still in progress. Anything
//!    else is stale and dropped silently.
//! 4. Gap detection: an open-time jump of more than one interval yields a
//!    [`GapDetected`] alongside the accepted bar.
//! 5. Anomaly flag: a close that moved more than the configured fraction
//!    from the previous bar's close is reported but still accepted.
//!
//! The validator is owned by the single ingest task, so its per-channel
//! cursors need no locking.

use std::collections::HashMap;

use rust_decimal::Decimal;

use super::streaming::{Bar, Channel, Interval, RawKline, RawTicker, Ticker, is_valid_symbol};

/// Default anomaly threshold (20% close-to-close move).
pub const DEFAULT_ANOMALY_THRESHOLD: Decimal = Decimal::from_parts(20, 0, 0, false, 2);

// =============================================================================
// Errors and Events
// =============================================================================

/// Reasons a message is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Symbol is not a valid exchange symbol.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Interval is not supported.
    #[error("unsupported interval: {0}")]
    UnsupportedInterval(String),

    /// OHLC prices contradict each other.
    #[error("price sanity violated for open_time {open_time}")]
    PriceSanity {
        /// Open time of the offending bar.
        open_time: i64,
    },
}

impl ValidationError {
    /// Short label used for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidSymbol(_) => "invalid_symbol",
            Self::UnsupportedInterval(_) => "unsupported_interval",
            Self::PriceSanity { .. } => "price_sanity",
        }
    }
}

/// Missing bars between the last accepted bar and a newly accepted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapDetected {
    /// Affected kline channel.
    pub channel: Channel,
    /// Interval steps spanned by the jump (`(new - last) / interval`).
    pub missing_count: u64,
    /// Open time of the first bar to backfill.
    pub from_open_time: i64,
    /// Exclusive upper bound: the open time of the bar that revealed the gap.
    pub until_open_time: i64,
}

/// Close-to-close move above the anomaly threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceAnomaly {
    /// Close of the previous bar.
    pub previous_close: Decimal,
    /// Close of the accepted bar.
    pub close: Decimal,
    /// Absolute relative change.
    pub change: Decimal,
}

/// Kline that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBar {
    /// Channel the bar belongs to.
    pub channel: Channel,
    /// Validated bar.
    pub bar: Bar,
    /// Gap revealed by this bar, if any.
    pub gap: Option<GapDetected>,
    /// Anomaly flag, if any.
    pub anomaly: Option<PriceAnomaly>,
}

/// Outcome of validating a well-formed kline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Bar accepted; forward it to cache and subscribers.
    Accepted(AcceptedBar),
    /// Bar is out of order or a redelivery of a closed bar; drop it.
    Stale {
        /// Channel of the dropped bar.
        channel: Channel,
        /// Open time of the dropped bar.
        open_time: i64,
    },
}

// =============================================================================
// Validator
// =============================================================================

/// Sequencing state of one kline channel.
#[derive(Debug, Clone)]
struct ChannelCursor {
    last_open_time: i64,
    last_final: bool,
    current_close: Decimal,
    previous_close: Option<Decimal>,
}

/// Stateful kline and ticker validator.
#[derive(Debug)]
pub struct Validator {
    anomaly_threshold: Decimal,
    cursors: HashMap<Channel, ChannelCursor>,
    ticker_times: HashMap<String, i64>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_ANOMALY_THRESHOLD)
    }
}

impl Validator {
    /// Create a validator with the given anomaly threshold (fraction, e.g. `0.20`).
    #[must_use]
    pub fn new(anomaly_threshold: Decimal) -> Self {
        Self {
            anomaly_threshold,
            cursors: HashMap::new(),
            ticker_times: HashMap::new(),
        }
    }

    /// Check the structural rules (presence and price sanity) only.
    ///
    /// Used for bars that bypass sequencing, such as REST backfill rows.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn check_shape(raw: &RawKline) -> Result<(Channel, Bar), ValidationError> {
        let symbol = raw
            .symbol
            .as_deref()
            .ok_or(ValidationError::MissingField("symbol"))?;
        let interval_name = raw
            .interval
            .as_deref()
            .ok_or(ValidationError::MissingField("interval"))?;

        let bar = Bar {
            open_time: raw.open_time.ok_or(ValidationError::MissingField("openTime"))?,
            open: raw.open.ok_or(ValidationError::MissingField("open"))?,
            high: raw.high.ok_or(ValidationError::MissingField("high"))?,
            low: raw.low.ok_or(ValidationError::MissingField("low"))?,
            close: raw.close.ok_or(ValidationError::MissingField("close"))?,
            volume: raw.volume.ok_or(ValidationError::MissingField("volume"))?,
            close_time: raw
                .close_time
                .ok_or(ValidationError::MissingField("closeTime"))?,
            quote_volume: raw
                .quote_volume
                .ok_or(ValidationError::MissingField("quoteVolume"))?,
            trade_count: raw
                .trade_count
                .ok_or(ValidationError::MissingField("tradeCount"))?,
            is_final: raw.is_final.ok_or(ValidationError::MissingField("isFinal"))?,
        };

        if !is_valid_symbol(symbol) {
            return Err(ValidationError::InvalidSymbol(symbol.to_string()));
        }
        let interval: Interval = interval_name
            .parse()
            .map_err(|_| ValidationError::UnsupportedInterval(interval_name.to_string()))?;

        if !bar.prices_are_sane() {
            return Err(ValidationError::PriceSanity {
                open_time: bar.open_time,
            });
        }

        Ok((Channel::kline(symbol, interval), bar))
    }

    /// Validate a live kline and advance the channel cursor when accepted.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when a structural rule fails; the
    /// cursor is left untouched in that case.
    pub fn check_kline(&mut self, raw: &RawKline) -> Result<Verdict, ValidationError> {
        let (channel, bar) = Self::check_shape(raw)?;
        let step = channel.interval().map_or(1, Interval::duration_ms);

        let Some(cursor) = self.cursors.get_mut(&channel) else {
            self.cursors.insert(
                channel.clone(),
                ChannelCursor {
                    last_open_time: bar.open_time,
                    last_final: bar.is_final,
                    current_close: bar.close,
                    previous_close: None,
                },
            );
            return Ok(Verdict::Accepted(AcceptedBar {
                channel,
                bar,
                gap: None,
                anomaly: None,
            }));
        };

        let mut gap = None;
        if bar.open_time > cursor.last_open_time {
            let delta = bar.open_time - cursor.last_open_time;
            if delta > step {
                gap = Some(GapDetected {
                    channel: channel.clone(),
                    missing_count: u64::try_from(delta / step).unwrap_or(u64::MAX),
                    from_open_time: cursor.last_open_time + step,
                    until_open_time: bar.open_time,
                });
            }
            cursor.previous_close = Some(cursor.current_close);
        } else if bar.open_time < cursor.last_open_time || cursor.last_final {
            return Ok(Verdict::Stale {
                channel,
                open_time: bar.open_time,
            });
        }

        let anomaly = cursor
            .previous_close
            .and_then(|previous| detect_anomaly(previous, bar.close, self.anomaly_threshold));

        cursor.last_open_time = bar.open_time;
        cursor.last_final = bar.is_final;
        cursor.current_close = bar.close;

        Ok(Verdict::Accepted(AcceptedBar {
            channel,
            bar,
            gap,
            anomaly,
        }))
    }

    /// Validate a ticker update.
    ///
    /// Returns `Ok(None)` for an update older than the last accepted one.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when a required field is missing.
    pub fn check_ticker(&mut self, raw: &RawTicker) -> Result<Option<Ticker>, ValidationError> {
        let symbol = raw
            .symbol
            .as_deref()
            .ok_or(ValidationError::MissingField("symbol"))?;
        let ticker = Ticker {
            symbol: symbol.to_ascii_uppercase(),
            last_price: raw
                .last_price
                .ok_or(ValidationError::MissingField("lastPrice"))?,
            change_percent: raw
                .change_percent
                .ok_or(ValidationError::MissingField("changePercent"))?,
            quote_volume: raw
                .quote_volume
                .ok_or(ValidationError::MissingField("quoteVolume"))?,
            volume: raw.volume,
            high_price: raw.high_price,
            low_price: raw.low_price,
            updated_at: raw
                .event_time
                .ok_or(ValidationError::MissingField("updatedAt"))?,
        };

        if !is_valid_symbol(&ticker.symbol) {
            return Err(ValidationError::InvalidSymbol(ticker.symbol));
        }

        let last = self.ticker_times.entry(ticker.symbol.clone()).or_insert(0);
        if ticker.updated_at < *last {
            return Ok(None);
        }
        *last = ticker.updated_at;

        Ok(Some(ticker))
    }

    /// Last accepted open time for `channel`.
    #[must_use]
    pub fn last_open_time(&self, channel: &Channel) -> Option<i64> {
        self.cursors.get(channel).map(|cursor| cursor.last_open_time)
    }
}

fn detect_anomaly(previous: Decimal, close: Decimal, threshold: Decimal) -> Option<PriceAnomaly> {
    if previous.is_zero() {
        return None;
    }
    // No flag when the ratio overflows.
    let change = close.checked_sub(previous)?.checked_div(previous)?.abs();
    (change > threshold).then_some(PriceAnomaly {
        previous_close: previous,
        close,
        change,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn raw(open_time: i64, close: i64, is_final: bool) -> RawKline {
        RawKline {
            symbol: Some("BTCUSDT".to_string()),
            interval: Some("1m".to_string()),
            open_time: Some(open_time),
            close_time: Some(open_time + MINUTE - 1),
            open: Some(Decimal::from(close)),
            high: Some(Decimal::from(close + 1)),
            low: Some(Decimal::from(close - 1)),
            close: Some(Decimal::from(close)),
            volume: Some(Decimal::ONE),
            quote_volume: Some(Decimal::from(close)),
            trade_count: Some(3),
            is_final: Some(is_final),
        }
    }

    fn accepted(verdict: Verdict) -> AcceptedBar {
        match verdict {
            Verdict::Accepted(accepted) => accepted,
            Verdict::Stale { .. } => panic!("expected accepted bar"),
        }
    }

    #[test]
    fn missing_field_is_rejected() {
        let mut validator = Validator::default();
        let mut bar = raw(0, 100, true);
        bar.high = None;

        assert_eq!(
            validator.check_kline(&bar),
            Err(ValidationError::MissingField("high"))
        );
    }

    #[test]
    fn price_sanity_is_enforced() {
        let mut validator = Validator::default();
        let mut bar = raw(0, 100, true);
        bar.low = Some(Decimal::from(150));

        let err = validator.check_kline(&bar).unwrap_err();
        assert_eq!(err, ValidationError::PriceSanity { open_time: 0 });
        assert_eq!(err.reason(), "price_sanity");
    }

    #[test]
    fn rejected_bar_does_not_move_cursor() {
        let mut validator = Validator::default();
        let mut bar = raw(MINUTE, 100, true);
        bar.close = None;
        let _ = validator.check_kline(&bar);

        let channel = Channel::kline("BTCUSDT", Interval::OneMinute);
        assert_eq!(validator.last_open_time(&channel), None);
    }

    #[test]
    fn unsupported_interval_is_rejected() {
        let mut validator = Validator::default();
        let mut bar = raw(0, 100, true);
        bar.interval = Some("1M".to_string());

        assert!(matches!(
            validator.check_kline(&bar),
            Err(ValidationError::UnsupportedInterval(_))
        ));
    }

    #[test]
    fn in_progress_updates_are_accepted_until_final() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(0, 100, false)).unwrap());
        accepted(validator.check_kline(&raw(0, 101, false)).unwrap());
        accepted(validator.check_kline(&raw(0, 102, true)).unwrap());

        assert!(matches!(
            validator.check_kline(&raw(0, 102, true)).unwrap(),
            Verdict::Stale { open_time: 0, .. }
        ));
    }

    #[test]
    fn out_of_order_bar_is_stale() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(2 * MINUTE, 100, true)).unwrap());

        assert!(matches!(
            validator.check_kline(&raw(MINUTE, 100, true)).unwrap(),
            Verdict::Stale { .. }
        ));
    }

    #[test]
    fn contiguous_bars_have_no_gap() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(0, 100, true)).unwrap());
        let next = accepted(validator.check_kline(&raw(MINUTE, 100, true)).unwrap());
        assert!(next.gap.is_none());
    }

    #[test]
    fn gap_is_detected_and_bar_still_accepted() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(100 * 1_000, 100, true)).unwrap());
        accepted(validator.check_kline(&raw(160 * 1_000, 100, true)).unwrap());

        let result = accepted(validator.check_kline(&raw(280 * 1_000, 100, true)).unwrap());
        let gap = result.gap.expect("gap expected");

        assert_eq!(gap.missing_count, 2);
        assert_eq!(gap.from_open_time, 220 * 1_000);
        assert_eq!(gap.until_open_time, 280 * 1_000);
        assert_eq!(result.bar.open_time, 280 * 1_000);
        assert_eq!(
            validator.last_open_time(&result.channel),
            Some(280 * 1_000)
        );
    }

    #[test]
    fn anomaly_is_flagged_but_accepted() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(0, 100, true)).unwrap());
        let jumped = accepted(validator.check_kline(&raw(MINUTE, 125, true)).unwrap());

        let anomaly = jumped.anomaly.expect("anomaly expected");
        assert_eq!(anomaly.previous_close, Decimal::from(100));
        assert_eq!(anomaly.change, Decimal::new(25, 2));
    }

    #[test]
    fn in_progress_update_compares_with_prior_bar() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(0, 100, true)).unwrap());
        accepted(validator.check_kline(&raw(MINUTE, 110, false)).unwrap());
        let update = accepted(validator.check_kline(&raw(MINUTE, 119, false)).unwrap());

        assert!(update.anomaly.is_none());
    }

    #[test]
    fn extreme_prices_do_not_panic_anomaly_check() {
        let threshold = DEFAULT_ANOMALY_THRESHOLD;
        let tiny = Decimal::new(1, 28);

        assert!(detect_anomaly(tiny, Decimal::MAX, threshold).is_none());
        assert!(detect_anomaly(Decimal::MIN, Decimal::MAX, threshold).is_none());
        assert!(detect_anomaly(Decimal::MAX, Decimal::MAX, threshold).is_none());
        assert!(detect_anomaly(Decimal::ONE, Decimal::MAX, threshold).is_some());
    }

    #[test]
    fn small_move_is_not_anomalous() {
        let mut validator = Validator::default();
        accepted(validator.check_kline(&raw(0, 100, true)).unwrap());
        let next = accepted(validator.check_kline(&raw(MINUTE, 120, true)).unwrap());
        assert!(next.anomaly.is_none());
    }

    #[test]
    fn ticker_requires_fields_and_drops_older_updates() {
        let mut validator = Validator::default();
        let mut ticker = RawTicker {
            symbol: Some("btcusdt".to_string()),
            last_price: Some(Decimal::from(100)),
            change_percent: Some(Decimal::ONE),
            quote_volume: Some(Decimal::from(5)),
            event_time: Some(10),
            ..RawTicker::default()
        };

        let first = validator.check_ticker(&ticker).unwrap().unwrap();
        assert_eq!(first.symbol, "BTCUSDT");

        ticker.event_time = Some(5);
        assert_eq!(validator.check_ticker(&ticker).unwrap(), None);

        ticker.last_price = None;
        assert_eq!(
            validator.check_ticker(&ticker),
            Err(ValidationError::MissingField("lastPrice"))
        );
    }

    #[test]
    fn default_threshold_is_twenty_percent() {
        assert_eq!(DEFAULT_ANOMALY_THRESHOLD, Decimal::new(20, 2));
    }
}
