//! Market Data Streaming Types
//!
//! Core domain types for market data: klines (bars) and 24h tickers.
//! These types are codec-agnostic and represent the canonical internal
//! representation of market data.
//!
//! Exchange adapters produce [`RawKline`] and [`RawTicker`] values whose
//! fields are all optional; the validator turns them into [`Bar`] and
//! [`Ticker`] once every required field is present and sane.

mod channel;

pub use channel::{Channel, ChannelParseError, Interval, is_valid_symbol};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Validated Types
// =============================================================================

/// OHLCV bar for one interval.
///
/// Times are Unix epoch milliseconds. Prices and volumes are serialized as
/// decimal strings to preserve exchange precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    /// Bar open time.
    pub open_time: i64,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (or latest) price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Bar close time.
    pub close_time: i64,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Number of trades in the bar.
    pub trade_count: u64,
    /// Whether the bar is closed.
    pub is_final: bool,
}

impl Bar {
    /// Whether the OHLC prices are internally consistent.
    #[must_use]
    pub fn prices_are_sane(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// Latest 24h rolling statistics for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    /// Upper-case exchange symbol.
    pub symbol: String,
    /// Last traded price.
    pub last_price: Decimal,
    /// 24h price change in percent.
    pub change_percent: Decimal,
    /// 24h quote asset volume.
    pub quote_volume: Decimal,
    /// 24h base asset volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// 24h high price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_price: Option<Decimal>,
    /// 24h low price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_price: Option<Decimal>,
    /// Exchange event time (epoch milliseconds).
    pub updated_at: i64,
}

// =============================================================================
// Unvalidated Types
// =============================================================================

/// Kline as received from the exchange, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawKline {
    /// Exchange symbol.
    pub symbol: Option<String>,
    /// Interval wire name.
    pub interval: Option<String>,
    /// Bar open time.
    pub open_time: Option<i64>,
    /// Bar close time.
    pub close_time: Option<i64>,
    /// Open price.
    pub open: Option<Decimal>,
    /// High price.
    pub high: Option<Decimal>,
    /// Low price.
    pub low: Option<Decimal>,
    /// Close price.
    pub close: Option<Decimal>,
    /// Base volume.
    pub volume: Option<Decimal>,
    /// Quote volume.
    pub quote_volume: Option<Decimal>,
    /// Trade count.
    pub trade_count: Option<u64>,
    /// Closed flag.
    pub is_final: Option<bool>,
}

impl RawKline {
    /// Wrap an already-complete bar, e.g. one rebuilt from a REST row.
    #[must_use]
    pub fn from_bar(symbol: &str, interval: Interval, bar: &Bar) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            interval: Some(interval.as_str().to_string()),
            open_time: Some(bar.open_time),
            close_time: Some(bar.close_time),
            open: Some(bar.open),
            high: Some(bar.high),
            low: Some(bar.low),
            close: Some(bar.close),
            volume: Some(bar.volume),
            quote_volume: Some(bar.quote_volume),
            trade_count: Some(bar.trade_count),
            is_final: Some(bar.is_final),
        }
    }
}

/// Ticker as received from the exchange, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTicker {
    /// Exchange symbol.
    pub symbol: Option<String>,
    /// Last price.
    pub last_price: Option<Decimal>,
    /// Change percent.
    pub change_percent: Option<Decimal>,
    /// Quote volume.
    pub quote_volume: Option<Decimal>,
    /// Base volume.
    pub volume: Option<Decimal>,
    /// High price.
    pub high_price: Option<Decimal>,
    /// Low price.
    pub low_price: Option<Decimal>,
    /// Event time.
    pub event_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn bar(open: &str, high: &str, low: &str, close: &str) -> Bar {
        Bar {
            open_time: 0,
            open: Decimal::from_str(open).unwrap(),
            high: Decimal::from_str(high).unwrap(),
            low: Decimal::from_str(low).unwrap(),
            close: Decimal::from_str(close).unwrap(),
            volume: Decimal::ONE,
            close_time: 59_999,
            quote_volume: Decimal::ONE,
            trade_count: 1,
            is_final: true,
        }
    }

    #[test]
    fn sane_prices() {
        assert!(bar("10", "12", "9", "11").prices_are_sane());
        assert!(bar("10", "10", "10", "10").prices_are_sane());
    }

    #[test]
    fn insane_prices() {
        assert!(!bar("10", "9", "8", "9").prices_are_sane());
        assert!(!bar("10", "12", "11", "11.5").prices_are_sane());
        assert!(!bar("10", "12", "9", "13").prices_are_sane());
    }

    #[test]
    fn bar_serializes_camel_case_with_string_decimals() {
        let json = serde_json::to_value(bar("10", "12", "9", "11")).unwrap();
        assert_eq!(json["openTime"], 0);
        assert_eq!(json["high"], "12");
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["tradeCount"], 1);
        assert!(json.get("quoteVolume").is_some());
    }

    #[test]
    fn ticker_omits_missing_extras() {
        let ticker = Ticker {
            symbol: "BTCUSDT".to_string(),
            last_price: Decimal::from(100),
            change_percent: Decimal::from(2),
            quote_volume: Decimal::from(1000),
            volume: None,
            high_price: None,
            low_price: None,
            updated_at: 1,
        };
        let json = serde_json::to_value(&ticker).unwrap();
        assert_eq!(json["lastPrice"], "100");
        assert!(json.get("highPrice").is_none());
    }
}
