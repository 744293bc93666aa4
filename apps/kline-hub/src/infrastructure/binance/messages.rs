//! Binance Wire Types
//!
//! Serde types for the spot market streams and the REST klines endpoint.
//! Every payload field is optional so that an incomplete event still
//! decodes and is rejected by the validator with a precise reason instead
//! of surfacing as an opaque codec error.
//!
//! # Stream Names
//!
//! - Kline: `<symbol>@kline_<interval>` (e.g. `btcusdt@kline_1m`)
//! - Ticker: `<symbol>@ticker`
//!
//! # References
//!
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)
//! - [Kline data](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints)

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Channel, Interval, RawKline, RawTicker};

// =============================================================================
// Stream Events
// =============================================================================

/// `kline` stream event.
///
/// # Wire Format (JSON)
/// ```json
/// {"e":"kline","E":1672515782136,"s":"BTCUSDT","k":{"t":1672515780000,
///  "T":1672515839999,"s":"BTCUSDT","i":"1m","o":"0.0010","c":"0.0020",
///  "h":"0.0025","l":"0.0015","v":"1000","n":100,"x":false,"q":"1.0000"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlineEvent {
    /// Event time.
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    /// Symbol.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Kline payload.
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Payload of a [`KlineEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KlinePayload {
    /// Open time.
    #[serde(rename = "t", default)]
    pub open_time: Option<i64>,
    /// Close time.
    #[serde(rename = "T", default)]
    pub close_time: Option<i64>,
    /// Symbol.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Interval.
    #[serde(rename = "i", default)]
    pub interval: Option<String>,
    /// Open price.
    #[serde(rename = "o", default)]
    pub open: Option<Decimal>,
    /// Close price.
    #[serde(rename = "c", default)]
    pub close: Option<Decimal>,
    /// High price.
    #[serde(rename = "h", default)]
    pub high: Option<Decimal>,
    /// Low price.
    #[serde(rename = "l", default)]
    pub low: Option<Decimal>,
    /// Base asset volume.
    #[serde(rename = "v", default)]
    pub volume: Option<Decimal>,
    /// Number of trades.
    #[serde(rename = "n", default)]
    pub trade_count: Option<u64>,
    /// Whether the kline is closed.
    #[serde(rename = "x", default)]
    pub is_final: Option<bool>,
    /// Quote asset volume.
    #[serde(rename = "q", default)]
    pub quote_volume: Option<Decimal>,
}

impl KlineEvent {
    /// Convert into the exchange-neutral unvalidated form.
    #[must_use]
    pub fn into_raw(self) -> RawKline {
        let k = self.kline;
        RawKline {
            symbol: k.symbol.or(self.symbol),
            interval: k.interval,
            open_time: k.open_time,
            close_time: k.close_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            quote_volume: k.quote_volume,
            trade_count: k.trade_count,
            is_final: k.is_final,
        }
    }
}

/// `24hrTicker` stream event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerEvent {
    /// Event time.
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    /// Symbol.
    #[serde(rename = "s", default)]
    pub symbol: Option<String>,
    /// Price change percent.
    #[serde(rename = "P", default)]
    pub change_percent: Option<Decimal>,
    /// Last price.
    #[serde(rename = "c", default)]
    pub last_price: Option<Decimal>,
    /// High price.
    #[serde(rename = "h", default)]
    pub high_price: Option<Decimal>,
    /// Low price.
    #[serde(rename = "l", default)]
    pub low_price: Option<Decimal>,
    /// Total traded base asset volume.
    #[serde(rename = "v", default)]
    pub volume: Option<Decimal>,
    /// Total traded quote asset volume.
    #[serde(rename = "q", default)]
    pub quote_volume: Option<Decimal>,
}

impl TickerEvent {
    /// Convert into the exchange-neutral unvalidated form.
    #[must_use]
    pub fn into_raw(self) -> RawTicker {
        RawTicker {
            symbol: self.symbol,
            last_price: self.last_price,
            change_percent: self.change_percent,
            quote_volume: self.quote_volume,
            volume: self.volume,
            high_price: self.high_price,
            low_price: self.low_price,
            event_time: self.event_time,
        }
    }
}

/// Error frame returned for a bad control request.
///
/// # Wire Format (JSON)
/// ```json
/// {"code": 2, "msg": "Invalid request: unknown variable", "id": 7}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorFrame {
    /// Error code.
    pub code: i64,
    /// Description.
    pub msg: String,
    /// Request id, when the error refers to one.
    #[serde(default)]
    pub id: Option<u64>,
}

/// Decoded message from the market stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinanceMessage {
    /// Kline update.
    Kline(KlineEvent),
    /// 24h ticker update.
    Ticker(TickerEvent),
    /// Acknowledgement of a control request.
    Ack {
        /// Request id.
        id: u64,
    },
    /// Error frame.
    Error(ErrorFrame),
}

// =============================================================================
// Control Requests
// =============================================================================

/// Control request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamMethod {
    /// Add streams to the connection.
    Subscribe,
    /// Remove streams from the connection.
    Unsubscribe,
}

/// `SUBSCRIBE` / `UNSUBSCRIBE` request.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    /// Request method.
    pub method: StreamMethod,
    /// Stream names.
    pub params: Vec<String>,
    /// Correlation id echoed in the response.
    pub id: u64,
}

impl StreamRequest {
    /// Split `streams` into requests of at most `max_per_request` names each,
    /// numbering them from `first_id`.
    #[must_use]
    pub fn batched(
        method: StreamMethod,
        streams: &[String],
        max_per_request: usize,
        first_id: u64,
    ) -> Vec<Self> {
        streams
            .chunks(max_per_request.max(1))
            .zip(first_id..)
            .map(|(chunk, id)| Self {
                method,
                params: chunk.to_vec(),
                id,
            })
            .collect()
    }
}

// =============================================================================
// Stream Names
// =============================================================================

/// Stream name for a channel.
#[must_use]
pub fn stream_name(channel: &Channel) -> String {
    match channel {
        Channel::Kline { symbol, interval } => {
            format!("{}@kline_{}", symbol.to_ascii_lowercase(), interval.as_str())
        }
        Channel::Ticker { symbol } => format!("{}@ticker", symbol.to_ascii_lowercase()),
    }
}

/// Channel for a stream name, if it is one the hub understands.
#[must_use]
pub fn channel_for_stream(stream: &str) -> Option<Channel> {
    let (symbol, kind) = stream.split_once('@')?;
    if kind == "ticker" {
        return Some(Channel::ticker(symbol));
    }
    let interval = Interval::from_str(kind.strip_prefix("kline_")?).ok()?;
    Some(Channel::kline(symbol, interval))
}

// =============================================================================
// REST Klines
// =============================================================================

/// One row of `GET /api/v3/klines`.
///
/// Rows are positional arrays:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBuyBase, takerBuyQuote, ignore]`. Prices arrive as strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct RestKlineRow(Vec<serde_json::Value>);

impl RestKlineRow {
    /// Convert into the unvalidated form. Missing or malformed columns stay
    /// `None`; a row whose close time has passed is final.
    #[must_use]
    pub fn into_raw(self, symbol: &str, interval: Interval) -> RawKline {
        let now_ms = Utc::now().timestamp_millis();
        let close_time = self.int(6);
        RawKline {
            symbol: Some(symbol.to_string()),
            interval: Some(interval.as_str().to_string()),
            open_time: self.int(0),
            close_time,
            open: self.decimal(1),
            high: self.decimal(2),
            low: self.decimal(3),
            close: self.decimal(4),
            volume: self.decimal(5),
            quote_volume: self.decimal(7),
            trade_count: self.0.get(8).and_then(serde_json::Value::as_u64),
            is_final: close_time.map(|t| t < now_ms),
        }
    }

    fn int(&self, index: usize) -> Option<i64> {
        self.0.get(index).and_then(serde_json::Value::as_i64)
    }

    fn decimal(&self, index: usize) -> Option<Decimal> {
        match self.0.get(index)? {
            serde_json::Value::String(s) => Decimal::from_str(s).ok(),
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_event_into_raw() {
        let json = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":60000,"T":119999,"s":"BTCUSDT",
            "i":"1m","o":"100.5","c":"101","h":"102","l":"99","v":"12.5","n":42,"x":true,"q":"1260"}}"#;
        let event: KlineEvent = serde_json::from_str(json).unwrap();
        let raw = event.into_raw();

        assert_eq!(raw.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(raw.interval.as_deref(), Some("1m"));
        assert_eq!(raw.open_time, Some(60_000));
        assert_eq!(raw.open, Some(Decimal::new(1005, 1)));
        assert_eq!(raw.trade_count, Some(42));
        assert_eq!(raw.is_final, Some(true));
    }

    #[test]
    fn kline_event_tolerates_missing_fields() {
        let json = r#"{"e":"kline","s":"BTCUSDT","k":{"t":60000,"i":"1m"}}"#;
        let raw = serde_json::from_str::<KlineEvent>(json).unwrap().into_raw();
        assert_eq!(raw.symbol.as_deref(), Some("BTCUSDT"));
        assert!(raw.high.is_none());
        assert!(raw.is_final.is_none());
    }

    #[test]
    fn batched_requests_respect_limit() {
        let streams: Vec<String> = (0..450).map(|i| format!("s{i}@ticker")).collect();
        let requests = StreamRequest::batched(StreamMethod::Subscribe, &streams, 200, 7);

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].params.len(), 200);
        assert_eq!(requests[2].params.len(), 50);
        assert_eq!(requests[0].id, 7);
        assert_eq!(requests[2].id, 9);

        let json = serde_json::to_value(&requests[0]).unwrap();
        assert_eq!(json["method"], "SUBSCRIBE");
    }

    #[test]
    fn stream_names_map_to_channels() {
        let kline = Channel::kline("BTCUSDT", Interval::FiveMinutes);
        assert_eq!(stream_name(&kline), "btcusdt@kline_5m");
        assert_eq!(channel_for_stream("btcusdt@kline_5m"), Some(kline));

        let ticker = Channel::ticker("ethusdt");
        assert_eq!(stream_name(&ticker), "ethusdt@ticker");
        assert_eq!(channel_for_stream("ethusdt@ticker"), Some(ticker));

        assert_eq!(channel_for_stream("ethusdt@depth"), None);
        assert_eq!(channel_for_stream("ethusdt@kline_7m"), None);
    }

    #[test]
    fn rest_row_into_raw() {
        let json = r#"[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100",
            "148976.11427815",1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]"#;
        let row: RestKlineRow = serde_json::from_str(json).unwrap();
        let raw = row.into_raw("LTCBTC", Interval::OneMinute);

        assert_eq!(raw.open_time, Some(1_499_040_000_000));
        assert_eq!(raw.close_time, Some(1_499_644_799_999));
        assert_eq!(raw.high, Some(Decimal::new(80, 2)));
        assert_eq!(raw.trade_count, Some(308));
        assert_eq!(raw.is_final, Some(true));
        assert_eq!(raw.symbol.as_deref(), Some("LTCBTC"));
    }

    #[test]
    fn short_rest_row_leaves_gaps() {
        let row: RestKlineRow = serde_json::from_str(r#"[1499040000000,"1"]"#).unwrap();
        let raw = row.into_raw("LTCBTC", Interval::OneMinute);
        assert_eq!(raw.open, Some(Decimal::ONE));
        assert!(raw.close_time.is_none());
        assert!(raw.is_final.is_none());
    }
}
