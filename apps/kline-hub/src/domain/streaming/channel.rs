//! Channel Keys
//!
//! A channel is the unit of subscription: either the kline stream of one
//! (symbol, interval) pair or the ticker stream of one symbol. Channels are
//! written on the wire as dotted strings:
//!
//! - `kline.BTCUSDT.1m`
//! - `ticker.BTCUSDT`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Interval
// =============================================================================

/// Kline interval supported by the hub.
///
/// Only fixed-length intervals are supported so that gap detection can rely
/// on a constant step between consecutive open times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// One minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// Three minutes.
    #[serde(rename = "3m")]
    ThreeMinutes,
    /// Five minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// Thirty minutes.
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// Two hours.
    #[serde(rename = "2h")]
    TwoHours,
    /// Four hours.
    #[serde(rename = "4h")]
    FourHours,
    /// Six hours.
    #[serde(rename = "6h")]
    SixHours,
    /// Eight hours.
    #[serde(rename = "8h")]
    EightHours,
    /// Twelve hours.
    #[serde(rename = "12h")]
    TwelveHours,
    /// One day.
    #[serde(rename = "1d")]
    OneDay,
    /// Three days.
    #[serde(rename = "3d")]
    ThreeDays,
    /// One week.
    #[serde(rename = "1w")]
    OneWeek,
}

impl Interval {
    /// All supported intervals, shortest first.
    pub const ALL: [Self; 14] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::SixHours,
        Self::EightHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::ThreeDays,
        Self::OneWeek,
    ];

    /// Wire name of the interval (`"1m"`, `"1h"`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::OneWeek => "1w",
        }
    }

    /// Length of one bar in milliseconds.
    #[must_use]
    pub const fn duration_ms(self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::OneMinute => MINUTE,
            Self::ThreeMinutes => 3 * MINUTE,
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::ThirtyMinutes => 30 * MINUTE,
            Self::OneHour => 60 * MINUTE,
            Self::TwoHours => 120 * MINUTE,
            Self::FourHours => 240 * MINUTE,
            Self::SixHours => 360 * MINUTE,
            Self::EightHours => 480 * MINUTE,
            Self::TwelveHours => 720 * MINUTE,
            Self::OneDay => 1_440 * MINUTE,
            Self::ThreeDays => 4_320 * MINUTE,
            Self::OneWeek => 10_080 * MINUTE,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| ChannelParseError::UnknownInterval(s.to_string()))
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Subscription key for a market data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Kline stream for a (symbol, interval) pair.
    Kline {
        /// Upper-case exchange symbol.
        symbol: String,
        /// Bar interval.
        interval: Interval,
    },
    /// 24h rolling ticker stream for a symbol.
    Ticker {
        /// Upper-case exchange symbol.
        symbol: String,
    },
}

impl Channel {
    /// Kline channel for `symbol` (normalized to upper case).
    #[must_use]
    pub fn kline(symbol: &str, interval: Interval) -> Self {
        Self::Kline {
            symbol: symbol.to_ascii_uppercase(),
            interval,
        }
    }

    /// Ticker channel for `symbol` (normalized to upper case).
    #[must_use]
    pub fn ticker(symbol: &str) -> Self {
        Self::Ticker {
            symbol: symbol.to_ascii_uppercase(),
        }
    }

    /// Symbol of the channel.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Kline { symbol, .. } | Self::Ticker { symbol } => symbol,
        }
    }

    /// Interval for kline channels.
    #[must_use]
    pub const fn interval(&self) -> Option<Interval> {
        match self {
            Self::Kline { interval, .. } => Some(*interval),
            Self::Ticker { .. } => None,
        }
    }

    /// Whether this is a kline channel.
    #[must_use]
    pub const fn is_kline(&self) -> bool {
        matches!(self, Self::Kline { .. })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kline { symbol, interval } => write!(f, "kline.{symbol}.{interval}"),
            Self::Ticker { symbol } => write!(f, "ticker.{symbol}"),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let kind = parts.next().unwrap_or_default();
        let symbol = parts.next().unwrap_or_default();

        if !is_valid_symbol(symbol) {
            return Err(ChannelParseError::InvalidSymbol(s.to_string()));
        }

        let channel = match kind {
            "kline" => {
                let interval = parts
                    .next()
                    .ok_or_else(|| ChannelParseError::Malformed(s.to_string()))?
                    .parse()?;
                Self::kline(symbol, interval)
            }
            "ticker" => Self::ticker(symbol),
            _ => return Err(ChannelParseError::Malformed(s.to_string())),
        };

        if parts.next().is_some() {
            return Err(ChannelParseError::Malformed(s.to_string()));
        }

        Ok(channel)
    }
}

/// Exchange symbols are short alphanumeric codes such as `BTCUSDT`.
#[must_use]
pub fn is_valid_symbol(symbol: &str) -> bool {
    (2..=20).contains(&symbol.len()) && symbol.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Channel parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    /// Channel string is not `kline.<SYMBOL>.<interval>` or `ticker.<SYMBOL>`.
    #[error("malformed channel: {0}")]
    Malformed(String),
    /// Symbol part is empty or contains invalid characters.
    #[error("invalid symbol in channel: {0}")]
    InvalidSymbol(String),
    /// Interval is not one of the supported intervals.
    #[error("unknown interval: {0}")]
    UnknownInterval(String),
}

// =============================================================================
// Tests
// =============================================================================
