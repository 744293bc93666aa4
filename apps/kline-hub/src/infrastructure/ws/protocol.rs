//! Subscriber Wire Protocol
//!
//! JSON text frames with a `type` discriminator. Client frames are parsed
//! once into [`ClientMessage`]; everything the hub sends is a
//! [`ServerMessage`], serialized once per publish and shared by every
//! subscriber queue.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::{Bar, Channel, Interval, Ticker};

// =============================================================================
// Hub → Client
// =============================================================================

/// Upstream link status reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    /// Exchange stream is up.
    Connected,
    /// Exchange stream is down; data may be stale.
    Disconnected,
}

/// Error codes sent in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Connection is being closed for not keeping up.
    SlowClient,
    /// Subscription limit reached.
    QuotaExceeded,
    /// Handshake token rejected.
    AuthFailed,
    /// Malformed frame or channel name.
    InvalidRequest,
}

/// Frame sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Replay batch for a kline channel, oldest first.
    Historical {
        /// Symbol.
        symbol: String,
        /// Interval.
        interval: Interval,
        /// Bars.
        klines: Vec<Bar>,
    },
    /// Live kline update.
    Kline {
        /// Symbol.
        symbol: String,
        /// Interval.
        interval: Interval,
        /// Bar.
        data: Bar,
    },
    /// Live ticker update.
    Ticker {
        /// Symbol.
        symbol: String,
        /// Ticker.
        data: Ticker,
    },
    /// Exchange link status change.
    ExchangeStatus {
        /// Exchange name.
        exchange: String,
        /// New status.
        status: ExchangeStatus,
        /// Epoch milliseconds.
        timestamp: i64,
    },
    /// The hub is going away; reconnect after the grace period.
    Reconnect {
        /// Why.
        reason: String,
        /// Seconds before the connection is closed.
        #[serde(rename = "gracePeriodSeconds")]
        grace_period_seconds: u64,
    },
    /// Request or connection error.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
}

impl ServerMessage {
    /// Replay batch for a kline channel.
    #[must_use]
    pub fn historical(symbol: &str, interval: Interval, klines: Vec<Bar>) -> Self {
        Self::Historical {
            symbol: symbol.to_string(),
            interval,
            klines,
        }
    }

    /// Live kline frame.
    #[must_use]
    pub fn kline(symbol: &str, interval: Interval, data: Bar) -> Self {
        Self::Kline {
            symbol: symbol.to_string(),
            interval,
            data,
        }
    }

    /// Live ticker frame.
    #[must_use]
    pub fn ticker(data: Ticker) -> Self {
        Self::Ticker {
            symbol: data.symbol.clone(),
            data,
        }
    }

    /// Exchange status frame stamped with the current time.
    #[must_use]
    pub fn exchange_status(exchange: &str, status: ExchangeStatus) -> Self {
        Self::ExchangeStatus {
            exchange: exchange.to_string(),
            status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Error frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Metric label for this frame.
    #[must_use]
    pub const fn message_type(&self) -> crate::infrastructure::metrics::MessageType {
        use crate::infrastructure::metrics::MessageType;
        match self {
            Self::Historical { .. } => MessageType::Historical,
            Self::Kline { .. } => MessageType::Kline,
            Self::Ticker { .. } => MessageType::Ticker,
            Self::ExchangeStatus { .. } => MessageType::ExchangeStatus,
            Self::Reconnect { .. } | Self::Error { .. } | Self::Ping | Self::Pong => {
                MessageType::Control
            }
        }
    }

    /// Serialize to a shareable text payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; the message types here only fail on
    /// non-string map keys, which they never contain.
    pub fn encode(&self) -> Result<Utf8Bytes, serde_json::Error> {
        serde_json::to_string(self).map(Utf8Bytes::from)
    }
}

// =============================================================================
// Client → Hub
// =============================================================================

/// Frame sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Add channels.
    Subscribe {
        /// Dotted channel names.
        channels: Vec<String>,
    },
    /// Remove channels.
    Unsubscribe {
        /// Dotted channel names.
        channels: Vec<String>,
    },
    /// Client heartbeat probe.
    Ping,
    /// Reply to a hub ping.
    Pong,
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for unknown types or missing fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Split channel names into parsed channels and rejected names.
#[must_use]
pub fn parse_channels(names: &[String]) -> (Vec<Channel>, Vec<String>) {
    let mut channels = Vec::with_capacity(names.len());
    let mut rejected = Vec::new();
    for name in names {
        match name.parse::<Channel>() {
            Ok(channel) if !channels.contains(&channel) => channels.push(channel),
            Ok(_) => {}
            Err(_) => rejected.push(name.clone()),
        }
    }
    (channels, rejected)
}
