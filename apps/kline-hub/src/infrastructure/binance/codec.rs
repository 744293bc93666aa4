//! Stream Codec
//!
//! Decodes text frames from the Binance market stream. Frames arrive in
//! three shapes:
//!
//! - Raw events: `{"e":"kline",...}` on the `/ws` endpoint
//! - Combined envelopes: `{"stream":"btcusdt@kline_1m","data":{...}}`
//! - Control replies: `{"result":null,"id":1}` or `{"code":2,"msg":"...","id":1}`

use super::messages::{BinanceMessage, ErrorFrame, KlineEvent, TickerEvent};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event type the hub does not handle.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Frame matches none of the known shapes.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the market stream.
#[derive(Debug, Default, Clone)]
pub struct StreamCodec;

impl StreamCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON or has an unknown shape.
    pub fn decode(&self, text: &str) -> Result<BinanceMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;
        Self::decode_value(value)
    }

    fn decode_value(mut value: serde_json::Value) -> Result<BinanceMessage, CodecError> {
        if value.get("stream").is_some()
            && let Some(data) = value.get_mut("data")
        {
            return Self::decode_value(data.take());
        }

        if let Some(event_type) = value.get("e").and_then(serde_json::Value::as_str) {
            return match event_type {
                "kline" => Ok(BinanceMessage::Kline(serde_json::from_value::<KlineEvent>(
                    value,
                )?)),
                "24hrTicker" => Ok(BinanceMessage::Ticker(
                    serde_json::from_value::<TickerEvent>(value)?,
                )),
                other => Err(CodecError::UnknownEventType(other.to_string())),
            };
        }

        if value.get("code").is_some() && value.get("msg").is_some() {
            return Ok(BinanceMessage::Error(serde_json::from_value::<ErrorFrame>(
                value,
            )?));
        }

        if value.get("result").is_some()
            && let Some(id) = value.get("id").and_then(serde_json::Value::as_u64)
        {
            return Ok(BinanceMessage::Ack { id });
        }

        let preview: String = value.to_string().chars().take(50).collect();
        Err(CodecError::InvalidFormat(format!("{preview}...")))
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::binance::messages::{StreamMethod, StreamRequest};

    const KLINE: &str = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":60000,"T":119999,
        "s":"BTCUSDT","i":"1m","o":"1","c":"1","h":"1","l":"1","v":"1","n":1,"x":false,"q":"1"}}"#;

    #[test]
    fn decode_raw_kline() {
        let msg = StreamCodec::new().decode(KLINE).unwrap();
        match msg {
            BinanceMessage::Kline(event) => {
                assert_eq!(event.kline.interval.as_deref(), Some("1m"));
                assert_eq!(event.kline.is_final, Some(false));
            }
            other => panic!("expected kline, got {other:?}"),
        }
    }

    #[test]
    fn decode_combined_envelope() {
        let frame = format!(r#"{{"stream":"btcusdt@kline_1m","data":{KLINE}}}"#);
        let msg = StreamCodec::new().decode(&frame).unwrap();
        assert!(matches!(msg, BinanceMessage::Kline(_)));
    }

    #[test]
    fn decode_ticker() {
        let frame = r#"{"e":"24hrTicker","E":123,"s":"BNBBTC","P":"2.5","c":"0.0025",
            "h":"0.0026","l":"0.0010","v":"10000","q":"18"}"#;
        match StreamCodec::new().decode(frame).unwrap() {
            BinanceMessage::Ticker(t) => {
                assert_eq!(t.symbol.as_deref(), Some("BNBBTC"));
                assert_eq!(t.event_time, Some(123));
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn decode_ack_and_error() {
        let codec = StreamCodec::new();
        assert_eq!(
            codec.decode(r#"{"result":null,"id":4}"#).unwrap(),
            BinanceMessage::Ack { id: 4 }
        );
        match codec.decode(r#"{"code":2,"msg":"Invalid request","id":5}"#).unwrap() {
            BinanceMessage::Error(e) => {
                assert_eq!(e.code, 2);
                assert_eq!(e.id, Some(5));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_unknown_shapes() {
        let codec = StreamCodec::new();
        assert!(matches!(
            codec.decode(r#"{"e":"trade","s":"BTCUSDT"}"#),
            Err(CodecError::UnknownEventType(t)) if t == "trade"
        ));
        assert!(matches!(
            codec.decode(r#"{"hello":"world"}"#),
            Err(CodecError::InvalidFormat(_))
        ));
        assert!(matches!(codec.decode("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn encode_request() {
        let request = StreamRequest {
            method: StreamMethod::Unsubscribe,
            params: vec!["btcusdt@ticker".to_string()],
            id: 3,
        };
        let json = StreamCodec::new().encode(&request).unwrap();
        assert_eq!(
            json,
            r#"{"method":"UNSUBSCRIBE","params":["btcusdt@ticker"],"id":3}"#
        );
    }
}
