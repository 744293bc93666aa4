//! Binance Adapters
//!
//! - **Stream**: market WebSocket (klines and 24h tickers)
//! - **REST**: historical klines for gap backfill

pub mod codec;
pub mod messages;
pub mod rate_limit;
pub mod reconnect;
pub mod rest;
pub mod stream;

pub use codec::{CodecError, StreamCodec};
pub use messages::{BinanceMessage, StreamMethod, StreamRequest, channel_for_stream, stream_name};
pub use rate_limit::RestRateLimiter;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use rest::BinanceRestClient;
pub use stream::{BinanceStreamClient, ExchangeEvent, StreamClientConfig, StreamClientError};
