//! Hub Configuration Settings
//!
//! Configuration types for the hub, loaded from environment variables.
//! Numeric values that fail to parse fall back to their defaults; symbol
//! and interval lists are validated because a typo there silently changes
//! what the hub streams.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::domain::streaming::{Channel, Interval, is_valid_symbol};
use crate::domain::validation::DEFAULT_ANOMALY_THRESHOLD;

const DEFAULT_SYMBOLS: [&str; 10] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT", "ADAUSDT", "DOGEUSDT", "AVAXUSDT",
    "TRXUSDT", "LINKUSDT",
];

const DEFAULT_INTERVALS: [Interval; 4] = [
    Interval::OneMinute,
    Interval::FiveMinutes,
    Interval::FifteenMinutes,
    Interval::OneHour,
];

/// Symbols and intervals streamed from the exchange at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSettings {
    /// Upper-case exchange symbols.
    pub symbols: Vec<String>,
    /// Kline intervals per symbol.
    pub intervals: Vec<Interval>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.iter().map(ToString::to_string).collect(),
            intervals: DEFAULT_INTERVALS.to_vec(),
        }
    }
}

impl MarketSettings {
    /// Kline channels for every (symbol, interval) pair plus one ticker
    /// channel per symbol.
    #[must_use]
    pub fn base_channels(&self) -> Vec<Channel> {
        self.symbols
            .iter()
            .flat_map(|symbol| {
                self.intervals
                    .iter()
                    .map(|interval| Channel::kline(symbol, *interval))
                    .chain(std::iter::once(Channel::ticker(symbol)))
            })
            .collect()
    }
}

/// Exchange endpoints.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// Streaming WebSocket URL.
    pub ws_url: String,
    /// REST base URL.
    pub rest_url: String,
    /// Maximum stream names per SUBSCRIBE request.
    pub max_streams_per_request: usize,
    /// Timeout for opening the streaming connection.
    pub connect_timeout: Duration,
    /// Timeout for each frame written to the streaming connection.
    pub write_timeout: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            rest_url: "https://api.binance.com".to_string(),
            max_streams_per_request: 200,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Connected period after which the backoff starts over.
    pub reconnect_stable_after: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(5),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            reconnect_stable_after: Duration::from_secs(60),
        }
    }
}

/// Historical cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Bars retained per channel.
    pub max_retained: usize,
    /// Time since last write after which a channel is expired.
    pub ttl: Duration,
    /// Idle time after which an unsubscribed fan-out channel is collected.
    pub channel_idle_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_retained: 1_440,
            ttl: Duration::from_secs(25 * 60 * 60),
            channel_idle_ttl: Duration::from_secs(600),
        }
    }
}

/// Subscriber connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Bound on a single socket send.
    pub send_timeout: Duration,
    /// Consecutive send timeouts before the connection is closed.
    pub max_consecutive_timeouts: u32,
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// Time allowed for a pong after a ping.
    pub pong_grace: Duration,
    /// Maximum concurrent subscriber connections.
    pub max_connections: usize,
    /// Maximum channels per connection.
    pub max_subscriptions: usize,
    /// Time between the shutdown notice and closing connections.
    pub shutdown_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 1_000,
            send_timeout: Duration::from_secs(10),
            max_consecutive_timeouts: 10,
            ping_interval: Duration::from_secs(30),
            pong_grace: Duration::from_secs(10),
            max_connections: 1_000,
            max_subscriptions: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// REST backfill settings.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// Token bucket refill rate.
    pub requests_per_second: u32,
    /// Pending request capacity.
    pub queue_capacity: usize,
    /// Bound on a single REST request.
    pub request_timeout: Duration,
    /// Attempts per request before giving up.
    pub max_attempts: u32,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            queue_capacity: 1_024,
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Periodic task settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Dead-connection sweep and recovery check interval.
    pub sweep_interval: Duration,
    /// Cache expiry and channel collection interval.
    pub expiry_interval: Duration,
    /// Metrics snapshot interval.
    pub metrics_interval: Duration,
    /// Quiet period after a reconnect before recovery is declared complete.
    pub recovery_settle: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            expiry_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(15),
            recovery_settle: Duration::from_secs(5),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Subscriber WebSocket port.
    pub ws_port: u16,
    /// Health, metrics and REST port.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8080,
            http_port: 8082,
        }
    }
}

/// Shared secret accepted at the WebSocket handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiToken([REDACTED])")
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Always-on markets.
    pub markets: MarketSettings,
    /// Exchange endpoints.
    pub exchange: ExchangeSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Upstream WebSocket settings.
    pub websocket: WebSocketSettings,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Subscriber connection settings.
    pub connections: ConnectionSettings,
    /// REST backfill settings.
    pub backfill: BackfillSettings,
    /// Periodic task settings.
    pub scheduler: SchedulerSettings,
    /// Close-to-close anomaly threshold (fraction).
    pub anomaly_threshold: Decimal,
    /// Optional handshake token.
    pub api_token: Option<ApiToken>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            markets: MarketSettings::default(),
            exchange: ExchangeSettings::default(),
            server: ServerSettings::default(),
            websocket: WebSocketSettings::default(),
            cache: CacheSettings::default(),
            connections: ConnectionSettings::default(),
            backfill: BackfillSettings::default(),
            scheduler: SchedulerSettings::default(),
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            api_token: None,
        }
    }
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol or interval lists are invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol or interval lists are invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let markets = MarketSettings {
            symbols: env
                .get("HUB_SYMBOLS")
                .map_or(Ok(defaults.markets.symbols), |raw| parse_symbols(&raw))?,
            intervals: env
                .get("HUB_INTERVALS")
                .map_or(Ok(defaults.markets.intervals), |raw| parse_intervals(&raw))?,
        };

        let exchange = ExchangeSettings {
            ws_url: env.string("BINANCE_WS_URL", defaults.exchange.ws_url),
            rest_url: env.string("BINANCE_REST_URL", defaults.exchange.rest_url),
            max_streams_per_request: env
                .parse("HUB_MAX_STREAMS_PER_REQUEST", defaults.exchange.max_streams_per_request)
                .max(1),
            connect_timeout: env.secs("HUB_CONNECT_TIMEOUT_SECS", defaults.exchange.connect_timeout),
            write_timeout: env.secs("HUB_UPSTREAM_WRITE_TIMEOUT_SECS", defaults.exchange.write_timeout),
        };

        let server = ServerSettings {
            ws_port: env.parse("HUB_WS_PORT", defaults.server.ws_port),
            http_port: env.parse("HUB_HTTP_PORT", defaults.server.http_port),
        };

        let ws = &defaults.websocket;
        let websocket = WebSocketSettings {
            heartbeat_interval: env.secs("HUB_UPSTREAM_HEARTBEAT_INTERVAL_SECS", ws.heartbeat_interval),
            heartbeat_timeout: env.secs("HUB_UPSTREAM_HEARTBEAT_TIMEOUT_SECS", ws.heartbeat_timeout),
            reconnect_delay_initial: env
                .secs("HUB_RECONNECT_DELAY_INITIAL_SECS", ws.reconnect_delay_initial),
            reconnect_delay_max: env.secs("HUB_RECONNECT_DELAY_MAX_SECS", ws.reconnect_delay_max),
            reconnect_delay_multiplier: env
                .parse("HUB_RECONNECT_DELAY_MULTIPLIER", ws.reconnect_delay_multiplier),
            reconnect_stable_after: env
                .secs("HUB_RECONNECT_STABLE_AFTER_SECS", ws.reconnect_stable_after),
        };

        let cache = CacheSettings {
            max_retained: env
                .parse("HUB_CACHE_MAX_RETAINED", defaults.cache.max_retained)
                .max(1),
            ttl: env.secs("HUB_CACHE_TTL_SECS", defaults.cache.ttl),
            channel_idle_ttl: env.secs("HUB_CHANNEL_IDLE_TTL_SECS", defaults.cache.channel_idle_ttl),
        };

        let conn = &defaults.connections;
        let connections = ConnectionSettings {
            send_queue_capacity: env
                .parse("HUB_SEND_QUEUE_CAPACITY", conn.send_queue_capacity)
                .max(1),
            send_timeout: env.secs("HUB_SEND_TIMEOUT_SECS", conn.send_timeout),
            max_consecutive_timeouts: env
                .parse("HUB_MAX_CONSECUTIVE_TIMEOUTS", conn.max_consecutive_timeouts)
                .max(1),
            ping_interval: env.secs("HUB_PING_INTERVAL_SECS", conn.ping_interval),
            pong_grace: env.secs("HUB_PONG_GRACE_SECS", conn.pong_grace),
            max_connections: env.parse("HUB_MAX_CONNECTIONS", conn.max_connections),
            max_subscriptions: env.parse("HUB_MAX_SUBSCRIPTIONS", conn.max_subscriptions),
            shutdown_grace: env.secs("HUB_SHUTDOWN_GRACE_SECS", conn.shutdown_grace),
        };

        let backfill = BackfillSettings {
            requests_per_second: env
                .parse("HUB_BACKFILL_RPS", defaults.backfill.requests_per_second)
                .max(1),
            queue_capacity: env
                .parse("HUB_BACKFILL_QUEUE", defaults.backfill.queue_capacity)
                .max(1),
            request_timeout: env.secs("HUB_BACKFILL_TIMEOUT_SECS", defaults.backfill.request_timeout),
            max_attempts: env
                .parse("HUB_BACKFILL_MAX_ATTEMPTS", defaults.backfill.max_attempts)
                .max(1),
        };

        let sched = &defaults.scheduler;
        let scheduler = SchedulerSettings {
            sweep_interval: env.secs("HUB_SWEEP_INTERVAL_SECS", sched.sweep_interval),
            expiry_interval: env.secs("HUB_EXPIRY_INTERVAL_SECS", sched.expiry_interval),
            metrics_interval: env.secs("HUB_METRICS_INTERVAL_SECS", sched.metrics_interval),
            recovery_settle: env.secs("HUB_RECOVERY_SETTLE_SECS", sched.recovery_settle),
        };

        Ok(Self {
            markets,
            exchange,
            server,
            websocket,
            cache,
            connections,
            backfill,
            scheduler,
            anomaly_threshold: env.parse("HUB_ANOMALY_THRESHOLD", defaults.anomaly_threshold),
            api_token: env
                .get("HUB_API_TOKEN")
                .filter(|token| !token.is_empty())
                .map(ApiToken::new),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A symbol in `HUB_SYMBOLS` is not a valid exchange symbol.
    #[error("invalid symbol in HUB_SYMBOLS: {0}")]
    InvalidSymbol(String),
    /// An interval in `HUB_INTERVALS` is not supported.
    #[error("invalid interval in HUB_INTERVALS: {0}")]
    InvalidInterval(String),
    /// A list variable is present but empty.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_symbols(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut symbols = Vec::new();
    for symbol in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !is_valid_symbol(symbol) {
            return Err(ConfigError::InvalidSymbol(symbol.to_string()));
        }
        let symbol = symbol.to_ascii_uppercase();
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue("HUB_SYMBOLS".to_string()));
    }
    Ok(symbols)
}

fn parse_intervals(raw: &str) -> Result<Vec<Interval>, ConfigError> {
    let mut intervals = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let interval: Interval = name
            .parse()
            .map_err(|_| ConfigError::InvalidInterval(name.to_string()))?;
        if !intervals.contains(&interval) {
            intervals.push(interval);
        }
    }
    if intervals.is_empty() {
        return Err(ConfigError::EmptyValue("HUB_INTERVALS".to_string()));
    }
    Ok(intervals)
}

/// Typed access over a key lookup.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }
}
