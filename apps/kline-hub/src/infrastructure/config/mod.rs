//! Configuration Module
//!
//! Configuration loading for the hub service.

mod settings;

pub use settings::{
    ApiToken, BackfillSettings, CacheSettings, ConfigError, ConnectionSettings, ExchangeSettings,
    HubConfig, MarketSettings, SchedulerSettings, ServerSettings, WebSocketSettings,
};
