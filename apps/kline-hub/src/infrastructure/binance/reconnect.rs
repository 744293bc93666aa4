//! Reconnection Policy
//!
//! Exponential backoff with jitter for the upstream connection. Retries are
//! unlimited; the delay only starts over once a connection has stayed up
//! for `stable_after`, so a link that flaps immediately after every
//! connect keeps backing off.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Connected time after which the backoff is reset.
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from [`WebSocketSettings`].
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            stable_after: settings.reconnect_stable_after,
        }
    }
}

/// Exponential backoff state.
///
/// # Example
///
/// ```rust
/// use kline_hub::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// let first = policy.next_delay();
/// assert!(first >= Duration::from_millis(4_500) && first <= Duration::from_millis(5_500));
///
/// // A connection that lasted long enough starts the backoff over.
/// policy.on_disconnect(Some(Duration::from_secs(120)));
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, advancing the backoff.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);
        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        delay
    }

    /// Account for a lost connection that had been up for `connected_for`
    /// (`None` if it never came up).
    pub fn on_disconnect(&mut self, connected_for: Option<Duration>) {
        if connected_for.is_some_and(|up| up >= self.config.stable_after) {
            self.reset();
        }
    }

    /// Start the backoff over.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = adjusted_millis as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            jitter_factor: 0.0,
            ..ReconnectConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(policy.attempt_count(), 6);
    }

    #[test]
    fn short_lived_connection_keeps_backing_off() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.on_disconnect(Some(Duration::from_secs(3)));
        assert_eq!(policy.next_delay(), Duration::from_secs(20));

        policy.on_disconnect(None);
        assert_eq!(policy.next_delay(), Duration::from_secs(40));
    }

    #[test]
    fn stable_connection_resets_backoff() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        for _ in 0..4 {
            let _ = policy.next_delay();
        }
        policy.on_disconnect(Some(Duration::from_secs(60)));
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
            let millis = policy.next_delay().as_millis();
            assert!((4_500..=5_500).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
