use std::time::Duration;

use pinchy_core::ClientConfig;

/// Capped exponential backoff for reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect.
    pub base_delay: Duration,
    /// Cap for later reconnects.
    pub max_delay: Duration,
    /// Consecutive attempts before giving up.
    pub max_retries: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_retries: config.max_retries,
        }
    }

    /// `min(max_delay, base_delay * 2^retry_count)`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `retry_count` attempts.
    #[must_use]
    pub const fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
