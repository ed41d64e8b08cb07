//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the engines run with zero configuration.

use std::time::Duration;

use roda_shared::constants::{
    DEFAULT_FEED_PAGE_SIZE, PROFILE_FETCH_RETRIES, PROFILE_FETCH_RETRY_DELAY_MS,
    RESUBSCRIBE_BASE_DELAY_MS, RESUBSCRIBE_MAX_ATTEMPTS,
};

use crate::lifecycle::RetrySettings;

/// Tunables for the sync engines.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of posts fetched for the initial feed page.
    /// Env: `RODA_FEED_PAGE_SIZE`
    /// Default: `20`
    pub feed_page_size: usize,

    /// Whether new sign-ups are enrolled as beta testers.
    /// Product has not decided if this is permanent or a rollout flag, so
    /// it stays a switch rather than a hard-coded policy.
    /// Env: `RODA_SIGNUP_BETA` (true/false)
    /// Default: `true`
    pub signup_beta_testers: bool,

    /// How many times an engine tries to re-establish an invalidated live
    /// subscription before reporting the loss.
    /// Env: `RODA_RESUBSCRIBE_MAX_ATTEMPTS`
    /// Default: `5`
    pub resubscribe_max_attempts: u32,

    /// Base delay for the resubscribe backoff, doubled per attempt.
    /// Env: `RODA_RESUBSCRIBE_BASE_DELAY_MS`
    /// Default: `200`
    pub resubscribe_base_delay: Duration,

    /// Retries for the post-sign-up profile fetch. The profile row is
    /// written right after the identity, so the first fetch can race it.
    pub profile_fetch_retries: u32,

    /// Delay between profile fetch retries.
    pub profile_fetch_retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
            signup_beta_testers: true,
            resubscribe_max_attempts: RESUBSCRIBE_MAX_ATTEMPTS,
            resubscribe_base_delay: Duration::from_millis(RESUBSCRIBE_BASE_DELAY_MS),
            profile_fetch_retries: PROFILE_FETCH_RETRIES,
            profile_fetch_retry_delay: Duration::from_millis(PROFILE_FETCH_RETRY_DELAY_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RODA_FEED_PAGE_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                config.feed_page_size = n;
            } else {
                tracing::warn!(value = %val, "Invalid RODA_FEED_PAGE_SIZE, using default");
            }
        }

        if let Ok(val) = std::env::var("RODA_SIGNUP_BETA") {
            config.signup_beta_testers = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("RODA_RESUBSCRIBE_MAX_ATTEMPTS") {
            if let Ok(n) = val.parse::<u32>() {
                config.resubscribe_max_attempts = n;
            }
        }

        if let Ok(val) = std::env::var("RODA_RESUBSCRIBE_BASE_DELAY_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.resubscribe_base_delay = Duration::from_millis(ms);
            }
        }

        config
    }

    pub(crate) fn retry(&self) -> RetrySettings {
        RetrySettings {
            max_attempts: self.resubscribe_max_attempts,
            base_delay: self.resubscribe_base_delay,
        }
    }
}
