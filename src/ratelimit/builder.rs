//! Fluent builders for limiters and registries.
//!
//! Setters never fail; all validation happens in the final `build*` call, and
//! nothing is spawned unless validation succeeds.

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::info;

use super::bucket::{TokenBucket, TokenBucketConfig};
use super::registry::KeyedLimiterRegistry;
use super::window::{SlidingWindow, SlidingWindowConfig, SlidingWindowCounter};
use crate::error::ConfigError;

const DEFAULT_BUCKET_NAME: &str = "default";
const DEFAULT_CAPACITY: u64 = 100;
const DEFAULT_REFILL_TOKENS: u64 = 10;
const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(1);

const DEFAULT_WINDOW: Duration = Duration::from_secs(3);
const DEFAULT_RESOLUTION: Duration = Duration::from_secs(1);
const DEFAULT_LIMIT: u64 = 30;

/// Builder for [`TokenBucket`]s and token bucket registries.
#[derive(Debug, Clone)]
pub struct TokenBucketBuilder {
    name: String,
    config: TokenBucketConfig,
}

impl Default for TokenBucketBuilder {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUCKET_NAME.to_string(),
            config: TokenBucketConfig {
                capacity: DEFAULT_CAPACITY,
                refill_tokens: DEFAULT_REFILL_TOKENS,
                refill_period: DEFAULT_REFILL_PERIOD,
            },
        }
    }
}

impl TokenBucketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the diagnostic name. Registries name each bucket after its key.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn refill_tokens(mut self, refill_tokens: u64) -> Self {
        self.config.refill_tokens = refill_tokens;
        self
    }

    pub fn refill_period(mut self, refill_period: Duration) -> Self {
        self.config.refill_period = refill_period;
        self
    }

    /// Get the accumulated parameters.
    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    /// Validate and start a single bucket on the current Tokio runtime.
    pub fn build(&self) -> Result<TokenBucket, ConfigError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let bucket = TokenBucket::spawn(self.name.clone(), self.config, &handle);
        info!(name = %self.name, capacity = self.config.capacity, "Token bucket built");
        Ok(bucket)
    }

    /// Validate and create a registry that builds one bucket per key.
    ///
    /// The registry captures the current runtime; buckets created later spawn
    /// their refill tasks there, whichever thread the request arrives on.
    pub fn build_registry(&self) -> Result<KeyedLimiterRegistry<TokenBucket>, ConfigError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let config = self.config;

        info!(
            capacity = config.capacity,
            refill_tokens = config.refill_tokens,
            refill_period = ?config.refill_period,
            "Token bucket registry built"
        );
        Ok(KeyedLimiterRegistry::new(move |key: &str| {
            TokenBucket::spawn(key, config, &handle)
        }))
    }
}

/// Builder for [`SlidingWindowCounter`]s.
#[derive(Debug, Clone)]
pub struct SlidingWindowBuilder {
    config: SlidingWindowConfig,
}

impl Default for SlidingWindowBuilder {
    fn default() -> Self {
        Self {
            config: SlidingWindowConfig {
                window: DEFAULT_WINDOW,
                resolution: DEFAULT_RESOLUTION,
                limit: DEFAULT_LIMIT,
            },
        }
    }
}

impl SlidingWindowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn resolution(mut self, resolution: Duration) -> Self {
        self.config.resolution = resolution;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.config.limit = limit;
        self
    }

    /// Get the accumulated parameters.
    pub fn config(&self) -> SlidingWindowConfig {
        self.config
    }

    /// Validate and create a single-key window.
    pub fn build(&self) -> Result<SlidingWindow, ConfigError> {
        self.config.validate()?;
        Ok(SlidingWindow::new(self.config, std::time::Instant::now()))
    }

    /// Validate and create a keyed counter.
    pub fn build_counter(&self) -> Result<SlidingWindowCounter, ConfigError> {
        self.config.validate()?;
        info!(
            window = ?self.config.window,
            resolution = ?self.config.resolution,
            limit = self.config.limit,
            "Sliding window counter built"
        );
        Ok(SlidingWindowCounter::new(self.config))
    }
}
