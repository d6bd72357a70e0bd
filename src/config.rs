//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FloodgateError, Result};
use crate::http::KeyStrategy;
use crate::ratelimit::{AdmissionBackend, SlidingWindowBuilder, TokenBucketBuilder};

/// Prefix of environment variables overriding file settings,
/// e.g. `FLOODGATE__SERVER__ADDR`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which admission algorithm backs the middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// How requests are grouped into keys
    #[serde(default)]
    pub key: KeyStrategy,

    /// Token bucket parameters
    #[serde(default)]
    pub token_bucket: TokenBucketSettings,

    /// Sliding window parameters
    #[serde(default)]
    pub sliding_window: SlidingWindowSettings,

    /// How often idle per-key state is purged, in seconds (0 disables)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            key: KeyStrategy::default(),
            token_bucket: TokenBucketSettings::default(),
            sliding_window: SlidingWindowSettings::default(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    /// Maximum tokens per key
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per refill
    #[serde(default = "default_refill_tokens")]
    pub refill_tokens: u64,

    /// Refill period in milliseconds
    #[serde(default = "default_refill_period")]
    pub refill_period_ms: u64,
}

impl Default for TokenBucketSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_tokens: default_refill_tokens(),
            refill_period_ms: default_refill_period(),
        }
    }
}

fn default_capacity() -> u64 {
    1000
}

fn default_refill_tokens() -> u64 {
    100
}

fn default_refill_period() -> u64 {
    10_000
}

/// Sliding window parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowSettings {
    /// Window length in milliseconds
    #[serde(default = "default_window")]
    pub window_ms: u64,

    /// Slot width in milliseconds
    #[serde(default = "default_resolution")]
    pub resolution_ms: u64,

    /// Maximum requests per key within a window
    #[serde(default = "default_limit")]
    pub limit: u64,
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window(),
            resolution_ms: default_resolution(),
            limit: default_limit(),
        }
    }
}

fn default_window() -> u64 {
    3_000
}

fn default_resolution() -> u64 {
    1_000
}

fn default_limit() -> u64 {
    30
}

impl TokenBucketSettings {
    /// Turn these settings into a builder.
    pub fn builder(&self) -> TokenBucketBuilder {
        TokenBucketBuilder::new()
            .capacity(self.capacity)
            .refill_tokens(self.refill_tokens)
            .refill_period(Duration::from_millis(self.refill_period_ms))
    }
}

impl SlidingWindowSettings {
    /// Turn these settings into a builder.
    pub fn builder(&self) -> SlidingWindowBuilder {
        SlidingWindowBuilder::new()
            .window(Duration::from_millis(self.window_ms))
            .resolution(Duration::from_millis(self.resolution_ms))
            .limit(self.limit)
    }
}

impl RateLimitingConfig {
    /// Build the admission backend selected by `algorithm`.
    ///
    /// Token buckets need a running Tokio runtime.
    pub fn build_backend(&self) -> Result<Arc<dyn AdmissionBackend>> {
        let backend: Arc<dyn AdmissionBackend> = match self.algorithm {
            Algorithm::TokenBucket => Arc::new(self.token_bucket.builder().build_registry()?),
            Algorithm::SlidingWindow => Arc::new(self.sliding_window.builder().build_counter()?),
        };
        Ok(backend)
    }

    /// Interval of the idle-key cleanup loop, if enabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

impl FloodgateConfig {
    /// Load configuration from an optional file layered with
    /// `FLOODGATE__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))
    }
}
