//! Error types for Floodgate.

use std::time::Duration;
use thiserror::Error;

/// Invalid limiter parameters, raised by the builders before anything starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid capacity: {0}")]
    InvalidCapacity(u64),

    #[error("invalid refill tokens: {0}")]
    InvalidRefillTokens(u64),

    #[error("invalid refill period: {0:?}")]
    InvalidRefillPeriod(Duration),

    #[error("invalid window: {0:?}")]
    InvalidWindow(Duration),

    #[error("invalid resolution: {0:?}")]
    InvalidResolution(Duration),

    #[error("resolution {resolution:?} exceeds window {window:?}")]
    ResolutionExceedsWindow {
        resolution: Duration,
        window: Duration,
    },

    #[error("invalid limit: {0}")]
    InvalidLimit(u64),

    /// Token buckets spawn their refill task on the current Tokio runtime.
    #[error("token bucket must be built inside a Tokio runtime")]
    NoRuntime,
}

/// Misuse of a limiter after it has been placed into service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("token bucket '{name}' is already closed")]
    AlreadyClosed { name: String },
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiter parameters rejected at build time
    #[error("Limiter configuration error: {0}")]
    Limiter(#[from] ConfigError),

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    /// A connection failed at the HTTP protocol level
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
