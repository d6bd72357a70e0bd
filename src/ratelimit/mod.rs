//! Rate limiting primitives and per-key state management.

mod backend;
mod bucket;
mod builder;
mod registry;
mod window;

pub use backend::{AdmissionBackend, Limiter};
pub use bucket::{TokenBucket, TokenBucketConfig};
pub use builder::{SlidingWindowBuilder, TokenBucketBuilder};
pub use registry::KeyedLimiterRegistry;
pub use window::{SlidingWindow, SlidingWindowConfig, SlidingWindowCounter};
