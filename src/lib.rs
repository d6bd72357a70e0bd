//! Floodgate - Request Admission Control
//!
//! This crate decides, per request key, whether to admit or reject work under a
//! configured rate. It provides a token bucket with a background refill task, a
//! sliding window counter, and a registry that lazily creates one limiter per
//! key. An HTTP middleware and server sit on top of the `allow(key) -> bool`
//! contract.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
