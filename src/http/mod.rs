//! HTTP boundary: key extraction, the rate limiting middleware and a server.

mod middleware;
mod server;

pub use middleware::{client_ip, too_many_requests, KeyStrategy, RateLimitMiddleware};
pub use server::HttpServer;
