//! Rate limiting middleware: key extraction and rejection responses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ratelimit::AdmissionBackend;

/// Key shared by every request under [`KeyStrategy::Global`].
const GLOBAL_KEY: &str = "key";

/// How requests are partitioned into rate limiting keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// One limiter per client IP
    #[default]
    Ip,
    /// One limiter per URL path
    Path,
    /// A single limiter for the whole server
    Global,
}

impl KeyStrategy {
    /// Derive the rate limiting key for a request.
    pub fn key<B>(&self, req: &Request<B>, peer: SocketAddr) -> String {
        match self {
            KeyStrategy::Ip => client_ip(req, peer),
            KeyStrategy::Path => req.uri().path().to_string(),
            KeyStrategy::Global => GLOBAL_KEY.to_string(),
        }
    }

    /// Body sent with a 429 response.
    pub fn rejection_message(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "IP Rate limit exceeded",
            KeyStrategy::Path => "Path Rate limit exceeded",
            KeyStrategy::Global => "Server is Busy..",
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => write!(f, "ip"),
            KeyStrategy::Path => write!(f, "path"),
            KeyStrategy::Global => write!(f, "global"),
        }
    }
}

/// Best-effort client address.
///
/// Prefers the first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer
/// address. The IPv6 loopback is reported as `127.0.0.1`.
pub fn client_ip<B>(req: &Request<B>, peer: SocketAddr) -> String {
    if let Some(first) = header_value(req, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_value(req, "x-real-ip") {
        return real_ip.to_string();
    }

    match peer.ip() {
        IpAddr::V6(ip) if ip == Ipv6Addr::LOCALHOST => Ipv4Addr::LOCALHOST.to_string(),
        ip => ip.to_string(),
    }
}

fn header_value<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Build a `429 Too Many Requests` response carrying `message`.
pub fn too_many_requests(message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Admits or rejects requests through an [`AdmissionBackend`].
pub struct RateLimitMiddleware {
    backend: Arc<dyn AdmissionBackend>,
    strategy: KeyStrategy,
}

impl RateLimitMiddleware {
    /// Create a middleware keying requests with `strategy`.
    pub fn new(backend: Arc<dyn AdmissionBackend>, strategy: KeyStrategy) -> Self {
        Self { backend, strategy }
    }

    /// Check a request.
    ///
    /// Returns `Ok(())` when the request may be forwarded, or the rejection
    /// response to send instead.
    pub fn check<B>(
        &self,
        req: &Request<B>,
        peer: SocketAddr,
    ) -> Result<(), Response<Full<Bytes>>> {
        let key = self.strategy.key(req, peer);
        if self.backend.allow(&key) {
            Ok(())
        } else {
            debug!(key = %key, strategy = %self.strategy, "Rate limit exceeded");
            Err(too_many_requests(self.strategy.rejection_message()))
        }
    }

    /// Get the backend deciding admission.
    pub fn backend(&self) -> &Arc<dyn AdmissionBackend> {
        &self.backend
    }

    /// Get the key strategy.
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::SlidingWindowBuilder;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "192.168.1.10:54321".parse().unwrap()
    }

    fn request(path: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn middleware(limit: u64, strategy: KeyStrategy) -> RateLimitMiddleware {
        let counter = SlidingWindowBuilder::new()
            .window(Duration::from_secs(60))
            .resolution(Duration::from_secs(1))
            .limit(limit)
            .build_counter()
            .unwrap();
        RateLimitMiddleware::new(Arc::new(counter), strategy)
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let req = request(
            "/",
            &[
                ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
                ("x-real-ip", "198.51.100.2"),
            ],
        );
        assert_eq!(client_ip(&req, peer()), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let req = request("/", &[("x-real-ip", " 198.51.100.2 ")]);
        assert_eq!(client_ip(&req, peer()), "198.51.100.2");
    }

    #[test]
    fn test_client_ip_skips_empty_forwarded_for() {
        let req = request("/", &[("x-forwarded-for", " , 10.0.0.1")]);
        assert_eq!(client_ip(&req, peer()), "192.168.1.10");
    }

    #[test]
    fn test_client_ip_uses_peer_address() {
        let req = request("/", &[]);
        assert_eq!(client_ip(&req, peer()), "192.168.1.10");
    }

    #[test]
    fn test_client_ip_maps_ipv6_loopback() {
        let req = request("/", &[]);
        let peer: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(client_ip(&req, peer), "127.0.0.1");
    }

    #[test]
    fn test_strategy_keys() {
        let req = request("/ping?x=1", &[("x-real-ip", "198.51.100.2")]);

        assert_eq!(KeyStrategy::Ip.key(&req, peer()), "198.51.100.2");
        assert_eq!(KeyStrategy::Path.key(&req, peer()), "/ping");
        assert_eq!(KeyStrategy::Global.key(&req, peer()), "key");
    }

    #[test]
    fn test_rejection_response() {
        let response = too_many_requests(KeyStrategy::Path.rejection_message());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn test_middleware_rejects_over_limit() {
        let middleware = middleware(2, KeyStrategy::Path);
        let ping = request("/ping", &[]);
        let tang = request("/tang", &[]);

        assert!(middleware.check(&ping, peer()).is_ok());
        assert!(middleware.check(&ping, peer()).is_ok());

        let rejected = middleware.check(&ping, peer()).unwrap_err();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

        // Another path has its own limit
        assert!(middleware.check(&tang, peer()).is_ok());
    }

    #[test]
    fn test_global_strategy_shares_one_limit() {
        let middleware = middleware(1, KeyStrategy::Global);

        assert!(middleware.check(&request("/ping", &[]), peer()).is_ok());
        assert!(middleware.check(&request("/tang", &[]), peer()).is_err());
        assert_eq!(middleware.strategy(), KeyStrategy::Global);
    }
}
