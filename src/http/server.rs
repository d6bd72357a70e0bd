//! HTTP server fronted by the rate limiting middleware.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::middleware::RateLimitMiddleware;
use crate::error::Result;

/// How long in-flight connections may finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// HTTP/1 server that runs every request through a [`RateLimitMiddleware`].
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// Admission check applied before routing
    middleware: Arc<RateLimitMiddleware>,
}

impl HttpServer {
    /// Bind the server to `addr`.
    pub async fn bind(addr: SocketAddr, middleware: Arc<RateLimitMiddleware>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            middleware,
        })
    }

    /// Get the address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until `signal` resolves.
    ///
    /// After the signal no new connections are accepted; open connections get
    /// [`SHUTDOWN_GRACE`] to finish before they are dropped.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            strategy = %self.middleware.strategy(),
            "HTTP server is starting"
        );

        tokio::pin!(signal);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("HTTP server is shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let middleware = Arc::clone(&self.middleware);
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, middleware).await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                remaining = connections.len(),
                "Dropping connections still open after grace period"
            );
            connections.abort_all();
        }

        info!(addr = %addr, "HTTP server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    middleware: Arc<RateLimitMiddleware>,
) -> Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let response = handle(&req, peer, &middleware);
        async move { Ok::<_, Infallible>(response) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await?;
    Ok(())
}

/// Log, rate limit, then route one request.
pub(crate) fn handle<B>(
    req: &Request<B>,
    peer: SocketAddr,
    middleware: &RateLimitMiddleware,
) -> Response<Full<Bytes>> {
    let started = Instant::now();

    let response = match middleware.check(req, peer) {
        Ok(()) => route(req),
        Err(rejected) => rejected,
    };

    info!(
        method = %req.method(),
        path = %req.uri().path(),
        peer = %peer,
        status = response.status().as_u16(),
        elapsed = ?started.elapsed(),
        "Handled request"
    );
    response
}

fn route<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/ping" => text(StatusCode::OK, "pong"),
        "/tang" => text(StatusCode::OK, "huru"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::http::KeyStrategy;
    use crate::ratelimit::TokenBucketBuilder;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn peer() -> SocketAddr {
        "10.1.2.3:40000".parse().unwrap()
    }

    fn bucket_middleware(capacity: u64, strategy: KeyStrategy) -> Arc<RateLimitMiddleware> {
        let registry = TokenBucketBuilder::new()
            .capacity(capacity)
            .refill_tokens(1)
            .refill_period(Duration::from_secs(3600))
            .build_registry()
            .unwrap();
        Arc::new(RateLimitMiddleware::new(Arc::new(registry), strategy))
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_routes() {
        let middleware = bucket_middleware(10, KeyStrategy::Path);

        let ping = handle(&Request::get("/ping").body(()).unwrap(), peer(), &middleware);
        assert_eq!(ping.status(), StatusCode::OK);
        assert_eq!(body_string(ping).await, "pong");

        let tang = handle(&Request::get("/tang").body(()).unwrap(), peer(), &middleware);
        assert_eq!(body_string(tang).await, "huru");

        let missing = handle(&Request::get("/nope").body(()).unwrap(), peer(), &middleware);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handle_rejects_when_limited() {
        let middleware = bucket_middleware(1, KeyStrategy::Ip);
        let req = Request::get("/ping").body(()).unwrap();

        assert_eq!(handle(&req, peer(), &middleware).status(), StatusCode::OK);

        let rejected = handle(&req, peer(), &middleware);
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(rejected).await, "IP Rate limit exceeded");

        // A different client has its own bucket
        let other: SocketAddr = "10.9.9.9:40000".parse().unwrap();
        assert_eq!(handle(&req, other, &middleware).status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_server_end_to_end() {
        let middleware = bucket_middleware(1, KeyStrategy::Global);
        let server = HttpServer::bind("127.0.0.1:0".parse().unwrap(), middleware)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_with_shutdown(async {
            let _ = shutdown_rx.await;
        }));

        let first = get(addr, "/ping").await;
        assert!(first.starts_with("HTTP/1.1 200 OK"), "{}", first);
        assert!(first.ends_with("pong"), "{}", first);

        let second = get(addr, "/tang").await;
        assert!(second.starts_with("HTTP/1.1 429"), "{}", second);
        assert!(second.ends_with("Server is Busy.."), "{}", second);

        shutdown_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"\x00\x01 not http\r\n\r\n").await.unwrap();

        let (stream, peer) = listener.accept().await.unwrap();
        let middleware = bucket_middleware(1, KeyStrategy::Global);
        let result = serve_connection(stream, peer, middleware).await;

        assert!(matches!(result, Err(FloodgateError::Http(_))), "{:?}", result);
    }
}
