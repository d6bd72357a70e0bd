//! Traits separating the admission primitives from the layers that consume them.

use async_trait::async_trait;

/// A single-key admission primitive.
///
/// Implemented by [`TokenBucket`](super::TokenBucket) and
/// [`SlidingWindow`](super::SlidingWindow) so that one
/// [`KeyedLimiterRegistry`](super::KeyedLimiterRegistry) can hold either.
#[async_trait]
pub trait Limiter: Send + Sync + 'static {
    /// Admit or reject one request. Never blocks.
    fn try_acquire(&self) -> bool;

    /// Whether dropping this limiter and creating a fresh one later would be
    /// indistinguishable to callers.
    fn is_idle(&self) -> bool {
        false
    }

    /// Stop any background work and wait until it has finished.
    async fn shutdown(&self) {}
}

/// The admission contract exposed to the HTTP middleware.
///
/// The middleware only ever sees a boolean per key; everything else about the
/// limiting strategy stays behind this trait.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether the request identified by `key` is admitted.
    fn allow(&self, key: &str) -> bool;

    /// Drop per-key state that no longer carries information.
    ///
    /// Returns the number of keys removed.
    fn purge_idle(&self) -> usize;

    /// Reject all further requests and wait for background work to stop.
    async fn shutdown(&self);
}
