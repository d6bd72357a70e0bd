//! Per-key limiter registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, trace};

use super::backend::{AdmissionBackend, Limiter};

type Factory<L> = Box<dyn Fn(&str) -> L + Send + Sync>;

/// Maps each observed key to its own lazily created limiter.
///
/// Lookups of known keys only take a shard's shared lock. Creating a limiter
/// for a new key takes that shard's exclusive lock and re-checks for the key,
/// so concurrent first requests for one key build exactly one limiter while
/// keys in other shards proceed untouched.
///
/// The registry owns every limiter it creates and stops them all in
/// [`shutdown`](Self::shutdown).
pub struct KeyedLimiterRegistry<L: Limiter> {
    /// Limiters indexed by key
    limiters: DashMap<String, Arc<L>>,
    /// Builds the limiter for a new key
    factory: Factory<L>,
    closed: AtomicBool,
}

impl<L: Limiter> KeyedLimiterRegistry<L> {
    /// Create an empty registry that builds limiters with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> L + Send + Sync + 'static,
    {
        Self {
            limiters: DashMap::new(),
            factory: Box::new(factory),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit or reject one request for `key`, creating its limiter on first use.
    ///
    /// Always `false` once the registry has been shut down.
    pub fn allow(&self, key: &str) -> bool {
        let allowed = self
            .with_limiter(key, |limiter| limiter.try_acquire())
            .unwrap_or(false);

        if !allowed {
            debug!(key = %key, "Request rejected");
        }
        allowed
    }

    /// Run `f` against the limiter for `key`, creating it if absent.
    ///
    /// Returns `None` once the registry has been shut down.
    pub fn with_limiter<R>(&self, key: &str, f: impl FnOnce(&L) -> R) -> Option<R> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // The shard guard must be released before taking the entry lock below.
        let existing = self.limiters.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(limiter) = existing {
            trace!(key = %key, "Using existing limiter");
            return Some(f(&limiter));
        }

        let limiter = match self.limiters.entry(key.to_owned()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                // Checked again under the shard lock so shutdown never misses it.
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
                let limiter = Arc::new((self.factory)(key));
                entry.insert(Arc::clone(&limiter));
                debug!(key = %key, "Creating new limiter");
                limiter
            }
        };

        Some(f(&limiter))
    }

    /// Get the limiter registered for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<L>> {
        self.limiters.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a limiter exists for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.limiters.contains_key(key)
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no limiter has been created yet.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop limiters that a fresh limiter would replace without visible change.
    ///
    /// A request already holding a purged limiter finishes against it; its
    /// background work stops when the last reference is dropped.
    pub fn purge_idle(&self) -> usize {
        let before = self.limiters.len();
        self.limiters.retain(|_, limiter| !limiter.is_idle());
        let purged = before.saturating_sub(self.limiters.len());
        if purged > 0 {
            debug!(purged, remaining = self.limiters.len(), "Purged idle limiters");
        }
        purged
    }

    /// Reject all further requests, then stop every limiter and wait for each
    /// to finish.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<String> = self
            .limiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let drained: Vec<Arc<L>> = keys
            .iter()
            .filter_map(|key| self.limiters.remove(key).map(|(_, limiter)| limiter))
            .collect();

        info!(limiters = drained.len(), "Shutting down limiter registry");
        join_all(drained.iter().map(|limiter| limiter.shutdown())).await;
        info!("Limiter registry stopped");
    }
}

#[async_trait]
impl<L: Limiter> AdmissionBackend for KeyedLimiterRegistry<L> {
    fn allow(&self, key: &str) -> bool {
        KeyedLimiterRegistry::allow(self, key)
    }

    fn purge_idle(&self) -> usize {
        KeyedLimiterRegistry::purge_idle(self)
    }

    async fn shutdown(&self) {
        KeyedLimiterRegistry::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bucket::{TokenBucket, TokenBucketConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;
    use tokio::runtime::Handle;

    /// Admits a fixed number of requests and counts how often it was built.
    struct CountingLimiter {
        remaining: AtomicU64,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl Limiter for CountingLimiter {
        fn try_acquire(&self) -> bool {
            self.remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
        }

        fn is_idle(&self) -> bool {
            self.remaining.load(Ordering::Acquire) == 3
        }

        async fn shutdown(&self) {
            self.stopped.store(true, Ordering::Release);
        }
    }

    fn counting_registry(created: Arc<AtomicUsize>) -> KeyedLimiterRegistry<CountingLimiter> {
        KeyedLimiterRegistry::new(move |_key: &str| {
            created.fetch_add(1, Ordering::SeqCst);
            CountingLimiter {
                remaining: AtomicU64::new(3),
                stopped: AtomicBool::new(false),
            }
        })
    }

    fn bucket_registry(capacity: u64) -> KeyedLimiterRegistry<TokenBucket> {
        let handle = Handle::current();
        let config = TokenBucketConfig {
            capacity,
            refill_tokens: 1,
            refill_period: Duration::from_secs(3600),
        };
        KeyedLimiterRegistry::new(move |key: &str| TokenBucket::spawn(key, config, &handle))
    }

    #[test]
    fn test_registry_creation() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        assert!(registry.is_empty());
        assert!(!registry.is_closed());
    }

    #[test]
    fn test_allow_creates_limiter_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(Arc::clone(&created));

        assert!(registry.allow("a"));
        assert!(registry.allow("a"));
        assert!(registry.allow("a"));
        assert!(!registry.allow("a"));

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("a"));
    }

    #[test]
    fn test_keys_are_isolated() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));

        for _ in 0..3 {
            assert!(registry.allow("a"));
        }
        assert!(!registry.allow("a"));

        // "b" is unaffected by "a" being exhausted
        for _ in 0..3 {
            assert!(registry.allow("b"));
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_limiter() {
        let created = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(Arc::clone(&created)));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.allow("new-key")
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        // One shared limiter: exactly its three permits were handed out
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_purge_idle() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        registry.allow("busy");
        registry.with_limiter("idle", |_| ());

        assert_eq!(registry.purge_idle(), 1);
        assert!(registry.contains_key("busy"));
        assert!(!registry.contains_key("idle"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_limiters() {
        let registry = counting_registry(Arc::new(AtomicUsize::new(0)));
        registry.allow("a");
        registry.allow("b");
        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();

        registry.shutdown().await;

        assert!(a.stopped.load(Ordering::Acquire));
        assert!(b.stopped.load(Ordering::Acquire));
        assert!(registry.is_empty());
        assert!(!registry.allow("a"));
        assert!(!registry.allow("c"));
        assert!(registry.is_empty());

        // A second shutdown is a no-op
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_registry_per_key_capacity() {
        let registry = bucket_registry(2);

        assert!(registry.allow("10.0.0.1"));
        assert!(registry.allow("10.0.0.1"));
        assert!(!registry.allow("10.0.0.1"));
        assert!(registry.allow("10.0.0.2"));

        assert_eq!(registry.get("10.0.0.1").unwrap().name(), "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_registry_shutdown_waits_for_refill_tasks() {
        let registry = bucket_registry(2);
        registry.allow("a");
        registry.allow("b");
        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();

        registry.shutdown().await;

        assert!(a.is_closed() && a.is_stopped());
        assert!(b.is_closed() && b.is_stopped());
        assert_eq!(a.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_registry_purges_full_buckets() {
        let registry = bucket_registry(2);
        registry.with_limiter("untouched", |_| ());
        registry.allow("used");

        assert_eq!(registry.purge_idle(), 1);
        assert!(registry.contains_key("used"));
    }
}
