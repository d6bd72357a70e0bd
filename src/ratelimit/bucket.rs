//! Token bucket admission primitive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::backend::Limiter;
use crate::error::{ConfigError, LimiterError};

/// Parameters of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens held at once
    pub capacity: u64,
    /// Tokens added on every refill tick
    pub refill_tokens: u64,
    /// Time between refill ticks
    pub refill_period: Duration,
}

impl TokenBucketConfig {
    /// Check that every parameter is strictly positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }
        if self.refill_tokens == 0 {
            return Err(ConfigError::InvalidRefillTokens(self.refill_tokens));
        }
        if self.refill_period.is_zero() {
            return Err(ConfigError::InvalidRefillPeriod(self.refill_period));
        }
        Ok(())
    }
}

/// The bounded pool shared between consumers and the refill task.
///
/// An atomic counter with a capacity ceiling: removal fails on underflow and
/// additions beyond capacity are dropped. Neither side ever waits.
#[derive(Debug)]
pub(crate) struct TokenPool {
    available: AtomicU64,
    capacity: u64,
    closed: AtomicBool,
}

impl TokenPool {
    pub(crate) fn full(capacity: u64) -> Self {
        Self {
            available: AtomicU64::new(capacity),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Remove one token if one is available and the pool is still open.
    pub(crate) fn try_take(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Add up to `tokens`, dropping whatever would exceed capacity.
    ///
    /// Returns the number of tokens actually added.
    pub(crate) fn refill(&self, tokens: u64) -> u64 {
        let capacity = self.capacity;
        match self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then(|| n.saturating_add(tokens).min(capacity))
            }) {
            Ok(previous) => previous.saturating_add(tokens).min(capacity) - previous,
            Err(_) => 0,
        }
    }

    pub(crate) fn available(&self) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            0
        } else {
            self.available.load(Ordering::Acquire)
        }
    }

    /// Mark the pool closed. Returns `false` if it already was.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.store(0, Ordering::Release);
    }
}

/// A token bucket with a background refill task.
///
/// The bucket starts full. Each call to [`try_acquire`](Self::try_acquire)
/// removes one token without waiting; a refill task owned by the bucket adds
/// `refill_tokens` every `refill_period` on a fixed cadence, dropping any excess
/// over capacity.
///
/// Dropping the bucket stops its refill task. Call [`close`](Self::close) and
/// then await [`stopped`](Self::stopped) for coordinated shutdown.
#[derive(Debug)]
pub struct TokenBucket {
    /// Diagnostic label
    name: String,
    config: TokenBucketConfig,
    pool: Arc<TokenPool>,
    /// Flipped to `true` by `close`; dropping it also stops the refill task
    shutdown: watch::Sender<bool>,
    /// Becomes `true` once the refill task has exited
    stopped: watch::Receiver<bool>,
}

impl TokenBucket {
    /// Create a full bucket and spawn its refill task on `handle`.
    ///
    /// `config` must already be validated.
    pub(crate) fn spawn(name: impl Into<String>, config: TokenBucketConfig, handle: &Handle) -> Self {
        let name = name.into();
        let pool = Arc::new(TokenPool::full(config.capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let _enter = handle.enter();
        let start = Instant::now() + config.refill_period;
        handle.spawn(run_refill(
            name.clone(),
            Arc::clone(&pool),
            config,
            start,
            shutdown_rx,
            stopped_tx,
        ));

        debug!(
            name = %name,
            capacity = config.capacity,
            refill_tokens = config.refill_tokens,
            refill_period = ?config.refill_period,
            "Token bucket filled to capacity"
        );

        Self {
            name,
            config,
            pool,
            shutdown: shutdown_tx,
            stopped: stopped_rx,
        }
    }

    /// Attempt to remove one token. Returns `false` immediately when the bucket
    /// is empty or closed.
    pub fn try_acquire(&self) -> bool {
        let acquired = self.pool.try_take();
        trace!(name = %self.name, acquired, "Token bucket consume");
        acquired
    }

    /// Stop the refill task and release the token pool.
    ///
    /// Consumption fails from this point on. Closing an already closed bucket
    /// is a caller bug and is reported as [`LimiterError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), LimiterError> {
        if !self.pool.close() {
            warn!(name = %self.name, "Token bucket closed twice");
            return Err(LimiterError::AlreadyClosed {
                name: self.name.clone(),
            });
        }
        // The refill task may already be gone if the runtime shut down.
        let _ = self.shutdown.send(true);
        info!(name = %self.name, "Closing token bucket");
        Ok(())
    }

    /// Wait until the refill task has terminated.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // A dropped sender means the task is gone as well.
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Whether the refill task has terminated.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow() || self.stopped.has_changed().is_err()
    }

    /// Get the bucket's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the maximum number of tokens.
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Get the number of tokens added per tick.
    pub fn refill_tokens(&self) -> u64 {
        self.config.refill_tokens
    }

    /// Get the time between refill ticks.
    pub fn refill_period(&self) -> Duration {
        self.config.refill_period
    }

    /// Get the number of tokens currently available. Always zero once closed.
    pub fn available(&self) -> u64 {
        self.pool.available()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn try_acquire(&self) -> bool {
        TokenBucket::try_acquire(self)
    }

    /// A full bucket carries no state a fresh bucket would not.
    fn is_idle(&self) -> bool {
        self.available() == self.capacity()
    }

    async fn shutdown(&self) {
        let _ = self.close();
        self.stopped().await;
    }
}

/// Refill loop owned by one bucket.
///
/// Ticks on a fixed cadence starting one period after creation. Exits when the
/// bucket is closed or dropped, then releases the pool and signals completion.
async fn run_refill(
    name: String,
    pool: Arc<TokenPool>,
    config: TokenBucketConfig,
    start: Instant,
    mut shutdown: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
) {
    let mut ticker = time::interval_at(start, config.refill_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let added = pool.refill(config.refill_tokens);
                trace!(
                    name = %name,
                    added,
                    dropped = config.refill_tokens - added,
                    "Refilled token bucket"
                );
            }
        }
    }

    pool.release();
    let _ = stopped.send(true);
    debug!(name = %name, "Token refill task has terminated");
}
