//! Sliding window counter admission primitive.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::backend::{AdmissionBackend, Limiter};
use super::registry::KeyedLimiterRegistry;
use crate::error::ConfigError;

/// Parameters of a sliding window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Length of the trailing window
    pub window: Duration,
    /// Width of each counting slot
    pub resolution: Duration,
    /// Maximum admitted requests within any window
    pub limit: u64,
}

impl SlidingWindowConfig {
    /// Check the window, resolution and limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::InvalidWindow(self.window));
        }
        if self.resolution.is_zero() {
            return Err(ConfigError::InvalidResolution(self.resolution));
        }
        if self.resolution > self.window {
            return Err(ConfigError::ResolutionExceedsWindow {
                resolution: self.resolution,
                window: self.window,
            });
        }
        if self.limit == 0 {
            return Err(ConfigError::InvalidLimit(self.limit));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Slot {
    index: u64,
    count: u64,
}

#[derive(Debug, Default)]
struct WindowState {
    /// Ordered oldest first
    slots: VecDeque<Slot>,
    /// Sum of all counts in `slots`
    total: u64,
}

impl WindowState {
    /// Drop slots that started at or before `elapsed - window`.
    fn evict(&mut self, elapsed: u128, config: &SlidingWindowConfig) {
        let resolution = config.resolution.as_nanos();
        let window = config.window.as_nanos();
        while let Some(front) = self.slots.front() {
            if u128::from(front.index) * resolution + window > elapsed {
                break;
            }
            self.total -= front.count;
            self.slots.pop_front();
        }
    }
}

/// Request counts for one key, bucketed into fixed-resolution slots.
///
/// Slot indices are measured from a shared origin so that every key of a
/// [`SlidingWindowCounter`] agrees on slot boundaries.
#[derive(Debug)]
pub struct SlidingWindow {
    config: SlidingWindowConfig,
    origin: Instant,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// Create an empty window. `config` must already be validated.
    pub(crate) fn new(config: SlidingWindowConfig, origin: Instant) -> Self {
        Self {
            config,
            origin,
            state: Mutex::new(WindowState::default()),
        }
    }

    fn elapsed_at(&self, now: Instant) -> u128 {
        now.saturating_duration_since(self.origin).as_nanos()
    }

    /// Admit one request now if the window has room.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Admit one request at `now` if the window has room.
    ///
    /// Rejections leave the counts untouched.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let elapsed = self.elapsed_at(now);
        let current = (elapsed / self.config.resolution.as_nanos()) as u64;
        let mut state = self.state.lock();
        state.evict(elapsed, &self.config);

        if state.total >= self.config.limit {
            return false;
        }

        match state.slots.back_mut() {
            Some(slot) if slot.index == current => slot.count += 1,
            _ => state.slots.push_back(Slot {
                index: current,
                count: 1,
            }),
        }
        state.total += 1;
        true
    }

    /// Number of admitted requests still inside the window at `now`.
    pub fn count_at(&self, now: Instant) -> u64 {
        let elapsed = self.elapsed_at(now);
        let mut state = self.state.lock();
        state.evict(elapsed, &self.config);
        state.total
    }

    /// Get the window parameters.
    pub fn config(&self) -> SlidingWindowConfig {
        self.config
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    fn try_acquire(&self) -> bool {
        SlidingWindow::try_acquire(self)
    }

    fn is_idle(&self) -> bool {
        self.count_at(Instant::now()) == 0
    }
}

/// Keyed sliding window counter.
///
/// Each key gets its own [`SlidingWindow`], created on first use. Activity on
/// one key never affects another.
pub struct SlidingWindowCounter {
    config: SlidingWindowConfig,
    origin: Instant,
    windows: KeyedLimiterRegistry<SlidingWindow>,
}

impl SlidingWindowCounter {
    /// Create a counter. `config` must already be validated.
    pub(crate) fn new(config: SlidingWindowConfig) -> Self {
        let origin = Instant::now();
        Self {
            config,
            origin,
            windows: KeyedLimiterRegistry::new(move |_key: &str| SlidingWindow::new(config, origin)),
        }
    }

    /// Admit or reject one request for `key`.
    pub fn take(&self, key: &str) -> bool {
        self.take_at(key, Instant::now())
    }

    /// Admit or reject one request for `key` at an explicit instant.
    pub fn take_at(&self, key: &str, now: Instant) -> bool {
        let accepted = self
            .windows
            .with_limiter(key, |window| window.try_acquire_at(now))
            .unwrap_or(false);
        trace!(key = %key, accepted, "Sliding window take");
        accepted
    }

    /// Get the instant slot indices are measured from.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Get the window parameters.
    pub fn config(&self) -> SlidingWindowConfig {
        self.config
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Remove keys with no requests left inside their window.
    pub fn purge_idle(&self) -> usize {
        self.windows.purge_idle()
    }
}

#[async_trait]
impl AdmissionBackend for SlidingWindowCounter {
    fn allow(&self, key: &str) -> bool {
        self.take(key)
    }

    fn purge_idle(&self) -> usize {
        SlidingWindowCounter::purge_idle(self)
    }

    async fn shutdown(&self) {
        self.windows.shutdown().await;
    }
}
