//! Clock abstraction for ledger timestamps and retry scheduling.
//!
//! Workers, queues and dispatchers take an `Arc<dyn Clock>` so backoff
//! timing can be driven by hand in tests.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of time for the delivery subsystem.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time for ledger rows and retry schedules.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Hand-driven clock for tests.
///
/// Time only moves through `advance` or `sleep`; sleeping advances the clock
/// and yields instead of waiting.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    base: Instant,
    elapsed: Duration,
    wall: DateTime<Utc>,
}

impl ManualClock {
    /// Creates a clock frozen at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock frozen at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                elapsed: Duration::ZERO,
                wall: start,
            })),
        }
    }

    /// Moves both clocks forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.elapsed += by;
        state.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.base + state.elapsed
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).wall
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
