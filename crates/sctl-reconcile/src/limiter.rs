//! # Concurrency Limiter
//!
//! Bounds how many tasks of one resource kind run at once. A task holds a
//! [`LimiterPermit`] from before `Fetching` until after `Publishing`;
//! waiters are admitted in no particular order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default per-kind bound.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Semaphore-backed limiter that also tracks current and peak usage.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    max: usize,
}

impl ConcurrencyLimiter {
    /// A limiter admitting at most `max` holders (minimum 1).
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Wait for a slot. Returns `None` only if the limiter was closed.
    pub async fn acquire(&self) -> Option<LimiterPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Some(LimiterPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Stop admitting; pending and future `acquire` calls return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// The configured bound.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
