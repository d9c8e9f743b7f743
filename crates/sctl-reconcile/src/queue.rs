//! # Work Queue
//!
//! De-duplicating queue of objects awaiting reconciliation.
//!
//! - An object is queued at most once. Adding an object that is being
//!   processed marks it dirty; it is re-queued when processing finishes,
//!   so the same object is never reconciled by two tasks at once.
//! - Delayed adds keep only the earliest deadline per object. An
//!   immediate add supersedes a pending delayed one.
//! - [`WorkQueue::add_rate_limited`] delays by an exponential backoff on
//!   the object's consecutive failures: 1s, 2s, 4s, ... capped at 5 minutes.
//!   [`WorkQueue::forget`] resets it after a success.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use sctl_core::ObjectRef;

/// Backoff after the first failure.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Backoff for the `failures`-th consecutive failure (1-based).
pub fn backoff_for(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BASE_BACKOFF.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjectRef>,
    queued: HashSet<ObjectRef>,
    processing: HashSet<ObjectRef>,
    dirty: HashSet<ObjectRef>,
    delayed: BTreeMap<(Instant, u64), ObjectRef>,
    deadlines: HashMap<ObjectRef, (Instant, u64)>,
    failures: HashMap<ObjectRef, u32>,
    seq: u64,
    shutting_down: bool,
}

impl QueueState {
    fn enqueue(&mut self, id: ObjectRef) -> bool {
        if self.processing.contains(&id) {
            self.dirty.insert(id);
            return false;
        }
        if self.queued.insert(id.clone()) {
            self.ready.push_back(id);
            return true;
        }
        false
    }

    fn cancel_delay(&mut self, id: &ObjectRef) {
        if let Some(key) = self.deadlines.remove(id) {
            self.delayed.remove(&key);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.deadlines.remove(&id);
            self.enqueue(id);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(at, _)| *at)
    }
}

/// De-duplicating, delay-capable work queue.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` now, dropping any delayed add for it.
    pub fn add(&self, id: ObjectRef) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        state.cancel_delay(&id);
        if state.enqueue(id) {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Queue `id` after `delay`.
    pub fn add_after(&self, id: ObjectRef, delay: Duration) {
        if delay.is_zero() {
            self.add(id);
            return;
        }
        let at = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if let Some(existing) = state.deadlines.get(&id).copied() {
            if existing.0 <= at {
                return;
            }
            state.delayed.remove(&existing);
        }
        state.seq += 1;
        let key = (at, state.seq);
        state.delayed.insert(key, id.clone());
        state.deadlines.insert(id, key);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Queue `id` after its next backoff delay. Returns the delay.
    pub fn add_rate_limited(&self, id: ObjectRef) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(id.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            backoff_for(*failures)
        };
        self.add_after(id, delay);
        delay
    }

    /// Reset the failure count of `id`.
    pub fn forget(&self, id: &ObjectRef) {
        self.state.lock().failures.remove(id);
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: &ObjectRef) -> u32 {
        self.state.lock().failures.get(id).copied().unwrap_or(0)
    }

    /// Wait for the next ready object and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down and drained of ready
    /// items. Every `Some` must be matched by a call to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ObjectRef> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());
                if let Some(id) = state.ready.pop_front() {
                    state.queued.remove(&id);
                    state.processing.insert(id.clone());
                    return Some(id);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `id`, re-queueing it if it was added meanwhile.
    pub fn done(&self, id: &ObjectRef) {
        let mut state = self.state.lock();
        state.processing.remove(id);
        if state.dirty.remove(id) && !state.shutting_down && state.enqueue(id.clone()) {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting work and wake every waiter.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Ready plus delayed items.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delayed.len()
    }

    /// Whether nothing is ready or delayed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
