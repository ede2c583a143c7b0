//! Per-key work queue with coalescing, delayed delivery and backoff
//!
//! A key is either idle, *ready* (waiting for a worker), *processing*
//! (checked out between [`WorkQueue::dequeue`] and [`WorkQueue::done`]) or
//! *waiting* for a delay to elapse. Enqueues of a ready key collapse into the
//! existing entry; enqueues of a processing key are remembered and delivered
//! once `done` is called, so one key is never handed to two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Exponential backoff: `min * 2^attempt`, capped at `max`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.min.saturating_mul(factor).min(self.max)
    }
}

/// One unit of work handed to a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileRequest<K> {
    pub key: K,
    /// Consecutive failed passes for this key so far
    pub retries: u32,
    /// Delay the key was scheduled with, when it came from a delayed enqueue
    pub requeue_after: Option<Duration>,
}

struct State<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, (Instant, Duration)>,
    scheduled: HashMap<K, Duration>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    /// Returns true when a worker should be woken
    fn add(&mut self, key: K) -> bool {
        if self.shutting_down || !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let due: Vec<K> = self
            .waiting
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut woke = false;
        for key in due {
            if let Some((_, delay)) = self.waiting.remove(&key) {
                self.scheduled.insert(key.clone(), delay);
                woke |= self.add(key);
            }
        }
        woke
    }
}

/// Work queue keyed by parent identity
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                scheduled: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `key` available immediately
    pub fn enqueue(&self, key: K) {
        if self.lock().add(key) {
            self.notify.notify_waiters();
        }
    }

    /// Make `key` available no earlier than `delay` from now.
    /// A key already waiting keeps the earlier of the two deadlines.
    pub fn enqueue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let keep_existing = state
                .waiting
                .get(&key)
                .map(|(existing, _)| *existing <= at)
                .unwrap_or(false);
            if !keep_existing {
                state.waiting.insert(key, (at, delay));
            }
        }
        // Sleeping workers recompute their next deadline.
        self.notify.notify_waiters();
    }

    /// Record a failed pass and schedule a retry; returns the chosen delay
    pub fn requeue_with_backoff(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.enqueue_after(key, delay);
        delay
    }

    /// Reset the failure count after a fully successful pass
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn retries(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys ready for a worker
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next ready key and check it out.
    /// Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<ReconcileRequest<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let retries = state.failures.get(&key).copied().unwrap_or(0);
                    let requeue_after = state.scheduled.remove(&key);
                    return Some(ReconcileRequest {
                        key,
                        retries,
                        requeue_after,
                    });
                }
                state.waiting.values().map(|(at, _)| *at).min()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Release a checked-out key; a re-enqueue seen meanwhile becomes ready now
    pub fn done(&self, key: &K) {
        let woke = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if woke {
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out work; blocked and future `dequeue` calls return `None`
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
