//! Deduplicating, delay-aware work queue keyed by object identity.
//!
//! - At most one pending entry per key; the earliest due time wins.
//! - A dequeued key is leased until [`WorkQueue::release`]. Enqueues during
//!   the lease are held back and become pending on release.
//! - Delays are timers, not polling.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct State<K> {
    pending: HashMap<K, Instant>,
    leased: HashSet<K>,
    deferred: HashMap<K, Instant>,
    closed: bool,
}

/// Work queue shared by the dispatcher and the workers.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    changed: Notify,
}

fn keep_earliest<K: Eq + Hash>(map: &mut HashMap<K, Instant>, key: K, due: Instant) -> bool {
    match map.get_mut(&key) {
        Some(existing) if *existing <= due => false,
        Some(existing) => {
            *existing = due;
            true
        }
        None => {
            map.insert(key, due);
            true
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                leased: HashSet::new(),
                deferred: HashMap::new(),
                closed: false,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `key` due now.
    pub fn enqueue(&self, key: K) {
        self.enqueue_at(key, Instant::now());
    }

    /// Make `key` due after `delay`, unless it is already due earlier.
    pub fn enqueue_after(&self, key: K, delay: Duration) {
        self.enqueue_at(key, Instant::now() + delay);
    }

    fn enqueue_at(&self, key: K, due: Instant) {
        let woke = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if state.leased.contains(&key) {
                keep_earliest(&mut state.deferred, key, due);
                false
            } else {
                keep_earliest(&mut state.pending, key, due)
            }
        };
        if woke {
            self.changed.notify_waiters();
        }
    }

    /// Wait for the next due, unleased key and lease it.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                let ready = state
                    .pending
                    .iter()
                    .filter(|(_, due)| **due <= now)
                    .min_by_key(|(_, due)| **due)
                    .map(|(key, _)| key.clone());
                if let Some(key) = ready {
                    state.pending.remove(&key);
                    state.leased.insert(key.clone());
                    return Some(key);
                }
                state.pending.values().min().copied()
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// End the lease on `key`. Enqueues that arrived meanwhile become pending.
    pub fn release(&self, key: &K) {
        let woke = {
            let mut state = self.lock();
            state.leased.remove(key);
            match state.deferred.remove(key) {
                Some(due) => keep_earliest(&mut state.pending, key.clone(), due),
                None => false,
            }
        };
        if woke {
            self.changed.notify_waiters();
        }
    }

    /// Drop any pending or deferred entry for `key`.
    pub fn forget(&self, key: &K) {
        let mut state = self.lock();
        state.pending.remove(key);
        state.deferred.remove(key);
    }

    /// Wake every waiting worker and make `dequeue` return `None`.
    pub fn shutdown(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    /// Number of pending entries, including ones not yet due.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Due time of the pending entry for `key`.
    pub fn due(&self, key: &K) -> Option<Instant> {
        self.lock().pending.get(key).copied()
    }

    pub fn is_leased(&self, key: &K) -> bool {
        self.lock().leased.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_enqueues_coalesce() {
        let q = WorkQueue::new();
        q.enqueue("a");
        q.enqueue("a");
        q.enqueue("a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().await, Some("a"));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_due_time_wins() {
        let q = WorkQueue::new();
        let start = Instant::now();
        q.enqueue_after("a", Duration::from_secs(30));
        q.enqueue_after("a", Duration::from_secs(10));
        q.enqueue_after("a", Duration::from_secs(20));
        assert_eq!(q.due(&"a"), Some(start + Duration::from_secs(10)));

        q.enqueue("a");
        assert_eq!(q.due(&"a"), Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_entry_waits_for_its_timer() {
        let q = WorkQueue::new();
        let start = Instant::now();
        q.enqueue_after("a", Duration::from_secs(10));
        assert_eq!(q.dequeue().await, Some("a"));
        assert!(Instant::now() >= start + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_defers_enqueue_until_release() {
        let q = Arc::new(WorkQueue::new());
        q.enqueue("a");
        assert_eq!(q.dequeue().await, Some("a"));
        assert!(q.is_leased(&"a"));

        q.enqueue("a");
        assert!(q.is_empty());

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        q.release(&"a");
        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueues_during_lease_redeliver_once() {
        let q = WorkQueue::new();
        q.enqueue("a");
        assert_eq!(q.dequeue().await, Some("a"));

        for _ in 0..5 {
            q.enqueue("a");
        }
        q.release(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().await, Some("a"));
        assert!(q.is_empty());

        q.release(&"a");
        let next = tokio::time::timeout(Duration::from_secs(60), q.dequeue()).await;
        assert!(next.is_err(), "nothing left to deliver");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_block_each_other() {
        let q = WorkQueue::new();
        q.enqueue("a");
        q.enqueue("b");
        let first = q.dequeue().await.unwrap();
        let second = q.dequeue().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_enqueue_wakes_sleeper() {
        let q = Arc::new(WorkQueue::new());
        let start = Instant::now();
        q.enqueue_after("a", Duration::from_secs(60));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::task::yield_now().await;
        q.enqueue("b");
        assert_eq!(waiter.await.unwrap(), Some("b"));
        assert!(Instant::now() < start + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_waiters() {
        let q = Arc::new(WorkQueue::<&str>::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.dequeue().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
