//! Deduplicating work queue for reconcile keys
//!
//! Keys added while already pending coalesce into one entry, and keys added
//! while being processed are re-queued when processing finishes. This keeps
//! at most one reconcile in flight per function no matter how many watch
//! events arrive, while guaranteeing that a change observed mid-reconcile
//! is not lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::cache::ObjectKey;

#[derive(Default)]
struct QueueState {
    /// Keys waiting to be handed to a worker, in arrival order
    pending: VecDeque<ObjectKey>,
    /// Keys that need processing (pending or awaiting re-queue)
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    processing: HashSet<ObjectKey>,
    /// Consecutive failed attempts per key, cleared on success
    retries: HashMap<ObjectKey, u32>,
    closed: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key as needing reconciliation.
    ///
    /// No-op if the key is already pending. If a worker currently holds the
    /// key it is re-queued once that worker calls [`WorkQueue::done`].
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.closed {
            return;
        }
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.pending.push_back(key);
        drop(state);
        self.wake.notify_one();
    }

    /// Wait for the next key, or `None` once the queue is closed and drained
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            // Created before the state check so a wakeup arriving between
            // the check and the await is not lost.
            let notified = self.wake.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.pending.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key after processing, re-queueing it if it was re-added
    /// while the worker held it
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.closed {
            state.pending.push_back(key.clone());
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Record a failed attempt and return the new consecutive count
    pub fn bump_retry(&self, key: &ObjectKey) -> u32 {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let count = state.retries.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, key: &ObjectKey) -> u32 {
        let state = self.state.lock().expect("queue lock poisoned");
        state.retries.get(key).copied().unwrap_or(0)
    }

    /// Clear the retry counter after a successful reconcile
    pub fn forget(&self, key: &ObjectKey) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.retries.remove(key);
    }

    /// Stop accepting keys and wake all waiting workers.
    ///
    /// Keys already pending are still handed out so in-flight work drains.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.closed = true;
        drop(state);
        self.wake.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue = WorkQueue::new();
        queue.add(key("figlet"));
        queue.add(key("figlet"));
        queue.add(key("figlet"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("figlet")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_in_arrival_order() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("b"));
        queue.add(key("c"));

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
        assert_eq!(queue.next().await, Some(key("c")));
    }

    #[tokio::test]
    async fn test_add_during_processing_requeues_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("figlet"));

        let held = queue.next().await.unwrap();
        // Change arrives while the worker holds the key.
        queue.add(key("figlet"));
        assert!(queue.is_empty(), "must not hand the same key to two workers");

        queue.done(&held);
        assert_eq!(queue.next().await, Some(key("figlet")));
    }

    #[tokio::test]
    async fn test_done_without_pending_change_queues_nothing() {
        let queue = WorkQueue::new();
        queue.add(key("figlet"));

        let held = queue.next().await.unwrap();
        queue.done(&held);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retry_counter_roundtrip() {
        let queue = WorkQueue::new();
        assert_eq!(queue.retry_count(&key("figlet")), 0);
        assert_eq!(queue.bump_retry(&key("figlet")), 1);
        assert_eq!(queue.bump_retry(&key("figlet")), 2);
        assert_eq!(queue.retry_count(&key("figlet")), 2);

        queue.forget(&key("figlet"));
        assert_eq!(queue.retry_count(&key("figlet")), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_worker() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        // Give the worker time to park on the queue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_keys_drain_after_close() {
        let queue = WorkQueue::new();
        queue.add(key("figlet"));
        queue.close();

        assert_eq!(queue.next().await, Some(key("figlet")));
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_add_after_close_is_ignored() {
        let queue = WorkQueue::new();
        queue.close();
        queue.add(key("figlet"));

        assert_eq!(queue.next().await, None);
    }
}
