//! Shared work queue with completion counting.
//!
//! Workers pop until the queue is drained: nothing pending *and* nothing in
//! flight. Counting in-flight items keeps a worker from exiting while another
//! worker may still put a retry back.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct QueueState<T> {
    pending: VecDeque<T>,
    in_flight: usize,
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    changed: Notify,
}

/// Marks one popped item as in flight until dropped.
///
/// Dropping it (also during a panic unwind) completes the item and wakes
/// waiting workers. Re-push a retry before letting the guard go.
#[must_use = "the item is completed as soon as the guard is dropped"]
pub struct InFlight<'a, T> {
    queue: &'a WorkQueue<T>,
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        {
            let mut state = self.queue.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.queue.changed.notify_waiters();
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().pending.push_back(item);
        self.changed.notify_waiters();
    }

    /// Take the next item, waiting while other items are in flight.
    ///
    /// Returns `None` once the queue is drained. The item stays in flight
    /// until the returned [`InFlight`] guard is dropped.
    pub async fn pop(&self) -> Option<(T, InFlight<'_, T>)> {
        loop {
            let changed = {
                let mut state = self.lock();
                if let Some(item) = state.pending.pop_front() {
                    state.in_flight += 1;
                    return Some((item, InFlight { queue: self }));
                }
                if state.in_flight == 0 {
                    return None;
                }

                // Created under the lock: any later push or completion wakes us.
                self.changed.notified()
            };
            changed.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drained_queue_returns_none() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        assert!(queue.pop().await.is_none());

        queue.push(1);
        assert_eq!(queue.pending(), 1);
        let (item, done) = queue.pop().await.unwrap();
        assert_eq!(item, 1);
        drop(done);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_waiter_sees_requeued_item() {
        let queue = Arc::new(WorkQueue::new());
        queue.push("retry-me");
        let (first, done) = queue.pop().await.unwrap();
        assert_eq!(first, "retry-me");

        // A second worker must wait rather than exit while an item is in flight.
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(|(item, _)| item) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push("retry-me");
        drop(done);

        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, Some("retry-me"));
    }

    #[tokio::test]
    async fn test_waiter_exits_when_last_item_completes() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(7u8);
        let (item, done) = queue.pop().await.unwrap();
        assert_eq!(item, 7);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(|(item, _)| item) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(done);

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_panicking_holder_still_completes_item() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(1u8);
        queue.push(2u8);

        let crashed = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let (_item, _done) = queue.pop().await.unwrap();
                panic!("worker died while holding an item");
            })
        };
        assert!(crashed.await.unwrap_err().is_panic());

        let (item, done) = queue.pop().await.unwrap();
        assert_eq!(item, 2);
        drop(done);

        let drained = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .unwrap();
        assert!(drained.is_none());
    }
}
