//! Producer/consumer work queue
//!
//! One mutex and one condition variable guarding a FIFO and a `running`
//! flag. Producers append and notify. The single consumer blocks while the
//! queue is empty, then takes every queued item at once and processes them
//! in order outside the lock, so a producer running on the event-pump thread
//! only ever holds the lock for a push.
//!
//! Used for both the per-Device inbound frame queue and the hotplug event
//! queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct State<T> {
    items: VecDeque<T>,
    running: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                running: true,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A consumer that panicked mid-batch leaves the queue itself intact
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake the consumer
    ///
    /// Returns `false` (dropping the item) once the queue has been stopped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if !state.running {
            return false;
        }
        state.items.push_back(item);
        self.ready.notify_all();
        true
    }

    /// Block until items are available, then take all of them in FIFO order
    ///
    /// Returns `None` once the queue is stopped; items still queued at that
    /// point are discarded by [`WorkQueue::stop`].
    pub fn wait_batch(&self) -> Option<VecDeque<T>> {
        let mut state = self.lock();
        loop {
            if !state.running {
                return None;
            }
            if !state.items.is_empty() {
                return Some(std::mem::take(&mut state.items));
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Clear `running`, discard pending items and wake the consumer
    ///
    /// Idempotent. Returns the number of discarded items.
    pub fn stop(&self) -> usize {
        let mut state = self.lock();
        state.running = false;
        let discarded = state.items.len();
        state.items.clear();
        self.ready.notify_all();
        discarded
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_batch_preserves_fifo_order() {
        let queue = WorkQueue::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));

        let batch = queue.wait_batch().unwrap();
        assert_eq!(batch.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_batch())
        };

        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_push_after_stop_is_rejected() {
        let queue = WorkQueue::new();
        queue.push("a");
        assert_eq!(queue.stop(), 1);
        assert!(!queue.push("b"));
        assert!(!queue.is_running());
        assert_eq!(queue.stop(), 0);
    }

    #[test]
    fn test_items_pushed_before_consumer_waits_are_not_lost() {
        let queue = Arc::new(WorkQueue::new());
        queue.push(7);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_batch())
        };
        let batch = consumer.join().unwrap().unwrap();
        assert_eq!(batch.front(), Some(&7));
    }
}
