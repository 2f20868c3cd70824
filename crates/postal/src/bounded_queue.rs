//! A thread-safe FIFO capped by both item count and aggregate byte count.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Anything pushed into a [`BoundedQueue`] must be able to report its own
/// accounted size in bytes.
pub trait ByteSized {
    fn byte_size(&self) -> usize;
}

struct Inner<T> {
    items: VecDeque<T>,
    current_bytes: usize,
    max_items: usize,
    max_bytes: usize,
    halted: bool,
}

/// A bounded, thread-safe FIFO queue.
///
/// `push` never blocks: it fails immediately if the queue is at its item
/// cap, or if adding the item would exceed the byte cap *and* the queue is
/// non-empty (a single oversized item is admitted into an otherwise-empty
/// queue; this is the one exception to the byte cap).
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    condvar: Condvar,
}

impl<T: ByteSized> BoundedQueue<T> {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                current_bytes: 0,
                max_items,
                max_bytes,
                halted: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Non-blocking. Returns `false` without mutating the queue if it is full.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= inner.max_items {
            return false;
        }
        let size = item.byte_size();
        if inner.current_bytes + size >= inner.max_bytes && !inner.items.is_empty() {
            return false;
        }
        inner.current_bytes += size;
        inner.items.push_back(item);
        drop(inner);
        self.condvar.notify_one();
        true
    }

    /// Blocks up to `max_wait` for an item. Returns `None` on timeout, on a
    /// lost wake-up race, or if the queue has been [`halt`](Self::halt)ed.
    pub fn pop(&self, max_wait: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.is_empty() {
            if max_wait.is_zero() {
                return None;
            }
            let deadline = Instant::now() + max_wait;
            loop {
                if inner.halted {
                    return None;
                }
                if !inner.items.is_empty() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let (guard, timeout_result) = self
                    .condvar
                    .wait_timeout(inner, deadline - now)
                    .unwrap();
                inner = guard;
                if timeout_result.timed_out() && inner.items.is_empty() {
                    return None;
                }
            }
        }
        let item = inner.items.pop_front();
        if let Some(ref item) = item {
            let size = item.byte_size();
            inner.current_bytes = inner.current_bytes.saturating_sub(size);
        }
        item
    }

    /// `(item_count, byte_count)` snapshot.
    pub fn size(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.items.len(), inner.current_bytes)
    }

    pub fn set_max_items(&self, n: usize) {
        self.inner.lock().unwrap().max_items = n;
    }

    pub fn set_max_bytes(&self, n: usize) {
        self.inner.lock().unwrap().max_bytes = n;
    }

    /// Wakes every waiter, causing their `pop` to return `None`. Idempotent.
    pub fn halt(&self) {
        self.inner.lock().unwrap().halted = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item(usize);

    impl ByteSized for Item {
        fn byte_size(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn push_fails_when_item_cap_reached() {
        let q = BoundedQueue::new(2, 1_000_000);
        assert!(q.push(Item(1)));
        assert!(q.push(Item(1)));
        assert!(!q.push(Item(1)));
    }

    #[test]
    fn byte_cap_single_item_exception() {
        let q: BoundedQueue<Item> = BoundedQueue::new(1_000_000, 10);
        // Queue empty: an oversized item is still accepted.
        assert!(q.push(Item(50)));
        // Queue non-empty: even a tiny item is rejected because the cap is exceeded.
        assert!(!q.push(Item(1)));
        // Drain, then a fresh oversized item is accepted again.
        assert_eq!(q.pop(Duration::ZERO), Some(Item(50)));
        assert!(q.push(Item(50)));
    }

    #[test]
    fn pop_nonblocking_on_empty_returns_none_immediately() {
        let q: BoundedQueue<Item> = BoundedQueue::new(10, 1000);
        assert_eq!(q.pop(Duration::ZERO), None);
    }

    #[test]
    fn pop_blocks_until_push_from_another_thread() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<BoundedQueue<Item>> = Arc::new(BoundedQueue::new(10, 1000));
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            q2.push(Item(3));
        });
        let got = q.pop(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got, Some(Item(3)));
    }

    #[test]
    fn pop_times_out_when_nothing_arrives() {
        let q: BoundedQueue<Item> = BoundedQueue::new(10, 1000);
        let start = Instant::now();
        let got = q.pop(Duration::from_millis(100));
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn byte_count_invariant_holds_after_push_and_pop() {
        let q: BoundedQueue<Item> = BoundedQueue::new(100, 1_000_000);
        q.push(Item(10));
        q.push(Item(20));
        let (count, bytes) = q.size();
        assert_eq!(count, 2);
        assert_eq!(bytes, 30);
        q.pop(Duration::ZERO);
        let (count, bytes) = q.size();
        assert_eq!(count, 1);
        assert_eq!(bytes, 20);
    }

    #[test]
    fn halt_wakes_blocked_waiters() {
        use std::sync::Arc;
        use std::thread;

        let q: Arc<BoundedQueue<Item>> = Arc::new(BoundedQueue::new(10, 1000));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        q.halt();
        let got = handle.join().unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn backpressure_invariant_recovers_after_drain() {
        let q: BoundedQueue<Item> = BoundedQueue::new(3, 1_000_000);
        assert!(q.push(Item(1)));
        assert!(q.push(Item(1)));
        assert!(q.push(Item(1)));
        assert!(!q.push(Item(1)));
        q.pop(Duration::ZERO);
        assert!(q.push(Item(1)));
    }
}
