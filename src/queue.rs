//! Bounded frame queue with drop-oldest overflow.
//!
//! Live streaming wants the freshest frame, not the oldest: when a
//! producer outruns its consumer the head of the queue is popped (and
//! counted) before the new element is pushed. One producer, one consumer;
//! contention is low and frames are large, so a mutex + condvar around a
//! deque is the right tool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
    stopped: AtomicBool,
    dropped: AtomicU64,
}

/// Fixed-capacity FIFO shared between one producer and one consumer.
pub struct FrameQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                available: Condvar::new(),
                capacity,
                stopped: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Push a frame, discarding the oldest queued frame when full.
    /// Returns `true` if an old frame was dropped to make room.
    pub fn push(&self, item: T) -> bool {
        let mut queue = self.inner.queue.lock();
        let mut dropped = false;
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            dropped = true;
        }
        queue.push_back(item);
        drop(queue);
        self.inner.available.notify_one();
        dropped
    }

    /// Block until a frame is available or the queue is stopped.
    /// Returns `None` only after `stop()` with the queue drained.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.inner.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.inner.available.wait(&mut queue);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.queue.lock().pop_front()
    }

    /// Pop with a bounded wait. Returns `None` on timeout or stop, so
    /// callers can interleave other work while the queue is idle.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        let mut queue = self.inner.queue.lock();
        if let Some(item) = queue.pop_front() {
            return Some(item);
        }
        if self.inner.stopped.load(Ordering::Acquire) {
            return None;
        }
        self.inner.available.wait_for(&mut queue, timeout);
        queue.pop_front()
    }

    /// Wake all waiters; subsequent `pop` calls drain then return `None`.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Frames discarded by drop-oldest overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = FrameQueue::new(3);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(!queue.push(3));
        // Full: pushing pops exactly the head first.
        assert!(queue.push(4));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), Some(4));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = FrameQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_stop_wakes_consumer() {
        let queue: FrameQueue<u32> = FrameQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_stop_drains_remaining() {
        let queue = FrameQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.stop();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }
}
