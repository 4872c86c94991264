use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pool of reusable objects behind a lock-free queue.
///
/// Capacity is soft: concurrent releases may briefly keep a few extra
/// objects alive rather than pay for a lock on the release path.
pub struct ResourceQueue<T> {
    queue: SegQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    soft_capacity: usize,
    pooled: AtomicUsize,
}

impl<T> ResourceQueue<T> {
    pub fn new(soft_capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            queue: SegQueue::new(),
            factory: Box::new(factory),
            soft_capacity,
            pooled: AtomicUsize::new(0),
        }
    }

    /// Takes a pooled object, or builds a fresh one when the pool is empty.
    pub fn acquire(&self) -> T {
        match self.queue.pop() {
            Some(item) => {
                self.pooled.fetch_sub(1, Ordering::Relaxed);
                item
            }
            None => (self.factory)(),
        }
    }

    /// Returns an object to the pool; surplus objects are dropped.
    pub fn release(&self, item: T) {
        if self.pooled.load(Ordering::Relaxed) < self.soft_capacity {
            self.pooled.fetch_add(1, Ordering::Relaxed);
            self.queue.push(item);
        }
    }

    pub fn pooled_count(&self) -> usize {
        self.pooled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let queue = ResourceQueue::new(2, || Vec::<u8>::with_capacity(64));

        let mut buffer = queue.acquire();
        buffer.push(1);
        buffer.clear();
        queue.release(buffer);
        assert_eq!(queue.pooled_count(), 1);

        let reused = queue.acquire();
        assert_eq!(reused.capacity(), 64);
        assert_eq!(queue.pooled_count(), 0);
    }

    #[test]
    fn test_soft_capacity_drops_surplus() {
        let queue = ResourceQueue::new(1, Vec::<u8>::new);
        queue.release(Vec::new());
        queue.release(Vec::new());
        assert_eq!(queue.pooled_count(), 1);
    }
}
