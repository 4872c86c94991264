use crate::collections::WeakList;
use crate::error::{Result, SnapError};
use crossbeam::queue::SegQueue;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One page leased from a [`MemoryPool`]. The dense `index` is stable for
/// the life of the lease and may be stored by clients; the buffer itself is
/// exclusively owned until released back to the pool.
pub struct PageBuffer {
    index: u32,
    data: Box<[u8]>,
}

impl PageBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// How aggressively subscribers should shed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CollectionMode {
    Normal,
    Emergency,
    Critical,
}

#[derive(Debug, Clone)]
pub struct CollectionEvent {
    pub mode: CollectionMode,
    pub used_bytes: usize,
    pub target_bytes: usize,
    pub maximum_bytes: usize,
}

pub type CollectionCallback = dyn Fn(&CollectionEvent) + Send + Sync;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryPoolSettings {
    pub page_size: usize,
    pub minimum_bytes: usize,
    pub target_bytes: usize,
    pub maximum_bytes: usize,
}

impl Default for MemoryPoolSettings {
    fn default() -> Self {
        Self {
            page_size: 4096,
            minimum_bytes: 1 << 20,
            target_bytes: 64 << 20,
            maximum_bytes: 256 << 20,
        }
    }
}

/// Bounded fixed-size page allocator.
///
/// Live bytes (leased pages plus pooled free pages) never intentionally
/// exceed `maximum_bytes`; the pooled free list is lock-free, so a racing
/// release can briefly overshoot rather than pay for a lock. Collection
/// events ask subscribers to release pages cooperatively. Callbacks are run
/// synchronously on the requesting thread and must not allocate from the
/// same pool.
pub struct MemoryPool {
    page_size: usize,
    minimum_bytes: usize,
    target_bytes: usize,
    maximum_bytes: usize,
    used_bytes: AtomicUsize,
    free: SegQueue<PageBuffer>,
    next_index: AtomicU32,
    critical: AtomicBool,
    subscribers: Mutex<WeakList<CollectionCallback>>,
    #[cfg(debug_assertions)]
    outstanding: Mutex<crate::collections::BitArray>,
}

impl MemoryPool {
    pub fn new(settings: MemoryPoolSettings) -> Result<Arc<Self>> {
        if !settings.page_size.is_power_of_two() || settings.page_size < 512 {
            return Err(SnapError::InvalidConfig(format!(
                "page size {} must be a power of two of at least 512",
                settings.page_size
            )));
        }
        if settings.target_bytes > settings.maximum_bytes {
            return Err(SnapError::InvalidConfig(
                "pool target exceeds maximum".to_string(),
            ));
        }
        Ok(Arc::new(Self {
            page_size: settings.page_size,
            minimum_bytes: settings.minimum_bytes,
            target_bytes: settings.target_bytes,
            maximum_bytes: settings.maximum_bytes,
            used_bytes: AtomicUsize::new(0),
            free: SegQueue::new(),
            next_index: AtomicU32::new(0),
            critical: AtomicBool::new(false),
            subscribers: Mutex::new(WeakList::new()),
            #[cfg(debug_assertions)]
            outstanding: Mutex::new(crate::collections::BitArray::new(0, false)),
        }))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Registers a cooperative collection subscriber. The pool holds only a
    /// weak reference; dropping the returned Arc unsubscribes.
    pub fn subscribe(&self, callback: &Arc<CollectionCallback>) {
        self.subscribers.lock().push(callback);
    }

    /// Leases a page. Fails with `OutOfMemory` while the pool is critical.
    pub fn allocate(&self) -> Result<PageBuffer> {
        if let Some(page) = self.free.pop() {
            self.lease(&page);
            return Ok(page);
        }

        let used = self.used_bytes.load(Ordering::Acquire);
        if self.critical.load(Ordering::Acquire) || used + self.page_size > self.maximum_bytes {
            self.critical.store(true, Ordering::Release);
            self.request_collection(CollectionMode::Critical);
            // A subscriber may have released pages back to the free list.
            if let Some(page) = self.free.pop() {
                self.lease(&page);
                return Ok(page);
            }
            warn!(used_bytes = used, "memory pool critical, allocation refused");
            return Err(SnapError::OutOfMemory(format!(
                "pool at {} of {} bytes",
                used, self.maximum_bytes
            )));
        }

        if used + self.page_size > self.target_bytes {
            let mode = if used + self.page_size > self.maximum_bytes / 8 * 7 {
                CollectionMode::Emergency
            } else {
                CollectionMode::Normal
            };
            self.request_collection(mode);
        }

        self.used_bytes.fetch_add(self.page_size, Ordering::AcqRel);
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let page = PageBuffer {
            index,
            data: vec![0u8; self.page_size].into_boxed_slice(),
        };
        self.lease(&page);
        Ok(page)
    }

    /// Returns a page. Above target the buffer is dropped instead of pooled
    /// so the pool shrinks back toward its working set.
    pub fn release(&self, page: PageBuffer) {
        #[cfg(debug_assertions)]
        {
            let mut outstanding = self.outstanding.lock();
            assert!(
                outstanding.clear(page.index as usize),
                "page {} released twice",
                page.index
            );
        }

        let used = self.used_bytes.load(Ordering::Acquire);
        if used > self.target_bytes && used > self.minimum_bytes {
            self.used_bytes.fetch_sub(self.page_size, Ordering::AcqRel);
            // Buffer dropped; index retires with it.
        } else {
            self.free.push(page);
        }

        if self.critical.load(Ordering::Acquire)
            && self.used_bytes.load(Ordering::Acquire) < self.target_bytes
        {
            self.critical.store(false, Ordering::Release);
            debug!("memory pool left critical mode");
        }
    }

    pub fn release_many(&self, pages: impl IntoIterator<Item = PageBuffer>) {
        for page in pages {
            self.release(page);
        }
    }

    /// Publishes a collection event to all live subscribers.
    pub fn request_collection(&self, mode: CollectionMode) {
        let event = CollectionEvent {
            mode,
            used_bytes: self.used_bytes.load(Ordering::Acquire),
            target_bytes: self.target_bytes,
            maximum_bytes: self.maximum_bytes,
        };
        debug!(?mode, used = event.used_bytes, "collection requested");
        self.subscribers
            .lock()
            .for_each(|callback| (callback.as_ref())(&event));
    }

    fn lease(&self, page: &PageBuffer) {
        #[cfg(debug_assertions)]
        {
            let mut outstanding = self.outstanding.lock();
            let index = page.index as usize;
            if index >= outstanding.len() {
                outstanding.grow(index + 1);
            }
            assert!(outstanding.set(index), "page {} leased twice", page.index);
        }
        #[cfg(not(debug_assertions))]
        let _ = page;
    }
}

/// Process-wide default pool. A convenience for callers that do not manage
/// their own; components always accept an explicit pool.
pub fn default_pool() -> &'static Arc<MemoryPool> {
    static DEFAULT: Lazy<Arc<MemoryPool>> =
        Lazy::new(|| MemoryPool::new(MemoryPoolSettings::default()).expect("default pool settings"));
    &DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(pages: usize) -> Arc<MemoryPool> {
        MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: pages * 4096,
            maximum_bytes: pages * 4096,
        })
        .unwrap()
    }

    #[test]
    fn test_allocate_release_reuses_buffer() {
        let pool = small_pool(4);
        let page = pool.allocate().unwrap();
        let index = page.index();
        pool.release(page);

        let again = pool.allocate().unwrap();
        assert_eq!(again.index(), index);
        pool.release(again);
    }

    #[test]
    fn test_exhaustion_is_out_of_memory() {
        let pool = small_pool(2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(matches!(
            pool.allocate(),
            Err(SnapError::OutOfMemory(_))
        ));
        pool.release_many([a, b]);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    #[should_panic(expected = "released twice")]
    #[cfg(debug_assertions)]
    fn test_double_release_panics() {
        let pool = small_pool(4);
        let page = pool.allocate().unwrap();
        let stolen = PageBuffer {
            index: page.index(),
            data: vec![0u8; 4096].into_boxed_slice(),
        };
        pool.release(page);
        pool.release(stolen);
    }

    #[test]
    fn test_collection_event_reaches_subscriber() {
        let pool = small_pool(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let callback: Arc<CollectionCallback> = Arc::new(move |event: &CollectionEvent| {
            assert_eq!(event.mode, CollectionMode::Critical);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        pool.subscribe(&callback);

        pool.request_collection(CollectionMode::Critical);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(callback);
        pool.request_collection(CollectionMode::Critical);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
