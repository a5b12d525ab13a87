//! # Page Pool
//!
//! Purpose: Hand out fixed-size byte pages for inbound reads and take them
//! back for reuse, so steady-state reading performs no heap allocation.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded free list of equally sized pages.
//! 2. **Minimal Locking**: The mutex is held only while moving one page.
//! 3. **Size Discipline**: Only pages of the configured size are pooled;
//!    oversized pages go straight back to the allocator.
//! 4. **Leak Detection Is Advisory**: `outstanding` is a debug counter, never
//!    consulted for correctness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Point-in-time page pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePoolStats {
    /// Pages parked in the free list.
    pub pooled: usize,
    /// Pages handed out and not yet released.
    pub outstanding: usize,
}

struct PagePoolInner {
    page_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

/// Shared, thread-safe pool of read pages.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PagePoolInner>,
}

impl PagePool {
    /// Creates a pool of `page_size` pages keeping at most `capacity` idle pages.
    pub fn new(page_size: usize, capacity: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        PagePool {
            inner: Arc::new(PagePoolInner {
                page_size,
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the configured page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Acquires a page holding at least `min_len` bytes.
    ///
    /// Requests up to the page size are served from the free list; larger
    /// requests get a dedicated allocation of exactly `min_len` bytes.
    pub fn acquire(&self, min_len: usize) -> Box<[u8]> {
        self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
        if min_len <= self.inner.page_size {
            if let Some(page) = self.inner.free.lock().pop() {
                return page;
            }
            return vec![0u8; self.inner.page_size].into_boxed_slice();
        }
        vec![0u8; min_len].into_boxed_slice()
    }

    /// Returns a page to the pool.
    pub fn release(&self, page: Box<[u8]>) {
        self.inner.outstanding.fetch_sub(1, Ordering::Relaxed);
        if page.len() != self.inner.page_size {
            return;
        }
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.capacity {
            free.push(page);
        }
    }

    /// Returns a snapshot of pool counters.
    pub fn stats(&self) -> PagePoolStats {
        PagePoolStats {
            pooled: self.inner.free.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_pages() {
        let pool = PagePool::new(64, 4);
        let page = pool.acquire(10);
        assert_eq!(page.len(), 64);
        assert_eq!(pool.stats().outstanding, 1);

        pool.release(page);
        assert_eq!(pool.stats(), PagePoolStats { pooled: 1, outstanding: 0 });

        let _again = pool.acquire(0);
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn oversized_pages_are_not_pooled() {
        let pool = PagePool::new(64, 4);
        let big = pool.acquire(100);
        assert_eq!(big.len(), 100);
        pool.release(big);
        assert_eq!(pool.stats(), PagePoolStats { pooled: 0, outstanding: 0 });
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = PagePool::new(16, 1);
        let a = pool.acquire(0);
        let b = pool.acquire(0);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().pooled, 1);
    }
}
