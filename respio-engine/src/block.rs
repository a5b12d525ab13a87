//! # Block Buffer Pool
//!
//! Purpose: Pack outbound requests into shared pooled arrays and hand each
//! finalized request back as an independently releasable chunk.
//!
//! ## Design Principles
//! 1. **Slab Ownership**: A `Block` owns one pooled array and an intrusive
//!    reference count (producer + one per live chunk); the array goes back to
//!    the pool exactly once, when the count reaches zero.
//! 2. **Append Only**: Finalized bytes are never written again; the producer
//!    only touches the tail past `finalized`, so readers and the writer see
//!    disjoint ranges of the same array.
//! 3. **Revert On Failure**: A formatter error rolls the tail back so partial
//!    bytes never surface as a message.
//! 4. **Resize Rule**: In-place growth only while nothing was finalized and
//!    the producer holds the sole reference; otherwise the live tail moves
//!    to a new block and the old one completes independently.
//!
//! ## Layout
//!
//! ```text
//! array: [ chunk A | chunk B | live tail | free ............ ]
//!        0                   ^finalized  ^written            ^cap
//! ```

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use respio_common::EngineConfig;

/// Serializes one typed request into an outbound sink.
pub trait RequestFormatter<R: ?Sized> {
    /// Writes the wire form of `command` with `request` into `out`.
    fn format(&self, command: &str, request: &R, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Point-in-time block pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPoolStats {
    /// Arrays parked in the free list.
    pub pooled: usize,
    /// Blocks whose array has not been returned yet.
    pub outstanding: usize,
    /// Blocks returned since the pool was created.
    pub returned: usize,
}

struct BlockPoolInner {
    block_size: usize,
    hints: EngineConfig,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
    returned: AtomicUsize,
}

impl BlockPoolInner {
    fn take(&self, size: usize) -> Box<[u8]> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        if size <= self.block_size {
            if let Some(array) = self.free.lock().pop() {
                return array;
            }
            return vec![0u8; self.block_size].into_boxed_slice();
        }
        vec![0u8; size].into_boxed_slice()
    }

    fn put(&self, array: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.returned.fetch_add(1, Ordering::Relaxed);
        if array.len() != self.block_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(array);
        }
    }
}

/// Shared pool of outbound arrays.
#[derive(Clone)]
pub struct BlockBufferPool {
    inner: Arc<BlockPoolInner>,
}

impl BlockBufferPool {
    /// Creates a pool sized from `config`.
    pub fn new(config: &EngineConfig) -> Self {
        BlockBufferPool {
            inner: Arc::new(BlockPoolInner {
                block_size: config.block_size.max(1),
                hints: config.clone(),
                capacity: config.block_pool_capacity,
                free: Mutex::new(Vec::with_capacity(config.block_pool_capacity)),
                outstanding: AtomicUsize::new(0),
                returned: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns a producer buffer able to hold at least `hint` bytes.
    pub fn acquire(&self, hint: usize) -> BlockBuffer {
        let size = self.inner.block_size.max(hint);
        BlockBuffer {
            block: Block::new(&self.inner, size),
            pool: self.clone(),
            finalized: 0,
            written: 0,
        }
    }

    /// Returns a snapshot of pool counters.
    pub fn stats(&self) -> BlockPoolStats {
        BlockPoolStats {
            pooled: self.inner.free.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn clamp_hint(&self, hint: usize) -> usize {
        self.inner.hints.clamp_block_hint(hint)
    }
}

/// One pooled array plus its intrusive reference count.
struct Block {
    data: NonNull<u8>,
    cap: usize,
    refs: AtomicUsize,
    returned: AtomicBool,
    pool: Arc<BlockPoolInner>,
}

// SAFETY: the array is only written through the producer's unfinalized range
// and only read through finalized ranges, which never overlap. Chunks reading
// concurrently with the producer therefore never alias a mutable access.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn new(pool: &Arc<BlockPoolInner>, size: usize) -> Arc<Block> {
        let array = pool.take(size);
        let cap = array.len();
        let raw = Box::into_raw(array) as *mut u8;
        Arc::new(Block {
            // SAFETY: Box::into_raw never returns null.
            data: unsafe { NonNull::new_unchecked(raw) },
            cap,
            refs: AtomicUsize::new(1),
            returned: AtomicBool::new(false),
            pool: Arc::clone(pool),
        })
    }

    #[inline]
    fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        if let Some(array) = self.take_array() {
            self.pool.put(array);
        }
    }

    /// Reclaims the array exactly once.
    fn take_array(&self) -> Option<Box<[u8]>> {
        let already = self.returned.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "block array returned twice");
        if already {
            return None;
        }
        let slice = std::ptr::slice_from_raw_parts_mut(self.data.as_ptr(), self.cap);
        // SAFETY: `data`/`cap` came from Box::into_raw and the swap above
        // guarantees a single reconstruction.
        Some(unsafe { Box::from_raw(slice) })
    }

    /// # Safety
    /// `start..end` must be finalized bytes.
    #[inline]
    unsafe fn slice(&self, start: usize, end: usize) -> &[u8] {
        std::slice::from_raw_parts(self.data.as_ptr().add(start), end - start)
    }

    /// # Safety
    /// `start..end` must lie in the producer's unfinalized range and the
    /// caller must be the producer.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn slice_mut(&self, start: usize, end: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data.as_ptr().add(start), end - start)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // A leaked chunk reference kept the count above zero.
        if !*self.returned.get_mut() {
            if let Some(array) = self.take_array() {
                self.pool.put(array);
            }
        }
    }
}

/// Finalized, immutable request bytes inside a shared block.
pub struct BlockChunk {
    block: Arc<Block>,
    start: usize,
    end: usize,
}

impl BlockChunk {
    /// Returns the chunk bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range was finalized before the chunk was created.
        unsafe { self.block.slice(self.start, self.end) }
    }
}

impl std::ops::Deref for BlockChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for BlockChunk {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Clone for BlockChunk {
    fn clone(&self) -> Self {
        self.block.acquire_ref();
        BlockChunk {
            block: Arc::clone(&self.block),
            start: self.start,
            end: self.end,
        }
    }
}

impl Drop for BlockChunk {
    fn drop(&mut self) {
        self.block.release();
    }
}

impl std::fmt::Debug for BlockChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChunk")
            .field("len", &(self.end - self.start))
            .finish()
    }
}

/// Producer handle over the current block.
///
/// Not synchronized: one owner per buffer (a worker, or one batch).
pub struct BlockBuffer {
    pool: BlockBufferPool,
    block: Arc<Block>,
    finalized: usize,
    written: usize,
}

impl BlockBuffer {
    /// Bytes written but not finalized yet.
    pub fn unfinalized_len(&self) -> usize {
        self.written - self.finalized
    }

    /// Returns a sink appending to the unfinalized tail.
    pub fn writer(&mut self) -> BlockWriter<'_> {
        BlockWriter { buffer: self }
    }

    /// Formats `request` and finalizes it as one chunk.
    ///
    /// On formatter failure the tail is reverted and the error returned.
    pub fn serialize<R, F>(&mut self, command: &str, request: &R, formatter: &F) -> io::Result<BlockChunk>
    where
        R: ?Sized,
        F: RequestFormatter<R> + ?Sized,
    {
        let result = {
            let mut writer = self.writer();
            formatter.format(command, request, &mut writer)
        };
        match result {
            Ok(()) => Ok(self.finalize()),
            Err(err) => {
                self.revert();
                Err(err)
            }
        }
    }

    /// Hands out the unfinalized bytes as an independent chunk.
    pub fn finalize(&mut self) -> BlockChunk {
        self.block.acquire_ref();
        let chunk = BlockChunk {
            block: Arc::clone(&self.block),
            start: self.finalized,
            end: self.written,
        };
        self.finalized = self.written;
        chunk
    }

    /// Drops every unfinalized byte.
    pub fn revert(&mut self) {
        self.written = self.finalized;
    }

    /// Returns scratch space for a write of `hint` bytes.
    ///
    /// The current tail is reused when it clears `hint` (capped to the upper
    /// clamp); otherwise the buffer grows by at least the clamped hint.
    pub fn writable_span(&mut self, hint: usize) -> &mut [u8] {
        let threshold = hint.min(self.pool.inner.hints.block_hint_max).max(1);
        if self.block.cap - self.written < threshold {
            self.grow(self.pool.clamp_hint(hint).max(hint));
        }
        // SAFETY: the tail past `written` is unfinalized and owned by us.
        unsafe { self.block.slice_mut(self.written, self.block.cap) }
    }

    fn grow(&mut self, extra: usize) {
        let live = self.written - self.finalized;

        if self.finalized == 0 && self.block.refs.load(Ordering::Acquire) == 1 {
            if let Some(block) = Arc::get_mut(&mut self.block) {
                let size = (block.cap * 2).max(live + extra);
                let fresh = block.pool.take(size);
                let cap = fresh.len();
                let data = NonNull::from(Box::leak(fresh)).cast::<u8>();
                // SAFETY: live bytes sit at 0..live of the old array and the
                // new array holds at least `size` > live bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(block.data.as_ptr(), data.as_ptr(), live);
                }
                if let Some(old) = block.take_array() {
                    block.pool.put(old);
                }
                block.data = data;
                block.cap = cap;
                *block.returned.get_mut() = false;
                return;
            }
        }

        let size = self.pool.inner.block_size.max(live + extra);
        let fresh = Block::new(&self.pool.inner, size);
        // SAFETY: both ranges are unfinalized producer bytes in distinct arrays.
        unsafe {
            let src = self.block.slice(self.finalized, self.written);
            fresh.slice_mut(0, live).copy_from_slice(src);
        }
        let old = std::mem::replace(&mut self.block, fresh);
        old.release();
        self.finalized = 0;
        self.written = live;
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        self.block.release();
    }
}

/// `io::Write` sink over a buffer's unfinalized tail.
pub struct BlockWriter<'a> {
    buffer: &'a mut BlockBuffer,
}

impl io::Write for BlockWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let span = self.buffer.writable_span(data.len());
        let take = span.len().min(data.len());
        span[..take].copy_from_slice(&data[..take]);
        self.buffer.written += take;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    struct Echo;

    impl RequestFormatter<[u8]> for Echo {
        fn format(&self, command: &str, request: &[u8], out: &mut dyn io::Write) -> io::Result<()> {
            out.write_all(command.as_bytes())?;
            out.write_all(b" ")?;
            out.write_all(request)?;
            out.write_all(b"\r\n")
        }
    }

    struct Failing;

    impl RequestFormatter<[u8]> for Failing {
        fn format(&self, _: &str, request: &[u8], out: &mut dyn io::Write) -> io::Result<()> {
            out.write_all(request)?;
            Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported"))
        }
    }

    fn pool(block_size: usize) -> BlockBufferPool {
        BlockBufferPool::new(&EngineConfig {
            block_size,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn chunks_survive_reuse() {
        let pool = pool(64);
        let mut buffer = pool.acquire(0);
        let a = buffer.serialize("GET", &b"a"[..], &Echo).expect("a");
        let b = buffer.serialize("GET", &b"b"[..], &Echo).expect("b");
        drop(a);
        let c = buffer.serialize("SET", &b"c"[..], &Echo).expect("c");
        assert_eq!(&*b, b"GET b\r\n");
        assert_eq!(&*c, b"SET c\r\n");
    }

    #[test]
    fn failed_format_is_reverted() {
        let pool = pool(64);
        let mut buffer = pool.acquire(0);
        assert!(buffer.serialize("X", &b"partial"[..], &Failing).is_err());
        assert_eq!(buffer.unfinalized_len(), 0);
        let ok = buffer.serialize("PING", &b""[..], &Echo).expect("ping");
        assert_eq!(&*ok, b"PING \r\n");
    }

    #[test]
    fn block_returns_once_after_last_chunk() {
        let pool = pool(32);
        let mut buffer = pool.acquire(0);
        let chunk = buffer.serialize("GET", &b"k"[..], &Echo).expect("chunk");
        let clone = chunk.clone();
        drop(buffer);
        assert_eq!(pool.stats().outstanding, 1);
        drop(chunk);
        assert_eq!(pool.stats().outstanding, 1);
        drop(clone);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.pooled, 1);
    }

    #[test]
    fn grows_into_new_block_when_chunks_live() {
        let pool = pool(16);
        let mut buffer = pool.acquire(0);
        let first = buffer.serialize("GET", &b"key1"[..], &Echo).expect("first");
        let long = vec![b'x'; 40];
        let second = buffer.serialize("SET", &long[..], &Echo).expect("second");
        assert_eq!(&*first, b"GET key1\r\n");
        assert_eq!(second.len(), 4 + 40 + 2);
        assert_eq!(pool.stats().outstanding, 2);
        drop(first);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[test]
    fn resizes_in_place_without_finalized_bytes() {
        let pool = pool(16);
        let mut buffer = pool.acquire(0);
        {
            let mut writer = buffer.writer();
            writer.write_all(&[b'y'; 50]).expect("write");
        }
        let chunk = buffer.finalize();
        assert_eq!(&*chunk, &[b'y'; 50][..]);
        // The original small array went back to the free list.
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn growth_follows_configured_hint_clamp() {
        let pool = BlockBufferPool::new(&EngineConfig {
            block_size: 8,
            block_hint_min: 64,
            block_hint_max: 64,
            ..EngineConfig::default()
        });
        let mut buffer = pool.acquire(0);
        let first = buffer.serialize("A", &b"1"[..], &Echo).expect("a");
        // A short tail grows by the clamped hint rather than the raw request.
        assert!(buffer.writable_span(8).len() >= 64);
        assert_eq!(&*first, b"A 1\r\n");
    }

    #[test]
    fn chunks_are_shareable_across_threads() {
        let pool = pool(64);
        let mut buffer = pool.acquire(0);
        let chunk = buffer.serialize("GET", &b"t"[..], &Echo).expect("chunk");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let chunk = chunk.clone();
                std::thread::spawn(move || chunk.to_vec())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("join"), b"GET t\r\n");
        }
        drop(chunk);
        drop(buffer);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
