//! # Segmented Read Buffer
//!
//! Purpose: Hold bytes read from the network in a chain of pooled pages,
//! exposing a scratch region to read into and a committed region to parse.
//!
//! ## Design Principles
//! 1. **Single Owner**: One read loop writes and consumes; there is no
//!    internal synchronization.
//! 2. **Pooled Pages**: Pages come from a shared `PagePool`; a small private
//!    free list absorbs churn before the shared pool is touched.
//! 3. **Running Offsets**: Each segment records the absolute stream offset of
//!    its first byte, so the committed length is O(1) whatever the chain length.
//! 4. **Fast Path First**: The common single-page case returns one slice and
//!    discards with a field reset.
//!
//! ## Structure Overview
//!
//! ```text
//! segments (front = oldest)
//!   [ page 0: ....DDDD ] -> [ page 1: DDDDDDDD ] -> [ page 2: DDD_______ ]
//!         ^ start_offset                               ^ len   ^ scratch
//! ```
//!
//! Committed data runs from `start_offset` in the front page to `len` in the
//! back page. `get_writable` hands out the scratch tail of the back page.

use std::collections::VecDeque;

use crate::page::PagePool;

/// One pooled page in the chain.
struct Segment {
    page: Box<[u8]>,
    /// Committed bytes in this page, counted from page offset zero.
    len: usize,
    /// Absolute stream offset of page offset zero.
    running_index: u64,
}

impl Segment {
    #[inline]
    fn end_index(&self) -> u64 {
        self.running_index + self.len as u64
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.page.len() - self.len
    }
}

/// Chain of pooled pages with a scratch tail and a committed region.
pub struct SegmentedReadBuffer {
    segments: VecDeque<Segment>,
    /// Bytes already discarded from the front segment.
    start_offset: usize,
    /// True once the front segment has been partially consumed.
    start_trimmed: bool,
    spare: Vec<Box<[u8]>>,
    spare_depth: usize,
    pool: PagePool,
}

impl SegmentedReadBuffer {
    /// Creates an empty buffer drawing pages from `pool`.
    ///
    /// `spare_depth` bounds the private free list of recycled pages.
    pub fn new(pool: PagePool, spare_depth: usize) -> Self {
        SegmentedReadBuffer {
            segments: VecDeque::new(),
            start_offset: 0,
            start_trimmed: false,
            spare: Vec::with_capacity(spare_depth),
            spare_depth,
            pool,
        }
    }

    /// Returns scratch space to read into.
    ///
    /// The tail of the current page is reused when no hint is given and any
    /// space remains, or when the remaining space clears the hint (capped to
    /// a quarter page). Otherwise a new page of at least `hint` bytes is
    /// chained on.
    pub fn get_writable(&mut self, hint: usize) -> &mut [u8] {
        let page_size = self.pool.page_size();
        let threshold = hint.min(page_size / 4).max(1);

        let reuse = match self.segments.back() {
            Some(end) => {
                let remaining = end.remaining();
                remaining > 0 && (hint == 0 || remaining >= threshold)
            }
            None => false,
        };

        if !reuse {
            self.push_page(hint);
        }

        let end = self
            .segments
            .back_mut()
            .expect("push_page leaves a back segment");
        let len = end.len;
        &mut end.page[len..]
    }

    /// Marks `count` scratch bytes as committed.
    ///
    /// # Panics
    /// Panics when `count` exceeds the scratch space last handed out.
    pub fn commit(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let end = self
            .segments
            .back_mut()
            .expect("commit called without writable space");
        assert!(
            count <= end.remaining(),
            "commit({count}) exceeds writable space {}",
            end.remaining()
        );
        end.len += count;
    }

    /// Returns the number of committed, not yet discarded bytes.
    pub fn committed_len(&self) -> usize {
        match (self.segments.front(), self.segments.back()) {
            (Some(front), Some(end)) => {
                let start = front.running_index + self.start_offset as u64;
                (end.end_index() - start) as usize
            }
            _ => 0,
        }
    }

    /// Returns true when no committed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.committed_len() == 0
    }

    /// Returns a view over all committed bytes.
    pub fn get_committed(&self) -> CommittedView<'_> {
        let front = match self.segments.front() {
            Some(front) => front,
            None => return CommittedView::Single(&[]),
        };
        let len = self.committed_len();
        let front_len = front.len - self.start_offset;
        if len == front_len {
            return CommittedView::Single(&front.page[self.start_offset..front.len]);
        }
        CommittedView::Multi(SegmentsView {
            segments: &self.segments,
            start_offset: self.start_offset,
            len,
        })
    }

    /// Returns the committed bytes when they sit in a single page.
    pub fn try_get_contiguous_committed(&self) -> Option<&[u8]> {
        match self.get_committed() {
            CommittedView::Single(data) => Some(data),
            CommittedView::Multi(_) => None,
        }
    }

    /// Removes `count` bytes from the oldest committed data.
    ///
    /// # Panics
    /// Panics when `count` exceeds the committed length.
    pub fn discard(&mut self, count: usize) {
        let committed = self.committed_len();
        assert!(
            count <= committed,
            "discard({count}) exceeds committed length {committed}"
        );
        if count == 0 {
            return;
        }

        // Fast path: one untrimmed page consumed entirely is rewound in place.
        if self.segments.len() == 1 && !self.start_trimmed && count == committed {
            let only = &mut self.segments[0];
            only.running_index += only.len as u64;
            only.len = 0;
            return;
        }

        let mut remaining = count;
        while remaining > 0 {
            let is_last = self.segments.len() == 1;
            let front = self
                .segments
                .front_mut()
                .expect("committed bytes imply a front segment");
            let available = front.len - self.start_offset;

            if remaining < available {
                self.start_offset += remaining;
                self.start_trimmed = true;
                break;
            }

            remaining -= available;
            self.start_offset = 0;
            self.start_trimmed = false;
            if is_last {
                // The back page stays to keep its scratch tail.
                front.running_index += front.len as u64;
                front.len = 0;
            } else if let Some(segment) = self.segments.pop_front() {
                self.recycle(segment.page);
            }
        }

        self.drop_empty_front();
    }

    /// Releases every page back to the shared pool.
    pub fn clear(&mut self) {
        while let Some(segment) = self.segments.pop_front() {
            self.pool.release(segment.page);
        }
        for page in self.spare.drain(..) {
            self.pool.release(page);
        }
        self.start_offset = 0;
        self.start_trimmed = false;
    }

    fn push_page(&mut self, hint: usize) {
        let running_index = self.segments.back().map_or(0, Segment::end_index);

        // A back page with nothing committed is replaced rather than chained.
        if self.segments.back().is_some_and(|end| end.len == 0) {
            if let Some(segment) = self.segments.pop_back() {
                self.recycle(segment.page);
            }
            if self.segments.is_empty() {
                self.start_offset = 0;
                self.start_trimmed = false;
            }
        }

        let page = self.take_page(hint);
        self.segments.push_back(Segment {
            page,
            len: 0,
            running_index,
        });
    }

    fn take_page(&mut self, hint: usize) -> Box<[u8]> {
        if hint <= self.pool.page_size() {
            if let Some(page) = self.spare.pop() {
                return page;
            }
        }
        self.pool.acquire(hint)
    }

    fn recycle(&mut self, page: Box<[u8]>) {
        if page.len() == self.pool.page_size() && self.spare.len() < self.spare_depth {
            self.spare.push(page);
        } else {
            self.pool.release(page);
        }
    }

    fn drop_empty_front(&mut self) {
        while self.segments.len() > 1 {
            let front = &self.segments[0];
            if front.len - self.start_offset != 0 {
                break;
            }
            if let Some(segment) = self.segments.pop_front() {
                self.recycle(segment.page);
            }
            self.start_offset = 0;
            self.start_trimmed = false;
        }
    }
}

impl Drop for SegmentedReadBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Committed bytes, either in one slice or spread over several pages.
#[derive(Clone, Copy)]
pub enum CommittedView<'a> {
    /// All committed bytes sit in a single page.
    Single(&'a [u8]),
    /// Committed bytes span multiple pages.
    Multi(SegmentsView<'a>),
}

impl<'a> CommittedView<'a> {
    /// Returns the committed length.
    pub fn len(&self) -> usize {
        match self {
            CommittedView::Single(data) => data.len(),
            CommittedView::Multi(view) => view.len,
        }
    }

    /// Returns true when the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the non-empty slices making up the view, oldest first.
    pub fn slices(&self) -> Slices<'a> {
        match *self {
            CommittedView::Single(data) => Slices {
                single: Some(data),
                multi: None,
                index: 0,
            },
            CommittedView::Multi(view) => Slices {
                single: None,
                multi: Some(view),
                index: 0,
            },
        }
    }

    /// Returns the byte at `index`, if committed.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        match self {
            CommittedView::Single(data) => data.get(index).copied(),
            CommittedView::Multi(_) => {
                let mut base = 0;
                for slice in self.slices() {
                    if index < base + slice.len() {
                        return Some(slice[index - base]);
                    }
                    base += slice.len();
                }
                None
            }
        }
    }

    /// Finds the first `byte` at or after `from`.
    pub fn find_byte(&self, from: usize, byte: u8) -> Option<usize> {
        let mut base = 0;
        for slice in self.slices() {
            let end = base + slice.len();
            if from < end {
                let start = from.saturating_sub(base);
                if let Some(pos) = slice[start..].iter().position(|&b| b == byte) {
                    return Some(base + start + pos);
                }
            }
            base = end;
        }
        None
    }

    /// Copies bytes starting at `from` into `out`, returning the count copied.
    pub fn copy_range(&self, from: usize, out: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut base = 0;
        for slice in self.slices() {
            if copied == out.len() {
                break;
            }
            let end = base + slice.len();
            let position = from + copied;
            if position < end {
                let start = position - base;
                let take = (slice.len() - start).min(out.len() - copied);
                out[copied..copied + take].copy_from_slice(&slice[start..start + take]);
                copied += take;
            }
            base = end;
        }
        copied
    }

    /// Returns the first `len` bytes as one slice when they are contiguous.
    pub fn prefix(&self, len: usize) -> Option<&'a [u8]> {
        let first = self.slices().next().unwrap_or(&[]);
        if len <= first.len() {
            Some(&first[..len])
        } else {
            None
        }
    }

    /// Appends the first `len` bytes to `out`.
    pub fn extend_prefix(&self, len: usize, out: &mut Vec<u8>) {
        let mut left = len;
        for slice in self.slices() {
            if left == 0 {
                break;
            }
            let take = slice.len().min(left);
            out.extend_from_slice(&slice[..take]);
            left -= take;
        }
    }

    /// Copies the whole view into a fresh vector.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.extend_prefix(self.len(), &mut out);
        out
    }
}

/// Committed bytes spread across several pages.
#[derive(Clone, Copy)]
pub struct SegmentsView<'a> {
    segments: &'a VecDeque<Segment>,
    start_offset: usize,
    len: usize,
}

/// Iterator over the slices of a `CommittedView`.
pub struct Slices<'a> {
    single: Option<&'a [u8]>,
    multi: Option<SegmentsView<'a>>,
    index: usize,
}

impl<'a> Iterator for Slices<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if let Some(data) = self.single.take() {
            return if data.is_empty() { None } else { Some(data) };
        }
        let view = self.multi?;
        while self.index < view.segments.len() {
            let segment = &view.segments[self.index];
            let start = if self.index == 0 { view.start_offset } else { 0 };
            self.index += 1;
            if segment.len > start {
                return Some(&segment.page[start..segment.len]);
            }
        }
        None
    }
}
