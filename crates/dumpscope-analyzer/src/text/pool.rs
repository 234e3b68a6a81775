//! Pooled, reference-counted text buffers and the zero-copy line views carved from them.
//!
//! A [`PooledBuffer`] is the writer's handle on one fixed-capacity buffer. Text is
//! appended into its tail; finished lines are split off the front as [`Segment`]s
//! that share the same allocation. Every segment and the writer each hold one
//! unit of the buffer's [`Lease`]; when the last unit drops, the storage is
//! reclaimed and handed back to the [`BufferPool`] exactly once.
//!
//! ```text
//!   PooledBuffer (writer)         Segment      Segment
//!        │                          │             │
//!        └───────── Arc<Lease> ─────┴─────────────┘
//!                      │ last drop
//!                      ▼
//!                 BufferPool::give_back
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};

/// Upper bound on idle buffers kept for reuse
const MAX_CACHED_BUFFERS: usize = 64;

/// Thread-safe pool of fixed-capacity text buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    buffer_size: usize,
    free: Mutex<Vec<BytesMut>>,
    claimed: AtomicU64,
    returned: AtomicU64,
    next_id: AtomicU64,
}

impl BufferPool {
    /// Create a pool whose buffers hold `buffer_size` bytes of decoded text
    pub fn new(buffer_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                buffer_size,
                free: Mutex::new(Vec::new()),
                claimed: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Capacity of every buffer handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Rent a buffer. The returned handle holds the first reference.
    pub fn claim(&self) -> PooledBuffer {
        let storage = self
            .shared
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.shared.buffer_size));

        self.shared.claimed.fetch_add(1, Ordering::Relaxed);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            capacity: storage.capacity(),
            buf: storage,
            lease: Arc::new(Lease {
                id,
                pool: Arc::clone(&self.shared),
                retired: Mutex::new(None),
            }),
        }
    }

    /// Number of buffers ever claimed
    pub fn claimed(&self) -> u64 {
        self.shared.claimed.load(Ordering::Relaxed)
    }

    /// Number of buffers whose last reference has been released
    pub fn returned(&self) -> u64 {
        self.shared.returned.load(Ordering::Relaxed)
    }

    /// Claimed buffers that still have a live writer or view
    pub fn outstanding(&self) -> u64 {
        self.claimed() - self.returned()
    }

    /// Idle buffers ready to be claimed without allocating
    pub fn available(&self) -> usize {
        self.shared.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every cached idle buffer
    pub fn clear(&self) {
        self.shared
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("claimed", &self.claimed())
            .field("returned", &self.returned())
            .finish()
    }
}

impl PoolShared {
    fn give_back(&self, mut storage: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);

        // Every view over this storage is gone, so reserving reclaims the
        // original allocation in place instead of allocating.
        storage.clear();
        storage.reserve(self.buffer_size);

        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < MAX_CACHED_BUFFERS {
            free.push(storage);
        }
    }
}

/// Reference-counted claim on one pooled buffer
struct Lease {
    id: u64,
    pool: Arc<PoolShared>,
    /// Storage handed over by the writer once it stops appending
    retired: Mutex<Option<BytesMut>>,
}

impl Lease {
    fn retire(&self, storage: BytesMut) {
        *self.retired.lock().unwrap_or_else(|e| e.into_inner()) = Some(storage);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let storage = self
            .retired
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match storage {
            Some(storage) => self.pool.give_back(storage),
            // Writer never retired (e.g. dropped mid-panic): still counts as returned.
            None => {
                self.pool.returned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer handle
// ─────────────────────────────────────────────────────────────────────────────

/// Writer-side handle on a claimed buffer
///
/// Bytes in `[0, len)` are decoded text not yet cut into lines; the remaining
/// capacity is the unfilled tail decoders append into.
pub struct PooledBuffer {
    buf: BytesMut,
    lease: Arc<Lease>,
    capacity: usize,
}

impl PooledBuffer {
    /// Unconsumed decoded text
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes that can still be appended before the buffer is full
    pub fn remaining(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    /// Bytes already handed out as views from the front of this buffer
    pub fn consumed(&self) -> usize {
        self.capacity.saturating_sub(self.buf.capacity())
    }

    /// Live references: this writer plus one per outstanding view
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    pub fn id(&self) -> u64 {
        self.lease.id
    }

    /// Mutable access for decoders appending into the tail
    pub(crate) fn storage_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Cut the first `len` bytes into a view, keeping the rest in the writer
    pub fn split_view(&mut self, len: usize) -> Segment {
        Segment {
            bytes: self.buf.split_to(len).freeze(),
            lease: Arc::clone(&self.lease),
        }
    }

    /// Cut all unconsumed bytes into a view
    pub fn split_all(&mut self) -> Segment {
        Segment {
            bytes: self.buf.split().freeze(),
            lease: Arc::clone(&self.lease),
        }
    }

    /// Drop `len` bytes from the front without creating a view (delimiters)
    pub fn skip(&mut self, len: usize) {
        self.buf.advance(len);
    }

    /// Move the unconsumed tail back to the start of the allocation.
    ///
    /// Only possible while no view references the buffer and the tail does not
    /// overlap the space it moves into; returns `false` otherwise.
    pub fn compact(&mut self) -> bool {
        if self.ref_count() != 1 || self.buf.len() > self.consumed() {
            return false;
        }
        let wanted = self.capacity.saturating_sub(self.buf.len());
        self.buf.reserve(wanted);
        true
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.lease.retire(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.lease.id)
            .field("len", &self.buf.len())
            .field("remaining", &self.remaining())
            .field("refs", &self.ref_count())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable slice of one pooled buffer
pub struct Segment {
    // Declared before `lease` so the slice is released before the lease can
    // reclaim the storage.
    bytes: Bytes,
    lease: Arc<Lease>,
}

impl Segment {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn last_byte(&self) -> Option<u8> {
        self.bytes.last().copied()
    }

    /// Shorten the view, keeping the first `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }

    pub fn buffer_id(&self) -> u64 {
        self.lease.id
    }
}

/// One logical line: a chain of segments across one or more pooled buffers
///
/// Dropping the view releases its references, tail first.
pub struct LineView {
    next: Option<Box<LineView>>,
    head: Segment,
}

impl LineView {
    /// Build a view from segments in text order
    ///
    /// Returns `None` for an empty segment list.
    pub fn from_segments(segments: Vec<Segment>) -> Option<Self> {
        segments.into_iter().rev().fold(None::<LineView>, |next, head| {
            Some(LineView {
                next: next.map(Box::new),
                head,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.segments().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments().all(Segment::is_empty)
    }

    /// Number of buffers this line straddles
    pub fn segment_count(&self) -> usize {
        self.segments().count()
    }

    pub fn segments(&self) -> Segments<'_> {
        Segments { next: Some(self) }
    }

    /// Line text, borrowed when it lives in a single buffer
    pub fn text(&self) -> Cow<'_, str> {
        match &self.next {
            None => String::from_utf8_lossy(self.head.as_bytes()),
            Some(_) => {
                let mut joined = Vec::with_capacity(self.len());
                for segment in self.segments() {
                    joined.extend_from_slice(segment.as_bytes());
                }
                Cow::Owned(String::from_utf8_lossy(&joined).into_owned())
            }
        }
    }

    /// Compare against `literal` without materializing the line
    pub fn eq_str(&self, literal: &str) -> bool {
        self.len() == literal.len() && self.starts_with(literal)
    }

    /// Prefix check across segment boundaries without materializing the line
    pub fn starts_with(&self, prefix: &str) -> bool {
        let mut wanted = prefix.as_bytes();
        for segment in self.segments() {
            if wanted.is_empty() {
                return true;
            }
            let bytes = segment.as_bytes();
            let n = bytes.len().min(wanted.len());
            if bytes[..n] != wanted[..n] {
                return false;
            }
            wanted = &wanted[n..];
        }
        wanted.is_empty()
    }
}

impl fmt::Debug for LineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LineView").field(&self.text()).finish()
    }
}

impl fmt::Display for LineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Iterator over the segments of a [`LineView`]
pub struct Segments<'a> {
    next: Option<&'a LineView>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a Segment;

    fn next(&mut self) -> Option<Self::Item> {
        let view = self.next?;
        self.next = view.next.as_deref();
        Some(&view.head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut PooledBuffer, text: &str) {
        buffer.storage_mut().extend_from_slice(text.as_bytes());
    }

    #[test]
    fn test_claim_starts_with_single_reference() {
        let pool = BufferPool::new(64);
        let buffer = pool.claim();
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(buffer.remaining(), 64);
        assert_eq!(pool.claimed(), 1);
        assert_eq!(pool.returned(), 0);
    }

    #[test]
    fn test_views_hold_references() {
        let pool = BufferPool::new(64);
        let mut buffer = pool.claim();
        fill(&mut buffer, "alpha\nbeta");

        let first = buffer.split_view(5);
        assert_eq!(buffer.ref_count(), 2);
        buffer.skip(1);
        let second = buffer.split_all();
        assert_eq!(buffer.ref_count(), 3);

        assert_eq!(first.as_bytes(), b"alpha");
        assert_eq!(second.as_bytes(), b"beta");

        drop(first);
        assert_eq!(buffer.ref_count(), 2);
        drop(second);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_buffer_returns_once_after_last_view() {
        let pool = BufferPool::new(32);
        let mut buffer = pool.claim();
        fill(&mut buffer, "line");
        let view = LineView::from_segments(vec![buffer.split_all()]).unwrap();

        drop(buffer);
        assert_eq!(pool.returned(), 0, "view still alive");

        drop(view);
        assert_eq!(pool.returned(), 1);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reclaimed_buffer_is_reused() {
        let pool = BufferPool::new(32);
        drop(pool.claim());
        assert_eq!(pool.available(), 1);

        let buffer = pool.claim();
        assert_eq!(pool.available(), 0);
        assert_eq!(buffer.remaining(), 32);
    }

    #[test]
    fn test_clear_drops_cached_buffers() {
        let pool = BufferPool::new(32);
        drop(pool.claim());
        drop(pool.claim());
        assert!(pool.available() >= 1);
        pool.clear();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_line_view_spanning_two_buffers() {
        let pool = BufferPool::new(16);
        let mut a = pool.claim();
        let mut b = pool.claim();
        fill(&mut a, "hello ");
        fill(&mut b, "world");

        let view = LineView::from_segments(vec![a.split_all(), b.split_all()]).unwrap();
        assert_eq!(view.segment_count(), 2);
        assert_eq!(view.len(), 11);
        assert_eq!(view.text(), "hello world");
        assert!(view.starts_with("hello w"));
        assert!(view.eq_str("hello world"));
        assert!(!view.eq_str("hello"));

        drop(a);
        drop(b);
        assert_eq!(pool.returned(), 0);
        drop(view);
        assert_eq!(pool.returned(), 2);
    }

    #[test]
    fn test_single_segment_text_is_borrowed() {
        let pool = BufferPool::new(16);
        let mut buffer = pool.claim();
        fill(&mut buffer, "borrowed");
        let view = LineView::from_segments(vec![buffer.split_all()]).unwrap();
        assert!(matches!(view.text(), Cow::Borrowed("borrowed")));
    }

    #[test]
    fn test_compact_moves_tail_when_unshared() {
        let pool = BufferPool::new(16);
        let mut buffer = pool.claim();
        fill(&mut buffer, "0123456789abcdef");
        drop(buffer.split_view(12));
        assert_eq!(buffer.remaining(), 0);

        assert!(buffer.compact());
        assert_eq!(buffer.as_bytes(), b"cdef");
        assert_eq!(buffer.remaining(), 12);
    }

    #[test]
    fn test_compact_refused_while_view_alive() {
        let pool = BufferPool::new(16);
        let mut buffer = pool.claim();
        fill(&mut buffer, "0123456789abcdef");
        let view = buffer.split_view(12);
        assert!(!buffer.compact());
        drop(view);
        assert!(buffer.compact());
    }

    #[test]
    fn test_empty_segment_list_has_no_view() {
        assert!(LineView::from_segments(Vec::new()).is_none());
    }
}
