//! Buffer pool for reducing allocation overhead
//!
//! Packet decoding is allocation-heavy on hot paths (topic names, payloads).
//! Small slices are drawn from per-size free lists and handed out as
//! [`PoolBuf`] guards; dropping the guard returns the buffer to its free
//! list. Slices larger than [`MAX_SLICE_SIZE`] bypass the pool entirely so
//! large payloads cannot bloat it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Largest slice size kept in the pool
pub const MAX_SLICE_SIZE: usize = 256;

/// Maximum number of pooled slices per size class
pub const MAX_POOLED_SLICES: usize = 256;

/// Per-size free lists of reusable buffers.
///
/// `classes[n]` holds buffers of exactly `n` bytes, `0 <= n <= MAX_SLICE_SIZE`.
pub struct SlicePool {
    classes: Vec<ArrayQueue<BytesMut>>,
}

impl SlicePool {
    pub fn new() -> Self {
        Self {
            classes: (0..=MAX_SLICE_SIZE)
                .map(|_| ArrayQueue::new(MAX_POOLED_SLICES))
                .collect(),
        }
    }

    /// Get a buffer of exactly `len` bytes, pooled when `len` is small enough.
    #[inline]
    pub fn acquire(&self, len: usize) -> BytesMut {
        if len > MAX_SLICE_SIZE {
            let mut buf = BytesMut::with_capacity(len);
            buf.resize(len, 0);
            return buf;
        }
        let mut buf = self.classes[len]
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(len));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to its size class. Oversized buffers are dropped.
    /// If the class is full the buffer is simply dropped.
    #[inline]
    pub fn release(&self, buf: BytesMut) {
        let len = buf.len();
        if len <= MAX_SLICE_SIZE {
            let _ = self.classes[len].push(buf);
        }
    }

    /// Number of buffers currently pooled in the given size class.
    pub fn pooled(&self, len: usize) -> usize {
        if len > MAX_SLICE_SIZE {
            return 0;
        }
        self.classes[len].len()
    }
}

impl Default for SlicePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global slice pool instance
static GLOBAL_POOL: OnceLock<Arc<SlicePool>> = OnceLock::new();

/// Get or initialize the global slice pool
pub fn global_pool() -> &'static Arc<SlicePool> {
    GLOBAL_POOL.get_or_init(|| Arc::new(SlicePool::new()))
}

/// An owned byte slice drawn from the global pool.
///
/// Packets own their field buffers through this type; when the last owner
/// drops the packet the buffers sweep back into the pool. This replaces
/// manual release calls: release happens exactly once, on drop, and a
/// released buffer can never be observed through a live reference.
pub struct PoolBuf {
    buf: Option<BytesMut>,
}

impl PoolBuf {
    /// An empty slice (nothing to return to the pool).
    pub fn empty() -> Self {
        Self { buf: None }
    }

    /// Acquire a slice of exactly `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            buf: Some(global_pool().acquire(len)),
        }
    }

    /// Acquire a slice and fill it with a copy of `src`.
    pub fn copy_from_slice(src: &[u8]) -> Self {
        let mut buf = global_pool().acquire(src.len());
        buf.copy_from_slice(src);
        Self { buf: Some(buf) }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            global_pool().release(buf);
        }
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Default for PoolBuf {
    fn default() -> Self {
        Self::empty()
    }
}

impl Clone for PoolBuf {
    fn clone(&self) -> Self {
        if self.buf.is_none() {
            return Self::empty();
        }
        Self::copy_from_slice(self.as_slice())
    }
}

impl PartialEq for PoolBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PoolBuf {}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolBuf({:?})", self.as_slice())
    }
}

impl From<&[u8]> for PoolBuf {
    fn from(src: &[u8]) -> Self {
        Self::copy_from_slice(src)
    }
}

impl From<&str> for PoolBuf {
    fn from(src: &str) -> Self {
        Self::copy_from_slice(src.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_exact_length() {
        let pool = SlicePool::new();
        for len in [0usize, 1, 17, MAX_SLICE_SIZE, MAX_SLICE_SIZE + 1, 4096] {
            let buf = pool.acquire(len);
            assert_eq!(buf.len(), len);
        }
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = SlicePool::new();
        let buf = pool.acquire(32);
        pool.release(buf);
        assert_eq!(pool.pooled(32), 1);

        let buf2 = pool.acquire(32);
        assert_eq!(buf2.len(), 32);
        assert_eq!(pool.pooled(32), 0);
    }

    #[test]
    fn test_oversized_bypass() {
        let pool = SlicePool::new();
        let buf = pool.acquire(MAX_SLICE_SIZE + 1);
        pool.release(buf);
        assert_eq!(pool.pooled(MAX_SLICE_SIZE + 1), 0);
    }

    #[test]
    fn test_pool_buf_round_trip() {
        // A size no other test touches, so the global pool count is stable
        let src = [7u8; 41];
        let b = PoolBuf::copy_from_slice(&src);
        assert_eq!(&b[..], &src[..]);

        let before = global_pool().pooled(41);
        drop(b);
        assert!(global_pool().pooled(41) > before);
    }

    #[test]
    fn test_pool_buf_clone_is_independent() {
        let a = PoolBuf::copy_from_slice(b"abc");
        let mut b = a.clone();
        b.as_mut_slice()[0] = b'x';
        assert_eq!(&a[..], b"abc");
        assert_eq!(&b[..], b"xbc");
    }
}
