//! Buffer type that automatically returns to the pool on drop.
//!
//! A [`Buffer`] owns one allocation made by a [`MemPool`](crate::MemPool).
//! Dropping it never takes the pool lock: in-pool blocks are queued on a
//! channel that the pool drains the next time it locks, and spilled blocks go
//! straight back to the host allocator.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::area::header_of;
use crate::pool::Shared;

/// A pointer queued for release by a dropped [`Buffer`].
#[derive(Debug)]
pub struct ReturnInfo {
    pub ptr: NonNull<u8>,
}

// SAFETY: ReturnInfo only carries a pointer into the pool region, which is
// released under the pool's lock
unsafe impl Send for ReturnInfo {}

/// A buffer allocated from the pool.
///
/// Derefs to exactly the requested number of bytes. The buffer keeps the
/// pool alive, so it may outlive every [`MemPool`](crate::MemPool) handle.
///
/// # Example
///
/// ```rust
/// use buddy_mempool::MemPool;
///
/// # fn main() -> Result<(), buddy_mempool::PoolError> {
/// let pool = MemPool::new(1024 * 1024)?;
/// let mut buffer = pool.allocate(1000);
///
/// buffer[0] = 42;
/// buffer[999] = 43;
/// assert_eq!(buffer.len(), 1000);
///
/// // Buffer is returned to the pool when dropped
/// drop(buffer);
/// assert_eq!(pool.reserved_bytes(), 0);
/// # Ok(())
/// # }
/// ```
pub struct Buffer {
    /// Pointer to the client bytes.
    ptr: NonNull<u8>,

    /// Requested length.
    len: usize,

    /// The pool this buffer came from.
    pool: Arc<Shared>,
}

// SAFETY: Buffer owns its bytes exclusively, and the pool it points to is Send + Sync
unsafe impl Send for Buffer {}

// SAFETY: shared access only hands out shared slices
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Creates a new buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation of at least `len` bytes
    /// on `pool` and must not be freed by anyone else.
    pub(crate) const unsafe fn new(ptr: NonNull<u8>, len: usize, pool: Arc<Shared>) -> Self {
        Self { ptr, len, pool }
    }

    /// Returns the length of the buffer in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a raw pointer to the buffer's memory.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns a mutable raw pointer to the buffer's memory.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the buffer as a byte slice.
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the buffer as a mutable byte slice.
    #[inline]
    #[must_use]
    pub const fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we have exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the size of the underlying block, header included.
    #[must_use]
    pub fn block_size(&self) -> usize {
        // SAFETY: the block is live while the buffer exists
        unsafe { header_of(self.ptr).as_ref().size() }
    }

    /// Returns `true` if the buffer was served by the host allocator.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        !self.pool.region.contains(self.ptr.as_ptr())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.is_spilled() {
            // SAFETY: the block came from the host allocator through the pool
            unsafe { self.pool.free_spilled(self.ptr) };
        } else {
            // The receiver lives as long as the pool, which this buffer keeps alive
            let _ = self.pool.return_tx.send(ReturnInfo { ptr: self.ptr });
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for Buffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for Buffer {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("block_size", &self.block_size())
            .field("spilled", &self.is_spilled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::{HEADER_SIZE, MemPool};

    const POOL_SIZE: usize = 64 * 1024;

    #[test]
    fn test_buffer_basic_operations() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let mut buffer = pool.allocate(1024);

        assert_eq!(buffer.len(), 1024);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.block_size(), 2048);
        assert!(!buffer.is_spilled());

        buffer[0] = 0xAB;
        buffer[1] = 0xCD;
        assert_eq!(buffer[0], 0xAB);
        assert_eq!(buffer[1], 0xCD);

        let slice = buffer.as_slice();
        assert_eq!(slice[0], 0xAB);

        buffer.as_mut_slice()[1023] = 0xEF;
        assert_eq!(buffer[1023], 0xEF);
    }

    #[test]
    fn test_buffer_deref() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let mut buffer = pool.allocate(100);

        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = i as u8;
        }

        for i in 0..100 {
            assert_eq!(buffer[i], i as u8);
        }
    }

    #[test]
    fn test_buffer_debug() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let buffer = pool.allocate(1024);

        let debug_str = format!("{buffer:?}");
        assert!(debug_str.contains("Buffer"));
        assert!(debug_str.contains("len"));
        assert!(debug_str.contains("block_size"));
    }

    #[test]
    fn test_buffer_drop_returns_to_pool() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let initial = pool.stats();

        let a = pool.allocate(100);
        let b = pool.allocate(3000);
        assert_eq!(pool.reserved_bytes(), 128 + 4096);

        drop(a);
        drop(b);
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(pool.stats(), initial);
        assert!(pool.validate());
    }

    #[test]
    fn test_spilled_buffer() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let whole = pool.allocate(POOL_SIZE - HEADER_SIZE);
        assert!(!whole.is_spilled());

        let mut spilled = pool.allocate(500);
        assert!(spilled.is_spilled());
        spilled.fill(7);
        assert!(spilled.iter().all(|b| *b == 7));
        assert_eq!(pool.reserved_bytes(), POOL_SIZE);

        drop(spilled);
        drop(whole);
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(pool.overflow_count(), 1);
        assert!(pool.validate());
    }

    #[test]
    fn test_buffer_outlives_pool_handle() {
        let pool = MemPool::new(POOL_SIZE).unwrap();
        let mut buffer = pool.allocate(64);
        drop(pool);

        buffer.fill(1);
        assert_eq!(buffer.iter().map(|b| usize::from(*b)).sum::<usize>(), 64);
    }
}
