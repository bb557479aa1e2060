//! Error types.

use std::io;

use thiserror::Error;

/// Errors returned when creating a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The requested pool size is not above [`crate::SANE_MIN`].
    #[error("pool size {size} must exceed {min} bytes")]
    TooSmall {
        /// Requested size in bytes.
        size: usize,
        /// Exclusive lower bound.
        min: usize,
    },

    /// The host allocator could not provide the backing region.
    #[error("failed to allocate pool region: {0}")]
    Host(#[from] io::Error),
}

/// Errors returned by [`crate::MemPool::try_alloc`].
#[derive(Debug, Error)]
pub enum AllocError {
    /// The pool was exhausted and the host allocator failed as well.
    #[error("host allocator failed to provide {size} bytes")]
    Host {
        /// Requested size in bytes.
        size: usize,
        /// Failure reported by the host allocator.
        #[source]
        source: io::Error,
    },
}

/// A broken pool invariant found by [`crate::MemPool::check`].
///
/// Offsets are relative to the start of the pool region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// A free-list entry points outside the region.
    #[error("area at address {addr:#x} on free list {order} lies outside the region")]
    OutOfRegion {
        /// Address of the entry.
        addr: usize,
        /// Free list the entry was found on.
        order: usize,
    },

    /// A free-list entry is not marked free.
    #[error("area at offset {offset} on free list {order} is not marked free")]
    NotFree {
        /// Offset of the area.
        offset: usize,
        /// Free list the area was found on.
        order: usize,
    },

    /// A free-list entry has a size that does not match its list.
    #[error("area at offset {offset} on free list {order} has size {size}, expected {expected}")]
    WrongSize {
        /// Offset of the area.
        offset: usize,
        /// Free list the area was found on.
        order: usize,
        /// Size stored in the header.
        size: usize,
        /// Size of the list's areas.
        expected: usize,
    },

    /// Two buddies of the same size are both free.
    #[error("area at offset {offset} and its buddy at {buddy} are both free at order {order}")]
    FreeBuddy {
        /// Offset of the area.
        offset: usize,
        /// Offset of its buddy.
        buddy: usize,
        /// Order of both areas.
        order: usize,
    },

    /// A free list's cached length disagrees with its contents.
    #[error("free list {order} caches length {cached} but holds {counted} areas")]
    ListLength {
        /// The free list.
        order: usize,
        /// Cached length.
        cached: usize,
        /// Number of linked areas.
        counted: usize,
    },

    /// Free and reserved bytes do not add up to the tiled region.
    #[error("{free} free bytes plus {reserved} reserved bytes do not add up to {expected}")]
    Accounting {
        /// Bytes on the free lists.
        free: usize,
        /// Bytes handed out.
        reserved: usize,
        /// Bytes covered by the initial tiling.
        expected: usize,
    },
}
