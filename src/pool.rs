//! Memory pool implementation with buddy memory allocation.
//!
//! This module provides the [`MemPool`] and [`MemPoolBuilder`] types. A pool
//! owns one contiguous region carved up by the buddy engine. Requests the
//! region cannot serve spill to the host allocator.

use std::alloc::{Layout, handle_alloc_error};
use std::io::{self, ErrorKind, Write};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::allocator::{DefaultAllocator, HostAllocator};
use crate::area::{AreaHeader, HEADER_SIZE, SANE_MIN, header_of, pow2, size_class, user_ptr};
use crate::buddy::{FreeLists, Region};
use crate::buffer::{Buffer, ReturnInfo};
use crate::error::{AllocError, IntegrityError, PoolError};
use crate::stats::PoolStats;

/// Default number of exhaustion events between two warnings.
const DEFAULT_OVERFLOW_WARN_INTERVAL: u64 = 1000;

/// Builder for creating a [`MemPool`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use buddy_mempool::MemPoolBuilder;
///
/// # fn main() -> Result<(), buddy_mempool::PoolError> {
/// let pool = MemPoolBuilder::new(4 * 1024 * 1024)
///     .overflow_warn_interval(100)
///     .build()?;
/// assert_eq!(pool.size(), 4 * 1024 * 1024);
/// # Ok(())
/// # }
/// ```
pub struct MemPoolBuilder {
    size: usize,
    overflow_warn_interval: u64,
    allocator: Box<dyn HostAllocator>,
}

impl MemPoolBuilder {
    /// Creates a builder for a pool of `size` bytes.
    ///
    /// Default settings:
    /// - Overflow warning every 1000 spills
    /// - Allocator: [`DefaultAllocator`]
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            overflow_warn_interval: DEFAULT_OVERFLOW_WARN_INTERVAL,
            allocator: Box::new(DefaultAllocator::new()),
        }
    }

    /// Sets how many spills to the host allocator happen between two
    /// warnings. The first spill always warns. Zero is treated as one.
    #[must_use]
    pub const fn overflow_warn_interval(mut self, interval: u64) -> Self {
        self.overflow_warn_interval = interval;
        self
    }

    /// Sets the host allocator.
    ///
    /// It provides the pool region and serves requests the pool cannot.
    #[must_use]
    pub fn allocator(mut self, allocator: Box<dyn HostAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Allocates the region and builds the pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::TooSmall`] if the size is not above
    /// [`SANE_MIN`], or [`PoolError::Host`] if the region cannot be allocated.
    pub fn build(self) -> Result<MemPool, PoolError> {
        if self.size <= SANE_MIN {
            return Err(PoolError::TooSmall {
                size: self.size,
                min: SANE_MIN,
            });
        }

        let base = self.allocator.allocate(self.size)?;
        let base = NonNull::new(base).ok_or_else(|| {
            io::Error::new(ErrorKind::OutOfMemory, "host allocator returned null")
        })?;
        let region = Region::new(base, self.size);

        // SAFETY: the region was just allocated for us, aligned to HEADER_SIZE
        let free_lists = unsafe { FreeLists::tile(region) };

        info!(
            size = region.size(),
            tiled = region.tiled_size(),
            "created buddy memory pool"
        );

        let (return_tx, return_rx) = mpsc::unbounded_channel();

        Ok(MemPool {
            shared: Arc::new(Shared {
                region,
                allocator: self.allocator,
                overflow_warn_interval: self.overflow_warn_interval.max(1),
                overflow_count: AtomicU64::new(0),
                return_tx,
                state: Mutex::new(PoolState {
                    free_lists,
                    reserved: 0,
                    return_rx,
                }),
            }),
        })
    }
}

/// A fixed-size memory pool managed by a buddy allocator.
///
/// Requests are rounded up, header included, to a power of two and served
/// from the pool region. When the region has no block left that could serve
/// a request, the request spills to the host allocator; `alloc` never fails.
///
/// # Thread Safety
///
/// The pool is a cheap handle around shared state; clones refer to the same
/// pool. One `tokio::sync::Mutex` protects the free lists and the reserved
/// counter. The synchronous methods block on it and must not be called from
/// within an async runtime; use the `async_` variants there. The host
/// allocator is never called with the lock held.
///
/// # Example
///
/// ```rust
/// use buddy_mempool::MemPool;
///
/// # fn main() -> Result<(), buddy_mempool::PoolError> {
/// let pool = MemPool::new(64 * 1024)?;
///
/// let ptr = pool.alloc(100);
/// assert_eq!(pool.reserved_bytes(), 128);
///
/// unsafe { pool.free(ptr) };
/// assert_eq!(pool.reserved_bytes(), 0);
/// assert!(pool.validate());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemPool {
    shared: Arc<Shared>,
}

impl MemPool {
    /// Creates a pool of `size` bytes with default settings.
    ///
    /// This is equivalent to `MemPoolBuilder::new(size).build()`.
    ///
    /// # Errors
    ///
    /// See [`MemPoolBuilder::build`].
    pub fn new(size: usize) -> Result<Self, PoolError> {
        MemPoolBuilder::new(size).build()
    }

    /// Allocates at least `size` bytes.
    ///
    /// The block comes from the pool if possible and from the host allocator
    /// otherwise. The returned pointer is aligned to [`HEADER_SIZE`] and must
    /// be released with [`free`](Self::free) on this pool.
    ///
    /// This method blocks the current thread while waiting for the lock.
    /// For async contexts, use [`async_alloc`](Self::async_alloc) instead.
    ///
    /// # Panics
    ///
    /// Aborts through [`handle_alloc_error`] if the request spills and the
    /// host allocator fails too.
    #[must_use]
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        self.try_alloc(size)
            .unwrap_or_else(|_| handle_alloc_error(spill_layout(size)))
    }

    /// Allocates at least `size` bytes, reporting host allocator failure.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Host`] if the request spilled and the host
    /// allocator could not serve it.
    pub fn try_alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if let Some(order) = size_class(size) {
            let mut state = self.shared.state.blocking_lock();
            if let Some(ptr) = state.take(order) {
                return Ok(ptr);
            }
        }
        self.shared.spill(size)
    }

    /// Allocates at least `size` bytes without blocking the runtime.
    ///
    /// # Panics
    ///
    /// Aborts like [`alloc`](Self::alloc) if the host allocator fails.
    pub async fn async_alloc(&self, size: usize) -> NonNull<u8> {
        if let Some(order) = size_class(size) {
            let mut state = self.shared.state.lock().await;
            if let Some(ptr) = state.take(order) {
                return ptr;
            }
        }
        self.shared
            .spill(size)
            .unwrap_or_else(|_| handle_alloc_error(spill_layout(size)))
    }

    /// Returns a block to the pool, merging it with free buddies.
    ///
    /// Pointers outside the pool region are handed to the host allocator,
    /// which is only legal once an allocation has spilled.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation on this pool and not
    /// freed since.
    ///
    /// # Panics
    ///
    /// Panics on a foreign pointer before any spill, and on a double free
    /// detected through the block header.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        if self.shared.region.contains(ptr.as_ptr()) {
            let mut state = self.shared.state.blocking_lock();
            // SAFETY: caller guarantees ptr is a live allocation of this pool
            unsafe { state.release(ptr) };
        } else {
            // SAFETY: caller guarantees ptr is a live allocation of this pool
            unsafe { self.shared.free_foreign(ptr) };
        }
    }

    /// Async version of [`free`](Self::free).
    ///
    /// # Safety
    ///
    /// See [`free`](Self::free).
    pub async unsafe fn async_free(&self, ptr: NonNull<u8>) {
        if self.shared.region.contains(ptr.as_ptr()) {
            let mut state = self.shared.state.lock().await;
            // SAFETY: caller guarantees ptr is a live allocation of this pool
            unsafe { state.release(ptr) };
        } else {
            // SAFETY: caller guarantees ptr is a live allocation of this pool
            unsafe { self.shared.free_foreign(ptr) };
        }
    }

    /// Allocates a [`Buffer`] of exactly `len` bytes.
    ///
    /// The buffer releases its block when dropped.
    #[must_use]
    pub fn allocate(&self, len: usize) -> Buffer {
        let ptr = self.alloc(len);
        // SAFETY: ptr was just allocated on this pool for len bytes
        unsafe { Buffer::new(ptr, len, Arc::clone(&self.shared)) }
    }

    /// Async version of [`allocate`](Self::allocate).
    pub async fn async_allocate(&self, len: usize) -> Buffer {
        let ptr = self.async_alloc(len).await;
        // SAFETY: ptr was just allocated on this pool for len bytes
        unsafe { Buffer::new(ptr, len, Arc::clone(&self.shared)) }
    }

    /// Returns the block size, header included, of a pointer returned by
    /// [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool.
    #[must_use]
    pub unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: every allocation carries a header
        unsafe { header_of(ptr).as_ref().size() }
    }

    /// Returns the size of the pool region in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.region.size()
    }

    /// Returns the number of bytes currently handed out from the region.
    ///
    /// Spilled allocations are not counted.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.shared.state.blocking_lock().locked().reserved
    }

    /// Async version of [`reserved_bytes`](Self::reserved_bytes).
    pub async fn async_reserved_bytes(&self) -> usize {
        self.shared.state.lock().await.locked().reserved
    }

    /// Returns how many requests have been served by the host allocator.
    ///
    /// A spill whose host allocation fails is not counted.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow_count.load(Ordering::Acquire)
    }

    /// Returns `true` once any request has been served by the host
    /// allocator.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow_count() > 0
    }

    /// Checks every pool invariant.
    ///
    /// # Errors
    ///
    /// Returns the first broken invariant found.
    pub fn check(&self) -> Result<(), IntegrityError> {
        self.shared.state.blocking_lock().locked().check()
    }

    /// Async version of [`check`](Self::check).
    ///
    /// # Errors
    ///
    /// Returns the first broken invariant found.
    pub async fn async_check(&self) -> Result<(), IntegrityError> {
        self.shared.state.lock().await.locked().check()
    }

    /// Validates the pool, returning `true`.
    ///
    /// # Panics
    ///
    /// Panics with the broken invariant if the pool is corrupted.
    #[must_use]
    pub fn validate(&self) -> bool {
        if let Err(err) = self.check() {
            panic!("memory pool corrupted: {err}");
        }
        true
    }

    /// Async version of [`validate`](Self::validate).
    ///
    /// # Panics
    ///
    /// Panics with the broken invariant if the pool is corrupted.
    pub async fn async_validate(&self) -> bool {
        if let Err(err) = self.async_check().await {
            panic!("memory pool corrupted: {err}");
        }
        true
    }

    /// Returns a snapshot of the free lists and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut state = self.shared.state.blocking_lock();
        self.snapshot(state.locked())
    }

    /// Async version of [`stats`](Self::stats).
    pub async fn async_stats(&self) -> PoolStats {
        let mut state = self.shared.state.lock().await;
        self.snapshot(state.locked())
    }

    fn snapshot(&self, state: &PoolState) -> PoolStats {
        PoolStats {
            size: self.size(),
            reserved: state.reserved,
            overflow_count: self.overflow_count(),
            free_counts: state.free_lists.free_counts(),
        }
    }

    /// Writes the non-empty free lists, the size and the reserved bytes.
    ///
    /// # Errors
    ///
    /// Returns any error from writing to `out`.
    pub fn print(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{}", self.stats())
    }

    /// Async version of [`print`](Self::print).
    ///
    /// # Errors
    ///
    /// Returns any error from writing to `out`.
    pub async fn async_print(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{}", self.async_stats().await)
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("base", &self.shared.region.base())
            .field("size", &self.shared.region.size())
            .field("overflow_count", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

/// Approximate layout reported when a spill cannot be served.
fn spill_layout(size: usize) -> Layout {
    Layout::from_size_align(size.max(1), HEADER_SIZE).unwrap_or(Layout::new::<AreaHeader>())
}

/// State shared by every handle and buffer of one pool.
pub(crate) struct Shared {
    pub(crate) region: Region,
    allocator: Box<dyn HostAllocator>,
    overflow_warn_interval: u64,
    overflow_count: AtomicU64,
    pub(crate) return_tx: mpsc::UnboundedSender<ReturnInfo>,
    state: Mutex<PoolState>,
}

impl Shared {
    /// Serves a request the region cannot from the host allocator.
    ///
    /// The host block carries an area header with its total size so that it
    /// can be handed back with the right size.
    fn spill(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let host_error = |source| AllocError::Host { size, source };
        let total = size
            .max(1)
            .checked_next_multiple_of(HEADER_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| host_error(io::Error::new(ErrorKind::InvalidInput, "size overflow")))?;

        let raw = self.allocator.allocate(total).map_err(host_error)?;
        let area = NonNull::new(raw)
            .ok_or_else(|| {
                host_error(io::Error::new(ErrorKind::OutOfMemory, "host allocator returned null"))
            })?
            .cast::<AreaHeader>();

        // Counted before the pointer escapes so free_foreign accepts it
        let previous = self.overflow_count.fetch_add(1, Ordering::AcqRel);
        if previous % self.overflow_warn_interval == 0 {
            warn!(
                request = size,
                pool_size = self.region.size(),
                occurrences = previous + 1,
                "memory pool exhausted, falling back to the host allocator"
            );
        }

        // SAFETY: the host block is total > HEADER_SIZE bytes, aligned to HEADER_SIZE
        unsafe {
            area.as_ptr().write(AreaHeader::new(total, false));
            Ok(user_ptr(area))
        }
    }

    /// Frees a pointer that lies outside the region.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`spill`](Self::spill).
    ///
    /// # Panics
    ///
    /// Panics if no request has spilled yet, since the pointer then cannot
    /// belong to this pool.
    unsafe fn free_foreign(&self, ptr: NonNull<u8>) {
        assert!(
            self.overflow_count.load(Ordering::Acquire) > 0,
            "pointer {ptr:p} does not belong to this pool"
        );
        // SAFETY: caller guarantees ptr came from spill
        unsafe { self.free_spilled(ptr) };
    }

    /// Returns a spilled block to the host allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`spill`](Self::spill).
    pub(crate) unsafe fn free_spilled(&self, ptr: NonNull<u8>) {
        // SAFETY: spilled blocks carry a header with their total size
        unsafe {
            let area = header_of(ptr);
            let total = area.as_ref().size();
            self.allocator.deallocate(area.as_ptr().cast(), total);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let reserved = self.state.get_mut().locked().reserved;
        if reserved != 0 {
            debug!(reserved, "dropping memory pool with blocks still in use");
        }
        // SAFETY: the region was allocated with this size by this allocator
        unsafe {
            self.allocator
                .deallocate(self.region.base().as_ptr(), self.region.size());
        }
    }
}

/// Internal pool state protected by the mutex.
struct PoolState {
    free_lists: FreeLists,

    /// Bytes handed out from the region.
    reserved: usize,

    /// Blocks queued by dropped buffers.
    return_rx: mpsc::UnboundedReceiver<ReturnInfo>,
}

impl PoolState {
    /// Releases blocks queued by dropped buffers and returns the state.
    ///
    /// Every locked section starts here.
    fn locked(&mut self) -> &mut Self {
        while let Ok(info) = self.return_rx.try_recv() {
            // SAFETY: buffers only queue live in-pool blocks, each exactly once
            unsafe { self.release_area(info.ptr) };
        }
        self
    }

    fn check(&self) -> Result<(), IntegrityError> {
        self.free_lists.check(self.reserved).map(|_| ())
    }

    fn take(&mut self, order: usize) -> Option<NonNull<u8>> {
        let state = self.locked();
        let area = state.free_lists.take(order)?;
        state.reserved += pow2(order);
        // SAFETY: the area is at least MIN_AREA_SIZE bytes
        Some(unsafe { user_ptr(area) })
    }

    /// # Safety
    ///
    /// `ptr` must be a live in-pool allocation.
    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let state = self.locked();
        // SAFETY: forwarded from the caller
        unsafe { state.release_area(ptr) };
    }

    /// # Safety
    ///
    /// `ptr` must be a live in-pool allocation.
    unsafe fn release_area(&mut self, ptr: NonNull<u8>) {
        // SAFETY: in-pool allocations carry a header inside the region
        unsafe {
            let area = header_of(ptr);
            let size = area.as_ref().size();
            self.free_lists.release(area);
            self.reserved -= size;
        }
    }
}
