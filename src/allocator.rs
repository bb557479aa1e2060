//! Host allocator trait and default implementation.
//!
//! The pool takes its backing region from a [`HostAllocator`] and hands
//! requests it cannot serve to the same allocator. [`DefaultAllocator`] uses
//! the standard library's global allocator.

use std::alloc::{Layout, alloc, dealloc};
use std::io::{Error, ErrorKind, Result};

use crate::area::HEADER_SIZE;

/// Trait for host allocation backends.
///
/// # Safety
///
/// Implementations must ensure:
/// - `allocate` returns a pointer valid for `size` bytes and aligned to at
///   least [`HEADER_SIZE`](crate::HEADER_SIZE)
/// - The allocated memory remains valid until `deallocate` is called
///
/// # Example
///
/// ```rust
/// use buddy_mempool::HostAllocator;
/// use std::io::Result;
///
/// struct MyAllocator;
///
/// impl HostAllocator for MyAllocator {
///     fn allocate(&self, size: usize) -> Result<*mut u8> {
///         // Custom allocation logic
///         # unimplemented!()
///     }
///
///     unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
///         // Custom deallocation logic
///         # unimplemented!()
///     }
/// }
/// ```
pub trait HostAllocator: Send + Sync {
    /// Allocates `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation fails due to memory exhaustion or
    /// invalid size.
    fn allocate(&self, size: usize) -> Result<*mut u8>;

    /// Deallocates memory previously allocated by this allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `ptr` was returned by a previous call to `allocate` on this allocator
    /// - `size` matches the size passed to the original `allocate` call
    /// - The memory has not already been deallocated
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize);
}

/// Default allocator using the standard library's global allocator.
///
/// Allocations are aligned to the area header size, which is all the pool
/// needs for both its region and spilled requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl DefaultAllocator {
    const ALIGNMENT: usize = HEADER_SIZE;

    /// Creates a new default allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostAllocator for DefaultAllocator {
    fn allocate(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "size must be > 0"));
        }

        let layout = Layout::from_size_align(size, Self::ALIGNMENT)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, e))?;

        // SAFETY: layout is valid (non-zero size, valid alignment)
        let ptr = unsafe { alloc(layout) };

        if ptr.is_null() {
            Err(Error::new(
                ErrorKind::OutOfMemory,
                "failed to allocate memory",
            ))
        } else {
            Ok(ptr)
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        if size == 0 || ptr.is_null() {
            return;
        }

        if let Ok(layout) = Layout::from_size_align(size, Self::ALIGNMENT) {
            // SAFETY: ptr was allocated with this layout by allocate()
            unsafe { dealloc(ptr, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allocator_basic() {
        let allocator = DefaultAllocator::new();

        let size = 64 * 1024;
        let ptr = allocator.allocate(size).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % HEADER_SIZE, 0);

        // Write and read back
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, size);
            assert_eq!(*ptr, 0xAB);
            assert_eq!(*ptr.add(size - 1), 0xAB);
        }

        unsafe {
            allocator.deallocate(ptr, size);
        }
    }

    #[test]
    fn test_default_allocator_zero_size() {
        let allocator = DefaultAllocator::new();
        let result = allocator.allocate(0);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_default_allocator_oversized() {
        let allocator = DefaultAllocator::new();
        let result = allocator.allocate(usize::MAX - 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_default_allocator_small_odd_sizes() {
        let allocator = DefaultAllocator::new();
        for size in [1, 3, 17, 33] {
            let ptr = allocator.allocate(size).unwrap();
            assert_eq!(ptr as usize % HEADER_SIZE, 0);
            unsafe { allocator.deallocate(ptr, size) };
        }
    }
}
