//! In-band area headers and power-of-two size math.
//!
//! Every block the pool manages, free or handed out, starts with an
//! [`AreaHeader`]. The header packs the block size and a free flag into one
//! word: bit 0 is the flag and the remaining bits hold the size. Sizes are
//! powers of two no smaller than [`MIN_AREA_SIZE`], so bit 0 of a size is
//! always clear.
//!
//! While an area is free, the two list links follow the header (see
//! [`FreeArea`]). Once the area is handed out those bytes belong to the client,
//! whose pointer starts right after the header.

use std::ptr::NonNull;

use crate::intrusive_list::IntrusiveNode;

/// Header placed at the start of every area.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct AreaHeader {
    size_and_free: usize,
}

/// A free area as it sits on a free list: the header followed by the links.
pub type FreeArea = IntrusiveNode<AreaHeader>;

/// Bytes in front of every pointer handed to a client.
pub const HEADER_SIZE: usize = size_of::<AreaHeader>();

/// Smallest area, header included.
pub const MIN_AREA_SIZE: usize = 2 * HEADER_SIZE;

/// Number of free lists, one per order.
pub const NUM_LISTS: usize = 64;

/// Order of [`MIN_AREA_SIZE`].
pub const MIN_ORDER: usize = MIN_AREA_SIZE.trailing_zeros() as usize;

/// Pools must be strictly larger than this many bytes.
pub const SANE_MIN: usize = 10_000;

const FREE_FLAG: usize = 1;

const _: () = {
    assert!(MIN_AREA_SIZE.is_power_of_two());
    assert!(MIN_AREA_SIZE >= size_of::<FreeArea>());
};

impl AreaHeader {
    /// Creates a header for an area of `size` bytes.
    pub const fn new(size: usize, free: bool) -> Self {
        debug_assert!(size & FREE_FLAG == 0);
        Self {
            size_and_free: size | free as usize,
        }
    }

    /// Total size of the area, header included.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size_and_free & !FREE_FLAG
    }

    /// Sets the size and keeps the free flag.
    #[inline]
    pub const fn set_size(&mut self, size: usize) {
        debug_assert!(size & FREE_FLAG == 0, "area sizes are even");
        self.size_and_free = size | (self.size_and_free & FREE_FLAG);
    }

    #[inline]
    pub const fn is_free(&self) -> bool {
        self.size_and_free & FREE_FLAG != 0
    }

    /// Sets the free flag and keeps the size.
    #[inline]
    pub const fn set_free(&mut self, free: bool) {
        self.size_and_free = (self.size_and_free & !FREE_FLAG) | free as usize;
    }
}

/// Returns `2^order`.
#[inline]
pub const fn pow2(order: usize) -> usize {
    debug_assert!(order < usize::BITS as usize);
    1 << order
}

/// Returns the least `i` with `2^i >= n`, or `None` if `2^i` is not representable.
#[inline]
pub const fn order(n: usize) -> Option<usize> {
    match n.checked_next_power_of_two() {
        Some(p) => Some(p.trailing_zeros() as usize),
        None => None,
    }
}

/// Returns the greatest `i` with `2^i <= n`. `n` must be non-zero.
#[inline]
pub const fn order_floor(n: usize) -> usize {
    n.ilog2() as usize
}

/// Maps a client request to the order of the area that serves it.
///
/// Returns `None` when the rounded size has no order below [`NUM_LISTS`];
/// such requests can only be served by the host allocator.
#[inline]
pub const fn size_class(request: usize) -> Option<usize> {
    let Some(total) = request.checked_add(HEADER_SIZE) else {
        return None;
    };
    let total = if total < MIN_AREA_SIZE {
        MIN_AREA_SIZE
    } else {
        total
    };
    match order(total) {
        Some(order) if order < NUM_LISTS => Some(order),
        _ => None,
    }
}

/// Returns the header of the area a client pointer belongs to.
///
/// # Safety
///
/// `ptr` must have been produced by [`user_ptr`].
#[inline]
pub const unsafe fn header_of(ptr: NonNull<u8>) -> NonNull<AreaHeader> {
    // SAFETY: caller guarantees a header sits right in front of ptr
    unsafe { ptr.sub(HEADER_SIZE).cast() }
}

/// Returns the client pointer for an area.
///
/// # Safety
///
/// `area` must point to an area of at least [`MIN_AREA_SIZE`] bytes.
#[inline]
pub const unsafe fn user_ptr(area: NonNull<AreaHeader>) -> NonNull<u8> {
    // SAFETY: every area is larger than its header
    unsafe { area.cast::<u8>().add(HEADER_SIZE) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(MIN_AREA_SIZE, 32);
        assert_eq!(MIN_ORDER, 5);
        assert_eq!(std::mem::align_of::<AreaHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_order() {
        assert_eq!(order(0), Some(0));
        assert_eq!(order(1), Some(0));
        assert_eq!(order(2), Some(1));
        assert_eq!(order(3), Some(2));
        assert_eq!(order(128), Some(7));
        assert_eq!(order(129), Some(8));
        assert_eq!(order(usize::MAX), None);
    }

    #[test]
    fn test_order_floor() {
        assert_eq!(order_floor(1), 0);
        assert_eq!(order_floor(32), 5);
        assert_eq!(order_floor(63), 5);
        assert_eq!(order_floor(65536), 16);
        assert_eq!(order_floor(100_000), 16);
    }

    #[test]
    fn test_size_class() {
        // Tiny requests still get a block that can hold the free-list links
        assert_eq!(size_class(0), Some(MIN_ORDER));
        assert_eq!(size_class(1), Some(MIN_ORDER));
        assert_eq!(size_class(16), Some(MIN_ORDER));
        assert_eq!(size_class(17), Some(6));
        assert_eq!(size_class(100), Some(7));
        assert_eq!(size_class(112), Some(7));
        assert_eq!(size_class(113), Some(8));
        assert_eq!(size_class(usize::MAX), None);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_size_class_top_order() {
        assert_eq!(size_class((1 << 63) - HEADER_SIZE), Some(63));
        assert_eq!(size_class((1 << 63) - HEADER_SIZE + 1), None);
    }

    #[test]
    fn test_header_packing() {
        let mut header = AreaHeader::new(128, true);
        assert_eq!(header.size(), 128);
        assert!(header.is_free());

        header.set_size(64);
        assert_eq!(header.size(), 64);
        assert!(header.is_free());

        header.set_free(false);
        assert_eq!(header.size(), 64);
        assert!(!header.is_free());

        header.set_size(1 << 20);
        assert_eq!(header.size(), 1 << 20);
        assert!(!header.is_free());
    }

    #[test]
    fn test_user_ptr_roundtrip() {
        let mut backing = [AreaHeader::new(0, false), AreaHeader::new(0, false)];
        let area = NonNull::from(&mut backing[0]);
        unsafe {
            let ptr = user_ptr(area);
            assert_eq!(ptr.as_ptr() as usize - area.as_ptr() as usize, HEADER_SIZE);
            assert_eq!(header_of(ptr), area);
        }
    }
}
