//! Buddy engine over a single contiguous region.
//!
//! The region is tiled greedily by decreasing powers of two at creation. Free
//! areas are kept on 64 intrusive lists indexed by order. Allocation splits a
//! larger area in halves until the requested order is available; release
//! merges an area with its buddy for as long as the buddy is free and of the
//! same size.
//!
//! For an area at offset `o` with size `s`, the buddy sits at `o + s` when
//! `o` is a multiple of `2s` and at `o - s` otherwise. An area whose higher
//! buddy would end past the region has no buddy.

use std::ptr::NonNull;

use crate::area::{AreaHeader, FreeArea, MIN_AREA_SIZE, MIN_ORDER, NUM_LISTS, order_floor, pow2};
use crate::error::IntegrityError;
use crate::intrusive_list::{IntrusiveList, IntrusiveNode};

/// The backing bytes of a pool.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: Region is an address range; access to the bytes is synchronized by the pool
unsafe impl Send for Region {}

// SAFETY: see above
unsafe impl Sync for Region {}

impl Region {
    pub const fn new(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bytes covered by the initial tiling.
    pub const fn tiled_size(&self) -> usize {
        self.size - self.size % MIN_AREA_SIZE
    }

    /// Returns `true` if `ptr` lies in `[base, base + size)`.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr.addr()
            .checked_sub(self.base.as_ptr().addr())
            .is_some_and(|offset| offset < self.size)
    }

    #[inline]
    fn offset_of(&self, area: NonNull<AreaHeader>) -> usize {
        area.as_ptr().addr().wrapping_sub(self.base.as_ptr().addr())
    }

    /// # Safety
    ///
    /// `offset` must be the start of an area inside the region.
    #[inline]
    unsafe fn area_at(&self, offset: usize) -> NonNull<AreaHeader> {
        // SAFETY: caller guarantees the offset is in bounds
        unsafe { self.base.add(offset).cast() }
    }
}

/// Returns the offset of the buddy of the area at `offset` with `size` bytes.
#[inline]
pub const fn buddy_offset(offset: usize, size: usize, region_size: usize) -> Option<usize> {
    if offset % (2 * size) == 0 {
        if offset + 2 * size > region_size {
            None
        } else {
            Some(offset + size)
        }
    } else {
        Some(offset - size)
    }
}

/// The free-list array and the region it carves up.
///
/// Every method expects exclusive access, which the pool provides by keeping
/// this behind its mutex.
pub struct FreeLists {
    region: Region,
    lists: [IntrusiveList<AreaHeader>; NUM_LISTS],
}

impl FreeLists {
    /// Tiles `region` into free areas.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, aligned to
    /// [`crate::HEADER_SIZE`], and exclusively owned by the returned value.
    pub unsafe fn tile(region: Region) -> Self {
        let mut free_lists = Self {
            region,
            lists: std::array::from_fn(|_| IntrusiveList::new()),
        };

        let mut used = 0;
        while region.size - used >= MIN_AREA_SIZE {
            let order = order_floor(region.size - used);
            // SAFETY: the area [used, used + 2^order) lies inside the region
            unsafe {
                let area = region.area_at(used);
                area.as_ptr().write(AreaHeader::new(pow2(order), true));
                free_lists.push(area, order);
            }
            used += pow2(order);
        }

        free_lists
    }

    /// Links a free area into list `order`.
    ///
    /// # Safety
    ///
    /// `area` must be a free area of `2^order` bytes that is on no list.
    unsafe fn push(&mut self, area: NonNull<AreaHeader>, order: usize) {
        let node = area.cast::<FreeArea>();
        // SAFETY: the area is at least MIN_AREA_SIZE, which fits a FreeArea
        unsafe {
            IntrusiveNode::reset_links(node);
            self.lists[order].push_front(node);
        }
    }

    /// Makes list `order` non-empty by splitting an area of the next order.
    ///
    /// Returns `false` when no larger area is left to split.
    pub fn fill(&mut self, order: usize) -> bool {
        if order >= NUM_LISTS - 1 {
            return false;
        }
        if self.lists[order + 1].is_empty() && !self.fill(order + 1) {
            return false;
        }
        let Some(node) = self.lists[order + 1].pop_front() else {
            return false;
        };

        let area = node.cast::<AreaHeader>();
        let half = pow2(order);
        // SAFETY: the area was on list order + 1, so both halves are ours
        unsafe {
            debug_assert!(area.as_ref().is_free());
            let upper = area.cast::<u8>().add(half).cast::<AreaHeader>();
            upper.as_ptr().write(AreaHeader::new(half, true));
            self.push(upper, order);

            (*area.as_ptr()).set_size(half);
            self.push(area, order);
        }
        true
    }

    /// Takes a free area of `2^order` bytes, splitting larger areas if needed.
    ///
    /// The returned area is marked in use. Returns `None` when the region has
    /// no area left that could be split down to `order`.
    pub fn take(&mut self, order: usize) -> Option<NonNull<AreaHeader>> {
        debug_assert!(order >= MIN_ORDER, "order {order} cannot hold a free area");
        if self.lists[order].is_empty() && !self.fill(order) {
            return None;
        }
        let area = self.lists[order].pop_front()?.cast::<AreaHeader>();

        // SAFETY: areas on a free list are valid headers inside the region
        let header = unsafe { &mut *area.as_ptr() };
        assert!(
            header.is_free() && header.size() == pow2(order),
            "free list {order} holds a corrupted area at offset {}",
            self.region.offset_of(area)
        );
        header.set_free(false);
        Some(area)
    }

    /// Returns an in-use area to the free lists, merging it with free buddies.
    ///
    /// Returns the order of the area that ends up on a free list.
    ///
    /// # Safety
    ///
    /// `area` must have been returned by [`take`](Self::take) on this value
    /// and not released since.
    pub unsafe fn release(&mut self, area: NonNull<AreaHeader>) -> usize {
        let mut offset = self.region.offset_of(area);
        // SAFETY: caller guarantees area is a live header inside the region
        let header = unsafe { area.as_ref() };
        let mut size = header.size();
        assert!(!header.is_free(), "double free of pool area at offset {offset}");
        assert!(
            size.is_power_of_two() && size >= MIN_AREA_SIZE && offset + size <= self.region.size,
            "corrupted area header at offset {offset}: size {size}"
        );
        let mut order = size.trailing_zeros() as usize;

        while let Some(buddy) = buddy_offset(offset, size, self.region.size) {
            // SAFETY: buddy offsets always start an area of the current tiling
            let buddy_area = unsafe { self.region.area_at(buddy) };
            // SAFETY: see above
            let buddy_header = unsafe { buddy_area.as_ref() };
            if !buddy_header.is_free() || buddy_header.size() != size {
                break;
            }

            // SAFETY: a free area of 2^order bytes is on list `order`
            unsafe { self.lists[order].remove(buddy_area.cast()) };

            offset = offset.min(buddy);
            size *= 2;
            order += 1;
            // SAFETY: the merged area starts at the lower of the two buddies
            unsafe { (*self.region.area_at(offset).as_ptr()).set_size(size) };
        }

        // SAFETY: the merged area is ours and on no list
        unsafe {
            let merged = self.region.area_at(offset);
            (*merged.as_ptr()).set_free(true);
            self.push(merged, order);
        }
        order
    }

    /// Returns the number of areas on each free list.
    pub fn free_counts(&self) -> [usize; NUM_LISTS] {
        std::array::from_fn(|order| self.lists[order].len())
    }

    /// Walks every free list and checks the buddy invariants.
    ///
    /// Returns the number of free bytes on success.
    pub fn check(&self, reserved: usize) -> Result<usize, IntegrityError> {
        let mut free_total = 0;

        for (order, list) in self.lists.iter().enumerate() {
            let expected = pow2(order);
            let mut counted = 0;

            for node in list.iter() {
                counted += 1;
                let area = node.cast::<AreaHeader>();
                if !self.region.contains(area.as_ptr().cast()) {
                    return Err(IntegrityError::OutOfRegion {
                        addr: area.as_ptr().addr(),
                        order,
                    });
                }
                let offset = self.region.offset_of(area);
                if offset + expected > self.region.size {
                    return Err(IntegrityError::OutOfRegion {
                        addr: area.as_ptr().addr(),
                        order,
                    });
                }

                // SAFETY: the area lies inside the region
                let header = unsafe { area.as_ref() };
                if !header.is_free() {
                    return Err(IntegrityError::NotFree { offset, order });
                }
                if header.size() != expected {
                    return Err(IntegrityError::WrongSize {
                        offset,
                        order,
                        size: header.size(),
                        expected,
                    });
                }

                if let Some(buddy) = buddy_offset(offset, expected, self.region.size) {
                    // SAFETY: buddy offsets always start an area of the current tiling
                    let buddy_header = unsafe { self.region.area_at(buddy).as_ref() };
                    if buddy_header.is_free() && buddy_header.size() == expected {
                        return Err(IntegrityError::FreeBuddy {
                            offset,
                            buddy,
                            order,
                        });
                    }
                }

                free_total += expected;
            }

            if counted != list.len() {
                return Err(IntegrityError::ListLength {
                    order,
                    cached: list.len(),
                    counted,
                });
            }
        }

        if free_total + reserved != self.region.tiled_size() {
            return Err(IntegrityError::Accounting {
                free: free_total,
                reserved,
                expected: self.region.tiled_size(),
            });
        }

        Ok(free_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::HEADER_SIZE;
    use std::alloc::{Layout, alloc, dealloc};

    struct TestRegion {
        layout: Layout,
        region: Region,
    }

    impl TestRegion {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, HEADER_SIZE).unwrap();
            let base = NonNull::new(unsafe { alloc(layout) }).unwrap();
            Self {
                layout,
                region: Region::new(base, size),
            }
        }

        fn lists(&self) -> FreeLists {
            unsafe { FreeLists::tile(self.region) }
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.region.base.as_ptr(), self.layout) };
        }
    }

    fn nonempty(counts: &[usize; NUM_LISTS]) -> Vec<(usize, usize)> {
        counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(order, count)| (order, *count))
            .collect()
    }

    #[test]
    fn test_buddy_offset() {
        // Lower half of a pair
        assert_eq!(buddy_offset(0, 64, 1024), Some(64));
        assert_eq!(buddy_offset(128, 64, 1024), Some(192));
        // Upper half of a pair
        assert_eq!(buddy_offset(64, 64, 1024), Some(0));
        assert_eq!(buddy_offset(192, 64, 1024), Some(128));
        // The top-level tile has no buddy
        assert_eq!(buddy_offset(0, 1024, 1024), None);
        // Higher buddy would straddle the end of the region
        assert_eq!(buddy_offset(1024, 512, 1600), None);
    }

    #[test]
    fn test_region_contains() {
        let test = TestRegion::new(1024);
        let base = test.region.base().as_ptr();
        assert!(test.region.contains(base));
        assert!(test.region.contains(base.wrapping_add(1023)));
        assert!(!test.region.contains(base.wrapping_add(1024)));
        assert!(!test.region.contains(base.wrapping_sub(1)));
    }

    #[test]
    fn test_tile_power_of_two() {
        let test = TestRegion::new(64 * 1024);
        let lists = test.lists();
        assert_eq!(nonempty(&lists.free_counts()), [(16, 1)]);
        assert_eq!(lists.check(0), Ok(64 * 1024));
    }

    #[test]
    fn test_tile_odd_size() {
        // 100_007 = 65536 + 32768 + 1024 + 512 + 128 + 32 + 7
        let test = TestRegion::new(100_007);
        let lists = test.lists();
        assert_eq!(
            nonempty(&lists.free_counts()),
            [(5, 1), (7, 1), (9, 1), (10, 1), (15, 1), (16, 1)]
        );
        assert_eq!(test.region.tiled_size(), 100_000);
        assert_eq!(lists.check(0), Ok(100_000));
    }

    #[test]
    fn test_fill_splits_down() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();

        assert!(lists.fill(MIN_ORDER));
        let counts = lists.free_counts();
        assert_eq!(counts[MIN_ORDER], 2);
        for order in MIN_ORDER + 1..10 {
            assert_eq!(counts[order], 1, "order {order}");
        }
        assert_eq!(counts[10], 0);

        // The lower half sits at the head of the list
        let head = lists.lists[MIN_ORDER].peek_front().unwrap();
        assert_eq!(head.cast::<u8>(), test.region.base());

        // Both halves are free until one of them is taken
        assert!(matches!(lists.check(0), Err(IntegrityError::FreeBuddy { order: 5, .. })));
        lists.take(MIN_ORDER).unwrap();
        assert_eq!(lists.check(32), Ok(992));
    }

    #[test]
    fn test_fill_fails_at_top_order() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();
        assert!(!lists.fill(NUM_LISTS - 1));
        assert!(!lists.fill(10));
        assert_eq!(lists.check(0), Ok(1024));
    }

    #[test]
    fn test_take_and_release_coalesce() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();
        let initial = lists.free_counts();

        let a = lists.take(MIN_ORDER).unwrap();
        let b = lists.take(MIN_ORDER).unwrap();
        assert_eq!(lists.check(64), Ok(960));

        unsafe {
            assert!(!a.as_ref().is_free());
            assert_eq!(a.as_ref().size(), 32);
            // b is a's buddy, which is in use, so nothing merges
            assert_eq!(lists.release(a), MIN_ORDER);
            assert_eq!(lists.check(32), Ok(992));
            // Releasing b merges all the way back up
            assert_eq!(lists.release(b), 10);
        }

        assert_eq!(lists.free_counts(), initial);
        assert_eq!(lists.check(0), Ok(1024));
    }

    #[test]
    fn test_take_exhausted() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();

        let whole = lists.take(10).unwrap();
        assert!(lists.take(MIN_ORDER).is_none());
        assert!(lists.take(11).is_none());

        unsafe {
            lists.release(whole);
        }
        assert!(lists.take(MIN_ORDER).is_some());
    }

    #[test]
    fn test_check_detects_free_buddies() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();
        let a = lists.take(9).unwrap();
        // Link the in-use half without merging, as a broken release would
        unsafe {
            (*a.as_ptr()).set_free(true);
            lists.push(a, 9);
        }
        assert_eq!(
            lists.check(0),
            Err(IntegrityError::FreeBuddy {
                offset: 0,
                buddy: 512,
                order: 9,
            })
        );
    }

    #[test]
    fn test_check_detects_accounting_drift() {
        let test = TestRegion::new(1024);
        let lists = test.lists();
        assert_eq!(
            lists.check(32),
            Err(IntegrityError::Accounting {
                free: 1024,
                reserved: 32,
                expected: 1024,
            })
        );
    }

    #[test]
    fn test_check_detects_wrong_size() {
        let test = TestRegion::new(1024);
        let lists = test.lists();
        unsafe { (*test.region.area_at(0).as_ptr()).set_size(512) };
        assert_eq!(
            lists.check(0),
            Err(IntegrityError::WrongSize {
                offset: 0,
                order: 10,
                size: 512,
                expected: 1024,
            })
        );
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_release_double_free_panics() {
        let test = TestRegion::new(1024);
        let mut lists = test.lists();
        let a = lists.take(MIN_ORDER).unwrap();
        let _b = lists.take(MIN_ORDER).unwrap();
        unsafe {
            lists.release(a);
            lists.release(a);
        }
    }
}
