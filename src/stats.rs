//! Point-in-time view of a pool.

use std::fmt;

use crate::area::{NUM_LISTS, pow2};

/// A snapshot of a pool's free lists and counters.
///
/// The [`Display`](fmt::Display) output has one line per non-empty free list
/// followed by the pool size and reserved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Size of the pool region in bytes.
    pub size: usize,
    /// Bytes currently handed out from the region.
    pub reserved: usize,
    /// Number of requests that spilled to the host allocator so far.
    pub overflow_count: u64,
    /// Number of free areas of `2^i` bytes, indexed by `i`.
    pub free_counts: [usize; NUM_LISTS],
}

impl PoolStats {
    /// Total bytes sitting on the free lists.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_counts
            .iter()
            .enumerate()
            .map(|(order, count)| count * pow2(order))
            .sum()
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (order, count) in self.free_counts.iter().enumerate() {
            if *count > 0 {
                writeln!(
                    f,
                    "free list {order}: {count} areas of {} bytes",
                    pow2(order)
                )?;
            }
        }
        writeln!(f, "pool size {}, reserved {}", self.size, self.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_skips_empty_lists() {
        let mut free_counts = [0; NUM_LISTS];
        free_counts[7] = 1;
        free_counts[15] = 2;
        let stats = PoolStats {
            size: 65536,
            reserved: 128,
            overflow_count: 0,
            free_counts,
        };

        assert_eq!(
            stats.to_string(),
            "free list 7: 1 areas of 128 bytes\n\
             free list 15: 2 areas of 32768 bytes\n\
             pool size 65536, reserved 128\n"
        );
        assert_eq!(stats.free_bytes(), 128 + 2 * 32768);
    }
}
