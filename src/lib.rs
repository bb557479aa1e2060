//! # buddy-mempool
//!
//! A fixed-size memory pool managed by a power-of-two buddy allocator.
//!
//! ## Features
//!
//! - **Buddy Memory Allocation**: 64 free lists, one per power of two, with
//!   O(log N) allocation by splitting and O(log N) release by merging buddies
//! - **In-band Headers**: every block starts with a one-word header holding its
//!   size and free flag; free blocks double as their own list nodes
//! - **Host Spill**: requests the pool cannot serve go to a pluggable
//!   [`HostAllocator`], so allocation never fails
//! - **Introspection**: invariant checking, free-list stats and a text dump
//! - **Both Sync and Async APIs**: one mutex per pool, with `async_` entry
//!   points for tokio environments
//!
//! ## Example
//!
//! ```rust
//! use buddy_mempool::{HEADER_SIZE, MemPool};
//!
//! # fn main() -> Result<(), buddy_mempool::PoolError> {
//! let pool = MemPool::new(64 * 1024)?;
//!
//! // 100 bytes plus the header round up to a 128-byte block
//! let ptr = pool.alloc(100);
//! assert_eq!(pool.reserved_bytes(), 128);
//! assert_eq!(ptr.as_ptr() as usize % HEADER_SIZE, 0);
//!
//! unsafe { pool.free(ptr) };
//! assert!(pool.validate());
//!
//! // Or let a buffer hand its block back when dropped
//! let mut buffer = pool.allocate(4000);
//! buffer[0] = 1;
//! drop(buffer);
//! assert_eq!(pool.reserved_bytes(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Async Example
//!
//! ```rust
//! use buddy_mempool::MemPool;
//!
//! # async fn example() -> Result<(), buddy_mempool::PoolError> {
//! let pool = MemPool::new(1024 * 1024)?;
//! let buffer = pool.async_allocate(4096).await;
//! assert_eq!(buffer.len(), 4096);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod area;
mod buddy;
mod buffer;
mod error;
mod intrusive_list;
mod pool;
mod stats;

pub use allocator::{DefaultAllocator, HostAllocator};
pub use area::{HEADER_SIZE, MIN_AREA_SIZE, NUM_LISTS, SANE_MIN};
pub use buffer::Buffer;
pub use error::{AllocError, IntegrityError, PoolError};
pub use pool::{MemPool, MemPoolBuilder};
pub use stats::PoolStats;
