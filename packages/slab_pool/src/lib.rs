//! Per-type slab pools with a lock-free allocation fast path.
//!
//! This crate provides [`SlabPool`], a growable pool of fixed-size memory slots for a single
//! node type, and [`PoolAllocator`], a stateless façade over the process-wide pool instance
//! for that type. The intended use is recycling the nodes of intrusive containers (queues,
//! free lists) without paying the system allocator on every node.
//!
//! # Design
//!
//! - **Slabs**: memory is acquired from the system allocator one slab at a time. A slab holds
//!   a fixed number of slots and is never released until the pool is dropped, so every pointer
//!   the pool hands out stays valid for the pool's lifetime.
//! - **Lock-free free stack**: free slots form an intrusive LIFO stack linked through the slot
//!   memory itself. Allocation pops with a compare-and-swap loop; deallocation pushes the same
//!   way. The only lock is a back-off spinlock around slab growth, taken once per
//!   `SLAB_CAPACITY` allocations in the worst case.
//! - **Per-type sharing**: [`SlabPool::shared`] returns the one process-wide pool for a given
//!   node type. Because every [`PoolAllocator`] for a type refers to that same pool, all
//!   allocator instances compare equal and containers backed by them can exchange nodes
//!   freely.
//!
//! The pool deals in raw, uninitialized slots: it does not construct or drop values. Callers
//! move payloads in and out of the slots they are loaned.
//!
//! # Examples
//!
//! ```rust
//! use slab_pool::SlabPool;
//!
//! let pool = SlabPool::<u64>::new();
//!
//! let slot = pool.allocate().expect("system allocator failed");
//!
//! // SAFETY: The slot is ours until deallocated and is valid for writes of u64.
//! unsafe { slot.as_ptr().write(42) };
//! // SAFETY: We just wrote this value.
//! assert_eq!(unsafe { slot.as_ptr().read() }, 42);
//!
//! // SAFETY: The slot came from this pool and is not used afterwards.
//! unsafe { pool.deallocate(slot) };
//! ```
//!
//! Sharing the process-wide pool through the allocator façade:
//!
//! ```rust
//! use slab_pool::PoolAllocator;
//!
//! let a = PoolAllocator::<u32>::default();
//! let b = PoolAllocator::<u32>::default();
//!
//! // All allocators of one type address the same pool.
//! assert_eq!(a, b);
//! ```

mod allocator;
mod pool;
mod spin;

pub use allocator::PoolAllocator;
pub use pool::{DEFAULT_SLAB_CAPACITY, SlabPool};
pub use spin::{SpinLock, SpinMutex};
