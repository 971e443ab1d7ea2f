use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;

use crate::{DEFAULT_SLAB_CAPACITY, SlabPool};

/// A stateless node allocator drawing from the process-wide [`SlabPool`] for `T`.
///
/// Every instance refers to the same pool (see [`SlabPool::shared`]), so all
/// `PoolAllocator<T, N>` values compare equal. Containers parameterized by an allocator can
/// rely on that equality to exchange nodes: a node allocated through one instance may be
/// deallocated through any other.
///
/// `Default` resolves the shared pool once; cloning and copying afterwards are free.
pub struct PoolAllocator<T: Send + 'static, const SLAB_CAPACITY: usize = DEFAULT_SLAB_CAPACITY> {
    pool: &'static SlabPool<T, SLAB_CAPACITY>,
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> PoolAllocator<T, SLAB_CAPACITY> {
    /// Loans one uninitialized slot from the shared pool.
    ///
    /// Returns `None` only if the pool needed to grow and the system allocator failed.
    #[must_use]
    pub fn allocate(&self) -> Option<NonNull<T>> {
        self.pool.allocate()
    }

    /// Returns a slot to the shared pool.
    ///
    /// # Safety
    ///
    /// Same contract as [`SlabPool::deallocate`]: the pointer must come from a
    /// `PoolAllocator` of this type (any instance) or from the system allocator with
    /// `Layout::new::<T>()`, the payload must already be moved out or dropped, and the slot
    /// must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.pool.deallocate(ptr) };
    }

    /// The pool behind this allocator.
    #[must_use]
    pub fn pool(&self) -> &'static SlabPool<T, SLAB_CAPACITY> {
        self.pool
    }
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> Default for PoolAllocator<T, SLAB_CAPACITY> {
    fn default() -> Self {
        Self {
            pool: SlabPool::shared(),
        }
    }
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> Clone for PoolAllocator<T, SLAB_CAPACITY> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> Copy for PoolAllocator<T, SLAB_CAPACITY> {}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> PartialEq for PoolAllocator<T, SLAB_CAPACITY> {
    fn eq(&self, _other: &Self) -> bool {
        // All instances address the one shared pool.
        true
    }
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> Eq for PoolAllocator<T, SLAB_CAPACITY> {}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> fmt::Debug
    for PoolAllocator<T, SLAB_CAPACITY>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolAllocator<u64>: Copy, Send, Sync);

    #[test]
    fn all_instances_compare_equal() {
        struct NodeTypeForEqualityTest(#[allow(dead_code)] u64);

        let a = PoolAllocator::<NodeTypeForEqualityTest>::default();
        let b = PoolAllocator::<NodeTypeForEqualityTest>::default();

        assert_eq!(a, b);
        assert!(std::ptr::eq(a.pool(), b.pool()));
    }

    #[test]
    fn cross_instance_deallocation() {
        struct NodeTypeForCrossTest(#[allow(dead_code)] u64);

        let a = PoolAllocator::<NodeTypeForCrossTest>::default();
        let b = PoolAllocator::<NodeTypeForCrossTest>::default();

        // A node from one instance may be returned through another.
        let slot = a.allocate().unwrap();
        unsafe { b.deallocate(slot) };

        assert_eq!(a.pool().free_slot_count(), a.pool().slab_count() * 4096);
    }
}
