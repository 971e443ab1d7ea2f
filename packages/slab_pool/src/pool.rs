use std::alloc::{Layout, alloc, dealloc};
use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicPtr, Ordering};

use hash_hasher::HashedMap;
use parking_lot::Mutex;

use crate::SpinMutex;

/// Slab size used by [`SlabPool`] unless the caller picks another one.
pub const DEFAULT_SLAB_CAPACITY: usize = 4096;

/// Process-wide pools handed out by [`SlabPool::shared`], keyed by the concrete pool type.
///
/// This is a transparent map: `TypeId` is already a hash, so hashing it again would be
/// redundant.
static SHARED_POOLS: LazyLock<Mutex<HashedMap<TypeId, &'static (dyn Any + Send + Sync)>>> =
    LazyLock::new(|| Mutex::new(HashedMap::default()));

/// Intrusive link written into a slot while it rests on the free stack.
///
/// A slot is either loaned out (its bytes belong to the caller) or free (its first
/// pointer-width bytes hold this link). Slot size and alignment are chosen so both uses fit.
struct FreeSlot {
    next: AtomicPtr<FreeSlot>,
}

/// Header at the start of every slab allocation, linking slabs into a singly linked list.
struct SlabHeader {
    next: *mut SlabHeader,
}

/// A growable pool of uninitialized memory slots for values of type `T`.
///
/// The pool acquires memory from the system allocator one slab of `SLAB_CAPACITY` slots at a
/// time and never releases a slab until it is dropped. Free slots form an intrusive lock-free
/// LIFO stack, so [`allocate`](Self::allocate) and [`deallocate`](Self::deallocate) are a
/// compare-and-swap loop each; only slab growth takes a lock (a back-off spinlock), once per
/// `SLAB_CAPACITY` allocations in the worst case.
///
/// The pool loans raw slots. It neither constructs nor drops `T` values; callers move
/// payloads in and out of loaned slots and must return every slot before dropping the pool.
///
/// # ABA
///
/// The free stack is immune to the ABA problem: slot addresses are unique within the pool and
/// a slot is either loaned out or on the stack, never both, so the same pointer cannot appear
/// twice in the stack at one instant.
pub struct SlabPool<T, const SLAB_CAPACITY: usize = DEFAULT_SLAB_CAPACITY> {
    /// Head of the lock-free free stack.
    free_head: AtomicPtr<FreeSlot>,

    /// Most recently allocated slab; earlier slabs are reachable through the header links.
    /// Written only under `grow_lock`, read lock-free by `owns`.
    slab_head: AtomicPtr<SlabHeader>,

    /// Serializes slab growth. Never held while popping or pushing free slots.
    grow_lock: SpinMutex<()>,

    _items: PhantomData<T>,
}

// SAFETY: The pool stores only raw uninitialized slots and hands them across threads; it
// never creates references to `T`. `T: Send` covers a payload being written on one thread
// and dropped on another after the slot changes hands.
unsafe impl<T: Send, const SLAB_CAPACITY: usize> Send for SlabPool<T, SLAB_CAPACITY> {}
// SAFETY: All shared-state mutation goes through atomics or the grow lock; see `Send` above
// for the payload argument.
unsafe impl<T: Send, const SLAB_CAPACITY: usize> Sync for SlabPool<T, SLAB_CAPACITY> {}

const fn max_usize(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

impl<T, const SLAB_CAPACITY: usize> SlabPool<T, SLAB_CAPACITY> {
    /// A slot must hold either a loaned-out `T` or a `FreeSlot` link.
    const SLOT_ALIGN: usize = max_usize(align_of::<T>(), align_of::<FreeSlot>());

    /// Distance between consecutive slots: the larger payload, rounded up to the alignment.
    const SLOT_STRIDE: usize = {
        let raw = max_usize(size_of::<T>(), size_of::<FreeSlot>());
        (raw + Self::SLOT_ALIGN - 1) & !(Self::SLOT_ALIGN - 1)
    };

    /// Creates a new empty pool. The first slab is allocated on first use.
    #[must_use]
    pub const fn new() -> Self {
        const {
            assert!(SLAB_CAPACITY > 0, "SlabPool must have non-zero slab capacity");
        }

        Self {
            free_head: AtomicPtr::new(std::ptr::null_mut()),
            slab_head: AtomicPtr::new(std::ptr::null_mut()),
            grow_lock: SpinMutex::new(()),
            _items: PhantomData,
        }
    }

    /// Layout of one slab allocation and the offset from its start to the first slot.
    fn slab_layout() -> (Layout, usize) {
        let header = Layout::new::<SlabHeader>();

        let slots = Layout::from_size_align(
            Self::SLOT_STRIDE
                .checked_mul(SLAB_CAPACITY)
                .expect("slab capacity overflow"),
            Self::SLOT_ALIGN,
        )
        .expect("slot array layout must be calculable");

        let (combined, slots_offset) = header
            .extend(slots)
            .expect("layout extension cannot fail for valid layouts with reasonable sizes");

        (combined.pad_to_align(), slots_offset)
    }

    /// Loans out one uninitialized slot, valid for reads and writes of `T`.
    ///
    /// Returns `None` only if the pool is exhausted and the system allocator refused to
    /// provide a new slab.
    ///
    /// The slot stays valid until it is passed to [`deallocate`](Self::deallocate) or the
    /// pool is dropped.
    #[must_use]
    pub fn allocate(&self) -> Option<NonNull<T>> {
        let mut head = self.free_head.load(Ordering::Acquire);

        loop {
            if head.is_null() {
                // Pool exhausted. Grow under the lock, re-checking first: another thread
                // may have grown (or freed slots) while we waited for the lock.
                let guard = self.grow_lock.lock();

                head = self.free_head.load(Ordering::Acquire);
                if head.is_null() {
                    self.grow();
                    head = self.free_head.load(Ordering::Acquire);
                }

                drop(guard);

                if head.is_null() {
                    // Growth failed: out of memory.
                    return None;
                }
            }

            // SAFETY: `head` points into a slab and slabs are never freed while the pool is
            // alive, so the load targets valid memory. If another thread popped `head` first
            // and is already reusing the slot, we read a stale link, but the compare-exchange
            // below fails in that case and the value is discarded.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };

            match self.free_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // SAFETY: We won the pop; `head` came from a slab allocation and is non-null.
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(head.cast::<T>()) }),
                Err(actual) => head = actual,
            }
        }
    }

    /// Returns a slot to the pool.
    ///
    /// Pool-owned pointers go back onto the free stack. A foreign pointer is released
    /// through the system allocator instead, which supports containers that mix pool nodes
    /// with nodes allocated before the pool existed.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this pool, or have
    /// been allocated from the system allocator with `Layout::new::<T>()`. Any `T` in the
    /// slot must already have been moved out or dropped, and the slot must not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        let raw = ptr.as_ptr().cast::<u8>();

        if self.owns(raw) {
            self.push_free(raw.cast::<FreeSlot>());
        } else {
            // SAFETY: Per the caller contract, a pointer we do not own came from the system
            // allocator with exactly this layout.
            unsafe { dealloc(raw, Layout::new::<T>()) };
        }
    }

    /// The process-wide pool for this slot type.
    ///
    /// Every call returns the same instance, so any two containers recycling nodes of the
    /// same type through [`shared`](Self::shared) draw from one pool and may exchange nodes.
    /// The shared pool lives for the rest of the process.
    #[must_use]
    pub fn shared() -> &'static Self
    where
        T: Send + 'static,
    {
        let mut pools = SHARED_POOLS.lock();

        let erased: &'static (dyn Any + Send + Sync) =
            *pools.entry(TypeId::of::<Self>()).or_insert_with(|| {
                let pool: &'static Self = Box::leak(Box::new(Self::new()));
                pool
            });

        erased.downcast_ref::<Self>().expect("guarded by TypeId")
    }

    /// Number of slabs currently backing the pool.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        let mut count = 0;
        let mut slab = self.slab_head.load(Ordering::Acquire);

        while !slab.is_null() {
            count += 1;
            // SAFETY: Slab headers are initialized before publication and never freed while
            // the pool is alive.
            slab = unsafe { (*slab).next };
        }

        count
    }

    /// Number of slots currently on the free stack.
    ///
    /// Walks the stack without synchronization, so the result is only meaningful while no
    /// other thread is allocating or deallocating. Intended for diagnostics and tests.
    #[must_use]
    pub fn free_slot_count(&self) -> usize {
        let mut count = 0;
        let mut slot = self.free_head.load(Ordering::Acquire);

        while !slot.is_null() {
            count += 1;
            // SAFETY: Free-stack entries point into live slabs; see `allocate` for why a
            // racing reuse cannot fault (and this method requires quiescence anyway).
            slot = unsafe { (*slot).next.load(Ordering::Relaxed) };
        }

        count
    }

    /// Allocates one slab, links it at the slab head and publishes its slots.
    ///
    /// Must be called under `grow_lock`. On allocation failure the pool is left unchanged.
    fn grow(&self) {
        let (layout, slots_offset) = Self::slab_layout();

        // SAFETY: The layout has non-zero size (asserted non-zero capacity; a slot is at
        // least pointer-sized).
        let raw = unsafe { alloc(layout) };
        let Some(header) = NonNull::new(raw.cast::<SlabHeader>()) else {
            return;
        };

        // SAFETY: Freshly allocated, properly aligned for the header per `slab_layout`.
        unsafe {
            header.as_ptr().write(SlabHeader {
                next: self.slab_head.load(Ordering::Relaxed),
            });
        }

        // Publish the slab before its slots so `owns` recognizes them as pool memory as
        // soon as any of them can circulate.
        self.slab_head.store(header.as_ptr(), Ordering::Release);

        for index in 0..SLAB_CAPACITY {
            // SAFETY: `slots_offset + index * stride` stays within the slab allocation for
            // every index below the capacity, per `slab_layout`.
            let slot = unsafe { raw.add(slots_offset).add(index * Self::SLOT_STRIDE) };
            self.push_free(slot.cast::<FreeSlot>());
        }
    }

    /// Pushes a slot onto the free stack.
    ///
    /// Concurrent deallocations may push at any time, so even the growth path publishes each
    /// slot with a compare-and-swap.
    fn push_free(&self, slot: *mut FreeSlot) {
        let mut head = self.free_head.load(Ordering::Relaxed);

        loop {
            // SAFETY: The slot is not reachable by anyone else (it is being freed or freshly
            // created), so writing the link is exclusive. The slot lies in a live slab. A raw
            // write because the slot bytes may be uninitialized.
            unsafe { (&raw mut (*slot).next).write(AtomicPtr::new(head)) };

            match self.free_head.compare_exchange_weak(
                head,
                slot,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Returns `true` if the pointer lies within any slab of this pool.
    ///
    /// Slab counts stay small (each slab doubles nothing; growth is rare), so a linear scan
    /// is fine.
    fn owns(&self, ptr: *const u8) -> bool {
        let (_, slots_offset) = Self::slab_layout();
        let span = Self::SLOT_STRIDE * SLAB_CAPACITY;
        let addr = ptr as usize;

        let mut slab = self.slab_head.load(Ordering::Acquire);
        while !slab.is_null() {
            let slots_start = slab as usize + slots_offset;
            if addr >= slots_start && addr < slots_start + span {
                return true;
            }

            // SAFETY: Slab headers are initialized before publication and never freed while
            // the pool is alive.
            slab = unsafe { (*slab).next };
        }

        false
    }
}

impl<T, const SLAB_CAPACITY: usize> Default for SlabPool<T, SLAB_CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const SLAB_CAPACITY: usize> fmt::Debug for SlabPool<T, SLAB_CAPACITY> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("slab_count", &self.slab_count())
            .finish_non_exhaustive()
    }
}

impl<T, const SLAB_CAPACITY: usize> Drop for SlabPool<T, SLAB_CAPACITY> {
    fn drop(&mut self) {
        let (layout, _) = Self::slab_layout();

        let mut slab = *self.slab_head.get_mut();
        while !slab.is_null() {
            // SAFETY: We have exclusive access; headers were initialized at growth time.
            let next = unsafe { (*slab).next };

            // SAFETY: The slab was allocated with exactly this layout in `grow`.
            unsafe { dealloc(slab.cast::<u8>(), layout) };

            slab = next;
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SlabPool<u64>: Send, Sync);

    #[test]
    fn smoke_test() {
        let pool = SlabPool::<u64, 8>::new();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        unsafe {
            a.as_ptr().write(42);
            b.as_ptr().write(43);

            assert_eq!(a.as_ptr().read(), 42);
            assert_eq!(b.as_ptr().read(), 43);

            pool.deallocate(a);
            pool.deallocate(b);
        }

        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.free_slot_count(), 8);
    }

    #[test]
    fn new_pool_has_no_slabs() {
        let pool = SlabPool::<u64, 8>::new();

        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.free_slot_count(), 0);
    }

    #[test]
    fn recycles_most_recently_freed_slot() {
        let pool = SlabPool::<u32, 8>::new();

        let slot = pool.allocate().unwrap();
        unsafe { pool.deallocate(slot) };

        // LIFO free stack: the slot we just returned comes back first.
        assert_eq!(pool.allocate().unwrap(), slot);
    }

    #[test]
    fn grows_beyond_one_slab() {
        const CAPACITY: usize = 4;

        let pool = SlabPool::<u64, CAPACITY>::new();

        let slots: Vec<_> = (0..CAPACITY * 3)
            .map(|_| pool.allocate().unwrap())
            .collect();

        assert_eq!(pool.slab_count(), 3);

        let distinct: HashSet<_> = slots.iter().map(|slot| slot.as_ptr() as usize).collect();
        assert_eq!(distinct.len(), slots.len());

        for slot in slots {
            unsafe { pool.deallocate(slot) };
        }

        assert_eq!(pool.free_slot_count(), CAPACITY * 3);
    }

    #[test]
    fn every_slot_is_pool_owned() {
        const CAPACITY: usize = 4;

        let pool = SlabPool::<u64, CAPACITY>::new();

        let slots: Vec<_> = (0..CAPACITY * 2)
            .map(|_| pool.allocate().unwrap())
            .collect();

        for slot in &slots {
            assert!(pool.owns(slot.as_ptr().cast::<u8>()));
        }

        for slot in slots {
            unsafe { pool.deallocate(slot) };
        }
    }

    #[test]
    fn foreign_pointer_goes_to_system_allocator() {
        let pool = SlabPool::<u64, 8>::new();

        // Force a slab into existence so the ownership scan has something to check.
        let pooled = pool.allocate().unwrap();

        // SAFETY: Valid non-zero-size layout.
        let foreign = unsafe { alloc(Layout::new::<u64>()) };
        let foreign = NonNull::new(foreign.cast::<u64>()).unwrap();

        assert!(!pool.owns(foreign.as_ptr().cast::<u8>()));

        // Must free through the system allocator, not corrupt the free stack.
        unsafe { pool.deallocate(foreign) };

        assert_eq!(pool.free_slot_count(), 7);

        unsafe { pool.deallocate(pooled) };
    }

    #[test]
    fn shared_returns_same_instance() {
        struct NodeTypeForSharedTest(#[allow(dead_code)] u64);

        let a = SlabPool::<NodeTypeForSharedTest>::shared();
        let b = SlabPool::<NodeTypeForSharedTest>::shared();

        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn shared_distinguishes_types_and_capacities() {
        struct NodeTypeA(#[allow(dead_code)] u64);
        struct NodeTypeB(#[allow(dead_code)] u64);

        let a = SlabPool::<NodeTypeA>::shared();
        let b = SlabPool::<NodeTypeB>::shared();
        let a_small = SlabPool::<NodeTypeA, 16>::shared();

        assert_ne!(a as *const _ as usize, b as *const _ as usize);
        assert_ne!(a as *const _ as usize, a_small as *const _ as usize);
    }

    #[test]
    fn concurrent_churn_conserves_slots() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 10_000;
        const CAPACITY: usize = 64;

        let pool = Arc::new(SlabPool::<u64, CAPACITY>::new());

        let threads: Vec<_> = (0..THREADS)
            .map(|id| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let slot = pool.allocate().unwrap();
                        unsafe {
                            slot.as_ptr().write((id * ROUNDS + round) as u64);
                            assert_eq!(slot.as_ptr().read(), (id * ROUNDS + round) as u64);
                            pool.deallocate(slot);
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        // Every loan was returned: the free stack holds every slot of every slab.
        assert_eq!(pool.free_slot_count(), pool.slab_count() * CAPACITY);
    }

    #[test]
    fn large_alignment_is_respected() {
        #[repr(align(64))]
        struct Aligned(#[allow(dead_code)] [u8; 96]);

        let pool = SlabPool::<Aligned, 8>::new();

        for _ in 0..16 {
            let slot = pool.allocate().unwrap();
            assert_eq!(slot.as_ptr() as usize % 64, 0);
        }
    }
}
