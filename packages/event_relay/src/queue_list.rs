//! Intrusive node lists and the queue-storage policy axis.
//!
//! Queue nodes circulate between the pending list, a consumer's drain list and the free
//! list without ever being reallocated, so the lists are intrusive: the forward link lives
//! inside the node, and moving a node between lists is pointer surgery. The policy decides
//! where the nodes themselves come from: the system allocator, or the process-wide slab
//! pool for the node type.

use std::alloc::{Layout, alloc, dealloc};
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use slab_pool::{DEFAULT_SLAB_CAPACITY, PoolAllocator};

/// One buffered event: the forward link plus the payload slot.
///
/// A node on the pending list (or a drain list) holds an initialized payload; a node on
/// the free list does not. Which is which is tracked by list membership, not in the node.
pub(crate) struct QueueNode<T> {
    next: *mut QueueNode<T>,
    payload: MaybeUninit<T>,
}

// SAFETY: A node is plain storage moved between threads while exclusively owned by one
// list (or one drain); `T: Send` covers the payload moving with it.
unsafe impl<T: Send> Send for QueueNode<T> {}

impl<T> QueueNode<T> {
    /// Writes the payload into an empty node.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the node and its payload slot must be empty.
    pub(crate) unsafe fn write_payload(node: NonNull<Self>, payload: T) {
        // SAFETY: Exclusive ownership per the contract; writing into `MaybeUninit` storage.
        unsafe { (&raw mut (*node.as_ptr()).payload).write(MaybeUninit::new(payload)) };
    }

    /// Moves the payload out of a node, leaving the slot empty.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the node and the payload slot must be initialized.
    /// The slot must be treated as empty afterwards.
    pub(crate) unsafe fn take_payload(node: NonNull<Self>) -> T {
        // SAFETY: Initialized per the contract; reading moves the value out.
        unsafe { (*node.as_ptr()).payload.assume_init_read() }
    }

    /// Borrows the payload of a node.
    ///
    /// # Safety
    ///
    /// The payload slot must be initialized and must not be mutated or moved out for the
    /// lifetime of the returned reference. The caller must either own the node's list
    /// exclusively or hold its lock.
    pub(crate) unsafe fn payload_ref<'a>(node: NonNull<Self>) -> &'a T {
        // SAFETY: Initialized per the contract.
        unsafe { (*node.as_ptr()).payload.assume_init_ref() }
    }
}

/// Supplies and recycles the memory behind queue nodes.
///
/// Implementations must be stateless handles: all instances of one implementation type
/// must be interchangeable (`PartialEq` always equal), so that nodes may migrate between
/// any two lists built on the same allocator type.
pub trait NodeAllocator<T>: Copy + Default + Eq + Send + Sync + 'static {
    /// Provides one uninitialized node. `None` when out of memory.
    fn allocate(&self) -> Option<NonNull<T>>;

    /// Releases a node.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from an allocator of this type, its payload must already be
    /// moved out or dropped, and it must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<T>);
}

/// Node allocator backed by the system allocator. One allocation per node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapNodes;

impl<T: Send + 'static> NodeAllocator<T> for HeapNodes {
    fn allocate(&self) -> Option<NonNull<T>> {
        // SAFETY: Queue nodes are never zero-sized (they carry at least the link).
        NonNull::new(unsafe { alloc(Layout::new::<T>()) }.cast::<T>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // SAFETY: Allocated in `allocate` with exactly this layout.
        unsafe { dealloc(ptr.as_ptr().cast::<u8>(), Layout::new::<T>()) };
    }
}

impl<T: Send + 'static, const SLAB_CAPACITY: usize> NodeAllocator<T>
    for PoolAllocator<T, SLAB_CAPACITY>
{
    fn allocate(&self) -> Option<NonNull<T>> {
        PoolAllocator::allocate(self)
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // SAFETY: Forwarded caller contract; all pool allocators of one type share a pool.
        unsafe { PoolAllocator::deallocate(self, ptr) };
    }
}

/// The queue-storage policy axis: which [`NodeAllocator`] queues use for their nodes.
pub trait QueueStorage: 'static {
    /// The allocator for nodes of type `T`.
    type Allocator<T: Send + 'static>: NodeAllocator<T>;
}

/// Queue nodes come from the system allocator.
#[derive(Debug)]
pub struct HeapStorage;

impl QueueStorage for HeapStorage {
    type Allocator<T: Send + 'static> = HeapNodes;
}

/// Queue nodes come from the process-wide slab pool for the node type, growing by
/// `SLAB_CAPACITY` slots at a time. Slab capacity only affects growth granularity.
#[derive(Debug)]
pub struct PooledStorage<const SLAB_CAPACITY: usize = DEFAULT_SLAB_CAPACITY>;

impl<const SLAB_CAPACITY: usize> QueueStorage for PooledStorage<SLAB_CAPACITY> {
    type Allocator<T: Send + 'static> = PoolAllocator<T, SLAB_CAPACITY>;
}

/// Allocates one empty node with a cleared link.
pub(crate) fn allocate_node<T, A>(alloc: &A) -> Option<NonNull<QueueNode<T>>>
where
    A: NodeAllocator<QueueNode<T>>,
{
    let node = alloc.allocate()?;

    // SAFETY: Fresh exclusive allocation; a raw write because the memory is uninitialized.
    unsafe { (&raw mut (*node.as_ptr()).next).write(std::ptr::null_mut()) };

    Some(node)
}

/// An intrusive singly linked FIFO of queue nodes.
///
/// O(1) push, pop and whole-list splice. The list owns its nodes' memory but knows nothing
/// about payload initialization; callers route nodes between payload-carrying and empty
/// lists and drop payloads before recycling.
pub(crate) struct NodeList<T, A: NodeAllocator<QueueNode<T>>> {
    head: *mut QueueNode<T>,
    tail: *mut QueueNode<T>,
    len: usize,
    alloc: A,
}

// SAFETY: The raw pointers are owned nodes; sending the list sends the nodes.
unsafe impl<T: Send, A: NodeAllocator<QueueNode<T>>> Send for NodeList<T, A> {}

impl<T, A: NodeAllocator<QueueNode<T>>> NodeList<T, A> {
    pub(crate) fn new(alloc: A) -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
            len: 0,
            alloc,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Links a node at the tail.
    pub(crate) fn push_back(&mut self, node: NonNull<QueueNode<T>>) {
        // SAFETY: We own the node now; clearing its link before it becomes our tail.
        unsafe { (*node.as_ptr()).next = std::ptr::null_mut() };

        if self.tail.is_null() {
            self.head = node.as_ptr();
        } else {
            // SAFETY: A non-null tail is a live node owned by this list.
            unsafe { (*self.tail).next = node.as_ptr() };
        }

        self.tail = node.as_ptr();
        self.len += 1;
    }

    /// Unlinks and returns the head node.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<QueueNode<T>>> {
        let node = NonNull::new(self.head)?;

        // SAFETY: The head is a live node owned by this list.
        self.head = unsafe { (*node.as_ptr()).next };
        if self.head.is_null() {
            self.tail = std::ptr::null_mut();
        }

        // SAFETY: As above; detaching the node from the chain.
        unsafe { (*node.as_ptr()).next = std::ptr::null_mut() };
        self.len -= 1;

        Some(node)
    }

    /// The head node, still linked.
    pub(crate) fn front(&self) -> Option<NonNull<QueueNode<T>>> {
        NonNull::new(self.head)
    }

    /// Splices every node out into a new list, leaving this one empty. O(1).
    pub(crate) fn take_all(&mut self) -> Self {
        let drained = Self {
            head: self.head,
            tail: self.tail,
            len: self.len,
            alloc: self.alloc,
        };

        self.head = std::ptr::null_mut();
        self.tail = std::ptr::null_mut();
        self.len = 0;

        drained
    }

    /// Splices every node of `other` onto this list's tail. O(1).
    pub(crate) fn append(&mut self, other: &mut Self) {
        debug_assert!(
            self.alloc == other.alloc,
            "splicing between lists requires interchangeable allocators"
        );

        if other.is_empty() {
            return;
        }

        if self.tail.is_null() {
            self.head = other.head;
        } else {
            // SAFETY: A non-null tail is a live node owned by this list.
            unsafe { (*self.tail).next = other.head };
        }

        self.tail = other.tail;
        self.len += other.len;

        other.head = std::ptr::null_mut();
        other.tail = std::ptr::null_mut();
        other.len = 0;
    }

    /// Releases a node's memory.
    ///
    /// # Safety
    ///
    /// The node must not be linked into any list and its payload must already be moved out
    /// or dropped.
    pub(crate) unsafe fn free_node(&self, node: NonNull<QueueNode<T>>) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.alloc.deallocate(node) };
    }
}

impl<T, A: NodeAllocator<QueueNode<T>>> Drop for NodeList<T, A> {
    fn drop(&mut self) {
        // Node ownership is handed back explicitly before a list goes away; anything else
        // is a bug in the queue's drain or drop paths.
        debug_assert!(self.is_empty(), "NodeList dropped while still owning nodes");
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;

    fn make_node<A: NodeAllocator<QueueNode<u64>>>(alloc: &A, value: u64) -> NonNull<QueueNode<u64>> {
        let node = allocate_node(alloc).unwrap();
        unsafe { QueueNode::write_payload(node, value) };
        node
    }

    fn drain_values<A: NodeAllocator<QueueNode<u64>>>(list: &mut NodeList<u64, A>) -> Vec<u64> {
        let mut values = Vec::new();
        while let Some(node) = list.pop_front() {
            unsafe {
                values.push(QueueNode::take_payload(node));
                list.free_node(node);
            }
        }
        values
    }

    #[test]
    fn fifo_order() {
        let alloc = HeapNodes;
        let mut list = NodeList::new(alloc);

        for value in [1, 2, 3] {
            list.push_back(make_node(&alloc, value));
        }

        assert_eq!(list.len(), 3);
        assert_eq!(drain_values(&mut list), vec![1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn take_all_splices_everything() {
        let alloc = HeapNodes;
        let mut list = NodeList::new(alloc);

        for value in [1, 2, 3] {
            list.push_back(make_node(&alloc, value));
        }

        let mut drained = list.take_all();

        assert!(list.is_empty());
        assert_eq!(drained.len(), 3);
        assert_eq!(drain_values(&mut drained), vec![1, 2, 3]);
    }

    #[test]
    fn append_preserves_order() {
        let alloc = HeapNodes;
        let mut first = NodeList::new(alloc);
        let mut second = NodeList::new(alloc);

        first.push_back(make_node(&alloc, 1));
        second.push_back(make_node(&alloc, 2));
        second.push_back(make_node(&alloc, 3));

        first.append(&mut second);

        assert!(second.is_empty());
        assert_eq!(drain_values(&mut first), vec![1, 2, 3]);
    }

    #[test]
    fn pool_backed_lists_can_exchange_nodes() {
        struct PayloadForSpliceTest(#[allow(dead_code)] u64);

        type Alloc = PoolAllocator<QueueNode<PayloadForSpliceTest>>;

        let alloc = Alloc::default();
        let mut producer: NodeList<PayloadForSpliceTest, Alloc> = NodeList::new(alloc);
        let mut consumer: NodeList<PayloadForSpliceTest, Alloc> = NodeList::new(Alloc::default());

        for value in 0..10 {
            let node = allocate_node(&alloc).unwrap();
            unsafe { QueueNode::write_payload(node, PayloadForSpliceTest(value)) };
            producer.push_back(node);
        }

        // Allocator equality makes cross-list splices well-defined.
        consumer.append(&mut producer);
        assert_eq!(consumer.len(), 10);

        while let Some(node) = consumer.pop_front() {
            unsafe {
                drop(QueueNode::take_payload(node));
                consumer.free_node(node);
            }
        }
    }

    #[test]
    fn front_peeks_without_unlinking() {
        let alloc = HeapNodes;
        let mut list = NodeList::new(alloc);

        assert!(list.front().is_none());

        list.push_back(make_node(&alloc, 5));

        let front = list.front().unwrap();
        assert_eq!(unsafe { *QueueNode::payload_ref(front) }, 5);
        assert_eq!(list.len(), 1);

        let popped = list.pop_front().unwrap();
        assert_eq!(popped, front);
        unsafe {
            drop(QueueNode::take_payload(popped));
            list.free_node(popped);
        }
    }
}
