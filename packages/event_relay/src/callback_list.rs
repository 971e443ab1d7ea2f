use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::policies::{DefaultPolicies, MutexOf, Policies};

/// Distinguishes lists so that handles from one list are rejected by another.
static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// An ordered, concurrently modifiable list of callables for a single event.
///
/// This is the building block of dispatchers: an ordered bag of listeners that can be
/// appended to, inserted into and removed from while other threads — or the listeners
/// themselves, mid-invocation — are traversing it.
///
/// # Visibility rules
///
/// Each insertion receives a counter strictly greater than any handed out before. A
/// traversal samples the counter once at the start and walks forward from the head,
/// skipping removed nodes and stopping at the list end or at the first node inserted after
/// the sample. Consequences:
///
/// - Callables added during a dispatch do not run until the next dispatch.
/// - Callables removed during a dispatch that have not yet run are skipped.
/// - A callable that removes itself finishes its own invocation safely.
///
/// # Removal
///
/// Removal marks the node and defers physical unlinking until no traversal stands on it:
/// every traversal holds a per-node reference while it invokes, and the last releaser
/// unlinks. Handles hold weak references, so a handle never keeps a removed node alive and
/// stays valid (returning `false` from [`remove`](Self::remove)) no matter what happened to
/// the rest of the list.
pub struct CallbackList<C, P: Policies = DefaultPolicies> {
    state: MutexOf<P, ListState<C>>,

    /// Source of insertion counters; sampled as the visibility ceiling at traversal start.
    current_counter: AtomicU64,

    list_id: u64,
}

struct ListState<C> {
    head: Option<Arc<Node<C>>>,
    tail: Option<Arc<Node<C>>>,
}

struct Node<C> {
    callback: C,

    /// Insertion age. Assigned before linking, immutable afterwards.
    counter: u64,

    removed: AtomicBool,

    /// Number of in-flight traversals currently standing on this node. Modified only under
    /// the list lock; the node is unlinked when it is removed and this reaches zero.
    refs: AtomicUsize,

    /// Owning `next`, non-owning `prev`. Only touched under the owning list's lock.
    links: UnsafeCell<Links<C>>,

    /// The list this node belongs to, for anchor and handle validation.
    list_id: u64,
}

struct Links<C> {
    prev: Weak<Node<C>>,
    next: Option<Arc<Node<C>>>,
}

// SAFETY: A node may be dropped or have its links (which own other nodes) mutated on any
// thread, which moves `C` across threads.
unsafe impl<C: Send> Send for Node<C> {}
// SAFETY: `links` is only accessed under the owning list's mutex; all other fields are
// atomics or immutable. Shared nodes invoke `&C` from multiple threads, hence `C: Sync`.
unsafe impl<C: Send + Sync> Sync for Node<C> {}

/// An owning reference to one callable in a [`CallbackList`], used to remove it or to
/// anchor an insertion.
///
/// Cloning yields another handle to the same callable. A handle outliving its callable
/// (or its list) is harmless; operations on it simply report failure.
pub struct CallbackHandle<C> {
    node: Weak<Node<C>>,
}

impl<C> Clone for CallbackHandle<C> {
    fn clone(&self) -> Self {
        Self {
            node: Weak::clone(&self.node),
        }
    }
}

impl<C> fmt::Debug for CallbackHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("alive", &(self.node.strong_count() > 0))
            .finish()
    }
}

/// Holds the traversal reference on the node currently being visited and releases it on
/// scope exit, so that a panicking callable leaves reference counts and deferred unlinks
/// correct.
struct TraversalStep<'a, C, P: Policies> {
    list: &'a CallbackList<C, P>,
    node: Option<Arc<Node<C>>>,
}

impl<C, P: Policies> Drop for TraversalStep<'_, C, P> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            let mut state = self.list.state.lock();
            CallbackList::<C, P>::release_locked(&mut state, &node);
        }
    }
}

impl<C, P: Policies> CallbackList<C, P> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: MutexOf::<P, _>::new(ListState {
                head: None,
                tail: None,
            }),
            current_counter: AtomicU64::new(0),
            list_id: NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn next_counter(&self) -> u64 {
        self.current_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn new_node(&self, callback: C, counter: u64) -> Arc<Node<C>> {
        Arc::new(Node {
            callback,
            counter,
            removed: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            links: UnsafeCell::new(Links {
                prev: Weak::new(),
                next: None,
            }),
            list_id: self.list_id,
        })
    }

    /// Appends a callable at the tail. O(1).
    pub fn append(&self, callback: C) -> CallbackHandle<C> {
        let mut state = self.state.lock();
        let node = self.new_node(callback, self.next_counter());

        match state.tail.take() {
            Some(tail) => {
                // SAFETY: List lock held; distinct nodes, so no aliasing.
                unsafe {
                    (*node.links.get()).prev = Arc::downgrade(&tail);
                    (*tail.links.get()).next = Some(Arc::clone(&node));
                }
                state.tail = Some(Arc::clone(&node));
            }
            None => {
                state.head = Some(Arc::clone(&node));
                state.tail = Some(Arc::clone(&node));
            }
        }

        CallbackHandle {
            node: Arc::downgrade(&node),
        }
    }

    /// Prepends a callable at the head. O(1).
    ///
    /// The callable still receives a fresh insertion counter, so a prepend during a
    /// dispatch does not run in that dispatch.
    pub fn prepend(&self, callback: C) -> CallbackHandle<C> {
        let mut state = self.state.lock();
        let node = self.new_node(callback, self.next_counter());

        match state.head.take() {
            Some(head) => {
                // SAFETY: List lock held; distinct nodes.
                unsafe {
                    (*node.links.get()).next = Some(Arc::clone(&head));
                    (*head.links.get()).prev = Arc::downgrade(&node);
                }
                state.head = Some(Arc::clone(&node));
            }
            None => {
                state.head = Some(Arc::clone(&node));
                state.tail = Some(Arc::clone(&node));
            }
        }

        CallbackHandle {
            node: Arc::downgrade(&node),
        }
    }

    /// Inserts a callable immediately before the one `anchor` refers to. O(1).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAnchor`] if the anchor belongs to a different list or its callable
    /// was already removed.
    pub fn insert_before(&self, callback: C, anchor: &CallbackHandle<C>) -> Result<CallbackHandle<C>> {
        let mut state = self.state.lock();

        let Some(anchor_node) = anchor.node.upgrade() else {
            return Err(Error::InvalidAnchor);
        };

        if anchor_node.list_id != self.list_id || anchor_node.removed.load(Ordering::Relaxed) {
            return Err(Error::InvalidAnchor);
        }

        let node = self.new_node(callback, self.next_counter());

        // SAFETY: List lock held; `node` is not yet linked, the anchor is, and they are
        // distinct, so the two link accesses do not alias.
        let previous = unsafe {
            let anchor_links = &mut *anchor_node.links.get();
            let previous = std::mem::replace(&mut anchor_links.prev, Arc::downgrade(&node));

            let node_links = &mut *node.links.get();
            node_links.prev = previous.clone();
            node_links.next = Some(Arc::clone(&anchor_node));

            previous
        };

        match previous.upgrade() {
            // SAFETY: List lock held; the predecessor is a third distinct node.
            Some(previous_node) => unsafe {
                (*previous_node.links.get()).next = Some(Arc::clone(&node));
            },
            // The anchor was the head.
            None => state.head = Some(Arc::clone(&node)),
        }

        Ok(CallbackHandle {
            node: Arc::downgrade(&node),
        })
    }

    /// Removes the callable `handle` refers to.
    ///
    /// Returns `false` if it was already removed, the list was dropped, or the handle
    /// belongs to a different list. Removal takes effect immediately for traversals that
    /// have not reached the node; a traversal currently standing on it finishes its
    /// invocation, after which the node is unlinked.
    pub fn remove(&self, handle: &CallbackHandle<C>) -> bool {
        let mut state = self.state.lock();

        let Some(node) = handle.node.upgrade() else {
            return false;
        };

        if node.list_id != self.list_id {
            return false;
        }

        if node.removed.swap(true, Ordering::Relaxed) {
            return false;
        }

        if node.refs.load(Ordering::Relaxed) == 0 {
            Self::unlink(&mut state, &node);
        }

        true
    }

    /// Returns `true` if the list holds no callables that a dispatch would invoke.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();

        let mut candidate = state.head.clone();
        while let Some(node) = candidate {
            if !node.removed.load(Ordering::Relaxed) {
                return false;
            }

            // SAFETY: List lock held.
            candidate = unsafe { (*node.links.get()).next.clone() };
        }

        true
    }

    /// Invokes every callable in insertion order, passing `args` to each.
    ///
    /// A panicking callable propagates to the caller; the remaining callables are not
    /// invoked and traversal state is released correctly.
    pub fn dispatch<Args>(&self, args: &Args)
    where
        C: Fn(&Args),
    {
        self.for_each(|callback| callback(args));
    }

    /// Visits every callable in insertion order.
    pub fn for_each(&self, mut visitor: impl FnMut(&C)) {
        self.for_each_if(|callback| {
            visitor(callback);
            true
        });
    }

    /// Visits callables in insertion order until the visitor returns `false`.
    ///
    /// Returns `true` if the traversal ran to completion, `false` if it was stopped.
    pub fn for_each_if(&self, mut visitor: impl FnMut(&C) -> bool) -> bool {
        let ceiling = self.current_counter.load(Ordering::Acquire);

        let mut step = TraversalStep {
            list: self,
            node: self.first_node(ceiling),
        };

        loop {
            let Some(node) = step.node.clone() else {
                break true;
            };

            if !visitor(&node.callback) {
                // The guard releases the reference.
                break false;
            }

            let current = step
                .node
                .take()
                .expect("we are standing on this node; the guard still holds it");
            step.node = self.advance(current, ceiling);
        }
    }

    /// Picks the first visitable node and acquires a reference on it.
    fn first_node(&self, ceiling: u64) -> Option<Arc<Node<C>>> {
        let state = self.state.lock();
        Self::acquire_from(state.head.clone(), ceiling)
    }

    /// Releases `current` and acquires the node that follows it, in one lock acquisition.
    ///
    /// The next node is chosen before `current` is released so that its links are still
    /// intact even if `current` was removed mid-invocation.
    fn advance(&self, current: Arc<Node<C>>, ceiling: u64) -> Option<Arc<Node<C>>> {
        let mut state = self.state.lock();

        // SAFETY: List lock held.
        let candidate = unsafe { (*current.links.get()).next.clone() };
        let next = Self::acquire_from(candidate, ceiling);

        Self::release_locked(&mut state, &current);

        next
    }

    /// Walks forward from `candidate`, skipping removed nodes, stopping at the list end or
    /// at the first node newer than the ceiling; acquires a reference on the survivor.
    ///
    /// Caller must hold the list lock.
    fn acquire_from(mut candidate: Option<Arc<Node<C>>>, ceiling: u64) -> Option<Arc<Node<C>>> {
        loop {
            let node = candidate?;

            if node.counter > ceiling {
                return None;
            }

            if !node.removed.load(Ordering::Relaxed) {
                node.refs.fetch_add(1, Ordering::Relaxed);
                return Some(node);
            }

            // SAFETY: Caller holds the list lock.
            candidate = unsafe { (*node.links.get()).next.clone() };
        }
    }

    /// Drops one traversal reference; the last releaser of a removed node unlinks it.
    ///
    /// Caller must hold the list lock.
    fn release_locked(state: &mut ListState<C>, node: &Arc<Node<C>>) {
        if node.refs.fetch_sub(1, Ordering::Relaxed) == 1 && node.removed.load(Ordering::Relaxed)
        {
            Self::unlink(state, node);
        }
    }

    /// Physically removes a node from the chain.
    ///
    /// Caller must hold the list lock; the node must be marked removed with no traversal
    /// references. Runs at most once per node: the links are cleared here, and every path
    /// that could call again (a later `remove`, a later release) is gated on the removed
    /// flag transitions that led here.
    fn unlink(state: &mut ListState<C>, node: &Arc<Node<C>>) {
        // SAFETY: List lock held.
        let (previous, next) = unsafe {
            let links = &mut *node.links.get();
            (
                std::mem::replace(&mut links.prev, Weak::new()),
                links.next.take(),
            )
        };

        let previous = previous.upgrade();

        match &previous {
            // SAFETY: List lock held; the neighbors are distinct from `node`.
            Some(previous_node) => unsafe {
                (*previous_node.links.get()).next = next.clone();
            },
            None => state.head = next.clone(),
        }

        match &next {
            // SAFETY: As above.
            Some(next_node) => unsafe {
                (*next_node.links.get()).prev =
                    previous.as_ref().map_or_else(Weak::new, Arc::downgrade);
            },
            None => state.tail = previous,
        }
    }
}

impl<C, P: Policies> Default for CallbackList<C, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, P: Policies> fmt::Debug for CallbackList<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<C, P: Policies> Drop for CallbackList<C, P> {
    fn drop(&mut self) {
        // Unchain iteratively: dropping the head `Arc` alone would recurse through every
        // owning `next` link and overflow the stack on long lists.
        let state = self.state.get_mut();
        state.tail = None;

        let mut node = state.head.take();
        while let Some(current) = node {
            // SAFETY: Exclusive access during drop.
            node = unsafe { (*current.links.get()).next.take() };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    use super::*;

    type List = CallbackList<Box<dyn Fn(&i32) + Send + Sync>>;

    assert_impl_all!(List: Send, Sync);
    assert_impl_all!(CallbackHandle<Box<dyn Fn(&i32) + Send + Sync>>: Clone, Send, Sync);

    fn recorder(log: &Arc<Mutex<Vec<i32>>>, tag: i32) -> Box<dyn Fn(&i32) + Send + Sync> {
        let log = Arc::clone(log);
        Box::new(move |arg| log.lock().unwrap().push(tag * 1000 + arg))
    }

    #[test]
    fn dispatches_in_insertion_order() {
        let list = List::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        list.append(recorder(&log, 1));
        list.append(recorder(&log, 2));
        list.prepend(recorder(&log, 3));

        list.dispatch(&7);

        assert_eq!(*log.lock().unwrap(), vec![3007, 1007, 2007]);
    }

    #[test]
    fn insert_before_anchors_correctly() {
        let list = List::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = list.append(recorder(&log, 1));
        list.append(recorder(&log, 2));

        list.insert_before(recorder(&log, 3), &first).unwrap();

        list.dispatch(&0);

        assert_eq!(*log.lock().unwrap(), vec![3000, 1000, 2000]);
    }

    #[test]
    fn insert_before_rejects_foreign_anchor() {
        let list = List::new();
        let other = List::new();

        let foreign = other.append(Box::new(|_arg| {}));

        let result = list.insert_before(Box::new(|_arg| {}), &foreign);
        assert!(matches!(result, Err(Error::InvalidAnchor)));
    }

    #[test]
    fn insert_before_rejects_removed_anchor() {
        let list = List::new();

        let anchor = list.append(Box::new(|_arg| {}));
        assert!(list.remove(&anchor));

        let result = list.insert_before(Box::new(|_arg| {}), &anchor);
        assert!(matches!(result, Err(Error::InvalidAnchor)));
    }

    #[test]
    fn remove_is_idempotent_false() {
        let list = List::new();

        let handle = list.append(Box::new(|_arg| {}));

        assert!(list.remove(&handle));
        assert!(!list.remove(&handle));
    }

    #[test]
    fn remove_rejects_foreign_handle() {
        let list = List::new();
        let other = List::new();

        let foreign = other.append(Box::new(|_arg| {}));

        assert!(!list.remove(&foreign));
        // The callable still runs in its own list.
        assert!(!other.is_empty());
    }

    #[test]
    fn handle_survives_unrelated_changes() {
        let list = List::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = list.append(recorder(&log, 1));
        let b = list.append(recorder(&log, 2));
        let c = list.append(recorder(&log, 3));

        assert!(list.remove(&a));
        assert!(list.remove(&c));
        list.append(recorder(&log, 4));

        // `b` is untouched by its neighbors coming and going.
        assert!(list.remove(&b));

        list.dispatch(&0);
        assert_eq!(*log.lock().unwrap(), vec![4000]);
    }

    #[test]
    fn self_removal_during_dispatch() {
        struct SelfRemove {
            list: Arc<CallbackList<SelfRemovingCallback>>,
        }

        type SelfRemovingCallback = Box<dyn Fn(&u32) + Send + Sync>;

        let list = Arc::new(CallbackList::<SelfRemovingCallback>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handle_cell: Arc<Mutex<Option<CallbackHandle<SelfRemovingCallback>>>> =
            Arc::new(Mutex::new(None));

        let callback: SelfRemovingCallback = {
            let context = SelfRemove {
                list: Arc::clone(&list),
            };
            let calls = Arc::clone(&calls);
            let handle_cell = Arc::clone(&handle_cell);
            Box::new(move |_arg| {
                calls.fetch_add(1, Ordering::Relaxed);
                let handle = handle_cell.lock().unwrap().clone().unwrap();
                assert!(context.list.remove(&handle));
            })
        };

        let handle = list.append(callback);
        *handle_cell.lock().unwrap() = Some(handle);

        list.dispatch(&0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(list.is_empty());

        // Gone for good: a second dispatch invokes nothing.
        list.dispatch(&0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn listener_added_during_dispatch_waits_for_next_cycle() {
        type Callback = Box<dyn Fn(&u32) + Send + Sync>;

        let list = Arc::new(CallbackList::<Callback>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let callback: Callback = {
            let list = Arc::clone(&list);
            let calls = Arc::clone(&calls);
            Box::new(move |_arg| {
                calls.fetch_add(1, Ordering::Relaxed);
                let inner_calls = Arc::clone(&calls);
                list.append(Box::new(move |_arg| {
                    inner_calls.fetch_add(100, Ordering::Relaxed);
                }));
            })
        };

        list.append(callback);

        // First dispatch: only the original callable runs (and appends a new one).
        list.dispatch(&0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        // Second dispatch: the original (appending yet another) plus the first addition.
        list.dispatch(&0);
        assert_eq!(calls.load(Ordering::Relaxed), 102);
    }

    #[test]
    fn removal_of_not_yet_visited_listener_skips_it() {
        type Callback = Box<dyn Fn(&u32) + Send + Sync>;

        let list = Arc::new(CallbackList::<Callback>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let victim_cell: Arc<Mutex<Option<CallbackHandle<Callback>>>> =
            Arc::new(Mutex::new(None));

        let remover: Callback = {
            let list = Arc::clone(&list);
            let log = Arc::clone(&log);
            let victim_cell = Arc::clone(&victim_cell);
            Box::new(move |_arg| {
                log.lock().unwrap().push(1);
                let victim = victim_cell.lock().unwrap().clone().unwrap();
                assert!(list.remove(&victim));
            })
        };

        list.append(remover);

        let victim = {
            let log = Arc::clone(&log);
            list.append(Box::new(move |_arg| log.lock().unwrap().push(2)))
        };
        *victim_cell.lock().unwrap() = Some(victim);

        list.dispatch(&0);

        // The second callable was removed by the first before being visited.
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn for_each_if_stops_early() {
        let list = CallbackList::<u32>::new();

        list.append(1);
        list.append(2);
        list.append(3);

        let mut visited = Vec::new();
        let completed = list.for_each_if(|value| {
            visited.push(*value);
            *value != 2
        });

        assert!(!completed);
        assert_eq!(visited, vec![1, 2]);
    }

    #[test]
    fn panicking_listener_leaves_list_intact() {
        type Callback = Box<dyn Fn(&u32) + Send + Sync>;

        let list = Arc::new(CallbackList::<Callback>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let log = Arc::clone(&log);
            list.append(Box::new(move |_arg| log.lock().unwrap().push(1)));
        }
        list.append(Box::new(|_arg| panic!("listener failure")));
        {
            let log = Arc::clone(&log);
            list.append(Box::new(move |_arg| log.lock().unwrap().push(3)));
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            list.dispatch(&0);
        }));
        assert!(result.is_err());

        // The third callable was not invoked.
        assert_eq!(*log.lock().unwrap(), vec![1]);

        // Traversal state was released; the list still works.
        list.dispatch(&0);
        assert_eq!(*log.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn concurrent_append_remove_dispatch_smoke() {
        use std::thread;

        type Callback = Box<dyn Fn(&u32) + Send + Sync>;

        let list = Arc::new(CallbackList::<Callback>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mutators: Vec<_> = (0..2)
            .map(|_| {
                let list = Arc::clone(&list);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let calls = Arc::clone(&calls);
                        let handle = list.append(Box::new(move |_arg| {
                            calls.fetch_add(1, Ordering::Relaxed);
                        }));
                        assert!(list.remove(&handle));
                    }
                })
            })
            .collect();

        let dispatchers: Vec<_> = (0..2)
            .map(|_| {
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..500 {
                        list.dispatch(&0);
                    }
                })
            })
            .collect();

        for thread in mutators.into_iter().chain(dispatchers) {
            thread.join().unwrap();
        }

        // Every appended callable was removed again.
        assert!(list.is_empty());
    }

    #[test]
    fn long_list_drops_without_overflowing() {
        let list = CallbackList::<u64>::new();

        for value in 0..100_000 {
            list.append(value);
        }

        drop(list);
    }
}
