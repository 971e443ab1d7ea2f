use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::dispatcher::{Dispatcher, IntoListener, ListenerHandle};
use crate::error::{Error, Result};
use crate::policies::{Admits, DefaultPolicies, EventKey, MutexOf, Policies, SignalOf};
use crate::queue_list::{NodeList, QueueNode, QueueStorage, allocate_node};
use crate::signal::Signal;

/// The node allocator a policy selects for payloads of type `T`.
pub(crate) type AllocOf<P, T> =
    <<P as Policies>::QueueStorage as QueueStorage>::Allocator<QueueNode<T>>;

/// The buffering machinery shared by the homogeneous and heterogeneous queues: the
/// pending/free two-list discipline, the pending-length counter and the wait signals.
///
/// Payload semantics live in the owning queue; the core only moves nodes. Lock protocol:
/// the pending list and the free list have separate locks, neither is ever held while the
/// other is taken, and no lock is held while listeners run.
pub(crate) struct QueueCore<T: Send + 'static, P: Policies> {
    pending: MutexOf<P, NodeList<T, AllocOf<P, T>>>,

    /// Consumed nodes waiting for reuse. Guarded separately so recycling on the drain path
    /// does not contend with producers linking into pending.
    free: MutexOf<P, NodeList<T, AllocOf<P, T>>>,

    alloc: AllocOf<P, T>,

    /// Mirrors the pending list length; read without the lock by the wait paths.
    pending_len: AtomicUsize,

    /// Signaled when pending becomes non-empty.
    ready: SignalOf<P>,

    /// Signaled when pending becomes empty.
    idle: SignalOf<P>,
}

impl<T: Send + 'static, P: Policies> QueueCore<T, P> {
    pub(crate) fn new() -> Self {
        let alloc = AllocOf::<P, T>::default();

        Self {
            pending: MutexOf::<P, _>::new(NodeList::new(alloc)),
            free: MutexOf::<P, _>::new(NodeList::new(alloc)),
            alloc,
            pending_len: AtomicUsize::new(0),
            ready: SignalOf::<P>::default(),
            idle: SignalOf::<P>::default(),
        }
    }

    /// Buffers one payload at the pending tail.
    ///
    /// Recycles a free node when the free list is uncontended and non-empty; otherwise
    /// allocates fresh, so a producer never waits behind the drain path's recycling.
    pub(crate) fn enqueue(&self, payload: T) -> Result<()> {
        let node = self.free.try_lock().and_then(|mut free| free.pop_front());

        let node = match node {
            Some(node) => node,
            None => allocate_node(&self.alloc).ok_or(Error::AllocationFailure)?,
        };

        // SAFETY: The node is exclusively ours and its payload slot is empty.
        unsafe { QueueNode::write_payload(node, payload) };

        {
            let mut pending = self.pending.lock();
            pending.push_back(node);
            self.pending_len.fetch_add(1, Ordering::Release);
        }

        self.ready.notify_one();
        Ok(())
    }

    /// Splices the entire pending list into a drain guard.
    ///
    /// Whatever the caller leaves in the guard returns to the front of pending when the
    /// guard drops, so a panicking listener loses no buffered events beyond its own.
    pub(crate) fn drain(&self) -> Drained<'_, T, P> {
        let nodes = {
            let mut pending = self.pending.lock();
            self.pending_len.store(0, Ordering::Release);
            pending.take_all()
        };

        Drained { core: self, nodes }
    }

    /// An empty drain guard; nodes pushed into it return to the front of pending.
    pub(crate) fn restorer(&self) -> Drained<'_, T, P> {
        Drained {
            core: self,
            nodes: NodeList::new(self.alloc),
        }
    }

    /// Unlinks the head node of pending.
    pub(crate) fn pop_one(&self) -> Option<NonNull<QueueNode<T>>> {
        let mut pending = self.pending.lock();
        let node = pending.pop_front()?;
        self.pending_len.fetch_sub(1, Ordering::Release);
        Some(node)
    }

    /// Returns a consumed node (payload already moved out) to the free list.
    pub(crate) fn recycle(&self, node: NonNull<QueueNode<T>>) {
        let mut free = self.free.lock();
        free.push_back(node);
    }

    /// Moves the head payload out, recycling its node.
    pub(crate) fn take(&self) -> Option<T> {
        let node = self.pop_one()?;

        // SAFETY: Pending nodes carry initialized payloads; the node is exclusively ours.
        let payload = unsafe { QueueNode::take_payload(node) };
        self.recycle(node);
        self.notify_if_idle();

        Some(payload)
    }

    /// Reads the head payload in place, under the pending lock.
    pub(crate) fn peek_with<R>(&self, read: impl FnOnce(&T) -> R) -> Option<R> {
        let pending = self.pending.lock();
        let node = pending.front()?;

        // SAFETY: Pending nodes carry initialized payloads; the pending lock is held.
        Some(read(unsafe { QueueNode::payload_ref(node) }))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending_len.load(Ordering::Acquire) == 0
    }

    pub(crate) fn wait(&self) {
        self.ready.wait_until(|| !self.is_empty());
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout, || !self.is_empty())
    }

    pub(crate) fn wait_until_empty(&self) {
        self.idle.wait_until(|| self.is_empty());
    }

    pub(crate) fn notify_if_idle(&self) {
        if self.is_empty() {
            self.idle.notify_all();
        }
    }
}

impl<T: Send + 'static, P: Policies> Drop for QueueCore<T, P> {
    fn drop(&mut self) {
        let pending = self.pending.get_mut();
        while let Some(node) = pending.pop_front() {
            // SAFETY: Pending nodes carry initialized payloads; we have exclusive access.
            unsafe {
                drop(QueueNode::take_payload(node));
                pending.free_node(node);
            }
        }

        let free = self.free.get_mut();
        while let Some(node) = free.pop_front() {
            // SAFETY: Free nodes are empty; we have exclusive access.
            unsafe { free.free_node(node) };
        }
    }
}

/// Nodes spliced out of a queue for processing.
///
/// On drop, any nodes still held — a panicking listener aborted the drain, or a filtered
/// processing pass kept them — are re-linked at the *front* of pending in their original
/// order, and the wait signals are updated.
pub(crate) struct Drained<'q, T: Send + 'static, P: Policies> {
    core: &'q QueueCore<T, P>,
    pub(crate) nodes: NodeList<T, AllocOf<P, T>>,
}

impl<T: Send + 'static, P: Policies> Drop for Drained<'_, T, P> {
    fn drop(&mut self) {
        let count = self.nodes.len();

        if count == 0 {
            self.core.notify_if_idle();
            return;
        }

        let mut restored = self.nodes.take_all();

        {
            let mut pending = self.core.pending.lock();
            // Our nodes go in front of anything enqueued meanwhile.
            restored.append(&mut pending);
            std::mem::swap(&mut *pending, &mut restored);
            self.core.pending_len.fetch_add(count, Ordering::Release);
        }

        self.core.ready.notify_all();
    }
}

/// A buffered event queue: producers enqueue, consumers drain in batches and dispatch to
/// the registered listeners.
///
/// The queue owns a [`Dispatcher`] and adds the asynchronous half: `enqueue` stores the
/// event key and arguments in a recycled node and returns immediately; `process` (and its
/// variants) later drains everything pending and invokes the matching listeners on the
/// draining thread. Consumed nodes return to a free list, so a queue in steady state does
/// not allocate per event.
///
/// All operations take `&self`; the queue is meant to be shared across producer and
/// consumer threads. Listeners may re-enter the queue freely: an event enqueued during
/// `process` is handled by the *next* process call, a listener registered during dispatch
/// fires from the next dispatch on.
///
/// # Examples
///
/// ```rust
/// use std::sync::{Arc, Mutex};
///
/// use event_relay::EventQueue;
///
/// let queue = EventQueue::<u32, String>::new();
/// let received = Arc::new(Mutex::new(Vec::new()));
///
/// let sink = Arc::clone(&received);
/// queue.append_listener(42, move |args: &String| {
///     sink.lock().unwrap().push(args.clone());
/// });
///
/// queue.enqueue(42, "hello".to_string()).unwrap();
///
/// assert!(queue.process());
/// assert_eq!(*received.lock().unwrap(), vec!["hello".to_string()]);
/// ```
pub struct EventQueue<E, Args, P = DefaultPolicies>
where
    E: EventKey + Send,
    Args: Send + 'static,
    P: Policies,
{
    dispatcher: Dispatcher<E, Args, P>,
    core: QueueCore<(E, Args), P>,
}

impl<E, Args, P> EventQueue<E, Args, P>
where
    E: EventKey + Send,
    Args: Send + 'static,
    P: Policies,
{
    /// Creates an empty queue with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            core: QueueCore::new(),
        }
    }

    /// The dispatcher handling the synchronous side of this queue.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<E, Args, P> {
        &self.dispatcher
    }

    /// Registers a listener; see [`Dispatcher::append_listener`].
    pub fn append_listener<F, S>(&self, event: E, listener: F) -> ListenerHandle<E, Args>
    where
        F: IntoListener<E, Args, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.dispatcher.append_listener(event, listener)
    }

    /// Registers a listener at the front; see [`Dispatcher::prepend_listener`].
    pub fn prepend_listener<F, S>(&self, event: E, listener: F) -> ListenerHandle<E, Args>
    where
        F: IntoListener<E, Args, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.dispatcher.prepend_listener(event, listener)
    }

    /// Registers a listener before an anchor; see [`Dispatcher::insert_listener_before`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAnchor`] if the anchor belongs to another list or was removed.
    pub fn insert_listener_before<F, S>(
        &self,
        event: E,
        listener: F,
        anchor: &ListenerHandle<E, Args>,
    ) -> Result<ListenerHandle<E, Args>>
    where
        F: IntoListener<E, Args, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.dispatcher.insert_listener_before(event, listener, anchor)
    }

    /// Removes a listener; see [`Dispatcher::remove_listener`].
    pub fn remove_listener(&self, event: &E, handle: &ListenerHandle<E, Args>) -> bool {
        self.dispatcher.remove_listener(event, handle)
    }

    /// Returns `true` if the event has at least one listener.
    #[must_use]
    pub fn has_any_listener(&self, event: &E) -> bool {
        self.dispatcher.has_any_listener(event)
    }

    /// Invokes the listeners for `event` immediately, bypassing the queue.
    pub fn dispatch(&self, event: &E, args: &Args) {
        self.dispatcher.dispatch(event, args);
    }

    /// Buffers an event for a later `process` call.
    ///
    /// Two enqueues from one thread are processed in that order. Waiting consumers are
    /// woken.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if no free node was available and the allocator could
    /// not provide one.
    pub fn enqueue(&self, event: E, args: Args) -> Result<()> {
        self.core.enqueue((event, args))
    }

    /// Drains every currently pending event and dispatches each to its listeners.
    ///
    /// Events enqueued while processing runs (including by the listeners themselves) are
    /// left for the next call. Returns `true` if at least one event was processed.
    ///
    /// A panicking listener propagates; the remaining drained events return to the front
    /// of the queue.
    pub fn process(&self) -> bool {
        self.drain_with(|event, args| self.dispatcher.dispatch(event, args))
    }

    /// Drains every currently pending event into `visitor` instead of the dispatcher.
    ///
    /// The visitor observes exactly the `(event, args)` sequence that listeners would
    /// under [`process`](Self::process), without the per-event listener lookup.
    pub fn process_queue_with(&self, visitor: impl FnMut(&E, &Args)) -> bool {
        self.drain_with(visitor)
    }

    fn drain_with(&self, mut deliver: impl FnMut(&E, &Args)) -> bool {
        if self.core.is_empty() {
            return false;
        }

        let mut drained = self.core.drain();
        let mut processed = false;

        while let Some(node) = drained.nodes.pop_front() {
            // SAFETY: Nodes on the drain list carry initialized payloads; we own them.
            let (event, args) = unsafe { QueueNode::take_payload(node) };

            // Recycled before delivery: the payload is already out, and this way a
            // panicking listener cannot strand the node.
            self.core.recycle(node);
            processed = true;

            deliver(&event, &args);
        }

        processed
    }

    /// Processes exactly one pending event. Returns `false` on an empty queue.
    pub fn process_one(&self) -> bool {
        self.take_one_with(|event, args| self.dispatcher.dispatch(event, args))
    }

    /// Delivers exactly one pending event to `visitor` instead of the dispatcher.
    pub fn process_one_with(&self, visitor: impl FnMut(&E, &Args)) -> bool {
        self.take_one_with(visitor)
    }

    fn take_one_with(&self, mut deliver: impl FnMut(&E, &Args)) -> bool {
        let Some(node) = self.core.pop_one() else {
            return false;
        };

        // SAFETY: Pending nodes carry initialized payloads; the node is exclusively ours.
        let (event, args) = unsafe { QueueNode::take_payload(node) };
        self.core.recycle(node);
        self.core.notify_if_idle();

        deliver(&event, &args);
        true
    }

    /// Processes only the pending events matching `predicate`; the rest stay buffered, in
    /// order, ahead of anything enqueued later.
    pub fn process_if(&self, mut predicate: impl FnMut(&E, &Args) -> bool) -> bool {
        if self.core.is_empty() {
            return false;
        }

        // Guard drop order (reverse of declaration) puts kept nodes back in front of any
        // unprocessed remainder.
        let mut kept = self.core.restorer();
        let mut drained = self.core.drain();
        let mut processed = false;

        while let Some(front) = drained.nodes.front() {
            let matches = {
                // SAFETY: Nodes on the drain list carry initialized payloads; we own the
                // list exclusively.
                let payload = unsafe { QueueNode::payload_ref(front) };
                predicate(&payload.0, &payload.1)
            };

            let node = drained
                .nodes
                .pop_front()
                .expect("the list is non-empty; we just peeked its front");

            if matches {
                // SAFETY: As above; taking ownership of the payload.
                let (event, args) = unsafe { QueueNode::take_payload(node) };
                self.core.recycle(node);
                processed = true;
                self.dispatcher.dispatch(&event, &args);
            } else {
                kept.nodes.push_back(node);
            }
        }

        processed
    }

    /// Processes pending events until the deadline passes; the remainder stays buffered.
    ///
    /// Returns `true` if at least one event was processed.
    pub fn process_until(&self, deadline: Instant) -> bool {
        if self.core.is_empty() {
            return false;
        }

        let mut drained = self.core.drain();
        let mut processed = false;

        while Instant::now() < deadline {
            let Some(node) = drained.nodes.pop_front() else {
                break;
            };

            // SAFETY: Nodes on the drain list carry initialized payloads; we own them.
            let (event, args) = unsafe { QueueNode::take_payload(node) };
            self.core.recycle(node);
            processed = true;

            self.dispatcher.dispatch(&event, &args);
        }

        processed
    }

    /// Returns `true` if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Copies the next pending event without consuming it.
    #[must_use]
    pub fn peek_event(&self) -> Option<(E, Args)>
    where
        E: Clone,
        Args: Clone,
    {
        self.core.peek_with(Clone::clone)
    }

    /// Removes and returns the next pending event without dispatching it.
    #[must_use]
    pub fn take_event(&self) -> Option<(E, Args)> {
        self.core.take()
    }

    /// Blocks until the queue is non-empty.
    ///
    /// May return while another consumer races the events away; callers loop around
    /// `wait`/`process`.
    pub fn wait(&self) {
        self.core.wait();
    }

    /// Blocks until the queue is non-empty or the timeout elapses.
    ///
    /// Returns `true` if the queue became non-empty before the deadline. An expired
    /// timeout is an ordinary outcome, not an error.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.core.wait_for(timeout)
    }

    /// Blocks until the queue has no pending events.
    pub fn wait_until_empty(&self) {
        self.core.wait_until_empty();
    }
}

impl<E, Args, P> Default for EventQueue<E, Args, P>
where
    E: EventKey + Send,
    Args: Send + 'static,
    P: Policies,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, Args, P> fmt::Debug for EventQueue<E, Args, P>
where
    E: EventKey + Send,
    Args: Send + 'static,
    P: Policies,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}
