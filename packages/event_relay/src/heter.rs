//! Heterogeneous dispatcher and queue: the listener signature varies per event key.
//!
//! Each event key is bound to an argument type at first registration. The per-event
//! callback list is stored type-erased together with the `TypeId` of that argument type
//! and a monomorphized invoke thunk; every later registration, dispatch and enqueue is
//! checked against the recorded type and fails with
//! [`SignatureMismatch`](crate::Error::SignatureMismatch) on disagreement.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatcher::{IntoListener, ListenerHandle, ListenerList};
use crate::error::{Error, Result};
use crate::event_map::EventMap;
use crate::policies::{Admits, DefaultPolicies, EventKey, Policies, RwLockOf};
use crate::queue::QueueCore;
use crate::queue_list::QueueNode;

/// The type-erased per-event entry: the argument type fixed at first registration, the
/// erased callback list, and thunks monomorphized for that argument type.
struct ListenerSlot<E> {
    args_type: TypeId,
    args_type_name: &'static str,
    list: Arc<dyn Any + Send + Sync>,
    invoke: fn(&(dyn Any + Send + Sync), &E, &dyn Any),
    is_empty: fn(&(dyn Any + Send + Sync)) -> bool,
}

impl<E> Clone for ListenerSlot<E> {
    fn clone(&self) -> Self {
        Self {
            args_type: self.args_type,
            args_type_name: self.args_type_name,
            list: Arc::clone(&self.list),
            invoke: self.invoke,
            is_empty: self.is_empty,
        }
    }
}

impl<E: EventKey> ListenerSlot<E> {
    fn new<A: 'static, P: Policies>() -> Self {
        Self {
            args_type: TypeId::of::<A>(),
            args_type_name: type_name::<A>(),
            list: Arc::new(ListenerList::<E, A, P>::new()),
            invoke: invoke_erased::<E, A, P>,
            is_empty: is_empty_erased::<E, A, P>,
        }
    }

    /// Verifies that an operation's argument type matches the registered one.
    fn check<A: 'static>(&self) -> Result<()> {
        if self.args_type == TypeId::of::<A>() {
            Ok(())
        } else {
            Err(Error::SignatureMismatch {
                expected: self.args_type_name,
                actual: type_name::<A>(),
            })
        }
    }

    /// The concretely typed callback list behind the erased storage.
    fn typed_list<A: 'static, P: Policies>(&self) -> Arc<ListenerList<E, A, P>> {
        Arc::clone(&self.list)
            .downcast::<ListenerList<E, A, P>>()
            .unwrap_or_else(|_| panic!("guarded by TypeId"))
    }
}

fn invoke_erased<E: EventKey, A: 'static, P: Policies>(
    list: &(dyn Any + Send + Sync),
    event: &E,
    args: &dyn Any,
) {
    let list = list
        .downcast_ref::<ListenerList<E, A, P>>()
        .expect("guarded by TypeId");
    let args = args.downcast_ref::<A>().expect("guarded by TypeId");

    list.for_each(|listener| listener(event, args));
}

fn is_empty_erased<E: EventKey, A: 'static, P: Policies>(list: &(dyn Any + Send + Sync)) -> bool {
    list.downcast_ref::<ListenerList<E, A, P>>()
        .expect("guarded by TypeId")
        .is_empty()
}

/// A dispatcher whose listener signature varies per event key.
///
/// Operationally a [`Dispatcher`](crate::Dispatcher), except that registration and
/// dispatch are generic over the argument type and return a [`Result`]: the first
/// registration for an event key fixes its argument type, and every later operation on
/// that key must use the same type.
///
/// The policy's mixin axis does not apply here: a [`Mixin`](crate::Mixin) chain is typed
/// over one argument type, which a heterogeneous dispatcher does not have, so
/// `P::Mixins` is never instantiated on this path.
///
/// # Examples
///
/// ```rust
/// use event_relay::HeterDispatcher;
///
/// let dispatcher = HeterDispatcher::<&'static str>::new();
///
/// dispatcher
///     .append_listener("text", |args: &String| println!("text: {args}"))
///     .unwrap();
/// dispatcher
///     .append_listener("number", |args: &i32| println!("number: {args}"))
///     .unwrap();
///
/// dispatcher.dispatch(&"text", &"hello".to_string()).unwrap();
/// dispatcher.dispatch(&"number", &5).unwrap();
///
/// // The signature was fixed at registration.
/// assert!(dispatcher.dispatch(&"text", &5).is_err());
/// ```
pub struct HeterDispatcher<E: EventKey, P: Policies = DefaultPolicies> {
    slots: RwLockOf<P, P::Map<E, ListenerSlot<E>>>,
}

impl<E: EventKey, P: Policies> HeterDispatcher<E, P> {
    /// Creates a dispatcher with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLockOf::<P, _>::new(P::Map::default()),
        }
    }

    fn slot_for(&self, event: &E) -> Option<ListenerSlot<E>> {
        self.slots.read().get(event).cloned()
    }

    /// The slot for an event, created with `A` as its argument type on first use.
    fn slot_for_or_create<A: 'static>(&self, event: E) -> Result<ListenerSlot<E>> {
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(&event) {
                slot.check::<A>()?;
                return Ok(slot.clone());
            }
        }

        let mut slots = self.slots.write();
        let slot = slots.get_or_insert_with(event, ListenerSlot::new::<A, P>);

        // We may have lost the creation race to a registration with another type.
        slot.check::<A>()?;
        Ok(slot.clone())
    }

    /// Registers a listener for an event whose arguments have type `A`.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if the event was first registered with a different
    /// argument type.
    pub fn append_listener<A, F, S>(&self, event: E, listener: F) -> Result<ListenerHandle<E, A>>
    where
        A: 'static,
        F: IntoListener<E, A, S>,
        P::ArgumentPassing: Admits<S>,
    {
        let slot = self.slot_for_or_create::<A>(event)?;
        Ok(slot.typed_list::<A, P>().append(listener.into_listener()))
    }

    /// Registers a listener at the front of the event's listener list.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] as for [`append_listener`](Self::append_listener).
    pub fn prepend_listener<A, F, S>(&self, event: E, listener: F) -> Result<ListenerHandle<E, A>>
    where
        A: 'static,
        F: IntoListener<E, A, S>,
        P::ArgumentPassing: Admits<S>,
    {
        let slot = self.slot_for_or_create::<A>(event)?;
        Ok(slot.typed_list::<A, P>().prepend(listener.into_listener()))
    }

    /// Removes a listener. Returns `Ok(false)` if it was already removed.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if `A` is not the event's registered argument type.
    pub fn remove_listener<A: 'static>(
        &self,
        event: &E,
        handle: &ListenerHandle<E, A>,
    ) -> Result<bool> {
        let Some(slot) = self.slot_for(event) else {
            return Ok(false);
        };

        slot.check::<A>()?;
        Ok(slot.typed_list::<A, P>().remove(handle))
    }

    /// Returns `true` if the event has at least one listener.
    #[must_use]
    pub fn has_any_listener(&self, event: &E) -> bool {
        self.slot_for(event)
            .is_some_and(|slot| !(slot.is_empty)(slot.list.as_ref()))
    }

    /// Invokes every listener of `event` with arguments of type `A`.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if `A` is not the event's registered argument type.
    pub fn dispatch<A: 'static>(&self, event: &E, args: &A) -> Result<()> {
        let Some(slot) = self.slot_for(event) else {
            return Ok(());
        };

        slot.check::<A>()?;
        (slot.invoke)(slot.list.as_ref(), event, args);
        Ok(())
    }

    /// Dispatch driven by an already erased payload, for the queue's drain path.
    fn dispatch_erased(
        &self,
        event: &E,
        args: &dyn Any,
        args_type_name: &'static str,
    ) -> Result<()> {
        let Some(slot) = self.slot_for(event) else {
            return Ok(());
        };

        if slot.args_type != args.type_id() {
            return Err(Error::SignatureMismatch {
                expected: slot.args_type_name,
                actual: args_type_name,
            });
        }

        (slot.invoke)(slot.list.as_ref(), event, args);
        Ok(())
    }
}

impl<E: EventKey, P: Policies> Default for HeterDispatcher<E, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventKey, P: Policies> fmt::Debug for HeterDispatcher<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// One buffered heterogeneous event: the key plus its erased arguments.
struct ErasedEvent<E> {
    event: E,
    args: Box<dyn Any + Send>,
    args_type_name: &'static str,
}

/// A buffered event queue whose listener signature varies per event key.
///
/// The asynchronous counterpart of [`HeterDispatcher`], with the same pending/free node
/// recycling as [`EventQueue`](crate::EventQueue). Argument values are stored erased and
/// re-checked against the event's registered type when the event is processed.
pub struct HeterQueue<E, P = DefaultPolicies>
where
    E: EventKey + Send,
    P: Policies,
{
    dispatcher: HeterDispatcher<E, P>,
    core: QueueCore<ErasedEvent<E>, P>,
}

impl<E, P> HeterQueue<E, P>
where
    E: EventKey + Send,
    P: Policies,
{
    /// Creates an empty queue with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dispatcher: HeterDispatcher::new(),
            core: QueueCore::new(),
        }
    }

    /// The dispatcher handling the synchronous side of this queue.
    #[must_use]
    pub fn dispatcher(&self) -> &HeterDispatcher<E, P> {
        &self.dispatcher
    }

    /// Registers a listener; see [`HeterDispatcher::append_listener`].
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if the event's argument type disagrees.
    pub fn append_listener<A, F, S>(&self, event: E, listener: F) -> Result<ListenerHandle<E, A>>
    where
        A: 'static,
        F: IntoListener<E, A, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.dispatcher.append_listener(event, listener)
    }

    /// Removes a listener; see [`HeterDispatcher::remove_listener`].
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if the event's argument type disagrees.
    pub fn remove_listener<A: 'static>(
        &self,
        event: &E,
        handle: &ListenerHandle<E, A>,
    ) -> Result<bool> {
        self.dispatcher.remove_listener(event, handle)
    }

    /// Invokes the listeners for `event` immediately, bypassing the queue.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if `A` is not the event's registered argument type.
    pub fn dispatch<A: 'static>(&self, event: &E, args: &A) -> Result<()> {
        self.dispatcher.dispatch(event, args)
    }

    /// Buffers an event with arguments of type `A` for a later `process` call.
    ///
    /// The argument type is re-checked against the event's registered listeners when the
    /// event is processed, not here.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if no node could be obtained.
    pub fn enqueue<A: Send + 'static>(&self, event: E, args: A) -> Result<()> {
        self.core.enqueue(ErasedEvent {
            event,
            args: Box::new(args),
            args_type_name: type_name::<A>(),
        })
    }

    /// Drains every currently pending event and dispatches each to its listeners.
    ///
    /// Returns `Ok(true)` if at least one event was processed.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] stops the drain at the offending event; that event is
    /// consumed, the remainder stays buffered.
    pub fn process(&self) -> Result<bool> {
        if self.core.is_empty() {
            return Ok(false);
        }

        let mut drained = self.core.drain();
        let mut processed = false;

        while let Some(node) = drained.nodes.pop_front() {
            // SAFETY: Nodes on the drain list carry initialized payloads; we own them.
            let entry = unsafe { QueueNode::take_payload(node) };
            self.core.recycle(node);
            processed = true;

            self.dispatcher
                .dispatch_erased(&entry.event, &*entry.args, entry.args_type_name)?;
        }

        Ok(processed)
    }

    /// Processes exactly one pending event. Returns `Ok(false)` on an empty queue.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] if the event's argument type disagrees with its
    /// listeners; the event is consumed.
    pub fn process_one(&self) -> Result<bool> {
        let Some(node) = self.core.pop_one() else {
            return Ok(false);
        };

        // SAFETY: Pending nodes carry initialized payloads; the node is exclusively ours.
        let entry = unsafe { QueueNode::take_payload(node) };
        self.core.recycle(node);
        self.core.notify_if_idle();

        self.dispatcher
            .dispatch_erased(&entry.event, &*entry.args, entry.args_type_name)?;
        Ok(true)
    }

    /// Drains every currently pending event into `visitor` instead of the dispatcher.
    ///
    /// The visitor observes the same `(event, erased args)` sequence that listeners would
    /// see under [`process`](Self::process). Downcasting is the visitor's business, so no
    /// signature checking happens and nothing can fail.
    pub fn process_queue_with(&self, mut visitor: impl FnMut(&E, &dyn Any)) -> bool {
        if self.core.is_empty() {
            return false;
        }

        let mut drained = self.core.drain();
        let mut processed = false;

        while let Some(node) = drained.nodes.pop_front() {
            // SAFETY: Nodes on the drain list carry initialized payloads; we own them.
            let entry = unsafe { QueueNode::take_payload(node) };
            self.core.recycle(node);
            processed = true;

            visitor(&entry.event, &*entry.args);
        }

        processed
    }

    /// Delivers exactly one pending event to `visitor` instead of the dispatcher.
    pub fn process_one_with(&self, mut visitor: impl FnMut(&E, &dyn Any)) -> bool {
        let Some(node) = self.core.pop_one() else {
            return false;
        };

        // SAFETY: Pending nodes carry initialized payloads; the node is exclusively ours.
        let entry = unsafe { QueueNode::take_payload(node) };
        self.core.recycle(node);
        self.core.notify_if_idle();

        visitor(&entry.event, &*entry.args);
        true
    }

    /// Processes only the pending events matching `predicate`; the rest stay buffered, in
    /// order, ahead of anything enqueued later.
    ///
    /// The predicate sees the event key and the erased arguments.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] stops the drain at the offending matching event; that
    /// event is consumed, kept and not-yet-examined events stay buffered.
    pub fn process_if(&self, mut predicate: impl FnMut(&E, &dyn Any) -> bool) -> Result<bool> {
        if self.core.is_empty() {
            return Ok(false);
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
                let entry = unsafe { QueueNode::payload_ref(front) };
                predicate(&entry.event, &*entry.args)
            };

            let node = drained
                .nodes
                .pop_front()
                .expect("the list is non-empty; we just peeked its front");

            if matches {
                // SAFETY: As above; taking ownership of the payload.
                let entry = unsafe { QueueNode::take_payload(node) };
                self.core.recycle(node);
                processed = true;
                self.dispatcher
                    .dispatch_erased(&entry.event, &*entry.args, entry.args_type_name)?;
            } else {
                kept.nodes.push_back(node);
            }
        }

        Ok(processed)
    }

    /// Processes pending events until the deadline passes; the remainder stays buffered.
    ///
    /// Returns `Ok(true)` if at least one event was processed.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureMismatch`] stops the drain at the offending event; that event is
    /// consumed, the remainder stays buffered.
    pub fn process_until(&self, deadline: Instant) -> Result<bool> {
        if self.core.is_empty() {
            return Ok(false);
        }

        let mut drained = self.core.drain();
        let mut processed = false;

        while Instant::now() < deadline {
            let Some(node) = drained.nodes.pop_front() else {
                break;
            };

            // SAFETY: Nodes on the drain list carry initialized payloads; we own them.
            let entry = unsafe { QueueNode::take_payload(node) };
            self.core.recycle(node);
            processed = true;

            self.dispatcher
                .dispatch_erased(&entry.event, &*entry.args, entry.args_type_name)?;
        }

        Ok(processed)
    }

    /// Copies the next pending event's key without consuming the event.
    ///
    /// The erased arguments cannot be cloned out of the buffer; use
    /// [`take_event`](Self::take_event) to take ownership of them instead.
    #[must_use]
    pub fn peek_event(&self) -> Option<E>
    where
        E: Clone,
    {
        self.core.peek_with(|entry| entry.event.clone())
    }

    /// Removes and returns the next pending event without dispatching it.
    #[must_use]
    pub fn take_event(&self) -> Option<(E, Box<dyn Any + Send>)> {
        self.core.take().map(|entry| (entry.event, entry.args))
    }

    /// Returns `true` if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Blocks until the queue is non-empty.
    pub fn wait(&self) {
        self.core.wait();
    }

    /// Blocks until the queue is non-empty or the timeout elapses; `true` if non-empty.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.core.wait_for(timeout)
    }

    /// Blocks until the queue has no pending events.
    pub fn wait_until_empty(&self) {
        self.core.wait_until_empty();
    }
}

impl<E, P> Default for HeterQueue<E, P>
where
    E: EventKey + Send,
    P: Policies,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, P> fmt::Debug for HeterQueue<E, P>
where
    E: EventKey + Send,
    P: Policies,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HeterDispatcher<u32>: Send, Sync);
    assert_impl_all!(HeterQueue<u32>: Send, Sync);

    #[test]
    fn signatures_vary_per_event() {
        let dispatcher = HeterDispatcher::<u32>::new();
        let strings = Arc::new(Mutex::new(Vec::new()));
        let numbers = Arc::new(Mutex::new(Vec::new()));

        {
            let strings = Arc::clone(&strings);
            dispatcher
                .append_listener(1, move |args: &String| {
                    strings.lock().unwrap().push(args.clone());
                })
                .unwrap();
        }
        {
            let numbers = Arc::clone(&numbers);
            dispatcher
                .append_listener(2, move |args: &i64| numbers.lock().unwrap().push(*args))
                .unwrap();
        }

        dispatcher.dispatch(&1, &"hello".to_string()).unwrap();
        dispatcher.dispatch(&2, &99_i64).unwrap();

        assert_eq!(*strings.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(*numbers.lock().unwrap(), vec![99]);
    }

    #[test]
    fn registration_with_wrong_type_fails() {
        let dispatcher = HeterDispatcher::<u32>::new();

        dispatcher.append_listener(1, |_args: &String| {}).unwrap();

        let result = dispatcher.append_listener(1, |_args: &i64| {});
        assert!(matches!(result, Err(Error::SignatureMismatch { .. })));
    }

    #[test]
    fn dispatch_with_wrong_type_fails() {
        let dispatcher = HeterDispatcher::<u32>::new();

        dispatcher.append_listener(1, |_args: &String| {}).unwrap();

        let result = dispatcher.dispatch(&1, &5_i64);
        assert!(matches!(
            result,
            Err(Error::SignatureMismatch {
                expected: "alloc::string::String",
                actual: "i64",
            })
        ));
    }

    #[test]
    fn dispatch_to_unknown_event_is_ok() {
        let dispatcher = HeterDispatcher::<u32>::new();

        dispatcher.dispatch(&9, &5_i64).unwrap();
    }

    #[test]
    fn queue_round_trip_with_mixed_signatures() {
        let queue = HeterQueue::<u32>::new();
        let strings = Arc::new(Mutex::new(Vec::new()));
        let numbers = Arc::new(Mutex::new(Vec::new()));

        {
            let strings = Arc::clone(&strings);
            queue
                .append_listener(1, move |args: &String| {
                    strings.lock().unwrap().push(args.clone());
                })
                .unwrap();
        }
        {
            let numbers = Arc::clone(&numbers);
            queue
                .append_listener(2, move |args: &i64| numbers.lock().unwrap().push(*args))
                .unwrap();
        }

        queue.enqueue(1, "a".to_string()).unwrap();
        queue.enqueue(2, 5_i64).unwrap();
        queue.enqueue(1, "b".to_string()).unwrap();

        assert!(queue.process().unwrap());
        assert!(queue.is_empty());

        assert_eq!(
            *strings.lock().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(*numbers.lock().unwrap(), vec![5]);
    }

    #[test]
    fn queued_mismatch_surfaces_at_process() {
        let queue = HeterQueue::<u32>::new();

        queue.append_listener(1, |_args: &String| {}).unwrap();

        // Enqueue is unchecked; the mismatch is discovered when processing.
        queue.enqueue(1, 5_i64).unwrap();

        assert!(matches!(
            queue.process(),
            Err(Error::SignatureMismatch { .. })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_listener_across_types() {
        let dispatcher = HeterDispatcher::<u32>::new();

        let handle = dispatcher.append_listener(1, |_args: &String| {}).unwrap();

        assert!(dispatcher.has_any_listener(&1));
        assert!(dispatcher.remove_listener(&1, &handle).unwrap());
        assert!(!dispatcher.remove_listener(&1, &handle).unwrap());
        assert!(!dispatcher.has_any_listener(&1));
    }
}
