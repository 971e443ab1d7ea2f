use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::callback_list::{CallbackHandle, CallbackList};
use crate::error::Result;
use crate::event_map::EventMap;
use crate::mixins::Mixin;
use crate::policies::{Admits, ArgsOnly, DefaultPolicies, EventKey, Policies, RwLockOf, WithEvent};

/// The normalized storage form of a dispatcher listener.
pub type BoxedListener<E, Args> = Box<dyn Fn(&E, &Args) + Send + Sync>;

/// The callback list a dispatcher keeps per event key.
pub(crate) type ListenerList<E, Args, P> = CallbackList<BoxedListener<E, Args>, P>;

/// An owning reference to a registered listener, used to remove it or anchor an insertion.
pub type ListenerHandle<E, Args> = CallbackHandle<BoxedListener<E, Args>>;

/// Conversion of user callables into the normalized listener form.
///
/// Two listener shapes exist, distinguished by the `Shape` marker: [`WithEvent`] listeners
/// take `(&E, &Args)`, [`ArgsOnly`] listeners take `(&Args)`. The compiler infers the
/// marker from the callable's signature; the policy's argument-passing mode then decides
/// which markers a dispatcher admits.
pub trait IntoListener<E, Args, Shape> {
    /// Wraps the callable into the normalized form.
    fn into_listener(self) -> BoxedListener<E, Args>;
}

impl<E, Args, F> IntoListener<E, Args, WithEvent> for F
where
    F: Fn(&E, &Args) + Send + Sync + 'static,
{
    fn into_listener(self) -> BoxedListener<E, Args> {
        Box::new(self)
    }
}

impl<E, Args, F> IntoListener<E, Args, ArgsOnly> for F
where
    F: Fn(&Args) + Send + Sync + 'static,
{
    fn into_listener(self) -> BoxedListener<E, Args> {
        Box::new(move |_event, args| self(args))
    }
}

/// Synchronous dispatch of events to registered listeners.
///
/// A map from event key to a shared [`CallbackList`], guarded by a read/write lock:
/// dispatch and lookup take it shared, only the creation of a first-time key takes it
/// exclusive. The list pointer is cloned out under the shared lock and the lock released
/// before listeners run, so listeners are free to register, remove and dispatch
/// re-entrantly.
///
/// # Examples
///
/// ```rust
/// use std::sync::{Arc, Mutex};
///
/// use event_relay::Dispatcher;
///
/// let dispatcher = Dispatcher::<u32, String>::new();
/// let received = Arc::new(Mutex::new(Vec::new()));
///
/// let sink = Arc::clone(&received);
/// dispatcher.append_listener(3, move |args: &String| {
///     sink.lock().unwrap().push(args.clone());
/// });
///
/// dispatcher.dispatch(&3, &"hello".to_string());
/// assert_eq!(*received.lock().unwrap(), vec!["hello".to_string()]);
/// ```
pub struct Dispatcher<E: EventKey, Args: 'static, P: Policies = DefaultPolicies> {
    lists: RwLockOf<P, P::Map<E, Arc<ListenerList<E, Args, P>>>>,
    mixins: P::Mixins<E, Args>,
}

impl<E: EventKey, Args: 'static, P: Policies> Dispatcher<E, Args, P> {
    /// Creates a dispatcher with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: RwLockOf::<P, _>::new(P::Map::default()),
            mixins: P::Mixins::default(),
        }
    }

    /// The callback list for an event, if the event was ever registered.
    fn list_for(&self, event: &E) -> Option<Arc<ListenerList<E, Args, P>>> {
        self.lists.read().get(event).cloned()
    }

    /// The callback list for an event, created on first use.
    ///
    /// Fast path under the shared lock; a miss upgrades to the exclusive lock and
    /// re-checks, so two racing first-time registrations agree on one list.
    fn list_for_or_create(&self, event: E) -> Arc<ListenerList<E, Args, P>> {
        {
            let lists = self.lists.read();
            if let Some(list) = lists.get(&event) {
                return Arc::clone(list);
            }
        }

        let mut lists = self.lists.write();
        Arc::clone(lists.get_or_insert_with(event, || Arc::new(CallbackList::new())))
    }

    /// Registers a listener at the end of the event's listener list.
    ///
    /// The listener may take `(&E, &Args)` or `(&Args)`, subject to the policy's
    /// argument-passing mode.
    pub fn append_listener<F, S>(&self, event: E, listener: F) -> ListenerHandle<E, Args>
    where
        F: IntoListener<E, Args, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.list_for_or_create(event).append(listener.into_listener())
    }

    /// Registers a listener at the front of the event's listener list.
    pub fn prepend_listener<F, S>(&self, event: E, listener: F) -> ListenerHandle<E, Args>
    where
        F: IntoListener<E, Args, S>,
        P::ArgumentPassing: Admits<S>,
    {
        self.list_for_or_create(event).prepend(listener.into_listener())
    }

    /// Registers a listener immediately before the one `anchor` refers to.
    ///
    /// # Errors
    ///
    /// [`crate::Error::InvalidAnchor`] if the anchor belongs to another event's list or was
    /// already removed.
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
        self.list_for_or_create(event)
            .insert_before(listener.into_listener(), anchor)
    }

    /// Removes a listener. Returns `false` if it was already removed or the handle does
    /// not belong to this event.
    pub fn remove_listener(&self, event: &E, handle: &ListenerHandle<E, Args>) -> bool {
        self.list_for(event)
            .is_some_and(|list| list.remove(handle))
    }

    /// Returns `true` if the event has at least one listener.
    #[must_use]
    pub fn has_any_listener(&self, event: &E) -> bool {
        self.list_for(event).is_some_and(|list| !list.is_empty())
    }

    /// Invokes every listener of `event` in registration order.
    ///
    /// Mixin `before_dispatch` hooks run first; any returning false suppresses the
    /// dispatch, skipping the listeners and the `after_dispatch` hooks alike. A panicking
    /// listener propagates to the caller; remaining listeners are not invoked.
    pub fn dispatch(&self, event: &E, args: &Args) {
        if !self.mixins.before_dispatch(event, args) {
            return;
        }

        if let Some(list) = self.list_for(event) {
            list.for_each(|listener| listener(event, args));
        }

        self.mixins.after_dispatch(event, args);
    }

    /// The policy-selected mixin chain.
    #[must_use]
    pub fn mixins(&self) -> &P::Mixins<E, Args> {
        &self.mixins
    }
}

impl<E: EventKey, Args: 'static, P: Policies> Default for Dispatcher<E, Args, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventKey, Args: 'static, P: Policies> fmt::Debug for Dispatcher<E, Args, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::mixins::FilterMixin;
    use crate::policies::{
        AutoDetect, DefaultThreading, ExcludeEvent, HighPerfPolicies, IncludeEvent,
    };
    use crate::event_map::OrderedEventMap;
    use crate::queue_list::HeapStorage;

    assert_impl_all!(Dispatcher<u32, String>: Send, Sync);

    type Log<T> = Arc<Mutex<Vec<T>>>;

    fn log<T>() -> Log<T> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn dispatches_to_matching_event_only() {
        let dispatcher = Dispatcher::<u32, i32>::new();
        let seen = log();

        for event in [1_u32, 2] {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener(event, move |args: &i32| {
                seen.lock().unwrap().push((event, *args));
            });
        }

        dispatcher.dispatch(&1, &10);
        dispatcher.dispatch(&2, &20);
        dispatcher.dispatch(&3, &30);

        assert_eq!(*seen.lock().unwrap(), vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn listener_may_take_the_event_key() {
        let dispatcher = Dispatcher::<u32, i32>::new();
        let seen = log();

        {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener(7, move |event: &u32, args: &i32| {
                seen.lock().unwrap().push((*event, *args));
            });
        }

        dispatcher.dispatch(&7, &70);

        assert_eq!(*seen.lock().unwrap(), vec![(7, 70)]);
    }

    #[test]
    fn registration_order_is_dispatch_order() {
        let dispatcher = Dispatcher::<u32, i32>::new();
        let seen = log();

        let push = |tag: i32| {
            let seen = Arc::clone(&seen);
            move |_args: &i32| seen.lock().unwrap().push(tag)
        };

        let first = dispatcher.append_listener(1, push(1));
        dispatcher.append_listener(1, push(2));
        dispatcher.prepend_listener(1, push(0));
        dispatcher
            .insert_listener_before(1, push(10), &first)
            .unwrap();

        dispatcher.dispatch(&1, &0);

        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 1, 2]);
    }

    #[test]
    fn remove_listener_works_and_is_idempotent() {
        let dispatcher = Dispatcher::<u32, i32>::new();
        let seen = log();

        let handle = {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener(1, move |args: &i32| seen.lock().unwrap().push(*args))
        };

        assert!(dispatcher.remove_listener(&1, &handle));
        assert!(!dispatcher.remove_listener(&1, &handle));
        assert!(!dispatcher.remove_listener(&2, &handle));

        dispatcher.dispatch(&1, &5);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn has_any_listener_tracks_registrations() {
        let dispatcher = Dispatcher::<u32, i32>::new();

        assert!(!dispatcher.has_any_listener(&1));

        let handle = dispatcher.append_listener(1, |_args: &i32| {});
        assert!(dispatcher.has_any_listener(&1));
        assert!(!dispatcher.has_any_listener(&2));

        dispatcher.remove_listener(&1, &handle);
        assert!(!dispatcher.has_any_listener(&1));
    }

    #[test]
    fn works_with_high_perf_policies() {
        let dispatcher = Dispatcher::<u32, i32, HighPerfPolicies>::new();
        let seen = log();

        {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener(1, move |args: &i32| seen.lock().unwrap().push(*args));
        }
        dispatcher.dispatch(&1, &42);

        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn works_with_ordered_event_map() {
        struct OrderedPolicies;

        impl Policies for OrderedPolicies {
            type Threading = DefaultThreading;
            type ArgumentPassing = AutoDetect;
            type Map<K: EventKey, V: 'static> = OrderedEventMap<K, V>;
            type QueueStorage = HeapStorage;
            type Mixins<E: 'static, Args: 'static> = ();
        }

        let dispatcher = Dispatcher::<String, i32, OrderedPolicies>::new();
        let seen = log();

        {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener("alpha".to_string(), move |args: &i32| {
                seen.lock().unwrap().push(*args);
            });
        }

        dispatcher.dispatch(&"alpha".to_string(), &1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn filter_mixin_suppresses_dispatch() {
        struct FilteredPolicies;

        impl Policies for FilteredPolicies {
            type Threading = DefaultThreading;
            type ArgumentPassing = AutoDetect;
            type Map<K: EventKey, V: 'static> = crate::event_map::HashedEventMap<K, V>;
            type QueueStorage = HeapStorage;
            type Mixins<E: 'static, Args: 'static> = FilterMixin<E, Args>;
        }

        let dispatcher = Dispatcher::<u32, i32, FilteredPolicies>::new();
        let seen = log();

        {
            let seen = Arc::clone(&seen);
            dispatcher.append_listener(1, move |args: &i32| seen.lock().unwrap().push(*args));
        }
        dispatcher.mixins().append_filter(|_event, args| *args >= 0);

        dispatcher.dispatch(&1, &5);
        dispatcher.dispatch(&1, &-5);
        dispatcher.dispatch(&1, &6);

        assert_eq!(*seen.lock().unwrap(), vec![5, 6]);
    }

    #[test]
    fn argument_passing_modes_compile_as_specified() {
        struct IncludePolicies;

        impl Policies for IncludePolicies {
            type Threading = DefaultThreading;
            type ArgumentPassing = IncludeEvent;
            type Map<K: EventKey, V: 'static> = crate::event_map::HashedEventMap<K, V>;
            type QueueStorage = HeapStorage;
            type Mixins<E: 'static, Args: 'static> = ();
        }

        struct ExcludePolicies;

        impl Policies for ExcludePolicies {
            type Threading = DefaultThreading;
            type ArgumentPassing = ExcludeEvent;
            type Map<K: EventKey, V: 'static> = crate::event_map::HashedEventMap<K, V>;
            type QueueStorage = HeapStorage;
            type Mixins<E: 'static, Args: 'static> = ();
        }

        let include = Dispatcher::<u32, i32, IncludePolicies>::new();
        include.append_listener(1, |_event: &u32, _args: &i32| {});
        // `include.append_listener(1, |_args: &i32| {})` must not compile.

        let exclude = Dispatcher::<u32, i32, ExcludePolicies>::new();
        exclude.append_listener(1, |_args: &i32| {});
        // `exclude.append_listener(1, |_event: &u32, _args: &i32| {})` must not compile.
    }

    #[test]
    fn reentrant_registration_from_listener() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dispatcher = Arc::new(Dispatcher::<u32, i32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let reentrant = Arc::clone(&dispatcher);
            let calls = Arc::clone(&calls);
            dispatcher.append_listener(1, move |_args: &i32| {
                calls.fetch_add(1, Ordering::Relaxed);
                let inner_calls = Arc::clone(&calls);
                reentrant.append_listener(1, move |_args: &i32| {
                    inner_calls.fetch_add(100, Ordering::Relaxed);
                });
            });
        }

        dispatcher.dispatch(&1, &0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        dispatcher.dispatch(&1, &0);
        assert_eq!(calls.load(Ordering::Relaxed), 102);
    }
}
