//! In-process event dispatching: synchronous dispatchers and buffered event queues,
//! configured by compile-time policy bundles.
//!
//! Two tightly related primitives make up the crate:
//!
//! - [`Dispatcher`] (and the per-event [`CallbackList`] underneath it) invokes registered
//!   listeners synchronously when an event is dispatched.
//! - [`EventQueue`] buffers published events so that one or more consumer threads can
//!   drain and dispatch them in batches later.
//!
//! Both are parameterized by an event-key type, an argument payload type, and a
//! [`Policies`] bundle that selects the locking primitives, the argument-passing mode,
//! the event index container, the queue-node allocator and the mixin chain — all resolved
//! at compile time.
//!
//! # Dispatching
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use event_relay::Dispatcher;
//!
//! let dispatcher = Dispatcher::<u32, String>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! // Listeners may take just the arguments...
//! let sink = Arc::clone(&seen);
//! dispatcher.append_listener(3, move |args: &String| {
//!     sink.lock().unwrap().push(args.clone());
//! });
//!
//! // ...or the event key too.
//! dispatcher.append_listener(3, |event: &u32, args: &String| {
//!     assert_eq!(*event, 3);
//!     assert!(!args.is_empty());
//! });
//!
//! dispatcher.dispatch(&3, &"hello".to_string());
//! assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
//! ```
//!
//! # Queueing
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//!
//! use event_relay::EventQueue;
//!
//! let queue = EventQueue::<u32, i32>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let sink = Arc::clone(&seen);
//! queue.append_listener(1, move |args: &i32| sink.lock().unwrap().push(*args));
//!
//! queue.enqueue(1, 10).unwrap();
//! queue.enqueue(1, 20).unwrap();
//!
//! // Typically on a consumer thread:
//! assert!(queue.process());
//! assert_eq!(*seen.lock().unwrap(), vec![10, 20]);
//! ```
//!
//! # Policies
//!
//! [`DefaultPolicies`] runs on the system locks with heap-allocated queue nodes.
//! [`HighPerfPolicies`] swaps in a back-off spinlock and recycles queue nodes through the
//! process-wide slab pool of the `slab_pool` crate:
//!
//! ```rust
//! use event_relay::{EventQueue, HighPerfPolicies};
//!
//! let queue = EventQueue::<u32, u64, HighPerfPolicies>::new();
//!
//! queue.enqueue(1, 2).unwrap();
//! assert_eq!(queue.take_event(), Some((1, 2)));
//! ```
//!
//! Custom bundles implement [`Policies`] on a unit struct, picking per axis; see the
//! [`policies`](crate::Policies) documentation.
//!
//! # Heterogeneous variants
//!
//! [`HeterDispatcher`] and [`HeterQueue`] let the listener signature vary per event key;
//! the argument type is fixed at first registration and re-checked on every operation,
//! failing with [`Error::SignatureMismatch`] on disagreement.

mod callback_list;
mod dispatcher;
mod error;
mod event_map;
mod heter;
mod mixins;
mod policies;
mod queue;
mod queue_list;
mod signal;

pub use callback_list::{CallbackHandle, CallbackList};
pub use dispatcher::{BoxedListener, Dispatcher, IntoListener, ListenerHandle};
pub use error::{Error, Result};
pub use event_map::{EventMap, HashedEventMap, OrderedEventMap};
pub use heter::{HeterDispatcher, HeterQueue};
pub use mixins::{BoxedFilter, FilterMixin, Mixin};
pub use policies::{
    Admits, ArgsOnly, ArgumentPassing, AutoDetect, DefaultPolicies, DefaultThreading, EventKey,
    ExcludeEvent, HighPerfPolicies, IncludeEvent, Policies, SpinThreading, Threading, WithEvent,
};
pub use queue::EventQueue;
pub use queue_list::{HeapNodes, HeapStorage, NodeAllocator, PooledStorage, QueueStorage};
pub use signal::{CondvarSignal, Signal};
