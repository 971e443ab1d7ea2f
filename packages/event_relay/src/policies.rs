//! Compile-time configuration of dispatchers and queues.
//!
//! A [`Policies`] implementation bundles every tunable axis: which raw locks and signal the
//! containers run on, which listener shapes registration accepts, which container indexes
//! event keys, where queue nodes are allocated, and which mixins wrap dispatch. All of it
//! resolves at compile time; exchanging a policy never changes semantics, only mechanics.

use std::hash::Hash;

use slab_pool::SpinLock;

use crate::event_map::{EventMap, HashedEventMap};
use crate::mixins::Mixin;
use crate::queue_list::{HeapStorage, PooledStorage, QueueStorage};
use crate::signal::{CondvarSignal, Signal};

/// Bounds every event key type must satisfy.
///
/// Both `Ord` and `Hash` are required so that any key type works with either event index
/// (see [`EventMap`]) without the policy choice leaking into user bounds.
pub trait EventKey: Ord + Hash + Eq + 'static {}

impl<T: Ord + Hash + Eq + 'static> EventKey for T {}

/// The threading axis: raw locks and the wakeup signal.
///
/// Expressed in terms of [`lock_api`] raw locks so that a policy can swap the system
/// primitives for the back-off [`SpinLock`] (or anything else satisfying the traits)
/// without touching container code.
pub trait Threading: 'static {
    /// Guards callback-list structure and the queue's pending/free lists.
    type RawMutex: lock_api::RawMutex + Send + Sync + 'static;

    /// Guards the dispatcher's event index; dispatch takes it shared, first-time
    /// registration takes it exclusive.
    type RawRwLock: lock_api::RawRwLock + Send + Sync + 'static;

    /// Wakes consumers blocked in the queue's wait operations.
    type Signal: Signal;
}

/// System locks: parking_lot mutex and rwlock, condition-variable signal.
#[derive(Debug)]
pub struct DefaultThreading;

impl Threading for DefaultThreading {
    type RawMutex = parking_lot::RawMutex;
    type RawRwLock = parking_lot::RawRwLock;
    type Signal = CondvarSignal;
}

/// Back-off spinlock in place of the system mutex, for short critical sections under
/// contention. The event index keeps the rwlock: dispatch wants shared access.
#[derive(Debug)]
pub struct SpinThreading;

impl Threading for SpinThreading {
    type RawMutex = SpinLock;
    type RawRwLock = parking_lot::RawRwLock;
    type Signal = CondvarSignal;
}

/// Marker for listeners of shape `Fn(&Event, &Args)`: the event key is forwarded as the
/// first argument.
pub enum WithEvent {}

/// Marker for listeners of shape `Fn(&Args)`: the event key is not forwarded.
pub enum ArgsOnly {}

/// The argument-passing axis: which listener shapes a dispatcher accepts.
pub trait ArgumentPassing: 'static {}

/// Accepts both listener shapes; the shape is inferred per registration.
#[derive(Debug)]
pub struct AutoDetect;

/// Accepts only listeners that take the event key ([`WithEvent`]). Registering an
/// [`ArgsOnly`] listener is a compile-time error.
#[derive(Debug)]
pub struct IncludeEvent;

/// Accepts only listeners that do not take the event key ([`ArgsOnly`]). Registering a
/// [`WithEvent`] listener is a compile-time error.
#[derive(Debug)]
pub struct ExcludeEvent;

impl ArgumentPassing for AutoDetect {}
impl ArgumentPassing for IncludeEvent {}
impl ArgumentPassing for ExcludeEvent {}

/// Implemented by an argument-passing mode for each listener shape it admits.
pub trait Admits<Shape>: ArgumentPassing {}

impl Admits<WithEvent> for AutoDetect {}
impl Admits<ArgsOnly> for AutoDetect {}
impl Admits<WithEvent> for IncludeEvent {}
impl Admits<ArgsOnly> for ExcludeEvent {}

/// A complete policy bundle.
///
/// Implement this on a unit struct to configure a dispatcher or queue; see
/// [`DefaultPolicies`] and [`HighPerfPolicies`] for the two shipped bundles.
pub trait Policies: 'static + Sized {
    /// Locks and signal.
    type Threading: Threading;

    /// Which listener shapes registration accepts.
    type ArgumentPassing: ArgumentPassing;

    /// The per-event-key index container.
    type Map<K: EventKey, V: 'static>: EventMap<K, V>;

    /// Where queue nodes live.
    type QueueStorage: QueueStorage;

    /// Mixin chain layered over dispatch. `()` for none; tuples chain several.
    type Mixins<E: 'static, Args: 'static>: Mixin<E, Args>;
}

/// System locks, auto-detected listener shapes, hashed event index, system-allocated queue
/// nodes, no mixins.
#[derive(Debug)]
pub struct DefaultPolicies;

impl Policies for DefaultPolicies {
    type Threading = DefaultThreading;
    type ArgumentPassing = AutoDetect;
    type Map<K: EventKey, V: 'static> = HashedEventMap<K, V>;
    type QueueStorage = HeapStorage;
    type Mixins<E: 'static, Args: 'static> = ();
}

/// The one-stop high-performance bundle: back-off spinlock for the short critical
/// sections, shared/exclusive separation on the event index, and slab-pool-backed queue
/// nodes with 8192-slot slabs.
#[derive(Debug)]
pub struct HighPerfPolicies;

impl Policies for HighPerfPolicies {
    type Threading = SpinThreading;
    type ArgumentPassing = AutoDetect;
    type Map<K: EventKey, V: 'static> = HashedEventMap<K, V>;
    type QueueStorage = PooledStorage<8192>;
    type Mixins<E: 'static, Args: 'static> = ();
}

/// The raw mutex selected by a policy bundle.
pub(crate) type RawMutexOf<P> = <<P as Policies>::Threading as Threading>::RawMutex;

/// A [`lock_api::Mutex`] running on the policy's raw mutex.
pub(crate) type MutexOf<P, T> = lock_api::Mutex<RawMutexOf<P>, T>;

/// A [`lock_api::RwLock`] running on the policy's raw rwlock.
pub(crate) type RwLockOf<P, T> =
    lock_api::RwLock<<<P as Policies>::Threading as Threading>::RawRwLock, T>;

/// The signal selected by a policy bundle.
pub(crate) type SignalOf<P> = <<P as Policies>::Threading as Threading>::Signal;
