use std::collections::BTreeMap;
use std::hash::Hash;

/// The per-event-key index container used by dispatchers, selected by the policy bundle.
///
/// Only the two operations the dispatch and registration paths need: a borrowed lookup and
/// an insert-if-absent. Entries are never removed; an event key that once had a listener
/// keeps its (possibly empty) callback list for the dispatcher's lifetime.
pub trait EventMap<K, V>: Default {
    /// Looks up the value for a key.
    fn get(&self, key: &K) -> Option<&V>;

    /// Returns the existing value for a key, or inserts the one produced by `make`.
    fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &V;
}

/// Hash-based event index. The default: event keys are usually small and hot, which is
/// exactly what foldhash is tuned for.
#[derive(Debug)]
pub struct HashedEventMap<K, V>(foldhash::HashMap<K, V>);

impl<K, V> Default for HashedEventMap<K, V> {
    fn default() -> Self {
        Self(foldhash::HashMap::default())
    }
}

impl<K: Hash + Eq, V> EventMap<K, V> for HashedEventMap<K, V> {
    fn get(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }

    fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &V {
        self.0.entry(key).or_insert_with(make)
    }
}

/// Ordered event index, for event key types where a comparison tree beats hashing or where
/// deterministic iteration order matters to a mixin.
#[derive(Debug)]
pub struct OrderedEventMap<K, V>(BTreeMap<K, V>);

impl<K, V> Default for OrderedEventMap<K, V> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord, V> EventMap<K, V> for OrderedEventMap<K, V> {
    fn get(&self, key: &K) -> Option<&V> {
        self.0.get(key)
    }

    fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> &V {
        self.0.entry(key).or_insert_with(make)
    }
}
