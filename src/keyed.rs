//! Weakly-memoized keyed factory for per-identity primitives.
//!
//! The table hands out `Arc<V>` but holds only `Weak<V>`, so a value lives
//! exactly as long as something outside still references it. Dead slots are
//! purged opportunistically on every lookup.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Concurrent map from key to weakly-held value.
///
/// While any external `Arc<V>` for a key is alive, lookups return that same
/// value; once the last holder drops it, a later lookup builds a fresh one.
pub struct WeakTable<K, V> {
    entries: DashMap<K, Weak<V>>,
}

impl<K: Eq + Hash + Clone, V> WeakTable<K, V> {
    pub fn new() -> Self {
        WeakTable {
            entries: DashMap::new(),
        }
    }

    /// Returns the live value for `key`, or installs the one `make(&key)`
    /// builds. The factory returns the `Arc` itself so values that
    /// self-register elsewhere (a bucket handing strong clones to its timer
    /// tasks) install the same allocation they registered.
    ///
    /// Installation holds the key's shard lock, so concurrent first accesses
    /// collapse to exactly one `make` call. `make` must not re-enter the
    /// table.
    pub fn get_or_create(&self, key: K, make: impl FnOnce(&K) -> Arc<V>) -> Arc<V> {
        self.purge();
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => match slot.get().upgrade() {
                Some(live) => live,
                None => {
                    let fresh = make(slot.key());
                    slot.insert(Arc::downgrade(&fresh));
                    fresh
                }
            },
            Entry::Vacant(slot) => {
                let fresh = make(slot.key());
                slot.insert(Arc::downgrade(&fresh));
                fresh
            }
        }
    }

    /// Drops every slot whose value has been reclaimed.
    pub fn purge(&self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of slots currently present, dead ones included until the next
    /// purge.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for WeakTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_key_returns_same_value_while_held() {
        let table: WeakTable<String, u32> = WeakTable::new();
        let first = table.get_or_create("a".into(), |_| Arc::new(1));
        let second = table.get_or_create("a".into(), |_| Arc::new(2));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
    }

    #[test]
    fn factory_runs_again_after_release() {
        let table: WeakTable<String, u32> = WeakTable::new();
        let calls = AtomicUsize::new(0);

        let make = |_: &String| {
            calls.fetch_add(1, Ordering::SeqCst);
            Arc::new(7_u32)
        };

        let held = table.get_or_create("a".into(), make);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(held);

        let fresh = table.get_or_create("a".into(), make);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*fresh, 7);
    }

    #[test]
    fn lookups_purge_dead_slots() {
        let table: WeakTable<String, u32> = WeakTable::new();
        let held = table.get_or_create("a".into(), |_| Arc::new(1));
        drop(held);
        assert_eq!(table.len(), 1);

        let _other = table.get_or_create("b".into(), |_| Arc::new(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_values() {
        let table: WeakTable<String, u32> = WeakTable::new();
        let a = table.get_or_create("a".into(), |_| Arc::new(1));
        let b = table.get_or_create("b".into(), |_| Arc::new(2));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
