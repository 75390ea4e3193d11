//! A bounded LRU map with a [`fmt::Debug`] implementation.

use derive_more::{Deref, DerefMut};
use schnellru::{ByLength, Limiter};
use std::{fmt, hash::Hash};

/// Wrapper of [`schnellru::LruMap`] that implements [`fmt::Debug`].
#[derive(Deref, DerefMut, Default)]
pub struct LruMap<K, V, L = ByLength>(schnellru::LruMap<K, V, L>)
where
    K: Hash + PartialEq,
    L: Limiter<K, V>;

impl<K, V, L> fmt::Debug for LruMap<K, V, L>
where
    K: Hash + PartialEq + fmt::Display,
    V: fmt::Debug,
    L: Limiter<K, V> + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries =
            self.iter().map(|(key, value)| format!("{key}: {value:?}")).collect::<Vec<_>>();
        f.debug_struct("LruMap")
            .field("limiter", self.limiter())
            .field("entries", &entries.join(", "))
            .finish()
    }
}

impl<K, V> LruMap<K, V>
where
    K: Hash + PartialEq,
{
    /// Returns a new cache bounded to `max_length` entries.
    pub fn new(max_length: u32) -> Self {
        Self(schnellru::LruMap::new(ByLength::new(max_length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache: LruMap<u64, u64> = LruMap::new(2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(&1).is_some());
        cache.insert(3, 3);
        assert!(cache.peek(&2).is_none());
        assert!(cache.peek(&1).is_some());
    }

    #[test]
    fn debug_lists_entries() {
        let mut cache: LruMap<u64, u64> = LruMap::new(4);
        cache.insert(7, 42);
        assert!(format!("{cache:?}").contains("7: 42"));
    }
}
