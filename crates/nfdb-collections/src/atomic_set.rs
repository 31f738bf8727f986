// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{AtomicUnorderedMap, CapacityError};
use std::hash::Hash;

/// [`AtomicUnorderedMap`] with unit values. Holds transaction-id and edge
/// sets for the serialization graph.
pub struct AtomicUnorderedSet<K> {
    map: AtomicUnorderedMap<K, ()>,
}

impl<K> AtomicUnorderedSet<K>
where
    K: Copy + Eq + Hash + Default,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            map: AtomicUnorderedMap::new(capacity),
        }
    }

    pub fn insert(&self, key: K) -> Result<(), CapacityError> {
        self.map.insert(key, ())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    pub fn erase(&self, key: &K) -> bool {
        self.map.erase(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.map.iter().map(|(key, ())| key)
    }

    /// See [`AtomicUnorderedMap::clear`]; quiescent callers only.
    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;

    #[test]
    fn insert_contains_erase() {
        let set: AtomicUnorderedSet<u64> = AtomicUnorderedSet::new(16);
        assert_ok!(set.insert(10));
        assert_ok!(set.insert(20));
        assert!(set.contains(&10));
        assert!(!set.contains(&30));
        assert!(set.erase(&10));
        assert!(!set.contains(&10));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn iteration_snapshot() {
        let set: AtomicUnorderedSet<u64> = AtomicUnorderedSet::new(32);
        for i in 0..10 {
            assert_ok!(set.insert(i));
        }
        let mut seen: Vec<u64> = set.iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn clear_resets() {
        let set: AtomicUnorderedSet<u64> = AtomicUnorderedSet::new(8);
        for i in 0..5 {
            assert_ok!(set.insert(i));
        }
        set.clear();
        assert!(set.is_empty());
        assert_ok!(set.insert(3));
        assert!(set.contains(&3));
    }
}
