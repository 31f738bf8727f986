// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::CapacityError;
use crossbeam::atomic::AtomicCell;
use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

const EMPTY: u8 = 0;
/// Slot won by an inserter whose key/value stores have not landed yet.
/// Probes treat it as "some other key".
const CLAIMED: u8 = 1;
const USED: u8 = 2;
const TOMBSTONE: u8 = 3;

struct Bucket<K, V> {
    state: AtomicU8,
    key: AtomicCell<K>,
    value: AtomicCell<V>,
}

/// Fixed-capacity open-addressed map with linear probing and a CAS-driven
/// bucket state machine.
///
/// Capacity never grows; overflow is reported as [`CapacityError`] and the
/// caller decides. Erase leaves a tombstone, which a later insert of any key
/// may reclaim; probes therefore stop only at a never-used bucket.
///
/// Lookups and snapshot iteration are wait-free and never tear: a bucket's
/// key/value become readable only after its state is published as used.
/// Concurrent inserts of the *same* key are not coordinated beyond the slot
/// claim; every caller in the store has a single writer per key.
pub struct AtomicUnorderedMap<K, V, S = RandomState> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
    len: AtomicUsize,
    hasher: S,
}

unsafe impl<K: Copy + Send, V: Copy + Send, S: Send> Send for AtomicUnorderedMap<K, V, S> {}
unsafe impl<K: Copy + Send, V: Copy + Send, S: Sync> Sync for AtomicUnorderedMap<K, V, S> {}

impl<K, V> AtomicUnorderedMap<K, V>
where
    K: Copy + Eq + Hash + Default,
    V: Copy + Eq + Default,
{
    /// Capacity is rounded up to a power of two. Size for the expected
    /// concurrency, e.g. `hardware threads × small constant`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        Self {
            buckets: (0..capacity)
                .map(|_| Bucket {
                    state: AtomicU8::new(EMPTY),
                    key: AtomicCell::new(K::default()),
                    value: AtomicCell::new(V::default()),
                })
                .collect(),
            mask: capacity - 1,
            len: AtomicUsize::new(0),
            hasher: RandomState::new(),
        }
    }

    /// Sized to comfortably hold one entry per hardware thread.
    pub fn with_hardware_capacity(per_thread: usize) -> Self {
        Self::new(num_cpus::get() * per_thread)
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_index(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & self.mask
    }

    /// Inserts or updates. Returns [`CapacityError`] when every bucket is
    /// occupied by other keys.
    pub fn insert(&self, key: K, value: V) -> Result<(), CapacityError> {
        let start = self.start_index(&key);
        let mut reusable = None;
        for probe in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + probe) & self.mask];
            match bucket.state.load(Ordering::Acquire) {
                USED if bucket.key.load() == key => {
                    bucket.value.store(value);
                    return Ok(());
                },
                EMPTY => {
                    // Key not present anywhere: claim here or at an earlier
                    // tombstone.
                    let target: &Bucket<K, V> = reusable.unwrap_or(bucket);
                    let prior = if std::ptr::eq(target, bucket) { EMPTY } else { TOMBSTONE };
                    if target
                        .state
                        .compare_exchange(prior, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        target.key.store(key);
                        target.value.store(value);
                        target.state.store(USED, Ordering::Release);
                        self.len.fetch_add(1, Ordering::AcqRel);
                        return Ok(());
                    }
                    // Lost the claim race; rescan.
                    return self.insert(key, value);
                },
                TOMBSTONE if reusable.is_none() => reusable = Some(bucket),
                _ => {},
            }
        }
        if let Some(target) = reusable {
            if target
                .state
                .compare_exchange(TOMBSTONE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                target.key.store(key);
                target.value.store(value);
                target.state.store(USED, Ordering::Release);
                self.len.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            return self.insert(key, value);
        }
        Err(CapacityError(self.buckets.len()))
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        let start = self.start_index(key);
        for probe in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + probe) & self.mask];
            match bucket.state.load(Ordering::Acquire) {
                USED if bucket.key.load() == *key => return Some(bucket.value.load()),
                EMPTY => return None,
                _ => {},
            }
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Removes the key, leaving a reusable tombstone.
    pub fn erase(&self, key: &K) -> bool {
        let start = self.start_index(key);
        for probe in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + probe) & self.mask];
            match bucket.state.load(Ordering::Acquire) {
                USED if bucket.key.load() == *key => {
                    if bucket
                        .state
                        .compare_exchange(USED, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                        return true;
                    }
                    return false;
                },
                EMPTY => return false,
                _ => {},
            }
        }
        false
    }

    /// Stores `value` iff the key is present.
    pub fn replace(&self, key: &K, value: V) -> bool {
        let start = self.start_index(key);
        for probe in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + probe) & self.mask];
            match bucket.state.load(Ordering::Acquire) {
                USED if bucket.key.load() == *key => {
                    bucket.value.store(value);
                    return true;
                },
                EMPTY => return false,
                _ => {},
            }
        }
        false
    }

    /// CAS on the value of an existing key.
    pub fn compare_exchange(&self, key: &K, current: V, new: V) -> bool {
        let start = self.start_index(key);
        for probe in 0..self.buckets.len() {
            let bucket = &self.buckets[(start + probe) & self.mask];
            match bucket.state.load(Ordering::Acquire) {
                USED if bucket.key.load() == *key => {
                    return bucket.value.compare_exchange(current, new).is_ok();
                },
                EMPTY => return false,
                _ => {},
            }
        }
        false
    }

    /// Racy snapshot of the live entries; never tears, may miss or double
    /// up entries moved concurrently.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.buckets.iter().filter_map(|bucket| {
            (bucket.state.load(Ordering::Acquire) == USED)
                .then(|| (bucket.key.load(), bucket.value.load()))
        })
    }

    /// Resets every bucket. Only sound while no other thread touches the
    /// map, e.g. when a recycled graph-node's edge set is re-armed.
    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.state.store(EMPTY, Ordering::Release);
        }
        self.len.store(0, Ordering::Release);
    }
}
