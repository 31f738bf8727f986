// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Upper bound on segments; offsets are 64-bit so this can never be hit
/// before memory is.
const MAX_SEGMENTS: usize = 64;

struct Segment<V> {
    cells: Box<[AtomicCell<V>]>,
    /// One bit per cell; a cell is visible to iteration only while its bit
    /// is set.
    alive: Box<[AtomicU64]>,
}

impl<V: Default> Segment<V> {
    fn new(len: usize) -> Box<Self> {
        Box::new(Self {
            cells: (0..len).map(|_| AtomicCell::new(V::default())).collect(),
            alive: (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        })
    }
}

/// Expandable segmented vector of atomic cells, keyed by dense 64-bit
/// offset.
///
/// Capacity grows by powers of two: segment `i > 0` holds
/// `1 << (reserved + i - 1)` cells and segment 0 holds `1 << reserved`.
/// Growth allocates a new segment and never moves a cell, so the address of
/// every published offset is stable for the vector's lifetime; the row
/// registry relies on this to hand out per-row state without indirection.
///
/// `push_back` claims an offset with a fetch-add on the size counter and
/// only then ensures capacity, growing under an internal mutex. Erase is a
/// tombstone: the offset stays addressable, iteration skips it.
pub struct AtomicExtentVector<V> {
    segments: [AtomicPtr<Segment<V>>; MAX_SEGMENTS],
    /// Number of segments allocated so far.
    extent: AtomicUsize,
    /// log2 of segment 0's capacity; fixed by the first `reserve`/growth.
    reserved: AtomicUsize,
    size: AtomicU64,
    grow_lock: Mutex<()>,
}

unsafe impl<V: Send> Send for AtomicExtentVector<V> {}
unsafe impl<V: Send> Sync for AtomicExtentVector<V> {}

impl<V: Copy + Eq + Default> AtomicExtentVector<V> {
    pub fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            extent: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
            size: AtomicU64::new(0),
            grow_lock: Mutex::new(()),
        }
    }

    /// Pre-sizes segment 0 for `n` cells (rounded up to a power of two).
    /// Must run before the vector is shared; growth fixes the segment
    /// geometry the first time it happens.
    pub fn reserve(&self, n: usize) {
        let _guard = self.grow_lock.lock();
        if self.extent.load(Ordering::Relaxed) == 0 && n > 0 {
            let n = n.next_power_of_two();
            self.segments[0].store(Box::into_raw(Segment::new(n)), Ordering::Release);
            self.reserved.store(n.trailing_zeros() as usize, Ordering::Release);
            self.extent.store(1, Ordering::Release);
        }
    }

    /// Number of offsets ever claimed, including tombstoned ones.
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> u64 {
        let extent = self.extent.load(Ordering::Acquire);
        if extent == 0 {
            0
        } else {
            1 << (self.reserved.load(Ordering::Acquire) + extent - 1)
        }
    }

    /// Segment index for an offset, from its leading-zero count and the
    /// reserved base.
    fn segment_index(&self, offset: u64) -> usize {
        if offset == 0 {
            return 0;
        }
        let reserved = self.reserved.load(Ordering::Acquire) as u32;
        let log2 = 63 - offset.leading_zeros();
        if log2 < reserved {
            0
        } else {
            (log2 - reserved + 1) as usize
        }
    }

    fn segment_base(&self, index: usize) -> u64 {
        if index == 0 {
            0
        } else {
            1 << (self.reserved.load(Ordering::Acquire) + index - 1)
        }
    }

    fn cell(&self, offset: u64) -> &AtomicCell<V> {
        let index = self.segment_index(offset);
        let segment = self.segments[index].load(Ordering::Acquire);
        assert!(!segment.is_null(), "offset {} beyond capacity", offset);
        let segment = unsafe { &*segment };
        &segment.cells[(offset - self.segment_base(index)) as usize]
    }

    fn alive_word(&self, offset: u64) -> (&AtomicU64, u64) {
        let index = self.segment_index(offset);
        let segment = self.segments[index].load(Ordering::Acquire);
        assert!(!segment.is_null(), "offset {} beyond capacity", offset);
        let segment = unsafe { &*segment };
        let local = offset - self.segment_base(index);
        (&segment.alive[(local / 64) as usize], 1 << (local % 64))
    }

    fn grow(&self) {
        let _guard = self.grow_lock.lock();
        if self.size.load(Ordering::Acquire) < self.capacity() {
            return;
        }
        let extent = self.extent.load(Ordering::Relaxed);
        let len = if extent == 0 {
            self.reserved.store(0, Ordering::Release);
            1
        } else {
            self.capacity() as usize
        };
        self.segments[extent].store(Box::into_raw(Segment::new(len)), Ordering::Release);
        self.extent.store(extent + 1, Ordering::Release);
    }

    /// Claims the next offset, publishes `value` there and marks it alive.
    pub fn push_back(&self, value: V) -> u64 {
        let offset = self.size.fetch_add(1, Ordering::AcqRel);
        while offset >= self.capacity() {
            self.grow();
        }
        self.cell(offset).store(value);
        let (word, bit) = self.alive_word(offset);
        word.fetch_or(bit, Ordering::Release);
        offset
    }

    pub fn get(&self, offset: u64) -> V {
        self.cell(offset).load()
    }

    pub fn store(&self, offset: u64, value: V) {
        self.cell(offset).store(value);
    }

    /// Atomically replaces the cell, returning the previous value.
    pub fn replace(&self, offset: u64, value: V) -> V {
        self.cell(offset).swap(value)
    }

    pub fn compare_exchange(&self, offset: u64, current: V, new: V) -> bool {
        self.cell(offset).compare_exchange(current, new).is_ok()
    }

    pub fn is_alive(&self, offset: u64) -> bool {
        let (word, bit) = self.alive_word(offset);
        word.load(Ordering::Acquire) & bit != 0
    }

    /// Tombstones the offset. The cell stays addressable; iteration skips
    /// it. Returns whether the offset was alive.
    pub fn erase(&self, offset: u64) -> bool {
        let (word, bit) = self.alive_word(offset);
        word.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Snapshot iteration over alive offsets. Racy with respect to
    /// concurrent pushes and erases, but never observes unpublished cells:
    /// a cell claimed by `push_back` is skipped until its alive bit lands.
    pub fn iter(&self) -> impl Iterator<Item = V> + '_ {
        let snapshot = self.len();
        (0..snapshot).filter(|&off| self.is_alive(off)).map(|off| self.get(off))
    }

    /// Like [`iter`](Self::iter), but yields offsets too.
    pub fn iter_entries(&self) -> impl Iterator<Item = (u64, V)> + '_ {
        let snapshot = self.len();
        (0..snapshot)
            .filter(|&off| self.is_alive(off))
            .map(|off| (off, self.get(off)))
    }
}

impl AtomicExtentVector<u64> {
    /// Fetch-and-add on a counter cell; the ticket dispenser of the row
    /// registry.
    pub fn fetch_add(&self, offset: u64, value: u64) -> u64 {
        self.cell(offset).fetch_add(value)
    }
}

impl<V: Copy + Eq + Default> Default for AtomicExtentVector<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for AtomicExtentVector<V> {
    fn drop(&mut self) {
        for segment in &self.segments {
            let ptr = segment.load(Ordering::Acquire);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_index() {
        let vector = AtomicExtentVector::new();
        for i in 0..100u64 {
            assert_eq!(vector.push_back(i), i);
        }
        for (i, value) in vector.iter().enumerate() {
            assert_eq!(value, i as u64);
        }
    }

    #[test]
    fn reserve_keeps_offsets_dense() {
        let vector = AtomicExtentVector::new();
        vector.reserve(1000);
        for i in 0..3000u64 {
            vector.push_back(i);
        }
        for i in 0..3000u64 {
            assert_eq!(vector.get(i), i);
        }
    }

    #[test]
    fn erase_tombstones() {
        let vector = AtomicExtentVector::new();
        let mut total = 0u64;
        let mut count = 0u64;
        for i in 0..10_000u64 {
            if count % 2 == 0 && i > 0 {
                total -= vector.get(count - 2);
                vector.erase(count - 2);
                count -= 1;
            }
            vector.push_back(i);
            total += i;
            count += 1;
        }
        assert_eq!(vector.iter().sum::<u64>(), total);
    }

    #[test]
    fn replace_and_compare_exchange() {
        let vector = AtomicExtentVector::new();
        let off = vector.push_back(5u64);
        assert_eq!(vector.replace(off, 7), 5);
        assert!(vector.compare_exchange(off, 7, 9));
        assert!(!vector.compare_exchange(off, 7, 11));
        assert_eq!(vector.get(off), 9);
    }
}
