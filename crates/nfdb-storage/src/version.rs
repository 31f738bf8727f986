// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{RowId, TxnId};
use nfdb_collections::AtomicExtentVector;
use nfdb_smr::{ChunkArena, EpochGuard};
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};
use tracing::trace;

/// High bit of `begin`: the version is pending, `begin & !PENDING` is the
/// writer transaction.
pub const PENDING: u64 = 1 << 63;

/// `end` of the newest committed version.
pub const TS_INFINITY: u64 = u64::MAX;

/// One entry of a row's version chain, newest first.
pub struct Version<V> {
    pub data: V,
    /// Commit timestamp, or `writer | PENDING` while uncommitted.
    pub begin: AtomicU64,
    /// Commit timestamp of the next newer version, or [`TS_INFINITY`].
    pub end: AtomicU64,
    pub writer: TxnId,
    prev: AtomicPtr<Version<V>>,
}

unsafe impl<V: Send> Send for Version<V> {}

struct VersionPtr<V>(*mut Version<V>);

// Manual impls: the pointer is Copy/Eq regardless of `V`.
impl<V> Clone for VersionPtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for VersionPtr<V> {}

impl<V> PartialEq for VersionPtr<V> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<V> Eq for VersionPtr<V> {}

impl<V> Default for VersionPtr<V> {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

unsafe impl<V: Send> Send for VersionPtr<V> {}

/// Version-chain column for the multi-version protocol.
///
/// Only the head of a chain may be pending, and at most one committer
/// installs per row at a time (the row's install lock in the lock column
/// guarantees it). `end` timestamps are non-increasing head to tail and
/// each equals the next newer version's `begin`; a snapshot reader can
/// therefore stop at the first committed version whose `begin` is within
/// its snapshot.
pub struct VersionChain<V> {
    heads: AtomicExtentVector<VersionPtr<V>>,
    arena: ChunkArena<Version<V>>,
}

impl<V: Copy + Send + 'static> VersionChain<V> {
    pub fn new() -> Self {
        Self {
            heads: AtomicExtentVector::new(),
            arena: ChunkArena::new(),
        }
    }

    pub fn reserve(&self, rows: usize) {
        self.heads.reserve(rows);
    }

    pub fn add_row(&self) -> RowId {
        self.heads.push_back(VersionPtr::default())
    }

    /// Installs a pending head for `txn`. The caller holds the row's
    /// install lock and the row's ticket.
    pub fn install_pending(&self, row: RowId, txn: TxnId, data: V) -> NonNull<Version<V>> {
        let head = self.heads.get(row).0;
        let version = self
            .arena
            .alloc(Version {
                data,
                begin: AtomicU64::new(txn | PENDING),
                end: AtomicU64::new(TS_INFINITY),
                writer: txn,
                prev: AtomicPtr::new(head),
            })
            .expect("version arena is unbounded");
        self.heads.store(row, VersionPtr(version.as_ptr()));
        version
    }

    /// The version of `row` visible to `txn` reading at `start_ts`:
    /// the transaction's own pending write, or the newest version committed
    /// at or before the snapshot. `None` means the base value (pre-history)
    /// applies.
    pub fn visible(
        &self,
        row: RowId,
        txn: TxnId,
        start_ts: u64,
        _guard: &EpochGuard<'_, '_>,
    ) -> Option<V> {
        let mut cur = self.heads.get(row).0;
        while !cur.is_null() {
            let version = unsafe { &*cur };
            let begin = version.begin.load(Ordering::Acquire);
            if begin & PENDING != 0 {
                if version.writer == txn {
                    return Some(version.data);
                }
            } else if begin <= start_ts {
                return Some(version.data);
            }
            cur = version.prev.load(Ordering::Acquire);
        }
        None
    }

    /// Commits a pending head: stamps it with `commit_ts` and closes the
    /// previous head. Caller holds the install lock.
    pub fn finalize(&self, version: NonNull<Version<V>>, commit_ts: u64) {
        let version = unsafe { version.as_ref() };
        debug_assert_ne!(version.begin.load(Ordering::Acquire) & PENDING, 0);
        let prev = version.prev.load(Ordering::Acquire);
        if !prev.is_null() {
            unsafe { &*prev }.end.store(commit_ts, Ordering::Release);
        }
        version.begin.store(commit_ts, Ordering::Release);
    }

    /// Unlinks an uncommitted head on abort and retires it. Caller holds
    /// the install lock.
    pub fn unlink_pending(
        &self,
        row: RowId,
        version: NonNull<Version<V>>,
        guard: &EpochGuard<'_, '_>,
    ) {
        debug_assert_eq!(self.heads.get(row).0, version.as_ptr());
        let prev = unsafe { version.as_ref() }.prev.load(Ordering::Acquire);
        self.heads.store(row, VersionPtr(prev));
        let arena = self.arena.clone();
        let version = SendPtr(version.as_ptr());
        guard.retire(move || unsafe {
            let version = version;
            arena.dealloc(NonNull::new_unchecked(version.0))
        });
    }

    /// Cuts the chain below the oldest snapshot any live transaction can
    /// still read and retires the tail. Caller holds the install lock.
    pub fn consolidate(&self, row: RowId, oldest_active: u64, guard: &EpochGuard<'_, '_>) {
        let mut cur = self.heads.get(row).0;
        // Find the newest version every live snapshot resolves to; its
        // predecessors are unreachable.
        while !cur.is_null() {
            let version = unsafe { &*cur };
            let begin = version.begin.load(Ordering::Acquire);
            if begin & PENDING == 0 && begin <= oldest_active {
                let tail = version.prev.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !tail.is_null() {
                    trace!(row, oldest_active, "consolidating version chain tail");
                    self.retire_chain(tail, guard);
                }
                return;
            }
            cur = version.prev.load(Ordering::Acquire);
        }
    }

    /// Retires the whole sub-chain hanging off `from`.
    fn retire_chain(&self, from: *mut Version<V>, guard: &EpochGuard<'_, '_>) {
        let arena = self.arena.clone();
        let from = SendPtr(from);
        guard.retire(move || {
            let from = from;
            let mut cur = from.0;
            while !cur.is_null() {
                let next = unsafe { &*cur }.prev.load(Ordering::Acquire);
                unsafe { arena.dealloc(NonNull::new_unchecked(cur)) };
                cur = next;
            }
        });
    }
}

impl<V: Copy + Send + 'static> Default for VersionChain<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for VersionChain<V> {
    fn drop(&mut self) {
        for head in self.heads.iter() {
            let mut cur = head.0;
            while !cur.is_null() {
                let next = unsafe { &*cur }.prev.load(Ordering::Acquire);
                unsafe { self.arena.dealloc(NonNull::new_unchecked(cur)) };
                cur = next;
            }
        }
    }
}

struct SendPtr<T>(*mut T);
unsafe impl<T: Send> Send for SendPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};
    use nfdb_smr::EpochManager;

    #[test]
    fn pending_visible_only_to_writer() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let guard = handle.pin();

        let chain: VersionChain<u64> = VersionChain::new();
        let row = chain.add_row();
        let pending = chain.install_pending(row, 7, 700);

        assert_some_eq!(chain.visible(row, 7, 10, &guard), 700);
        assert_none!(chain.visible(row, 8, 10, &guard));

        chain.finalize(pending, 5);
        assert_some_eq!(chain.visible(row, 8, 10, &guard), 700);
        assert_none!(chain.visible(row, 8, 4, &guard), "older snapshot misses it");
    }

    #[test]
    fn snapshot_picks_newest_within_window() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let guard = handle.pin();

        let chain: VersionChain<u64> = VersionChain::new();
        let row = chain.add_row();
        for (txn, ts, value) in [(1, 10, 100), (2, 20, 200), (3, 30, 300)] {
            let pending = chain.install_pending(row, txn, value);
            chain.finalize(pending, ts);
        }

        assert_none!(chain.visible(row, 9, 5, &guard));
        assert_some_eq!(chain.visible(row, 9, 10, &guard), 100);
        assert_some_eq!(chain.visible(row, 9, 25, &guard), 200);
        assert_some_eq!(chain.visible(row, 9, 35, &guard), 300);
    }

    #[test]
    fn abort_unlinks_pending_head() {
        let manager = EpochManager::new(2);
        let handle = manager.register();

        let chain: VersionChain<u64> = VersionChain::new();
        let row = chain.add_row();
        let committed = chain.install_pending(row, 1, 100);
        chain.finalize(committed, 10);

        let guard = handle.pin();
        let pending = chain.install_pending(row, 2, 200);
        chain.unlink_pending(row, pending, &guard);
        assert_some_eq!(chain.visible(row, 3, 20, &guard), 100);
    }

    #[test]
    fn consolidate_trims_dead_tail() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let guard = handle.pin();

        let chain: VersionChain<u64> = VersionChain::new();
        let row = chain.add_row();
        for (txn, ts, value) in [(1, 10, 100), (2, 20, 200), (3, 30, 300)] {
            let pending = chain.install_pending(row, txn, value);
            chain.finalize(pending, ts);
        }

        // Oldest live snapshot is 25: the ts=20 version must survive,
        // ts=10 may go.
        chain.consolidate(row, 25, &guard);
        assert_some_eq!(chain.visible(row, 9, 25, &guard), 200);
        assert_some_eq!(chain.visible(row, 9, 35, &guard), 300);
        assert_none!(chain.visible(row, 9, 15, &guard), "trimmed below the watermark");
    }
}
