// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::TxnError;
use nfdb_collections::{AtomicExtentVector, AtomicUnorderedMap};
use nfdb_smr::{ArenaHandle, ChunkArena, EpochGuard};
use nfdb_storage::{RowId, TxnId};
use std::{
    collections::BTreeSet,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

/// Row lock word: one writer plus a reader set, replaced wholesale by CAS.
#[derive(Clone, Debug, Default)]
pub struct LockState {
    pub writer: TxnId,
    pub readers: BTreeSet<TxnId>,
}

/// Cell type of the lock column; null means unlocked and never contended.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockPtr(pub(crate) *mut LockState);

impl Default for LockPtr {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

unsafe impl Send for LockPtr {}

enum Decision {
    Wait,
    Die,
}

/// Row-granular lock table with wait-die deadlock avoidance.
///
/// Lock words are immutable once published: acquiring or releasing clones
/// the current state, edits the copy, and CAS-swings the row's pointer.
/// The displaced state is retired through the epoch so a concurrent
/// wait-die inspection never reads freed memory. Deadlock is impossible
/// because only transactions older than every current holder ever wait.
pub struct LockManager {
    start_times: AtomicUnorderedMap<TxnId, u64>,
    clock: AtomicU64,
    arena: ChunkArena<LockState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            start_times: AtomicUnorderedMap::with_hardware_capacity(16),
            clock: AtomicU64::new(1),
            arena: ChunkArena::new(),
        }
    }

    /// Registers the transaction's start timestamp; seniority for wait-die
    /// comes from a logical clock so ordering is total and tie-free.
    pub fn start(&self, txn: TxnId) -> Result<(), TxnError> {
        let ts = self.clock.fetch_add(1, Ordering::AcqRel);
        self.start_times.insert(txn, ts)?;
        Ok(())
    }

    pub fn end(&self, txn: TxnId) {
        self.start_times.erase(&txn);
    }

    /// Per-worker allocation cache for lock words; sessions own one each.
    pub fn arena_handle(&self) -> ArenaHandle<LockState> {
        self.arena.handle()
    }

    /// Older transactions wait, younger ones die. A holder missing from
    /// the start-time table has already finished; the requester re-reads
    /// the lock word instead of dying on it.
    fn wait_die(&self, txn: TxnId, holders: &[TxnId]) -> Decision {
        let my_ts = self
            .start_times
            .lookup(&txn)
            .expect("running transaction must be registered");
        for holder in holders {
            if let Some(holder_ts) = self.start_times.lookup(holder) {
                if holder_ts < my_ts {
                    return Decision::Die;
                }
            }
        }
        Decision::Wait
    }

    /// Acquires `row` for `txn`, shared or exclusive. Spins while wait-die
    /// permits waiting; returns `Conflict` when the requester must die.
    /// New lock words come from the worker's cache; displaced ones are
    /// retired through the epoch so a concurrent wait-die inspection never
    /// reads freed memory.
    pub fn lock(
        &self,
        txn: TxnId,
        exclusive: bool,
        locks: &AtomicExtentVector<LockPtr>,
        row: RowId,
        cache: &ArenaHandle<LockState>,
        guard: &EpochGuard<'_, '_>,
    ) -> Result<(), TxnError> {
        loop {
            let current = locks.get(row);
            let state = unsafe { current.0.as_ref() };

            let mut holders: Vec<TxnId> = Vec::new();
            if let Some(state) = state {
                if state.writer != 0 && state.writer != txn {
                    holders.push(state.writer);
                }
                if exclusive {
                    holders.extend(state.readers.iter().copied().filter(|&r| r != txn));
                }
            }
            if !holders.is_empty() {
                match self.wait_die(txn, &holders) {
                    Decision::Wait => {
                        std::hint::spin_loop();
                        continue;
                    },
                    Decision::Die => {
                        debug!(txn, row, exclusive, ?holders, "wait-die kill");
                        return Err(TxnError::Conflict);
                    },
                }
            }

            let mut next = state.cloned().unwrap_or_default();
            if exclusive {
                next.writer = txn;
            } else {
                next.readers.insert(txn);
            }
            let next = cache.alloc(next)?;
            if locks.compare_exchange(row, current, LockPtr(next.as_ptr())) {
                if !current.0.is_null() {
                    unsafe {
                        self.arena
                            .retire_with(guard, NonNull::new_unchecked(current.0))
                    };
                }
                return Ok(());
            }
            // Lost the swing; drop our copy and re-evaluate.
            unsafe { cache.dealloc(next) };
        }
    }

    /// Removes `txn` from the row's lock word.
    pub fn unlock(
        &self,
        txn: TxnId,
        locks: &AtomicExtentVector<LockPtr>,
        row: RowId,
        cache: &ArenaHandle<LockState>,
        guard: &EpochGuard<'_, '_>,
    ) {
        loop {
            let current = locks.get(row);
            let Some(state) = (unsafe { current.0.as_ref() }) else {
                return;
            };
            let mut next = state.clone();
            if next.writer == txn {
                next.writer = 0;
            }
            next.readers.remove(&txn);
            let next = cache.alloc(next).expect("lock arena is unbounded");
            if locks.compare_exchange(row, current, LockPtr(next.as_ptr())) {
                unsafe {
                    self.arena
                        .retire_with(guard, NonNull::new_unchecked(current.0))
                };
                return;
            }
            unsafe { cache.dealloc(next) };
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
