// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Strict two-phase locking, row-granular, with wait-die.
//!
//! Reads take shared row locks, writes exclusive ones; everything is held
//! until the transaction finishes and released in reverse acquisition
//! order. Writes go in place with the displaced value kept for undo.

mod lock_manager;

pub use lock_manager::{LockManager, LockState};

use crate::{RowValue, TransactionSession, TxnError};
use lock_manager::LockPtr;
use nfdb_collections::AtomicExtentVector;
use nfdb_smr::{ArenaHandle, EpochHandle, EpochManager};
use nfdb_storage::{OpKind, RowId, RowRegistry, TableId, TxnId, NO_GRAPH_NODE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

struct Table<V> {
    values: AtomicExtentVector<V>,
    registry: RowRegistry,
    locks: AtomicExtentVector<LockPtr>,
}

impl<V: RowValue> Table<V> {
    fn new() -> Self {
        Self {
            values: AtomicExtentVector::new(),
            registry: RowRegistry::new(),
            locks: AtomicExtentVector::new(),
        }
    }
}

/// Shared state of the 2PL protocol; workers open [`TwoplSession`]s
/// against it.
pub struct TwoplCoordinator<V> {
    tables: Vec<Table<V>>,
    lock_manager: LockManager,
    txn_counter: AtomicU64,
    epoch: EpochManager,
    insert_lock: Mutex<()>,
}

impl<V: RowValue> TwoplCoordinator<V> {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            lock_manager: LockManager::new(),
            txn_counter: AtomicU64::new(0),
            epoch: EpochManager::with_default_capacity(),
            insert_lock: Mutex::new(()),
        }
    }

    /// Adds a table before the coordinator is shared with workers.
    pub fn register_table(&mut self) -> TableId {
        self.tables.push(Table::new());
        (self.tables.len() - 1) as TableId
    }

    /// Appends a row outside any transaction (loader path). Parallel
    /// columns stay aligned under the insert lock.
    pub fn insert(&self, table: TableId, value: V) -> RowId {
        let _guard = self.insert_lock.lock();
        let t = &self.tables[table as usize];
        let row = t.values.push_back(value);
        t.registry.add_row();
        let lock_row = t.locks.push_back(LockPtr::default());
        debug_assert_eq!(row, lock_row);
        row
    }

    pub fn row_count(&self, table: TableId) -> u64 {
        self.tables[table as usize].values.len()
    }

    pub fn session(&self) -> TwoplSession<'_, V> {
        TwoplSession {
            coordinator: self,
            handle: self.epoch.register(),
            lock_cache: self.lock_manager.arena_handle(),
            txn: 0,
            entries: Vec::new(),
            locks: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn table(&self, table: TableId) -> &Table<V> {
        &self.tables[table as usize]
    }
}

impl<V: RowValue> Default for TwoplCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker 2PL transaction state: the undo values, the row-log entries
/// to prune and the locks to hand back, in acquisition order.
pub struct TwoplSession<'c, V> {
    coordinator: &'c TwoplCoordinator<V>,
    handle: EpochHandle<'c>,
    lock_cache: ArenaHandle<LockState>,
    txn: TxnId,
    entries: Vec<(TableId, RowId, u64)>,
    locks: Vec<(TableId, RowId)>,
    undo: Vec<(TableId, RowId, V)>,
}

impl<V: RowValue> TwoplSession<'_, V> {
    fn rollback(&mut self) {
        let coordinator = self.coordinator;
        let guard = self.handle.pin();
        // Exclusive locks are still held, so in-place undo cannot race a
        // reader.
        for (table, row, prior) in self.undo.drain(..).rev() {
            coordinator.table(table).values.store(row, prior);
        }
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        for (table, row) in self.locks.drain(..).rev() {
            let t = coordinator.table(table);
            coordinator
                .lock_manager
                .unlock(self.txn, &t.locks, row, &self.lock_cache, &guard);
        }
        trace!(txn = self.txn, "2pl abort");
        coordinator.lock_manager.end(self.txn);
        self.txn = 0;
    }

    fn fail(&mut self, error: TxnError) -> TxnError {
        self.rollback();
        error
    }
}

impl<V: RowValue> TransactionSession<V> for TwoplSession<'_, V> {
    fn begin(&mut self) -> Result<TxnId, TxnError> {
        assert_eq!(self.txn, 0, "one transaction per session at a time");
        let txn = self.coordinator.txn_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.coordinator.lock_manager.start(txn)?;
        self.txn = txn;
        Ok(txn)
    }

    fn read(&mut self, table: TableId, row: RowId) -> Result<V, TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);
        let lock_manager = &self.coordinator.lock_manager;

        let guard = self.handle.pin();
        if let Err(e) = lock_manager.lock(self.txn, false, &t.locks, row, &self.lock_cache, &guard)
        {
            drop(guard);
            return Err(self.fail(e));
        }
        self.locks.push((table, row));

        let ticket = t.registry.acquire(row, self.txn, OpKind::Read, NO_GRAPH_NODE);
        let value = t.values.get(row);
        self.entries.push((table, row, ticket.prv()));
        ticket.settle();
        Ok(value)
    }

    fn write(&mut self, table: TableId, row: RowId, value: V) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);
        let lock_manager = &self.coordinator.lock_manager;

        let guard = self.handle.pin();
        if let Err(e) = lock_manager.lock(self.txn, true, &t.locks, row, &self.lock_cache, &guard)
        {
            drop(guard);
            return Err(self.fail(e));
        }
        self.locks.push((table, row));

        let ticket = t.registry.acquire(row, self.txn, OpKind::Write, NO_GRAPH_NODE);
        let prior = t.values.get(row);
        t.values.store(row, value);
        self.undo.push((table, row, prior));
        self.entries.push((table, row, ticket.prv()));
        ticket.settle();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let coordinator = self.coordinator;
        let guard = self.handle.pin();
        self.undo.clear();
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        for (table, row) in self.locks.drain(..).rev() {
            let t = coordinator.table(table);
            coordinator
                .lock_manager
                .unlock(self.txn, &t.locks, row, &self.lock_cache, &guard);
        }
        coordinator.lock_manager.end(self.txn);
        trace!(txn = self.txn, "2pl commit");
        self.txn = 0;
        Ok(())
    }

    fn abort(&mut self) {
        if self.txn == 0 {
            return;
        }
        self.rollback();
    }
}
