// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Multi-version optimistic concurrency control.
//!
//! Reads run against the snapshot fixed at begin; writes install pending
//! version heads guarded by a per-row install lock (first writer wins).
//! Commit draws a timestamp, certifies the read set against every writer
//! that committed inside the snapshot window, then stamps the pending
//! versions. Aborts unlink the pending heads and leave no trace.

mod validator;

pub use validator::Validator;

use crate::{RowValue, TransactionSession, TxnError};
use nfdb_collections::{AtomicExtentVector, AtomicUnorderedMap};
use nfdb_smr::{EpochHandle, EpochManager};
use nfdb_storage::{
    OpKind, RowId, RowRegistry, TableId, TxnId, Version, VersionChain, NO_GRAPH_NODE,
};
use parking_lot::Mutex;
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::trace;

/// Commits between opportunistic garbage-collection passes.
const PRUNE_INTERVAL: u64 = 64;

struct Table<V> {
    values: AtomicExtentVector<V>,
    registry: RowRegistry,
    /// Install lock: transaction id of the writer building a new head.
    locked: AtomicExtentVector<u64>,
    versions: VersionChain<V>,
}

impl<V: RowValue> Table<V> {
    fn new() -> Self {
        Self {
            values: AtomicExtentVector::new(),
            registry: RowRegistry::new(),
            locked: AtomicExtentVector::new(),
            versions: VersionChain::new(),
        }
    }
}

/// Shared state of the MVOCC protocol; workers open [`MvoccSession`]s
/// against it.
pub struct MvoccCoordinator<V> {
    tables: Vec<Table<V>>,
    txn_counter: AtomicU64,
    commit_clock: AtomicU64,
    active: AtomicUnorderedMap<TxnId, u64>,
    validator: Validator,
    commits: AtomicU64,
    epoch: EpochManager,
    insert_lock: Mutex<()>,
}

impl<V: RowValue> MvoccCoordinator<V> {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            txn_counter: AtomicU64::new(0),
            commit_clock: AtomicU64::new(1),
            active: AtomicUnorderedMap::with_hardware_capacity(16),
            validator: Validator::new(),
            commits: AtomicU64::new(0),
            epoch: EpochManager::with_default_capacity(),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn register_table(&mut self) -> TableId {
        self.tables.push(Table::new());
        (self.tables.len() - 1) as TableId
    }

    /// Appends a row with `value` as its base (pre-history) payload.
    pub fn insert(&self, table: TableId, value: V) -> RowId {
        let _guard = self.insert_lock.lock();
        let t = &self.tables[table as usize];
        let row = t.values.push_back(value);
        t.registry.add_row();
        t.locked.push_back(0);
        let chain_row = t.versions.add_row();
        debug_assert_eq!(row, chain_row);
        row
    }

    pub fn row_count(&self, table: TableId) -> u64 {
        self.tables[table as usize].values.len()
    }

    pub fn session(&self) -> MvoccSession<'_, V> {
        MvoccSession {
            coordinator: self,
            handle: self.epoch.register(),
            txn: 0,
            start_ts: 0,
            entries: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn table(&self, table: TableId) -> &Table<V> {
        &self.tables[table as usize]
    }

    /// Oldest snapshot a live transaction can still read; racy but only
    /// used to bound garbage collection from below.
    fn oldest_active(&self) -> u64 {
        self.active
            .iter()
            .map(|(_, start_ts)| start_ts)
            .min()
            .unwrap_or_else(|| self.commit_clock.load(Ordering::Acquire))
    }
}

impl<V: RowValue> Default for MvoccCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingWrite<V> {
    table: TableId,
    row: RowId,
    version: NonNull<Version<V>>,
}

/// Per-worker MVOCC transaction state: snapshot timestamp, read set and
/// the pending version heads to stamp or unlink.
pub struct MvoccSession<'c, V> {
    coordinator: &'c MvoccCoordinator<V>,
    handle: EpochHandle<'c>,
    txn: TxnId,
    start_ts: u64,
    entries: Vec<(TableId, RowId, u64)>,
    reads: Vec<(TableId, RowId)>,
    writes: Vec<PendingWrite<V>>,
}

impl<V: RowValue> MvoccSession<'_, V> {
    /// Snapshot read of a dense row range, without tickets or read-set
    /// bookkeeping: the OLAP path for read-only transactions. A range
    /// reaching outside the table aborts with a typed conflict, silently.
    pub fn scan(
        &mut self,
        table: TableId,
        row_lo: RowId,
        row_hi: RowId,
        mut sink: impl FnMut(RowId, V),
    ) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        debug_assert!(
            self.writes.is_empty(),
            "scans are for read-only transactions"
        );
        let guard = self.handle.pin();
        let t = self.coordinator.table(table);
        if row_hi >= t.values.len() || row_lo > row_hi {
            drop(guard);
            return Err(self.fail(TxnError::Conflict));
        }
        for row in row_lo..=row_hi {
            let value = t
                .versions
                .visible(row, self.txn, self.start_ts, &guard)
                .unwrap_or_else(|| t.values.get(row));
            sink(row, value);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let coordinator = self.coordinator;
        let guard = self.handle.pin();
        for write in self.writes.drain(..).rev() {
            let t = coordinator.table(write.table);
            t.versions.unlink_pending(write.row, write.version, &guard);
            t.locked.store(write.row, 0);
        }
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        coordinator.active.erase(&self.txn);
        trace!(txn = self.txn, "mvocc abort");
        self.reads.clear();
        self.txn = 0;
    }

    fn fail(&mut self, error: TxnError) -> TxnError {
        self.rollback();
        error
    }
}

impl<V: RowValue> TransactionSession<V> for MvoccSession<'_, V> {
    fn begin(&mut self) -> Result<TxnId, TxnError> {
        assert_eq!(self.txn, 0, "one transaction per session at a time");
        let txn = self.coordinator.txn_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let start_ts = self.coordinator.commit_clock.load(Ordering::Acquire);
        self.coordinator.active.insert(txn, start_ts)?;
        self.txn = txn;
        self.start_ts = start_ts;
        Ok(txn)
    }

    fn read(&mut self, table: TableId, row: RowId) -> Result<V, TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);
        let guard = self.handle.pin();

        let ticket = t.registry.acquire(row, self.txn, OpKind::Read, NO_GRAPH_NODE);
        let value = t
            .versions
            .visible(row, self.txn, self.start_ts, &guard)
            .unwrap_or_else(|| t.values.get(row));
        self.entries.push((table, row, ticket.prv()));
        self.reads.push((table, row));
        ticket.settle();
        Ok(value)
    }

    fn write(&mut self, table: TableId, row: RowId, value: V) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);
        let guard = self.handle.pin();

        let ticket = t.registry.acquire(row, self.txn, OpKind::Write, NO_GRAPH_NODE);
        self.entries.push((table, row, ticket.prv()));

        let holder = t.locked.get(row);
        if holder == self.txn {
            // Second write to the same row: replace our pending head.
            let pending = self
                .writes
                .iter_mut()
                .rev()
                .find(|w| w.table == table && w.row == row)
                .expect("install lock holder must have a pending write");
            t.versions.unlink_pending(row, pending.version, &guard);
            pending.version = t.versions.install_pending(row, self.txn, value);
            ticket.settle();
            return Ok(());
        }
        if !t.locked.compare_exchange(row, 0, self.txn) {
            // A foreign pending head: first writer wins.
            drop(ticket);
            drop(guard);
            return Err(self.fail(TxnError::Conflict));
        }
        let version = t.versions.install_pending(row, self.txn, value);
        self.writes.push(PendingWrite { table, row, version });
        ticket.settle();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let coordinator = self.coordinator;

        let write_rows: Vec<(TableId, RowId)> =
            self.writes.iter().map(|w| (w.table, w.row)).collect();
        let Some(commit_ts) = coordinator.validator.certify(
            &self.reads,
            &write_rows,
            self.start_ts,
            &coordinator.commit_clock,
        ) else {
            return Err(self.fail(TxnError::Conflict));
        };

        coordinator.active.erase(&self.txn);
        let oldest = coordinator.oldest_active();
        let guard = self.handle.pin();
        for write in self.writes.drain(..) {
            let t = coordinator.table(write.table);
            t.versions.finalize(write.version, commit_ts);
            t.versions.consolidate(write.row, oldest, &guard);
            t.locked.store(write.row, 0);
        }
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        self.reads.clear();

        let commits = coordinator.commits.fetch_add(1, Ordering::AcqRel) + 1;
        if commits % PRUNE_INTERVAL == 0 {
            coordinator.validator.prune(oldest);
        }
        trace!(txn = self.txn, commit_ts, "mvocc commit");
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
