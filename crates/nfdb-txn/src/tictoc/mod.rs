// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! TicToc: optimistic concurrency control on per-row `(wts, rts)`
//! timestamps.
//!
//! Reads record the row's timestamp word next to the value; writes are
//! buffered. Commit locks the write rows in a deadlock-free sorted order,
//! derives the commit timestamp, then re-validates every read. A read of
//! untouched data is revalidated by extending the row's read timestamp in
//! place, not by re-reading it.

mod validator;

pub use validator::TsWord;

use crate::{RowValue, TransactionSession, TxnError};
use nfdb_collections::AtomicExtentVector;
use nfdb_smr::{EpochHandle, EpochManager};
use nfdb_storage::{OpKind, RowId, RowRegistry, TableId, TxnId, NO_GRAPH_NODE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use validator::{extended, ReadStamp};

struct Table<V> {
    values: AtomicExtentVector<V>,
    registry: RowRegistry,
    ts: AtomicExtentVector<u64>,
    /// Timestamp word displaced by the most recent install; consulted by
    /// the narrow-window check during validation.
    prev_ts: AtomicExtentVector<u64>,
}

impl<V: RowValue> Table<V> {
    fn new() -> Self {
        Self {
            values: AtomicExtentVector::new(),
            registry: RowRegistry::new(),
            ts: AtomicExtentVector::new(),
            prev_ts: AtomicExtentVector::new(),
        }
    }
}

/// Shared state of the TicToc protocol; workers open [`TictocSession`]s
/// against it.
pub struct TictocCoordinator<V> {
    tables: Vec<Table<V>>,
    txn_counter: AtomicU64,
    epoch: EpochManager,
    insert_lock: Mutex<()>,
}

impl<V: RowValue> TictocCoordinator<V> {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            txn_counter: AtomicU64::new(0),
            epoch: EpochManager::with_default_capacity(),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn register_table(&mut self) -> TableId {
        self.tables.push(Table::new());
        (self.tables.len() - 1) as TableId
    }

    pub fn insert(&self, table: TableId, value: V) -> RowId {
        let _guard = self.insert_lock.lock();
        let t = &self.tables[table as usize];
        let row = t.values.push_back(value);
        t.registry.add_row();
        t.ts.push_back(TsWord::compose(0, 0, false).raw());
        let prev_row = t.prev_ts.push_back(TsWord::compose(0, 0, false).raw());
        debug_assert_eq!(row, prev_row);
        row
    }

    pub fn row_count(&self, table: TableId) -> u64 {
        self.tables[table as usize].values.len()
    }

    /// Current timestamp word of a row; introspection for tests and
    /// benchmark reporting.
    pub fn row_timestamp(&self, table: TableId, row: RowId) -> TsWord {
        TsWord::from_raw(self.tables[table as usize].ts.get(row))
    }

    pub fn session(&self) -> TictocSession<'_, V> {
        TictocSession {
            coordinator: self,
            handle: self.epoch.register(),
            txn: 0,
            entries: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn table(&self, table: TableId) -> &Table<V> {
        &self.tables[table as usize]
    }
}

impl<V: RowValue> Default for TictocCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

struct BufferedWrite<V> {
    table: TableId,
    row: RowId,
    value: V,
}

/// Per-worker TicToc transaction state: read stamps, buffered writes and
/// the row-log entries to prune at finish.
pub struct TictocSession<'c, V> {
    coordinator: &'c TictocCoordinator<V>,
    handle: EpochHandle<'c>,
    txn: TxnId,
    entries: Vec<(TableId, RowId, u64)>,
    reads: Vec<ReadStamp>,
    writes: Vec<BufferedWrite<V>>,
}

impl<V: RowValue> TictocSession<'_, V> {
    fn finish(&mut self) {
        let coordinator = self.coordinator;
        let guard = self.handle.pin();
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        self.reads.clear();
        self.writes.clear();
        self.txn = 0;
    }

    fn fail(&mut self, error: TxnError) -> TxnError {
        trace!(txn = self.txn, "tictoc abort");
        self.finish();
        error
    }

    /// Releases commit-time row locks in reverse acquisition order.
    fn unlock_rows(&self, rows: &[(TableId, RowId)]) {
        for &(table, row) in rows.iter().rev() {
            let t = self.coordinator.table(table);
            let word = TsWord::from_raw(t.ts.get(row));
            debug_assert!(word.is_locked());
            t.ts.store(row, word.unlocked().raw());
        }
    }
}

impl<V: RowValue> TransactionSession<V> for TictocSession<'_, V> {
    fn begin(&mut self) -> Result<TxnId, TxnError> {
        assert_eq!(self.txn, 0, "one transaction per session at a time");
        self.txn = self.coordinator.txn_counter.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(self.txn)
    }

    fn read(&mut self, table: TableId, row: RowId) -> Result<V, TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);

        // Own buffered writes are read back directly.
        if let Some(write) = self
            .writes
            .iter()
            .rev()
            .find(|w| w.table == table && w.row == row)
        {
            return Ok(write.value);
        }

        let ticket = t.registry.acquire(row, self.txn, OpKind::Read, NO_GRAPH_NODE);
        self.entries.push((table, row, ticket.prv()));
        let (value, stamp) = loop {
            let v1 = TsWord::from_raw(t.ts.get(row));
            if v1.is_locked() {
                std::hint::spin_loop();
                continue;
            }
            let value = t.values.get(row);
            let v2 = TsWord::from_raw(t.ts.get(row));
            if v1 == v2 {
                break (value, v1);
            }
        };
        self.reads.push(ReadStamp {
            table,
            row,
            tts: stamp,
        });
        ticket.settle();
        Ok(value)
    }

    fn write(&mut self, table: TableId, row: RowId, value: V) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let t = self.coordinator.table(table);

        let ticket = t.registry.acquire(row, self.txn, OpKind::Write, NO_GRAPH_NODE);
        self.entries.push((table, row, ticket.prv()));
        ticket.settle();

        if let Some(write) = self
            .writes
            .iter_mut()
            .find(|w| w.table == table && w.row == row)
        {
            write.value = value;
        } else {
            self.writes.push(BufferedWrite { table, row, value });
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");

        // 1. Lock the write rows in sorted order; sorted acquisition makes
        // the lock phase deadlock-free.
        let mut lock_rows: Vec<(TableId, RowId)> =
            self.writes.iter().map(|w| (w.table, w.row)).collect();
        lock_rows.sort_unstable();
        lock_rows.dedup();
        for &(table, row) in &lock_rows {
            let t = self.coordinator.table(table);
            loop {
                let word = TsWord::from_raw(t.ts.get(row));
                if word.is_locked() {
                    std::hint::spin_loop();
                    continue;
                }
                if t.ts.compare_exchange(row, word.raw(), word.locked().raw()) {
                    break;
                }
            }
        }

        // 2. The commit timestamp covers every locked row's read horizon
        // and every read's write timestamp.
        let mut commit_ts = 0;
        for &(table, row) in &lock_rows {
            let word = TsWord::from_raw(self.coordinator.table(table).ts.get(row));
            commit_ts = commit_ts.max(word.rts() + 1);
        }
        for read in &self.reads {
            commit_ts = commit_ts.max(read.tts.wts());
        }

        // 3. Re-validate reads whose recorded horizon ends before
        // commit_ts, extending deltas in place where the data is
        // untouched.
        for read in &self.reads {
            if read.tts.rts() >= commit_ts {
                continue;
            }
            let t = self.coordinator.table(read.table);
            let in_write_set = lock_rows.binary_search(&(read.table, read.row)).is_ok();
            loop {
                let v1 = TsWord::from_raw(t.ts.get(read.row));
                let v1_prev = TsWord::from_raw(t.prev_ts.get(read.row));
                let version_changed = v1.wts() != read.tts.wts()
                    && !(read.tts.wts() == v1_prev.wts()
                        && commit_ts < v1_prev.wts()
                        && commit_ts >= read.tts.wts());
                if version_changed
                    || (v1.rts() <= commit_ts && v1.is_locked() && !in_write_set)
                {
                    self.unlock_rows(&lock_rows);
                    return Err(self.fail(TxnError::Conflict));
                }
                if v1.rts() <= commit_ts {
                    let v2 = extended(v1, commit_ts);
                    if t.ts.compare_exchange(read.row, v1.raw(), v2.raw()) {
                        break;
                    }
                    continue;
                }
                break;
            }
        }

        // 4. Install: publish value and fresh `(wts = commit_ts, delta =
        // 0)` word; the store doubles as the unlock.
        for write in self.writes.drain(..) {
            let t = self.coordinator.table(write.table);
            let old = TsWord::from_raw(t.ts.get(write.row));
            debug_assert!(old.is_locked());
            t.values.store(write.row, write.value);
            t.prev_ts.store(write.row, old.unlocked().raw());
            t.ts.store(write.row, TsWord::compose(commit_ts, 0, false).raw());
        }

        trace!(txn = self.txn, commit_ts, "tictoc commit");
        self.finish();
        Ok(())
    }

    fn abort(&mut self) {
        if self.txn == 0 {
            return;
        }
        trace!(txn = self.txn, "tictoc abort");
        self.finish();
    }
}
