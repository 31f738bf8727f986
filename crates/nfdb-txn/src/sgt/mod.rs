// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Serialization-graph testing ("no false negatives").
//!
//! Operations discover prior readers/writers of a row through the row log
//! and post typed edges into a runtime dependency graph; a transaction
//! aborts exactly when one of its edges closes a cycle through its own
//! node. Writes go in place; an abort therefore condemns every transaction
//! that consumed the doomed values (cascading abort) before restoring
//! them.

mod graph;

pub use graph::{DfsScratch, SerializationGraph};

use crate::{RowValue, TransactionSession, TxnError};
use nfdb_collections::AtomicExtentVector;
use nfdb_smr::{EpochGuard, EpochHandle, EpochManager};
use nfdb_storage::{OpKind, RowId, RowRegistry, TableId, TxnId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

struct Table<V> {
    values: AtomicExtentVector<V>,
    registry: RowRegistry,
    /// `txn << 1 | 1` while a writer mutates the row's value in place.
    locked: AtomicExtentVector<u64>,
}

impl<V: RowValue> Table<V> {
    fn new() -> Self {
        Self {
            values: AtomicExtentVector::new(),
            registry: RowRegistry::new(),
            locked: AtomicExtentVector::new(),
        }
    }
}

/// Shared state of the SGT protocol; workers open [`SgtSession`]s against
/// it.
pub struct SgtCoordinator<V> {
    tables: Vec<Table<V>>,
    graph: SerializationGraph,
    txn_counter: AtomicU64,
    epoch: EpochManager,
    insert_lock: Mutex<()>,
}

impl<V: RowValue> SgtCoordinator<V> {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            graph: SerializationGraph::new(),
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
        let lock_row = t.locked.push_back(0);
        debug_assert_eq!(row, lock_row);
        row
    }

    pub fn row_count(&self, table: TableId) -> u64 {
        self.tables[table as usize].values.len()
    }

    pub fn graph(&self) -> &SerializationGraph {
        &self.graph
    }

    pub fn session(&self) -> SgtSession<'_, V> {
        SgtSession {
            coordinator: self,
            handle: self.epoch.register(),
            txn: 0,
            node: 0,
            entries: Vec::new(),
            undo: Vec::new(),
            scratch: DfsScratch::default(),
        }
    }

    fn table(&self, table: TableId) -> &Table<V> {
        &self.tables[table as usize]
    }
}

impl<V: RowValue> Default for SgtCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker SGT transaction state, including the reusable DFS scratch
/// sets.
pub struct SgtSession<'c, V> {
    coordinator: &'c SgtCoordinator<V>,
    handle: EpochHandle<'c>,
    txn: TxnId,
    node: u32,
    entries: Vec<(TableId, RowId, u64)>,
    undo: Vec<(TableId, RowId, V)>,
    scratch: DfsScratch,
}

impl<V: RowValue> SgtSession<'_, V> {
    fn rollback(&mut self) {
        let coordinator = self.coordinator;
        let guard = self.handle.pin();
        for (table, row, prior) in self.undo.drain(..).rev() {
            let t = coordinator.table(table);
            t.locked.store(row, (self.txn << 1) | 1);
            t.values.store(row, prior);
            t.locked.store(row, 0);
        }
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        coordinator.graph.cleanup(self.node, self.txn, true, &guard);
        trace!(txn = self.txn, "sgt abort");
        self.txn = 0;
    }

    fn fail(&mut self, error: TxnError) -> TxnError {
        self.rollback();
        error
    }

    /// Posts edges for every live prior operation on the row. The writer
    /// case types prior reads as rw (anti-dependency), everything else as
    /// value-dependency.
    fn post_edges(
        graph: &SerializationGraph,
        registry: &RowRegistry,
        node: u32,
        txn: TxnId,
        row: RowId,
        prv: u64,
        my_kind: OpKind,
        scratch: &mut DfsScratch,
        guard: &EpochGuard<'_, '_>,
    ) -> Result<(), TxnError> {
        for (_, entry) in registry.predecessors(row, prv, guard) {
            if entry.txn == txn {
                continue;
            }
            let rw = match (entry.kind, my_kind) {
                // Reader sees writer: wr.
                (OpKind::Write, OpKind::Read) => false,
                // Writer sees reader: rw.
                (OpKind::Read, OpKind::Write) => true,
                // Writer sees writer: ww.
                (OpKind::Write, OpKind::Write) => false,
                (OpKind::Read, OpKind::Read) => continue,
            };
            graph.insert_and_check(node, entry.node, entry.txn, rw, scratch)?;
        }
        Ok(())
    }
}

impl<V: RowValue> TransactionSession<V> for SgtSession<'_, V> {
    fn begin(&mut self) -> Result<TxnId, TxnError> {
        assert_eq!(self.txn, 0, "one transaction per session at a time");
        let txn = self.coordinator.txn_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.node = self.coordinator.graph.create_node(txn);
        self.txn = txn;
        Ok(txn)
    }

    fn read(&mut self, table: TableId, row: RowId) -> Result<V, TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let coordinator = self.coordinator;
        if let Some(error) = coordinator.graph.needs_abort(self.node) {
            return Err(self.fail(error));
        }

        let t = coordinator.table(table);
        let guard = self.handle.pin();
        let ticket = t.registry.acquire(row, self.txn, OpKind::Read, self.node);
        let prv = ticket.prv();
        self.entries.push((table, row, prv));

        if let Err(error) = Self::post_edges(
            &coordinator.graph,
            &t.registry,
            self.node,
            self.txn,
            row,
            prv,
            OpKind::Read,
            &mut self.scratch,
            &guard,
        ) {
            drop(ticket);
            drop(guard);
            return Err(self.fail(error));
        }

        // An aborting writer may be restoring the value out of turn.
        loop {
            let lock = t.locked.get(row);
            if lock & 1 == 0 || lock >> 1 == self.txn {
                break;
            }
            std::hint::spin_loop();
        }
        let value = t.values.get(row);
        ticket.settle();
        Ok(value)
    }

    fn write(&mut self, table: TableId, row: RowId, value: V) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let coordinator = self.coordinator;
        if let Some(error) = coordinator.graph.needs_abort(self.node) {
            return Err(self.fail(error));
        }

        let t = coordinator.table(table);
        let guard = self.handle.pin();
        let ticket = t.registry.acquire(row, self.txn, OpKind::Write, self.node);
        let prv = ticket.prv();
        self.entries.push((table, row, prv));

        if let Err(error) = Self::post_edges(
            &coordinator.graph,
            &t.registry,
            self.node,
            self.txn,
            row,
            prv,
            OpKind::Write,
            &mut self.scratch,
            &guard,
        ) {
            drop(ticket);
            drop(guard);
            return Err(self.fail(error));
        }

        t.locked.store(row, (self.txn << 1) | 1);
        let prior = t.values.get(row);
        t.values.store(row, value);
        t.locked.store(row, 0);
        self.undo.push((table, row, prior));
        ticket.settle();
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TxnError> {
        assert_ne!(self.txn, 0, "no running transaction");
        let coordinator = self.coordinator;
        loop {
            // Pinned per probe so slot recycling stays deferred while the
            // DFS walks edges, without wedging reclamation for the whole
            // wait.
            let guard = self.handle.pin();
            match coordinator.graph.check_committed(self.node) {
                Err(error) => {
                    drop(guard);
                    return Err(self.fail(error));
                },
                Ok(true) => break,
                Ok(false) => {
                    // Waiting on predecessors; a cycle formed by a racing
                    // edge insertion would make the wait circular, so keep
                    // probing for one.
                    let cyclic = coordinator
                        .graph
                        .cycle_check_naive(self.node, &mut self.scratch);
                    drop(guard);
                    if cyclic {
                        return Err(self.fail(TxnError::Conflict));
                    }
                    std::hint::spin_loop();
                },
            }
        }

        self.undo.clear();
        let guard = self.handle.pin();
        for (table, row, prv) in self.entries.drain(..) {
            coordinator.table(table).registry.finish(row, prv, &guard);
        }
        coordinator.graph.cleanup(self.node, self.txn, false, &guard);
        trace!(txn = self.txn, "sgt commit");
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
