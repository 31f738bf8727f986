// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{RowId, TxnId};
use nfdb_collections::{AtomicExtentVector, AtomicSinglyLinkedList};
use nfdb_smr::{ChunkArena, EpochGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Graph-node marker for protocols that do not run the serialization
/// graph.
pub const NO_GRAPH_NODE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// One row-log record, keyed in the log list by its PRV.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub txn: TxnId,
    /// Serialization-graph node of the owner, or [`NO_GRAPH_NODE`].
    pub node: u32,
    pub kind: OpKind,
}

type Log = AtomicSinglyLinkedList<LogEntry>;
type LogNodeArena = ChunkArena<nfdb_collections::ListNode<LogEntry>>;

struct RowLog {
    entries: Log,
    /// Next ticket admitted into the row's registry critical section.
    served: AtomicU64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct RowLogPtr(*mut RowLog);

impl Default for RowLogPtr {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

unsafe impl Send for RowLogPtr {}

/// Ticket dispenser plus read/write log for every row of a table.
///
/// Every protocol operation on row `r` follows the same discipline:
///
/// 1. draw a PRV with a fetch-add on the row's ticket counter,
/// 2. append `{prv, txn, kind}` to the row's log,
/// 3. wait until every smaller ticket has retired its critical section,
/// 4. perform the read / stage the write and post edges upstream,
/// 5. release the ticket ([`LogTicket::settle`]), admitting the next one,
/// 6. erase the log entry when the transaction finishes
///    ([`RowRegistry::finish`]).
///
/// Step 3 is a per-row serving counter rather than a scan for in-flight
/// entries: a scan cannot tell "smaller ticket still appending" from
/// "smaller ticket long gone", the counter can. PRVs are therefore dense
/// and strictly monotonic per row, and a ticket holder observes every log
/// entry of every smaller live ticket.
pub struct RowRegistry {
    lsn: AtomicExtentVector<u64>,
    logs: AtomicExtentVector<RowLogPtr>,
    arena: LogNodeArena,
}

impl RowRegistry {
    pub fn new() -> Self {
        Self {
            lsn: AtomicExtentVector::new(),
            logs: AtomicExtentVector::new(),
            arena: Log::new_arena(),
        }
    }

    pub fn reserve(&self, rows: usize) {
        self.lsn.reserve(rows);
        self.logs.reserve(rows);
    }

    /// Registers storage for one more row; offsets are assigned densely.
    pub fn add_row(&self) -> RowId {
        let log = Box::into_raw(Box::new(RowLog {
            entries: Log::new_in(&self.arena),
            served: AtomicU64::new(0),
        }));
        let row = self.lsn.push_back(0);
        let log_row = self.logs.push_back(RowLogPtr(log));
        debug_assert_eq!(row, log_row);
        row
    }

    pub fn row_count(&self) -> u64 {
        self.lsn.len()
    }

    fn log(&self, row: RowId) -> &RowLog {
        let ptr = self.logs.get(row).0;
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    /// Steps 1–3: draws the row's next PRV, publishes the log entry, and
    /// spins until every smaller ticket has settled.
    pub fn acquire(&self, row: RowId, txn: TxnId, kind: OpKind, node: u32) -> LogTicket<'_> {
        let prv = self.lsn.fetch_add(row, 1);
        let log = self.log(row);
        log.entries.insert(prv, LogEntry { txn, node, kind });
        while log.served.load(Ordering::Acquire) != prv {
            std::hint::spin_loop();
        }
        LogTicket {
            registry: self,
            row,
            prv,
            settled: false,
        }
    }

    /// Log records of every operation that drew a smaller ticket on this
    /// row and has not finished its transaction, oldest ticket last.
    /// Call only while holding the row's ticket.
    pub fn predecessors(
        &self,
        row: RowId,
        prv: u64,
        guard: &EpochGuard<'_, '_>,
    ) -> Vec<(u64, LogEntry)> {
        self.log(row)
            .entries
            .iter(guard)
            .filter(|(entry_prv, _)| *entry_prv < prv)
            .collect()
    }

    /// Step 6: retires the transaction's log entry once it commits or
    /// aborts, so later drains never wait on a dead transaction.
    pub fn finish(&self, row: RowId, prv: u64, guard: &EpochGuard<'_, '_>) {
        self.log(row).entries.erase(prv, guard);
    }

    fn settle(&self, row: RowId, prv: u64) {
        self.log(row).served.store(prv + 1, Ordering::Release);
    }
}

impl Default for RowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RowRegistry {
    fn drop(&mut self) {
        for ptr in self.logs.iter() {
            if !ptr.0.is_null() {
                drop(unsafe { Box::from_raw(ptr.0) });
            }
        }
    }
}

/// A held position in a row's ticket order. The holder owns the row's
/// registry critical section until it settles; dropping without an explicit
/// [`settle`](Self::settle) publishes the skip so a failed operation never
/// wedges the row.
#[must_use]
pub struct LogTicket<'r> {
    registry: &'r RowRegistry,
    row: RowId,
    prv: u64,
    settled: bool,
}

impl LogTicket<'_> {
    pub fn prv(&self) -> u64 {
        self.prv
    }

    pub fn row(&self) -> RowId {
        self.row
    }

    /// Step 5: releases the row to the next ticket.
    pub fn settle(mut self) {
        self.registry.settle(self.row, self.prv);
        self.settled = true;
    }
}

impl Drop for LogTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.settle(self.row, self.prv);
        }
    }
}
