// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::TxnError;
use nfdb_storage::{RowId, TableId, TxnId};
use std::fmt::Debug;

/// Bounds every row payload must satisfy: cells are atomic
/// (`crossbeam::atomic::AtomicCell`) and values move by copy.
pub trait RowValue: Copy + Eq + Default + Debug + Send + Sync + 'static {}
impl<T: Copy + Eq + Default + Debug + Send + Sync + 'static> RowValue for T {}

/// The uniform transaction surface all four coordinators expose. One
/// session belongs to one worker thread and runs one transaction at a
/// time; `read`/`write`/`commit` report an abort by returning an error,
/// after which the transaction is finished and the registry is clean.
pub trait TransactionSession<V: RowValue> {
    /// Starts a transaction and returns its id.
    fn begin(&mut self) -> Result<TxnId, TxnError>;

    /// Reads the row, acquiring whatever the protocol needs. An error
    /// means the transaction aborted.
    fn read(&mut self, table: TableId, row: RowId) -> Result<V, TxnError>;

    /// Stages or applies a write per the protocol. An error means the
    /// transaction aborted.
    fn write(&mut self, table: TableId, row: RowId, value: V) -> Result<(), TxnError>;

    /// Attempts to commit. An error means the transaction aborted instead.
    fn commit(&mut self) -> Result<(), TxnError>;

    /// Aborts the running transaction. Calling this with no live
    /// transaction (including right after a failed operation) is a no-op.
    fn abort(&mut self);
}
