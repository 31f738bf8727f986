// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The per-row machinery shared by every concurrency-control protocol: a
//! ticket ("pre-read version") dispenser per row, the read/write log that
//! lets concurrent transactions discover each other's operations on a row,
//! and the version chains used by the multi-version protocol.
//!
//! Rows are dense 64-bit offsets into parallel column vectors. Each
//! protocol's table bundles a value column, a registry
//! ([`RowRegistry`]) and a protocol-specific lock column; the multi-version
//! table adds a [`VersionChain`] column.

mod registry;
mod version;

pub use registry::{LogEntry, LogTicket, OpKind, RowRegistry, NO_GRAPH_NODE};
pub use version::{Version, VersionChain, PENDING, TS_INFINITY};

/// Transaction identifier; 0 is reserved as the vacant marker in lock
/// words.
pub type TxnId = u64;

/// Dense row offset within a table.
pub type RowId = u64;

/// Index of a registered table within a coordinator.
pub type TableId = u32;
