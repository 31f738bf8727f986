// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Transaction coordinators over the shared row registry.
//!
//! Four concurrency-control protocols sit behind one session API:
//!
//! * [`twopl`]: row-granular strict two-phase locking with wait-die,
//! * [`sgt`]: serialization-graph testing with reader/writer edges and
//!   cascading abort ("no false negatives"),
//! * [`mvocc`]: multi-version optimistic CC with a commit-time certifier,
//! * [`tictoc`]: optimistic CC on per-row `(wts, rts)` timestamps with
//!   lazy read-timestamp extension.
//!
//! A coordinator owns the shared state (tables, clocks, graph, epoch
//! manager); each worker thread opens a [`TransactionSession`] against it
//! and runs one transaction at a time. Conflicts surface as
//! [`TxnError`] values, never panics; an aborted transaction always leaves
//! the row registry clean (pending versions unlinked, locks released, log
//! entries pruned).

mod error;
mod session;

pub mod mvocc;
pub mod sgt;
pub mod tictoc;
pub mod twopl;

pub use error::TxnError;
pub use session::{RowValue, TransactionSession};
