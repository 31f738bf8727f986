// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use nfdb_collections::CapacityError;
use nfdb_smr::ArenaError;
use nfdb_storage::TxnId;
use thiserror::Error;

/// Failure modes of the transaction API. `Conflict` and `CascadingAbort`
/// are the hot path: the caller aborts and usually retries. The other two
/// are resource exhaustion and fatal to the operation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TxnError {
    /// Wait-die kill, cycle detected, or validator rejection.
    #[error("transaction conflict")]
    Conflict,

    /// A predecessor this transaction depends on aborted.
    #[error("cascading abort through transaction {0}")]
    CascadingAbort(TxnId),

    /// An atomic map or set ran out of buckets.
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityError),

    /// The chunk arena hit its configured object limit.
    #[error(transparent)]
    AllocatorOom(#[from] ArenaError),
}

impl TxnError {
    /// Whether retrying the transaction can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxnError::Conflict | TxnError::CascadingAbort(_))
    }
}
