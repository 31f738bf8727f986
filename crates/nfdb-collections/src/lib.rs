// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Lock-free containers shared by every concurrency-control protocol in the
//! store.
//!
//! The segmented [`AtomicExtentVector`] is the backbone: all row columns
//! (values, tickets, lock words, log heads, version heads) are extent
//! vectors, and its no-relocation guarantee is what lets upper layers hold
//! raw cell addresses across growth. The open-addressed
//! [`AtomicUnorderedMap`]/[`AtomicUnorderedSet`] serve the wait-die
//! start-time table, the live-transaction registry and the serialization
//! graph's edge sets. [`AtomicSinglyLinkedList`] is the per-row
//! read/write log.

mod atomic_list;
mod atomic_map;
mod atomic_set;
mod extent_vector;

pub use atomic_list::{AtomicSinglyLinkedList, Node as ListNode};
pub use atomic_map::AtomicUnorderedMap;
pub use atomic_set::AtomicUnorderedSet;
pub use extent_vector::AtomicExtentVector;

use thiserror::Error;

/// Fixed-capacity structure ran out of buckets. Callers either retry after
/// shrinking their footprint or give up on the operation; nothing grows
/// in place.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("capacity ({0}) exceeded")]
pub struct CapacityError(pub usize);
