// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Lifetime substrate for the lock-free layers of the store: a chunked slab
//! allocator for fixed-size nodes and an epoch manager that defers frees
//! until no thread can still hold a reference.
//!
//! Every critical section that touches a lock-free structure runs under an
//! [`EpochGuard`]. Objects unlinked from a structure are handed to
//! [`EpochHandle::retire`] as whole values (boxed closures that drop them or
//! recycle their slot); the closure runs only once the global epoch has
//! passed every guard that was active at retirement time.

mod arena;
mod epoch;

pub use arena::{ArenaError, ArenaHandle, ChunkArena};
pub use epoch::{EpochGuard, EpochHandle, EpochManager};
