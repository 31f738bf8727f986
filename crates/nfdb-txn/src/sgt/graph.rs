// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::TxnError;
use nfdb_collections::{AtomicExtentVector, AtomicUnorderedSet};
use nfdb_smr::EpochGuard;
use nfdb_storage::TxnId;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Edges a single transaction can accumulate; overflow aborts the
/// transaction with `CapacityExceeded`.
const EDGE_SET_CAPACITY: usize = 1024;

/// A typed edge: target node index plus the reader-writer kind in the low
/// bit. The encoding never leaves this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EdgeRef(u64);

impl EdgeRef {
    pub fn new(node: u32, rw: bool) -> Self {
        Self(((node as u64) << 1) | rw as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn node(self) -> u32 {
        (self.0 >> 1) as u32
    }

    /// Set: rw (anti-dependency). Clear: ww/wr (value dependency).
    pub fn is_rw(self) -> bool {
        self.0 & 1 == 1
    }
}

/// One live transaction in the graph. Slots are recycled, never freed;
/// `transaction` disambiguates a slot from its previous occupant.
pub(crate) struct Node {
    outgoing: AtomicUnorderedSet<u64>,
    incoming: AtomicUnorderedSet<u64>,
    transaction: AtomicU64,
    abort: AtomicBool,
    cascading_abort: AtomicBool,
    committed: AtomicBool,
    cleaned: AtomicBool,
    recycled: AtomicBool,
    abort_through: AtomicU64,
    /// Edge insertion holds this shared; cleanup holds it exclusively.
    lock: RwLock<()>,
}

impl Node {
    fn new() -> Self {
        Self {
            outgoing: AtomicUnorderedSet::new(EDGE_SET_CAPACITY),
            incoming: AtomicUnorderedSet::new(EDGE_SET_CAPACITY),
            transaction: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            cascading_abort: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            recycled: AtomicBool::new(false),
            abort_through: AtomicU64::new(0),
            lock: RwLock::new(()),
        }
    }
}

/// Reusable DFS scratch: the visited set and work stack survive across
/// cycle checks so the hot path does not allocate.
#[derive(Default)]
pub struct DfsScratch {
    visited: HashSet<u32>,
    stack: Vec<u32>,
}

/// Cell type of the node-slot table.
#[derive(Clone, Copy, PartialEq, Eq)]
struct NodePtr(*mut Node);

impl Default for NodePtr {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

unsafe impl Send for NodePtr {}

/// The serialization graph: one node per live transaction, edges typed
/// rw / wwr by [`EdgeRef`]. A transaction aborts itself the moment one of
/// its operations closes a cycle through its own node, so any schedule
/// the graph admits is conflict-serializable.
pub struct SerializationGraph {
    slots: AtomicExtentVector<NodePtr>,
    free: Arc<Mutex<Vec<u32>>>,
}

impl SerializationGraph {
    pub fn new() -> Self {
        Self {
            slots: AtomicExtentVector::new(),
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn node(&self, index: u32) -> &Node {
        let ptr = self.slots.get(index as u64).0;
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    /// Binds a fresh or recycled slot to `txn`.
    pub fn create_node(&self, txn: TxnId) -> u32 {
        if let Some(index) = self.free.lock().pop() {
            let node = self.node(index);
            let _exclusive = node.lock.write();
            node.outgoing.clear();
            node.incoming.clear();
            node.abort.store(false, Ordering::Release);
            node.cascading_abort.store(false, Ordering::Release);
            node.committed.store(false, Ordering::Release);
            node.cleaned.store(false, Ordering::Release);
            node.recycled.store(false, Ordering::Release);
            node.abort_through.store(0, Ordering::Release);
            node.transaction.store(txn, Ordering::Release);
            return index;
        }
        let node = Box::into_raw(Box::new(Node::new()));
        unsafe { &*node }.transaction.store(txn, Ordering::Release);
        self.slots.push_back(NodePtr(node)) as u32
    }

    /// Pending abort verdicts against this transaction, if any.
    pub fn needs_abort(&self, index: u32) -> Option<TxnError> {
        let node = self.node(index);
        if node.cascading_abort.load(Ordering::Acquire) {
            Some(TxnError::CascadingAbort(
                node.abort_through.load(Ordering::Acquire),
            ))
        } else if node.abort.load(Ordering::Acquire) {
            Some(TxnError::Conflict)
        } else {
            None
        }
    }

    /// Records the dependency `from → me` learned from a row log and runs
    /// the cycle check. `Err` means `me` must abort.
    pub fn insert_and_check(
        &self,
        me: u32,
        from: u32,
        from_txn: TxnId,
        rw: bool,
        scratch: &mut DfsScratch,
    ) -> Result<(), TxnError> {
        if from == me {
            return Ok(());
        }
        {
            let source = self.node(from);
            let _shared = source.lock.read();
            if source.transaction.load(Ordering::Acquire) != from_txn
                || source.cleaned.load(Ordering::Acquire)
            {
                // The source already finished; a completed predecessor
                // imposes no constraint.
                return Ok(());
            }
            if !rw
                && (source.abort.load(Ordering::Acquire)
                    || source.cascading_abort.load(Ordering::Acquire))
            {
                // We consumed a doomed write.
                let node = self.node(me);
                node.cascading_abort.store(true, Ordering::Release);
                node.abort_through.store(from_txn, Ordering::Release);
                return Err(TxnError::CascadingAbort(from_txn));
            }
            source.outgoing.insert(EdgeRef::new(me, rw).raw())?;
            self.node(me).incoming.insert(EdgeRef::new(from, rw).raw())?;
        }

        if self.cycle_check_naive(me, scratch) {
            let node = self.node(me);
            node.abort.store(true, Ordering::Release);
            debug!(node = me, "cycle detected, aborting");
            return Err(TxnError::Conflict);
        }
        Ok(())
    }

    /// DFS along outgoing edges; true iff a path leads back to `me`.
    pub fn cycle_check_naive(&self, me: u32, scratch: &mut DfsScratch) -> bool {
        scratch.visited.clear();
        scratch.stack.clear();
        for raw in self.node(me).outgoing.iter() {
            scratch.stack.push(EdgeRef::from_raw(raw).node());
        }
        while let Some(index) = scratch.stack.pop() {
            if index == me {
                return true;
            }
            if !scratch.visited.insert(index) {
                continue;
            }
            let node = self.node(index);
            if node.cleaned.load(Ordering::Acquire) {
                continue;
            }
            for raw in node.outgoing.iter() {
                scratch.stack.push(EdgeRef::from_raw(raw).node());
            }
        }
        false
    }

    /// Commit gate: true once every incoming edge's source has itself
    /// committed (or finished cleanup). Waiting on live predecessors is
    /// what keeps dirty reads out of the committed set; the wait cannot be
    /// circular without a cycle, which the waiter keeps probing for.
    /// `Err` reports a pending abort verdict instead.
    pub fn check_committed(&self, index: u32) -> Result<bool, TxnError> {
        if let Some(error) = self.needs_abort(index) {
            return Err(error);
        }
        let node = self.node(index);
        for raw in node.incoming.iter() {
            // A live edge pins its source slot, so the load cannot observe
            // a recycled occupant. Aborted sources unblock by erasing the
            // edge, after they have condemned us if we consumed their
            // writes.
            let source = self.node(EdgeRef::from_raw(raw).node());
            if !source.committed.load(Ordering::Acquire) {
                return Ok(false);
            }
        }
        node.committed.store(true, Ordering::Release);
        Ok(true)
    }

    /// Unlinks the transaction from the graph. For an abort, every
    /// value-dependent successor is condemned before its edge is removed:
    /// they read state this transaction is rolling back.
    pub fn cleanup(&self, index: u32, txn: TxnId, aborted: bool, guard: &EpochGuard<'_, '_>) {
        let node = self.node(index);
        // `cleaned` is published under the exclusive lock so no further
        // edge can attach once the outgoing set is drained.
        let successors: Vec<EdgeRef> = {
            let _exclusive = node.lock.write();
            let successors = node.outgoing.iter().map(EdgeRef::from_raw).collect();
            node.outgoing.clear();
            node.cleaned.store(true, Ordering::Release);
            successors
        };
        // Condemn value-dependent successors before their commit gate can
        // unblock on the edge removal below.
        if aborted {
            for edge in successors.iter().filter(|edge| !edge.is_rw()) {
                let successor = self.node(edge.node());
                successor.abort_through.store(txn, Ordering::Release);
                successor.cascading_abort.store(true, Ordering::Release);
            }
        }
        for edge in successors {
            let successor = self.node(edge.node());
            successor.incoming.erase(&EdgeRef::new(index, edge.is_rw()).raw());
            self.try_recycle(edge.node(), guard);
        }
        self.try_recycle(index, guard);
    }

    /// Returns a slot to the free list once it is fully drained; the push
    /// is epoch-deferred so a concurrent DFS never sees the slot re-bound.
    fn try_recycle(&self, index: u32, guard: &EpochGuard<'_, '_>) {
        let node = self.node(index);
        if !node.cleaned.load(Ordering::Acquire) || !node.incoming.is_empty() {
            return;
        }
        if node
            .recycled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let free = self.free.clone();
            guard.retire(move || free.lock().push(index));
        }
    }

    /// Live (not yet recycled) nodes; test and introspection aid.
    pub fn size(&self) -> usize {
        self.slots.len() as usize - self.free.lock().len()
    }
}

impl Default for SerializationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerializationGraph {
    fn drop(&mut self) {
        for ptr in self.slots.iter() {
            if !ptr.0.is_null() {
                drop(unsafe { Box::from_raw(ptr.0) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfdb_smr::EpochManager;

    #[test]
    fn edge_ref_round_trip() {
        let edge = EdgeRef::new(42, true);
        assert_eq!(edge.node(), 42);
        assert!(edge.is_rw());
        let edge = EdgeRef::from_raw(EdgeRef::new(7, false).raw());
        assert_eq!(edge.node(), 7);
        assert!(!edge.is_rw());
    }

    #[test]
    fn two_node_cycle_aborts_second_inserter() {
        let graph = SerializationGraph::new();
        let mut scratch = DfsScratch::default();
        let a = graph.create_node(1);
        let b = graph.create_node(2);

        claims::assert_ok!(graph.insert_and_check(b, a, 1, false, &mut scratch));
        // Closing the loop must be rejected.
        claims::assert_err!(graph.insert_and_check(a, b, 2, true, &mut scratch));
        claims::assert_some_eq!(graph.needs_abort(a), TxnError::Conflict);
        claims::assert_none!(graph.needs_abort(b));
    }

    #[test]
    fn commit_waits_for_predecessors() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let graph = SerializationGraph::new();
        let mut scratch = DfsScratch::default();
        let a = graph.create_node(1);
        let b = graph.create_node(2);

        claims::assert_ok!(graph.insert_and_check(b, a, 1, false, &mut scratch));
        assert!(!graph.check_committed(b).unwrap(), "predecessor still live");
        assert!(graph.check_committed(a).unwrap());

        // Once the source is committed its edge no longer blocks, even
        // before cleanup drains it.
        assert!(graph.check_committed(b).unwrap());

        let guard = handle.pin();
        graph.cleanup(a, 1, false, &guard);
        graph.cleanup(b, 2, false, &guard);
    }

    #[test]
    fn abort_condemns_value_dependent_successors() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let graph = SerializationGraph::new();
        let mut scratch = DfsScratch::default();
        let writer = graph.create_node(1);
        let reader = graph.create_node(2);

        // reader consumed writer's value: writer → reader, wr edge.
        claims::assert_ok!(graph.insert_and_check(reader, writer, 1, false, &mut scratch));

        let guard = handle.pin();
        graph.node(writer).abort.store(true, Ordering::Release);
        graph.cleanup(writer, 1, true, &guard);

        claims::assert_some_eq!(
            graph.needs_abort(reader),
            TxnError::CascadingAbort(1)
        );
    }

    #[test]
    fn slots_recycle_after_epoch() {
        let manager = EpochManager::new(2);
        let handle = manager.register();
        let graph = SerializationGraph::new();

        let a = graph.create_node(1);
        {
            let guard = handle.pin();
            graph.node(a).abort.store(true, Ordering::Release);
            graph.cleanup(a, 1, true, &guard);
        }
        handle.try_collect();
        let b = graph.create_node(2);
        assert_eq!(a, b, "drained slot should be recycled");
    }
}
