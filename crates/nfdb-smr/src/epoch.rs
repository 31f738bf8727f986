// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::{
    cell::Cell,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Slot value published while a participant is outside any critical section.
const INACTIVE: u64 = u64::MAX;

/// How many retirements a participant accumulates before it attempts to
/// advance the global epoch and drain its own queue.
const COLLECT_INTERVAL: usize = 64;

/// A deferred reclamation: the callback owns whatever it is supposed to free.
struct Retired {
    epoch: u64,
    reclaim: Box<dyn FnOnce() + Send>,
}

/// Epoch-based reclamation manager.
///
/// Participants register once per worker thread and publish the global epoch
/// into their slot while inside a critical section. A retired object is
/// stamped with the epoch current at retirement and reclaimed only when the
/// minimum over all active slots has moved past that stamp, so any thread
/// that could have obtained a reference inside a guard has since left it.
pub struct EpochManager {
    global: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<AtomicU64>]>,
    queues: Box<[Mutex<Vec<Retired>>]>,
    registered: AtomicUsize,
}

impl EpochManager {
    pub fn new(max_participants: usize) -> Self {
        assert!(max_participants > 0);
        Self {
            global: CachePadded::new(AtomicU64::new(1)),
            slots: (0..max_participants)
                .map(|_| CachePadded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            queues: (0..max_participants).map(|_| Mutex::new(Vec::new())).collect(),
            registered: AtomicUsize::new(0),
        }
    }

    /// Sized for the common case of one participant per hardware thread,
    /// with headroom for short-lived helpers.
    pub fn with_default_capacity() -> Self {
        Self::new(num_cpus::get() * 8)
    }

    /// Registers the calling worker. Slots are not recycled; the manager
    /// must be sized for the total number of registrations over its life.
    pub fn register(&self) -> EpochHandle<'_> {
        let slot = self.registered.fetch_add(1, Ordering::Relaxed);
        assert!(
            slot < self.slots.len(),
            "epoch manager capacity ({}) exhausted",
            self.slots.len()
        );
        EpochHandle {
            manager: self,
            slot,
            depth: Cell::new(0),
            since_collect: Cell::new(0),
        }
    }

    fn min_active_epoch(&self) -> u64 {
        let registered = self.registered.load(Ordering::Acquire).min(self.slots.len());
        let mut min = self.global.load(Ordering::SeqCst);
        for slot in &self.slots[..registered] {
            let published = slot.load(Ordering::SeqCst);
            if published != INACTIVE && published < min {
                min = published;
            }
        }
        min
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // All participants are gone; every pending callback is safe to run.
        for queue in self.queues.iter() {
            for retired in queue.lock().drain(..) {
                (retired.reclaim)();
            }
        }
    }
}

/// Per-worker registration with the epoch manager. Not `Sync`; each worker
/// owns its handle and its retirement queue.
pub struct EpochHandle<'e> {
    manager: &'e EpochManager,
    slot: usize,
    depth: Cell<usize>,
    since_collect: Cell<usize>,
}

impl<'e> EpochHandle<'e> {
    /// Enters a critical section. Reentrant; only the outermost guard
    /// publishes and clears the slot.
    pub fn pin(&self) -> EpochGuard<'_, 'e> {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        if depth == 0 {
            let slot = &self.manager.slots[self.slot];
            loop {
                let epoch = self.manager.global.load(Ordering::SeqCst);
                slot.store(epoch, Ordering::SeqCst);
                // The slot must be visible before the epoch moves on,
                // otherwise a collector could miss this participant.
                if self.manager.global.load(Ordering::SeqCst) == epoch {
                    break;
                }
            }
        }
        EpochGuard { handle: self }
    }

    /// Defers `reclaim` until every guard active right now has been
    /// released. The callback owns what it frees.
    pub fn retire(&self, reclaim: impl FnOnce() + Send + 'static) {
        let epoch = self.manager.global.load(Ordering::SeqCst);
        self.manager.queues[self.slot].lock().push(Retired {
            epoch,
            reclaim: Box::new(reclaim),
        });

        let pending = self.since_collect.get() + 1;
        self.since_collect.set(pending);
        if pending >= COLLECT_INTERVAL {
            self.since_collect.set(0);
            self.try_collect();
        }
    }

    /// Convenience over [`retire`](Self::retire) for plain boxed values.
    pub fn retire_box<T: Send + 'static>(&self, value: Box<T>) {
        self.retire(move || drop(value));
    }

    /// Advances the global epoch and runs the queued reclamations of this
    /// participant that no active guard can still observe.
    pub fn try_collect(&self) {
        self.manager.global.fetch_add(1, Ordering::SeqCst);
        let min = self.manager.min_active_epoch();

        let ready: Vec<Retired> = {
            let mut queue = self.manager.queues[self.slot].lock();
            let (ready, pending) = queue.drain(..).partition(|r| r.epoch < min);
            *queue = pending;
            ready
        };
        for retired in ready {
            (retired.reclaim)();
        }
    }
}

/// Scope token for a critical section; see [`EpochHandle::pin`].
pub struct EpochGuard<'h, 'e> {
    handle: &'h EpochHandle<'e>,
}

impl EpochGuard<'_, '_> {
    /// Retires through the owning handle without releasing the guard.
    pub fn retire(&self, reclaim: impl FnOnce() + Send + 'static) {
        self.handle.retire(reclaim);
    }
}

impl Drop for EpochGuard<'_, '_> {
    fn drop(&mut self) {
        let depth = self.handle.depth.get() - 1;
        self.handle.depth.set(depth);
        if depth == 0 {
            self.handle.manager.slots[self.handle.slot].store(INACTIVE, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn retire_runs_after_guards_release() {
        let manager = EpochManager::new(4);
        let handle = manager.register();
        let freed = Arc::new(AtomicUsize::new(0));

        let guard = handle.pin();
        let f = freed.clone();
        handle.retire(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        // Our own guard pins the epoch of the retirement.
        handle.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(guard);

        handle.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_guard_blocks_reclamation() {
        let manager = EpochManager::new(4);
        let retiring = manager.register();
        let reader = manager.register();
        let freed = Arc::new(AtomicUsize::new(0));

        let reader_guard = reader.pin();
        {
            let _guard = retiring.pin();
            let f = freed.clone();
            retiring.retire(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        retiring.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 0, "reader still pinned");

        drop(reader_guard);
        retiring.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_guards_publish_once() {
        let manager = EpochManager::new(1);
        let handle = manager.register();
        let outer = handle.pin();
        let inner = handle.pin();
        drop(inner);
        // Still pinned: a retirement from this epoch must not be collected.
        let freed = Arc::new(AtomicUsize::new(0));
        let f = freed.clone();
        handle.retire(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        handle.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(outer);
        handle.try_collect();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_drop_flushes_queues() {
        let freed = Arc::new(AtomicUsize::new(0));
        {
            let manager = EpochManager::new(2);
            let handle = manager.register();
            let _guard = handle.pin();
            for _ in 0..10 {
                let f = freed.clone();
                handle.retire(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(freed.load(Ordering::SeqCst), 10);
    }
}
