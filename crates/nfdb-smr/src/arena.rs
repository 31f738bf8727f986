// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{EpochGuard, EpochHandle};
use parking_lot::Mutex;
use std::{
    cell::{RefCell, UnsafeCell},
    mem::MaybeUninit,
    ptr::NonNull,
    sync::Arc,
};
use thiserror::Error;

/// Objects handed out per chunk. Chunks are never freed while the arena is
/// alive, so raw slot addresses stay stable.
const CHUNK_OBJECTS: usize = 1024;

/// Slots moved between the shared free list and a worker cache per refill.
const CACHE_REFILL: usize = 32;
const CACHE_SPILL: usize = 64;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena object limit ({0}) exhausted")]
    OutOfMemory(usize),
}

// Dropping the arena releases chunk storage only; slots still holding live
// values must have been deallocated by their owners first.
struct Chunk<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

struct State<T> {
    chunks: Vec<Chunk<T>>,
    /// Bump index into the last chunk.
    bump: usize,
    free: Vec<NonNull<T>>,
    allocated: usize,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    max_objects: Option<usize>,
}

// Slots hold T by value and are handed out to at most one owner at a time.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// Slab allocator for fixed-size nodes (log entries, versions, lock words).
///
/// Cloning shares the arena; a clone is what a deferred reclamation closure
/// captures so a slot can be returned from whichever thread runs the epoch
/// callback. Hot paths go through a per-worker [`ArenaHandle`] cache.
pub struct ChunkArena<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ChunkArena<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ChunkArena<T> {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    pub fn with_limit(max_objects: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    chunks: Vec::new(),
                    bump: CHUNK_OBJECTS,
                    free: Vec::new(),
                    allocated: 0,
                }),
                max_objects,
            }),
        }
    }

    pub fn handle(&self) -> ArenaHandle<T> {
        ArenaHandle {
            arena: self.clone(),
            cache: RefCell::new(Vec::new()),
        }
    }

    /// Allocates a slot and moves `value` into it.
    pub fn alloc(&self, value: T) -> Result<NonNull<T>, ArenaError> {
        let slot = self.reserve_slot()?;
        unsafe { slot.as_ptr().write(value) };
        Ok(slot)
    }

    fn reserve_slot(&self) -> Result<NonNull<T>, ArenaError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(slot) = state.free.pop() {
            return Ok(slot);
        }
        if let Some(max) = self.inner.max_objects {
            if state.allocated >= max {
                return Err(ArenaError::OutOfMemory(max));
            }
        }
        if state.bump == CHUNK_OBJECTS {
            let slots = (0..CHUNK_OBJECTS)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect();
            state.chunks.push(Chunk { slots });
            state.bump = 0;
        }
        let bump = state.bump;
        let slot = state.chunks.last().expect("chunk was just ensured").slots[bump].get() as *mut T;
        state.bump += 1;
        state.allocated += 1;
        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    /// Drops the value in `slot` and parks the slot on the free list.
    ///
    /// # Safety
    ///
    /// `slot` must come from this arena, hold a live value, and have no
    /// remaining references (typically guaranteed by epoch retirement).
    pub unsafe fn dealloc(&self, slot: NonNull<T>) {
        slot.as_ptr().drop_in_place();
        self.inner.state.lock().free.push(slot);
    }

    /// Retires `slot` through the epoch manager; the slot is dropped and
    /// recycled once no guard active today can still reference it.
    ///
    /// # Safety
    ///
    /// `slot` must come from this arena, hold a live value, and be
    /// unreachable for any thread that pins after this call.
    pub unsafe fn retire(&self, handle: &EpochHandle<'_>, slot: NonNull<T>)
    where
        T: Send + 'static,
    {
        let arena = self.clone();
        let slot = SendPtr(slot);
        handle.retire(move || unsafe {
            let slot = slot;
            arena.dealloc(slot.0)
        });
    }

    /// [`retire`](Self::retire) through an active guard.
    ///
    /// # Safety
    ///
    /// Same contract as [`retire`](Self::retire).
    pub unsafe fn retire_with(&self, guard: &EpochGuard<'_, '_>, slot: NonNull<T>)
    where
        T: Send + 'static,
    {
        let arena = self.clone();
        let slot = SendPtr(slot);
        guard.retire(move || unsafe {
            let slot = slot;
            arena.dealloc(slot.0)
        });
    }
}

impl<T> Default for ChunkArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct SendPtr<T>(NonNull<T>);
unsafe impl<T: Send> Send for SendPtr<T> {}

/// Per-worker cache in front of a [`ChunkArena`]: pops locally, refills in
/// batches, and spills back when the cache grows past a watermark. Freed
/// slots from other threads drain through the shared list instead.
pub struct ArenaHandle<T> {
    arena: ChunkArena<T>,
    cache: RefCell<Vec<NonNull<T>>>,
}

// Cached slots are vacant and exclusively owned by the handle, so the
// handle may move with its worker.
unsafe impl<T: Send> Send for ArenaHandle<T> {}

impl<T> ArenaHandle<T> {
    pub fn alloc(&self, value: T) -> Result<NonNull<T>, ArenaError> {
        let mut cache = self.cache.borrow_mut();
        if cache.is_empty() {
            let mut state = self.arena.inner.state.lock();
            let take = state.free.len().min(CACHE_REFILL);
            let at = state.free.len() - take;
            cache.extend(state.free.drain(at..));
        }
        if let Some(slot) = cache.pop() {
            unsafe { slot.as_ptr().write(value) };
            return Ok(slot);
        }
        drop(cache);
        self.arena.alloc(value)
    }

    /// # Safety
    ///
    /// Same contract as [`ChunkArena::dealloc`].
    pub unsafe fn dealloc(&self, slot: NonNull<T>) {
        slot.as_ptr().drop_in_place();
        let mut cache = self.cache.borrow_mut();
        cache.push(slot);
        if cache.len() > CACHE_SPILL {
            let at = cache.len() / 2;
            self.arena.inner.state.lock().free.extend(cache.drain(at..));
        }
    }

    pub fn arena(&self) -> &ChunkArena<T> {
        &self.arena
    }
}

impl<T> Drop for ArenaHandle<T> {
    fn drop(&mut self) {
        // Hand cached slots back so a retiring worker leaks nothing.
        let cache = self.cache.get_mut();
        self.arena.inner.state.lock().free.append(cache);
    }
}
