// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use nfdb_smr::{ChunkArena, EpochGuard};
use std::{
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering},
};

/// Entry node; storage comes from a shared [`ChunkArena`] so rows do not
/// pay a heap allocation per log entry.
pub struct Node<V> {
    key: u64,
    value: V,
    next: AtomicPtr<Node<V>>,
}

unsafe impl<V: Send> Send for Node<V> {}

/// The deleted flag lives in the low bit of a node's own `next` pointer.
/// Marking freezes that pointer (every unlink CAS expects an unmarked
/// value), which is what makes the excision below safe.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Link<V>(*mut Node<V>);

impl<V> Link<V> {
    fn load(from: &AtomicPtr<Node<V>>) -> Self {
        Self(from.load(Ordering::Acquire))
    }

    fn ptr(self) -> *mut Node<V> {
        (self.0 as usize & !1) as *mut Node<V>
    }

    fn is_marked(self) -> bool {
        self.0 as usize & 1 == 1
    }

    fn marked(self) -> Self {
        Self((self.0 as usize | 1) as *mut Node<V>)
    }

    fn clean(ptr: *mut Node<V>) -> Self {
        debug_assert_eq!(ptr as usize & 1, 0, "node pointers are at least 2-aligned");
        Self(ptr)
    }
}

/// Lock-free singly-linked list keyed by PRV, newest first.
///
/// Inserts happen at the head only; erase marks the node's `next` pointer
/// and then excises it with a CAS on the predecessor link. Because a marked
/// node's `next` can no longer be CASed, a node that has been excised once
/// can never be re-excised through a stale predecessor, so exactly one
/// thread retires it. Readers traverse under an epoch guard and skip marked
/// nodes.
pub struct AtomicSinglyLinkedList<V> {
    head: AtomicPtr<Node<V>>,
    arena: ChunkArena<Node<V>>,
}

unsafe impl<V: Send> Send for AtomicSinglyLinkedList<V> {}
unsafe impl<V: Send> Sync for AtomicSinglyLinkedList<V> {}

impl<V: Copy + Send + 'static> AtomicSinglyLinkedList<V> {
    /// Builds the shared node arena; one arena typically backs every row
    /// log of a table.
    pub fn new_arena() -> ChunkArena<Node<V>> {
        ChunkArena::new()
    }

    pub fn new_in(arena: &ChunkArena<Node<V>>) -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            arena: arena.clone(),
        }
    }

    /// Pushes `{key, value}` at the head.
    pub fn insert(&self, key: u64, value: V) {
        let node = self
            .arena
            .alloc(Node {
                key,
                value,
                next: AtomicPtr::new(std::ptr::null_mut()),
            })
            .expect("log arena is unbounded")
            .as_ptr();
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Marks and excises the first node with `key`. Returns whether a live
    /// node was found. The caller's guard keeps excised nodes alive for
    /// concurrent readers; their slots are recycled through the epoch.
    pub fn erase(&self, key: u64, guard: &EpochGuard<'_, '_>) -> bool {
        'restart: loop {
            let mut prev_link: &AtomicPtr<Node<V>> = &self.head;
            let mut cur = Link::load(prev_link).ptr();
            while !cur.is_null() {
                let node = unsafe { &*cur };
                let next = Link::load(&node.next);
                if next.is_marked() {
                    // Help excise a node someone else already deleted.
                    if prev_link
                        .compare_exchange(cur, next.ptr(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.retire_node(cur, guard);
                        cur = next.ptr();
                        continue;
                    }
                    continue 'restart;
                }
                if node.key == key {
                    if node
                        .next
                        .compare_exchange(
                            next.ptr(),
                            Link::clean(next.ptr()).marked().0,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue 'restart;
                    }
                    if prev_link
                        .compare_exchange(cur, next.ptr(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.retire_node(cur, guard);
                    }
                    // Lost excisions are finished by a later traversal.
                    return true;
                }
                prev_link = &node.next;
                cur = next.ptr();
            }
            return false;
        }
    }

    /// First live value for `key`, if any.
    pub fn find(&self, key: u64, _guard: &EpochGuard<'_, '_>) -> Option<V> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            let next = Link::load(&node.next);
            if !next.is_marked() && node.key == key {
                return Some(node.value);
            }
            cur = next.ptr();
        }
        None
    }

    /// Snapshot traversal of live entries, newest insert first.
    pub fn iter<'g>(&'g self, _guard: &'g EpochGuard<'_, '_>) -> Iter<'g, V> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _list: self,
        }
    }

    pub fn is_empty(&self, guard: &EpochGuard<'_, '_>) -> bool {
        self.iter(guard).next().is_none()
    }

    fn retire_node(&self, node: *mut Node<V>, guard: &EpochGuard<'_, '_>) {
        unsafe { self.arena.retire_with(guard, NonNull::new_unchecked(node)) };
    }
}

impl<V> Drop for AtomicSinglyLinkedList<V> {
    fn drop(&mut self) {
        // Exclusive access: return every remaining node to the arena.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let next = Link::load(unsafe { &(*cur).next }).ptr();
            unsafe { self.arena.dealloc(NonNull::new_unchecked(cur)) };
            cur = next;
        }
    }
}

pub struct Iter<'g, V> {
    cur: *mut Node<V>,
    _list: &'g AtomicSinglyLinkedList<V>,
}

impl<V: Copy> Iterator for Iter<'_, V> {
    type Item = (u64, V);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.cur.is_null() {
            let node = unsafe { &*self.cur };
            let next = Link::load(&node.next);
            self.cur = next.ptr();
            if !next.is_marked() {
                return Some((node.key, node.value));
            }
        }
        None
    }
}
