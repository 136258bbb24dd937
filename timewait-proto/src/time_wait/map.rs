use std::fmt;

use rustc_hash::FxHashMap;
use slab::Slab;

use crate::shared::ConnectionId;

/// Insertion-ordered map from connection ID to `T`
///
/// Entries live in a slab and are threaded onto a doubly linked list in insertion order, oldest
/// first, while `lookup` maps each connection ID to its slab slot. Every operation the time-wait
/// list needs (lookup, append, remove by key, pop oldest) is constant-time, and slots are never
/// exposed, so nothing outside can hold a reference into the structure across a removal.
pub(super) struct ConnectionIdMap<T> {
    lookup: FxHashMap<ConnectionId, usize>,
    entries: Slab<Node<T>>,
    /// Oldest entry
    head: Option<usize>,
    /// Newest entry
    tail: Option<usize>,
}

struct Node<T> {
    id: ConnectionId,
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<T> ConnectionIdMap<T> {
    pub(super) fn new() -> Self {
        Self {
            lookup: FxHashMap::default(),
            entries: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub(super) fn len(&self) -> usize {
        debug_assert_eq!(self.lookup.len(), self.entries.len());
        self.entries.len()
    }

    pub(super) fn contains(&self, id: &ConnectionId) -> bool {
        self.lookup.contains_key(id)
    }

    /// Access the value for `id` without changing its position
    pub(super) fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut T> {
        let slot = *self.lookup.get(id)?;
        Some(&mut self.entries[slot].value)
    }

    /// The entry that was inserted least recently
    pub(super) fn oldest(&self) -> Option<(&ConnectionId, &T)> {
        let node = &self.entries[self.head?];
        Some((&node.id, &node.value))
    }

    /// Append `value` as the newest entry
    ///
    /// `id` must not already be present.
    pub(super) fn push_newest(&mut self, id: ConnectionId, value: T) {
        debug_assert!(!self.lookup.contains_key(&id), "connection ID already present");
        let slot = self.entries.insert(Node {
            id,
            value,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.entries[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.lookup.insert(id, slot);
    }

    pub(super) fn remove(&mut self, id: &ConnectionId) -> Option<T> {
        let slot = self.lookup.remove(id)?;
        Some(self.unlink(slot).value)
    }

    /// Remove and return the oldest entry
    pub(super) fn pop_oldest(&mut self) -> Option<(ConnectionId, T)> {
        let slot = self.head?;
        let node = self.unlink(slot);
        let removed = self.lookup.remove(&node.id);
        debug_assert_eq!(removed, Some(slot));
        Some((node.id, node.value))
    }

    /// Iterate from oldest to newest
    pub(super) fn iter(&self) -> Iter<'_, T> {
        Iter {
            map: self,
            next: self.head,
        }
    }

    pub(super) fn clear(&mut self) {
        self.lookup.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    /// Take `slot` out of the slab and the list, fixing up its neighbors
    fn unlink(&mut self, slot: usize) -> Node<T> {
        let node = self.entries.remove(slot);
        match node.prev {
            Some(prev) => {
                debug_assert_eq!(self.entries[prev].next, Some(slot), "predecessor links here");
                self.entries[prev].next = node.next;
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                debug_assert_eq!(self.entries[next].prev, Some(slot), "successor links here");
                self.entries[next].prev = node.prev;
            }
            None => self.tail = node.prev,
        }
        self.maybe_shrink();
        node
    }

    /// Release slab memory if it's mostly unused
    fn maybe_shrink(&mut self) {
        if self.entries.capacity() / 16 > self.entries.len() {
            self.entries.shrink_to_fit();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ConnectionIdMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub(super) struct Iter<'a, T> {
    map: &'a ConnectionIdMap<T>,
    next: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (&'a ConnectionId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.map.entries[self.next?];
        self.next = node.next;
        Some((&node.id, &node.value))
    }
}
