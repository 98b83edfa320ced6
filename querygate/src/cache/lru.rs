// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Bounded least-recently-used map
//!
//! Slab-backed doubly linked list plus a hash index, so lookup, touch,
//! insert and eviction are all O(1). Not synchronized; callers wrap each
//! instance in a shard lock.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// LRU map holding at most `capacity` entries
#[derive(Debug)]
pub struct LruMap<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used
    head: usize,
    /// Least recently used
    tail: usize,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up and mark as most recently used
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        self.slots[slot].as_mut().map(|node| &mut node.value)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    /// Insert or replace. Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.value = value;
            }
            self.move_to_front(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_lru()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.attach_front(slot);

        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.free.push(slot);
        Some(node.value)
    }

    /// Remove and return the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.detach(slot);
        let node = self.slots[slot].take()?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some((node.key, node.value))
    }

    /// Remove every entry matching `drop_if` and return them
    pub fn drain_where<F>(&mut self, mut drop_if: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<K> = self
            .iter()
            .filter(|&(k, v)| drop_if(k, v))
            .map(|(k, _)| k.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|key| self.remove(&key).map(|value| (key, value)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Iterate from most to least recently used
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            map: self,
            cursor: self.head,
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.detach(slot);
        self.attach_front(slot);
    }

    fn attach_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(head) = self.slots[old_head].as_mut() {
                head.prev = slot;
            }
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else {
            self.head = next;
        }

        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }
}

pub struct Iter<'a, K, V> {
    map: &'a LruMap<K, V>,
    cursor: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.map.slots[self.cursor].as_ref()?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}
