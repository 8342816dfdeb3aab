//! Byte-budgeted LRU list.
//!
//! Nodes live in an arena and link to each other by index. Slots `FRONT` and
//! `BACK` are sentinels bracketing the list, so linking and unlinking never
//! has to special-case the ends. `FRONT.older` is the most recently used node
//! and `BACK.newer` the least recently used one.

use std::collections::HashMap;

const FRONT: usize = 0;
const BACK: usize = 1;

struct Node<V> {
    key: String,
    value: Option<V>,
    size: usize,
    older: usize,
    newer: usize,
}

impl<V> Node<V> {
    fn sentinel() -> Self {
        Self {
            key: String::new(),
            value: None,
            size: 0,
            older: FRONT,
            newer: BACK,
        }
    }
}

/// Outcome of [`ByteLru::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum Insert {
    /// Stored; lists keys evicted from the back to make room.
    Stored { evicted: Vec<String> },
    /// The item alone exceeds the budget and was not stored.
    Rejected,
}

pub struct ByteLru<V> {
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    total_bytes: usize,
    max_bytes: usize,
}

impl<V: Clone> ByteLru<V> {
    pub fn new(max_bytes: usize) -> Self {
        let mut front = Node::sentinel();
        front.older = BACK;
        let mut back = Node::sentinel();
        back.newer = FRONT;
        Self {
            nodes: vec![front, back],
            free: Vec::new(),
            index: HashMap::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the value and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.unlink(idx);
        self.link_front(idx);
        self.nodes[idx].value.clone()
    }

    /// Returns the value without touching recency.
    pub fn peek(&self, key: &str) -> Option<V> {
        let idx = *self.index.get(key)?;
        self.nodes[idx].value.clone()
    }

    /// Inserts or replaces `key` at the front, then trims from the back until
    /// the budget holds again.
    pub fn insert(&mut self, key: String, value: V, size: usize) -> Insert {
        if size > self.max_bytes {
            return Insert::Rejected;
        }

        match self.index.get(&key).copied() {
            Some(idx) => {
                self.total_bytes -= self.nodes[idx].size;
                self.nodes[idx].value = Some(value);
                self.nodes[idx].size = size;
                self.unlink(idx);
                self.link_front(idx);
            }
            None => {
                let node = Node {
                    key: key.clone(),
                    value: Some(value),
                    size,
                    older: BACK,
                    newer: FRONT,
                };
                let idx = match self.free.pop() {
                    Some(slot) => {
                        self.nodes[slot] = node;
                        slot
                    }
                    None => {
                        self.nodes.push(node);
                        self.nodes.len() - 1
                    }
                };
                self.index.insert(key, idx);
                self.link_front(idx);
            }
        }
        self.total_bytes += size;

        let mut evicted = Vec::new();
        while self.total_bytes > self.max_bytes {
            let lru = self.nodes[BACK].newer;
            if lru == FRONT {
                break;
            }
            let key = self.nodes[lru].key.clone();
            self.remove(&key);
            evicted.push(key);
        }
        Insert::Stored { evicted }
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        self.total_bytes -= self.nodes[idx].size;
        let node = &mut self.nodes[idx];
        node.size = 0;
        node.key.clear();
        self.free.push(idx);
        node.value.take()
    }

    pub fn clear(&mut self) {
        self.nodes.truncate(2);
        self.nodes[FRONT].older = BACK;
        self.nodes[BACK].newer = FRONT;
        self.free.clear();
        self.index.clear();
        self.total_bytes = 0;
    }

    /// Keys ordered from most to least recently used.
    pub fn keys_mru(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.nodes[FRONT].older;
        while cursor != BACK {
            keys.push(self.nodes[cursor].key.clone());
            cursor = self.nodes[cursor].older;
        }
        keys
    }

    fn unlink(&mut self, idx: usize) {
        let (older, newer) = (self.nodes[idx].older, self.nodes[idx].newer);
        self.nodes[newer].older = older;
        self.nodes[older].newer = newer;
    }

    fn link_front(&mut self, idx: usize) {
        let first = self.nodes[FRONT].older;
        self.nodes[idx].newer = FRONT;
        self.nodes[idx].older = first;
        self.nodes[first].newer = idx;
        self.nodes[FRONT].older = idx;
    }
}
