//! LRU (Least Recently Used) list backing every region
//!
//! Uses an intrusive linked list over a slab for O(1) eviction. A list
//! built with [`LruCache::unbounded`] never evicts.

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU list with optional capacity
pub struct LruCache<K, V> {
    map: HashMap<K, usize, RandomState>,
    nodes: Vec<Option<Node<K, V>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    capacity: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a list holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than 0");

        Self {
            map: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free_list: Vec::new(),
            capacity: Some(capacity),
        }
    }

    /// Create a list that never evicts
    pub fn unbounded() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            capacity: None,
        }
    }

    /// Maximum number of entries, if bounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Get a value and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.nodes[idx].as_ref().map(|node| &node.value)
    }

    /// Get a value without touching recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.nodes[idx].as_ref().map(|node| &node.value)
    }

    /// Insert or replace a value
    ///
    /// Returns the least recently used entry if it had to make room.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = &mut self.nodes[idx] {
                node.value = value;
            }
            self.move_to_front(idx);
            return None;
        }

        let evicted = match self.capacity {
            Some(capacity) if self.map.len() >= capacity => self.evict(),
            _ => None,
        };

        let idx = self.alloc_node();
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            value,
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.map.insert(key, idx);
        evicted
    }

    /// Remove a key
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        self.free_node(idx);
        self.nodes[idx].take().map(|node| node.value)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop every entry, returning how many there were
    pub fn clear(&mut self) -> usize {
        let len = self.map.len();
        self.map.clear();
        self.nodes.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        len
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = &mut self.nodes[prev_idx] {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(next_idx) => {
                if let Some(next_node) = &mut self.nodes[next_idx] {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn evict(&mut self) -> Option<(K, V)> {
        let tail_idx = self.tail?;
        self.unlink(tail_idx);
        let node = self.nodes[tail_idx].take()?;
        self.map.remove(&node.key);
        self.free_node(tail_idx);
        Some((node.key, node.value))
    }

    fn alloc_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn free_node(&mut self, idx: usize) {
        self.free_list.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_basic() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a");
        cache.put(2, "b");

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_eviction_returns_victim() {
        let mut cache = LruCache::new(2);

        assert!(cache.put(1, "a").is_none());
        assert!(cache.put(2, "b").is_none());
        assert_eq!(cache.put(3, "c"), Some((1, "a")));

        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn test_lru_recency() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a");
        cache.put(2, "b");
        cache.get(&1);
        assert_eq!(cache.put(3, "c"), Some((2, "b")));

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), None);
    }

    #[test]
    fn test_peek_does_not_promote() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a");
        cache.put(2, "b");
        assert_eq!(cache.peek(&1), Some(&"a"));
        assert_eq!(cache.put(3, "c"), Some((1, "a")));
    }

    #[test]
    fn test_lru_remove_and_reuse_slot() {
        let mut cache = LruCache::new(3);

        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c");

        assert_eq!(cache.remove(&2), Some("b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&2), None);

        cache.put(4, "d");
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&4), Some(&"d"));
    }

    #[test]
    fn test_unbounded_never_evicts() {
        let mut cache = LruCache::unbounded();
        for i in 0..1000 {
            assert!(cache.put(i, i * 2).is_none());
        }
        assert_eq!(cache.len(), 1000);
        assert_eq!(cache.peek(&0), Some(&0));
        assert_eq!(cache.capacity(), None);
    }

    #[test]
    fn test_lru_clear() {
        let mut cache = LruCache::new(3);

        cache.put(1, "a");
        cache.put(2, "b");
        assert_eq!(cache.clear(), 2);

        assert!(cache.is_empty());
        cache.put(3, "c");
        assert_eq!(cache.get(&3), Some(&"c"));
    }

    #[test]
    fn test_lru_overwrite() {
        let mut cache = LruCache::new(2);

        cache.put(1, "a");
        cache.put(1, "b");

        assert_eq!(cache.get(&1), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }
}
