//! A small bounded, insertion-ordered map used for the in-memory reply
//! counter and solicited-sends tables (§3). Capacity is enforced by evicting
//! the oldest key once the map grows past `capacity` — the same "ring
//! buffer over a map" idiom as a bounded journal buffer, just keyed instead
//! of sequential.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

pub struct BoundedLru<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    map: HashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V> BoundedLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    /// Inserts or replaces `key`. Evicts the oldest-inserted key if this
    /// pushes the map over capacity and `key` is new.
    pub fn insert(&mut self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
        self.map.insert(key, value);
    }

    /// Fetch-or-insert-default, then hand back a mutable reference.
    pub fn entry_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        if !self.map.contains_key(&key) {
            self.insert(key.clone(), default());
        }
        self.map.get_mut(&key).unwrap()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_once_over_capacity() {
        let mut lru: BoundedLru<u32, u32> = BoundedLru::new(2);
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(3, 30);
        assert_eq!(lru.len(), 2);
        assert!(lru.get(&1).is_none());
        assert_eq!(lru.get(&2), Some(&20));
        assert_eq!(lru.get(&3), Some(&30));
    }

    #[test]
    fn updating_existing_key_does_not_evict() {
        let mut lru: BoundedLru<u32, u32> = BoundedLru::new(2);
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(1, 11);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get(&1), Some(&11));
        assert_eq!(lru.get(&2), Some(&20));
    }

    #[test]
    fn entry_or_insert_with_initializes_once() {
        let mut lru: BoundedLru<u32, Vec<u32>> = BoundedLru::new(8);
        lru.entry_or_insert_with(1, Vec::new).push(5);
        lru.entry_or_insert_with(1, Vec::new).push(6);
        assert_eq!(lru.get(&1), Some(&vec![5, 6]));
    }
}
