/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Keys-ordered container used by the timer index (component R in the design
//! document). A faithful rewrite of the original's intrusive red-black tree
//! would hand-roll rebalancing that `std::collections::BTreeMap` already
//! gives us; this module is a thin wrapper that adds the one behavior
//! `BTreeMap` does not: multiple values sharing one key, with ties broken by
//! insertion order, which the timer index relies on when several connections
//! share the same millisecond deadline.

use std::collections::BTreeMap;

/// An ordered multimap keyed by `K`, preserving insertion order among values
/// that share a key. Supports insert, remove-by-value, and find-minimum in
/// `O(log n)` (the two walks that the timer index needs).
#[derive(Debug)]
pub struct OrderedMap<K: Ord + Copy, V: PartialEq + Copy> {
    buckets: BTreeMap<K, Vec<V>>,
    len: usize,
}

impl<K: Ord + Copy, V: PartialEq + Copy> OrderedMap<K, V> {
    pub fn new() -> Self {
        OrderedMap {
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Inserts `value` under `key`. If other values already share `key`,
    /// `value` is appended after them (insertion order is preserved).
    pub fn insert(&mut self, key: K, value: V) {
        self.buckets.entry(key).or_default().push(value);
        self.len += 1;
    }

    /// Removes the first occurrence of `value` under `key`. Returns whether
    /// anything was removed. Idempotent: removing a value that is not
    /// present is a no-op.
    pub fn remove(&mut self, key: K, value: V) -> bool {
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|v| *v == value) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.len -= 1;
        true
    }

    /// Returns the smallest key currently present, and the oldest value
    /// inserted under it, without removing it.
    pub fn peek_min(&self) -> Option<(K, V)> {
        let (key, bucket) = self.buckets.iter().next()?;
        bucket.first().map(|v| (*key, *v))
    }

    /// Removes and returns the smallest key's oldest value.
    pub fn pop_min(&mut self) -> Option<(K, V)> {
        let (key, value) = self.peek_min()?;
        self.remove(key, value);
        Some((key, value))
    }
}

impl<K: Ord + Copy, V: PartialEq + Copy> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_minimum() {
        let mut m = OrderedMap::new();
        m.insert(30u64, "thirty");
        m.insert(10u64, "ten");
        m.insert(20u64, "twenty");
        assert_eq!(m.peek_min(), Some((10, "ten")));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut m = OrderedMap::new();
        m.insert(5u64, "first");
        m.insert(5u64, "second");
        assert_eq!(m.pop_min(), Some((5, "first")));
        assert_eq!(m.pop_min(), Some((5, "second")));
        assert!(m.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut m = OrderedMap::new();
        m.insert(1u64, "a");
        assert!(m.remove(1, "a"));
        assert!(!m.remove(1, "a"));
        assert!(m.is_empty());
    }

    #[test]
    fn random_permutation_insert_then_delete_in_any_order_empties_the_map() {
        // Deterministic pseudo-shuffle so the test needs no RNG dependency.
        let mut keys: Vec<u64> = (0..257).collect();
        for i in (1..keys.len()).rev() {
            let j = (i * 2654435761u64 as usize + 17) % (i + 1);
            keys.swap(i, j);
        }

        let mut m = OrderedMap::new();
        for &k in &keys {
            m.insert(k, k);
        }
        assert_eq!(m.len(), keys.len());

        let mut delete_order = keys.clone();
        delete_order.reverse();
        for &k in &delete_order {
            assert!(m.remove(k, k));
        }
        assert!(m.is_empty());
    }
}
