//! Usage Ledger
//!
//! Recency-ordered set of resident tiles plus their running byte total. Each
//! tier owns one ledger behind its own mutex.
//!
//! Recency is a monotonically increasing logical tick. Every insert or touch
//! assigns a fresh tick; the oldest tick in the ordered index is the LRU
//! entry, so touch and evict are O(log n).

use crate::cache::entry::TileKey;
use std::collections::{BTreeMap, HashMap};

/// One resident tile
#[derive(Debug, Clone)]
pub struct LedgerEntry<V> {
    /// Byte footprint counted against the budget
    pub cost: u64,
    /// Recency tick; larger is more recent
    pub tick: u64,
    /// Tier-specific payload
    pub value: V,
}

/// Recency index and byte accounting for one tier
#[derive(Debug)]
pub struct UsageLedger<V> {
    entries: HashMap<TileKey, LedgerEntry<V>>,
    by_recency: BTreeMap<u64, TileKey>,
    total_bytes: u64,
    next_tick: u64,
}

impl<V> Default for UsageLedger<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> UsageLedger<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_recency: BTreeMap::new(),
            total_bytes: 0,
            next_tick: 1,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Insert as most recently used, returning the replaced value if any
    pub fn insert(&mut self, key: TileKey, cost: u64, value: V) -> Option<V> {
        let replaced = self.remove(&key).map(|(_, value)| value);

        let tick = self.tick();
        self.by_recency.insert(tick, key.clone());
        self.total_bytes += cost;
        self.entries.insert(key, LedgerEntry { cost, tick, value });

        replaced
    }

    /// Mark as most recently used
    pub fn touch(&mut self, key: &TileKey) -> Option<&V> {
        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.by_recency.remove(&entry.tick);
        entry.tick = tick;
        self.by_recency.insert(tick, key.clone());
        Some(&entry.value)
    }

    /// Look up without changing recency
    pub fn peek(&self, key: &TileKey) -> Option<&LedgerEntry<V>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry, returning its cost and value
    pub fn remove(&mut self, key: &TileKey) -> Option<(u64, V)> {
        let entry = self.entries.remove(key)?;
        self.by_recency.remove(&entry.tick);
        self.total_bytes -= entry.cost;
        Some((entry.cost, entry.value))
    }

    /// Remove and return the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(TileKey, u64, V)> {
        let (_, key) = self.by_recency.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.total_bytes -= entry.cost;
        Some((key, entry.cost, entry.value))
    }

    /// Resident keys with their costs, oldest first
    pub fn keys_lru_order(&self) -> Vec<(TileKey, u64)> {
        self.by_recency
            .values()
            .filter_map(|key| self.entries.get(key).map(|e| (key.clone(), e.cost)))
            .collect()
    }

    /// Remove every entry, oldest first
    pub fn drain(&mut self) -> Vec<(TileKey, u64, V)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(item) = self.pop_lru() {
            drained.push(item);
        }
        drained
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_recency.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the costs of all resident entries
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> TileKey {
        TileKey::new(s).unwrap()
    }

    fn oldest<V>(ledger: &UsageLedger<V>) -> Option<TileKey> {
        ledger.keys_lru_order().into_iter().next().map(|(k, _)| k)
    }

    #[test]
    fn test_insert_and_total() {
        let mut ledger = UsageLedger::new();
        ledger.insert(key("a"), 100, ());
        ledger.insert(key("b"), 50, ());
        assert_eq!(ledger.total_bytes(), 150);
        assert_eq!(ledger.len(), 2);

        // Replacing an entry swaps its cost
        ledger.insert(key("a"), 10, ());
        assert_eq!(ledger.total_bytes(), 60);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_lru_order() {
        let mut ledger = UsageLedger::new();
        for name in ["a", "b", "c"] {
            ledger.insert(key(name), 1, name);
        }
        assert_eq!(oldest(&ledger), Some(key("a")));

        ledger.touch(&key("a"));
        assert_eq!(oldest(&ledger), Some(key("b")));

        let (k, cost, v) = ledger.pop_lru().unwrap();
        assert_eq!((k, cost, v), (key("b"), 1, "b"));

        let order: Vec<_> = ledger.keys_lru_order().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec![key("c"), key("a")]);
    }

    #[test]
    fn test_peek_keeps_recency() {
        let mut ledger = UsageLedger::new();
        ledger.insert(key("a"), 1, ());
        ledger.insert(key("b"), 1, ());
        assert!(ledger.peek(&key("a")).is_some());
        assert_eq!(oldest(&ledger), Some(key("a")));
    }

    #[test]
    fn test_remove_and_drain() {
        let mut ledger = UsageLedger::new();
        ledger.insert(key("a"), 3, ());
        ledger.insert(key("b"), 4, ());
        ledger.insert(key("c"), 5, ());

        assert_eq!(ledger.remove(&key("b")), Some((4, ())));
        assert_eq!(ledger.remove(&key("b")), None);
        assert_eq!(ledger.total_bytes(), 8);

        let drained: Vec<_> = ledger.drain().into_iter().map(|(k, c, _)| (k, c)).collect();
        assert_eq!(drained, vec![(key("a"), 3), (key("c"), 5)]);
        assert!(ledger.is_empty());
        assert_eq!(ledger.total_bytes(), 0);
    }

    #[test]
    fn test_total_matches_sum_after_churn() {
        let mut ledger = UsageLedger::new();
        for i in 0..200u64 {
            ledger.insert(key(&format!("k{}", i % 37)), i, ());
            if i % 5 == 0 {
                ledger.pop_lru();
            }
            if i % 7 == 0 {
                ledger.touch(&key(&format!("k{}", i % 11)));
            }
        }
        let sum: u64 = ledger.keys_lru_order().iter().map(|(_, c)| c).sum();
        assert_eq!(ledger.total_bytes(), sum);
        assert_eq!(ledger.keys_lru_order().len(), ledger.len());
    }
}
