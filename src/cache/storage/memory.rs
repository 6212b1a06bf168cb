//! Memory Tier
//!
//! Bounded key → payload store. When an insert pushes the ledger over budget,
//! least-recently-used tiles move to an in-flight set and are handed to the
//! caller as [`Demotion`]s. In-flight tiles stay readable and stay counted in
//! [`MemoryTier::used_bytes`] until the disk tier confirms it has taken them.

use crate::cache::entry::{TileKey, TilePayload};
use crate::cache::lru::UsageLedger;
use crate::cache::metrics::CacheMetrics;
use crate::cache::storage::TierStorage;
use crate::cache::tier::Residency;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: TilePayload,
    /// When the payload was first produced by the caller's decode
    cached_at: SystemTime,
}

#[derive(Debug)]
struct InFlight {
    entry: MemoryEntry,
    generation: u64,
}

/// A tile evicted from memory that must be written to disk
#[derive(Debug, Clone)]
pub struct Demotion {
    pub key: TileKey,
    pub payload: TilePayload,
    pub cached_at: SystemTime,
    /// Identifies this hand-off; a re-put or clear invalidates it
    pub generation: u64,
}

/// Result of [`MemoryTier::insert`]
#[derive(Debug)]
pub enum InsertOutcome {
    /// Stored; the listed tiles were pushed out and await demotion
    Stored { demotions: Vec<Demotion> },
    /// A clear happened after the operation started; nothing was stored
    Superseded,
}

enum Lookup {
    Hit(TilePayload),
    Miss,
    Stale,
}

impl From<Option<TilePayload>> for Lookup {
    fn from(payload: Option<TilePayload>) -> Self {
        payload.map_or(Lookup::Miss, Lookup::Hit)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    ledger: UsageLedger<MemoryEntry>,
    in_flight: HashMap<TileKey, InFlight>,
    in_flight_bytes: u64,
    next_generation: u64,
    epoch: u64,
}

impl MemoryState {
    fn cancel_in_flight(&mut self, key: &TileKey) -> Option<u64> {
        let flight = self.in_flight.remove(key)?;
        let cost = flight.entry.payload.cost();
        self.in_flight_bytes -= cost;
        Some(cost)
    }

    fn start_demotion(&mut self, key: TileKey, entry: MemoryEntry) -> Demotion {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.in_flight_bytes += entry.payload.cost();

        let demotion = Demotion {
            key: key.clone(),
            payload: entry.payload.clone(),
            cached_at: entry.cached_at,
            generation,
        };
        self.in_flight.insert(key, InFlight { entry, generation });
        demotion
    }

    fn evict_over(&mut self, budget: u64) -> Vec<Demotion> {
        let mut demotions = Vec::new();
        while self.ledger.total_bytes() > budget {
            let Some((key, _, entry)) = self.ledger.pop_lru() else {
                break;
            };
            demotions.push(self.start_demotion(key, entry));
        }
        demotions
    }
}

// =============================================================================
// Memory Tier
// =============================================================================

/// In-memory tier with LRU demotion
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    budget: AtomicU64,
    metrics: Arc<CacheMetrics>,
}

impl MemoryTier {
    pub fn new(budget_bytes: u64, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            budget: AtomicU64::new(budget_bytes),
            metrics,
        }
    }

    /// Current clear epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Look up a tile and mark it most recently used
    ///
    /// A tile cached before `not_before` is stale: it is dropped and the
    /// lookup misses.
    pub fn get(&self, key: &TileKey, not_before: Option<SystemTime>) -> Option<TilePayload> {
        let mut state = self.state.lock();
        let is_stale = |entry: &MemoryEntry| not_before.is_some_and(|t| entry.cached_at < t);

        let lookup = match state.ledger.peek(key).map(|e| is_stale(&e.value)) {
            Some(true) => {
                state.ledger.remove(key);
                Lookup::Stale
            }
            Some(false) => Lookup::from(state.ledger.touch(key).map(|e| e.payload.clone())),
            None => match state.in_flight.get(key).map(|f| is_stale(&f.entry)) {
                Some(true) => {
                    state.cancel_in_flight(key);
                    Lookup::Stale
                }
                Some(false) => Lookup::from(state.in_flight.get(key).map(|f| f.entry.payload.clone())),
                None => Lookup::Miss,
            },
        };
        drop(state);

        match lookup {
            Lookup::Hit(payload) => {
                self.metrics.memory.record_hit();
                Some(payload)
            }
            Lookup::Miss => {
                self.metrics.memory.record_miss();
                None
            }
            Lookup::Stale => {
                debug!(key = %key, "Dropped stale memory tile");
                self.metrics.memory.record_stale();
                self.metrics.memory.record_miss();
                None
            }
        }
    }

    /// Insert a tile as most recently used and demote until within budget
    ///
    /// Replaces any resident or in-flight copy of `key`. The inserted tile is
    /// itself demoted when it alone exceeds the budget.
    pub fn insert(
        &self,
        key: TileKey,
        payload: TilePayload,
        cached_at: SystemTime,
        epoch: u64,
    ) -> InsertOutcome {
        let budget = self.budget.load(Ordering::Acquire);
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return InsertOutcome::Superseded;
        }

        state.cancel_in_flight(&key);
        let cost = payload.cost();
        state.ledger.insert(key.clone(), cost, MemoryEntry { payload, cached_at });
        let demotions = state.evict_over(budget);
        drop(state);

        self.metrics.memory.record_insertion();
        for demotion in &demotions {
            self.metrics.memory.record_eviction();
            debug!(
                key = %demotion.key,
                bytes = demotion.payload.cost(),
                trigger = %key,
                "Demoting memory tile"
            );
        }

        InsertOutcome::Stored { demotions }
    }

    /// Check that a demotion is still wanted
    pub fn is_pending(&self, key: &TileKey, generation: u64) -> bool {
        self.state
            .lock()
            .in_flight
            .get(key)
            .is_some_and(|f| f.generation == generation)
    }

    /// Release an in-flight tile once the disk tier has taken it
    ///
    /// Returns false when the hand-off was cancelled by a re-put, remove or
    /// clear; the caller must then discard what it wrote.
    pub fn complete_demotion(&self, key: &TileKey, generation: u64) -> bool {
        let mut state = self.state.lock();
        let pending = state
            .in_flight
            .get(key)
            .is_some_and(|f| f.generation == generation);
        if pending {
            state.cancel_in_flight(key);
        }
        pending
    }

    /// Drop an in-flight tile whose demotion failed
    pub fn abandon_demotion(&self, key: &TileKey, generation: u64) -> bool {
        let dropped = self.complete_demotion(key, generation);
        if dropped {
            self.metrics.memory.record_write_failure();
        }
        dropped
    }

    /// Move every resident tile to the in-flight set, oldest first
    pub fn drain_for_flush(&self) -> Vec<Demotion> {
        let mut state = self.state.lock();
        let drained = state.ledger.drain();
        let demotions: Vec<_> = drained
            .into_iter()
            .map(|(key, _, entry)| state.start_demotion(key, entry))
            .collect();
        drop(state);

        for _ in &demotions {
            self.metrics.memory.record_eviction();
        }
        demotions
    }

    /// Change the budget, demoting whatever no longer fits
    pub fn set_budget(&self, budget_bytes: u64) -> Vec<Demotion> {
        self.budget.store(budget_bytes, Ordering::Release);
        let demotions = self.state.lock().evict_over(budget_bytes);
        for _ in &demotions {
            self.metrics.memory.record_eviction();
        }
        demotions
    }

    /// Drop every tile, cancel pending demotions and start a new epoch
    pub fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        let freed = state.ledger.total_bytes() + state.in_flight_bytes;
        state.ledger.clear();
        state.in_flight.clear();
        state.in_flight_bytes = 0;
        state.epoch += 1;
        freed
    }

    /// Resident keys with costs, oldest first (in-flight tiles excluded)
    pub fn entries_lru(&self) -> Vec<(TileKey, u64)> {
        self.state.lock().ledger.keys_lru_order()
    }

    /// Number of tiles awaiting demotion
    pub fn pending_demotions(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl TierStorage for MemoryTier {
    fn residency(&self) -> Residency {
        Residency::InMemory
    }

    fn contains(&self, key: &TileKey) -> bool {
        let state = self.state.lock();
        state.ledger.contains(key) || state.in_flight.contains_key(key)
    }

    fn remove(&self, key: &TileKey) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        let resident = state.ledger.remove(key).map(|(cost, _)| cost);
        let pending = state.cancel_in_flight(key);
        Ok(resident.or(pending))
    }

    fn used_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.ledger.total_bytes() + state.in_flight_bytes
    }

    fn entry_count(&self) -> usize {
        let state = self.state.lock();
        state.ledger.len() + state.in_flight.len()
    }

    fn budget_bytes(&self) -> u64 {
        self.budget.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::test_support::rgb_tile;
    use std::time::Duration;

    fn key(s: &str) -> TileKey {
        TileKey::new(s).unwrap()
    }

    fn tier(budget: u64) -> MemoryTier {
        MemoryTier::new(budget, Arc::new(CacheMetrics::new()))
    }

    fn demotions(outcome: InsertOutcome) -> Vec<Demotion> {
        match outcome {
            InsertOutcome::Stored { demotions } => demotions,
            InsertOutcome::Superseded => panic!("insert superseded"),
        }
    }

    #[test]
    fn test_insert_within_budget() {
        let memory = tier(1000);
        let now = SystemTime::now();
        // 10x10x3 = 300 bytes
        assert!(demotions(memory.insert(key("a"), rgb_tile(10, 1), now, 0)).is_empty());
        assert!(demotions(memory.insert(key("b"), rgb_tile(10, 2), now, 0)).is_empty());
        assert_eq!(memory.used_bytes(), 600);
        assert_eq!(memory.get(&key("a"), None).unwrap().data()[0], 1);
    }

    #[test]
    fn test_overflow_demotes_lru_until_within_budget() {
        let memory = tier(1000);
        let now = SystemTime::now();
        for name in ["a", "b", "c"] {
            memory.insert(key(name), rgb_tile(10, 0), now, 0);
        }
        // Touch "a" so "b" is the oldest
        memory.get(&key("a"), None);

        let out = demotions(memory.insert(key("d"), rgb_tile(10, 0), now, 0));
        let keys: Vec<_> = out.iter().map(|d| d.key.clone()).collect();
        assert_eq!(keys, vec![key("b")]);

        // In-flight bytes still count until the disk tier confirms
        assert_eq!(memory.used_bytes(), 1200);
        assert!(memory.get(&key("b"), None).is_some());

        assert!(memory.complete_demotion(&out[0].key, out[0].generation));
        assert_eq!(memory.used_bytes(), 900);
        assert!(!memory.contains(&key("b")));
    }

    #[test]
    fn test_oversized_tile_is_demoted_immediately() {
        let memory = tier(100);
        let out = demotions(memory.insert(key("big"), rgb_tile(10, 0), SystemTime::now(), 0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, key("big"));
    }

    #[test]
    fn test_reput_cancels_pending_demotion() {
        let memory = tier(300);
        let now = SystemTime::now();
        memory.insert(key("a"), rgb_tile(10, 0), now, 0);
        let out = demotions(memory.insert(key("b"), rgb_tile(10, 0), now, 0));
        assert_eq!(out[0].key, key("a"));

        memory.insert(key("a"), rgb_tile(10, 9), now, 0);
        assert!(!memory.is_pending(&key("a"), out[0].generation));
        assert!(!memory.complete_demotion(&key("a"), out[0].generation));
    }

    #[test]
    fn test_clear_supersedes_older_epoch() {
        let memory = tier(1000);
        let epoch = memory.epoch();
        memory.insert(key("a"), rgb_tile(10, 0), SystemTime::now(), epoch);
        assert_eq!(memory.clear(), 300);
        assert_eq!(memory.used_bytes(), 0);

        assert!(matches!(
            memory.insert(key("b"), rgb_tile(10, 0), SystemTime::now(), epoch),
            InsertOutcome::Superseded
        ));
        assert_eq!(memory.entry_count(), 0);
    }

    #[test]
    fn test_stale_entry_is_dropped() {
        let memory = tier(1000);
        let cached_at = SystemTime::now() - Duration::from_secs(60);
        memory.insert(key("a"), rgb_tile(10, 0), cached_at, 0);

        assert!(memory.get(&key("a"), Some(cached_at - Duration::from_secs(1))).is_some());
        assert!(memory.get(&key("a"), Some(SystemTime::now())).is_none());
        assert!(!memory.contains(&key("a")));
        assert_eq!(memory.used_bytes(), 0);
    }

    #[test]
    fn test_drain_for_flush_and_budget() {
        let memory = tier(1000);
        let now = SystemTime::now();
        memory.insert(key("a"), rgb_tile(10, 0), now, 0);
        memory.insert(key("b"), rgb_tile(10, 0), now, 0);

        assert_eq!(memory.set_budget(300).len(), 1);
        let flushed = memory.drain_for_flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(memory.pending_demotions(), 2);
        assert!(memory.entries_lru().is_empty());

        assert_eq!(memory.remove(&key("a")).unwrap(), Some(300));
        assert_eq!(memory.remove(&key("a")).unwrap(), None);
    }
}
