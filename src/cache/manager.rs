//! Cache Instance
//!
//! One instance per cache directory. It owns a memory tier and a disk tier,
//! routes lookups (memory, then disk with promotion), and drives demotion
//! cascades when puts overflow memory.
//!
//! Same-key operations are serialized by a 64-way striped lock. A thread
//! holds at most one stripe at a time: the tiles a put pushes out of memory
//! are demoted after the put's own stripe is released, each under its own
//! stripe. Lock order is stripe → disk ledger → memory ledger.

use crate::cache::entry::{TileKey, TilePayload, KEY_STRIPE_COUNT};
use crate::cache::metrics::{CacheMetrics, CacheStatsSnapshot};
use crate::cache::storage::{
    Demotion, DiskTier, InsertOutcome, MemoryTier, RehydrateReport, TierStorage,
};
use crate::cache::tier::Residency;
use crate::cache::{CacheLookup, TileCache};
use crate::config::{Budgets, CacheConfig};
use crate::error::{Error, ErrorAction, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

// =============================================================================
// Instance State
// =============================================================================

/// Lifecycle of a cache instance: `Uninitialized → Active → Cleared → Active`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Uninitialized,
    Active,
    Cleared,
}

// =============================================================================
// Cache Instance
// =============================================================================

/// Two-tier cache bound to one directory
pub struct CacheInstance {
    dir: PathBuf,
    config: CacheConfig,
    memory: MemoryTier,
    disk: DiskTier,
    key_locks: Box<[Mutex<()>]>,
    state: RwLock<InstanceState>,
    metrics: Arc<CacheMetrics>,
}

impl CacheInstance {
    /// Create an instance for `dir`; it serves requests once activated
    pub fn new(dir: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let dir = dir.into();
        let budgets = config.budgets();
        let metrics = Arc::new(CacheMetrics::new());

        Self {
            memory: MemoryTier::new(budgets.memory_bytes, Arc::clone(&metrics)),
            disk: DiskTier::new(
                dir.clone(),
                budgets.disk_bytes,
                config.staleness_source.clone(),
                Arc::clone(&metrics),
            ),
            key_locks: (0..KEY_STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
            state: RwLock::new(InstanceState::Uninitialized),
            dir,
            config,
            metrics,
        }
    }

    /// Create the directory if needed and start serving
    pub fn activate(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state == InstanceState::Active {
            return Ok(());
        }
        self.disk.create_dir()?;
        if *state == InstanceState::Cleared {
            // Files kept by clear(false) are adopted again
            self.disk.invalidate();
        }
        *state = InstanceState::Active;

        info!(
            dir = %self.dir.display(),
            memory_budget = self.memory.budget_bytes(),
            disk_budget = self.disk.budget_bytes(),
            "Activated tile cache instance"
        );
        Ok(())
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            memory_bytes: self.memory.budget_bytes(),
            disk_bytes: self.disk.budget_bytes(),
        }
    }

    /// Whether the disk ledger has been rebuilt from the directory
    pub fn is_initialized(&self) -> bool {
        self.disk.is_initialized()
    }

    fn ensure_active(&self) -> Result<()> {
        match *self.state.read() {
            InstanceState::Active => Ok(()),
            InstanceState::Cleared => Err(Error::InstanceCleared {
                dir: self.dir.display().to_string(),
            }),
            InstanceState::Uninitialized => Err(Error::Internal(format!(
                "cache instance for {} was never activated",
                self.dir.display()
            ))),
        }
    }

    fn stripe(&self, key: &TileKey) -> &Mutex<()> {
        &self.key_locks[key.shard_index()]
    }

    // =========================================================================
    // Lookup and Insert
    // =========================================================================

    fn lookup(&self, key: &TileKey, not_before: Option<SystemTime>) -> Result<CacheLookup> {
        // Read before the state check so a racing clear supersedes the insert
        let epoch = self.memory.epoch();
        self.ensure_active()?;
        let guard = self.stripe(key).lock();

        if let Some(payload) = self.memory.get(key, not_before) {
            return Ok(CacheLookup::Hit {
                payload,
                residency: Residency::InMemory,
            });
        }

        let Some((payload, cached_at)) = self.disk.try_load(key, not_before)? else {
            return Ok(CacheLookup::Miss);
        };

        let outcome = self.disk.hand_over(key, || {
            self.memory.insert(key.clone(), payload.clone(), cached_at, epoch)
        });
        drop(guard);

        debug!(key = %key, bytes = payload.cost(), "Promoted disk tile to memory");
        self.finish_insert(outcome);

        Ok(CacheLookup::Hit {
            payload,
            residency: Residency::OnDisk,
        })
    }

    /// Insert a fresh tile; discarded if a clear bumped the epoch since
    /// `epoch` was read
    fn store(&self, key: TileKey, payload: TilePayload, epoch: u64) {
        let cost = payload.cost();
        let guard = self.stripe(&key).lock();

        let outcome = self.disk.hand_over(&key, || {
            self.memory.insert(key.clone(), payload, SystemTime::now(), epoch)
        });
        drop(guard);

        debug!(key = %key, bytes = cost, "Cached tile in memory");
        self.finish_insert(outcome);
    }

    fn finish_insert(&self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Stored { demotions } => {
                self.demote_all(demotions);
            }
            InsertOutcome::Superseded => debug!(dir = %self.dir.display(), "Insert superseded by clear"),
        }
    }

    /// Write demoted tiles to disk, each under its own key stripe
    fn demote_all(&self, demotions: Vec<Demotion>) -> usize {
        let mut written = 0;
        for demotion in &demotions {
            if self.demote(demotion) {
                written += 1;
            }
        }
        written
    }

    fn demote(&self, demotion: &Demotion) -> bool {
        let Demotion {
            key,
            payload,
            cached_at,
            generation,
        } = demotion;
        let _guard = self.stripe(key).lock();

        if !self.memory.is_pending(key, *generation) {
            return false;
        }

        let cost = payload.cost();
        if cost > self.disk.budget_bytes() {
            self.memory.complete_demotion(key, *generation);
            self.metrics.disk.record_eviction();
            debug!(key = %key, bytes = cost, "Dropped tile larger than the disk budget");
            return false;
        }

        if let Err(e) = self.disk.write_files(key, payload, *cached_at) {
            match e.action() {
                ErrorAction::DropTile | ErrorAction::TreatAsMiss => {
                    warn!(key = %key, bytes = cost, "Dropping tile after failed demotion: {}", e)
                }
                ErrorAction::Fail => {
                    error!(key = %key, bytes = cost, "Demotion failed unexpectedly, dropping tile: {}", e)
                }
            }
            self.memory.abandon_demotion(key, *generation);
            return false;
        }

        self.disk
            .admit(key, cost, *cached_at, || self.memory.complete_demotion(key, *generation))
    }

    /// Return the cached tile, or decode it with `loader` and cache the result
    ///
    /// The residency is where the tile was found, `Absent` when it was just
    /// decoded. The loader runs without any cache lock held, so two threads
    /// missing the same key may both decode it; the later put wins.
    pub fn get_or_insert_with<F>(&self, key: &TileKey, loader: F) -> Result<(TilePayload, Residency)>
    where
        F: FnOnce() -> Result<TilePayload>,
    {
        if let CacheLookup::Hit { payload, residency } = self.get(key)? {
            return Ok((payload, residency));
        }

        let payload = loader()?;
        self.put(key.clone(), payload.clone())?;
        Ok((payload, Residency::Absent))
    }

    /// Tier currently holding `key`
    pub fn residency(&self, key: &TileKey) -> Residency {
        let _guard = self.stripe(key).lock();
        if self.memory.contains(key) {
            Residency::InMemory
        } else if self.disk.contains(key) {
            Residency::OnDisk
        } else {
            Residency::Absent
        }
    }

    // =========================================================================
    // Budgets and Maintenance
    // =========================================================================

    /// Apply new budgets, demoting and deleting whatever no longer fits
    pub fn set_budgets(&self, budgets: Budgets) {
        let deleted = self.disk.set_budget(budgets.disk_bytes);
        let demotions = self.memory.set_budget(budgets.memory_bytes);
        let demoted = self.demote_all(demotions);

        info!(
            dir = %self.dir.display(),
            memory_budget = budgets.memory_bytes,
            disk_budget = budgets.disk_bytes,
            demoted,
            deleted,
            "Resized tile cache"
        );
    }

    /// Stop retaining tiles: both budgets drop to zero
    pub fn disable(&self) {
        self.set_budgets(Budgets::disabled());
    }

    /// Rescan the directory, dropping stale and corrupt files
    pub fn rehydrate(&self) -> Result<RehydrateReport> {
        // Tiles in memory may have demotion files in progress
        self.disk.rehydrate(&|key| !self.memory.contains(key))
    }

    /// Disk-resident keys with costs, oldest first
    pub fn disk_entries(&self) -> Vec<(TileKey, u64)> {
        self.disk.entries_lru()
    }

    /// Memory-resident keys with costs, oldest first
    pub fn memory_entries(&self) -> Vec<(TileKey, u64)> {
        self.memory.entries_lru()
    }

    /// Both totals read under the disk lock, so a demotion in progress is
    /// counted exactly once
    pub fn usage(&self) -> (u64, u64) {
        self.disk
            .with_usage(|disk_bytes, _| (self.memory.used_bytes(), disk_bytes))
    }
}

impl TileCache for CacheInstance {
    fn get(&self, key: &TileKey) -> Result<CacheLookup> {
        self.lookup(key, None)
    }

    fn get_checked(&self, key: &TileKey, source: &Path) -> Result<CacheLookup> {
        let modified = std::fs::metadata(source).and_then(|m| m.modified()).ok();
        self.lookup(key, modified)
    }

    fn put(&self, key: TileKey, payload: TilePayload) -> Result<()> {
        let epoch = self.memory.epoch();
        self.ensure_active()?;
        self.store(key, payload, epoch);
        Ok(())
    }

    fn remove(&self, key: &TileKey) -> Result<bool> {
        self.ensure_active()?;
        let _guard = self.stripe(key).lock();
        let in_memory = self.memory.remove(key)?;
        let on_disk = self.disk.remove(key)?;
        Ok(in_memory.is_some() || on_disk.is_some())
    }

    fn used_memory(&self) -> u64 {
        self.memory.used_bytes()
    }

    fn used_disk(&self) -> u64 {
        self.disk.used_bytes()
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.disk.with_usage(|disk_bytes, disk_entries| {
            self.metrics.snapshot(
                self.memory.used_bytes(),
                self.memory.entry_count(),
                disk_bytes,
                disk_entries,
            )
        })
    }

    fn flush(&self) -> Result<usize> {
        self.ensure_active()?;
        let demotions = self.memory.drain_for_flush();
        let pending = demotions.len();
        let written = self.demote_all(demotions);

        info!(dir = %self.dir.display(), written, dropped = pending - written, "Flushed memory tiles to disk");
        Ok(written)
    }

    fn clear(&self, delete_dir: bool) -> Result<()> {
        *self.state.write() = InstanceState::Cleared;

        let mut freed_memory = 0;
        let freed_disk = self
            .disk
            .clear(delete_dir, || freed_memory = self.memory.clear())?;

        info!(
            dir = %self.dir.display(),
            freed_memory,
            freed_disk,
            delete_dir,
            "Cleared tile cache instance"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::test_support::rgb_tile;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn key(s: &str) -> TileKey {
        TileKey::new(s).unwrap()
    }

    fn instance(dir: &TempDir, memory: &str, disk: &str) -> CacheInstance {
        let config = CacheConfig::new(dir.path())
            .with_memory_budget(memory)
            .with_disk_budget(disk);
        let instance = CacheInstance::new(config.cache_dir(), config);
        instance.activate().unwrap();
        instance
    }

    #[test]
    fn test_requires_activation() {
        let dir = TempDir::new().unwrap();
        let cache = CacheInstance::new(dir.path().join("x"), CacheConfig::new(dir.path()));
        assert_eq!(cache.state(), InstanceState::Uninitialized);
        assert_matches!(cache.get(&key("a")), Err(Error::Internal(_)));
    }

    #[test]
    fn test_put_get_memory_hit() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1k", "1m");
        cache.put(key("a"), rgb_tile(10, 3)).unwrap();

        let hit = cache.get(&key("a")).unwrap();
        assert_matches!(hit, CacheLookup::Hit { residency: Residency::InMemory, .. });
        assert_eq!(cache.used_memory(), 300);
        assert_eq!(cache.used_disk(), 0);
        assert_matches!(cache.get(&key("missing")).unwrap(), CacheLookup::Miss);
    }

    #[test]
    fn test_overflow_demotes_and_promotes() {
        let dir = TempDir::new().unwrap();
        // 700 bytes of memory holds two 300-byte tiles
        let cache = instance(&dir, "700", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();
        cache.put(key("c"), rgb_tile(10, 3)).unwrap();

        assert_eq!(cache.residency(&key("a")), Residency::OnDisk);
        assert_eq!(cache.usage(), (600, 300));

        let hit = cache.get(&key("a")).unwrap();
        assert_matches!(hit, CacheLookup::Hit { residency: Residency::OnDisk, .. });
        assert_eq!(hit.payload().unwrap().data()[0], 1);

        // Promotion pushed "b" out
        assert_eq!(cache.residency(&key("a")), Residency::InMemory);
        assert_eq!(cache.residency(&key("b")), Residency::OnDisk);
        assert_eq!(cache.usage(), (600, 300));

        let stats = cache.stats();
        assert_eq!(stats.demotions(), 2);
        assert_eq!(stats.promotions(), 1);
    }

    #[test]
    fn test_put_replaces_disk_copy() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "300", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();
        assert_eq!(cache.residency(&key("a")), Residency::OnDisk);

        cache.put(key("a"), rgb_tile(10, 9)).unwrap();
        assert_eq!(cache.residency(&key("a")), Residency::InMemory);
        assert_eq!(cache.disk_entries(), vec![(key("b"), 300)]);
        assert_eq!(cache.get(&key("a")).unwrap().payload().unwrap().data()[0], 9);
    }

    #[test]
    fn test_remove_from_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "300", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();

        assert!(cache.remove(&key("a")).unwrap());
        assert!(cache.remove(&key("b")).unwrap());
        assert!(!cache.remove(&key("b")).unwrap());
        assert_eq!(cache.usage(), (0, 0));
    }

    #[test]
    fn test_flush_moves_memory_to_disk() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1m", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();

        assert_eq!(cache.flush().unwrap(), 2);
        assert_eq!(cache.usage(), (0, 600));
        assert_eq!(cache.disk_entries(), vec![(key("a"), 300), (key("b"), 300)]);
    }

    #[test]
    fn test_disable_drops_everything() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1m", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.flush().unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();

        cache.disable();
        assert_eq!(cache.usage(), (0, 0));

        cache.put(key("c"), rgb_tile(10, 3)).unwrap();
        assert_eq!(cache.usage(), (0, 0));
        assert_matches!(cache.get(&key("c")).unwrap(), CacheLookup::Miss);
    }

    #[test]
    fn test_clear_blocks_until_reactivated() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1m", "1m");
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();

        cache.clear(true).unwrap();
        assert_eq!(cache.state(), InstanceState::Cleared);
        assert!(!cache.dir().exists());
        assert_eq!(cache.usage(), (0, 0));
        assert_matches!(cache.put(key("a"), rgb_tile(10, 1)), Err(Error::InstanceCleared { .. }));

        cache.activate().unwrap();
        assert!(cache.dir().exists());
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        assert_eq!(cache.used_memory(), 300);
    }

    #[test]
    fn test_put_that_started_before_clear_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1m", "1m");

        // A put that passed its state check just before a clear landed
        let epoch = cache.memory.epoch();
        cache.clear(true).unwrap();
        cache.activate().unwrap();
        cache.store(key("a"), rgb_tile(10, 1), epoch);

        assert_eq!(cache.usage(), (0, 0));
        assert_eq!(cache.residency(&key("a")), Residency::Absent);

        // Puts issued after the reactivation use the new epoch
        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        assert_eq!(cache.used_memory(), 300);
    }

    #[test]
    fn test_get_or_insert_with() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "1m", "1m");
        let mut calls = 0;

        let (_, found) = cache
            .get_or_insert_with(&key("a"), || {
                calls += 1;
                Ok(rgb_tile(4, 1))
            })
            .unwrap();
        assert_eq!(found, Residency::Absent);

        let (payload, found) = cache.get_or_insert_with(&key("a"), || unreachable!()).unwrap();
        assert_eq!(found, Residency::InMemory);
        assert_eq!(payload.cost(), 48);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_write_failure_drops_tile() {
        let dir = TempDir::new().unwrap();
        let cache = instance(&dir, "300", "1m");
        std::fs::remove_dir_all(cache.dir()).unwrap();

        cache.put(key("a"), rgb_tile(10, 1)).unwrap();
        cache.put(key("b"), rgb_tile(10, 2)).unwrap();

        assert_eq!(cache.residency(&key("a")), Residency::Absent);
        assert_eq!(cache.usage(), (300, 0));
        assert_eq!(cache.stats().memory.write_failures, 1);
    }
}
