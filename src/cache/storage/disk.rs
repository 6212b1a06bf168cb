//! Disk Tier
//!
//! Persists demoted tiles as `<base>.d3rcache` (raw samples) plus
//! `<base>.info` (metadata sidecar) in the instance directory, where `<base>`
//! is the percent-encoded tile key.
//!
//! The ledger is rebuilt lazily from the directory on first use, so byte
//! accounting survives restarts. File reads and writes happen outside the
//! ledger lock; only deletions of evicted files run under it.
//!
//! Timestamps carry meaning:
//! - the sidecar mtime is the moment the tile was first cached, compared
//!   against the staleness reference
//! - the payload mtime is the demotion time, used as recency on rehydration

use crate::cache::cost::sample_width_for;
use crate::cache::entry::{TileKey, TilePayload};
use crate::cache::lru::UsageLedger;
use crate::cache::metrics::CacheMetrics;
use crate::cache::sidecar::{self, SIDECAR_EXTENSION};
use crate::cache::storage::{TierStorage, PAYLOAD_EXTENSION};
use crate::cache::tier::Residency;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Suffix of partially written files
const TEMP_EXTENSION: &str = "tmp";

// =============================================================================
// Ledger State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct DiskEntry {
    cached_at: SystemTime,
}

#[derive(Debug, Default)]
struct DiskState {
    ledger: UsageLedger<DiskEntry>,
    initialized: bool,
    /// Keys whose files are being written; rescans leave them alone
    writing: HashSet<TileKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Stale,
    Corrupt,
}

/// Outcome of a directory scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RehydrateReport {
    /// Tiles adopted into the ledger
    pub adopted: usize,
    /// Bytes of adopted tiles still resident after budget enforcement
    pub adopted_bytes: u64,
    /// Tiles deleted because their source changed after caching
    pub stale: usize,
    /// Tiles deleted because their files were unreadable or inconsistent
    pub corrupt: usize,
    /// Lone payload or sidecar files deleted
    pub orphaned: usize,
    /// Adopted tiles deleted to get back under budget
    pub evicted: usize,
}

impl RehydrateReport {
    pub fn discarded(&self) -> usize {
        self.stale + self.corrupt + self.orphaned
    }
}

// =============================================================================
// Disk Tier
// =============================================================================

/// Bounded, restart-coherent tile store
pub struct DiskTier {
    dir: PathBuf,
    state: Mutex<DiskState>,
    budget: AtomicU64,
    staleness_source: Option<PathBuf>,
    metrics: Arc<CacheMetrics>,
}

impl DiskTier {
    pub fn new(
        dir: impl Into<PathBuf>,
        budget_bytes: u64,
        staleness_source: Option<PathBuf>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(DiskState::default()),
            budget: AtomicU64::new(budget_bytes),
            staleness_source,
            metrics,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the ledger reflects the directory contents
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Rebuild the ledger from the directory on next use
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.ledger.clear();
        state.initialized = false;
    }

    /// Create the directory if needed
    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::DirectoryUnavailable {
            dir: self.dir.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn payload_path(&self, key: &TileKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.file_base(), PAYLOAD_EXTENSION))
    }

    fn sidecar_path(&self, key: &TileKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key.file_base(), SIDECAR_EXTENSION))
    }

    /// Modification time of the configured staleness source
    pub fn source_modified(&self) -> Option<SystemTime> {
        let source = self.staleness_source.as_ref()?;
        fs::metadata(source).and_then(|m| m.modified()).ok()
    }

    // =========================================================================
    // Rehydration
    // =========================================================================

    fn ensure_initialized(&self, state: &mut DiskState) {
        if state.initialized {
            return;
        }
        if let Err(e) = self.rehydrate_locked(state, &|_| true) {
            warn!(dir = %self.dir.display(), "Disk cache scan failed, starting empty: {}", e);
            state.ledger.clear();
            state.initialized = true;
        }
    }

    /// Rescan the directory and rebuild the ledger
    ///
    /// Keys for which `adopt` returns false, and keys whose files are still
    /// being written, are left untouched on disk and kept out of the ledger.
    pub fn rehydrate(&self, adopt: &dyn Fn(&TileKey) -> bool) -> Result<RehydrateReport> {
        let mut state = self.state.lock();
        self.rehydrate_locked(&mut state, adopt)
    }

    fn rehydrate_locked(
        &self,
        state: &mut DiskState,
        adopt: &dyn Fn(&TileKey) -> bool,
    ) -> Result<RehydrateReport> {
        let mut report = RehydrateReport::default();
        state.ledger.clear();

        if !self.dir.is_dir() {
            state.initialized = true;
            return Ok(report);
        }

        let writing = state.writing.clone();
        let held = |base: &str| {
            TileKey::from_file_base(base).is_some_and(|key| writing.contains(&key) || !adopt(&key))
        };

        // `<base>.<ext>.tmp`: the stem still carries the final extension
        for (stem, leftover) in self.scan(TEMP_EXTENSION)? {
            let base = Path::new(&stem).file_stem().and_then(|b| b.to_str()).unwrap_or_default();
            if !held(base) {
                remove_file_quietly(&leftover);
            }
        }

        let mut sidecars: HashMap<String, PathBuf> = self.scan(SIDECAR_EXTENSION)?.into_iter().collect();
        let source_modified = self.source_modified();
        let mut candidates = Vec::new();

        for (base, payload_path) in self.scan(PAYLOAD_EXTENSION)? {
            if held(&base) {
                sidecars.remove(&base);
                continue;
            }
            let Some(sidecar_path) = sidecars.remove(&base) else {
                remove_file_quietly(&payload_path);
                report.orphaned += 1;
                continue;
            };

            let key = TileKey::from_file_base(&base);
            match inspect_pair(key, &payload_path, &sidecar_path, source_modified) {
                Ok(candidate) => candidates.push(candidate),
                Err(discard) => {
                    remove_file_quietly(&payload_path);
                    remove_file_quietly(&sidecar_path);
                    match discard {
                        Discard::Stale => {
                            report.stale += 1;
                            self.metrics.disk.record_stale();
                        }
                        Discard::Corrupt => {
                            report.corrupt += 1;
                            self.metrics.disk.record_corrupt();
                        }
                    }
                }
            }
        }

        for (base, sidecar_path) in sidecars {
            if !held(&base) {
                remove_file_quietly(&sidecar_path);
                report.orphaned += 1;
            }
        }

        // Oldest demotion first so it ranks least recently used
        candidates.sort_by(|a, b| (a.demoted_at, &a.key).cmp(&(b.demoted_at, &b.key)));
        report.adopted = candidates.len();
        for candidate in candidates {
            state.ledger.insert(
                candidate.key,
                candidate.cost,
                DiskEntry {
                    cached_at: candidate.cached_at,
                },
            );
        }

        report.evicted = self.evict_over_budget(state);
        report.adopted_bytes = state.ledger.total_bytes();
        state.initialized = true;

        info!(
            dir = %self.dir.display(),
            adopted = report.adopted,
            bytes = report.adopted_bytes,
            stale = report.stale,
            corrupt = report.corrupt,
            orphaned = report.orphaned,
            evicted = report.evicted,
            "Rehydrated disk cache"
        );
        Ok(report)
    }

    /// Files in the cache directory with the given extension, keyed by stem
    fn scan(&self, extension: &str) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.dir.to_str().ok_or_else(|| Error::DirectoryUnavailable {
            dir: self.dir.display().to_string(),
            reason: "path is not valid UTF-8".into(),
        })?;
        let pattern = format!("{}/*.{}", glob::Pattern::escape(dir), extension);
        let paths = glob::glob(&pattern).map_err(|e| Error::Internal(format!("bad scan pattern: {}", e)))?;

        let mut found = Vec::new();
        for path in paths {
            let path = match path {
                Ok(path) => path,
                Err(e) => {
                    warn!(dir = %self.dir.display(), "Unreadable cache entry: {}", e);
                    continue;
                }
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            found.push((stem.to_string(), path));
        }
        Ok(found)
    }

    fn evict_over_budget(&self, state: &mut DiskState) -> usize {
        let budget = self.budget.load(Ordering::Acquire);
        let mut evicted = 0;
        while state.ledger.total_bytes() > budget {
            let Some((key, cost, _)) = state.ledger.pop_lru() else {
                break;
            };
            self.delete_files(&key);
            self.metrics.disk.record_eviction();
            debug!(key = %key, bytes = cost, "Evicted disk tile");
            evicted += 1;
        }
        evicted
    }

    // =========================================================================
    // Demotion
    // =========================================================================

    /// Write both files for a tile, without touching the ledger
    ///
    /// Files land under temporary names and are renamed into place, so a
    /// crash never leaves a half-written payload that rehydration would adopt.
    /// The key stays marked as in progress until [`DiskTier::admit`] runs.
    pub fn write_files(&self, key: &TileKey, payload: &TilePayload, cached_at: SystemTime) -> Result<()> {
        self.state.lock().writing.insert(key.clone());
        let result = self.write_pair(key, payload, cached_at);
        if result.is_err() {
            self.state.lock().writing.remove(key);
        }
        result
    }

    fn write_pair(&self, key: &TileKey, payload: &TilePayload, cached_at: SystemTime) -> Result<()> {
        let payload_path = self.payload_path(key);
        let sidecar_path = self.sidecar_path(key);
        let payload_tmp = temp_path(&payload_path);
        let sidecar_tmp = temp_path(&sidecar_path);

        let result = (|| -> Result<()> {
            fs::write(&payload_tmp, payload.data())?;
            sidecar::write(&sidecar_tmp, payload.metadata())?;
            fs::File::options()
                .write(true)
                .open(&sidecar_tmp)?
                .set_modified(cached_at)?;
            fs::rename(&payload_tmp, &payload_path)?;
            fs::rename(&sidecar_tmp, &sidecar_path)?;
            Ok(())
        })();

        if result.is_err() {
            for path in [&payload_tmp, &sidecar_tmp, &payload_path, &sidecar_path] {
                remove_file_quietly(path);
            }
        }
        result
    }

    /// Account for files written by [`DiskTier::write_files`]
    ///
    /// `confirm` releases the tile from the memory tier and runs under the
    /// disk lock, so the bytes move between ledgers in one step. When it
    /// refuses, the hand-off was cancelled and the files are deleted.
    pub fn admit(&self, key: &TileKey, cost: u64, cached_at: SystemTime, confirm: impl FnOnce() -> bool) -> bool {
        let mut state = self.state.lock();
        state.writing.remove(key);
        self.ensure_initialized(&mut state);

        if !confirm() {
            state.ledger.remove(key);
            self.delete_files(key);
            debug!(key = %key, "Discarded cancelled demotion");
            return false;
        }

        state.ledger.insert(key.clone(), cost, DiskEntry { cached_at });
        self.metrics.disk.record_insertion();
        let evicted = self.evict_over_budget(&mut state);
        debug!(key = %key, bytes = cost, evicted, "Admitted tile to disk");
        true
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Reconstruct a persisted tile
    ///
    /// Returns the payload and the time it was first cached. Stale entries,
    /// and entries whose read fails with a soft error, are deleted and
    /// reported as misses.
    pub fn try_load(&self, key: &TileKey, not_before: Option<SystemTime>) -> Result<Option<(TilePayload, SystemTime)>> {
        let cached_at = {
            let mut state = self.state.lock();
            self.ensure_initialized(&mut state);
            state.ledger.touch(key).map(|e| e.cached_at)
        };

        let Some(cached_at) = cached_at else {
            self.metrics.disk.record_miss();
            return Ok(None);
        };

        let reference = match (not_before, self.source_modified()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if reference.is_some_and(|r| cached_at < r) {
            self.discard(key, Discard::Stale);
            self.metrics.disk.record_miss();
            return Ok(None);
        }

        match self.read_files(key) {
            Ok(payload) => {
                self.metrics.disk.record_hit();
                Ok(Some((payload, cached_at)))
            }
            Err(e) if e.is_soft() => {
                if self.discard(key, Discard::Corrupt) {
                    warn!(key = %key, "Discarded unreadable disk tile: {}", e);
                }
                self.metrics.disk.record_miss();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_files(&self, key: &TileKey) -> Result<TilePayload> {
        let metadata = sidecar::read(&self.sidecar_path(key))?;
        let data = fs::read(self.payload_path(key))?;
        let width = sample_width_for(&metadata, data.len() as u64).ok_or_else(|| {
            Error::corrupt(key, format!("{} bytes do not fit the recorded layout", data.len()))
        })?;
        TilePayload::from_shared(Bytes::from(data), Arc::new(metadata), width)
            .map_err(|e| Error::corrupt(key, e.to_string()))
    }

    /// Drop an entry found stale or corrupt; false if it was already gone
    fn discard(&self, key: &TileKey, reason: Discard) -> bool {
        let mut state = self.state.lock();
        if state.ledger.remove(key).is_none() {
            return false;
        }
        self.delete_files(key);
        drop(state);

        match reason {
            Discard::Stale => {
                debug!(key = %key, "Discarded stale disk tile");
                self.metrics.disk.record_stale();
            }
            Discard::Corrupt => self.metrics.disk.record_corrupt(),
        }
        true
    }

    // =========================================================================
    // Ownership Transfer and Lifecycle
    // =========================================================================

    /// Remove `key` from disk and run `f` while still holding the disk lock
    ///
    /// Used for puts and promotions: `f` inserts into the memory tier, so no
    /// observer sees the key resident in both tiers or in neither.
    pub fn hand_over<R>(&self, key: &TileKey, f: impl FnOnce() -> R) -> R {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        if state.ledger.remove(key).is_some() {
            self.delete_files(key);
        }
        f()
    }

    /// Run `f` with the disk totals while holding the disk lock
    pub fn with_usage<R>(&self, f: impl FnOnce(u64, usize) -> R) -> R {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        f(state.ledger.total_bytes(), state.ledger.len())
    }

    /// Resident keys with costs, oldest first
    pub fn entries_lru(&self) -> Vec<(TileKey, u64)> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        state.ledger.keys_lru_order()
    }

    /// Change the budget, deleting whatever no longer fits
    pub fn set_budget(&self, budget_bytes: u64) -> usize {
        self.budget.store(budget_bytes, Ordering::Release);
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        self.evict_over_budget(&mut state)
    }

    /// Empty the tier, running `also` under the disk lock
    ///
    /// With `delete_dir` the directory is removed. Otherwise files stay on
    /// disk untracked until [`DiskTier::invalidate`] schedules a rescan.
    pub fn clear(&self, delete_dir: bool, also: impl FnOnce()) -> Result<u64> {
        let mut state = self.state.lock();
        also();

        let freed = state.ledger.total_bytes();
        state.ledger.clear();
        state.initialized = true;

        if delete_dir {
            self.remove_dir()?;
        }
        Ok(freed)
    }

    /// Remove the directory; a demotion finishing its write concurrently can
    /// make one attempt fail with a non-empty directory, so retry briefly
    fn remove_dir(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    debug!(dir = %self.dir.display(), attempt, "Retrying cache directory removal: {}", e);
                    std::thread::sleep(std::time::Duration::from_millis(10 * attempt));
                }
                Err(e) => {
                    return Err(Error::DirectoryUnavailable {
                        dir: self.dir.display().to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn delete_files(&self, key: &TileKey) {
        for path in [self.payload_path(key), self.sidecar_path(key)] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "Failed to delete cache file: {}", e);
                }
            }
        }
    }
}

impl TierStorage for DiskTier {
    fn residency(&self) -> Residency {
        Residency::OnDisk
    }

    fn contains(&self, key: &TileKey) -> bool {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        state.ledger.contains(key)
    }

    fn remove(&self, key: &TileKey) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state);
        let removed = state.ledger.remove(key).map(|(cost, _)| cost);
        if removed.is_some() {
            self.delete_files(key);
        }
        Ok(removed)
    }

    fn used_bytes(&self) -> u64 {
        self.with_usage(|bytes, _| bytes)
    }

    fn entry_count(&self) -> usize {
        self.with_usage(|_, count| count)
    }

    fn budget_bytes(&self) -> u64 {
        self.budget.load(Ordering::Acquire)
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Candidate {
    key: TileKey,
    cost: u64,
    cached_at: SystemTime,
    demoted_at: SystemTime,
}

fn inspect_pair(
    key: Option<TileKey>,
    payload_path: &Path,
    sidecar_path: &Path,
    source_modified: Option<SystemTime>,
) -> std::result::Result<Candidate, Discard> {
    let key = key.ok_or(Discard::Corrupt)?;
    let metadata = sidecar::read(sidecar_path).map_err(|_| Discard::Corrupt)?;
    let payload_meta = fs::metadata(payload_path).map_err(|_| Discard::Corrupt)?;
    let sidecar_meta = fs::metadata(sidecar_path).map_err(|_| Discard::Corrupt)?;

    let cost = payload_meta.len();
    sample_width_for(&metadata, cost).ok_or(Discard::Corrupt)?;

    let cached_at = sidecar_meta.modified().map_err(|_| Discard::Corrupt)?;
    if source_modified.is_some_and(|s| cached_at < s) {
        return Err(Discard::Stale);
    }

    Ok(Candidate {
        key,
        cost,
        cached_at,
        demoted_at: payload_meta.modified().unwrap_or(cached_at),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_EXTENSION);
    PathBuf::from(name)
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to delete cache file: {}", e);
        }
    }
}
