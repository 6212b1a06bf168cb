//! Cache Metrics
//!
//! Cache-line aligned counters, one block per tier, updated with relaxed
//! atomics from any thread. Byte totals are not counted here: they come from
//! the tier ledgers, which are exact.

use crate::cache::tier::Residency;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Per-Tier Metrics (Cache-Line Aligned)
// =============================================================================

/// Counters for a single tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct TierMetrics {
    /// Lookups served by this tier
    pub hits: AtomicU64,
    /// Lookups this tier could not serve
    pub misses: AtomicU64,
    /// Tiles admitted (puts and promotions for memory, demotions for disk)
    pub insertions: AtomicU64,
    /// Tiles pushed out over budget (demotions for memory, deletions for disk)
    pub evictions: AtomicU64,
    /// Entries discarded because their source changed
    pub stale_discards: AtomicU64,
    /// Entries discarded because their files were unreadable or inconsistent
    pub corrupt_discards: AtomicU64,
    /// Demotions lost to write errors
    pub write_failures: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<TierMetrics>() <= CACHE_LINE_SIZE);

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TierMetrics {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
            corrupt_discards: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.bump(&self.hits);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.bump(&self.misses);
    }

    #[inline]
    pub fn record_insertion(&self) {
        self.bump(&self.insertions);
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.bump(&self.evictions);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.bump(&self.stale_discards);
    }

    #[inline]
    pub fn record_corrupt(&self) {
        self.bump(&self.corrupt_discards);
    }

    #[inline]
    pub fn record_write_failure(&self) {
        self.bump(&self.write_failures);
    }

    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        let last_ms = self.last_update_ms.load(Ordering::Acquire);
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            corrupt_discards: self.corrupt_discards.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            last_update: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms as i64).single())
                .flatten(),
        }
    }
}

// =============================================================================
// Tier Metrics Snapshot
// =============================================================================

/// Point-in-time copy of one tier's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub stale_discards: u64,
    pub corrupt_discards: u64,
    pub write_failures: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl TierMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.hits + self.misses
    }
}

// =============================================================================
// Aggregate Cache Statistics
// =============================================================================

/// Statistics of one cache instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatsSnapshot {
    pub memory: TierMetricsSnapshot,
    pub disk: TierMetricsSnapshot,
    /// Bytes resident in memory, including tiles awaiting demotion
    pub memory_bytes: u64,
    pub memory_entries: usize,
    pub disk_bytes: u64,
    pub disk_entries: usize,
    pub taken_at: DateTime<Utc>,
}

impl CacheStatsSnapshot {
    /// Lookups served by either tier
    pub fn total_hits(&self) -> u64 {
        self.memory.hits + self.disk.hits
    }

    /// Lookups that missed both tiers
    pub fn total_misses(&self) -> u64 {
        self.disk.misses
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_hits() + self.total_misses();
        if total == 0 {
            0.0
        } else {
            self.total_hits() as f64 / total as f64
        }
    }

    /// Memory tiles handed to the disk tier
    pub fn demotions(&self) -> u64 {
        self.memory.evictions
    }

    /// Disk tiles moved back into memory; every disk hit promotes
    pub fn promotions(&self) -> u64 {
        self.disk.hits
    }

    pub fn tier(&self, residency: Residency) -> Option<&TierMetricsSnapshot> {
        match residency {
            Residency::InMemory => Some(&self.memory),
            Residency::OnDisk => Some(&self.disk),
            Residency::Absent => None,
        }
    }
}

// =============================================================================
// Instance Metrics
// =============================================================================

/// Counters of one cache instance
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub memory: TierMetrics,
    pub disk: TierMetrics,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine the counters with ledger totals read by the caller
    pub fn snapshot(
        &self,
        memory_bytes: u64,
        memory_entries: usize,
        disk_bytes: u64,
        disk_entries: usize,
    ) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            memory: self.memory.snapshot(),
            disk: self.disk.snapshot(),
            memory_bytes,
            memory_entries,
            disk_bytes,
            disk_entries,
            taken_at: Utc::now(),
        }
    }
}
