//! Two-Tier Raster Tile Cache
//!
//! A size-bounded cache for decoded raster tiles, shared by many rendering
//! threads:
//! - **Memory**: decoded payloads, LRU-ordered, budgeted in bytes
//! - **Disk**: raw payload + metadata sidecar per tile, restart-coherent
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            CacheRegistry                                 │
//! │                 (directory → CacheInstance, injected)                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                           CacheInstance                                  │
//! │                  64 key stripes · epoch · lifecycle                      │
//! │  ┌──────────────────────────┐        ┌──────────────────────────────┐   │
//! │  │       MemoryTier         │ demote │          DiskTier            │   │
//! │  │  UsageLedger + in-flight │ ─────► │  UsageLedger + .d3rcache/    │   │
//! │  │  (parking_lot::Mutex)    │ ◄───── │  .info files, lazy rescan    │   │
//! │  └──────────────────────────┘ promote└──────────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Lock order: key stripe → disk ledger → memory ledger                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use raster_tile_cache::cache::{CacheLookup, CacheRegistry, TileCache, TileKey};
//! use raster_tile_cache::config::CacheConfig;
//!
//! let registry = CacheRegistry::new();
//! let config = CacheConfig::new("/var/cache/tiles").with_memory_budget("256m");
//! let cache = registry.get_instance(&config)?;
//!
//! let key = TileKey::for_tile("ortho", 3, 12, 7)?;
//! let payload = match cache.get(&key)? {
//!     CacheLookup::Hit { payload, .. } => payload,
//!     CacheLookup::Miss => {
//!         let payload = decode_tile()?;
//!         cache.put(key, payload.clone())?;
//!         payload
//!     }
//! };
//!
//! // Persist memory tiles before shutdown so the next start can rehydrate
//! registry.flush()?;
//! ```

pub mod cost;
pub mod entry;
pub mod lru;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod sidecar;
pub mod storage;
pub mod tier;

// Re-export main types
pub use cost::tile_cost;
pub use entry::{TileKey, TileMetadata, TilePayload};
pub use lru::UsageLedger;
pub use manager::{CacheInstance, InstanceState};
pub use metrics::{CacheMetrics, CacheStatsSnapshot, TierMetrics, TierMetricsSnapshot};
pub use registry::{has_no_cache_marker, CacheRegistry};
pub use storage::{DiskTier, MemoryTier, RehydrateReport, TierStorage};
pub use tier::Residency;

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Cache Lookup
// =============================================================================

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Cache hit
    Hit {
        /// The cached payload
        payload: TilePayload,
        /// Tier that served it; disk hits are promoted to memory
        residency: Residency,
    },
    /// Not cached in either tier
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss)
    }

    pub fn payload(&self) -> Option<&TilePayload> {
        match self {
            CacheLookup::Hit { payload, .. } => Some(payload),
            CacheLookup::Miss => None,
        }
    }

    pub fn residency(&self) -> Option<Residency> {
        match self {
            CacheLookup::Hit { residency, .. } => Some(*residency),
            CacheLookup::Miss => None,
        }
    }

    pub fn into_payload(self) -> Option<TilePayload> {
        match self {
            CacheLookup::Hit { payload, .. } => Some(payload),
            CacheLookup::Miss => None,
        }
    }
}

// =============================================================================
// TileCache Trait (Port)
// =============================================================================

/// Port through which renderers use the cache
pub trait TileCache: Send + Sync {
    /// Look up a tile: memory first, then disk
    ///
    /// A miss in both tiers is `CacheLookup::Miss`, not an error.
    fn get(&self, key: &TileKey) -> Result<CacheLookup>;

    /// Like [`TileCache::get`], treating tiles cached before `source` was last
    /// modified as stale
    fn get_checked(&self, key: &TileKey, source: &Path) -> Result<CacheLookup>;

    /// Store a decoded tile in memory, demoting older tiles as needed
    fn put(&self, key: TileKey, payload: TilePayload) -> Result<()>;

    /// Remove a tile from both tiers; true if it was cached
    fn remove(&self, key: &TileKey) -> Result<bool>;

    /// Exact bytes held by the memory tier
    fn used_memory(&self) -> u64;

    /// Exact bytes held by the disk tier
    fn used_disk(&self) -> u64;

    /// Counter and usage snapshot
    fn stats(&self) -> CacheStatsSnapshot;

    /// Demote every memory tile to disk, returning how many were written
    fn flush(&self) -> Result<usize>;

    /// Empty both tiers; `delete_dir` also removes the directory
    fn clear(&self, delete_dir: bool) -> Result<()>;
}

/// Type alias for a shared cache
pub type TileCacheRef = Arc<dyn TileCache>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_accessors() {
        let payload = TilePayload::new(vec![1u8; 4], TileMetadata::new(2, 2, 1), 1).unwrap();
        let hit = CacheLookup::Hit {
            payload: payload.clone(),
            residency: Residency::OnDisk,
        };
        assert!(hit.is_hit());
        assert!(!hit.is_miss());
        assert_eq!(hit.payload(), Some(&payload));
        assert_eq!(hit.residency(), Some(Residency::OnDisk));
        assert_eq!(hit.into_payload(), Some(payload));

        let miss = CacheLookup::Miss;
        assert!(miss.is_miss());
        assert_eq!(miss.payload(), None);
        assert_eq!(miss.residency(), None);
    }
}
