//! Cache Storage Tiers
//!
//! The memory tier holds decoded payloads; the disk tier persists them as a
//! raw payload file plus a metadata sidecar. Both keep a [`UsageLedger`] behind
//! their own mutex and are budgeted in bytes.
//!
//! [`UsageLedger`]: crate::cache::lru::UsageLedger

mod disk;
mod memory;

pub use disk::{DiskTier, RehydrateReport};
pub use memory::{Demotion, InsertOutcome, MemoryTier};

use crate::cache::entry::TileKey;
use crate::cache::tier::Residency;
use crate::error::Result;

/// File extension of persisted payloads
pub const PAYLOAD_EXTENSION: &str = "d3rcache";

// =============================================================================
// TierStorage Trait
// =============================================================================

/// Operations shared by both tiers
///
/// Lookups and inserts differ too much between tiers to share a signature
/// (memory hands back demotions, disk reconstructs from files), so only
/// accounting and removal live here.
pub trait TierStorage: Send + Sync {
    /// Residency reported for tiles held by this tier
    fn residency(&self) -> Residency;

    /// Check if a key is resident
    fn contains(&self, key: &TileKey) -> bool;

    /// Evict a key without demotion, returning the freed bytes
    fn remove(&self, key: &TileKey) -> Result<Option<u64>>;

    /// Exact resident byte total
    fn used_bytes(&self) -> u64;

    /// Resident entry count
    fn entry_count(&self) -> usize;

    /// Current byte budget
    fn budget_bytes(&self) -> u64;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::cache::entry::{TileMetadata, TilePayload};

    /// RGB byte tile of `side * side` pixels filled with `fill`
    pub fn rgb_tile(side: u32, fill: u8) -> TilePayload {
        let len = (side * side * 3) as usize;
        TilePayload::new(vec![fill; len], TileMetadata::new(side, side, 3), 1).unwrap()
    }
}
