//! Tile Residency
//!
//! Which tier holds a tile. A key lives in at most one tier at a time: a
//! memory tile demotes to disk, a disk tile promotes back to memory when
//! served, and a disk tile evicted over budget is gone.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Residency of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Residency {
    /// Held in the memory tier
    InMemory,
    /// Persisted in the disk tier
    OnDisk,
    /// Not cached
    #[default]
    Absent,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::InMemory => write!(f, "memory"),
            Residency::OnDisk => write!(f, "disk"),
            Residency::Absent => write!(f, "absent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_default() {
        assert_eq!(Residency::OnDisk.to_string(), "disk");
        assert_eq!(Residency::InMemory.to_string(), "memory");
        assert_eq!(Residency::default(), Residency::Absent);
    }

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_string(&Residency::InMemory).unwrap();
        assert_eq!(json, "\"inMemory\"");
    }
}
