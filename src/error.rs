//! Error types for the Raster Tile Cache
//!
//! Hard failures (bad payloads, bad configuration, lifecycle misuse) surface as
//! [`Error`]. Stale or corrupt cache content is absorbed by the tiers and turned
//! into a cache miss; [`Error::action`] tells callers which is which.

use thiserror::Error;

/// Unified error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Tile Validation Errors
    // =========================================================================
    #[error("Invalid tile key: {0}")]
    InvalidKey(String),

    #[error("Invalid tile metadata: {0}")]
    InvalidMetadata(String),

    #[error("Payload size mismatch: layout requires {expected} bytes, payload has {actual} bytes")]
    PayloadSizeMismatch { expected: u64, actual: u64 },

    #[error("Unsupported sample width: {0} bytes")]
    UnsupportedSampleWidth(u8),

    #[error("Tile layout overflows addressable size: {0}")]
    CostOverflow(String),

    // =========================================================================
    // Instance Lifecycle Errors
    // =========================================================================
    #[error("Cache instance for {dir} has been cleared")]
    InstanceCleared { dir: String },

    #[error("Cache directory unavailable: {dir} - {reason}")]
    DirectoryUnavailable { dir: String, reason: String },

    // =========================================================================
    // Disk Entry Errors (absorbed as misses)
    // =========================================================================
    #[error("Stale cache entry: {key}")]
    StaleEntry { key: String },

    #[error("Corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Sidecar parse error at line {line}: {reason}")]
    SidecarParse { line: usize, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the cache does with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Return the error to the caller
    Fail,
    /// Delete the offending files and report a cache miss
    TreatAsMiss,
    /// Drop the tile from both tiers; a later request recomputes it
    DropTile,
}

impl Error {
    /// Determine how the cache reacts to this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::StaleEntry { .. } | Error::CorruptEntry { .. } | Error::SidecarParse { .. } => {
                ErrorAction::TreatAsMiss
            }

            // Write failures during demotion lose the tile, never correctness
            Error::Io(_) => ErrorAction::DropTile,

            _ => ErrorAction::Fail,
        }
    }

    /// Check if the cache absorbs this error instead of surfacing it
    pub fn is_soft(&self) -> bool {
        !matches!(self.action(), ErrorAction::Fail)
    }

    pub(crate) fn corrupt(key: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::CorruptEntry {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the cache
pub type Result<T> = std::result::Result<T, Error>;
