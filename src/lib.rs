//! Raster Tile Cache
//!
//! A two-tier cache for decoded raster tiles. Rendering threads look tiles up
//! by key; recently used tiles stay in memory, older ones are demoted to a
//! directory on disk and promoted back on their next hit. Both tiers are
//! bounded by byte budgets that are accounted exactly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Rendering threads                                │
//! │                  get / get_checked / put / remove                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                          CacheRegistry                                   │
//! │           <root>/<instanceId>  ──►  CacheInstance (shared Arc)           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐          ┌──────────────────────────────┐ │
//! │  │       Memory tier        │  demote  │          Disk tier           │ │
//! │  │   LRU, byte budget       │ ───────► │  <key>.d3rcache + <key>.info │ │
//! │  │   decoded payloads       │ ◄─────── │  LRU, byte budget, rehydrate │ │
//! │  └──────────────────────────┘  promote └──────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Registry, instances, tiers and the tile types they store
//! - [`config`]: Instance configuration and byte-size parsing
//! - [`error`]: Error types and handling

pub mod cache;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use cache::{
    has_no_cache_marker, tile_cost, CacheInstance, CacheLookup, CacheRegistry, CacheStatsSnapshot,
    InstanceState, RehydrateReport, Residency, TileCache, TileCacheRef, TileKey, TileMetadata,
    TilePayload,
};

pub use config::{Budgets, ByteSize, CacheConfig};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
