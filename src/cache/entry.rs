//! Tile Entry Types
//!
//! Defines tile keys, the geo-referencing/layout metadata of a decoded tile,
//! and the immutable payload shared between callers and both tiers.

use crate::cache::cost::{tile_cost, SUPPORTED_SAMPLE_WIDTHS};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// =============================================================================
// Tile Key
// =============================================================================

/// Number of key stripes used for per-key serialization
pub const KEY_STRIPE_COUNT: usize = 64;

/// Longest encoded key that still leaves room for a file extension
pub const MAX_FILE_BASE_LEN: usize = 240;

/// Identity of one decoded tile payload within a cache instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileKey(String);

impl TileKey {
    /// Create a key, rejecting empty names and names too long to persist
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidKey("tile key must not be empty".into()));
        }

        let encoded_len = urlencoding::encode(&key).len();
        if encoded_len > MAX_FILE_BASE_LEN {
            return Err(Error::InvalidKey(format!(
                "encoded key is {} bytes, limit is {}",
                encoded_len, MAX_FILE_BASE_LEN
            )));
        }

        Ok(Self(key))
    }

    /// Composite key of a tile in a tiled raster: `{source}_{level}_{column}_{row}`
    pub fn for_tile(source_id: &str, level: u32, column: u32, row: u32) -> Result<Self> {
        Self::new(format!("{}_{}_{}_{}", source_id, level, column, row))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stripe index for this key
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % KEY_STRIPE_COUNT
    }

    /// Reversible file name stem (percent-encoded key)
    pub fn file_base(&self) -> Cow<'_, str> {
        urlencoding::encode(&self.0)
    }

    /// Recover a key from a file name stem written by [`TileKey::file_base`]
    ///
    /// Returns `None` for stems this cache could not have written.
    pub fn from_file_base(base: &str) -> Option<Self> {
        let decoded = urlencoding::decode(base).ok()?;
        if urlencoding::encode(&decoded) != base {
            return None;
        }
        Self::new(decoded.into_owned()).ok()
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TileKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TileKey> for String {
    fn from(key: TileKey) -> Self {
        key.0
    }
}

// =============================================================================
// Tile Metadata
// =============================================================================

/// Geo-referencing and layout of a decoded tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMetadata {
    /// World units per pixel along x
    pub resolution_x: f64,
    /// World units per pixel along y
    pub resolution_y: f64,
    /// World x of the upper-left corner
    pub origin_x: f64,
    /// World y of the upper-left corner
    pub origin_y: f64,
    /// Columns in the owning tile matrix
    pub tile_columns: u32,
    /// Rows in the owning tile matrix
    pub tile_rows: u32,
    /// Nominal tile width in pixels
    pub tile_width: u32,
    /// Nominal tile height in pixels
    pub tile_height: u32,
    /// Number of interleaved bands
    pub band_count: u32,
    /// Nodata marker per band, `None` when the band has none
    pub nodata: Vec<Option<f64>>,
    /// Width of the sample buffer actually held
    pub buffer_width: u32,
    /// Height of the sample buffer actually held
    pub buffer_height: u32,
}

impl TileMetadata {
    /// Metadata for a single-tile buffer of the given size, unit resolution
    pub fn new(buffer_width: u32, buffer_height: u32, band_count: u32) -> Self {
        Self {
            resolution_x: 1.0,
            resolution_y: -1.0,
            origin_x: 0.0,
            origin_y: 0.0,
            tile_columns: 1,
            tile_rows: 1,
            tile_width: buffer_width,
            tile_height: buffer_height,
            band_count,
            nodata: vec![None; band_count as usize],
            buffer_width,
            buffer_height,
        }
    }

    pub fn with_resolution(mut self, x: f64, y: f64) -> Self {
        self.resolution_x = x;
        self.resolution_y = y;
        self
    }

    pub fn with_origin(mut self, x: f64, y: f64) -> Self {
        self.origin_x = x;
        self.origin_y = y;
        self
    }

    pub fn with_tile_matrix(mut self, columns: u32, rows: u32, tile_width: u32, tile_height: u32) -> Self {
        self.tile_columns = columns;
        self.tile_rows = rows;
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self
    }

    pub fn with_nodata(mut self, nodata: Vec<Option<f64>>) -> Self {
        self.nodata = nodata;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.band_count == 0 {
            return Err(Error::InvalidMetadata("band count must be positive".into()));
        }
        if self.nodata.len() != self.band_count as usize {
            return Err(Error::InvalidMetadata(format!(
                "{} nodata markers for {} bands",
                self.nodata.len(),
                self.band_count
            )));
        }
        let coords = [self.resolution_x, self.resolution_y, self.origin_x, self.origin_y];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidMetadata("geo-referencing must be finite".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tile Payload
// =============================================================================

/// Decoded sample bytes of one tile plus their layout
///
/// Cloning is cheap: the bytes and metadata are reference counted.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePayload {
    data: Bytes,
    metadata: Arc<TileMetadata>,
    bytes_per_sample: u8,
}

impl TilePayload {
    /// Create a payload whose length must equal its layout cost
    pub fn new(data: impl Into<Bytes>, metadata: TileMetadata, bytes_per_sample: u8) -> Result<Self> {
        Self::from_shared(data.into(), Arc::new(metadata), bytes_per_sample)
    }

    pub(crate) fn from_shared(data: Bytes, metadata: Arc<TileMetadata>, bytes_per_sample: u8) -> Result<Self> {
        if !SUPPORTED_SAMPLE_WIDTHS.contains(&bytes_per_sample) {
            return Err(Error::UnsupportedSampleWidth(bytes_per_sample));
        }
        metadata.validate()?;

        let expected = tile_cost(&metadata, bytes_per_sample)?;
        let actual = data.len() as u64;
        if expected != actual {
            return Err(Error::PayloadSizeMismatch { expected, actual });
        }

        Ok(Self {
            data,
            metadata,
            bytes_per_sample,
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &TileMetadata {
        &self.metadata
    }

    pub fn bytes_per_sample(&self) -> u8 {
        self.bytes_per_sample
    }

    /// Byte footprint; equal to the data length by construction
    #[inline]
    pub fn cost(&self) -> u64 {
        self.data.len() as u64
    }
}
