//! Tile Cost
//!
//! Byte footprint of a pixel-interleaved tile buffer. Both tiers budget with
//! this number, so it must equal the real payload length exactly.

use crate::cache::entry::TileMetadata;
use crate::error::{Error, Result};

/// Sample widths a payload may use (u8, i16/u16, i32/f32, f64)
pub const SUPPORTED_SAMPLE_WIDTHS: [u8; 4] = [1, 2, 4, 8];

/// `buffer_width * buffer_height * band_count * bytes_per_sample`
///
/// Overflow is an error, never a wrapped value.
pub fn tile_cost(metadata: &TileMetadata, bytes_per_sample: u8) -> Result<u64> {
    let factors = [
        u64::from(metadata.buffer_width),
        u64::from(metadata.buffer_height),
        u64::from(metadata.band_count),
        u64::from(bytes_per_sample),
    ];

    factors
        .iter()
        .try_fold(1u64, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| {
            Error::CostOverflow(format!(
                "{}x{} pixels, {} bands, {} bytes per sample",
                metadata.buffer_width, metadata.buffer_height, metadata.band_count, bytes_per_sample
            ))
        })
}

/// Infer the sample width from a persisted payload length
///
/// The sidecar does not record it; the only width consistent with the layout
/// and the file length is the right one. An empty buffer (zero width, height
/// or length) matches every width and reloads as 1 byte per sample, the
/// narrowest; it holds no samples, so its data and cost are unaffected.
pub fn sample_width_for(metadata: &TileMetadata, payload_len: u64) -> Option<u8> {
    SUPPORTED_SAMPLE_WIDTHS
        .iter()
        .copied()
        .find(|&width| tile_cost(metadata, width).ok() == Some(payload_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_tile_cost() {
        let meta = TileMetadata::new(500, 500, 3);
        assert_eq!(tile_cost(&meta, 1).unwrap(), 750_000);

        let overview = TileMetadata::new(334, 334, 3);
        assert_eq!(tile_cost(&overview, 1).unwrap(), 334_668);
    }

    #[test]
    fn test_wide_samples() {
        let meta = TileMetadata::new(256, 256, 1);
        assert_eq!(tile_cost(&meta, 4).unwrap(), 262_144);
        assert_eq!(tile_cost(&meta, 8).unwrap(), 524_288);
    }

    #[test]
    fn test_empty_buffer_costs_nothing() {
        let meta = TileMetadata::new(0, 128, 1);
        assert_eq!(tile_cost(&meta, 2).unwrap(), 0);
    }

    #[test]
    fn test_overflow_is_reported() {
        let meta = TileMetadata::new(u32::MAX, u32::MAX, u32::MAX);
        assert!(matches!(tile_cost(&meta, 8), Err(Error::CostOverflow(_))));
    }

    #[test]
    fn test_sample_width_inference() {
        let meta = TileMetadata::new(10, 10, 2);
        assert_eq!(sample_width_for(&meta, 200), Some(1));
        assert_eq!(sample_width_for(&meta, 800), Some(4));
        assert_eq!(sample_width_for(&meta, 600), None);
    }

    #[test]
    fn test_empty_buffer_reloads_as_narrowest_width() {
        let meta = TileMetadata::new(0, 64, 1);
        assert_eq!(tile_cost(&meta, 4).unwrap(), 0);
        assert_eq!(sample_width_for(&meta, 0), Some(1));
        assert_eq!(sample_width_for(&meta, 64), None);
    }
}
