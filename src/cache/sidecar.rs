//! Metadata Sidecar Codec
//!
//! Each persisted tile has a `<base>.info` file next to its payload: UTF-8,
//! one field per line, fixed order.
//!
//! ```text
//!  1  resolution x          7  tile width
//!  2  resolution y          8  tile height
//!  3  origin x              9  band count
//!  4  origin y             10  nodata of band 0 ("none" if unset)
//!  5  tile-matrix columns  11  buffer width
//!  6  tile-matrix rows     12  buffer height
//! 13+ nodata of bands 1..n, one per line
//! ```
//!
//! Floats use Rust's shortest round-trip formatting, so decode(encode(m)) == m.

use crate::cache::entry::TileMetadata;
use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

/// File extension of metadata sidecars
pub const SIDECAR_EXTENSION: &str = "info";

/// Marker written for a band without a nodata value
pub const NO_NODATA: &str = "none";

const FIXED_LINES: usize = 12;

/// Render metadata as sidecar text
pub fn encode(meta: &TileMetadata) -> String {
    let mut out = String::with_capacity(128);
    let band0 = meta.nodata.first().copied().flatten();

    // Writing into a String is infallible
    let _ = writeln!(out, "{}", meta.resolution_x);
    let _ = writeln!(out, "{}", meta.resolution_y);
    let _ = writeln!(out, "{}", meta.origin_x);
    let _ = writeln!(out, "{}", meta.origin_y);
    let _ = writeln!(out, "{}", meta.tile_columns);
    let _ = writeln!(out, "{}", meta.tile_rows);
    let _ = writeln!(out, "{}", meta.tile_width);
    let _ = writeln!(out, "{}", meta.tile_height);
    let _ = writeln!(out, "{}", meta.band_count);
    let _ = writeln!(out, "{}", format_nodata(band0));
    let _ = writeln!(out, "{}", meta.buffer_width);
    let _ = writeln!(out, "{}", meta.buffer_height);
    for nodata in meta.nodata.iter().skip(1) {
        let _ = writeln!(out, "{}", format_nodata(*nodata));
    }

    out
}

/// Parse sidecar text
pub fn decode(text: &str) -> Result<TileMetadata> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let lines = match lines.iter().rposition(|l| !l.is_empty()) {
        Some(last) => &lines[..=last],
        None => &[][..],
    };

    if lines.len() < FIXED_LINES {
        return Err(Error::SidecarParse {
            line: lines.len() + 1,
            reason: format!("expected at least {} lines, found {}", FIXED_LINES, lines.len()),
        });
    }

    let band_count: u32 = field(lines, 8)?;
    if band_count == 0 {
        return Err(Error::SidecarParse {
            line: 9,
            reason: "band count must be positive".into(),
        });
    }

    let expected = FIXED_LINES + band_count as usize - 1;
    if lines.len() != expected {
        return Err(Error::SidecarParse {
            line: lines.len().min(expected) + 1,
            reason: format!("{} bands need {} lines, found {}", band_count, expected, lines.len()),
        });
    }

    let mut nodata = Vec::with_capacity(band_count as usize);
    nodata.push(parse_nodata(lines, 9)?);
    for idx in FIXED_LINES..expected {
        nodata.push(parse_nodata(lines, idx)?);
    }

    let meta = TileMetadata {
        resolution_x: field(lines, 0)?,
        resolution_y: field(lines, 1)?,
        origin_x: field(lines, 2)?,
        origin_y: field(lines, 3)?,
        tile_columns: field(lines, 4)?,
        tile_rows: field(lines, 5)?,
        tile_width: field(lines, 6)?,
        tile_height: field(lines, 7)?,
        band_count,
        nodata,
        buffer_width: field(lines, 10)?,
        buffer_height: field(lines, 11)?,
    };

    meta.validate().map_err(|e| Error::SidecarParse {
        line: 0,
        reason: e.to_string(),
    })?;
    Ok(meta)
}

/// Write a sidecar file
pub fn write(path: &Path, meta: &TileMetadata) -> Result<()> {
    std::fs::write(path, encode(meta))?;
    Ok(())
}

/// Read and parse a sidecar file
pub fn read(path: &Path) -> Result<TileMetadata> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|e| Error::SidecarParse {
        line: 0,
        reason: format!("not UTF-8: {}", e),
    })?;
    decode(&text)
}

// =============================================================================
// Helpers
// =============================================================================

fn field<T>(lines: &[&str], idx: usize) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lines[idx].parse().map_err(|e: T::Err| Error::SidecarParse {
        line: idx + 1,
        reason: format!("'{}': {}", lines[idx], e),
    })
}

fn parse_nodata(lines: &[&str], idx: usize) -> Result<Option<f64>> {
    if lines[idx].eq_ignore_ascii_case(NO_NODATA) {
        Ok(None)
    } else {
        field(lines, idx).map(Some)
    }
}

fn format_nodata(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => NO_NODATA.to_string(),
    }
}
