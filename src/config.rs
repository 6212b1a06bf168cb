//! Cache Configuration
//!
//! Configuration is an explicit value: callers build a [`CacheConfig`] in code
//! or load one from a YAML/JSON file. Nothing is read from the environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

// =============================================================================
// Defaults
// =============================================================================

/// Default memory budget: 512 MiB
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// Default disk budget: 20 GiB
pub const DEFAULT_DISK_BUDGET: u64 = 20 * 1024 * 1024 * 1024;

/// Directory name used under the system temp dir when no root is configured
pub const DEFAULT_CACHE_DIR_NAME: &str = "raster-tile-cache";

/// Instance id used when none is configured
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Default cache root (`<tmp>/raster-tile-cache`)
pub fn default_cache_root() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME)
}

// =============================================================================
// Byte Size
// =============================================================================

/// A byte count parsed from a size string such as `"4m"`, `"1.5G"` or `"512kb"`
///
/// Suffixes are powers of 1024 and case-insensitive; a trailing `b` is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return Err(Error::CapacityParse("empty size string".into()));
        }

        let mut digits = raw.as_str();
        if let Some(stripped) = digits.strip_suffix('b') {
            digits = stripped;
        }

        let (number, multiplier) = match digits.chars().last() {
            Some('k') => (&digits[..digits.len() - 1], 1u64 << 10),
            Some('m') => (&digits[..digits.len() - 1], 1u64 << 20),
            Some('g') => (&digits[..digits.len() - 1], 1u64 << 30),
            Some('t') => (&digits[..digits.len() - 1], 1u64 << 40),
            _ => (digits, 1u64),
        };

        let number = number.trim();
        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(ByteSize)
                .ok_or_else(|| Error::CapacityParse(format!("size '{}' overflows", s)));
        }

        let value: f64 = number
            .parse()
            .map_err(|_| Error::CapacityParse(format!("invalid size '{}'", s)))?;
        if !value.is_finite() || value < 0.0 {
            return Err(Error::CapacityParse(format!("invalid size '{}'", s)));
        }

        let total = value * multiplier as f64;
        if total >= u64::MAX as f64 {
            return Err(Error::CapacityParse(format!("size '{}' overflows", s)));
        }
        Ok(ByteSize(total.round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "t"), (1 << 30, "g"), (1 << 20, "m"), (1 << 10, "k")];
        for (unit, suffix) in UNITS {
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{}", self.0 / unit, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Budgets
// =============================================================================

/// Resolved byte budgets for the two tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BUDGET,
            disk_bytes: DEFAULT_DISK_BUDGET,
        }
    }
}

impl Budgets {
    /// Zero budgets: nothing is retained in either tier
    pub fn disabled() -> Self {
        Self {
            memory_bytes: 0,
            disk_bytes: 0,
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Configuration for one cache instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Memory budget as a size string (`"512m"`)
    pub memory_budget: Option<String>,
    /// Disk budget as a size string (`"20g"`)
    pub disk_budget: Option<String>,
    /// Parent directory of all cache instances
    pub cache_root: Option<PathBuf>,
    /// Instance directory name under the root
    pub instance_id: Option<String>,
    /// Create the instance directory when it does not exist
    pub create_missing_dir: bool,
    /// Disk entries older than this file's mtime are stale
    pub staleness_source: Option<PathBuf>,
    /// Raster format hint, carried but not interpreted
    pub raster_format: Option<String>,
    /// CRS hint, carried but not interpreted
    pub crs: Option<String>,
}

impl CacheConfig {
    /// Create a config rooted at `root` that creates its directory on demand
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: Some(root.into()),
            create_missing_dir: true,
            ..Default::default()
        }
    }

    pub fn with_memory_budget(mut self, budget: impl Into<String>) -> Self {
        self.memory_budget = Some(budget.into());
        self
    }

    pub fn with_disk_budget(mut self, budget: impl Into<String>) -> Self {
        self.disk_budget = Some(budget.into());
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_create_missing_dir(mut self, create: bool) -> Self {
        self.create_missing_dir = create;
        self
    }

    pub fn with_staleness_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.staleness_source = Some(source.into());
        self
    }

    /// Parse a YAML document
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Instance id, or [`DEFAULT_INSTANCE_ID`]
    pub fn instance_id(&self) -> &str {
        self.instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_INSTANCE_ID)
    }

    /// Directory this config binds an instance to: `<root>/<instanceId>`
    pub fn cache_dir(&self) -> PathBuf {
        let root = self.cache_root.clone().unwrap_or_else(default_cache_root);
        root.join(self.instance_id())
    }

    /// Resolve both budgets, falling back to defaults for unparseable values
    pub fn budgets(&self) -> Budgets {
        Budgets {
            memory_bytes: resolve_budget("memory", self.memory_budget.as_deref(), DEFAULT_MEMORY_BUDGET),
            disk_bytes: resolve_budget("disk", self.disk_budget.as_deref(), DEFAULT_DISK_BUDGET),
        }
    }
}

fn resolve_budget(tier: &str, value: Option<&str>, default: u64) -> u64 {
    let Some(raw) = value else {
        return default;
    };

    match raw.parse::<ByteSize>() {
        Ok(size) => size.bytes(),
        Err(e) => {
            warn!(
                tier,
                value = raw,
                default = %ByteSize(default),
                "Ignoring unparseable cache budget: {}", e
            );
            default
        }
    }
}
