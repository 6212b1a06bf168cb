//! Cache Registry
//!
//! Maps cache directories to their [`CacheInstance`]. The registry is an
//! explicit value owned by the composition root and passed to whoever needs
//! a cache; tests build their own isolated registries.

use crate::cache::manager::{CacheInstance, InstanceState};
use crate::cache::TileCache;
use crate::config::{default_cache_root, CacheConfig};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Cache Registry
// =============================================================================

/// Registry of cache instances, one per directory
#[derive(Default)]
pub struct CacheRegistry {
    /// Instances by absolute directory, in creation order
    instances: RwLock<IndexMap<PathBuf, Arc<CacheInstance>>>,
    /// Unique identifier → absolute path it was issued for
    unique_ids: DashMap<String, PathBuf>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance bound to the directory named in `config`
    ///
    /// A new instance reads its budgets from `config`; an existing one keeps
    /// its own and is re-activated if it was cleared. When the directory is
    /// missing and `create_missing_dir` is off, the instance falls back to
    /// `<tmp>/raster-tile-cache/<instanceId>`; this also applies to a cleared
    /// instance whose directory was deleted.
    pub fn get_instance(&self, config: &CacheConfig) -> Result<Arc<CacheInstance>> {
        let requested = absolute(&config.cache_dir())?;
        let existing = self.instances.read().get(&requested).cloned();
        if let Some(instance) = existing {
            if instance.state() == InstanceState::Active || requested.is_dir() || config.create_missing_dir {
                return reactivate(instance);
            }
            // Removed by a clear and not to be recreated: resolve it afresh
            self.instances.write().shift_remove(&requested);
        }

        let dir = resolve_dir(requested, config)?;
        let mut instances = self.instances.write();
        if let Some(instance) = instances.get(&dir).cloned() {
            drop(instances);
            return reactivate(instance);
        }

        let instance = Arc::new(CacheInstance::new(dir.clone(), config.clone()));
        instance.activate()?;
        instances.insert(dir, Arc::clone(&instance));
        Ok(instance)
    }

    /// Number of active instances
    pub fn size(&self) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.state() == InstanceState::Active)
            .count()
    }

    /// All tracked instances, in creation order
    pub fn instances(&self) -> Vec<Arc<CacheInstance>> {
        self.instances.read().values().cloned().collect()
    }

    fn active(&self) -> Vec<Arc<CacheInstance>> {
        self.instances()
            .into_iter()
            .filter(|i| i.state() == InstanceState::Active)
            .collect()
    }

    /// Memory bytes used across active instances
    pub fn used_memory(&self) -> u64 {
        self.active().iter().map(|i| i.used_memory()).sum()
    }

    /// Disk bytes used across active instances
    pub fn used_disk(&self) -> u64 {
        self.active().iter().map(|i| i.used_disk()).sum()
    }

    /// Clear every instance; `force_delete_dir` also removes the directories
    ///
    /// All instances are cleared even if one fails; the first error is
    /// returned.
    pub fn clear(&self, force_delete_dir: bool) -> Result<()> {
        let mut first_error = None;
        for instance in self.instances() {
            if let Err(e) = instance.clear(force_delete_dir) {
                warn!(dir = %instance.dir().display(), "Failed to clear cache instance: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Clear every instance and delete its files
    ///
    /// With `force_new_config` the instances are forgotten, so the next
    /// [`CacheRegistry::get_instance`] builds them from the config it is given.
    pub fn reset(&self, force_new_config: bool) -> Result<()> {
        let result = self.clear(true);
        if force_new_config {
            self.instances.write().clear();
        }
        info!(force_new_config, "Reset tile cache registry");
        result
    }

    /// Write all memory tiles of active instances to disk
    pub fn flush(&self) -> Result<usize> {
        let mut written = 0;
        for instance in self.active() {
            written += instance.flush()?;
        }
        Ok(written)
    }

    /// Set both budgets of every instance to zero
    pub fn disable_all(&self) {
        for instance in self.instances() {
            instance.disable();
        }
        info!("Disabled all tile caches");
    }

    /// Short identifier for a source file, unique within this registry
    ///
    /// The file stem is used as-is for the first path that claims it; other
    /// paths with the same stem get `1_`, `2_`, ... prefixes. The same path
    /// always receives the same identifier.
    pub fn unique_cache_identifier(&self, path: &Path) -> Result<String> {
        let owner = absolute(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidKey(format!("no file name in {}", path.display())))?;

        let mut idx = 0usize;
        loop {
            let candidate = if idx == 0 {
                stem.to_string()
            } else {
                format!("{}_{}", idx, stem)
            };

            match self.unique_ids.entry(candidate.clone()) {
                Entry::Occupied(existing) if existing.get() == &owner => return Ok(candidate),
                Entry::Occupied(_) => idx += 1,
                Entry::Vacant(slot) => {
                    slot.insert(owner);
                    return Ok(candidate);
                }
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Check for `<file>.no-cache` or `<file>.no-cache-<level>` beside `path`
///
/// Either marker opts the source out of caching. A missing source has no
/// markers.
pub fn has_no_cache_marker(path: &Path, level: u32) -> bool {
    if !path.exists() {
        return false;
    }
    let Some(name) = path.file_name() else {
        return false;
    };

    let marker = |suffix: String| {
        let mut marker_name = name.to_os_string();
        marker_name.push(suffix);
        path.with_file_name(marker_name).exists()
    };
    marker(".no-cache".to_string()) || marker(format!(".no-cache-{}", level))
}

fn reactivate(instance: Arc<CacheInstance>) -> Result<Arc<CacheInstance>> {
    if instance.state() != InstanceState::Active {
        instance.activate()?;
    }
    Ok(instance)
}

fn resolve_dir(requested: PathBuf, config: &CacheConfig) -> Result<PathBuf> {
    if requested.is_dir() {
        return Ok(requested);
    }

    let dir = if config.create_missing_dir {
        requested
    } else {
        let fallback = absolute(&default_cache_root().join(config.instance_id()))?;
        warn!(
            requested = %requested.display(),
            fallback = %fallback.display(),
            "Cache directory does not exist and creation is disabled, using default location"
        );
        fallback
    };

    std::fs::create_dir_all(&dir).map_err(|e| Error::DirectoryUnavailable {
        dir: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(dir)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::TileKey;
    use crate::cache::storage::test_support::rgb_tile;
    use tempfile::TempDir;

    fn config(root: &Path, id: &str) -> CacheConfig {
        CacheConfig::new(root).with_instance_id(id)
    }

    #[test]
    fn test_same_directory_same_instance() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();

        let a = registry.get_instance(&config(root.path(), "dem")).unwrap();
        let b = registry.get_instance(&config(root.path(), "dem")).unwrap();
        let c = registry.get_instance(&config(root.path(), "ortho")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.size(), 2);
        assert!(root.path().join("dem").is_dir());
    }

    #[test]
    fn test_usage_sums_across_instances() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let a = registry.get_instance(&config(root.path(), "a")).unwrap();
        let b = registry.get_instance(&config(root.path(), "b")).unwrap();

        a.put(TileKey::new("t").unwrap(), rgb_tile(10, 0)).unwrap();
        b.put(TileKey::new("t").unwrap(), rgb_tile(4, 0)).unwrap();
        assert_eq!(registry.used_memory(), 348);

        assert_eq!(registry.flush().unwrap(), 2);
        assert_eq!(registry.used_memory(), 0);
        assert_eq!(registry.used_disk(), 348);
    }

    #[test]
    fn test_clear_and_reactivate() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let cfg = config(root.path(), "dem");
        let instance = registry.get_instance(&cfg).unwrap();
        instance.put(TileKey::new("t").unwrap(), rgb_tile(4, 0)).unwrap();

        registry.clear(true).unwrap();
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.used_memory(), 0);
        assert!(!root.path().join("dem").exists());

        let again = registry.get_instance(&cfg).unwrap();
        assert!(Arc::ptr_eq(&instance, &again));
        assert_eq!(again.state(), InstanceState::Active);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_reset_with_new_config_rereads_budgets() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let first = registry
            .get_instance(&config(root.path(), "dem").with_memory_budget("1m"))
            .unwrap();
        assert_eq!(first.budgets().memory_bytes, 1 << 20);

        registry.reset(false).unwrap();
        let same = registry
            .get_instance(&config(root.path(), "dem").with_memory_budget("2m"))
            .unwrap();
        assert_eq!(same.budgets().memory_bytes, 1 << 20);

        registry.reset(true).unwrap();
        let fresh = registry
            .get_instance(&config(root.path(), "dem").with_memory_budget("2m"))
            .unwrap();
        assert_eq!(fresh.budgets().memory_bytes, 2 << 20);
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[test]
    fn test_missing_directory_without_create_falls_back() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let id = format!("fallback-{}", std::process::id());
        let cfg = CacheConfig::default()
            .with_instance_id(id.clone())
            .with_create_missing_dir(false);
        let cfg = CacheConfig {
            cache_root: Some(root.path().join("missing")),
            ..cfg
        };

        let instance = registry.get_instance(&cfg).unwrap();
        assert_eq!(instance.dir(), default_cache_root().join(&id));
        assert!(!root.path().join("missing").exists());

        instance.clear(true).unwrap();
    }

    #[test]
    fn test_reactivation_does_not_recreate_directory_without_create() {
        let root = TempDir::new().unwrap();
        let id = format!("recreate-{}", std::process::id());
        std::fs::create_dir(root.path().join(&id)).unwrap();
        let cfg = config(root.path(), &id).with_create_missing_dir(false);
        let registry = CacheRegistry::new();

        let first = registry.get_instance(&cfg).unwrap();
        assert_eq!(first.dir(), root.path().join(&id));

        registry.clear(true).unwrap();
        let second = registry.get_instance(&cfg).unwrap();

        assert!(!root.path().join(&id).exists());
        assert_eq!(second.dir(), default_cache_root().join(&id));
        assert_eq!(second.state(), InstanceState::Active);
        assert_eq!(registry.size(), 1);

        second.clear(true).unwrap();
    }

    #[test]
    fn test_unique_cache_identifier() {
        let root = TempDir::new().unwrap();
        let registry = CacheRegistry::new();
        let a = root.path().join("a").join("dem.tif");
        let b = root.path().join("b").join("dem.tif");
        let c = root.path().join("c").join("dem.png");

        assert_eq!(registry.unique_cache_identifier(&a).unwrap(), "dem");
        assert_eq!(registry.unique_cache_identifier(&b).unwrap(), "1_dem");
        assert_eq!(registry.unique_cache_identifier(&c).unwrap(), "2_dem");
        assert_eq!(registry.unique_cache_identifier(&a).unwrap(), "dem");
        assert_eq!(registry.unique_cache_identifier(&b).unwrap(), "1_dem");
        assert!(registry.unique_cache_identifier(Path::new("/")).is_err());
    }

    #[test]
    fn test_no_cache_markers() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("ortho.tif");
        assert!(!has_no_cache_marker(&source, 0));

        std::fs::write(&source, b"").unwrap();
        assert!(!has_no_cache_marker(&source, 0));

        std::fs::write(root.path().join("ortho.tif.no-cache-2"), b"").unwrap();
        assert!(has_no_cache_marker(&source, 2));
        assert!(!has_no_cache_marker(&source, 1));

        std::fs::write(root.path().join("ortho.tif.no-cache"), b"").unwrap();
        assert!(has_no_cache_marker(&source, 1));
    }
}
