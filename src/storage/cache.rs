//! Sled-backed preference cache.
//!
//! One named tree maps user ids to JSON-encoded [`CachedDocument`] values.
//! Writes happen synchronously on the mutation path, so the flush interval
//! only bounds how much a hard crash can lose, not what a reload sees.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{CacheConfig, CacheResult, CachedDocument};

const TREE_PREFERENCES: &str = "preferences";

/// Durable key-value cache scoped by user identifier
#[derive(Clone)]
pub struct PreferenceCache {
    db: Arc<Db>,
    preferences: Tree,
}

impl PreferenceCache {
    /// Open or create the cache at the configured path
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                super::CacheError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let preferences = db.open_tree(TREE_PREFERENCES)?;

        Ok(Self {
            db: Arc::new(db),
            preferences,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> CacheResult<Self> {
        Self::open(CacheConfig::default())
    }

    /// Load the cached document for a user
    pub fn load(&self, user_id: &str) -> CacheResult<Option<CachedDocument>> {
        match self.preferences.get(user_id.as_bytes())? {
            Some(bytes) => {
                let cached: CachedDocument = serde_json::from_slice(&bytes)?;
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    /// Store the document for a user, replacing any previous snapshot
    pub fn store(&self, user_id: &str, doc: &CachedDocument) -> CacheResult<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.preferences.insert(user_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Remove the cached document for a user
    pub fn clear(&self, user_id: &str) -> CacheResult<()> {
        self.preferences.remove(user_id.as_bytes())?;
        Ok(())
    }

    /// Whether a snapshot exists for a user
    pub fn contains(&self, user_id: &str) -> CacheResult<bool> {
        Ok(self.preferences.contains_key(user_id.as_bytes())?)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> CacheResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for PreferenceCache {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tempfile::tempdir;

    fn test_cache() -> (tempfile::TempDir, PreferenceCache) {
        let dir = tempdir().unwrap();
        let config = CacheConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let cache = PreferenceCache::open(config).unwrap();
        (dir, cache)
    }

    fn sample_prefs() -> Map<String, serde_json::Value> {
        let mut prefs = Map::new();
        prefs.insert("theme".to_string(), json!({"mode": "dark"}));
        prefs.insert("dashboard".to_string(), json!({"columns": 3}));
        prefs
    }

    #[test]
    fn test_store_load_round_trip() {
        let (_dir, cache) = test_cache();
        let doc = CachedDocument::new(sample_prefs(), 12);

        cache.store("user-1", &doc).unwrap();
        let loaded = cache.load("user-1").unwrap().unwrap();

        assert_eq!(loaded.preferences, doc.preferences);
        assert_eq!(loaded.version, 12);
    }

    #[test]
    fn test_load_missing_user() {
        let (_dir, cache) = test_cache();
        assert!(cache.load("nobody").unwrap().is_none());
    }

    #[test]
    fn test_users_are_isolated() {
        let (_dir, cache) = test_cache();
        cache
            .store("user-1", &CachedDocument::new(sample_prefs(), 1))
            .unwrap();
        cache
            .store("user-2", &CachedDocument::new(Map::new(), 8))
            .unwrap();

        assert_eq!(cache.load("user-1").unwrap().unwrap().version, 1);
        assert_eq!(cache.load("user-2").unwrap().unwrap().version, 8);
    }

    #[test]
    fn test_clear() {
        let (_dir, cache) = test_cache();
        cache
            .store("user-1", &CachedDocument::new(sample_prefs(), 1))
            .unwrap();

        assert!(cache.contains("user-1").unwrap());
        cache.clear("user-1").unwrap();
        assert!(!cache.contains("user-1").unwrap());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sled").to_string_lossy().to_string();

        {
            let cache = PreferenceCache::open(CacheConfig::new(path.clone())).unwrap();
            cache
                .store("user-1", &CachedDocument::new(sample_prefs(), 42))
                .unwrap();
            cache.flush().unwrap();
        }

        let cache = PreferenceCache::open(CacheConfig::new(path)).unwrap();
        let loaded = cache.load("user-1").unwrap().unwrap();
        assert_eq!(loaded.version, 42);
        assert_eq!(loaded.preferences.get("theme"), Some(&json!({"mode": "dark"})));
    }
}
