//! Durable local cache for preference snapshots.
//!
//! The last known document and its version are written to an embedded Sled
//! database on every accepted mutation, so a reload never loses
//! confirmed-plus-optimistic state and the engine can render with zero
//! latency before any network round trip.

mod cache;

pub use cache::PreferenceCache;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The cached state for one logical user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDocument {
    /// Full preference tree
    pub preferences: Map<String, Value>,
    /// Last known document version
    pub version: u64,
    /// Unix timestamp of the last cache write
    pub updated_at: i64,
}

impl CachedDocument {
    pub fn new(preferences: Map<String, Value>, version: u64) -> Self {
        Self {
            preferences,
            version,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Configuration for the local cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "./data/prefsync.sled".to_string(),
            cache_size: 32 * 1024 * 1024, // 32MB, preferences are small
            flush_interval_ms: 500,
        }
    }
}

impl CacheConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval: u64) -> Self {
        self.flush_interval_ms = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_document_timestamps() {
        let doc = CachedDocument::new(Map::new(), 3);
        assert_eq!(doc.version, 3);
        assert!(doc.updated_at > 0);
    }

    #[test]
    fn test_cache_config_builders() {
        let config = CacheConfig::new("/tmp/x.sled").with_cache_size(1024);
        assert_eq!(config.path, "/tmp/x.sled");
        assert_eq!(config.cache_size, 1024);
    }
}
