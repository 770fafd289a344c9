//! Preference synchronization engine.
//!
//! This module implements the core engine for keeping a versioned per-user
//! preference document consistent across sessions:
//! - Dotted-path document store with dirty-key tracking
//! - Debounce state machines for persistence and optimistic broadcast
//! - Version-gated remote update application with a single-slot queue
//! - Coalesced subscriber notifications

pub mod coordinator;
pub mod document;
pub mod gate;
pub mod notify;
pub mod protocol;
pub mod scheduler;

pub use coordinator::{SetOptions, SyncCoordinator};
pub use document::PreferenceDocument;

use std::time::Duration;
use thiserror::Error;

/// Unique identifier for a logical user
pub type UserId = String;

/// Opaque identifier for a running client session (one per process)
pub type SessionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::storage::CacheError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Invalid preference key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for sync behavior.
///
/// The broadcast window is materially shorter than the save window so other
/// sessions see changes ahead of durable persistence.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before a burst of mutations is persisted
    pub save_debounce: Duration,
    /// Quiet period before the document is broadcast to other sessions
    pub broadcast_debounce: Duration,
    /// Coalescing window for subscriber notifications (one frame)
    pub notify_window: Duration,
    /// Trailing quiet period before the interaction lock actually releases
    pub interaction_release: Duration,
    /// Interval between liveness heartbeats on the real-time channel
    pub heartbeat_interval: Duration,
    /// Fallback wakeup interval for the run loop when no timer is armed
    pub idle_tick: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(2000),
            broadcast_debounce: Duration::from_millis(300),
            notify_window: Duration::from_millis(16),
            interaction_release: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            idle_tick: Duration::from_millis(250),
        }
    }
}

impl SyncConfig {
    pub fn with_save_debounce(mut self, window: Duration) -> Self {
        self.save_debounce = window;
        self
    }

    pub fn with_broadcast_debounce(mut self, window: Duration) -> Self {
        self.broadcast_debounce = window;
        self
    }

    pub fn with_notify_window(mut self, window: Duration) -> Self {
        self.notify_window = window;
        self
    }

    pub fn with_interaction_release(mut self, window: Duration) -> Self {
        self.interaction_release = window;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert!(config.broadcast_debounce < config.save_debounce);
        assert!(config.notify_window < config.broadcast_debounce);
    }

    #[test]
    fn test_sync_config_builders() {
        let config = SyncConfig::default()
            .with_save_debounce(Duration::from_millis(100))
            .with_broadcast_debounce(Duration::from_millis(20));
        assert_eq!(config.save_debounce, Duration::from_millis(100));
        assert_eq!(config.broadcast_debounce, Duration::from_millis(20));
    }
}
