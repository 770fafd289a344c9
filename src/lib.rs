//! Prefsync - Client-Side Preference Synchronization Engine
//!
//! A versioned, per-user key-value document that stays consistent across
//! multiple concurrently open sessions for the same logical user:
//! - Optimistic local mutation with a durable Sled-backed cache
//! - Debounced, coalesced persistence to a server-of-record
//! - Optimistic cross-session broadcast ahead of persistence confirmation
//! - Version-gated application of remote updates with a single-slot queue
//! - Batched change notifications (one subscriber callback per window)
//!
//! The engine is event-driven and single-task: timer firings and channel
//! message handling interleave on one logical task driven by
//! [`SyncCoordinator::run`] or, in tests, by explicit [`SyncCoordinator::poll`]
//! calls with synthetic instants.

pub mod backend;
pub mod storage;
pub mod sync;

pub use backend::{FetchResponse, HttpBackend, PreferenceBackend, SaveOutcome, SaveRequest};
pub use storage::{CacheConfig, CachedDocument, PreferenceCache};
pub use sync::coordinator::{SetOptions, SyncCoordinator};
pub use sync::notify::Subscription;
pub use sync::protocol::{ChannelInbound, ChannelOutbound, ChannelTransport};
pub use sync::{SyncConfig, SyncError, SyncResult};
