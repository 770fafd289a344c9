//! Sync coordinator: owns the preference document lifecycle.
//!
//! The coordinator wires the document store, local cache, debounce
//! schedulers, remote update gate, and notification batcher together and is
//! the only component that mutates the document. It is an explicit context
//! object constructed once at application boot and passed by reference to
//! consumers; tests construct a fresh instance each.
//!
//! Everything runs on one logical task: mutations and channel messages are
//! synchronous, and the only suspension points are the backend calls for
//! persistence and fetch. [`SyncCoordinator::run`] is the production driver;
//! tests call [`SyncCoordinator::poll`] with synthetic instants instead.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::backend::{PreferenceBackend, SaveOutcome, SaveRequest};
use crate::storage::{CachedDocument, PreferenceCache};

use super::document::{changed_top_level, PreferenceDocument};
use super::gate::{GateDecision, PendingRemoteUpdate, RemoteUpdateGate};
use super::notify::{NotificationBatcher, Subscription};
use super::protocol::{ChannelInbound, ChannelOutbound, ChannelTransport};
use super::scheduler::{Debouncer, InteractionLock};
use super::{SessionId, SyncConfig, SyncResult, UserId};

/// Per-call toggles for the pipelines a mutation triggers.
///
/// All pipelines are on by default; `sync` without `debounce` persists on
/// the next poll instead of after the quiet period.
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Persist to the durable store
    pub sync: bool,
    /// Debounce the persistence call (ignored when `sync` is off)
    pub debounce: bool,
    /// Push optimistically to other sessions
    pub broadcast: bool,
    /// Notify local subscribers
    pub notify_local: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            sync: true,
            debounce: true,
            broadcast: true,
            notify_local: true,
        }
    }
}

impl SetOptions {
    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.sync = enabled;
        self
    }

    pub fn with_debounce(mut self, enabled: bool) -> Self {
        self.debounce = enabled;
        self
    }

    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn with_notify_local(mut self, enabled: bool) -> Self {
        self.notify_local = enabled;
        self
    }
}

/// Orchestrates optimistic local mutation, debounced persistence,
/// optimistic broadcast, and gated remote application for one logical user
pub struct SyncCoordinator {
    config: SyncConfig,
    user_id: UserId,
    session_id: SessionId,
    /// Bumped on identity switch; suspended calls compare before applying
    /// their results
    epoch: u64,
    document: PreferenceDocument,
    cache: PreferenceCache,
    backend: Arc<dyn PreferenceBackend>,
    transport: Arc<dyn ChannelTransport>,
    save: Debouncer,
    broadcast: Debouncer,
    lock: InteractionLock,
    gate: RemoteUpdateGate,
    notifier: NotificationBatcher,
    /// Sessions currently in this user's room, self included
    session_count: u32,
    heartbeat_at: Option<Instant>,
}

impl SyncCoordinator {
    pub fn new(
        user_id: impl Into<String>,
        cache: PreferenceCache,
        backend: Arc<dyn PreferenceBackend>,
        transport: Arc<dyn ChannelTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            save: Debouncer::new(config.save_debounce),
            broadcast: Debouncer::new(config.broadcast_debounce),
            lock: InteractionLock::new(config.interaction_release),
            notifier: NotificationBatcher::new(config.notify_window),
            config,
            user_id: user_id.into(),
            session_id: Uuid::new_v4().to_string(),
            epoch: 0,
            document: PreferenceDocument::new(),
            cache,
            backend,
            transport,
            gate: RemoteUpdateGate::new(),
            session_count: 1,
            heartbeat_at: None,
        }
    }

    /// This session's identifier, generated once per process
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The logical user the document belongs to
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Last server-confirmed document version
    pub fn version(&self) -> u64 {
        self.document.version()
    }

    /// Sessions currently known to be in this user's room
    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    /// Whether any local change is not yet confirmed persisted
    pub fn has_pending_changes(&self) -> bool {
        self.document.has_dirty()
    }

    // =========================================================================
    // Startup and identity
    // =========================================================================

    /// Startup sequencing: hydrate from the local cache so the UI can render
    /// immediately, join the per-user room, then reconcile against the
    /// server-of-record. A failed authoritative fetch degrades to cache-only
    /// operation and is not an error.
    pub async fn start(&mut self, now: Instant) -> SyncResult<()> {
        match self.cache.load(&self.user_id) {
            Ok(Some(cached)) => {
                info!(
                    user = %self.user_id,
                    version = cached.version,
                    "hydrated preferences from local cache"
                );
                self.document = PreferenceDocument::from_parts(cached.preferences, cached.version);
            }
            Ok(None) => {
                debug!(user = %self.user_id, "no cached preferences");
            }
            Err(e) => {
                warn!("failed to load preference cache: {}", e);
            }
        }

        self.join_room();
        self.heartbeat_at = Some(now + self.config.heartbeat_interval);

        let epoch = self.epoch;
        match self.backend.fetch(&self.user_id).await {
            _ if self.epoch != epoch => {}
            Ok(authoritative) => {
                let changed = self
                    .document
                    .replace(authoritative.preferences, authoritative.version);
                self.document.clear_dirty();
                self.persist_cache();
                info!(
                    version = self.document.version(),
                    "reconciled with authoritative preferences"
                );
                if !changed.is_empty() {
                    self.notifier.enqueue(changed, true, now);
                }
            }
            Err(e) => {
                warn!("authoritative fetch failed, continuing from cache: {}", e);
            }
        }

        Ok(())
    }

    /// Tear down all state for the current identity and restart for a new
    /// one (impersonation start/end). Any timer or in-flight call belonging
    /// to the previous identity is invalidated.
    pub async fn switch_identity(&mut self, user_id: impl Into<String>, now: Instant) -> SyncResult<()> {
        let user_id = user_id.into();
        info!(from = %self.user_id, to = %user_id, "switching identity");

        self.epoch += 1;
        self.save.cancel();
        self.broadcast.cancel();
        self.lock.cancel();
        self.gate.clear();
        self.notifier.cancel_pending();
        self.document.reset();
        self.session_count = 1;
        self.heartbeat_at = None;
        self.user_id = user_id;

        self.start(now).await
    }

    // =========================================================================
    // Local reads and mutations
    // =========================================================================

    /// Read a value by dotted path
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    /// Read a value by dotted path with a fallback
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.document.get_or(key, default)
    }

    /// Read a value by dotted path into a concrete type
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.document.get_as(key)
    }

    /// Set a value by dotted path. Returns false for a deep-equal no-op, in
    /// which case no pipeline fires.
    pub fn set(&mut self, key: &str, value: Value, options: SetOptions, now: Instant) -> bool {
        let Some(top) = self.document.set(key, value) else {
            trace!(key, "set is a no-op");
            return false;
        };
        self.after_local_change(vec![top], options, now);
        true
    }

    /// Apply a batch of dotted-path assignments with one
    /// notification/broadcast/save cycle. Returns the union of changed
    /// top-level keys.
    pub fn set_many<I>(&mut self, entries: I, options: SetOptions, now: Instant) -> Vec<String>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let changed = self.document.apply_many(entries);
        if !changed.is_empty() {
            self.after_local_change(changed.clone(), options, now);
        }
        changed
    }

    /// Remove a dotted key path locally and on the durable store. The
    /// dedicated delete call is fired eagerly; if it fails the key is marked
    /// dirty so the debounced full-document save carries the deletion.
    pub async fn delete(&mut self, key: &str, now: Instant) -> SyncResult<bool> {
        let Some(top) = self.document.remove(key) else {
            return Ok(false);
        };

        self.persist_cache();
        self.notifier.enqueue([top.clone()], false, now);
        self.broadcast.arm(now);

        let epoch = self.epoch;
        match self.backend.remove_key(&self.user_id, key).await {
            _ if self.epoch != epoch => {}
            Ok(version) => {
                if version > self.document.version() {
                    self.document.confirm_saved(&[], version);
                    self.persist_cache();
                }
                debug!(key, version, "preference deleted");
            }
            Err(e) => {
                warn!(key, "delete failed, deferring to next save: {}", e);
                self.document.mark_dirty(top);
                self.save.arm(now);
            }
        }

        Ok(true)
    }

    /// Remove several dotted key paths with one backend round trip. Returns
    /// the affected top-level keys.
    pub async fn delete_many(&mut self, keys: &[String], now: Instant) -> SyncResult<Vec<String>> {
        let mut removed_paths = Vec::new();
        let mut tops = BTreeSet::new();
        for key in keys {
            if let Some(top) = self.document.remove(key) {
                removed_paths.push(key.clone());
                tops.insert(top);
            }
        }
        if tops.is_empty() {
            return Ok(Vec::new());
        }

        self.persist_cache();
        self.notifier.enqueue(tops.iter().cloned(), false, now);
        self.broadcast.arm(now);

        let epoch = self.epoch;
        match self.backend.remove_keys(&self.user_id, &removed_paths).await {
            _ if self.epoch != epoch => {}
            Ok(version) => {
                if version > self.document.version() {
                    self.document.confirm_saved(&[], version);
                    self.persist_cache();
                }
                debug!(count = removed_paths.len(), version, "preferences batch-deleted");
            }
            Err(e) => {
                warn!("batch delete failed, deferring to next save: {}", e);
                for top in &tops {
                    self.document.mark_dirty(top.clone());
                }
                self.save.arm(now);
            }
        }

        Ok(tops.into_iter().collect())
    }

    fn after_local_change(&mut self, changed: Vec<String>, options: SetOptions, now: Instant) {
        self.persist_cache();

        if options.sync {
            for key in &changed {
                self.document.mark_dirty(key.clone());
            }
            if options.debounce {
                self.save.arm(now);
            } else {
                self.save.arm_immediate(now);
            }
        }
        if options.broadcast {
            self.broadcast.arm(now);
        }
        if options.notify_local {
            self.notifier.enqueue(changed, false, now);
        }
    }

    // =========================================================================
    // Subscribers and the interaction lock
    // =========================================================================

    /// Register a subscriber invoked once per coalescing window with
    /// `(is_remote, changed_keys)`
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool, &[String]) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Engage or release the interaction lock. Engaging holds the lock
    /// indefinitely; releasing starts the trailing quiet timer.
    pub fn set_interaction_lock(&mut self, engaged: bool, now: Instant) {
        if engaged {
            self.lock.engage();
        } else {
            self.lock.release(now);
        }
    }

    /// Whether the interaction lock currently suppresses remote updates
    pub fn interaction_locked(&self) -> bool {
        self.lock.is_engaged()
    }

    // =========================================================================
    // Inbound channel messages
    // =========================================================================

    /// Process one message from the real-time channel
    pub fn handle_channel_message(&mut self, msg: ChannelInbound, now: Instant) {
        match msg {
            ChannelInbound::Joined {
                room,
                session_count,
            } => {
                info!(room, session_count, "joined preference room");
                self.session_count = session_count;
            }
            ChannelInbound::SessionCountUpdated { session_count } => {
                debug!(session_count, "session count updated");
                self.session_count = session_count;
            }
            ChannelInbound::PreferencesUpdated {
                preferences,
                version,
                origin_session_id,
            } => {
                let busy = self.lock.is_engaged()
                    || self.document.has_dirty()
                    || self.save.is_in_flight();

                let decision = self.gate.decide(
                    origin_session_id.as_deref(),
                    &self.session_id,
                    version,
                    self.document.version(),
                    busy,
                );
                match decision {
                    GateDecision::SelfEcho | GateDecision::Stale => {}
                    GateDecision::Queued => {
                        let changed_keys = changed_top_level(self.document.root(), &preferences);
                        debug!(version, ?changed_keys, "queueing remote update, session busy");
                        self.gate.queue(PendingRemoteUpdate {
                            preferences,
                            version,
                            changed_keys,
                        });
                    }
                    GateDecision::Apply => {
                        self.apply_remote(preferences, version, now);
                    }
                }
            }
        }
    }

    fn apply_remote(&mut self, preferences: Map<String, Value>, version: u64, now: Instant) {
        let changed = self.document.replace(preferences, version);
        self.persist_cache();
        debug!(version, ?changed, "applied remote preferences");
        if !changed.is_empty() {
            self.notifier.enqueue(changed, true, now);
        }
    }

    fn drain_queued(&mut self, now: Instant) {
        if let Some(pending) = self.gate.take_applicable(self.document.version()) {
            self.apply_remote(pending.preferences, pending.version, now);
        }
    }

    // =========================================================================
    // Timer-driven work
    // =========================================================================

    /// Fire every timer whose deadline has passed. Safe to call at any
    /// frequency; tests drive this with synthetic instants.
    pub async fn poll(&mut self, now: Instant) {
        if self.lock.poll_release(now) {
            debug!("interaction lock released");
            self.drain_queued(now);
        }

        if self.broadcast.is_due(now) {
            self.broadcast.reset();
            self.emit_broadcast();
        }

        if self.save.is_due(now) {
            self.flush_save(now).await;
        }

        if let Some(at) = self.heartbeat_at {
            if now >= at {
                self.emit_heartbeat();
                self.heartbeat_at = Some(now + self.config.heartbeat_interval);
            }
        }

        if self.notifier.is_due(now) {
            self.notifier.flush();
        }
    }

    /// Persist immediately, bypassing the debounce window. Returns true if
    /// no dirty keys remain afterwards.
    pub async fn force_sync(&mut self, now: Instant) -> bool {
        if !self.document.has_dirty() {
            return true;
        }
        self.flush_save(now).await;
        !self.document.has_dirty()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self, now: Instant) -> Instant {
        let mut deadline = now + self.config.idle_tick;
        let candidates = [
            self.save.deadline(),
            self.broadcast.deadline(),
            self.lock.deadline(),
            self.notifier.deadline(),
            self.heartbeat_at,
        ];
        for candidate in candidates.into_iter().flatten() {
            if candidate < deadline {
                deadline = candidate;
            }
        }
        deadline
    }

    /// Event loop: interleaves timer firings with inbound channel messages
    /// on one logical task until the channel closes or shutdown is signaled
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ChannelInbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            self.poll(Instant::now()).await;
            let deadline = self.next_deadline(Instant::now());

            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_channel_message(msg, Instant::now()),
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!("sync coordinator shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.cache.flush() {
            warn!("final cache flush failed: {}", e);
        }
    }

    // =========================================================================
    // Outbound pipelines
    // =========================================================================

    fn emit_broadcast(&self) {
        if self.session_count <= 1 {
            trace!("skipping broadcast, no other sessions");
            return;
        }
        if !self.transport.is_connected() {
            debug!("skipping broadcast, channel disconnected");
            return;
        }

        let msg = ChannelOutbound::BroadcastPreferences {
            user_id: self.user_id.clone(),
            preferences: self.document.root().clone(),
            // Optimistic: receivers trust this only until a confirmed save
            version: self.document.version() + 1,
            origin_session_id: self.session_id.clone(),
        };
        if let Err(e) = self.transport.send(msg) {
            warn!("broadcast failed: {}", e);
        }
    }

    fn emit_heartbeat(&self) {
        if !self.transport.is_connected() {
            return;
        }
        let msg = ChannelOutbound::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.transport.send(msg) {
            debug!("heartbeat failed: {}", e);
        }
    }

    fn join_room(&self) {
        if !self.transport.is_connected() {
            debug!("channel disconnected, skipping room join");
            return;
        }
        let msg = ChannelOutbound::Join {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        };
        if let Err(e) = self.transport.send(msg) {
            warn!("room join failed: {}", e);
        }
    }

    /// Run the persistence call with the document and dirty keys snapshotted
    /// at call time. At most one call is in flight; triggers that arrive
    /// mid-flight re-arm the timer after completion.
    async fn flush_save(&mut self, now: Instant) {
        if !self.document.has_dirty() {
            self.save.reset();
            return;
        }
        if self.save.is_in_flight() {
            return;
        }

        let snapshot_keys: Vec<String> = self.document.dirty_keys().iter().cloned().collect();
        let request = SaveRequest {
            user_id: self.user_id.clone(),
            preferences: self.document.root().clone(),
            version: Some(self.document.version()),
            session_id: self.session_id.clone(),
        };
        let epoch = self.epoch;

        self.save.begin_flight();
        let result = self.backend.save(request).await;

        if self.epoch != epoch {
            debug!("identity changed during save, discarding result");
            return;
        }
        let rearm = self.save.finish_flight();

        match result {
            Ok(SaveOutcome::Saved { version }) => {
                self.document.confirm_saved(&snapshot_keys, version);
                self.persist_cache();
                debug!(version, saved_keys = ?snapshot_keys, "preferences persisted");

                if rearm || self.document.has_dirty() {
                    self.save.arm(now);
                } else {
                    self.drain_queued(now);
                }
            }
            Ok(SaveOutcome::Conflict) => {
                warn!(
                    version = self.document.version(),
                    "version conflict, discarding local edits and refetching"
                );
                self.recover_from_conflict(now).await;
            }
            Err(e) => {
                // State stands; retried via the mid-flight rearm, the next
                // qualifying mutation, or force_sync
                warn!("save failed: {}", e);
                if rearm {
                    self.save.arm(now);
                }
            }
        }
    }

    /// Last-writer-wins conflict recovery: drop local state and adopt the
    /// server's document wholesale
    async fn recover_from_conflict(&mut self, now: Instant) {
        let epoch = self.epoch;
        match self.backend.fetch(&self.user_id).await {
            _ if self.epoch != epoch => {}
            Ok(authoritative) => {
                let changed = self
                    .document
                    .replace(authoritative.preferences, authoritative.version);
                self.document.clear_dirty();
                self.persist_cache();
                info!(
                    version = self.document.version(),
                    "recovered from version conflict"
                );
                if !changed.is_empty() {
                    self.notifier.enqueue(changed, true, now);
                }
                self.drain_queued(now);
            }
            Err(e) => {
                warn!("conflict recovery fetch failed: {}", e);
            }
        }
    }

    fn persist_cache(&self) {
        let cached = CachedDocument::new(self.document.root().clone(), self.document.version());
        if let Err(e) = self.cache.store(&self.user_id, &cached) {
            warn!("preference cache write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, FetchResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubBackend {
        version: AtomicU64,
        saves: Mutex<Vec<SaveRequest>>,
        fail_saves: AtomicBool,
    }

    impl StubBackend {
        fn new() -> Self {
            Self {
                version: AtomicU64::new(0),
                saves: Mutex::new(Vec::new()),
                fail_saves: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PreferenceBackend for StubBackend {
        async fn fetch(&self, _user_id: &str) -> BackendResult<FetchResponse> {
            Ok(FetchResponse {
                preferences: Map::new(),
                version: self.version.load(Ordering::SeqCst),
            })
        }

        async fn save(&self, request: SaveRequest) -> BackendResult<SaveOutcome> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(BackendError::Rejected("offline".to_string()));
            }
            self.saves.lock().unwrap().push(request);
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SaveOutcome::Saved { version })
        }

        async fn remove_key(&self, _user_id: &str, _key: &str) -> BackendResult<u64> {
            Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn remove_keys(&self, _user_id: &str, _keys: &[String]) -> BackendResult<u64> {
            Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    struct StubTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<ChannelOutbound>>,
    }

    impl StubTransport {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChannelTransport for StubTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send(&self, msg: ChannelOutbound) -> SyncResult<()> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    fn coordinator() -> (SyncCoordinator, Arc<StubBackend>, Arc<StubTransport>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = PreferenceCache::open(crate::storage::CacheConfig::new(
            dir.path().join("c.sled").to_string_lossy().to_string(),
        ))
        .unwrap();
        let backend = Arc::new(StubBackend::new());
        let transport = Arc::new(StubTransport::new());
        let config = SyncConfig::default()
            .with_save_debounce(Duration::from_millis(100))
            .with_broadcast_debounce(Duration::from_millis(20))
            .with_notify_window(Duration::from_millis(5));
        let coordinator = SyncCoordinator::new(
            "user-1",
            cache,
            backend.clone(),
            transport.clone(),
            config,
        );
        (coordinator, backend, transport, dir)
    }

    #[tokio::test]
    async fn test_noop_set_triggers_nothing() {
        let (mut c, backend, _t, _dir) = coordinator();
        let t0 = Instant::now();

        assert!(c.set("theme", json!("dark"), SetOptions::default(), t0));
        assert!(!c.set("theme", json!("dark"), SetOptions::default(), t0));

        c.poll(t0 + Duration::from_millis(200)).await;
        assert_eq!(backend.saves.lock().unwrap().len(), 1);
        assert!(!c.has_pending_changes());
    }

    #[tokio::test]
    async fn test_debounce_coalesces_saves() {
        let (mut c, backend, _t, _dir) = coordinator();
        let t0 = Instant::now();

        c.set("theme", json!("dark"), SetOptions::default(), t0);
        c.set(
            "theme",
            json!("light"),
            SetOptions::default(),
            t0 + Duration::from_millis(10),
        );

        // Within the window nothing is persisted yet
        c.poll(t0 + Duration::from_millis(50)).await;
        assert!(backend.saves.lock().unwrap().is_empty());

        c.poll(t0 + Duration::from_millis(110)).await;
        let saves = backend.saves.lock().unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].preferences.get("theme"), Some(&json!("light")));
    }

    #[tokio::test]
    async fn test_sync_disabled_keeps_change_local() {
        let (mut c, backend, _t, _dir) = coordinator();
        let t0 = Instant::now();

        c.set(
            "draft",
            json!(true),
            SetOptions::default().with_sync(false),
            t0,
        );

        c.poll(t0 + Duration::from_secs(10)).await;
        assert!(backend.saves.lock().unwrap().is_empty());
        assert_eq!(c.get("draft"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_broadcast_requires_other_sessions() {
        let (mut c, _b, transport, _dir) = coordinator();
        let t0 = Instant::now();

        c.set("theme", json!("dark"), SetOptions::default(), t0);
        c.poll(t0 + Duration::from_millis(30)).await;
        assert!(transport.sent.lock().unwrap().is_empty());

        // A second session appears
        c.handle_channel_message(
            ChannelInbound::SessionCountUpdated { session_count: 2 },
            t0,
        );
        c.set("theme", json!("light"), SetOptions::default(), t0);
        c.poll(t0 + Duration::from_millis(30)).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ChannelOutbound::BroadcastPreferences {
                version,
                origin_session_id,
                ..
            } => {
                // Optimistic version: confirmed + 1
                assert_eq!(*version, 1);
                assert_eq!(origin_session_id, c.session_id());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_failure_leaves_dirty_for_retry() {
        let (mut c, backend, _t, _dir) = coordinator();
        let t0 = Instant::now();

        backend.fail_saves.store(true, Ordering::SeqCst);
        c.set("theme", json!("dark"), SetOptions::default(), t0);
        c.poll(t0 + Duration::from_millis(110)).await;

        assert!(c.has_pending_changes());

        backend.fail_saves.store(false, Ordering::SeqCst);
        assert!(c.force_sync(t0 + Duration::from_millis(120)).await);
        assert!(!c.has_pending_changes());
    }

    #[tokio::test]
    async fn test_remote_update_applied_when_idle() {
        let (mut c, _b, _t, _dir) = coordinator();
        let t0 = Instant::now();

        let mut prefs = Map::new();
        prefs.insert("theme".to_string(), json!("light"));
        c.handle_channel_message(
            ChannelInbound::PreferencesUpdated {
                preferences: prefs,
                version: 3,
                origin_session_id: Some("other-session".to_string()),
            },
            t0,
        );

        assert_eq!(c.get("theme"), Some(&json!("light")));
        assert_eq!(c.version(), 3);
    }

    #[tokio::test]
    async fn test_self_echo_never_mutates() {
        let (mut c, _b, _t, _dir) = coordinator();
        let t0 = Instant::now();

        let own = c.session_id().to_string();
        let mut prefs = Map::new();
        prefs.insert("theme".to_string(), json!("light"));
        c.handle_channel_message(
            ChannelInbound::PreferencesUpdated {
                preferences: prefs,
                version: 99,
                origin_session_id: Some(own),
            },
            t0,
        );

        assert!(c.get("theme").is_none());
        assert_eq!(c.version(), 0);
    }

    #[tokio::test]
    async fn test_delete_confirms_fresh_version() {
        let (mut c, _b, _t, _dir) = coordinator();
        let t0 = Instant::now();

        c.set("theme.mode", json!("dark"), SetOptions::default(), t0);
        c.poll(t0 + Duration::from_millis(110)).await;
        assert_eq!(c.version(), 1);

        assert!(c.delete("theme.mode", t0 + Duration::from_millis(120)).await.unwrap());
        assert!(c.get("theme.mode").is_none());
        assert_eq!(c.version(), 2);
        assert!(!c.has_pending_changes());
    }
}
