//! Coalesced change notifications for UI subscribers.
//!
//! One logical change must not cause N renders: changed top-level keys
//! accumulate into a pending set behind a single short timer, and every
//! subscriber is invoked once per window with `(is_remote, changed_keys)`.
//! Subscribers hold explicit [`Subscription`] tokens; cancelling from inside
//! a callback is safe because dispatch runs over a snapshot of the registry.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Callback invoked with `(is_remote, changed_top_level_keys)`
pub type ChangeCallback = Arc<dyn Fn(bool, &[String]) + Send + Sync>;

/// Handle for an active subscriber registration
pub struct Subscription {
    id: u64,
    registry: Arc<DashMap<u64, ChangeCallback>>,
}

impl Subscription {
    /// Unregister the callback. Safe to call at any time, including from
    /// inside a notification callback.
    pub fn cancel(&self) {
        self.registry.remove(&self.id);
    }

    /// Whether the callback is still registered
    pub fn is_active(&self) -> bool {
        self.registry.contains_key(&self.id)
    }
}

/// Accumulates changed keys and fans them out once per coalescing window
pub struct NotificationBatcher {
    registry: Arc<DashMap<u64, ChangeCallback>>,
    next_id: AtomicU64,
    pending: BTreeSet<String>,
    pending_remote: bool,
    deadline: Option<Instant>,
    window: Duration,
}

impl NotificationBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            pending: BTreeSet::new(),
            pending_remote: false,
            deadline: None,
            window,
        }
    }

    /// Register a subscriber callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool, &[String]) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: self.registry.clone(),
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Add changed keys to the pending batch. The first call in a window
    /// arms the timer; later calls accumulate without extending it. A batch
    /// containing any remote-applied change reports `is_remote = true`.
    pub fn enqueue<I>(&mut self, keys: I, is_remote: bool, now: Instant)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut added = false;
        for key in keys {
            self.pending.insert(key.into());
            added = true;
        }
        if !added {
            return;
        }
        self.pending_remote |= is_remote;
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// Whether the pending batch is ready to dispatch
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(at) if now >= at)
    }

    /// Next wakeup needed by the batch timer, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Dispatch the pending batch to every subscriber, then clear state
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            self.deadline = None;
            self.pending_remote = false;
            return;
        }

        let keys: Vec<String> = std::mem::take(&mut self.pending).into_iter().collect();
        let is_remote = std::mem::take(&mut self.pending_remote);
        self.deadline = None;

        trace!(remote = is_remote, keys = ?keys, "notifying subscribers");

        // Snapshot so callbacks may cancel subscriptions mid-dispatch
        let callbacks: Vec<ChangeCallback> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        for callback in callbacks {
            callback(is_remote, &keys);
        }
    }

    /// Drop any pending batch without dispatching (identity switch)
    pub fn cancel_pending(&mut self) {
        self.pending.clear();
        self.pending_remote = false;
        self.deadline = None;
    }
}
