//! Remote update gate: decide whether an inbound document replaces local
//! state now, waits its turn, or is discarded.
//!
//! The gate enforces three invariants: a session never applies its own
//! broadcasts, the effective version never goes backward, and a remote
//! update never overwrites an edit in progress. Updates that arrive while
//! the session is busy are parked in a single slot; only the newest parked
//! update survives.

use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::SessionId;

/// A buffered remote update awaiting application once local activity
/// quiesces
#[derive(Debug, Clone)]
pub struct PendingRemoteUpdate {
    pub preferences: Map<String, Value>,
    pub version: u64,
    pub changed_keys: Vec<String>,
}

/// Outcome of gating an inbound document message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Message originated from this very session; drop it
    SelfEcho,
    /// Version not strictly greater than the local one; drop it
    Stale,
    /// Local activity in progress; message parked for later
    Queued,
    /// Message may replace the document immediately
    Apply,
}

/// Single-slot queue plus the gating decision logic
#[derive(Debug, Default)]
pub struct RemoteUpdateGate {
    pending: Option<PendingRemoteUpdate>,
}

impl RemoteUpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an inbound message. `busy` is true while the interaction
    /// lock is held, dirty keys exist, or a save is in flight.
    pub fn decide(
        &self,
        origin: Option<&str>,
        own_session: &SessionId,
        version: u64,
        current_version: u64,
        busy: bool,
    ) -> GateDecision {
        if origin == Some(own_session.as_str()) {
            trace!(version, "discarding self-echoed broadcast");
            return GateDecision::SelfEcho;
        }
        if version <= current_version {
            trace!(version, current_version, "discarding stale remote update");
            return GateDecision::Stale;
        }
        if busy {
            GateDecision::Queued
        } else {
            GateDecision::Apply
        }
    }

    /// Park an update, superseding any previously queued one
    pub fn queue(&mut self, update: PendingRemoteUpdate) {
        if let Some(old) = &self.pending {
            debug!(
                superseded = old.version,
                queued = update.version,
                "replacing queued remote update"
            );
        }
        self.pending = Some(update);
    }

    /// Whether an update is parked
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the parked update if its version still beats the current one;
    /// a superseded update is dropped as stale either way.
    pub fn take_applicable(&mut self, current_version: u64) -> Option<PendingRemoteUpdate> {
        let pending = self.pending.take()?;
        if pending.version > current_version {
            Some(pending)
        } else {
            debug!(
                version = pending.version,
                current_version, "dropping queued remote update, no longer newer"
            );
            None
        }
    }

    /// Drop any parked update (identity switch)
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn update(version: u64) -> PendingRemoteUpdate {
        PendingRemoteUpdate {
            preferences: Map::new(),
            version,
            changed_keys: vec!["theme".to_string()],
        }
    }

    #[test]
    fn test_self_echo_discarded() {
        let gate = RemoteUpdateGate::new();
        let session = "sess-a".to_string();
        let decision = gate.decide(Some("sess-a"), &session, 10, 1, false);
        assert_eq!(decision, GateDecision::SelfEcho);
    }

    #[test]
    fn test_stale_version_discarded() {
        let gate = RemoteUpdateGate::new();
        let session = "sess-a".to_string();

        assert_eq!(
            gate.decide(Some("sess-b"), &session, 5, 5, false),
            GateDecision::Stale
        );
        assert_eq!(
            gate.decide(Some("sess-b"), &session, 4, 5, false),
            GateDecision::Stale
        );
    }

    #[test]
    fn test_busy_queues_newer_version() {
        let gate = RemoteUpdateGate::new();
        let session = "sess-a".to_string();

        assert_eq!(
            gate.decide(Some("sess-b"), &session, 6, 5, true),
            GateDecision::Queued
        );
        assert_eq!(
            gate.decide(Some("sess-b"), &session, 6, 5, false),
            GateDecision::Apply
        );
    }

    #[test]
    fn test_server_originated_message_passes_echo_check() {
        let gate = RemoteUpdateGate::new();
        let session = "sess-a".to_string();
        assert_eq!(gate.decide(None, &session, 6, 5, false), GateDecision::Apply);
    }

    #[test]
    fn test_newest_queued_update_wins() {
        let mut gate = RemoteUpdateGate::new();
        gate.queue(update(6));
        gate.queue(update(8));

        let taken = gate.take_applicable(5).unwrap();
        assert_eq!(taken.version, 8);
        assert!(!gate.has_pending());
    }

    #[test]
    fn test_superseded_queued_update_dropped_on_drain() {
        let mut gate = RemoteUpdateGate::new();
        gate.queue(update(6));

        // A save confirmed version 7 while the update was parked
        assert!(gate.take_applicable(7).is_none());
        assert!(!gate.has_pending());
    }
}
