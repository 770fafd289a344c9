//! Debounce state machines and the interaction lock.
//!
//! Both the save and broadcast pipelines are driven by a single debounce
//! timer each. The armed / in-flight / idle states are explicit enum
//! variants with transition methods, so the no-concurrent-save and
//! retry-after-completion rules are enforced by matching on state rather
//! than by scattered boolean flags.

use std::time::{Duration, Instant};

/// State of a debounced action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Nothing scheduled
    Idle,
    /// Timer armed; fires once the deadline passes
    Armed { deadline: Instant },
    /// Action currently running; `rearm` records a trigger that arrived
    /// mid-flight
    InFlight { rearm: bool },
}

/// Single debounce timer coalescing a burst of triggers into one action
#[derive(Debug, Clone)]
pub struct Debouncer {
    state: DebounceState,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            state: DebounceState::Idle,
            window,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, DebounceState::InFlight { .. })
    }

    /// (Re)arm the timer. While the action is in flight the trigger is
    /// recorded instead; the caller re-arms after completion.
    pub fn arm(&mut self, now: Instant) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::Armed { .. } => DebounceState::Armed {
                deadline: now + self.window,
            },
            DebounceState::InFlight { .. } => DebounceState::InFlight { rearm: true },
        };
    }

    /// Arm with a deadline of `now`, so the action fires on the next poll
    pub fn arm_immediate(&mut self, now: Instant) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::Armed { .. } => {
                DebounceState::Armed { deadline: now }
            }
            DebounceState::InFlight { .. } => DebounceState::InFlight { rearm: true },
        };
    }

    /// Whether the armed deadline has passed
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, DebounceState::Armed { deadline } if now >= deadline)
    }

    /// Next wakeup needed by this timer, if any
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Transition Armed -> InFlight before running the action
    pub fn begin_flight(&mut self) {
        self.state = DebounceState::InFlight { rearm: false };
    }

    /// Transition Armed -> Idle for actions that complete synchronously
    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
    }

    /// Complete the in-flight action. Returns true when a trigger arrived
    /// mid-flight and the caller should re-arm.
    pub fn finish_flight(&mut self) -> bool {
        let rearm = matches!(self.state, DebounceState::InFlight { rearm: true });
        self.state = DebounceState::Idle;
        rearm
    }

    /// Forcibly clear any armed or in-flight state (identity switch)
    pub fn cancel(&mut self) {
        self.state = DebounceState::Idle;
    }
}

/// Timed guard suppressing remote-update application while the user is
/// mid-gesture.
///
/// Engaging holds the lock indefinitely; releasing starts a trailing quiet
/// timer, and only an uninterrupted quiet period actually clears the lock.
/// A rapid engage/release sequence (drag-move events) keeps the lock
/// continuously held.
#[derive(Debug, Clone)]
pub struct InteractionLock {
    engaged: bool,
    release_at: Option<Instant>,
    release_window: Duration,
}

impl InteractionLock {
    pub fn new(release_window: Duration) -> Self {
        Self {
            engaged: false,
            release_at: None,
            release_window,
        }
    }

    /// Whether remote updates must currently be suppressed
    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Hold the lock and cancel any pending release
    pub fn engage(&mut self) {
        self.engaged = true;
        self.release_at = None;
    }

    /// Start (or restart) the trailing release timer
    pub fn release(&mut self, now: Instant) {
        if self.engaged {
            self.release_at = Some(now + self.release_window);
        }
    }

    /// Clear the lock if the trailing timer elapsed uninterrupted. Returns
    /// true exactly when the lock transitions from held to clear.
    pub fn poll_release(&mut self, now: Instant) -> bool {
        match self.release_at {
            Some(at) if now >= at => {
                self.engaged = false;
                self.release_at = None;
                true
            }
            _ => false,
        }
    }

    /// Next wakeup needed by the release timer, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.release_at
    }

    /// Forcibly clear all lock state (identity switch)
    pub fn cancel(&mut self) {
        self.engaged = false;
        self.release_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn test_debouncer_arm_and_fire() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();

        assert!(!d.is_due(t0));
        d.arm(t0);
        assert!(!d.is_due(t0 + Duration::from_millis(50)));
        assert!(d.is_due(t0 + WINDOW));
    }

    #[test]
    fn test_debouncer_rearm_extends_deadline() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();

        d.arm(t0);
        d.arm(t0 + Duration::from_millis(80));

        // Original deadline passed, extended one not yet
        assert!(!d.is_due(t0 + WINDOW));
        assert!(d.is_due(t0 + Duration::from_millis(180)));
    }

    #[test]
    fn test_debouncer_trigger_while_in_flight() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();

        d.arm(t0);
        d.begin_flight();
        assert!(d.is_in_flight());

        // A trigger mid-flight must not start a second concurrent action
        d.arm(t0 + Duration::from_millis(10));
        assert!(d.is_in_flight());
        assert!(!d.is_due(t0 + Duration::from_secs(10)));

        // Completion reports the pending trigger
        assert!(d.finish_flight());
        assert_eq!(d.state(), DebounceState::Idle);
    }

    #[test]
    fn test_debouncer_finish_without_rearm() {
        let mut d = Debouncer::new(WINDOW);
        d.arm(Instant::now());
        d.begin_flight();
        assert!(!d.finish_flight());
    }

    #[test]
    fn test_debouncer_arm_immediate() {
        let mut d = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        d.arm_immediate(t0);
        assert!(d.is_due(t0));
    }

    #[test]
    fn test_interaction_lock_trailing_release() {
        let mut lock = InteractionLock::new(WINDOW);
        let t0 = Instant::now();

        lock.engage();
        assert!(lock.is_engaged());

        lock.release(t0);
        assert!(lock.is_engaged());
        assert!(!lock.poll_release(t0 + Duration::from_millis(50)));
        assert!(lock.poll_release(t0 + WINDOW));
        assert!(!lock.is_engaged());
    }

    #[test]
    fn test_interaction_lock_rapid_toggle_stays_held() {
        let mut lock = InteractionLock::new(WINDOW);
        let t0 = Instant::now();

        lock.engage();
        lock.release(t0);
        // Re-engage before the trailing timer elapses
        lock.engage();

        assert!(!lock.poll_release(t0 + Duration::from_secs(10)));
        assert!(lock.is_engaged());
    }

    #[test]
    fn test_interaction_lock_release_without_engage() {
        let mut lock = InteractionLock::new(WINDOW);
        lock.release(Instant::now());
        assert!(lock.deadline().is_none());
    }
}
