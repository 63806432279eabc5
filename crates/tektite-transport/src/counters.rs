//! Shared counters and the control toggle.
//!
//! Position counters are single-writer, multi-reader: the agent stores with
//! release ordering so an external observer that acquires the value sees the
//! state the write published. The control toggle is the one externally
//! *writable* counter; operators signal it, the agent consumes and resets it.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

// ============================================================================
// Counter
// ============================================================================

/// A single-writer shared 64-bit counter.
///
/// Clones share the same cell; only the owning agent may write.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads with acquire ordering.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Publishes a new value with release ordering.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Increments and returns the new value.
    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

// ============================================================================
// Control Toggle
// ============================================================================

/// States of the externally-writable control toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Neutral,
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ToggleState {
    fn code(self) -> i64 {
        match self {
            ToggleState::Neutral => 0,
            ToggleState::Suspend => 1,
            ToggleState::Resume => 2,
            ToggleState::Snapshot => 3,
            ToggleState::Shutdown => 4,
            ToggleState::Abort => 5,
        }
    }

    fn from_code(code: i64) -> ToggleState {
        match code {
            1 => ToggleState::Suspend,
            2 => ToggleState::Resume,
            3 => ToggleState::Snapshot,
            4 => ToggleState::Shutdown,
            5 => ToggleState::Abort,
            _ => ToggleState::Neutral,
        }
    }
}

/// The externally-writable control counter.
///
/// An operator signals exactly one pending action; the agent observes it in
/// the slow tick, acts, and resets to neutral.
#[derive(Debug, Clone, Default)]
pub struct ControlToggle {
    value: Arc<AtomicI64>,
}

impl ControlToggle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an action. Succeeds only from the neutral state so pending
    /// actions are never silently overwritten.
    pub fn signal(&self, state: ToggleState) -> bool {
        self.value
            .compare_exchange(
                ToggleState::Neutral.code(),
                state.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current pending action.
    pub fn poll(&self) -> ToggleState {
        ToggleState::from_code(self.value.load(Ordering::Acquire))
    }

    /// Returns the toggle to neutral after the action is taken up.
    pub fn reset(&self) {
        self.value
            .store(ToggleState::Neutral.code(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_round_trip() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.set(42);
        assert_eq!(counter.get(), 42);
        assert_eq!(counter.increment(), 43);

        let reader = counter.clone();
        assert_eq!(reader.get(), 43);
    }

    #[test]
    fn toggle_rejects_overwrite_until_reset() {
        let toggle = ControlToggle::new();
        assert!(toggle.signal(ToggleState::Snapshot));
        assert!(!toggle.signal(ToggleState::Abort));
        assert_eq!(toggle.poll(), ToggleState::Snapshot);

        toggle.reset();
        assert_eq!(toggle.poll(), ToggleState::Neutral);
        assert!(toggle.signal(ToggleState::Abort));
    }
}
