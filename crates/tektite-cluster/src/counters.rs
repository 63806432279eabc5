//! The consensus module's shared counters.
//!
//! External observers read these without locking; the agent is the single
//! writer and publishes with release stores, so a reader that acquires
//! `commit_position` also sees the `leadership_term_id` that produced it.

use tektite_transport::{ControlToggle, Counter};

/// Counters published by one cluster member.
#[derive(Debug, Clone)]
pub struct ClusterCounters {
    /// Highest log position known committed on a quorum.
    pub commit_position: Counter,
    /// This member's appended log position.
    pub appended_position: Counter,
    /// Current leadership term id (-1 before the first election).
    pub leadership_term_id: Counter,
    /// Module state code, see [`crate::agent::ModuleState`].
    pub module_state: Counter,
    /// 1 while this member is leader, 0 otherwise.
    pub is_leader: Counter,
    /// Errors routed through the counted error handler.
    pub error_count: Counter,
    /// Client sessions closed for inactivity.
    pub timed_out_clients: Counter,
    /// Snapshots this member has completed.
    pub snapshot_count: Counter,
    /// The externally-writable control toggle.
    pub control_toggle: ControlToggle,
    /// Wall-clock heartbeat published by each hosted service.
    pub service_heartbeats: Vec<Counter>,
}

impl ClusterCounters {
    pub fn new(service_count: usize) -> Self {
        let leadership_term_id = Counter::new();
        leadership_term_id.set(-1);
        Self {
            commit_position: Counter::new(),
            appended_position: Counter::new(),
            leadership_term_id,
            module_state: Counter::new(),
            is_leader: Counter::new(),
            error_count: Counter::new(),
            timed_out_clients: Counter::new(),
            snapshot_count: Counter::new(),
            control_toggle: ControlToggle::new(),
            service_heartbeats: (0..service_count).map(|_| Counter::new()).collect(),
        }
    }
}
