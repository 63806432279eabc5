//! Records of the consensus module's own snapshot stream.
//!
//! A snapshot is written as a begin marker, the module state, a record per
//! live session, timer, and pending service message, the membership, then an
//! end marker. The loader requires both markers; a stream missing its end
//! marker is a torn snapshot and is rejected.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tektite_types::{
    ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId, RecordingId,
    ServiceId,
};

use crate::log::CloseReason;

// ============================================================================
// Snapshot Stream Records
// ============================================================================

/// Marks the boundaries of a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotMark {
    Begin,
    End,
}

/// A record of the consensus module's snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotRecord {
    /// Stream boundary.
    Marker {
        mark: SnapshotMark,
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        term_base_log_position: LogPosition,
        timestamp_ms: i64,
    },

    /// Module-level counters.
    ModuleState {
        next_session_id: i64,
        next_service_session_id: i64,
        log_service_session_id: i64,
        pending_message_capacity: usize,
    },

    /// One open client session.
    Session {
        cluster_session_id: ClusterSessionId,
        correlation_id: CorrelationId,
        opened_log_position: LogPosition,
        time_of_last_activity_ms: i64,
        close_reason: Option<CloseReason>,
        response_stream_id: i32,
        response_channel: String,
    },

    /// One scheduled timer.
    Timer {
        correlation_id: CorrelationId,
        deadline_ms: i64,
    },

    /// One pending service-originated message awaiting append.
    PendingServiceMessage {
        cluster_session_id: ClusterSessionId,
        payload: Bytes,
    },

    /// Cluster membership at the snapshot position.
    Members {
        high_member_id: MemberId,
        active_members: String,
        passive_members: String,
    },
}

impl SnapshotRecord {
    pub fn name(&self) -> &'static str {
        match self {
            SnapshotRecord::Marker { .. } => "Marker",
            SnapshotRecord::ModuleState { .. } => "ModuleState",
            SnapshotRecord::Session { .. } => "Session",
            SnapshotRecord::Timer { .. } => "Timer",
            SnapshotRecord::PendingServiceMessage { .. } => "PendingServiceMessage",
            SnapshotRecord::Members { .. } => "Members",
        }
    }
}

// ============================================================================
// Snapshot Summaries (peer exchange)
// ============================================================================

/// Description of one recorded snapshot, as exchanged with dynamic joiners
/// in [`crate::PeerMessage::SnapshotRecordings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarkerSummary {
    pub leadership_term_id: LeadershipTermId,
    pub term_base_log_position: LogPosition,
    pub log_position: LogPosition,
    pub timestamp_ms: i64,
    pub service_id: ServiceId,
    pub recording_id: RecordingId,
}
