//! Framed records of the replicated log stream.
//!
//! The leader's log publisher appends these; every member's log adapter
//! consumes them in identical order with identical timestamps. Each record
//! is stamped with the leadership term that appended it and the cluster time
//! at append.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tektite_types::{ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId};

// ============================================================================
// Record Kinds
// ============================================================================

/// A record of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A client session has been admitted and opened.
    SessionOpen {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
        correlation_id: CorrelationId,
        timestamp_ms: i64,
        response_stream_id: i32,
        response_channel: String,
        /// Principal established by the authenticator, if any.
        encoded_principal: Bytes,
    },

    /// A client session has been closed.
    SessionClose {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
        timestamp_ms: i64,
        close_reason: CloseReason,
    },

    /// A client (or service pseudo-session) message for the state machines.
    SessionMessage {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
        timestamp_ms: i64,
        payload: Bytes,
    },

    /// A scheduled timer fired on the leader.
    TimerEvent {
        leadership_term_id: LeadershipTermId,
        correlation_id: CorrelationId,
        timestamp_ms: i64,
    },

    /// A cluster-wide control action was committed.
    ClusterAction {
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
        action: ClusterAction,
    },

    /// A new leadership term begins at this record's position.
    NewLeadershipTermEvent {
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
        term_base_log_position: LogPosition,
        leader_member_id: MemberId,
        log_session_id: i32,
    },

    /// The active membership changed.
    MembershipChange {
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
        leader_member_id: MemberId,
        change_type: ChangeType,
        member_id: MemberId,
        /// Post-change active members in cluster-member string format.
        members: String,
    },
}

impl LogRecord {
    pub fn name(&self) -> &'static str {
        match self {
            LogRecord::SessionOpen { .. } => "SessionOpen",
            LogRecord::SessionClose { .. } => "SessionClose",
            LogRecord::SessionMessage { .. } => "SessionMessage",
            LogRecord::TimerEvent { .. } => "TimerEvent",
            LogRecord::ClusterAction { .. } => "ClusterAction",
            LogRecord::NewLeadershipTermEvent { .. } => "NewLeadershipTermEvent",
            LogRecord::MembershipChange { .. } => "MembershipChange",
        }
    }

    /// The term stamped on this record.
    pub fn leadership_term_id(&self) -> LeadershipTermId {
        match self {
            LogRecord::SessionOpen {
                leadership_term_id, ..
            }
            | LogRecord::SessionClose {
                leadership_term_id, ..
            }
            | LogRecord::SessionMessage {
                leadership_term_id, ..
            }
            | LogRecord::TimerEvent {
                leadership_term_id, ..
            }
            | LogRecord::ClusterAction {
                leadership_term_id, ..
            }
            | LogRecord::NewLeadershipTermEvent {
                leadership_term_id, ..
            }
            | LogRecord::MembershipChange {
                leadership_term_id, ..
            } => *leadership_term_id,
        }
    }

    /// The cluster time stamped on this record.
    ///
    /// Authoritative for followers: `cluster_time_ms` advances only as the
    /// log delivers records.
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            LogRecord::SessionOpen { timestamp_ms, .. }
            | LogRecord::SessionClose { timestamp_ms, .. }
            | LogRecord::SessionMessage { timestamp_ms, .. }
            | LogRecord::TimerEvent { timestamp_ms, .. }
            | LogRecord::ClusterAction { timestamp_ms, .. }
            | LogRecord::NewLeadershipTermEvent { timestamp_ms, .. }
            | LogRecord::MembershipChange { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// Cluster-wide control actions appended by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAction {
    Suspend,
    Resume,
    Snapshot,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The client asked for the close.
    ClientAction,
    /// A hosted service asked for the close.
    ServiceAction,
    /// The session exceeded its liveness timeout.
    Timeout,
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Join,
    Quit,
}
