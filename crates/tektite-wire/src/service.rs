//! The duplex control link between the consensus module and the hosted
//! state-machine service container.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tektite_types::{ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId, ServiceId};

// ============================================================================
// Module → Service
// ============================================================================

/// A control message from the consensus module to the hosted services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToServiceMessage {
    /// Services should join the log stream at `log_position`.
    JoinLog {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        /// Bound on how far services may consume ahead of commit.
        max_log_position: LogPosition,
        member_id: MemberId,
        log_session_id: i32,
        log_stream_id: i32,
        is_startup: bool,
        role_is_leader: bool,
        log_channel: String,
    },

    /// Answer to a [`FromServiceMessage::ClusterMembersQuery`].
    ClusterMembersResponse {
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: String,
        passive_members: String,
    },

    /// Services must stop executing at `log_position` and ack.
    ServiceTerminationPosition { log_position: LogPosition },

    /// An election has begun; services should pause delivery expectations.
    ElectionStartEvent { log_position: LogPosition },
}

impl ToServiceMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ToServiceMessage::JoinLog { .. } => "JoinLog",
            ToServiceMessage::ClusterMembersResponse { .. } => "ClusterMembersResponse",
            ToServiceMessage::ServiceTerminationPosition { .. } => "ServiceTerminationPosition",
            ToServiceMessage::ElectionStartEvent { .. } => "ElectionStartEvent",
        }
    }
}

// ============================================================================
// Service → Module
// ============================================================================

/// A control message from a hosted service to the consensus module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromServiceMessage {
    /// Acknowledges reaching `log_position` for the ack numbered `ack_id`.
    ///
    /// `relevant_id` carries a context-dependent value: the snapshot
    /// recording id for snapshot acks, the service's join position
    /// otherwise (`-1` when unused).
    ServiceAck {
        log_position: LogPosition,
        timestamp_ms: i64,
        ack_id: i64,
        relevant_id: i64,
        service_id: ServiceId,
    },

    /// A message originated by the service, to be sequenced into the log.
    ServiceMessage {
        leadership_term_id: LeadershipTermId,
        payload: Bytes,
    },

    /// The service asks to close a client session.
    CloseSession { cluster_session_id: ClusterSessionId },

    /// Schedule a timer keyed by `correlation_id`.
    ScheduleTimer {
        correlation_id: CorrelationId,
        deadline_ms: i64,
    },

    /// Cancel the timer keyed by `correlation_id`.
    CancelTimer { correlation_id: CorrelationId },

    /// The service asks for the current membership.
    ClusterMembersQuery { correlation_id: CorrelationId },
}

impl FromServiceMessage {
    pub fn name(&self) -> &'static str {
        match self {
            FromServiceMessage::ServiceAck { .. } => "ServiceAck",
            FromServiceMessage::ServiceMessage { .. } => "ServiceMessage",
            FromServiceMessage::CloseSession { .. } => "CloseSession",
            FromServiceMessage::ScheduleTimer { .. } => "ScheduleTimer",
            FromServiceMessage::CancelTimer { .. } => "CancelTimer",
            FromServiceMessage::ClusterMembersQuery { .. } => "ClusterMembersQuery",
        }
    }
}
