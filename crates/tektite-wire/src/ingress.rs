//! The client-facing protocol.
//!
//! [`IngressFrame`]s travel client → cluster on the ingress channel;
//! [`EgressEvent`]s travel cluster → client on the session's response
//! channel. Application responses from the hosted services travel on the
//! same response channel but are produced by the service container, not by
//! the consensus module.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tektite_types::{ClusterSessionId, CorrelationId, LeadershipTermId, MemberId};

// ============================================================================
// Ingress (client → cluster)
// ============================================================================

/// A frame received on the ingress channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngressFrame {
    /// Open a new session.
    SessionConnect {
        correlation_id: CorrelationId,
        response_stream_id: i32,
        /// Packed semantic version, see [`crate::semantic_version`].
        version: u32,
        response_channel: String,
        credentials: Bytes,
    },

    /// Close an open session.
    SessionClose {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
    },

    /// An application message for the state machines.
    IngressMessage {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
        payload: Bytes,
    },

    /// Liveness signal from an otherwise idle client.
    SessionKeepAlive {
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
    },

    /// Response to an authentication challenge.
    ChallengeResponse {
        correlation_id: CorrelationId,
        cluster_session_id: ClusterSessionId,
        credentials: Bytes,
    },
}

impl IngressFrame {
    pub fn name(&self) -> &'static str {
        match self {
            IngressFrame::SessionConnect { .. } => "SessionConnect",
            IngressFrame::SessionClose { .. } => "SessionClose",
            IngressFrame::IngressMessage { .. } => "IngressMessage",
            IngressFrame::SessionKeepAlive { .. } => "SessionKeepAlive",
            IngressFrame::ChallengeResponse { .. } => "ChallengeResponse",
        }
    }
}

// ============================================================================
// Egress (cluster → client)
// ============================================================================

/// Outcome code delivered with a [`EgressEvent::SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCode {
    Ok,
    Error,
    /// The receiving member is not the leader; reconnect at `leader_member_id`.
    Redirect,
    AuthenticationRejected,
    Closed,
}

/// An event delivered to a client on its response channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgressEvent {
    /// Admission outcome, rejection, redirect, or close notification.
    SessionEvent {
        correlation_id: CorrelationId,
        cluster_session_id: ClusterSessionId,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        code: EventCode,
        detail: String,
    },

    /// An authentication challenge to answer with
    /// [`IngressFrame::ChallengeResponse`].
    Challenge {
        correlation_id: CorrelationId,
        cluster_session_id: ClusterSessionId,
        encoded_challenge: Bytes,
    },

    /// The cluster elected a new leader; sent exactly once per open session
    /// per term.
    NewLeaderEvent {
        cluster_session_id: ClusterSessionId,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        /// Ingress endpoints in cluster-member string format.
        ingress_endpoints: String,
    },
}

impl EgressEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EgressEvent::SessionEvent { .. } => "SessionEvent",
            EgressEvent::Challenge { .. } => "Challenge",
            EgressEvent::NewLeaderEvent { .. } => "NewLeaderEvent",
        }
    }
}
