//! Error types for the consensus module.
//!
//! Back-pressure is never an error: append paths return a retry sentinel and
//! the caller re-offers on a later tick. The variants here are real
//! failures: transient ones are routed through the counted error handler;
//! fatal ones close the agent after cleanup.

use tektite_types::{LeadershipTermId, LogPosition, ServiceId};
use tektite_transport::{ArchiveError, TransportError};
use tektite_wire::WireError;

/// Result alias used throughout the consensus module.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by the consensus module.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("cluster members string malformed: {0}")]
    MemberParse(String),

    /// A hosted service acknowledged a position or id the module did not
    /// expect. Fatal: the service and module have diverged.
    #[error(
        "invalid ack from service {service_id}: position {position}, ack id {ack_id} \
         (expected position {expected_position}, ack id {expected_ack_id})"
    )]
    InvalidServiceAck {
        service_id: ServiceId,
        position: LogPosition,
        ack_id: i64,
        expected_position: LogPosition,
        expected_ack_id: i64,
    },

    /// A hosted service stopped publishing heartbeats. Fatal.
    #[error("service {service_id} heartbeat lost ({silent_ms} ms silent)")]
    ServiceHeartbeatLost { service_id: ServiceId, silent_ms: i64 },

    /// The election did not complete within its overall budget.
    #[error("election timed out in term {leadership_term_id}")]
    ElectionTimeout { leadership_term_id: LeadershipTermId },

    /// Recovery (snapshot load or service-ack barrier) timed out.
    #[error("recovery timed out awaiting {awaiting}")]
    RecoveryTimeout { awaiting: &'static str },

    /// Dynamic join did not complete within its budget.
    #[error("dynamic join timed out in state {state}")]
    DynamicJoinTimeout { state: &'static str },

    /// The interrupt flag was observed during a bounded wait.
    #[error("interrupted")]
    Interrupted,

    #[error("recording log invariant violated: {0}")]
    RecordingLog(String),

    /// A state transition the module state machine does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl ClusterError {
    /// Fatal errors close the agent after cleanup; the rest only count.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidServiceAck { .. }
                | ClusterError::ServiceHeartbeatLost { .. }
                | ClusterError::RecoveryTimeout { .. }
                | ClusterError::DynamicJoinTimeout { .. }
                | ClusterError::Interrupted
        )
    }
}
