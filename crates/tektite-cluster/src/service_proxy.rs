//! Duplex control link to the hosted state-machine service container.
//!
//! [`ServiceProxy`] carries module → service control messages;
//! [`ServiceAdapter`] polls service → module messages. Service liveness is
//! observed through per-service heartbeat counters the container updates
//! with its wall-clock time.

use tektite_types::{CorrelationId, LeadershipTermId, LogPosition, MemberId};
use tektite_transport::{Offer, Publication, Subscription};
use tektite_wire::{FromServiceMessage, ToServiceMessage};

use crate::error::ClusterResult;

// ============================================================================
// Service Proxy (module → service)
// ============================================================================

/// Sends control messages to the hosted services.
pub struct ServiceProxy {
    publication: Box<dyn Publication>,
}

impl ServiceProxy {
    pub fn new(publication: Box<dyn Publication>) -> Self {
        Self { publication }
    }

    /// Offers one message; false means back-pressure, retry later.
    fn offer(&mut self, message: &ToServiceMessage) -> ClusterResult<bool> {
        let bytes = tektite_wire::encode(message)?;
        match self.publication.offer(&bytes) {
            Offer::Position(_) => Ok(true),
            Offer::BackPressured | Offer::NotConnected | Offer::Closed => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn join_log(
        &mut self,
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        max_log_position: LogPosition,
        member_id: MemberId,
        log_session_id: i32,
        log_stream_id: i32,
        is_startup: bool,
        role_is_leader: bool,
        log_channel: &str,
    ) -> ClusterResult<bool> {
        self.offer(&ToServiceMessage::JoinLog {
            leadership_term_id,
            log_position,
            max_log_position,
            member_id,
            log_session_id,
            log_stream_id,
            is_startup,
            role_is_leader,
            log_channel: log_channel.to_string(),
        })
    }

    pub fn cluster_members_response(
        &mut self,
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: String,
        passive_members: String,
    ) -> ClusterResult<bool> {
        self.offer(&ToServiceMessage::ClusterMembersResponse {
            correlation_id,
            leader_member_id,
            active_members,
            passive_members,
        })
    }

    pub fn termination_position(&mut self, log_position: LogPosition) -> ClusterResult<bool> {
        self.offer(&ToServiceMessage::ServiceTerminationPosition { log_position })
    }

    pub fn election_start(&mut self, log_position: LogPosition) -> ClusterResult<bool> {
        self.offer(&ToServiceMessage::ElectionStartEvent { log_position })
    }

    pub fn close(&mut self) {
        self.publication.close();
    }
}

// ============================================================================
// Service Adapter (service → module)
// ============================================================================

/// Polls control messages from the hosted services.
pub struct ServiceAdapter {
    subscription: Box<dyn Subscription>,
}

impl ServiceAdapter {
    pub fn new(subscription: Box<dyn Subscription>) -> Self {
        Self { subscription }
    }

    pub fn poll(&mut self, limit: usize) -> ClusterResult<Vec<FromServiceMessage>> {
        let fragments = self.subscription.poll(limit);
        let mut messages = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            messages.push(tektite_wire::decode(&fragment.payload)?);
        }
        Ok(messages)
    }

    pub fn close(&mut self) {
        self.subscription.close();
    }
}
