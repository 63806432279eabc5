//! Member-status control messages exchanged among cluster members.
//!
//! ## Election
//! - [`PeerMessage::CanvassPosition`] — All → All: my appended position
//! - [`PeerMessage::RequestVote`] — Candidate → All: vote for me
//! - [`PeerMessage::Vote`] — Voter → Candidate: yes/no
//! - [`PeerMessage::NewLeadershipTerm`] — Leader → All: term established
//!
//! ## Replication progress
//! - [`PeerMessage::AppendedPosition`] — Follower → Leader
//! - [`PeerMessage::CommitPosition`] — Leader → All
//! - [`PeerMessage::CatchupPosition`] / [`PeerMessage::StopCatchup`]
//!
//! ## Membership
//! - [`PeerMessage::AddPassiveMember`], [`PeerMessage::ClusterMembersChange`],
//!   [`PeerMessage::SnapshotRecordingQuery`], [`PeerMessage::SnapshotRecordings`],
//!   [`PeerMessage::JoinCluster`], [`PeerMessage::RemoveMember`]
//!
//! ## Termination
//! - [`PeerMessage::TerminationPosition`], [`PeerMessage::TerminationAck`]

use serde::{Deserialize, Serialize};
use tektite_types::{CorrelationId, LeadershipTermId, LogPosition, MemberId};

use crate::snapshot::SnapshotMarkerSummary;

/// A member-status control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Canvass of a member's log progress, published on entry to election.
    CanvassPosition {
        /// Term of the last log entry the sender has appended.
        log_leadership_term_id: LeadershipTermId,
        /// The sender's appended log position.
        log_position: LogPosition,
        /// The sender's current leadership term.
        leadership_term_id: LeadershipTermId,
        follower_member_id: MemberId,
    },

    /// A candidate asks for a vote in `candidate_term_id`.
    RequestVote {
        log_leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    },

    /// A voter answers a [`PeerMessage::RequestVote`].
    Vote {
        candidate_term_id: LeadershipTermId,
        log_leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        candidate_member_id: MemberId,
        follower_member_id: MemberId,
        vote: bool,
    },

    /// The leader of a freshly-won term announces it.
    NewLeadershipTerm {
        log_leadership_term_id: LeadershipTermId,
        /// Position at which the new term begins.
        term_base_log_position: LogPosition,
        leadership_term_id: LeadershipTermId,
        /// The leader's appended position; the catch-up target.
        log_position: LogPosition,
        leader_member_id: MemberId,
        /// Session id of the leader's log publication image.
        log_session_id: i32,
        timestamp_ms: i64,
    },

    /// A follower reports the position it has appended.
    AppendedPosition {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        follower_member_id: MemberId,
    },

    /// The leader reports the quorum commit position.
    CommitPosition {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        leader_member_id: MemberId,
    },

    /// A catching-up follower reports replay progress to the leader.
    CatchupPosition {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        follower_member_id: MemberId,
    },

    /// The leader tells a follower its catch-up replay is complete.
    StopCatchup {
        leadership_term_id: LeadershipTermId,
        follower_member_id: MemberId,
    },

    /// A dynamic joiner asks to be tracked as a passive member.
    ///
    /// `member_endpoints` is the joiner's endpoints in cluster-member string
    /// format (without a leading id; the leader assigns one).
    AddPassiveMember {
        correlation_id: CorrelationId,
        member_endpoints: String,
    },

    /// Leader response carrying the current membership, or a follower relay
    /// redirecting the joiner at the leader.
    ClusterMembersChange {
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        /// Active members in cluster-member string format.
        active_members: String,
        /// Passive members in cluster-member string format.
        passive_members: String,
    },

    /// A joiner asks for the latest snapshot recordings.
    SnapshotRecordingQuery {
        correlation_id: CorrelationId,
        requesting_member_id: MemberId,
    },

    /// Response to [`PeerMessage::SnapshotRecordingQuery`].
    SnapshotRecordings {
        correlation_id: CorrelationId,
        snapshots: Vec<SnapshotMarkerSummary>,
    },

    /// A caught-up passive member asks to be admitted as active.
    JoinCluster {
        leadership_term_id: LeadershipTermId,
        member_id: MemberId,
    },

    /// The leader announces the position at which members terminate.
    TerminationPosition {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
    },

    /// A member confirms it reached the termination position.
    TerminationAck {
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        member_id: MemberId,
    },

    /// Leader-only administrative removal of a member.
    RemoveMember { member_id: MemberId, is_passive: bool },
}

impl PeerMessage {
    /// Human-readable name of the message kind.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::CanvassPosition { .. } => "CanvassPosition",
            PeerMessage::RequestVote { .. } => "RequestVote",
            PeerMessage::Vote { .. } => "Vote",
            PeerMessage::NewLeadershipTerm { .. } => "NewLeadershipTerm",
            PeerMessage::AppendedPosition { .. } => "AppendedPosition",
            PeerMessage::CommitPosition { .. } => "CommitPosition",
            PeerMessage::CatchupPosition { .. } => "CatchupPosition",
            PeerMessage::StopCatchup { .. } => "StopCatchup",
            PeerMessage::AddPassiveMember { .. } => "AddPassiveMember",
            PeerMessage::ClusterMembersChange { .. } => "ClusterMembersChange",
            PeerMessage::SnapshotRecordingQuery { .. } => "SnapshotRecordingQuery",
            PeerMessage::SnapshotRecordings { .. } => "SnapshotRecordings",
            PeerMessage::JoinCluster { .. } => "JoinCluster",
            PeerMessage::TerminationPosition { .. } => "TerminationPosition",
            PeerMessage::TerminationAck { .. } => "TerminationAck",
            PeerMessage::RemoveMember { .. } => "RemoveMember",
        }
    }

    /// The leadership term the message speaks for, where it carries one.
    ///
    /// A term above the receiver's own forces the receiver into election.
    pub fn leadership_term_id(&self) -> Option<LeadershipTermId> {
        match self {
            PeerMessage::CanvassPosition {
                leadership_term_id, ..
            }
            | PeerMessage::AppendedPosition {
                leadership_term_id, ..
            }
            | PeerMessage::CommitPosition {
                leadership_term_id, ..
            }
            | PeerMessage::CatchupPosition {
                leadership_term_id, ..
            }
            | PeerMessage::StopCatchup {
                leadership_term_id, ..
            }
            | PeerMessage::JoinCluster {
                leadership_term_id, ..
            }
            | PeerMessage::TerminationPosition {
                leadership_term_id, ..
            }
            | PeerMessage::TerminationAck {
                leadership_term_id, ..
            }
            | PeerMessage::NewLeadershipTerm {
                leadership_term_id, ..
            } => Some(*leadership_term_id),
            PeerMessage::RequestVote {
                candidate_term_id, ..
            }
            | PeerMessage::Vote {
                candidate_term_id, ..
            } => Some(*candidate_term_id),
            PeerMessage::AddPassiveMember { .. }
            | PeerMessage::ClusterMembersChange { .. }
            | PeerMessage::SnapshotRecordingQuery { .. }
            | PeerMessage::SnapshotRecordings { .. }
            | PeerMessage::RemoveMember { .. } => None,
        }
    }
}
