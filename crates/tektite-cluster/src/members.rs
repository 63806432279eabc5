//! Cluster member registry.
//!
//! Members are parsed from the cluster-member string format
//! `id,clientFacing,memberFacing,log,transfer,archive` with members
//! separated by `|`. The registry tracks per-member replication progress,
//! flags for the join/remove/termination protocols, and hands out fresh ids
//! to dynamic joiners via the high-water member id.

use std::fmt::Write as _;

use tektite_types::{CorrelationId, LeadershipTermId, LogPosition, MemberId, RecordingId};

use crate::error::{ClusterError, ClusterResult};

// ============================================================================
// Endpoints
// ============================================================================

/// The five endpoints a member exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEndpoints {
    pub client_facing: String,
    pub member_facing: String,
    pub log: String,
    pub transfer: String,
    pub archive: String,
}

impl MemberEndpoints {
    /// Parses `client,member,log,transfer,archive` (no leading id).
    pub fn parse(text: &str) -> ClusterResult<Self> {
        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
            return Err(ClusterError::MemberParse(format!(
                "expected 5 endpoints, got `{text}`"
            )));
        }
        Ok(Self {
            client_facing: parts[0].to_string(),
            member_facing: parts[1].to_string(),
            log: parts[2].to_string(),
            transfer: parts[3].to_string(),
            archive: parts[4].to_string(),
        })
    }

    fn encode_to(&self, out: &mut String) {
        let _ = write!(
            out,
            "{},{},{},{},{}",
            self.client_facing, self.member_facing, self.log, self.transfer, self.archive
        );
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        self.encode_to(&mut out);
        out
    }
}

// ============================================================================
// Cluster Member
// ============================================================================

/// One member of the cluster, active or passive.
#[derive(Debug, Clone)]
pub struct ClusterMember {
    pub id: MemberId,
    pub endpoints: MemberEndpoints,

    /// Highest log position the member has reported appended.
    pub appended_log_position: LogPosition,
    /// Highest commit position the member has reported.
    pub commit_position: LogPosition,
    /// When the member last reported progress.
    pub time_of_last_append_ms: i64,

    /// Replay session feeding this member's catch-up, if any (leader side).
    pub catchup_replay_id: Option<i64>,
    /// Correlation id of an in-flight admin exchange with this member.
    pub correlation_id: Option<CorrelationId>,

    pub is_leader: bool,
    pub has_requested_join: bool,
    pub has_requested_remove: bool,
    pub has_sent_termination_ack: bool,
    /// Position at which a requested removal takes effect.
    pub removal_position: Option<LogPosition>,

    /// The member's vote in the current ballot, if cast.
    pub vote: Option<bool>,
    /// A canvass position has been received this election round.
    pub has_canvassed: bool,
    /// Last log term the member canvassed with.
    pub canvass_term_id: LeadershipTermId,
    /// Snapshot recording this member contributed during join, if any.
    pub snapshot_recording_id: Option<RecordingId>,
}

impl ClusterMember {
    pub fn new(id: MemberId, endpoints: MemberEndpoints) -> Self {
        Self {
            id,
            endpoints,
            appended_log_position: LogPosition::ZERO,
            commit_position: LogPosition::ZERO,
            time_of_last_append_ms: 0,
            catchup_replay_id: None,
            correlation_id: None,
            is_leader: false,
            has_requested_join: false,
            has_requested_remove: false,
            has_sent_termination_ack: false,
            removal_position: None,
            vote: None,
            has_canvassed: false,
            canvass_term_id: LeadershipTermId::NONE,
            snapshot_recording_id: None,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The set of active and passive cluster members.
#[derive(Debug, Clone, Default)]
pub struct MemberRegistry {
    active: Vec<ClusterMember>,
    passive: Vec<ClusterMember>,
    high_member_id: u32,
}

impl MemberRegistry {
    /// Parses the active membership from cluster-member string format.
    pub fn parse(members: &str) -> ClusterResult<Self> {
        let mut registry = Self::default();
        if members.is_empty() {
            return Ok(registry);
        }
        for member_text in members.split('|').filter(|m| !m.is_empty()) {
            let (id_text, endpoints_text) =
                member_text
                    .split_once(',')
                    .ok_or_else(|| ClusterError::MemberParse(format!(
                        "member entry missing id: `{member_text}`"
                    )))?;
            let id: u32 = id_text.parse().map_err(|_| {
                ClusterError::MemberParse(format!("member id is not an integer: `{id_text}`"))
            })?;
            let endpoints = MemberEndpoints::parse(endpoints_text)?;
            registry.add_active(ClusterMember::new(MemberId::new(id), endpoints))?;
        }
        Ok(registry)
    }

    /// Encodes the active membership back to string format.
    pub fn encode_active(&self) -> String {
        Self::encode_list(&self.active)
    }

    pub fn encode_passive(&self) -> String {
        Self::encode_list(&self.passive)
    }

    fn encode_list(members: &[ClusterMember]) -> String {
        let mut out = String::new();
        for (i, member) in members.iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            let _ = write!(out, "{},", member.id);
            member.endpoints.encode_to(&mut out);
        }
        out
    }

    pub fn add_active(&mut self, member: ClusterMember) -> ClusterResult<()> {
        if self.find(member.id).is_some() {
            return Err(ClusterError::MemberParse(format!(
                "duplicate member id {}",
                member.id
            )));
        }
        self.high_member_id = self.high_member_id.max(member.id.as_u32());
        self.active.push(member);
        Ok(())
    }

    pub fn add_passive(&mut self, member: ClusterMember) -> ClusterResult<()> {
        if self.find(member.id).is_some() {
            return Err(ClusterError::MemberParse(format!(
                "duplicate member id {}",
                member.id
            )));
        }
        self.high_member_id = self.high_member_id.max(member.id.as_u32());
        self.passive.push(member);
        Ok(())
    }

    /// Allocates a fresh member id for a joiner.
    pub fn next_member_id(&mut self) -> MemberId {
        self.high_member_id += 1;
        MemberId::new(self.high_member_id)
    }

    pub fn high_member_id(&self) -> MemberId {
        MemberId::new(self.high_member_id)
    }

    /// Records the high-water id restored from a snapshot.
    pub fn set_high_member_id(&mut self, id: MemberId) {
        self.high_member_id = self.high_member_id.max(id.as_u32());
    }

    /// Promotes a passive member to active membership.
    pub fn promote(&mut self, id: MemberId) -> ClusterResult<()> {
        let index = self
            .passive
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| ClusterError::MemberParse(format!("no passive member {id}")))?;
        let member = self.passive.remove(index);
        self.active.push(member);
        Ok(())
    }

    /// Removes a member entirely; returns it if present.
    pub fn remove(&mut self, id: MemberId) -> Option<ClusterMember> {
        if let Some(index) = self.active.iter().position(|m| m.id == id) {
            return Some(self.active.remove(index));
        }
        if let Some(index) = self.passive.iter().position(|m| m.id == id) {
            return Some(self.passive.remove(index));
        }
        None
    }

    pub fn find(&self, id: MemberId) -> Option<&ClusterMember> {
        self.active
            .iter()
            .chain(self.passive.iter())
            .find(|m| m.id == id)
    }

    pub fn find_mut(&mut self, id: MemberId) -> Option<&mut ClusterMember> {
        self.active
            .iter_mut()
            .chain(self.passive.iter_mut())
            .find(|m| m.id == id)
    }

    pub fn find_by_member_endpoint(&self, member_facing: &str) -> Option<&ClusterMember> {
        self.active
            .iter()
            .chain(self.passive.iter())
            .find(|m| m.endpoints.member_facing == member_facing)
    }

    pub fn active(&self) -> &[ClusterMember] {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut [ClusterMember] {
        &mut self.active
    }

    pub fn passive(&self) -> &[ClusterMember] {
        &self.passive
    }

    pub fn is_active(&self, id: MemberId) -> bool {
        self.active.iter().any(|m| m.id == id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Strict majority of the active membership.
    pub fn quorum_size(&self) -> usize {
        self.active.len() / 2 + 1
    }

    /// Highest position known appended on a quorum of active members.
    ///
    /// Ranks the appended positions descending and takes the quorum-th
    /// entry: everything at or below it is replicated on a strict majority.
    pub fn quorum_position(&self) -> LogPosition {
        let mut positions: Vec<LogPosition> =
            self.active.iter().map(|m| m.appended_log_position).collect();
        if positions.is_empty() {
            return LogPosition::ZERO;
        }
        positions.sort_unstable_by(|a, b| b.cmp(a));
        positions[self.quorum_size() - 1]
    }

    /// Clears ballot state before a new election round.
    pub fn reset_votes(&mut self) {
        for member in &mut self.active {
            member.vote = None;
            member.has_canvassed = false;
            member.canvass_term_id = LeadershipTermId::NONE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const THREE: &str = "0,c0,m0,l0,t0,a0|1,c1,m1,l1,t1,a1|2,c2,m2,l2,t2,a2";

    #[test]
    fn parse_and_encode_round_trip() {
        let registry = MemberRegistry::parse(THREE).expect("parse");
        assert_eq!(registry.active_count(), 3);
        assert_eq!(registry.encode_active(), THREE);

        let member = registry.find(MemberId::new(1)).expect("member 1");
        assert_eq!(member.endpoints.member_facing, "m1");
        assert_eq!(member.endpoints.archive, "a1");
    }

    #[test]
    fn empty_members_string_is_empty_registry() {
        let registry = MemberRegistry::parse("").expect("parse");
        assert_eq!(registry.active_count(), 0);
    }

    #[test_case("0,a,b,c,d" ; "too few endpoints")]
    #[test_case("0,a,b,c,d,e,f" ; "too many endpoints")]
    #[test_case("x,a,b,c,d,e" ; "non-numeric id")]
    #[test_case("0,a,,c,d,e" ; "empty endpoint")]
    #[test_case("0,a,b,c,d,e|0,f,g,h,i,j" ; "duplicate id")]
    fn parse_rejects_malformed(text: &str) {
        assert!(MemberRegistry::parse(text).is_err());
    }

    #[test]
    fn quorum_position_takes_majority_rank() {
        let mut registry = MemberRegistry::parse(THREE).expect("parse");
        let positions = [640u64, 320, 960];
        for (member, position) in registry.active_mut().iter_mut().zip(positions) {
            member.appended_log_position = LogPosition::new(position);
        }
        // Quorum of 3 is 2: the 2nd-highest position (640) is on a majority.
        assert_eq!(registry.quorum_position(), LogPosition::new(640));
    }

    #[test]
    fn quorum_sizes() {
        for (members, quorum) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (7, 4)] {
            let text: String = (0..members)
                .map(|i| format!("{i},c{i},m{i},l{i},t{i},a{i}"))
                .collect::<Vec<_>>()
                .join("|");
            let registry = MemberRegistry::parse(&text).expect("parse");
            assert_eq!(registry.quorum_size(), quorum, "cluster of {members}");
        }
    }

    #[test]
    fn joiner_ids_are_fresh() {
        let mut registry = MemberRegistry::parse(THREE).expect("parse");
        assert_eq!(registry.next_member_id(), MemberId::new(3));

        let endpoints = MemberEndpoints::parse("c3,m3,l3,t3,a3").expect("endpoints");
        registry
            .add_passive(ClusterMember::new(MemberId::new(3), endpoints))
            .expect("add");
        assert_eq!(registry.passive().len(), 1);
        assert_eq!(registry.next_member_id(), MemberId::new(4));

        registry.promote(MemberId::new(3)).expect("promote");
        assert_eq!(registry.active_count(), 4);
        assert!(registry.is_active(MemberId::new(3)));
    }

    #[test]
    fn removal() {
        let mut registry = MemberRegistry::parse(THREE).expect("parse");
        assert!(registry.remove(MemberId::new(1)).is_some());
        assert_eq!(registry.active_count(), 2);
        assert!(registry.remove(MemberId::new(1)).is_none());
        // Ids are never reused after removal.
        assert_eq!(registry.next_member_id(), MemberId::new(3));
    }
}
