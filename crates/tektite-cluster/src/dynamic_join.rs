//! Dynamic join of a new member.
//!
//! A member started with empty `cluster_members` and a non-empty status
//! endpoint list discovers the cluster instead of assuming it:
//!
//! 1. `AddPassiveMember` to any listed member (followers relay to the
//!    leader); the leader assigns a fresh id and replies with the current
//!    active and passive membership.
//! 2. `SnapshotRecordingQuery` to the leader; the latest snapshot
//!    recordings are replicated through the archive into fresh local
//!    recording ids.
//! 3. The module's own snapshot is loaded; sessions, timers, membership,
//!    and pending messages come back.
//! 4. `JoinCluster`; the leader appends the JOIN membership change, and on
//!    observing its own JOIN in the log the joiner finalises and enters
//!    election as a follower to catch up.
//!
//! Like the election, this sub-machine borrows the agent per tick.

use tektite_types::{CorrelationId, LeadershipTermId, LogPosition, MemberId, RecordingId};
use tektite_transport::{Archive as _, Media, Subscription};
use tektite_wire::{ChangeType, LogRecord, PeerMessage, SnapshotMarkerSummary};

use crate::agent::ConsensusAgent;
use crate::error::{ClusterError, ClusterResult};
use crate::members::MemberRegistry;
use crate::snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinState {
    Init,
    SnapshotRetrieve,
    SnapshotReplicate,
    SnapshotLoad,
    JoinCluster,
    Done,
}

/// One snapshot being replicated into the local archive.
struct SnapshotReplication {
    source: SnapshotMarkerSummary,
    local_recording_id: RecordingId,
    source_stop_position: LogPosition,
    replay_session_id: i64,
    complete: bool,
}

pub(crate) struct DynamicJoin {
    state: JoinState,
    correlation_id: CorrelationId,
    /// Next status endpoint to try, round-robin.
    contact_index: usize,
    time_of_last_send_ms: i64,
    deadline_ms: i64,

    leader_member_id: Option<MemberId>,
    snapshot_term_id: LeadershipTermId,
    snapshot_position: LogPosition,
    replications: Vec<SnapshotReplication>,
    /// Raw peek at the live log for our own JOIN event.
    join_watch: Option<Box<dyn Subscription>>,
}

impl DynamicJoin {
    pub(crate) fn new(agent: &mut ConsensusAgent, now_ms: i64) -> Self {
        Self {
            state: JoinState::Init,
            correlation_id: CorrelationId::new(agent.media.next_correlation_id()),
            contact_index: 0,
            time_of_last_send_ms: 0,
            deadline_ms: now_ms + agent.config.timeouts.dynamic_join_timeout_ms(),
            leader_member_id: None,
            snapshot_term_id: LeadershipTermId::NONE,
            snapshot_position: LogPosition::ZERO,
            replications: Vec::new(),
            join_watch: None,
        }
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            JoinState::Init => "Init",
            JoinState::SnapshotRetrieve => "SnapshotRetrieve",
            JoinState::SnapshotReplicate => "SnapshotReplicate",
            JoinState::SnapshotLoad => "SnapshotLoad",
            JoinState::JoinCluster => "JoinCluster",
            JoinState::Done => "Done",
        }
    }

    fn resend_interval_ms(agent: &ConsensusAgent) -> i64 {
        agent.config.timeouts.leader_heartbeat_interval_ms().max(1)
    }

    /// Advances the join one bounded step; true when complete.
    pub(crate) fn do_work(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<bool> {
        if now_ms >= self.deadline_ms && self.state != JoinState::Done {
            return Err(ClusterError::DynamicJoinTimeout {
                state: self.state_name(),
            });
        }

        match self.state {
            JoinState::Init => self.on_init(agent, now_ms)?,
            JoinState::SnapshotRetrieve => self.on_snapshot_retrieve(agent, now_ms)?,
            JoinState::SnapshotReplicate => self.on_snapshot_replicate(agent, now_ms)?,
            JoinState::SnapshotLoad => self.on_snapshot_load(agent, now_ms)?,
            JoinState::JoinCluster => self.on_join_cluster(agent, now_ms)?,
            JoinState::Done => {}
        }
        Ok(self.state == JoinState::Done)
    }

    fn on_init(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<()> {
        if now_ms < self.time_of_last_send_ms + Self::resend_interval_ms(agent) {
            return Ok(());
        }
        self.time_of_last_send_ms = now_ms;

        let endpoints = agent.config.cluster_members_status_endpoints.clone();
        if endpoints.is_empty() {
            return Err(ClusterError::MemberParse(
                "dynamic join requires cluster_members_status_endpoints".to_string(),
            ));
        }
        let endpoint = &endpoints[self.contact_index % endpoints.len()];
        self.contact_index += 1;

        agent.send_to_endpoint(
            endpoint,
            &PeerMessage::AddPassiveMember {
                correlation_id: self.correlation_id,
                member_endpoints: agent.config.member_endpoints.clone(),
            },
        )?;
        Ok(())
    }

    /// The leader (or a relay) answered with the current membership.
    pub(crate) fn on_cluster_members_change(
        &mut self,
        agent: &mut ConsensusAgent,
        correlation_id: CorrelationId,
        leader_member_id: MemberId,
        active_members: &str,
        passive_members: &str,
        now_ms: i64,
    ) -> ClusterResult<()> {
        if correlation_id != self.correlation_id || self.state != JoinState::Init {
            return Ok(());
        }

        let mut registry = MemberRegistry::parse(active_members)?;
        let own_endpoints = crate::members::MemberEndpoints::parse(&agent.config.member_endpoints)?;
        let mut own_id = None;
        for passive in passive_members.split('|').filter(|m| !m.is_empty()) {
            let (id_text, endpoints_text) = passive.split_once(',').ok_or_else(|| {
                ClusterError::MemberParse(format!("passive entry missing id: `{passive}`"))
            })?;
            let id: u32 = id_text.parse().map_err(|_| {
                ClusterError::MemberParse(format!("passive id is not an integer: `{id_text}`"))
            })?;
            let endpoints = crate::members::MemberEndpoints::parse(endpoints_text)?;
            if endpoints == own_endpoints {
                own_id = Some(MemberId::new(id));
            }
            registry.add_passive(crate::members::ClusterMember::new(
                MemberId::new(id),
                endpoints,
            ))?;
        }

        let Some(own_id) = own_id else {
            // Relayed response that does not include us yet; keep asking.
            return Ok(());
        };

        agent.adopt_membership(registry, own_id)?;
        self.leader_member_id = Some(leader_member_id);
        tracing::info!(
            member = %own_id,
            leader = %leader_member_id,
            "admitted as passive member"
        );

        self.time_of_last_send_ms = 0;
        self.state = if agent.config.cluster_members_ignore_snapshot {
            JoinState::JoinCluster
        } else {
            JoinState::SnapshotRetrieve
        };
        let _ = now_ms;
        Ok(())
    }

    fn on_snapshot_retrieve(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<()> {
        let Some(leader) = self.leader_member_id else {
            self.state = JoinState::Init;
            return Ok(());
        };
        if now_ms < self.time_of_last_send_ms + Self::resend_interval_ms(agent) {
            return Ok(());
        }
        self.time_of_last_send_ms = now_ms;
        agent.send_peer(
            leader,
            &PeerMessage::SnapshotRecordingQuery {
                correlation_id: self.correlation_id,
                requesting_member_id: agent.member_id,
            },
        )?;
        Ok(())
    }

    /// The leader answered the snapshot query.
    pub(crate) fn on_snapshot_recordings(
        &mut self,
        agent: &mut ConsensusAgent,
        correlation_id: CorrelationId,
        snapshots: &[SnapshotMarkerSummary],
    ) -> ClusterResult<()> {
        if correlation_id != self.correlation_id || self.state != JoinState::SnapshotRetrieve {
            return Ok(());
        }
        if snapshots.is_empty() {
            self.state = JoinState::JoinCluster;
            self.time_of_last_send_ms = 0;
            return Ok(());
        }

        // Replicate each recording into a fresh local one: record a private
        // channel and replay the source onto it.
        for (index, source) in snapshots.iter().enumerate() {
            let channel = agent.snapshot_replicate_channel(index);
            let stream_id = agent.config.channels.snapshot_stream_id;
            let source_stop_position = agent.archive.stop_position(source.recording_id)?;
            let local_recording_id = agent.archive.start_recording(&channel, stream_id)?;
            let extent = agent.archive.list_recording(source.recording_id)?;
            let replay_session_id = agent.archive.start_replay(
                source.recording_id,
                extent.start_position,
                None,
                &channel,
                stream_id,
            )?;
            self.replications.push(SnapshotReplication {
                source: *source,
                local_recording_id,
                source_stop_position,
                replay_session_id,
                complete: false,
            });
            self.snapshot_term_id = source.leadership_term_id;
            self.snapshot_position = source.log_position;
        }
        self.state = JoinState::SnapshotReplicate;
        Ok(())
    }

    fn on_snapshot_replicate(
        &mut self,
        agent: &mut ConsensusAgent,
        _now_ms: i64,
    ) -> ClusterResult<()> {
        agent.media.do_work();
        let mut all_complete = true;
        for replication in &mut self.replications {
            if replication.complete {
                continue;
            }
            let recorded = agent.archive.stop_position(replication.local_recording_id)?;
            if recorded >= replication.source_stop_position {
                agent.archive.stop_replay(replication.replay_session_id)?;
                agent.archive.stop_recording(replication.local_recording_id)?;
                replication.complete = true;
            } else {
                all_complete = false;
            }
        }
        if all_complete {
            // The replicated snapshots become this member's own history.
            for replication in &self.replications {
                agent.recording_log.append_snapshot(SnapshotMarkerSummary {
                    recording_id: replication.local_recording_id,
                    ..replication.source
                });
            }
            self.state = JoinState::SnapshotLoad;
        }
        Ok(())
    }

    fn on_snapshot_load(&mut self, agent: &mut ConsensusAgent, _now_ms: i64) -> ClusterResult<()> {
        let module = self
            .replications
            .iter()
            .find(|r| r.source.service_id.is_consensus_module())
            .ok_or(ClusterError::RecoveryTimeout {
                awaiting: "module snapshot among retrieved recordings",
            })?;

        let summary = SnapshotMarkerSummary {
            recording_id: module.local_recording_id,
            ..module.source
        };
        let load_channel = agent.snapshot_load_channel();
        let stream_id = agent.config.channels.snapshot_stream_id;
        let loaded = snapshot::load_module_snapshot(
            agent.media.as_mut(),
            agent.archive.as_mut(),
            &load_channel,
            stream_id,
            &summary,
        )?;
        agent.install_module_snapshot(loaded, false)?;

        self.state = JoinState::JoinCluster;
        self.time_of_last_send_ms = 0;
        Ok(())
    }

    fn on_join_cluster(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<()> {
        let Some(leader) = self.leader_member_id else {
            self.state = JoinState::Init;
            return Ok(());
        };

        if self.join_watch.is_none() {
            let channel = agent.config.channels.log_channel.clone();
            let stream_id = agent.config.channels.log_stream_id;
            self.join_watch = Some(agent.media.add_subscription(&channel, stream_id)?);
        }

        if now_ms >= self.time_of_last_send_ms + Self::resend_interval_ms(agent) {
            self.time_of_last_send_ms = now_ms;
            agent.send_peer(
                leader,
                &PeerMessage::JoinCluster {
                    leadership_term_id: self.snapshot_term_id,
                    member_id: agent.member_id,
                },
            )?;
        }

        // Watch the live log for our own JOIN; full state catch-up is the
        // follower election's job afterwards.
        let watch = self.join_watch.as_mut().expect("created above");
        for fragment in watch.poll(agent.config.message_limit) {
            let record: LogRecord = tektite_wire::decode(&fragment.payload)?;
            if let LogRecord::MembershipChange {
                change_type: ChangeType::Join,
                member_id,
                ..
            } = record
            {
                if member_id == agent.member_id {
                    tracing::info!(member = %agent.member_id, "observed own JOIN event");
                    if let Some(mut watch) = self.join_watch.take() {
                        watch.close();
                    }
                    self.state = JoinState::Done;
                    break;
                }
            }
        }
        Ok(())
    }

    /// The position and term the joiner's log effectively starts at.
    pub(crate) fn restored_position(&self) -> (LeadershipTermId, LogPosition) {
        (self.snapshot_term_id, self.snapshot_position)
    }
}
