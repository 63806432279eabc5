//! The consensus agent: a single-threaded cooperative state machine driven
//! by a conductor calling [`ConsensusAgent::do_work`].
//!
//! Each tick performs a bounded amount of work: slow-tick housekeeping when
//! the millisecond advances, polling of peer control, service control, and
//! exactly one of the three protocol modes (dynamic join, election, or
//! normal consensus). Sub-machines are owned by the agent but borrow it only
//! for the duration of a tick, taken out before the call and put back after.
//!
//! Module states and their transitions:
//!
//! | From → To | Trigger |
//! |---|---|
//! | Init → Active | recovery complete and services acknowledged |
//! | Init → Suspended | a committed SUSPEND was replayed during recovery |
//! | Active → Suspended | SUSPEND action committed |
//! | Suspended → Active | RESUME action committed |
//! | Active → Snapshot | SNAPSHOT toggle or SHUTDOWN |
//! | Snapshot → Active | snapshot complete, no termination pending |
//! | Snapshot → Terminating | snapshot complete under SHUTDOWN |
//! | Active → Terminating | ABORT, or a follower reaching the termination position |
//! | any → Leaving | own QUIT observed in the log |
//! | Leaving/Terminating → Closed | position reached and acks collected or timeout |

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tektite_types::{
    ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId, RecordingId,
    ServiceId,
};
use tektite_transport::{
    Archive, ChannelUri, Media, Publication, Subscription, TERM_OFFSET_PARAM, ToggleState,
    TransportError,
};
use tektite_wire::{
    ChangeType, CloseReason, ClusterAction, EgressEvent, EventCode, FromServiceMessage,
    IngressFrame, LogRecord, PeerMessage, SnapshotMarkerSummary,
};

use crate::config::ClusterConfig;
use crate::counters::ClusterCounters;
use crate::dynamic_join::DynamicJoin;
use crate::election::Election;
use crate::error::{ClusterError, ClusterResult};
use crate::ingress::{EgressSender, IngressAdapter};
use crate::log_stream::{LogAdapter, LogPublisher};
use crate::members::{ClusterMember, MemberEndpoints, MemberRegistry};
use crate::pending_ring::PendingServiceMessageRing;
use crate::recording_log::RecordingLog;
use crate::service_proxy::{ServiceAdapter, ServiceProxy};
use crate::sessions::{Authenticator, SessionState, SessionTable};
use crate::snapshot::{self, ModuleSnapshot};
use crate::timers::TimerService;

// ============================================================================
// Module State & Role
// ============================================================================

/// State of the consensus module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Init,
    Active,
    Suspended,
    Snapshot,
    Leaving,
    Terminating,
    Closed,
}

impl ModuleState {
    /// Code published through the module-state counter.
    pub fn code(self) -> i64 {
        match self {
            ModuleState::Init => 0,
            ModuleState::Active => 1,
            ModuleState::Suspended => 2,
            ModuleState::Snapshot => 3,
            ModuleState::Leaving => 4,
            ModuleState::Terminating => 5,
            ModuleState::Closed => 6,
        }
    }
}

/// Replication role of this member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

// ============================================================================
// Service Ack Barrier
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckPurpose {
    Startup,
    Snapshot,
    Termination,
}

/// Tracks one round of service acks at an expected position.
#[derive(Debug)]
struct AckBarrier {
    purpose: AckPurpose,
    position: LogPosition,
    ack_id: i64,
    relevant_ids: Vec<Option<i64>>,
}

impl AckBarrier {
    fn new(purpose: AckPurpose, position: LogPosition, ack_id: i64, service_count: usize) -> Self {
        Self {
            purpose,
            position,
            ack_id,
            relevant_ids: vec![None; service_count],
        }
    }

    fn on_ack(
        &mut self,
        service_id: ServiceId,
        position: LogPosition,
        ack_id: i64,
        relevant_id: i64,
    ) -> ClusterResult<()> {
        if position != self.position || ack_id != self.ack_id {
            return Err(ClusterError::InvalidServiceAck {
                service_id,
                position,
                ack_id,
                expected_position: self.position,
                expected_ack_id: self.ack_id,
            });
        }
        let index = service_id.as_i32();
        if index >= 0 && (index as usize) < self.relevant_ids.len() {
            self.relevant_ids[index as usize] = Some(relevant_id);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.relevant_ids.iter().all(Option::is_some)
    }
}

/// Parameters of a join-log notification awaiting delivery to the services.
#[derive(Debug, Clone)]
struct JoinLogParams {
    leadership_term_id: LeadershipTermId,
    log_position: LogPosition,
    log_session_id: i32,
    is_startup: bool,
    role_is_leader: bool,
}

// ============================================================================
// Consensus Agent
// ============================================================================

/// The per-member consensus agent.
pub struct ConsensusAgent {
    pub(crate) config: ClusterConfig,
    pub(crate) media: Box<dyn Media>,
    pub(crate) archive: Box<dyn Archive>,
    pub(crate) counters: ClusterCounters,
    authenticator: Box<dyn Authenticator>,

    pub(crate) member_id: MemberId,
    own_endpoints: MemberEndpoints,
    state: ModuleState,
    role: Role,
    pub(crate) leadership_term_id: LeadershipTermId,
    pub(crate) leader_member_id: Option<MemberId>,
    pub(crate) term_base_log_position: LogPosition,

    pub(crate) members: MemberRegistry,
    pub(crate) sessions: SessionTable,
    pub(crate) timers: TimerService,
    pub(crate) recording_log: RecordingLog,
    pub(crate) pending_ring: PendingServiceMessageRing,

    election: Option<Election>,
    dynamic_join: Option<DynamicJoin>,

    pub(crate) log_publisher: Option<LogPublisher>,
    log_adapter: Option<LogAdapter>,
    ingress_adapter: IngressAdapter,
    egress: EgressSender,
    peer_subscription: Box<dyn Subscription>,
    peer_publications: HashMap<String, Box<dyn Publication>>,
    pub(crate) service_proxy: ServiceProxy,
    service_adapter: ServiceAdapter,

    pub(crate) log_recording_id: Option<RecordingId>,
    pub(crate) recovery_plan: crate::recording_log::RecoveryPlan,
    /// Appended position restored from the recovery plan or a snapshot,
    /// authoritative until a publisher or adapter exists.
    restored_appended: LogPosition,
    /// Position up to which records have actually been applied here. Lags
    /// `restored_appended` while a recovered tail awaits replay.
    delivered_position: LogPosition,

    commit_position: LogPosition,
    follower_commit_position: LogPosition,
    ack_barrier: Option<AckBarrier>,
    service_ack_id: i64,
    module_snapshot_recording_id: Option<RecordingId>,
    termination_position: Option<LogPosition>,
    termination_deadline_ms: Option<i64>,
    termination_notified: bool,
    termination_services_acked: bool,
    pending_shutdown: bool,
    suspend_on_start: bool,

    pub(crate) cluster_time_ms: i64,
    pub(crate) cached_time_ms: i64,
    time_of_last_log_update_ms: i64,
    time_of_last_append_position_ms: i64,
    time_of_last_commit_broadcast_ms: i64,
    time_of_last_quorum_activity_ms: i64,
    recovery_deadline_ms: Option<i64>,

    pending_ingress: VecDeque<IngressFrame>,
    pending_session_closes: VecDeque<(ClusterSessionId, CloseReason)>,
    pending_snapshot_position: Option<LogPosition>,
    pending_membership_change: Option<(LogPosition, ChangeType, MemberId)>,
    pending_join_log: Option<JoinLogParams>,
}

impl ConsensusAgent {
    // ========================================================================
    // Launch
    // ========================================================================

    /// Builds the agent and performs the inline part of recovery: the
    /// recovery plan is derived from the recording log and the module's own
    /// snapshot, if any, is loaded. The service-ack barrier and any log
    /// replay complete across subsequent ticks.
    pub fn launch(
        config: ClusterConfig,
        mut media: Box<dyn Media>,
        mut archive: Box<dyn Archive>,
        counters: ClusterCounters,
        recording_log: RecordingLog,
        authenticator: Box<dyn Authenticator>,
    ) -> ClusterResult<Self> {
        let dynamic = config.is_dynamic_join();
        let members = if dynamic {
            MemberRegistry::default()
        } else {
            MemberRegistry::parse(&config.cluster_members)?
        };

        let member_id = MemberId::new(config.cluster_member_id);
        let own_endpoints = if dynamic {
            MemberEndpoints::parse(&config.member_endpoints)?
        } else {
            members
                .find(member_id)
                .map(|m| m.endpoints.clone())
                .ok_or_else(|| {
                    ClusterError::MemberParse(format!(
                        "member {member_id} is not in cluster_members"
                    ))
                })?
        };

        let peer_subscription = media.add_subscription(
            &config.channels.endpoint_channel(&own_endpoints.member_facing),
            config.channels.member_status_stream_id,
        )?;
        let ingress_adapter = IngressAdapter::new(media.add_subscription(
            &config.channels.endpoint_channel(&own_endpoints.client_facing),
            config.channels.ingress_stream_id,
        )?);
        let service_channel = config.channels.service_channel(config.cluster_member_id);
        let service_proxy = ServiceProxy::new(
            media.add_publication(&service_channel, config.channels.service_stream_id)?,
        );
        // Service → module traffic flows on the adjacent stream id.
        let service_adapter = ServiceAdapter::new(
            media.add_subscription(&service_channel, config.channels.service_stream_id + 1)?,
        );

        let recovery_plan = recording_log.create_recovery_plan(config.service_count, |id| {
            archive.stop_position(id).ok()
        });
        let pending_ring = PendingServiceMessageRing::new(config.pending_message_capacity);

        let mut agent = Self {
            member_id,
            own_endpoints,
            state: ModuleState::Init,
            role: Role::Follower,
            leadership_term_id: LeadershipTermId::NONE,
            leader_member_id: None,
            term_base_log_position: LogPosition::ZERO,
            members,
            sessions: SessionTable::new(),
            timers: TimerService::new(),
            recording_log,
            pending_ring,
            election: None,
            dynamic_join: None,
            log_publisher: None,
            log_adapter: None,
            ingress_adapter,
            egress: EgressSender::new(),
            peer_subscription,
            peer_publications: HashMap::new(),
            service_proxy,
            service_adapter,
            log_recording_id: None,
            restored_appended: recovery_plan.appended_log_position,
            delivered_position: recovery_plan.start_position(),
            commit_position: recovery_plan.start_position(),
            follower_commit_position: recovery_plan.start_position(),
            recovery_plan,
            ack_barrier: None,
            service_ack_id: 0,
            module_snapshot_recording_id: None,
            termination_position: None,
            termination_deadline_ms: None,
            termination_notified: false,
            termination_services_acked: false,
            pending_shutdown: false,
            suspend_on_start: false,
            cluster_time_ms: 0,
            cached_time_ms: -1,
            time_of_last_log_update_ms: 0,
            time_of_last_append_position_ms: 0,
            time_of_last_commit_broadcast_ms: 0,
            time_of_last_quorum_activity_ms: 0,
            recovery_deadline_ms: None,
            pending_ingress: VecDeque::new(),
            pending_session_closes: VecDeque::new(),
            pending_snapshot_position: None,
            pending_membership_change: None,
            pending_join_log: None,
            config,
            media,
            archive,
            counters,
            authenticator,
        };

        if let Some(summary) = agent.recovery_plan.module_snapshot().copied() {
            let load_channel = agent.snapshot_load_channel();
            let stream_id = agent.config.channels.snapshot_stream_id;
            let loaded = snapshot::load_module_snapshot(
                agent.media.as_mut(),
                agent.archive.as_mut(),
                &load_channel,
                stream_id,
                &summary,
            )?;
            agent.install_module_snapshot(loaded, true)?;
        }
        agent.leadership_term_id = agent.recovery_plan.last_leadership_term_id;
        agent
            .counters
            .leadership_term_id
            .set(agent.leadership_term_id.as_i64());
        agent.counters.commit_position.set(agent.commit_position.as_u64() as i64);
        agent
            .counters
            .appended_position
            .set(agent.restored_appended.as_u64() as i64);
        agent.counters.module_state.set(ModuleState::Init.code());

        // The services load their own snapshots in parallel and must all
        // acknowledge the restart position before anything else happens.
        agent.ack_barrier = Some(AckBarrier::new(
            AckPurpose::Startup,
            agent.recovery_plan.start_position(),
            agent.service_ack_id,
            agent.config.service_count,
        ));

        tracing::info!(
            member = %agent.member_id,
            term = %agent.leadership_term_id,
            appended = %agent.restored_appended,
            snapshots = agent.recovery_plan.snapshots.len(),
            replay = agent.recovery_plan.has_replay(),
            "consensus module launched"
        );
        Ok(agent)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn leadership_term_id(&self) -> LeadershipTermId {
        self.leadership_term_id
    }

    pub fn commit_position(&self) -> LogPosition {
        if self.role == Role::Leader {
            self.commit_position
        } else {
            self.follower_commit_position
        }
    }

    pub fn is_electing(&self) -> bool {
        self.election.is_some()
    }

    /// This member's appended log position, as canvassed: what it holds or
    /// can replay, even if not yet applied.
    pub fn appended_position(&self) -> LogPosition {
        if let Some(publisher) = &self.log_publisher {
            return publisher.position();
        }
        self.delivered_position.max(self.restored_appended)
    }

    /// Position up to which records have been applied on this member.
    pub(crate) fn delivered_position(&self) -> LogPosition {
        if let Some(publisher) = &self.log_publisher {
            return publisher.position();
        }
        self.delivered_position
    }

    /// Forgets a recovered-but-unreplayed tail; a follower re-fetches it
    /// from the leader instead of replaying locally.
    pub(crate) fn discard_unreplayed_tail(&mut self) {
        self.restored_appended = self.delivered_position;
    }

    pub(crate) fn last_log_term_id(&self) -> LeadershipTermId {
        match self.recording_log.last_term() {
            Some(crate::recording_log::Entry::Term {
                leadership_term_id, ..
            }) => *leadership_term_id,
            _ => LeadershipTermId::NONE,
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Performs one bounded unit of duty; returns the work count for the
    /// conductor's idle strategy.
    pub fn do_work(&mut self, now_ms: i64) -> usize {
        if self.state == ModuleState::Closed {
            return 0;
        }
        match self.tick(now_ms) {
            Ok(work) => work,
            Err(error) => {
                self.on_error(&error);
                1
            }
        }
    }

    fn tick(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;

        if now_ms != self.cached_time_ms {
            self.cached_time_ms = now_ms;
            work += self.slow_tick(now_ms)?;
        }

        work += self.poll_peer_control(now_ms)?;
        work += self.poll_service_control(now_ms)?;

        // Exactly one protocol mode per tick. An erroring sub-machine goes
        // back in place so a transient fault retries the same step.
        if let Some(mut join) = self.dynamic_join.take() {
            match join.do_work(self, now_ms) {
                Ok(true) => self.on_dynamic_join_complete(&join, now_ms)?,
                Ok(false) => self.dynamic_join = Some(join),
                Err(error) => {
                    self.dynamic_join = Some(join);
                    return Err(error);
                }
            }
            work += 1;
        } else if let Some(mut election) = self.election.take() {
            match election.do_work(self, now_ms) {
                Ok(true) => self.on_election_complete(now_ms),
                Ok(false) => self.election = Some(election),
                Err(error) => {
                    self.election = Some(election);
                    return Err(error);
                }
            }
            work += 1;
        } else {
            work += self.consensus_work(now_ms)?;
        }

        Ok(work)
    }

    // ========================================================================
    // Slow Tick
    // ========================================================================

    fn slow_tick(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = self.media.do_work();

        if self.role == Role::Leader {
            // Cluster time advances from the wall clock only on the leader;
            // followers advance it as the log delivers records.
            self.cluster_time_ms = self.cluster_time_ms.max(now_ms);
        }

        self.check_service_heartbeats(now_ms)?;

        if self.state == ModuleState::Init {
            if self.recovery_deadline_ms.is_none() {
                self.recovery_deadline_ms =
                    Some(now_ms + self.config.timeouts.recovery_timeout_ms());
            }
            if self.ack_barrier.is_some()
                && self.recovery_deadline_ms.is_some_and(|d| now_ms > d)
            {
                return Err(ClusterError::RecoveryTimeout {
                    awaiting: "service acks at the restart position",
                });
            }
        }

        work += self.process_redirect_sessions(now_ms)?;
        work += self.process_rejected_sessions(now_ms)?;

        if self.role == Role::Leader && self.election.is_none() {
            work += self.process_pending_sessions(now_ms)?;
            if self.state == ModuleState::Active {
                work += self.process_session_timeouts(now_ms)?;
            }
            work += self.process_new_leader_events(now_ms)?;
            if matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
                work += self.poll_control_toggle(now_ms)?;
            }
        }

        if matches!(self.state, ModuleState::Terminating | ModuleState::Leaving) {
            self.check_termination_progress(now_ms)?;
        }

        Ok(work)
    }

    fn check_service_heartbeats(&mut self, now_ms: i64) -> ClusterResult<()> {
        let timeout_ms = self.config.timeouts.service_heartbeat_timeout_ms();
        for (index, heartbeat) in self.counters.service_heartbeats.iter().enumerate() {
            let last = heartbeat.get();
            if last > 0 && now_ms - last > timeout_ms {
                return Err(ClusterError::ServiceHeartbeatLost {
                    service_id: ServiceId::new(index as i32),
                    silent_ms: now_ms - last,
                });
            }
        }
        Ok(())
    }

    fn poll_control_toggle(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let toggle = self.counters.control_toggle.clone();
        let action = toggle.poll();
        if action == ToggleState::Neutral {
            return Ok(0);
        }

        let accepted = match action {
            ToggleState::Neutral => true,
            ToggleState::Suspend => self
                .append_cluster_action(ClusterAction::Suspend)?
                .is_some(),
            ToggleState::Resume => self.append_cluster_action(ClusterAction::Resume)?.is_some(),
            ToggleState::Snapshot => self
                .append_cluster_action(ClusterAction::Snapshot)?
                .is_some(),
            ToggleState::Shutdown => {
                let appended = self.append_cluster_action(ClusterAction::Snapshot)?;
                if appended.is_some() {
                    self.pending_shutdown = true;
                }
                appended.is_some()
            }
            ToggleState::Abort => {
                self.initiate_termination(self.appended_position(), now_ms)?;
                true
            }
        };

        if accepted {
            tracing::info!(member = %self.member_id, ?action, "control toggle accepted");
            toggle.reset();
            Ok(1)
        } else {
            // Back-pressured append: leave the toggle set and retry.
            Ok(0)
        }
    }

    fn append_cluster_action(
        &mut self,
        action: ClusterAction,
    ) -> ClusterResult<Option<LogPosition>> {
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(None);
        };
        let appended = publisher.append_cluster_action(action, term, timestamp)?;
        if let Some(position) = appended {
            self.on_leader_append(position);
            self.on_cluster_action(action, position)?;
        }
        Ok(appended)
    }

    // ========================================================================
    // Consensus Mode
    // ========================================================================

    fn consensus_work(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;

        match self.role {
            Role::Leader => {
                work += self.retry_pending_join_log()?;
                if self.state == ModuleState::Active {
                    work += self.process_ingress(now_ms)?;
                    work += self.process_pending_session_closes(now_ms)?;
                    work += self.drain_pending_service_messages()?;
                    work += self.poll_leader_timers()?;
                }
                work += self.update_commit_position(now_ms)?;
                self.check_quorum_liveness(now_ms)?;
            }
            Role::Follower => {
                work += self.retry_pending_join_log()?;
                work += self.poll_log_records(now_ms)?;
                // Connects that land here become redirects at the leader.
                work += self.process_ingress(now_ms)?;
                work += self.publish_appended_position(now_ms)?;
                self.check_leader_liveness(now_ms)?;
            }
        }

        self.apply_pending_membership_change()?;
        self.check_pending_snapshot(now_ms)?;
        self.check_termination_reached(now_ms)?;

        Ok(work)
    }

    /// Bounded poll of the log stream; dispatches each record.
    pub(crate) fn poll_log_records(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let Some(adapter) = self.log_adapter.as_mut() else {
            return Ok(0);
        };
        let records = adapter.poll(self.config.message_limit)?;
        let work = records.len();
        for (position, record) in records {
            self.on_log_record(position, record, now_ms)?;
        }
        if work > 0 {
            self.counters
                .appended_position
                .set(self.appended_position().as_u64() as i64);
        }
        Ok(work)
    }

    fn check_leader_liveness(&mut self, now_ms: i64) -> ClusterResult<()> {
        if self.state != ModuleState::Active || self.leader_member_id.is_none() {
            return Ok(());
        }
        let timeout = self.config.timeouts.leader_heartbeat_timeout_ms();
        let last = self
            .time_of_last_log_update_ms
            .max(self.time_of_last_quorum_activity_ms);
        if last > 0 && now_ms - last > timeout {
            tracing::warn!(
                member = %self.member_id,
                silent_ms = now_ms - last,
                "leader heartbeat lost"
            );
            self.enter_election(now_ms, "leader heartbeat timeout");
        }
        Ok(())
    }

    fn check_quorum_liveness(&mut self, now_ms: i64) -> ClusterResult<()> {
        if self.members.active_count() <= 1 || self.state != ModuleState::Active {
            return Ok(());
        }
        let timeout = self.config.timeouts.leader_heartbeat_timeout_ms();
        if self.time_of_last_quorum_activity_ms > 0
            && now_ms - self.time_of_last_quorum_activity_ms > timeout
        {
            tracing::warn!(member = %self.member_id, "quorum of followers lost");
            self.enter_election(now_ms, "quorum lost");
        }
        Ok(())
    }

    fn update_commit_position(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let appended = self.appended_position();
        if let Some(me) = self.members.find_mut(self.member_id) {
            me.appended_log_position = appended;
        }
        if self.members.active_count() == 1 {
            self.time_of_last_quorum_activity_ms = now_ms;
        }

        let quorum_position = self.members.quorum_position();
        let advanced = quorum_position > self.commit_position;
        if advanced {
            self.commit_position = quorum_position;
            self.counters
                .commit_position
                .set(self.commit_position.as_u64() as i64);
            self.counters
                .appended_position
                .set(appended.as_u64() as i64);
        }

        let interval = self.config.timeouts.leader_heartbeat_interval_ms();
        if advanced || now_ms >= self.time_of_last_commit_broadcast_ms + interval {
            self.time_of_last_commit_broadcast_ms = now_ms;
            self.broadcast_peer(&PeerMessage::CommitPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: self.commit_position,
                leader_member_id: self.member_id,
            })?;
            return Ok(1);
        }
        Ok(0)
    }

    /// Reports this follower's appended position to the leader when it has
    /// advanced or on the heartbeat interval.
    pub(crate) fn publish_appended_position(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let Some(leader) = self.leader_member_id else {
            return Ok(0);
        };
        if leader == self.member_id {
            return Ok(0);
        }
        let interval = self.config.timeouts.leader_heartbeat_interval_ms();
        if now_ms < self.time_of_last_append_position_ms + interval {
            return Ok(0);
        }
        self.time_of_last_append_position_ms = now_ms;
        let position = self.delivered_position();
        let sent = self.send_peer(
            leader,
            &PeerMessage::AppendedPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: position,
                follower_member_id: self.member_id,
            },
        )?;
        self.counters
            .appended_position
            .set(position.as_u64() as i64);
        Ok(usize::from(sent))
    }

    // ========================================================================
    // Leader Duties
    // ========================================================================

    fn process_ingress(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;

        // Retries first; nothing new is polled while a frame is parked, so
        // back-pressure never reorders the ingress stream.
        while let Some(frame) = self.pending_ingress.front().cloned() {
            if self.apply_ingress(&frame, now_ms)? {
                self.pending_ingress.pop_front();
                work += 1;
            } else {
                return Ok(work);
            }
        }

        let frames = self.ingress_adapter.poll(self.config.message_limit)?;
        for frame in frames {
            if self.apply_ingress(&frame, now_ms)? {
                work += 1;
            } else {
                self.pending_ingress.push_back(frame);
                break;
            }
        }
        Ok(work)
    }

    /// Applies one ingress frame; false means back-pressure, park and retry.
    fn apply_ingress(&mut self, frame: &IngressFrame, now_ms: i64) -> ClusterResult<bool> {
        match frame {
            IngressFrame::SessionConnect {
                correlation_id,
                response_stream_id,
                version,
                response_channel,
                credentials,
            } => {
                self.on_session_connect(
                    *correlation_id,
                    *response_stream_id,
                    *version,
                    response_channel.clone(),
                    credentials,
                    now_ms,
                );
                Ok(true)
            }
            IngressFrame::SessionClose {
                leadership_term_id,
                cluster_session_id,
            } => {
                if self.role != Role::Leader || *leadership_term_id != self.leadership_term_id {
                    return Ok(true);
                }
                self.close_session_by_append(*cluster_session_id, CloseReason::ClientAction, now_ms)
            }
            IngressFrame::IngressMessage {
                leadership_term_id,
                cluster_session_id,
                payload,
            } => self.on_ingress_message(
                *leadership_term_id,
                *cluster_session_id,
                payload.clone(),
                now_ms,
            ),
            IngressFrame::SessionKeepAlive {
                leadership_term_id,
                cluster_session_id,
            } => {
                if *leadership_term_id == self.leadership_term_id {
                    if let Some(session) = self.sessions.find_open_mut(*cluster_session_id) {
                        session.time_of_last_activity_ms = now_ms;
                    }
                }
                Ok(true)
            }
            IngressFrame::ChallengeResponse {
                correlation_id: _,
                cluster_session_id,
                credentials,
            } => {
                self.sessions.challenge_response(
                    *cluster_session_id,
                    credentials,
                    self.authenticator.as_mut(),
                    now_ms,
                );
                Ok(true)
            }
        }
    }

    fn on_session_connect(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        version: u32,
        response_channel: String,
        credentials: &[u8],
        now_ms: i64,
    ) {
        if self.role != Role::Leader {
            self.sessions.redirect_connect(
                correlation_id,
                response_stream_id,
                response_channel,
                now_ms,
            );
            return;
        }
        if tektite_wire::version_major(version) != tektite_wire::PROTOCOL_MAJOR_VERSION {
            self.sessions.reject_connect(
                correlation_id,
                response_stream_id,
                response_channel,
                "invalid client version",
                now_ms,
            );
            return;
        }
        if self.sessions.open_plus_pending() >= self.config.max_concurrent_sessions {
            self.sessions.reject_connect(
                correlation_id,
                response_stream_id,
                response_channel,
                "concurrent session limit",
                now_ms,
            );
            return;
        }
        let id = self.sessions.connect(
            correlation_id,
            response_stream_id,
            response_channel,
            credentials,
            self.authenticator.as_mut(),
            now_ms,
        );
        tracing::debug!(member = %self.member_id, session = %id, "session connect admitted");
    }

    fn on_ingress_message(
        &mut self,
        leadership_term_id: LeadershipTermId,
        cluster_session_id: ClusterSessionId,
        payload: Bytes,
        now_ms: i64,
    ) -> ClusterResult<bool> {
        if self.role != Role::Leader || leadership_term_id != self.leadership_term_id {
            return Ok(true);
        }
        if self
            .sessions
            .find_open_mut(cluster_session_id)
            .is_none()
        {
            return Ok(true);
        }

        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(false);
        };
        match publisher.append_session_message(cluster_session_id, payload, term, timestamp)? {
            Some(position) => {
                self.on_leader_append(position);
                if let Some(session) = self.sessions.find_open_mut(cluster_session_id) {
                    session.time_of_last_activity_ms = now_ms;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn close_session_by_append(
        &mut self,
        cluster_session_id: ClusterSessionId,
        reason: CloseReason,
        now_ms: i64,
    ) -> ClusterResult<bool> {
        if self.sessions.find_open_mut(cluster_session_id).is_none() {
            return Ok(true);
        }
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(false);
        };
        match publisher.append_session_close(cluster_session_id, reason, term, timestamp)? {
            Some(position) => {
                self.on_leader_append(position);
                if let Some(session) = self.sessions.close_open(cluster_session_id, reason) {
                    let event = EgressEvent::SessionEvent {
                        correlation_id: session.correlation_id,
                        cluster_session_id,
                        leadership_term_id: term,
                        leader_member_id: self.member_id,
                        code: EventCode::Closed,
                        detail: format!("{reason:?}"),
                    };
                    let _ = self.egress.offer(
                        self.media.as_mut(),
                        &session.response_channel,
                        session.response_stream_id,
                        &event,
                    )?;
                    if reason == CloseReason::Timeout {
                        self.counters.timed_out_clients.increment();
                    }
                }
                let _ = now_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn process_pending_session_closes(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;
        while let Some((id, reason)) = self.pending_session_closes.front().copied() {
            if self.close_session_by_append(id, reason, now_ms)? {
                self.pending_session_closes.pop_front();
                work += 1;
            } else {
                break;
            }
        }
        Ok(work)
    }

    fn drain_pending_service_messages(&mut self) -> ClusterResult<usize> {
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(0);
        };

        let mut result: ClusterResult<()> = Ok(());
        let mut last_position = None;
        let consumed = self.pending_ring.consume(self.config.message_limit, |entry| {
            match publisher.append_session_message(
                entry.cluster_session_id,
                entry.payload.clone(),
                term,
                timestamp,
            ) {
                Ok(Some(position)) => {
                    last_position = Some(position);
                    true
                }
                Ok(None) => false,
                Err(error) => {
                    result = Err(error);
                    false
                }
            }
        });
        result?;
        if let Some(position) = last_position {
            self.on_leader_append(position);
        }
        Ok(consumed)
    }

    fn poll_leader_timers(&mut self) -> ClusterResult<usize> {
        let term = self.leadership_term_id;
        let now = self.cluster_time_ms;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(0);
        };

        let mut result: ClusterResult<()> = Ok(());
        let mut last_position = None;
        let fired = self.timers.poll(now, |correlation_id| {
            match publisher.append_timer_event(correlation_id, term, now) {
                Ok(Some(position)) => {
                    last_position = Some(position);
                    true
                }
                Ok(None) => false,
                Err(error) => {
                    result = Err(error);
                    false
                }
            }
        });
        result?;
        if let Some(position) = last_position {
            self.on_leader_append(position);
        }
        Ok(fired)
    }

    /// Bookkeeping after the leader appends a record inline.
    pub(crate) fn on_leader_append(&mut self, position: LogPosition) {
        self.restored_appended = self.restored_appended.max(position);
        self.delivered_position = self.delivered_position.max(position);
        if let Some(adapter) = self.log_adapter.as_mut() {
            // The leader applies records at append; its own subscription
            // must not re-deliver them if it later becomes a follower.
            adapter.advance_to(position);
        }
        if let Some(me) = self.members.find_mut(self.member_id) {
            me.appended_log_position = position;
        }
        self.counters
            .appended_position
            .set(position.as_u64() as i64);
    }

    // ========================================================================
    // Session Event Delivery
    // ========================================================================

    /// Opens authenticated sessions, delivers challenges, and expires
    /// pending sessions that never finished authenticating.
    fn process_pending_sessions(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let timeout_ms = self.config.timeouts.session_timeout_ms();

        // Authentication timeouts first, so a stuck session never opens.
        let expired: Vec<ClusterSessionId> = self
            .sessions
            .pending_sessions_mut()
            .iter()
            .filter(|s| s.has_timed_out(now_ms, timeout_ms))
            .map(|s| s.id)
            .collect();
        for id in expired {
            let pending = self.sessions.pending_sessions_mut();
            if let Some(index) = pending.iter().position(|s| s.id == id) {
                let mut session = pending.remove(index);
                session.reject_detail = "authentication timeout".to_string();
                session.transition(SessionState::Rejected);
                self.sessions.rejected_sessions_mut().push(session);
                work += 1;
            }
        }

        // Authenticated sessions open once their record lands in the log.
        let authenticated: Vec<ClusterSessionId> = self
            .sessions
            .pending_sessions_mut()
            .iter()
            .filter(|s| s.state == SessionState::Authenticated)
            .map(|s| s.id)
            .collect();
        for id in authenticated {
            let Some(publisher) = self.log_publisher.as_mut() else {
                break;
            };
            let Some(session) = self.sessions.find_pending_mut(id) else {
                continue;
            };
            let Some(position) = publisher.append_session_open(session, term, timestamp)? else {
                break;
            };
            self.on_leader_append(position);
            self.sessions.open_session(id, position);
            work += 1;

            let Some(session) = self.sessions.find_open_mut(id) else {
                continue;
            };
            let (correlation_id, channel, stream_id) = (
                session.correlation_id,
                session.response_channel.clone(),
                session.response_stream_id,
            );
            let event = EgressEvent::SessionEvent {
                correlation_id,
                cluster_session_id: id,
                leadership_term_id: term,
                leader_member_id: self.member_id,
                code: EventCode::Ok,
                detail: String::new(),
            };
            let _ = self
                .egress
                .offer(self.media.as_mut(), &channel, stream_id, &event)?;
            tracing::info!(member = %self.member_id, session = %id, %position, "session opened");
        }

        // Challenges go out once each.
        let challenged: Vec<ClusterSessionId> = self
            .sessions
            .pending_sessions_mut()
            .iter()
            .filter(|s| s.state == SessionState::Challenged && s.outbound_challenge.is_some())
            .map(|s| s.id)
            .collect();
        for id in challenged {
            let Some(session) = self.sessions.find_pending_mut(id) else {
                continue;
            };
            let Some(challenge) = session.outbound_challenge.clone() else {
                continue;
            };
            let (correlation_id, channel, stream_id) = (
                session.correlation_id,
                session.response_channel.clone(),
                session.response_stream_id,
            );
            let event = EgressEvent::Challenge {
                correlation_id,
                cluster_session_id: id,
                encoded_challenge: challenge,
            };
            if self
                .egress
                .offer(self.media.as_mut(), &channel, stream_id, &event)?
            {
                if let Some(session) = self.sessions.find_pending_mut(id) {
                    session.outbound_challenge = None;
                }
                work += 1;
            }
        }

        Ok(work)
    }

    /// Delivers rejection events until acknowledged by the transport or the
    /// session times out.
    fn process_rejected_sessions(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let timeout_ms = self.config.timeouts.session_timeout_ms();
        let term = self.leadership_term_id;
        let leader = self.leader_member_id.unwrap_or(self.member_id);

        let rejected = std::mem::take(self.sessions.rejected_sessions_mut());
        let mut kept = Vec::new();
        let mut work = 0;
        for session in rejected {
            let event = EgressEvent::SessionEvent {
                correlation_id: session.correlation_id,
                cluster_session_id: session.id,
                leadership_term_id: term,
                leader_member_id: leader,
                code: EventCode::Error,
                detail: session.reject_detail.clone(),
            };
            let sent = self.egress.offer(
                self.media.as_mut(),
                &session.response_channel,
                session.response_stream_id,
                &event,
            )?;
            if sent || session.has_timed_out(now_ms, timeout_ms) {
                work += 1;
            } else {
                kept.push(session);
            }
        }
        *self.sessions.rejected_sessions_mut() = kept;
        Ok(work)
    }

    /// Redirects connects that reached a non-leader at the current leader.
    fn process_redirect_sessions(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let Some(leader) = self.leader_member_id else {
            return Ok(0);
        };
        let timeout_ms = self.config.timeouts.session_timeout_ms();
        let term = self.leadership_term_id;
        let leader_ingress = self
            .members
            .find(leader)
            .map(|m| m.endpoints.client_facing.clone())
            .unwrap_or_default();

        let redirects = std::mem::take(self.sessions.redirect_sessions_mut());
        let mut kept = Vec::new();
        let mut work = 0;
        for session in redirects {
            let event = EgressEvent::SessionEvent {
                correlation_id: session.correlation_id,
                cluster_session_id: session.id,
                leadership_term_id: term,
                leader_member_id: leader,
                code: EventCode::Redirect,
                detail: leader_ingress.clone(),
            };
            let sent = self.egress.offer(
                self.media.as_mut(),
                &session.response_channel,
                session.response_stream_id,
                &event,
            )?;
            if sent || session.has_timed_out(now_ms, timeout_ms) {
                work += 1;
            } else {
                kept.push(session);
            }
        }
        *self.sessions.redirect_sessions_mut() = kept;
        Ok(work)
    }

    /// Tells every open session about this leader, exactly once per term.
    fn process_new_leader_events(&mut self, _now_ms: i64) -> ClusterResult<usize> {
        let term = self.leadership_term_id;
        let ingress_endpoints = self.members.encode_active();
        let pending: Vec<ClusterSessionId> = self
            .sessions
            .open_sessions()
            .iter()
            .filter(|s| s.pending_new_leader_event)
            .map(|s| s.id)
            .collect();

        let mut work = 0;
        for id in pending {
            let Some(session) = self.sessions.find_open_mut(id) else {
                continue;
            };
            let (channel, stream_id) =
                (session.response_channel.clone(), session.response_stream_id);
            let event = EgressEvent::NewLeaderEvent {
                cluster_session_id: id,
                leadership_term_id: term,
                leader_member_id: self.member_id,
                ingress_endpoints: ingress_endpoints.clone(),
            };
            if self
                .egress
                .offer(self.media.as_mut(), &channel, stream_id, &event)?
            {
                if let Some(session) = self.sessions.find_open_mut(id) {
                    session.pending_new_leader_event = false;
                }
                work += 1;
            }
        }
        Ok(work)
    }

    fn process_session_timeouts(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let timeout_ms = self.config.timeouts.session_timeout_ms();
        let mut work = 0;
        for id in self.sessions.timed_out_sessions(now_ms, timeout_ms) {
            if self.close_session_by_append(id, CloseReason::Timeout, now_ms)? {
                tracing::info!(member = %self.member_id, session = %id, "session timed out");
                work += 1;
            } else {
                break;
            }
        }
        Ok(work)
    }

    // ========================================================================
    // Peer Control
    // ========================================================================

    fn poll_peer_control(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let fragments = self.peer_subscription.poll(self.config.message_limit);
        let mut work = 0;
        for fragment in fragments {
            let message: PeerMessage = tektite_wire::decode(&fragment.payload)?;
            self.dispatch_peer(message, now_ms)?;
            work += 1;
        }
        Ok(work)
    }

    fn dispatch_peer(&mut self, message: PeerMessage, now_ms: i64) -> ClusterResult<()> {
        // A message for a term beyond ours forces an election; the message
        // itself is then handled by the fresh election so nothing is lost.
        if let Some(term) = message.leadership_term_id() {
            if term > self.leadership_term_id
                && self.election.is_none()
                && self.dynamic_join.is_none()
                && matches!(self.state, ModuleState::Active | ModuleState::Suspended)
            {
                self.enter_election(now_ms, "message from a higher term");
            }
        }

        match message {
            PeerMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                leadership_term_id: _,
                follower_member_id,
            } => self.on_canvass_position(
                log_leadership_term_id,
                log_position,
                follower_member_id,
                now_ms,
            ),
            PeerMessage::RequestVote {
                log_leadership_term_id,
                log_position,
                candidate_term_id,
                candidate_member_id,
            } => {
                if let Some(member) = self.members.find_mut(candidate_member_id) {
                    member.appended_log_position = member.appended_log_position.max(log_position);
                    member.has_canvassed = true;
                    member.canvass_term_id = member.canvass_term_id.max(log_leadership_term_id);
                }
                if let Some(mut election) = self.election.take() {
                    let result = election.on_request_vote(
                        self,
                        log_leadership_term_id,
                        log_position,
                        candidate_term_id,
                        candidate_member_id,
                    );
                    self.election = Some(election);
                    result
                } else {
                    // Stale candidacy for a term we already have.
                    let _ = self.send_peer(
                        candidate_member_id,
                        &PeerMessage::Vote {
                            candidate_term_id,
                            log_leadership_term_id,
                            log_position,
                            candidate_member_id,
                            follower_member_id: self.member_id,
                            vote: false,
                        },
                    )?;
                    Ok(())
                }
            }
            PeerMessage::Vote {
                candidate_term_id,
                candidate_member_id,
                follower_member_id,
                vote,
                ..
            } => {
                if let Some(mut election) = self.election.take() {
                    election.on_vote(
                        self,
                        candidate_term_id,
                        candidate_member_id,
                        follower_member_id,
                        vote,
                    );
                    self.election = Some(election);
                }
                Ok(())
            }
            PeerMessage::NewLeadershipTerm {
                term_base_log_position,
                leadership_term_id,
                log_position,
                leader_member_id,
                ..
            } => {
                if let Some(mut election) = self.election.take() {
                    let result = election.on_new_leadership_term(
                        self,
                        term_base_log_position,
                        leadership_term_id,
                        log_position,
                        leader_member_id,
                        now_ms,
                    );
                    self.election = Some(election);
                    result
                } else {
                    if leadership_term_id == self.leadership_term_id {
                        self.leader_member_id = Some(leader_member_id);
                        self.time_of_last_log_update_ms = now_ms;
                    }
                    Ok(())
                }
            }
            PeerMessage::AppendedPosition {
                log_position,
                follower_member_id,
                ..
            } => self.on_appended_position(log_position, follower_member_id, now_ms),
            PeerMessage::CommitPosition {
                leadership_term_id,
                log_position,
                leader_member_id,
            } => {
                if leadership_term_id == self.leadership_term_id {
                    self.follower_commit_position = self.follower_commit_position.max(log_position);
                    self.leader_member_id = Some(leader_member_id);
                    self.time_of_last_log_update_ms = now_ms;
                    if self.role == Role::Follower {
                        self.counters
                            .commit_position
                            .set(self.follower_commit_position.as_u64() as i64);
                    }
                }
                Ok(())
            }
            PeerMessage::CatchupPosition {
                log_position,
                follower_member_id,
                ..
            } => self.on_catchup_position(log_position, follower_member_id),
            PeerMessage::StopCatchup {
                follower_member_id, ..
            } => {
                let me = self.member_id;
                if let Some(election) = self.election.as_mut() {
                    election.on_stop_catchup(follower_member_id, me);
                }
                Ok(())
            }
            PeerMessage::AddPassiveMember {
                correlation_id,
                member_endpoints,
            } => self.on_add_passive_member(correlation_id, &member_endpoints),
            PeerMessage::ClusterMembersChange {
                correlation_id,
                leader_member_id,
                active_members,
                passive_members,
            } => {
                if let Some(mut join) = self.dynamic_join.take() {
                    let result = join.on_cluster_members_change(
                        self,
                        correlation_id,
                        leader_member_id,
                        &active_members,
                        &passive_members,
                        now_ms,
                    );
                    self.dynamic_join = Some(join);
                    result
                } else {
                    Ok(())
                }
            }
            PeerMessage::SnapshotRecordingQuery {
                correlation_id,
                requesting_member_id,
            } => {
                if self.role == Role::Leader {
                    let snapshots = self
                        .recording_log
                        .latest_snapshot_group(self.config.service_count);
                    let _ = self.send_peer(
                        requesting_member_id,
                        &PeerMessage::SnapshotRecordings {
                            correlation_id,
                            snapshots,
                        },
                    )?;
                }
                Ok(())
            }
            PeerMessage::SnapshotRecordings {
                correlation_id,
                snapshots,
            } => {
                if let Some(mut join) = self.dynamic_join.take() {
                    let result = join.on_snapshot_recordings(self, correlation_id, &snapshots);
                    self.dynamic_join = Some(join);
                    result
                } else {
                    Ok(())
                }
            }
            PeerMessage::JoinCluster { member_id, .. } => self.on_join_cluster(member_id),
            PeerMessage::TerminationPosition { log_position, .. } => {
                if self.role == Role::Follower {
                    self.termination_position = Some(log_position);
                    if self.termination_deadline_ms.is_none() {
                        self.termination_deadline_ms =
                            Some(now_ms + self.config.timeouts.termination_timeout_ms());
                    }
                }
                Ok(())
            }
            PeerMessage::TerminationAck {
                log_position,
                member_id,
                ..
            } => {
                if self.termination_position == Some(log_position) {
                    if let Some(member) = self.members.find_mut(member_id) {
                        member.has_sent_termination_ack = true;
                    }
                }
                Ok(())
            }
            PeerMessage::RemoveMember {
                member_id,
                is_passive,
            } => self.on_remove_member(member_id, is_passive),
        }
    }

    fn on_canvass_position(
        &mut self,
        log_leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        follower_member_id: MemberId,
        _now_ms: i64,
    ) -> ClusterResult<()> {
        if let Some(member) = self.members.find_mut(follower_member_id) {
            member.appended_log_position = log_position;
            member.has_canvassed = true;
            member.canvass_term_id = log_leadership_term_id;
        }
        // A canvassing member may simply have restarted; the sitting leader
        // points it at the current term.
        if self.role == Role::Leader && self.election.is_none() {
            let log_session_id = self
                .log_publisher
                .as_ref()
                .map_or(0, LogPublisher::session_id);
            let _ = self.send_peer(
                follower_member_id,
                &PeerMessage::NewLeadershipTerm {
                    log_leadership_term_id: self.last_log_term_id(),
                    term_base_log_position: self.term_base_log_position,
                    leadership_term_id: self.leadership_term_id,
                    log_position: self.appended_position(),
                    leader_member_id: self.member_id,
                    log_session_id,
                    timestamp_ms: self.cluster_time_ms,
                },
            )?;
        }
        Ok(())
    }

    fn on_appended_position(
        &mut self,
        log_position: LogPosition,
        follower_member_id: MemberId,
        now_ms: i64,
    ) -> ClusterResult<()> {
        self.time_of_last_quorum_activity_ms = now_ms;
        let leader_position = self.appended_position();
        let mut stop_catchup = None;
        if let Some(member) = self.members.find_mut(follower_member_id) {
            member.appended_log_position = member.appended_log_position.max(log_position);
            member.time_of_last_append_ms = now_ms;
            if let Some(replay_id) = member.catchup_replay_id {
                if log_position >= leader_position {
                    member.catchup_replay_id = None;
                    stop_catchup = Some(replay_id);
                }
            }
        }
        if let Some(replay_id) = stop_catchup {
            let _ = self.send_peer(
                follower_member_id,
                &PeerMessage::StopCatchup {
                    leadership_term_id: self.leadership_term_id,
                    follower_member_id,
                },
            )?;
            self.archive.stop_replay(replay_id)?;
            tracing::info!(
                member = %self.member_id,
                follower = %follower_member_id,
                "catch-up complete"
            );
        }
        Ok(())
    }

    fn on_catchup_position(
        &mut self,
        log_position: LogPosition,
        follower_member_id: MemberId,
    ) -> ClusterResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(recording_id) = self.log_recording_id else {
            return Ok(());
        };
        let Some(member) = self.members.find(follower_member_id) else {
            return Ok(());
        };
        if member.catchup_replay_id.is_some() {
            return Ok(());
        }

        let channel = self
            .config
            .channels
            .endpoint_channel(&member.endpoints.log.clone());
        let replay_id = self.archive.start_replay(
            recording_id,
            log_position,
            None,
            &channel,
            self.config.channels.log_stream_id,
        )?;
        if let Some(member) = self.members.find_mut(follower_member_id) {
            member.catchup_replay_id = Some(replay_id);
        }
        tracing::info!(
            member = %self.member_id,
            follower = %follower_member_id,
            from = %log_position,
            "catch-up replay started"
        );
        Ok(())
    }

    fn on_add_passive_member(
        &mut self,
        correlation_id: CorrelationId,
        member_endpoints: &str,
    ) -> ClusterResult<()> {
        if self.role != Role::Leader {
            // Relay so a joiner can bootstrap off any listed member.
            if let Some(leader) = self.leader_member_id {
                let _ = self.send_peer(
                    leader,
                    &PeerMessage::AddPassiveMember {
                        correlation_id,
                        member_endpoints: member_endpoints.to_string(),
                    },
                )?;
            }
            return Ok(());
        }

        let endpoints = MemberEndpoints::parse(member_endpoints)?;
        if self
            .members
            .find_by_member_endpoint(&endpoints.member_facing)
            .is_none()
        {
            let id = self.members.next_member_id();
            let mut member = ClusterMember::new(id, endpoints.clone());
            member.correlation_id = Some(correlation_id);
            self.members.add_passive(member)?;
            tracing::info!(member = %self.member_id, joiner = %id, "passive member added");
        }

        let reply = PeerMessage::ClusterMembersChange {
            correlation_id,
            leader_member_id: self.member_id,
            active_members: self.members.encode_active(),
            passive_members: self.members.encode_passive(),
        };
        let _ = self.send_to_endpoint(&endpoints.member_facing, &reply)?;
        Ok(())
    }

    fn on_join_cluster(&mut self, member_id: MemberId) -> ClusterResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let Some(member) = self.members.find(member_id) else {
            return Ok(());
        };
        if member.has_requested_join || self.members.is_active(member_id) {
            return Ok(());
        }

        let joined_members = format!(
            "{}|{},{}",
            self.members.encode_active(),
            member_id,
            member.endpoints.encode()
        );
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let leader = self.member_id;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(());
        };
        let Some(position) = publisher.append_membership_change(
            term,
            leader,
            ChangeType::Join,
            member_id,
            joined_members,
            timestamp,
        )?
        else {
            return Ok(());
        };
        self.on_leader_append(position);
        if let Some(member) = self.members.find_mut(member_id) {
            member.has_requested_join = true;
        }
        self.pending_membership_change = Some((position, ChangeType::Join, member_id));
        tracing::info!(member = %self.member_id, joiner = %member_id, %position, "JOIN appended");
        Ok(())
    }

    fn on_remove_member(&mut self, member_id: MemberId, is_passive: bool) -> ClusterResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        if is_passive {
            self.members.remove(member_id);
            return Ok(());
        }
        if !self.members.is_active(member_id) {
            return Ok(());
        }
        let Some(member) = self.members.find(member_id) else {
            return Ok(());
        };
        if member.has_requested_remove {
            return Ok(());
        }

        let remaining: Vec<String> = self
            .members
            .active()
            .iter()
            .filter(|m| m.id != member_id)
            .map(|m| format!("{},{}", m.id, m.endpoints.encode()))
            .collect();
        let term = self.leadership_term_id;
        let timestamp = self.cluster_time_ms;
        let leader = self.member_id;
        let Some(publisher) = self.log_publisher.as_mut() else {
            return Ok(());
        };
        let Some(position) = publisher.append_membership_change(
            term,
            leader,
            ChangeType::Quit,
            member_id,
            remaining.join("|"),
            timestamp,
        )?
        else {
            return Ok(());
        };
        self.on_leader_append(position);
        if let Some(member) = self.members.find_mut(member_id) {
            member.has_requested_remove = true;
            member.removal_position = Some(position);
        }
        self.pending_membership_change = Some((position, ChangeType::Quit, member_id));
        tracing::info!(member = %self.member_id, removed = %member_id, %position, "QUIT appended");
        Ok(())
    }

    /// Applies a leader-appended membership change once it commits.
    fn apply_pending_membership_change(&mut self) -> ClusterResult<()> {
        let Some((position, change_type, member_id)) = self.pending_membership_change else {
            return Ok(());
        };
        if self.commit_for_me() < position {
            return Ok(());
        }
        self.pending_membership_change = None;
        match change_type {
            ChangeType::Join => {
                if !self.members.is_active(member_id) {
                    self.members.promote(member_id)?;
                }
                tracing::info!(member = %self.member_id, joiner = %member_id, "JOIN committed");
            }
            ChangeType::Quit => {
                if member_id == self.member_id {
                    // A leader that removed itself leaves like any other
                    // member; the rest of the cluster re-elects.
                    let _ = self.service_proxy.termination_position(position)?;
                    self.termination_position = Some(position);
                    self.termination_deadline_ms = Some(
                        self.cached_time_ms + self.config.timeouts.termination_timeout_ms(),
                    );
                    self.termination_notified = true;
                    self.ack_barrier = Some(AckBarrier::new(
                        AckPurpose::Termination,
                        position,
                        self.service_ack_id,
                        self.config.service_count,
                    ));
                    self.set_state(ModuleState::Leaving);
                }
                self.members.remove(member_id);
                tracing::info!(member = %self.member_id, removed = %member_id, "QUIT committed");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Service Control
    // ========================================================================

    fn poll_service_control(&mut self, now_ms: i64) -> ClusterResult<usize> {
        let messages = self.service_adapter.poll(self.config.message_limit)?;
        let work = messages.len();
        for message in messages {
            self.on_service_message(message, now_ms)?;
        }
        Ok(work)
    }

    fn on_service_message(
        &mut self,
        message: FromServiceMessage,
        now_ms: i64,
    ) -> ClusterResult<()> {
        match message {
            FromServiceMessage::ServiceAck {
                log_position,
                ack_id,
                relevant_id,
                service_id,
                ..
            } => {
                let Some(barrier) = self.ack_barrier.as_mut() else {
                    return Ok(());
                };
                barrier.on_ack(service_id, log_position, ack_id, relevant_id)?;
                if barrier.is_complete() {
                    let barrier = self.ack_barrier.take().expect("checked above");
                    self.service_ack_id += 1;
                    self.on_ack_barrier_complete(barrier, now_ms)?;
                }
                Ok(())
            }
            FromServiceMessage::ServiceMessage { payload, .. } => {
                self.pending_ring.append(payload);
                Ok(())
            }
            FromServiceMessage::CloseSession { cluster_session_id } => {
                if self.role == Role::Leader {
                    self.pending_session_closes
                        .push_back((cluster_session_id, CloseReason::ServiceAction));
                }
                Ok(())
            }
            FromServiceMessage::ScheduleTimer {
                correlation_id,
                deadline_ms,
            } => {
                self.timers.schedule(correlation_id, deadline_ms);
                Ok(())
            }
            FromServiceMessage::CancelTimer { correlation_id } => {
                self.timers.cancel(correlation_id);
                Ok(())
            }
            FromServiceMessage::ClusterMembersQuery { correlation_id } => {
                let leader = self.leader_member_id.unwrap_or(self.member_id);
                let active = self.members.encode_active();
                let passive = self.members.encode_passive();
                let _ = self
                    .service_proxy
                    .cluster_members_response(correlation_id, leader, active, passive)?;
                Ok(())
            }
        }
    }

    fn on_ack_barrier_complete(&mut self, barrier: AckBarrier, now_ms: i64) -> ClusterResult<()> {
        match barrier.purpose {
            AckPurpose::Startup => {
                self.recovery_deadline_ms = None;
                tracing::info!(member = %self.member_id, "services acknowledged restart position");
                if self.config.is_dynamic_join() {
                    self.dynamic_join = Some(DynamicJoin::new(self, now_ms));
                } else {
                    self.election = Some(Election::new(self, true, now_ms));
                }
                Ok(())
            }
            AckPurpose::Snapshot => self.finish_snapshot(&barrier, now_ms),
            AckPurpose::Termination => {
                self.termination_services_acked = true;
                Ok(())
            }
        }
    }

    // ========================================================================
    // Log Record Dispatch
    // ========================================================================

    /// Applies one replicated log record on the replay path.
    pub(crate) fn on_log_record(
        &mut self,
        position: LogPosition,
        record: LogRecord,
        now_ms: i64,
    ) -> ClusterResult<()> {
        // Record timestamps are the authoritative cluster time here.
        self.cluster_time_ms = self.cluster_time_ms.max(record.timestamp_ms());
        self.time_of_last_log_update_ms = now_ms;
        self.delivered_position = self.delivered_position.max(position);

        match record {
            LogRecord::SessionOpen {
                cluster_session_id,
                correlation_id,
                timestamp_ms,
                response_stream_id,
                response_channel,
                ..
            } => {
                let mut session = crate::sessions::ClusterSession::new(
                    cluster_session_id,
                    correlation_id,
                    response_stream_id,
                    response_channel,
                    timestamp_ms,
                );
                session.opened_log_position = position;
                session.transition(SessionState::Open);
                self.sessions.restore_open(session);
                let next = self
                    .sessions
                    .next_session_id()
                    .max(cluster_session_id.as_i64() + 1);
                self.sessions.set_next_session_id(next);
            }
            LogRecord::SessionClose {
                cluster_session_id,
                close_reason,
                ..
            } => {
                self.sessions.close_open(cluster_session_id, close_reason);
            }
            LogRecord::SessionMessage {
                cluster_session_id,
                timestamp_ms,
                ..
            } => {
                if cluster_session_id.is_service_session() {
                    self.pending_ring.sweep(cluster_session_id);
                } else if let Some(session) = self.sessions.find_open_mut(cluster_session_id) {
                    session.time_of_last_activity_ms = timestamp_ms;
                }
            }
            LogRecord::TimerEvent { correlation_id, .. } => {
                self.timers.on_fire_replayed(correlation_id);
            }
            LogRecord::ClusterAction { action, .. } => {
                self.on_cluster_action(action, position)?;
            }
            LogRecord::NewLeadershipTermEvent {
                leadership_term_id,
                term_base_log_position,
                leader_member_id,
                ..
            } => {
                self.leadership_term_id = self.leadership_term_id.max(leadership_term_id);
                self.term_base_log_position = term_base_log_position;
                self.leader_member_id = Some(leader_member_id);
            }
            LogRecord::MembershipChange {
                change_type,
                member_id,
                members,
                ..
            } => {
                self.on_replayed_membership_change(change_type, member_id, &members, position)?;
            }
        }
        Ok(())
    }

    fn on_cluster_action(&mut self, action: ClusterAction, position: LogPosition) -> ClusterResult<()> {
        match action {
            ClusterAction::Suspend => {
                if self.state == ModuleState::Active {
                    self.set_state(ModuleState::Suspended);
                } else if self.state == ModuleState::Init {
                    self.suspend_on_start = true;
                }
            }
            ClusterAction::Resume => {
                if self.state == ModuleState::Suspended {
                    self.set_state(ModuleState::Active);
                }
                self.suspend_on_start = false;
            }
            ClusterAction::Snapshot => {
                self.pending_snapshot_position = Some(position);
            }
        }
        Ok(())
    }

    fn on_replayed_membership_change(
        &mut self,
        change_type: ChangeType,
        member_id: MemberId,
        members: &str,
        position: LogPosition,
    ) -> ClusterResult<()> {
        match change_type {
            ChangeType::Join => {
                if self.members.is_active(member_id) {
                    return Ok(());
                }
                if self.members.find(member_id).is_some() {
                    self.members.promote(member_id)?;
                    return Ok(());
                }
                // Unknown joiner: adopt its entry from the carried list.
                let parsed = MemberRegistry::parse(members)?;
                if let Some(member) = parsed.find(member_id) {
                    self.members
                        .add_active(ClusterMember::new(member.id, member.endpoints.clone()))?;
                }
            }
            ChangeType::Quit => {
                if member_id == self.member_id {
                    tracing::info!(member = %self.member_id, "own QUIT observed, leaving");
                    self.termination_position = Some(position);
                    self.termination_deadline_ms = Some(
                        self.cached_time_ms + self.config.timeouts.termination_timeout_ms(),
                    );
                    let _ = self.service_proxy.termination_position(position)?;
                    self.termination_notified = true;
                    self.ack_barrier = Some(AckBarrier::new(
                        AckPurpose::Termination,
                        position,
                        self.service_ack_id,
                        self.config.service_count,
                    ));
                    self.set_state(ModuleState::Leaving);
                } else {
                    self.members.remove(member_id);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    fn commit_for_me(&self) -> LogPosition {
        if self.role == Role::Leader {
            self.commit_position
        } else {
            self.follower_commit_position
        }
    }

    /// Takes the module snapshot once the committed SNAPSHOT action is
    /// reached; services snapshot in parallel and ack with their recording
    /// ids.
    fn check_pending_snapshot(&mut self, now_ms: i64) -> ClusterResult<()> {
        let Some(position) = self.pending_snapshot_position else {
            return Ok(());
        };
        if !matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
            return Ok(());
        }
        if self.commit_for_me() < position {
            return Ok(());
        }
        self.pending_snapshot_position = None;
        let resume_state = self.state;
        self.set_state(ModuleState::Snapshot);

        let module_snapshot = self.capture_module_snapshot(position);
        let channel = self.snapshot_write_channel();
        let stream_id = self.config.channels.snapshot_stream_id;
        match snapshot::write_module_snapshot(
            self.media.as_mut(),
            self.archive.as_mut(),
            &channel,
            stream_id,
            &module_snapshot,
        ) {
            Ok(recording_id) => {
                self.module_snapshot_recording_id = Some(recording_id);
                self.ack_barrier = Some(AckBarrier::new(
                    AckPurpose::Snapshot,
                    position,
                    self.service_ack_id,
                    self.config.service_count,
                ));
                let _ = now_ms;
                Ok(())
            }
            Err(error) => {
                // An abandoned snapshot attempt is counted, not fatal.
                tracing::warn!(member = %self.member_id, %error, "snapshot attempt abandoned");
                self.counters.error_count.increment();
                self.set_state(resume_state);
                Ok(())
            }
        }
    }

    fn capture_module_snapshot(&self, position: LogPosition) -> ModuleSnapshot {
        ModuleSnapshot {
            leadership_term_id: self.leadership_term_id,
            log_position: position,
            term_base_log_position: self.term_base_log_position,
            timestamp_ms: self.cluster_time_ms,
            next_session_id: self.sessions.next_session_id(),
            next_service_session_id: self.pending_ring.next_service_session_id(),
            log_service_session_id: self.pending_ring.log_service_session_id(),
            pending_message_capacity: self.pending_ring.capacity(),
            sessions: self.sessions.open_sessions().to_vec(),
            timers: self.timers.entries().collect(),
            pending_messages: self.pending_ring.entries().cloned().collect(),
            members: Some((
                self.members.high_member_id(),
                self.members.encode_active(),
                self.members.encode_passive(),
            )),
        }
    }

    fn finish_snapshot(&mut self, barrier: &AckBarrier, now_ms: i64) -> ClusterResult<()> {
        let position = barrier.position;
        let module_recording_id = self
            .module_snapshot_recording_id
            .take()
            .unwrap_or(RecordingId::NONE);

        let base = SnapshotMarkerSummary {
            leadership_term_id: self.leadership_term_id,
            term_base_log_position: self.term_base_log_position,
            log_position: position,
            timestamp_ms: self.cluster_time_ms,
            service_id: ServiceId::CONSENSUS_MODULE,
            recording_id: module_recording_id,
        };
        for (index, relevant_id) in barrier.relevant_ids.iter().enumerate() {
            self.recording_log.append_snapshot(SnapshotMarkerSummary {
                service_id: ServiceId::new(index as i32),
                recording_id: RecordingId::new(relevant_id.unwrap_or(-1)),
                ..base
            });
        }
        self.recording_log.append_snapshot(base);
        self.counters.snapshot_count.increment();
        tracing::info!(member = %self.member_id, %position, "snapshot complete");

        if self.pending_shutdown {
            self.pending_shutdown = false;
            self.initiate_termination(position, now_ms)
        } else {
            self.set_state(ModuleState::Active);
            Ok(())
        }
    }

    // ========================================================================
    // Termination
    // ========================================================================

    fn initiate_termination(&mut self, position: LogPosition, now_ms: i64) -> ClusterResult<()> {
        self.termination_position = Some(position);
        self.termination_deadline_ms =
            Some(now_ms + self.config.timeouts.termination_timeout_ms());
        if self.role == Role::Leader {
            self.broadcast_peer(&PeerMessage::TerminationPosition {
                leadership_term_id: self.leadership_term_id,
                log_position: position,
            })?;
        }
        let _ = self.service_proxy.termination_position(position)?;
        self.termination_notified = true;
        self.ack_barrier = Some(AckBarrier::new(
            AckPurpose::Termination,
            position,
            self.service_ack_id,
            self.config.service_count,
        ));
        self.set_state(ModuleState::Terminating);
        tracing::info!(member = %self.member_id, %position, "terminating");
        Ok(())
    }

    /// A follower acknowledges and begins terminating once it has consumed
    /// the log up to the announced position.
    fn check_termination_reached(&mut self, now_ms: i64) -> ClusterResult<()> {
        let Some(position) = self.termination_position else {
            return Ok(());
        };
        if matches!(self.state, ModuleState::Active | ModuleState::Suspended)
            && self.role == Role::Follower
            && !self.termination_notified
            && self.delivered_position() >= position
        {
            if let Some(leader) = self.leader_member_id {
                let _ = self.send_peer(
                    leader,
                    &PeerMessage::TerminationAck {
                        leadership_term_id: self.leadership_term_id,
                        log_position: position,
                        member_id: self.member_id,
                    },
                )?;
            }
            self.initiate_termination(position, now_ms)?;
        }
        Ok(())
    }

    fn check_termination_progress(&mut self, now_ms: i64) -> ClusterResult<()> {
        let Some(deadline) = self.termination_deadline_ms else {
            return Ok(());
        };
        let expired = now_ms >= deadline;
        let done = match self.role {
            Role::Leader => {
                let followers_acked = self
                    .members
                    .active()
                    .iter()
                    .all(|m| m.id == self.member_id || m.has_sent_termination_ack);
                (followers_acked && self.termination_services_acked) || expired
            }
            Role::Follower => self.termination_services_acked || expired,
        };
        if done {
            self.close();
        }
        Ok(())
    }

    // ========================================================================
    // Election & Dynamic Join Support
    // ========================================================================

    pub(crate) fn enter_election(&mut self, now_ms: i64, reason: &str) {
        if self.election.is_some() || self.dynamic_join.is_some() {
            return;
        }
        if !matches!(self.state, ModuleState::Active | ModuleState::Suspended) {
            return;
        }
        tracing::info!(member = %self.member_id, reason, "entering election");
        self.election = Some(Election::new(self, false, now_ms));
    }

    fn on_election_complete(&mut self, now_ms: i64) {
        if self.state == ModuleState::Init {
            let next = if self.suspend_on_start {
                ModuleState::Suspended
            } else {
                ModuleState::Active
            };
            self.set_state(next);
        }
        self.time_of_last_log_update_ms = now_ms;
        self.time_of_last_quorum_activity_ms = now_ms;
        self.counters
            .leadership_term_id
            .set(self.leadership_term_id.as_i64());
        tracing::info!(
            member = %self.member_id,
            term = %self.leadership_term_id,
            role = ?self.role,
            "election complete"
        );
    }

    fn on_dynamic_join_complete(
        &mut self,
        join: &DynamicJoin,
        now_ms: i64,
    ) -> ClusterResult<()> {
        let (term, _) = join.restored_position();
        if self.members.find(self.member_id).is_some() && !self.members.is_active(self.member_id) {
            self.members.promote(self.member_id)?;
        }
        self.leadership_term_id = self.leadership_term_id.max(term);
        tracing::info!(member = %self.member_id, "dynamic join complete, entering election");
        self.election = Some(Election::new(self, false, now_ms));
        Ok(())
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        if self.role != role {
            tracing::info!(member = %self.member_id, ?role, "role changed");
        }
        self.role = role;
        self.counters
            .is_leader
            .set(i64::from(role == Role::Leader));
        let leader = self.leader_member_id;
        for member in self.members.active_mut() {
            member.is_leader = Some(member.id) == leader;
        }
        self.counters
            .leadership_term_id
            .set(self.leadership_term_id.as_i64());
        if role == Role::Leader {
            self.time_of_last_quorum_activity_ms = self.cached_time_ms;
        } else {
            self.time_of_last_log_update_ms = self.cached_time_ms;
        }
    }

    fn set_state(&mut self, state: ModuleState) {
        if self.state != state {
            tracing::info!(member = %self.member_id, from = ?self.state, to = ?state, "module state");
            self.state = state;
            self.counters.module_state.set(state.code());
        }
    }

    pub(crate) fn broadcast_peer(&mut self, message: &PeerMessage) -> ClusterResult<()> {
        let endpoints: Vec<String> = self
            .members
            .active()
            .iter()
            .filter(|m| m.id != self.member_id)
            .map(|m| m.endpoints.member_facing.clone())
            .collect();
        for endpoint in endpoints {
            let _ = self.send_to_endpoint(&endpoint, message)?;
        }
        Ok(())
    }

    pub(crate) fn send_peer(
        &mut self,
        member_id: MemberId,
        message: &PeerMessage,
    ) -> ClusterResult<bool> {
        let Some(endpoint) = self
            .members
            .find(member_id)
            .map(|m| m.endpoints.member_facing.clone())
        else {
            return Ok(false);
        };
        self.send_to_endpoint(&endpoint, message)
    }

    pub(crate) fn send_to_endpoint(
        &mut self,
        endpoint: &str,
        message: &PeerMessage,
    ) -> ClusterResult<bool> {
        if !self.peer_publications.contains_key(endpoint) {
            let channel = self.config.channels.endpoint_channel(endpoint);
            let publication = self
                .media
                .add_publication(&channel, self.config.channels.member_status_stream_id)?;
            self.peer_publications
                .insert(endpoint.to_string(), publication);
        }
        let publication = self
            .peer_publications
            .get_mut(endpoint)
            .expect("inserted above");
        let bytes = tektite_wire::encode(message)?;
        Ok(publication.offer(&bytes).is_granted())
    }

    /// Creates the leader's log publication resuming at `base`, and makes
    /// sure the log is being recorded.
    pub(crate) fn create_log_publisher(&mut self, base: LogPosition) -> ClusterResult<()> {
        if self.log_publisher.is_none() {
            let mut uri = ChannelUri::parse(&self.config.channels.log_channel)
                .map_err(TransportError::InvalidChannel)?;
            uri.put(TERM_OFFSET_PARAM, base.as_u64());
            let publication = self
                .media
                .add_exclusive_publication(&uri.to_string(), self.config.channels.log_stream_id)?;
            self.log_publisher = Some(LogPublisher::new(publication));
        }
        self.ensure_log_recording()?;
        Ok(())
    }

    pub(crate) fn close_log_publisher(&mut self) {
        if let Some(mut publisher) = self.log_publisher.take() {
            publisher.close();
        }
    }

    pub(crate) fn ensure_log_recording(&mut self) -> ClusterResult<RecordingId> {
        let channel = self.config.channels.log_channel.clone();
        let stream_id = self.config.channels.log_stream_id;
        if let Some(recording_id) = self.log_recording_id {
            let extent = self.archive.list_recording(recording_id)?;
            if extent.stop_position.is_some() {
                self.archive.extend_recording(recording_id, &channel, stream_id)?;
            }
            return Ok(recording_id);
        }
        let recording_id = self.archive.start_recording(&channel, stream_id)?;
        self.log_recording_id = Some(recording_id);
        Ok(recording_id)
    }

    pub(crate) fn ensure_log_adapter(&mut self) -> ClusterResult<()> {
        if self.log_adapter.is_none() {
            let subscription = self.media.add_subscription(
                &self.config.channels.log_channel,
                self.config.channels.log_stream_id,
            )?;
            self.log_adapter = Some(LogAdapter::new(subscription, self.delivered_position()));
        }
        Ok(())
    }

    /// Attaches the catch-up replay leg on this member's log endpoint.
    pub(crate) fn begin_catchup_replay_leg(&mut self) -> ClusterResult<()> {
        self.ensure_log_adapter()?;
        let adapter = self.log_adapter.as_mut().expect("ensured above");
        if adapter.is_replaying() {
            return Ok(());
        }
        let channel = self
            .config
            .channels
            .endpoint_channel(&self.own_endpoints.log);
        let subscription = self
            .media
            .add_subscription(&channel, self.config.channels.log_stream_id)?;
        self.log_adapter
            .as_mut()
            .expect("ensured above")
            .begin_replay(subscription, -1);
        Ok(())
    }

    pub(crate) fn end_catchup_replay_leg(&mut self) -> ClusterResult<()> {
        if let Some(adapter) = self.log_adapter.as_mut() {
            if let Some(replay_id) = adapter.end_replay() {
                if replay_id >= 0 {
                    self.archive.stop_replay(replay_id)?;
                }
            }
        }
        Ok(())
    }

    /// Replays the recovered tail of the log through this member's own log
    /// endpoint, merged ahead of the live stream.
    pub(crate) fn start_recovery_replay(&mut self) -> ClusterResult<()> {
        let Some(range) = self.recovery_plan.log.clone() else {
            return Ok(());
        };
        self.ensure_log_adapter()?;
        let channel = self
            .config
            .channels
            .endpoint_channel(&self.own_endpoints.log);
        let length = range.stop_position.as_u64() - range.start_position.as_u64();
        let subscription = self
            .media
            .add_subscription(&channel, self.config.channels.log_stream_id)?;
        let replay_id = self.archive.start_replay(
            range.recording_id,
            range.start_position,
            Some(length),
            &channel,
            self.config.channels.log_stream_id,
        )?;
        self.log_adapter
            .as_mut()
            .expect("ensured above")
            .begin_replay(subscription, replay_id);
        tracing::info!(
            member = %self.member_id,
            from = %range.start_position,
            to = %range.stop_position,
            "recovery replay started"
        );
        Ok(())
    }

    pub(crate) fn finish_recovery_replay(&mut self) -> ClusterResult<()> {
        self.end_catchup_replay_leg()?;
        self.recovery_plan.log = None;
        Ok(())
    }

    /// Tells the hosted services to (re-)join the log; retried under
    /// back-pressure until delivered.
    pub(crate) fn join_services(&mut self, is_startup: bool) -> ClusterResult<()> {
        self.pending_join_log = Some(JoinLogParams {
            leadership_term_id: self.leadership_term_id,
            log_position: self.delivered_position(),
            log_session_id: self
                .log_publisher
                .as_ref()
                .map_or(0, LogPublisher::session_id),
            is_startup,
            role_is_leader: self.role == Role::Leader,
        });
        self.retry_pending_join_log()?;
        Ok(())
    }

    fn retry_pending_join_log(&mut self) -> ClusterResult<usize> {
        let Some(params) = self.pending_join_log.clone() else {
            return Ok(0);
        };
        let log_channel = self.config.channels.log_channel.clone();
        let sent = self.service_proxy.join_log(
            params.leadership_term_id,
            params.log_position,
            LogPosition::new(u64::MAX),
            self.member_id,
            params.log_session_id,
            self.config.channels.log_stream_id,
            params.is_startup,
            params.role_is_leader,
            &log_channel,
        )?;
        if sent {
            self.pending_join_log = None;
            return Ok(1);
        }
        Ok(0)
    }

    // ========================================================================
    // Dynamic Join Support
    // ========================================================================

    pub(crate) fn adopt_membership(
        &mut self,
        registry: MemberRegistry,
        own_id: MemberId,
    ) -> ClusterResult<()> {
        self.members = registry;
        self.member_id = own_id;
        Ok(())
    }

    pub(crate) fn snapshot_replicate_channel(&self, index: usize) -> String {
        self.config
            .channels
            .endpoint_channel(&format!("{}-replicate-{index}", self.own_endpoints.transfer))
    }

    pub(crate) fn snapshot_load_channel(&self) -> String {
        self.config
            .channels
            .endpoint_channel(&format!("{}-load", self.own_endpoints.transfer))
    }

    fn snapshot_write_channel(&self) -> String {
        let count = self.counters.snapshot_count.get();
        self.config
            .channels
            .endpoint_channel(&format!("{}-snapshot-{count}", self.own_endpoints.transfer))
    }

    /// Restores module state from a loaded snapshot.
    pub(crate) fn install_module_snapshot(
        &mut self,
        snapshot: ModuleSnapshot,
        restore_members: bool,
    ) -> ClusterResult<()> {
        self.sessions.set_next_session_id(snapshot.next_session_id);
        for session in snapshot.sessions {
            self.sessions.restore_open(session);
        }

        self.timers = TimerService::new();
        for (correlation_id, deadline_ms) in snapshot.timers {
            self.timers.schedule(correlation_id, deadline_ms);
        }

        let capacity = snapshot
            .pending_message_capacity
            .max(self.config.pending_message_capacity);
        self.pending_ring.reset(capacity);
        self.pending_ring.restore_ids(
            snapshot.next_service_session_id,
            snapshot.log_service_session_id,
        );
        for message in snapshot.pending_messages {
            self.pending_ring.restore(message);
        }

        if restore_members {
            if let Some((high_member_id, _, _)) = &snapshot.members {
                self.members.set_high_member_id(*high_member_id);
            }
        }

        self.cluster_time_ms = self.cluster_time_ms.max(snapshot.timestamp_ms);
        self.delivered_position = self.delivered_position.max(snapshot.log_position);
        self.restored_appended = self.restored_appended.max(snapshot.log_position);
        self.commit_position = self.commit_position.max(snapshot.log_position);
        self.follower_commit_position = self.follower_commit_position.max(snapshot.log_position);
        self.term_base_log_position = snapshot.term_base_log_position;
        tracing::info!(
            member = %self.member_id,
            position = %snapshot.log_position,
            sessions = self.sessions.open_sessions().len(),
            timers = self.timers.len(),
            "module snapshot restored"
        );
        Ok(())
    }

    // ========================================================================
    // Errors & Close
    // ========================================================================

    fn on_error(&mut self, error: &ClusterError) {
        self.counters.error_count.increment();
        tracing::error!(member = %self.member_id, %error, "consensus module error");
        if error.is_fatal() {
            self.close();
        }
    }

    fn close(&mut self) {
        if self.state == ModuleState::Closed {
            return;
        }
        self.close_log_publisher();
        if let Some(adapter) = self.log_adapter.as_mut() {
            adapter.close();
        }
        self.ingress_adapter.close();
        self.egress.close();
        self.peer_subscription.close();
        for publication in self.peer_publications.values_mut() {
            publication.close();
        }
        self.service_proxy.close();
        self.service_adapter.close();
        self.set_state(ModuleState::Closed);
        tracing::info!(member = %self.member_id, "consensus module closed");
    }
}
