//! Leader election.
//!
//! The election sub-machine produces agreement on
//! `(leadership_term_id, log_position, leader_id)`:
//!
//! 1. Every member canvasses its `(last log term, appended position)`.
//! 2. The member with the highest `(position, term)` nominates itself for
//!    `leadership_term_id + 1`; ties go to the lower member id so progress
//!    is deterministic. Voters say yes iff the candidate's position is at
//!    least their own and they have not voted for another candidate in that
//!    term.
//! 3. A strict quorum of yes votes makes the candidate leader: it records
//!    the fresh term, broadcasts `NewLeadershipTerm`, and appends the term
//!    event at the new base position.
//! 4. Followers behind the leader's position catch up through an
//!    archive replay the leader aims at their log endpoint, merged ahead of
//!    the live subscription, until the leader tells them to stop.
//!
//! The election is owned by the agent but borrows it only for the duration
//! of a tick: the agent takes the sub-machine out, calls
//! [`Election::do_work`], and puts it back unless it completed.
//!
//! The overall election has a timeout budget; expiry restarts it from the
//! canvass so a partitioned round cannot wedge the member.

use tektite_types::{LeadershipTermId, LogPosition, MemberId};
use tektite_wire::PeerMessage;

use crate::agent::{ConsensusAgent, Role};
use crate::error::ClusterResult;

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElectionState {
    Init,
    Canvass,
    Nominate,
    CandidateBallot,
    FollowerBallot,
    LeaderReplay,
    LeaderTransition,
    FollowerCatchupInit,
    FollowerCatchup,
    FollowerTransition,
    Close,
}

// ============================================================================
// Election
// ============================================================================

pub(crate) struct Election {
    state: ElectionState,
    /// True for the election run as part of startup recovery.
    is_startup: bool,

    /// Our appended position at entry (advanced by recovery replay).
    log_position: LogPosition,
    /// Term of the last entry in our log.
    last_log_term_id: LeadershipTermId,

    candidate_term_id: LeadershipTermId,
    leader_member_id: Option<MemberId>,
    /// The winning leader's appended position: the catch-up target.
    leader_log_position: LogPosition,
    term_base_log_position: LogPosition,

    /// Who we voted for, per candidate term, so a vote is never recast.
    voted_for: Option<(LeadershipTermId, MemberId)>,

    stop_catchup_received: bool,
    replay_started: bool,
    /// The term base is fixed on first entry to the leader transition so a
    /// back-pressure retry does not move it past the term event.
    term_base_captured: bool,

    time_of_last_canvass_ms: i64,
    deadline_ms: i64,
}

impl Election {
    pub(crate) fn new(agent: &ConsensusAgent, is_startup: bool, now_ms: i64) -> Self {
        Self {
            state: ElectionState::Init,
            is_startup,
            log_position: agent.appended_position(),
            last_log_term_id: agent.last_log_term_id(),
            candidate_term_id: LeadershipTermId::NONE,
            leader_member_id: None,
            leader_log_position: LogPosition::ZERO,
            term_base_log_position: LogPosition::ZERO,
            voted_for: None,
            stop_catchup_received: false,
            replay_started: false,
            term_base_captured: false,
            time_of_last_canvass_ms: 0,
            deadline_ms: now_ms + agent.config.timeouts.election_timeout_ms(),
        }
    }

    pub(crate) fn state_name(&self) -> &'static str {
        match self.state {
            ElectionState::Init => "Init",
            ElectionState::Canvass => "Canvass",
            ElectionState::Nominate => "Nominate",
            ElectionState::CandidateBallot => "CandidateBallot",
            ElectionState::FollowerBallot => "FollowerBallot",
            ElectionState::LeaderReplay => "LeaderReplay",
            ElectionState::FollowerCatchupInit => "FollowerCatchupInit",
            ElectionState::FollowerCatchup => "FollowerCatchup",
            ElectionState::LeaderTransition => "LeaderTransition",
            ElectionState::FollowerTransition => "FollowerTransition",
            ElectionState::Close => "Close",
        }
    }

    fn transition(&mut self, agent: &ConsensusAgent, to: ElectionState, now_ms: i64) {
        tracing::debug!(
            member = %agent.member_id,
            from = self.state_name(),
            term = %self.candidate_term_id,
            at_ms = now_ms,
            "election -> {to:?}"
        );
        self.state = to;
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advances the election one bounded step; true when complete.
    pub(crate) fn do_work(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<bool> {
        // Overall budget: restart from canvass rather than wedge.
        if now_ms >= self.deadline_ms && !matches!(self.state, ElectionState::Close) {
            tracing::warn!(
                member = %agent.member_id,
                state = self.state_name(),
                "election timed out, restarting from canvass"
            );
            self.restart(agent, now_ms);
        }

        match self.state {
            ElectionState::Init => self.on_init(agent, now_ms),
            ElectionState::Canvass => self.on_canvass_tick(agent, now_ms),
            ElectionState::Nominate => self.on_nominate(agent, now_ms),
            ElectionState::CandidateBallot => self.on_candidate_ballot(agent, now_ms),
            ElectionState::FollowerBallot => Ok(0),
            ElectionState::LeaderReplay => self.on_leader_replay(agent, now_ms),
            ElectionState::LeaderTransition => self.on_leader_transition(agent, now_ms),
            ElectionState::FollowerCatchupInit => self.on_follower_catchup_init(agent, now_ms),
            ElectionState::FollowerCatchup => self.on_follower_catchup(agent, now_ms),
            ElectionState::FollowerTransition => self.on_follower_transition(agent, now_ms),
            ElectionState::Close => return Ok(true),
        }?;
        Ok(self.state == ElectionState::Close)
    }

    fn restart(&mut self, agent: &mut ConsensusAgent, now_ms: i64) {
        agent.members.reset_votes();
        self.voted_for = None;
        self.candidate_term_id = LeadershipTermId::NONE;
        self.leader_member_id = None;
        self.time_of_last_canvass_ms = 0;
        self.deadline_ms = now_ms + agent.config.timeouts.election_timeout_ms();
        self.transition(agent, ElectionState::Canvass, now_ms);
    }

    fn canvass_interval_ms(agent: &ConsensusAgent) -> i64 {
        (agent.config.timeouts.election_timeout_ms() / 4).max(1)
    }

    fn on_init(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<usize> {
        agent.members.reset_votes();
        // Best effort: services pause delivery expectations during election.
        let _ = agent.service_proxy.election_start(self.log_position)?;

        if agent.members.active_count() == 1 {
            // Single-member cluster: the ballot is a formality.
            self.candidate_term_id = self.next_candidate_term(agent);
            self.transition(agent, ElectionState::LeaderReplay, now_ms);
            return Ok(1);
        }
        self.transition(agent, ElectionState::Canvass, now_ms);
        Ok(1)
    }

    fn on_canvass_tick(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<usize> {
        let mut work = 0;
        if now_ms >= self.time_of_last_canvass_ms + Self::canvass_interval_ms(agent) {
            self.time_of_last_canvass_ms = now_ms;
            agent.broadcast_peer(&PeerMessage::CanvassPosition {
                log_leadership_term_id: self.last_log_term_id,
                log_position: self.log_position,
                leadership_term_id: agent.leadership_term_id,
                follower_member_id: agent.member_id,
            })?;
            work += 1;
        }

        // Count ourselves plus every member whose canvass we have seen.
        let known = 1 + agent
            .members
            .active()
            .iter()
            .filter(|m| m.id != agent.member_id && m.has_canvassed)
            .count();
        if known >= agent.members.quorum_size() {
            if self.nominee(agent) == agent.member_id {
                self.transition(agent, ElectionState::Nominate, now_ms);
            } else {
                self.transition(agent, ElectionState::FollowerBallot, now_ms);
            }
            work += 1;
        }
        Ok(work)
    }

    /// The member every canvasser should expect to nominate itself.
    ///
    /// Highest appended position wins, then highest log term, then the
    /// lower member id for deterministic progress. During startup an
    /// appointed leader whose log is complete is preferred.
    fn nominee(&self, agent: &ConsensusAgent) -> MemberId {
        let mut best = (self.log_position, self.last_log_term_id, agent.member_id);
        for member in agent.members.active() {
            if member.id == agent.member_id || !member.has_canvassed {
                continue;
            }
            let entry = (
                member.appended_log_position,
                member.canvass_term_id,
                member.id,
            );
            if entry.0 > best.0
                || (entry.0 == best.0 && entry.1 > best.1)
                || (entry.0 == best.0 && entry.1 == best.1 && entry.2 < best.2)
            {
                best = entry;
            }
        }

        if self.is_startup {
            if let Some(appointed) = agent.config.appointed_leader_id.map(MemberId::new) {
                let appointed_position = if appointed == agent.member_id {
                    Some(self.log_position)
                } else {
                    agent
                        .members
                        .find(appointed)
                        .filter(|m| m.has_canvassed)
                        .map(|m| m.appended_log_position)
                };
                if appointed_position.is_some_and(|p| p >= best.0) {
                    return appointed;
                }
            }
        }
        best.2
    }

    fn next_candidate_term(&self, agent: &ConsensusAgent) -> LeadershipTermId {
        let mut highest = agent.leadership_term_id.max(self.last_log_term_id);
        for member in agent.members.active() {
            highest = highest.max(member.canvass_term_id);
        }
        highest.next()
    }

    fn on_nominate(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<usize> {
        self.candidate_term_id = self.next_candidate_term(agent);
        self.voted_for = Some((self.candidate_term_id, agent.member_id));
        if let Some(me) = agent.members.find_mut(agent.member_id) {
            me.vote = Some(true);
        }
        agent.broadcast_peer(&PeerMessage::RequestVote {
            log_leadership_term_id: self.last_log_term_id,
            log_position: self.log_position,
            candidate_term_id: self.candidate_term_id,
            candidate_member_id: agent.member_id,
        })?;
        tracing::info!(
            member = %agent.member_id,
            term = %self.candidate_term_id,
            position = %self.log_position,
            "nominated self as candidate"
        );
        self.transition(agent, ElectionState::CandidateBallot, now_ms);
        Ok(1)
    }

    fn on_candidate_ballot(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<usize> {
        let mut yes_votes = 0;
        let mut no_votes = 0;
        for member in agent.members.active() {
            match member.vote {
                Some(true) => yes_votes += 1,
                Some(false) => no_votes += 1,
                None => {}
            }
        }

        if yes_votes >= agent.members.quorum_size() {
            self.transition(agent, ElectionState::LeaderReplay, now_ms);
            return Ok(1);
        }
        // A no vote alone does not end the ballot; pending voters may still
        // complete the quorum. Restart only once that is out of reach.
        if agent.members.active_count() - no_votes < agent.members.quorum_size() {
            tracing::info!(
                member = %agent.member_id,
                term = %self.candidate_term_id,
                no_votes,
                "ballot cannot reach quorum, restarting from canvass"
            );
            self.restart(agent, now_ms);
            return Ok(1);
        }
        Ok(0)
    }

    // ========================================================================
    // Leader Path
    // ========================================================================

    fn on_leader_replay(&mut self, agent: &mut ConsensusAgent, now_ms: i64) -> ClusterResult<usize> {
        if !self.is_startup || !agent.recovery_plan.has_replay() {
            self.transition(agent, ElectionState::LeaderTransition, now_ms);
            return Ok(1);
        }

        if !self.replay_started {
            agent.start_recovery_replay()?;
            self.replay_started = true;
            return Ok(1);
        }

        let stop_position = agent
            .recovery_plan
            .log
            .as_ref()
            .map_or(LogPosition::ZERO, |log| log.stop_position);
        let work = agent.poll_log_records(now_ms)?;
        if work > 0 {
            self.deadline_ms = now_ms + agent.config.timeouts.election_timeout_ms();
        }
        if agent.delivered_position() >= stop_position {
            agent.finish_recovery_replay()?;
            self.log_position = agent.appended_position();
            self.transition(agent, ElectionState::LeaderTransition, now_ms);
        }
        Ok(work.max(1))
    }

    fn on_leader_transition(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<usize> {
        if !self.term_base_captured {
            self.term_base_log_position = agent.appended_position();
            self.term_base_captured = true;
        }
        let base = self.term_base_log_position;
        let previous_term = agent.leadership_term_id;

        agent.create_log_publisher(base)?;

        // The term event must land at the base position before the term is
        // announced, so followers' catch-up target includes it; stay here
        // under back-pressure.
        let appended = agent
            .log_publisher
            .as_mut()
            .expect("publisher created above")
            .append_new_leadership_term_event(
                self.candidate_term_id,
                base,
                agent.member_id,
                agent.cluster_time_ms,
            )?;
        let Some(position) = appended else {
            return Ok(0);
        };
        agent.on_leader_append(position);

        let recording_id = agent
            .log_recording_id
            .unwrap_or(tektite_types::RecordingId::NONE);
        if self.candidate_term_id > agent.last_log_term_id() {
            if !previous_term.is_none() {
                agent.recording_log.commit_term_position(previous_term, base);
            }
            agent.recording_log.append_term(
                self.candidate_term_id,
                base,
                agent.cluster_time_ms,
                recording_id,
            )?;
        }

        agent.leadership_term_id = self.candidate_term_id;
        agent.leader_member_id = Some(agent.member_id);
        agent.term_base_log_position = base;
        agent.set_role(Role::Leader);
        self.leader_member_id = Some(agent.member_id);

        let log_session_id = agent
            .log_publisher
            .as_ref()
            .map_or(0, crate::log_stream::LogPublisher::session_id);
        agent.broadcast_peer(&PeerMessage::NewLeadershipTerm {
            log_leadership_term_id: self.last_log_term_id,
            term_base_log_position: base,
            leadership_term_id: self.candidate_term_id,
            log_position: agent.appended_position(),
            leader_member_id: agent.member_id,
            log_session_id,
            timestamp_ms: agent.cluster_time_ms,
        })?;

        agent.join_services(self.is_startup)?;
        agent.sessions.mark_new_leader_pending();
        tracing::info!(
            member = %agent.member_id,
            term = %self.candidate_term_id,
            base = %base,
            "leadership term established"
        );
        self.transition(agent, ElectionState::Close, now_ms);
        Ok(1)
    }

    // ========================================================================
    // Follower Path
    // ========================================================================

    fn on_follower_catchup_init(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<usize> {
        let Some(leader) = self.leader_member_id else {
            self.transition(agent, ElectionState::FollowerBallot, now_ms);
            return Ok(0);
        };

        // A recovered-but-unreplayed tail is re-fetched from the leader, so
        // the canvassed appended position collapses to what was applied.
        agent.discard_unreplayed_tail();
        agent.ensure_log_adapter()?;
        agent.begin_catchup_replay_leg()?;
        let sent = agent.send_peer(
            leader,
            &PeerMessage::CatchupPosition {
                leadership_term_id: self.candidate_term_id,
                log_position: agent.delivered_position(),
                follower_member_id: agent.member_id,
            },
        )?;
        if sent {
            self.transition(agent, ElectionState::FollowerCatchup, now_ms);
        }
        Ok(1)
    }

    fn on_follower_catchup(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<usize> {
        let mut work = agent.poll_log_records(now_ms)?;
        if work > 0 {
            // Keep the whole election alive while replay data flows.
            self.deadline_ms = now_ms + agent.config.timeouts.election_timeout_ms();
        }
        work += agent.publish_appended_position(now_ms)?;

        let caught_up = agent.delivered_position() >= self.leader_log_position;
        if caught_up && self.stop_catchup_received {
            agent.end_catchup_replay_leg()?;
            self.transition(agent, ElectionState::FollowerTransition, now_ms);
            work += 1;
        }
        Ok(work)
    }

    fn on_follower_transition(
        &mut self,
        agent: &mut ConsensusAgent,
        now_ms: i64,
    ) -> ClusterResult<usize> {
        let Some(leader) = self.leader_member_id else {
            self.transition(agent, ElectionState::FollowerBallot, now_ms);
            return Ok(0);
        };

        agent.ensure_log_adapter()?;
        agent.close_log_publisher();
        let recording_id = agent.ensure_log_recording()?;

        let previous_term = agent.leadership_term_id;
        if self.candidate_term_id > agent.last_log_term_id() {
            if !previous_term.is_none() {
                agent
                    .recording_log
                    .commit_term_position(previous_term, self.term_base_log_position);
            }
            agent.recording_log.append_term(
                self.candidate_term_id,
                self.term_base_log_position,
                agent.cluster_time_ms,
                recording_id,
            )?;
        }

        agent.leadership_term_id = self.candidate_term_id;
        agent.leader_member_id = Some(leader);
        agent.term_base_log_position = self.term_base_log_position;
        agent.set_role(Role::Follower);
        agent.join_services(self.is_startup)?;

        // Make sure the leader knows where we are without waiting a tick.
        let _ = agent.send_peer(
            leader,
            &PeerMessage::AppendedPosition {
                leadership_term_id: self.candidate_term_id,
                log_position: agent.delivered_position(),
                follower_member_id: agent.member_id,
            },
        )?;

        tracing::info!(
            member = %agent.member_id,
            term = %self.candidate_term_id,
            leader = %leader,
            "following new leadership term"
        );
        self.transition(agent, ElectionState::Close, now_ms);
        Ok(1)
    }

    // ========================================================================
    // Message Handlers
    // ========================================================================

    /// A vote request arrived.
    ///
    /// The registry already records the candidate's canvass data; here the
    /// vote itself is decided. Yes iff the candidate's log reaches at least
    /// ours, the term is new, and we have not voted for someone else in it.
    pub(crate) fn on_request_vote(
        &mut self,
        agent: &mut ConsensusAgent,
        log_leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
    ) -> ClusterResult<()> {
        let already_voted_other = self
            .voted_for
            .is_some_and(|(term, who)| term == candidate_term_id && who != candidate_member_id);
        let vote = candidate_term_id > agent.leadership_term_id
            && !already_voted_other
            && log_position >= self.log_position;

        if vote {
            self.voted_for = Some((candidate_term_id, candidate_member_id));
            self.candidate_term_id = self.candidate_term_id.max(candidate_term_id);
            if !matches!(
                self.state,
                ElectionState::FollowerCatchupInit
                    | ElectionState::FollowerCatchup
                    | ElectionState::FollowerTransition
            ) {
                self.transition(agent, ElectionState::FollowerBallot, agent.cached_time_ms);
            }
        }

        let _ = agent.send_peer(
            candidate_member_id,
            &PeerMessage::Vote {
                candidate_term_id,
                log_leadership_term_id,
                log_position,
                candidate_member_id,
                follower_member_id: agent.member_id,
                vote,
            },
        )?;
        Ok(())
    }

    /// A vote arrived for our candidacy.
    pub(crate) fn on_vote(
        &mut self,
        agent: &mut ConsensusAgent,
        candidate_term_id: LeadershipTermId,
        candidate_member_id: MemberId,
        follower_member_id: MemberId,
        vote: bool,
    ) {
        if self.state != ElectionState::CandidateBallot
            || candidate_term_id != self.candidate_term_id
            || candidate_member_id != agent.member_id
        {
            return;
        }
        if let Some(member) = agent.members.find_mut(follower_member_id) {
            member.vote = Some(vote);
        }
    }

    /// A leader announced a (new or current) term.
    pub(crate) fn on_new_leadership_term(
        &mut self,
        agent: &mut ConsensusAgent,
        term_base_log_position: LogPosition,
        leadership_term_id: LeadershipTermId,
        log_position: LogPosition,
        leader_member_id: MemberId,
        now_ms: i64,
    ) -> ClusterResult<()> {
        if leadership_term_id < self.candidate_term_id || leader_member_id == agent.member_id {
            return Ok(());
        }

        self.candidate_term_id = leadership_term_id;
        self.leader_member_id = Some(leader_member_id);
        self.leader_log_position = log_position;
        self.term_base_log_position = term_base_log_position;
        self.deadline_ms = now_ms + agent.config.timeouts.election_timeout_ms();

        if agent.delivered_position() < log_position {
            self.transition(agent, ElectionState::FollowerCatchupInit, now_ms);
        } else {
            self.transition(agent, ElectionState::FollowerTransition, now_ms);
        }
        Ok(())
    }

    /// The leader says our catch-up replay has delivered everything.
    pub(crate) fn on_stop_catchup(&mut self, follower_member_id: MemberId, me: MemberId) {
        if follower_member_id == me {
            self.stop_catchup_received = true;
        }
    }
}
