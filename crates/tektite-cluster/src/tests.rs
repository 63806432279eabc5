//! Cluster scenario tests.
//!
//! These drive whole clusters in-process: every member's agent, a stub
//! state-machine service per member, and a test client share one
//! [`MemoryHub`] and a virtual millisecond clock advanced by the harness.
//! Each round ticks the hub, the client, then every running member's
//! service and agent.

#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use proptest::prelude::*;
use tektite_types::{
    ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId, RecordingId,
    ServiceId,
};
use tektite_transport::memory::{MemoryArchive, MemoryHub, MemoryMedia};
use tektite_transport::{Archive, Media, Publication, Subscription, ToggleState};
use tektite_wire::{
    EgressEvent, EventCode, FromServiceMessage, IngressFrame, LogRecord, ToServiceMessage,
};

use crate::agent::{ConsensusAgent, ModuleState};
use crate::config::{ClusterConfig, TimeoutConfig};
use crate::counters::ClusterCounters;
use crate::members::MemberRegistry;
use crate::pending_ring::PendingServiceMessageRing;
use crate::recording_log::RecordingLog;
use crate::sessions::AllowAllAuthenticator;
use crate::timers::TimerService;

const SERVICE_STREAM: i32 = 104;
const LOG_STREAM: i32 = 100;
const INGRESS_STREAM: i32 = 101;
const EGRESS_STREAM: i32 = 110;

// ============================================================================
// Harness: configuration
// ============================================================================

fn members_string(count: u32) -> String {
    (0..count)
        .map(|i| {
            format!(
                "{i},node{i}-client,node{i}-member,node{i}-log,node{i}-transfer,node{i}-archive"
            )
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn test_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        session_timeout_ns: 4_000_000_000,
        leader_heartbeat_interval_ns: 10_000_000,
        leader_heartbeat_timeout_ns: 1_000_000_000,
        service_heartbeat_timeout_ns: 60_000_000_000,
        election_timeout_ns: 500_000_000,
        termination_timeout_ns: 5_000_000_000,
        recovery_timeout_ns: 10_000_000_000,
        dynamic_join_timeout_ns: 20_000_000_000,
    }
}

fn static_config(member_id: u32, members: &str, appointed: Option<u32>) -> ClusterConfig {
    ClusterConfig {
        cluster_member_id: member_id,
        appointed_leader_id: appointed,
        cluster_members: members.to_string(),
        service_count: 1,
        timeouts: test_timeouts(),
        ..ClusterConfig::default()
    }
}

fn joiner_config(member_id: u32, status_endpoints: &[&str]) -> ClusterConfig {
    ClusterConfig {
        cluster_member_id: member_id,
        cluster_members: String::new(),
        cluster_members_status_endpoints: status_endpoints
            .iter()
            .map(ToString::to_string)
            .collect(),
        member_endpoints: format!(
            "node{member_id}-client,node{member_id}-member,node{member_id}-log,\
             node{member_id}-transfer,node{member_id}-archive"
        ),
        service_count: 1,
        timeouts: test_timeouts(),
        ..ClusterConfig::default()
    }
}

fn message(n: u32) -> [u8; 4] {
    n.to_le_bytes()
}

// ============================================================================
// Harness: stub service container
// ============================================================================

/// A hosted state-machine service: consumes the committed log in order,
/// heartbeats, acks, snapshots its message count, and terminates on demand.
struct StubService {
    member_id: u32,
    media: MemoryMedia,
    archive: MemoryArchive,
    counters: ClusterCounters,
    control_sub: Box<dyn Subscription>,
    control_pub: Box<dyn Publication>,
    /// Attached at boot so no live frame is ever missed.
    live_log: Box<dyn Subscription>,
    /// Replay frames aimed at this member's log endpoint land here.
    replay_log: Box<dyn Subscription>,
    /// Frames parked until contiguous with the consumed position and
    /// covered by the commit counter.
    reorder: BTreeMap<u64, (usize, LogRecord)>,
    consumed: LogPosition,
    start_position: LogPosition,

    delivered_count: usize,
    payloads_since_start: Vec<Bytes>,
    closed_sessions: usize,
    snapshot_loaded: bool,
    snapshot_seq: usize,
    ack_id: i64,
    booted: bool,
    termination_position: Option<LogPosition>,
    terminated: bool,
}

impl StubService {
    fn new(
        hub: &MemoryHub,
        member_id: u32,
        counters: ClusterCounters,
        start_position: LogPosition,
        restored_count: Option<usize>,
    ) -> Self {
        let mut media = hub.media();
        let service_channel = format!("tek:mem?endpoint=node{member_id}-service");
        let control_sub = media
            .add_subscription(&service_channel, SERVICE_STREAM)
            .expect("service control sub");
        let control_pub = media
            .add_publication(&service_channel, SERVICE_STREAM + 1)
            .expect("service control pub");
        let replay_log = media
            .add_subscription(&format!("tek:mem?endpoint=node{member_id}-log"), LOG_STREAM)
            .expect("replay log sub");
        let live_log = media
            .add_subscription("tek:mem?endpoint=cluster-log", LOG_STREAM)
            .expect("live log sub");
        Self {
            member_id,
            archive: hub.archive(),
            media,
            counters,
            control_sub,
            control_pub,
            live_log,
            replay_log,
            reorder: BTreeMap::new(),
            consumed: start_position,
            start_position,
            delivered_count: restored_count.unwrap_or(0),
            payloads_since_start: Vec::new(),
            closed_sessions: 0,
            snapshot_loaded: restored_count.is_some(),
            snapshot_seq: 0,
            ack_id: 0,
            booted: false,
            termination_position: None,
            terminated: false,
        }
    }

    fn send_ack(&mut self, position: LogPosition, relevant_id: i64) {
        let ack = FromServiceMessage::ServiceAck {
            log_position: position,
            timestamp_ms: 0,
            ack_id: self.ack_id,
            relevant_id,
            service_id: ServiceId::new(0),
        };
        self.ack_id += 1;
        let bytes = tektite_wire::encode(&ack).expect("encode ack");
        assert!(
            self.control_pub.offer(&bytes).is_granted(),
            "service ack refused"
        );
    }

    fn take_snapshot(&mut self, position: LogPosition) {
        let channel = format!(
            "tek:mem?endpoint=svc{}-snap-{}",
            self.member_id, self.snapshot_seq
        );
        self.snapshot_seq += 1;
        let recording_id = self
            .archive
            .start_recording(&channel, SERVICE_STREAM)
            .expect("snapshot recording");
        let mut publication = self
            .media
            .add_publication(&channel, SERVICE_STREAM)
            .expect("snapshot pub");
        let bytes = postcard::to_allocvec(&(self.delivered_count as u64)).expect("encode count");
        assert!(publication.offer(&bytes).is_granted());
        publication.close();
        self.media.do_work();
        self.archive.stop_recording(recording_id).expect("stop recording");
        self.send_ack(position, recording_id.as_i64());
    }

    fn on_record(&mut self, position: LogPosition, record: LogRecord) {
        match record {
            LogRecord::SessionMessage { payload, .. } => {
                self.delivered_count += 1;
                self.payloads_since_start.push(payload);
            }
            LogRecord::SessionClose { .. } => self.closed_sessions += 1,
            LogRecord::ClusterAction {
                action: tektite_wire::ClusterAction::Snapshot,
                ..
            } => self.take_snapshot(position),
            _ => {}
        }
    }

    fn tick(&mut self, now_ms: i64) {
        if self.terminated {
            return;
        }
        self.counters.service_heartbeats[0].set(now_ms);

        if !self.booted {
            self.booted = true;
            self.send_ack(self.start_position, -1);
        }

        for fragment in self.control_sub.poll(16) {
            let control: ToServiceMessage =
                tektite_wire::decode(&fragment.payload).expect("decode control");
            match control {
                // The log subscription is held from boot; join is a no-op.
                ToServiceMessage::JoinLog { .. } => {}
                ToServiceMessage::ServiceTerminationPosition { log_position } => {
                    self.termination_position = Some(log_position);
                }
                ToServiceMessage::ClusterMembersResponse { .. }
                | ToServiceMessage::ElectionStartEvent { .. } => {}
            }
        }

        // Park frames from both legs, then consume the committed contiguous
        // prefix in position order. Contiguity is exact: a fragment's frame
        // starts where the previous one ended.
        let mut fragments = self.replay_log.poll(16);
        fragments.extend(self.live_log.poll(16));
        for fragment in fragments {
            if fragment.position <= self.consumed {
                continue;
            }
            let record: LogRecord =
                tektite_wire::decode(&fragment.payload).expect("decode log record");
            self.reorder
                .insert(fragment.position.as_u64(), (fragment.payload.len(), record));
        }

        let commit = LogPosition::new(self.counters.commit_position.get() as u64);
        loop {
            let Some((&position, &(raw_len, _))) = self.reorder.iter().next() else {
                break;
            };
            let position = LogPosition::new(position);
            if position <= self.consumed {
                self.reorder.remove(&position.as_u64());
                continue;
            }
            let frame = LogPosition::aligned_frame_length(raw_len);
            let contiguous = position.as_u64() == self.consumed.as_u64() + frame;
            if !contiguous || position > commit {
                break;
            }
            let (_, record) = self.reorder.remove(&position.as_u64()).expect("present");
            self.consumed = position;
            self.on_record(position, record);
        }

        if let Some(position) = self.termination_position {
            if self.consumed >= position {
                self.send_ack(position, -1);
                self.termination_position = None;
                self.terminated = true;
            }
        }
    }
}

// ============================================================================
// Harness: test client
// ============================================================================

struct TestClient {
    media: MemoryMedia,
    response_channel: String,
    egress_sub: Box<dyn Subscription>,
    ingress_pubs: HashMap<u32, Box<dyn Publication>>,
    target: u32,
    session: Option<ClusterSessionId>,
    term: LeadershipTermId,
    new_leader_events: usize,
    closed_events: usize,
    last_keep_alive_ms: i64,
}

impl TestClient {
    fn new(hub: &MemoryHub, name: &str, target: u32) -> Self {
        let mut media = hub.media();
        let response_channel = format!("tek:mem?endpoint={name}-egress");
        let egress_sub = media
            .add_subscription(&response_channel, EGRESS_STREAM)
            .expect("egress sub");
        Self {
            media,
            response_channel,
            egress_sub,
            ingress_pubs: HashMap::new(),
            target,
            session: None,
            term: LeadershipTermId::NONE,
            new_leader_events: 0,
            closed_events: 0,
            last_keep_alive_ms: 0,
        }
    }

    fn offer_ingress(&mut self, frame: &IngressFrame) {
        let target = self.target;
        let media = &mut self.media;
        let publication = self.ingress_pubs.entry(target).or_insert_with(|| {
            media
                .add_publication(
                    &format!("tek:mem?endpoint=node{target}-client"),
                    INGRESS_STREAM,
                )
                .expect("ingress pub")
        });
        let bytes = tektite_wire::encode(frame).expect("encode ingress");
        assert!(publication.offer(&bytes).is_granted(), "ingress refused");
    }

    fn connect(&mut self) {
        let frame = IngressFrame::SessionConnect {
            correlation_id: CorrelationId::new(1),
            response_stream_id: EGRESS_STREAM,
            version: tektite_wire::semantic_version(
                tektite_wire::PROTOCOL_MAJOR_VERSION,
                tektite_wire::PROTOCOL_MINOR_VERSION,
            ),
            response_channel: self.response_channel.clone(),
            credentials: Bytes::new(),
        };
        self.offer_ingress(&frame);
    }

    fn send(&mut self, payload: &[u8]) {
        let session = self.session.expect("session open");
        let frame = IngressFrame::IngressMessage {
            leadership_term_id: self.term,
            cluster_session_id: session,
            payload: Bytes::copy_from_slice(payload),
        };
        self.offer_ingress(&frame);
    }

    fn tick(&mut self, now_ms: i64) {
        let fragments = self.egress_sub.poll(16);
        for fragment in fragments {
            let event: EgressEvent = tektite_wire::decode(&fragment.payload).expect("egress");
            match event {
                EgressEvent::SessionEvent {
                    cluster_session_id,
                    leadership_term_id,
                    leader_member_id,
                    code,
                    ..
                } => match code {
                    EventCode::Ok => {
                        self.session = Some(cluster_session_id);
                        self.term = leadership_term_id;
                        self.target = leader_member_id.as_u32();
                    }
                    EventCode::Redirect => self.target = leader_member_id.as_u32(),
                    EventCode::Closed => self.closed_events += 1,
                    EventCode::Error | EventCode::AuthenticationRejected => {}
                },
                EgressEvent::NewLeaderEvent {
                    leadership_term_id,
                    leader_member_id,
                    ..
                } => {
                    self.new_leader_events += 1;
                    self.term = leadership_term_id;
                    self.target = leader_member_id.as_u32();
                }
                EgressEvent::Challenge { .. } => {}
            }
        }

        if let Some(session) = self.session {
            if now_ms >= self.last_keep_alive_ms + 500 {
                self.last_keep_alive_ms = now_ms;
                let frame = IngressFrame::SessionKeepAlive {
                    leadership_term_id: self.term,
                    cluster_session_id: session,
                };
                self.offer_ingress(&frame);
            }
        }
    }
}

// ============================================================================
// Harness: cluster
// ============================================================================

struct RunningMember {
    agent: ConsensusAgent,
    service: StubService,
    counters: ClusterCounters,
}

struct TestCluster {
    hub: MemoryHub,
    members: HashMap<u32, RunningMember>,
    now_ms: i64,
}

impl TestCluster {
    fn start(count: u32, appointed: Option<u32>) -> Self {
        let hub = MemoryHub::new();
        let members_text = members_string(count);
        let mut cluster = Self {
            hub,
            members: HashMap::new(),
            now_ms: 0,
        };
        for id in 0..count {
            let config = static_config(id, &members_text, appointed);
            cluster.launch_member(id, config, RecordingLog::new(), LogPosition::ZERO, None);
        }
        cluster
    }

    fn launch_member(
        &mut self,
        id: u32,
        config: ClusterConfig,
        recording_log: RecordingLog,
        service_start: LogPosition,
        restored_count: Option<usize>,
    ) {
        let counters = ClusterCounters::new(1);
        let agent = ConsensusAgent::launch(
            config,
            Box::new(self.hub.media()),
            Box::new(self.hub.archive()),
            counters.clone(),
            recording_log,
            Box::new(AllowAllAuthenticator),
        )
        .expect("launch");
        let service =
            StubService::new(&self.hub, id, counters.clone(), service_start, restored_count);
        self.members.insert(
            id,
            RunningMember {
                agent,
                service,
                counters,
            },
        );
    }

    /// Stops a member and returns what survives a restart: its recording
    /// log, the restart position, and the archived service snapshot if any.
    fn stop_member(&mut self, id: u32) -> (RecordingLog, LogPosition, Option<RecordingId>) {
        let member = self.members.remove(&id).expect("member running");
        let recording_log = member.agent.recording_log.clone();
        let mut archive = self.hub.archive();
        let plan = recording_log
            .create_recovery_plan(1, |recording_id| archive.stop_position(recording_id).ok());
        let service_snapshot = plan
            .snapshots
            .iter()
            .find(|s| s.service_id == ServiceId::new(0))
            .map(|s| s.recording_id);
        (recording_log, plan.start_position(), service_snapshot)
    }

    fn restart_member(
        &mut self,
        id: u32,
        members_text: &str,
        appointed: Option<u32>,
        recording_log: RecordingLog,
        service_start: LogPosition,
        service_snapshot: Option<RecordingId>,
    ) {
        let restored_count = service_snapshot
            .map(|recording_id| restore_service_count(&self.hub, id, recording_id) as usize);
        let config = static_config(id, members_text, appointed);
        self.launch_member(id, config, recording_log, service_start, restored_count);
    }

    fn tick(&mut self, client: Option<&mut TestClient>) {
        self.now_ms += 1;
        self.hub.do_work();
        if let Some(client) = client {
            client.tick(self.now_ms);
        }
        for member in self.members.values_mut() {
            member.service.tick(self.now_ms);
            member.agent.do_work(self.now_ms);
        }
    }

    fn run_until(
        &mut self,
        what: &str,
        max_rounds: usize,
        mut client: Option<&mut TestClient>,
        mut done: impl FnMut(&TestCluster, Option<&TestClient>) -> bool,
    ) {
        for _ in 0..max_rounds {
            self.tick(client.as_deref_mut());
            if done(self, client.as_deref()) {
                return;
            }
        }
        panic!("gave up after {max_rounds} rounds waiting for: {what}");
    }

    fn leader_id(&self) -> Option<u32> {
        self.members
            .iter()
            .find(|(_, m)| m.counters.is_leader.get() == 1)
            .map(|(id, _)| *id)
    }

    fn member(&self, id: u32) -> &RunningMember {
        self.members.get(&id).expect("member running")
    }

    fn all_active(&self) -> bool {
        self.members
            .values()
            .all(|m| m.agent.state() == ModuleState::Active)
    }
}

fn restore_service_count(hub: &MemoryHub, member_id: u32, recording_id: RecordingId) -> u64 {
    let mut media = hub.media();
    let mut archive = hub.archive();
    let channel = format!(
        "tek:mem?endpoint=svc{member_id}-restore-{}",
        recording_id.as_i64()
    );
    let mut subscription = media
        .add_subscription(&channel, SERVICE_STREAM)
        .expect("restore sub");
    let extent = archive.list_recording(recording_id).expect("extent");
    archive
        .start_replay(
            recording_id,
            extent.start_position,
            None,
            &channel,
            SERVICE_STREAM,
        )
        .expect("replay");
    for _ in 0..100 {
        media.do_work();
        let fragments = subscription.poll(1);
        if let Some(fragment) = fragments.first() {
            return postcard::from_bytes(&fragment.payload).expect("decode count");
        }
    }
    panic!("service snapshot {recording_id} yielded no data");
}

// ============================================================================
// S1: Three-member happy path
// ============================================================================

#[test]
fn three_member_happy_path() {
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected and all active", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s1", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });

    let commit_before = cluster.member(0).counters.commit_position.get();
    for n in 0..100u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until(
        "100 messages on every member",
        30_000,
        Some(&mut client),
        |c, _| c.members.values().all(|m| m.service.delivered_count >= 100),
    );

    // Identical order on every member.
    let expected: Vec<Bytes> = (0..100u32)
        .map(|n| Bytes::copy_from_slice(&message(n)))
        .collect();
    for member in cluster.members.values() {
        assert_eq!(member.service.payloads_since_start, expected);
    }

    // One aligned frame per message at minimum.
    let commit_after = cluster.member(0).counters.commit_position.get();
    assert!(
        commit_after - commit_before >= 100 * 64,
        "commit advanced only {} bytes",
        commit_after - commit_before
    );
}

// ============================================================================
// S2: Leader failover
// ============================================================================

#[test]
fn leader_failover() {
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s2", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });
    for n in 0..5u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until(
        "messages before failover",
        20_000,
        Some(&mut client),
        |c, _| c.members.values().all(|m| m.service.delivered_count >= 5),
    );

    cluster.stop_member(0);
    cluster.run_until(
        "new leader among 1 and 2",
        30_000,
        Some(&mut client),
        |c, _| {
            matches!(c.leader_id(), Some(1 | 2))
                && c.members.values().all(|m| !m.agent.is_electing())
        },
    );
    let new_leader = cluster.leader_id().expect("leader");
    assert!(
        cluster.member(new_leader).agent.leadership_term_id() > LeadershipTermId::new(0),
        "term must advance on failover"
    );

    cluster.run_until(
        "client told of the new leader",
        20_000,
        Some(&mut client),
        |_, cl| cl.expect("client").new_leader_events >= 1,
    );
    assert_eq!(client.new_leader_events, 1, "exactly one NewLeader event");
    assert_eq!(client.target, new_leader);

    for n in 5..15u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until(
        "messages after failover",
        30_000,
        Some(&mut client),
        |c, _| c.members.values().all(|m| m.service.delivered_count >= 15),
    );
}

// ============================================================================
// S3: Snapshot & restart
// ============================================================================

#[test]
fn snapshot_and_restart() {
    let members_text = members_string(3);
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s3", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });
    for n in 0..5u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until("5 messages everywhere", 20_000, Some(&mut client), |c, _| {
        c.members.values().all(|m| m.service.delivered_count >= 5)
    });

    assert!(
        cluster
            .member(0)
            .counters
            .control_toggle
            .signal(ToggleState::Snapshot)
    );
    cluster.run_until(
        "snapshot on every member",
        30_000,
        Some(&mut client),
        |c, _| {
            c.members
                .values()
                .all(|m| m.counters.snapshot_count.get() >= 1)
        },
    );

    let saved: Vec<_> = (0..3u32).map(|id| (id, cluster.stop_member(id))).collect();
    for (id, (recording_log, service_start, service_snapshot)) in saved {
        cluster.restart_member(
            id,
            &members_text,
            Some(0),
            recording_log,
            service_start,
            service_snapshot,
        );
    }

    cluster.run_until(
        "cluster active after restart",
        30_000,
        Some(&mut client),
        |c, _| c.leader_id().is_some() && c.all_active(),
    );

    for member in cluster.members.values() {
        assert!(member.service.snapshot_loaded, "snapshot must be loaded");
        assert_eq!(member.service.delivered_count, 5);
        // No replay beyond the snapshot: nothing re-delivered on restart.
        assert!(member.service.payloads_since_start.is_empty());
    }

    cluster.run_until(
        "client follows restarted leader",
        30_000,
        Some(&mut client),
        |_, cl| cl.expect("client").new_leader_events >= 1,
    );
    client.send(&message(5));
    cluster.run_until(
        "message after restart",
        30_000,
        Some(&mut client),
        |c, _| c.members.values().all(|m| m.service.delivered_count >= 6),
    );
}

// ============================================================================
// S4: Dynamic join
// ============================================================================

#[test]
fn dynamic_join() {
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s4", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });
    for n in 0..5u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until("5 messages committed", 20_000, Some(&mut client), |c, _| {
        c.members.values().all(|m| m.service.delivered_count >= 5)
    });

    let config = joiner_config(3, &["node0-member", "node1-member", "node2-member"]);
    cluster.launch_member(3, config, RecordingLog::new(), LogPosition::ZERO, None);

    cluster.run_until(
        "member 3 joined and caught up",
        60_000,
        Some(&mut client),
        |c, _| {
            let joiner = c.member(3);
            joiner.agent.state() == ModuleState::Active
                && !joiner.agent.is_electing()
                && joiner.service.delivered_count >= 5
        },
    );

    let joiner = cluster.member(3);
    assert_eq!(joiner.service.delivered_count, 5);
    let expected: Vec<Bytes> = (0..5u32)
        .map(|n| Bytes::copy_from_slice(&message(n)))
        .collect();
    assert_eq!(joiner.service.payloads_since_start, expected);

    // The leader's active membership now includes the joiner.
    let leader = cluster.member(0);
    assert!(leader.agent.members.is_active(MemberId::new(3)));
    assert_eq!(leader.agent.members.active_count(), 4);
}

// ============================================================================
// S5: Abort
// ============================================================================

#[test]
fn abort_terminates_all_members() {
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s5", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });
    for n in 0..3u32 {
        client.send(&message(n));
        cluster.tick(Some(&mut client));
    }
    cluster.run_until("steady state", 20_000, Some(&mut client), |c, _| {
        c.members.values().all(|m| m.service.delivered_count >= 3)
    });

    assert!(
        cluster
            .member(0)
            .counters
            .control_toggle
            .signal(ToggleState::Abort)
    );
    cluster.run_until("every member closed", 30_000, Some(&mut client), |c, _| {
        c.members
            .values()
            .all(|m| m.agent.state() == ModuleState::Closed)
    });
    for member in cluster.members.values() {
        assert!(member.service.terminated, "services must observe termination");
        assert_eq!(
            member.counters.snapshot_count.get(),
            0,
            "abort skips the snapshot"
        );
    }
}

// ============================================================================
// S6: Session timeout
// ============================================================================

#[test]
fn silent_session_times_out() {
    let mut cluster = TestCluster::start(3, Some(0));
    cluster.run_until("leader 0 elected", 10_000, None, |c, _| {
        c.leader_id() == Some(0) && c.all_active()
    });

    let mut client = TestClient::new(&cluster.hub, "s6", 0);
    client.connect();
    cluster.run_until("session open", 10_000, Some(&mut client), |_, cl| {
        cl.expect("client").session.is_some()
    });
    client.send(&message(0));

    // Go silent: the client is no longer ticked, so no keep-alives flow.
    cluster.run_until("session closed for inactivity", 30_000, None, |c, _| {
        c.member(0).counters.timed_out_clients.get() >= 1
    });
    assert_eq!(cluster.member(0).counters.timed_out_clients.get(), 1);

    // The close is replicated: every member's service sees it.
    cluster.run_until("close event in the log everywhere", 20_000, None, |c, _| {
        c.members.values().all(|m| m.service.closed_sessions >= 1)
    });

    // The client is told, on its response channel.
    for _ in 0..2_000 {
        cluster.tick(Some(&mut client));
        if client.closed_events >= 1 {
            break;
        }
    }
    assert_eq!(client.closed_events, 1, "client observes the close once");
}

// ============================================================================
// Invariant properties
// ============================================================================

proptest! {
    /// Timer firings are a subsequence of schedules: every fire is at or
    /// after its deadline, and each schedule produces at most one fire.
    #[test]
    fn timer_firings_are_a_subsequence(
        schedules in prop::collection::vec((0i64..8, 1i64..200), 1..40)
    ) {
        let mut timers = TimerService::new();
        let mut live: HashMap<i64, i64> = HashMap::new();
        let mut schedule_counts: HashMap<i64, usize> = HashMap::new();
        let mut fire_counts: HashMap<i64, usize> = HashMap::new();
        let mut now = 0i64;

        for (id, offset) in schedules {
            let correlation = CorrelationId::new(id);
            if !live.contains_key(&id) {
                let deadline = now + offset;
                timers.schedule(correlation, deadline);
                // A schedule may instead pair with a pending fire, in which
                // case nothing is installed.
                if timers.entries().any(|(c, _)| c == correlation) {
                    live.insert(id, deadline);
                    *schedule_counts.entry(id).or_insert(0) += 1;
                }
            }

            now += 11;
            let mut fired_now = Vec::new();
            timers.poll(now, |c| {
                fired_now.push(c.as_i64());
                true
            });
            for fired in fired_now {
                let deadline = live.remove(&fired).expect("fired only if scheduled");
                prop_assert!(now >= deadline, "timer {fired} fired before its deadline");
                *fire_counts.entry(fired).or_insert(0) += 1;
            }
        }

        for (id, fires) in &fire_counts {
            prop_assert!(
                fires <= &schedule_counts[id],
                "timer {id} fired more often than scheduled"
            );
        }
    }

    /// The quorum position is replicated on a strict majority, and is the
    /// highest position with that property.
    #[test]
    fn quorum_position_is_majority_replicated(
        positions in prop::collection::vec(0u64..10_000, 1..9)
    ) {
        let text: String = (0..positions.len())
            .map(|i| format!("{i},c{i},m{i},l{i},t{i},a{i}"))
            .collect::<Vec<_>>()
            .join("|");
        let mut registry = MemberRegistry::parse(&text).expect("parse");
        for (member, position) in registry.active_mut().iter_mut().zip(&positions) {
            member.appended_log_position = LogPosition::new(*position);
        }

        let quorum = registry.quorum_size();
        let quorum_position = registry.quorum_position();
        let replicated = positions
            .iter()
            .filter(|p| LogPosition::new(**p) >= quorum_position)
            .count();
        prop_assert!(replicated >= quorum);

        // Nothing higher is on a majority.
        let next_higher = positions
            .iter()
            .map(|p| LogPosition::new(*p))
            .filter(|p| *p > quorum_position)
            .min();
        if let Some(higher) = next_higher {
            let count = positions
                .iter()
                .filter(|p| LogPosition::new(**p) >= higher)
                .count();
            prop_assert!(count < quorum);
        }
    }

    /// The pending ring preserves append order across interleaved consumes.
    #[test]
    fn pending_ring_preserves_order(
        batches in prop::collection::vec(1usize..5, 1..20),
        consume_every in 1usize..4
    ) {
        let mut ring = PendingServiceMessageRing::new(16);
        let mut appended = Vec::new();
        let mut consumed = Vec::new();

        for (round, batch) in batches.iter().enumerate() {
            for i in 0..*batch {
                let payload = Bytes::from(vec![round as u8, i as u8]);
                ring.append(payload.clone());
                appended.push(payload);
            }
            if round % consume_every == 0 {
                ring.consume(3, |entry| {
                    consumed.push(entry.payload.clone());
                    true
                });
            }
        }
        ring.consume(usize::MAX, |entry| {
            consumed.push(entry.payload.clone());
            true
        });

        prop_assert_eq!(consumed, appended);
    }
}
