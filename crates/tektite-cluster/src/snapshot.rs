//! Snapshot take and load for the consensus module's own state.
//!
//! A snapshot stream is written through an exclusive publication recorded by
//! the archive: begin marker, module counters, one record per open session,
//! timer, and pending service message, the membership, then the end marker.
//! Loading replays the recording onto a private channel and folds the
//! records back into a [`ModuleSnapshot`]; a stream without its end marker
//! is torn and rejected.

use tektite_types::{CorrelationId, LogPosition, MemberId, RecordingId};
use tektite_transport::{Archive, Media, Offer, Publication as _, Subscription as _, TransportError};
use tektite_wire::{SnapshotMark, SnapshotMarkerSummary, SnapshotRecord};

use crate::error::{ClusterError, ClusterResult};
use crate::pending_ring::PendingServiceMessage;
use crate::sessions::{ClusterSession, SessionState};

/// Offer retries before a snapshot write attempt is abandoned.
const WRITE_RETRY_LIMIT: usize = 1_000;

/// Transport pumps before a snapshot load is declared stuck.
const LOAD_PUMP_LIMIT: usize = 10_000;

// ============================================================================
// Module Snapshot
// ============================================================================

/// The consensus module state carried by a snapshot.
#[derive(Debug, Clone)]
pub struct ModuleSnapshot {
    pub leadership_term_id: tektite_types::LeadershipTermId,
    pub log_position: LogPosition,
    pub term_base_log_position: LogPosition,
    pub timestamp_ms: i64,

    pub next_session_id: i64,
    pub next_service_session_id: i64,
    pub log_service_session_id: i64,
    pub pending_message_capacity: usize,

    pub sessions: Vec<ClusterSession>,
    pub timers: Vec<(CorrelationId, i64)>,
    pub pending_messages: Vec<PendingServiceMessage>,
    pub members: Option<(MemberId, String, String)>,
}

// ============================================================================
// Writer
// ============================================================================

/// Writes a module snapshot through the archive; returns the recording id.
pub(crate) fn write_module_snapshot(
    media: &mut dyn Media,
    archive: &mut dyn Archive,
    channel: &str,
    stream_id: i32,
    snapshot: &ModuleSnapshot,
) -> ClusterResult<RecordingId> {
    let recording_id = archive.start_recording(channel, stream_id)?;
    let mut publication = media.add_exclusive_publication(channel, stream_id)?;

    let mut offer = |record: &SnapshotRecord| -> ClusterResult<()> {
        let bytes = tektite_wire::encode(record)?;
        for _ in 0..WRITE_RETRY_LIMIT {
            match publication.offer(&bytes) {
                Offer::Position(_) => return Ok(()),
                Offer::BackPressured | Offer::NotConnected => {
                    media.do_work();
                }
                Offer::Closed => return Err(TransportError::Closed.into()),
            }
        }
        Err(TransportError::Media("snapshot write back-pressured".to_string()).into())
    };

    let marker = |mark: SnapshotMark| SnapshotRecord::Marker {
        mark,
        leadership_term_id: snapshot.leadership_term_id,
        log_position: snapshot.log_position,
        term_base_log_position: snapshot.term_base_log_position,
        timestamp_ms: snapshot.timestamp_ms,
    };

    let result = (|| -> ClusterResult<()> {
        offer(&marker(SnapshotMark::Begin))?;
        offer(&SnapshotRecord::ModuleState {
            next_session_id: snapshot.next_session_id,
            next_service_session_id: snapshot.next_service_session_id,
            log_service_session_id: snapshot.log_service_session_id,
            pending_message_capacity: snapshot.pending_message_capacity,
        })?;
        for session in &snapshot.sessions {
            offer(&SnapshotRecord::Session {
                cluster_session_id: session.id,
                correlation_id: session.correlation_id,
                opened_log_position: session.opened_log_position,
                time_of_last_activity_ms: session.time_of_last_activity_ms,
                close_reason: session.close_reason,
                response_stream_id: session.response_stream_id,
                response_channel: session.response_channel.clone(),
            })?;
        }
        for &(correlation_id, deadline_ms) in &snapshot.timers {
            offer(&SnapshotRecord::Timer {
                correlation_id,
                deadline_ms,
            })?;
        }
        for message in &snapshot.pending_messages {
            offer(&SnapshotRecord::PendingServiceMessage {
                cluster_session_id: message.cluster_session_id,
                payload: message.payload.clone(),
            })?;
        }
        if let Some((high_member_id, active, passive)) = &snapshot.members {
            offer(&SnapshotRecord::Members {
                high_member_id: *high_member_id,
                active_members: active.clone(),
                passive_members: passive.clone(),
            })?;
        }
        offer(&marker(SnapshotMark::End))
    })();

    publication.close();
    media.do_work();
    archive.stop_recording(recording_id)?;
    result.map(|()| recording_id)
}

// ============================================================================
// Loader
// ============================================================================

/// Replays a snapshot recording and folds it back into module state.
pub(crate) fn load_module_snapshot(
    media: &mut dyn Media,
    archive: &mut dyn Archive,
    load_channel: &str,
    stream_id: i32,
    summary: &SnapshotMarkerSummary,
) -> ClusterResult<ModuleSnapshot> {
    let mut subscription = media.add_subscription(load_channel, stream_id)?;
    let extent = archive.list_recording(summary.recording_id)?;
    let replay_session_id = archive.start_replay(
        summary.recording_id,
        extent.start_position,
        None,
        load_channel,
        stream_id,
    )?;

    let mut snapshot = ModuleSnapshot {
        leadership_term_id: summary.leadership_term_id,
        log_position: summary.log_position,
        term_base_log_position: summary.term_base_log_position,
        timestamp_ms: summary.timestamp_ms,
        next_session_id: 0,
        next_service_session_id: crate::pending_ring::FIRST_SERVICE_SESSION_ID,
        log_service_session_id: crate::pending_ring::FIRST_SERVICE_SESSION_ID - 1,
        pending_message_capacity: 0,
        sessions: Vec::new(),
        timers: Vec::new(),
        pending_messages: Vec::new(),
        members: None,
    };

    let mut begun = false;
    let mut ended = false;
    let mut pumps = 0;
    while !ended {
        let fragments = subscription.poll(16);
        if fragments.is_empty() {
            media.do_work();
            pumps += 1;
            if pumps > LOAD_PUMP_LIMIT {
                break;
            }
            continue;
        }
        for fragment in fragments {
            let record: SnapshotRecord = tektite_wire::decode(&fragment.payload)?;
            match record {
                SnapshotRecord::Marker { mark: SnapshotMark::Begin, log_position, .. } => {
                    if log_position != summary.log_position {
                        return Err(ClusterError::RecordingLog(format!(
                            "snapshot marker at {log_position} does not match recorded {}",
                            summary.log_position
                        )));
                    }
                    begun = true;
                }
                SnapshotRecord::Marker { mark: SnapshotMark::End, .. } => {
                    ended = true;
                }
                SnapshotRecord::ModuleState {
                    next_session_id,
                    next_service_session_id,
                    log_service_session_id,
                    pending_message_capacity,
                } => {
                    snapshot.next_session_id = next_session_id;
                    snapshot.next_service_session_id = next_service_session_id;
                    snapshot.log_service_session_id = log_service_session_id;
                    snapshot.pending_message_capacity = pending_message_capacity;
                }
                SnapshotRecord::Session {
                    cluster_session_id,
                    correlation_id,
                    opened_log_position,
                    time_of_last_activity_ms,
                    close_reason,
                    response_stream_id,
                    response_channel,
                } => {
                    let mut session = ClusterSession::new(
                        cluster_session_id,
                        correlation_id,
                        response_stream_id,
                        response_channel,
                        time_of_last_activity_ms,
                    );
                    session.opened_log_position = opened_log_position;
                    session.close_reason = close_reason;
                    session.transition(SessionState::Open);
                    snapshot.sessions.push(session);
                }
                SnapshotRecord::Timer {
                    correlation_id,
                    deadline_ms,
                } => snapshot.timers.push((correlation_id, deadline_ms)),
                SnapshotRecord::PendingServiceMessage {
                    cluster_session_id,
                    payload,
                } => snapshot.pending_messages.push(PendingServiceMessage {
                    cluster_session_id,
                    payload,
                }),
                SnapshotRecord::Members {
                    high_member_id,
                    active_members,
                    passive_members,
                } => snapshot.members = Some((high_member_id, active_members, passive_members)),
            }
        }
    }

    archive.stop_replay(replay_session_id)?;
    subscription.close();

    if !begun || !ended {
        return Err(ClusterError::RecoveryTimeout {
            awaiting: "snapshot end marker",
        });
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tektite_types::{ClusterSessionId, LeadershipTermId, ServiceId};
    use tektite_transport::memory::MemoryHub;

    fn sample_snapshot() -> ModuleSnapshot {
        let mut session = ClusterSession::new(
            ClusterSessionId::new(3),
            CorrelationId::new(17),
            9,
            "tek:mem?endpoint=client-a".to_string(),
            500,
        );
        session.opened_log_position = LogPosition::new(128);
        session.transition(SessionState::Open);

        ModuleSnapshot {
            leadership_term_id: LeadershipTermId::new(2),
            log_position: LogPosition::new(640),
            term_base_log_position: LogPosition::new(64),
            timestamp_ms: 777,
            next_session_id: 4,
            next_service_session_id: crate::pending_ring::FIRST_SERVICE_SESSION_ID + 2,
            log_service_session_id: crate::pending_ring::FIRST_SERVICE_SESSION_ID + 1,
            pending_message_capacity: 64,
            sessions: vec![session],
            timers: vec![(CorrelationId::new(5), 9_000)],
            pending_messages: vec![PendingServiceMessage {
                cluster_session_id: ClusterSessionId::new(
                    crate::pending_ring::FIRST_SERVICE_SESSION_ID + 2,
                ),
                payload: Bytes::from_static(b"svc"),
            }],
            members: Some((MemberId::new(2), "0,c,m,l,t,a".to_string(), String::new())),
        }
    }

    #[test]
    fn write_then_load_round_trips_module_state() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let mut archive = hub.archive();
        let snapshot = sample_snapshot();

        let recording_id = write_module_snapshot(
            &mut media,
            &mut archive,
            "tek:mem?endpoint=node0-snapshot",
            106,
            &snapshot,
        )
        .expect("write");

        let summary = SnapshotMarkerSummary {
            leadership_term_id: snapshot.leadership_term_id,
            term_base_log_position: snapshot.term_base_log_position,
            log_position: snapshot.log_position,
            timestamp_ms: snapshot.timestamp_ms,
            service_id: ServiceId::CONSENSUS_MODULE,
            recording_id,
        };
        let loaded = load_module_snapshot(
            &mut media,
            &mut archive,
            "tek:mem?endpoint=node0-snapshot-load",
            106,
            &summary,
        )
        .expect("load");

        assert_eq!(loaded.next_session_id, snapshot.next_session_id);
        assert_eq!(
            loaded.next_service_session_id,
            snapshot.next_service_session_id
        );
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].id, ClusterSessionId::new(3));
        assert_eq!(loaded.sessions[0].state, SessionState::Open);
        assert_eq!(loaded.timers, snapshot.timers);
        assert_eq!(loaded.pending_messages, snapshot.pending_messages);
        assert_eq!(
            loaded.members,
            Some((MemberId::new(2), "0,c,m,l,t,a".to_string(), String::new()))
        );
    }

    #[test]
    fn load_rejects_mismatched_marker_position() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let mut archive = hub.archive();
        let snapshot = sample_snapshot();

        let recording_id = write_module_snapshot(
            &mut media,
            &mut archive,
            "tek:mem?endpoint=node0-snapshot",
            106,
            &snapshot,
        )
        .expect("write");

        let summary = SnapshotMarkerSummary {
            leadership_term_id: snapshot.leadership_term_id,
            term_base_log_position: snapshot.term_base_log_position,
            // Recording-log entry disagrees with the stream's marker.
            log_position: LogPosition::new(9_999),
            timestamp_ms: snapshot.timestamp_ms,
            service_id: ServiceId::CONSENSUS_MODULE,
            recording_id,
        };
        assert!(
            load_module_snapshot(
                &mut media,
                &mut archive,
                "tek:mem?endpoint=node0-snapshot-load2",
                106,
                &summary,
            )
            .is_err()
        );
    }
}
