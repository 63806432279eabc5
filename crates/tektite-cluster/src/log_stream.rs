//! Leader-side append and member-side consume of the replicated log.
//!
//! [`LogPublisher`] frames [`LogRecord`]s onto the log channel and reports
//! the post-append position, or back-pressure for the caller to retry on a
//! later tick. [`LogAdapter`] consumes the stream in order and can merge an
//! archive replay ahead of the live subscription: while a replay leg is
//! attached it is drained first, and once detached the live leg is consumed
//! with already-delivered frames dropped by position.

use bytes::Bytes;
use tektite_types::{
    ClusterSessionId, CorrelationId, LeadershipTermId, LogPosition, MemberId,
};
use tektite_transport::{Offer, Publication, Subscription, TransportError};
use tektite_wire::{ChangeType, CloseReason, ClusterAction, LogRecord};

use crate::error::ClusterResult;
use crate::sessions::ClusterSession;

// ============================================================================
// Log Publisher
// ============================================================================

/// The leader's append end of the replicated log.
pub struct LogPublisher {
    publication: Box<dyn Publication>,
}

impl LogPublisher {
    pub fn new(publication: Box<dyn Publication>) -> Self {
        Self { publication }
    }

    /// Position after everything appended so far.
    pub fn position(&self) -> LogPosition {
        self.publication.position()
    }

    /// Session id of the log publication's image, announced to followers in
    /// `NewLeadershipTerm`.
    pub fn session_id(&self) -> i32 {
        self.publication.session_id()
    }

    pub fn close(&mut self) {
        self.publication.close();
    }

    /// Appends one record; `None` means back-pressure, retry next tick.
    fn append(&mut self, record: &LogRecord) -> ClusterResult<Option<LogPosition>> {
        let bytes = tektite_wire::encode(record)?;
        match self.publication.offer(&bytes) {
            Offer::Position(position) => Ok(Some(position)),
            Offer::BackPressured | Offer::NotConnected => Ok(None),
            Offer::Closed => Err(TransportError::Closed.into()),
        }
    }

    pub fn append_session_open(
        &mut self,
        session: &ClusterSession,
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::SessionOpen {
            leadership_term_id,
            cluster_session_id: session.id,
            correlation_id: session.correlation_id,
            timestamp_ms,
            response_stream_id: session.response_stream_id,
            response_channel: session.response_channel.clone(),
            encoded_principal: session.encoded_principal.clone(),
        })
    }

    pub fn append_session_close(
        &mut self,
        cluster_session_id: ClusterSessionId,
        close_reason: CloseReason,
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::SessionClose {
            leadership_term_id,
            cluster_session_id,
            timestamp_ms,
            close_reason,
        })
    }

    pub fn append_session_message(
        &mut self,
        cluster_session_id: ClusterSessionId,
        payload: Bytes,
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::SessionMessage {
            leadership_term_id,
            cluster_session_id,
            timestamp_ms,
            payload,
        })
    }

    pub fn append_timer_event(
        &mut self,
        correlation_id: CorrelationId,
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::TimerEvent {
            leadership_term_id,
            correlation_id,
            timestamp_ms,
        })
    }

    pub fn append_cluster_action(
        &mut self,
        action: ClusterAction,
        leadership_term_id: LeadershipTermId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::ClusterAction {
            leadership_term_id,
            timestamp_ms,
            action,
        })
    }

    pub fn append_new_leadership_term_event(
        &mut self,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        leader_member_id: MemberId,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        let log_session_id = self.session_id();
        self.append(&LogRecord::NewLeadershipTermEvent {
            leadership_term_id,
            timestamp_ms,
            term_base_log_position,
            leader_member_id,
            log_session_id,
        })
    }

    pub fn append_membership_change(
        &mut self,
        leadership_term_id: LeadershipTermId,
        leader_member_id: MemberId,
        change_type: ChangeType,
        member_id: MemberId,
        members: String,
        timestamp_ms: i64,
    ) -> ClusterResult<Option<LogPosition>> {
        self.append(&LogRecord::MembershipChange {
            leadership_term_id,
            timestamp_ms,
            leader_member_id,
            change_type,
            member_id,
            members,
        })
    }
}

// ============================================================================
// Log Adapter
// ============================================================================

struct ReplayLeg {
    subscription: Box<dyn Subscription>,
    replay_session_id: i64,
}

/// In-order consumer of the replicated log for one member.
pub struct LogAdapter {
    live: Box<dyn Subscription>,
    replay: Option<ReplayLeg>,
    /// Position up to which records have been delivered; frames at or below
    /// it are duplicates from a replay/live overlap and are dropped.
    next_position: LogPosition,
}

impl LogAdapter {
    pub fn new(live: Box<dyn Subscription>, start_position: LogPosition) -> Self {
        Self {
            live,
            replay: None,
            next_position: start_position,
        }
    }

    /// Position consumed so far: the member's appended position.
    pub fn position(&self) -> LogPosition {
        self.next_position
    }

    /// Raises the delivered watermark past records applied out of band, as
    /// a leader does for records it processes inline at append.
    pub fn advance_to(&mut self, position: LogPosition) {
        self.next_position = self.next_position.max(position);
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Attaches a replay leg that is drained ahead of the live stream.
    pub fn begin_replay(&mut self, subscription: Box<dyn Subscription>, replay_session_id: i64) {
        self.replay = Some(ReplayLeg {
            subscription,
            replay_session_id,
        });
    }

    /// Detaches the replay leg; returns its replay session id for the
    /// caller to stop at the archive.
    pub fn end_replay(&mut self) -> Option<i64> {
        self.replay.take().map(|mut leg| {
            leg.subscription.close();
            leg.replay_session_id
        })
    }

    /// Polls up to `limit` records, replay leg first.
    pub fn poll(&mut self, limit: usize) -> ClusterResult<Vec<(LogPosition, LogRecord)>> {
        let fragments = match &mut self.replay {
            Some(leg) => leg.subscription.poll(limit),
            None => self.live.poll(limit),
        };

        let mut records = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            if fragment.position <= self.next_position {
                continue;
            }
            let record: LogRecord = tektite_wire::decode(&fragment.payload)?;
            self.next_position = fragment.position;
            records.push((fragment.position, record));
        }
        Ok(records)
    }

    pub fn close(&mut self) {
        self.end_replay();
        self.live.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tektite_transport::memory::MemoryHub;
    use tektite_transport::{Archive, Media};

    const LOG_CHANNEL: &str = "tek:mem?endpoint=cluster-log";
    const CATCHUP_CHANNEL: &str = "tek:mem?endpoint=node1-log";
    const STREAM: i32 = 100;

    fn term() -> LeadershipTermId {
        LeadershipTermId::new(0)
    }

    #[test]
    fn publish_and_consume_in_order() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let live = media.add_subscription(LOG_CHANNEL, STREAM).expect("sub");
        let publication = media.add_publication(LOG_CHANNEL, STREAM).expect("pub");

        let mut publisher = LogPublisher::new(publication);
        let mut adapter = LogAdapter::new(live, LogPosition::ZERO);

        let p1 = publisher
            .append_timer_event(CorrelationId::new(1), term(), 10)
            .expect("append")
            .expect("granted");
        let p2 = publisher
            .append_session_message(ClusterSessionId::new(0), Bytes::from_static(b"m"), term(), 11)
            .expect("append")
            .expect("granted");
        assert!(p2 > p1);
        assert_eq!(publisher.position(), p2);

        let records = adapter.poll(10).expect("poll");
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].1, LogRecord::TimerEvent { .. }));
        assert!(matches!(records[1].1, LogRecord::SessionMessage { .. }));
        assert_eq!(records[0].0, p1);
        assert_eq!(adapter.position(), p2);
    }

    #[test]
    fn back_pressure_returns_none() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let publication = media.add_publication(LOG_CHANNEL, STREAM).expect("pub");
        hub.push_back_pressure(LOG_CHANNEL, STREAM, 1);

        let mut publisher = LogPublisher::new(publication);
        let first = publisher
            .append_timer_event(CorrelationId::new(1), term(), 10)
            .expect("append");
        assert!(first.is_none());
        let second = publisher
            .append_timer_event(CorrelationId::new(1), term(), 10)
            .expect("append");
        assert!(second.is_some());
    }

    #[test]
    fn replay_then_live_switch_drops_overlap() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let mut archive = hub.archive();

        let recording_id = archive.start_recording(LOG_CHANNEL, STREAM).expect("rec");
        let publication = media.add_publication(LOG_CHANNEL, STREAM).expect("pub");
        let mut publisher = LogPublisher::new(publication);

        // Three records appended before the late member subscribes.
        for i in 0..3 {
            publisher
                .append_timer_event(CorrelationId::new(i), term(), i)
                .expect("append")
                .expect("granted");
        }
        hub.do_work();

        // The late member attaches live (missing the history) and merges a
        // replay of the recording ahead of it.
        let live = media.add_subscription(LOG_CHANNEL, STREAM).expect("live");
        let mut adapter = LogAdapter::new(live, LogPosition::ZERO);

        let replay_sub = media
            .add_subscription(CATCHUP_CHANNEL, STREAM)
            .expect("replay sub");
        let replay_id = archive
            .start_replay(recording_id, LogPosition::ZERO, None, CATCHUP_CHANNEL, STREAM)
            .expect("replay");
        adapter.begin_replay(replay_sub, replay_id);

        // One more record lands while catching up; the replay follows the
        // live recording, so the adapter sees it on the replay leg too.
        publisher
            .append_timer_event(CorrelationId::new(3), term(), 3)
            .expect("append")
            .expect("granted");
        hub.do_work();
        hub.do_work();

        let mut delivered = Vec::new();
        for _ in 0..4 {
            delivered.extend(adapter.poll(10).expect("poll"));
            hub.do_work();
        }
        assert_eq!(delivered.len(), 4);

        // Switch to live: the backlog duplicates everything already
        // delivered and must be dropped by position.
        let replay_session = adapter.end_replay().expect("replay leg");
        archive.stop_replay(replay_session).expect("stop replay");
        assert!(adapter.poll(10).expect("poll").is_empty());

        // New live traffic flows normally after the switch.
        publisher
            .append_timer_event(CorrelationId::new(4), term(), 4)
            .expect("append")
            .expect("granted");
        let records = adapter.poll(10).expect("poll");
        assert_eq!(records.len(), 1);
    }
}
