//! In-memory media driver and archive.
//!
//! A [`MemoryHub`] is a single-threaded, in-process stand-in for the media
//! driver and archive service, shared by every member of a test cluster.
//! Topics are keyed by channel routing identity and stream id; each
//! subscription keeps its own cursor from the point it attached, matching
//! the live-stream semantics of a real driver (history before attach is only
//! reachable through archive replay).
//!
//! Recordings and replays progress when [`MemoryHub::do_work`] is invoked,
//! mirroring an agent-invoker-driven archive client. Replays re-deliver
//! fragments with their original stream positions so consumers can merge a
//! replay ahead of the live stream and de-duplicate by position.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tektite_types::{LogPosition, RecordingId};

use crate::{
    Archive, ArchiveError, ChannelUri, Fragment, Media, Offer, Publication, RecordingExtent,
    Subscription, TransportError,
};

/// Fragments a replay moves per [`MemoryHub::do_work`] invocation.
const REPLAY_BATCH: usize = 8;

// ============================================================================
// Hub State
// ============================================================================

#[derive(Debug, Default)]
struct Topic {
    frames: Vec<Fragment>,
    position: LogPosition,
    /// Stream position before the first retained frame.
    origin: LogPosition,
    subscriber_count: usize,
    /// Offers to refuse with back-pressure before accepting again.
    back_pressure_budget: usize,
}

#[derive(Debug)]
struct Recording {
    key: TopicKey,
    channel: String,
    stream_id: i32,
    session_id: i32,
    start_position: LogPosition,
    recorded_position: LogPosition,
    data: Vec<Fragment>,
    cursor: usize,
    stopped: bool,
}

#[derive(Debug)]
struct Replay {
    session_id: i64,
    recording_id: RecordingId,
    destination: TopicKey,
    next_index: usize,
    /// Exclusive stop; `None` follows the live recording.
    stop_position: Option<LogPosition>,
    done: bool,
}

type TopicKey = (String, i32);

#[derive(Debug, Default)]
struct HubState {
    topics: HashMap<TopicKey, Topic>,
    recordings: HashMap<RecordingId, Recording>,
    replays: Vec<Replay>,
    next_session_id: i32,
    next_recording_id: i64,
    next_correlation_id: i64,
}

impl HubState {
    fn topic_key(channel: &str, stream_id: i32) -> Result<TopicKey, TransportError> {
        let uri = ChannelUri::parse(channel)?;
        Ok((uri.routing_key(), stream_id))
    }

    fn topic(&mut self, key: &TopicKey) -> &mut Topic {
        self.topics.entry(key.clone()).or_default()
    }
}

// ============================================================================
// MemoryHub
// ============================================================================

/// Shared in-memory media driver and archive backing store.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Rc<RefCell<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A media client handle onto this hub.
    pub fn media(&self) -> MemoryMedia {
        MemoryMedia { hub: self.clone() }
    }

    /// An archive client handle onto this hub.
    pub fn archive(&self) -> MemoryArchive {
        MemoryArchive { hub: self.clone() }
    }

    /// Makes the next `count` offers on a channel fail with back-pressure.
    pub fn push_back_pressure(&self, channel: &str, stream_id: i32, count: usize) {
        let key = HubState::topic_key(channel, stream_id).expect("valid channel");
        let mut state = self.state.borrow_mut();
        state.topic(&key).back_pressure_budget += count;
    }

    /// Pumps recordings and replays; returns units of work done.
    pub fn do_work(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let mut work = 0;

        // Copy newly published frames into active recordings.
        let mut recorded: Vec<(RecordingId, Fragment)> = Vec::new();
        for (id, recording) in &mut state.recordings {
            if recording.stopped {
                continue;
            }
            if let Some(topic) = state.topics.get(&recording.key) {
                while recording.cursor < topic.frames.len() {
                    let fragment = topic.frames[recording.cursor].clone();
                    recording.cursor += 1;
                    recording.recorded_position = fragment.position;
                    recorded.push((*id, fragment));
                    work += 1;
                }
            }
        }
        for (id, fragment) in recorded {
            if let Some(recording) = state.recordings.get_mut(&id) {
                recording.data.push(fragment);
            }
        }

        // Move replayed fragments onto their destinations.
        let mut deliveries: Vec<(TopicKey, Fragment)> = Vec::new();
        let mut replays = std::mem::take(&mut state.replays);
        for replay in &mut replays {
            if replay.done {
                continue;
            }
            let Some(recording) = state.recordings.get(&replay.recording_id) else {
                replay.done = true;
                continue;
            };
            let mut moved = 0;
            while moved < REPLAY_BATCH && replay.next_index < recording.data.len() {
                let fragment = recording.data[replay.next_index].clone();
                if let Some(stop) = replay.stop_position {
                    if fragment.position > stop {
                        replay.done = true;
                        break;
                    }
                }
                replay.next_index += 1;
                moved += 1;
                deliveries.push((replay.destination.clone(), fragment));
            }
            work += moved;
            // A bounded replay finishes at its stop position; an unbounded
            // one finishes only when the recording stops and is drained.
            if replay.next_index >= recording.data.len() {
                match replay.stop_position {
                    Some(stop) if recording.recorded_position >= stop => replay.done = true,
                    None if recording.stopped => replay.done = true,
                    _ => {}
                }
            }
        }
        state.replays = replays;
        for (key, fragment) in deliveries {
            let topic = state.topic(&key);
            topic.position = fragment.position.max(topic.position);
            topic.frames.push(fragment);
        }

        work
    }
}

// ============================================================================
// Media Client
// ============================================================================

/// Media client handle for one member.
#[derive(Debug, Clone)]
pub struct MemoryMedia {
    hub: MemoryHub,
}

impl Media for MemoryMedia {
    fn add_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Publication>, TransportError> {
        let key = HubState::topic_key(channel, stream_id)?;
        let uri = ChannelUri::parse(channel)?;
        let term_offset = uri
            .get_int(crate::TERM_OFFSET_PARAM)
            .map_err(TransportError::InvalidChannel)?;
        let session_id = {
            let mut state = self.hub.state.borrow_mut();
            let topic = state.topic(&key);
            // A term-offset seeds a fresh topic at a logical stream position,
            // as when a restarted leader resumes the log past a snapshot.
            if let Some(offset) = term_offset {
                if topic.frames.is_empty() && topic.position == LogPosition::ZERO {
                    topic.position = LogPosition::new(offset as u64);
                    topic.origin = topic.position;
                }
            }
            state.next_session_id += 1;
            state.next_session_id
        };
        Ok(Box::new(MemoryPublication {
            hub: self.hub.clone(),
            key,
            channel: channel.to_string(),
            stream_id,
            session_id,
            closed: false,
        }))
    }

    fn add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Publication>, TransportError> {
        // Every in-memory publication already has a private image.
        self.add_publication(channel, stream_id)
    }

    fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let key = HubState::topic_key(channel, stream_id)?;
        let cursor = {
            let mut state = self.hub.state.borrow_mut();
            let topic = state.topic(&key);
            topic.subscriber_count += 1;
            topic.frames.len()
        };
        Ok(Box::new(MemorySubscription {
            hub: self.hub.clone(),
            key,
            channel: channel.to_string(),
            stream_id,
            cursor,
            position: LogPosition::ZERO,
            closed: false,
        }))
    }

    fn next_correlation_id(&mut self) -> i64 {
        let mut state = self.hub.state.borrow_mut();
        state.next_correlation_id += 1;
        state.next_correlation_id
    }

    fn do_work(&mut self) -> usize {
        self.hub.do_work()
    }
}

// ============================================================================
// Publication / Subscription
// ============================================================================

#[derive(Debug)]
struct MemoryPublication {
    hub: MemoryHub,
    key: TopicKey,
    channel: String,
    stream_id: i32,
    session_id: i32,
    closed: bool,
}

impl Publication for MemoryPublication {
    fn offer(&mut self, payload: &[u8]) -> Offer {
        if self.closed {
            return Offer::Closed;
        }
        let mut state = self.hub.state.borrow_mut();
        let topic = state.topic(&self.key);
        if topic.back_pressure_budget > 0 {
            topic.back_pressure_budget -= 1;
            return Offer::BackPressured;
        }
        let position = topic.position.after_frame(payload.len());
        topic.position = position;
        topic.frames.push(Fragment {
            session_id: self.session_id,
            position,
            payload: Bytes::copy_from_slice(payload),
        });
        Offer::Position(position)
    }

    fn position(&self) -> LogPosition {
        let state = self.hub.state.borrow();
        state
            .topics
            .get(&self.key)
            .map_or(LogPosition::ZERO, |t| t.position)
    }

    fn is_connected(&self) -> bool {
        let state = self.hub.state.borrow();
        state
            .topics
            .get(&self.key)
            .is_some_and(|t| t.subscriber_count > 0)
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug)]
struct MemorySubscription {
    hub: MemoryHub,
    key: TopicKey,
    channel: String,
    stream_id: i32,
    cursor: usize,
    position: LogPosition,
    closed: bool,
}

impl Subscription for MemorySubscription {
    fn poll(&mut self, limit: usize) -> Vec<Fragment> {
        if self.closed {
            return Vec::new();
        }
        let state = self.hub.state.borrow();
        let Some(topic) = state.topics.get(&self.key) else {
            return Vec::new();
        };
        let end = topic.frames.len().min(self.cursor + limit);
        let fragments: Vec<Fragment> = topic.frames[self.cursor..end].to_vec();
        self.cursor = end;
        if let Some(last) = fragments.last() {
            self.position = last.position;
        }
        fragments
    }

    fn image_count(&self) -> usize {
        let state = self.hub.state.borrow();
        let frames = state.topics.get(&self.key).map_or(0, |t| t.frames.len());
        usize::from(frames > self.cursor)
    }

    fn position(&self) -> LogPosition {
        self.position
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.hub.state.borrow_mut();
            let topic = state.topic(&self.key);
            topic.subscriber_count = topic.subscriber_count.saturating_sub(1);
        }
    }
}

// ============================================================================
// Archive Client
// ============================================================================

/// Archive client handle for one member.
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    hub: MemoryHub,
}

impl Archive for MemoryArchive {
    fn start_recording(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<RecordingId, ArchiveError> {
        let key = HubState::topic_key(channel, stream_id).map_err(ArchiveError::Transport)?;
        let mut state = self.hub.state.borrow_mut();
        let topic = state.topic(&key);
        // Recordings cover the topic's retained history from its origin, so
        // a recording started after joining can still serve replays of
        // earlier positions the stream retains.
        let cursor = 0;
        let start_position = topic.origin;
        state.next_recording_id += 1;
        let id = RecordingId::new(state.next_recording_id);
        state.recordings.insert(
            id,
            Recording {
                key,
                channel: channel.to_string(),
                stream_id,
                session_id: 0,
                start_position,
                recorded_position: start_position,
                data: Vec::new(),
                cursor,
                stopped: false,
            },
        );
        Ok(id)
    }

    fn extend_recording(
        &mut self,
        recording_id: RecordingId,
        channel: &str,
        stream_id: i32,
    ) -> Result<(), ArchiveError> {
        let key = HubState::topic_key(channel, stream_id).map_err(ArchiveError::Transport)?;
        let mut state = self.hub.state.borrow_mut();
        let cursor = state.topic(&key).frames.len();
        let recording = state
            .recordings
            .get_mut(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        recording.key = key;
        recording.channel = channel.to_string();
        recording.stream_id = stream_id;
        recording.cursor = cursor;
        recording.stopped = false;
        Ok(())
    }

    fn stop_recording(&mut self, recording_id: RecordingId) -> Result<(), ArchiveError> {
        self.hub.do_work();
        let mut state = self.hub.state.borrow_mut();
        let recording = state
            .recordings
            .get_mut(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        recording.stopped = true;
        Ok(())
    }

    fn start_replay(
        &mut self,
        recording_id: RecordingId,
        position: LogPosition,
        length: Option<u64>,
        channel: &str,
        stream_id: i32,
    ) -> Result<i64, ArchiveError> {
        let destination = HubState::topic_key(channel, stream_id).map_err(ArchiveError::Transport)?;
        self.hub.do_work();
        let mut state = self.hub.state.borrow_mut();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        if position < recording.start_position {
            return Err(ArchiveError::InvalidReplayRange {
                recording_id,
                start: position,
                stop: None,
            });
        }
        let stop_position = length.map(|l| LogPosition::new(position.as_u64() + l));
        let next_index = recording
            .data
            .iter()
            .position(|f| f.position > position)
            .unwrap_or(recording.data.len());

        state.next_correlation_id += 1;
        let session_id = state.next_correlation_id;
        state.replays.push(Replay {
            session_id,
            recording_id,
            destination,
            next_index,
            stop_position,
            done: false,
        });
        Ok(session_id)
    }

    fn stop_replay(&mut self, replay_session_id: i64) -> Result<(), ArchiveError> {
        let mut state = self.hub.state.borrow_mut();
        state.replays.retain(|r| r.session_id != replay_session_id);
        Ok(())
    }

    fn truncate_recording(
        &mut self,
        recording_id: RecordingId,
        position: LogPosition,
    ) -> Result<(), ArchiveError> {
        self.hub.do_work();
        let mut state = self.hub.state.borrow_mut();
        let recording = state
            .recordings
            .get_mut(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        recording.data.retain(|f| f.position <= position);
        recording.recorded_position = recording
            .data
            .last()
            .map_or(recording.start_position, |f| f.position);
        Ok(())
    }

    fn stop_position(&mut self, recording_id: RecordingId) -> Result<LogPosition, ArchiveError> {
        self.hub.do_work();
        let state = self.hub.state.borrow();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        Ok(recording.recorded_position)
    }

    fn list_recording(
        &mut self,
        recording_id: RecordingId,
    ) -> Result<RecordingExtent, ArchiveError> {
        self.hub.do_work();
        let state = self.hub.state.borrow();
        let recording = state
            .recordings
            .get(&recording_id)
            .ok_or(ArchiveError::UnknownRecording(recording_id))?;
        Ok(RecordingExtent {
            recording_id,
            start_position: recording.start_position,
            stop_position: recording.stopped.then_some(recording.recorded_position),
            channel: recording.channel.clone(),
            stream_id: recording.stream_id,
            session_id: recording.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_pair(channel: &str) -> (MemoryHub, Box<dyn Publication>, Box<dyn Subscription>) {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let sub = media.add_subscription(channel, 100).expect("sub");
        let publication = media.add_publication(channel, 100).expect("pub");
        (hub, publication, sub)
    }

    #[test]
    fn publication_to_subscription_round_trip() {
        let (_hub, mut publication, mut sub) = hub_pair("tek:mem?endpoint=a");

        assert!(publication.offer(b"hello").is_granted());
        assert!(publication.offer(b"world").is_granted());

        let fragments = sub.poll(10);
        assert_eq!(fragments.len(), 2);
        assert_eq!(&fragments[0].payload[..], b"hello");
        assert_eq!(&fragments[1].payload[..], b"world");
        // Positions are frame-aligned and strictly increasing.
        assert!(fragments[0].position < fragments[1].position);
        assert!(fragments[0].position.is_aligned());
    }

    #[test]
    fn subscription_attaches_at_live_edge() {
        let hub = MemoryHub::new();
        let mut media = hub.media();
        let mut publication = media.add_publication("tek:mem?endpoint=a", 1).expect("pub");
        assert!(publication.offer(b"early").is_granted());

        let mut sub = media.add_subscription("tek:mem?endpoint=a", 1).expect("sub");
        assert!(publication.offer(b"late").is_granted());

        let fragments = sub.poll(10);
        assert_eq!(fragments.len(), 1);
        assert_eq!(&fragments[0].payload[..], b"late");
    }

    #[test]
    fn back_pressure_injection_then_recovery() {
        let (hub, mut publication, mut sub) = hub_pair("tek:mem?endpoint=a");
        hub.push_back_pressure("tek:mem?endpoint=a", 100, 2);

        assert_eq!(publication.offer(b"x"), Offer::BackPressured);
        assert_eq!(publication.offer(b"x"), Offer::BackPressured);
        assert!(publication.offer(b"x").is_granted());
        assert_eq!(sub.poll(10).len(), 1);
    }

    #[test]
    fn record_and_replay_range() {
        let (hub, mut publication, _sub) = hub_pair("tek:mem?endpoint=log");
        let mut archive = hub.archive();

        let recording_id = archive
            .start_recording("tek:mem?endpoint=log", 100)
            .expect("record");
        let mut positions = Vec::new();
        for i in 0..5u8 {
            positions.push(publication.offer(&[i]).position().expect("granted"));
        }
        hub.do_work();
        assert_eq!(
            archive.stop_position(recording_id).expect("stop position"),
            positions[4]
        );

        // Replay everything onto a fresh destination.
        let mut media = hub.media();
        let mut dest = media
            .add_subscription("tek:mem?endpoint=replay-dest", 7)
            .expect("sub");
        archive
            .start_replay(
                recording_id,
                LogPosition::ZERO,
                None,
                "tek:mem?endpoint=replay-dest",
                7,
            )
            .expect("replay");
        archive.stop_recording(recording_id).expect("stop");
        for _ in 0..4 {
            hub.do_work();
        }

        let fragments = dest.poll(100);
        assert_eq!(fragments.len(), 5);
        // Replayed fragments carry their original positions.
        let replayed: Vec<_> = fragments.iter().map(|f| f.position).collect();
        assert_eq!(replayed, positions);
    }

    #[test]
    fn unknown_recording_is_an_error() {
        let hub = MemoryHub::new();
        let mut archive = hub.archive();
        assert!(matches!(
            archive.stop_position(RecordingId::new(99)),
            Err(ArchiveError::UnknownRecording(_))
        ));
    }
}
