//! The stream-recording archive interface.
//!
//! The archive records channels to durable storage and replays recorded
//! ranges back onto channels. The consensus module uses it for the
//! replicated log, snapshots, and dynamic-join bootstrap.

use tektite_types::{LogPosition, RecordingId};

use crate::TransportError;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by an archive implementation.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// No recording with that id. Fatal for operations that name one.
    #[error("unknown recording {0}")]
    UnknownRecording(RecordingId),

    /// The recording stopped while still depended upon.
    #[error("recording {0} has stopped")]
    RecordingStopped(RecordingId),

    #[error("replay range [{start}, {stop:?}) is outside recording {recording_id}")]
    InvalidReplayRange {
        recording_id: RecordingId,
        start: LogPosition,
        stop: Option<LogPosition>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Recording Extent
// ============================================================================

/// The recorded extent of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingExtent {
    pub recording_id: RecordingId,
    pub start_position: LogPosition,
    /// `None` while the recording is still active.
    pub stop_position: Option<LogPosition>,
    pub channel: String,
    pub stream_id: i32,
    pub session_id: i32,
}

// ============================================================================
// Archive Trait
// ============================================================================

/// Client handle onto the archive service.
pub trait Archive {
    /// Starts recording a channel; the recording begins at the publication's
    /// current position.
    fn start_recording(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<RecordingId, ArchiveError>;

    /// Resumes recording an existing recording id on a channel.
    fn extend_recording(
        &mut self,
        recording_id: RecordingId,
        channel: &str,
        stream_id: i32,
    ) -> Result<(), ArchiveError>;

    fn stop_recording(&mut self, recording_id: RecordingId) -> Result<(), ArchiveError>;

    /// Replays `[position, position + length)` of a recording onto a
    /// destination channel. `length = None` replays to the recorded end and
    /// then follows a live recording. Returns the replay session id.
    fn start_replay(
        &mut self,
        recording_id: RecordingId,
        position: LogPosition,
        length: Option<u64>,
        channel: &str,
        stream_id: i32,
    ) -> Result<i64, ArchiveError>;

    /// Stops a replay previously started with [`Archive::start_replay`].
    fn stop_replay(&mut self, replay_session_id: i64) -> Result<(), ArchiveError>;

    fn truncate_recording(
        &mut self,
        recording_id: RecordingId,
        position: LogPosition,
    ) -> Result<(), ArchiveError>;

    /// Highest recorded position, or the final position of a stopped
    /// recording.
    fn stop_position(&mut self, recording_id: RecordingId) -> Result<LogPosition, ArchiveError>;

    fn list_recording(&mut self, recording_id: RecordingId)
    -> Result<RecordingExtent, ArchiveError>;
}
