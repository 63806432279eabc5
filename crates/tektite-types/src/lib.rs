//! # tektite-types: Core types for `Tektite`
//!
//! Shared identifier and position types used across the cluster:
//! - Member identity ([`MemberId`])
//! - Leadership terms ([`LeadershipTermId`])
//! - Log positions ([`LogPosition`], [`FRAME_ALIGNMENT`])
//! - Client sessions ([`ClusterSessionId`])
//! - Timers and admin requests ([`CorrelationId`])
//! - Archive recordings ([`RecordingId`])
//! - Hosted services ([`ServiceId`])
//!
//! All ids are copy-cheap newtypes over small integers. Null sentinels are
//! expressed as associated constants rather than `Option` where the wire
//! format carries them inline.

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Member Identity
// ============================================================================

/// Stable identity of a cluster member.
///
/// Members are identified by a small integer assigned at configuration time
/// (static members) or by the leader when a dynamic joiner is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(u32);

impl MemberId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MemberId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<MemberId> for u32 {
    fn from(id: MemberId) -> Self {
        id.0
    }
}

// ============================================================================
// Leadership Term
// ============================================================================

/// Monotone identifier of a leadership term.
///
/// `NONE` (-1) denotes the state before the first election. Term ids never
/// decrease on any single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeadershipTermId(i64);

impl LeadershipTermId {
    /// No term has been established yet.
    pub const NONE: LeadershipTermId = LeadershipTermId(-1);

    /// The first term after a cold start.
    pub const INITIAL: LeadershipTermId = LeadershipTermId(0);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// The term that succeeds this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for LeadershipTermId {
    fn default() -> Self {
        LeadershipTermId::NONE
    }
}

impl Display for LeadershipTermId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LeadershipTermId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<LeadershipTermId> for i64 {
    fn from(id: LeadershipTermId) -> Self {
        id.0
    }
}

// ============================================================================
// Log Position
// ============================================================================

/// Alignment of every frame in the replicated log stream, in bytes.
///
/// Appended record lengths are rounded up to this boundary, so log positions
/// are always multiples of it.
pub const FRAME_ALIGNMENT: u64 = 32;

/// Length of the framing header preceding every log record, in bytes.
pub const HEADER_LENGTH: u64 = 32;

/// Byte offset into the logical replicated stream.
///
/// Positions are non-decreasing 64-bit offsets aligned to
/// [`FRAME_ALIGNMENT`]. They are comparable across members within a term.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogPosition(u64);

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition(0);

    pub fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rounds a payload length up to the aligned frame length it occupies
    /// in the stream, header included.
    pub fn aligned_frame_length(payload_length: usize) -> u64 {
        let total = HEADER_LENGTH + payload_length as u64;
        (total + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
    }

    /// Position advanced by one frame carrying `payload_length` bytes.
    pub fn after_frame(self, payload_length: usize) -> Self {
        Self(self.0 + Self::aligned_frame_length(payload_length))
    }

    pub fn is_aligned(self) -> bool {
        self.0 % FRAME_ALIGNMENT == 0
    }
}

impl Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for LogPosition {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for LogPosition {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for LogPosition {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl From<u64> for LogPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogPosition> for u64 {
    fn from(position: LogPosition) -> Self {
        position.0
    }
}

// ============================================================================
// Cluster Session
// ============================================================================

/// Identifier of a client session with the cluster.
///
/// Leader-allocated sessions count upward from zero. Pseudo-sessions for
/// service-originated messages count downward from -1 so the two spaces
/// never collide.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusterSessionId(i64);

impl ClusterSessionId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// True for service-originated pseudo-sessions.
    pub fn is_service_session(self) -> bool {
        self.0 < 0
    }
}

impl Display for ClusterSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

impl From<i64> for ClusterSessionId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<ClusterSessionId> for i64 {
    fn from(id: ClusterSessionId) -> Self {
        id.0
    }
}

// ============================================================================
// Correlation Id
// ============================================================================

/// Correlates asynchronous request/response pairs and keys scheduled timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(i64);

impl CorrelationId {
    pub const NONE: CorrelationId = CorrelationId(-1);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CorrelationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Recording Id
// ============================================================================

/// Identity of a durable stream recording in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordingId(i64);

impl RecordingId {
    pub const NONE: RecordingId = RecordingId(-1);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Display for RecordingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordingId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Service Id
// ============================================================================

/// Identity of a hosted state-machine service.
///
/// Hosted services are numbered `0..service_count`. The consensus module
/// itself snapshots under [`ServiceId::CONSENSUS_MODULE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(i32);

impl ServiceId {
    /// The consensus module's own snapshot stream.
    pub const CONSENSUS_MODULE: ServiceId = ServiceId(-1);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_consensus_module(self) -> bool {
        self.0 < 0
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ServiceId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_term_ordering_and_next() {
        assert!(LeadershipTermId::NONE < LeadershipTermId::INITIAL);
        assert_eq!(LeadershipTermId::NONE.next(), LeadershipTermId::INITIAL);
        assert_eq!(LeadershipTermId::new(6).next(), LeadershipTermId::new(7));
        assert!(LeadershipTermId::NONE.is_none());
        assert!(!LeadershipTermId::INITIAL.is_none());
    }

    #[test]
    fn frame_lengths_are_aligned() {
        // Header alone occupies one alignment unit.
        assert_eq!(LogPosition::aligned_frame_length(0), 32);
        // 4-byte payload pushes past the boundary into a second unit.
        assert_eq!(LogPosition::aligned_frame_length(4), 64);
        assert_eq!(LogPosition::aligned_frame_length(32), 64);
        assert_eq!(LogPosition::aligned_frame_length(33), 96);

        let p = LogPosition::ZERO.after_frame(100);
        assert!(p.is_aligned());
        assert_eq!(p, LogPosition::new(160));
    }

    #[test]
    fn session_id_spaces_do_not_collide() {
        assert!(!ClusterSessionId::new(0).is_service_session());
        assert!(!ClusterSessionId::new(41).is_service_session());
        assert!(ClusterSessionId::new(-1).is_service_session());
    }

    #[test]
    fn null_sentinels() {
        assert!(CorrelationId::NONE.is_none());
        assert!(RecordingId::NONE.is_none());
        assert!(ServiceId::CONSENSUS_MODULE.is_consensus_module());
        assert!(!ServiceId::new(0).is_consensus_module());
    }
}
