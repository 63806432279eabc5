//! The recording log: an append-only index of term boundaries and
//! snapshots, and the source of recovery plans.
//!
//! Term entries are strictly increasing by leadership term id. Snapshots
//! group by `(leadership_term_id, log_position)`; a group is valid for
//! recovery only when every hosted service id plus the consensus module
//! contributed one.

use serde::{Deserialize, Serialize};
use tektite_types::{LeadershipTermId, LogPosition, RecordingId, ServiceId};
use tektite_wire::SnapshotMarkerSummary;

use crate::error::{ClusterError, ClusterResult};

// ============================================================================
// Entries
// ============================================================================

/// One entry of the recording log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    /// A leadership term recorded on the log channel.
    Term {
        leadership_term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        /// Closing position once the term was superseded.
        log_position: Option<LogPosition>,
        timestamp_ms: i64,
        recording_id: RecordingId,
    },

    /// A snapshot taken by one service (or the consensus module).
    Snapshot {
        leadership_term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        log_position: LogPosition,
        timestamp_ms: i64,
        service_id: ServiceId,
        recording_id: RecordingId,
    },
}

// ============================================================================
// Recovery Plan
// ============================================================================

/// The tail of the log to replay on recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRange {
    pub recording_id: RecordingId,
    pub leadership_term_id: LeadershipTermId,
    pub term_base_log_position: LogPosition,
    pub start_position: LogPosition,
    pub stop_position: LogPosition,
}

/// Latest-snapshot-plus-tail view used to restore state on start.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    pub last_leadership_term_id: LeadershipTermId,
    pub appended_log_position: LogPosition,
    /// Latest valid snapshot per service id, module included.
    pub snapshots: Vec<SnapshotMarkerSummary>,
    pub log: Option<ReplayRange>,
}

impl RecoveryPlan {
    /// True when the tail log range is non-empty.
    pub fn has_replay(&self) -> bool {
        self.log
            .as_ref()
            .is_some_and(|log| log.stop_position > log.start_position)
    }

    /// The module's own snapshot in the plan, if any.
    pub fn module_snapshot(&self) -> Option<&SnapshotMarkerSummary> {
        self.snapshots
            .iter()
            .find(|s| s.service_id.is_consensus_module())
    }

    /// The position state restarts from.
    pub fn start_position(&self) -> LogPosition {
        self.module_snapshot()
            .map_or(LogPosition::ZERO, |s| s.log_position)
    }
}

// ============================================================================
// Recording Log
// ============================================================================

/// Append-only index of terms and snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingLog {
    entries: Vec<Entry>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent term entry, if any.
    pub fn last_term(&self) -> Option<&Entry> {
        self.entries
            .iter()
            .rev()
            .find(|e| matches!(e, Entry::Term { .. }))
    }

    /// Appends a term entry; terms must strictly increase.
    pub fn append_term(
        &mut self,
        leadership_term_id: LeadershipTermId,
        term_base_log_position: LogPosition,
        timestamp_ms: i64,
        recording_id: RecordingId,
    ) -> ClusterResult<()> {
        if let Some(Entry::Term {
            leadership_term_id: last,
            ..
        }) = self.last_term()
        {
            if leadership_term_id <= *last {
                return Err(ClusterError::RecordingLog(format!(
                    "term {leadership_term_id} does not exceed recorded term {last}"
                )));
            }
        }
        self.entries.push(Entry::Term {
            leadership_term_id,
            term_base_log_position,
            log_position: None,
            timestamp_ms,
            recording_id,
        });
        Ok(())
    }

    /// Closes a term at the position the next term begins.
    pub fn commit_term_position(
        &mut self,
        leadership_term_id: LeadershipTermId,
        position: LogPosition,
    ) {
        for entry in self.entries.iter_mut().rev() {
            if let Entry::Term {
                leadership_term_id: id,
                log_position,
                ..
            } = entry
            {
                if *id == leadership_term_id {
                    *log_position = Some(position);
                    return;
                }
            }
        }
    }

    /// Appends a snapshot entry.
    pub fn append_snapshot(&mut self, snapshot: SnapshotMarkerSummary) {
        self.entries.push(Entry::Snapshot {
            leadership_term_id: snapshot.leadership_term_id,
            term_base_log_position: snapshot.term_base_log_position,
            log_position: snapshot.log_position,
            timestamp_ms: snapshot.timestamp_ms,
            service_id: snapshot.service_id,
            recording_id: snapshot.recording_id,
        });
    }

    /// Latest snapshot group valid for `service_count` services.
    ///
    /// A group is keyed by `(leadership_term_id, log_position)` and must
    /// contain every service id in `0..service_count` plus the module's own.
    pub fn latest_snapshot_group(&self, service_count: usize) -> Vec<SnapshotMarkerSummary> {
        let mut groups: Vec<(LeadershipTermId, LogPosition, Vec<SnapshotMarkerSummary>)> =
            Vec::new();
        for entry in &self.entries {
            if let Entry::Snapshot {
                leadership_term_id,
                term_base_log_position,
                log_position,
                timestamp_ms,
                service_id,
                recording_id,
            } = entry
            {
                let summary = SnapshotMarkerSummary {
                    leadership_term_id: *leadership_term_id,
                    term_base_log_position: *term_base_log_position,
                    log_position: *log_position,
                    timestamp_ms: *timestamp_ms,
                    service_id: *service_id,
                    recording_id: *recording_id,
                };
                match groups
                    .iter_mut()
                    .find(|(t, p, _)| *t == *leadership_term_id && *p == *log_position)
                {
                    Some((_, _, group)) => group.push(summary),
                    None => groups.push((*leadership_term_id, *log_position, vec![summary])),
                }
            }
        }

        groups
            .into_iter()
            .rev()
            .map(|(_, _, group)| group)
            .find(|group| {
                group.iter().any(|s| s.service_id.is_consensus_module())
                    && (0..service_count)
                        .all(|id| group.iter().any(|s| s.service_id == ServiceId::new(id as i32)))
            })
            .unwrap_or_default()
    }

    /// Derives the recovery plan: latest valid snapshot group plus the tail
    /// of the last recorded term beyond it.
    pub fn create_recovery_plan(
        &self,
        service_count: usize,
        mut recorded_stop_position: impl FnMut(RecordingId) -> Option<LogPosition>,
    ) -> RecoveryPlan {
        let snapshots = self.latest_snapshot_group(service_count);
        let snapshot_position = snapshots
            .iter()
            .find(|s| s.service_id.is_consensus_module())
            .map_or(LogPosition::ZERO, |s| s.log_position);

        let mut plan = RecoveryPlan {
            last_leadership_term_id: LeadershipTermId::NONE,
            appended_log_position: snapshot_position,
            snapshots,
            log: None,
        };

        if let Some(Entry::Term {
            leadership_term_id,
            term_base_log_position,
            log_position,
            recording_id,
            ..
        }) = self.last_term()
        {
            plan.last_leadership_term_id = *leadership_term_id;
            let stop_position = match log_position {
                Some(position) => *position,
                None => recorded_stop_position(*recording_id).unwrap_or(snapshot_position),
            };
            plan.appended_log_position = stop_position.max(snapshot_position);
            if stop_position > snapshot_position {
                plan.log = Some(ReplayRange {
                    recording_id: *recording_id,
                    leadership_term_id: *leadership_term_id,
                    term_base_log_position: *term_base_log_position,
                    start_position: snapshot_position.max(*term_base_log_position),
                    stop_position,
                });
            }
        }

        plan
    }

    /// Canonical byte form, for carrying across restarts.
    pub fn encode(&self) -> ClusterResult<Vec<u8>> {
        Ok(tektite_wire::encode(self)?.to_vec())
    }

    pub fn decode(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(tektite_wire::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(
        term: i64,
        position: u64,
        service_id: i32,
        recording_id: i64,
    ) -> SnapshotMarkerSummary {
        SnapshotMarkerSummary {
            leadership_term_id: LeadershipTermId::new(term),
            term_base_log_position: LogPosition::ZERO,
            log_position: LogPosition::new(position),
            timestamp_ms: 0,
            service_id: ServiceId::new(service_id),
            recording_id: RecordingId::new(recording_id),
        }
    }

    fn module_snapshot(term: i64, position: u64, recording_id: i64) -> SnapshotMarkerSummary {
        SnapshotMarkerSummary {
            service_id: ServiceId::CONSENSUS_MODULE,
            ..snapshot(term, position, 0, recording_id)
        }
    }

    #[test]
    fn terms_must_strictly_increase() {
        let mut log = RecordingLog::new();
        log.append_term(
            LeadershipTermId::new(0),
            LogPosition::ZERO,
            0,
            RecordingId::new(1),
        )
        .expect("first term");
        log.append_term(
            LeadershipTermId::new(2),
            LogPosition::new(64),
            5,
            RecordingId::new(1),
        )
        .expect("skipping ahead is allowed");

        assert!(
            log.append_term(
                LeadershipTermId::new(2),
                LogPosition::new(64),
                6,
                RecordingId::new(1),
            )
            .is_err()
        );
        assert!(
            log.append_term(
                LeadershipTermId::new(1),
                LogPosition::new(64),
                7,
                RecordingId::new(1),
            )
            .is_err()
        );
    }

    #[test]
    fn snapshot_group_requires_all_services_and_module() {
        let mut log = RecordingLog::new();
        log.append_snapshot(module_snapshot(0, 128, 10));
        log.append_snapshot(snapshot(0, 128, 0, 11));
        // Second service's snapshot at that position is missing.
        assert!(log.latest_snapshot_group(2).is_empty());

        log.append_snapshot(snapshot(0, 128, 1, 12));
        assert_eq!(log.latest_snapshot_group(2).len(), 3);
    }

    #[test]
    fn latest_complete_group_wins_over_newer_incomplete() {
        let mut log = RecordingLog::new();
        log.append_snapshot(module_snapshot(0, 128, 10));
        log.append_snapshot(snapshot(0, 128, 0, 11));
        // Newer snapshot attempt that never completed.
        log.append_snapshot(snapshot(1, 512, 0, 20));

        let group = log.latest_snapshot_group(1);
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].log_position, LogPosition::new(128));
    }

    #[test]
    fn recovery_plan_without_snapshot_replays_whole_term() {
        let mut log = RecordingLog::new();
        log.append_term(
            LeadershipTermId::new(0),
            LogPosition::ZERO,
            0,
            RecordingId::new(1),
        )
        .expect("term");

        let plan = log.create_recovery_plan(1, |_| Some(LogPosition::new(640)));
        assert_eq!(plan.last_leadership_term_id, LeadershipTermId::new(0));
        assert_eq!(plan.appended_log_position, LogPosition::new(640));
        assert!(plan.has_replay());
        let range = plan.log.expect("replay range");
        assert_eq!(range.start_position, LogPosition::ZERO);
        assert_eq!(range.stop_position, LogPosition::new(640));
    }

    #[test]
    fn recovery_plan_with_snapshot_replays_only_the_tail() {
        let mut log = RecordingLog::new();
        log.append_term(
            LeadershipTermId::new(0),
            LogPosition::ZERO,
            0,
            RecordingId::new(1),
        )
        .expect("term");
        log.append_snapshot(module_snapshot(0, 256, 10));
        log.append_snapshot(snapshot(0, 256, 0, 11));

        let plan = log.create_recovery_plan(1, |_| Some(LogPosition::new(640)));
        assert_eq!(plan.start_position(), LogPosition::new(256));
        let range = plan.log.as_ref().expect("replay range");
        assert_eq!(range.start_position, LogPosition::new(256));
        assert!(plan.has_replay());

        // Snapshot exactly at the recorded end: nothing to replay.
        let plan = log.create_recovery_plan(1, |_| Some(LogPosition::new(256)));
        assert!(!plan.has_replay());
    }

    #[test]
    fn commit_term_position_closes_the_term() {
        let mut log = RecordingLog::new();
        log.append_term(
            LeadershipTermId::new(0),
            LogPosition::ZERO,
            0,
            RecordingId::new(1),
        )
        .expect("term");
        log.commit_term_position(LeadershipTermId::new(0), LogPosition::new(96));

        let plan = log.create_recovery_plan(1, |_| None);
        assert_eq!(plan.appended_log_position, LogPosition::new(96));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut log = RecordingLog::new();
        log.append_term(
            LeadershipTermId::new(3),
            LogPosition::new(64),
            17,
            RecordingId::new(2),
        )
        .expect("term");
        log.append_snapshot(module_snapshot(3, 128, 9));

        let decoded = RecordingLog::decode(&log.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.entries(), log.entries());
    }
}
