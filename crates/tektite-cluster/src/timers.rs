//! Deadline-ordered timer service.
//!
//! Timers are keyed by correlation id over a min-heap ordered by
//! `(deadline, insertion sequence)`, so equal deadlines fire in insertion
//! order. A fired timer leaves a pending-expiration count behind: a
//! `schedule` arriving after the fire consumes that count instead of
//! installing, which keeps replayed schedule/fire pairs idempotent across
//! snapshot restore.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tektite_types::CorrelationId;

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline_ms: i64,
    seq: u64,
    correlation_id: CorrelationId,
}

/// Deadline-ordered wheel of correlation id → fire time.
#[derive(Debug, Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    /// Live deadline per correlation id; entries in the heap that disagree
    /// are stale and skipped on poll.
    deadlines: HashMap<CorrelationId, (i64, u64)>,
    /// Expirations delivered but not yet re-armed, per correlation id.
    fired_counts: HashMap<CorrelationId, usize>,
    next_seq: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules (or reschedules) a timer.
    ///
    /// If the timer has fired and not been re-armed since, the pending
    /// expiration is consumed instead and nothing is installed.
    pub fn schedule(&mut self, correlation_id: CorrelationId, deadline_ms: i64) {
        if let Some(count) = self.fired_counts.get_mut(&correlation_id) {
            *count -= 1;
            if *count == 0 {
                self.fired_counts.remove(&correlation_id);
            }
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.deadlines.insert(correlation_id, (deadline_ms, seq));
        self.heap.push(Reverse(TimerEntry {
            deadline_ms,
            seq,
            correlation_id,
        }));
    }

    /// Cancels a timer; true if it was scheduled.
    pub fn cancel(&mut self, correlation_id: CorrelationId) -> bool {
        self.deadlines.remove(&correlation_id).is_some()
    }

    /// Fires all due timers into `sink`, in deadline-then-insertion order.
    ///
    /// The sink returns false on back-pressure; the due timer is then kept
    /// at the head so no reordering occurs, and polling stops for this tick.
    /// Returns the number fired.
    pub fn poll(&mut self, now_ms: i64, mut sink: impl FnMut(CorrelationId) -> bool) -> usize {
        let mut fired = 0;
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.deadline_ms > now_ms {
                break;
            }
            match self.deadlines.get(&entry.correlation_id) {
                // Stale heap entry from a cancel or reschedule.
                Some(&(deadline, seq)) if deadline != entry.deadline_ms || seq != entry.seq => {
                    self.heap.pop();
                }
                None => {
                    self.heap.pop();
                }
                Some(_) => {
                    if !sink(entry.correlation_id) {
                        break;
                    }
                    self.heap.pop();
                    self.deadlines.remove(&entry.correlation_id);
                    *self.fired_counts.entry(entry.correlation_id).or_insert(0) += 1;
                    fired += 1;
                }
            }
        }
        fired
    }

    /// Notes a timer fire delivered by the replicated log.
    ///
    /// A locally scheduled copy is cancelled; a fire with no local schedule
    /// leaves a pending-expiration count so the schedule that produced it,
    /// arriving later in replay, pairs up instead of installing.
    pub fn on_fire_replayed(&mut self, correlation_id: CorrelationId) {
        if !self.cancel(correlation_id) {
            *self.fired_counts.entry(correlation_id).or_insert(0) += 1;
        }
    }

    /// Live `(correlation_id, deadline)` pairs, for snapshotting.
    pub fn entries(&self) -> impl Iterator<Item = (CorrelationId, i64)> + '_ {
        self.deadlines
            .iter()
            .map(|(&id, &(deadline, _))| (id, deadline))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> CorrelationId {
        CorrelationId::new(n)
    }

    fn drain(timers: &mut TimerService, now_ms: i64) -> Vec<CorrelationId> {
        let mut fired = Vec::new();
        timers.poll(now_ms, |cid| {
            fired.push(cid);
            true
        });
        fired
    }

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let mut timers = TimerService::new();
        timers.schedule(id(1), 100);
        timers.schedule(id(2), 50);
        timers.schedule(id(3), 100);

        assert_eq!(drain(&mut timers, 49), vec![]);
        assert_eq!(drain(&mut timers, 100), vec![id(2), id(1), id(3)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_reports_existence_and_suppresses_fire() {
        let mut timers = TimerService::new();
        timers.schedule(id(7), 10);
        assert!(timers.cancel(id(7)));
        assert!(!timers.cancel(id(7)));
        assert_eq!(drain(&mut timers, 100), vec![]);
    }

    #[test]
    fn reschedule_replaces_deadline() {
        let mut timers = TimerService::new();
        timers.schedule(id(1), 10);
        timers.cancel(id(1));
        timers.schedule(id(1), 30);

        assert_eq!(drain(&mut timers, 20), vec![]);
        assert_eq!(drain(&mut timers, 30), vec![id(1)]);
    }

    #[test]
    fn schedule_after_fire_consumes_pending_expiration() {
        let mut timers = TimerService::new();
        timers.schedule(id(5), 10);
        assert_eq!(drain(&mut timers, 10), vec![id(5)]);

        // The fire is already in flight; this schedule pairs with it.
        timers.schedule(id(5), 20);
        assert_eq!(drain(&mut timers, 100), vec![]);

        // A second schedule installs normally again.
        timers.schedule(id(5), 30);
        assert_eq!(drain(&mut timers, 100), vec![id(5)]);
    }

    #[test]
    fn back_pressure_preserves_order() {
        let mut timers = TimerService::new();
        timers.schedule(id(1), 10);
        timers.schedule(id(2), 20);

        // Sink refuses everything: nothing fires, nothing is lost.
        let fired = timers.poll(50, |_| false);
        assert_eq!(fired, 0);
        assert_eq!(timers.len(), 2);

        assert_eq!(drain(&mut timers, 50), vec![id(1), id(2)]);
    }

    #[test]
    fn snapshot_entries_reflect_live_timers() {
        let mut timers = TimerService::new();
        timers.schedule(id(1), 10);
        timers.schedule(id(2), 20);
        timers.cancel(id(1));

        let entries: Vec<_> = timers.entries().collect();
        assert_eq!(entries, vec![(id(2), 20)]);
    }
}
