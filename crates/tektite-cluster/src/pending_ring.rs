//! Pending service-message ring.
//!
//! Messages originated by the hosted services must appear in the log in the
//! order the services produced them, but only the leader may append. Every
//! member enqueues service messages here as they arrive; the leader drains
//! the head into the log, and followers sweep entries once the corresponding
//! appended record comes back on the replay path.
//!
//! Service pseudo-session ids are assigned from a monotone counter starting
//! at `i64::MIN + 1`, so they stay negative and never collide with
//! leader-allocated client session ids. Because every member's services
//! produce identical messages in identical order, members assign identical
//! ids without coordination.

use std::collections::VecDeque;

use bytes::Bytes;
use tektite_types::ClusterSessionId;

/// First service pseudo-session id ever assigned.
pub const FIRST_SERVICE_SESSION_ID: i64 = i64::MIN + 1;

/// One message awaiting leader-side append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingServiceMessage {
    pub cluster_session_id: ClusterSessionId,
    pub payload: Bytes,
}

/// FIFO arena of service messages awaiting append.
#[derive(Debug)]
pub struct PendingServiceMessageRing {
    entries: VecDeque<PendingServiceMessage>,
    capacity: usize,
    next_service_session_id: i64,
    /// Highest service session id observed appended in the log.
    log_service_session_id: i64,
}

impl PendingServiceMessageRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_service_session_id: FIRST_SERVICE_SESSION_ID,
            log_service_session_id: FIRST_SERVICE_SESSION_ID - 1,
        }
    }

    /// Enqueues a service message, assigning its pseudo-session id.
    pub fn append(&mut self, payload: Bytes) -> ClusterSessionId {
        let id = ClusterSessionId::new(self.next_service_session_id);
        self.next_service_session_id += 1;
        self.entries.push_back(PendingServiceMessage {
            cluster_session_id: id,
            payload,
        });
        id
    }

    /// Drains up to `limit` head entries through `appender`.
    ///
    /// The appender returns false on back-pressure, which stops the drain
    /// with the entry still at the head so ordering is preserved. Entries
    /// the appender accepts advance the logged high-water mark.
    pub fn consume(
        &mut self,
        limit: usize,
        mut appender: impl FnMut(&PendingServiceMessage) -> bool,
    ) -> usize {
        let mut consumed = 0;
        while consumed < limit {
            let Some(entry) = self.entries.front() else {
                break;
            };
            if !appender(entry) {
                break;
            }
            self.log_service_session_id = entry.cluster_session_id.as_i64();
            self.entries.pop_front();
            consumed += 1;
        }
        consumed
    }

    /// Notes a service message observed appended in the log and sweeps
    /// entries it covers.
    ///
    /// After a role change a follower must sweep up to the logged id before
    /// accepting new service messages; this is that sweep.
    pub fn sweep(&mut self, log_service_session_id: ClusterSessionId) -> usize {
        let id = log_service_session_id.as_i64();
        self.log_service_session_id = self.log_service_session_id.max(id);
        // Ids were assigned after anything already logged.
        self.next_service_session_id = self.next_service_session_id.max(id + 1);
        let before = self.entries.len();
        self.entries
            .retain(|e| e.cluster_session_id.as_i64() > self.log_service_session_id);
        before - self.entries.len()
    }

    /// Clears the ring and re-establishes capacity, as on snapshot load.
    pub fn reset(&mut self, capacity: usize) {
        self.entries = VecDeque::with_capacity(capacity);
        self.capacity = capacity;
    }

    /// Restores the id counters from a snapshot.
    pub fn restore_ids(&mut self, next_service_session_id: i64, log_service_session_id: i64) {
        self.next_service_session_id = next_service_session_id;
        self.log_service_session_id = log_service_session_id;
    }

    /// Re-enqueues a snapshotted entry with its original id.
    pub fn restore(&mut self, message: PendingServiceMessage) {
        self.entries.push_back(message);
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingServiceMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn next_service_session_id(&self) -> i64 {
        self.next_service_session_id
    }

    pub fn log_service_session_id(&self) -> i64 {
        self.log_service_session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[test]
    fn ids_are_negative_and_monotone() {
        let mut ring = PendingServiceMessageRing::new(8);
        let a = ring.append(payload(1));
        let b = ring.append(payload(2));
        assert!(a.is_service_session());
        assert!(b.is_service_session());
        assert_eq!(b.as_i64(), a.as_i64() + 1);
    }

    #[test]
    fn consume_preserves_order_and_stops_on_back_pressure() {
        let mut ring = PendingServiceMessageRing::new(8);
        for n in 0..4u8 {
            ring.append(payload(n));
        }

        let mut seen = Vec::new();
        let consumed = ring.consume(10, |entry| {
            if seen.len() == 2 {
                return false;
            }
            seen.push(entry.payload.clone());
            true
        });
        assert_eq!(consumed, 2);
        assert_eq!(seen, vec![payload(0), payload(1)]);
        assert_eq!(ring.len(), 2);

        // The refused entry is still at the head.
        let consumed = ring.consume(10, |_| true);
        assert_eq!(consumed, 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn sweep_drops_logged_entries_only() {
        let mut ring = PendingServiceMessageRing::new(8);
        let a = ring.append(payload(1));
        let b = ring.append(payload(2));
        let c = ring.append(payload(3));

        assert_eq!(ring.sweep(b), 2);
        assert_eq!(ring.len(), 1);
        assert_eq!(
            ring.entries().next().expect("entry").cluster_session_id,
            c
        );

        // Sweeping an already-covered id is a no-op.
        assert_eq!(ring.sweep(a), 0);
    }

    #[test]
    fn sweep_advances_next_id_past_logged() {
        // A follower that restarts empty must not re-assign ids the leader
        // already appended.
        let mut ring = PendingServiceMessageRing::new(8);
        let logged = ClusterSessionId::new(FIRST_SERVICE_SESSION_ID + 9);
        ring.sweep(logged);
        let next = ring.append(payload(1));
        assert_eq!(next.as_i64(), logged.as_i64() + 1);
    }

    #[test]
    fn reset_clears_but_keeps_ids() {
        let mut ring = PendingServiceMessageRing::new(8);
        ring.append(payload(1));
        let next_before = ring.next_service_session_id();
        ring.reset(16);
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.next_service_session_id(), next_before);
    }
}
