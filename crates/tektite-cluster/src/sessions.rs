//! Client session table and admission.
//!
//! Sessions move only forward through
//! `Init → Connected → (Challenged) → Authenticated → Open → Closed`,
//! with `Rejected` as the failed-admission terminal. The table keeps four
//! populations: open sessions, pending sessions still authenticating,
//! rejected sessions awaiting their event delivery, and redirects created
//! when a non-leader received a connect.
//!
//! Authentication is pluggable through [`Authenticator`]; the module hands
//! it a [`SessionProxy`] through which it challenges, authenticates, or
//! rejects. The default [`AllowAllAuthenticator`] admits everyone.

use bytes::Bytes;
use tektite_types::{ClusterSessionId, CorrelationId, LogPosition};
use tektite_wire::CloseReason;

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a cluster session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Init,
    Connected,
    Challenged,
    Authenticated,
    Open,
    Closed,
    Rejected,
}

// ============================================================================
// Cluster Session
// ============================================================================

/// One client session with the cluster.
#[derive(Debug, Clone)]
pub struct ClusterSession {
    pub id: ClusterSessionId,
    pub correlation_id: CorrelationId,
    pub response_stream_id: i32,
    pub response_channel: String,
    pub state: SessionState,
    pub opened_log_position: LogPosition,
    pub time_of_last_activity_ms: i64,
    pub close_reason: Option<CloseReason>,
    /// A `NewLeaderEvent` is owed to this session.
    pub pending_new_leader_event: bool,
    /// Principal established by the authenticator.
    pub encoded_principal: Bytes,
    /// Challenge produced by the authenticator, not yet delivered.
    pub outbound_challenge: Option<Bytes>,
    /// Detail string for rejected sessions.
    pub reject_detail: String,
}

impl ClusterSession {
    pub fn new(
        id: ClusterSessionId,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        response_channel: String,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            correlation_id,
            response_stream_id,
            response_channel,
            state: SessionState::Init,
            opened_log_position: LogPosition::ZERO,
            time_of_last_activity_ms: now_ms,
            close_reason: None,
            pending_new_leader_event: false,
            encoded_principal: Bytes::new(),
            outbound_challenge: None,
            reject_detail: String::new(),
        }
    }

    /// Moves the session forward; backward transitions are a logic error.
    pub(crate) fn transition(&mut self, to: SessionState) {
        debug_assert!(
            to >= self.state,
            "session {} cannot move {:?} -> {to:?}",
            self.id,
            self.state,
        );
        self.state = to;
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn has_timed_out(&self, now_ms: i64, session_timeout_ms: i64) -> bool {
        now_ms > self.time_of_last_activity_ms + session_timeout_ms
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// View of a pending session handed to the [`Authenticator`].
pub struct SessionProxy<'a> {
    session: &'a mut ClusterSession,
}

impl SessionProxy<'_> {
    pub fn session_id(&self) -> ClusterSessionId {
        self.session.id
    }

    /// Issues a challenge the client must answer.
    pub fn challenge(&mut self, encoded_challenge: Bytes) {
        self.session.outbound_challenge = Some(encoded_challenge);
        self.session.transition(SessionState::Challenged);
    }

    /// Admits the session with an established principal.
    pub fn authenticate(&mut self, encoded_principal: Bytes) {
        self.session.encoded_principal = encoded_principal;
        self.session.transition(SessionState::Authenticated);
    }

    /// Rejects the session.
    pub fn reject(&mut self, detail: &str) {
        self.session.reject_detail = detail.to_string();
        self.session.transition(SessionState::Rejected);
    }
}

/// Pluggable session authentication.
pub trait Authenticator {
    /// A connect request arrived with these credentials.
    fn on_connect_request(&mut self, session: &mut SessionProxy<'_>, credentials: &[u8], now_ms: i64);

    /// A challenge response arrived with these credentials.
    fn on_challenge_response(
        &mut self,
        session: &mut SessionProxy<'_>,
        credentials: &[u8],
        now_ms: i64,
    );
}

/// Admits every connect request without challenge.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn on_connect_request(
        &mut self,
        session: &mut SessionProxy<'_>,
        _credentials: &[u8],
        _now_ms: i64,
    ) {
        session.authenticate(Bytes::new());
    }

    fn on_challenge_response(
        &mut self,
        session: &mut SessionProxy<'_>,
        _credentials: &[u8],
        _now_ms: i64,
    ) {
        session.authenticate(Bytes::new());
    }
}

// ============================================================================
// Session Table
// ============================================================================

/// The session populations of one member.
#[derive(Debug, Default)]
pub struct SessionTable {
    open: Vec<ClusterSession>,
    pending: Vec<ClusterSession>,
    rejected: Vec<ClusterSession>,
    redirects: Vec<ClusterSession>,
    next_session_id: i64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions counted against `max_concurrent_sessions`.
    pub fn open_plus_pending(&self) -> usize {
        self.open.len() + self.pending.len()
    }

    /// Allocates a session for a connect request and runs the authenticator.
    pub fn connect(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        response_channel: String,
        credentials: &[u8],
        authenticator: &mut dyn Authenticator,
        now_ms: i64,
    ) -> ClusterSessionId {
        let id = ClusterSessionId::new(self.next_session_id);
        self.next_session_id += 1;

        let mut session =
            ClusterSession::new(id, correlation_id, response_stream_id, response_channel, now_ms);
        session.transition(SessionState::Connected);
        authenticator.on_connect_request(
            &mut SessionProxy {
                session: &mut session,
            },
            credentials,
            now_ms,
        );

        if session.state == SessionState::Rejected {
            self.rejected.push(session);
        } else {
            self.pending.push(session);
        }
        id
    }

    /// Runs the authenticator over a challenge response.
    pub fn challenge_response(
        &mut self,
        id: ClusterSessionId,
        credentials: &[u8],
        authenticator: &mut dyn Authenticator,
        now_ms: i64,
    ) {
        let Some(index) = self.pending.iter().position(|s| s.id == id) else {
            return;
        };
        let session = &mut self.pending[index];
        if session.state != SessionState::Challenged {
            return;
        }
        session.time_of_last_activity_ms = now_ms;
        authenticator.on_challenge_response(
            &mut SessionProxy { session },
            credentials,
            now_ms,
        );
        if self.pending[index].state == SessionState::Rejected {
            let session = self.pending.remove(index);
            self.rejected.push(session);
        }
    }

    /// Queues a rejected session that never entered authentication.
    pub fn reject_connect(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        response_channel: String,
        detail: &str,
        now_ms: i64,
    ) -> ClusterSessionId {
        let id = ClusterSessionId::new(self.next_session_id);
        self.next_session_id += 1;
        let mut session =
            ClusterSession::new(id, correlation_id, response_stream_id, response_channel, now_ms);
        session.reject_detail = detail.to_string();
        session.transition(SessionState::Rejected);
        self.rejected.push(session);
        id
    }

    /// Queues a redirect for a connect that reached a non-leader.
    pub fn redirect_connect(
        &mut self,
        correlation_id: CorrelationId,
        response_stream_id: i32,
        response_channel: String,
        now_ms: i64,
    ) {
        let mut session = ClusterSession::new(
            ClusterSessionId::new(-1),
            correlation_id,
            response_stream_id,
            response_channel,
            now_ms,
        );
        session.transition(SessionState::Rejected);
        self.redirects.push(session);
    }

    /// Moves an authenticated pending session to open at `position`.
    pub fn open_session(&mut self, id: ClusterSessionId, position: LogPosition) -> bool {
        let Some(index) = self.pending.iter().position(|s| s.id == id) else {
            return false;
        };
        let mut session = self.pending.remove(index);
        session.opened_log_position = position;
        session.transition(SessionState::Open);
        self.open.push(session);
        true
    }

    /// Closes an open session; returns it for event delivery.
    pub fn close_open(
        &mut self,
        id: ClusterSessionId,
        reason: CloseReason,
    ) -> Option<ClusterSession> {
        let index = self.open.iter().position(|s| s.id == id)?;
        let mut session = self.open.remove(index);
        session.close_reason = Some(reason);
        session.transition(SessionState::Closed);
        Some(session)
    }

    pub fn find_open_mut(&mut self, id: ClusterSessionId) -> Option<&mut ClusterSession> {
        self.open.iter_mut().find(|s| s.id == id)
    }

    pub fn find_pending_mut(&mut self, id: ClusterSessionId) -> Option<&mut ClusterSession> {
        self.pending.iter_mut().find(|s| s.id == id)
    }

    pub fn open_sessions(&self) -> &[ClusterSession] {
        &self.open
    }

    pub fn open_sessions_mut(&mut self) -> &mut [ClusterSession] {
        &mut self.open
    }

    pub fn pending_sessions_mut(&mut self) -> &mut Vec<ClusterSession> {
        &mut self.pending
    }

    pub fn rejected_sessions_mut(&mut self) -> &mut Vec<ClusterSession> {
        &mut self.rejected
    }

    pub fn redirect_sessions_mut(&mut self) -> &mut Vec<ClusterSession> {
        &mut self.redirects
    }

    /// Open session ids past the liveness timeout.
    pub fn timed_out_sessions(&self, now_ms: i64, session_timeout_ms: i64) -> Vec<ClusterSessionId> {
        self.open
            .iter()
            .filter(|s| s.has_timed_out(now_ms, session_timeout_ms))
            .map(|s| s.id)
            .collect()
    }

    /// Marks every open session as owed a `NewLeaderEvent`.
    pub fn mark_new_leader_pending(&mut self) {
        for session in &mut self.open {
            session.pending_new_leader_event = true;
        }
    }

    pub fn next_session_id(&self) -> i64 {
        self.next_session_id
    }

    pub fn set_next_session_id(&mut self, next: i64) {
        self.next_session_id = next;
    }

    /// Installs a session restored from a snapshot directly as open.
    pub fn restore_open(&mut self, session: ClusterSession) {
        debug_assert!(session.state == SessionState::Open);
        self.open.push(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(table: &mut SessionTable, auth: &mut dyn Authenticator) -> ClusterSessionId {
        table.connect(
            CorrelationId::new(1),
            7,
            "tek:mem?endpoint=client".into(),
            b"",
            auth,
            100,
        )
    }

    #[test]
    fn allow_all_admission_and_open() {
        let mut table = SessionTable::new();
        let mut auth = AllowAllAuthenticator;

        let id = connect(&mut table, &mut auth);
        assert_eq!(id, ClusterSessionId::new(0));
        assert_eq!(table.open_plus_pending(), 1);
        assert_eq!(
            table.find_pending_mut(id).expect("pending").state,
            SessionState::Authenticated
        );

        assert!(table.open_session(id, LogPosition::new(64)));
        let session = table.find_open_mut(id).expect("open");
        assert!(session.is_open());
        assert_eq!(session.opened_log_position, LogPosition::new(64));

        // Ids allocate monotonically.
        assert_eq!(connect(&mut table, &mut auth), ClusterSessionId::new(1));
    }

    #[test]
    fn challenge_flow() {
        struct ChallengeOnce {
            challenged: bool,
        }
        impl Authenticator for ChallengeOnce {
            fn on_connect_request(
                &mut self,
                session: &mut SessionProxy<'_>,
                _credentials: &[u8],
                _now_ms: i64,
            ) {
                session.challenge(Bytes::from_static(b"prove it"));
            }
            fn on_challenge_response(
                &mut self,
                session: &mut SessionProxy<'_>,
                credentials: &[u8],
                _now_ms: i64,
            ) {
                self.challenged = true;
                if credentials == b"ok" {
                    session.authenticate(Bytes::from_static(b"principal"));
                } else {
                    session.reject("bad credentials");
                }
            }
        }

        let mut table = SessionTable::new();
        let mut auth = ChallengeOnce { challenged: false };
        let id = connect(&mut table, &mut auth);
        {
            let session = table.find_pending_mut(id).expect("pending");
            assert_eq!(session.state, SessionState::Challenged);
            assert!(session.outbound_challenge.is_some());
        }

        table.challenge_response(id, b"ok", &mut auth, 200);
        assert!(auth.challenged);
        let session = table.find_pending_mut(id).expect("pending");
        assert_eq!(session.state, SessionState::Authenticated);
        assert_eq!(&session.encoded_principal[..], b"principal");
    }

    #[test]
    fn rejected_challenge_moves_to_rejected() {
        struct RejectAll;
        impl Authenticator for RejectAll {
            fn on_connect_request(
                &mut self,
                session: &mut SessionProxy<'_>,
                _credentials: &[u8],
                _now_ms: i64,
            ) {
                session.reject("not today");
            }
            fn on_challenge_response(
                &mut self,
                _session: &mut SessionProxy<'_>,
                _credentials: &[u8],
                _now_ms: i64,
            ) {
            }
        }

        let mut table = SessionTable::new();
        let id = connect(&mut table, &mut RejectAll);
        assert_eq!(table.open_plus_pending(), 0);
        assert_eq!(table.rejected_sessions_mut().len(), 1);
        assert_eq!(table.rejected_sessions_mut()[0].id, id);
        assert_eq!(table.rejected_sessions_mut()[0].reject_detail, "not today");
    }

    #[test]
    fn timeout_scan_and_close() {
        let mut table = SessionTable::new();
        let mut auth = AllowAllAuthenticator;
        let id = connect(&mut table, &mut auth);
        table.open_session(id, LogPosition::new(64));

        assert!(table.timed_out_sessions(5_000, 10_000).is_empty());
        let timed_out = table.timed_out_sessions(20_000, 10_000);
        assert_eq!(timed_out, vec![id]);

        let closed = table.close_open(id, CloseReason::Timeout).expect("closed");
        assert_eq!(closed.close_reason, Some(CloseReason::Timeout));
        assert_eq!(closed.state, SessionState::Closed);
        assert!(table.close_open(id, CloseReason::Timeout).is_none());
    }

    #[test]
    fn new_leader_marks_every_open_session_once() {
        let mut table = SessionTable::new();
        let mut auth = AllowAllAuthenticator;
        for _ in 0..3 {
            let id = connect(&mut table, &mut auth);
            table.open_session(id, LogPosition::new(64));
        }
        table.mark_new_leader_pending();
        assert!(
            table
                .open_sessions()
                .iter()
                .all(|s| s.pending_new_leader_event)
        );
    }
}
