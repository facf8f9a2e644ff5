//! Conclave client session records table.

use std::collections::HashMap;

use crate::server::{MemberId, OpError};

use serde::{Deserialize, Serialize};

/// Client session ID type. Unique ensemble-wide; composed from the creating
/// member's ID and a member-local counter.
pub type SessionId = u64;

/// Opaque session credential type, generated by the creating member and
/// required for attaching the session from a different member.
pub type Credential = u64;

/// Sentinel for "no session" in proposals that are not session-bound.
pub const NO_SESSION: SessionId = 0;

/// Composes an ensemble-wide unique session ID from the creating member's ID
/// and its local session counter. Only uniqueness and non-zeroness matter;
/// the bit layout is an implementation detail.
#[inline]
pub fn compose_session_id(member: MemberId, counter: u64) -> SessionId {
    debug_assert!(counter < (1u64 << 56));
    ((member as u64 + 1) << 56) | counter
}

/// Last-committed record of one client session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Secret credential required to attach from another member.
    pub credential: Credential,

    /// The member currently owning this session.
    pub owner: MemberId,

    /// Liveness timeout in millisecs. Deadlines themselves are
    /// leader-volatile and not part of the committed record.
    pub timeout_ms: u64,
}

/// Table of committed session records, updated only by applying committed
/// proposals so that all members agree on ownership at every log position.
#[derive(Debug, Default, Clone)]
pub struct SessionTable {
    /// Map from session ID -> its last-committed record.
    records: HashMap<SessionId, SessionRecord>,
}

impl SessionTable {
    /// Creates a new empty session table.
    pub fn new() -> Self {
        SessionTable {
            records: HashMap::new(),
        }
    }

    /// Number of live sessions.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no live sessions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Gets the committed owner of a session, if it exists.
    #[inline]
    pub fn owner_of(&self, session: SessionId) -> Option<MemberId> {
        self.records.get(&session).map(|rec| rec.owner)
    }

    /// Gets the committed record of a session, if it exists.
    #[inline]
    pub fn record_of(&self, session: SessionId) -> Option<&SessionRecord> {
        self.records.get(&session)
    }

    /// Validates an attach attempt against the last-committed record.
    /// Returns the current committed owner on success (to be recorded as
    /// `prev_owner` in the session-move proposal).
    pub fn check_attach(
        &self,
        session: SessionId,
        credential: Credential,
    ) -> Result<MemberId, OpError> {
        match self.records.get(&session) {
            Some(rec) if rec.credential == credential => Ok(rec.owner),
            // unknown session or wrong credential are indistinguishable to
            // the caller
            _ => Err(OpError::ConnectionLoss),
        }
    }

    /// Applies a committed session-open. Returns false on ID collision
    /// (which indicates a bug in ID composition).
    pub fn apply_open(
        &mut self,
        session: SessionId,
        credential: Credential,
        owner: MemberId,
        timeout_ms: u64,
    ) -> bool {
        if self.records.contains_key(&session) {
            return false;
        }
        self.records.insert(
            session,
            SessionRecord {
                credential,
                owner,
                timeout_ms,
            },
        );
        true
    }

    /// Applies a committed session-move. The move takes effect only if the
    /// committed owner still equals `prev_owner`; a loser of a concurrent
    /// attach race observes `StaleOwner`.
    pub fn apply_move(
        &mut self,
        session: SessionId,
        prev_owner: MemberId,
        new_owner: MemberId,
    ) -> Result<(), OpError> {
        match self.records.get_mut(&session) {
            None => Err(OpError::ConnectionLoss),
            Some(rec) => {
                if rec.owner != prev_owner {
                    Err(OpError::StaleOwner)
                } else {
                    rec.owner = new_owner;
                    Ok(())
                }
            }
        }
    }

    /// Applies a committed session-close. Returns true if the session
    /// existed.
    pub fn apply_close(&mut self, session: SessionId) -> bool {
        self.records.remove(&session).is_some()
    }

    /// Dumps all records (for state transfer).
    pub fn dump(&self) -> Vec<(SessionId, SessionRecord)> {
        self.records
            .iter()
            .map(|(&id, rec)| (id, rec.clone()))
            .collect()
    }

    /// Replaces all records with the given dump (installing a state
    /// transfer).
    pub fn install(&mut self, dump: Vec<(SessionId, SessionRecord)>) {
        self.records = dump.into_iter().collect();
    }

    /// Iterates over `(session, record)` pairs.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&SessionId, &SessionRecord)> + '_ {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_unique() {
        let id_a = compose_session_id(0, 0);
        let id_b = compose_session_id(0, 1);
        let id_c = compose_session_id(1, 0);
        assert_ne!(id_a, NO_SESSION);
        assert_ne!(id_a, id_b);
        assert_ne!(id_a, id_c);
        assert_ne!(id_b, id_c);
    }

    #[test]
    fn open_then_attach() {
        let mut table = SessionTable::new();
        let sid = compose_session_id(0, 0);
        assert!(table.apply_open(sid, 0xdead, 0, 5000));
        assert!(!table.apply_open(sid, 0xbeef, 1, 5000));
        assert_eq!(table.owner_of(sid), Some(0));

        // attach with right credential reports current owner
        assert_eq!(table.check_attach(sid, 0xdead), Ok(0));
        // wrong credential or unknown session are both connection loss
        assert_eq!(
            table.check_attach(sid, 0xbeef),
            Err(OpError::ConnectionLoss)
        );
        assert_eq!(
            table.check_attach(compose_session_id(1, 0), 0xdead),
            Err(OpError::ConnectionLoss)
        );
    }

    #[test]
    fn move_race_lower_position_wins() {
        let mut table = SessionTable::new();
        let sid = compose_session_id(0, 7);
        assert!(table.apply_open(sid, 42, 0, 5000));

        // two racing attaches both recorded prev_owner = 0; the one applied
        // first (lower log position) wins
        assert_eq!(table.apply_move(sid, 0, 1), Ok(()));
        assert_eq!(table.apply_move(sid, 0, 2), Err(OpError::StaleOwner));
        assert_eq!(table.owner_of(sid), Some(1));
    }

    #[test]
    fn close_then_gone() {
        let mut table = SessionTable::new();
        let sid = compose_session_id(2, 1);
        assert!(table.apply_open(sid, 7, 2, 1000));
        assert!(table.apply_close(sid));
        assert!(!table.apply_close(sid));
        assert_eq!(table.owner_of(sid), None);
        assert_eq!(
            table.apply_move(sid, 2, 0),
            Err(OpError::ConnectionLoss)
        );
    }

    #[test]
    fn dump_install_roundtrip() {
        let mut table = SessionTable::new();
        table.apply_open(compose_session_id(0, 0), 1, 0, 1000);
        table.apply_open(compose_session_id(1, 0), 2, 1, 2000);

        let mut other = SessionTable::new();
        other.install(table.dump());
        assert_eq!(other.len(), 2);
        assert_eq!(other.owner_of(compose_session_id(1, 0)), Some(1));
    }
}
