//! Conclave engine -- member resynchronization.
//!
//! A restarting or lagging member resynchronizes its term and log against
//! the current leader before it resumes acknowledging proposals: committed
//! history is replayed in chunks, or a full state transfer is installed when
//! the member is too far behind. No operator intervention involved.

use super::*;

use crate::server::SmAction;

// ConclaveReplica recovery & catch-up logic
impl ConclaveReplica {
    /// Asks the current leader for the history I am missing. At most one
    /// outstanding request at a time.
    pub(crate) fn request_catchup(&mut self) -> Result<(), ConclaveError> {
        if self.catching_up {
            return Ok(());
        }
        let leader = match self.leader {
            Some(leader) if leader != self.id => leader,
            _ => return Ok(()),
        };

        self.catching_up = true;
        pf_debug!(
            "requesting catch-up from {}: committed {} high {}",
            leader,
            self.committed_pos,
            self.tail_pos()
        );
        self.transport_hub.send_msg(
            PeerMsg::CatchupRequest {
                term: self.tracker.current(),
                committed: self.committed_pos,
                high: self.tail_pos(),
            },
            leader,
        )
    }

    /// Handler of a catch-up request at the leader.
    pub(crate) async fn handle_catchup_request(
        &mut self,
        peer: MemberId,
        term: Term,
        committed: LogPosition,
        _high: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || !self.is_active_leader() {
            return Ok(());
        }
        self.push_catchup(peer, committed).await
    }

    /// Sends the peer the history after its committed watermark: a replay
    /// chunk, or a full state transfer when the gap is too large (or the
    /// needed history was compacted away by my own past state transfer).
    pub(crate) async fn push_catchup(
        &mut self,
        peer: MemberId,
        committed: LogPosition,
    ) -> Result<(), ConclaveError> {
        let from_slot = if committed == self.base_pos {
            self.start_slot
        } else {
            match self.find_slot(committed) {
                Some(slot) => slot + 1,
                // peer's watermark predates my log; must transfer state
                None => return self.request_state_transfer(peer).await,
            }
        };

        let missing = self.tail_slot() - from_slot;
        if missing > self.config.state_xfer_threshold {
            return self.request_state_transfer(peer).await;
        }

        let upto =
            (from_slot + self.config.catchup_chunk_size).min(self.tail_slot());
        let entries: Vec<Proposal> = (from_slot..upto)
            .map(|slot| self.entry(slot).prop.clone())
            .collect();
        pf_debug!(
            "replaying {} entries (of {} missing) -> {}",
            entries.len(),
            missing,
            peer
        );

        self.transport_hub.send_msg(
            PeerMsg::CatchupReplay {
                term: self.tracker.current(),
                entries,
                commit: self.committed_pos,
            },
            peer,
        )
    }

    /// Handler of a catch-up replay at a lagging member: drop the
    /// uncommitted dead-branch tail, adopt the leader's history, and
    /// acknowledge what was recorded.
    pub(crate) async fn handle_catchup_replay(
        &mut self,
        peer: MemberId,
        term: Term,
        entries: Vec<Proposal>,
        commit: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || self.leader != Some(peer) {
            return Ok(());
        }
        self.catching_up = false;

        // my uncommitted tail is from an outranked branch; the leader's
        // stream replaces it
        self.log.truncate(self.commit_bar - self.start_slot);

        let mut appended = Vec::new();
        for prop in entries {
            if prop.pos <= self.tail_pos() {
                continue; // committed prefix I already hold
            }
            self.tracker.observe(prop.pos);
            appended.push(prop.pos);
            self.log.push(LogEntry {
                prop,
                status: Status::Proposed,
                acks: None,
                results: vec![],
            });
        }
        if !appended.is_empty() {
            pf_debug!(
                "adopted {} replayed entries up to {}",
                appended.len(),
                self.tail_pos()
            );
        }
        for pos in appended {
            self.transport_hub
                .send_msg(PeerMsg::ProposeAck { term, pos }, peer)?;
        }

        self.advance_commit_to(commit).await?;

        if self.tail_pos() < commit {
            // chunked replay has more to go
            self.request_catchup()?;
        }
        Ok(())
    }

    /// Leader-side state transfer preparation: snapshot the session table
    /// and the apply watermark now, then ask the state machine for a full
    /// dump (results pair up in submission order).
    pub(crate) async fn request_state_transfer(
        &mut self,
        peer: MemberId,
    ) -> Result<(), ConclaveError> {
        let at = if self.apply_bar > self.start_slot {
            self.entry(self.apply_bar - 1).prop.pos
        } else {
            self.base_pos
        };
        let sessions = self.sessions.dump();
        pf_info!("preparing state transfer at {} -> {}", at, peer);

        self.pending_xfer.push_back((peer, at, sessions));
        self.state_machine
            .submit_action(DUMP_ACTION_ID, SmAction::TakeDump)
            .await
    }

    /// Completion of a state machine dump: ship the oldest waiting state
    /// transfer.
    pub(crate) fn handle_dump_ready(
        &mut self,
        pairs: HashMap<String, String>,
    ) -> Result<(), ConclaveError> {
        let (peer, at, sessions) = match self.pending_xfer.pop_front() {
            Some(xfer) => xfer,
            None => return logged_err!("dump ready without pending transfer"),
        };

        self.transport_hub.send_msg(
            PeerMsg::StateTransfer {
                term: self.tracker.current(),
                pairs,
                sessions,
                at,
            },
            peer,
        )
    }

    /// Handler of a full state transfer at a member too far behind:
    /// installs the dump, discards the local log, and jumps the watermarks
    /// to the transfer position.
    pub(crate) async fn handle_state_transfer(
        &mut self,
        peer: MemberId,
        term: Term,
        pairs: HashMap<String, String>,
        sessions: Vec<(SessionId, SessionRecord)>,
        at: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || self.leader != Some(peer) {
            return Ok(());
        }
        if at <= self.committed_pos {
            return Ok(()); // stale transfer
        }
        pf_info!(
            "installing state transfer at {} ({} keys, {} sessions)",
            at,
            pairs.len(),
            sessions.len()
        );

        // discard the local log; slots of dropped entries are never reused,
        // so in-flight apply results for them get ignored
        self.start_slot += self.log.len();
        self.log.clear();
        self.commit_bar = self.start_slot;
        self.apply_bar = self.start_slot;
        self.exec_bar = self.start_slot;
        self.committed_pos = at;
        self.base_pos = at;
        self.tracker.observe(at);

        self.applied_keys = pairs.keys().cloned().collect();
        self.sessions.install(sessions);
        self.deadlines.clear();
        self.closing.clear();

        self.state_machine
            .submit_action(LOAD_ACTION_ID, SmAction::LoadDump(pairs))
            .await?;

        self.catching_up = false;
        Ok(())
    }
}
