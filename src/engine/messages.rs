//! Conclave engine -- peer-peer messaging.
//!
//! Replication channel handlers: proposal fan-out and acknowledgement
//! counting on the leader side, in-order acceptance on the follower side,
//! and the write-forwarding path from non-leader members.

use super::*;

use crate::server::OpError;

// ConclaveReplica peer-peer messages handling
impl ConclaveReplica {
    /// Synthesized handler of receiving message from peer.
    pub(crate) async fn handle_msg_recv(
        &mut self,
        peer: MemberId,
        msg: PeerMsg,
    ) -> Result<(), ConclaveError> {
        match msg {
            PeerMsg::NewTerm { term } => self.handle_new_term(peer, term),

            PeerMsg::NewTermAck {
                term,
                committed,
                high,
            } => self.handle_new_term_ack(peer, term, committed, high).await,

            PeerMsg::Propose { term, prev, prop } => {
                self.handle_propose(peer, term, prev, prop)
            }

            PeerMsg::ProposeAck { term, pos } => {
                self.handle_propose_ack(peer, term, pos).await
            }

            PeerMsg::Commit { term, pos } => {
                self.handle_commit(peer, term, pos).await
            }

            PeerMsg::Heartbeat { term, commit } => {
                self.heard_heartbeat(peer, term, commit).await
            }

            PeerMsg::HeartbeatReply {
                term,
                committed,
                high,
            } => self.handle_heartbeat_reply(peer, term, committed, high).await,

            PeerMsg::Forward { corr, session, op } => {
                self.handle_forward(peer, corr, session, op).await
            }

            PeerMsg::ForwardReject { corr, err } => {
                self.handle_forward_reject(corr, err)
            }

            PeerMsg::CatchupRequest {
                term,
                committed,
                high,
            } => self.handle_catchup_request(peer, term, committed, high).await,

            PeerMsg::CatchupReplay {
                term,
                entries,
                commit,
            } => self.handle_catchup_replay(peer, term, entries, commit).await,

            PeerMsg::StateTransfer {
                term,
                pairs,
                sessions,
                at,
            } => {
                self.handle_state_transfer(peer, term, pairs, sessions, at)
                    .await
            }
        }
    }

    /// Handler of Propose message from leader: accept in order, detect gaps
    /// against the predecessor position, and acknowledge what was recorded.
    fn handle_propose(
        &mut self,
        peer: MemberId,
        term: Term,
        prev: LogPosition,
        prop: Proposal,
    ) -> Result<(), ConclaveError> {
        let current = self.tracker.current();
        if term < current {
            return Ok(()); // proposal from a permanently outranked term
        }
        if term > current {
            // missed the new-term declaration; adopt through it
            self.follow_new_term(peer, term)?;
        }
        if self.leader != Some(peer) {
            self.leader = Some(peer);
        }
        self.heartbeater.kickoff_hear_timer()?;

        let pos = prop.pos;
        pf_trace!("received Propose <- {} pos {} prev {}", peer, pos, prev);

        // already committed here (possibly a recount after activation)
        if pos <= self.committed_pos {
            self.transport_hub
                .send_msg(PeerMsg::ProposeAck { term, pos }, peer)?;
            return Ok(());
        }

        // duplicate of an entry I already hold: re-acknowledge
        if self.find_slot(pos).is_some() {
            self.transport_hub
                .send_msg(PeerMsg::ProposeAck { term, pos }, peer)?;
            return Ok(());
        }

        // drop any uncommitted tail that conflicts with the leader's stream
        if self.tail_pos() > pos {
            self.truncate_uncommitted_from(pos);
        }

        if self.tail_pos() == prev {
            // in-order acceptance: durably record and acknowledge
            self.tracker.observe(pos);
            self.log.push(LogEntry {
                prop,
                status: Status::Proposed,
                acks: None,
                results: vec![],
            });
            self.transport_hub
                .send_msg(PeerMsg::ProposeAck { term, pos }, peer)?;
        } else {
            // missed some history; resynchronize with the leader before
            // accepting (and hence before padding any quorum)
            self.request_catchup()?;
        }

        Ok(())
    }

    /// Handler of ProposeAck from a peer: count into the proposal's AckSet
    /// and advance the commit watermark in assignment order.
    async fn handle_propose_ack(
        &mut self,
        peer: MemberId,
        term: Term,
        pos: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || !self.is_active_leader() {
            return Ok(()); // ack for an outranked term
        }
        pf_trace!("received ProposeAck <- {} pos {}", peer, pos);

        let mut counted = false;
        if let Some(slot) = self.find_slot(pos) {
            let entry = self.entry_mut(slot);
            if let Some(acks) = entry.acks.as_mut() {
                if !acks.get(peer)? {
                    acks.set(peer, true)?;
                    counted = true;
                }
            }
        }
        if counted {
            self.try_advance_commit().await?;
        }

        Ok(())
    }

    /// Handler of Commit watermark from leader.
    async fn handle_commit(
        &mut self,
        peer: MemberId,
        term: Term,
        pos: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || self.leader != Some(peer) {
            return Ok(());
        }

        if self.tail_pos() < pos {
            // committed history I do not hold yet
            self.request_catchup()?;
        }
        self.advance_commit_to(pos).await
    }

    /// Handler of a follower's heartbeat reply at the leader: feeds the
    /// liveness speculation and pushes catch-up history to laggers.
    async fn handle_heartbeat_reply(
        &mut self,
        peer: MemberId,
        term: Term,
        committed: LogPosition,
        high: LogPosition,
    ) -> Result<(), ConclaveError> {
        if term != self.tracker.current() || !self.is_active_leader() {
            return Ok(());
        }
        self.heartbeater.update_heard_cnt(peer)?;

        if committed < self.committed_pos || high < self.tail_pos() {
            // peer lags behind; not ack-eligible until resynchronized
            if self.peer_synced.get(peer)? {
                self.peer_synced.set(peer, false)?;
                pf_debug!("peer {} fell behind: committed {}", peer, committed);
            }
            self.push_catchup(peer, committed).await?;
        } else if !self.peer_synced.get(peer)? {
            self.peer_synced.set(peer, true)?;
            pf_info!("peer {} caught up: synced {:?}", peer, self.peer_synced);
        }

        Ok(())
    }

    /// Handler of a forwarded client operation at the leader. A forwarded
    /// operation enters the commit pipeline identically to a
    /// directly-submitted one; pre-replication failures are routed back to
    /// the forwarder explicitly.
    async fn handle_forward(
        &mut self,
        peer: MemberId,
        corr: u64,
        session: SessionId,
        op: ForwardedOp,
    ) -> Result<(), ConclaveError> {
        let payload = match op {
            ForwardedOp::Open {
                credential,
                timeout_ms,
            } => Payload::SessionOpen {
                credential,
                timeout_ms,
            },
            ForwardedOp::Attach { prev_owner } => Payload::SessionMove {
                prev_owner,
                new_owner: peer,
            },
            ForwardedOp::Write(cmd) => Payload::Ops { cmds: vec![cmd] },
            ForwardedOp::Multi(cmds) => Payload::Ops { cmds },
            ForwardedOp::Sync => Payload::Barrier,
            ForwardedOp::Close => Payload::SessionClose { expired: false },
        };

        match self.admit_proposal(&payload) {
            Ok(()) => {
                pf_trace!("admitted forwarded corr {} <- {}", corr, peer);
                self.submit_proposal(peer, corr, session, payload).await
            }
            Err(err) => {
                pf_debug!(
                    "rejecting forwarded corr {} <- {}: {:?}",
                    corr,
                    peer,
                    err
                );
                self.transport_hub
                    .send_msg(PeerMsg::ForwardReject { corr, err }, peer)
            }
        }
    }

    /// Handler of a forwarded-operation rejection at the origin member.
    fn handle_forward_reject(
        &mut self,
        corr: u64,
        err: OpError,
    ) -> Result<(), ConclaveError> {
        if let Some(pending) = self.pending.remove(&corr) {
            self.api_reply(pending.client, pending.req_id, Err(err))?;
        }
        Ok(())
    }

    /// Drops all uncommitted entries with positions >= `pos` (conflicting
    /// dead-branch tail being replaced by the current leader's history).
    pub(crate) fn truncate_uncommitted_from(&mut self, pos: LogPosition) {
        let keep = self
            .log
            .iter()
            .position(|ent| ent.status == Status::Proposed && ent.prop.pos >= pos)
            .map(|idx| self.start_slot + idx)
            .unwrap_or(self.tail_slot());
        let keep = keep.max(self.commit_bar);

        if keep < self.tail_slot() {
            pf_debug!(
                "truncating uncommitted tail from slot {} ({} entries)",
                keep,
                self.tail_slot() - keep
            );
            self.log.truncate(keep - self.start_slot);
        }
    }
}
