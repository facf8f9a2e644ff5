//! Conclave engine -- in-order commit application.
//!
//! Commit order follows assignment order, never ack-arrival order: the
//! watermark advances only over a contiguous quorum-acked prefix, and
//! entries are applied strictly in position order on every member. The
//! member that received the originating client call resolves its pending
//! callback when it applies the committed proposal locally.

use super::*;

use crate::server::{OpError, OpResult, SmAction, SmOutcome};

// ConclaveReplica commit & application logic
impl ConclaveReplica {
    /// Leader-side commit rule: advance the watermark over the contiguous
    /// prefix of quorum-acked proposals, then replicate the new watermark.
    pub(crate) async fn try_advance_commit(
        &mut self,
    ) -> Result<(), ConclaveError> {
        if !self.is_active_leader() {
            return Ok(());
        }

        let mut advanced = false;
        while self.commit_bar < self.tail_slot() {
            let entry = self.entry(self.commit_bar);
            let acked = entry
                .acks
                .as_ref()
                .map(|acks| acks.count() >= self.quorum_cnt)
                .unwrap_or(false);
            if !acked {
                break;
            }

            let pos = entry.prop.pos;
            self.entry_mut(self.commit_bar).status = Status::Committed;
            self.committed_pos = pos;
            self.commit_bar += 1;
            advanced = true;
            pf_debug!("committed pos {} (slot {})", pos, self.commit_bar - 1);
        }

        if advanced {
            let term = self.tracker.current();
            self.transport_hub.bcast_msg(
                PeerMsg::Commit {
                    term,
                    pos: self.committed_pos,
                },
                None,
            )?;
            self.apply_committed().await?;
        }

        Ok(())
    }

    /// Follower-side commit rule: mark everything up to the leader's
    /// watermark as committed (gap-free by construction of acceptance).
    pub(crate) async fn advance_commit_to(
        &mut self,
        pos: LogPosition,
    ) -> Result<(), ConclaveError> {
        let mut advanced = false;
        while self.commit_bar < self.tail_slot() {
            let entry_pos = self.entry(self.commit_bar).prop.pos;
            if entry_pos > pos {
                break;
            }
            self.entry_mut(self.commit_bar).status = Status::Committed;
            self.committed_pos = entry_pos;
            self.commit_bar += 1;
            advanced = true;
        }

        if advanced {
            self.apply_committed().await?;
        }
        Ok(())
    }

    /// Applies all committed-but-unapplied entries in position order.
    async fn apply_committed(&mut self) -> Result<(), ConclaveError> {
        while self.apply_bar < self.commit_bar {
            let slot = self.apply_bar;
            self.apply_bar += 1;
            self.apply_entry(slot).await?;
        }
        self.advance_exec_bar();
        Ok(())
    }

    /// Applies one committed entry: session-ownership staleness is detected
    /// here, at apply time, by comparing the proposal's claimed owner (its
    /// origin) against the committed owner.
    async fn apply_entry(&mut self, slot: usize) -> Result<(), ConclaveError> {
        let prop = self.entry(slot).prop.clone();
        pf_trace!("applying pos {} payload {:?}", prop.pos, prop.payload);

        match prop.payload {
            Payload::SessionOpen {
                credential,
                timeout_ms,
            } => {
                let opened = self.sessions.apply_open(
                    prop.session,
                    credential,
                    prop.origin,
                    timeout_ms,
                );
                self.entry_mut(slot).status = Status::Applied;
                if opened {
                    self.refresh_session_deadline(prop.session);
                    self.resolve_if_origin(slot, None)?;
                } else {
                    pf_error!("session ID collision on {}", prop.session);
                    self.resolve_if_origin(
                        slot,
                        Some(OpError::ConnectionLoss),
                    )?;
                }
            }

            Payload::SessionMove {
                prev_owner,
                new_owner,
            } => {
                let moved =
                    self.sessions
                        .apply_move(prop.session, prev_owner, new_owner);
                self.entry_mut(slot).status = Status::Applied;
                match moved {
                    Ok(()) => {
                        // the previous owner's binding is invalidated from
                        // this position on; any operation it still claims
                        // for this session fails the apply-time check
                        self.refresh_session_deadline(prop.session);
                        self.resolve_if_origin(slot, None)?;
                    }
                    Err(err) => {
                        // lost a concurrent attach race: the proposal with
                        // the lower log position won ownership
                        self.resolve_if_origin(slot, Some(err))?;
                    }
                }
            }

            Payload::SessionClose { expired } => {
                let existed = self.sessions.apply_close(prop.session);
                self.deadlines.remove(&prop.session);
                self.closing.remove(&prop.session);
                self.entry_mut(slot).status = Status::Applied;
                if expired {
                    pf_info!("session {} expired", prop.session);
                }
                if existed {
                    self.resolve_if_origin(slot, None)?;
                } else {
                    self.resolve_if_origin(
                        slot,
                        Some(OpError::ConnectionLoss),
                    )?;
                }
            }

            Payload::Barrier => {
                self.entry_mut(slot).status = Status::Applied;
                if self.sessions.owner_of(prop.session) == Some(prop.origin) {
                    self.refresh_session_deadline(prop.session);
                    self.resolve_if_origin(slot, None)?;
                } else {
                    self.resolve_if_origin(
                        slot,
                        Some(OpError::ConnectionLoss),
                    )?;
                }
            }

            Payload::Ops { cmds } => {
                if self.sessions.owner_of(prop.session) != Some(prop.origin) {
                    // stale claimed owner must fail, never silently succeed
                    self.entry_mut(slot).results = vec![];
                    self.entry_mut(slot).status = Status::Applied;
                    self.resolve_if_origin(
                        slot,
                        Some(OpError::ConnectionLoss),
                    )?;
                } else {
                    self.refresh_session_deadline(prop.session);
                    Self::shadow_key_effects(&mut self.applied_keys, &cmds);
                    for (idx, cmd) in cmds.into_iter().enumerate() {
                        self.state_machine
                            .submit_action(
                                Self::make_command_id(slot, idx),
                                SmAction::Apply(cmd),
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handler of state machine execution result.
    pub(crate) async fn handle_cmd_result(
        &mut self,
        cmd_id: CommandId,
        outcome: SmOutcome,
    ) -> Result<(), ConclaveError> {
        match cmd_id {
            DUMP_ACTION_ID => {
                if let SmOutcome::Dump(pairs) = outcome {
                    return self.handle_dump_ready(pairs);
                }
                logged_err!("unexpected outcome for dump action")
            }

            LOAD_ACTION_ID => {
                if outcome == SmOutcome::Loaded {
                    pf_info!("installed state transfer dump");
                    return Ok(());
                }
                logged_err!("unexpected outcome for load action")
            }

            id if id & LOCAL_READ_FLAG != 0 => {
                let result = match outcome {
                    SmOutcome::Applied(res) => res,
                    _ => return logged_err!("unexpected outcome for read"),
                };
                if let Some((client, req_id)) = self.reads.remove(&id) {
                    self.api_reply(client, req_id, Ok(OpResult::Cmd(result)))?;
                }
                Ok(())
            }

            _ => {
                let result = match outcome {
                    SmOutcome::Applied(res) => res,
                    _ => return logged_err!("unexpected outcome for apply"),
                };
                let (slot, idx) = Self::split_command_id(cmd_id);
                if slot < self.start_slot {
                    return Ok(()); // slot truncated by a state transfer
                }

                let entry = self.entry_mut(slot);
                debug_assert!(idx < entry.results.len());
                entry.results[idx] = Some(result);
                if entry.results.iter().all(|res| res.is_some()) {
                    entry.status = Status::Applied;
                    self.resolve_if_origin(slot, None)?;
                    self.advance_exec_bar();
                }
                Ok(())
            }
        }
    }

    /// Advances the fully-applied watermark over finished entries.
    pub(crate) fn advance_exec_bar(&mut self) {
        while self.exec_bar < self.apply_bar
            && self.entry(self.exec_bar).status == Status::Applied
        {
            self.exec_bar += 1;
        }
    }

    /// If this member originated the proposal at `slot`, releases its
    /// pending callback exactly once with the apply outcome.
    fn resolve_if_origin(
        &mut self,
        slot: usize,
        err: Option<OpError>,
    ) -> Result<(), ConclaveError> {
        if self.entry(slot).prop.origin != self.id {
            return Ok(());
        }
        let corr = self.entry(slot).prop.corr;
        let pending = match self.pending.remove(&corr) {
            Some(pending) => pending,
            None => return Ok(()), // no waiting callback (e.g. expiry close)
        };

        let result = match err {
            Some(err) => Err(err),
            None => {
                let entry = self.entry(slot);
                Ok(match &entry.prop.payload {
                    Payload::SessionOpen { credential, .. } => {
                        OpResult::Session {
                            session: entry.prop.session,
                            credential: *credential,
                        }
                    }
                    Payload::SessionMove { .. } => OpResult::Attached,
                    Payload::SessionClose { .. } => OpResult::Closed,
                    Payload::Barrier => OpResult::Synced,
                    Payload::Ops { .. } => {
                        let results: Vec<_> = entry
                            .results
                            .iter()
                            .map(|res| res.clone().unwrap())
                            .collect();
                        if pending.kind == PendingKind::Write {
                            OpResult::Cmd(results.into_iter().next().unwrap())
                        } else {
                            OpResult::Multi(results)
                        }
                    }
                })
            }
        };

        self.api_reply(pending.client, pending.req_id, result)
    }

    /// Refreshes the leader-volatile liveness deadline of a session upon
    /// committed activity.
    fn refresh_session_deadline(&mut self, session: SessionId) {
        if self.role != Role::Leader {
            return;
        }
        if let Some(rec) = self.sessions.record_of(session) {
            self.deadlines.insert(
                session,
                Instant::now() + Duration::from_millis(rec.timeout_ms),
            );
        }
    }

    /// Leader's session expiry scan: a session past its liveness deadline
    /// is destroyed via a committed close proposal, so all members agree on
    /// the instant it stops existing. Never runs before activation.
    pub(crate) async fn check_session_expiries(
        &mut self,
    ) -> Result<(), ConclaveError> {
        debug_assert!(self.is_active_leader());

        let now = Instant::now();
        let mut expired: Vec<SessionId> = Vec::new();
        for (&sid, &deadline) in self.deadlines.iter() {
            if deadline < now && !self.closing.contains(&sid) {
                expired.push(sid);
            }
        }

        for session in expired {
            if self.sessions.owner_of(session).is_none() {
                self.deadlines.remove(&session);
                continue;
            }
            let payload = Payload::SessionClose { expired: true };
            if self.admit_proposal(&payload).is_err() {
                // below quorum right now; retry on a later scan
                continue;
            }
            pf_debug!("proposing expiry close of session {}", session);
            self.closing.insert(session);
            self.submit_proposal(self.id, 0, session, payload).await?;
        }

        Ok(())
    }
}
