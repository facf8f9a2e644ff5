//! Conclave engine -- leader activation gating and term transitions.
//!
//! Leader selection is an external input (the manager oracle assigns
//! `(member, term)`); this module implements what happens *after* selection:
//! the new-term declaration, quorum term-acknowledgement collection, the
//! history safety check, and the transition to the Active role. No mutating
//! proposal is ever produced before activation completes.

use super::*;

use crate::manager::CtrlMsg;

// ConclaveReplica leadership related logic
impl ConclaveReplica {
    /// Handler of a leader assignment notice from the election collaborator.
    /// Broadcasts the new-term declaration and starts collecting quorum
    /// acknowledgements; all write servicing stays blocked until activated.
    pub(crate) async fn handle_assign_leader(
        &mut self,
        term: Term,
    ) -> Result<(), ConclaveError> {
        if term <= self.tracker.current() {
            pf_warn!(
                "ignoring stale leader assignment for term {} (at {})",
                term,
                self.tracker.current()
            );
            return Ok(());
        }

        self.tracker.adopt(term);
        self.role = Role::Electing;
        self.leader = Some(self.id);
        self.catching_up = false;

        let mut acks = Bitmap::new(self.population, false);
        acks.set(self.id, true)?;
        self.activation = Some(ActivationGate {
            term,
            acks,
            max_high: self.tail_pos(),
            max_holder: self.id,
        });

        self.heartbeater.set_sending(false);
        self.heartbeater.cancel_hear_timer()?;

        self.transport_hub
            .bcast_msg(PeerMsg::NewTerm { term }, None)?;
        self.activation_timer.kickoff(Duration::from_millis(
            self.config.activation_timeout_ms,
        ))?;
        pf_info!("selected leader-elect for term {}", term);

        // a single-member ensemble is its own quorum
        self.try_activate().await
    }

    /// Handler of a new-term declaration from a leader-elect peer.
    pub(crate) fn handle_new_term(
        &mut self,
        peer: MemberId,
        term: Term,
    ) -> Result<(), ConclaveError> {
        let current = self.tracker.current();

        if term > current {
            self.follow_new_term(peer, term)?;
        } else if term < current {
            // a stale-term leader-elect must defer to a fresher election
            // round instead of being blindly accepted
            self.control_hub.send_ctrl(CtrlMsg::SuspectLeader {
                term: current,
                high: self.tail_pos(),
            })?;
            return Ok(());
        } else if self.leader != Some(peer) {
            return Ok(()); // same term, different believed leader: ignore
        }

        // acknowledge with my progress report (idempotent on repeats)
        self.transport_hub.send_msg(
            PeerMsg::NewTermAck {
                term,
                committed: self.committed_pos,
                high: self.tail_pos(),
            },
            peer,
        )?;
        Ok(())
    }

    /// Adopts a strictly greater term declared (or implied) by a peer and
    /// becomes its follower.
    pub(crate) fn follow_new_term(
        &mut self,
        peer: MemberId,
        term: Term,
    ) -> Result<(), ConclaveError> {
        debug_assert!(term > self.tracker.current());

        if self.role == Role::Leader {
            // a higher-epoch peer outranks me; step down
            self.control_hub.send_ctrl(CtrlMsg::LeaderStatus {
                term: self.tracker.current(),
                step_up: false,
            })?;
            pf_info!("no longer the leader, following term {}", term);
        }

        self.tracker.adopt(term);
        self.role = Role::Follower;
        self.leader = Some(peer);
        self.activation = None;
        self.activation_timer.cancel()?;
        self.catching_up = false;
        self.heartbeater.set_sending(false);
        self.heartbeater.kickoff_hear_timer()?;

        Ok(())
    }

    /// Handler of a term acknowledgement while I am leader-elect.
    pub(crate) async fn handle_new_term_ack(
        &mut self,
        peer: MemberId,
        term: Term,
        committed: LogPosition,
        high: LogPosition,
    ) -> Result<(), ConclaveError> {
        let quorum_cnt = self.quorum_cnt;
        let counted = match self.activation.as_mut() {
            Some(gate)
                if gate.term == term && self.role == Role::Electing =>
            {
                if gate.acks.get(peer)? {
                    false // duplicate ack
                } else {
                    gate.acks.set(peer, true)?;
                    if high > gate.max_high {
                        gate.max_high = high;
                        gate.max_holder = peer;
                    }
                    pf_debug!(
                        "new-term ack <- {} committed {} high {} ({}/{})",
                        peer,
                        committed,
                        high,
                        gate.acks.count(),
                        quorum_cnt
                    );
                    true
                }
            }
            // ack for an outranked activation attempt
            _ => false,
        };

        if counted {
            self.try_activate().await?;
        }
        Ok(())
    }

    /// Activates if a quorum has acknowledged the term; abandons if some
    /// acker holds history above mine (no committed history may be silently
    /// lost or overwritten).
    async fn try_activate(&mut self) -> Result<(), ConclaveError> {
        let gate = match self.activation.as_ref() {
            Some(gate) => gate,
            None => return Ok(()),
        };

        if gate.max_high > self.tail_pos() {
            // a better-qualified member exists; defer to a fresh round
            let (term, better) = (gate.term, gate.max_holder);
            pf_warn!(
                "abandoning term {}: member {} holds higher position {}",
                term,
                better,
                gate.max_high
            );
            self.control_hub
                .send_ctrl(CtrlMsg::AbandonTerm { term, better })?;
            self.step_down(None)?;
            return Ok(());
        }

        if gate.acks.count() >= self.quorum_cnt {
            self.activate().await?;
        }
        Ok(())
    }

    /// Transition to the Active leader role after quorum acknowledgement:
    /// only from here on may commits and session mutations be produced.
    async fn activate(&mut self) -> Result<(), ConclaveError> {
        let gate = self.activation.take().unwrap();
        let term = gate.term;
        self.activation_timer.cancel()?;
        self.role = Role::Leader;
        pf_info!("activated as leader for term {}", term);

        self.control_hub
            .send_ctrl(CtrlMsg::LeaderStatus { term, step_up: true })?;

        // initialize the next-position counter above every position
        // reported by the quorum (my own history is at least as high,
        // enforced by try_activate)
        self.tracker.prime_above(gate.max_high);
        self.tracker.prime_above(self.tail_pos());

        // heartbeat bookkeeping
        self.heartbeater.clear_reply_cnts();
        self.heartbeater.set_sending(true);
        self.heartbeater.cancel_hear_timer()?;

        // peers must resynchronize before counting as caught-up
        self.peer_synced.clear();
        self.peer_synced.set(self.id, true)?;

        // rebuild the prospective key view: applied shadow + effects of
        // everything between apply watermark and log tail
        self.prospective = self.applied_keys.clone();
        for slot in self.apply_bar..self.tail_slot() {
            if let Payload::Ops { cmds } = &self.entry(slot).prop.payload {
                let cmds = cmds.clone();
                Self::shadow_key_effects(&mut self.prospective, &cmds);
            }
        }

        // grant all sessions a full liveness timeout; expiry scanning (and
        // hence expiry-close proposals) only happens from now on
        self.deadlines.clear();
        self.closing.clear();
        let now = Instant::now();
        for (&sid, rec) in self.sessions.iter() {
            self.deadlines
                .insert(sid, now + Duration::from_millis(rec.timeout_ms));
        }

        // re-propose my uncommitted tail under the new term with fresh ack
        // sets, so that possibly-quorum-stored history from prior terms is
        // committed (or superseded), never silently lost
        let tail = self.tail_slot();
        let mut resend = Vec::new();
        for slot in self.commit_bar..tail {
            let prev = if slot > self.start_slot {
                self.entry(slot - 1).prop.pos
            } else {
                self.committed_pos
            };
            resend.push((prev, self.entry(slot).prop.clone()));
        }
        for slot in self.commit_bar..tail {
            let mut acks = Bitmap::new(self.population, false);
            acks.set(self.id, true)?;
            let entry = self.entry_mut(slot);
            entry.status = Status::Proposed;
            entry.acks = Some(acks);
        }
        if !resend.is_empty() {
            pf_info!(
                "re-proposing {} uncommitted tail entries under term {}",
                resend.len(),
                term
            );
        }
        for (prev, prop) in resend {
            self.transport_hub
                .bcast_msg(PeerMsg::Propose { term, prev, prop }, None)?;
        }

        // announce activity right away
        self.bcast_heartbeats()?;
        self.try_advance_commit().await?;

        Ok(())
    }

    /// Handler of the activation collection timeout: abandon and defer to a
    /// fresh election round.
    pub(crate) fn handle_activation_timeout(
        &mut self,
    ) -> Result<(), ConclaveError> {
        if let Some(gate) = self.activation.take() {
            pf_warn!(
                "activation of term {} timed out with {}/{} acks",
                gate.term,
                gate.acks.count(),
                self.quorum_cnt
            );
            self.control_hub.send_ctrl(CtrlMsg::AbandonTerm {
                term: gate.term,
                better: gate.max_holder,
            })?;
            self.step_down(None)?;
        }
        Ok(())
    }

    /// Reverts to a non-serving follower state.
    pub(crate) fn step_down(
        &mut self,
        new_leader: Option<MemberId>,
    ) -> Result<(), ConclaveError> {
        if self.role == Role::Leader {
            self.control_hub.send_ctrl(CtrlMsg::LeaderStatus {
                term: self.tracker.current(),
                step_up: false,
            })?;
        }
        self.role = Role::Follower;
        self.leader = new_leader;
        self.activation = None;
        self.activation_timer.cancel()?;
        self.heartbeater.set_sending(false);
        self.heartbeater.kickoff_hear_timer()?;
        Ok(())
    }

    /// Broadcasts heartbeats to all peers and updates the liveness
    /// speculation counters.
    pub(crate) fn bcast_heartbeats(&mut self) -> Result<(), ConclaveError> {
        let term = self.tracker.current();
        self.transport_hub.bcast_msg(
            PeerMsg::Heartbeat {
                term,
                commit: self.committed_pos,
            },
            None,
        )?;

        if self.heartbeater.update_bcast_cnts()? {
            pf_debug!(
                "active member set now {:?}",
                self.heartbeater.peer_alive()
            );
        }

        Ok(())
    }

    /// Heard a heartbeat from the leader of some term: adopt newer terms,
    /// refresh the hearing timer, advance the commit watermark, and reply
    /// with my progress.
    pub(crate) async fn heard_heartbeat(
        &mut self,
        peer: MemberId,
        term: Term,
        commit: LogPosition,
    ) -> Result<(), ConclaveError> {
        let current = self.tracker.current();
        if term < current {
            // a rejoined/partitioned member with higher term (or higher
            // history under that term) must trigger a fresh election
            // rather than blindly accept a stale leader
            self.control_hub.send_ctrl(CtrlMsg::SuspectLeader {
                term: current,
                high: self.tail_pos(),
            })?;
            return Ok(());
        }
        if term > current {
            self.follow_new_term(peer, term)?;
        } else if self.leader.is_none() {
            self.leader = Some(peer);
        }

        if self.leader != Some(peer) {
            return Ok(());
        }
        self.heartbeater.kickoff_hear_timer()?;

        if self.tail_pos() < commit {
            // the leader has committed history I do not hold
            self.request_catchup()?;
        }
        self.advance_commit_to(commit).await?;

        self.transport_hub.send_msg(
            PeerMsg::HeartbeatReply {
                term,
                committed: self.committed_pos,
                high: self.tail_pos(),
            },
            peer,
        )?;
        Ok(())
    }

    /// Handler of leader inactivity timeout: report suspicion (with my
    /// highest position, letting the oracle prefer best-qualified members)
    /// and forget the unreachable leader.
    pub(crate) fn handle_hear_timeout(&mut self) -> Result<(), ConclaveError> {
        if self.is_leader() {
            return Ok(());
        }
        pf_warn!(
            "no heartbeat from leader {:?} within timeout",
            self.leader
        );

        self.leader = None;
        self.control_hub.send_ctrl(CtrlMsg::SuspectLeader {
            term: self.tracker.current(),
            high: self.tail_pos(),
        })?;

        // keep suspecting periodically until the oracle reacts
        self.heartbeater.kickoff_hear_timer()?;
        Ok(())
    }
}
