//! Conclave engine -- client request entrance.
//!
//! Requests arriving at the activated leader enter the commit pipeline
//! directly; requests arriving at any other member are forwarded to the
//! current leader (or refused NotReady when none is known). Reads are served
//! from the local applied state after session-ownership validation.

use super::*;

use crate::server::{
    compose_session_id, ApiReply, ApiRequest, Command, OpError, OpResult,
    SmAction,
};

use rand::prelude::*;

// ConclaveReplica client requests entrance
impl ConclaveReplica {
    /// Handler of client request batch chan recv.
    pub(crate) async fn handle_req_batch(
        &mut self,
        req_batch: Vec<(ClientId, ApiRequest)>,
    ) -> Result<(), ConclaveError> {
        let batch_size = req_batch.len();
        debug_assert!(batch_size > 0);
        pf_debug!("got request batch of size {}", batch_size);

        for (client, req) in req_batch {
            if let Err(e) = self.handle_api_request(client, req).await {
                pf_error!("error handling client {} request: {}", client, e);
            }
        }

        Ok(())
    }

    /// Dispatches one client request.
    async fn handle_api_request(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), ConclaveError> {
        match req {
            ApiRequest::Members { id } => {
                // membership view query is served locally, no pipeline trip
                let mut members: Vec<(MemberId, std::net::SocketAddr)> =
                    self.members_view.iter().map(|(&m, &a)| (m, a)).collect();
                members.sort_by_key(|&(m, _)| m);
                self.api_reply(client, id, Ok(OpResult::Members { members }))
            }

            ApiRequest::Open { id, timeout_ms } => {
                self.handle_open(client, id, timeout_ms).await
            }

            ApiRequest::Attach {
                id,
                session,
                credential,
            } => self.handle_attach(client, id, session, credential).await,

            ApiRequest::Req { id, session, cmd } => {
                self.handle_cmd_req(client, id, session, cmd).await
            }

            ApiRequest::Multi { id, session, cmds } => {
                self.handle_multi_req(client, id, session, cmds).await
            }

            ApiRequest::Sync { id, session } => {
                self.handle_sync(client, id, session).await
            }

            ApiRequest::Close { id, session } => {
                self.handle_close(client, id, session).await
            }

            // `Leave` is consumed by the client servant task
            ApiRequest::Leave => Ok(()),
        }
    }

    /// Handler of session open request.
    async fn handle_open(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        timeout_ms: u64,
    ) -> Result<(), ConclaveError> {
        self.sess_counter += 1;
        let session = compose_session_id(self.id, self.sess_counter);
        let credential: Credential = thread_rng().gen();
        let timeout_ms = if timeout_ms == 0 {
            self.config.session_timeout_default_ms
        } else {
            timeout_ms
        };

        let payload = Payload::SessionOpen {
            credential,
            timeout_ms,
        };
        self.route_write(client, req_id, PendingKind::Open, session, payload)
            .await
    }

    /// Handler of session attach request: validate the credential against
    /// the last-committed record, then race a session-move proposal through
    /// the pipeline's total order.
    async fn handle_attach(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        session: SessionId,
        credential: Credential,
    ) -> Result<(), ConclaveError> {
        let prev_owner = match self.sessions.check_attach(session, credential) {
            Ok(owner) => owner,
            Err(err) => {
                return self.api_reply(client, req_id, Err(err));
            }
        };

        let payload = Payload::SessionMove {
            prev_owner,
            new_owner: self.id,
        };
        self.route_write(client, req_id, PendingKind::Attach, session, payload)
            .await
    }

    /// Handler of regular single-command request.
    async fn handle_cmd_req(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        session: SessionId,
        cmd: Command,
    ) -> Result<(), ConclaveError> {
        if !self.session_owned_here(session) {
            return self.api_reply(client, req_id, Err(OpError::ConnectionLoss));
        }

        if !cmd.is_write() {
            // reads are served from the local applied state
            return self.serve_local_read(client, req_id, cmd).await;
        }

        let payload = Payload::Ops { cmds: vec![cmd] };
        self.route_write(client, req_id, PendingKind::Write, session, payload)
            .await
    }

    /// Handler of atomic multi-command batch request.
    async fn handle_multi_req(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        session: SessionId,
        cmds: Vec<Command>,
    ) -> Result<(), ConclaveError> {
        if !self.session_owned_here(session) {
            return self.api_reply(client, req_id, Err(OpError::ConnectionLoss));
        }
        if cmds.is_empty() {
            return self
                .api_reply(client, req_id, Ok(OpResult::Multi(vec![])));
        }

        let payload = Payload::Ops { cmds };
        self.route_write(
            client,
            req_id,
            PendingKind::MultiWrite,
            session,
            payload,
        )
        .await
    }

    /// Handler of sync barrier request.
    async fn handle_sync(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        session: SessionId,
    ) -> Result<(), ConclaveError> {
        if !self.session_owned_here(session) {
            return self.api_reply(client, req_id, Err(OpError::ConnectionLoss));
        }

        self.route_write(
            client,
            req_id,
            PendingKind::Sync,
            session,
            Payload::Barrier,
        )
        .await
    }

    /// Handler of explicit session close request.
    async fn handle_close(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        session: SessionId,
    ) -> Result<(), ConclaveError> {
        if !self.session_owned_here(session) {
            return self.api_reply(client, req_id, Err(OpError::ConnectionLoss));
        }

        self.route_write(
            client,
            req_id,
            PendingKind::Close,
            session,
            Payload::SessionClose { expired: false },
        )
        .await
    }

    /// Routes a mutating request either into the local commit pipeline (if I
    /// am the activated leader) or to the current leader via the forwarding
    /// channel. Registers the pending callback first and releases it upon
    /// immediate rejection.
    async fn route_write(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        kind: PendingKind,
        session: SessionId,
        payload: Payload,
    ) -> Result<(), ConclaveError> {
        let corr = self.next_corr();
        self.pending.insert(
            corr,
            PendingClient {
                client,
                req_id,
                kind,
            },
        );

        let outcome = if self.is_active_leader() {
            match self.admit_proposal(&payload) {
                Ok(()) => {
                    self.submit_proposal(self.id, corr, session, payload)
                        .await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            self.forward_to_leader(corr, session, payload)
        };

        if let Err(err) = outcome {
            self.pending.remove(&corr);
            self.api_reply(client, req_id, Err(err))?;
        }
        Ok(())
    }

    /// Checks whether a proposal may enter the pipeline right now: I must be
    /// the activated leader, the active member set must be at least a
    /// quorum, and operation preconditions must hold against the
    /// prospective key state.
    pub(crate) fn admit_proposal(
        &self,
        payload: &Payload,
    ) -> Result<(), OpError> {
        if !self.is_active_leader() {
            return Err(OpError::NotReady);
        }
        if self.alive_cnt() < self.quorum_cnt {
            // no safe progress possible; surface capacity error rather than
            // partially commit
            return Err(OpError::NotReady);
        }
        if let Payload::Ops { cmds } = payload {
            self.check_preconditions(cmds)?;
        }
        Ok(())
    }

    /// Evaluates sub-command preconditions against the prospective key
    /// existence view (applied state + in-flight effects).
    pub(crate) fn check_preconditions(
        &self,
        cmds: &[Command],
    ) -> Result<(), OpError> {
        Self::preconditions_hold(&self.prospective, cmds)
    }

    /// Precondition evaluation with effects of earlier sub-commands visible
    /// to later ones. A single failing sub-command vetoes the entire
    /// proposal before it is replicated.
    fn preconditions_hold(
        prospective: &HashSet<String>,
        cmds: &[Command],
    ) -> Result<(), OpError> {
        let mut created: HashSet<&str> = HashSet::new();
        let mut deleted: HashSet<&str> = HashSet::new();
        let exists = |created: &HashSet<&str>,
                      deleted: &HashSet<&str>,
                      key: &str| {
            if created.contains(key) {
                true
            } else if deleted.contains(key) {
                false
            } else {
                prospective.contains(key)
            }
        };

        for (index, cmd) in cmds.iter().enumerate() {
            match cmd {
                Command::Create { key, .. } => {
                    if exists(&created, &deleted, key) {
                        return Err(OpError::AtomicBatchRejected { index });
                    }
                    created.insert(key.as_str());
                    deleted.remove(key.as_str());
                }
                Command::Delete { key } => {
                    if !exists(&created, &deleted, key) {
                        return Err(OpError::AtomicBatchRejected { index });
                    }
                    deleted.insert(key.as_str());
                    created.remove(key.as_str());
                }
                Command::Put { key, .. } => {
                    created.insert(key.as_str());
                    deleted.remove(key.as_str());
                }
                Command::Get { .. } => {}
            }
        }

        Ok(())
    }

    /// Leader-side pipeline entrance: assigns the next log position (the
    /// single-writer discipline on the position counter lives in this event
    /// loop), appends to the log, and replicates to all peers.
    pub(crate) async fn submit_proposal(
        &mut self,
        origin: MemberId,
        corr: u64,
        session: SessionId,
        payload: Payload,
    ) -> Result<(), ConclaveError> {
        debug_assert!(self.is_active_leader());

        let pos = self.tracker.assign_next();
        let prev = self.tail_pos();

        // fold in-flight key effects into the prospective view
        if let Payload::Ops { cmds } = &payload {
            Self::shadow_key_effects(&mut self.prospective, cmds);
        }

        let num_results = match &payload {
            Payload::Ops { cmds } => cmds.len(),
            _ => 0,
        };
        let prop = Proposal {
            pos,
            origin,
            corr,
            session,
            payload,
        };

        let mut acks = Bitmap::new(self.population, false);
        acks.set(self.id, true)?; // leader counts itself
        self.log.push(LogEntry {
            prop: prop.clone(),
            status: Status::Proposed,
            acks: Some(acks),
            results: vec![None; num_results],
        });

        let term = self.tracker.current();
        self.transport_hub
            .bcast_msg(PeerMsg::Propose { term, prev, prop }, None)?;
        pf_trace!("proposed pos {} prev {}", pos, prev);

        // a single-member ensemble commits by its own ack alone
        self.try_advance_commit().await?;

        Ok(())
    }

    /// Forwards a mutating request to the currently known leader. If no
    /// activated leader is known, reports NotReady rather than silently
    /// dropping the request.
    fn forward_to_leader(
        &mut self,
        corr: u64,
        session: SessionId,
        payload: Payload,
    ) -> Result<(), OpError> {
        let leader = match self.leader {
            Some(leader) if leader != self.id => leader,
            // mid-election, or I am a non-activated leader-elect
            _ => return Err(OpError::NotReady),
        };

        let op = match payload {
            Payload::SessionOpen {
                credential,
                timeout_ms,
            } => ForwardedOp::Open {
                credential,
                timeout_ms,
            },
            Payload::SessionMove { prev_owner, .. } => {
                ForwardedOp::Attach { prev_owner }
            }
            Payload::Ops { mut cmds } => {
                if cmds.len() == 1 {
                    ForwardedOp::Write(cmds.pop().unwrap())
                } else {
                    ForwardedOp::Multi(cmds)
                }
            }
            Payload::Barrier => ForwardedOp::Sync,
            Payload::SessionClose { .. } => ForwardedOp::Close,
        };

        if self
            .transport_hub
            .send_msg(PeerMsg::Forward { corr, session, op }, leader)
            .is_err()
        {
            return Err(OpError::NotReady);
        }
        pf_trace!("forwarded corr {} to leader {}", corr, leader);
        Ok(())
    }

    /// True if the session's committed owner is this member.
    #[inline]
    pub(crate) fn session_owned_here(&self, session: SessionId) -> bool {
        self.sessions.owner_of(session) == Some(self.id)
    }

    /// Serves a read from the local applied state via the state machine,
    /// correlating the eventual result back to the waiting client.
    async fn serve_local_read(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        cmd: Command,
    ) -> Result<(), ConclaveError> {
        let read_id = self.make_read_id();
        self.reads.insert(read_id, (client, req_id));
        self.state_machine
            .submit_action(read_id, SmAction::Apply(cmd))
            .await
    }

    /// Sends a reply for one client request.
    pub(crate) fn api_reply(
        &mut self,
        client: ClientId,
        id: RequestId,
        result: Result<OpResult, OpError>,
    ) -> Result<(), ConclaveError> {
        self.external_api
            .send_reply(ApiReply::Reply { id, result }, client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::OpError;

    fn keys(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn veto_create_existing() {
        let prospective = keys(&["/a"]);
        assert_eq!(
            ConclaveReplica::preconditions_hold(
                &prospective,
                &[Command::Create {
                    key: "/a".into(),
                    value: "v".into(),
                }]
            ),
            Err(OpError::AtomicBatchRejected { index: 0 })
        );
    }

    #[test]
    fn veto_delete_missing() {
        let prospective = keys(&[]);
        assert_eq!(
            ConclaveReplica::preconditions_hold(
                &prospective,
                &[
                    Command::Put {
                        key: "/a".into(),
                        value: "v".into(),
                    },
                    Command::Delete { key: "/b".into() },
                ]
            ),
            Err(OpError::AtomicBatchRejected { index: 1 })
        );
    }

    #[test]
    fn batch_sees_own_effects() {
        let prospective = keys(&["/old"]);
        // create is visible to the later delete; delete frees re-creation
        assert!(ConclaveReplica::preconditions_hold(
            &prospective,
            &[
                Command::Create {
                    key: "/new".into(),
                    value: "v".into(),
                },
                Command::Delete { key: "/new".into() },
                Command::Create {
                    key: "/new".into(),
                    value: "w".into(),
                },
                Command::Delete { key: "/old".into() },
                Command::Create {
                    key: "/old".into(),
                    value: "x".into(),
                },
            ]
        )
        .is_ok());
    }

    #[test]
    fn whole_batch_vetoed() {
        let prospective = keys(&["/m0"]);
        // third create clashes; the earlier ones must not be replicated
        // either (one result, whole-batch failure)
        assert_eq!(
            ConclaveReplica::preconditions_hold(
                &prospective,
                &[
                    Command::Create {
                        key: "/m1".into(),
                        value: "v".into(),
                    },
                    Command::Create {
                        key: "/m2".into(),
                        value: "v".into(),
                    },
                    Command::Create {
                        key: "/m0".into(),
                        value: "v".into(),
                    },
                ]
            ),
            Err(OpError::AtomicBatchRejected { index: 2 })
        );
    }

    #[test]
    fn reads_have_no_preconditions() {
        let prospective = keys(&[]);
        assert!(ConclaveReplica::preconditions_hold(
            &prospective,
            &[Command::Get { key: "/a".into() }]
        )
        .is_ok());
    }
}
