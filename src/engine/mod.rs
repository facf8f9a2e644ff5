//! Conclave ensemble coordination engine.
//!
//! A single-leader quorum replication and commit pipeline with
//! leader-activation gating, write forwarding from non-leader members, and
//! session ownership migration. Leader selection itself is consumed as an
//! external input: the cluster manager oracle assigns `(member, term)` over
//! the control channel.

mod control;
mod execution;
mod leadership;
mod messages;
mod position;
mod recovery;
mod request;

pub use position::{LogPosition, Term};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::manager::CtrlMsg;
use crate::server::{
    Command, CommandId, CommandResult, ControlHub, Credential, ExternalApi,
    GenericReplica, HeartbeatEvent, Heartbeater, MemberId, RequestId,
    SessionId, SessionRecord, SessionTable, StateMachine, TransportHub,
};
use crate::utils::{Bitmap, ConclaveError, Timer};

use self::position::TermTracker;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::time::{
    self, Duration, Instant, Interval, MissedTickBehavior,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Client request batching interval in millisecs.
    pub batch_interval_ms: u64,

    /// Client request batching maximum batch size.
    pub max_batch_size: usize,

    /// Min timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_min: u64,
    /// Max timeout of not hearing any heartbeat from leader in millisecs.
    pub hb_hear_timeout_max: u64,

    /// Interval of leader sending heartbeats to followers in millisecs.
    pub hb_send_interval_ms: u64,

    /// Bound on collecting quorum new-term acknowledgements in millisecs;
    /// a leader-elect that cannot activate within this bound steps down.
    pub activation_timeout_ms: u64,

    /// Default session liveness timeout in millisecs for `Open` requests
    /// that pass 0.
    pub session_timeout_default_ms: u64,

    /// Interval of the leader's session expiry scan in millisecs.
    pub expiry_check_interval_ms: u64,

    /// Maximum number of proposals per catch-up replay chunk.
    pub catchup_chunk_size: usize,

    /// Number of missing proposals beyond which a rejoining member receives
    /// a full state transfer instead of replay.
    pub state_xfer_threshold: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            batch_interval_ms: 1,
            max_batch_size: 5000,
            hb_hear_timeout_min: 1500,
            hb_hear_timeout_max: 2000,
            hb_send_interval_ms: 20,
            activation_timeout_ms: 2000,
            session_timeout_default_ms: 10000,
            expiry_check_interval_ms: 500,
            catchup_chunk_size: 500,
            state_xfer_threshold: 10000,
        }
    }
}

/// Role of a member with respect to the current term. Role changes only
/// through term transitions.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum Role {
    /// Replicating under some (possibly unknown) leader.
    Follower,

    /// Selected leader-elect, collecting quorum term acknowledgements.
    Electing,

    /// Activated leader, serving the commit pipeline.
    Leader,
}

/// Replicated operation payload of a proposal. Session mutations ride the
/// same pipeline as ordinary operations.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum Payload {
    /// One or more state machine commands forming an atomic unit.
    Ops { cmds: Vec<Command> },

    /// No-op barrier used by the `sync` read-after-write primitive.
    Barrier,

    /// Session creation by the origin member.
    SessionOpen {
        credential: Credential,
        timeout_ms: u64,
    },

    /// Credentialed ownership transfer; takes effect only if the committed
    /// owner still equals `prev_owner` at apply time.
    SessionMove {
        prev_owner: MemberId,
        new_owner: MemberId,
    },

    /// Session destruction, explicit or by liveness expiry.
    SessionClose { expired: bool },
}

/// One quorum-replicated unit. Immutable once created; owned by the leader
/// of `pos.term` until committed.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) struct Proposal {
    /// Assigned log position; the single source of ordering.
    pub(crate) pos: LogPosition,

    /// Member that received the originating client call (and that resolves
    /// the client callback upon applying this proposal).
    pub(crate) origin: MemberId,

    /// Origin-local correlation ID of the pending callback; 0 if none
    /// (leader-initiated proposals such as expiry closes).
    pub(crate) corr: u64,

    /// Session this proposal is bound to (`NO_SESSION` never appears here;
    /// every payload kind is session-bound).
    pub(crate) session: SessionId,

    /// The replicated operation.
    pub(crate) payload: Payload,
}

/// Status of an in-memory log entry.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub(crate) enum Status {
    /// Accepted/proposed, awaiting quorum.
    Proposed,

    /// Committed; will be applied in position order.
    Committed,

    /// Fully applied to local state.
    Applied,
}

/// In-memory log entry wrapping a proposal with member-local bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    /// The replicated proposal.
    pub(crate) prop: Proposal,

    /// Entry status.
    pub(crate) status: Status,

    /// Leader-side ack set for this proposal (leader counts itself).
    pub(crate) acks: Option<Bitmap>,

    /// Per-sub-command results collected during apply.
    pub(crate) results: Vec<Option<CommandResult>>,
}

/// What kind of client call a pending callback belongs to; shapes the reply.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum PendingKind {
    Open,
    Attach,
    Write,
    MultiWrite,
    Sync,
    Close,
}

/// Callback for an in-flight client-issued operation, held by the member
/// that received the client's original call; released exactly once.
#[derive(Debug, Clone)]
pub(crate) struct PendingClient {
    pub(crate) client: ClientId,
    pub(crate) req_id: RequestId,
    pub(crate) kind: PendingKind,
}

/// Forwarded operation kinds carried from a non-leader member to the leader.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum ForwardedOp {
    /// Open a session owned by the forwarder; the forwarder has already
    /// composed the session ID and credential.
    Open {
        credential: Credential,
        timeout_ms: u64,
    },

    /// Move session ownership to the forwarder; credential was validated at
    /// the forwarder against its last-committed record.
    Attach { prev_owner: MemberId },

    /// Single write command.
    Write(Command),

    /// Atomic multi-command batch.
    Multi(Vec<Command>),

    /// Read-after-write barrier.
    Sync,

    /// Explicit session close.
    Close,
}

/// Peer-peer message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum PeerMsg {
    /// New-term declaration from a leader-elect.
    NewTerm { term: Term },

    /// Term acknowledgement carrying the acker's committed watermark and
    /// highest accepted position.
    NewTermAck {
        term: Term,
        committed: LogPosition,
        high: LogPosition,
    },

    /// Proposal replication from leader. `prev` is the position immediately
    /// preceding `prop.pos` in the leader's log, used for gap detection.
    Propose {
        term: Term,
        prev: LogPosition,
        prop: Proposal,
    },

    /// Proposal durably recorded by a peer.
    ProposeAck { term: Term, pos: LogPosition },

    /// Commit watermark: every position `<= pos` is committed.
    Commit { term: Term, pos: LogPosition },

    /// Leader activity heartbeat carrying the commit watermark.
    Heartbeat { term: Term, commit: LogPosition },

    /// Follower reply to a heartbeat, reporting its progress.
    HeartbeatReply {
        term: Term,
        committed: LogPosition,
        high: LogPosition,
    },

    /// Client write forwarded from a non-leader member.
    Forward {
        corr: u64,
        session: SessionId,
        op: ForwardedOp,
    },

    /// Pre-replication rejection of a forwarded operation.
    ForwardReject { corr: u64, err: crate::server::OpError },

    /// Lagging member asking the leader for missing history.
    CatchupRequest {
        term: Term,
        committed: LogPosition,
        high: LogPosition,
    },

    /// Replay of proposals after the requester's committed watermark.
    CatchupReplay {
        term: Term,
        entries: Vec<Proposal>,
        commit: LogPosition,
    },

    /// Full state transfer for members too far behind.
    StateTransfer {
        term: Term,
        pairs: HashMap<String, String>,
        sessions: Vec<(SessionId, SessionRecord)>,
        at: LogPosition,
    },
}

/// Leader-activation gate state, alive while collecting quorum term
/// acknowledgements.
#[derive(Debug, Clone)]
pub(crate) struct ActivationGate {
    /// Term being activated.
    pub(crate) term: Term,

    /// Members that have acknowledged the term (self included).
    pub(crate) acks: Bitmap,

    /// Maximum accepted position reported across acks (self included).
    pub(crate) max_high: LogPosition,

    /// Member that reported `max_high`.
    pub(crate) max_holder: MemberId,
}

/// Flag bit marking command IDs of member-local reads (not log applies).
pub(crate) const LOCAL_READ_FLAG: CommandId = 1 << 63;

/// Reserved command IDs for state machine dump actions.
pub(crate) const DUMP_ACTION_ID: CommandId = u64::MAX;
pub(crate) const LOAD_ACTION_ID: CommandId = u64::MAX - 1;

/// Conclave ensemble member replica module.
pub struct ConclaveReplica {
    /// My member ID.
    id: MemberId,

    /// Total number of members in the ensemble.
    population: u8,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Address string for client requests API.
    _api_addr: SocketAddr,

    /// Address string for internal peer-peer communication.
    _p2p_addr: SocketAddr,

    /// ControlHub module (connection to the election collaborator).
    control_hub: ControlHub,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// StateMachine module.
    state_machine: StateMachine,

    /// TransportHub module.
    transport_hub: TransportHub<PeerMsg>,

    /// Heartbeater module.
    heartbeater: Heartbeater,

    /// Static membership view (member ID -> client API address), pushed by
    /// the manager as members join. Includes myself.
    members_view: HashMap<MemberId, SocketAddr>,

    /// Who do I believe is the current leader, if any?
    leader: Option<MemberId>,

    /// My role under the current term.
    role: Role,

    /// Term and position tracking.
    tracker: TermTracker,

    /// In-memory log of proposals: committed prefix + in-flight tail.
    log: Vec<LogEntry>,

    /// Absolute slot number of log[0]; slots are never reused, even across
    /// state-transfer truncation.
    start_slot: usize,

    /// Absolute slot of the first non-committed entry.
    commit_bar: usize,

    /// Absolute slot of the first entry not yet submitted for apply.
    apply_bar: usize,

    /// Absolute slot of the first entry not yet fully applied.
    exec_bar: usize,

    /// Position of the last committed proposal (`ZERO` if none).
    committed_pos: LogPosition,

    /// Position immediately preceding log[0]: `ZERO` for genesis, or the
    /// watermark of the last installed state transfer.
    base_pos: LogPosition,

    /// Activation gate state while I am leader-elect.
    activation: Option<ActivationGate>,

    /// Bounded timer for activation quorum collection.
    activation_timer: Timer,

    /// Committed session records table.
    sessions: SessionTable,

    /// Local counter for composing session IDs.
    sess_counter: u64,

    /// Leader-volatile session liveness deadlines.
    deadlines: HashMap<SessionId, Instant>,

    /// Sessions with an expiry close proposal in flight.
    closing: HashSet<SessionId>,

    /// Interval for the leader's session expiry scan.
    expiry_interval: Interval,

    /// Shadow of keys existing in the applied state, maintained
    /// deterministically at apply submission.
    applied_keys: HashSet<String>,

    /// Leader-side prospective key existence (applied + in-flight effects),
    /// consulted by the precondition veto; rebuilt at activation.
    prospective: HashSet<String>,

    /// Map from correlation ID -> pending client callback.
    pending: HashMap<u64, PendingClient>,

    /// Correlation ID counter (0 reserved for "no callback").
    corr_counter: u64,

    /// Map from read command ID -> waiting client of a local read.
    reads: HashMap<CommandId, (ClientId, RequestId)>,

    /// Read command ID counter.
    read_counter: u64,

    /// Peers believed fully caught up (ack-eligible bookkeeping).
    peer_synced: Bitmap,

    /// True while this member has an outstanding catch-up request.
    catching_up: bool,

    /// State transfers awaiting the state machine dump, in submission order.
    pending_xfer: VecDeque<(MemberId, LogPosition, Vec<(SessionId, SessionRecord)>)>,
}

// ConclaveReplica common helpers
impl ConclaveReplica {
    /// Do I believe I am the current leader (activated or not)?
    #[inline]
    pub(crate) fn is_leader(&self) -> bool {
        self.leader == Some(self.id)
    }

    /// Am I the activated leader, allowed to produce commits?
    #[inline]
    pub(crate) fn is_active_leader(&self) -> bool {
        self.role == Role::Leader && self.is_leader()
    }

    /// Number of members currently believed alive (self included).
    #[inline]
    pub(crate) fn alive_cnt(&self) -> u8 {
        self.heartbeater.peer_alive().count()
    }

    /// Position of the last entry in my log, falling back to the committed
    /// watermark when the log has been truncated empty by a state transfer.
    #[inline]
    pub(crate) fn tail_pos(&self) -> LogPosition {
        self.log
            .last()
            .map(|ent| ent.prop.pos)
            .unwrap_or(self.committed_pos)
    }

    /// Absolute slot number just past my log tail.
    #[inline]
    pub(crate) fn tail_slot(&self) -> usize {
        self.start_slot + self.log.len()
    }

    /// Looks up the absolute slot holding the given position, if present.
    pub(crate) fn find_slot(&self, pos: LogPosition) -> Option<usize> {
        self.log
            .binary_search_by(|ent| ent.prop.pos.cmp(&pos))
            .ok()
            .map(|idx| self.start_slot + idx)
    }

    /// Borrows the entry at an absolute slot.
    #[inline]
    pub(crate) fn entry(&self, slot: usize) -> &LogEntry {
        &self.log[slot - self.start_slot]
    }

    /// Mutably borrows the entry at an absolute slot.
    #[inline]
    pub(crate) fn entry_mut(&mut self, slot: usize) -> &mut LogEntry {
        &mut self.log[slot - self.start_slot]
    }

    /// Draws the next correlation ID (never 0).
    #[inline]
    pub(crate) fn next_corr(&mut self) -> u64 {
        self.corr_counter += 1;
        self.corr_counter
    }

    /// Composes CommandId from absolute slot & sub-command index within.
    #[inline]
    pub(crate) fn make_command_id(slot: usize, cmd_idx: usize) -> CommandId {
        debug_assert!(slot <= (u32::MAX as usize));
        debug_assert!(cmd_idx <= (u32::MAX as usize));
        ((slot as u64) << 32) | (cmd_idx as u64)
    }

    /// Decomposes CommandId into absolute slot & sub-command index within.
    #[inline]
    pub(crate) fn split_command_id(command_id: CommandId) -> (usize, usize) {
        let slot = (command_id >> 32) as usize;
        let cmd_idx = (command_id & ((1u64 << 32) - 1)) as usize;
        (slot, cmd_idx)
    }

    /// Draws a fresh command ID for a member-local read.
    #[inline]
    pub(crate) fn make_read_id(&mut self) -> CommandId {
        self.read_counter += 1;
        LOCAL_READ_FLAG | self.read_counter
    }

    /// Applies the key existence effects of commands onto a shadow set,
    /// mirroring the state machine's semantics.
    pub(crate) fn shadow_key_effects(
        set: &mut HashSet<String>,
        cmds: &[Command],
    ) {
        for cmd in cmds {
            match cmd {
                Command::Create { key, .. } | Command::Put { key, .. } => {
                    set.insert(key.clone());
                }
                Command::Delete { key } => {
                    set.remove(key);
                }
                Command::Get { .. } => {}
            }
        }
    }
}

#[async_trait]
impl GenericReplica for ConclaveReplica {
    async fn new_and_setup(
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        manager: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ConclaveError> {
        // connect to the cluster manager and get assigned a member ID
        let mut control_hub = ControlHub::new_and_setup(manager).await?;
        let id = control_hub.me;
        let population = control_hub.population;
        let _ = crate::ME.set(id.to_string());

        // parse member configs
        let config = parsed_config!(config_str => ReplicaConfig;
                                    batch_interval_ms, max_batch_size,
                                    hb_hear_timeout_min, hb_hear_timeout_max,
                                    hb_send_interval_ms, activation_timeout_ms,
                                    session_timeout_default_ms,
                                    expiry_check_interval_ms,
                                    catchup_chunk_size, state_xfer_threshold)?;
        if config.batch_interval_ms == 0 {
            return logged_err!(
                "invalid config.batch_interval_ms '{}'",
                config.batch_interval_ms
            );
        }
        if config.activation_timeout_ms == 0 {
            return logged_err!(
                "invalid config.activation_timeout_ms '{}'",
                config.activation_timeout_ms
            );
        }
        if config.session_timeout_default_ms == 0 {
            return logged_err!(
                "invalid config.session_timeout_default_ms '{}'",
                config.session_timeout_default_ms
            );
        }
        if config.expiry_check_interval_ms == 0 {
            return logged_err!(
                "invalid config.expiry_check_interval_ms '{}'",
                config.expiry_check_interval_ms
            );
        }
        if config.catchup_chunk_size == 0 {
            return logged_err!(
                "invalid config.catchup_chunk_size '{}'",
                config.catchup_chunk_size
            );
        }

        // setup state machine module
        let state_machine = StateMachine::new_and_setup(id).await?;

        // setup heartbeat management module
        let heartbeater = Heartbeater::new_and_setup(
            id,
            population,
            Duration::from_millis(config.hb_hear_timeout_min),
            Duration::from_millis(config.hb_hear_timeout_max),
            Duration::from_millis(config.hb_send_interval_ms),
        )?;

        // setup transport hub module
        let mut transport_hub =
            TransportHub::new_and_setup(id, population, p2p_addr).await?;

        // ask for the list of peers to proactively connect to. Do this after
        // the transport hub has been set up, so that I will be able to
        // accept later peer connections
        control_hub.send_ctrl(CtrlMsg::NewServerJoin {
            id,
            api_addr,
            p2p_addr,
        })?;
        let (to_peers, members_view) = loop {
            match control_hub.recv_ctrl().await? {
                CtrlMsg::ConnectToPeers { to_peers, .. } => {
                    break (to_peers, HashMap::from([(id, api_addr)]));
                }
                CtrlMsg::MembersView { members } => {
                    // view push racing ahead of the connect list; keep
                    // waiting for the connect list
                    let _ = members;
                }
                msg => {
                    pf_warn!("unexpected ctrl msg during join: {:?}", msg);
                }
            }
        };

        // proactively connect to already-joined peers, then wait until the
        // whole population has been connected with me
        for (peer, conn_addr) in to_peers {
            transport_hub.connect_to_peer(peer, conn_addr).await?;
        }
        transport_hub.wait_for_group(population).await?;

        // setup external API module, ready to take in client requests
        let external_api = ExternalApi::new_and_setup(
            id,
            api_addr,
            Duration::from_millis(config.batch_interval_ms),
            config.max_batch_size,
        )
        .await?;

        let mut expiry_interval = time::interval(Duration::from_millis(
            config.expiry_check_interval_ms,
        ));
        expiry_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut peer_synced = Bitmap::new(population, false);
        peer_synced.set(id, true)?;

        Ok(ConclaveReplica {
            id,
            population,
            quorum_cnt: (population / 2) + 1,
            config,
            _api_addr: api_addr,
            _p2p_addr: p2p_addr,
            control_hub,
            external_api,
            state_machine,
            transport_hub,
            heartbeater,
            members_view,
            leader: None,
            role: Role::Follower,
            tracker: TermTracker::new(),
            log: vec![],
            start_slot: 0,
            commit_bar: 0,
            apply_bar: 0,
            exec_bar: 0,
            committed_pos: LogPosition::ZERO,
            base_pos: LogPosition::ZERO,
            activation: None,
            activation_timer: Timer::default(),
            sessions: SessionTable::new(),
            sess_counter: 0,
            deadlines: HashMap::new(),
            closing: HashSet::new(),
            expiry_interval,
            applied_keys: HashSet::new(),
            prospective: HashSet::new(),
            pending: HashMap::new(),
            corr_counter: 0,
            reads: HashMap::new(),
            read_counter: 0,
            peer_synced,
            catching_up: false,
            pending_xfer: VecDeque::new(),
        })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<bool, ConclaveError> {
        // kick off leader activity hearing timer
        self.heartbeater.kickoff_hear_timer()?;

        // main event loop
        loop {
            let activating = self.activation.is_some();
            let is_active = self.is_active_leader();

            tokio::select! {
                // client request batch
                req_batch = self.external_api.get_req_batch() => {
                    if let Err(e) = req_batch {
                        pf_error!("error getting req batch: {}", e);
                        continue;
                    }
                    let req_batch = req_batch.unwrap();
                    if let Err(e) = self.handle_req_batch(req_batch).await {
                        pf_error!("error handling req batch: {}", e);
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    if let Err(e) = msg {
                        pf_error!("error receiving peer msg: {}", e);
                        continue;
                    }
                    let (peer, msg) = msg.unwrap();
                    if let Err(e) = self.handle_msg_recv(peer, msg).await {
                        pf_error!("error handling msg recv <- {}: {}", peer, e);
                    }
                },

                // state machine execution result
                cmd_result = self.state_machine.get_result() => {
                    if let Err(e) = cmd_result {
                        pf_error!("error getting cmd result: {}", e);
                        continue;
                    }
                    let (cmd_id, outcome) = cmd_result.unwrap();
                    if let Err(e) = self.handle_cmd_result(cmd_id, outcome).await {
                        pf_error!("error handling cmd result {}: {}", cmd_id, e);
                    }
                },

                // heartbeat-related event
                hb_event = self.heartbeater.get_event() => {
                    match hb_event {
                        HeartbeatEvent::HearTimeout => {
                            if let Err(e) = self.handle_hear_timeout() {
                                pf_error!("error handling hear timeout: {}", e);
                            }
                        }
                        HeartbeatEvent::SendTicked => {
                            if let Err(e) = self.bcast_heartbeats() {
                                pf_error!("error broadcasting heartbeats: {}", e);
                            }
                        }
                    }
                },

                // activation quorum collection timed out
                _ = self.activation_timer.timeout(), if activating => {
                    if let Err(e) = self.handle_activation_timeout() {
                        pf_error!("error handling activation timeout: {}", e);
                    }
                },

                // session liveness expiry scan (active leader only)
                _ = self.expiry_interval.tick(), if is_active => {
                    if let Err(e) = self.check_session_expiries().await {
                        pf_error!("error checking session expiries: {}", e);
                    }
                },

                // manager control message
                ctrl_msg = self.control_hub.recv_ctrl() => {
                    if let Err(e) = ctrl_msg {
                        pf_error!("error getting ctrl msg: {}", e);
                        continue;
                    }
                    let ctrl_msg = ctrl_msg.unwrap();
                    match self.handle_ctrl_msg(ctrl_msg).await {
                        Ok(terminate) => {
                            if let Some(restart) = terminate {
                                return Ok(restart);
                            }
                        },
                        Err(e) => {
                            pf_error!("error handling ctrl msg: {}", e);
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("server caught termination signal");
                    return Ok(false);
                }
            }
        }
    }

    fn id(&self) -> MemberId {
        self.id
    }
}
