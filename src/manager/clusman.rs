//! Conclave cluster manager oracle implementation.
//!
//! The manager bootstraps membership (ID assignment, peer address
//! distribution) and plays the election collaborator role: it selects which
//! member leads which term and delivers `AssignLeader` notices. How the
//! winner is chosen is deliberately simple -- the engine only consumes the
//! resulting `(member, term)` events and never depends on the policy.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::engine::{LogPosition, Term};
use crate::manager::{
    ClientReactor, CtrlMsg, CtrlReply, CtrlRequest, ServerReigner,
};
use crate::server::MemberId;
use crate::utils::ConclaveError;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// Minimum delay between two leader assignments, giving a leader-elect time
/// to activate (or explicitly abandon) before suspicion reports can trigger
/// another round.
const ASSIGN_COOLDOWN: Duration = Duration::from_millis(5000);

/// Information about an active server.
#[derive(Debug, Clone)]
struct ServerInfo {
    /// The server's client-facing API address.
    api_addr: SocketAddr,

    /// The server's internal peer-peer API address.
    p2p_addr: SocketAddr,

    /// This server believes it is the activated leader.
    is_leader: bool,
}

/// Standalone cluster manager oracle.
pub struct ClusterManager {
    /// Address string for server-facing control messages API.
    _srv_addr: SocketAddr,

    /// Address string for client-facing control events API.
    _cli_addr: SocketAddr,

    /// Total number of members in the ensemble.
    population: u8,

    /// ServerReigner module.
    server_reigner: ServerReigner,

    /// Receiver side of the server ID assignment channel.
    rx_id_assign: mpsc::UnboundedReceiver<()>,

    /// Sender side of the server ID assignment result channel.
    tx_id_result: mpsc::UnboundedSender<(MemberId, u8)>,

    /// ClientReactor module.
    client_reactor: ClientReactor,

    /// Information of current active servers.
    server_info: HashMap<MemberId, ServerInfo>,

    /// Highest term assigned so far (0 means no leader ever assigned).
    current_term: Term,

    /// Member currently assigned as leader, if any.
    current_leader: Option<MemberId>,

    /// Latest leader suspicion report per member: (highest position,
    /// report time).
    suspects: HashMap<MemberId, (LogPosition, Instant)>,

    /// Time of the last leader assignment.
    last_assign: Option<Instant>,
}

impl ClusterManager {
    /// Creates a new standalone cluster manager and sets up required
    /// functionality modules.
    pub async fn new_and_setup(
        srv_addr: SocketAddr,
        cli_addr: SocketAddr,
        population: u8,
    ) -> Result<Self, ConclaveError> {
        if population == 0 {
            return logged_err!("invalid population {}", population);
        }
        let _ = crate::ME.set("m".into());

        let (tx_id_assign, rx_id_assign) = mpsc::unbounded_channel();
        let (tx_id_result, rx_id_result) = mpsc::unbounded_channel();
        let server_reigner =
            ServerReigner::new_and_setup(srv_addr, tx_id_assign, rx_id_result)
                .await?;

        let client_reactor = ClientReactor::new_and_setup(cli_addr).await?;

        Ok(ClusterManager {
            _srv_addr: srv_addr,
            _cli_addr: cli_addr,
            population,
            server_reigner,
            rx_id_assign,
            tx_id_result,
            client_reactor,
            server_info: HashMap::new(),
            current_term: 0,
            current_leader: None,
            suspects: HashMap::new(),
            last_assign: None,
        })
    }

    /// Assigns the first vacant server ID to a newly connected server. An
    /// ID whose previous holder's control connection died (crash/restart)
    /// counts as vacant again.
    fn assign_server_id(&mut self) -> Result<(), ConclaveError> {
        for id in 0..self.population {
            if !self.server_reigner.has_server(id) {
                self.tx_id_result.send((id, self.population))?;
                return Ok(());
            }
        }

        logged_err!("no server ID < population left available")
    }

    /// Main event loop logic of the cluster manager. Breaks out of the loop
    /// only upon catching the termination signal to the process.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ConclaveError> {
        loop {
            tokio::select! {
                // receiving server ID assignment request
                _ = self.rx_id_assign.recv() => {
                    if let Err(e) = self.assign_server_id() {
                        pf_error!("error assigning new server ID: {}", e);
                    }
                },

                // receiving server control message
                ctrl_msg = self.server_reigner.recv_ctrl() => {
                    if let Err(e) = ctrl_msg {
                        pf_error!("error receiving ctrl msg: {}", e);
                        continue;
                    }
                    let (server, msg) = ctrl_msg.unwrap();
                    if let Err(e) = self.handle_ctrl_msg(server, msg) {
                        pf_error!("error handling ctrl msg <- {}: {}",
                                       server, e);
                    }
                },

                // receiving client control request
                ctrl_req = self.client_reactor.recv_req() => {
                    if let Err(e) = ctrl_req {
                        pf_error!("error receiving ctrl req: {}", e);
                        continue;
                    }
                    let (client, req) = ctrl_req.unwrap();
                    if let Err(e) = self.handle_ctrl_req(client, req) {
                        pf_error!("error handling ctrl req <- {}: {}",
                                       client, e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("manager caught termination signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

// ClusterManager server-initiated control message handlers
impl ClusterManager {
    /// Handler of NewServerJoin message: either a fresh join or a rejoin
    /// after crash/restart.
    fn handle_new_server_join(
        &mut self,
        server: MemberId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
    ) -> Result<(), ConclaveError> {
        let rejoin = self.server_info.contains_key(&server);

        // tell it to connect to all other known servers
        let to_peers: HashMap<MemberId, SocketAddr> = self
            .server_info
            .iter()
            .filter(|(&s, _)| s != server)
            .map(|(&s, info)| (s, info.p2p_addr))
            .collect();
        self.server_reigner.send_ctrl(
            CtrlMsg::ConnectToPeers {
                population: self.population,
                to_peers,
            },
            server,
        )?;

        // save/update this server's info
        self.server_info.insert(
            server,
            ServerInfo {
                api_addr,
                p2p_addr,
                is_leader: false,
            },
        );
        if rejoin {
            pf_info!("server {} rejoined", server);
            if self.current_leader == Some(server) {
                // it lost all leader state; followers will report suspicion
                self.current_leader = None;
            }
        }

        // push the updated membership view to everyone connected
        self.bcast_members_view()?;

        // once the full ensemble has joined for the first time, assign the
        // initial leader
        if !rejoin
            && self.server_info.len() == self.population as usize
            && self.current_term == 0
        {
            self.assign_leader(0, 1)?;
        }
        Ok(())
    }

    /// Handler of LeaderStatus message.
    fn handle_leader_status(
        &mut self,
        server: MemberId,
        term: Term,
        step_up: bool,
    ) -> Result<(), ConclaveError> {
        if !self.server_info.contains_key(&server) {
            return logged_err!("leader status got unknown ID: {}", server);
        }

        if step_up {
            pf_info!("server {} stepped up for term {}", server, term);
            for (&s, info) in self.server_info.iter_mut() {
                info.is_leader = s == server;
            }
            self.current_leader = Some(server);
            if term > self.current_term {
                self.current_term = term;
            }
            self.suspects.clear();
        } else {
            pf_info!("server {} stepped down at term {}", server, term);
            self.server_info.get_mut(&server).unwrap().is_leader = false;
        }
        Ok(())
    }

    /// Handler of SuspectLeader report: when a quorum of members recently
    /// reported the current arrangement unreachable, assign a fresh term to
    /// the best-qualified reporter (the one with the highest position).
    fn handle_suspect_leader(
        &mut self,
        server: MemberId,
        term: Term,
        high: LogPosition,
    ) -> Result<(), ConclaveError> {
        pf_debug!(
            "suspicion <- {} at term {} high {}",
            server,
            term,
            high
        );
        self.suspects.insert(server, (high, Instant::now()));

        // respect the assignment cooldown so a fresh leader-elect gets its
        // chance to activate first
        let now = Instant::now();
        if let Some(last) = self.last_assign {
            if now < last + ASSIGN_COOLDOWN {
                return Ok(());
            }
        }

        let since = self.last_assign;
        let mut recent: Vec<(MemberId, LogPosition)> = Vec::new();
        for (&s, &(h, at)) in self.suspects.iter() {
            if since.map_or(true, |last| at >= last) {
                recent.push((s, h));
            }
        }
        let quorum = (self.population / 2) + 1;
        if (recent.len() as u8) < quorum {
            return Ok(());
        }

        let chosen = Self::choose_new_leader(&recent).unwrap();
        self.assign_leader(chosen, self.current_term + 1)
    }

    /// Chooses the reporter holding the highest position (lowest ID on
    /// ties) as the next leader candidate.
    fn choose_new_leader(
        recent: &[(MemberId, LogPosition)],
    ) -> Option<MemberId> {
        recent
            .iter()
            .max_by(|(sa, ha), (sb, hb)| ha.cmp(hb).then(sb.cmp(sa)))
            .map(|&(s, _)| s)
    }

    /// Handler of AbandonTerm from a leader-elect: immediately hand the
    /// next term to the better-qualified member it observed.
    fn handle_abandon_term(
        &mut self,
        server: MemberId,
        term: Term,
        better: MemberId,
    ) -> Result<(), ConclaveError> {
        pf_warn!(
            "server {} abandoned term {}, deferring to {}",
            server,
            term,
            better
        );
        if term != self.current_term {
            return Ok(()); // stale abandonment
        }
        self.assign_leader(better, term + 1)
    }

    /// Sends a leader assignment notice for a fresh term.
    fn assign_leader(
        &mut self,
        member: MemberId,
        term: Term,
    ) -> Result<(), ConclaveError> {
        pf_info!("assigning member {} as leader for term {}", member, term);
        self.current_term = term;
        self.current_leader = Some(member);
        self.last_assign = Some(Instant::now());
        self.suspects.clear();

        self.server_reigner
            .send_ctrl(CtrlMsg::AssignLeader { term }, member)
    }

    /// Pushes the current membership view to all connected servers.
    fn bcast_members_view(&mut self) -> Result<(), ConclaveError> {
        let members: HashMap<MemberId, SocketAddr> = self
            .server_info
            .iter()
            .map(|(&s, info)| (s, info.api_addr))
            .collect();
        let targets: Vec<MemberId> =
            self.server_info.keys().copied().collect();
        for server in targets {
            if let Err(e) = self.server_reigner.send_ctrl(
                CtrlMsg::MembersView {
                    members: members.clone(),
                },
                server,
            ) {
                pf_debug!("could not push view to {}: {}", server, e);
            }
        }
        Ok(())
    }

    /// Synthesized handler of server-initiated control messages.
    fn handle_ctrl_msg(
        &mut self,
        server: MemberId,
        msg: CtrlMsg,
    ) -> Result<(), ConclaveError> {
        match msg {
            CtrlMsg::NewServerJoin {
                id,
                api_addr,
                p2p_addr,
            } => {
                if id != server {
                    return logged_err!(
                        "server join with mismatch ID: {} != {}",
                        id,
                        server
                    );
                }
                self.handle_new_server_join(server, api_addr, p2p_addr)?;
            }

            CtrlMsg::LeaderStatus { term, step_up } => {
                self.handle_leader_status(server, term, step_up)?;
            }

            CtrlMsg::SuspectLeader { term, high } => {
                self.handle_suspect_leader(server, term, high)?;
            }

            CtrlMsg::AbandonTerm { term, better } => {
                self.handle_abandon_term(server, term, better)?;
            }

            _ => {} // ignore all other types
        }

        Ok(())
    }
}

// ClusterManager client-initiated control request handlers
impl ClusterManager {
    /// Handler of client QueryInfo request.
    fn handle_client_query_info(
        &mut self,
        client: ClientId,
    ) -> Result<(), ConclaveError> {
        let servers: HashMap<MemberId, (SocketAddr, bool)> = self
            .server_info
            .iter()
            .map(|(&server, info)| (server, (info.api_addr, info.is_leader)))
            .collect();

        self.client_reactor.send_reply(
            CtrlReply::QueryInfo {
                population: self.population,
                servers,
            },
            client,
        )
    }

    /// Synthesized handler of client-initiated control requests.
    fn handle_ctrl_req(
        &mut self,
        client: ClientId,
        req: CtrlRequest,
    ) -> Result<(), ConclaveError> {
        #[allow(clippy::single_match)]
        match req {
            CtrlRequest::QueryInfo => {
                self.handle_client_query_info(client)?;
            }

            _ => {} // `Leave` is consumed by the responder task
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_highest_position() {
        let recent = vec![
            (0, LogPosition::new(2, 5)),
            (1, LogPosition::new(3, 0)),
            (2, LogPosition::new(2, 9)),
        ];
        // term dominates the in-term sequence
        assert_eq!(ClusterManager::choose_new_leader(&recent), Some(1));
    }

    #[test]
    fn choose_lowest_id_on_tie() {
        let recent = vec![
            (2, LogPosition::new(1, 7)),
            (1, LogPosition::new(1, 7)),
            (4, LogPosition::new(1, 3)),
        ];
        assert_eq!(ClusterManager::choose_new_leader(&recent), Some(1));
    }

    #[test]
    fn choose_none_when_empty() {
        assert_eq!(ClusterManager::choose_new_leader(&[]), None);
    }
}
