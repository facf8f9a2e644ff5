//! Cluster manager server-facing controller module implementation.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::engine::{LogPosition, Term};
use crate::server::MemberId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, ConclaveError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Control message from/to servers. Control traffic is bidirectional: some
/// initiated by the manager and some by servers.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// Server -> Manager: new server up, requesting the list of peers'
    /// addresses to connect to.
    NewServerJoin {
        id: MemberId,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
    },

    /// Manager -> Server: a list of peers to proactively connect to.
    ConnectToPeers {
        population: u8,
        to_peers: HashMap<MemberId, SocketAddr>,
    },

    /// Manager -> Server: the current membership view (member -> client API
    /// address), pushed on every join.
    MembersView {
        members: HashMap<MemberId, SocketAddr>,
    },

    /// Manager -> Server: you are the selected leader for this term. The
    /// receiving member must still collect quorum term acknowledgements
    /// before serving.
    AssignLeader { term: Term },

    /// Server -> Manager: I stepped up/down as leader of this term.
    LeaderStatus { term: Term, step_up: bool },

    /// Server -> Manager: the leader looks unreachable (or outranked);
    /// carries my term and highest accepted position so the oracle can
    /// prefer best-qualified members.
    SuspectLeader { term: Term, high: LogPosition },

    /// Server -> Manager: leader-elect abandoning activation of this term,
    /// naming the better-qualified member observed.
    AbandonTerm { term: Term, better: MemberId },

    /// Server -> Manager: leave notification.
    Leave,

    /// Manager -> Server: dummy leave reply.
    LeaveReply,
}

/// The server-facing controller API module.
pub(crate) struct ServerReigner {
    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(MemberId, CtrlMsg)>,

    /// Map from member ID -> sender side of its send channel, shared with
    /// the server acceptor task.
    tx_sends: flashmap::ReadHandle<MemberId, mpsc::UnboundedSender<CtrlMsg>>,

    /// Join handle of the server acceptor task.
    _server_acceptor_handle: JoinHandle<()>,
}

// ServerReigner public API implementation
impl ServerReigner {
    /// Creates a new server-facing controller module. Spawns the server
    /// acceptor task. Creates a pair of ID assignment channels owned by the
    /// manager's main event loop.
    pub(crate) async fn new_and_setup(
        srv_addr: SocketAddr,
        tx_id_assign: mpsc::UnboundedSender<()>,
        rx_id_result: mpsc::UnboundedReceiver<(MemberId, u8)>,
    ) -> Result<Self, ConclaveError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<MemberId, mpsc::UnboundedSender<CtrlMsg>>();

        let server_listener = tcp_bind_with_retry(srv_addr, 10).await?;
        let server_acceptor_handle =
            tokio::spawn(Self::server_acceptor_task(
                tx_id_assign,
                rx_id_result,
                tx_recv,
                server_listener,
                tx_sends_write,
            ));

        Ok(ServerReigner {
            rx_recv,
            tx_sends: tx_sends_read,
            _server_acceptor_handle: server_acceptor_handle,
        })
    }

    /// Returns whether a server ID currently has a live control connection.
    pub(crate) fn has_server(&self, server: MemberId) -> bool {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard
            .get(&server)
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Waits for the next control event message from some server.
    pub(crate) async fn recv_ctrl(
        &mut self,
    ) -> Result<(MemberId, CtrlMsg), ConclaveError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Sends a control message to specified server.
    pub(crate) fn send_ctrl(
        &mut self,
        msg: CtrlMsg,
        server: MemberId,
    ) -> Result<(), ConclaveError> {
        let tx_sends_guard = self.tx_sends.guard();
        match tx_sends_guard.get(&server) {
            Some(tx_send) => {
                tx_send.send(msg).map_err(ConclaveError::msg)?;
                Ok(())
            }
            None => {
                logged_err!(
                    "server ID {} not found among active servers",
                    server
                )
            }
        }
    }
}

// ServerReigner server_acceptor task implementation
impl ServerReigner {
    /// Accepts a new server connection, assigning it an ID through the
    /// manager's main event loop.
    async fn accept_new_server(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_id_assign: &mpsc::UnboundedSender<()>,
        rx_id_result: &mut mpsc::UnboundedReceiver<(MemberId, u8)>,
        tx_recv: mpsc::UnboundedSender<(MemberId, CtrlMsg)>,
        tx_sends: &mut flashmap::WriteHandle<
            MemberId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        tx_exit: mpsc::UnboundedSender<MemberId>,
    ) -> Result<(), ConclaveError> {
        // communicate with the manager's main event loop to get the
        // assigned server ID
        tx_id_assign.send(())?;
        let (id, population) =
            rx_id_result.recv().await.ok_or(ConclaveError::msg(
                "failed to get server ID assignment",
            ))?;

        // first send server ID assignment, then population
        stream.write_u8(id).await?;
        stream.write_u8(population).await?;

        let mut tx_sends_guard = tx_sends.guard();
        if let Some(sender) = tx_sends_guard.get(&id) {
            if sender.is_closed() {
                // this server ID crashed or left before; garbage collect
                tx_sends_guard.remove(id);
            } else {
                return logged_err!("duplicate server ID listened: {}", id);
            }
        }
        pf_debug!("accepted new server {}", id);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        tokio::spawn(Self::server_controller_task(
            id, addr, stream, tx_recv, rx_send, tx_exit,
        ));

        tx_sends_guard.publish();
        Ok(())
    }

    /// Removes handles of a left server connection.
    fn remove_left_server(
        id: MemberId,
        tx_sends: &mut flashmap::WriteHandle<
            MemberId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
    ) -> Result<(), ConclaveError> {
        let mut tx_sends_guard = tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!("server {} not found among active ones", id);
        }
        tx_sends_guard.remove(id);
        tx_sends_guard.publish();
        Ok(())
    }

    /// Server acceptor task function.
    async fn server_acceptor_task(
        tx_id_assign: mpsc::UnboundedSender<()>,
        mut rx_id_result: mpsc::UnboundedReceiver<(MemberId, u8)>,
        tx_recv: mpsc::UnboundedSender<(MemberId, CtrlMsg)>,
        server_listener: TcpListener,
        mut tx_sends: flashmap::WriteHandle<
            MemberId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
    ) {
        pf_debug!("server_acceptor task spawned");

        let local_addr = server_listener.local_addr().unwrap();
        pf_info!("accepting servers on '{}'", local_addr);

        // exit channel for getting notified about terminated server
        // controller tasks
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // new server connection
                accepted = server_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!("error accepting server connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = Self::accept_new_server(
                        stream,
                        addr,
                        &tx_id_assign,
                        &mut rx_id_result,
                        tx_recv.clone(),
                        &mut tx_sends,
                        tx_exit.clone(),
                    ).await {
                        pf_error!("error accepting new server: {}", e);
                    }
                },

                // a server controller task exits
                id = rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = Self::remove_left_server(
                        id,
                        &mut tx_sends,
                    ) {
                        pf_error!("error removing left server {}: {}", id, e);
                    }
                },
            }
        }
    }
}

// ServerReigner server_controller task implementation
impl ServerReigner {
    /// Reads a server control message from the TcpStream.
    async fn read_ctrl(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<CtrlMsg, ConclaveError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a control message through the TcpStream.
    fn write_ctrl(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&CtrlMsg>,
    ) -> Result<bool, ConclaveError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Server control message listener and sender task function.
    async fn server_controller_task(
        id: MemberId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<(MemberId, CtrlMsg)>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
        tx_exit: mpsc::UnboundedSender<MemberId>,
    ) {
        pf_debug!("server_controller task for {} '{}' spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to server
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg)
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    pf_debug!("should start retrying ctrl send -> {}", id);
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("error sending -> {}: {}", id, e);
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_ctrl(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None
                    ) {
                        Ok(true) => {
                            pf_debug!("finished retrying last ctrl send -> {}", id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("still should retry last ctrl send -> {}", id);
                        }
                        Err(e) => {
                            pf_error!("error retrying last ctrl send -> {}: {}", id, e);
                        }
                    }
                },

                // receives control message from server
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(CtrlMsg::Leave) => {
                            // server leaving, send dummy reply and break
                            let msg = CtrlMsg::LeaveReply;
                            if let Err(e) = Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg)
                            ) {
                                pf_error!("error replying -> {}: {}", id, e);
                            } else {
                                pf_debug!("server {} has left", id);
                            }
                            break;
                        },

                        Ok(CtrlMsg::NewServerJoin {
                            id,
                            mut api_addr,
                            mut p2p_addr
                        }) => {
                            // the server probably reported its local bind
                            // addresses; fill in its remote IP known from
                            // accepting the connection to make them valid
                            // remote addresses
                            let conn_ip = conn_write.peer_addr().unwrap().ip();
                            api_addr.set_ip(conn_ip);
                            p2p_addr.set_ip(conn_ip);

                            let msg = CtrlMsg::NewServerJoin {
                                id,
                                api_addr,
                                p2p_addr
                            };
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!(
                                    "error sending to tx_recv for {}: {}",
                                    id, e);
                            }
                        },

                        Ok(msg) => {
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!(
                                    "error sending to tx_recv for {}: {}",
                                    id, e);
                            }
                        },

                        Err(_e) => {
                            // probably the server exited ungracefully
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("server_controller task for {} '{}' exited", id, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ControlHub;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_send_recv() -> Result<(), ConclaveError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server side
            barrier2.wait().await;
            let mut hub =
                ControlHub::new_and_setup("127.0.0.1:56200".parse()?).await?;
            assert_eq!(hub.me, 0);
            assert_eq!(hub.population, 1);
            // send a message to manager
            hub.send_ctrl(CtrlMsg::NewServerJoin {
                id: hub.me,
                api_addr: "127.0.0.1:56110".parse()?,
                p2p_addr: "127.0.0.1:56120".parse()?,
            })?;
            // recv a message from manager
            assert_eq!(
                hub.recv_ctrl().await?,
                CtrlMsg::ConnectToPeers {
                    population: 1,
                    to_peers: HashMap::new(),
                }
            );
            Ok::<(), ConclaveError>(())
        });
        // manager side
        let (tx_id_assign, mut rx_id_assign) = mpsc::unbounded_channel();
        let (tx_id_result, rx_id_result) = mpsc::unbounded_channel();
        let mut reigner = ServerReigner::new_and_setup(
            "127.0.0.1:56200".parse()?,
            tx_id_assign,
            rx_id_result,
        )
        .await?;
        barrier.wait().await;
        // assign server 0
        rx_id_assign.recv().await;
        tx_id_result.send((0, 1))?;
        let (id, msg) = reigner.recv_ctrl().await?;
        assert_eq!(id, 0);
        assert_eq!(
            msg,
            CtrlMsg::NewServerJoin {
                id: 0,
                api_addr: "127.0.0.1:56110".parse()?,
                p2p_addr: "127.0.0.1:56120".parse()?
            }
        );
        // send reply to server 0
        reigner.send_ctrl(
            CtrlMsg::ConnectToPeers {
                population: 1,
                to_peers: HashMap::new(),
            },
            id,
        )?;
        Ok(())
    }
}
