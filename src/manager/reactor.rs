//! Cluster manager client-facing reactor module implementation.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::MemberId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, ConclaveError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Control event request from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlRequest {
    /// Query the set of active servers and their info.
    QueryInfo,

    /// Client leave notification.
    Leave,
}

/// Control event reply to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlReply {
    /// Reply to server info query.
    QueryInfo {
        /// Number of members in the ensemble.
        population: u8,
        /// Map from member ID -> (client API addr, is_leader).
        servers: HashMap<MemberId, (SocketAddr, bool)>,
    },

    /// Reply to client leave notification.
    Leave,
}

/// The client-facing reactor API module.
pub(crate) struct ClientReactor {
    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, CtrlRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<CtrlReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

// ClientReactor public API implementation
impl ClientReactor {
    /// Creates a new client-facing reactor module and spawns the client
    /// acceptor task. Creates a req channel for buffering incoming control
    /// requests.
    pub(crate) async fn new_and_setup(
        cli_addr: SocketAddr,
    ) -> Result<Self, ConclaveError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<CtrlReply>>();

        let client_listener = tcp_bind_with_retry(cli_addr, 10).await?;
        let client_acceptor_handle = tokio::spawn(Self::client_acceptor_task(
            tx_req,
            client_listener,
            tx_replies_write,
        ));

        Ok(ClientReactor {
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }

    /// Waits for the next control event request from some client.
    pub(crate) async fn recv_req(
        &mut self,
    ) -> Result<(ClientId, CtrlRequest), ConclaveError> {
        match self.rx_req.recv().await {
            Some((id, req)) => Ok((id, req)),
            None => logged_err!("req channel has been closed"),
        }
    }

    /// Sends a control event reply to specified client.
    pub(crate) fn send_reply(
        &mut self,
        reply: CtrlReply,
        client: ClientId,
    ) -> Result<(), ConclaveError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(ConclaveError::msg)?;
                Ok(())
            }
            None => {
                logged_err!(
                    "client ID {} not found among active clients",
                    client
                )
            }
        }
    }
}

// ClientReactor client_acceptor task implementation
impl ClientReactor {
    /// Client acceptor task function: assigns client IDs from a counter and
    /// spawns one responder task per connected client.
    async fn client_acceptor_task(
        tx_req: mpsc::UnboundedSender<(ClientId, CtrlRequest)>,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<CtrlReply>,
        >,
    ) {
        pf_debug!("client_acceptor task spawned");

        let local_addr = client_listener.local_addr().unwrap();
        pf_info!("accepting clients on '{}'", local_addr);

        let mut next_client_id: ClientId = 1;
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // new client connection
                accepted = client_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!("error accepting client connection: {}", e);
                        continue;
                    }
                    let (mut stream, addr) = accepted.unwrap();

                    // assign a fresh client ID and send it over
                    let id = next_client_id;
                    next_client_id += 1;
                    if let Err(e) = stream.write_u64(id).await {
                        pf_error!("error assigning new client ID: {}", e);
                        continue;
                    }
                    pf_debug!("accepted new client {}", id);

                    let (tx_reply, rx_reply) = mpsc::unbounded_channel();
                    let mut tx_replies_guard = tx_replies.guard();
                    tx_replies_guard.insert(id, tx_reply);
                    tx_replies_guard.publish();

                    tokio::spawn(Self::client_responder_task(
                        id,
                        addr,
                        stream,
                        tx_req.clone(),
                        rx_reply,
                        tx_exit.clone(),
                    ));
                },

                // a client responder task exits
                id = rx_exit.recv() => {
                    let id = id.unwrap();
                    let mut tx_replies_guard = tx_replies.guard();
                    tx_replies_guard.remove(id);
                    tx_replies_guard.publish();
                },
            }
        }
    }

    /// Client responder task function.
    async fn client_responder_task(
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, CtrlRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<CtrlReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) {
        pf_debug!("client_responder task for {} '{}' spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply to send back
                reply = rx_reply.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            match safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("error replying to {}: {}", id, e);
                                    break;
                                }
                            }
                        },
                        None => break,
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write::<CtrlReply, _>(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {},
                        Err(e) => {
                            pf_error!("error retrying reply to {}: {}", id, e);
                            break;
                        }
                    }
                },

                // receives client control request
                req = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(CtrlRequest::Leave) => {
                            let reply = CtrlReply::Leave;
                            if let Err(e) = safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                pf_error!("error replying to {}: {}", id, e);
                            } else {
                                pf_debug!("client {} has left", id);
                            }
                            break;
                        },

                        Ok(req) => {
                            if let Err(e) = tx_req.send((id, req)) {
                                pf_error!(
                                    "error sending to tx_req for {}: {}",
                                    id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the client exited ungracefully
                        }
                    }
                },
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("client_responder task for {} '{}' exited", id, addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientCtrlStub;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_query_info() -> Result<(), ConclaveError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // client side
            barrier2.wait().await;
            let mut ctrl_stub =
                ClientCtrlStub::new_by_connect("127.0.0.1:56300".parse()?)
                    .await?;
            let mut sent = ctrl_stub.send_req(Some(&CtrlRequest::QueryInfo))?;
            while !sent {
                sent = ctrl_stub.send_req(None)?;
            }
            let reply = ctrl_stub.recv_reply().await?;
            assert_eq!(
                reply,
                CtrlReply::QueryInfo {
                    population: 3,
                    servers: HashMap::from([
                        (0, ("127.0.0.1:56150".parse()?, true)),
                        (1, ("127.0.0.1:56151".parse()?, false)),
                    ]),
                }
            );
            Ok::<(), ConclaveError>(())
        });
        // manager side
        let mut reactor =
            ClientReactor::new_and_setup("127.0.0.1:56300".parse()?).await?;
        barrier.wait().await;
        let (client, req) = reactor.recv_req().await?;
        assert_eq!(req, CtrlRequest::QueryInfo);
        reactor.send_reply(
            CtrlReply::QueryInfo {
                population: 3,
                servers: HashMap::from([
                    (0, ("127.0.0.1:56150".parse()?, true)),
                    (1, ("127.0.0.1:56151".parse()?, false)),
                ]),
            },
            client,
        )?;
        Ok(())
    }
}
