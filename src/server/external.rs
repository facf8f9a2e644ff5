//! Conclave server external client-facing API module implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::server::{Command, CommandResult, Credential, MemberId, SessionId};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, ConclaveError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// External API request ID type, client-local.
pub type RequestId = u64;

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Open a new session owned by the serving member.
    Open { id: RequestId, timeout_ms: u64 },

    /// Attach an existing session to the serving member, moving its
    /// ownership here. Requires the session's secret credential.
    Attach {
        id: RequestId,
        session: SessionId,
        credential: Credential,
    },

    /// Regular single-command request under a session.
    Req {
        id: RequestId,
        session: SessionId,
        cmd: Command,
    },

    /// Atomic multi-command batch under a session: all commands share one
    /// log position and either all apply or none do.
    Multi {
        id: RequestId,
        session: SessionId,
        cmds: Vec<Command>,
    },

    /// Read-after-write barrier: round-trips through the commit pipeline.
    Sync { id: RequestId, session: SessionId },

    /// Explicitly close a session.
    Close { id: RequestId, session: SessionId },

    /// Query the static ensemble membership view.
    Members { id: RequestId },

    /// Client leave notification.
    Leave,
}

impl ApiRequest {
    /// Gets the request ID if the variant carries one.
    pub fn req_id(&self) -> Option<RequestId> {
        match self {
            ApiRequest::Open { id, .. }
            | ApiRequest::Attach { id, .. }
            | ApiRequest::Req { id, .. }
            | ApiRequest::Multi { id, .. }
            | ApiRequest::Sync { id, .. }
            | ApiRequest::Close { id, .. }
            | ApiRequest::Members { id } => Some(*id),
            ApiRequest::Leave => None,
        }
    }
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to a regular request.
    Reply {
        /// ID of the corresponding client request.
        id: RequestId,

        /// Operation result, or the reportable error condition.
        result: Result<OpResult, OpError>,
    },

    /// Reply to client leave notification.
    Leave,
}

/// Successful operation results.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum OpResult {
    /// New session opened.
    Session {
        session: SessionId,
        credential: Credential,
    },

    /// Session ownership moved to the serving member.
    Attached,

    /// Single command result.
    Cmd(CommandResult),

    /// Atomic batch results, in submission order.
    Multi(Vec<CommandResult>),

    /// Barrier completed; all writes committed before it are visible.
    Synced,

    /// Session closed.
    Closed,

    /// Ensemble membership view, including the serving member.
    Members {
        members: Vec<(MemberId, SocketAddr)>,
    },
}

/// Reportable error conditions surfaced to clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum OpError {
    /// Session unknown here, ownership invalidated, or the contacted member
    /// cannot serve this session. Recoverable by re-attaching elsewhere.
    ConnectionLoss,

    /// No activated leader known, or the active member set is below quorum.
    /// Recoverable by retrying with backoff.
    NotReady,

    /// Lost a session-move race; the committed owner changed underneath.
    StaleOwner,

    /// A sub-command's precondition failed; the whole batch was rejected
    /// before replication with no partial effects.
    AtomicBatchRejected { index: usize },
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My member ID.
    _me: MemberId,

    /// Maximum number of requests to batch per tick.
    max_batch_size: usize,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies: flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Notify used as batch dumping signal, shared with the batch ticker
    /// task.
    batch_notify: Arc<Notify>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Join handle of the batch ticker task.
    _batch_ticker_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module. Spawns the client acceptor task
    /// and the batch ticker task. Creates a req channel for buffering
    /// incoming client requests.
    pub(crate) async fn new_and_setup(
        me: MemberId,
        api_addr: SocketAddr,
        batch_interval: Duration,
        max_batch_size: usize,
    ) -> Result<Self, ConclaveError> {
        if batch_interval < Duration::from_micros(1) {
            return logged_err!(
                "batch_interval {} us too small",
                batch_interval.as_micros()
            );
        }
        if max_batch_size == 0 {
            return logged_err!("invalid max_batch_size {}", max_batch_size);
        }

        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;

        let batch_notify = Arc::new(Notify::new());

        let client_acceptor_handle = tokio::spawn(Self::client_acceptor_task(
            me,
            tx_req,
            client_listener,
            tx_replies_write,
        ));

        let batch_ticker_handle = tokio::spawn(Self::batch_ticker_task(
            batch_interval,
            batch_notify.clone(),
        ));

        Ok(ExternalApi {
            _me: me,
            max_batch_size,
            rx_req,
            tx_replies: tx_replies_read,
            batch_notify,
            _client_acceptor_handle: client_acceptor_handle,
            _batch_ticker_handle: batch_ticker_handle,
        })
    }

    /// Returns whether a client ID is connected to me.
    pub(crate) fn has_client(&self, client: ClientId) -> bool {
        let tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.contains_key(&client)
    }

    /// Waits for the next batch dumping signal and collects all requests
    /// currently in the req channel (up to `max_batch_size`). Returns a
    /// non-empty `Vec` of requests on success.
    pub(crate) async fn get_req_batch(
        &mut self,
    ) -> Result<Vec<(ClientId, ApiRequest)>, ConclaveError> {
        // ignore ticks with an empty batch
        let mut batch = Vec::new();
        while batch.is_empty() {
            self.batch_notify.notified().await;

            while batch.len() < self.max_batch_size {
                match self.rx_req.try_recv() {
                    Ok((client, req)) => batch.push((client, req)),
                    Err(TryRecvError::Empty) => break,
                    Err(e) => return Err(ConclaveError::from(e)),
                }
            }
        }

        debug_assert!(!batch.is_empty());
        Ok(batch)
    }

    /// Sends a reply back to client by sending to its reply channel.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), ConclaveError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                // a client that disconnected before its reply was produced
                // simply has its callback dropped here
                if let Err(e) = tx_reply.send(reply) {
                    pf_debug!(
                        "dropping reply to disconnected client {}: {}",
                        client,
                        e
                    );
                }
                Ok(())
            }
            None => {
                pf_debug!(
                    "client ID {} not found among active clients",
                    client
                );
                Ok(())
            }
        }
    }
}

// ExternalApi client_acceptor task implementation
impl ExternalApi {
    /// Client acceptor task function.
    async fn client_acceptor_task(
        me: MemberId,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) {
        pf_debug!("client_acceptor task spawned");

        let local_addr = client_listener.local_addr().unwrap();
        pf_info!("accepting clients on '{}'", local_addr);

        loop {
            let accepted = client_listener.accept().await;
            if let Err(e) = accepted {
                pf_warn!("error accepting client connection: {}", e);
                continue;
            }
            let (mut stream, addr) = accepted.unwrap();

            let id = stream.read_u64().await; // receive client ID
            if let Err(e) = id {
                pf_error!("error receiving new client ID: {}", e);
                continue;
            }
            let id = id.unwrap();

            let mut tx_replies_guard = tx_replies.guard();
            if let Some(sender) = tx_replies_guard.get(&id) {
                if sender.is_closed() {
                    // if this client ID has left before, garbage collect it
                    // now
                    tx_replies_guard.remove(id);
                } else {
                    pf_error!("duplicate client ID listened: {}", id);
                    continue;
                }
            }
            pf_debug!("accepted new client {}", id);

            let (tx_reply, rx_reply) = mpsc::unbounded_channel();
            tx_replies_guard.insert(id, tx_reply);

            tokio::spawn(Self::client_servant_task(
                me,
                id,
                addr,
                stream,
                tx_req.clone(),
                rx_reply,
            ));

            tx_replies_guard.publish();
        }
    }
}

// ExternalApi client_servant task implementation
impl ExternalApi {
    /// Client request listener and reply sender task function.
    async fn client_servant_task(
        _me: MemberId,
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<ApiReply>,
    ) {
        pf_debug!("client_servant task for {} ({}) spawned", id, addr);

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
                                Ok(true) => {
                                    // pf_trace!("replied to {} reply {:?}", id, reply);
                                }
                                Ok(false) => {
                                    pf_debug!("should start retrying reply send -> {}", id);
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("error replying to {}: {}", id, e);
                                    break;
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write::<ApiReply, _>(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!("finished retrying last reply send -> {}", id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("still should retry last reply send -> {}", id);
                        }
                        Err(e) => {
                            pf_error!("error retrying reply to {}: {}", id, e);
                            break;
                        }
                    }
                },

                // receives client request
                req = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match req {
                        // client leaving, send dummy reply and break
                        Ok(ApiRequest::Leave) => {
                            let mut sent = safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&ApiReply::Leave),
                            );
                            while let Ok(false) = sent {
                                if conn_write.writable().await.is_err() {
                                    break;
                                }
                                sent = safe_tcp_write::<ApiReply, _>(
                                    &mut write_buf,
                                    &mut write_buf_cursor,
                                    &conn_write,
                                    None,
                                );
                            }
                            pf_debug!("client {} has left", id);
                            break;
                        },

                        Ok(req) => {
                            // pf_trace!("request from {} req {:?}", id, req);
                            if let Err(e) = tx_req.send((id, req)) {
                                pf_error!(
                                    "error sending to tx_req for {}: {}", id, e
                                );
                            }
                        },

                        Err(_e) => {
                            // probably the client exited without `leave()`
                            pf_debug!("connection from {} lost", id);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("client_servant task for {} ({}) exited", id, addr);
    }
}

// ExternalApi batch_ticker task implementation
impl ExternalApi {
    /// Batch ticker task function.
    async fn batch_ticker_task(
        batch_interval: Duration,
        batch_notify: Arc<Notify>,
    ) {
        let mut interval = time::interval(batch_interval);

        loop {
            interval.tick().await;
            batch_notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientApiStub;
    use tokio::sync::Barrier;
    use tokio::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn api_setup() -> Result<(), ConclaveError> {
        assert!(ExternalApi::new_and_setup(
            0,
            "127.0.0.1:57700".parse()?,
            Duration::from_nanos(10),
            0,
        )
        .await
        .is_err());
        let api = ExternalApi::new_and_setup(
            0,
            "127.0.0.1:57710".parse()?,
            Duration::from_millis(1),
            100,
        )
        .await?;
        assert!(!api.has_client(7));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_req_reply() -> Result<(), ConclaveError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server-side
            let mut api = ExternalApi::new_and_setup(
                0,
                "127.0.0.1:57720".parse()?,
                Duration::from_millis(1),
                5,
            )
            .await?;
            barrier2.wait().await;
            let mut reqs: Vec<(ClientId, ApiRequest)> = vec![];
            while reqs.len() < 2 {
                let mut req_batch = api.get_req_batch().await?;
                reqs.append(&mut req_batch);
            }
            let client = reqs[0].0;
            assert!(api.has_client(client));
            assert_eq!(
                reqs[0].1,
                ApiRequest::Open {
                    id: 0,
                    timeout_ms: 5000,
                }
            );
            assert_eq!(reqs[1].1, ApiRequest::Members { id: 1 });
            api.send_reply(
                ApiReply::Reply {
                    id: 0,
                    result: Ok(OpResult::Session {
                        session: 777,
                        credential: 0xdead,
                    }),
                },
                client,
            )?;
            api.send_reply(
                ApiReply::Reply {
                    id: 1,
                    result: Err(OpError::NotReady),
                },
                client,
            )?;
            Ok::<(), ConclaveError>(())
        });
        // client-side
        barrier.wait().await;
        let mut api_stub =
            ClientApiStub::new_by_connect(2857, "127.0.0.1:57720".parse()?)
                .await?;
        let mut sent = api_stub.send_req(Some(&ApiRequest::Open {
            id: 0,
            timeout_ms: 5000,
        }))?;
        while !sent {
            sent = api_stub.send_req(None)?;
        }
        let mut sent = api_stub.send_req(Some(&ApiRequest::Members { id: 1 }))?;
        while !sent {
            sent = api_stub.send_req(None)?;
        }
        assert_eq!(
            api_stub.recv_reply().await?,
            ApiReply::Reply {
                id: 0,
                result: Ok(OpResult::Session {
                    session: 777,
                    credential: 0xdead,
                }),
            }
        );
        assert_eq!(
            api_stub.recv_reply().await?,
            ApiReply::Reply {
                id: 1,
                result: Err(OpError::NotReady),
            }
        );
        Ok(())
    }
}
