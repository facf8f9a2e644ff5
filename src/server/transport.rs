//! Conclave server internal peer-to-peer transport module implementation.
//!
//! One messenger task runs per connected peer; these connections are the
//! replication channels carrying proposals, acks, and forwarded requests.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::server::MemberId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, Bitmap, ConclaveError,
};

use bytes::BytesMut;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Server internal TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My member ID.
    me: MemberId,

    /// Ensemble size (total number of members).
    population: u8,

    /// Map from peer ID -> sender side of its send channel.
    tx_sends: HashMap<MemberId, mpsc::UnboundedSender<Msg>>,

    /// Sender side of the recv channel, cloned to each messenger task.
    tx_recv: mpsc::UnboundedSender<(MemberId, Msg)>,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(MemberId, Msg)>,

    /// TCP listener for peer connections.
    peer_listener: TcpListener,

    /// Map from peer ID -> messenger task join handles.
    peer_messenger_handles: HashMap<MemberId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new internal transport hub. Binds the TCP listener for
    /// peer connections and creates the recv channel that multiplexes
    /// messages from all messenger tasks.
    pub(crate) async fn new_and_setup(
        me: MemberId,
        population: u8,
        p2p_addr: SocketAddr,
    ) -> Result<Self, ConclaveError> {
        if population == 0 {
            return logged_err!("invalid population {}", population);
        }
        if me >= population {
            return logged_err!("invalid member ID {} of {}", me, population);
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;

        Ok(TransportHub {
            me,
            population,
            tx_sends: HashMap::new(),
            tx_recv,
            rx_recv,
            peer_listener,
            peer_messenger_handles: HashMap::new(),
        })
    }

    /// Connects to a peer actively, sending my ID in handshake. Replaces any
    /// previous connection to that peer (e.g., across its restarts).
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: MemberId,
        addr: SocketAddr,
    ) -> Result<(), ConclaveError> {
        if id == self.me || id >= self.population {
            return logged_err!("invalid peer ID {} to connect", id);
        }

        let mut stream = tcp_connect_with_retry(addr, 10).await?;
        stream.write_u8(self.me).await?; // send my ID

        self.spawn_messenger(id, addr, stream);
        pf_debug!("connected to peer {}", id);
        Ok(())
    }

    /// Waits for a connection attempt from some peer and spawns its
    /// messenger task. Returns the connecting peer's ID.
    pub(crate) async fn wait_on_peer(
        &mut self,
    ) -> Result<MemberId, ConclaveError> {
        let (mut stream, addr) = self.peer_listener.accept().await?;
        let id = stream.read_u8().await?; // receive connecting peer's ID

        if id == self.me || id >= self.population {
            return logged_err!("invalid peer ID {} waited on", id);
        }

        self.spawn_messenger(id, addr, stream);
        pf_debug!("waited on peer {}", id);
        Ok(id)
    }

    /// Waits until connections to all other members of the group have been
    /// established at least once.
    pub(crate) async fn wait_for_group(
        &mut self,
        group: u8,
    ) -> Result<(), ConclaveError> {
        while self.tx_sends.len() + 1 < group as usize {
            self.wait_on_peer().await?;
        }
        pf_info!(
            "connected to group of peers {:?}",
            self.tx_sends.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Sends a message to a specified peer by sending to its send channel.
    /// A dead peer connection is tolerated silently; liveness tracking is
    /// the heartbeat module's job.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: MemberId,
    ) -> Result<(), ConclaveError> {
        match self.tx_sends.get(&peer) {
            Some(tx_send) => {
                if tx_send.send(msg).is_err() {
                    pf_debug!("send channel to peer {} closed", peer);
                }
            }
            None => {
                pf_warn!("peer ID {} not found among connected ones", peer);
            }
        }

        Ok(())
    }

    /// Broadcasts a message to all connected peers (or only those set true
    /// in `target` if given).
    pub(crate) fn bcast_msg(
        &mut self,
        msg: Msg,
        target: Option<Bitmap>,
    ) -> Result<(), ConclaveError> {
        let peers: Vec<MemberId> = self.tx_sends.keys().copied().collect();
        for peer in peers {
            if let Some(ref map) = target {
                if !map.get(peer)? {
                    continue;
                }
            }
            self.send_msg(msg.clone(), peer)?;
        }

        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(MemberId, Msg), ConclaveError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Spawns the messenger task for a newly established peer connection,
    /// replacing (and aborting) any previous one for the same peer.
    fn spawn_messenger(
        &mut self,
        id: MemberId,
        addr: SocketAddr,
        stream: TcpStream,
    ) {
        if let Some(handle) = self.peer_messenger_handles.remove(&id) {
            pf_debug!("replacing connection to peer {}", id);
            handle.abort();
            self.tx_sends.remove(&id);
        }

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        self.tx_sends.insert(id, tx_send);

        let handle = tokio::spawn(Self::peer_messenger_task(
            self.me,
            id,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
        ));
        self.peer_messenger_handles.insert(id, handle);
    }
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Peer messenger task function.
    async fn peer_messenger_task(
        me: MemberId,
        id: MemberId,      // corresponding peer's ID
        addr: SocketAddr,  // corresponding peer's address
        conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(MemberId, Msg)>,
    ) {
        pf_debug!("peer_messenger task for {} ({}) spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send out
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match safe_tcp_write(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {
                                    // pf_trace!("sent to {} msg {:?}", id, msg);
                                }
                                Ok(false) => {
                                    pf_debug!("should start retrying msg send -> {}", id);
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_debug!("error sending to {}: {}", id, e);
                                    break;
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match safe_tcp_write::<Msg, _>(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!("finished retrying last msg send -> {}", id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("still should retry last msg send -> {}", id);
                        }
                        Err(e) => {
                            pf_debug!("error retrying msg send -> {}: {}", id, e);
                            break;
                        }
                    }
                },

                // receives new message from peer
                msg = safe_tcp_read(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            // pf_trace!("recv from {} msg {:?}", id, msg);
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!(
                                    "error sending to tx_recv for {}: {}",
                                    id,
                                    e
                                );
                            }
                        },
                        Err(e) => {
                            // connection severed or peer process gone; the
                            // member itself must stay alive regardless
                            pf_debug!("error receiving msg from {}: {}", id, e);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("peer_messenger task for {} ({}) of {} exited", id, addr, me);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn hub_setup() -> Result<(), ConclaveError> {
        assert!(TransportHub::<TestMsg>::new_and_setup(
            0,
            0,
            "127.0.0.1:58800".parse()?
        )
        .await
        .is_err());
        assert!(TransportHub::<TestMsg>::new_and_setup(
            3,
            3,
            "127.0.0.1:58800".parse()?
        )
        .await
        .is_err());
        let hub = TransportHub::<TestMsg>::new_and_setup(
            0,
            3,
            "127.0.0.1:58800".parse()?,
        )
        .await?;
        assert!(hub.tx_sends.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_send_recv() -> Result<(), ConclaveError> {
        tokio::spawn(async move {
            // member 1
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, 3, "127.0.0.1:58811".parse()?)
                    .await?;
            hub.connect_to_peer(0, "127.0.0.1:58810".parse()?).await?;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            // send a message to 0
            hub.send_msg(TestMsg("world".into()), 0)?;
            Ok::<(), ConclaveError>(())
        });
        // member 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 3, "127.0.0.1:58810".parse()?)
                .await?;
        let peer = hub.wait_on_peer().await?;
        assert_eq!(peer, 1);
        hub.send_msg(TestMsg("hello".into()), 1)?;
        let (id, msg) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert_eq!(msg, TestMsg("world".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn group_bcast() -> Result<(), ConclaveError> {
        for i in 1..=2u8 {
            tokio::spawn(async move {
                // members 1 and 2
                let mut hub: TransportHub<TestMsg> =
                    TransportHub::new_and_setup(
                        i,
                        3,
                        format!("127.0.0.1:5882{}", i).parse()?,
                    )
                    .await?;
                hub.connect_to_peer(0, "127.0.0.1:58820".parse()?).await?;
                let (id, msg) = hub.recv_msg().await?;
                assert_eq!(id, 0);
                assert_eq!(msg, TestMsg("bcast".into()));
                hub.send_msg(TestMsg(format!("ack{}", i)), 0)?;
                Ok::<(), ConclaveError>(())
            });
        }
        // member 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, 3, "127.0.0.1:58820".parse()?)
                .await?;
        hub.wait_for_group(3).await?;
        hub.bcast_msg(TestMsg("bcast".into()), None)?;
        let mut acked = 0;
        while acked < 2 {
            let (id, msg) = hub.recv_msg().await?;
            assert!(id == 1 || id == 2);
            assert_eq!(msg, TestMsg(format!("ack{}", id)));
            acked += 1;
        }
        Ok(())
    }
}
