//! Conclave server control messages module implementation.
//!
//! Maintains the connection to the cluster manager oracle, which plays the
//! external election collaborator role: leader/term assignments arrive here.

use std::net::SocketAddr;

use crate::manager::CtrlMsg;
use crate::server::MemberId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, ConclaveError,
};

use bytes::BytesMut;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The manager control message handler module.
pub(crate) struct ControlHub {
    /// My member ID, assigned by the manager upon connection.
    pub(crate) me: MemberId,

    /// Number of members in the ensemble.
    pub(crate) population: u8,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<CtrlMsg>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<CtrlMsg>,

    /// Control messenger task join handle.
    _control_messenger_handle: JoinHandle<()>,
}

// ControlHub public API implementation
impl ControlHub {
    /// Creates a new control message handler module. Connects to the cluster
    /// manager and gets assigned a member ID. Spawns the control messenger
    /// task. Returns the module on success.
    pub(crate) async fn new_and_setup(
        manager: SocketAddr,
    ) -> Result<Self, ConclaveError> {
        pf_debug!("connecting to manager '{}'...", manager);
        let mut stream = tcp_connect_with_retry(manager, 10).await?;
        let id = stream.read_u8().await?; // first receive assigned member ID
        let population = stream.read_u8().await?; // then receive population
        pf_debug!("assigned member ID: {} of {}", id, population);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();

        let control_messenger_handle = tokio::spawn(
            Self::control_messenger_task(id, stream, tx_recv, rx_send),
        );

        Ok(ControlHub {
            me: id,
            population,
            rx_recv,
            tx_send,
            _control_messenger_handle: control_messenger_handle,
        })
    }

    /// Waits for the next control event message from the cluster manager.
    pub(crate) async fn recv_ctrl(&mut self) -> Result<CtrlMsg, ConclaveError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!("ctrl recv channel has been closed"),
        }
    }

    /// Sends a control message to the cluster manager.
    pub(crate) fn send_ctrl(&mut self, msg: CtrlMsg) -> Result<(), ConclaveError> {
        self.tx_send.send(msg).map_err(ConclaveError::from)
    }
}

// ControlHub control_messenger task implementation
impl ControlHub {
    /// Reads a manager control message from the TcpStream.
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

    /// Manager control message listener and sender task function.
    async fn control_messenger_task(
        me: MemberId,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<CtrlMsg>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
    ) {
        pf_debug!("control_messenger task spawned");

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to manager
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg)
                            ) {
                                Ok(true) => {
                                    // pf_trace!("sent ctrl {:?}", msg);
                                }
                                Ok(false) => {
                                    pf_debug!("should start retrying ctrl send");
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("error sending ctrl: {}", e);
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
                            pf_debug!("finished retrying last ctrl send");
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("still should retry last ctrl send");
                        }
                        Err(e) => {
                            pf_error!("error retrying last ctrl send: {}", e);
                        }
                    }
                },

                // receives control message from manager
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            // pf_trace!("recv ctrl {:?}", msg);
                            if let Err(e) = tx_recv.send(msg) {
                                pf_error!("error sending to tx_recv: {}", e);
                            }
                        },

                        Err(_e) => {
                            // probably the manager exited ungracefully
                            break;
                        }
                    }
                }
            }
        }

        pf_debug!("control_messenger task of {} exited", me);
    }
}

// Unit tests are done together with `manager::reigner`.
