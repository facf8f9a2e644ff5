//! Conclave client manager control stub implementation.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::manager::{CtrlReply, CtrlRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, ConclaveError,
};

use bytes::BytesMut;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client stub for control requests to the cluster manager.
pub struct ClientCtrlStub {
    /// My client ID, assigned by the manager upon connection.
    pub id: ClientId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Read buffer for cancellation-safe receives.
    read_buf: BytesMut,

    /// Write buffer for deadlock-avoiding sends.
    write_buf: BytesMut,

    /// Cursor of unwritten bytes in the write buffer.
    write_buf_cursor: usize,
}

impl ClientCtrlStub {
    /// Connects to the cluster manager and receives my assigned client ID.
    pub async fn new_by_connect(
        manager: SocketAddr,
    ) -> Result<Self, ConclaveError> {
        pf_debug!("connecting to manager '{}'...", manager);
        let mut stream = tcp_connect_with_retry(manager, 10).await?;
        let id = stream.read_u64().await?; // receive assigned client ID
        pf_debug!("assigned client ID: {}", id);

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientCtrlStub {
            id,
            conn_read,
            conn_write,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_buf_cursor: 0,
        })
    }

    /// Sends a control request to the manager. Returns `Ok(true)` on
    /// success; `Ok(false)` if the socket is full, in which case retry with
    /// `req == None` until success.
    pub fn send_req(
        &mut self,
        req: Option<&CtrlRequest>,
    ) -> Result<bool, ConclaveError> {
        safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            req,
        )
    }

    /// Receives a control reply from the manager.
    pub async fn recv_reply(&mut self) -> Result<CtrlReply, ConclaveError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
