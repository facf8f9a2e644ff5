//! Conclave client API communication stub implementation.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, ConclaveError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub over an established server connection.
pub struct ClientApiStub {
    /// My client ID.
    _id: ClientId,

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

impl ClientApiStub {
    /// Connects to the given server address, sending my client ID in
    /// handshake.
    pub async fn new_by_connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, ConclaveError> {
        pf_debug!("connecting to server '{}'...", addr);
        let mut stream = tcp_connect_with_retry(addr, 10).await?;
        stream.write_u64(id).await?; // send my client ID

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            _id: id,
            conn_read,
            conn_write,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            write_buf_cursor: 0,
        })
    }

    /// Sends a request to the connected server. Returns `Ok(true)` on
    /// success; `Ok(false)` if the socket is full, in which case retry with
    /// `req == None` until success.
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest>,
    ) -> Result<bool, ConclaveError> {
        safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            req,
        )
    }

    /// Receives a reply from the connected server.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, ConclaveError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
