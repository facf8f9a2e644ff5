//! Conclave generic member replica trait.

use std::net::SocketAddr;

use crate::utils::ConclaveError;

use async_trait::async_trait;

use tokio::sync::watch;

/// Ensemble member ID type.
pub type MemberId = u8;

/// Replica trait implemented by the ensemble member server struct.
#[async_trait]
pub trait GenericReplica {
    /// Creates a new member replica and sets up required functionality
    /// modules. Connects to the cluster manager to get assigned a member ID
    /// and the peer list.
    async fn new_and_setup(
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        manager: SocketAddr,
        config_str: Option<&str>, // member config in TOML format
    ) -> Result<Self, ConclaveError>
    where
        Self: Sized;

    /// Main event loop logic of running this member. Returns `Ok(true)` if
    /// terminated normally and wanting to restart, `Ok(false)` if terminated
    /// normally and is done.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<bool, ConclaveError>;

    /// Gets my member ID.
    fn id(&self) -> MemberId;
}
