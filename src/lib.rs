//! Conclave: an ensemble coordination service core implementing
//! single-leader quorum replication, leader-activation gating, write
//! forwarding from non-leader members, and credentialed session migration.

#[macro_use]
mod utils;

mod client;
mod engine;
mod manager;
mod server;

pub use crate::client::{ClientApiStub, ClientCtrlStub, ClientId};
pub use crate::engine::{ConclaveReplica, LogPosition, ReplicaConfig, Term};
pub use crate::manager::{ClusterManager, CtrlReply, CtrlRequest};
pub use crate::server::{
    ApiReply, ApiRequest, Command, CommandResult, Credential, GenericReplica,
    MemberId, OpError, OpResult, RequestId, SessionId,
};
pub use crate::utils::{logger_init, Bitmap, ConclaveError, Timer, ME};
