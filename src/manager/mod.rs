//! Conclave's cluster manager oracle: membership bootstrap plus the
//! external election collaborator that assigns `(member, term)`.

mod clusman;
mod reactor;
mod reigner;

pub use clusman::ClusterManager;
pub use reactor::{CtrlReply, CtrlRequest};
pub use reigner::CtrlMsg;

pub(crate) use reactor::ClientReactor;
pub(crate) use reigner::ServerReigner;
