//! Conclave's server-side functionality modules and trait.

mod control;
mod external;
mod heartbeat;
mod replica;
mod sessions;
mod statemach;
mod transport;

pub use external::{ApiReply, ApiRequest, OpError, OpResult, RequestId};
pub use replica::{GenericReplica, MemberId};
pub use sessions::{
    compose_session_id, Credential, SessionId, SessionRecord, SessionTable,
    NO_SESSION,
};
pub use statemach::{Command, CommandId, CommandResult};

pub(crate) use control::ControlHub;
pub(crate) use external::ExternalApi;
pub(crate) use heartbeat::{HeartbeatEvent, Heartbeater};
pub(crate) use statemach::{SmAction, SmOutcome, StateMachine};
pub(crate) use transport::TransportHub;
