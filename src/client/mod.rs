//! Conclave's thin client-side communication stubs. Connection management
//! and retry policies are the caller's business; these stubs only frame
//! requests and replies over established connections.

mod apistub;
mod ctrlstub;

pub use apistub::ClientApiStub;
pub use ctrlstub::ClientCtrlStub;

/// Client ID type, assigned by the cluster manager upon first contact.
pub type ClientId = u64;
