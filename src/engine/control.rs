//! Conclave engine -- manager control message handling.

use super::*;

use crate::manager::CtrlMsg;

// ConclaveReplica control messages handling
impl ConclaveReplica {
    /// Synthesized handler of manager control messages. Returns
    /// `Ok(Some(restart))` if the event loop should terminate.
    pub(crate) async fn handle_ctrl_msg(
        &mut self,
        msg: CtrlMsg,
    ) -> Result<Option<bool>, ConclaveError> {
        match msg {
            CtrlMsg::AssignLeader { term } => {
                self.handle_assign_leader(term).await?;
                Ok(None)
            }

            CtrlMsg::MembersView { members } => {
                pf_debug!("membership view updated: {} members", members.len());
                self.members_view = members;
                Ok(None)
            }

            CtrlMsg::ConnectToPeers { to_peers, .. } => {
                // a member that joined after me announced itself; make sure
                // its connection will be (or has been) accepted
                let _ = to_peers;
                Ok(None)
            }

            _ => Ok(None), // ignore all other types
        }
    }
}
