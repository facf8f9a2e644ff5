//! Conclave server state machine module implementation.

use std::collections::HashMap;

use crate::server::MemberId;
use crate::utils::ConclaveError;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Command ID type.
pub type CommandId = u64;

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Create key with given value; fails precondition if key exists.
    Create { key: String, value: String },

    /// Put a new value into key, creating it if absent.
    Put { key: String, value: String },

    /// Get the value of given key.
    Get { key: String },

    /// Delete key; fails precondition if key is absent.
    Delete { key: String },
}

impl Command {
    /// Returns true if the command mutates state.
    #[inline]
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::Get { .. })
    }
}

/// Command execution result returned by the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// True if the key already existed (in which case nothing was written).
    Create { existed: bool },

    /// `Some(old_value)` if key was in state machine, else `None`.
    Put { old_value: Option<String> },

    /// `Some(value)` if key is found in state machine, else `None`.
    Get { value: Option<String> },

    /// True if the key existed and was removed.
    Delete { existed: bool },
}

/// Action submitted to the state machine executor.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum SmAction {
    /// Apply a command to the state.
    Apply(Command),

    /// Produce a full dump of the current state (for state transfer).
    TakeDump,

    /// Replace the entire state with the given dump (installing a state
    /// transfer received from the leader).
    LoadDump(HashMap<String, String>),
}

/// Outcome of an executed state machine action.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum SmOutcome {
    /// Result of an applied command.
    Applied(CommandResult),

    /// Full dump of the state.
    Dump(HashMap<String, String>),

    /// Dump installation finished.
    Loaded,
}

/// State is simply a `HashMap` from `String` key -> `String` value.
type State = HashMap<String, String>;

/// Capacity of the exec/ack channels.
const CHAN_CAP: usize = 65536;

/// The local volatile state machine, which is an in-memory key-value map
/// owned by a dedicated executor task.
pub(crate) struct StateMachine {
    /// My member ID.
    _me: MemberId,

    /// Sender side of the exec channel.
    tx_exec: mpsc::Sender<(CommandId, SmAction)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::Receiver<(CommandId, SmOutcome)>,

    /// Join handle of the executor task. The state HashMap is owned by this
    /// task.
    _executor_handle: JoinHandle<()>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine module and spawns the executor task.
    /// Creates an exec channel for submitting actions to the state machine
    /// and an ack channel for getting results.
    pub(crate) async fn new_and_setup(
        me: MemberId,
    ) -> Result<Self, ConclaveError> {
        let (tx_exec, rx_exec) = mpsc::channel(CHAN_CAP);
        let (tx_ack, rx_ack) = mpsc::channel(CHAN_CAP);

        let executor_handle =
            tokio::spawn(Self::executor_task(me, rx_exec, tx_ack));

        Ok(StateMachine {
            _me: me,
            tx_exec,
            rx_ack,
            _executor_handle: executor_handle,
        })
    }

    /// Submits an action by sending it to the exec channel.
    pub(crate) async fn submit_action(
        &mut self,
        id: CommandId,
        action: SmAction,
    ) -> Result<(), ConclaveError> {
        self.tx_exec
            .send((id, action))
            .await
            .map_err(ConclaveError::from)
    }

    /// Waits for the next execution outcome by receiving from the ack
    /// channel.
    pub(crate) async fn get_result(
        &mut self,
    ) -> Result<(CommandId, SmOutcome), ConclaveError> {
        match self.rx_ack.recv().await {
            Some((id, outcome)) => Ok((id, outcome)),
            None => logged_err!("ack channel has been closed"),
        }
    }
}

// StateMachine executor task implementation
impl StateMachine {
    /// Executes given command on the state machine state.
    fn execute(state: &mut State, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Create { key, value } => {
                if state.contains_key(key) {
                    CommandResult::Create { existed: true }
                } else {
                    state.insert(key.clone(), value.clone());
                    CommandResult::Create { existed: false }
                }
            }
            Command::Put { key, value } => CommandResult::Put {
                old_value: state.insert(key.clone(), value.clone()),
            },
            Command::Get { key } => CommandResult::Get {
                value: state.get(key).cloned(),
            },
            Command::Delete { key } => CommandResult::Delete {
                existed: state.remove(key).is_some(),
            },
        }
    }

    /// Executor task function.
    async fn executor_task(
        me: MemberId,
        mut rx_exec: mpsc::Receiver<(CommandId, SmAction)>,
        tx_ack: mpsc::Sender<(CommandId, SmOutcome)>,
    ) {
        pf_debug!("executor task spawned");

        // create the state HashMap
        let mut state = State::new();

        while let Some((id, action)) = rx_exec.recv().await {
            let outcome = match action {
                SmAction::Apply(cmd) => {
                    let res = Self::execute(&mut state, &cmd);
                    pf_trace!("executed {:?}", cmd);
                    SmOutcome::Applied(res)
                }
                SmAction::TakeDump => SmOutcome::Dump(state.clone()),
                SmAction::LoadDump(dump) => {
                    state = dump;
                    pf_debug!("installed state dump of size {}", state.len());
                    SmOutcome::Loaded
                }
            };

            if let Err(e) = tx_ack.send((id, outcome)).await {
                pf_error!("error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!("executor task of {} exited", me);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get() {
        let mut state = State::new();
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Create {
                    key: "/k0".into(),
                    value: "v0".into(),
                }
            ),
            CommandResult::Create { existed: false }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Get { key: "/k0".into() }
            ),
            CommandResult::Get {
                value: Some("v0".into())
            }
        );
    }

    #[test]
    fn create_existing() {
        let mut state = State::new();
        StateMachine::execute(
            &mut state,
            &Command::Create {
                key: "/k0".into(),
                value: "v0".into(),
            },
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Create {
                    key: "/k0".into(),
                    value: "v1".into(),
                }
            ),
            CommandResult::Create { existed: true }
        );
        // original value untouched
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Get { key: "/k0".into() }
            ),
            CommandResult::Get {
                value: Some("v0".into())
            }
        );
    }

    #[test]
    fn put_twice_delete() {
        let mut state = State::new();
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Put {
                    key: "/k0".into(),
                    value: "v0".into(),
                }
            ),
            CommandResult::Put { old_value: None }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Put {
                    key: "/k0".into(),
                    value: "v1".into(),
                }
            ),
            CommandResult::Put {
                old_value: Some("v0".into())
            }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Delete { key: "/k0".into() }
            ),
            CommandResult::Delete { existed: true }
        );
        assert_eq!(
            StateMachine::execute(
                &mut state,
                &Command::Delete { key: "/k0".into() }
            ),
            CommandResult::Delete { existed: false }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exec_ack_loop() -> Result<(), ConclaveError> {
        let mut sm = StateMachine::new_and_setup(0).await?;
        sm.submit_action(
            0,
            SmAction::Apply(Command::Put {
                key: "/k0".into(),
                value: "179".into(),
            }),
        )
        .await?;
        sm.submit_action(
            1,
            SmAction::Apply(Command::Put {
                key: "/k0".into(),
                value: "180".into(),
            }),
        )
        .await?;
        assert_eq!(
            sm.get_result().await?,
            (
                0,
                SmOutcome::Applied(CommandResult::Put { old_value: None })
            )
        );
        assert_eq!(
            sm.get_result().await?,
            (
                1,
                SmOutcome::Applied(CommandResult::Put {
                    old_value: Some("179".into())
                })
            )
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dump_load_roundtrip() -> Result<(), ConclaveError> {
        let mut sm = StateMachine::new_and_setup(0).await?;
        sm.submit_action(
            0,
            SmAction::Apply(Command::Create {
                key: "/k0".into(),
                value: "v0".into(),
            }),
        )
        .await?;
        sm.submit_action(1, SmAction::TakeDump).await?;
        sm.get_result().await?; // create ack
        let (_, outcome) = sm.get_result().await?;
        let dump = if let SmOutcome::Dump(dump) = outcome {
            dump
        } else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(dump.get("/k0"), Some(&"v0".to_string()));

        let mut sm2 = StateMachine::new_and_setup(1).await?;
        sm2.submit_action(0, SmAction::LoadDump(dump)).await?;
        assert_eq!(sm2.get_result().await?, (0, SmOutcome::Loaded));
        sm2.submit_action(
            1,
            SmAction::Apply(Command::Get { key: "/k0".into() }),
        )
        .await?;
        assert_eq!(
            sm2.get_result().await?,
            (
                1,
                SmOutcome::Applied(CommandResult::Get {
                    value: Some("v0".into())
                })
            )
        );
        Ok(())
    }
}
