//! Conclave interactive demo client executable.
//!
//! A minimal driver over the thin client stubs: opens a session against one
//! member, issues operations, and can move the session to another member
//! with its credential. Retry policy is intentionally naive; this is a
//! demo/testing tool, not a client library.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use conclave::{
    logger_init, pf_error, ApiReply, ApiRequest, ClientApiStub,
    ClientCtrlStub, Command, ConclaveError, Credential, CtrlReply,
    CtrlRequest, MemberId, OpResult, RequestId, SessionId,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Cluster manager oracle address.
    #[arg(short, long, default_value_t = String::from("127.0.0.1:52601"))]
    manager: String,

    /// Which member server to contact initially.
    #[arg(short, long, default_value_t = 0)]
    server: MemberId,
}

/// Interactive client driver state.
struct ClientDriver {
    ctrl_stub: ClientCtrlStub,
    api_stub: Option<ClientApiStub>,
    servers: HashMap<MemberId, SocketAddr>,
    session: Option<(SessionId, Credential)>,
    next_req: RequestId,
}

impl ClientDriver {
    /// Queries the manager for the current server addresses.
    async fn refresh_servers(&mut self) -> Result<(), ConclaveError> {
        let mut sent =
            self.ctrl_stub.send_req(Some(&CtrlRequest::QueryInfo))?;
        while !sent {
            sent = self.ctrl_stub.send_req(None)?;
        }
        match self.ctrl_stub.recv_reply().await? {
            CtrlReply::QueryInfo { servers, .. } => {
                self.servers = servers
                    .into_iter()
                    .map(|(id, (addr, _))| (id, addr))
                    .collect();
                Ok(())
            }
            _ => Err(ConclaveError::msg("unexpected reply type received")),
        }
    }

    /// Connects the API stub to the given member server.
    async fn connect_to(
        &mut self,
        server: MemberId,
    ) -> Result<(), ConclaveError> {
        let addr = *self.servers.get(&server).ok_or(ConclaveError::msg(
            format!("server {} not known to manager", server),
        ))?;
        self.api_stub = Some(
            ClientApiStub::new_by_connect(self.ctrl_stub.id, addr).await?,
        );
        println!("connected to member {} at {}", server, addr);
        Ok(())
    }

    /// Issues one request and waits for its reply.
    async fn do_request(
        &mut self,
        req: ApiRequest,
    ) -> Result<ApiReply, ConclaveError> {
        let stub = self
            .api_stub
            .as_mut()
            .ok_or(ConclaveError::msg("not connected to any server"))?;
        let mut sent = stub.send_req(Some(&req))?;
        while !sent {
            sent = stub.send_req(None)?;
        }
        stub.recv_reply().await
    }

    /// Draws the next request ID.
    fn req_id(&mut self) -> RequestId {
        self.next_req += 1;
        self.next_req
    }

    /// Requires an open session, returning its ID.
    fn need_session(&self) -> Result<SessionId, ConclaveError> {
        self.session
            .map(|(sid, _)| sid)
            .ok_or(ConclaveError::msg("no open session; try 'open' first"))
    }

    /// Executes one REPL command line. Returns false to exit.
    async fn dispatch(&mut self, line: &str) -> Result<bool, ConclaveError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => {}

            ["exit"] | ["quit"] => return Ok(false),

            ["open"] => {
                let id = self.req_id();
                let reply = self
                    .do_request(ApiRequest::Open { id, timeout_ms: 0 })
                    .await?;
                if let ApiReply::Reply {
                    result: Ok(OpResult::Session {
                        session,
                        credential,
                    }),
                    ..
                } = reply
                {
                    self.session = Some((session, credential));
                    println!("session {:#x} opened", session);
                } else {
                    println!("-> {:?}", reply);
                }
            }

            ["move", server] => {
                let target: MemberId = server.parse()?;
                let (session, credential) = self
                    .session
                    .ok_or(ConclaveError::msg("no open session to move"))?;
                self.refresh_servers().await?;
                self.connect_to(target).await?;
                let id = self.req_id();
                let reply = self
                    .do_request(ApiRequest::Attach {
                        id,
                        session,
                        credential,
                    })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["create", key, value] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply = self
                    .do_request(ApiRequest::Req {
                        id,
                        session,
                        cmd: Command::Create {
                            key: key.to_string(),
                            value: value.to_string(),
                        },
                    })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["put", key, value] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply = self
                    .do_request(ApiRequest::Req {
                        id,
                        session,
                        cmd: Command::Put {
                            key: key.to_string(),
                            value: value.to_string(),
                        },
                    })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["get", key] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply = self
                    .do_request(ApiRequest::Req {
                        id,
                        session,
                        cmd: Command::Get {
                            key: key.to_string(),
                        },
                    })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["delete", key] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply = self
                    .do_request(ApiRequest::Req {
                        id,
                        session,
                        cmd: Command::Delete {
                            key: key.to_string(),
                        },
                    })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["mcreate", rest @ ..] if !rest.is_empty() => {
                // atomic batch of creates: mcreate k1=v1 k2=v2 ...
                let id = self.req_id();
                let session = self.need_session()?;
                let mut cmds = Vec::new();
                for pair in rest {
                    let (key, value) =
                        pair.split_once('=').ok_or(ConclaveError::msg(
                            "mcreate args must be key=value",
                        ))?;
                    cmds.push(Command::Create {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                let reply = self
                    .do_request(ApiRequest::Multi { id, session, cmds })
                    .await?;
                println!("-> {:?}", reply);
            }

            ["sync"] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply =
                    self.do_request(ApiRequest::Sync { id, session }).await?;
                println!("-> {:?}", reply);
            }

            ["close"] => {
                let id = self.req_id();
                let session = self.need_session()?;
                let reply =
                    self.do_request(ApiRequest::Close { id, session }).await?;
                self.session = None;
                println!("-> {:?}", reply);
            }

            ["members"] => {
                let id = self.req_id();
                let reply =
                    self.do_request(ApiRequest::Members { id }).await?;
                println!("-> {:?}", reply);
            }

            _ => {
                println!(
                    "commands: open | move <srv> | create <k> <v> | \
                     put <k> <v> | get <k> | delete <k> | \
                     mcreate <k>=<v>... | sync | close | members | exit"
                );
            }
        }
        Ok(true)
    }
}

/// Actual main function of the Conclave demo client.
fn client_main() -> Result<(), ConclaveError> {
    let args = CliArgs::parse();
    let manager: SocketAddr = args.manager.parse().map_err(|e| {
        ConclaveError::msg(format!(
            "failed to parse manager address '{}': {}",
            args.manager, e
        ))
    })?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let ctrl_stub = ClientCtrlStub::new_by_connect(manager).await?;
        let mut driver = ClientDriver {
            ctrl_stub,
            api_stub: None,
            servers: HashMap::new(),
            session: None,
            next_req: 0,
        };
        driver.refresh_servers().await?;
        driver.connect_to(args.server).await?;

        let mut lines = BufReader::new(io::stdin()).lines();
        print!("conclave> ");
        use std::io::Write;
        std::io::stdout().flush()?;
        while let Some(line) = lines.next_line().await? {
            match driver.dispatch(&line).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("error: {}", e),
            }
            print!("conclave> ");
            std::io::stdout().flush()?;
        }

        Ok::<(), ConclaveError>(())
    })
}

/// Main function of the Conclave demo client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
