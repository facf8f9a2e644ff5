//! Conclave ensemble member server executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use conclave::{
    logger_init, pf_error, pf_warn, ConclaveError, ConclaveReplica,
    GenericReplica,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client API port.
    #[arg(short, long, default_value_t = 52700)]
    api_port: u16,

    /// Internal port used for peer-peer communication.
    #[arg(short, long, default_value_t = 52800)]
    p2p_port: u16,

    /// Cluster manager oracle address.
    #[arg(short, long, default_value_t = String::from("127.0.0.1:52600"))]
    manager: String,

    /// Member configuration in TOML format string.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the parsed manager
    /// address on success.
    fn sanitize(&self) -> Result<SocketAddr, ConclaveError> {
        if self.api_port <= 1024 {
            Err(ConclaveError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.p2p_port <= 1024 {
            Err(ConclaveError::msg(format!(
                "invalid p2p_port {}",
                self.p2p_port
            )))
        } else if self.api_port == self.p2p_port {
            Err(ConclaveError::msg(format!(
                "api_port == p2p_port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(ConclaveError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            self.manager.parse().map_err(|e| {
                ConclaveError::msg(format!(
                    "failed to parse manager address '{}': {}",
                    self.manager, e
                ))
            })
        }
    }
}

/// Actual main function of a Conclave member server.
fn server_main() -> Result<(), ConclaveError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let manager = args.sanitize()?;

    // parse client API port
    let api_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.api_port)
        .parse()
        .map_err(|e| {
            ConclaveError::msg(format!(
                "failed to parse api_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.api_port, e
            ))
        })?;

    // parse peer-peer communication port
    let p2p_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.p2p_port)
        .parse()
        .map_err(|e| {
            ConclaveError::msg(format!(
                "failed to parse p2p_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.p2p_port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, set up the member replica, and start the
        // main event loop logic
        runtime.block_on(async move {
            let mut replica = ConclaveReplica::new_and_setup(
                api_addr,
                p2p_addr,
                manager,
                args.config.as_deref(),
            )
            .await?;

            if replica.run(rx_term).await? {
                pf_warn!("server {} restart requested; exiting", replica.id());
            }

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ConclaveError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Conclave member server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            api_port: 40700,
            p2p_port: 40800,
            manager: "127.0.0.1:40600".into(),
            config: None,
            threads: 2,
        };
        assert_eq!(args.sanitize(), Ok("127.0.0.1:40600".parse()?));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            api_port: 1023,
            p2p_port: 40800,
            manager: "127.0.0.1:40600".into(),
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_same_api_p2p_port() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            api_port: 40700,
            p2p_port: 40700,
            manager: "127.0.0.1:40600".into(),
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_manager() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            api_port: 40700,
            p2p_port: 40800,
            manager: "not-an-address".into(),
            config: None,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
