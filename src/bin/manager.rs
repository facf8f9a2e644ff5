//! Conclave cluster manager oracle executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use conclave::{logger_init, pf_error, ClusterManager, ConclaveError};
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

    /// Server-facing control API port.
    #[arg(short, long, default_value_t = 52600)]
    srv_port: u16,

    /// Client-facing control API port.
    #[arg(short, long, default_value_t = 52601)]
    cli_port: u16,

    /// Total number of member servers in the ensemble.
    #[arg(short = 'n', long, default_value_t = 3)]
    population: u8,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), ConclaveError> {
        if self.srv_port <= 1024 {
            Err(ConclaveError::msg(format!(
                "invalid srv_port {}",
                self.srv_port
            )))
        } else if self.cli_port <= 1024 {
            Err(ConclaveError::msg(format!(
                "invalid cli_port {}",
                self.cli_port
            )))
        } else if self.srv_port == self.cli_port {
            Err(ConclaveError::msg(format!(
                "srv_port == cli_port {}",
                self.srv_port
            )))
        } else if self.population == 0 {
            Err(ConclaveError::msg(format!(
                "invalid population {}",
                self.population
            )))
        } else if self.threads < 2 {
            Err(ConclaveError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the Conclave manager oracle.
fn manager_main() -> Result<(), ConclaveError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // parse server-facing control API port
    let srv_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.srv_port)
        .parse()
        .map_err(|e| {
            ConclaveError::msg(format!(
                "failed to parse srv_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.srv_port, e
            ))
        })?;

    // parse client-facing control API port
    let cli_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.cli_port)
        .parse()
        .map_err(|e| {
            ConclaveError::msg(format!(
                "failed to parse cli_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.cli_port, e
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
            .thread_name("tokio-worker-manager")
            .build()?;

        // enter tokio runtime, set up the cluster manager, and start the
        // main event loop logic
        runtime.block_on(async move {
            let mut manager = ClusterManager::new_and_setup(
                srv_addr,
                cli_addr,
                args.population,
            )
            .await?;

            manager.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), ConclaveError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the Conclave manager oracle.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = manager_main() {
        pf_error!("manager_main exited: {}", e);
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
            srv_port: 40600,
            cli_port: 40601,
            population: 3,
            threads: 2,
        };
        assert!(args.sanitize().is_ok());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_srv_port() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            srv_port: 1023,
            cli_port: 40601,
            population: 3,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_same_srv_cli_port() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            srv_port: 40600,
            cli_port: 40600,
            population: 3,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_population() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            srv_port: 40600,
            cli_port: 40601,
            population: 0,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), ConclaveError> {
        let args = CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            srv_port: 40600,
            cli_port: 40601,
            population: 3,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
