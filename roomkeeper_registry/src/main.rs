//! Roomkeeper replica registry: the rendezvous that wires replicas into a
//! full mesh.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use roomkeeper::{logger_init, pf_error, pf_info, RegistryServer, RoomkeeperError};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port replicas register on.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52600)]
    port: u16,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(RoomkeeperError)` on any error.
    fn sanitize(&self) -> Result<(), RoomkeeperError> {
        if self.port <= 1024 {
            Err(RoomkeeperError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(RoomkeeperError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the Roomkeeper registry.
fn registry_main() -> Result<(), RoomkeeperError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let bind_addr = SocketAddr::new(args.bind_ip.into(), args.port);

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("reg"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-registry")
            .build()?;

        // enter tokio runtime, set up the registry, and wait for termination
        runtime.block_on(async move {
            let registry = RegistryServer::new_and_setup(bind_addr).await?;
            pf_info!("reg"; "registry listening on '{}'", registry.local_addr());

            rx_term.changed().await?;
            pf_info!("reg"; "caught termination signal, {} replicas registered",
                            registry.registered().len());

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RoomkeeperError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the Roomkeeper registry.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = registry_main() {
        pf_error!("reg"; "registry_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() {
        let args = CliArgs {
            bind_ip: Ipv4Addr::LOCALHOST,
            port: 40000,
            threads: 2,
        };
        assert_eq!(args.sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_port() {
        let args = CliArgs {
            bind_ip: Ipv4Addr::LOCALHOST,
            port: 80,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            bind_ip: Ipv4Addr::LOCALHOST,
            port: 40000,
            threads: 1,
        };
        assert!(args.sanitize().is_err());
    }
}
