//! Roomkeeper directory replica node.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use roomkeeper::{
    logger_init, pf_error, Replica, ReplicaParams, ReplicaRole,
    RoomkeeperError,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Name of this replica, used as its log prefix.
    #[arg(short, long, default_value_t = String::from("replica"))]
    name: String,

    /// Paxos role: Proposer, Acceptor or Learner.
    #[arg(short, long)]
    role: String,

    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short = 'c', long, default_value_t = 52701)]
    api_port: u16,

    /// Replica-facing mesh port.
    /// This port must be available at process launch.
    #[arg(short = 'm', long, default_value_t = 52700)]
    mesh_port: u16,

    /// Registry address to join the mesh through.
    #[arg(short = 'g', long)]
    registry: Option<SocketAddr>,

    /// Replica configuration overrides in TOML format.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(role)` on success or
    /// `Err(RoomkeeperError)` on any error.
    fn sanitize(&self) -> Result<ReplicaRole, RoomkeeperError> {
        if self.api_port <= 1024 {
            Err(RoomkeeperError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )))
        } else if self.mesh_port <= 1024 {
            Err(RoomkeeperError::msg(format!(
                "invalid mesh_port {}",
                self.mesh_port
            )))
        } else if self.api_port == self.mesh_port {
            Err(RoomkeeperError::msg(format!(
                "api_port == mesh_port {}",
                self.api_port
            )))
        } else if self.name.is_empty() {
            Err(RoomkeeperError::msg("empty replica name"))
        } else if self.threads < 2 {
            Err(RoomkeeperError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            ReplicaRole::parse_name(&self.role).ok_or_else(|| {
                RoomkeeperError::msg(format!(
                    "role name '{}' unrecognized",
                    self.role
                ))
            })
        }
    }
}

/// Actual main function of a Roomkeeper replica.
fn replica_main() -> Result<(), RoomkeeperError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let role = args.sanitize()?;

    let api_addr = SocketAddr::new(args.bind_ip.into(), args.api_port);
    let mesh_addr = SocketAddr::new(args.bind_ip.into(), args.mesh_port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    let me = args.name.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(me; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, set up the replica, and wait for termination
        runtime.block_on(async move {
            let replica = Replica::new_and_setup(ReplicaParams {
                name: args.name,
                role,
                api_addr,
                mesh_addr,
                registry_addr: args.registry,
                config_str: args.config.as_deref(),
            })
            .await?;

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RoomkeeperError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Roomkeeper replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = replica_main() {
        pf_error!("replica"; "replica_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
