//! pingud entry point
//!
//! Loads the configuration, optionally detaches from the terminal, claims the
//! pidfile and runs the reactor until SIGINT/SIGTERM.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CM-6: Configuration Settings - Validated configuration file

use anyhow::Context;
use clap::Parser;
use pingud::config::DEFAULT_CONFIG_PATH;
use pingud::daemon;
use pingud::pidfile::PidFile;
use pingud::PinguConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// ICMP link-health monitor and policy-route failover daemon
#[derive(Parser, Debug)]
#[command(name = "pingud")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Admin socket path (overrides the configuration)
    #[arg(short = 'a', long)]
    admin_socket: Option<PathBuf>,

    /// Pidfile path (overrides the configuration)
    #[arg(short = 'p', long)]
    pid_file: Option<PathBuf>,

    /// Fork to the background before starting
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Initialize structured logging; RUST_LOG wins over the default level
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "pingud starting");

    match start(args) {
        Ok(()) => {
            info!("pingud exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "pingud exiting with error");
            Err(e)
        }
    }
}

/// Load the configuration and fork if asked to, then enter the runtime
///
/// The fork happens before the runtime exists so no runtime thread is lost.
fn start(args: Args) -> anyhow::Result<()> {
    let config = PinguConfig::load(&args.config)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;

    if args.daemonize {
        daemon::daemonize().context("failed to fork to the background")?;
        info!(pid = std::process::id(), "Running in the background");
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?
        .block_on(run(args, config))
}

async fn run(args: Args, config: PinguConfig) -> anyhow::Result<()> {
    let pid_path = args.pid_file.unwrap_or_else(|| config.daemon.pid_file.clone());
    let admin_socket = args
        .admin_socket
        .unwrap_or_else(|| config.daemon.admin_socket.clone());

    let _pidfile = PidFile::create(&pid_path)?;
    info!(
        config = %args.config.display(),
        hosts = config.hosts.len(),
        interfaces = config.interfaces.len(),
        "Configuration loaded"
    );

    daemon::run(&config, admin_socket).await?;
    Ok(())
}
