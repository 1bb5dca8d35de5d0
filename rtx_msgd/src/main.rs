//! # RTX Message Daemon Binary
//!
//! Creates the session of one instance and serves it until a termination
//! signal arrives or the module host goes away.
//!
//! # Usage
//!
//! ```bash
//! # Instance 0, autodetected flavor
//! rtx_msgd
//!
//! # Force the POSIX flavor and publish messages on a socket
//! rtx_msgd --flavor posix --publish /run/rtx/msgd.sock
//! ```

#![deny(warnings)]

use clap::Parser;
use rtx_common::config::RtxConfig;
use rtx_common::consts::DEFAULT_CONFIG_PATH;
use rtx_common::flavor::{KernelMarkers, select_flavor};
use rtx_common::signals;
use rtx_msgd::{DaemonError, DaemonResult, MsgDaemon, StopReason};
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// RTX message daemon - owns a session and its message ring
#[derive(Parser, Debug)]
#[command(name = "rtx_msgd")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Message daemon: session owner, log drain and host supervision")]
#[command(long_about = None)]
struct Args {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Session instance (overrides the config file)
    #[arg(short, long)]
    instance: Option<u8>,

    /// Flavor name (overrides autodetection)
    #[arg(short, long)]
    flavor: Option<String>,

    /// Append drained messages to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Publish drained messages on this unix socket
    #[arg(long)]
    publish: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_tracing(&args);
    if let Err(e) = run(&args).await {
        error!("Message daemon failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> DaemonResult<RtxConfig> {
    let path = args.config.exists().then_some(args.config.as_path());
    let mut config = RtxConfig::load_validated(path)?;
    if let Some(instance) = args.instance {
        config.session.instance = instance;
    }
    if args.flavor.is_some() {
        config.session.flavor = args.flavor.clone();
    }
    if args.log_file.is_some() {
        config.msgd.log_file = args.log_file.clone();
    }
    if args.publish.is_some() {
        config.msgd.publish_socket = args.publish.clone();
    }
    Ok(config)
}

async fn run(args: &Args) -> DaemonResult<()> {
    info!("RTX message daemon v{} starting...", env!("CARGO_PKG_VERSION"));
    signals::install_crash_handlers().map_err(std::io::Error::from)?;

    let config = load_config(args)?;
    let flavor = select_flavor(config.session.flavor.as_deref(), &KernelMarkers::probe())?;
    let mut daemon = MsgDaemon::start(config, flavor)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
        }
    };

    let ran = daemon.run(shutdown).await;
    match &ran {
        Ok(StopReason::Requested) => info!("Shutdown requested"),
        Ok(StopReason::HostExited(_)) => {}
        Err(DaemonError::HostDied { .. }) => {}
        Err(e) => error!("Message loop stopped: {}", e),
    }

    let removed = daemon.shutdown()?;
    info!("RTX message daemon shutdown complete ({} segments removed)", removed);
    ran.map(|_| ())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
