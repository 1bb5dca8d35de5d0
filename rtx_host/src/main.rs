//! # RTX Module Host Binary
//!
//! Attaches to a running session, hardens the process, creates the object
//! store, runs the autoload commands and serves the command channel until a
//! termination signal arrives.
//!
//! # Usage
//!
//! ```bash
//! # Instance 0 with the default config file
//! rtx_host
//!
//! # Another instance, verbose, JSON logs
//! rtx_host --instance 2 -v --json
//! ```

#![deny(warnings)]

use clap::Parser;
use parking_lot::Mutex;
use rtx_common::config::RtxConfig;
use rtx_common::consts::DEFAULT_CONFIG_PATH;
use rtx_common::flavor::{KernelMarkers, select_flavor};
use rtx_common::signals;
use rtx_hal::{HalStore, run_script};
use rtx_host::{CommandServer, HostResult, ModuleHost, ModuleRegistry, harden};
use rtx_shared_memory::{MsgOrigin, RingLogLayer, SegmentManager, Session, SessionState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const IDLE_POLL: Duration = Duration::from_millis(100);

/// RTX module host - runs realtime modules of a session
#[derive(Parser, Debug)]
#[command(name = "rtx_host")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Module host: realtime modules, scheduled threads and the command channel")]
#[command(long_about = None)]
struct Args {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Session instance (overrides the config file)
    #[arg(short, long)]
    instance: Option<u8>,

    /// Flavor to use when the session does not record one
    #[arg(short, long)]
    flavor: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("Module host failed: {}", e);
        std::process::exit(1);
    }
}

fn prepare(args: &Args) -> HostResult<(RtxConfig, SegmentManager, Arc<Session>)> {
    let path = args.config.exists().then_some(args.config.as_path());
    let mut config = RtxConfig::load_validated(path)?;
    if let Some(instance) = args.instance {
        config.session.instance = instance;
    }
    if args.flavor.is_some() {
        config.session.flavor = args.flavor.clone();
    }
    let mgr = SegmentManager::from_config(&config.session);
    let session = Arc::new(Session::attach_configured(&mgr, &config.session)?);
    Ok((config, mgr, session))
}

fn run(args: &Args) -> HostResult<()> {
    let prepared = prepare(args);
    setup_tracing(args, prepared.as_ref().ok().map(|(_, _, s)| Arc::clone(s)));
    let (config, mgr, session) = prepared?;

    info!("RTX module host v{} starting...", env!("CARGO_PKG_VERSION"));
    signals::install_termination_handlers().map_err(std::io::Error::from)?;
    signals::install_crash_handlers().map_err(std::io::Error::from)?;

    let flavor = match session.flavor() {
        Some(flavor) => {
            if let Some(requested) = &config.session.flavor
                && requested != flavor.name()
            {
                warn!("Session runs {}, ignoring requested flavor {}", flavor, requested);
            }
            flavor
        }
        None => select_flavor(config.session.flavor.as_deref(), &KernelMarkers::probe())?,
    };
    harden(&config.host, flavor)?;

    let store = Arc::new(HalStore::create(
        &mgr,
        config.session.instance,
        config.session.hal_size,
        config.session.object_table_capacity,
    )?);
    session.set_host_pid(std::process::id());

    let host = Arc::new(Mutex::new(ModuleHost::new(
        Arc::clone(&store),
        Some(Arc::clone(&session)),
        flavor,
        ModuleRegistry::with_builtins(),
    )));

    let served = serve(&config, &host, &session);
    if let Err(e) = &served {
        error!("Module host stopped: {}", e);
    }

    let res = host.lock().shutdown();
    if let Err(e) = store.unlink() {
        warn!("Object store segment: {}", e);
    }
    info!("RTX module host shutdown complete");
    served.and(res)
}

fn serve(config: &RtxConfig, host: &Arc<Mutex<ModuleHost>>, session: &Session) -> HostResult<()> {
    if !config.host.autoload.is_empty() {
        let executed = run_script(&mut *host.lock(), &config.host.autoload.join("\n"))?;
        info!("Autoload ran {} commands", executed);
    }
    let _server = match &config.host.command_socket {
        Some(path) => Some(CommandServer::bind(path, Arc::clone(host))?),
        None => None,
    };

    info!("Module host running on instance {}", session.instance());
    while !signals::termination_requested() {
        if session.state() == SessionState::Exited {
            warn!("Session exited underneath the module host");
            break;
        }
        std::thread::sleep(IDLE_POLL);
    }
    if let Some(sig) = signals::last_signal() {
        info!("Received {}", sig);
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args, session: Option<Arc<Session>>) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let ring = session.map(|s| RingLogLayer::new(s, MsgOrigin::Rt, "rtx_host"));
    let registry = tracing_subscriber::registry().with(ring);

    if args.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init();
    }
}
