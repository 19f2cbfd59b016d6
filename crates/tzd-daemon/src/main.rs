//! tzd-daemon - trustlet session broker daemon.
//!
//! # Fork Safety
//!
//! Daemonization via `fork()` happens before any thread exists: before the
//! device threads, the listener threads and the signal runtime. `fork()` in
//! a multi-threaded process only duplicates the calling thread, leaving any
//! mutex another thread held locked forever in the child.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tzd_core::config::TzdConfig;
use tzd_core::driver::KernelDriver;
use tzd_core::emulator::MonitorEmulator;
use tzd_core::registry::{FileRegistry, Registry};
use tzd_daemon::connection::{DatagramSocket, NetlinkSocket};
use tzd_daemon::daemon::Daemon;
use tzd_daemon::device::{Device, TrustZoneDevice, TrustZoneDeviceConfig};
use tzd_daemon::server::{
    NetlinkServer, NetlinkServerConfig, StreamServer, StreamServerConfig, spawn_listener,
};
use tzd_daemon::state::{DaemonContext, SharedContext};

const DEFAULT_CONFIG_PATH: &str = "/etc/tzd/tzd.toml";

/// tzd - trustlet session broker
#[derive(Parser, Debug)]
#[command(name = "tzd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// Path to PID file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Path to the client Unix socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Netlink protocol number of the kernel client channel
    #[arg(long, conflicts_with = "no_netlink")]
    netlink_protocol: Option<i32>,

    /// Disable the netlink listener
    #[arg(long)]
    no_netlink: bool,

    /// Directory holding trustlet images
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Loads the configuration file and applies command-line overrides.
    ///
    /// A missing file at the default location yields the built-in defaults.
    fn load_config(&self) -> Result<TzdConfig> {
        let mut config = if self.config.exists() || self.config != Path::new(DEFAULT_CONFIG_PATH) {
            TzdConfig::from_file(&self.config)
                .with_context(|| format!("failed to load {}", self.config.display()))?
        } else {
            TzdConfig::default()
        };
        if let Some(socket) = &self.socket {
            config.server.socket_path.clone_from(socket);
        }
        if self.no_netlink {
            config.server.netlink_protocol = None;
        } else if let Some(protocol) = self.netlink_protocol {
            config.server.netlink_protocol = Some(protocol);
        }
        if let Some(registry) = &self.registry {
            config.registry.path.clone_from(registry);
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Write PID file.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create PID file directory")?;
    }
    std::fs::write(pid_path, std::process::id().to_string()).context("failed to write PID file")?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

/// Remove PID file.
fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file: {e}");
        }
    }
}

/// Perform daemonization via double-fork pattern.
///
/// Must run while the process is single-threaded.
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<()> {
    use nix::unistd::{ForkResult, fork, setsid};

    // SAFETY: called from `main` before any thread is spawned, so the child
    // inherits a consistent single-threaded address space.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    // New session: no controlling terminal.
    setsid()?;

    // SAFETY: still single-threaded; the first child inherited only the
    // calling thread. The grandchild can never reacquire a terminal.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.no_daemon {
        if let Err(e) = daemonize() {
            eprintln!("Daemonization failed: {e}");
            return Err(e);
        }
    }

    init_logging(&args)?;
    if args.no_daemon {
        info!("Running in foreground mode (--no-daemon)");
    } else {
        info!("Daemonized successfully");
    }

    let config = args.load_config()?;
    let result = run(&args, &config);
    if let Err(e) = &result {
        error!("tzd-daemon failed: {e:#}");
    }
    result
}

fn run(args: &Args, config: &TzdConfig) -> Result<()> {
    let signals = ShutdownSignals::register()?;
    let driver: Arc<dyn KernelDriver> = Arc::new(MonitorEmulator::new());
    let registry: Arc<dyn Registry> = Arc::new(FileRegistry::new(&config.registry.path));
    let device: Arc<dyn Device> = Arc::new(
        TrustZoneDevice::start(TrustZoneDeviceConfig::from(&config.device), driver, registry)
            .context("failed to start device")?,
    );
    let context: SharedContext = Arc::new(DaemonContext::new([device]));
    let handler = Arc::new(Daemon::new(
        Arc::clone(&context),
        config.server.command_timeout(),
    ));

    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    let started = start_listeners(config, &context, &handler, &mut listeners);

    let outcome = started.and_then(|()| {
        if let Some(pid_file) = &args.pid_file {
            write_pid_file(pid_file)?;
        }
        info!(
            socket = %config.server.socket_path.display(),
            netlink = ?config.server.netlink_protocol,
            "tzd-daemon ready"
        );
        signals.wait();
        Ok(())
    });

    context.request_shutdown();
    for listener in listeners {
        if listener.join().is_err() {
            error!("listener thread panicked");
        }
    }
    context.shutdown_devices();
    if let Some(pid_file) = &args.pid_file {
        remove_pid_file(pid_file);
    }
    info!("tzd-daemon stopped");
    outcome
}

fn start_listeners(
    config: &TzdConfig,
    context: &SharedContext,
    handler: &Arc<Daemon>,
    listeners: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    let mut stream = StreamServer::bind(StreamServerConfig {
        path: config.server.socket_path.clone(),
        mode: config.server.socket_mode,
        poll_interval: config.server.poll_interval(),
    })
    .context("failed to bind client socket")?;
    let shutdown = context.shutdown_flag();
    let stream_handler = Arc::clone(handler);
    listeners.push(
        spawn_listener("tzd-stream", move || {
            if let Err(e) = stream.run(stream_handler.as_ref(), &shutdown) {
                error!(error = %e, "stream listener failed");
            }
        })
        .context("failed to spawn stream listener")?,
    );

    if let Some(protocol) = config.server.netlink_protocol {
        let socket: Arc<dyn DatagramSocket> = Arc::new(
            NetlinkSocket::bind(protocol)
                .with_context(|| format!("failed to bind netlink protocol {protocol}"))?,
        );
        let mut netlink = NetlinkServer::new(
            NetlinkServerConfig {
                poll_interval: config.server.poll_interval(),
                reap_interval: config.server.reap_interval(),
            },
            socket,
        );
        let shutdown = context.shutdown_flag();
        let netlink_handler = Arc::clone(handler);
        listeners.push(
            spawn_listener("tzd-netlink", move || {
                if let Err(e) = netlink.run(netlink_handler.as_ref(), &shutdown) {
                    error!(error = %e, "netlink listener failed");
                }
            })
            .context("failed to spawn netlink listener")?,
        );
    }
    Ok(())
}

/// SIGTERM and SIGINT handlers, installed before any listener accepts.
struct ShutdownSignals {
    runtime: tokio::runtime::Runtime,
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn register() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to create Tokio runtime")?;
        let (sigterm, sigint) = {
            let _guard = runtime.enter();
            (
                signal(SignalKind::terminate()).context("failed to register SIGTERM")?,
                signal(SignalKind::interrupt()).context("failed to register SIGINT")?,
            )
        };
        Ok(Self {
            runtime,
            sigterm,
            sigint,
        })
    }

    /// Blocks until SIGTERM or SIGINT arrives.
    fn wait(self) {
        let Self {
            runtime,
            mut sigterm,
            mut sigint,
        } = self;
        runtime.block_on(async {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::{self as nix_signal, Signal as NixSignal};

    use super::*;

    #[test]
    fn signal_raised_before_waiting_is_not_lost() {
        let signals = ShutdownSignals::register().unwrap();
        nix_signal::raise(NixSignal::SIGTERM).unwrap();
        signals.wait();
    }
}
