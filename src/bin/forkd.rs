//! fork daemon - session registry, discovery and reverse-proxy control
//!
//! This binary runs as a background daemon. Clients register development
//! sessions over a local Unix socket; the daemon also discovers session
//! containers by label and keeps an nginx proxy routing to them.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! forkd start
//!
//! # Start the daemon (background/daemonized)
//! forkd start -d
//!
//! # Stop the daemon
//! forkd stop
//!
//! # Check daemon status
//! forkd status
//! ```

use std::fs::{self, File};
use std::future::Future;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forkd::config::DaemonConfig;
use forkd::daemon::{Daemon, DaemonError};
use forkd::singleton::{is_process_alive, SingletonGuard};

/// fork daemon - container-backed development sessions
#[derive(Parser, Debug)]
#[command(name = "forkd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Live daemon PIDs recorded in the PID record, excluding this process.
fn running_daemons(config: &DaemonConfig) -> Vec<u32> {
    SingletonGuard::for_current_process(config.pid_file())
        .live_holders()
        .unwrap_or_default()
}

fn stop_daemon(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: sending SIGTERM to a PID read from our own record.
    let result = unsafe { libc::kill(raw, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::from_env();

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = running_daemons(&config).first() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'forkd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize(&config)?;
            }

            run_daemon(config)
        }
        Command::Stop => {
            let pids = running_daemons(&config);
            if pids.is_empty() {
                println!("Daemon is not running.");
                return Ok(());
            }

            for pid in &pids {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(*pid)?;
            }

            for _ in 0..50 {
                if pids.iter().all(|pid| !is_process_alive(*pid)) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => match running_daemons(&config).first() {
            Some(pid) => {
                println!("Daemon is running (PID {pid})");
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                Ok(())
            }
            None => {
                println!("Daemon is not running.");
                process::exit(1);
            }
        },
    }
}

fn daemonize(config: &DaemonConfig) -> Result<()> {
    use daemonize::Daemonize;

    let log_path = config.log_file();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("forkd=info".parse()?)
                .add_directive("fork_core=info".parse()?)
                .add_directive("fork_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        state_dir = %config.state_dir().display(),
        "fork daemon starting"
    );

    let cancel_token = CancellationToken::new();

    tokio::spawn(cancel_on_signal(wait_for_shutdown_signal(), cancel_token.clone()));

    match Daemon::new(config).run(cancel_token).await {
        Ok(()) => {
            info!("fork daemon stopped");
            Ok(())
        }
        Err(DaemonError::AlreadyRunning(pid)) => {
            error!(holder = pid, "Another daemon is running, exiting");
            process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "Daemon error");
            Err(e.into())
        }
    }
}

/// Cancels `token` once `signal` resolves successfully.
///
/// If the handlers cannot be installed the daemon keeps running; it can
/// still be stopped through the PID record.
async fn cancel_on_signal<F>(signal: F, token: CancellationToken)
where
    F: Future<Output = Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            token.cancel();
        }
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers, ignoring signals");
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
