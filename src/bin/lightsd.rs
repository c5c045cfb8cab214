//! lightsd - LAN daemon for LIFX-style smart bulbs
//!
//! This binary discovers gateways on the local network, keeps their bulbs'
//! state up to date and runs the engine until it is told to stop.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! lightsd start
//!
//! # Start the daemon (background/daemonized)
//! lightsd start -d
//!
//! # Stop the daemon
//! lightsd stop
//!
//! # Check daemon status
//! lightsd status
//!
//! # Discover bulbs for 5 seconds and print them as JSON
//! lightsd scan --seconds 5
//!
//! # Use another config file
//! LIGHTSD_CONFIG=/etc/lightsd.toml lightsd start
//!
//! # Enable debug logging
//! RUST_LOG=lightsd=debug lightsd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown, every gateway is closed

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lightsd::{spawn_engine, EngineConfig, EngineHandle};

/// lightsd - smart bulb gateway daemon
#[derive(Parser, Debug)]
#[command(name = "lightsd", version, about)]
struct Args {
    /// Config file (defaults to $LIGHTSD_CONFIG, then the XDG config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for the lightsd crates (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    verbosity: Option<String>,

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
    /// Discover bulbs for a while, print them as JSON and exit
    Scan {
        /// How long to listen for gateways
        #[arg(short, long, default_value_t = 3)]
        seconds: u64,
    },
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    let state_dir = dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("lightsd");
    state_dir.join("lightsd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    let state_dir = dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("lightsd");
    state_dir.join("lightsd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

/// Removes the PID file.
fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {}", pid);
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::discover(explicit).context("Failed to load configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'lightsd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so config errors reach the terminal
            let config = load_config(args.config.as_deref())?;

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config, args.verbosity);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Wait for process to exit (up to 5 seconds)
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Log: {}", log_file_path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
        Command::Scan { seconds } => {
            let config = load_config(args.config.as_deref())?;
            run_scan(config, args.verbosity, Duration::from_secs(seconds))
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` is honoured; `--verbosity` replaces the default level of the
/// lightsd crates. Logs go to stderr so `scan` output stays parseable.
fn init_logging(verbosity: Option<&str>) -> Result<()> {
    let level = verbosity.unwrap_or("info");
    let mut filter = EnvFilter::from_default_env();
    for krate in ["lightsd", "lifx_protocol", "lifx_core"] {
        let directive = format!("{krate}={level}")
            .parse()
            .with_context(|| format!("Invalid verbosity {level:?}"))?;
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: EngineConfig, verbosity: Option<String>) -> Result<()> {
    init_logging(verbosity.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        listen = %config.listen,
        "lightsd starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let socket = lightsd::transport::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    let (handle, engine_task) = spawn_engine(config, socket, cancel_token.clone());
    spawn_event_logger(&handle, cancel_token);

    if let Err(e) = engine_task.await {
        error!(error = %e, "Engine task failed");
        return Err(e.into());
    }

    info!("lightsd stopped");
    Ok(())
}

/// Logs engine events as they are published.
fn spawn_event_logger(handle: &EngineHandle, cancel: CancellationToken) {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => debug!(?event, "engine event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagging behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Runs discovery for `duration` and prints the bulbs found.
#[tokio::main]
async fn run_scan(config: EngineConfig, verbosity: Option<String>, duration: Duration) -> Result<()> {
    init_logging(verbosity.as_deref())?;

    let cancel_token = CancellationToken::new();
    let socket = lightsd::transport::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let (handle, engine_task) = spawn_engine(config, socket, cancel_token.clone());

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        result = wait_for_shutdown_signal() => result?,
    }

    let bulbs = handle.list_bulbs().await;
    cancel_token.cancel();
    if let Err(e) = engine_task.await {
        warn!(error = %e, "Engine task failed");
    }

    let json = serde_json::to_string_pretty(&bulbs).context("Failed to serialize bulbs")?;
    println!("{json}");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
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
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
