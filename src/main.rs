#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunshare
//!
//! Shared tunnel launcher: any number of concurrent terminal sessions share
//! one long-lived remote-access tunnel process. The first session starts the
//! tunnel, later sessions join it, and the last session to exit tears it
//! down. A session killed without cleanup (`kill -9`) is healed lazily by
//! the next acquire that finds the recorded owner dead.
//!
//! ## Subcommands
//!
//! - `tunshare run [--] <command>...` — acquire a session, run the command
//!   in the foreground, release on exit
//! - `tunshare status` — show the tunnel record, liveness, and session count
//! - `tunshare shutdown` — tear everything down regardless of session count
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, per-session log file
//! config.rs        — TOML + env-var configuration
//! store.rs         — flock-gated state dir, record + reference ledger
//! supervisor.rs    — tunnel spawn, liveness probe, SIGTERM→SIGKILL, URL scan
//! session.rs       — acquire/release, stale recovery, teardown
//! naming.rs        — tunnel name resolution (env, git, dir/hostname)
//! workload.rs      — foreground command with signal forwarding
//! ```
//!
//! Diagnostics go to a per-session log file under the configured log
//! directory; the terminal only sees one-line status messages, the one-time
//! endpoint announcement, and fatal errors.

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use tunshare::session::ReleaseOutcome;
use tunshare::util::{expand_tilde, now_ms};
use tunshare::{supervisor, workload, AcquireOutcome, Config, SessionContext};

/// Share one remote-access tunnel across concurrent terminal sessions.
#[derive(Parser)]
#[command(name = "tunshare", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a shared tunnel session and run a command in the foreground.
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Working directory to switch to before running the command.
        /// Falls back to `TUNSHARE_WORKDIR`.
        #[arg(long)]
        cwd: Option<String>,
        /// Tunnel name override (sanitized and length-bounded).
        #[arg(long)]
        name: Option<String>,
        /// The command and its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Show the shared tunnel record, liveness, and session count.
    Status {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Terminate the tunnel and remove all state regardless of session count.
    Shutdown {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            config,
            cwd,
            name,
            command,
        } => cmd_run(config.as_deref(), cwd, name, &command).await,
        Commands::Status { config } => cmd_status(config.as_deref()).await,
        Commands::Shutdown { config } => cmd_shutdown(config.as_deref()).await,
    };
    std::process::exit(code);
}

/// Route diagnostics to a fresh per-session log file.
///
/// The terminal is reserved for status lines and fatal errors, so nothing is
/// ever logged to stdout/stderr.
fn init_logging(config: &Config) -> Result<(), String> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| format!("cannot create log directory {}: {e}", log_dir.display()))?;
    let path = log_dir.join(format!("tunshare-{}-{}.log", now_ms(), std::process::id()));
    let file = std::fs::File::create(&path)
        .map_err(|e| format!("cannot create log file {}: {e}", path.display()))?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn cmd_run(
    config_path: Option<&str>,
    cwd_flag: Option<String>,
    name_override: Option<String>,
    command: &[String],
) -> i32 {
    let config = Config::load(config_path);
    if let Err(e) = init_logging(&config) {
        eprintln!("tunshare: {e}");
        return 1;
    }
    info!("tunshare v{} starting", env!("CARGO_PKG_VERSION"));

    // Register INT/TERM handlers before touching any shared state, so a
    // signal between acquire and release cannot kill the launcher before
    // cleanup. The workload loop owns the actual forwarding; registration
    // is process-wide and outlives these streams.
    let _ = signal(SignalKind::interrupt());
    let _ = signal(SignalKind::terminate());

    // Preflight — fatal before any resource acquisition
    if let Err(e) = supervisor::check_binary(&config.tunnel).await {
        eprintln!("tunshare: {e}");
        return 1;
    }
    if let Err(e) = supervisor::ensure_authenticated(&config.tunnel).await {
        eprintln!("tunshare: {e}");
        return 1;
    }

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("tunshare: cannot determine working directory: {e}");
            return 1;
        }
    };
    let ctx = match SessionContext::new(config, std::process::id(), &cwd, name_override) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("tunshare: {e}");
            return 1;
        }
    };

    match ctx.acquire().await {
        Ok(AcquireOutcome::Created { name }) => println!("tunnel '{name}' started"),
        Ok(AcquireOutcome::Joined { name, sessions }) => {
            println!("joined tunnel '{name}' ({sessions} sessions)");
        }
        Err(e) => {
            eprintln!("tunshare: {e}");
            return 1;
        }
    }

    // From here on the session is held: run the workload, then always release.
    let exit_code = run_workload_phase(&ctx, cwd_flag, command).await;

    match ctx.release().await {
        Ok(ReleaseOutcome::Remaining(n)) => println!("left tunnel ({n} sessions remain)"),
        Ok(ReleaseOutcome::TornDown { name }) => match name {
            Some(name) => println!("last session closed, tunnel '{name}' stopped"),
            None => println!("last session closed"),
        },
        Ok(ReleaseOutcome::NoSession) => debug!("no session entry at release"),
        // Release failures are logged, never allowed to mask the workload's
        // exit code
        Err(e) => warn!("release failed: {e}"),
    }

    exit_code
}

/// Everything between acquire and release: endpoint announcement, working
/// directory switch, and the foreground workload.
async fn run_workload_phase(
    ctx: &SessionContext,
    cwd_flag: Option<String>,
    command: &[String],
) -> i32 {
    match ctx.announce_endpoint().await {
        Ok(Some(url)) => println!("tunnel endpoint: {url}"),
        Ok(None) => {}
        Err(e) => warn!("endpoint announcement failed: {e}"),
    }

    let workdir = cwd_flag.or_else(|| std::env::var("TUNSHARE_WORKDIR").ok());
    if let Some(dir) = workdir {
        let dir = expand_tilde(&dir).into_owned();
        if let Err(e) = std::env::set_current_dir(&dir) {
            eprintln!("tunshare: cannot switch to {dir}: {e}");
            return 1;
        }
    }

    match workload::run(command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tunshare: {e}");
            e.exit_code()
        }
    }
}

async fn cmd_status(config_path: Option<&str>) -> i32 {
    let config = Config::load(config_path);
    if let Err(e) = init_logging(&config) {
        eprintln!("tunshare: {e}");
        return 1;
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());
    let ctx = match SessionContext::new(config, std::process::id(), &cwd, None) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("tunshare: {e}");
            return 1;
        }
    };
    match ctx.status().await {
        Ok(report) => {
            match report.record {
                Some(record) => {
                    let liveness = if report.owner_alive {
                        "running"
                    } else {
                        "not running — stale, cleared on next acquire"
                    };
                    let worker = record
                        .real_pid
                        .map_or_else(String::new, |p| format!(", worker pid {p}"));
                    println!(
                        "tunnel '{}' — owner pid {} ({liveness}){worker}, {} session(s)",
                        record.name, record.pid, report.sessions
                    );
                }
                None => println!("no tunnel running"),
            }
            0
        }
        Err(e) => {
            eprintln!("tunshare: {e}");
            1
        }
    }
}

async fn cmd_shutdown(config_path: Option<&str>) -> i32 {
    let config = Config::load(config_path);
    if let Err(e) = init_logging(&config) {
        eprintln!("tunshare: {e}");
        return 1;
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());
    let ctx = match SessionContext::new(config, std::process::id(), &cwd, None) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("tunshare: {e}");
            return 1;
        }
    };
    match ctx.force_shutdown().await {
        Ok(Some(name)) => {
            println!("tunnel '{name}' terminated, all state removed");
            0
        }
        Ok(None) => {
            println!("no tunnel running");
            0
        }
        Err(e) => {
            eprintln!("tunshare: {e}");
            1
        }
    }
}
