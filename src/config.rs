//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNSHARE_BINARY`, `TUNSHARE_PROVIDER`,
//!    `TUNSHARE_PROJECT`, `TUNSHARE_BRANCH`, `TUNSHARE_STATE_DIR`,
//!    `TUNSHARE_LOG_DIR`
//! 2. **Config file** — path via `--config <path>`, or `tunshare.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [tunnel]
//! binary = "cursor"
//! provider = "github"
//! settle_delay_secs = 3
//! url_wait_secs = 30
//! kill_poll_attempts = 5
//! kill_poll_interval_ms = 1000
//!
//! [naming]
//! project = "myproject"    # optional — omit to auto-detect
//! branch = "main"          # optional — omit to auto-detect
//! max_len = 50
//!
//! [paths]
//! state_dir = "~/.local/state/tunshare"
//! log_dir = "~/.local/state/tunshare/logs"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// External tunnel CLI and lifecycle timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel CLI binary (default `cursor`). Override with `TUNSHARE_BINARY`.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Login provider for the one-time auth flow (default `github`).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Seconds to wait after spawn before confirming the tunnel is alive
    /// (default 3). The CLI gives no ready signal, so this is a heuristic.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    /// How long to scan the tunnel log for the endpoint URL (default 30 s).
    #[serde(default = "default_url_wait_secs")]
    pub url_wait_secs: u64,
    /// Liveness polls after SIGTERM before escalating to SIGKILL (default 5).
    #[serde(default = "default_kill_poll_attempts")]
    pub kill_poll_attempts: u32,
    /// Interval between liveness polls in milliseconds (default 1000).
    #[serde(default = "default_kill_poll_interval_ms")]
    pub kill_poll_interval_ms: u64,
}

/// Explicit naming context. When unset, the name is derived from git state
/// or the working directory (see `naming::resolve`).
#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    /// Project label. Override with `TUNSHARE_PROJECT`.
    #[serde(default)]
    pub project: Option<String>,
    /// Branch label. Override with `TUNSHARE_BRANCH`.
    #[serde(default)]
    pub branch: Option<String>,
    /// Maximum tunnel name length (default 50).
    #[serde(default = "default_name_max_len")]
    pub max_len: usize,
}

/// Filesystem locations for lock state and logs. Leading `~` is expanded.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory for the lock file, resource record, and per-session
    /// reference entries. Override with `TUNSHARE_STATE_DIR`.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Directory for per-session log files. Override with `TUNSHARE_LOG_DIR`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_binary() -> String {
    "cursor".to_string()
}
fn default_provider() -> String {
    "github".to_string()
}
fn default_settle_delay_secs() -> u64 {
    3
}
fn default_url_wait_secs() -> u64 {
    30
}
fn default_kill_poll_attempts() -> u32 {
    5
}
fn default_kill_poll_interval_ms() -> u64 {
    1000
}
fn default_name_max_len() -> usize {
    50
}
fn default_state_dir() -> String {
    "~/.local/state/tunshare".to_string()
}
fn default_log_dir() -> String {
    "~/.local/state/tunshare/logs".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            provider: default_provider(),
            settle_delay_secs: default_settle_delay_secs(),
            url_wait_secs: default_url_wait_secs(),
            kill_poll_attempts: default_kill_poll_attempts(),
            kill_poll_interval_ms: default_kill_poll_interval_ms(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            project: None,
            branch: None,
            max_len: default_name_max_len(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            naming: NamingConfig::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tunshare.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunshare.toml").exists() {
            let content =
                std::fs::read_to_string("tunshare.toml").expect("Failed to read tunshare.toml");
            toml::from_str(&content).expect("Failed to parse tunshare.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(binary) = std::env::var("TUNSHARE_BINARY") {
            config.tunnel.binary = binary;
        }
        if let Ok(provider) = std::env::var("TUNSHARE_PROVIDER") {
            config.tunnel.provider = provider;
        }
        if let Ok(project) = std::env::var("TUNSHARE_PROJECT") {
            if !project.is_empty() {
                config.naming.project = Some(project);
            }
        }
        if let Ok(branch) = std::env::var("TUNSHARE_BRANCH") {
            if !branch.is_empty() {
                config.naming.branch = Some(branch);
            }
        }
        if let Ok(dir) = std::env::var("TUNSHARE_STATE_DIR") {
            config.paths.state_dir = dir;
        }
        if let Ok(dir) = std::env::var("TUNSHARE_LOG_DIR") {
            config.paths.log_dir = dir;
        }

        config
    }

    /// State directory with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.paths.state_dir).into_owned())
    }

    /// Log directory with `~` expanded.
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.paths.log_dir).into_owned())
    }
}
