//! Daemon configuration.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

/// Environment variable overriding the configuration file path.
const ENV_CONFIG_PATH: &str = "ALPENHORN_CONFIG";

/// Default configuration file path.
const DEFAULT_CONFIG_PATH: &str = "/etc/alpenhorn/alpenhornd.yaml";

/// Configuration for the Alpenhorn daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Database connection.
    pub database: DatabaseConfig,

    /// Daemon behavior.
    #[serde(default = "Default::default")]
    pub daemon: DaemonConfig,

    /// Logging.
    #[serde(default = "Default::default")]
    pub logging: LoggingConfig,

    /// Metrics endpoint.
    #[serde(default = "Default::default")]
    pub metrics: MetricsConfig,

    /// I/O behavior defaults.
    #[serde(default = "Default::default")]
    pub io: IoDefaultsConfig,

    /// Extensions to load at startup, by name.
    #[serde(default = "Vec::new")]
    pub extensions: Vec<String>,

    /// Configuration consumed by the `pattern-import` extension.
    #[serde(rename = "import")]
    #[serde(default = "Default::default")]
    pub import: ImportConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default = "load_database_url_from_env")]
    pub url: String,
}

/// Daemon behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Hostname override.
    ///
    /// A node is only handled by the daemon whose hostname matches the
    /// node's `host` column. If unset, the system hostname is used.
    #[serde(default = "Default::default")]
    pub hostname: Option<String>,

    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Main loop period.
    #[serde(rename = "update-interval")]
    #[serde(with = "humantime_serde", default = "default_update_interval")]
    pub update_interval: Duration,

    /// How long to wait for in-progress tasks on shutdown.
    #[serde(rename = "shutdown-grace")]
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Age after which leftover hidden temporary files are deleted.
    #[serde(rename = "stale-temp-age")]
    #[serde(with = "humantime_serde", default = "default_stale_temp_age")]
    pub stale_temp_age: Duration,

    /// Cap on verification tasks scheduled per node per tick.
    #[serde(rename = "verify-per-tick")]
    #[serde(default = "default_verify_per_tick")]
    pub verify_per_tick: usize,

    /// Minimum age before auto-verification re-checks a copy.
    #[serde(rename = "auto-verify-min-days")]
    #[serde(default = "default_auto_verify_min_days")]
    pub auto_verify_min_days: u32,

    /// Pull attempts before the destination copy is marked missing.
    #[serde(rename = "max-pull-attempts")]
    #[serde(default = "default_max_pull_attempts")]
    pub max_pull_attempts: u32,

    /// Base timeout for transfer subprocesses.
    ///
    /// The timeout applied to a transfer is
    /// `pull-timeout-base + size / pull-bytes-per-second`.
    #[serde(rename = "pull-timeout-base")]
    #[serde(with = "humantime_serde", default = "default_pull_timeout_base")]
    pub pull_timeout_base: Duration,

    /// Assumed worst-case transfer rate, for timeout computation.
    #[serde(rename = "pull-bytes-per-second")]
    #[serde(default = "default_pull_bytes_per_second")]
    pub pull_bytes_per_second: u64,

    /// Force a specific transfer tool instead of runtime detection.
    #[serde(rename = "pull-transfer-tool")]
    #[serde(default = "Default::default")]
    pub pull_transfer_tool: Option<TransferTool>,
}

/// An external transfer tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransferTool {
    /// BBCP, for fast multi-stream remote transfers.
    #[serde(rename = "bbcp")]
    Bbcp,

    /// Rsync over SSH (or locally).
    #[serde(rename = "rsync")]
    Rsync,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Socket address to serve `/metrics` on. Disabled if unset.
    #[serde(default = "Default::default")]
    pub listen: Option<SocketAddr>,
}

/// Per-class I/O defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct IoDefaultsConfig {
    /// When to verify the hash of a freshly pulled file.
    #[serde(rename = "verify-on-pull")]
    #[serde(default = "Default::default")]
    pub verify_on_pull: VerifyOnPull,

    /// Concurrent pulls allowed per destination node.
    #[serde(rename = "concurrent-pulls")]
    #[serde(default = "default_concurrent_pulls")]
    pub concurrent_pulls: usize,
}

/// Pull verification policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum VerifyOnPull {
    /// Verify every pull.
    #[serde(rename = "always")]
    Always,

    /// Verify pulls onto archive nodes only.
    #[default]
    #[serde(rename = "archive-only")]
    ArchiveOnly,

    /// Trust the transfer tool.
    #[serde(rename = "never")]
    Never,
}

/// Configuration for the built-in `pattern-import` detector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportConfig {
    /// Anchored regular expressions matching acceptable acquisition names.
    #[serde(rename = "acq-patterns")]
    #[serde(default = "Vec::new")]
    pub acq_patterns: Vec<String>,

    /// Anchored regular expressions matching acceptable file names
    /// within an acquisition. Empty means any file name is accepted.
    #[serde(rename = "file-patterns")]
    #[serde(default = "Vec::new")]
    pub file_patterns: Vec<String>,
}

impl Config {
    /// The hostname used to claim nodes from the Data Index.
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.daemon.hostname {
            return hostname.to_owned();
        }

        sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
    }

    /// Does `verify-on-pull` apply to a pull onto this kind of node?
    pub fn verify_pull_to(&self, archive_node: bool) -> bool {
        match self.io.verify_on_pull {
            VerifyOnPull::Always => true,
            VerifyOnPull::ArchiveOnly => archive_node,
            VerifyOnPull::Never => false,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            workers: default_workers(),
            update_interval: default_update_interval(),
            shutdown_grace: default_shutdown_grace(),
            stale_temp_age: default_stale_temp_age(),
            verify_per_tick: default_verify_per_tick(),
            auto_verify_min_days: default_auto_verify_min_days(),
            max_pull_attempts: default_max_pull_attempts(),
            pull_timeout_base: default_pull_timeout_base(),
            pull_bytes_per_second: default_pull_bytes_per_second(),
            pull_transfer_tool: None,
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

impl Default for IoDefaultsConfig {
    fn default() -> Self {
        Self {
            verify_on_pull: VerifyOnPull::default(),
            concurrent_pulls: default_concurrent_pulls(),
        }
    }
}

fn load_database_url_from_env() -> String {
    env::var("ALPENHORN_DATABASE_URL").unwrap_or_default()
}

fn default_workers() -> usize {
    4
}

fn default_update_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_temp_age() -> Duration {
    Duration::from_secs(3600)
}

fn default_verify_per_tick() -> usize {
    25
}

fn default_auto_verify_min_days() -> u32 {
    7
}

fn default_max_pull_attempts() -> u32 {
    10
}

fn default_pull_timeout_base() -> Duration {
    Duration::from_secs(300)
}

fn default_pull_bytes_per_second() -> u64 {
    20_000_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrent_pulls() -> usize {
    2
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    load_config_from_str(&config)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(s)?;

    if config.database.url.is_empty() {
        anyhow::bail!(
            "Database URL must be specified in database.url or \
            the ALPENHORN_DATABASE_URL environment."
        );
    }

    Ok(config)
}

/// Loads the configuration in the standard order.
///
/// Precedence is as follows
/// * Path given on the command line
/// * Path read from the ALPENHORN_CONFIG environment variable
/// * The default path
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        return load_config_from_path(config_path);
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_PATH) {
        return load_config_from_path(Path::new(&env_path));
    }

    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}
