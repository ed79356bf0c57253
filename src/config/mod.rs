//! Runtime configuration.
//!
//! Options are read from environment variables (a `.env` file is honored via
//! dotenvy in `main`), with the defaults the refresh pipeline and snapshot
//! retention are specified with. Invalid values fall back to the default
//! rather than aborting startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Schedule-loop sleep between automatic full refreshes.
    pub refresh_interval: Duration,
    /// Hard deadline for one refresh run.
    pub refresh_timeout: Duration,
    /// Sleep before the initial refresh after startup.
    pub startup_delay: Duration,
    /// Snapshots retained per profile; older ones are swept.
    pub snapshot_retention: usize,
    /// Root directory for snapshot artifacts.
    pub snapshot_dir: PathBuf,
    /// SQLite database file path.
    pub database_path: PathBuf,
    /// Listen address for the client read endpoints.
    pub bind_addr: SocketAddr,
    /// Public base URL embedded in playlist output.
    pub base_url: String,
}

pub const DEFAULT_REFRESH_INTERVAL_HOURS: u64 = 4;
pub const DEFAULT_REFRESH_TIMEOUT_MINUTES: u64 = 5;
pub const DEFAULT_STARTUP_DELAY_SECONDS: u64 = 30;
pub const DEFAULT_SNAPSHOT_RETENTION: usize = 3;
pub const DEFAULT_PORT: u16 = 5005;

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_HOURS * 3600),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_MINUTES * 60),
            startup_delay: Duration::from_secs(DEFAULT_STARTUP_DELAY_SECONDS),
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
            snapshot_dir: data_dir.join("snapshots"),
            database_path: data_dir.join("m3undle.db"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            base_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(hours) = env_parse::<u64>("M3UNDLE_REFRESH_INTERVAL_HOURS") {
            config.refresh_interval = Duration::from_secs(hours.max(1) * 3600);
        }
        if let Some(minutes) = env_parse::<u64>("M3UNDLE_REFRESH_TIMEOUT_MINUTES") {
            config.refresh_timeout = Duration::from_secs(minutes.max(1) * 60);
        }
        if let Some(seconds) = env_parse::<u64>("M3UNDLE_STARTUP_DELAY_SECONDS") {
            config.startup_delay = Duration::from_secs(seconds);
        }
        if let Some(count) = env_parse::<usize>("M3UNDLE_SNAPSHOT_RETENTION") {
            config.snapshot_retention = count.max(1);
        }
        if let Some(dir) = env_string("M3UNDLE_SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("M3UNDLE_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(addr) = env_parse::<SocketAddr>("M3UNDLE_BIND_ADDR") {
            config.bind_addr = addr;
            config.base_url = format!("http://{addr}");
        }
        if let Some(base) = env_string("M3UNDLE_BASE_URL") {
            config.base_url = base.trim_end_matches('/').to_string();
        }

        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("m3undle")
}
