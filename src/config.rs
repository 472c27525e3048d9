//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` reader over `LANSCAN_*`
//! variables. Unparseable values fall back to the default with a warning.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = raw, "Ignoring unparseable configuration value");
            default
        }
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// HTTP / process level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP + WebSocket server binds to.
    pub bind_addr: String,
    /// SQLite database file. `:memory:` selects the in-memory store.
    pub db_path: String,
    /// Directory for daily-rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            db_path: "./data/lanscan.db".to_string(),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Check what cannot fall back silently: the bind address must parse and
    /// the log directory, if any, must be creatable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "LANSCAN_BIND_ADDR".to_string(),
                message: e.to_string(),
            })?;
        if let Some(dir) = &self.log_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("LANSCAN_BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_path: std::env::var("LANSCAN_DB_PATH").unwrap_or(defaults.db_path),
            log_dir: std::env::var("LANSCAN_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Scan coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delivery attempts for the initial start command.
    pub start_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure.
    pub start_backoff: Duration,
    /// A running job silent for longer than this is failed with `timeout`.
    pub max_silent: Duration,
    /// How often the watchdog sweeps active jobs.
    pub watchdog_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            start_attempts: 3,
            start_backoff: Duration::from_millis(200),
            max_silent: Duration::from_secs(15 * 60),
            watchdog_interval: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            start_attempts: env_or("LANSCAN_START_ATTEMPTS", d.start_attempts).max(1),
            start_backoff: env_millis("LANSCAN_START_BACKOFF_MS", d.start_backoff),
            max_silent: env_secs("LANSCAN_SCAN_TIMEOUT_SECS", d.max_silent),
            watchdog_interval: env_secs("LANSCAN_WATCHDOG_INTERVAL_SECS", d.watchdog_interval),
        }
    }
}

/// Worker control-link settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Control endpoint of the scanning worker.
    pub url: String,
    /// Upper bound on a single command send.
    pub send_timeout: Duration,
    /// Delay between redial attempts while the link is down.
    pub redial_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            send_timeout: Duration::from_secs(2),
            redial_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: std::env::var("LANSCAN_WORKER_URL").unwrap_or(d.url),
            send_timeout: env_millis("LANSCAN_WORKER_SEND_TIMEOUT_MS", d.send_timeout),
            redial_delay: env_millis("LANSCAN_WORKER_REDIAL_MS", d.redial_delay),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber queue bound; the oldest event is dropped on overflow.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_capacity: env_or("LANSCAN_BUS_CAPACITY", d.queue_capacity).max(1),
        }
    }
}

/// Client-side reconnect policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Push endpoint, e.g. `ws://host:3000/ws`.
    pub url: String,
    /// REST base used for resync, e.g. `http://host:3000`.
    pub api_url: String,
    /// Linear backoff step: attempt `n` waits `base * n`.
    pub base_delay: Duration,
    /// Cap on any single backoff delay.
    pub max_delay: Duration,
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
    /// A connection open at least this long resets the attempt counter.
    pub stable_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            api_url: "http://127.0.0.1:3000".to_string(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url: std::env::var("LANSCAN_PUSH_URL").unwrap_or(d.url),
            api_url: std::env::var("LANSCAN_API_URL").unwrap_or(d.api_url),
            base_delay: env_millis("LANSCAN_RECONNECT_BASE_MS", d.base_delay),
            max_delay: env_millis("LANSCAN_RECONNECT_MAX_MS", d.max_delay),
            max_attempts: env_or("LANSCAN_RECONNECT_MAX_ATTEMPTS", d.max_attempts),
            stable_after: env_millis("LANSCAN_RECONNECT_STABLE_MS", d.stable_after),
        }
    }
}
