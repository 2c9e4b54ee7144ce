//! Configuration handling for pathdb.
//!
//! [`CoreConfig`] is the validated value type consumed by the pool, the retry executor
//! and the health monitor. [`Config`] is the command line / environment surface of the
//! `pathdb` binary and builds a `CoreConfig`.

use crate::db::pool::PoolConfig;
use crate::db::retry::{BackoffStrategy, RetryPolicy};
use crate::db::sqlite::SqliteOptions;
use crate::error::{DbError, DbResult};
use crate::monitor::HealthConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_SLOW_QUERY_MS: u64 = 1_000;
pub const DEFAULT_HISTORY_RETENTION: usize = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 0;

// Health thresholds
pub const DEFAULT_DEGRADED_ERROR_RATE: f64 = 0.05;
pub const DEFAULT_UNHEALTHY_ERROR_RATE: f64 = 0.25;
pub const DEFAULT_DEGRADED_LATENCY_MS: u64 = 500;
pub const DEFAULT_UNHEALTHY_LATENCY_MS: u64 = 2_000;

/// Every recognized option of the core, with its default.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Global cap on live handles across all paths (default: 10)
    pub max_connections: usize,
    /// How long a checkout may wait for capacity (default: 30s)
    pub connection_timeout: Duration,
    /// Idle handles older than this are removed by `evict_idle` sweeps (default: 300s)
    pub idle_timeout: Duration,
    /// Retries after the first attempt for transient failures (default: 3)
    pub retry_attempts: u32,
    /// Base delay between attempts (default: 100ms)
    pub retry_base_delay: Duration,
    /// Upper bound on a single backoff delay
    pub retry_max_delay: Option<Duration>,
    /// Linear or exponential backoff (default: linear)
    pub backoff: BackoffStrategy,
    /// Operations slower than this are logged and reported as slow (default: 1s)
    pub slow_query_threshold: Duration,
    /// Number of operation samples kept by the health monitor (default: 1000)
    pub history_retention: usize,
    /// Samples older than this are dropped by the health monitor
    pub history_max_age: Option<Duration>,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_latency: Duration,
    pub unhealthy_latency: Duration,
    /// How long shutdown waits for outstanding leases (default: 5s)
    pub shutdown_grace: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: None,
            backoff: BackoffStrategy::Linear,
            slow_query_threshold: Duration::from_millis(DEFAULT_SLOW_QUERY_MS),
            history_retention: DEFAULT_HISTORY_RETENTION,
            history_max_age: None,
            degraded_error_rate: DEFAULT_DEGRADED_ERROR_RATE,
            unhealthy_error_rate: DEFAULT_UNHEALTHY_ERROR_RATE,
            degraded_latency: Duration::from_millis(DEFAULT_DEGRADED_LATENCY_MS),
            unhealthy_latency: Duration::from_millis(DEFAULT_UNHEALTHY_LATENCY_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl CoreConfig {
    /// Validate option ranges and their relationships.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == 0 {
            return Err(DbError::config("max_connections must be greater than 0"));
        }
        if self.history_retention == 0 {
            return Err(DbError::config("history_retention must be greater than 0"));
        }
        for (name, rate) in [
            ("degraded_error_rate", self.degraded_error_rate),
            ("unhealthy_error_rate", self.unhealthy_error_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(DbError::config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, rate
                )));
            }
        }
        if self.degraded_error_rate > self.unhealthy_error_rate {
            return Err(DbError::config(format!(
                "degraded_error_rate ({}) cannot exceed unhealthy_error_rate ({})",
                self.degraded_error_rate, self.unhealthy_error_rate
            )));
        }
        if self.degraded_latency > self.unhealthy_latency {
            return Err(DbError::config(format!(
                "degraded_latency ({:?}) cannot exceed unhealthy_latency ({:?})",
                self.degraded_latency, self.unhealthy_latency
            )));
        }
        if let Some(max_delay) = self.retry_max_delay {
            if max_delay < self.retry_base_delay {
                return Err(DbError::config(format!(
                    "retry_max_delay ({:?}) cannot be below retry_base_delay ({:?})",
                    max_delay, self.retry_base_delay
                )));
            }
        }
        Ok(())
    }

    /// Pool settings derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            connection_timeout: self.connection_timeout,
            idle_timeout: self.idle_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            backoff: self.backoff,
        }
    }

    /// Health monitor settings derived from this configuration.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            retention: self.history_retention,
            max_age: self.history_max_age,
            slow_query_threshold: self.slow_query_threshold,
            degraded_error_rate: self.degraded_error_rate,
            unhealthy_error_rate: self.unhealthy_error_rate,
            degraded_latency: self.degraded_latency,
            unhealthy_latency: self.unhealthy_latency,
        }
    }
}

/// Configuration for the `pathdb` command line tool.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pathdb",
    about = "Run statements against SQLite files through a pooled, retrying, monitored core",
    version,
    author
)]
pub struct Config {
    /// Database files to work with. The first one is the target of --execute/--query.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "PATH",
        env = "PATHDB_DATABASE",
        value_delimiter = ','
    )]
    pub databases: Vec<PathBuf>,

    /// Statements to execute (INSERT, UPDATE, DDL...). Can be repeated.
    #[arg(short = 'e', long = "execute", value_name = "SQL")]
    pub statements: Vec<String>,

    /// Queries whose rows are printed. Can be repeated.
    #[arg(short = 'q', long = "query", value_name = "SQL")]
    pub queries: Vec<String>,

    /// Run all --execute statements in one transaction
    #[arg(long)]
    pub transaction: bool,

    /// Do not create database files that do not exist yet
    #[arg(long)]
    pub no_create: bool,

    /// Maximum live handles across all databases
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "PATHDB_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Checkout wait limit in milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECTION_TIMEOUT_MS, env = "PATHDB_CONNECTION_TIMEOUT")]
    pub connection_timeout: u64,

    /// Idle handle lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "PATHDB_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Retries for transient failures
    #[arg(long, default_value_t = DEFAULT_RETRY_ATTEMPTS, env = "PATHDB_RETRY_ATTEMPTS")]
    pub retry_attempts: u32,

    /// Base retry delay in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_BASE_DELAY_MS, env = "PATHDB_RETRY_BASE_DELAY")]
    pub retry_base_delay: u64,

    /// Upper bound on a single retry delay in milliseconds
    #[arg(long, env = "PATHDB_RETRY_MAX_DELAY")]
    pub retry_max_delay: Option<u64>,

    /// Backoff strategy between retries
    #[arg(long, value_enum, default_value = "linear", env = "PATHDB_BACKOFF")]
    pub backoff: BackoffStrategy,

    /// SQLite busy timeout in milliseconds (0 reports contention immediately)
    #[arg(long, default_value_t = DEFAULT_BUSY_TIMEOUT_MS, env = "PATHDB_BUSY_TIMEOUT")]
    pub busy_timeout: u64,

    /// Slow operation threshold in milliseconds
    #[arg(long, default_value_t = DEFAULT_SLOW_QUERY_MS, env = "PATHDB_SLOW_QUERY")]
    pub slow_query: u64,

    /// Number of operation samples kept for statistics
    #[arg(long, default_value_t = DEFAULT_HISTORY_RETENTION, env = "PATHDB_HISTORY_RETENTION")]
    pub history_retention: usize,

    /// Maximum sample age in seconds
    #[arg(long, env = "PATHDB_HISTORY_MAX_AGE")]
    pub history_max_age: Option<u64>,

    /// Shutdown grace period in seconds
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS, env = "PATHDB_SHUTDOWN_GRACE")]
    pub shutdown_grace: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PATHDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "PATHDB_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            databases: Vec::new(),
            statements: Vec::new(),
            queries: Vec::new(),
            transaction: false,
            no_create: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_MS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay: None,
            backoff: BackoffStrategy::Linear,
            busy_timeout: DEFAULT_BUSY_TIMEOUT_MS,
            slow_query: DEFAULT_SLOW_QUERY_MS,
            history_retention: DEFAULT_HISTORY_RETENTION,
            history_max_age: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE_SECS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Build and validate the core configuration.
    pub fn core_config(&self) -> DbResult<CoreConfig> {
        let core = CoreConfig {
            max_connections: self.max_connections,
            connection_timeout: Duration::from_millis(self.connection_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay),
            retry_max_delay: self.retry_max_delay.map(Duration::from_millis),
            backoff: self.backoff,
            slow_query_threshold: Duration::from_millis(self.slow_query),
            history_retention: self.history_retention,
            history_max_age: self.history_max_age.map(Duration::from_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
            ..CoreConfig::default()
        };
        core.validate()?;
        Ok(core)
    }

    /// SQLite engine options.
    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            create_if_missing: !self.no_create,
            busy_timeout: Duration::from_millis(self.busy_timeout),
            ..SqliteOptions::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
