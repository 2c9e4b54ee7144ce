//! Process-wide instance with an explicit lifecycle.
//!
//! Nothing here is created implicitly: [`init`] builds the instance, [`get`] hands out
//! clones of it and [`teardown`] shuts its pool down and clears the slot so a later
//! [`init`] starts fresh. Code that does not want a process-wide instance constructs a
//! [`PathDb`] directly.

use crate::config::CoreConfig;
use crate::db::pool::{ConnectionPool, ShutdownReport};
use crate::db::retry::RetryExecutor;
use crate::db::sqlite::{SqliteEngine, SqliteOptions};
use crate::error::{DbError, DbResult};
use crate::monitor::HealthMonitor;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

static INSTANCE: Mutex<Option<Arc<PathDb>>> = Mutex::new(None);

/// A SQLite pool with its monitor and retry executor, wired from one [`CoreConfig`].
#[derive(Debug)]
pub struct PathDb {
    config: CoreConfig,
    pool: ConnectionPool<SqliteEngine>,
    monitor: Arc<HealthMonitor>,
    retry: RetryExecutor,
}

impl PathDb {
    pub fn new(config: CoreConfig, options: SqliteOptions) -> DbResult<Self> {
        config.validate()?;
        let monitor = Arc::new(HealthMonitor::new(config.health_config()));
        let pool = ConnectionPool::with_monitor(
            SqliteEngine::new(options),
            config.pool_config(),
            monitor.clone(),
        )?;
        let retry = RetryExecutor::new(config.retry_policy(), monitor.clone());
        Ok(Self {
            config,
            pool,
            monitor,
            retry,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<SqliteEngine> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }
}

/// Create the process-wide instance. Fails if one is already installed.
pub fn init(config: CoreConfig, options: SqliteOptions) -> DbResult<Arc<PathDb>> {
    let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(DbError::config("pathdb is already initialized"));
    }
    let instance = Arc::new(PathDb::new(config, options)?);
    *slot = Some(instance.clone());
    info!(
        max_connections = instance.config.max_connections,
        "Initialized process-wide pathdb instance"
    );
    Ok(instance)
}

/// The process-wide instance.
pub fn get() -> DbResult<Arc<PathDb>> {
    INSTANCE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| DbError::config("pathdb is not initialized"))
}

/// Remove the process-wide instance and shut its pool down.
///
/// Returns `None` when nothing was installed. Clones obtained from [`get`] stay valid
/// but their pool rejects new checkouts.
pub async fn teardown() -> Option<ShutdownReport> {
    let instance = INSTANCE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()?;
    let report = instance.pool.close().await;
    info!("Process-wide pathdb instance torn down");
    Some(report)
}
