//! pathdb library
//!
//! A pooled, retrying and monitored access layer for databases addressed by file path.
//! Connections are leased from a [`ConnectionPool`], statements run through a
//! [`RetryExecutor`] that records every attempt in a [`HealthMonitor`], and a
//! [`TransactionManager`] maps nested scopes onto one physical transaction.

pub mod config;
pub mod db;
pub mod error;
pub mod global;
pub mod models;
pub mod monitor;

pub use config::{Config, CoreConfig};
pub use db::{ConnectionHandle, ConnectionPool, RetryExecutor, TransactionManager};
pub use error::{DbError, DbResult};
pub use global::PathDb;
pub use monitor::HealthMonitor;
