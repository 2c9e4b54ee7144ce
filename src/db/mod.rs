//! Database access layer.
//!
//! This module provides:
//! - The engine abstraction and its SQLite implementation
//! - Pooled connection handles keyed by database path
//! - Retry of transient failures with backoff
//! - Nested transactions on a single handle

pub mod engine;
pub mod handle;
pub mod pool;
pub mod retry;
pub mod sqlite;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Engine, EngineConnection};
pub use handle::{ConnectionHandle, HandleState, LeaseToken, TransactionContext};
pub use pool::{ConnectionPool, PathStats, PoolConfig, PoolStats, ShutdownReport};
pub use retry::{BackoffStrategy, RetryExecutor, RetryOutcome, RetryPolicy};
pub use sqlite::{SqliteEngine, SqliteEngineConnection, SqliteOptions};
pub use transaction::TransactionManager;
