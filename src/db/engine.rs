//! Engine abstraction consumed by the pool.
//!
//! The core never talks to a database library directly. An [`Engine`] opens one
//! [`EngineConnection`] per call for a filesystem path; everything above this module
//! (handles, retry, transactions, pooling) is engine-agnostic.

use crate::error::DbResult;
use crate::models::{ExecuteResult, QueryParam, Row};
use std::future::Future;
use std::path::Path;

/// A single open connection to one database file.
///
/// Transaction primitives are physical: `begin` starts a real transaction, `commit`
/// and `rollback` end it. Nesting is handled above this layer.
pub trait EngineConnection: Send + 'static {
    /// Execute a data-modifying statement.
    fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<ExecuteResult>> + Send;

    /// Run a statement and return its rows.
    fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;

    fn begin(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the connection gracefully.
    fn close(self) -> impl Future<Output = DbResult<()>> + Send;
}

/// Opens connections to database files.
pub trait Engine: Send + Sync + 'static {
    type Connection: EngineConnection;

    /// Short engine name used in log fields.
    fn name(&self) -> &'static str;

    /// Open a new connection to the database at `path`.
    ///
    /// Failures should be reported as [`DbError::Open`](crate::error::DbError::Open).
    fn open(&self, path: &Path) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}
