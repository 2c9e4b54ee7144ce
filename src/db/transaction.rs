//! Nested transactions on a single handle.
//!
//! Only the outermost `begin` / `commit` reach the engine; inner scopes just move the
//! depth counter. A rollback at any depth rolls back the real transaction once and
//! aborts the handle: statements and `commit` calls of the enclosing scopes fail with
//! [`DbError::TransactionAborted`] until the outermost scope has exited.
//!
//! A scope whose future is dropped mid-way marks the handle interrupted. The next call
//! on the handle, or the pool at checkin, rolls the transaction back before anything
//! else runs.

use crate::db::engine::EngineConnection;
use crate::db::handle::ConnectionHandle;
use crate::db::retry::RetryExecutor;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, Statement};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Marks the handle interrupted unless disarmed before the scope future is dropped.
struct ScopeGuard {
    marker: Option<Arc<AtomicU32>>,
    entry_depth: u32,
}

impl ScopeGuard {
    fn arm<C: EngineConnection>(handle: &ConnectionHandle<C>) -> Self {
        Self {
            marker: Some(handle.interrupt_marker()),
            entry_depth: handle.transaction_depth(),
        }
    }

    fn disarm(mut self) {
        self.marker = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(marker) = self.marker.take() else {
            return;
        };
        let depth = self.entry_depth;
        // Keep the outermost interrupted scope.
        let _ = marker.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current == 0 || depth < current).then_some(depth)
        });
    }
}

/// Transaction state machine over one borrowed handle.
pub struct TransactionManager<'h, C: EngineConnection> {
    handle: &'h mut ConnectionHandle<C>,
    retry: Option<RetryExecutor>,
}

impl<'h, C: EngineConnection> TransactionManager<'h, C> {
    pub fn new(handle: &'h mut ConnectionHandle<C>) -> Self {
        Self {
            handle,
            retry: None,
        }
    }

    /// Route statements and the outermost commit through `retry`.
    pub fn with_retry(handle: &'h mut ConnectionHandle<C>, retry: &RetryExecutor) -> Self {
        Self {
            handle,
            retry: Some(retry.clone()),
        }
    }

    pub fn handle(&mut self) -> &mut ConnectionHandle<C> {
        self.handle
    }

    pub fn depth(&self) -> u32 {
        self.handle.transaction_depth()
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    /// Open a scope. Only the outermost scope starts a real transaction.
    pub async fn begin(&mut self) -> DbResult<()> {
        self.handle.recover_interrupted().await?;
        if self.handle.is_aborted() {
            return Err(DbError::TransactionAborted);
        }
        if self.handle.transaction_depth() == 0 {
            self.handle.begin_physical().await?;
            debug!(
                path = %self.handle.path().display(),
                handle_id = self.handle.id(),
                "Transaction started"
            );
        }
        self.handle.tx_mut().depth += 1;
        Ok(())
    }

    /// Close a scope. Only the outermost scope commits for real.
    ///
    /// When the physical commit fails the transaction is still open at depth 1 and
    /// must be rolled back by the caller.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.handle.recover_interrupted().await?;
        let tx = self.handle.tx_mut();
        if tx.is_aborted() {
            tx.aborted_scopes -= 1;
            return Err(DbError::TransactionAborted);
        }
        match tx.depth {
            0 => return Err(DbError::NoActiveTransaction),
            1 => {}
            _ => {
                tx.depth -= 1;
                return Ok(());
            }
        }

        let result = match &self.retry {
            Some(retry) => retry.commit(self.handle).await,
            None => self.handle.commit_physical().await,
        };

        match result {
            Ok(()) => {
                self.handle.tx_mut().depth = 0;
                debug!(
                    path = %self.handle.path().display(),
                    handle_id = self.handle.id(),
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    path = %self.handle.path().display(),
                    handle_id = self.handle.id(),
                    error = %e,
                    "Commit failed; transaction still open"
                );
                Err(e)
            }
        }
    }

    /// Roll back the whole transaction, whatever the current depth.
    ///
    /// Inside an already aborted transaction this only closes the scope. Without a
    /// transaction it is a logged no-op.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.handle.recover_interrupted().await?;
        let tx = self.handle.tx_mut();
        if tx.is_aborted() {
            tx.aborted_scopes -= 1;
            return Ok(());
        }
        if tx.depth == 0 {
            warn!(
                path = %self.handle.path().display(),
                "Rollback requested with no active transaction"
            );
            return Ok(());
        }

        let depth = tx.depth;
        tx.aborted_scopes = depth - 1;
        tx.depth = 0;

        match self.handle.rollback_physical().await {
            Ok(()) => {
                debug!(
                    path = %self.handle.path().display(),
                    handle_id = self.handle.id(),
                    depth,
                    "Transaction rolled back"
                );
                Ok(())
            }
            Err(e) => {
                self.handle.tx_mut().poisoned = true;
                warn!(
                    path = %self.handle.path().display(),
                    handle_id = self.handle.id(),
                    error = %e,
                    "Rollback failed"
                );
                Err(e)
            }
        }
    }

    /// Run `op` inside a scope: commit on success, roll back on error.
    ///
    /// A failing rollback is reported as [`DbError::TransactionRollbackFailed`]
    /// carrying both errors. Dropping the returned future before it completes leaves
    /// the handle interrupted; its next call rolls the transaction back.
    pub async fn scoped<T, F>(&mut self, op: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ConnectionHandle<C>) -> BoxFuture<'c, DbResult<T>>,
    {
        self.begin().await?;
        let guard = ScopeGuard::arm(self.handle);
        let result = op(&mut *self.handle).await;
        let result = self.finish(result).await;
        guard.disarm();
        result
    }

    /// [`scoped`](Self::scoped) with a deadline. On expiry the body is dropped, the
    /// transaction rolled back and [`DbError::Timeout`] returned.
    pub async fn scoped_with_timeout<T, F>(&mut self, timeout: Duration, op: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut ConnectionHandle<C>) -> BoxFuture<'c, DbResult<T>>,
    {
        self.begin().await?;
        let guard = ScopeGuard::arm(self.handle);
        let entry_depth = self.handle.transaction_depth();
        let started = Instant::now();

        let result = tokio::time::timeout(timeout, op(&mut *self.handle)).await;
        let result = match result {
            Ok(result) => self.finish(result).await,
            Err(_) => self.expire(entry_depth, timeout, started).await,
        };
        guard.disarm();
        result
    }

    /// Roll back a scope whose body hit the deadline.
    async fn expire<T>(
        &mut self,
        entry_depth: u32,
        timeout: Duration,
        started: Instant,
    ) -> DbResult<T> {
        // Scopes opened by the dropped body have marked the handle; they are
        // cleaned up here.
        self.handle.clear_interrupted();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        warn!(
            path = %self.handle.path().display(),
            timeout_ms = timeout.as_millis() as u64,
            "Transaction body timed out, rolling back"
        );
        let timeout_err = DbError::timeout("transaction", elapsed_ms);

        // Scopes opened by the dropped body will never exit.
        let tx = self.handle.tx_mut();
        if tx.is_aborted() {
            tx.aborted_scopes = entry_depth - 1;
            return Err(timeout_err);
        }
        tx.depth = entry_depth;

        match self.rollback().await {
            Ok(()) => Err(timeout_err),
            Err(rollback_err) => Err(DbError::rollback_failed(timeout_err, rollback_err)),
        }
    }

    /// Run every statement in one transaction and return the per-statement results.
    pub async fn execute_in_transaction(
        &mut self,
        statements: &[Statement],
    ) -> DbResult<Vec<ExecuteResult>> {
        self.begin().await?;
        let guard = ScopeGuard::arm(self.handle);
        let mut results = Vec::with_capacity(statements.len());
        let mut outcome = Ok(());
        for stmt in statements {
            match self.execute(&stmt.sql, &stmt.params).await {
                Ok(r) => results.push(r),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let result = self.finish(outcome.map(|()| results)).await;
        guard.disarm();
        result
    }

    /// Insert `rows` into `table` in chunks of `batch_size` rows, all in one
    /// transaction. Returns the number of rows inserted.
    pub async fn batch_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<QueryParam>],
        batch_size: usize,
    ) -> DbResult<u64> {
        if batch_size == 0 {
            return Err(DbError::invalid_input("batch_size must be greater than 0"));
        }
        if columns.is_empty() {
            return Err(DbError::invalid_input("batch_insert needs at least one column"));
        }
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(DbError::invalid_input(format!(
                "row {} has {} values, expected {}",
                idx,
                row.len(),
                columns.len()
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let table_ident = quote_identifier(table)?;
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<DbResult<Vec<_>>>()?
            .join(", ");
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

        let started = Instant::now();
        self.begin().await?;
        let guard = ScopeGuard::arm(self.handle);
        let mut inserted = 0u64;
        let mut outcome = Ok(());
        for chunk in rows.chunks(batch_size) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table_ident,
                column_list,
                vec![placeholders.as_str(); chunk.len()].join(", ")
            );
            let params: Vec<QueryParam> = chunk.iter().flatten().cloned().collect();
            match self.execute(&sql, &params).await {
                Ok(r) => inserted += r.rows_affected,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let inserted = self.finish(outcome.map(|()| inserted)).await;
        guard.disarm();
        let inserted = inserted?;
        info!(
            table = %table,
            rows = inserted,
            batches = rows.len().div_ceil(batch_size),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch insert committed"
        );
        Ok(inserted)
    }

    /// Run `UPDATE table SET set_clause WHERE conditions[i]` once per parameter list,
    /// all in one transaction. Each statement binds the placeholders of `set_clause`
    /// followed by those of its condition. Returns the total rows affected.
    pub async fn batch_update(
        &mut self,
        table: &str,
        set_clause: &str,
        conditions: &[&str],
        params: &[Vec<QueryParam>],
        batch_size: usize,
    ) -> DbResult<u64> {
        if set_clause.trim().is_empty() {
            return Err(DbError::invalid_input("batch_update needs a SET clause"));
        }
        validate_per_row("batch_update", conditions, params, batch_size)?;
        let table_ident = quote_identifier(table)?;
        let statements = conditions
            .iter()
            .map(|cond| format!("UPDATE {table_ident} SET {set_clause} WHERE {cond}"))
            .collect();
        self.run_per_row("update", table, statements, params, batch_size)
            .await
    }

    /// Run `DELETE FROM table WHERE conditions[i]` once per parameter list, all in one
    /// transaction. Returns the total rows deleted.
    pub async fn batch_delete(
        &mut self,
        table: &str,
        conditions: &[&str],
        params: &[Vec<QueryParam>],
        batch_size: usize,
    ) -> DbResult<u64> {
        validate_per_row("batch_delete", conditions, params, batch_size)?;
        let table_ident = quote_identifier(table)?;
        let statements = conditions
            .iter()
            .map(|cond| format!("DELETE FROM {table_ident} WHERE {cond}"))
            .collect();
        self.run_per_row("delete", table, statements, params, batch_size)
            .await
    }

    async fn run_per_row(
        &mut self,
        kind: &'static str,
        table: &str,
        statements: Vec<String>,
        params: &[Vec<QueryParam>],
        batch_size: usize,
    ) -> DbResult<u64> {
        if statements.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        self.begin().await?;
        let guard = ScopeGuard::arm(self.handle);
        let mut affected = 0u64;
        let mut outcome = Ok(());
        'chunks: for (sql_chunk, param_chunk) in statements
            .chunks(batch_size)
            .zip(params.chunks(batch_size))
        {
            for (sql, row_params) in sql_chunk.iter().zip(param_chunk) {
                match self.execute(sql, row_params).await {
                    Ok(r) => affected += r.rows_affected,
                    Err(e) => {
                        warn!(table = %table, kind, error = %e, "Batch statement failed");
                        outcome = Err(e);
                        break 'chunks;
                    }
                }
            }
            debug!(table = %table, kind, statements = sql_chunk.len(), "Batch chunk executed");
        }

        let affected = self.finish(outcome.map(|()| affected)).await;
        guard.disarm();
        let affected = affected?;
        info!(
            table = %table,
            kind,
            statements = statements.len(),
            rows = affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(affected)
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        match &self.retry {
            Some(retry) => retry.execute_statement(self.handle, sql, params).await,
            None => self.handle.execute(sql, params).await,
        }
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        match result {
            Ok(value) => match self.commit().await {
                Ok(()) => Ok(value),
                Err(commit_err) if self.handle.transaction_depth() > 0 => {
                    match self.rollback().await {
                        Ok(()) => Err(commit_err),
                        Err(rollback_err) => Err(DbError::rollback_failed(commit_err, rollback_err)),
                    }
                }
                Err(commit_err) => Err(commit_err),
            },
            Err(e) => match self.rollback().await {
                Ok(()) => Err(e),
                Err(rollback_err) => Err(DbError::rollback_failed(e, rollback_err)),
            },
        }
    }
}

fn validate_per_row(
    op: &str,
    conditions: &[&str],
    params: &[Vec<QueryParam>],
    batch_size: usize,
) -> DbResult<()> {
    if batch_size == 0 {
        return Err(DbError::invalid_input("batch_size must be greater than 0"));
    }
    if conditions.len() != params.len() {
        return Err(DbError::invalid_input(format!(
            "{op} got {} conditions for {} parameter lists",
            conditions.len(),
            params.len()
        )));
    }
    if let Some(idx) = conditions.iter().position(|c| c.trim().is_empty()) {
        return Err(DbError::invalid_input(format!("{op} condition {idx} is empty")));
    }
    Ok(())
}

/// Double-quote an SQL identifier.
fn quote_identifier(name: &str) -> DbResult<String> {
    if name.trim().is_empty() {
        return Err(DbError::invalid_input("identifier must not be empty"));
    }
    if name.contains('\0') {
        return Err(DbError::invalid_input("identifier must not contain NUL"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::engine::Engine;
    use crate::db::retry::RetryPolicy;
    use crate::db::testing::ScriptedEngine;
    use crate::monitor::HealthMonitor;
    use std::path::Path;
    use std::sync::Arc;

    async fn handle(engine: &ScriptedEngine) -> ConnectionHandle<crate::db::testing::ScriptedConnection> {
        let conn = engine.open(Path::new("tx.db")).await.unwrap();
        ConnectionHandle::new("tx.db", conn)
    }

    fn retry() -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            },
            Arc::new(HealthMonitor::default()),
        )
    }

    #[tokio::test]
    async fn test_nested_begin_commit_issues_one_physical_pair() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        assert_eq!(tx.depth(), 3);
        tx.commit().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(engine.stats().commits, 0);
        tx.commit().await.unwrap();

        assert_eq!(tx.depth(), 0);
        let stats = engine.stats();
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.rollbacks, 0);
    }

    #[tokio::test]
    async fn test_commit_without_transaction() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DbError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn test_rollback_without_transaction_is_noop() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.rollback().await.unwrap();
        assert_eq!(engine.stats().rollbacks, 0);
        assert!(!tx.is_aborted());
    }

    #[tokio::test]
    async fn test_inner_rollback_aborts_outer_commit() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(engine.stats().rollbacks, 1);
        assert!(tx.is_aborted());
        assert_eq!(tx.depth(), 0);

        let executes_before = engine.stats().executes;
        let err = tx
            .handle()
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));
        assert_eq!(engine.stats().executes, executes_before);

        let err = tx.begin().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));
        assert!(!tx.is_aborted());

        let stats = engine.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 1);

        // Handle usable again
        tx.handle().execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_outer_rollback_after_inner_rollback_is_noop() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        tx.begin().await.unwrap();
        tx.rollback().await.unwrap();
        tx.rollback().await.unwrap();
        assert!(tx.is_aborted());
        tx.rollback().await.unwrap();
        assert!(!tx.is_aborted());
        assert_eq!(engine.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_scoped_commits_on_success() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let rows = tx
            .scoped(|h| {
                Box::pin(async move {
                    h.execute("INSERT INTO t VALUES (1)", &[]).await?;
                    h.execute("INSERT INTO t VALUES (2)", &[]).await?;
                    Ok(2)
                })
            })
            .await
            .unwrap();

        assert_eq!(rows, 2);
        let stats = engine.stats();
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.rollbacks, 0);
    }

    #[tokio::test]
    async fn test_scoped_rolls_back_on_error() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);
        engine.fail_statements([DbError::fatal("UNIQUE constraint failed")]);

        let err = tx
            .scoped(|h| {
                Box::pin(async move {
                    h.execute("INSERT INTO t VALUES (1)", &[]).await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Engine { .. }));
        let stats = engine.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(tx.depth(), 0);
        assert!(!tx.is_aborted());
    }

    #[tokio::test]
    async fn test_scoped_reports_rollback_failure() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        engine.fail_statements([DbError::fatal("constraint")]);
        engine.fail_rollbacks([DbError::fatal("disk I/O error")]);

        let err = TransactionManager::new(&mut h)
            .scoped(|h| Box::pin(async move { h.execute("DELETE FROM t", &[]).await }))
            .await
            .unwrap_err();

        match err {
            DbError::TransactionRollbackFailed {
                transaction_error,
                rollback_error,
            } => {
                assert!(transaction_error.to_string().contains("constraint"));
                assert!(rollback_error.to_string().contains("disk I/O"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(h.transaction().poisoned);
    }

    #[tokio::test]
    async fn test_nested_scoped_inner_failure_aborts_outer() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.begin().await.unwrap();
        let inner = tx
            .scoped(|_| Box::pin(async move { Err::<(), _>(DbError::fatal("boom")) }))
            .await;
        assert!(inner.is_err());
        assert!(tx.is_aborted());

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));
        let stats = engine.stats();
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 1);
    }

    #[tokio::test]
    async fn test_commit_goes_through_retry() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        engine.fail_commits([DbError::transient("database is locked")]);
        let retry = retry();
        let mut tx = TransactionManager::with_retry(&mut h, &retry);

        tx.begin().await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(engine.stats().commits, 2);
        assert_eq!(retry.monitor().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_is_rolled_back_by_scope() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        engine.fail_commits([DbError::fatal("FOREIGN KEY constraint failed")]);
        let mut tx = TransactionManager::new(&mut h);

        let err = tx
            .scoped(|h| Box::pin(async move { h.execute("INSERT INTO t VALUES (1)", &[]).await }))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("FOREIGN KEY"));
        assert_eq!(engine.stats().rollbacks, 1);
        assert_eq!(tx.depth(), 0);
    }

    #[tokio::test]
    async fn test_scoped_with_timeout_rolls_back() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let err = tx
            .scoped_with_timeout(Duration::from_millis(20), |_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Timeout { .. }));
        assert_eq!(engine.stats().rollbacks, 1);
        assert_eq!(tx.depth(), 0);
        assert!(!tx.is_aborted());
    }

    #[tokio::test]
    async fn test_execute_in_transaction() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let retry = retry();
        let mut tx = TransactionManager::with_retry(&mut h, &retry);

        let results = tx
            .execute_in_transaction(&[
                Statement::new("INSERT INTO t VALUES (?)").with_param(1),
                Statement::new("INSERT INTO t VALUES (?)").with_param(2),
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let stats = engine.stats();
        assert_eq!(stats.executes, 2);
        assert_eq!(stats.commits, 1);
    }

    #[tokio::test]
    async fn test_batch_insert_validates_rows() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let err = tx
            .batch_insert("t", &["a", "b"], &[vec![QueryParam::Int(1)]], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));

        let err = tx.batch_insert("t", &["a"], &[], 0).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(engine.stats().begins, 0);
    }

    #[tokio::test]
    async fn test_batch_insert_chunks() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let rows: Vec<Vec<QueryParam>> = (0..5).map(|i| vec![QueryParam::Int(i)]).collect();
        tx.batch_insert("t", &["v"], &rows, 2).await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.executes, 3);
        assert_eq!(stats.begins, 1);
        assert_eq!(stats.commits, 1);
    }

    #[tokio::test]
    async fn test_cancelled_scope_rolls_back_on_next_use() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            tx.scoped(|h| {
                Box::pin(async move {
                    h.execute("INSERT INTO t VALUES (1)", &[]).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(tx.handle().is_interrupted());
        assert_eq!(engine.stats().rollbacks, 0);

        tx.scoped(|h| Box::pin(async move { h.execute("INSERT INTO t VALUES (2)", &[]).await }))
            .await
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.begins, 2);
        assert_eq!(stats.commits, 1);
        assert_eq!(tx.depth(), 0);
        assert!(!tx.handle().is_interrupted());
    }

    #[tokio::test]
    async fn test_cancelled_inner_scope_aborts_outer() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        tx.begin().await.unwrap();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            tx.scoped(|_| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let err = tx
            .handle()
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));
        assert_eq!(engine.stats().rollbacks, 1);

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionAborted));
        assert!(!tx.is_aborted());
        assert_eq!(engine.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_timeout_clears_marks_of_dropped_inner_scopes() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let err = tx
            .scoped_with_timeout(Duration::from_millis(20), |h| {
                Box::pin(async move {
                    TransactionManager::new(h)
                        .scoped(|_| {
                            Box::pin(async move {
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                Ok(())
                            })
                        })
                        .await
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(!tx.handle().is_interrupted());
        assert!(!tx.is_aborted());
        assert_eq!(tx.depth(), 0);
        assert_eq!(engine.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_batch_update_and_delete_run_one_statement_per_row() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let params: Vec<Vec<QueryParam>> = (0..5)
            .map(|i| vec![QueryParam::Int(i * 10), QueryParam::Int(i)])
            .collect();
        let conditions = vec!["id = ?"; 5];
        let updated = tx
            .batch_update("t", "v = ?", &conditions, &params, 2)
            .await
            .unwrap();
        assert_eq!(updated, 5);

        let ids: Vec<Vec<QueryParam>> = (0..3).map(|i| vec![QueryParam::Int(i)]).collect();
        let deleted = tx
            .batch_delete("t", &["id = ?"; 3], &ids, 10)
            .await
            .unwrap();
        assert_eq!(deleted, 3);

        let stats = engine.stats();
        assert_eq!(stats.executes, 8);
        assert_eq!(stats.begins, 2);
        assert_eq!(stats.commits, 2);
    }

    #[tokio::test]
    async fn test_batch_update_validates_and_rolls_back() {
        let engine = ScriptedEngine::default();
        let mut h = handle(&engine).await;
        let mut tx = TransactionManager::new(&mut h);

        let err = tx
            .batch_update("t", "v = ?", &["id = ?"], &[], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        let err = tx
            .batch_update("t", " ", &["id = 1"], &[vec![]], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        let err = tx
            .batch_delete("t", &[""], &[vec![]], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
        assert_eq!(engine.stats().begins, 0);

        engine.fail_statements([DbError::transient("database is locked")]);
        let err = tx
            .batch_delete("t", &["id = 1", "id = 2"], &[vec![], vec![]], 1)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let stats = engine.stats();
        assert_eq!(stats.executes, 1);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.commits, 0);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users").unwrap(), "\"users\"");
        assert_eq!(quote_identifier("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_identifier("  ").is_err());
    }
}
