//! Pooled connection handles.
//!
//! A [`ConnectionHandle`] owns one engine connection for one database path. It is not
//! internally synchronized: a leased handle is moved to exactly one caller and returned
//! to the pool with [`ConnectionPool::checkin`](super::pool::ConnectionPool::checkin).
//!
//! A leased handle that is dropped instead of checked in gives its capacity slot back
//! to the pool; its engine connection is dropped with it.
//!
//! A transaction scope whose future is dropped before it finished marks the handle
//! interrupted. The next statement or transaction call on the handle rolls the
//! transaction back first and aborts the scopes that enclosed the interrupted one.

use crate::db::engine::EngineConnection;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteResult, QueryParam, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Idle,
    Leased,
    Closed,
}

/// Nesting state of the transaction running on a handle.
///
/// `aborted_scopes` counts enclosing scopes that still have to exit after an inner
/// rollback; the handle is aborted while it is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionContext {
    pub depth: u32,
    pub aborted_scopes: u32,
    /// Set when a physical rollback failed; the engine connection state is unknown.
    pub poisoned: bool,
}

impl TransactionContext {
    pub fn is_active(&self) -> bool {
        self.depth > 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted_scopes > 0
    }

    /// True when the handle cannot go back to the idle set as-is.
    pub fn needs_cleanup(&self) -> bool {
        self.depth > 0 || self.aborted_scopes > 0
    }
}

/// Identifies one lease of one handle from one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub pool_id: u64,
    pub handle_id: u64,
}

/// Callback into the owning pool for leased handles dropped without checkin.
pub(crate) trait LeaseRelease: Send + Sync {
    fn release_dropped(&self, token: LeaseToken, path: &Path);
}

pub(crate) struct Lease {
    pub(crate) token: LeaseToken,
    pub(crate) revoked: Arc<AtomicBool>,
    pub(crate) owner: Weak<dyn LeaseRelease>,
}

/// One engine connection for one database path.
pub struct ConnectionHandle<C: EngineConnection> {
    id: u64,
    path: PathBuf,
    state: HandleState,
    conn: Option<C>,
    created_at: Instant,
    last_used: Instant,
    tx: TransactionContext,
    generation: u64,
    lease: Option<Lease>,
    /// Entry depth of the outermost interrupted scope, 0 when none.
    interrupted: Arc<AtomicU32>,
}

impl<C: EngineConnection> ConnectionHandle<C> {
    /// Wrap an opened engine connection. The handle starts out idle and unowned.
    pub fn new(path: impl Into<PathBuf>, conn: C) -> Self {
        Self::with_generation(path, conn, 0)
    }

    pub(crate) fn with_generation(path: impl Into<PathBuf>, conn: C, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id: next_handle_id(),
            path: path.into(),
            state: HandleState::Idle,
            conn: Some(conn),
            created_at: now,
            last_used: now,
            tx: TransactionContext::default(),
            generation,
            lease: None,
            interrupted: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since the handle was last used.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandleState::Closed
    }

    pub fn transaction(&self) -> TransactionContext {
        self.tx
    }

    pub fn transaction_depth(&self) -> u32 {
        self.tx.depth
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.is_aborted()
    }

    /// True once the owning pool has shut down and revoked this lease.
    pub fn is_revoked(&self) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.revoked.load(Ordering::Acquire))
    }

    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.lease.as_ref().map(|lease| lease.token)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn tx_mut(&mut self) -> &mut TransactionContext {
        &mut self.tx
    }

    /// True when a transaction scope was dropped before it finished and the
    /// handle has not recovered yet.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire) > 0
    }

    pub(crate) fn interrupt_marker(&self) -> Arc<AtomicU32> {
        self.interrupted.clone()
    }

    pub(crate) fn clear_interrupted(&self) {
        self.interrupted.store(0, Ordering::Release);
    }

    /// Roll back after an interrupted scope.
    ///
    /// The interrupted scope counts as rolled back: the real transaction is rolled
    /// back once and every scope that enclosed it is aborted.
    pub(crate) async fn recover_interrupted(&mut self) -> DbResult<()> {
        let entry_depth = self.interrupted.swap(0, Ordering::AcqRel);
        if entry_depth == 0 {
            return Ok(());
        }
        let depth = self.tx.depth;
        self.tx.depth = 0;
        self.tx.aborted_scopes = entry_depth - 1;
        if depth == 0 {
            return Ok(());
        }

        warn!(
            path = %self.path.display(),
            handle_id = self.id,
            depth,
            "Transaction scope was interrupted, rolling back"
        );
        match self.rollback_physical().await {
            Ok(()) => {
                debug!(path = %self.path.display(), handle_id = self.id, "Interrupted transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.tx.poisoned = true;
                Err(e)
            }
        }
    }

    pub(crate) fn attach_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
        self.state = HandleState::Leased;
    }

    /// Detach the lease without notifying the pool. The handle becomes idle.
    pub(crate) fn detach_lease(&mut self) -> Option<Lease> {
        if self.state == HandleState::Leased {
            self.state = HandleState::Idle;
        }
        self.lease.take()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn ensure_usable(&self) -> DbResult<()> {
        if self.is_revoked() {
            return Err(DbError::PoolClosed);
        }
        if self.conn.is_none() {
            return Err(DbError::handle_closed(self.path.display().to_string()));
        }
        Ok(())
    }

    fn conn_mut(&mut self) -> DbResult<&mut C> {
        self.ensure_usable()?;
        let path = &self.path;
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::handle_closed(path.display().to_string()))
    }

    fn conn_for_statement(&mut self) -> DbResult<&mut C> {
        if self.tx.is_aborted() {
            return Err(DbError::TransactionAborted);
        }
        self.conn_mut()
    }

    /// Execute a data-modifying statement on this handle.
    ///
    /// Fails with [`DbError::TransactionAborted`] without touching the engine while an
    /// enclosing transaction scope has been rolled back.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        self.recover_interrupted().await?;
        let result = self.conn_for_statement()?.execute(sql, params).await;
        self.touch();
        result
    }

    /// Run a statement and return its rows.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.recover_interrupted().await?;
        let result = self.conn_for_statement()?.query(sql, params).await;
        self.touch();
        result
    }

    pub(crate) async fn begin_physical(&mut self) -> DbResult<()> {
        self.conn_mut()?.begin().await
    }

    pub(crate) async fn commit_physical(&mut self) -> DbResult<()> {
        self.conn_mut()?.commit().await
    }

    /// Physical rollback. Still allowed on a revoked lease so the pool can clean up.
    pub(crate) async fn rollback_physical(&mut self) -> DbResult<()> {
        let path = &self.path;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::handle_closed(path.display().to_string()))?;
        conn.rollback().await
    }

    /// Close the engine connection. The handle cannot be used afterwards.
    pub async fn close(&mut self) -> DbResult<()> {
        self.state = HandleState::Closed;
        self.tx = TransactionContext::default();
        self.clear_interrupted();
        match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

impl<C: EngineConnection> Drop for ConnectionHandle<C> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if let Some(owner) = lease.owner.upgrade() {
            if self.tx.needs_cleanup() || self.is_interrupted() {
                warn!(
                    path = %self.path.display(),
                    handle_id = self.id,
                    depth = self.tx.depth,
                    "Leased handle dropped with an open transaction; connection discarded"
                );
            }
            owner.release_dropped(lease.token, &self.path);
        }
    }
}

impl<C: EngineConnection> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("transaction", &self.tx)
            .field("generation", &self.generation)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}
