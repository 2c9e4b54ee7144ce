//! Connection pool keyed by database path.
//!
//! # Capacity
//!
//! One global counter bounds the live handles across every path: idle ones, leased
//! ones and slots reserved for a connection that is being opened. A path may hold any
//! number of handles within that bound. When the pool is full but some other path
//! has an idle handle, the least recently used idle handle is closed to make room,
//! so a checkout never waits while fewer than `max_connections` handles are leased.
//!
//! # Waiting
//!
//! Checkouts that cannot be served queue up in strict FIFO order and are woken
//! through a `oneshot` channel. The front waiter gets, in order of preference, an
//! idle handle for its path, a free slot, or the slot of an evicted idle handle of
//! another path. A waiter that times out or whose future is dropped leaves the
//! queue without consuming anything; a grant it never picked up goes back to the pool.
//!
//! # Locking
//!
//! All bookkeeping lives behind one `std::sync::Mutex` that is never held across an
//! `.await`. Engine opens and closes run outside the lock (collect-then-close).

use crate::db::engine::{Engine, EngineConnection};
use crate::db::handle::{ConnectionHandle, Lease, LeaseRelease, LeaseToken};
use crate::error::{DbError, DbResult};
use crate::monitor::{HealthMonitor, HealthStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool limits.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Default wait used by [`ConnectionPool::checkout_default`]
    pub connection_timeout: Duration,
    /// Threshold used by the idle sweeper
    pub idle_timeout: Duration,
    /// Default grace period used by [`ConnectionPool::close`]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        crate::config::CoreConfig::default().pool_config()
    }
}

/// Per-path breakdown in [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathStats {
    pub path: PathBuf,
    pub idle: usize,
    pub leased: usize,
    /// Time since the most recently used idle handle was returned
    pub idle_for_ms: Option<u64>,
    /// Age of the oldest outstanding lease
    pub oldest_lease_ms: Option<u64>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    /// Slots reserved for connections being opened
    pub opening: usize,
    pub waiting: usize,
    pub closed: bool,
    pub paths: Vec<PathStats>,
}

/// What [`ConnectionPool::shutdown`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub closed_idle: usize,
    /// Leases still outstanding when the grace period ran out
    pub revoked_leases: usize,
    pub failed_waiters: usize,
    pub waited_ms: u64,
}

enum Grant<C: EngineConnection> {
    Handle(ConnectionHandle<C>),
    /// A reserved slot; the receiver opens the connection.
    Slot,
}

struct Waiter<C: EngineConnection> {
    id: u64,
    path: PathBuf,
    tx: oneshot::Sender<Grant<C>>,
}

struct LeaseEntry {
    path: PathBuf,
    leased_at: Instant,
    revoked: Arc<AtomicBool>,
}

struct PoolState<C: EngineConnection> {
    /// Idle handles per path, most recently used last
    idle: HashMap<PathBuf, Vec<ConnectionHandle<C>>>,
    leases: HashMap<u64, LeaseEntry>,
    live: usize,
    waiters: VecDeque<Waiter<C>>,
    /// Bumped by `close_path`; handles from older generations are not reused
    generations: HashMap<PathBuf, u64>,
    next_waiter_id: u64,
    closed: bool,
}

impl<C: EngineConnection> PoolState<C> {
    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    fn generation(&self, path: &Path) -> u64 {
        self.generations.get(path).copied().unwrap_or(0)
    }

    fn take_idle(&mut self, path: &Path) -> Option<ConnectionHandle<C>> {
        let handles = self.idle.get_mut(path)?;
        let handle = handles.pop();
        if handles.is_empty() {
            self.idle.remove(path);
        }
        handle
    }

    /// Remove the least recently used idle handle of any path.
    fn take_lru_idle(&mut self) -> Option<ConnectionHandle<C>> {
        let path = self
            .idle
            .iter()
            .filter_map(|(path, handles)| handles.first().map(|h| (path, h.last_used())))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(path, _)| path.clone())?;

        let handles = self.idle.get_mut(&path)?;
        let handle = handles.remove(0);
        if handles.is_empty() {
            self.idle.remove(&path);
        }
        Some(handle)
    }
}

struct PoolShared<E: Engine> {
    id: u64,
    engine: E,
    config: PoolConfig,
    monitor: Option<Arc<HealthMonitor>>,
    state: Mutex<PoolState<E::Connection>>,
    /// Signalled whenever a lease ends
    lease_released: Notify,
    weak_self: Weak<PoolShared<E>>,
}

impl<E: Engine> PoolShared<E> {
    fn lock(&self) -> MutexGuard<'_, PoolState<E::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner(&self) -> Weak<dyn LeaseRelease> {
        let weak: Weak<dyn LeaseRelease> = self.weak_self.clone();
        weak
    }

    /// Register `handle` as leased under the state lock.
    fn lease(&self, state: &mut PoolState<E::Connection>, handle: &mut ConnectionHandle<E::Connection>) {
        let revoked = Arc::new(AtomicBool::new(false));
        state.leases.insert(
            handle.id(),
            LeaseEntry {
                path: handle.path().to_path_buf(),
                leased_at: Instant::now(),
                revoked: revoked.clone(),
            },
        );
        handle.attach_lease(Lease {
            token: LeaseToken {
                pool_id: self.id,
                handle_id: handle.id(),
            },
            revoked,
            owner: self.owner(),
        });
        handle.touch();
    }

    /// Undo [`lease`](Self::lease) for a handle that never reached its caller.
    fn unlease(&self, state: &mut PoolState<E::Connection>, mut handle: ConnectionHandle<E::Connection>) {
        state.leases.remove(&handle.id());
        handle.detach_lease();
        state
            .idle
            .entry(handle.path().to_path_buf())
            .or_default()
            .push(handle);
    }

    /// Hand free resources to queued waiters, front first.
    ///
    /// Returns handles evicted to make room; the caller closes them outside the lock.
    fn dispatch(&self, state: &mut PoolState<E::Connection>) -> Vec<ConnectionHandle<E::Connection>> {
        let mut evicted = Vec::new();
        loop {
            let Some(front) = state.waiters.front() else {
                break;
            };
            if front.tx.is_closed() {
                state.waiters.pop_front();
                continue;
            }
            let path = front.path.clone();

            let grant = if let Some(mut handle) = state.take_idle(&path) {
                self.lease(state, &mut handle);
                Grant::Handle(handle)
            } else if state.live < self.config.max_connections {
                state.live += 1;
                Grant::Slot
            } else if let Some(victim) = state.take_lru_idle() {
                evicted.push(victim);
                Grant::Slot
            } else {
                break;
            };

            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if let Err(grant) = waiter.tx.send(grant) {
                match grant {
                    Grant::Handle(handle) => self.unlease(state, handle),
                    Grant::Slot => state.live -= 1,
                }
            }
        }
        evicted
    }

    /// Give back a grant that a cancelled waiter never used.
    fn return_grant(&self, grant: Grant<E::Connection>) {
        let evicted = {
            let mut state = self.lock();
            match grant {
                Grant::Handle(handle) => self.unlease(&mut state, handle),
                Grant::Slot => state.live -= 1,
            }
            self.dispatch(&mut state)
        };
        close_in_background(evicted);
    }

    /// Free a reserved slot whose open failed or was cancelled.
    fn release_slot(&self) {
        let evicted = {
            let mut state = self.lock();
            state.live -= 1;
            self.dispatch(&mut state)
        };
        close_in_background(evicted);
        self.lease_released.notify_waiters();
    }

    fn remove_waiter(&self, waiter_id: u64) {
        let mut state = self.lock();
        state.waiters.retain(|w| w.id != waiter_id);
    }
}

impl<E: Engine> LeaseRelease for PoolShared<E> {
    fn release_dropped(&self, token: LeaseToken, path: &Path) {
        if token.pool_id != self.id {
            return;
        }
        let evicted = {
            let mut state = self.lock();
            if state.leases.remove(&token.handle_id).is_none() {
                return;
            }
            state.live -= 1;
            self.dispatch(&mut state)
        };
        debug!(
            path = %path.display(),
            handle_id = token.handle_id,
            "Leased handle dropped without checkin, slot released"
        );
        close_in_background(evicted);
        self.lease_released.notify_waiters();
    }
}

/// Close handles from a synchronous context.
fn close_in_background<C: EngineConnection>(handles: Vec<ConnectionHandle<C>>) {
    if handles.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(close_all(handles));
        }
        // Without a runtime the connections are simply dropped.
        Err(_) => drop(handles),
    }
}

async fn close_all<C: EngineConnection>(handles: Vec<ConnectionHandle<C>>) -> usize {
    let count = handles.len();
    for mut handle in handles {
        let path = handle.path().to_path_buf();
        let id = handle.id();
        match handle.close().await {
            Ok(()) => debug!(path = %path.display(), handle_id = id, "Closed connection"),
            Err(e) => warn!(
                path = %path.display(),
                handle_id = id,
                error = %e,
                "Failed to close connection"
            ),
        }
    }
    count
}

/// Releases a reserved slot unless disarmed.
struct SlotGuard<E: Engine> {
    shared: Arc<PoolShared<E>>,
    armed: bool,
}

impl<E: Engine> Drop for SlotGuard<E> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// Removes a queued waiter when its checkout stops waiting.
struct WaitGuard<E: Engine> {
    shared: Arc<PoolShared<E>>,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<Grant<E::Connection>>>,
}

impl<E: Engine> Drop for WaitGuard<E> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        self.shared.remove_waiter(self.waiter_id);
        rx.close();
        if let Ok(grant) = rx.try_recv() {
            self.shared.return_grant(grant);
        }
    }
}

enum Acquired<C: EngineConnection> {
    Handle(ConnectionHandle<C>),
    Slot,
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

/// Pool of engine connections keyed by database path. Cheap to clone.
pub struct ConnectionPool<E: Engine> {
    shared: Arc<PoolShared<E>>,
}

impl<E: Engine> Clone for ConnectionPool<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Engine> ConnectionPool<E> {
    /// Create a pool. Fails when `max_connections` is zero.
    pub fn new(engine: E, config: PoolConfig) -> DbResult<Self> {
        Self::build(engine, config, None)
    }

    /// Create a pool that retires handles of paths the monitor reports unhealthy.
    pub fn with_monitor(engine: E, config: PoolConfig, monitor: Arc<HealthMonitor>) -> DbResult<Self> {
        Self::build(engine, config, Some(monitor))
    }

    fn build(engine: E, config: PoolConfig, monitor: Option<Arc<HealthMonitor>>) -> DbResult<Self> {
        if config.max_connections == 0 {
            return Err(DbError::config("max_connections must be greater than 0"));
        }

        let shared = Arc::new_cyclic(|weak_self| PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            config,
            monitor,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                leases: HashMap::new(),
                live: 0,
                waiters: VecDeque::new(),
                generations: HashMap::new(),
                next_waiter_id: 0,
                closed: false,
            }),
            lease_released: Notify::new(),
            weak_self: weak_self.clone(),
        });

        info!(
            engine = shared.engine.name(),
            max_connections = shared.config.max_connections,
            "Connection pool created"
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    pub fn monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.shared.monitor.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// [`checkout`](Self::checkout) with the configured connection timeout.
    pub async fn checkout_default(
        &self,
        path: impl AsRef<Path>,
    ) -> DbResult<ConnectionHandle<E::Connection>> {
        self.checkout(path, self.shared.config.connection_timeout)
            .await
    }

    /// Lease a handle for `path`, waiting at most `timeout` for capacity.
    ///
    /// A zero timeout fails with [`DbError::PoolExhausted`] immediately when no
    /// capacity is free.
    pub async fn checkout(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> DbResult<ConnectionHandle<E::Connection>> {
        let path = path.as_ref();
        let started = Instant::now();
        let shared = &self.shared;

        let (acquired, evicted) = {
            let mut state = shared.lock();
            if state.closed {
                return Err(DbError::PoolClosed);
            }

            let mut evicted = Vec::new();
            let acquired = if let Some(mut handle) = state.take_idle(path) {
                shared.lease(&mut state, &mut handle);
                Acquired::Handle(handle)
            } else if state.live < shared.config.max_connections {
                state.live += 1;
                Acquired::Slot
            } else if let Some(victim) = state.take_lru_idle() {
                evicted.push(victim);
                Acquired::Slot
            } else if timeout.is_zero() {
                return Err(DbError::pool_exhausted(
                    path.display().to_string(),
                    0,
                    shared.config.max_connections,
                ));
            } else {
                let (tx, rx) = oneshot::channel();
                state.next_waiter_id += 1;
                let id = state.next_waiter_id;
                state.waiters.push_back(Waiter {
                    id,
                    path: path.to_path_buf(),
                    tx,
                });
                Acquired::Wait(id, rx)
            };
            (acquired, evicted)
        };

        if !evicted.is_empty() {
            info!(
                path = %path.display(),
                evicted = evicted.len(),
                "Pool full, evicting least recently used idle connection"
            );
            close_all(evicted).await;
        }

        match acquired {
            Acquired::Handle(handle) => {
                debug!(path = %path.display(), handle_id = handle.id(), "Checked out idle connection");
                Ok(handle)
            }
            Acquired::Slot => self.open_in_slot(path).await,
            Acquired::Wait(waiter_id, rx) => {
                debug!(path = %path.display(), "Pool at capacity, waiting for a connection");
                let mut guard = WaitGuard {
                    shared: shared.clone(),
                    waiter_id,
                    rx: Some(rx),
                };
                let remaining = timeout.saturating_sub(started.elapsed());
                let received = match guard.rx.as_mut() {
                    Some(rx) => tokio::time::timeout(remaining, rx).await,
                    None => return Err(DbError::internal("waiter receiver missing")),
                };

                match received {
                    Ok(Ok(grant)) => {
                        // Delivered; nothing left for the guard to return.
                        guard.rx = None;
                        match grant {
                            Grant::Handle(handle) => {
                                debug!(
                                    path = %path.display(),
                                    handle_id = handle.id(),
                                    waited_ms = started.elapsed().as_millis() as u64,
                                    "Checked out connection after waiting"
                                );
                                Ok(handle)
                            }
                            Grant::Slot => self.open_in_slot(path).await,
                        }
                    }
                    // Sender dropped: the pool shut down.
                    Ok(Err(_)) => Err(DbError::PoolClosed),
                    Err(_) => {
                        drop(guard);
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(
                            path = %path.display(),
                            waited_ms,
                            max_connections = shared.config.max_connections,
                            "Checkout timed out"
                        );
                        Err(DbError::pool_exhausted(
                            path.display().to_string(),
                            waited_ms,
                            shared.config.max_connections,
                        ))
                    }
                }
            }
        }
    }

    /// Open a connection into a slot already counted in `live`.
    async fn open_in_slot(&self, path: &Path) -> DbResult<ConnectionHandle<E::Connection>> {
        let shared = &self.shared;
        let mut slot = SlotGuard {
            shared: shared.clone(),
            armed: true,
        };

        let conn = shared.engine.open(path).await.map_err(|e| match e {
            DbError::Open { .. } => e,
            other => DbError::open(path.display().to_string(), other.to_string()),
        });
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open connection");
                return Err(e);
            }
        };

        let leased = {
            let mut state = shared.lock();
            if state.closed {
                Err(conn)
            } else {
                let mut handle =
                    ConnectionHandle::with_generation(path, conn, state.generation(path));
                shared.lease(&mut state, &mut handle);
                slot.armed = false;
                Ok(handle)
            }
        };

        match leased {
            Ok(handle) => {
                info!(
                    path = %path.display(),
                    handle_id = handle.id(),
                    engine = shared.engine.name(),
                    "Opened new connection"
                );
                Ok(handle)
            }
            Err(conn) => {
                drop(slot);
                if let Err(e) = conn.close().await {
                    debug!(path = %path.display(), error = %e, "Failed to close connection opened during shutdown");
                }
                Err(DbError::PoolClosed)
            }
        }
    }

    /// Return a leased handle to the pool.
    ///
    /// An open or aborted transaction is rolled back first. The handle is closed
    /// instead of reused when that rollback fails, when its path was evicted with
    /// [`close_path`](Self::close_path), when the pool has shut down, or when the
    /// health monitor reports its path unhealthy.
    pub async fn checkin(&self, mut handle: ConnectionHandle<E::Connection>) -> DbResult<()> {
        let shared = &self.shared;
        let path = handle.path().to_path_buf();

        let token = match handle.lease_token() {
            Some(token) if token.pool_id == shared.id => token,
            _ => return Err(DbError::not_owned(path.display().to_string())),
        };
        {
            let state = shared.lock();
            match state.leases.get(&token.handle_id) {
                Some(entry) if entry.path == path => {}
                _ => return Err(DbError::not_owned(path.display().to_string())),
            }
        }

        let mut reusable = !handle.is_closed() && !handle.is_revoked();

        let tx = handle.transaction();
        if tx.needs_cleanup() {
            if tx.depth > 0 {
                match handle.rollback_physical().await {
                    Ok(()) => debug!(
                        path = %path.display(),
                        depth = tx.depth,
                        "Rolled back unfinished transaction at checkin"
                    ),
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Rollback at checkin failed, closing connection"
                        );
                        reusable = false;
                    }
                }
            }
            *handle.tx_mut() = Default::default();
        }
        handle.clear_interrupted();
        if tx.poisoned {
            reusable = false;
        }

        if reusable {
            if let Some(monitor) = &shared.monitor {
                if monitor.path_status(&path) == HealthStatus::Unhealthy {
                    warn!(
                        path = %path.display(),
                        handle_id = handle.id(),
                        "Path reported unhealthy, retiring connection"
                    );
                    reusable = false;
                }
            }
        }

        let (to_close, evicted) = {
            let mut state = shared.lock();
            if state.leases.remove(&token.handle_id).is_none() {
                return Err(DbError::not_owned(path.display().to_string()));
            }
            handle.detach_lease();

            let current_generation = state.generation(&path) == handle.generation();
            let to_close = if reusable && !state.closed && current_generation {
                handle.touch();
                state.idle.entry(path.clone()).or_default().push(handle);
                None
            } else {
                state.live -= 1;
                Some(handle)
            };
            (to_close, shared.dispatch(&mut state))
        };
        shared.lease_released.notify_waiters();

        match to_close {
            Some(handle) => {
                debug!(path = %path.display(), handle_id = handle.id(), "Checked in connection for closing");
                close_all(vec![handle]).await;
            }
            None => debug!(path = %path.display(), "Checked in connection"),
        }
        close_all(evicted).await;
        Ok(())
    }

    /// [`checkin`](Self::checkin), verifying the handle belongs to `path`.
    pub async fn checkin_path(
        &self,
        path: impl AsRef<Path>,
        handle: ConnectionHandle<E::Connection>,
    ) -> DbResult<()> {
        let path = path.as_ref();
        if handle.path() != path {
            warn!(
                expected = %path.display(),
                actual = %handle.path().display(),
                "Checkin path does not match handle"
            );
            return Err(DbError::not_owned(path.display().to_string()));
        }
        self.checkin(handle).await
    }

    /// Close every idle handle unused for longer than `max_idle`. Leased handles are
    /// never touched. Returns the number closed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let (expired, evicted) = {
            let mut state = self.shared.lock();
            let mut expired = Vec::new();
            for handles in state.idle.values_mut() {
                let (stale, fresh): (Vec<_>, Vec<_>) =
                    handles.drain(..).partition(|h| h.idle_for() > max_idle);
                *handles = fresh;
                expired.extend(stale);
            }
            state.idle.retain(|_, handles| !handles.is_empty());
            state.live -= expired.len();
            let evicted = self.shared.dispatch(&mut state);
            (expired, evicted)
        };

        let count = expired.len();
        if count > 0 {
            info!(
                count,
                max_idle_secs = max_idle.as_secs(),
                "Evicting idle connections"
            );
            self.shared.lease_released.notify_waiters();
        }
        close_all(expired).await;
        close_all(evicted).await;
        count
    }

    /// Close every idle handle for `path`; handles for it that are currently leased
    /// are closed when they come back. Returns the number closed now.
    pub async fn close_path(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        let (closed, evicted) = {
            let mut state = self.shared.lock();
            *state.generations.entry(path.to_path_buf()).or_insert(0) += 1;
            let closed = state.idle.remove(path).unwrap_or_default();
            state.live -= closed.len();
            let evicted = self.shared.dispatch(&mut state);
            (closed, evicted)
        };

        let count = closed.len();
        info!(path = %path.display(), closed = count, "Evicted database path");
        close_all(closed).await;
        close_all(evicted).await;
        count
    }

    /// [`shutdown`](Self::shutdown) with the configured grace period.
    pub async fn close(&self) -> ShutdownReport {
        self.shutdown(self.shared.config.shutdown_grace).await
    }

    /// Stop the pool.
    ///
    /// New and waiting checkouts fail with [`DbError::PoolClosed`]. Outstanding
    /// leases get up to `grace` to come back; any still out afterwards are revoked
    /// (their operations fail with `PoolClosed`, they are closed at checkin). Every
    /// idle handle is closed. Calling it again is harmless.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let shared = &self.shared;
        let started = Instant::now();

        let (failed_waiters, first_call) = {
            let mut state = shared.lock();
            let first_call = !state.closed;
            state.closed = true;
            let waiters = std::mem::take(&mut state.waiters);
            (waiters.len(), first_call)
        };
        if first_call {
            info!(
                failed_waiters,
                grace_ms = grace.as_millis() as u64,
                "Shutting down connection pool"
            );
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = shared.lease_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let drained = shared.lock().leases.is_empty();
            if drained {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (idle, revoked_leases) = {
            let mut state = shared.lock();
            let mut revoked = 0;
            for entry in state.leases.values() {
                if !entry.revoked.swap(true, Ordering::AcqRel) {
                    revoked += 1;
                }
            }
            let idle: Vec<_> = state.idle.drain().flat_map(|(_, handles)| handles).collect();
            state.live -= idle.len();
            (idle, revoked)
        };

        if revoked_leases > 0 {
            warn!(revoked_leases, "Grace period expired, revoking outstanding leases");
        }

        let closed_idle = close_all(idle).await;
        let report = ShutdownReport {
            closed_idle,
            revoked_leases,
            failed_waiters,
            waited_ms: started.elapsed().as_millis() as u64,
        };
        if first_call {
            info!(
                closed_idle = report.closed_idle,
                revoked_leases = report.revoked_leases,
                "Connection pool shut down"
            );
        }
        report
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let mut paths: BTreeMap<PathBuf, PathStats> = BTreeMap::new();

        for (path, handles) in &state.idle {
            let entry = paths.entry(path.clone()).or_insert_with(|| empty_path_stats(path));
            entry.idle = handles.len();
            entry.idle_for_ms = handles
                .iter()
                .map(|h| h.idle_for().as_millis() as u64)
                .min();
        }
        for lease in state.leases.values() {
            let entry = paths
                .entry(lease.path.clone())
                .or_insert_with(|| empty_path_stats(&lease.path));
            entry.leased += 1;
            let age = lease.leased_at.elapsed().as_millis() as u64;
            entry.oldest_lease_ms = Some(entry.oldest_lease_ms.map_or(age, |a| a.max(age)));
        }

        let idle = state.idle_count();
        let leased = state.leases.len();
        PoolStats {
            max_connections: self.shared.config.max_connections,
            live: state.live,
            idle,
            leased,
            opening: state.live.saturating_sub(idle + leased),
            waiting: state.waiters.len(),
            closed: state.closed,
            paths: paths.into_values().collect(),
        }
    }

    /// Periodically close idle handles older than `idle_timeout`.
    ///
    /// The task holds only a weak reference and exits once the pool is dropped or
    /// shut down.
    pub fn spawn_idle_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let idle_timeout = self.shared.config.idle_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let Some(shared) = weak.upgrade() else {
                    debug!("Connection pool dropped, idle sweeper exiting");
                    return;
                };
                let pool = ConnectionPool { shared };
                if pool.is_closed() {
                    debug!("Connection pool closed, idle sweeper exiting");
                    return;
                }
                pool.evict_idle(idle_timeout).await;

                // Drop the strong reference before sleeping.
                drop(pool);
            }
        })
    }
}

fn empty_path_stats(path: &Path) -> PathStats {
    PathStats {
        path: path.to_path_buf(),
        idle: 0,
        leased: 0,
        idle_for_ms: None,
        oldest_lease_ms: None,
    }
}

impl<E: Engine> std::fmt::Debug for ConnectionPool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.shared.id)
            .field("engine", &self.shared.engine.name())
            .field("max_connections", &self.shared.config.max_connections)
            .finish()
    }
}
