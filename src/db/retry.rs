//! Retry with backoff for engine operations.
//!
//! [`RetryExecutor`] runs an operation, classifies failures through
//! [`DbError::failure_class`], retries transient ones with linear or exponential
//! backoff, and reports every attempt to the [`HealthMonitor`] as one sample.
//! The backoff is a `tokio::time::sleep` of the calling task; no pool lock is held.

use crate::db::engine::EngineConnection;
use crate::db::handle::ConnectionHandle;
use crate::error::{DbError, DbResult, FailureClass};
use crate::models::{ExecuteResult, QueryParam, Row};
use crate::monitor::{HealthMonitor, OperationSample, Outcome, fingerprint};
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How the delay grows between attempts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base_delay * n` before retry `n`
    #[default]
    Linear,
    /// `base_delay * 2^(n-1)` before retry `n`
    Exponential,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

/// Bounds for retrying transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on a single delay
    pub max_delay: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::CoreConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Run every operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Maximum number of attempts including the first one.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1)),
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Tagged result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Every attempt failed with a transient error.
    TransientExhausted { attempts: u32, last_error: DbError },
    /// An attempt failed with an error retrying cannot fix.
    Fatal { attempts: u32, error: DbError },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::TransientExhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Convert into a `Result`.
    ///
    /// Engine failures are wrapped in [`DbError::OperationFailed`] with the attempt
    /// count. Failures that never reached the engine (aborted transaction, revoked
    /// lease, closed handle) propagate unchanged.
    pub fn into_result(self) -> DbResult<T> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::TransientExhausted {
                attempts,
                last_error,
            } => Err(DbError::operation_failed(attempts, last_error)),
            Self::Fatal { attempts, error } => match error {
                DbError::Engine { .. } => Err(DbError::operation_failed(attempts, error)),
                other => Err(other),
            },
        }
    }
}

enum Step<T> {
    Done(RetryOutcome<T>),
    Retry,
}

/// Attempt bookkeeping shared by every retry loop.
struct Attempts<'a> {
    executor: &'a RetryExecutor,
    fingerprint: String,
    path: Option<&'a Path>,
    attempt: u32,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
}

impl<'a> Attempts<'a> {
    /// `operation` is normalized, so calls differing only in literals share statistics.
    fn new(executor: &'a RetryExecutor, operation: &str, path: Option<&'a Path>) -> Self {
        Self {
            executor,
            fingerprint: fingerprint(operation),
            path,
            attempt: 0,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn start(&mut self) {
        self.attempt += 1;
        self.started = Instant::now();
        self.started_at = Utc::now();
    }

    fn record(&self, outcome: Outcome, rows: Option<u64>) {
        let mut sample = OperationSample::new(&self.fingerprint, self.started.elapsed(), outcome)
            .with_started_at(self.started_at);
        if let Some(path) = self.path {
            sample = sample.with_path(path);
        }
        if let Some(rows) = rows {
            sample = sample.with_rows_affected(rows);
        }
        self.executor.monitor.record(sample);
    }

    async fn finish<T>(&mut self, result: DbResult<T>, rows: fn(&T) -> Option<u64>) -> Step<T> {
        let policy = &self.executor.policy;
        match result {
            Ok(value) => {
                self.record(Outcome::Success, rows(&value));
                if self.attempt > 1 {
                    debug!(
                        fingerprint = %self.fingerprint,
                        attempts = self.attempt,
                        "Operation succeeded after retry"
                    );
                }
                Step::Done(RetryOutcome::Success {
                    value,
                    attempts: self.attempt,
                })
            }
            Err(error) => match error.failure_class() {
                FailureClass::Fatal => {
                    self.record(Outcome::FatalFailure, None);
                    Step::Done(RetryOutcome::Fatal {
                        attempts: self.attempt,
                        error,
                    })
                }
                FailureClass::Transient => {
                    self.record(Outcome::TransientFailure, None);
                    if self.attempt >= policy.total_attempts() {
                        warn!(
                            fingerprint = %self.fingerprint,
                            attempts = self.attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Step::Done(RetryOutcome::TransientExhausted {
                            attempts: self.attempt,
                            last_error: error,
                        });
                    }

                    let delay = policy.delay_for(self.attempt);
                    warn!(
                        fingerprint = %self.fingerprint,
                        path = ?self.path,
                        attempt = self.attempt,
                        max_attempts = policy.total_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    Step::Retry
                }
            },
        }
    }
}

fn no_rows<T>(_: &T) -> Option<u64> {
    None
}

fn affected(result: &ExecuteResult) -> Option<u64> {
    Some(result.rows_affected)
}

/// Runs operations under a [`RetryPolicy`] and reports each attempt.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    monitor: Arc<HealthMonitor>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, monitor: Arc<HealthMonitor>) -> Self {
        Self { policy, monitor }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Same monitor, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            monitor: self.monitor.clone(),
        }
    }

    /// Run `operation` until it succeeds, fails fatally, or retries are exhausted.
    pub async fn run<T, F, Fut>(&self, fingerprint: &str, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.run_at(fingerprint, None, operation).await
    }

    /// [`run`](Self::run), attributing samples to a database path.
    pub async fn run_at<T, F, Fut>(
        &self,
        fingerprint: &str,
        path: Option<&Path>,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempts = Attempts::new(self, fingerprint, path);
        loop {
            attempts.start();
            let result = operation().await;
            if let Step::Done(outcome) = attempts.finish(result, no_rows).await {
                return outcome;
            }
        }
    }

    /// [`run`](Self::run) converted into a `Result`.
    pub async fn execute<T, F, Fut>(&self, fingerprint: &str, operation: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.run(fingerprint, operation).await.into_result()
    }

    /// Retry an operation that needs mutable access to a resource on every attempt,
    /// typically a [`ConnectionHandle`].
    pub async fn run_on<R, T, F>(
        &self,
        fingerprint: &str,
        path: Option<&Path>,
        resource: &mut R,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        R: Send,
        F: for<'c> FnMut(&'c mut R) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut attempts = Attempts::new(self, fingerprint, path);
        loop {
            attempts.start();
            let result = operation(&mut *resource).await;
            if let Step::Done(outcome) = attempts.finish(result, no_rows).await {
                return outcome;
            }
        }
    }

    /// [`run_on`](Self::run_on) converted into a `Result`.
    pub async fn execute_on<R, T, F>(
        &self,
        fingerprint: &str,
        path: Option<&Path>,
        resource: &mut R,
        operation: F,
    ) -> DbResult<T>
    where
        R: Send,
        F: for<'c> FnMut(&'c mut R) -> BoxFuture<'c, DbResult<T>>,
    {
        self.run_on(fingerprint, path, resource, operation)
            .await
            .into_result()
    }

    /// Execute one data-modifying statement on a handle.
    pub async fn execute_statement<C: EngineConnection>(
        &self,
        handle: &mut ConnectionHandle<C>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecuteResult> {
        let path = handle.path().to_path_buf();
        let mut attempts = Attempts::new(self, sql, Some(&path));
        loop {
            attempts.start();
            let result = handle.execute(sql, params).await;
            if let Step::Done(outcome) = attempts.finish(result, affected).await {
                return outcome.into_result();
            }
        }
    }

    /// Run one query on a handle and return its rows.
    pub async fn fetch_rows<C: EngineConnection>(
        &self,
        handle: &mut ConnectionHandle<C>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let path = handle.path().to_path_buf();
        let mut attempts = Attempts::new(self, sql, Some(&path));
        loop {
            attempts.start();
            let result = handle.query(sql, params).await;
            if let Step::Done(outcome) = attempts.finish(result, no_rows).await {
                return outcome.into_result();
            }
        }
    }

    /// Execute one statement once per parameter set, retrying each execution on its
    /// own. Stops at the first failure; wrap in a transaction for all-or-nothing.
    ///
    /// Returns the total number of rows affected.
    pub async fn execute_batch<C: EngineConnection>(
        &self,
        handle: &mut ConnectionHandle<C>,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<u64> {
        let mut total = 0u64;
        for params in param_sets {
            total += self.execute_statement(handle, sql, params).await?.rows_affected;
        }
        Ok(total)
    }

    /// Physical commit with retry.
    pub(crate) async fn commit<C: EngineConnection>(
        &self,
        handle: &mut ConnectionHandle<C>,
    ) -> DbResult<()> {
        let path = handle.path().to_path_buf();
        let mut attempts = Attempts::new(self, "COMMIT", Some(&path));
        loop {
            attempts.start();
            let result = handle.commit_physical().await;
            if let Step::Done(outcome) = attempts.finish(result, no_rows).await {
                return outcome.into_result();
            }
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish()
    }
}
