//! Operation health monitoring.
//!
//! The [`HealthMonitor`] keeps a bounded history of [`OperationSample`]s reported by
//! the retry executor and derives statistics and a health status from it on demand.
//! Recording never fails. Statistics are computed from a cloned snapshot so the lock is
//! held only for the copy; counts and health checks are evaluated under the lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Longest fingerprint kept; longer statements are truncated.
pub const MAX_FINGERPRINT_LEN: usize = 256;

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    TransientFailure,
    FatalFailure,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// One attempt of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSample {
    pub fingerprint: String,
    pub path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
    pub rows_affected: Option<u64>,
}

impl OperationSample {
    pub fn new(fingerprint: impl Into<String>, duration: Duration, outcome: Outcome) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            path: None,
            started_at: Utc::now(),
            duration,
            outcome,
            rows_affected: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Retention and threshold settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Maximum number of samples kept; the oldest are evicted first
    pub retention: usize,
    /// Samples older than this are dropped
    pub max_age: Option<Duration>,
    /// Samples slower than this are logged as slow operations
    pub slow_query_threshold: Duration,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub degraded_latency: Duration,
    pub unhealthy_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        crate::config::CoreConfig::default().health_config()
    }
}

/// Latency and error statistics for one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStats {
    pub fingerprint: String,
    pub count: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Rows reported by successful executions
    pub rows_affected: u64,
    pub last_seen: DateTime<Utc>,
}

/// Totals across every retained sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    /// Samples currently retained
    pub total_operations: usize,
    /// Samples recorded since creation or the last clear, including evicted ones
    pub recorded_operations: u64,
    pub successes: usize,
    pub transient_failures: usize,
    pub fatal_failures: usize,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub slow_operations: usize,
    pub total_rows_affected: u64,
    pub distinct_fingerprints: usize,
    pub distinct_paths: usize,
    pub operations_per_second: f64,
    pub uptime_secs: f64,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub sample_count: usize,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    /// Human-readable list of thresholds exceeded
    pub violations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

struct MonitorState {
    history: VecDeque<OperationSample>,
    recorded: u64,
    since: Instant,
}

/// Bounded, thread-safe history of operation samples.
pub struct HealthMonitor {
    config: HealthConfig,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                history: VecDeque::new(),
                recorded: 0,
                since: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample, evicting the oldest past the retention limits.
    pub fn record(&self, sample: OperationSample) {
        if sample.duration > self.config.slow_query_threshold {
            warn!(
                fingerprint = %sample.fingerprint,
                path = ?sample.path,
                duration_ms = sample.duration.as_millis() as u64,
                threshold_ms = self.config.slow_query_threshold.as_millis() as u64,
                outcome = ?sample.outcome,
                "Slow database operation"
            );
        }

        let mut state = self.lock();
        state.history.push_back(sample);
        state.recorded += 1;
        while state.history.len() > self.config.retention {
            state.history.pop_front();
        }
        self.prune_expired(&mut state.history);
    }

    fn prune_expired(&self, history: &mut VecDeque<OperationSample>) {
        let Some(max_age) = self.config.max_age else {
            return;
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return;
        };
        let cutoff = Utc::now() - max_age;
        while history.front().is_some_and(|s| s.started_at < cutoff) {
            history.pop_front();
        }
    }

    fn snapshot(&self) -> (Vec<OperationSample>, u64, Duration) {
        let mut state = self.lock();
        self.prune_expired(&mut state.history);
        let snapshot = state.history.iter().cloned().collect();
        (snapshot, state.recorded, state.since.elapsed())
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        self.prune_expired(&mut state.history);
        state.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `n` most recent samples, newest last.
    pub fn recent(&self, n: usize) -> Vec<OperationSample> {
        let (samples, _, _) = self.snapshot();
        let skip = samples.len().saturating_sub(n);
        samples.into_iter().skip(skip).collect()
    }

    /// Per-fingerprint statistics, ordered by fingerprint.
    pub fn query_statistics(&self) -> Vec<QueryStats> {
        let (samples, _, _) = self.snapshot();
        let mut groups: BTreeMap<&str, Vec<&OperationSample>> = BTreeMap::new();
        for sample in &samples {
            groups.entry(sample.fingerprint.as_str()).or_default().push(sample);
        }
        groups
            .into_iter()
            .map(|(fingerprint, group)| fingerprint_stats(fingerprint, &group))
            .collect()
    }

    /// Aggregate statistics across every fingerprint and path.
    pub fn database_statistics(&self) -> DatabaseStats {
        let (samples, recorded, uptime) = self.snapshot();
        let mut counts: HashMap<Outcome, usize> = HashMap::new();
        for sample in &samples {
            *counts.entry(sample.outcome).or_default() += 1;
        }
        let total = samples.len();
        let errors = total - counts.get(&Outcome::Success).copied().unwrap_or(0);
        let durations: Vec<f64> = samples.iter().map(|s| millis(s.duration)).collect();
        let uptime_secs = uptime.as_secs_f64();

        DatabaseStats {
            total_operations: total,
            recorded_operations: recorded,
            successes: counts.get(&Outcome::Success).copied().unwrap_or(0),
            transient_failures: counts.get(&Outcome::TransientFailure).copied().unwrap_or(0),
            fatal_failures: counts.get(&Outcome::FatalFailure).copied().unwrap_or(0),
            error_rate: ratio(errors, total),
            avg_ms: mean(&durations),
            min_ms: durations.iter().copied().fold(None, min_opt).unwrap_or(0.0),
            max_ms: durations.iter().copied().fold(0.0, f64::max),
            slow_operations: samples
                .iter()
                .filter(|s| s.duration > self.config.slow_query_threshold)
                .count(),
            total_rows_affected: samples.iter().filter_map(|s| s.rows_affected).sum(),
            distinct_fingerprints: samples
                .iter()
                .map(|s| s.fingerprint.as_str())
                .collect::<std::collections::HashSet<_>>()
                .len(),
            distinct_paths: samples
                .iter()
                .filter_map(|s| s.path.as_deref())
                .collect::<std::collections::HashSet<_>>()
                .len(),
            operations_per_second: if uptime_secs > 0.0 {
                total as f64 / uptime_secs
            } else {
                0.0
            },
            uptime_secs,
        }
    }

    /// Classify the health of every retained sample.
    pub fn health_check(&self) -> HealthReport {
        let mut state = self.lock();
        self.prune_expired(&mut state.history);
        self.evaluate(state.history.iter())
    }

    /// Classify the health of one database path.
    pub fn path_status(&self, path: &Path) -> HealthStatus {
        let mut state = self.lock();
        self.prune_expired(&mut state.history);
        self.evaluate(
            state
                .history
                .iter()
                .filter(|s| s.path.as_deref() == Some(path)),
        )
        .status
    }

    /// Fingerprints whose mean latency exceeds `threshold`, slowest first.
    pub fn slow_queries(&self, threshold: Duration) -> Vec<QueryStats> {
        let threshold_ms = millis(threshold);
        let mut slow: Vec<QueryStats> = self
            .query_statistics()
            .into_iter()
            .filter(|stats| stats.mean_ms > threshold_ms)
            .collect();
        slow.sort_by(|a, b| b.mean_ms.total_cmp(&a.mean_ms));
        slow
    }

    /// Drop every sample and restart the uptime clock.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.recorded = 0;
        state.since = Instant::now();
    }

    fn evaluate<'a>(&self, samples: impl Iterator<Item = &'a OperationSample>) -> HealthReport {
        let mut count = 0usize;
        let mut errors = 0usize;
        let mut total_ms = 0.0;
        for sample in samples {
            count += 1;
            total_ms += millis(sample.duration);
            if sample.outcome.is_failure() {
                errors += 1;
            }
        }

        let checked_at = Utc::now();
        if count == 0 {
            return HealthReport {
                status: HealthStatus::Healthy,
                sample_count: 0,
                error_rate: 0.0,
                mean_latency_ms: 0.0,
                violations: Vec::new(),
                checked_at,
            };
        }

        let error_rate = ratio(errors, count);
        let mean_ms = total_ms / count as f64;
        let cfg = &self.config;
        let degraded_ms = millis(cfg.degraded_latency);
        let unhealthy_ms = millis(cfg.unhealthy_latency);
        let mut violations = Vec::new();

        let status = if error_rate > cfg.unhealthy_error_rate || mean_ms > unhealthy_ms {
            HealthStatus::Unhealthy
        } else if error_rate > cfg.degraded_error_rate || mean_ms > degraded_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if error_rate > cfg.degraded_error_rate {
            let limit = if error_rate > cfg.unhealthy_error_rate {
                cfg.unhealthy_error_rate
            } else {
                cfg.degraded_error_rate
            };
            violations.push(format!(
                "error rate {:.1}% exceeds {:.1}%",
                error_rate * 100.0,
                limit * 100.0
            ));
        }
        if mean_ms > degraded_ms {
            let limit = if mean_ms > unhealthy_ms {
                cfg.unhealthy_latency
            } else {
                cfg.degraded_latency
            };
            violations.push(format!(
                "mean latency {:.1}ms exceeds {}ms",
                mean_ms,
                limit.as_millis()
            ));
        }

        HealthReport {
            status,
            sample_count: count,
            error_rate,
            mean_latency_ms: mean_ms,
            violations,
            checked_at,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("retention", &self.config.retention)
            .field("max_age", &self.config.max_age)
            .finish()
    }
}

fn fingerprint_stats(fingerprint: &str, group: &[&OperationSample]) -> QueryStats {
    let mut durations: Vec<f64> = group.iter().map(|s| millis(s.duration)).collect();
    durations.sort_by(f64::total_cmp);
    let errors = group.iter().filter(|s| s.outcome.is_failure()).count();
    let last_seen = group
        .iter()
        .map(|s| s.started_at)
        .max()
        .unwrap_or_else(Utc::now);

    QueryStats {
        fingerprint: fingerprint.to_string(),
        count: group.len(),
        errors,
        error_rate: ratio(errors, group.len()),
        mean_ms: mean(&durations),
        min_ms: durations.first().copied().unwrap_or(0.0),
        max_ms: durations.last().copied().unwrap_or(0.0),
        p50_ms: percentile(&durations, 50.0),
        p95_ms: percentile(&durations, 95.0),
        p99_ms: percentile(&durations, 99.0),
        rows_affected: group.iter().filter_map(|s| s.rows_affected).sum(),
        last_seen,
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Normalize a statement into a fingerprint.
///
/// Whitespace runs collapse to one space, string and numeric literals become `?`, and
/// the result is capped at [`MAX_FINGERPRINT_LEN`] characters, so statements that only
/// differ in their literal values share statistics. Whitespace left at the end by the
/// cap is trimmed, so a capped fingerprint can be shorter than the limit.
pub fn fingerprint(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len().min(MAX_FINGERPRINT_LEN));
    let mut chars = sql.trim().chars().peekable();
    let mut prev_is_word = false;
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        if c == '\'' {
            // Quoted literal; '' is an escaped quote.
            while let Some(n) = chars.next() {
                if n == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            out.push('?');
            prev_is_word = false;
        } else if c.is_ascii_digit() && !prev_is_word {
            while chars
                .peek()
                .is_some_and(|n| n.is_ascii_alphanumeric() || *n == '.')
            {
                chars.next();
            }
            out.push('?');
            prev_is_word = false;
        } else {
            out.push(c);
            prev_is_word = c.is_alphanumeric() || c == '_';
        }

        if out.chars().count() >= MAX_FINGERPRINT_LEN {
            break;
        }
    }

    let mut fp: String = out.chars().take(MAX_FINGERPRINT_LEN).collect();
    fp.truncate(fp.trim_end().len());
    fp
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn min_opt(acc: Option<f64>, v: f64) -> Option<f64> {
    Some(acc.map_or(v, |a| a.min(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default())
    }

    fn sample(fp: &str, ms: u64, outcome: Outcome) -> OperationSample {
        OperationSample::new(fp, Duration::from_millis(ms), outcome)
    }

    #[test]
    fn test_fingerprint_normalizes_literals_and_whitespace() {
        assert_eq!(
            fingerprint("SELECT *   FROM users\n WHERE id = 42 AND name = 'bob'"),
            "SELECT * FROM users WHERE id = ? AND name = ?"
        );
        assert_eq!(
            fingerprint("INSERT INTO t VALUES (1.5, 'it''s')"),
            "INSERT INTO t VALUES (?, ?)"
        );
        // Digits inside identifiers stay
        assert_eq!(fingerprint("SELECT col1 FROM t2"), "SELECT col1 FROM t2");
    }

    #[test]
    fn test_fingerprint_truncates() {
        let long = format!("SELECT {}", "abcdefgh".repeat(100));
        assert_eq!(fingerprint(&long).chars().count(), MAX_FINGERPRINT_LEN);

        // The cap lands on a space here; it is trimmed
        let list = format!("SELECT {}", "x, ".repeat(400));
        let fp = fingerprint(&list);
        assert_eq!(fp.chars().count(), MAX_FINGERPRINT_LEN - 1);
        assert!(fp.ends_with(','));
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), 50.0);
        assert_eq!(percentile(&values, 95.0), 95.0);
        assert_eq!(percentile(&values, 99.0), 99.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = HealthMonitor::new(HealthConfig {
            retention: 3,
            ..HealthConfig::default()
        });
        for i in 0..5 {
            monitor.record(sample(&format!("q{}", i), 1, Outcome::Success));
        }
        let recent = monitor.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].fingerprint, "q2");
        assert_eq!(monitor.database_statistics().recorded_operations, 5);
    }

    #[test]
    fn test_max_age_drops_old_samples() {
        let monitor = HealthMonitor::new(HealthConfig {
            max_age: Some(Duration::from_secs(60)),
            ..HealthConfig::default()
        });
        monitor.record(
            sample("old", 1, Outcome::Success)
                .with_started_at(Utc::now() - chrono::Duration::seconds(120)),
        );
        monitor.record(sample("new", 1, Outcome::Success));
        let recent = monitor.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fingerprint, "new");
    }

    #[test]
    fn test_empty_history_is_healthy() {
        let report = monitor().health_check();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.sample_count, 0);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn test_health_thresholds() {
        let m = monitor();
        for _ in 0..99 {
            m.record(sample("q", 1, Outcome::Success));
        }
        m.record(sample("q", 1, Outcome::TransientFailure));
        assert_eq!(m.health_check().status, HealthStatus::Healthy);

        // 10% errors: degraded
        let m = monitor();
        for i in 0..10 {
            let outcome = if i == 0 {
                Outcome::FatalFailure
            } else {
                Outcome::Success
            };
            m.record(sample("q", 1, outcome));
        }
        let report = m.health_check();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.violations.len(), 1);

        // 50% errors: unhealthy
        let m = monitor();
        m.record(sample("q", 1, Outcome::FatalFailure));
        m.record(sample("q", 1, Outcome::Success));
        assert_eq!(m.health_check().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_latency_thresholds() {
        let m = monitor();
        m.record(sample("q", 800, Outcome::Success));
        assert_eq!(m.health_check().status, HealthStatus::Degraded);

        m.record(sample("q", 5_000, Outcome::Success));
        let report = m.health_check();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.violations[0].contains("mean latency"));
    }

    #[test]
    fn test_path_status_isolates_paths() {
        let m = monitor();
        for _ in 0..4 {
            m.record(sample("q", 1, Outcome::FatalFailure).with_path("bad.db"));
            m.record(sample("q", 1, Outcome::Success).with_path("good.db"));
        }
        assert_eq!(m.path_status(Path::new("bad.db")), HealthStatus::Unhealthy);
        assert_eq!(m.path_status(Path::new("good.db")), HealthStatus::Healthy);
        assert_eq!(m.path_status(Path::new("other.db")), HealthStatus::Healthy);
    }

    #[test]
    fn test_query_statistics_per_fingerprint() {
        let m = monitor();
        m.record(sample("a", 10, Outcome::Success));
        m.record(sample("a", 30, Outcome::TransientFailure));
        m.record(sample("b", 5, Outcome::Success));

        let stats = m.query_statistics();
        assert_eq!(stats.len(), 2);
        let a = &stats[0];
        assert_eq!(a.fingerprint, "a");
        assert_eq!(a.count, 2);
        assert_eq!(a.errors, 1);
        assert_eq!(a.error_rate, 0.5);
        assert!((a.mean_ms - 20.0).abs() < 0.001);
        assert!((a.min_ms - 10.0).abs() < 0.001);
        assert!((a.max_ms - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_slow_queries_strictly_above_threshold_sorted() {
        let m = monitor();
        m.record(sample("fast", 10, Outcome::Success));
        m.record(sample("medium", 100, Outcome::Success));
        m.record(sample("slow", 300, Outcome::Success));

        let slow = m.slow_queries(Duration::from_millis(100));
        let names: Vec<&str> = slow.iter().map(|s| s.fingerprint.as_str()).collect();
        assert_eq!(names, vec!["slow"]);

        let slow = m.slow_queries(Duration::from_millis(50));
        let names: Vec<&str> = slow.iter().map(|s| s.fingerprint.as_str()).collect();
        assert_eq!(names, vec!["slow", "medium"]);
    }

    #[test]
    fn test_database_statistics_totals() {
        let m = monitor();
        m.record(sample("a", 10, Outcome::Success).with_path("x.db"));
        m.record(sample("a", 20, Outcome::TransientFailure).with_path("x.db"));
        m.record(sample("b", 30, Outcome::FatalFailure).with_path("y.db"));

        let stats = m.database_statistics();
        assert_eq!(stats.total_operations, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.transient_failures, 1);
        assert_eq!(stats.fatal_failures, 1);
        assert_eq!(stats.distinct_fingerprints, 2);
        assert_eq!(stats.distinct_paths, 2);
        assert!((stats.avg_ms - 20.0).abs() < 0.001);
        assert!((stats.min_ms - 10.0).abs() < 0.001);
        assert!((stats.max_ms - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_rows_affected_totals() {
        let m = monitor();
        m.record(sample("UPDATE t SET v = ?", 1, Outcome::Success).with_rows_affected(3));
        m.record(sample("UPDATE t SET v = ?", 1, Outcome::TransientFailure));
        m.record(sample("UPDATE t SET v = ?", 1, Outcome::Success).with_rows_affected(4));
        m.record(sample("DELETE FROM t", 1, Outcome::Success).with_rows_affected(10));
        m.record(sample("SELECT v FROM t", 1, Outcome::Success));

        let stats = m.query_statistics();
        let rows: Vec<(&str, u64)> = stats
            .iter()
            .map(|q| (q.fingerprint.as_str(), q.rows_affected))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("DELETE FROM t", 10),
                ("SELECT v FROM t", 0),
                ("UPDATE t SET v = ?", 7)
            ]
        );
        assert_eq!(m.database_statistics().total_rows_affected, 17);
    }

    #[test]
    fn test_mean_latency_keeps_sub_millisecond_precision() {
        let m = monitor();
        m.record(OperationSample::new("a", Duration::from_micros(1500), Outcome::Success));
        m.record(OperationSample::new("a", Duration::from_micros(500), Outcome::Success));
        m.record(OperationSample::new("a", Duration::from_micros(250), Outcome::Success));

        let report = m.health_check();
        assert!((report.mean_latency_ms - 0.75).abs() < 1e-9);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_clear_resets_history() {
        let m = monitor();
        m.record(sample("a", 1, Outcome::Success));
        m.clear();
        assert!(m.is_empty());
        assert_eq!(m.database_statistics().recorded_operations, 0);
    }
}
