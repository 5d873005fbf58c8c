//! Batch sessions and their reports.

use super::task::{Task, TaskStatus};
use crate::config::{validate_concurrency, validate_rate_limit, BatchDefaults};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Invoked after every task reaches a terminal state, in completion order.
pub type ProgressCallback = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not started.
    Pending,
    Running,
    /// Every task ran to a terminal state. Individual tasks may still have failed.
    Completed,
    /// Cancelled by the caller; tasks that were pending never ran.
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session execution settings.
#[derive(Clone)]
pub struct BatchOptions {
    pub name: Option<String>,
    pub max_concurrency: usize,
    /// Analyzer starts per second. Zero disables rate limiting.
    pub rate_limit: f64,
    pub cache_ttl: Duration,
    pub progress: Option<ProgressCallback>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from(&BatchDefaults::default())
    }
}

impl From<&BatchDefaults> for BatchOptions {
    fn from(d: &BatchDefaults) -> Self {
        Self {
            name: None,
            max_concurrency: d.max_concurrency,
            rate_limit: d.rate_limit,
            cache_ttl: d.cache_ttl,
            progress: None,
        }
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }
    pub fn with_rate_limit(mut self, rps: f64) -> Self {
        self.rate_limit = rps;
        self
    }
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_concurrency(self.max_concurrency)?;
        validate_rate_limit(self.rate_limit)
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("rate_limit", &self.rate_limit)
            .field("cache_ttl", &self.cache_ttl)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Lightweight view handed to progress callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub total: usize,
    pub finished: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    pub progress_percent: f64,
    /// Key of the task whose completion triggered this snapshot.
    pub last_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatusReport {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrency: usize,
    pub rate_limit: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult<V> {
    pub item: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<V>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cached: bool,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Percentage of all items that completed successfully.
    pub success_rate: f64,
    pub cache_hits: usize,
    /// Mean duration of tasks that ran, in milliseconds.
    pub avg_duration_ms: f64,
    /// From session start to the end of its last task.
    pub wall_time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResults<V> {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub summary: ResultSummary,
    pub results: Vec<ItemResult<V>>,
}

#[derive(Default)]
struct Counts {
    pending: usize,
    running: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
}

impl Counts {
    fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A set of tasks submitted and tracked together.
///
/// The status is derived from the tasks: a started session is `Running` while any
/// task is pending or running, then `Completed` (or `Cancelled` if the caller
/// cancelled it).
pub struct BatchSession<V> {
    id: String,
    name: String,
    tasks: Vec<Task<V>>,
    options: BatchOptions,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    started: bool,
    cancelled: bool,
    cursor: usize,
}

impl<V> BatchSession<V> {
    pub(crate) fn new(id: String, items: Vec<String>, options: BatchOptions) -> Self {
        let name = options.name.clone().unwrap_or_else(|| format!("batch-{}", &id[..id.len().min(8)]));
        Self {
            tasks: items
                .into_iter()
                .enumerate()
                .map(|(i, key)| Task::new(i, key))
                .collect(),
            name,
            id,
            options,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            started: false,
            cancelled: false,
            cursor: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &[Task<V>] {
        &self.tasks
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn counts(&self) -> Counts {
        let mut c = Counts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::Running => c.running += 1,
                TaskStatus::Completed => c.completed += 1,
                TaskStatus::Failed => c.failed += 1,
                TaskStatus::Cancelled => c.cancelled += 1,
            }
        }
        c
    }

    pub fn status(&self) -> SessionStatus {
        let c = self.counts();
        if c.running > 0 || (self.started && c.pending > 0) {
            SessionStatus::Running
        } else if self.cancelled {
            SessionStatus::Cancelled
        } else if self.started {
            SessionStatus::Completed
        } else {
            SessionStatus::Pending
        }
    }

    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) {
        self.started = true;
        self.started_at = Some(now);
        self.close_if_finished(now);
    }

    /// Claim the next pending task for a worker, moving it to `Running`.
    pub(crate) fn claim_next(&mut self, now: DateTime<Utc>) -> Option<(usize, String)> {
        if self.cancelled {
            return None;
        }
        while self.cursor < self.tasks.len() {
            let index = self.cursor;
            self.cursor += 1;
            let task = &mut self.tasks[index];
            if task.start(now) {
                return Some((index, task.key.clone()));
            }
        }
        None
    }

    pub(crate) fn complete_task(&mut self, index: usize, value: V, cached: bool, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.complete(value, cached, now);
        }
        self.close_if_finished(now);
    }

    pub(crate) fn fail_task(&mut self, index: usize, error: impl Into<String>, now: DateTime<Utc>) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.fail(error, now);
        }
        self.close_if_finished(now);
    }

    /// Cancel every pending task. Returns how many were cancelled.
    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> usize {
        self.cancelled = true;
        let cancelled = self
            .tasks
            .iter_mut()
            .map(|t| t.cancel(now))
            .filter(|moved| *moved)
            .count();
        self.close_if_finished(now);
        cancelled
    }

    /// Close out tasks no worker will touch again, so the session can terminate.
    ///
    /// Tasks left `Running` by a dead worker are failed with `reason`. Tasks still
    /// `Pending` are cancelled and carry `reason` as their error. Returns how many
    /// tasks were closed.
    pub(crate) fn abandon_unfinished(&mut self, reason: &str, now: DateTime<Utc>) -> usize {
        let mut abandoned = 0;
        for task in &mut self.tasks {
            let moved = match task.status {
                TaskStatus::Running => task.fail(reason, now),
                TaskStatus::Pending => {
                    let moved = task.cancel(now);
                    if moved {
                        task.error = Some(reason.to_string());
                    }
                    moved
                }
                _ => false,
            };
            if moved {
                abandoned += 1;
            }
        }
        self.close_if_finished(now);
        abandoned
    }

    fn close_if_finished(&mut self, now: DateTime<Utc>) {
        if self.ended_at.is_none() && self.status().is_terminal() {
            self.ended_at = Some(now);
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.counts().pending
    }

    pub fn snapshot(&self, last_key: Option<String>) -> SessionSnapshot {
        let c = self.counts();
        SessionSnapshot {
            id: self.id.clone(),
            status: self.status(),
            total: self.tasks.len(),
            finished: c.finished(),
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            running: c.running,
            progress_percent: percent(c.finished(), self.tasks.len()),
            last_key,
        }
    }

    pub fn status_report(&self) -> BatchStatusReport {
        let c = self.counts();
        BatchStatusReport {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status(),
            progress_percent: percent(c.finished(), self.tasks.len()),
            total: self.tasks.len(),
            pending: c.pending,
            running: c.running,
            completed: c.completed,
            failed: c.failed,
            cancelled: c.cancelled,
            max_concurrency: self.options.max_concurrency,
            rate_limit: self.options.rate_limit,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

impl<V: Clone> BatchSession<V> {
    pub fn results(&self) -> BatchResults<V> {
        let c = self.counts();
        let durations: Vec<Duration> = self.tasks.iter().filter_map(|t| t.duration()).collect();
        let avg_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / durations.len() as f64
        };
        let wall_time_ms = match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok().map(millis),
            _ => None,
        };
        let total = self.tasks.len();
        BatchResults {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status(),
            summary: ResultSummary {
                total,
                succeeded: c.completed,
                failed: c.failed,
                cancelled: c.cancelled,
                success_rate: if total == 0 { 0.0 } else { percent(c.completed, total) },
                cache_hits: self.tasks.iter().filter(|t| t.cached).count(),
                avg_duration_ms,
                wall_time_ms,
            },
            results: self
                .tasks
                .iter()
                .map(|t| ItemResult {
                    item: t.key.clone(),
                    status: t.status,
                    result: t.result.clone(),
                    error: t.error.clone(),
                    cached: t.cached,
                    duration_ms: t.duration().map(millis),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(items: &[&str]) -> BatchSession<u32> {
        BatchSession::new(
            "0123456789abcdef".to_string(),
            items.iter().map(|s| s.to_string()).collect(),
            BatchOptions::new(),
        )
    }

    #[test]
    fn test_status_is_derived() {
        let now = Utc::now();
        let mut s = session(&["a", "b"]);
        assert_eq!(s.status(), SessionStatus::Pending);
        assert_eq!(s.name(), "batch-01234567");
        s.mark_started(now);
        assert_eq!(s.status(), SessionStatus::Running);

        let (i, key) = s.claim_next(now).unwrap();
        assert_eq!((i, key.as_str()), (0, "a"));
        s.complete_task(i, 1, false, now);
        let (j, _) = s.claim_next(now).unwrap();
        assert!(s.claim_next(now).is_none());
        assert_eq!(s.status(), SessionStatus::Running);
        assert!(s.ended_at().is_none());

        s.fail_task(j, "boom", now);
        assert_eq!(s.status(), SessionStatus::Completed);
        assert!(s.ended_at().is_some());
    }

    #[test]
    fn test_cancel_leaves_running_tasks() {
        let now = Utc::now();
        let mut s = session(&["a", "b", "c"]);
        s.mark_started(now);
        let (i, _) = s.claim_next(now).unwrap();
        assert_eq!(s.cancel(now), 2);
        assert_eq!(s.status(), SessionStatus::Running);
        assert!(s.claim_next(now).is_none());
        s.complete_task(i, 9, false, now);
        assert_eq!(s.status(), SessionStatus::Cancelled);
        let report = s.status_report();
        assert_eq!((report.completed, report.cancelled), (1, 2));
        assert_eq!(report.progress_percent, 100.0);
    }

    #[test]
    fn test_empty_session_completes_on_start() {
        let mut s = session(&[]);
        s.mark_started(Utc::now());
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(s.status_report().progress_percent, 100.0);
        assert_eq!(s.results().summary.success_rate, 0.0);
    }

    #[test]
    fn test_results_summary() {
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(100);
        let mut s = session(&["a", "b", "c", "d", "e"]);
        s.mark_started(now);
        for i in 0..5 {
            let (idx, _) = s.claim_next(now).unwrap();
            match i {
                1 | 3 => s.fail_task(idx, format!("bad item {}", idx), later),
                4 => s.complete_task(idx, 5, true, later),
                _ => s.complete_task(idx, idx as u32, false, later),
            }
        }
        let results = s.results();
        assert_eq!(results.status, SessionStatus::Completed);
        assert_eq!(results.summary.success_rate, 60.0);
        assert_eq!(results.summary.cache_hits, 1);
        assert_eq!(results.summary.avg_duration_ms, 100.0);
        assert_eq!(results.summary.wall_time_ms, Some(100));
        assert_eq!(results.results.iter().filter(|r| r.error.is_some()).count(), 2);
        assert_eq!(results.results[1].error.as_deref(), Some("bad item 1"));
    }

    #[test]
    fn test_abandon_unfinished() {
        let now = Utc::now();
        let mut s = session(&["a", "b", "c"]);
        s.mark_started(now);
        let (i, _) = s.claim_next(now).unwrap();
        s.complete_task(i, 7, false, now);
        s.claim_next(now);
        assert_eq!(s.status(), SessionStatus::Running);

        assert_eq!(s.abandon_unfinished("worker stopped", now), 2);
        assert_eq!(s.status(), SessionStatus::Completed);
        assert!(s.ended_at().is_some());
        assert_eq!(s.tasks()[0].status, TaskStatus::Completed);
        assert_eq!(s.tasks()[1].status, TaskStatus::Failed);
        assert_eq!(s.tasks()[1].error.as_deref(), Some("worker stopped"));
        assert_eq!(s.tasks()[2].status, TaskStatus::Cancelled);
        assert_eq!(s.tasks()[2].error.as_deref(), Some("worker stopped"));
        assert_eq!(s.abandon_unfinished("worker stopped", now), 0);
    }

    #[test]
    fn test_options_validation() {
        assert!(BatchOptions::new().validate().is_ok());
        assert!(BatchOptions::new().with_max_concurrency(0).validate().is_err());
        assert!(BatchOptions::new().with_rate_limit(f64::NAN).validate().is_err());
        assert!(BatchOptions::new().with_rate_limit(1e-20).validate().is_err());
        assert!(BatchOptions::new().with_rate_limit(0.0).validate().is_ok());
    }
}
