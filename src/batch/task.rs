//! Batch tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Only forward moves are legal: Pending→Running→{Completed, Failed} and
    /// Pending→Cancelled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item of a batch. Owned by its session and mutated only by the worker
/// running it, or by `cancel` while it is still pending.
#[derive(Debug, Clone, Serialize)]
pub struct Task<V> {
    /// Position in the submitted item list.
    pub id: usize,
    pub key: String,
    pub status: TaskStatus,
    pub result: Option<V>,
    pub error: Option<String>,
    /// Result came from the cache rather than the analyzer.
    pub cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl<V> Task<V> {
    pub(crate) fn new(id: usize, key: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            cached: false,
            started_at: None,
            ended_at: None,
        }
    }

    fn advance(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> bool {
        let moved = self.advance(TaskStatus::Running);
        if moved {
            self.started_at = Some(now);
        }
        moved
    }

    pub(crate) fn complete(&mut self, value: V, cached: bool, now: DateTime<Utc>) -> bool {
        let moved = self.advance(TaskStatus::Completed);
        if moved {
            self.result = Some(value);
            self.cached = cached;
            self.ended_at = Some(now);
        }
        moved
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        let moved = self.advance(TaskStatus::Failed);
        if moved {
            self.error = Some(error.into());
            self.ended_at = Some(now);
        }
        moved
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        let moved = self.advance(TaskStatus::Cancelled);
        if moved {
            self.ended_at = Some(now);
        }
        moved
    }

    /// Time between start and end; `None` until the task has run to a terminal state.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}
