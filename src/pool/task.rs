//! Task Model
//!
//! Submission options, the pool-side task record, the caller-facing output and
//! the handle through which a submitter awaits the terminal outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::TaskError;

/// Monotonic identifier assigned at submission.
pub type TaskId = u64;

// == Task Options ==
/// Per-submission scheduling options. Unset fields fall back to the pool
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher runs first
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl TaskOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One item of a batch submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: Value,
    pub options: TaskOptions,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

// == Task State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched,
    Completed,
    Failed,
    TimedOut,
    PermanentlyFailed,
}

// == Worker Task ==
/// Pool-side record of a submitted task.
///
/// `retry_count` never exceeds `max_retries`; once the budget is spent the
/// task is terminal and never re-queued.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Value,
    pub priority: i32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerTask {
    pub fn new(
        id: TaskId,
        task_type: impl Into<String>,
        payload: Value,
        priority: i32,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            task_type: task_type.into(),
            payload,
            priority,
            timeout,
            max_retries,
            retry_count: 0,
            state: TaskState::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attempts made so far, counting the one in progress.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

// == Task Output ==
/// Successful result of a task, as delivered to the submitter.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub task_type: String,
    pub result: Value,
    pub duration_ms: u64,
    /// Process memory change observed across the attempt
    pub memory_delta_bytes: i64,
    pub retry_count: u32,
    pub worker_id: usize,
    pub completed_at: DateTime<Utc>,
}

// == Task Handle ==
/// Resolves once the task reaches a terminal state.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<TaskOutput, TaskError>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<Result<TaskOutput, TaskError>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskOutput, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Cancelled { task_id: id })))
    }
}
