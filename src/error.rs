//! Error types for the analysis runtime
//!
//! Provides one thiserror enum per concern: cache operations, task submission,
//! terminal task outcomes, worker execution, and the admin API surface.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::pool::TaskId;

// == Cache Error Enum ==
/// Errors raised inside the cache subsystem.
///
/// Only `TooManyConcurrentOperations` and `Serialization` ever reach callers of
/// [`CacheManager::set`](crate::cache::CacheManager::set). The remaining
/// variants are produced by the persistent tier and are downgraded to cache
/// misses by the manager.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Too many `set` calls are in flight
    #[error("too many concurrent cache operations (limit {limit})")]
    TooManyConcurrentOperations { limit: usize },

    /// The value could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reading or writing the persistent tier failed
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A persisted record could not be decoded
    #[error("corrupt cache record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// Stored checksum does not match the decoded payload
    #[error("checksum mismatch for key {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

// == Pool Error Enum ==
/// Immediate, synchronous rejections from [`WorkerPool::submit`](crate::pool::WorkerPool::submit).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The task queue is at capacity
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pool is shutting down and accepts no new work
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// No handler is registered for the task type
    #[error("no handler registered for task type '{0}'")]
    UnknownTaskType(String),
}

// == Task Error Enum ==
/// Terminal failure of a submitted task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The handler failed on every attempt
    #[error("task {task_id} failed after {attempts} attempt(s): {cause}")]
    Failed {
        task_id: TaskId,
        attempts: u32,
        cause: String,
    },

    /// The last attempt exceeded its timeout
    #[error("task {task_id} timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    TimedOut {
        task_id: TaskId,
        attempts: u32,
        timeout_ms: u64,
    },

    /// The pool was destroyed before the task finished
    #[error("task {task_id} cancelled by pool shutdown")]
    Cancelled { task_id: TaskId },

    /// The task was never accepted (batch submissions only)
    #[error("task rejected: {0}")]
    Rejected(#[from] PoolError),
}

impl TaskError {
    /// Returns true for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut { .. })
    }
}

// == Execution Error Enum ==
/// Outcome of a single attempt on a worker that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The handler returned an error
    #[error("handler error: {0}")]
    Handler(String),

    /// No result arrived before the task timeout
    #[error("timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// The worker thread died or was terminated mid-task
    #[error("worker {worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: usize, reason: String },

    /// The worker refused the task because it is busy or destroyed
    #[error("worker {0} is not available")]
    WorkerUnavailable(usize),
}

impl ExecutionError {
    /// True when the execution substrate itself failed and the worker must be recycled.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkerCrashed { .. } | ExecutionError::WorkerUnavailable(_)
        )
    }
}

// == API Error Enum ==
/// Unified error type for the admin HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Cache(CacheError::TooManyConcurrentOperations { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Cache(CacheError::Serialization(_)) => StatusCode::BAD_REQUEST,
            ApiError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pool(PoolError::UnknownTaskType(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Task(TaskError::TimedOut { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Task(TaskError::Rejected(_)) | ApiError::Task(TaskError::Cancelled { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Task(TaskError::Failed { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type, defaulting to the API error.
pub type Result<T, E = ApiError> = std::result::Result<T, E>;
