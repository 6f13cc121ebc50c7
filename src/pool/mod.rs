//! Worker Pool Module
//!
//! Runs CPU-bound analysis tasks on a dynamic set of worker threads.
//!
//! # Components
//! - [`WorkerPool`]: priority queue, dispatch, retries with backoff, timeouts,
//!   health monitoring and auto-scaling
//! - [`WorkerWrapper`]: async handle to one worker thread
//! - [`HandlerRegistry`]: maps task types to [`TaskHandler`]s

mod handler;
#[allow(clippy::module_inception)]
mod pool;
mod queue;
mod task;
mod worker;

pub use handler::{HandlerRegistry, TaskHandler};
pub use pool::{PoolStats, WorkerPool};
pub use queue::TaskQueue;
pub use task::{TaskHandle, TaskId, TaskOptions, TaskOutput, TaskSpec, TaskState, WorkerTask};
pub use worker::{
    HeartbeatMessage, ResourceStats, ResultMessage, TaskMessage, WorkerEvent, WorkerStats,
    WorkerWrapper,
};
