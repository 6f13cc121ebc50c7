//! Worker Pool Module
//!
//! Owns the worker set and the task queue. Submission is synchronous: a task
//! is validated, queued and, if a worker is free, dispatched before `submit`
//! returns. Every attempt runs in its own tokio task that awaits the worker,
//! then either resolves the submitter's handle or re-queues the task with a
//! delayed `ready_at`. One coordinator task drives the periodic work:
//! dispatch ticks, health checks and auto-scaling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{ExecutionError, PoolError, TaskError};
use crate::pool::handler::HandlerRegistry;
use crate::pool::queue::TaskQueue;
use crate::pool::task::{TaskHandle, TaskOptions, TaskOutput, TaskSpec, TaskState, WorkerTask};
use crate::pool::worker::{ResultMessage, WorkerEvent, WorkerStats, WorkerWrapper};

type Reply = oneshot::Sender<Result<TaskOutput, TaskError>>;

/// A task plus the channel its submitter is waiting on.
struct Pending {
    task: WorkerTask,
    reply: Reply,
}

impl Pending {
    fn resolve(self, outcome: Result<TaskOutput, TaskError>) {
        // The submitter may have dropped its handle
        let _ = self.reply.send(outcome);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    submitted: u64,
    rejected: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    retried: u64,
    restarts: u64,
    cancelled: u64,
}

struct PoolState {
    queue: TaskQueue<Pending>,
    workers: Vec<Arc<WorkerWrapper>>,
    next_worker_id: usize,
    in_flight: usize,
    counters: Counters,
    deep_queue_ticks: u32,
}

// == Pool Stats ==
/// Aggregate pool statistics derived from live state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    /// Ready and backed-off tasks waiting for a worker
    pub queued: usize,
    /// Backed-off retries not yet eligible
    pub delayed: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub restarts: u64,
    pub cancelled: u64,
    /// Completed tasks per second since the pool started
    pub throughput_per_sec: f64,
    pub uptime_ms: u64,
    pub shutting_down: bool,
}

struct PoolInner {
    config: PoolConfig,
    registry: HandlerRegistry,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    runtime: Handle,
    next_task_id: AtomicU64,
    /// No new submissions accepted
    closing: AtomicBool,
    /// Shutdown grace period is over; failures resolve as cancelled
    stopped: AtomicBool,
    drained: Notify,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

// == Worker Pool ==
/// Dynamic pool of worker threads with a priority queue, retries,
/// timeouts, health monitoring and auto-scaling. Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    // == Constructor ==
    /// Starts `min_workers` workers and the coordinator.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(mut config: PoolConfig, registry: HandlerRegistry) -> Self {
        if config.max_workers < config.min_workers {
            warn!(
                "max_workers ({}) is below min_workers ({}), raising it",
                config.max_workers, config.min_workers
            );
            config.max_workers = config.min_workers;
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: TaskQueue::new(),
                workers: Vec::new(),
                next_worker_id: 0,
                in_flight: 0,
                counters: Counters::default(),
                deep_queue_ticks: 0,
            }),
            events,
            runtime: Handle::current(),
            next_task_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            drained: Notify::new(),
            coordinator: Mutex::new(None),
            started_at: Instant::now(),
            registry,
            config,
        });

        {
            let mut state = inner.state.lock();
            for _ in 0..inner.config.min_workers {
                inner.spawn_worker(&mut state);
            }
            info!(
                "Worker pool started with {} worker(s) (max {})",
                state.workers.len(),
                inner.config.max_workers
            );
        }

        let coordinator = tokio::spawn(coordinate(Arc::downgrade(&inner), events_rx));
        *inner.coordinator.lock() = Some(coordinator);

        Self { inner }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    // == Submit ==
    /// Queues a task and dispatches it at once if a worker is free.
    ///
    /// Never blocks. Fails immediately when the pool is shutting down, the
    /// task type has no handler, or the queue is full.
    pub fn submit(
        &self,
        task_type: &str,
        payload: Value,
        options: TaskOptions,
    ) -> Result<TaskHandle, PoolError> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        if !inner.registry.contains(task_type) {
            return Err(PoolError::UnknownTaskType(task_type.to_string()));
        }

        let mut state = inner.state.lock();
        let worker_free = state.workers.iter().any(|w| w.is_available());
        if state.queue.len() >= inner.config.queue_size && !worker_free {
            state.counters.rejected += 1;
            return Err(PoolError::QueueFull {
                capacity: inner.config.queue_size,
            });
        }

        let id = inner.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = WorkerTask::new(
            id,
            task_type,
            payload,
            options.priority,
            options.timeout.unwrap_or(inner.config.task_timeout),
            options.max_retries.unwrap_or(inner.config.max_retries),
        );
        let (reply, rx) = oneshot::channel();
        state.queue.push(task.priority, Pending { task, reply });
        state.counters.submitted += 1;
        debug!(task_id = id, task_type, priority = options.priority, "task queued");

        inner.dispatch_locked(&mut state);
        Ok(TaskHandle::new(id, rx))
    }

    // == Submit Batch ==
    /// Submits several tasks and waits for all of them.
    ///
    /// Tasks are submitted highest priority first with same-type tasks kept
    /// together; results come back in the caller's order. A rejected item is
    /// reported as [`TaskError::Rejected`] without affecting its siblings.
    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> Vec<Result<TaskOutput, TaskError>> {
        let mut order: Vec<usize> = (0..specs.len()).collect();
        order.sort_by(|&a, &b| {
            specs[b]
                .options
                .priority
                .cmp(&specs[a].options.priority)
                .then_with(|| specs[a].task_type.cmp(&specs[b].task_type))
        });

        let mut handles: Vec<Option<Result<TaskHandle, PoolError>>> =
            (0..specs.len()).map(|_| None).collect();
        for index in order {
            let spec = &specs[index];
            handles[index] = Some(self.submit(
                &spec.task_type,
                spec.payload.clone(),
                spec.options.clone(),
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles.into_iter().flatten() {
            results.push(match handle {
                Ok(handle) => handle.await,
                Err(e) => Err(TaskError::Rejected(e)),
            });
        }
        results
    }

    // == Resize ==
    /// Sets the worker count, clamped to `[min_workers, max_workers]`.
    /// Busy workers chosen for removal finish their current task first.
    /// Returns the new target.
    pub fn resize(&self, target: usize) -> usize {
        let inner = &self.inner;
        let target = target.clamp(inner.config.min_workers, inner.config.max_workers);
        let mut state = inner.state.lock();

        let active: Vec<Arc<WorkerWrapper>> = state
            .workers
            .iter()
            .filter(|w| !w.is_retiring())
            .cloned()
            .collect();

        if active.len() < target {
            for _ in active.len()..target {
                inner.spawn_worker(&mut state);
            }
        } else if active.len() > target {
            let mut surplus = active.len() - target;
            // Idle workers go first
            let (idle, busy): (Vec<_>, Vec<_>) = active.into_iter().partition(|w| !w.is_busy());
            for worker in idle.into_iter().chain(busy) {
                if surplus == 0 {
                    break;
                }
                worker.retire();
                surplus -= 1;
            }
            inner.reap_retired(&mut state);
        }

        info!("Worker pool resized to {} worker(s)", target);
        inner.dispatch_locked(&mut state);
        target
    }

    // == Statistics ==
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        let busy = state.workers.iter().filter(|w| w.is_busy()).count();
        let uptime = inner.started_at.elapsed();
        let c = state.counters;
        PoolStats {
            workers: state.workers.len(),
            busy_workers: busy,
            idle_workers: state.workers.len() - busy,
            queued: state.queue.len(),
            delayed: state.queue.delayed_len(),
            in_flight: state.in_flight,
            submitted: c.submitted,
            rejected: c.rejected,
            completed: c.completed,
            failed: c.failed,
            timed_out: c.timed_out,
            retried: c.retried,
            restarts: c.restarts,
            cancelled: c.cancelled,
            throughput_per_sec: if uptime.as_secs_f64() > 0.0 {
                c.completed as f64 / uptime.as_secs_f64()
            } else {
                0.0
            },
            uptime_ms: uptime.as_millis() as u64,
            shutting_down: inner.closing.load(Ordering::SeqCst),
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .map(|w| w.stats())
            .collect()
    }

    // == Destroy ==
    /// Shuts the pool down.
    ///
    /// New submissions are rejected at once. Queued and in-flight tasks get
    /// up to `shutdown_timeout` to finish; whatever is left resolves as
    /// [`TaskError::Cancelled`] and all workers are terminated.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Worker pool shutting down");

        let drained = tokio::time::timeout(inner.config.shutdown_timeout, inner.wait_drained())
            .await
            .is_ok();
        if !drained {
            warn!("Shutdown timeout elapsed with tasks outstanding, cancelling them");
        }
        inner.stopped.store(true, Ordering::SeqCst);

        let (leftovers, workers) = {
            let mut state = inner.state.lock();
            let leftovers = state.queue.drain();
            state.counters.cancelled += leftovers.len() as u64;
            (leftovers, std::mem::take(&mut state.workers))
        };
        for pending in leftovers {
            let task_id = pending.task.id;
            pending.resolve(Err(TaskError::Cancelled { task_id }));
        }
        for worker in &workers {
            worker.terminate();
        }

        if let Some(coordinator) = inner.coordinator.lock().take() {
            coordinator.abort();
        }
        info!("Worker pool stopped");
    }
}

impl PoolInner {
    fn spawn_worker(&self, state: &mut PoolState) -> bool {
        let id = state.next_worker_id;
        match WorkerWrapper::spawn(
            id,
            0,
            self.registry.clone(),
            self.events.clone(),
            self.config.heartbeat_interval,
        ) {
            Ok(worker) => {
                state.next_worker_id += 1;
                state.workers.push(worker);
                true
            }
            Err(e) => {
                error!("Failed to start worker thread: {}", e);
                false
            }
        }
    }

    /// Replaces `worker` with a fresh thread carrying the same id.
    ///
    /// No-op if `worker` is no longer in the pool, which happens when the
    /// health check already replaced it.
    fn restart_worker(&self, state: &mut PoolState, worker: &Arc<WorkerWrapper>, reason: &str) {
        let Some(pos) = state.workers.iter().position(|w| Arc::ptr_eq(w, worker)) else {
            return;
        };
        worker.terminate();
        if worker.is_retiring() {
            state.workers.remove(pos);
            debug!(worker_id = worker.id(), "retiring worker stopped instead of restarting: {}", reason);
            return;
        }
        state.counters.restarts += 1;

        match WorkerWrapper::spawn(
            worker.id(),
            worker.restart_count() + 1,
            self.registry.clone(),
            self.events.clone(),
            self.config.heartbeat_interval,
        ) {
            Ok(replacement) => {
                warn!(
                    worker_id = worker.id(),
                    restart_count = replacement.restart_count(),
                    "Restarted worker: {}",
                    reason
                );
                state.workers[pos] = replacement;
            }
            Err(e) => {
                error!(worker_id = worker.id(), "Failed to restart worker: {}", e);
                state.workers.remove(pos);
            }
        }
    }

    fn reap_retired(&self, state: &mut PoolState) {
        state.workers.retain(|w| {
            if w.is_retiring() && !w.is_busy() {
                w.terminate();
                debug!(worker_id = w.id(), "retired worker");
                false
            } else {
                true
            }
        });
    }

    // == Dispatch ==
    /// Assigns ready tasks to free workers, longest-idle worker first.
    fn dispatch_locked(self: &Arc<Self>, state: &mut PoolState) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.reap_retired(state);
        let now = Instant::now();

        loop {
            let Some(worker) = state
                .workers
                .iter()
                .filter(|w| w.is_available())
                .max_by_key(|w| w.idle_for())
                .cloned()
            else {
                break;
            };
            if !state.queue.has_ready(now) || !worker.try_reserve() {
                break;
            }
            let Some(mut pending) = state.queue.pop_ready(now) else {
                worker.unreserve();
                break;
            };

            pending.task.state = TaskState::Dispatched;
            pending.task.started_at = Some(Utc::now());
            state.in_flight += 1;
            debug!(
                task_id = pending.task.id,
                worker_id = worker.id(),
                attempt = pending.task.attempts(),
                "task dispatched"
            );
            self.runtime
                .spawn(Arc::clone(self).run_attempt(worker, pending));
        }
    }

    fn dispatch(self: &Arc<Self>) {
        let mut state = self.state.lock();
        self.dispatch_locked(&mut state);
    }

    // == Attempt ==
    async fn run_attempt(self: Arc<Self>, worker: Arc<WorkerWrapper>, pending: Pending) {
        let outcome = match worker.execute_task(&pending.task).await {
            Ok(reply) if reply.success => Ok(reply),
            Ok(reply) => Err(ExecutionError::Handler(
                reply.error.unwrap_or_else(|| "handler failed".to_string()),
            )),
            Err(e) => Err(e),
        };

        let mut state = self.state.lock();
        state.in_flight -= 1;

        match outcome {
            Ok(reply) => {
                state.counters.completed += 1;
                debug!(task_id = pending.task.id, duration_ms = reply.duration_ms, "task completed");
                let output = task_output(pending.task.clone(), reply);
                pending.resolve(Ok(output));
            }
            Err(err) => {
                if err.is_infrastructure() {
                    self.restart_worker(&mut state, &worker, &err.to_string());
                }
                self.handle_failure(&mut state, pending, err);
            }
        }

        self.dispatch_locked(&mut state);
        if state.queue.is_empty() && state.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Re-queues a failed attempt with backoff, or resolves it as terminal.
    fn handle_failure(&self, state: &mut PoolState, mut pending: Pending, err: ExecutionError) {
        let task_id = pending.task.id;
        let timed_out = matches!(err, ExecutionError::TimedOut { .. });
        if timed_out {
            state.counters.timed_out += 1;
            pending.task.state = TaskState::TimedOut;
        } else {
            pending.task.state = TaskState::Failed;
        }

        if self.stopped.load(Ordering::SeqCst) {
            state.counters.cancelled += 1;
            pending.resolve(Err(TaskError::Cancelled { task_id }));
            return;
        }

        if pending.task.can_retry() {
            pending.task.retry_count += 1;
            pending.task.state = TaskState::Queued;
            state.counters.retried += 1;
            let delay = self.config.backoff_base * pending.task.retry_count;
            warn!(
                task_id,
                retry = pending.task.retry_count,
                max_retries = pending.task.max_retries,
                delay_ms = delay.as_millis() as u64,
                "task attempt failed, retrying: {}",
                err
            );
            let priority = pending.task.priority;
            state
                .queue
                .push_delayed(priority, pending, Instant::now() + delay);
            return;
        }

        state.counters.failed += 1;
        pending.task.state = TaskState::PermanentlyFailed;
        let attempts = pending.task.attempts();
        warn!(task_id, attempts, "task permanently failed: {}", err);
        let terminal = match err {
            ExecutionError::TimedOut { timeout_ms } => TaskError::TimedOut {
                task_id,
                attempts,
                timeout_ms,
            },
            other => TaskError::Failed {
                task_id,
                attempts,
                cause: other.to_string(),
            },
        };
        pending.resolve(Err(terminal));
    }

    // == Events ==
    fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::Heartbeat(hb) => {
                let state = self.state.lock();
                if let Some(worker) = state
                    .workers
                    .iter()
                    .find(|w| w.id() == hb.worker_id && w.restart_count() == hb.generation)
                {
                    worker.record_heartbeat(hb.stats);
                }
            }
            WorkerEvent::Idle { .. } => self.dispatch(),
            WorkerEvent::Crashed {
                worker_id, reason, ..
            } => {
                error!(worker_id, "Worker crashed: {}", reason);
            }
            WorkerEvent::Terminated { worker_id, .. } => {
                debug!(worker_id, "worker terminated");
            }
        }
    }

    // == Health Check ==
    /// Restarts every worker that has gone silent for `heartbeat_timeout`.
    /// A worker running a task is only considered wedged once that attempt
    /// is also `heartbeat_timeout` past its own deadline.
    fn check_health(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let wedged: Vec<Arc<WorkerWrapper>> = state
            .workers
            .iter()
            .filter(|w| w.is_unresponsive(self.config.heartbeat_timeout))
            .cloned()
            .collect();

        for worker in wedged {
            let age = worker.heartbeat_age();
            self.restart_worker(
                &mut state,
                &worker,
                &format!("no heartbeat for {}ms", age.as_millis()),
            );
        }
        self.dispatch_locked(&mut state);
    }

    // == Auto-scaling ==
    fn autoscale(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        let workers = state.workers.len();
        let queued = state.queue.len();

        if queued > workers * self.config.scale_up_queue_ratio {
            state.deep_queue_ticks += 1;
            if state.deep_queue_ticks >= self.config.scale_up_ticks
                && workers < self.config.max_workers
                && self.spawn_worker(&mut state)
            {
                state.deep_queue_ticks = 0;
                info!("Scaled up to {} worker(s), {} task(s) queued", workers + 1, queued);
            }
        } else {
            state.deep_queue_ticks = 0;
        }

        if queued == 0 && workers > self.config.min_workers {
            let idle_timeout = self.config.idle_timeout;
            let retiree = state
                .workers
                .iter()
                .filter(|w| w.is_available())
                .find(|w| w.idle_for().is_some_and(|idle| idle > idle_timeout))
                .cloned();
            if let Some(worker) = retiree {
                worker.retire();
                self.reap_retired(&mut state);
                info!("Scaled down to {} worker(s)", state.workers.len());
            }
        }

        self.dispatch_locked(&mut state);
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.queue.is_empty() && state.in_flight == 0
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }
}

fn task_output(mut task: WorkerTask, reply: ResultMessage) -> TaskOutput {
    let completed_at = Utc::now();
    task.state = TaskState::Completed;
    task.completed_at = Some(completed_at);
    TaskOutput {
        task_id: task.id,
        task_type: task.task_type,
        result: reply.result.unwrap_or(Value::Null),
        duration_ms: reply.duration_ms,
        memory_delta_bytes: reply.memory_used,
        retry_count: task.retry_count,
        worker_id: reply.worker_id,
        completed_at,
    }
}

// == Coordinator ==
/// Periodic scheduling loop. Holds only a weak reference so dropping the last
/// pool handle ends it.
async fn coordinate(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    let Some(config) = pool.upgrade().map(|inner| inner.config.clone()) else {
        return;
    };

    let mut dispatch_tick = tokio::time::interval(config.dispatch_interval);
    let mut health_tick = tokio::time::interval(config.health_check_interval);
    let mut scale_tick = tokio::time::interval(config.scale_interval);
    for tick in [&mut dispatch_tick, &mut health_tick, &mut scale_tick] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    // The first tick of an interval fires immediately
    health_tick.reset();
    scale_tick.reset();

    loop {
        tokio::select! {
            event = events.recv() => {
                let (Some(event), Some(inner)) = (event, pool.upgrade()) else {
                    break;
                };
                inner.handle_event(event);
            }
            _ = dispatch_tick.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.dispatch();
            }
            _ = health_tick.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.check_health();
            }
            _ = scale_tick.tick() => {
                let Some(inner) = pool.upgrade() else { break };
                inner.autoscale();
            }
        }
    }
    debug!("pool coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            min_workers: workers,
            max_workers: workers,
            queue_size: 100,
            task_timeout: Duration::from_secs(5),
            max_retries: 0,
            backoff_base: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            dispatch_interval: Duration::from_millis(10),
            scale_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        }
    }

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |p| Ok(p.clone()));
        registry.register_fn("sleep", |p| {
            std::thread::sleep(Duration::from_millis(p.as_u64().unwrap_or(0)));
            Ok(json!("slept"))
        });
        registry
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let pool = WorkerPool::new(config(2), registry());

        let output = pool
            .submit("echo", json!({"file": "index.php"}), TaskOptions::default())
            .unwrap()
            .await
            .unwrap();

        assert_eq!(output.result, json!({"file": "index.php"}));
        assert_eq!(output.retry_count, 0);
        assert_eq!(output.task_type, "echo");
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_unknown_task_type_rejected() {
        let pool = WorkerPool::new(config(1), registry());
        let err = pool
            .submit("nope", Value::Null, TaskOptions::default())
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownTaskType("nope".into()));
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_task_ids_are_monotonic() {
        let pool = WorkerPool::new(config(1), registry());
        let a = pool.submit("echo", json!(1), TaskOptions::default()).unwrap();
        let b = pool.submit("echo", json!(2), TaskOptions::default()).unwrap();
        assert!(b.id() > a.id());
        a.await.unwrap();
        b.await.unwrap();
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_priority_order_with_one_worker() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = registry();
        let seen = Arc::clone(&order);
        registry.register_fn("record", move |p| {
            seen.lock().push(p.as_str().unwrap_or_default().to_string());
            Ok(Value::Null)
        });
        let pool = WorkerPool::new(config(1), registry);

        let blocker = pool.submit("sleep", json!(200), TaskOptions::default()).unwrap();
        let t1 = pool
            .submit("record", json!("T1"), TaskOptions::default().with_priority(1))
            .unwrap();
        let t2 = pool
            .submit("record", json!("T2"), TaskOptions::default().with_priority(5))
            .unwrap();
        let t3 = pool
            .submit("record", json!("T3"), TaskOptions::default().with_priority(5))
            .unwrap();

        blocker.await.unwrap();
        t1.await.unwrap();
        t2.await.unwrap();
        t3.await.unwrap();

        assert_eq!(*order.lock(), vec!["T2", "T3", "T1"]);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_three_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let counter = Arc::clone(&calls);
        registry.register_fn("always_fails", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("unterminated string literal")
        });
        let pool = WorkerPool::new(config(1), registry);

        let err = pool
            .submit("always_fails", Value::Null, TaskOptions::default().with_max_retries(2))
            .unwrap()
            .await
            .unwrap_err();

        match err {
            TaskError::Failed { attempts, cause, .. } => {
                assert_eq!(attempts, 3);
                assert!(cause.contains("unterminated string literal"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = pool.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_success_on_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let counter = Arc::clone(&calls);
        registry.register_fn("flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient");
            }
            Ok(json!("ok"))
        });
        let pool = WorkerPool::new(config(1), registry);

        let output = pool
            .submit("flaky", Value::Null, TaskOptions::default().with_max_retries(2))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(output.result, json!("ok"));
        assert_eq!(output.retry_count, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let pool = WorkerPool::new(
            PoolConfig {
                queue_size: 2,
                ..config(1)
            },
            registry(),
        );

        let blocker = pool.submit("sleep", json!(200), TaskOptions::default()).unwrap();
        let q1 = pool.submit("echo", json!(1), TaskOptions::default()).unwrap();
        let q2 = pool.submit("echo", json!(2), TaskOptions::default()).unwrap();

        let err = pool
            .submit("echo", json!(3), TaskOptions::default())
            .unwrap_err();
        assert_eq!(err, PoolError::QueueFull { capacity: 2 });
        assert_eq!(pool.stats().rejected, 1);

        blocker.await.unwrap();
        q1.await.unwrap();
        q2.await.unwrap();
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_timeout_against_slow_handler() {
        let pool = WorkerPool::new(config(1), registry());
        let started = std::time::Instant::now();

        let err = pool
            .submit(
                "sleep",
                json!(500),
                TaskOptions::default()
                    .with_timeout(Duration::from_millis(100))
                    .with_max_retries(0),
            )
            .unwrap()
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(
            err,
            TaskError::TimedOut {
                task_id: 1,
                attempts: 1,
                timeout_ms: 100
            }
        );
        assert_eq!(pool.stats().timed_out, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_panic_restarts_worker_and_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let counter = Arc::clone(&calls);
        registry.register_fn("crashy", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("segfault in extension");
            }
            Ok(json!("recovered"))
        });
        let pool = WorkerPool::new(config(1), registry);

        let output = pool
            .submit("crashy", Value::Null, TaskOptions::default().with_max_retries(1))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(output.result, json!("recovered"));
        assert_eq!(output.retry_count, 1);
        let workers = pool.worker_stats();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].restart_count, 1);
        assert_eq!(pool.stats().restarts, 1);
        pool.destroy().await;
    }

    fn health_config(workers: usize) -> PoolConfig {
        PoolConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(30),
            ..config(workers)
        }
    }

    #[tokio::test]
    async fn test_wedged_worker_restarted_by_health_check() {
        let pool = WorkerPool::new(health_config(1), registry());

        let err = pool
            .submit(
                "sleep",
                json!(800),
                TaskOptions::default()
                    .with_timeout(Duration::from_millis(100))
                    .with_max_retries(0),
            )
            .unwrap()
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Silent past its deadline plus the grace period
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pool.worker_stats()[0].restart_count >= 1);
        assert!(pool.stats().restarts >= 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_long_task_within_timeout_survives_health_check() {
        let pool = WorkerPool::new(health_config(1), registry());

        let output = pool
            .submit(
                "sleep",
                json!(400),
                TaskOptions::default()
                    .with_timeout(Duration::from_secs(5))
                    .with_max_retries(0),
            )
            .unwrap()
            .await
            .unwrap();

        assert_eq!(output.result, json!("slept"));
        assert_eq!(pool.stats().restarts, 0);
        assert_eq!(pool.worker_stats()[0].restart_count, 0);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_crashed_retiring_worker_is_not_replaced() {
        let registry = registry();
        registry.register_fn("crash_later", |_| {
            std::thread::sleep(Duration::from_millis(150));
            panic!("extension segfault");
        });
        let pool = WorkerPool::new(
            PoolConfig {
                min_workers: 1,
                max_workers: 2,
                ..config(1)
            },
            registry,
        );
        assert_eq!(pool.resize(2), 2);

        let first = pool.submit("crash_later", Value::Null, TaskOptions::default()).unwrap();
        let second = pool.submit("crash_later", Value::Null, TaskOptions::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().busy_workers, 2);

        // Both are busy, so one is marked and stays until its task ends
        assert_eq!(pool.resize(1), 1);
        assert_eq!(pool.stats().workers, 2);

        assert!(first.await.is_err());
        assert!(second.await.is_err());

        let stats = pool.stats();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.restarts, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_inverted_worker_bounds_are_normalised() {
        let pool = WorkerPool::new(
            PoolConfig {
                min_workers: 2,
                max_workers: 1,
                ..config(1)
            },
            registry(),
        );

        assert_eq!(pool.config().max_workers, 2);
        assert_eq!(pool.resize(1), 2);
        assert_eq!(pool.resize(8), 2);
        assert_eq!(pool.stats().workers, 2);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_resize_clamps_to_bounds() {
        let pool = WorkerPool::new(
            PoolConfig {
                min_workers: 1,
                max_workers: 3,
                ..config(1)
            },
            registry(),
        );

        assert_eq!(pool.resize(10), 3);
        assert_eq!(pool.stats().workers, 3);

        assert_eq!(pool.resize(0), 1);
        assert_eq!(pool.stats().workers, 1);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_autoscale_up_under_load() {
        let pool = WorkerPool::new(
            PoolConfig {
                min_workers: 1,
                max_workers: 3,
                scale_interval: Duration::from_millis(20),
                scale_up_queue_ratio: 1,
                scale_up_ticks: 2,
                ..config(1)
            },
            registry(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| pool.submit("sleep", json!(100), TaskOptions::default()).unwrap())
            .collect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.stats().workers > 1);

        for handle in handles {
            handle.await.unwrap();
        }
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_cancels_leftovers_and_rejects_new_work() {
        let pool = WorkerPool::new(
            PoolConfig {
                shutdown_timeout: Duration::from_millis(50),
                ..config(1)
            },
            registry(),
        );

        let running = pool.submit("sleep", json!(300), TaskOptions::default()).unwrap();
        let queued = pool.submit("echo", json!(1), TaskOptions::default()).unwrap();

        pool.destroy().await;

        assert!(matches!(running.await, Err(TaskError::Cancelled { .. })));
        assert!(matches!(queued.await, Err(TaskError::Cancelled { .. })));
        assert_eq!(
            pool.submit("echo", json!(1), TaskOptions::default()).unwrap_err(),
            PoolError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_destroy_waits_for_in_flight_work() {
        let pool = WorkerPool::new(config(1), registry());
        let handle = pool.submit("sleep", json!(100), TaskOptions::default()).unwrap();

        pool.destroy().await;

        assert_eq!(handle.await.unwrap().result, json!("slept"));
    }

    #[tokio::test]
    async fn test_batch_results_in_caller_order() {
        let registry = registry();
        registry.register_fn("fail", |_| anyhow::bail!("bad input"));
        let pool = WorkerPool::new(config(2), registry);

        let results = pool
            .submit_batch(vec![
                TaskSpec::new("echo", json!("a")),
                TaskSpec::new("fail", Value::Null),
                TaskSpec::new("missing", Value::Null),
                TaskSpec::new("echo", json!("b"))
                    .with_options(TaskOptions::default().with_priority(9)),
            ])
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().result, json!("a"));
        assert!(matches!(results[1], Err(TaskError::Failed { .. })));
        assert_eq!(
            results[2].as_ref().unwrap_err(),
            &TaskError::Rejected(PoolError::UnknownTaskType("missing".into()))
        );
        assert_eq!(results[3].as_ref().unwrap().result, json!("b"));
        pool.destroy().await;
    }
}
