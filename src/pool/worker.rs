//! Worker Wrapper Module
//!
//! Each worker is one OS thread fed over a crossbeam channel. The async side
//! ([`WorkerWrapper`]) hands it one task at a time, races the reply against
//! the task timeout and the worker's termination, and keeps per-worker
//! statistics. Threads report back through an event channel: a heartbeat
//! while idle and after each task, and a crash notice when a handler panics.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sysinfo::{Pid, System};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::ExecutionError;
use crate::pool::handler::HandlerRegistry;
use crate::pool::task::{TaskId, WorkerTask};

// == Wire Types ==
/// Sent to a worker thread to run one task.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Value,
    pub started_at: DateTime<Utc>,
}

/// A worker thread's answer to one [`TaskMessage`].
#[derive(Debug, Clone)]
pub struct ResultMessage {
    pub task_id: TaskId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Change in process memory across the task, in bytes
    pub memory_used: i64,
    pub worker_id: usize,
}

/// Process resource snapshot taken on the worker thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceStats {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMessage {
    pub worker_id: usize,
    /// Restart count of the thread that sent it; stale threads are ignored
    pub generation: u32,
    pub stats: ResourceStats,
}

/// Events flowing from workers to the pool coordinator.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Heartbeat(HeartbeatMessage),
    /// The worker finished a task and can take another
    Idle { worker_id: usize },
    /// A handler panicked and the thread exited
    Crashed {
        worker_id: usize,
        generation: u32,
        reason: String,
    },
    Terminated { worker_id: usize, generation: u32 },
}

enum Command {
    Run(TaskMessage, oneshot::Sender<ResultMessage>),
    Shutdown,
}

// == Resource Probe ==
struct ResourceProbe {
    system: System,
    pid: Option<Pid>,
}

impl ResourceProbe {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn snapshot(&mut self) -> ResourceStats {
        let Some(pid) = self.pid else {
            return ResourceStats::default();
        };
        if !self.system.refresh_process(pid) {
            return ResourceStats::default();
        }
        self.system
            .process(pid)
            .map(|p| ResourceStats {
                memory_bytes: p.memory(),
                cpu_percent: p.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

// == Worker Thread ==
struct ThreadContext {
    worker_id: usize,
    generation: u32,
    registry: HandlerRegistry,
    commands: Receiver<Command>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    heartbeat_interval: Duration,
}

impl ThreadContext {
    fn heartbeat(&self, stats: ResourceStats) {
        let _ = self.events.send(WorkerEvent::Heartbeat(HeartbeatMessage {
            worker_id: self.worker_id,
            generation: self.generation,
            stats,
        }));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn run_worker(ctx: ThreadContext) {
    let mut probe = ResourceProbe::new();
    ctx.heartbeat(probe.snapshot());

    loop {
        match ctx.commands.recv_timeout(ctx.heartbeat_interval) {
            Ok(Command::Run(msg, reply)) => {
                let before = probe.snapshot();
                let started = std::time::Instant::now();

                let outcome = match ctx.registry.get(&msg.task_type) {
                    Some(handler) => {
                        panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&msg.payload)))
                    }
                    None => Ok(Err(anyhow::anyhow!(
                        "no handler registered for task type '{}'",
                        msg.task_type
                    ))),
                };

                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        error!(worker_id = ctx.worker_id, task_id = msg.id, "handler panicked: {}", reason);
                        let _ = ctx.events.send(WorkerEvent::Crashed {
                            worker_id: ctx.worker_id,
                            generation: ctx.generation,
                            reason,
                        });
                        // Dropping `reply` unanswered tells the waiter the worker is gone
                        return;
                    }
                };

                let after = probe.snapshot();
                let (success, result, error) = match outcome {
                    Ok(value) => (true, Some(value), None),
                    Err(e) => (false, None, Some(format!("{e:#}"))),
                };
                let _ = reply.send(ResultMessage {
                    task_id: msg.id,
                    success,
                    result,
                    error,
                    duration_ms: started.elapsed().as_millis() as u64,
                    memory_used: after.memory_bytes as i64 - before.memory_bytes as i64,
                    worker_id: ctx.worker_id,
                });
                ctx.heartbeat(after);
            }
            Err(RecvTimeoutError::Timeout) => ctx.heartbeat(probe.snapshot()),
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!(worker_id = ctx.worker_id, "worker thread exiting");
}

// == Worker Stats ==
/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub restart_count: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_task_time_ms: f64,
    pub is_idle: bool,
    pub current_task: Option<TaskId>,
    pub last_heartbeat_ms_ago: u64,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug)]
struct WorkerState {
    tasks_completed: u64,
    tasks_failed: u64,
    average_task_time_ms: f64,
    current_task: Option<TaskId>,
    /// When the current attempt times out; kept while a timed-out attempt drains
    attempt_deadline: Option<Instant>,
    last_heartbeat: Instant,
    idle_since: Instant,
    resources: ResourceStats,
}

// == Worker Wrapper ==
/// Async handle to one worker thread.
#[derive(Debug)]
pub struct WorkerWrapper {
    id: usize,
    restart_count: u32,
    commands: Sender<Command>,
    destroyed: watch::Sender<bool>,
    busy: AtomicBool,
    retiring: AtomicBool,
    state: Mutex<WorkerState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Run(msg, _) => write!(f, "Run({})", msg.id),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl WorkerWrapper {
    // == Constructor ==
    /// Starts a worker thread.
    pub fn spawn(
        id: usize,
        restart_count: u32,
        registry: HandlerRegistry,
        events: mpsc::UnboundedSender<WorkerEvent>,
        heartbeat_interval: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = ThreadContext {
            worker_id: id,
            generation: restart_count,
            registry,
            commands: rx,
            events: events.clone(),
            heartbeat_interval,
        };
        thread::Builder::new()
            .name(format!("analysis-worker-{id}"))
            .spawn(move || run_worker(ctx))?;

        let now = Instant::now();
        let (destroyed, _) = watch::channel(false);
        debug!(worker_id = id, restart_count, "worker started");

        Ok(Arc::new(Self {
            id,
            restart_count,
            commands: tx,
            destroyed,
            busy: AtomicBool::new(false),
            retiring: AtomicBool::new(false),
            state: Mutex::new(WorkerState {
                tasks_completed: 0,
                tasks_failed: 0,
                average_task_time_ms: 0.0,
                current_task: None,
                attempt_deadline: None,
                last_heartbeat: now,
                idle_since: now,
                resources: ResourceStats::default(),
            }),
            events,
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Not destroyed, not retiring and not running a task.
    pub fn is_available(&self) -> bool {
        !self.is_destroyed()
            && !self.retiring.load(Ordering::SeqCst)
            && !self.busy.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Claims the worker for one task. Fails if it is busy or destroyed.
    pub fn try_reserve(&self) -> bool {
        !self.is_destroyed()
            && self
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Gives back a reservation that was never used.
    pub fn unreserve(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    /// Marks the worker to be removed once it is no longer busy.
    pub fn retire(&self) {
        self.retiring.store(true, Ordering::SeqCst);
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::SeqCst)
    }

    // == Execute Task ==
    /// Runs one attempt of `task` on this worker.
    ///
    /// The caller must hold a reservation from [`try_reserve`](Self::try_reserve).
    /// A handler error is still `Ok` with `success == false`. On timeout the
    /// thread keeps running; the worker stays busy until its late reply
    /// arrives, which is then discarded.
    pub async fn execute_task(
        self: &Arc<Self>,
        task: &WorkerTask,
    ) -> Result<ResultMessage, ExecutionError> {
        if self.is_destroyed() {
            return Err(ExecutionError::WorkerUnavailable(self.id));
        }

        let (reply_tx, mut reply_rx) = oneshot::channel();
        let msg = TaskMessage {
            id: task.id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            started_at: Utc::now(),
        };
        {
            let mut state = self.state.lock();
            state.current_task = Some(task.id);
            state.attempt_deadline = Some(Instant::now() + task.timeout);
        }

        if self.commands.send(Command::Run(msg, reply_tx)).is_err() {
            return Err(ExecutionError::WorkerCrashed {
                worker_id: self.id,
                reason: "worker thread has exited".to_string(),
            });
        }

        let mut destroyed = self.destroyed.subscribe();
        let outcome = tokio::select! {
            reply = &mut reply_rx => reply.map_err(|_| ExecutionError::WorkerCrashed {
                worker_id: self.id,
                reason: "worker thread exited mid-task".to_string(),
            }),
            _ = destroyed.wait_for(|d| *d) => Err(ExecutionError::WorkerCrashed {
                worker_id: self.id,
                reason: "worker terminated mid-task".to_string(),
            }),
            _ = tokio::time::sleep(task.timeout) => Err(ExecutionError::TimedOut {
                timeout_ms: task.timeout_ms(),
            }),
        };

        match &outcome {
            Ok(reply) => {
                self.record_outcome(reply.success, reply.duration_ms as f64);
                self.release();
            }
            Err(ExecutionError::TimedOut { timeout_ms }) => {
                self.record_outcome(false, *timeout_ms as f64);
                self.drain_late_reply(reply_rx);
            }
            Err(_) => {
                self.state.lock().tasks_failed += 1;
            }
        }
        outcome
    }

    /// Keeps the worker busy until the timed-out attempt actually finishes.
    fn drain_late_reply(self: &Arc<Self>, reply_rx: oneshot::Receiver<ResultMessage>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let mut destroyed = worker.destroyed.subscribe();
            tokio::select! {
                late = reply_rx => {
                    if let Ok(late) = late {
                        debug!(worker_id = worker.id, task_id = late.task_id, "discarding late result");
                        worker.release();
                    }
                }
                _ = destroyed.wait_for(|d| *d) => {}
            }
        });
    }

    fn record_outcome(&self, success: bool, duration_ms: f64) {
        let mut state = self.state.lock();
        if success {
            state.tasks_completed += 1;
        } else {
            state.tasks_failed += 1;
        }
        let n = (state.tasks_completed + state.tasks_failed) as f64;
        state.average_task_time_ms += (duration_ms - state.average_task_time_ms) / n;
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.current_task = None;
            state.attempt_deadline = None;
            // A reply proves the thread is alive
            state.last_heartbeat = now;
            state.idle_since = now;
        }
        self.busy.store(false, Ordering::SeqCst);
        let _ = self.events.send(WorkerEvent::Idle { worker_id: self.id });
    }

    // == Terminate ==
    /// Stops the worker. Idempotent; wakes any attempt waiting on it.
    pub fn terminate(&self) {
        if self.destroyed.send_replace(true) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.events.send(WorkerEvent::Terminated {
            worker_id: self.id,
            generation: self.restart_count,
        });
        debug!(worker_id = self.id, "worker terminated");
    }

    // == Health ==
    pub fn record_heartbeat(&self, resources: ResourceStats) {
        let mut state = self.state.lock();
        state.last_heartbeat = Instant::now();
        state.resources = resources;
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.state.lock().last_heartbeat.elapsed()
    }

    /// True when no heartbeat arrived for `grace` and any running attempt is
    /// more than `grace` past its deadline. Threads do not heartbeat while a
    /// handler runs, so a long task inside its timeout is not a wedge.
    pub fn is_unresponsive(&self, grace: Duration) -> bool {
        let state = self.state.lock();
        if state.last_heartbeat.elapsed() <= grace {
            return false;
        }
        match state.attempt_deadline {
            Some(deadline) => Instant::now() > deadline + grace,
            None => true,
        }
    }

    /// Time spent idle, or `None` while busy.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.is_busy() {
            return None;
        }
        Some(self.state.lock().idle_since.elapsed())
    }

    pub fn stats(&self) -> WorkerStats {
        let state = self.state.lock();
        WorkerStats {
            id: self.id,
            restart_count: self.restart_count,
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            average_task_time_ms: state.average_task_time_ms,
            is_idle: !self.is_busy(),
            current_task: state.current_task,
            last_heartbeat_ms_ago: state.last_heartbeat.elapsed().as_millis() as u64,
            memory_bytes: state.resources.memory_bytes,
            cpu_percent: state.resources.cpu_percent,
        }
    }
}

impl Drop for WorkerWrapper {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |p| Ok(p.clone()));
        registry.register_fn("fail", |_| Err(anyhow::anyhow!("rule engine exploded")));
        registry.register_fn("sleep", |p| {
            std::thread::sleep(Duration::from_millis(p.as_u64().unwrap_or(0)));
            Ok(Value::Null)
        });
        registry.register_fn("panic", |_| panic!("parser bug"));
        registry
    }

    fn task(id: TaskId, task_type: &str, payload: Value, timeout_ms: u64) -> WorkerTask {
        WorkerTask::new(id, task_type, payload, 0, Duration::from_millis(timeout_ms), 0)
    }

    fn spawn_worker() -> (Arc<WorkerWrapper>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = WorkerWrapper::spawn(0, 0, registry(), tx, Duration::from_millis(20)).unwrap();
        (worker, rx)
    }

    #[tokio::test]
    async fn test_execute_success() {
        let (worker, _events) = spawn_worker();
        assert!(worker.try_reserve());

        let reply = worker
            .execute_task(&task(1, "echo", json!({"file": "a.php"}), 1_000))
            .await
            .unwrap();

        assert!(reply.success);
        assert_eq!(reply.result, Some(json!({"file": "a.php"})));
        assert!(worker.is_available());
        assert_eq!(worker.stats().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_unsuccessful_reply() {
        let (worker, _events) = spawn_worker();
        assert!(worker.try_reserve());

        let reply = worker
            .execute_task(&task(1, "fail", Value::Null, 1_000))
            .await
            .unwrap();

        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("rule engine exploded"));
        assert_eq!(worker.stats().tasks_failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_worker_busy_until_late_reply() {
        let (worker, _events) = spawn_worker();
        assert!(worker.try_reserve());

        let err = worker
            .execute_task(&task(1, "sleep", json!(200), 50))
            .await
            .unwrap_err();

        assert_eq!(err, ExecutionError::TimedOut { timeout_ms: 50 });
        assert!(!worker.is_available());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(worker.is_available());
    }

    #[tokio::test]
    async fn test_panic_reports_crash() {
        let (worker, mut events) = spawn_worker();
        assert!(worker.try_reserve());

        let err = worker
            .execute_task(&task(1, "panic", Value::Null, 1_000))
            .await
            .unwrap_err();
        assert!(err.is_infrastructure());

        let crashed = loop {
            match events.recv().await {
                Some(WorkerEvent::Crashed { reason, .. }) => break reason,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };
        assert!(crashed.contains("parser bug"));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_rejects_work() {
        let (worker, mut events) = spawn_worker();
        worker.terminate();
        worker.terminate();

        assert!(!worker.is_available());
        assert!(!worker.try_reserve());
        let err = worker
            .execute_task(&task(1, "echo", Value::Null, 1_000))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::WorkerUnavailable(0));

        let mut terminated = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkerEvent::Terminated { .. }) {
                terminated += 1;
            }
        }
        assert_eq!(terminated, 1);
    }

    #[tokio::test]
    async fn test_terminate_wakes_waiting_attempt() {
        let (worker, _events) = spawn_worker();
        assert!(worker.try_reserve());

        let running = Arc::clone(&worker);
        let attempt = tokio::spawn(async move {
            running
                .execute_task(&task(1, "sleep", json!(300), 5_000))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.terminate();

        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::WorkerCrashed { .. }));
    }

    #[tokio::test]
    async fn test_idle_worker_heartbeats() {
        let (worker, mut events) = spawn_worker();

        let mut heartbeats = 0;
        while heartbeats < 2 {
            if let Some(WorkerEvent::Heartbeat(hb)) = events.recv().await {
                assert_eq!(hb.worker_id, 0);
                worker.record_heartbeat(hb.stats);
                heartbeats += 1;
            }
        }
        assert!(worker.heartbeat_age() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unresponsive_only_past_attempt_deadline() {
        let (worker, _events) = spawn_worker();
        let grace = Duration::from_millis(50);

        // Heartbeats are never recorded here, so the idle worker goes silent
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(worker.is_unresponsive(grace));
        worker.record_heartbeat(ResourceStats::default());
        assert!(!worker.is_unresponsive(grace));

        assert!(worker.try_reserve());
        let running = Arc::clone(&worker);
        let attempt = tokio::spawn(async move {
            running
                .execute_task(&task(1, "sleep", json!(250), 5_000))
                .await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!worker.is_unresponsive(grace));

        assert!(attempt.await.unwrap().unwrap().success);
        assert!(!worker.is_unresponsive(grace));
    }
}
