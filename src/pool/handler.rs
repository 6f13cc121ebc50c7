//! Task handlers and the registry the worker threads resolve them from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Executes one task type. Runs on a worker thread, so it may block.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, payload: &Value) -> anyhow::Result<Value>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn handle(&self, payload: &Value) -> anyhow::Result<Value> {
        self(payload)
    }
}

// == Handler Registry ==
/// Shared map from task type to handler. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`, replacing any previous handler.
    pub fn register<H: TaskHandler>(&self, task_type: impl Into<String>, handler: H) {
        self.handlers
            .write()
            .insert(task_type.into(), Arc::new(handler));
    }

    /// Registers a closure as the handler for `task_type`.
    pub fn register_fn<F>(&self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(task_type, handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
