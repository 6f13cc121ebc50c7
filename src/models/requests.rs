//! Request DTOs for the admin API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::SetOptions;
use crate::pool::{TaskOptions, TaskSpec};

/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 512;

/// Request body for storing a value (PUT /cache)
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    /// Any JSON value
    pub value: Value,
    /// Optional TTL in milliseconds (uses default if not specified)
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Keys this value is derived from
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Compress regardless of size
    #[serde(default)]
    pub compress: bool,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.key.is_empty() {
            return Some("Key cannot be empty".to_string());
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Some(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            ));
        }
        if self.dependencies.iter().any(|d| d.is_empty()) {
            return Some("Dependency keys cannot be empty".to_string());
        }
        None
    }

    pub fn options(&self) -> SetOptions {
        SetOptions {
            ttl: self.ttl_ms.map(Duration::from_millis),
            dependencies: self.dependencies.clone(),
            force_compression: self.compress,
        }
    }
}

/// Request body for submitting a task (POST /tasks, and each item of a batch)
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitTaskRequest {
    pub fn options(&self) -> TaskOptions {
        TaskOptions {
            priority: self.priority,
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_retries: self.max_retries,
        }
    }

    pub fn into_spec(self) -> TaskSpec {
        let options = self.options();
        TaskSpec::new(self.task_type, self.payload).with_options(options)
    }
}

/// Request body for POST /tasks/batch
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub tasks: Vec<SubmitTaskRequest>,
}

/// Request body for PUT /pool/size
#[derive(Debug, Clone, Deserialize)]
pub struct ResizeRequest {
    pub workers: usize,
}
