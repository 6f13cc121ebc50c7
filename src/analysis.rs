//! Analysis Helpers
//!
//! Glue between analyzers, the cache and the pool: content-addressed cache
//! keys, memoized task submission, and the built-in source handlers served by
//! the daemon.

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::{codec, CacheManager, SetOptions};
use crate::error::TaskError;
use crate::pool::{HandlerRegistry, TaskHandler, TaskOptions, WorkerPool};

/// Task type of [`SourceDigest`].
pub const SOURCE_DIGEST: &str = "source.digest";
/// Task type of [`PhpTagCount`].
pub const SOURCE_PHP_TAGS: &str = "source.php_tags";

/// Cache key for the result of `task_type` over `source`.
pub fn content_key(task_type: &str, source: &str) -> String {
    format!("{task_type}:{}", codec::checksum(source.as_bytes()))
}

/// Result of [`submit_memoized`].
#[derive(Debug, Clone, PartialEq)]
pub struct Memoized {
    pub value: Value,
    /// True when served from the cache without running the task
    pub cached: bool,
}

// == Memoized Submission ==
/// Returns the cached result under `key`, or runs the task on the pool and
/// caches a successful result under `key`.
///
/// Failed tasks are not cached. A rejected cache write is logged and the
/// fresh result is still returned.
pub async fn submit_memoized(
    cache: &CacheManager,
    pool: &WorkerPool,
    key: &str,
    task_type: &str,
    payload: Value,
    options: TaskOptions,
) -> Result<Memoized, TaskError> {
    if let Some(value) = cache.get::<Value>(key).await {
        debug!("memoized result for {}", key);
        return Ok(Memoized {
            value,
            cached: true,
        });
    }

    let output = pool.submit(task_type, payload, options)?.await?;
    if let Err(e) = cache.set(key, &output.result, SetOptions::default()).await {
        warn!("could not cache result for {}: {}", key, e);
    }

    Ok(Memoized {
        value: output.result,
        cached: false,
    })
}

// == Built-in Handlers ==
/// Accepts either a bare string or `{"source": "..."}`.
fn source_of(payload: &Value) -> anyhow::Result<&str> {
    if let Some(source) = payload.as_str() {
        return Ok(source);
    }
    match payload.get("source") {
        Some(source) => source.as_str().context("'source' must be a string"),
        None => bail!("payload must be a string or an object with a 'source' field"),
    }
}

/// SHA-256 plus byte and line counts of a source file.
pub struct SourceDigest;

impl TaskHandler for SourceDigest {
    fn handle(&self, payload: &Value) -> anyhow::Result<Value> {
        let source = source_of(payload)?;
        Ok(json!({
            "sha256": codec::checksum(source.as_bytes()),
            "bytes": source.len(),
            "lines": source.lines().count(),
        }))
    }
}

/// Counts PHP open and close tags.
pub struct PhpTagCount;

impl TaskHandler for PhpTagCount {
    fn handle(&self, payload: &Value) -> anyhow::Result<Value> {
        let source = source_of(payload)?;
        let lower = source.to_ascii_lowercase();
        Ok(json!({
            "open_tags": lower.matches("<?php").count(),
            "close_tags": source.matches("?>").count(),
            "lines": source.lines().count(),
        }))
    }
}

/// Registers every built-in handler.
pub fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry.register(SOURCE_DIGEST, SourceDigest);
    registry.register(SOURCE_PHP_TAGS, PhpTagCount);
}
