//! API Handlers
//!
//! HTTP request handlers for the admin endpoints of the cache and worker pool.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::Value;

use crate::analysis::register_builtin_handlers;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::models::{
    BatchItem, BatchRequest, BatchResponse, CacheStatsResponse, ClearResponse, DeleteResponse,
    GetResponse, HealthResponse, ResizeRequest, ResizeResponse, SetRequest, SetResponse,
    SubmitTaskRequest,
};
use crate::pool::{HandlerRegistry, PoolStats, TaskOutput, WorkerPool, WorkerStats};

/// Application state shared across all handlers.
///
/// The cache synchronizes internally and the pool is a cheap clone of a
/// shared handle, so no outer lock is needed.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
    pub pool: WorkerPool,
}

impl AppState {
    pub fn new(cache: Arc<CacheManager>, pool: WorkerPool) -> Self {
        Self { cache, pool }
    }

    /// Creates a new AppState from configuration, with the built-in
    /// handlers registered.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry);
        let pool = WorkerPool::new(config.pool.clone(), registry);
        Self::new(cache, pool)
    }
}

// == Cache Handlers ==
/// Handler for PUT /cache
pub async fn set_cache_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(ApiError::InvalidRequest(error_msg));
    }

    let options = req.options();
    state.cache.set(req.key.as_str(), &req.value, options).await?;

    Ok(Json(SetResponse::new(req.key)))
}

/// Handler for GET /cache/:key
pub async fn get_cache_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    let value = state
        .cache
        .get::<Value>(&key)
        .await
        .ok_or_else(|| ApiError::NotFound(key.clone()))?;

    Ok(Json(GetResponse::new(key, value)))
}

/// Handler for DELETE /cache/:key
///
/// Dependents of the key are invalidated along with it.
pub async fn delete_cache_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if !state.cache.delete(&key).await {
        return Err(ApiError::NotFound(key));
    }
    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for DELETE /cache
pub async fn clear_cache_handler(State(state): State<AppState>) -> Json<ClearResponse> {
    state.cache.clear().await;
    Json(ClearResponse {
        message: "Cache cleared".to_string(),
    })
}

/// Handler for GET /cache/stats
pub async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse::new(
        state.cache.statistics(),
        state.cache.is_persistent(),
    ))
}

// == Task Handlers ==
/// Handler for POST /tasks
///
/// Waits for the task's terminal outcome.
pub async fn submit_task_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<TaskOutput>> {
    let options = req.options();
    let handle = state.pool.submit(&req.task_type, req.payload, options)?;
    Ok(Json(handle.await?))
}

/// Handler for POST /tasks/batch
///
/// Individual failures are reported per item; results keep request order.
pub async fn submit_batch_handler(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    if req.tasks.is_empty() {
        return Err(ApiError::InvalidRequest(
            "Batch must contain at least one task".to_string(),
        ));
    }

    let specs = req
        .tasks
        .into_iter()
        .map(SubmitTaskRequest::into_spec)
        .collect();
    let results = state
        .pool
        .submit_batch(specs)
        .await
        .into_iter()
        .map(BatchItem::from)
        .collect();

    Ok(Json(BatchResponse { results }))
}

// == Pool Handlers ==
/// Handler for GET /pool/stats
pub async fn pool_stats_handler(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.pool.stats())
}

/// Handler for GET /pool/workers
pub async fn worker_stats_handler(State(state): State<AppState>) -> Json<Vec<WorkerStats>> {
    Json(state.pool.worker_stats())
}

/// Handler for PUT /pool/size
pub async fn resize_pool_handler(
    State(state): State<AppState>,
    Json(req): Json<ResizeRequest>,
) -> Json<ResizeResponse> {
    Json(ResizeResponse {
        workers: state.pool.resize(req.workers),
    })
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
