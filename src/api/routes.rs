//! API Routes
//!
//! Configures the Axum router with all admin endpoints.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    cache_stats_handler, clear_cache_handler, delete_cache_handler, get_cache_handler,
    health_handler, pool_stats_handler, resize_pool_handler, set_cache_handler,
    submit_batch_handler, submit_task_handler, worker_stats_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check
/// - `PUT /cache` - Store a JSON value
/// - `DELETE /cache` - Clear both cache tiers
/// - `GET /cache/stats` - Cache statistics
/// - `GET /cache/:key` - Retrieve a value
/// - `DELETE /cache/:key` - Delete a key and its dependents
/// - `POST /tasks` - Run a task and wait for its result
/// - `POST /tasks/batch` - Run several tasks concurrently
/// - `GET /pool/stats` - Pool statistics
/// - `GET /pool/workers` - Per-worker statistics
/// - `PUT /pool/size` - Resize the pool
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/cache", put(set_cache_handler).delete(clear_cache_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route(
            "/cache/:key",
            get(get_cache_handler).delete(delete_cache_handler),
        )
        .route("/tasks", post(submit_task_handler))
        .route("/tasks/batch", post(submit_batch_handler))
        .route("/pool/stats", get(pool_stats_handler))
        .route("/pool/workers", get(worker_stats_handler))
        .route("/pool/size", put(resize_pool_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::register_builtin_handlers;
    use crate::cache::CacheManager;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::pool::{HandlerRegistry, WorkerPool};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry);
        let state = AppState::new(
            Arc::new(CacheManager::new(CacheConfig::default())),
            WorkerPool::new(PoolConfig::default(), registry),
        );
        create_router(state)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_stats_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/cache/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_set_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/cache")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"key":"test","value":{"a":1}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/cache/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pool_stats_endpoint() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/pool/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_bad_request() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"task_type":"php.unknown"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
