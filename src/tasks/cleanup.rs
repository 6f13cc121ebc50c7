//! TTL Cleanup Task
//!
//! Background task that periodically sweeps expired entries out of both
//! cache tiers and trims the persistent tier to its byte budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheManager;

/// Spawns a background task that periodically cleans up expired cache entries.
///
/// The first sweep runs one `interval` after spawning. Abort the returned
/// handle during shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(CacheManager::new(CacheConfig::default()));
/// let cleanup_handle = spawn_cleanup_task(cache.clone(), Duration::from_secs(60));
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(cache: Arc<CacheManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting TTL cleanup task with interval of {}ms",
            interval.as_millis()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = cache.cleanup_expired().await;

            if removed > 0 {
                info!("TTL cleanup: removed {} expired entries", removed);
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SetOptions;
    use crate::config::CacheConfig;

    fn cache() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(CacheConfig::default()))
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_entries() {
        let cache = cache();
        cache
            .set(
                "expire_soon",
                "value",
                SetOptions::with_ttl(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let handle = spawn_cleanup_task(cache.clone(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Removed by the sweep, not by a lazy read
        assert_eq!(cache.len(), 0, "Expired entry should have been cleaned up");
        assert_eq!(cache.statistics().expirations, 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_preserves_valid_entries() {
        let cache = cache();
        cache
            .set(
                "long_lived",
                "value",
                SetOptions::with_ttl(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        let handle = spawn_cleanup_task(cache.clone(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(200)).await;

        let value: Option<String> = cache.get("long_lived").await;
        assert_eq!(value.as_deref(), Some("value"), "Valid entry should not be removed");

        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_can_be_aborted() {
        let handle = spawn_cleanup_task(cache(), Duration::from_secs(1));

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
