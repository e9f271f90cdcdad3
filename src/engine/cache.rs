//! Query-scoped hydration cache with a singleflight guarantee.
//!
//! Multiple columns (and multiple rows, for shared lookups) may depend on
//! the same underlying API call. The cache keys each potential call by
//! (table, function, scope, item) and guarantees at most one concurrent
//! execution per key; concurrent callers block on the first caller's result
//! and a compute error is shared with every waiter. The cache lives and dies
//! with one query execution, so resource state never goes stale across
//! queries.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::gcp::error::ApiError;

/// Identity of one potential API invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub table: String,
    pub func: String,
    pub scope: String,
    pub item: String,
}

type CachedResult = Result<Value, Arc<ApiError>>;

#[derive(Default)]
pub struct HydrationCache {
    entries: Mutex<HashMap<CallKey, Arc<OnceCell<CachedResult>>>>,
}

impl HydrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached result for `key`, computing it via `compute` if
    /// absent. Under concurrent access, exactly one caller runs `compute`;
    /// the rest await its outcome.
    pub async fn get_or_compute<F, Fut>(&self, key: CallKey, compute: F) -> CachedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().expect("hydration cache lock poisoned");
            entries.entry(key.clone()).or_default().clone()
        };

        if let Some(cached) = cell.get() {
            tracing::debug!(
                "hydration cache hit: {}/{} [{}]",
                key.table,
                key.func,
                key.scope
            );
            return cached.clone();
        }

        cell.get_or_init(|| async {
            tracing::debug!(
                "hydration cache miss: {}/{} [{}]",
                key.table,
                key.func,
                key.scope
            );
            compute().await.map_err(Arc::new)
        })
        .await
        .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("hydration cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(item: &str) -> CallKey {
        CallKey {
            table: "t".into(),
            func: "detail".into(),
            scope: "proj-a".into(),
            item: item.into(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let cache = Arc::new(HydrationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("item-1"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the in-flight slot long enough for every caller
                        // to pile up behind it.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(json!({"cpus": 4}))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result, json!({"cpus": 4}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_compute_independently() {
        let cache = HydrationCache::new();
        let calls = AtomicUsize::new(0);

        for item in ["a", "b", "a"] {
            let _ = cache
                .get_or_compute(key(item), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(item))
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_is_shared_with_waiters() {
        let cache = Arc::new(HydrationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(key("item-1"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(ApiError::NotFound("no such machine type".into()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(*err, ApiError::NotFound(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
