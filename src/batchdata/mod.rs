//! Single-flight shared context for a batch of rule evaluations.
//!
//! When many rules in one batch need the same upstream data (a customer
//! record, a pricing table snapshot) the runtime fetches it once per
//! `(batch_id, key)` pair and lets every concurrent evaluator await the
//! same in-flight future. Grounded on the teacher's
//! `enterprise::cache::lock` and `invalidation` modules' use of
//! `DashMap` keyed state machines, substituting `tokio::sync::OnceCell`
//! for the actual single-flight coordination since the teacher's
//! distributed lock machinery assumes a remote backend this crate does
//! not have.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Batch data provider failures.
#[derive(Debug, Error, Clone)]
pub enum BatchDataError {
    /// The fetcher failed to produce the value for a key.
    #[error("failed to fetch {key} for batch {batch_id}: {message}")]
    FetchFailed {
        /// The batch the key belongs to.
        batch_id: String,
        /// The key that failed to resolve.
        key: String,
        /// Fetcher-provided error description.
        message: String,
    },
}

/// Result type for the batch data subsystem.
pub type Result<T> = std::result::Result<T, BatchDataError>;

/// Shared context resolved once per batch and handed to every rule
/// evaluated within it. `data` accumulates every key this batch has
/// resolved so far, so later fetches can reference earlier ones.
#[derive(Debug, Clone, Default)]
pub struct BatchDataContext {
    /// Identifier shared by every rule evaluation in this batch.
    pub batch_id: String,
    /// Arbitrary keyed data resolved for the batch so far.
    pub data: HashMap<String, Value>,
}

impl BatchDataContext {
    /// Build an empty context for `batch_id`.
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            data: HashMap::new(),
        }
    }
}

type Cell = Arc<tokio::sync::OnceCell<Arc<Value>>>;

/// Caches in-flight and completed per-`(batch_id, key)` fetches so
/// concurrent callers for the same key within the same batch share one
/// upstream call. Unlike a fetcher bound at construction, the fetching
/// closure is supplied per call, since different keys within the same
/// batch typically resolve from different upstream sources.
pub struct BatchDataProvider {
    cells: DashMap<(String, String), Cell>,
}

impl Default for BatchDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchDataProvider {
    /// Build an empty provider.
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// Clear any prior state tracked for `batch_id` (or a freshly
    /// generated one, if `batch_id` is `None`) and return the id to use
    /// for the batch about to run.
    pub fn initialize_batch(&self, batch_id: Option<String>) -> String {
        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.cells.retain(|(id, _), _| id != &batch_id);
        batch_id
    }

    /// Resolve `key` within `batch_id`, invoking `fetcher` at most once
    /// for that pair. Every concurrent caller for the same `(batch_id,
    /// key)` awaits the same underlying fetch; a failed fetch is not
    /// cached, so a later call retries.
    #[instrument(skip(self, fetcher), fields(component = "batchdata", batch_id, key))]
    pub async fn fetch_data<F, Fut>(
        &self,
        batch_id: &str,
        key: &str,
        fetcher: F,
    ) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, String>>,
    {
        let cache_key = (batch_id.to_string(), key.to_string());
        let cell = self
            .cells
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::OnceCell::new()))
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                fetcher()
                    .await
                    .map(Arc::new)
                    .map_err(|message| BatchDataError::FetchFailed {
                        batch_id: batch_id.to_string(),
                        key: key.to_string(),
                        message,
                    })
            })
            .await
            .cloned();

        if result.is_err() {
            // Don't let a transient failure permanently poison the slot.
            self.cells.remove(&cache_key);
        }

        result
    }

    /// Drop every cached entry for a batch once it's no longer needed.
    pub fn release(&self, batch_id: &str) {
        self.cells.retain(|(id, _), _| id != batch_id);
    }

    /// Number of `(batch_id, key)` pairs currently tracked (in-flight or
    /// resolved).
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no entries are currently tracked.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch_per_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(BatchDataProvider::new());

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<Value, String>(json!({"value": 1}))
        };

        let (a, b, c) = tokio::join!(
            provider.fetch_data("batch-1", "customer", {
                let calls = calls.clone();
                || fetch(calls)
            }),
            provider.fetch_data("batch-1", "customer", {
                let calls = calls.clone();
                || fetch(calls)
            }),
            provider.fetch_data("batch-1", "customer", {
                let calls = calls.clone();
                || fetch(calls)
            }),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_in_the_same_batch_fetch_independently() {
        let provider = BatchDataProvider::new();

        let a = provider
            .fetch_data("batch-1", "customer", || async { Ok(json!(1)) })
            .await
            .unwrap();
        let b = provider
            .fetch_data("batch-1", "pricing", || async { Ok(json!(2)) })
            .await
            .unwrap();

        assert_eq!(*a, json!(1));
        assert_eq!(*b, json!(2));
        assert_eq!(provider.len(), 2);
    }

    #[tokio::test]
    async fn same_key_in_different_batches_fetches_independently() {
        let provider = BatchDataProvider::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for batch_id in ["batch-a", "batch-b"] {
            let calls = calls.clone();
            provider
                .fetch_data(batch_id, "customer", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = BatchDataProvider::new();

        for _ in 0..2 {
            let calls = calls.clone();
            let err = provider
                .fetch_data("batch-2", "customer", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("upstream down".to_string())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, BatchDataError::FetchFailed { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_drops_every_key_for_the_batch() {
        let provider = BatchDataProvider::new();
        provider
            .fetch_data("batch-3", "a", || async { Ok(json!(1)) })
            .await
            .unwrap();
        provider
            .fetch_data("batch-3", "b", || async { Ok(json!(2)) })
            .await
            .unwrap();

        assert_eq!(provider.len(), 2);
        provider.release("batch-3");
        assert!(provider.is_empty());
    }

    #[test]
    fn initialize_batch_generates_an_id_when_none_given() {
        let provider = BatchDataProvider::new();
        let a = provider.initialize_batch(None);
        let b = provider.initialize_batch(None);
        assert_ne!(a, b);
    }
}
