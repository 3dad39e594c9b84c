//! Request coalescing for the remote registry client.
//!
//! Individual callers ask for one rule artifact at a time; this batches
//! those asks into a single registry round trip, flushing whichever
//! comes first of `max_batch_size` pending keys, `max_wait_time`
//! elapsed, or an explicit [`RequestBatcher::flush`] call. The shape — a
//! channel feeding a background task, a timer racing the queue depth —
//! follows the teacher's job queue in `scheduling::queue`, adapted from
//! "drain a priority queue" to "drain a coalescing window." Priority
//! orders which keys are handed to the fetcher first within one flushed
//! batch; it makes no promise about ordering across batch boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::instrument;

use crate::config::BatcherConfig;

/// Request batcher failures.
#[derive(Debug, Error)]
pub enum BatcherError {
    /// The batcher's background task has shut down; no more requests can
    /// be enqueued.
    #[error("batcher is closed")]
    Closed,

    /// The fetcher reported an error for this specific key.
    #[error("fetch failed for key: {0}")]
    FetchFailed(String),

    /// The caller's reply channel was dropped before a result arrived
    /// (the caller gave up waiting).
    #[error("caller dropped before batch completed")]
    CallerDropped,
}

/// Result type for the request batcher.
pub type Result<T> = std::result::Result<T, BatcherError>;

/// The outcome of dispatching one flushed batch: hits, and per-key
/// failures. A key absent from both maps is treated as "not found,"
/// distinct from a fetch error.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Keys the fetcher successfully resolved.
    pub results: HashMap<String, Vec<u8>>,
    /// Keys the fetcher tried and failed to resolve, with a reason.
    pub errors: HashMap<String, String>,
}

/// Fetches a batch of rule artifacts in one round trip. Implemented by
/// the remote loader's registry client; kept as a trait so the batcher
/// can be tested without an HTTP server. A single key's failure does not
/// fail the whole batch — callers for other keys in the same batch still
/// get their results.
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    /// Fetch every key in `keys`, returning per-key results and errors.
    async fn fetch_batch(&self, keys: Vec<String>) -> BatchOutcome;
}

struct PendingRequest {
    key: String,
    priority: i32,
    reply: oneshot::Sender<std::result::Result<Option<Vec<u8>>, BatcherError>>,
}

enum Message {
    Request(PendingRequest),
    Flush,
}

/// Coalesces single-key fetches into batched registry requests.
pub struct RequestBatcher {
    sender: mpsc::UnboundedSender<Message>,
}

impl RequestBatcher {
    /// Spawn the background coalescing task. `fetcher` is invoked once
    /// per flushed batch, never more than `config.max_concurrent_batches`
    /// batches concurrently.
    pub fn spawn(config: BatcherConfig, fetcher: Arc<dyn BatchFetcher>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));

        tokio::spawn(async move {
            let mut pending: Vec<PendingRequest> = Vec::with_capacity(config.max_batch_size);

            loop {
                let flush_deadline = tokio::time::sleep(config.max_wait_time);
                tokio::pin!(flush_deadline);

                let mut should_flush = false;
                tokio::select! {
                    maybe_msg = receiver.recv() => {
                        match maybe_msg {
                            Some(Message::Request(req)) => {
                                pending.push(req);
                                if pending.len() >= config.max_batch_size {
                                    should_flush = true;
                                }
                            }
                            Some(Message::Flush) => {
                                should_flush = !pending.is_empty();
                            }
                            None => {
                                should_flush = !pending.is_empty();
                                if pending.is_empty() {
                                    break;
                                }
                            }
                        }
                    }
                    _ = &mut flush_deadline, if !pending.is_empty() => {
                        should_flush = true;
                    }
                }

                if should_flush && !pending.is_empty() {
                    pending.sort_by_key(|r| r.priority);
                    let batch = std::mem::replace(&mut pending, Vec::with_capacity(config.max_batch_size));
                    let fetcher = Arc::clone(&fetcher);
                    let permit = Arc::clone(&semaphore);
                    tokio::spawn(async move {
                        let _permit = permit.acquire_owned().await;
                        dispatch_batch(fetcher, batch).await;
                    });
                }
            }
        });

        Self { sender }
    }

    /// Enqueue a single key and await its result once the owning batch is
    /// dispatched and resolved. Lower `priority` values are placed
    /// earlier in whatever batch they end up flushed with.
    #[instrument(skip(self), fields(component = "batcher"))]
    pub async fn get(&self, key: impl Into<String>, priority: i32) -> Result<Option<Vec<u8>>> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Message::Request(PendingRequest {
                key: key.into(),
                priority,
                reply,
            }))
            .map_err(|_| BatcherError::Closed)?;

        receiver.await.map_err(|_| BatcherError::CallerDropped)?
    }

    /// Force an immediate dispatch of whatever is currently pending,
    /// regardless of batch size or elapsed wait time. A no-op if nothing
    /// is pending.
    pub fn flush(&self) -> Result<()> {
        self.sender.send(Message::Flush).map_err(|_| BatcherError::Closed)
    }
}

async fn dispatch_batch(fetcher: Arc<dyn BatchFetcher>, batch: Vec<PendingRequest>) {
    let keys: Vec<String> = batch.iter().map(|r| r.key.clone()).collect();
    let mut outcome = fetcher.fetch_batch(keys).await;

    for req in batch {
        let reply = if let Some(bytes) = outcome.results.remove(&req.key) {
            Ok(Some(bytes))
        } else if let Some(message) = outcome.errors.remove(&req.key) {
            Err(BatcherError::FetchFailed(message))
        } else {
            Ok(None)
        };
        let _ = req.reply.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BatchFetcher for CountingFetcher {
        async fn fetch_batch(&self, keys: Vec<String>) -> BatchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            BatchOutcome {
                results: keys.into_iter().map(|k| (k.clone(), k.into_bytes())).collect(),
                errors: HashMap::new(),
            }
        }
    }

    fn test_config() -> BatcherConfig {
        BatcherConfig {
            max_batch_size: 3,
            max_wait_time: Duration::from_millis(50),
            max_concurrent_batches: 2,
            enable_auto_batching: true,
        }
    }

    #[tokio::test]
    async fn flushes_on_batch_size() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher { calls: calls.clone() });
        let batcher = RequestBatcher::spawn(test_config(), fetcher);

        let (a, b, c) = tokio::join!(
            batcher.get("a", 0),
            batcher.get("b", 0),
            batcher.get("c", 0),
        );

        assert_eq!(a.unwrap(), Some(b"a".to_vec()));
        assert_eq!(b.unwrap(), Some(b"b".to_vec()));
        assert_eq!(c.unwrap(), Some(b"c".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flushes_on_timeout_with_partial_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher { calls: calls.clone() });
        let batcher = RequestBatcher::spawn(test_config(), fetcher);

        let result = batcher.get("solo", 0).await.unwrap();
        assert_eq!(result, Some(b"solo".to_vec()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_resolves_to_none() {
        struct EmptyFetcher;
        #[async_trait]
        impl BatchFetcher for EmptyFetcher {
            async fn fetch_batch(&self, _keys: Vec<String>) -> BatchOutcome {
                BatchOutcome::default()
            }
        }

        let batcher = RequestBatcher::spawn(test_config(), Arc::new(EmptyFetcher));
        let result = batcher.get("ghost", 0).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn one_key_failing_does_not_fail_the_rest_of_the_batch() {
        struct PartialFetcher;
        #[async_trait]
        impl BatchFetcher for PartialFetcher {
            async fn fetch_batch(&self, keys: Vec<String>) -> BatchOutcome {
                let mut outcome = BatchOutcome::default();
                for key in keys {
                    if key == "bad" {
                        outcome.errors.insert(key, "upstream rejected".to_string());
                    } else {
                        outcome.results.insert(key.clone(), key.into_bytes());
                    }
                }
                outcome
            }
        }

        let batcher = RequestBatcher::spawn(test_config(), Arc::new(PartialFetcher));
        let (good, bad) = tokio::join!(batcher.get("good", 0), batcher.get("bad", 0));

        assert_eq!(good.unwrap(), Some(b"good".to_vec()));
        assert!(matches!(bad.unwrap_err(), BatcherError::FetchFailed(_)));
    }

    #[tokio::test]
    async fn flush_dispatches_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(CountingFetcher { calls: calls.clone() });
        let mut config = test_config();
        config.max_wait_time = Duration::from_secs(30);
        let batcher = RequestBatcher::spawn(config, fetcher);

        let pending = batcher.get("solo", 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        batcher.flush().unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .expect("flush should dispatch without waiting for max_wait_time")
            .unwrap();
        assert_eq!(result, Some(b"solo".to_vec()));
    }
}
