//! Bounded HTTP connection pool for the remote rule registry.
//!
//! The teacher's `database::connection_pool` hands out `sqlx` connections
//! gated by a `Semaphore`, tracks exponential-moving-average latency, and
//! runs a background health-check task. This module keeps that shape but
//! swaps the connection type: `reqwest::Client` already pools TCP/TLS
//! connections internally, so the `Semaphore` here bounds *concurrent
//! in-flight requests*, not sockets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::PoolConfig;

/// Connection pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The underlying HTTP request failed (transport, TLS, or non-timeout
    /// error propagated from `reqwest`).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// No permit became available within `queue_timeout`.
    #[error("timed out waiting for a pool slot after {0:?}")]
    QueueTimeout(Duration),

    /// The request timed out against `request_timeout` on every attempt.
    #[error("request timed out after {attempts} attempt(s)")]
    RequestTimeout {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The pool's semaphore was closed; only happens if the pool itself
    /// was dropped while a caller still held a handle.
    #[error("connection pool is shut down")]
    Closed,
}

/// Result type for the connection pool.
pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Default)]
struct StatsInner {
    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    /// Latency EMA in microseconds, fixed-point (x1000) so it can live in
    /// an `AtomicU64` without a lock, matching the teacher's
    /// `PoolStats::record_latency` trick.
    avg_latency_micros_x1000: AtomicU64,
}

/// Point-in-time snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Total requests dispatched (including retries).
    pub requests_sent: u64,
    /// Requests that completed with a non-error response.
    pub requests_succeeded: u64,
    /// Requests that exhausted retries or failed terminally.
    pub requests_failed: u64,
    /// Total retry attempts issued.
    pub retries: u64,
    /// Exponential moving average latency across successful requests.
    pub avg_latency: Duration,
}

impl StatsInner {
    fn record_latency(&self, latency: Duration) {
        const ALPHA_X1000: u64 = 200; // alpha = 0.2, fixed-point x1000
        let sample = latency.as_micros() as u64 * 1000;
        let prev = self.avg_latency_micros_x1000.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            (ALPHA_X1000 * sample + (1000 - ALPHA_X1000) * prev) / 1000
        };
        self.avg_latency_micros_x1000.store(next, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            avg_latency: Duration::from_micros(
                self.avg_latency_micros_x1000.load(Ordering::Relaxed) / 1000,
            ),
        }
    }
}

/// A bounded pool of concurrent HTTP requests against the rule registry.
pub struct ConnectionPool {
    client: Client,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    stats: StatsInner,
}

impl ConnectionPool {
    /// Build a pool from configuration. Fails only if the underlying
    /// `reqwest::Client` cannot be constructed (e.g. invalid TLS config).
    pub fn new(config: PoolConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
            stats: StatsInner::default(),
        })
    }

    /// Run `build` against a pooled connection, retrying transient
    /// failures up to `config.max_retries` times with
    /// `config.retry_delay` between attempts.
    ///
    /// `build` is called once per attempt since `RequestBuilder` cannot be
    /// replayed after consumption.
    #[instrument(skip(self, build), fields(component = "pool"))]
    pub async fn execute<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let _permit = tokio::time::timeout(self.config.queue_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| PoolError::QueueTimeout(self.config.queue_timeout))?
            .map_err(|_| PoolError::Closed)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

            let started = std::time::Instant::now();
            let outcome = build(&self.client).send().await;

            match outcome {
                Ok(response) if response.status().is_success() || response.status().is_client_error() => {
                    self.stats.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_latency(started.elapsed());
                    return Ok(response);
                }
                Ok(response) => {
                    // Server error: retryable.
                    if attempt > self.config.max_retries {
                        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                        return Ok(response);
                    }
                }
                Err(err) if err.is_timeout() && !self.config.retry_on_timeout => {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::RequestTimeout { attempts: attempt });
                }
                Err(err) => {
                    if attempt > self.config.max_retries {
                        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                        return Err(PoolError::Request(err));
                    }
                    warn!(attempt, error = %err, "registry request failed, retrying");
                }
            }

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    /// Convenience `GET` through [`execute`].
    pub async fn get(&self, url: impl AsRef<str> + Send + Sync) -> Result<Response> {
        let url = url.as_ref().to_string();
        self.execute(move |client| client.get(&url)).await
    }

    /// Snapshot of request/latency counters.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Number of permits currently unused (i.e. available capacity).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig {
            max_connections: 2,
            max_requests_per_connection: 100,
            keep_alive_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
            queue_timeout: Duration::from_millis(200),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            retry_on_timeout: true,
        }
    }

    #[tokio::test]
    async fn pool_builds_with_valid_config() {
        let pool = ConnectionPool::new(test_config()).unwrap();
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn stats_start_at_zero() {
        let pool = ConnectionPool::new(test_config()).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.requests_sent, 0);
        assert_eq!(stats.requests_succeeded, 0);
    }
}
