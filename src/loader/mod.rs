//! Rule loading: fetch artifacts and metadata from either a remote
//! registry or a local directory.
//!
//! Grounded on the teacher's `enterprise::marketplace::registry` —
//! `LocalRegistry` keeps an in-memory index synced with on-disk state and
//! exposes register/lookup by name. Here the index is the cache itself
//! (see [`crate::cache`]); the loader's job is strictly to produce bytes
//! and metadata for a rule id, by whatever source is configured.

mod local;
mod remote;
mod watcher;

pub use local::LocalLoader;
pub use remote::RemoteLoader;
pub use watcher::{HotReloadEvent, HotReloadWatcher};

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::batch::BatcherError;
use crate::cache::RuleMetadata;
use crate::compression::CompressionError;

/// Loader failures, covering both transport (remote) and filesystem
/// (local) backends.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// No rule exists with the given id.
    #[error("rule not found: {0}")]
    NotFound(String),

    /// The rule id resolves outside the configured root directory, or
    /// uses a reserved/invalid path component.
    #[error("rejected rule id {0:?}: resolves outside the configured root")]
    PathTraversal(String),

    /// Filesystem I/O failure reading a rule or its metadata sidecar.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata sidecar failed to parse or was missing required fields.
    #[error("invalid metadata for rule {id}: {message}")]
    InvalidMetadata {
        /// The offending rule id.
        id: String,
        /// Human-readable description of what was wrong.
        message: String,
    },

    /// HTTP transport failure talking to the remote registry.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The registry pool rejected or failed a request.
    #[error("registry pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    /// JSON (de)serialization failure for the registry wire format.
    #[error("malformed registry response: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding of an artifact payload failed.
    #[error("invalid base64 artifact payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Decompressing a fetched artifact failed.
    #[error("decompression failed: {0}")]
    Decompression(#[from] CompressionError),

    /// The request batcher failed to coalesce or dispatch a fetch.
    #[error("batching error: {0}")]
    Batcher(#[from] BatcherError),
}

/// Result type for the loader subsystem.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Source-agnostic contract for fetching rule artifacts.
#[async_trait]
pub trait RuleLoader: Send + Sync {
    /// Fetch one rule's artifact bytes and metadata.
    async fn load(&self, rule_id: &str) -> Result<(Vec<u8>, RuleMetadata)>;

    /// Fetch several rules in whatever manner is most efficient for this
    /// backend (a single batched registry call, or N sequential file
    /// reads). Ids with no corresponding rule are simply absent from the
    /// result, not an error.
    async fn load_many(&self, ids: &[String]) -> Result<HashMap<String, (Vec<u8>, RuleMetadata)>> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            match self.load(id).await {
                Ok(value) => {
                    out.insert(id.clone(), value);
                }
                Err(LoaderError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Enumerate every rule id this loader currently knows about.
    async fn list_ids(&self) -> Result<Vec<String>>;
}
