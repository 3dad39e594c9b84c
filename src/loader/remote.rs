use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::batch::{BatchFetcher, BatchOutcome, RequestBatcher};
use crate::cache::RuleMetadata;
use crate::compression::{self, CompressionAlgorithm};
use crate::config::{BatcherConfig, PoolConfig, RemoteLoaderConfig};
use crate::pool::ConnectionPool;

use super::{LoaderError, Result, RuleLoader};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCompression {
    algorithm: CompressionAlgorithm,
    #[allow(dead_code)]
    #[serde(default)]
    original_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRule {
    id: String,
    #[allow(dead_code)]
    #[serde(default)]
    name: Option<String>,
    version: String,
    #[serde(default)]
    tags: Vec<String>,
    last_modified: DateTime<Utc>,
    content: String,
    #[serde(default)]
    compression: Option<WireCompression>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRuleError {
    #[allow(dead_code)]
    rule_id: String,
    #[allow(dead_code)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    rules: Vec<WireRule>,
    #[serde(default)]
    errors: Vec<WireRuleError>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest<'a> {
    rule_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionCheckEntry<'a> {
    rule_id: &'a str,
    current_version: &'a str,
}

#[derive(Debug, Serialize)]
struct VersionCheckRequest<'a> {
    rules: Vec<VersionCheckEntry<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionCheckEntryResponse {
    rule_id: String,
    #[allow(dead_code)]
    current_version: String,
    #[allow(dead_code)]
    latest_version: String,
    needs_update: bool,
}

#[derive(Debug, Deserialize)]
struct VersionCheckResponse {
    #[serde(default)]
    rules: Vec<VersionCheckEntryResponse>,
}

fn decode_artifact(wire: WireRule) -> Result<(Vec<u8>, RuleMetadata)> {
    let raw = base64::engine::general_purpose::STANDARD.decode(&wire.content)?;
    let algorithm = wire
        .compression
        .as_ref()
        .map(|c| c.algorithm)
        .unwrap_or(CompressionAlgorithm::None);
    let bytes = compression::decompress(&raw, algorithm)?;

    if bytes.is_empty() || serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
        return Err(LoaderError::InvalidMetadata {
            id: wire.id.clone(),
            message: "artifact content is not a well-formed JSON decision graph".to_string(),
        });
    }

    let metadata = RuleMetadata {
        id: wire.id,
        version: wire.version,
        tags: wire.tags.into_iter().collect(),
        last_modified: wire.last_modified.timestamp_millis(),
    };
    Ok((bytes, metadata))
}

/// Talks HTTP to the registry described by [`RemoteLoaderConfig`]. Kept
/// separate from [`RemoteLoader`] so it can also be driven through a
/// [`RequestBatcher`] without the batcher needing to own the loader.
struct RegistryClient {
    pool: ConnectionPool,
    config: RemoteLoaderConfig,
}

impl RegistryClient {
    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/api/v1/projects/{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.project_id,
            path
        )
    }

    fn accept_encoding(&self) -> Option<&'static str> {
        if !self.config.enable_compression {
            return None;
        }
        match self.config.compression_algorithm {
            CompressionAlgorithm::Gzip => Some("gzip"),
            CompressionAlgorithm::Deflate => Some("deflate"),
            CompressionAlgorithm::None => None,
        }
    }

    async fn fetch_one(&self, rule_id: &str) -> Result<(Vec<u8>, RuleMetadata)> {
        let url = self.endpoint(&format!("/rules/{rule_id}"));
        let api_key = self.config.api_key.clone();
        let accept_encoding = self.accept_encoding();

        let response = self
            .pool
            .execute(move |client| {
                let mut request = client
                    .get(&url)
                    .header("Authorization", format!("Bearer {api_key}"))
                    .header("Accept", "application/json");
                if let Some(encoding) = accept_encoding {
                    request = request.header("Accept-Encoding", encoding);
                }
                request
            })
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LoaderError::NotFound(rule_id.to_string()));
        }
        let wire: WireRule = response.error_for_status()?.json().await?;
        decode_artifact(wire)
    }

    async fn fetch_all(&self) -> Result<RulesResponse> {
        let url = self.endpoint("/rules");
        let api_key = self.config.api_key.clone();
        let accept_encoding = self.accept_encoding();

        let response = self
            .pool
            .execute(move |client| {
                let mut request = client
                    .get(&url)
                    .header("Authorization", format!("Bearer {api_key}"))
                    .header("Accept", "application/json");
                if let Some(encoding) = accept_encoding {
                    request = request.header("Accept-Encoding", encoding);
                }
                request
            })
            .await?;

        Ok(response.error_for_status()?.json().await?)
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<RulesResponse> {
        let url = self.endpoint("/rules/batch");
        let api_key = self.config.api_key.clone();
        let body = serde_json::to_vec(&BatchRequest { rule_ids: ids })?;

        let response = self
            .pool
            .execute(move |client| {
                client
                    .post(&url)
                    .header("Authorization", format!("Bearer {api_key}"))
                    .header("Content-Type", "application/json")
                    .body(body.clone())
            })
            .await?;

        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl BatchFetcher for RegistryClient {
    async fn fetch_batch(&self, keys: Vec<String>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let wire = match RegistryClient::fetch_batch(self, &keys).await {
            Ok(wire) => wire,
            Err(err) => {
                let message = err.to_string();
                for key in keys {
                    outcome.errors.insert(key, message.clone());
                }
                return outcome;
            }
        };

        for err in &wire.errors {
            outcome.errors.insert(err.rule_id.clone(), err.error.clone());
        }
        for rule in wire.rules {
            let id = rule.id.clone();
            match decode_artifact(rule) {
                Ok((bytes, _metadata)) => {
                    outcome.results.insert(id, bytes);
                }
                Err(e) => {
                    outcome.errors.insert(id, e.to_string());
                }
            }
        }
        outcome
    }
}

/// Rule source backed by the HTTP registry described in the external
/// registry surface. Per-rule fetches are coalesced through a
/// [`RequestBatcher`] when `enable_request_batching` is set; otherwise
/// every `load` call is an independent round trip.
pub struct RemoteLoader {
    client: Arc<RegistryClient>,
    batcher: Option<RequestBatcher>,
}

impl RemoteLoader {
    /// Build a remote loader, standing up its own connection pool and,
    /// when configured, a background request batcher.
    pub fn new(
        remote_config: RemoteLoaderConfig,
        pool_config: PoolConfig,
        batcher_config: BatcherConfig,
    ) -> Result<Self> {
        let enable_batching = remote_config.enable_request_batching;
        let pool = ConnectionPool::new(pool_config)?;
        let client = Arc::new(RegistryClient {
            pool,
            config: remote_config,
        });

        let batcher = if enable_batching {
            Some(RequestBatcher::spawn(batcher_config, client.clone() as Arc<dyn BatchFetcher>))
        } else {
            None
        };

        Ok(Self { client, batcher })
    }

    /// `GET /rules`: fetch every rule the project currently has, decoding
    /// and decompressing each artifact.
    #[instrument(skip(self), fields(component = "remote_loader"))]
    pub async fn load_all_rules(&self) -> Result<HashMap<String, (Vec<u8>, RuleMetadata)>> {
        let wire = self.client.fetch_all().await?;
        let mut out = HashMap::with_capacity(wire.rules.len());
        for rule in wire.rules {
            let id = rule.id.clone();
            out.insert(id, decode_artifact(rule)?);
        }
        Ok(out)
    }

    /// `POST /rules/versions/check`: ask the registry whether each given
    /// `(id, currentVersion)` pair needs to be refreshed. Returns, per
    /// id, whether an update is available.
    #[instrument(skip(self, current_versions), fields(component = "remote_loader"))]
    pub async fn check_versions(
        &self,
        current_versions: &HashMap<String, String>,
    ) -> Result<HashMap<String, bool>> {
        let entries: Vec<VersionCheckEntry<'_>> = current_versions
            .iter()
            .map(|(rule_id, current_version)| VersionCheckEntry {
                rule_id,
                current_version,
            })
            .collect();

        let url = self.client.endpoint("/rules/versions/check");
        let api_key = self.client.config.api_key.clone();
        let body = serde_json::to_vec(&VersionCheckRequest { rules: entries })?;

        let response = self
            .client
            .pool
            .execute(move |client| {
                client
                    .post(&url)
                    .header("Authorization", format!("Bearer {api_key}"))
                    .header("Content-Type", "application/json")
                    .body(body.clone())
            })
            .await?;

        let wire: VersionCheckResponse = response.error_for_status()?.json().await?;
        Ok(wire
            .rules
            .into_iter()
            .map(|entry| (entry.rule_id, entry.needs_update))
            .collect())
    }
}

#[async_trait]
impl RuleLoader for RemoteLoader {
    #[instrument(skip(self), fields(component = "remote_loader", rule_id))]
    async fn load(&self, rule_id: &str) -> Result<(Vec<u8>, RuleMetadata)> {
        match &self.batcher {
            Some(batcher) => {
                let bytes = batcher
                    .get(rule_id.to_string(), 0)
                    .await?
                    .ok_or_else(|| LoaderError::NotFound(rule_id.to_string()))?;
                // The batcher only returns decoded artifact bytes; batched
                // fetches still need metadata, so fall through to a direct
                // fetch for it. This keeps the single-flight property for
                // bytes while metadata (small, infrequent) is fetched directly.
                let (_, metadata) = self.client.fetch_one(rule_id).await?;
                Ok((bytes, metadata))
            }
            None => self.client.fetch_one(rule_id).await,
        }
    }

    async fn load_many(&self, ids: &[String]) -> Result<HashMap<String, (Vec<u8>, RuleMetadata)>> {
        let wire = self.client.fetch_batch(ids).await?;
        let mut out = HashMap::with_capacity(wire.rules.len());
        for rule in wire.rules {
            let id = rule.id.clone();
            out.insert(id, decode_artifact(rule)?);
        }
        Ok(out)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let wire = self.client.fetch_all().await?;
        Ok(wire.rules.into_iter().map(|r| r.id).collect())
    }
}
