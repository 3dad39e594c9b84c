//! Version comparison, conflict detection, policy-driven cache refresh,
//! and rollback snapshots.
//!
//! The conflict/event enum shapes are grounded on the teacher's
//! `enterprise::cache::invalidation` (`InvalidationEvent`,
//! `InvalidationReason`): a small closed enum describing *why* something
//! changed, paired with a `DashMap` keyed by id for the state it
//! describes. The retry/backoff loop in `auto_refresh_cache` and
//! `invalidate_rules` follows the same shape as the connection pool's
//! retry loop in `pool::ConnectionPool::execute`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::cache::{RuleCache, RuleMetadata};
use crate::config::VersionManagerConfig;
use crate::loader::{LoaderError, RuleLoader};

/// Version manager failures.
#[derive(Debug, Error)]
pub enum VersionError {
    /// No rollback snapshot exists for the requested rule (or index).
    #[error("no snapshot available for rule {0}")]
    NoSnapshot(String),

    /// A snapshot was requested for a rule the cache has no entry for.
    #[error("rule {0} is not currently cached; nothing to snapshot")]
    RuleNotCached(String),
}

/// Result type for the version manager.
pub type Result<T> = std::result::Result<T, VersionError>;

/// Semver-aware ordering between a local and a candidate version string.
/// Named distinctly from [`VersionComparisonResult`] (the per-id report
/// `compareVersions` returns) since the two serve different callers: this
/// is the raw ordering primitive, that is the aggregate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOrdering {
    /// The candidate is strictly newer.
    Newer,
    /// The candidate is strictly older.
    Older,
    /// The two versions are equal.
    Same,
    /// At least one side could not be parsed as semver, or carries a
    /// pre-release tag; ordering is not guessed in that case.
    Unknown,
}

/// Compare two version strings as semver. Pre-release versions compare as
/// [`VersionOrdering::Unknown`] rather than guessed ordering, since the
/// registry does not guarantee monotonic pre-release sequencing.
pub fn version_ordering(local: &str, remote: &str) -> VersionOrdering {
    let (Ok(local_v), Ok(remote_v)) = (Version::parse(local), Version::parse(remote)) else {
        return VersionOrdering::Unknown;
    };

    if !local_v.pre.is_empty() || !remote_v.pre.is_empty() {
        return VersionOrdering::Unknown;
    }

    match local_v.cmp(&remote_v) {
        std::cmp::Ordering::Less => VersionOrdering::Newer,
        std::cmp::Ordering::Greater => VersionOrdering::Older,
        std::cmp::Ordering::Equal => VersionOrdering::Same,
    }
}

/// Which dotted-numeric component differs between two version strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionDiff {
    /// First dot-separated component differs.
    Major,
    /// Second component differs, first matches.
    Minor,
    /// Third component differs, first two match.
    Patch,
    /// All three components match.
    Same,
    /// Either string isn't three dot-separated integers.
    Unknown,
}

/// Parse both strings as three dot-separated integers and report which
/// position first differs. Deliberately simpler than full semver parsing
/// (no pre-release/build metadata support) per `compareVersions`' wording.
fn version_diff(local: &str, remote: &str) -> VersionDiff {
    fn parts(v: &str) -> Option<[u64; 3]> {
        let mut it = v.split('.');
        let a = it.next()?.parse().ok()?;
        let b = it.next()?.parse().ok()?;
        let c = it.next()?.parse().ok()?;
        if it.next().is_some() {
            return None;
        }
        Some([a, b, c])
    }

    match (parts(local), parts(remote)) {
        (Some(l), Some(r)) if l[0] != r[0] => VersionDiff::Major,
        (Some(l), Some(r)) if l[1] != r[1] => VersionDiff::Minor,
        (Some(l), Some(r)) if l[2] != r[2] => VersionDiff::Patch,
        (Some(_), Some(_)) => VersionDiff::Same,
        _ => VersionDiff::Unknown,
    }
}

/// Per-rule outcome of comparing the cached version against the upstream
/// one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionComparisonResult {
    /// The rule compared.
    pub rule_id: String,
    /// Version string currently in the cache.
    pub local_version: String,
    /// Version string the loader reports upstream, if it could be fetched.
    pub cloud_version: Option<String>,
    /// Whether the upstream copy should be treated as fresher.
    pub needs_update: bool,
    /// Which dotted component differs.
    pub version_diff: VersionDiff,
    /// Local `lastModified`, milliseconds since epoch.
    pub local_last_modified: i64,
    /// Upstream `lastModified`, if it could be fetched.
    pub cloud_last_modified: Option<i64>,
}

/// Why a rule is considered in conflict between local and upstream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Upstream no longer has this rule.
    RuleDeleted,
    /// Version strings differ.
    VersionMismatch,
    /// Versions match but `lastModified` differs.
    TimestampConflict,
}

/// A detected local/upstream mismatch, prior to any resolution being applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConflict {
    /// The rule in conflict.
    pub rule_id: String,
    /// Version string already in the cache.
    pub local_version: String,
    /// Version string fetched upstream, absent if the rule was deleted.
    pub remote_version: Option<String>,
    /// Classification driving how `autoRefreshCache` should resolve it.
    pub conflict_type: ConflictType,
    /// Local `lastModified`, milliseconds since epoch.
    pub local_last_modified: i64,
    /// Upstream `lastModified`, if known.
    pub remote_last_modified: Option<i64>,
}

/// Policy applied to each detected conflict by `auto_refresh_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStrategy {
    /// Always download the upstream copy and overwrite the cache.
    CloudWins,
    /// Keep the cached copy; never download.
    LocalWins,
    /// Download only if upstream's `lastModified` is strictly newer.
    NewerWins,
    /// Restore the rule's most recent rollback snapshot instead of downloading.
    Rollback,
    /// Leave the conflict unresolved for a human or external process to act on.
    Manual,
}

/// Tuning for a single `auto_refresh_cache` call.
#[derive(Debug, Clone)]
pub struct AutoRefreshOptions {
    /// Policy applied to every detected conflict.
    pub strategy: RefreshStrategy,
    /// How many ids are looked up from the loader per round trip.
    pub batch_size: usize,
    /// Retry attempts for a failed download.
    pub max_retries: u32,
    /// Delay between download retries.
    pub retry_delay: Duration,
    /// Snapshot the cached copy before overwriting it.
    pub create_snapshot: bool,
    /// Re-read the cache after a write and compare byte-for-byte against
    /// what was fetched.
    pub validate_after_update: bool,
}

impl Default for AutoRefreshOptions {
    fn default() -> Self {
        Self {
            strategy: RefreshStrategy::CloudWins,
            batch_size: 25,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            create_snapshot: true,
            validate_after_update: false,
        }
    }
}

/// Tuning for `invalidate_rules`.
#[derive(Debug, Clone)]
pub struct InvalidateOptions {
    /// Retry attempts for the reload after dropping the cached copy.
    pub max_retries: u32,
    /// Delay between reload retries.
    pub retry_delay: Duration,
    /// Compare the reloaded bytes against what ends up in the cache.
    pub validate_after_update: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            validate_after_update: false,
        }
    }
}

/// Complete per-id outcome table for an `auto_refresh_cache` or
/// `invalidate_rules` call. Never silent about failures: every id that
/// didn't update successfully is reflected in either `conflicts`,
/// `errors`, or simply absent from `updated`.
#[derive(Debug, Clone, Default)]
pub struct VersionManagementResult {
    /// How many ids were considered.
    pub processed: usize,
    /// Ids whose cached artifact was actually replaced.
    pub updated: Vec<String>,
    /// Conflicts detected during this run (empty for `invalidate_rules`).
    pub conflicts: Vec<VersionConflict>,
    /// Per-id failure reason for ids that could not be resolved.
    pub errors: std::collections::HashMap<String, String>,
    /// Ids restored from a rollback snapshot.
    pub rollbacks: Vec<String>,
    /// Wall-clock time the call took.
    pub processing_time: Duration,
}

/// Aggregate counters across every rule's rollback history.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VersionStats {
    /// Total snapshots retained across every rule.
    pub total_snapshots: usize,
    /// How many distinct rules have at least one snapshot.
    pub rules_with_snapshots: usize,
    /// Oldest snapshot's capture time, milliseconds since epoch.
    pub oldest_snapshot_at: Option<i64>,
    /// Newest snapshot's capture time, milliseconds since epoch.
    pub newest_snapshot_at: Option<i64>,
}

/// A previously cached artifact plus its metadata, retained so a rule can
/// be restored if a newer version turns out to be bad.
#[derive(Debug, Clone)]
pub struct RollbackSnapshot {
    /// Metadata as of when this snapshot was taken.
    pub metadata: RuleMetadata,
    /// Artifact bytes as of when this snapshot was taken.
    pub artifact: Vec<u8>,
    /// Why this snapshot was captured.
    pub reason: String,
    /// When this snapshot was captured, milliseconds since epoch.
    pub taken_at: i64,
}

/// Reconciles the Cache against an upstream [`RuleLoader`], detecting and
/// resolving version conflicts under an explicit policy, and retaining a
/// bounded rollback history per rule.
pub struct VersionManager {
    cache: Arc<RuleCache>,
    loader: Arc<dyn RuleLoader>,
    config: VersionManagerConfig,
    snapshots: DashMap<String, VecDeque<RollbackSnapshot>>,
}

impl VersionManager {
    /// Build a manager reconciling `cache` against `loader`, retaining up
    /// to `config.max_snapshots_per_rule` snapshots per rule id (oldest
    /// dropped first).
    pub fn new(cache: Arc<RuleCache>, loader: Arc<dyn RuleLoader>, config: VersionManagerConfig) -> Self {
        Self {
            cache,
            loader,
            config,
            snapshots: DashMap::new(),
        }
    }

    fn target_ids(&self, ids: Option<&[String]>) -> Vec<String> {
        match ids {
            Some(ids) => ids.to_vec(),
            None => self.cache.ids(),
        }
    }

    /// Compare every cached rule (or just `ids`, if given) against the
    /// loader's upstream view, batched to `config.batch_size`. A rule the
    /// loader can no longer find is reported with `cloud_version: None`
    /// rather than failing the whole call.
    #[instrument(skip(self, ids), fields(component = "version"))]
    pub async fn compare_versions(&self, ids: Option<&[String]>) -> Vec<VersionComparisonResult> {
        let targets = self.target_ids(ids);
        let mut out = Vec::with_capacity(targets.len());

        for chunk in targets.chunks(self.config.batch_size.max(1)) {
            let chunk_ids: Vec<String> = chunk.to_vec();
            let upstream = self.loader.load_many(&chunk_ids).await.unwrap_or_else(|err| {
                warn!(error = %err, "batch upstream lookup failed during compare_versions");
                Default::default()
            });

            for id in chunk {
                let Some(local) = self.cache.get_metadata(id) else {
                    continue;
                };
                match upstream.get(id) {
                    Some((_, remote)) => {
                        let ordering = version_ordering(&local.version, &remote.version);
                        out.push(VersionComparisonResult {
                            rule_id: id.clone(),
                            local_version: local.version.clone(),
                            cloud_version: Some(remote.version.clone()),
                            needs_update: matches!(ordering, VersionOrdering::Newer)
                                || (matches!(ordering, VersionOrdering::Unknown)
                                    && remote.last_modified > local.last_modified),
                            version_diff: version_diff(&local.version, &remote.version),
                            local_last_modified: local.last_modified,
                            cloud_last_modified: Some(remote.last_modified),
                        });
                    }
                    None => {
                        out.push(VersionComparisonResult {
                            rule_id: id.clone(),
                            local_version: local.version.clone(),
                            cloud_version: None,
                            needs_update: false,
                            version_diff: VersionDiff::Unknown,
                            local_last_modified: local.last_modified,
                            cloud_last_modified: None,
                        });
                    }
                }
            }
        }

        out
    }

    /// Classify every cached rule (or just `ids`) against the loader's
    /// upstream view: `rule-deleted` when upstream no longer has it,
    /// `version-mismatch` when version strings differ, `timestamp-conflict`
    /// when versions match but `lastModified` differs. Rules with no
    /// mismatch are simply absent from the result.
    #[instrument(skip(self, ids), fields(component = "version"))]
    pub async fn detect_version_conflicts(&self, ids: Option<&[String]>) -> Vec<VersionConflict> {
        let targets = self.target_ids(ids);
        let mut conflicts = Vec::new();

        for id in &targets {
            let Some(local) = self.cache.get_metadata(id) else {
                continue;
            };

            match self.loader.load(id).await {
                Ok((_, remote)) => {
                    if remote.version != local.version {
                        conflicts.push(VersionConflict {
                            rule_id: id.clone(),
                            local_version: local.version.clone(),
                            remote_version: Some(remote.version.clone()),
                            conflict_type: ConflictType::VersionMismatch,
                            local_last_modified: local.last_modified,
                            remote_last_modified: Some(remote.last_modified),
                        });
                    } else if remote.last_modified != local.last_modified {
                        conflicts.push(VersionConflict {
                            rule_id: id.clone(),
                            local_version: local.version.clone(),
                            remote_version: Some(remote.version.clone()),
                            conflict_type: ConflictType::TimestampConflict,
                            local_last_modified: local.last_modified,
                            remote_last_modified: Some(remote.last_modified),
                        });
                    }
                }
                Err(LoaderError::NotFound(_)) => {
                    conflicts.push(VersionConflict {
                        rule_id: id.clone(),
                        local_version: local.version.clone(),
                        remote_version: None,
                        conflict_type: ConflictType::RuleDeleted,
                        local_last_modified: local.last_modified,
                        remote_last_modified: None,
                    });
                }
                Err(err) => {
                    warn!(rule_id = %id, error = %err, "upstream lookup failed during detect_version_conflicts");
                }
            }
        }

        conflicts
    }

    async fn download_with_retry(&self, id: &str, opts: &AutoRefreshOptions) -> Result<(Vec<u8>, RuleMetadata)> {
        let mut attempt = 0;
        loop {
            match self.loader.load(id).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < opts.max_retries => {
                    attempt += 1;
                    warn!(rule_id = %id, attempt, error = %err, "retrying rule download");
                    tokio::time::sleep(opts.retry_delay).await;
                }
                Err(err) => return Err(VersionError::RuleNotCached(format!("{id}: {err}"))),
            }
        }
    }

    /// Detect conflicts (or operate on `ids` directly) and resolve each
    /// one under `opts.strategy`. A failure resolving one id never aborts
    /// the rest; it is recorded in the returned result's `errors` map.
    #[instrument(skip(self, ids, opts), fields(component = "version"))]
    pub async fn auto_refresh_cache(
        &self,
        ids: Option<&[String]>,
        opts: AutoRefreshOptions,
    ) -> VersionManagementResult {
        let started = std::time::Instant::now();
        let conflicts = self.detect_version_conflicts(ids).await;

        let mut result = VersionManagementResult {
            processed: conflicts.len(),
            conflicts: conflicts.clone(),
            ..Default::default()
        };

        for conflict in &conflicts {
            let id = &conflict.rule_id;

            match opts.strategy {
                RefreshStrategy::LocalWins | RefreshStrategy::Manual => continue,
                RefreshStrategy::NewerWins => {
                    let is_newer = conflict
                        .remote_last_modified
                        .map(|remote| remote > conflict.local_last_modified)
                        .unwrap_or(false);
                    if !is_newer {
                        continue;
                    }
                }
                RefreshStrategy::CloudWins | RefreshStrategy::Rollback => {}
            }

            if opts.strategy == RefreshStrategy::Rollback {
                match self.rollback_rule(id, 0).await {
                    Ok(_) => result.rollbacks.push(id.clone()),
                    Err(err) => {
                        result.errors.insert(id.clone(), err.to_string());
                    }
                }
                continue;
            }

            if opts.create_snapshot {
                let _ = self.create_rollback_snapshot(id, "pre-refresh snapshot").await;
            }

            match self.download_with_retry(id, &opts).await {
                Ok((bytes, metadata)) => {
                    self.cache.set(id.clone(), bytes.clone(), metadata);
                    if opts.validate_after_update {
                        match self.cache.get(id) {
                            Some(cached) if cached == bytes => {}
                            _ => {
                                result.errors.insert(
                                    id.clone(),
                                    "post-write validation failed: byte mismatch".to_string(),
                                );
                                continue;
                            }
                        }
                    }
                    result.updated.push(id.clone());
                }
                Err(err) => {
                    result.errors.insert(id.clone(), err.to_string());
                }
            }
        }

        result.processing_time = started.elapsed();
        result
    }

    /// Unconditionally drop and reload every id in `ids`, with retry and
    /// backoff. A load failure for one id accumulates in `errors` rather
    /// than aborting the rest.
    #[instrument(skip(self, ids, opts), fields(component = "version"))]
    pub async fn invalidate_rules(&self, ids: &[String], opts: InvalidateOptions) -> VersionManagementResult {
        let started = std::time::Instant::now();
        let mut result = VersionManagementResult {
            processed: ids.len(),
            ..Default::default()
        };

        let refresh_opts = AutoRefreshOptions {
            strategy: RefreshStrategy::CloudWins,
            max_retries: opts.max_retries,
            retry_delay: opts.retry_delay,
            create_snapshot: false,
            validate_after_update: opts.validate_after_update,
            ..Default::default()
        };

        for id in ids {
            self.cache.invalidate(id);
            match self.download_with_retry(id, &refresh_opts).await {
                Ok((bytes, metadata)) => {
                    self.cache.set(id.clone(), bytes.clone(), metadata);
                    if opts.validate_after_update && self.cache.get(id).as_deref() != Some(bytes.as_slice()) {
                        result
                            .errors
                            .insert(id.clone(), "post-write validation failed: byte mismatch".to_string());
                        continue;
                    }
                    result.updated.push(id.clone());
                }
                Err(err) => {
                    result.errors.insert(id.clone(), err.to_string());
                }
            }
        }

        result.processing_time = started.elapsed();
        result
    }

    /// Capture the cache's current state for `rule_id` as a rollback
    /// point. Errors if the rule isn't currently cached.
    pub async fn create_rollback_snapshot(&self, rule_id: &str, reason: impl Into<String>) -> Result<()> {
        let metadata = self
            .cache
            .get_metadata(rule_id)
            .ok_or_else(|| VersionError::RuleNotCached(rule_id.to_string()))?;
        let artifact = self
            .cache
            .get(rule_id)
            .ok_or_else(|| VersionError::RuleNotCached(rule_id.to_string()))?;

        let mut entry = self.snapshots.entry(rule_id.to_string()).or_default();
        entry.push_front(RollbackSnapshot {
            metadata,
            artifact,
            reason: reason.into(),
            taken_at: chrono::Utc::now().timestamp_millis(),
        });
        while entry.len() > self.config.max_snapshots_per_rule.max(1) {
            entry.pop_back();
        }
        Ok(())
    }

    /// Restore `rule_id` from the snapshot at `snapshot_index` (0 = most
    /// recent), capturing the pre-rollback state as a fresh snapshot
    /// first so the rollback itself can be undone.
    #[instrument(skip(self), fields(component = "version", rule_id))]
    pub async fn rollback_rule(&self, rule_id: &str, snapshot_index: usize) -> Result<RollbackSnapshot> {
        let snapshot = {
            let entry = self
                .snapshots
                .get(rule_id)
                .ok_or_else(|| VersionError::NoSnapshot(rule_id.to_string()))?;
            entry
                .get(snapshot_index)
                .cloned()
                .ok_or_else(|| VersionError::NoSnapshot(rule_id.to_string()))?
        };

        // Capture the state being replaced before overwriting it, so this
        // rollback can itself be undone.
        let _ = self
            .create_rollback_snapshot(rule_id, "pre-rollback snapshot")
            .await;

        self.cache
            .set(rule_id.to_string(), snapshot.artifact.clone(), snapshot.metadata.clone());
        Ok(snapshot)
    }

    /// Number of retained snapshots for a rule.
    pub fn snapshot_count(&self, rule_id: &str) -> usize {
        self.snapshots.get(rule_id).map(|e| e.len()).unwrap_or(0)
    }

    /// Counts and timestamp extremes across every rule's rollback history.
    pub fn get_version_stats(&self) -> VersionStats {
        let mut stats = VersionStats::default();
        for entry in self.snapshots.iter() {
            if entry.value().is_empty() {
                continue;
            }
            stats.rules_with_snapshots += 1;
            stats.total_snapshots += entry.value().len();
            for snapshot in entry.value() {
                stats.oldest_snapshot_at = Some(
                    stats
                        .oldest_snapshot_at
                        .map_or(snapshot.taken_at, |m| m.min(snapshot.taken_at)),
                );
                stats.newest_snapshot_at = Some(
                    stats
                        .newest_snapshot_at
                        .map_or(snapshot.taken_at, |m| m.max(snapshot.taken_at)),
                );
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{LoaderError, Result as LoaderResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeLoader {
        rules: Mutex<HashMap<String, (Vec<u8>, RuleMetadata)>>,
    }

    #[async_trait]
    impl RuleLoader for FakeLoader {
        async fn load(&self, rule_id: &str) -> LoaderResult<(Vec<u8>, RuleMetadata)> {
            self.rules
                .lock()
                .unwrap()
                .get(rule_id)
                .cloned()
                .ok_or_else(|| LoaderError::NotFound(rule_id.to_string()))
        }

        async fn list_ids(&self) -> LoaderResult<Vec<String>> {
            Ok(self.rules.lock().unwrap().keys().cloned().collect())
        }
    }

    fn meta(id: &str, version: &str) -> RuleMetadata {
        RuleMetadata::new(id, version)
    }

    fn manager_with(rules: Vec<(&str, &str, Vec<u8>)>) -> (VersionManager, Arc<RuleCache>) {
        let cache = Arc::new(RuleCache::new(100));
        let mut upstream = HashMap::new();
        for (id, version, bytes) in rules {
            let metadata = meta(id, version);
            cache.set(id, bytes.clone(), metadata.clone());
            upstream.insert(id.to_string(), (bytes, metadata));
        }
        let loader: Arc<dyn RuleLoader> = Arc::new(FakeLoader {
            rules: Mutex::new(upstream),
        });
        (
            VersionManager::new(cache.clone(), loader, VersionManagerConfig::default()),
            cache,
        )
    }

    #[test]
    fn version_diff_detects_each_component() {
        assert_eq!(version_diff("1.0.0", "2.0.0"), VersionDiff::Major);
        assert_eq!(version_diff("1.0.0", "1.1.0"), VersionDiff::Minor);
        assert_eq!(version_diff("1.0.0", "1.0.1"), VersionDiff::Patch);
        assert_eq!(version_diff("1.0.0", "1.0.0"), VersionDiff::Same);
        assert_eq!(version_diff("1.0", "1.0.0"), VersionDiff::Unknown);
    }

    #[test]
    fn prerelease_ordering_is_unknown() {
        assert_eq!(
            version_ordering("1.0.0-beta.1", "1.0.0-beta.2"),
            VersionOrdering::Unknown
        );
    }

    #[tokio::test]
    async fn compare_versions_reports_needs_update_for_newer_remote() {
        let (vm, cache) = manager_with(vec![("r1", "1.0.0", b"v1".to_vec())]);
        cache.invalidate("r1");
        cache.set("r1", b"v0".to_vec(), meta("r1", "0.9.0"));

        let results = vm.compare_versions(None).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].needs_update);
        assert_eq!(results[0].version_diff, VersionDiff::Minor);
    }

    #[tokio::test]
    async fn detect_conflicts_flags_deleted_rule() {
        let cache = Arc::new(RuleCache::new(10));
        cache.set("ghost", b"old".to_vec(), meta("ghost", "1.0.0"));
        let loader: Arc<dyn RuleLoader> = Arc::new(FakeLoader {
            rules: Mutex::new(HashMap::new()),
        });
        let vm = VersionManager::new(cache, loader, VersionManagerConfig::default());

        let conflicts = vm.detect_version_conflicts(None).await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::RuleDeleted);
    }

    #[tokio::test]
    async fn auto_refresh_cloud_wins_overwrites_with_snapshot() {
        let (vm, cache) = manager_with(vec![("r1", "2.0.0", b"new".to_vec())]);
        cache.invalidate("r1");
        cache.set("r1", b"old".to_vec(), meta("r1", "1.0.0"));

        let result = vm
            .auto_refresh_cache(None, AutoRefreshOptions::default())
            .await;

        assert_eq!(result.updated, vec!["r1".to_string()]);
        assert_eq!(cache.get("r1"), Some(b"new".to_vec()));
        assert_eq!(vm.snapshot_count("r1"), 1);
    }

    #[tokio::test]
    async fn auto_refresh_local_wins_is_a_no_op() {
        let (vm, cache) = manager_with(vec![("r1", "2.0.0", b"new".to_vec())]);
        cache.invalidate("r1");
        cache.set("r1", b"old".to_vec(), meta("r1", "1.0.0"));

        let opts = AutoRefreshOptions {
            strategy: RefreshStrategy::LocalWins,
            ..Default::default()
        };
        let result = vm.auto_refresh_cache(None, opts).await;

        assert!(result.updated.is_empty());
        assert_eq!(cache.get("r1"), Some(b"old".to_vec()));
    }

    #[tokio::test]
    async fn rollback_restores_previous_snapshot() {
        let (vm, cache) = manager_with(vec![("r1", "1.0.0", b"v1".to_vec())]);
        vm.create_rollback_snapshot("r1", "manual checkpoint").await.unwrap();
        cache.set("r1", b"v2".to_vec(), meta("r1", "2.0.0"));

        let restored = vm.rollback_rule("r1", 0).await.unwrap();
        assert_eq!(restored.artifact, b"v1");
        assert_eq!(cache.get("r1"), Some(b"v1".to_vec()));
        // The pre-rollback state (v2) is itself now snapshotted alongside
        // the one already taken, so the rollback can itself be undone.
        assert_eq!(vm.snapshot_count("r1"), 2);
    }

    #[tokio::test]
    async fn rollback_without_snapshot_errors() {
        let (vm, _cache) = manager_with(vec![]);
        assert!(vm.rollback_rule("missing", 0).await.is_err());
    }

    #[tokio::test]
    async fn invalidate_rules_reloads_and_reports_errors_for_missing_ids() {
        let (vm, cache) = manager_with(vec![("r1", "1.0.0", b"v1".to_vec())]);
        let result = vm
            .invalidate_rules(&["r1".to_string(), "ghost".to_string()], InvalidateOptions {
                max_retries: 0,
                retry_delay: Duration::from_millis(1),
                validate_after_update: false,
            })
            .await;

        assert_eq!(result.updated, vec!["r1".to_string()]);
        assert!(result.errors.contains_key("ghost"));
        assert_eq!(cache.get("r1"), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn version_stats_track_extremes_across_rules() {
        let (vm, _cache) = manager_with(vec![("r1", "1.0.0", b"v1".to_vec())]);
        vm.create_rollback_snapshot("r1", "a").await.unwrap();
        vm.create_rollback_snapshot("r1", "b").await.unwrap();

        let stats = vm.get_version_stats();
        assert_eq!(stats.rules_with_snapshots, 1);
        assert_eq!(stats.total_snapshots, 2);
        assert!(stats.oldest_snapshot_at.is_some());
        assert!(stats.newest_snapshot_at.is_some());
    }
}
