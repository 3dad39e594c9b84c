//! Bounded, tag-indexed rule cache.
//!
//! Mirrors the teacher crate's cache layer (`CacheManager`/`MultiTierCache`):
//! an arena of entries keyed by id, a separate intrusive structure tracking
//! recency, and a reverse tag index kept as a pure function of the current
//! entry set. Unlike the tiered L1/L2/L3 cache this grew out of, there is a
//! single bounded tier here — the CORE never persists across restarts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Descriptor carried alongside every cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Globally unique (within a project) rule id.
    pub id: String,
    /// Conventionally dotted-numeric version; opaque otherwise.
    pub version: String,
    /// Tags this rule is indexed under.
    pub tags: HashSet<String>,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
}

impl RuleMetadata {
    /// Build metadata with no tags, stamped at the current time.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            tags: HashSet::new(),
            last_modified: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Builder-style tag attachment.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: RuleMetadata,
    artifact: Vec<u8>,
}

/// Monotonic counters observed without locking, following the teacher's
/// `PoolStats`/`CacheStats` convention of relaxed-atomic accessors.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
}

/// Point-in-time snapshot of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Cache hits across `get`/`get_multiple`.
    pub hits: u64,
    /// Cache misses across `get`/`get_multiple`.
    pub misses: u64,
    /// Entries evicted to stay within `max_size`.
    pub evictions: u64,
    /// Total `set`/`set_multiple` calls.
    pub sets: u64,
    /// Current number of resident entries.
    pub size: usize,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Front = least recently used, back = most recently used.
    order: VecDeque<String>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            tag_index: HashMap::new(),
        }
    }

    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.to_string());
    }

    fn unlink_tags(&mut self, id: &str, tags: &HashSet<String>) {
        for tag in tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn link_tags(&mut self, id: &str, tags: &HashSet<String>) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self.order.pop_front()?;
        if let Some(entry) = self.entries.remove(&victim) {
            self.unlink_tags(&victim, &entry.metadata.tags);
        }
        Some(victim)
    }
}

/// Bounded LRU store of rule artifacts with tag-indexed reverse lookup.
///
/// Readers (`get*`) and writers (`set*`, `invalidate`, `clear`) share one
/// `parking_lot::RwLock` over the whole table: critical sections are short
/// (pointer/hashmap bookkeeping only), so a single coarse lock outperforms
/// finer-grained sharding here and keeps eviction/promotion from ever
/// interleaving, per the cache's own linearizability invariant.
pub struct RuleCache {
    inner: RwLock<Inner>,
    max_size: usize,
    stats: CacheStats,
}

impl RuleCache {
    /// Create an empty cache bounded to `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            max_size: max_size.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Fetch an artifact, promoting it to most-recently-used on hit.
    pub fn get(&self, rule_id: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(rule_id) {
            let artifact = entry.artifact.clone();
            inner.touch(rule_id);
            self.stats.record_hit();
            Some(artifact)
        } else {
            self.stats.record_miss();
            None
        }
    }

    /// Fetch metadata without promoting (mirrors the distilled contract,
    /// which only specifies promotion for `get`).
    pub fn get_metadata(&self, rule_id: &str) -> Option<RuleMetadata> {
        self.inner.read().entries.get(rule_id).map(|e| e.metadata.clone())
    }

    /// Fetch several artifacts at once, promoting every hit.
    pub fn get_multiple(&self, ids: &[String]) -> HashMap<String, Vec<u8>> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(bytes) = self.get(id) {
                out.insert(id.clone(), bytes);
            }
        }
        out
    }

    /// Insert or replace an artifact, evicting the LRU entry if the cache is
    /// full and `rule_id` is new.
    pub fn set(&self, rule_id: impl Into<String>, artifact: Vec<u8>, metadata: RuleMetadata) {
        let rule_id = rule_id.into();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.entries.remove(&rule_id) {
            inner.unlink_tags(&rule_id, &existing.metadata.tags);
        } else if inner.entries.len() >= self.max_size {
            if inner.evict_lru().is_some() {
                self.stats.record_eviction();
            }
        }

        inner.link_tags(&rule_id, &metadata.tags);
        inner.entries.insert(
            rule_id.clone(),
            CacheEntry {
                metadata,
                artifact,
            },
        );
        inner.touch(&rule_id);
        self.stats.record_set();
    }

    /// Insert several artifacts. Each key is applied atomically; the batch
    /// as a whole is not transactional (a later error does not roll back
    /// earlier keys — there is nothing that can fail here, but the contract
    /// matches the distilled spec's wording).
    pub fn set_multiple(&self, items: HashMap<String, (Vec<u8>, RuleMetadata)>) {
        for (id, (artifact, metadata)) in items {
            self.set(id, artifact, metadata);
        }
    }

    /// Ids of every cached rule carrying every tag in `tags` (set
    /// intersection). An empty tag list, or any tag with no postings, yields
    /// an empty result.
    pub fn get_rules_by_tags(&self, tags: &[String]) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read();
        let mut sets = Vec::with_capacity(tags.len());
        for tag in tags {
            match inner.tag_index.get(tag) {
                Some(ids) => sets.push(ids),
                None => return Vec::new(),
            }
        }

        let mut iter = sets.into_iter();
        let first = iter.next().expect("tags is non-empty");
        let mut acc: HashSet<String> = first.clone();
        for ids in iter {
            acc.retain(|id| ids.contains(id));
        }

        let mut result: Vec<String> = acc.into_iter().collect();
        result.sort();
        result
    }

    /// Whether the cached version string for `rule_id` equals `version`
    /// exactly (string equality, not semantic comparison).
    pub fn is_version_current(&self, rule_id: &str, version: &str) -> bool {
        self.inner
            .read()
            .entries
            .get(rule_id)
            .map(|e| e.metadata.version == version)
            .unwrap_or(false)
    }

    /// Remove an entry from the store, LRU list, and every tag posting.
    pub fn invalidate(&self, rule_id: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(rule_id) {
            inner.unlink_tags(rule_id, &entry.metadata.tags);
            if let Some(pos) = inner.order.iter().position(|k| k == rule_id) {
                inner.order.remove(pos);
            }
        }
    }

    /// Drop every entry, tag posting, and LRU record.
    pub fn clear(&self) {
        *self.inner.write() = Inner::new();
    }

    /// Ids of every currently resident entry, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Current resident entry count.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of hit/miss/eviction/set counters plus current size.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            sets: self.stats.sets.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, version: &str, tags: &[&str]) -> RuleMetadata {
        RuleMetadata::new(id, version).with_tags(tags.iter().map(|t| t.to_string()))
    }

    #[test]
    fn lru_eviction_matches_scenario_1() {
        let cache = RuleCache::new(3);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &["t-a"]));
        cache.set("B", b"b".to_vec(), meta("B", "1.0.0", &["t-b"]));
        cache.set("C", b"c".to_vec(), meta("C", "1.0.0", &["t-c"]));

        assert!(cache.get("A").is_some());
        cache.set("D", b"d".to_vec(), meta("D", "1.0.0", &["t-d"]));

        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert!(cache.get("D").is_some());
        assert!(cache.get("B").is_none());
        assert!(cache.get_rules_by_tags(&["t-b".to_string()]).is_empty());
    }

    #[test]
    fn set_existing_key_does_not_evict() {
        let cache = RuleCache::new(2);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &[]));
        cache.set("B", b"b".to_vec(), meta("B", "1.0.0", &[]));
        cache.set("A", b"a2".to_vec(), meta("A", "1.0.1", &[]));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("A"), Some(b"a2".to_vec()));
        assert!(cache.get("B").is_some());
    }

    #[test]
    fn empty_tag_list_returns_empty() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &["x"]));
        assert!(cache.get_rules_by_tags(&[]).is_empty());
    }

    #[test]
    fn get_rules_by_tags_is_set_intersection() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &["x", "y"]));
        cache.set("B", b"b".to_vec(), meta("B", "1.0.0", &["x"]));

        assert_eq!(
            cache.get_rules_by_tags(&["x".to_string(), "y".to_string()]),
            vec!["A".to_string()]
        );
    }

    #[test]
    fn invalidate_removes_from_tag_index() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &["x"]));
        cache.invalidate("A");
        assert!(cache.get("A").is_none());
        assert!(cache.get_rules_by_tags(&["x".to_string()]).is_empty());
    }

    #[test]
    fn is_version_current_after_set() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "2.1.0", &[]));
        assert!(cache.is_version_current("A", "2.1.0"));
        assert!(!cache.is_version_current("A", "2.0.0"));
    }

    #[test]
    fn clear_resets_everything() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &["x"]));
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(cache.get_rules_by_tags(&["x".to_string()]).is_empty());
    }

    #[test]
    fn ids_lists_every_resident_entry() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &[]));
        cache.set("B", b"b".to_vec(), meta("B", "1.0.0", &[]));
        let mut ids = cache.ids();
        ids.sort();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = RuleCache::new(10);
        cache.set("A", b"a".to_vec(), meta("A", "1.0.0", &[]));
        let _ = cache.get("A");
        let _ = cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }
}
