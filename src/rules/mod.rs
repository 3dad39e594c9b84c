//! In-process rule representation, stats, and selection.
//!
//! `RuleStats` follows `other_examples`' data-plane rule table almost
//! verbatim: per-rule evaluation/match/action/error counters plus a
//! running total eval time, all behind relaxed atomics so hot-path
//! evaluation never takes a lock. `RuleManager`'s name index follows the
//! teacher's `enterprise::marketplace::registry::LocalRegistry` pattern
//! of an `Arc<RwLock<HashMap<_, _>>>` kept in sync with whatever backs it
//! (there, a JSON file; here, the set of in-process compiled rules),
//! plus its own tag index, independent of the artifact cache's.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::batchdata::BatchDataContext;

/// Severity of a [`ValidationError`]: errors make the overall result
/// invalid, warnings do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Fails validation overall.
    Error,
    /// Noted but does not fail validation.
    Warning,
}

/// A rule's validate phase found a problem with an item.
#[derive(Debug, Clone, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// The field (or `_system` for an engine-level failure) this error
    /// concerns.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
    /// Whether this fails the item (`Error`) or merely annotates it
    /// (`Warning`).
    pub severity: Severity,
    /// The dataset item this error concerns, when evaluating a batch.
    pub item_id: Option<String>,
}

impl ValidationError {
    /// Build an error-severity validation failure.
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Error,
            item_id: None,
        }
    }

    /// Build a warning-severity validation finding.
    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity: Severity::Warning,
            item_id: None,
        }
    }

    /// Attach the dataset item id this finding concerns.
    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }
}

/// Input handed to a rule at evaluation time: the item currently being
/// transformed/validated, the full dataset it belongs to (so a rule can
/// make cross-item decisions), its position, and whatever batch-scoped
/// shared context the engine resolved for this run.
#[derive(Debug, Clone)]
pub struct RuleContext {
    /// The item currently being processed. Mutated in place as
    /// ascending-priority transforms run.
    pub item: Value,
    /// Every item in the dataset this execution is processing.
    pub all_items: Arc<Vec<Value>>,
    /// Position of `item` within `all_items`.
    pub index: usize,
    /// Free-form caller-supplied metadata, unrelated to the batch data
    /// provider.
    pub metadata: Option<HashMap<String, Value>>,
    /// Shared context resolved once per batch, if this evaluation is part
    /// of one.
    pub batch: Option<Arc<BatchDataContext>>,
}

impl RuleContext {
    /// Build a context for a single item with no dataset siblings.
    pub fn single(item: Value) -> Self {
        Self {
            all_items: Arc::new(vec![item.clone()]),
            item,
            index: 0,
            metadata: None,
            batch: None,
        }
    }

    /// Attach batch-scoped shared context.
    pub fn with_batch(mut self, batch: Arc<BatchDataContext>) -> Self {
        self.batch = Some(batch);
        self
    }
}

/// Running counters for one rule, updated on every evaluation.
#[derive(Debug, Default)]
pub struct RuleStats {
    evaluation_count: AtomicU64,
    match_count: AtomicU64,
    action_count: AtomicU64,
    total_eval_time_us: AtomicU64,
    error_count: AtomicU64,
    last_evaluated_millis: AtomicI64,
}

/// Point-in-time snapshot of [`RuleStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleStatsSnapshot {
    /// Total evaluations attempted.
    pub evaluation_count: u64,
    /// Evaluations whose `transform` produced output (a "match").
    pub match_count: u64,
    /// Number of follow-on actions the engine dispatched for this rule.
    pub action_count: u64,
    /// Evaluations that returned a [`ValidationError`].
    pub error_count: u64,
    /// Average `transform` duration in microseconds across all
    /// evaluations, matches and errors alike.
    pub avg_eval_time_us: u64,
    /// Milliseconds since the Unix epoch of the last evaluation, or 0 if
    /// never evaluated.
    pub last_evaluated_millis: i64,
}

impl RuleStats {
    /// Record one evaluation: whether it matched and how long it took.
    pub fn record_evaluation(&self, matched: bool, duration: Duration) {
        self.evaluation_count.fetch_add(1, Ordering::Relaxed);
        if matched {
            self.match_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_eval_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.last_evaluated_millis
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Record that the engine dispatched an action as a result of this
    /// rule matching.
    pub fn record_action(&self) {
        self.action_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an evaluation that failed validation or transform.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Average transform duration across all recorded evaluations.
    pub fn avg_eval_time_us(&self) -> u64 {
        let count = self.evaluation_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.total_eval_time_us.load(Ordering::Relaxed) / count
    }

    /// Snapshot every counter.
    pub fn snapshot(&self) -> RuleStatsSnapshot {
        RuleStatsSnapshot {
            evaluation_count: self.evaluation_count.load(Ordering::Relaxed),
            match_count: self.match_count.load(Ordering::Relaxed),
            action_count: self.action_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_eval_time_us: self.avg_eval_time_us(),
            last_evaluated_millis: self.last_evaluated_millis.load(Ordering::Relaxed),
        }
    }
}

/// A compiled transform: takes the context (with `item` carrying
/// whatever earlier, lower-priority transforms produced) and returns the
/// next item state. A panic inside is caught by the engine and becomes a
/// `_system` validation error.
pub type TransformFn = dyn Fn(&RuleContext) -> Value + Send + Sync;

/// A compiled validation: inspects the (fully transformed) item and
/// reports zero or more findings, each independently an error or a
/// warning.
pub type ValidateFn = dyn Fn(&RuleContext) -> Vec<ValidationError> + Send + Sync;

/// An in-process rule: identity, selection metadata, and optional
/// compiled behavior, plus live statistics.
///
/// Created by registration; `enabled` is the only field mutated after
/// that (via [`RuleManager::set_rule_enabled`]) — `name`/`priority`/
/// `tags` are immutable for the rule's lifetime, matching the teacher's
/// preference for immutable-by-default domain types with one explicit,
/// narrow mutation path.
pub struct Rule {
    /// Unique key this rule is registered and looked up under.
    pub name: String,
    /// Human-readable summary of what this rule does.
    pub description: String,
    /// Execution order within a selection; lower runs first.
    pub priority: i32,
    /// Tags this rule is indexed under.
    pub tags: HashSet<String>,
    enabled: AtomicBool,
    transform: Option<Arc<TransformFn>>,
    validate: Option<Arc<ValidateFn>>,
    stats: Arc<RuleStats>,
}

impl Rule {
    /// Build a rule. Neither `transform` nor `validate` is required —
    /// a rule with neither is inert but still selectable and countable.
    pub fn new(name: impl Into<String>, description: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            priority,
            tags: HashSet::new(),
            enabled: AtomicBool::new(true),
            transform: None,
            validate: None,
            stats: Arc::new(RuleStats::default()),
        }
    }

    /// Attach tags (builder style).
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Attach a transform (builder style).
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&RuleContext) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Attach a validate (builder style).
    pub fn with_validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&RuleContext) -> Vec<ValidationError> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Start disabled (builder style).
    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::Relaxed);
        self
    }

    /// Whether this rule currently participates in selection.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Relaxed);
    }

    /// This rule's compiled transform, if any.
    pub fn transform(&self) -> Option<&Arc<TransformFn>> {
        self.transform.as_ref()
    }

    /// This rule's compiled validation, if any.
    pub fn validate(&self) -> Option<&Arc<ValidateFn>> {
        self.validate.as_ref()
    }

    /// Handle to this rule's live statistics.
    pub fn stats(&self) -> Arc<RuleStats> {
        self.stats.clone()
    }
}

/// Chooses which registered rules an execution request applies to.
/// `names`, if set, takes precedence; otherwise `tags` narrows to rules
/// carrying any of the given tags; with neither set, every enabled rule
/// is selected. Either way the result is always filtered to enabled
/// rules and sorted ascending by priority.
#[derive(Debug, Clone, Default)]
pub struct RuleSelector {
    /// Select exactly these rule names, when present.
    pub names: Option<Vec<String>>,
    /// Select rules carrying any of these tags, when `names` is absent.
    pub tags: Option<Vec<String>>,
}

impl RuleSelector {
    /// Select every enabled rule.
    pub fn all() -> Self {
        Self::default()
    }

    /// Select by exact name.
    pub fn by_names(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: Some(names.into_iter().collect()),
            tags: None,
        }
    }

    /// Select by tag union.
    pub fn by_tags(tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: None,
            tags: Some(tags.into_iter().collect()),
        }
    }
}

/// In-memory index of compiled rules, keyed by name.
///
/// Distinct from [`crate::cache::RuleCache`]: the cache holds raw
/// artifacts evicted under memory pressure and is keyed by the
/// registry's artifact id, while the manager holds already-compiled
/// `Rule`s the engine selects and evaluates directly, keyed by the
/// rule's own `name`. The manager keeps its own tag index (name ->
/// tag set), synchronized on every registration/removal — it does not
/// delegate to the cache's tag index, which indexes a different
/// namespace (artifact ids, not rule names).
pub struct RuleManager {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
    tag_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    /// Build an empty manager.
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            tag_index: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a compiled rule, keyed by its `name`.
    pub fn add_rule(&self, rule: Rule) {
        let name = rule.name.clone();
        let tags = rule.tags.clone();

        let mut rules = self.rules.write();
        let mut tag_index = self.tag_index.write();

        if let Some(previous) = rules.remove(&name) {
            for tag in &previous.tags {
                if let Some(names) = tag_index.get_mut(tag) {
                    names.remove(&name);
                    if names.is_empty() {
                        tag_index.remove(tag);
                    }
                }
            }
        }

        for tag in &tags {
            tag_index.entry(tag.clone()).or_default().insert(name.clone());
        }
        rules.insert(name, Arc::new(rule));
    }

    /// Remove a rule from the index by name.
    pub fn remove_rule(&self, name: &str) {
        let mut rules = self.rules.write();
        let mut tag_index = self.tag_index.write();

        if let Some(rule) = rules.remove(name) {
            for tag in &rule.tags {
                if let Some(names) = tag_index.get_mut(tag) {
                    names.remove(name);
                    if names.is_empty() {
                        tag_index.remove(tag);
                    }
                }
            }
        }
    }

    /// Enable or disable a rule in place. Returns `false` if no rule is
    /// registered under `name`.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.rules.read().get(name) {
            Some(rule) => {
                rule.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Fetch a registered rule by name, regardless of whether it is
    /// currently enabled.
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    fn sort_by_priority(mut rules: Vec<Arc<Rule>>) -> Vec<Arc<Rule>> {
        rules.sort_by_key(|r| r.priority);
        rules
    }

    /// Every registered rule (enabled or not), sorted ascending by
    /// priority.
    pub fn get_all_rules(&self) -> Vec<Arc<Rule>> {
        Self::sort_by_priority(self.rules.read().values().cloned().collect())
    }

    /// Every enabled rule, sorted ascending by priority.
    pub fn get_enabled_rules(&self) -> Vec<Arc<Rule>> {
        Self::sort_by_priority(
            self.rules
                .read()
                .values()
                .filter(|r| r.enabled())
                .cloned()
                .collect(),
        )
    }

    /// Every enabled rule carrying any of `tags` (union, not
    /// intersection), sorted ascending by priority.
    pub fn get_rules_by_tags(&self, tags: &[String]) -> Vec<Arc<Rule>> {
        if tags.is_empty() {
            return Vec::new();
        }

        let tag_index = self.tag_index.read();
        let mut matched: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some(names) = tag_index.get(tag) {
                matched.extend(names.iter().cloned());
            }
        }
        drop(tag_index);

        let rules = self.rules.read();
        Self::sort_by_priority(
            matched
                .into_iter()
                .filter_map(|name| rules.get(&name).cloned())
                .filter(|r| r.enabled())
                .collect(),
        )
    }

    /// Resolve a selector against the current registry: `names` wins if
    /// set (order from the selector is not preserved — the result is
    /// always priority-sorted and always filtered to enabled rules, even
    /// for an exact-name selection, since naming a disabled rule does not
    /// implicitly re-enable it), otherwise `tags`, otherwise every
    /// enabled rule.
    pub fn resolve_selector(&self, selector: &RuleSelector) -> Vec<Arc<Rule>> {
        if let Some(names) = &selector.names {
            let rules = self.rules.read();
            return Self::sort_by_priority(
                names
                    .iter()
                    .filter_map(|name| rules.get(name).cloned())
                    .filter(|r| r.enabled())
                    .collect(),
            );
        }

        if let Some(tags) = &selector.tags {
            return self.get_rules_by_tags(tags);
        }

        self.get_enabled_rules()
    }

    /// Number of registered rules (enabled or not).
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
