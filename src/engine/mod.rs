//! Rule execution: an ordered pipeline applied to a dataset of items.
//!
//! Every mode resolves a rule selection from the [`RuleManager`], runs
//! every selected rule carrying a `transform` in ascending-priority
//! order against each item (transforms are always sequential, even under
//! `parallel` mode, since each one depends on the previous one's output),
//! then runs every rule carrying a `validate` against the final
//! transformed item and partitions its findings into errors and
//! warnings. The bounded-concurrency fan-out across *items* follows the
//! teacher's job scheduler (`scheduling::scheduler`/`scheduling::queue`):
//! a `Semaphore` caps how many items are in flight at once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::batchdata::BatchDataContext;
use crate::config::EngineConfig;
use crate::rules::{Rule, RuleManager, RuleSelector, Severity, ValidationError};

/// Execution engine failures. Only raised when `continue_on_error` is
/// false and a rule's compiled transform panics; with it set (the
/// default), the same failure becomes a `_system` entry in
/// [`ExecutionResult::errors`] instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule's transform panicked and the engine was configured to
    /// abort rather than degrade.
    #[error("rule {rule} transform panicked on item {index}")]
    RuleFailed {
        /// The rule whose transform panicked.
        rule: String,
        /// Index of the offending item within the dataset.
        index: usize,
    },
}

/// Result type for the execution engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Aggregate outcome of running a dataset through a rule selection.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Every item after all applicable transforms ran, in input order.
    pub data: Vec<Value>,
    /// Error-severity validation findings across the whole dataset.
    pub errors: Vec<ValidationError>,
    /// Warning-severity validation findings across the whole dataset.
    pub warnings: Vec<ValidationError>,
    /// Whether `errors` is empty.
    pub is_valid: bool,
    /// Wall-clock time spent running the whole pipeline.
    pub execution_time: Duration,
    /// Total number of (item, rule) evaluations performed.
    pub rules_executed: usize,
}

fn run_item_pipeline(
    rules: &[Arc<Rule>],
    item: Value,
    all_items: &Arc<Vec<Value>>,
    index: usize,
    batch: Option<Arc<BatchDataContext>>,
    continue_on_error: bool,
) -> Result<(Value, Vec<ValidationError>, Vec<ValidationError>, usize)> {
    let mut current = item;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut rules_executed = 0usize;

    for rule in rules.iter().filter(|r| r.transform().is_some()) {
        let ctx = crate::rules::RuleContext {
            item: current.clone(),
            all_items: all_items.clone(),
            index,
            metadata: None,
            batch: batch.clone(),
        };
        let transform = rule.transform().expect("filtered above").clone();

        match catch_unwind(AssertUnwindSafe(|| transform(&ctx))) {
            Ok(next) => {
                current = next;
                rules_executed += 1;
                rule.stats().record_action();
            }
            Err(_) => {
                rule.stats().record_error();
                if continue_on_error {
                    errors.push(
                        ValidationError::error(
                            "_system",
                            format!("rule '{}' transform panicked", rule.name),
                        )
                        .with_item_id(index.to_string()),
                    );
                } else {
                    return Err(EngineError::RuleFailed {
                        rule: rule.name.clone(),
                        index,
                    });
                }
            }
        }
    }

    for rule in rules.iter().filter(|r| r.validate().is_some()) {
        let ctx = crate::rules::RuleContext {
            item: current.clone(),
            all_items: all_items.clone(),
            index,
            metadata: None,
            batch: batch.clone(),
        };
        let validate = rule.validate().expect("filtered above").clone();

        let findings = match catch_unwind(AssertUnwindSafe(|| validate(&ctx))) {
            Ok(findings) => findings,
            Err(_) => {
                rule.stats().record_error();
                if continue_on_error {
                    vec![ValidationError::error(
                        "_system",
                        format!("rule '{}' validate panicked", rule.name),
                    )
                    .with_item_id(index.to_string())]
                } else {
                    return Err(EngineError::RuleFailed {
                        rule: rule.name.clone(),
                        index,
                    });
                }
            }
        };
        rules_executed += 1;

        for finding in findings {
            match finding.severity {
                Severity::Error => errors.push(finding),
                Severity::Warning => warnings.push(finding),
            }
        }
    }

    Ok((current, errors, warnings, rules_executed))
}

/// Drives rule evaluation over a dataset against a [`RuleManager`],
/// honoring [`EngineConfig`]'s concurrency bound and error policy.
pub struct ExecutionEngine {
    manager: Arc<RuleManager>,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Build an engine over `manager` with the given configuration.
    pub fn new(manager: Arc<RuleManager>, config: EngineConfig) -> Self {
        Self { manager, config }
    }

    fn finish(
        started: Instant,
        data: Vec<Value>,
        errors: Vec<ValidationError>,
        warnings: Vec<ValidationError>,
        rules_executed: usize,
    ) -> ExecutionResult {
        ExecutionResult {
            is_valid: errors.is_empty(),
            data,
            errors,
            warnings,
            execution_time: started.elapsed(),
            rules_executed,
        }
    }

    /// Process every item in order, one at a time.
    #[instrument(skip(self, items, batch), fields(component = "engine", mode = "sequential"))]
    pub fn execute_sequential(
        &self,
        selector: &RuleSelector,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let rules = self.manager.resolve_selector(selector);
        let all_items = Arc::new(items.clone());

        let mut data = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut rules_executed = 0usize;

        for (index, item) in items.into_iter().enumerate() {
            let (out, item_errors, item_warnings, count) = run_item_pipeline(
                &rules,
                item,
                &all_items,
                index,
                batch.clone(),
                self.config.continue_on_error,
            )?;
            data.push(out);
            errors.extend(item_errors);
            warnings.extend(item_warnings);
            rules_executed += count;
        }

        Ok(Self::finish(started, data, errors, warnings, rules_executed))
    }

    /// Process items concurrently, bounded by `config.max_concurrency`
    /// in-flight items at a time. Each item's own transform chain still
    /// runs strictly in ascending-priority order; only the items
    /// themselves overlap.
    #[instrument(skip(self, items, batch), fields(component = "engine", mode = "parallel"))]
    pub async fn execute_parallel(
        &self,
        selector: &RuleSelector,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let rules = self.manager.resolve_selector(selector);
        self.run_items_bounded(rules, items, batch, started).await
    }

    /// Process every enabled registered rule against every item, ignoring
    /// any selector.
    #[instrument(skip(self, items, batch), fields(component = "engine", mode = "execute_all_parallel"))]
    pub async fn execute_all_parallel(
        &self,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let rules = self.manager.get_enabled_rules();
        self.run_all_pairs_concurrently(rules, items, batch, started)
            .await
    }

    /// Chunk the dataset into groups of `config.max_concurrency` items
    /// and process each chunk concurrently, one chunk after another. Used
    /// for large datasets where `execute_parallel`'s single bounded
    /// fan-out would hold every item's context in memory at once.
    #[instrument(skip(self, items, batch), fields(component = "engine", mode = "batch"))]
    pub async fn execute_batch(
        &self,
        selector: &RuleSelector,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let rules = self.manager.resolve_selector(selector);
        let all_items = Arc::new(items.clone());
        let chunk_size = self.config.max_concurrency.max(1);

        let mut data = Vec::with_capacity(items.len());
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut rules_executed = 0usize;

        for (chunk_start, chunk) in items.chunks(chunk_size).enumerate() {
            let base_index = chunk_start * chunk_size;
            let tasks = chunk.iter().enumerate().map(|(offset, item)| {
                let rules = rules.clone();
                let all_items = all_items.clone();
                let batch = batch.clone();
                let item = item.clone();
                let index = base_index + offset;
                let continue_on_error = self.config.continue_on_error;
                async move {
                    run_item_pipeline(&rules, item, &all_items, index, batch, continue_on_error)
                }
            });

            for result in join_all(tasks).await {
                let (out, item_errors, item_warnings, count) = result?;
                data.push(out);
                errors.extend(item_errors);
                warnings.extend(item_warnings);
                rules_executed += count;
            }
        }

        Ok(Self::finish(started, data, errors, warnings, rules_executed))
    }

    async fn run_items_bounded(
        &self,
        rules: Vec<Arc<Rule>>,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let all_items = Arc::new(items.clone());
        let continue_on_error = self.config.continue_on_error;

        let tasks = items.into_iter().enumerate().map(|(index, item)| {
            let rules = rules.clone();
            let all_items = all_items.clone();
            let batch = batch.clone();
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while the engine is alive");
                run_item_pipeline(&rules, item, &all_items, index, batch, continue_on_error)
            }
        });

        let mut data = Vec::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut rules_executed = 0usize;

        for result in join_all(tasks).await {
            let (out, item_errors, item_warnings, count) = result?;
            data.push(out);
            errors.extend(item_errors);
            warnings.extend(item_warnings);
            rules_executed += count;
        }

        Ok(Self::finish(started, data, errors, warnings, rules_executed))
    }

    /// Every (item, rule-with-transform) pair races concurrently against
    /// a shared per-item cell: each task reads whatever the cell
    /// currently holds, applies its transform, and writes the result
    /// back, with no ordering guarantee between racing writers. This is
    /// deliberately looser than the priority-chained modes above — it
    /// trades determinism for running the full (item x rule) cross
    /// product without per-item sequencing overhead.
    async fn run_all_pairs_concurrently(
        &self,
        rules: Vec<Arc<Rule>>,
        items: Vec<Value>,
        batch: Option<Arc<BatchDataContext>>,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let all_items = Arc::new(items.clone());
        let cells: Vec<Arc<Mutex<Value>>> =
            items.into_iter().map(|item| Arc::new(Mutex::new(item))).collect();

        let transform_rules: Vec<Arc<Rule>> =
            rules.iter().filter(|r| r.transform().is_some()).cloned().collect();

        let mut tasks = Vec::with_capacity(cells.len() * transform_rules.len().max(1));
        for (index, cell) in cells.iter().enumerate() {
            for rule in &transform_rules {
                let cell = Arc::clone(cell);
                let rule = Arc::clone(rule);
                let all_items = all_items.clone();
                let batch = batch.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.push(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed while the engine is alive");
                    let snapshot = cell.lock().clone();
                    let ctx = crate::rules::RuleContext {
                        item: snapshot,
                        all_items,
                        index,
                        metadata: None,
                        batch,
                    };
                    let transform = rule.transform().expect("filtered above").clone();
                    match catch_unwind(AssertUnwindSafe(|| transform(&ctx))) {
                        Ok(next) => {
                            *cell.lock() = next;
                            rule.stats().record_action();
                            None
                        }
                        Err(_) => {
                            rule.stats().record_error();
                            Some(ValidationError::error(
                                "_system",
                                format!("rule '{}' transform panicked", rule.name),
                            )
                            .with_item_id(index.to_string()))
                        }
                    }
                });
            }
        }

        let mut errors: Vec<ValidationError> = join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect();
        let mut warnings = Vec::new();
        let mut rules_executed = transform_rules.len() * cells.len();

        let validate_rules: Vec<Arc<Rule>> =
            rules.iter().filter(|r| r.validate().is_some()).cloned().collect();

        for (index, cell) in cells.iter().enumerate() {
            let current = cell.lock().clone();
            for rule in &validate_rules {
                let ctx = crate::rules::RuleContext {
                    item: current.clone(),
                    all_items: all_items.clone(),
                    index,
                    metadata: None,
                    batch: batch.clone(),
                };
                let findings = (rule.validate().expect("filtered above"))(&ctx);
                rules_executed += 1;
                for finding in findings {
                    match finding.severity {
                        Severity::Error => errors.push(finding),
                        Severity::Warning => warnings.push(finding),
                    }
                }
            }
        }

        let data: Vec<Value> = cells.iter().map(|c| c.lock().clone()).collect();
        Ok(Self::finish(started, data, errors, warnings, rules_executed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig {
            max_concurrency: 4,
            continue_on_error: true,
        }
    }

    fn manager_with_priority_chain() -> Arc<RuleManager> {
        let manager = Arc::new(RuleManager::new());
        manager.add_rule(Rule::new("add-one", "", 10).with_transform(|ctx| {
            let n = ctx.item.as_i64().unwrap_or(0);
            json!(n + 1)
        }));
        manager.add_rule(Rule::new("double", "", 0).with_transform(|ctx| {
            let n = ctx.item.as_i64().unwrap_or(0);
            json!(n * 2)
        }));
        manager
    }

    #[test]
    fn sequential_chains_transforms_by_ascending_priority() {
        let engine = ExecutionEngine::new(manager_with_priority_chain(), config());
        let result = engine
            .execute_sequential(&RuleSelector::all(), vec![json!(3)], None)
            .unwrap();

        // priority 0 (double) runs before priority 10 (add-one): (3*2)+1 = 7
        assert_eq!(result.data, vec![json!(7)]);
        assert!(result.is_valid);
        assert_eq!(result.rules_executed, 2);
    }

    #[test]
    fn validation_errors_and_warnings_partition_by_severity() {
        let manager = Arc::new(RuleManager::new());
        manager.add_rule(Rule::new("check", "", 0).with_validate(|ctx| {
            let mut findings = Vec::new();
            if ctx.item.as_i64().unwrap_or(0) < 0 {
                findings.push(ValidationError::error("value", "must be non-negative"));
            }
            if ctx.item.as_i64().unwrap_or(0) == 0 {
                findings.push(ValidationError::warning("value", "zero is unusual"));
            }
            findings
        }));

        let engine = ExecutionEngine::new(manager, config());
        let result = engine
            .execute_sequential(&RuleSelector::all(), vec![json!(-1), json!(0), json!(5)], None)
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(!result.is_valid);
    }

    #[test]
    fn transform_panic_becomes_system_error_when_continue_on_error() {
        let manager = Arc::new(RuleManager::new());
        manager.add_rule(Rule::new("boom", "", 0).with_transform(|_ctx| panic!("boom")));

        let engine = ExecutionEngine::new(manager, config());
        let result = engine
            .execute_sequential(&RuleSelector::all(), vec![json!(1)], None)
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "_system");
        assert!(!result.is_valid);
    }

    #[test]
    fn transform_panic_aborts_when_continue_on_error_is_false() {
        let manager = Arc::new(RuleManager::new());
        manager.add_rule(Rule::new("boom", "", 0).with_transform(|_ctx| panic!("boom")));

        let mut cfg = config();
        cfg.continue_on_error = false;
        let engine = ExecutionEngine::new(manager, cfg);

        let err = engine
            .execute_sequential(&RuleSelector::all(), vec![json!(1)], None)
            .unwrap_err();
        assert!(matches!(err, EngineError::RuleFailed { .. }));
    }

    #[tokio::test]
    async fn parallel_produces_same_result_as_sequential() {
        let engine = ExecutionEngine::new(manager_with_priority_chain(), config());
        let items = vec![json!(1), json!(2), json!(3)];

        let result = engine
            .execute_parallel(&RuleSelector::all(), items.clone(), None)
            .await
            .unwrap();

        assert_eq!(result.data, vec![json!(3), json!(5), json!(7)]);
    }

    #[tokio::test]
    async fn execute_batch_chunks_and_aggregates() {
        let engine = ExecutionEngine::new(manager_with_priority_chain(), config());
        let items: Vec<Value> = (0..10).map(|n| json!(n)).collect();

        let result = engine
            .execute_batch(&RuleSelector::all(), items, None)
            .await
            .unwrap();

        assert_eq!(result.data.len(), 10);
        assert_eq!(result.rules_executed, 20);
    }

    #[tokio::test]
    async fn execute_all_parallel_runs_every_rule_against_every_item() {
        let manager = Arc::new(RuleManager::new());
        manager.add_rule(Rule::new("increment", "", 0).with_transform(|ctx| {
            json!(ctx.item.as_i64().unwrap_or(0) + 1)
        }));

        let engine = ExecutionEngine::new(manager, config());
        let result = engine
            .execute_all_parallel(vec![json!(1), json!(2)], None)
            .await
            .unwrap();

        assert_eq!(result.data.len(), 2);
        assert_eq!(result.rules_executed, 2);
    }
}
