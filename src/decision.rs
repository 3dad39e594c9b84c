//! External decision-graph evaluation.
//!
//! The CORE's own [`crate::rules::Rule`] is always in-process: a
//! `transform`/`validate` closure pair executed directly by the
//! [`crate::engine::ExecutionEngine`]. Some deployments instead delegate
//! evaluation to an external decision-graph service that holds the rule
//! logic itself and is reached over the network. This trait is that
//! second, optional entry point; it is reached through `Arc<dyn
//! DecisionEvaluator>` the same way [`crate::loader::RuleLoader`] is, so a
//! caller can swap in a remote evaluator without touching the engine.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failures raised while delegating evaluation to an external decision
/// graph.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// The named decision graph does not exist, or the caller isn't
    /// authorized to evaluate it.
    #[error("decision graph not found: {0}")]
    NotFound(String),

    /// Transport failure talking to the evaluator.
    #[error("evaluator request failed: {0}")]
    Transport(String),

    /// The evaluator rejected the input payload.
    #[error("evaluator rejected input: {0}")]
    InvalidInput(String),
}

/// Result type for decision evaluation.
pub type Result<T> = std::result::Result<T, DecisionError>;

/// One item run through a decision graph: the possibly-transformed value
/// plus whatever the graph flagged.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    /// The item after the graph's transforms, if any.
    pub data: Value,
    /// Human-readable messages the graph attached to this evaluation.
    pub messages: Vec<String>,
    /// Whether the graph considered this item valid.
    pub is_valid: bool,
}

/// External evaluator for decision graphs identified by name, distinct
/// from the in-process [`crate::rules::Rule`] pipeline.
#[async_trait]
pub trait DecisionEvaluator: Send + Sync {
    /// Evaluate `item` against the named decision graph.
    async fn evaluate(&self, graph_id: &str, item: Value) -> Result<DecisionOutcome>;

    /// Evaluate `items` against the named decision graph in one call.
    /// Backends that support native batch evaluation should override
    /// this; the default simply evaluates one at a time.
    async fn evaluate_batch(&self, graph_id: &str, items: Vec<Value>) -> Result<Vec<DecisionOutcome>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(self.evaluate(graph_id, item).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoEvaluator;

    #[async_trait]
    impl DecisionEvaluator for EchoEvaluator {
        async fn evaluate(&self, graph_id: &str, item: Value) -> Result<DecisionOutcome> {
            if graph_id.is_empty() {
                return Err(DecisionError::NotFound(graph_id.to_string()));
            }
            Ok(DecisionOutcome {
                data: item,
                messages: Vec::new(),
                is_valid: true,
            })
        }
    }

    #[tokio::test]
    async fn default_evaluate_batch_runs_one_at_a_time() {
        let evaluator = EchoEvaluator;
        let items = vec![Value::from(1), Value::from(2)];
        let out = evaluator.evaluate_batch("graph-a", items).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.is_valid));
    }

    #[tokio::test]
    async fn empty_graph_id_is_not_found() {
        let evaluator = EchoEvaluator;
        let err = evaluator.evaluate("", Value::Null).await.unwrap_err();
        assert!(matches!(err, DecisionError::NotFound(_)));
    }
}
