//! Rule-execution runtime: a bounded cache, pluggable rule loaders
//! (remote registry or local directory), version conflict resolution
//! with rollback, a concurrency-bounded execution engine, and an
//! optional trait for delegating evaluation to an external decision
//! graph.
//!
//! # Quick Start
//!
//! ```no_run
//! use rulecore::config::RuntimeConfig;
//! use rulecore::{init_tracing, engine::ExecutionEngine, rules::RuleManager};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RuntimeConfig::load(None)?;
//! init_tracing(&config.log_filter);
//!
//! let manager = Arc::new(RuleManager::new());
//! let _engine = ExecutionEngine::new(manager, config.engine);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Request coalescing for batched registry fetches.
pub mod batch;
/// Single-flight shared context for batches of rule evaluations.
pub mod batchdata;
/// Bounded, tag-indexed rule artifact cache.
pub mod cache;
/// Layered runtime configuration.
pub mod config;
/// Artifact compression.
pub mod compression;
/// External decision-graph evaluation, distinct from in-process rules.
pub mod decision;
/// Crate-wide error facade.
pub mod error;
/// Pooled HTTP client for the remote registry.
pub mod pool;
/// In-process rule representation, stats, and selection.
pub mod rules;
/// Version comparison, conflict resolution, and rollback.
pub mod version;

/// Rule loading: remote registry and local directory backends.
pub mod loader;

/// Rule evaluation in sequential, bounded-parallel, and fan-out modes.
pub mod engine;

pub use error::{Result, RuleCoreError};

/// Crate version, as declared in `Cargo.toml`.
pub const RULECORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a global `tracing` subscriber honoring `filter` (an
/// `EnvFilter`-syntax string, e.g. `"info,rulecore::engine=debug"`).
/// Safe to call once at process startup; subsequent calls are no-ops if a
/// subscriber is already installed.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}
