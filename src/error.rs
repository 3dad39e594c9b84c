//! Crate-wide error facade.
//!
//! Each subsystem defines its own error enum (`PoolError`, `LoaderError`,
//! `VersionError`, `EngineError`, `ConfigError`, ...); this type wraps them
//! for callers that want one error to `?` across subsystem boundaries.

use thiserror::Error;

use crate::batch::BatcherError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::loader::LoaderError;
use crate::pool::PoolError;
use crate::version::VersionError;

/// Top-level error type for the runtime facade.
#[derive(Debug, Error)]
pub enum RuleCoreError {
    /// Connection pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Loader failure (remote or local).
    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// Version manager failure.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Execution engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Request batcher failure.
    #[error(transparent)]
    Batcher(#[from] BatcherError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for the runtime facade.
pub type Result<T> = std::result::Result<T, RuleCoreError>;
