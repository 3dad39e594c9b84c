use std::path::PathBuf;
use std::sync::Arc;

use rulecore::config::{RuleSource, RuntimeConfig};
use rulecore::engine::ExecutionEngine;
use rulecore::loader::{LocalLoader, RemoteLoader, RuleLoader};
use rulecore::rules::RuleManager;
use rulecore::{init_tracing, RULECORE_VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("RULECORE_CONFIG_FILE").ok().map(PathBuf::from);
    let config = RuntimeConfig::load(config_path.as_deref())?;
    init_tracing(&config.log_filter);

    info!(version = RULECORE_VERSION, source = ?config.rule_source, "starting rulecore");

    let loader: Arc<dyn RuleLoader> = match config.rule_source {
        RuleSource::Cloud => Arc::new(RemoteLoader::new(
            config.remote.clone(),
            config.pool.clone(),
            config.batching.clone(),
        )?),
        RuleSource::Local => Arc::new(LocalLoader::new(config.local.clone())),
    };

    let ids = loader.list_ids().await?;
    info!(rule_count = ids.len(), "discovered rules");

    let manager = Arc::new(RuleManager::new());
    let _engine = ExecutionEngine::new(manager, config.engine);

    Ok(())
}
