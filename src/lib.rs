// Scheduled host-metrics synchronization and hardware verification engine.

pub mod common;
pub mod config;
pub mod datasource;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod sync;
pub mod task_manager;
pub mod verification;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::task_manager::EngineStore;
use std::sync::Arc;

/// Runs the engine until the process receives Ctrl-C.
pub async fn run() -> Result<()> {
    config::init_logging();

    let config = EngineConfig::load()?;
    log::info!("Opening local store at {}", config.database_url);
    let pool = common::storage::init_pool(&config.database_url, config.max_connections).await?;
    let store = Arc::new(EngineStore::new(pool).await?);

    let engine = Engine::new(config, store)?;
    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}
