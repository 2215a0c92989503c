//! `mahavishnu serve`: boot the subscription gateway against a fresh,
//! in-process control plane, optionally pre-loading a scenario file so
//! there's something to subscribe to.

use std::sync::Arc;

use anyhow::Result;
use mahavishnu_core::ordering::TaskOrderingEngine;
use mahavishnu_core::{Config, DeadLetterQueue, DependencyManager, EventBus, PoolRegistry};
use mahavishnu_gateway::server::{GatewayState, run_gateway};

use crate::config::resolve_control_plane;

pub async fn run(bind: &str, port: u16, scenario_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_control_plane();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let manager = Arc::new(DependencyManager::new());
    let registry = Arc::new(PoolRegistry::new());
    let dlq = Arc::new(DeadLetterQueue::new(config.dlq.max_size));
    let bus = Arc::new(EventBus::new(config.subscription.delivery_queue_size));
    let ordering = Arc::new(TaskOrderingEngine::default());

    if let Some(path) = scenario_path {
        preload(&manager, &registry, path)?;
    }

    let state = GatewayState::new(manager, dlq, registry, bus, ordering, &config);
    run_gateway(state, bind, port).await
}

fn preload(manager: &Arc<DependencyManager>, registry: &Arc<PoolRegistry>, path: &std::path::Path) -> Result<()> {
    let resolved = crate::plan_cmds::load_and_resolve(path, chrono::Utc::now())?;
    for pool in resolved.registry.list_pools() {
        registry.register_pool(pool.pool_id.clone(), pool.pool_type.clone(), pool.min_workers, pool.max_workers)?;
        for worker_id in resolved.workers_by_pool.get(&pool.pool_id).cloned().unwrap_or_default() {
            registry.add_worker(&pool.pool_id, worker_id)?;
        }
    }
    for id in resolved.name_by_id.keys() {
        manager.add_task(*id);
    }
    tracing::info!(tasks = resolved.name_by_id.len(), "preloaded scenario into gateway state");
    Ok(())
}
