// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod config;


use bd_server_stats::stats::Collector;
use bd_shutdown::ComponentShutdownTrigger;
use config::Config;
use log::info;
use std::future::Future;
use std::sync::Arc;
use strata_rollup::cache::BucketCache;
use strata_rollup::config::Settings;
use strata_rollup::master::{Master, MasterDeps, MasterHandle};
use strata_rollup::rollup::{RollupEngine, RollupStores};
use strata_rollup::schedule::RealScheduleFactory;
use strata_rollup::store::memory::{
  MemoryBucketStore,
  MemoryLeaderLock,
  MemoryMetadataStore,
  MemorySummaryStore,
};
use strata_rollup::time::RealTimeProvider;
use strata_rollup::worker::local::LocalWorkerPoolFactory;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  use strata_common::global_initialize;

  global_initialize();
}

//
// ServerContext
//

// What a running server exposes to its embedder.
pub struct ServerContext {
  pub collector: Collector,
  pub master: MasterHandle,
  pub metadata: Arc<MemoryMetadataStore>,
  pub buckets: Arc<MemoryBucketStore>,
  pub summaries: Arc<MemorySummaryStore>,
}

//
// ServerHooks
//

#[async_trait::async_trait]
pub trait ServerHooks {
  async fn server_started(&self, context: ServerContext);
}

pub struct NullHooks {}

#[async_trait::async_trait]
impl ServerHooks for NullHooks {
  async fn server_started(&self, _context: ServerContext) {}
}

pub async fn run_server<ShutdownFuture: Future<Output = ()>>(
  config: Config,
  config_check_only: bool,
  shutdown: impl FnOnce() -> ShutdownFuture,
  hooks: impl ServerHooks,
) -> anyhow::Result<()> {
  let settings = Arc::new(Settings::new(config.rollup)?);
  if config_check_only {
    info!("--config-check-and-exit set, exiting");
    return Ok(());
  }

  // Setup stats
  let collector = Collector::default();
  let scope = collector.scope(config.meta_prefix.as_deref().unwrap_or("strata"));
  scope.gauge("heartbeat").set(1);

  let metadata = Arc::new(MemoryMetadataStore::default());
  let buckets = Arc::new(MemoryBucketStore::default());
  let summaries = Arc::new(MemorySummaryStore::default());
  let engine = Arc::new(RollupEngine::new(
    settings.hierarchy.clone(),
    settings.config.summaries.quantiles.clone(),
    settings.config.max_lateness,
    RollupStores {
      metadata: metadata.clone(),
      buckets: buckets.clone(),
      summaries: summaries.clone(),
    },
    Arc::new(BucketCache::new(&settings.hierarchy, &scope)),
    &scope,
  ));

  let master = Master::new(
    settings.clone(),
    MasterDeps {
      lock: Arc::new(MemoryLeaderLock::new(config.node_id.as_str())),
      metadata: metadata.clone(),
      pool_factory: Arc::new(LocalWorkerPoolFactory::new(
        config.node_id.as_str(),
        config.local_workers,
        engine,
        settings.config.worker.concurrency,
      )),
      schedules: Arc::new(RealScheduleFactory::new(Arc::new(RealTimeProvider {}))),
    },
    &scope,
  );
  let master_handle = master.handle();

  let shutdown_trigger = ComponentShutdownTrigger::default();
  let master_task = tokio::spawn(master.run(shutdown_trigger.make_shutdown()));
  info!(
    "node {} started with {} local workers",
    config.node_id, config.local_workers
  );

  hooks
    .server_started(ServerContext {
      collector,
      master: master_handle,
      metadata,
      buckets,
      summaries,
    })
    .await;

  shutdown().await;

  shutdown_trigger.shutdown().await;
  if let Err(e) = master_task.await {
    log::warn!("master task failed: {e}");
  }
  info!("runtime terminated");
  Ok(())
}
