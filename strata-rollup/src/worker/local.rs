// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./local_test.rs"]
mod local_test;

use super::{Worker, WorkerMessage, WorkerPoolFactory, WorkerTransport};
use crate::master::MasterHandle;
use crate::model::WorkerId;
use crate::ring::WorkBatch;
use crate::rollup::RollupEngine;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct LocalWorker {
  mailbox: mpsc::UnboundedSender<WorkerMessage>,
  task: JoinHandle<()>,
}

//
// LocalWorkerPool
//

// In-process transport. Every worker is a tokio task with its own mailbox.
pub struct LocalWorkerPool {
  workers: Mutex<HashMap<WorkerId, LocalWorker>>,
}

impl LocalWorkerPool {
  #[must_use]
  pub fn spawn(
    ids: impl IntoIterator<Item = WorkerId>,
    engine: &Arc<RollupEngine>,
    master: &MasterHandle,
    concurrency: usize,
  ) -> Self {
    let workers = ids
      .into_iter()
      .map(|id| {
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let worker = Worker::new(id.clone(), engine.clone(), master.clone(), concurrency);
        let task = tokio::spawn(worker.run(receiver));
        (id, LocalWorker { mailbox, task })
      })
      .collect();

    Self {
      workers: Mutex::new(workers),
    }
  }
}

#[async_trait]
impl WorkerTransport for LocalWorkerPool {
  fn broadcast_heartbeat(&self) {
    for worker in self.workers.lock().values() {
      let _ignored = worker.mailbox.send(WorkerMessage::Heartbeat);
    }
  }

  async fn live_workers(&self) -> anyhow::Result<HashSet<WorkerId>> {
    Ok(
      self
        .workers
        .lock()
        .iter()
        .filter(|(_, worker)| !worker.task.is_finished())
        .map(|(id, _)| id.clone())
        .collect(),
    )
  }

  fn dispatch(&self, worker: &WorkerId, batch: WorkBatch) -> anyhow::Result<()> {
    let workers = self.workers.lock();
    let local = workers
      .get(worker)
      .ok_or_else(|| anyhow!("unknown worker {worker}"))?;
    local
      .mailbox
      .send(WorkerMessage::Work(batch))
      .map_err(|_| anyhow!("worker {worker} is not running"))
  }

  fn stop_all(&self) {
    for (id, worker) in self.workers.lock().drain() {
      log::debug!("stopping worker {id}");
      worker.task.abort();
    }
  }
}

//
// LocalWorkerPoolFactory
//

pub struct LocalWorkerPoolFactory {
  node_id: String,
  size: usize,
  engine: Arc<RollupEngine>,
  concurrency: usize,
}

impl LocalWorkerPoolFactory {
  #[must_use]
  pub fn new(
    node_id: impl Into<String>,
    size: usize,
    engine: Arc<RollupEngine>,
    concurrency: usize,
  ) -> Self {
    Self {
      node_id: node_id.into(),
      size,
      engine,
      concurrency,
    }
  }
}

impl WorkerPoolFactory for LocalWorkerPoolFactory {
  fn create(&self, master: MasterHandle) -> Arc<dyn WorkerTransport> {
    log::info!("starting {} local workers", self.size);
    Arc::new(LocalWorkerPool::spawn(
      (0 .. self.size).map(|i| WorkerId::from(format!("{}/worker-{i}", self.node_id))),
      &self.engine,
      &master,
      self.concurrency,
    ))
  }
}
