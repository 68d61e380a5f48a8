// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod local;

use crate::master::MasterHandle;
use crate::model::{Metric, WorkerId};
use crate::ring::WorkBatch;
use crate::rollup::RollupEngine;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

//
// WorkerMessage
//

#[derive(Debug)]
pub enum WorkerMessage {
  Work(WorkBatch),
  Heartbeat,
}

//
// WorkerTransport
//

// How the coordinator reaches its workers. Dispatch is fire-and-forget: completion comes back as
// an event on the master handle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerTransport: Send + Sync {
  fn broadcast_heartbeat(&self);

  async fn live_workers(&self) -> anyhow::Result<HashSet<WorkerId>>;

  fn dispatch(&self, worker: &WorkerId, batch: WorkBatch) -> anyhow::Result<()>;

  // Forcibly stop every worker. In-flight rollups are abandoned.
  fn stop_all(&self);
}

//
// WorkerPoolFactory
//

// Creates the worker pool for one leadership term.
pub trait WorkerPoolFactory: Send + Sync {
  fn create(&self, master: MasterHandle) -> Arc<dyn WorkerTransport>;
}

//
// Worker
//

// Executes batches one at a time, rolling up the metrics of a batch concurrently. A worker
// registers itself with the master when it starts and unregisters when its mailbox closes.
pub struct Worker {
  id: WorkerId,
  engine: Arc<RollupEngine>,
  master: MasterHandle,
  concurrency: usize,
}

impl Worker {
  #[must_use]
  pub fn new(
    id: WorkerId,
    engine: Arc<RollupEngine>,
    master: MasterHandle,
    concurrency: usize,
  ) -> Self {
    Self {
      id,
      engine,
      master,
      concurrency: concurrency.max(1),
    }
  }

  pub async fn run(self, mut mailbox: mpsc::UnboundedReceiver<WorkerMessage>) {
    log::debug!("worker {} starting", self.id);
    self.master.register(self.id.clone());

    while let Some(message) = mailbox.recv().await {
      match message {
        WorkerMessage::Heartbeat => log::trace!("worker {} heartbeat", self.id),
        WorkerMessage::Work(batch) => self.process(batch).await,
      }
    }

    log::debug!("worker {} mailbox closed", self.id);
    self.master.unregister(self.id.clone());
  }

  async fn process(&self, batch: WorkBatch) {
    log::debug!(
      "worker {} processing {} metrics for {}",
      self.id,
      batch.metrics.len(),
      batch.tick
    );
    let tick = batch.tick;
    let failed: Vec<Metric> = futures::stream::iter(batch.metrics)
      .map(|metric| async move {
        let result = self.engine.roll_up(&metric, &tick).await;
        (metric, result)
      })
      .buffer_unordered(self.concurrency)
      .filter_map(|(metric, result)| async move { result.is_err().then_some(metric) })
      .collect()
      .await;

    if failed.is_empty() {
      self.master.work_done(self.id.clone());
    } else {
      self.master.work_error(self.id.clone(), failed);
    }
  }
}
