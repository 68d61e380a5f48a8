// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::aggregation::{Bucket, BucketData, CounterBucket, GaugeBucket, HistogramBucket};
use crate::cache::BucketCache;
use crate::config::Settings;
use crate::master::{MasterHandle, MasterSnapshot};
use crate::model::{
  BucketNumber,
  DurationHierarchy,
  Metric,
  MetricType,
  TagValue,
  Tick,
  Timestamp,
  WindowDuration,
  WorkerId,
};
use crate::ring::WorkBatch;
use crate::rollup::{RollupEngine, RollupStores};
use crate::schedule::{ScheduleFactory, Ticker};
use crate::store::memory::{MemoryBucketStore, MemoryMetadataStore, MemorySummaryStore};
use crate::worker::{WorkerPoolFactory, WorkerTransport};
use anyhow::anyhow;
use async_trait::async_trait;
use bd_server_stats::stats::Scope;
use bd_time::TimeDurationExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::ext::NumericalDuration;
use tokio::sync::mpsc;

pub const HISTOGRAM_BOUNDS: &[f64] = &[1.0, 2.0, 5.0, 10.0];

#[must_use]
pub fn millis(millis: i64) -> WindowDuration {
  WindowDuration::from_millis(millis).unwrap()
}

#[must_use]
pub fn hierarchy(durations: &[i64]) -> DurationHierarchy {
  DurationHierarchy::new(durations.iter().map(|d| (millis(*d), None)).collect()).unwrap()
}

#[must_use]
pub fn make_metric(name: &str, mtype: MetricType, tags: &[(&str, &str)]) -> Metric {
  Metric::new(
    name,
    mtype,
    tags
      .iter()
      .map(|(tag, value)| TagValue {
        tag: (*tag).to_string(),
        value: (*value).to_string(),
      })
      .collect(),
  )
}

#[must_use]
pub fn make_tick(duration: i64, number: i64) -> Tick {
  Tick {
    bucket: BucketNumber::new(millis(duration), number),
  }
}

#[must_use]
pub fn counter_bucket(duration: i64, number: i64, value: f64) -> Bucket {
  Bucket::new(
    BucketNumber::new(millis(duration), number),
    BucketData::Counter(CounterBucket::new(value)),
  )
}

#[must_use]
pub fn gauge_bucket(duration: i64, number: i64, value: f64) -> Bucket {
  Bucket::new(
    BucketNumber::new(millis(duration), number),
    BucketData::Gauge(GaugeBucket::from_value(value)),
  )
}

#[must_use]
pub fn histogram_bucket(duration: i64, number: i64, samples: &[f64]) -> Bucket {
  Bucket::new(
    BucketNumber::new(millis(duration), number),
    BucketData::Histogram(HistogramBucket::from_samples(HISTOGRAM_BOUNDS, samples)),
  )
}

// Second, minute and hour tiers with ticks every minute and every hour.
#[must_use]
pub fn make_settings(batch_size: usize) -> Arc<Settings> {
  let yaml = format!(
    r#"
leadership:
  check_interval: 1s
durations:
  - duration: 1s
  - duration: 1m
    cron: "0 * * * * *"
  - duration: 1h
    cron: "0 0 * * * *"
dispatch:
  batch_size: {batch_size}
"#
  );
  Arc::new(Settings::new(serde_yaml::from_str(&yaml).unwrap()).unwrap())
}

// Engine over in-memory stores. The bucket store is returned so tests can ingest base data.
#[must_use]
pub fn memory_engine(
  durations: &[i64],
  scope: &Scope,
) -> (Arc<RollupEngine>, Arc<MemoryBucketStore>) {
  let hierarchy = hierarchy(durations);
  let buckets = Arc::new(MemoryBucketStore::default());
  let engine = RollupEngine::new(
    hierarchy.clone(),
    vec![0.5],
    Duration::from_secs(300),
    RollupStores {
      metadata: Arc::new(MemoryMetadataStore::default()),
      buckets: buckets.clone(),
      summaries: Arc::new(MemorySummaryStore::default()),
    },
    Arc::new(BucketCache::new(&hierarchy, scope)),
    scope,
  );
  (Arc::new(engine), buckets)
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
  for _ in 0 .. 1000 {
    if condition() {
      return;
    }
    5.milliseconds().sleep().await;
  }
  panic!("condition was not reached");
}

pub async fn wait_for_snapshot(
  handle: &MasterHandle,
  condition: impl Fn(&MasterSnapshot) -> bool,
) -> MasterSnapshot {
  let mut last = None;
  for _ in 0 .. 1000 {
    let snapshot = handle.snapshot().await.unwrap();
    if condition(&snapshot) {
      return snapshot;
    }
    last = Some(snapshot);
    5.milliseconds().sleep().await;
  }
  panic!("snapshot condition was not reached, last: {last:?}");
}

//
// ManualScheduleFactory
//

struct ManualTicker {
  receiver: mpsc::UnboundedReceiver<Timestamp>,
}

#[async_trait]
impl Ticker for ManualTicker {
  async fn next(&mut self) -> Timestamp {
    match self.receiver.recv().await {
      Some(fired_at) => fired_at,
      None => std::future::pending().await,
    }
  }
}

// Tickers that only fire when a test says so, addressed by schedule name.
#[derive(Default)]
pub struct ManualScheduleFactory {
  senders: Mutex<HashMap<String, mpsc::UnboundedSender<Timestamp>>>,
}

impl ManualScheduleFactory {
  fn make(&self, name: &str) -> Box<dyn Ticker> {
    let (sender, receiver) = mpsc::unbounded_channel();
    self.senders.lock().insert(name.to_string(), sender);
    Box::new(ManualTicker { receiver })
  }

  // Returns false if no running ticker has the name.
  pub fn fire(&self, name: &str, fired_at: i64) -> bool {
    self
      .senders
      .lock()
      .get(name)
      .is_some_and(|sender| sender.send(Timestamp::from_millis(fired_at)).is_ok())
  }

  #[must_use]
  pub fn is_open(&self, name: &str) -> bool {
    self
      .senders
      .lock()
      .get(name)
      .is_some_and(|sender| !sender.is_closed())
  }
}

impl ScheduleFactory for ManualScheduleFactory {
  fn cron(&self, name: &str, _schedule: &cron::Schedule) -> Box<dyn Ticker> {
    self.make(name)
  }

  fn interval(&self, name: &str, _start_delay: Duration, _period: Duration) -> Box<dyn Ticker> {
    self.make(name)
  }
}

//
// ManualTransport
//

// Records dispatches instead of running workers. Tests play the workers through the master handle.
#[derive(Default)]
pub struct ManualTransport {
  pub dispatched: Mutex<Vec<(WorkerId, WorkBatch)>>,
  pub live: Mutex<HashSet<WorkerId>>,
  pub unreachable: Mutex<HashSet<WorkerId>>,
  pub heartbeats: AtomicUsize,
  pub stopped: AtomicUsize,
}

impl ManualTransport {
  #[must_use]
  pub fn dispatched(&self) -> Vec<(WorkerId, WorkBatch)> {
    self.dispatched.lock().clone()
  }

  #[must_use]
  pub fn dispatch_count(&self) -> usize {
    self.dispatched.lock().len()
  }
}

#[async_trait]
impl WorkerTransport for ManualTransport {
  fn broadcast_heartbeat(&self) {
    self.heartbeats.fetch_add(1, Ordering::SeqCst);
  }

  async fn live_workers(&self) -> anyhow::Result<HashSet<WorkerId>> {
    Ok(self.live.lock().clone())
  }

  fn dispatch(&self, worker: &WorkerId, batch: WorkBatch) -> anyhow::Result<()> {
    if self.unreachable.lock().contains(worker) {
      return Err(anyhow!("{worker} is unreachable"));
    }
    self.dispatched.lock().push((worker.clone(), batch));
    Ok(())
  }

  fn stop_all(&self) {
    self.stopped.fetch_add(1, Ordering::SeqCst);
  }
}

#[derive(Default)]
pub struct ManualPoolFactory {
  pub transport: Arc<ManualTransport>,
}

impl WorkerPoolFactory for ManualPoolFactory {
  fn create(&self, _master: MasterHandle) -> Arc<dyn WorkerTransport> {
    self.transport.clone()
  }
}
