// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./memory_test.rs"]
mod memory_test;

use super::{BucketStore, LeaderLock, MetadataStore, SummaryStore};
use crate::aggregation::{Bucket, Summary};
use crate::model::{BucketNumber, Metric, Timestamp, WindowDuration};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type SeriesKey = (Metric, WindowDuration);

//
// MemoryLeaderLock
//

// Single-holder lock. Handles created with shared_with() contend on the same holder slot, which
// stands in for several nodes racing on one external lock.
pub struct MemoryLeaderLock {
  holder: Arc<Mutex<Option<String>>>,
  node_id: String,
}

impl MemoryLeaderLock {
  #[must_use]
  pub fn new(node_id: impl Into<String>) -> Self {
    Self {
      holder: Arc::default(),
      node_id: node_id.into(),
    }
  }

  #[must_use]
  pub fn shared_with(&self, node_id: impl Into<String>) -> Self {
    Self {
      holder: self.holder.clone(),
      node_id: node_id.into(),
    }
  }

  #[must_use]
  pub fn holder(&self) -> Option<String> {
    self.holder.lock().clone()
  }
}

#[async_trait]
impl LeaderLock for MemoryLeaderLock {
  async fn acquire(&self) -> anyhow::Result<bool> {
    let mut holder = self.holder.lock();
    match holder.as_deref() {
      None => {
        *holder = Some(self.node_id.clone());
        Ok(true)
      },
      Some(current) => Ok(current == self.node_id),
    }
  }

  async fn release(&self) -> anyhow::Result<bool> {
    let mut holder = self.holder.lock();
    if holder.as_deref() == Some(self.node_id.as_str()) {
      *holder = None;
      Ok(true)
    } else {
      Ok(false)
    }
  }
}

//
// MemoryMetadataStore
//

#[derive(Default)]
pub struct MemoryMetadataStore {
  catalog: Mutex<Vec<Metric>>,
  watermarks: Mutex<HashMap<SeriesKey, Timestamp>>,
  empty_slices: Mutex<Vec<SeriesKey>>,
}

impl MemoryMetadataStore {
  pub fn set_active_metrics(&self, metrics: Vec<Metric>) {
    *self.catalog.lock() = metrics;
  }

  #[must_use]
  pub fn watermark(&self, metric: &Metric, duration: WindowDuration) -> Option<Timestamp> {
    self
      .watermarks
      .lock()
      .get(&(metric.clone(), duration))
      .copied()
  }

  #[must_use]
  pub fn empty_slices(&self) -> Vec<SeriesKey> {
    self.empty_slices.lock().clone()
  }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
  async fn all_active_metrics(&self) -> anyhow::Result<Vec<Metric>> {
    Ok(self.catalog.lock().clone())
  }

  async fn get_last_processed_timestamp(
    &self,
    metric: &Metric,
    duration: WindowDuration,
  ) -> anyhow::Result<Option<Timestamp>> {
    Ok(self.watermark(metric, duration))
  }

  async fn update_last_processed_timestamp(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    timestamp: Timestamp,
  ) -> anyhow::Result<()> {
    self
      .watermarks
      .lock()
      .insert((metric.clone(), duration), timestamp);
    Ok(())
  }

  async fn notify_empty_slice(
    &self,
    metric: &Metric,
    duration: WindowDuration,
  ) -> anyhow::Result<()> {
    log::debug!("empty slice for {metric} at {duration}");
    self.empty_slices.lock().push((metric.clone(), duration));
    Ok(())
  }
}

//
// MemoryBucketStore
//

#[derive(Default)]
pub struct MemoryBucketStore {
  series: Mutex<HashMap<SeriesKey, BTreeMap<Timestamp, Bucket>>>,
}

impl MemoryBucketStore {
  // Write buckets directly, the way ingestion populates the base tier.
  pub fn insert(&self, metric: &Metric, duration: WindowDuration, buckets: &[Bucket]) {
    let mut series = self.series.lock();
    let series = series.entry((metric.clone(), duration)).or_default();
    for bucket in buckets {
      series.insert(bucket.number.start(), bucket.clone());
    }
  }

  #[must_use]
  pub fn buckets(&self, metric: &Metric, duration: WindowDuration) -> Vec<Bucket> {
    self
      .series
      .lock()
      .get(&(metric.clone(), duration))
      .map(|series| series.values().cloned().collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
  async fn store(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    buckets: &[Bucket],
  ) -> anyhow::Result<()> {
    self.insert(metric, duration, buckets);
    Ok(())
  }

  fn slice(
    &self,
    metric: &Metric,
    from: Timestamp,
    to: Timestamp,
    duration: WindowDuration,
  ) -> BoxStream<'static, anyhow::Result<Bucket>> {
    let buckets: Vec<Bucket> = self
      .series
      .lock()
      .get(&(metric.clone(), duration))
      .map(|series| {
        series
          .range(from .. to.max(from))
          .map(|(_, bucket)| bucket.clone())
          .collect()
      })
      .unwrap_or_default();
    futures::stream::iter(buckets.into_iter().map(Ok)).boxed()
  }
}

//
// MemorySummaryStore
//

#[derive(Default)]
pub struct MemorySummaryStore {
  series: Mutex<HashMap<SeriesKey, BTreeMap<BucketNumber, Summary>>>,
}

impl MemorySummaryStore {
  #[must_use]
  pub fn summaries(&self, metric: &Metric, duration: WindowDuration) -> Vec<Summary> {
    self
      .series
      .lock()
      .get(&(metric.clone(), duration))
      .map(|series| series.values().cloned().collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
  async fn store(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    summaries: &[Summary],
  ) -> anyhow::Result<()> {
    let mut series = self.series.lock();
    let series = series.entry((metric.clone(), duration)).or_default();
    for summary in summaries {
      series.insert(summary.number, summary.clone());
    }
    Ok(())
  }
}
