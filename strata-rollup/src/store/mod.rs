// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod memory;

use crate::aggregation::{Bucket, Summary};
use crate::model::{Metric, Timestamp, WindowDuration};
use async_trait::async_trait;
use futures::stream::BoxStream;

//
// LeaderLock
//

// Cluster-wide single-holder lock used for leader election. Lease semantics belong to the
// implementation. Calls may fail transiently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderLock: Send + Sync {
  // Attempt to take or renew the lock. Returns whether this node holds it.
  async fn acquire(&self) -> anyhow::Result<bool>;

  async fn release(&self) -> anyhow::Result<bool>;
}

//
// MetadataStore
//

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
  async fn all_active_metrics(&self) -> anyhow::Result<Vec<Metric>>;

  // Start instant of the last fully processed window, or None if nothing was ever processed.
  async fn get_last_processed_timestamp(
    &self,
    metric: &Metric,
    duration: WindowDuration,
  ) -> anyhow::Result<Option<Timestamp>>;

  async fn update_last_processed_timestamp(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    timestamp: Timestamp,
  ) -> anyhow::Result<()>;

  // Informational. The metric had no finer data for a window, which makes it a candidate for
  // retirement from the active catalog.
  async fn notify_empty_slice(&self, metric: &Metric, duration: WindowDuration)
  -> anyhow::Result<()>;
}

//
// BucketStore
//

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BucketStore: Send + Sync {
  // Writes are keyed by bucket number so storing the same bucket again overwrites it.
  async fn store(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    buckets: &[Bucket],
  ) -> anyhow::Result<()>;

  // Buckets whose start falls in [from, to), in bucket order.
  fn slice(
    &self,
    metric: &Metric,
    from: Timestamp,
    to: Timestamp,
    duration: WindowDuration,
  ) -> BoxStream<'static, anyhow::Result<Bucket>>;
}

//
// SummaryStore
//

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SummaryStore: Send + Sync {
  async fn store(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    summaries: &[Summary],
  ) -> anyhow::Result<()>;
}
