// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::model::MetricType;
use crate::test::{counter_bucket, make_metric, millis};
use futures::TryStreamExt;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn leader_lock_single_holder() {
  let a = MemoryLeaderLock::new("a");
  let b = a.shared_with("b");

  assert!(a.acquire().await.unwrap());
  // Re-entrant for the holder.
  assert!(a.acquire().await.unwrap());
  assert!(!b.acquire().await.unwrap());
  assert!(!b.release().await.unwrap());
  assert_eq!(b.holder(), Some("a".to_string()));

  assert!(a.release().await.unwrap());
  assert!(b.acquire().await.unwrap());
  assert!(!a.acquire().await.unwrap());
}

#[tokio::test]
async fn metadata_watermarks_and_notices() {
  let store = MemoryMetadataStore::default();
  let metric = make_metric("requests", MetricType::Counter, &[]);
  store.set_active_metrics(vec![metric.clone()]);
  assert_eq!(store.all_active_metrics().await.unwrap(), vec![metric.clone()]);

  assert_eq!(
    store
      .get_last_processed_timestamp(&metric, millis(60_000))
      .await
      .unwrap(),
    None
  );
  store
    .update_last_processed_timestamp(&metric, millis(60_000), Timestamp::from_millis(120_000))
    .await
    .unwrap();
  assert_eq!(
    store
      .get_last_processed_timestamp(&metric, millis(60_000))
      .await
      .unwrap(),
    Some(Timestamp::from_millis(120_000))
  );
  assert_eq!(store.watermark(&metric, millis(1000)), None);

  store
    .notify_empty_slice(&metric, millis(60_000))
    .await
    .unwrap();
  assert_eq!(store.empty_slices(), vec![(metric, millis(60_000))]);
}

#[tokio::test]
async fn bucket_slice_is_half_open() {
  let store = MemoryBucketStore::default();
  let metric = make_metric("requests", MetricType::Counter, &[]);
  let buckets: Vec<Bucket> = (0 .. 10).map(|n| counter_bucket(1000, n, 1.0)).collect();
  store
    .store(&metric, millis(1000), &buckets)
    .await
    .unwrap();

  let sliced: Vec<Bucket> = store
    .slice(
      &metric,
      Timestamp::from_millis(2000),
      Timestamp::from_millis(5000),
      millis(1000),
    )
    .try_collect()
    .await
    .unwrap();
  assert_eq!(sliced, buckets[2 .. 5].to_vec());

  // Other durations and inverted ranges are empty.
  let other: Vec<Bucket> = store
    .slice(
      &metric,
      Timestamp::from_millis(0),
      Timestamp::from_millis(10_000),
      millis(60_000),
    )
    .try_collect()
    .await
    .unwrap();
  assert!(other.is_empty());
  let inverted: Vec<Bucket> = store
    .slice(
      &metric,
      Timestamp::from_millis(5000),
      Timestamp::from_millis(2000),
      millis(1000),
    )
    .try_collect()
    .await
    .unwrap();
  assert!(inverted.is_empty());
}
