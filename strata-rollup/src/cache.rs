// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./cache_test.rs"]
mod cache_test;

use crate::aggregation::Bucket;
use crate::model::{DurationHierarchy, Metric, Timestamp, WindowDuration};
use bd_server_stats::stats::Scope;
use dashmap::DashMap;
use prometheus::{IntCounter, IntGauge};
use std::collections::{BTreeMap, HashMap};

//
// Stats
//

struct Stats {
  hit: IntCounter,
  miss: IntCounter,
  evicted: IntCounter,
  entries: IntGauge,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("bucket_cache");
    Self {
      hit: scope.counter("hit"),
      miss: scope.counter("miss"),
      evicted: scope.counter("evicted"),
      entries: scope.gauge("entries"),
    }
  }
}

//
// CacheEntry
//

// Buckets keyed by start instant. [covered_from, processed_through) is the contiguous range for
// which the entry is authoritative: any bucket that exists in that range is present.
#[derive(Default)]
struct CacheEntry {
  buckets: BTreeMap<Timestamp, Bucket>,
  covered_from: Option<Timestamp>,
  processed_through: Option<Timestamp>,
}

impl CacheEntry {
  fn covers(&self, from: Timestamp, to: Timestamp) -> bool {
    match (self.covered_from, self.processed_through) {
      (Some(covered_from), Some(processed_through)) => {
        covered_from <= from && to <= processed_through
      },
      _ => false,
    }
  }
}

//
// BucketCache
//

// Write-through cache of recently produced buckets, shared by every worker in the process. Writers
// for a given (metric, duration) are serialized by ring ownership so entries are never contended
// by more than one rollup at a time.
pub struct BucketCache {
  entries: DashMap<(Metric, WindowDuration), CacheEntry>,
  retention: HashMap<WindowDuration, WindowDuration>,
  stats: Stats,
}

impl BucketCache {
  #[must_use]
  pub fn new(hierarchy: &DurationHierarchy, scope: &Scope) -> Self {
    Self {
      entries: DashMap::new(),
      retention: hierarchy
        .all()
        .iter()
        .filter_map(|d| hierarchy.cache_retention(*d).map(|r| (*d, r)))
        .collect(),
      stats: Stats::new(scope),
    }
  }

  // Returns None when the cache cannot answer for the full range, in which case the caller must
  // read the persistent store. Some(empty) means the range was processed and produced nothing.
  #[must_use]
  pub fn multi_get(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    from: Timestamp,
    to: Timestamp,
  ) -> Option<Vec<Bucket>> {
    let Some(entry) = self.entries.get(&(metric.clone(), duration)) else {
      self.stats.miss.inc();
      return None;
    };
    if !entry.covers(from, to) {
      self.stats.miss.inc();
      return None;
    }

    self.stats.hit.inc();
    Some(entry.buckets.range(from .. to.max(from)).map(|(_, b)| b.clone()).collect())
  }

  pub fn multi_set(&self, metric: &Metric, duration: WindowDuration, buckets: &[Bucket]) {
    if !self.retention.contains_key(&duration) || buckets.is_empty() {
      return;
    }

    let mut entry = self
      .entries
      .entry((metric.clone(), duration))
      .or_default();
    for bucket in buckets {
      entry.buckets.insert(bucket.number.start(), bucket.clone());
    }
    drop(entry);
    self.update_entries_gauge();
  }

  // Record that [from, to) has been fully folded into the cache for this metric and duration, then
  // drop anything older than the retention window ending at `to`.
  pub fn mark_processed_tick(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    from: Timestamp,
    to: Timestamp,
  ) {
    let Some(retention) = self.retention.get(&duration) else {
      return;
    };

    let mut entry = self
      .entries
      .entry((metric.clone(), duration))
      .or_default();
    if entry.processed_through != Some(from) {
      entry.covered_from = Some(from);
    }
    entry.processed_through = Some(to);

    let horizon = to.plus_millis(-retention.millis());
    if entry.covered_from.is_some_and(|covered_from| covered_from < horizon) {
      entry.covered_from = Some(horizon);
    }
    let covered_from = entry.covered_from.unwrap_or(horizon);
    let retained = entry.buckets.split_off(&covered_from);
    let evicted = entry.buckets.len();
    entry.buckets = retained;
    drop(entry);

    self.stats.evicted.inc_by(evicted as u64);
    self.update_entries_gauge();
  }

  fn update_entries_gauge(&self) {
    self
      .stats
      .entries
      .set(i64::try_from(self.entries.len()).unwrap_or(i64::MAX));
  }
}
