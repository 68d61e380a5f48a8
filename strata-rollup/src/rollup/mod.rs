// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::aggregation::{AggregationError, Bucket, Summary, aggregate};
use crate::cache::BucketCache;
use crate::model::{BucketNumber, DurationHierarchy, Metric, Tick, Timestamp, WindowDuration};
use crate::store::{BucketStore, MetadataStore, SummaryStore};
use bd_log::warn_every;
use bd_server_stats::stats::Scope;
use futures::TryStreamExt;
use prometheus::{Histogram, IntCounter};
use std::sync::Arc;
use std::time::Duration;
use time::ext::NumericalDuration;

#[derive(thiserror::Error, Debug)]
pub enum RollupError {
  #[error("{0} is not a rolled up window duration")]
  UnknownDuration(WindowDuration),
  #[error("watermark access failed: {0:#}")]
  Watermark(anyhow::Error),
  #[error("failed to fetch finer buckets: {0:#}")]
  Fetch(anyhow::Error),
  #[error("failed to aggregate: {0}")]
  Aggregate(#[from] AggregationError),
  #[error("failed to persist rollup: {0:#}")]
  Persist(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RollupError>;

//
// Stats
//

struct Stats {
  rollups: IntCounter,
  rollup_failed: IntCounter,
  empty_slice: IntCounter,
  buckets_written: IntCounter,
  summaries_written: IntCounter,
  rollup_time: Histogram,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("rollup");
    Self {
      rollups: scope.counter("rollups"),
      rollup_failed: scope.counter("rollup_failed"),
      empty_slice: scope.counter("empty_slice"),
      buckets_written: scope.counter("buckets_written"),
      summaries_written: scope.counter("summaries_written"),
      rollup_time: scope.histogram("rollup_time"),
    }
  }
}

//
// RollupOutcome
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollupOutcome {
  // Nothing new to roll up, either because the watermark already covers the tick or because the
  // finer tier has not caught up yet.
  UpToDate,
  // No finer data in range. The watermark only moves when the emptiness is confirmed.
  EmptySlice { advanced: bool },
  Produced { buckets: usize },
}

//
// RollupStores
//

#[derive(Clone)]
pub struct RollupStores {
  pub metadata: Arc<dyn MetadataStore>,
  pub buckets: Arc<dyn BucketStore>,
  pub summaries: Arc<dyn SummaryStore>,
}

//
// RollupEngine
//

// Advances one (metric, duration) by the ticks that are due. All outputs are written before the
// watermark moves, and the same finer inputs always produce identical outputs, so a unit that
// fails or is abandoned part way can simply run again.
pub struct RollupEngine {
  hierarchy: DurationHierarchy,
  quantiles: Vec<f64>,
  max_lateness_millis: i64,
  stores: RollupStores,
  cache: Arc<BucketCache>,
  stats: Stats,
}

impl RollupEngine {
  #[must_use]
  pub fn new(
    hierarchy: DurationHierarchy,
    quantiles: Vec<f64>,
    max_lateness: Duration,
    stores: RollupStores,
    cache: Arc<BucketCache>,
    scope: &Scope,
  ) -> Self {
    Self {
      hierarchy,
      quantiles,
      max_lateness_millis: i64::try_from(max_lateness.as_millis()).unwrap_or(i64::MAX),
      stores,
      cache,
      stats: Stats::new(scope),
    }
  }

  pub async fn roll_up(&self, metric: &Metric, tick: &Tick) -> Result<RollupOutcome> {
    self.stats.rollups.inc();
    let _timer = self.stats.rollup_time.start_timer();
    let result = self.roll_up_inner(metric, tick).await;
    if let Err(e) = &result {
      self.stats.rollup_failed.inc();
      warn_every!(1.minutes(), "rollup of {} for {} failed: {}", metric, tick, e);
    }
    result
  }

  async fn roll_up_inner(&self, metric: &Metric, tick: &Tick) -> Result<RollupOutcome> {
    let duration = tick.duration();
    let previous = self
      .hierarchy
      .previous(duration)
      .ok_or(RollupError::UnknownDuration(duration))?;

    let Some((from, to)) = self.pending_range(metric, tick, previous).await? else {
      return Ok(RollupOutcome::UpToDate);
    };
    log::trace!("rolling up {metric} at {duration} over [{from}, {to})");

    // A cached empty result means the producer ran over this range and found nothing. Below the
    // first rollup tier the finer watermark has already passed `to`, which is equally final. Base
    // data is only waited for up to the lateness bound.
    let cached = self.cache.multi_get(metric, previous, from, to);
    let emptiness_confirmed =
      cached.as_ref().is_some_and(Vec::is_empty) || !self.hierarchy.is_base(previous);
    let mut finer = match cached {
      Some(buckets) if !buckets.is_empty() => buckets,
      _ => self
        .stores
        .buckets
        .slice(metric, from, to, previous)
        .try_collect::<Vec<_>>()
        .await
        .map_err(RollupError::Fetch)?,
    };

    if finer.is_empty() {
      self.stats.empty_slice.inc();
      if let Err(e) = self.stores.metadata.notify_empty_slice(metric, duration).await {
        warn_every!(
          1.minutes(),
          "failed to report empty slice for {} at {}: {:#}",
          metric,
          duration,
          e
        );
      }
      let through = if emptiness_confirmed {
        to
      } else {
        Timestamp::from_millis(
          to.millis()
            .saturating_sub(self.max_lateness_millis)
            .max(from.millis()),
        )
        .aligned_to(duration)
      };
      if through <= from {
        return Ok(RollupOutcome::EmptySlice { advanced: false });
      }
      self.advance(metric, duration, from, through).await?;
      return Ok(RollupOutcome::EmptySlice { advanced: true });
    }

    finer.sort_by_key(|bucket| bucket.number);
    let produced = finer
      .chunk_by(|a, b| a.number.at_duration(duration) == b.number.at_duration(duration))
      .map(|group| aggregate(metric.mtype(), group[0].number.at_duration(duration), group))
      .collect::<std::result::Result<Vec<Bucket>, _>>()?;
    let summaries: Vec<Summary> = produced
      .iter()
      .map(|bucket| Summary::from_bucket(bucket, &self.quantiles))
      .collect();

    self
      .stores
      .summaries
      .store(metric, duration, &summaries)
      .await
      .map_err(RollupError::Persist)?;
    self.stats.summaries_written.inc_by(summaries.len() as u64);

    if !self.hierarchy.is_terminal(duration) {
      self
        .stores
        .buckets
        .store(metric, duration, &produced)
        .await
        .map_err(RollupError::Persist)?;
      self.cache.multi_set(metric, duration, &produced);
      self.stats.buckets_written.inc_by(produced.len() as u64);
    }

    self.advance(metric, duration, from, to).await?;
    Ok(RollupOutcome::Produced {
      buckets: produced.len(),
    })
  }

  // The half-open range of finer data still to be folded into this duration, or None when there
  // is nothing to do. Both bounds are aligned to the tick's duration.
  async fn pending_range(
    &self,
    metric: &Metric,
    tick: &Tick,
    previous: WindowDuration,
  ) -> Result<Option<(Timestamp, Timestamp)>> {
    let duration = tick.duration();
    let watermark = match self.watermark(metric, duration).await? {
      Some(watermark) => watermark,
      None => self.seed_watermarks(metric, tick).await?,
    };
    let from = BucketNumber::of(watermark, duration)
      .end()
      .aligned_to(previous);
    let mut to = tick.bucket.next().at_duration(previous).start();

    if !self.hierarchy.is_base(previous) {
      let finer_end = self
        .watermark(metric, previous)
        .await?
        .map_or(from, |w| BucketNumber::of(w, previous).end().aligned_to(duration));
      to = to.min(finer_end);
    }

    Ok((from < to).then_some((from, to)))
  }

  // First sight of the metric at this duration. Nothing before the tick's window is owed here, and
  // coarser tiers without a watermark are seeded from the window containing it so that they start
  // where this tier starts even if their own first tick is missed or finds the finer tier behind.
  // Returns the seed for the tick's duration.
  async fn seed_watermarks(&self, metric: &Metric, tick: &Tick) -> Result<Timestamp> {
    let start = tick.bucket.start();
    let own = tick.bucket.previous().start();
    log::debug!("seeding watermarks of {metric} from {start}");
    self.write_watermark(metric, tick.duration(), own).await?;

    let mut coarser = self.hierarchy.next(tick.duration());
    while let Some(duration) = coarser {
      if self.watermark(metric, duration).await?.is_none() {
        let seed = BucketNumber::of(start, duration).previous().start();
        self.write_watermark(metric, duration, seed).await?;
      }
      coarser = self.hierarchy.next(duration);
    }
    Ok(own)
  }

  async fn write_watermark(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    last_window: Timestamp,
  ) -> Result<()> {
    self
      .stores
      .metadata
      .update_last_processed_timestamp(metric, duration, last_window)
      .await
      .map_err(RollupError::Watermark)
  }

  async fn watermark(
    &self,
    metric: &Metric,
    duration: WindowDuration,
  ) -> Result<Option<Timestamp>> {
    self
      .stores
      .metadata
      .get_last_processed_timestamp(metric, duration)
      .await
      .map_err(RollupError::Watermark)
  }

  async fn advance(
    &self,
    metric: &Metric,
    duration: WindowDuration,
    from: Timestamp,
    to: Timestamp,
  ) -> Result<()> {
    self
      .write_watermark(metric, duration, to.plus_millis(-1).aligned_to(duration))
      .await?;
    if !self.hierarchy.is_terminal(duration) {
      self.cache.mark_processed_tick(metric, duration, from, to);
    }
    Ok(())
  }
}
