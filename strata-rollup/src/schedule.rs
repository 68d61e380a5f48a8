// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./schedule_test.rs"]
mod schedule_test;

use crate::model::{Timestamp, WindowDuration};
use crate::time::TimeProvider;
use async_trait::async_trait;
use bd_time::TimeDurationExt;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

pub const LEADERSHIP_SCHEDULE: &str = "leadership";
pub const DISCOVERY_SCHEDULE: &str = "discovery";

#[must_use]
pub fn tick_schedule_name(duration: WindowDuration) -> String {
  format!("tick:{duration}")
}

//
// Ticker
//

// A source of fire instants. Implementations decide how long to wait, the caller decides what a
// fire means.
#[async_trait]
pub trait Ticker: Send {
  async fn next(&mut self) -> Timestamp;
}

//
// CronTicker
//

pub struct CronTicker {
  schedule: Schedule,
  time_provider: Arc<dyn TimeProvider>,
}

impl CronTicker {
  #[must_use]
  pub const fn new(schedule: Schedule, time_provider: Arc<dyn TimeProvider>) -> Self {
    Self {
      schedule,
      time_provider,
    }
  }

  // The first fire instant strictly after the current time, or None if the expression has no
  // further occurrences.
  #[must_use]
  pub fn next_fire(&self) -> Option<Timestamp> {
    let now = DateTime::<Utc>::from_timestamp_millis(self.time_provider.now().millis())?;
    self
      .schedule
      .after(&now)
      .next()
      .map(|next| Timestamp::from_millis(next.timestamp_millis()))
  }
}

#[async_trait]
impl Ticker for CronTicker {
  async fn next(&mut self) -> Timestamp {
    loop {
      let Some(fire_at) = self.next_fire() else {
        log::warn!("cron schedule '{}' has no further occurrences", self.schedule);
        return std::future::pending().await;
      };

      let wait = fire_at.millis() - self.time_provider.now().millis();
      if wait > 0 {
        time::Duration::milliseconds(wait).sleep().await;
      }
      if self.time_provider.now() >= fire_at {
        return fire_at;
      }
    }
  }
}

//
// IntervalTicker
//

// Fixed period ticker with an initial delay. Missed ticks are delayed rather than bursted.
pub struct IntervalTicker {
  interval: Interval,
  time_provider: Arc<dyn TimeProvider>,
}

impl IntervalTicker {
  #[must_use]
  pub fn new(
    start_delay: Duration,
    period: Duration,
    time_provider: Arc<dyn TimeProvider>,
  ) -> Self {
    let mut interval = tokio::time::interval_at(Instant::now() + start_delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Self {
      interval,
      time_provider,
    }
  }
}

#[async_trait]
impl Ticker for IntervalTicker {
  async fn next(&mut self) -> Timestamp {
    self.interval.tick().await;
    self.time_provider.now()
  }
}

//
// ScheduleFactory
//

// Creates the tickers that drive the coordinator. Each ticker is identified by a name so that
// tests can fire them by hand.
pub trait ScheduleFactory: Send + Sync {
  fn cron(&self, name: &str, schedule: &Schedule) -> Box<dyn Ticker>;
  fn interval(&self, name: &str, start_delay: Duration, period: Duration) -> Box<dyn Ticker>;
}

//
// RealScheduleFactory
//

pub struct RealScheduleFactory {
  time_provider: Arc<dyn TimeProvider>,
}

impl RealScheduleFactory {
  #[must_use]
  pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
    Self { time_provider }
  }
}

impl ScheduleFactory for RealScheduleFactory {
  fn cron(&self, name: &str, schedule: &Schedule) -> Box<dyn Ticker> {
    log::debug!("creating cron schedule {name}: {schedule}");
    Box::new(CronTicker::new(schedule.clone(), self.time_provider.clone()))
  }

  fn interval(&self, name: &str, start_delay: Duration, period: Duration) -> Box<dyn Ticker> {
    log::debug!("creating interval schedule {name}: {period:?} after {start_delay:?}");
    Box::new(IntervalTicker::new(
      start_delay,
      period,
      self.time_provider.clone(),
    ))
  }
}
