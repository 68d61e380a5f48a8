// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use crate::model::{DurationHierarchy, WindowDuration};
use anyhow::{Context, bail};
use cron::Schedule;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const fn default_start_delay() -> Duration {
  Duration::from_secs(5)
}

const fn default_discovery_interval() -> Duration {
  Duration::from_secs(10)
}

const fn default_check_interval() -> Duration {
  Duration::from_secs(10)
}

const fn default_failure_threshold() -> u32 {
  2
}

const fn default_batch_size() -> usize {
  100
}

const fn default_concurrency() -> usize {
  16
}

const fn default_virtual_nodes() -> u32 {
  128
}

const fn default_max_lateness() -> Duration {
  Duration::from_secs(300)
}

fn default_quantiles() -> Vec<f64> {
  vec![0.5, 0.95, 0.99]
}

//
// DiscoveryConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
  #[serde(with = "humantime_serde", default = "default_start_delay")]
  pub start_delay: Duration,
  #[serde(with = "humantime_serde", default = "default_discovery_interval")]
  pub interval: Duration,
}

impl Default for DiscoveryConfig {
  fn default() -> Self {
    Self {
      start_delay: default_start_delay(),
      interval: default_discovery_interval(),
    }
  }
}

//
// LeadershipConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeadershipConfig {
  #[serde(with = "humantime_serde", default = "default_check_interval")]
  pub check_interval: Duration,
  // Consecutive failed lock checks after which a leader steps down.
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
}

impl Default for LeadershipConfig {
  fn default() -> Self {
    Self {
      check_interval: default_check_interval(),
      failure_threshold: default_failure_threshold(),
    }
  }
}

//
// DurationConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DurationConfig {
  #[serde(with = "humantime_serde")]
  pub duration: Duration,
  // Tick expression with a leading seconds field. Required for every duration except the first.
  #[serde(default)]
  pub cron: Option<String>,
  // Cache retention override.
  #[serde(with = "humantime_serde", default)]
  pub retention: Option<Duration>,
}

//
// DispatchConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
    }
  }
}

//
// WorkerConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: default_concurrency(),
    }
  }
}

//
// RingConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingConfig {
  #[serde(default = "default_virtual_nodes")]
  pub virtual_nodes: u32,
}

impl Default for RingConfig {
  fn default() -> Self {
    Self {
      virtual_nodes: default_virtual_nodes(),
    }
  }
}

//
// SummaryConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryConfig {
  #[serde(default = "default_quantiles")]
  pub quantiles: Vec<f64>,
}

impl Default for SummaryConfig {
  fn default() -> Self {
    Self {
      quantiles: default_quantiles(),
    }
  }
}

//
// RollupConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollupConfig {
  #[serde(default)]
  pub discovery: DiscoveryConfig,
  #[serde(default)]
  pub leadership: LeadershipConfig,
  pub durations: Vec<DurationConfig>,
  // How long base data may arrive after its window closes. The first rollup tier holds its
  // watermark on an empty slice for at most this long.
  #[serde(with = "humantime_serde", default = "default_max_lateness")]
  pub max_lateness: Duration,
  #[serde(default)]
  pub dispatch: DispatchConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
  #[serde(default)]
  pub ring: RingConfig,
  #[serde(default)]
  pub summaries: SummaryConfig,
}

//
// Settings
//

// Validated, immutable view of the rollup configuration. Built once at startup and shared by
// reference with the coordinator and the workers.
#[derive(Debug)]
pub struct Settings {
  pub config: RollupConfig,
  pub hierarchy: DurationHierarchy,
  pub ticks: Vec<(WindowDuration, Schedule)>,
}

impl Settings {
  pub fn new(config: RollupConfig) -> anyhow::Result<Self> {
    let mut tiers = Vec::with_capacity(config.durations.len());
    let mut ticks = Vec::new();
    for (index, duration_config) in config.durations.iter().enumerate() {
      let duration = WindowDuration::from_std(duration_config.duration)?;
      let retention = duration_config
        .retention
        .map(WindowDuration::from_std)
        .transpose()?;
      tiers.push((duration, retention));

      match (&duration_config.cron, index) {
        (Some(_), 0) => {
          bail!("the base duration {duration} is produced by ingestion and has no tick")
        },
        (None, 0) => {},
        (None, _) => bail!("duration {duration} requires a tick cron expression"),
        (Some(expression), _) => {
          let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression '{expression}' for {duration}"))?;
          ticks.push((duration, schedule));
        },
      }
    }
    let hierarchy = DurationHierarchy::new(tiers)?;

    if config.dispatch.batch_size == 0 {
      bail!("dispatch.batch_size must be non-zero");
    }
    if config.worker.concurrency == 0 {
      bail!("worker.concurrency must be non-zero");
    }
    if config.ring.virtual_nodes == 0 {
      bail!("ring.virtual_nodes must be non-zero");
    }
    if config.leadership.failure_threshold == 0 {
      bail!("leadership.failure_threshold must be non-zero");
    }
    if config.leadership.check_interval.is_zero() || config.discovery.interval.is_zero() {
      bail!("leadership and discovery intervals must be non-zero");
    }
    if let Some(quantile) = config
      .summaries
      .quantiles
      .iter()
      .find(|q| !(**q > 0.0 && **q < 1.0))
    {
      bail!("summary quantile {quantile} must be in (0, 1)");
    }

    Ok(Self {
      config,
      hierarchy,
      ticks,
    })
  }
}
