// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use anyhow::bail;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

//
// MetricType
//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
  Counter,
  Gauge,
  Histogram,
}

impl fmt::Display for MetricType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Counter => "counter",
      Self::Gauge => "gauge",
      Self::Histogram => "histogram",
    })
  }
}

//
// TagValue
//

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagValue {
  pub tag: String,
  pub value: String,
}

//
// Metric
//

// Identity of a metric. Tags are kept sorted so that two metrics built from the same tag set in a
// different order compare, hash, and shard identically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metric {
  name: String,
  mtype: MetricType,
  tags: Vec<TagValue>,
}

impl Metric {
  #[must_use]
  pub fn new(name: impl Into<String>, mtype: MetricType, mut tags: Vec<TagValue>) -> Self {
    tags.sort();
    tags.dedup_by(|a, b| a.tag == b.tag);
    Self {
      name: name.into(),
      mtype,
      tags,
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub const fn mtype(&self) -> MetricType {
    self.mtype
  }

  #[must_use]
  pub fn tags(&self) -> &[TagValue] {
    &self.tags
  }
}

impl fmt::Display for Metric {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}({}){{{}}}",
      self.name,
      self.mtype,
      self
        .tags
        .iter()
        .map(|t| format!("{}={}", t.tag, t.value))
        .join(",")
    )
  }
}

//
// WorkerId
//

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
  #[must_use]
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for WorkerId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

impl From<String> for WorkerId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

impl fmt::Display for WorkerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

//
// WindowDuration
//

// Length of a rollup window with millisecond resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowDuration(i64);

impl WindowDuration {
  pub fn from_millis(millis: i64) -> anyhow::Result<Self> {
    if millis <= 0 {
      bail!("window duration must be positive, got {millis}ms");
    }
    Ok(Self(millis))
  }

  pub fn from_std(duration: std::time::Duration) -> anyhow::Result<Self> {
    Self::from_millis(i64::try_from(duration.as_millis())?)
  }

  #[must_use]
  pub const fn millis(self) -> i64 {
    self.0
  }

  #[must_use]
  pub const fn is_multiple_of(self, other: Self) -> bool {
    self.0 > other.0 && self.0 % other.0 == 0
  }
}

impl fmt::Display for WindowDuration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const UNITS: &[(i64, &str)] = &[
      (86_400_000, "d"),
      (3_600_000, "h"),
      (60_000, "m"),
      (1000, "s"),
    ];
    for (unit, suffix) in UNITS {
      if self.0 % unit == 0 {
        return write!(f, "{}{suffix}", self.0 / unit);
      }
    }
    write!(f, "{}ms", self.0)
  }
}

//
// Timestamp
//

// Absolute instant in milliseconds since the unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
  #[must_use]
  pub const fn from_millis(millis: i64) -> Self {
    Self(millis)
  }

  #[must_use]
  pub const fn millis(self) -> i64 {
    self.0
  }

  // Round down to the start of the window of the given duration that contains this instant.
  #[must_use]
  pub const fn aligned_to(self, duration: WindowDuration) -> Self {
    Self(self.0.div_euclid(duration.0) * duration.0)
  }

  #[must_use]
  pub const fn plus_millis(self, millis: i64) -> Self {
    Self(self.0 + millis)
  }
}

impl fmt::Display for Timestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000) {
      Ok(date_time) => write!(f, "{date_time}"),
      Err(_) => write!(f, "{}ms", self.0),
    }
  }
}

//
// BucketNumber
//

// Index of the half-open interval [number * duration, (number + 1) * duration).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketNumber {
  duration: WindowDuration,
  number: i64,
}

impl BucketNumber {
  #[must_use]
  pub const fn new(duration: WindowDuration, number: i64) -> Self {
    Self { duration, number }
  }

  #[must_use]
  pub const fn of(timestamp: Timestamp, duration: WindowDuration) -> Self {
    Self {
      duration,
      number: timestamp.0.div_euclid(duration.0),
    }
  }

  #[must_use]
  pub const fn duration(&self) -> WindowDuration {
    self.duration
  }

  #[must_use]
  pub const fn number(&self) -> i64 {
    self.number
  }

  #[must_use]
  pub const fn start(&self) -> Timestamp {
    Timestamp(self.number * self.duration.0)
  }

  // Exclusive.
  #[must_use]
  pub const fn end(&self) -> Timestamp {
    Timestamp((self.number + 1) * self.duration.0)
  }

  #[must_use]
  pub const fn next(&self) -> Self {
    Self {
      duration: self.duration,
      number: self.number + 1,
    }
  }

  #[must_use]
  pub const fn previous(&self) -> Self {
    Self {
      duration: self.duration,
      number: self.number - 1,
    }
  }

  // Re-express this bucket at another duration. For a coarser duration this is the containing
  // bucket, for a finer duration it is the first bucket inside this one.
  #[must_use]
  pub const fn at_duration(&self, duration: WindowDuration) -> Self {
    Self::of(self.start(), duration)
  }

  #[must_use]
  pub const fn contains(&self, timestamp: Timestamp) -> bool {
    self.start().0 <= timestamp.0 && timestamp.0 < self.end().0
  }
}

impl fmt::Display for BucketNumber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.duration, self.number)
  }
}

//
// Tick
//

// A scheduling event for one window duration. The bucket is the most recently completed window at
// the time the tick fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tick {
  pub bucket: BucketNumber,
}

impl Tick {
  #[must_use]
  pub const fn fired_at(fired_at: Timestamp, duration: WindowDuration) -> Self {
    Self {
      bucket: BucketNumber::of(fired_at, duration).previous(),
    }
  }

  #[must_use]
  pub const fn duration(&self) -> WindowDuration {
    self.bucket.duration()
  }
}

impl fmt::Display for Tick {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tick({} @ {})", self.bucket, self.bucket.start())
  }
}

//
// DurationHierarchy
//

// Ascending window durations. The first entry is the base tier written by ingestion, every other
// entry is rolled up from its predecessor.
#[derive(Clone, Debug)]
pub struct DurationHierarchy {
  durations: Vec<WindowDuration>,
  retention_overrides: Vec<Option<WindowDuration>>,
}

impl DurationHierarchy {
  pub fn new(tiers: Vec<(WindowDuration, Option<WindowDuration>)>) -> anyhow::Result<Self> {
    if tiers.len() < 2 {
      bail!("at least two window durations are required");
    }
    for (finer, coarser) in tiers.iter().tuple_windows() {
      if !coarser.0.is_multiple_of(finer.0) {
        bail!(
          "window duration {} must be a strict multiple of {}",
          coarser.0,
          finer.0
        );
      }
    }

    let (durations, retention_overrides) = tiers.into_iter().unzip();
    Ok(Self {
      durations,
      retention_overrides,
    })
  }

  fn index_of(&self, duration: WindowDuration) -> Option<usize> {
    self.durations.iter().position(|d| *d == duration)
  }

  #[must_use]
  pub fn base(&self) -> WindowDuration {
    self.durations[0]
  }

  #[must_use]
  pub fn is_base(&self, duration: WindowDuration) -> bool {
    self.base() == duration
  }

  #[must_use]
  pub fn terminal(&self) -> WindowDuration {
    self.durations[self.durations.len() - 1]
  }

  #[must_use]
  pub fn is_terminal(&self, duration: WindowDuration) -> bool {
    self.terminal() == duration
  }

  #[must_use]
  pub fn previous(&self, duration: WindowDuration) -> Option<WindowDuration> {
    self
      .index_of(duration)
      .and_then(|i| i.checked_sub(1))
      .map(|i| self.durations[i])
  }

  #[must_use]
  pub fn next(&self, duration: WindowDuration) -> Option<WindowDuration> {
    self
      .index_of(duration)
      .and_then(|i| self.durations.get(i + 1).copied())
  }

  // Every duration that is produced by rolling up its predecessor.
  #[cfg(test)]
  #[must_use]
  pub fn rollup_durations(&self) -> &[WindowDuration] {
    &self.durations[1 ..]
  }

  #[must_use]
  pub fn all(&self) -> &[WindowDuration] {
    &self.durations
  }

  // How long cached buckets at this duration must be retained: an explicit override, otherwise
  // exactly one window of the next tier, which is everything the next tier will ever read back.
  // Without an override the terminal tier is never cached.
  #[must_use]
  pub fn cache_retention(&self, duration: WindowDuration) -> Option<WindowDuration> {
    let index = self.index_of(duration)?;
    self.retention_overrides[index].or_else(|| self.next(duration))
  }
}
