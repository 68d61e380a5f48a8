// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test::{hierarchy, make_metric, millis};
use pretty_assertions::assert_eq;
use tokio_test::assert_err;

#[test]
fn metric_identity_ignores_tag_order() {
  let a = make_metric("requests", MetricType::Counter, &[("host", "a"), ("az", "1")]);
  let b = make_metric("requests", MetricType::Counter, &[("az", "1"), ("host", "a")]);
  assert_eq!(a, b);
  assert_eq!(a.to_string(), "requests(counter){az=1,host=a}");

  let c = make_metric("requests", MetricType::Gauge, &[("az", "1"), ("host", "a")]);
  assert_ne!(a, c);
}

#[test]
fn window_duration_display() {
  assert_eq!(millis(1000).to_string(), "1s");
  assert_eq!(millis(60_000).to_string(), "1m");
  assert_eq!(millis(3_600_000).to_string(), "1h");
  assert_eq!(millis(1500).to_string(), "1500ms");
  assert_err!(WindowDuration::from_millis(0));
}

#[test]
fn aligned_to() {
  let minute = millis(60_000);
  assert_eq!(
    Timestamp::from_millis(125_000).aligned_to(minute),
    Timestamp::from_millis(120_000)
  );
  assert_eq!(
    Timestamp::from_millis(120_000).aligned_to(minute),
    Timestamp::from_millis(120_000)
  );
  assert_eq!(
    Timestamp::from_millis(-1).aligned_to(minute),
    Timestamp::from_millis(-60_000)
  );
}

#[test]
fn bucket_numbers_partition_time() {
  for duration in [millis(1000), millis(60_000), millis(3_600_000)] {
    let mut previous: Option<BucketNumber> = None;
    for ms in (-7_200_000 .. 7_200_000).step_by(997) {
      let timestamp = Timestamp::from_millis(ms);
      let bucket = BucketNumber::of(timestamp, duration);
      assert_eq!(bucket, BucketNumber::of(timestamp, duration));
      assert!(bucket.contains(timestamp));
      assert!(!bucket.next().contains(timestamp));
      assert!(!bucket.previous().contains(timestamp));
      assert_eq!(bucket.end(), bucket.next().start());
      assert_eq!(bucket.end().millis() - bucket.start().millis(), duration.millis());

      if let Some(previous) = previous {
        assert!(bucket.number() == previous.number() || bucket.number() == previous.number() + 1);
      }
      previous = Some(bucket);
    }
  }
}

#[test]
fn bucket_conversion_between_durations() {
  let second = millis(1000);
  let minute = millis(60_000);
  let bucket = BucketNumber::of(Timestamp::from_millis(61_500), second);
  assert_eq!(bucket.number(), 61);
  assert_eq!(bucket.at_duration(minute), BucketNumber::new(minute, 1));
  assert_eq!(
    BucketNumber::new(minute, 2).at_duration(second),
    BucketNumber::new(second, 120)
  );
}

#[test]
fn tick_targets_last_completed_window() {
  let minute = millis(60_000);
  let tick = Tick::fired_at(Timestamp::from_millis(180_500), minute);
  assert_eq!(tick.bucket, BucketNumber::new(minute, 2));
  assert_eq!(tick.duration(), minute);
}

#[test]
fn hierarchy_navigation() {
  let hierarchy = hierarchy(&[1000, 60_000, 3_600_000]);
  let (second, minute, hour) = (millis(1000), millis(60_000), millis(3_600_000));

  assert!(hierarchy.is_base(second));
  assert!(hierarchy.is_terminal(hour));
  assert_eq!(hierarchy.previous(second), None);
  assert_eq!(hierarchy.previous(minute), Some(second));
  assert_eq!(hierarchy.next(minute), Some(hour));
  assert_eq!(hierarchy.next(hour), None);
  assert_eq!(hierarchy.rollup_durations(), &[minute, hour]);
  assert_eq!(hierarchy.cache_retention(second), Some(minute));
  assert_eq!(hierarchy.cache_retention(minute), Some(hour));
  assert_eq!(hierarchy.cache_retention(hour), None);
}

#[test]
fn hierarchy_validation() {
  assert_err!(DurationHierarchy::new(vec![(millis(1000), None)]));
  assert_err!(DurationHierarchy::new(vec![
    (millis(1000), None),
    (millis(1500), None)
  ]));
  assert_err!(DurationHierarchy::new(vec![
    (millis(60_000), None),
    (millis(60_000), None)
  ]));
  let hierarchy = DurationHierarchy::new(vec![
    (millis(1000), Some(millis(120_000))),
    (millis(60_000), None),
  ])
  .unwrap();
  assert_eq!(hierarchy.cache_retention(millis(1000)), Some(millis(120_000)));
}
