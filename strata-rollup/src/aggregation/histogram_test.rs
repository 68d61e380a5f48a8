// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use matches::assert_matches;
use pretty_assertions::assert_eq;

const BOUNDS: &[f64] = &[1.0, 5.0, 10.0, 50.0];

#[test]
fn from_samples() {
  let bucket = HistogramBucket::from_samples(BOUNDS, &[0.5, 2.0, 3.0, 7.0, 100.0]);
  assert_eq!(
    bucket.bins.iter().map(|b| b.count).collect::<Vec<_>>(),
    vec![1, 2, 1, 1]
  );
  assert_eq!(bucket.count, 5);
  assert_eq!(bucket.sum, 112.5);
  assert_eq!(bucket.min, 0.5);
  assert_eq!(bucket.max, 100.0);
  assert_eq!(bucket.mean(), 22.5);
}

#[test]
fn merge_adds_bins() {
  let a = HistogramBucket::from_samples(BOUNDS, &[2.0, 3.0]);
  let b = HistogramBucket::from_samples(BOUNDS, &[0.5, 20.0]);
  let merged = HistogramBucket::merge([a, b].iter()).unwrap();
  assert_eq!(
    merged.bins.iter().map(|b| b.count).collect::<Vec<_>>(),
    vec![1, 2, 0, 1]
  );
  assert_eq!(merged.count, 4);
  assert_eq!(merged.sum, 25.5);
  assert_eq!(merged.min, 0.5);
  assert_eq!(merged.max, 20.0);
}

#[test]
fn merge_skips_empty_for_min_max() {
  let empty = HistogramBucket::from_samples(BOUNDS, &[]);
  let a = HistogramBucket::from_samples(BOUNDS, &[4.0]);
  let merged = HistogramBucket::merge([empty, a].iter()).unwrap();
  assert_eq!(merged.min, 4.0);
  assert_eq!(merged.max, 4.0);
}

#[test]
fn merge_ignores_bounds_of_empty_inputs() {
  let empty = HistogramBucket::default();
  let a = HistogramBucket::from_samples(BOUNDS, &[4.0]);
  let forward = HistogramBucket::merge([empty.clone(), a.clone()].iter()).unwrap();
  let reverse = HistogramBucket::merge([a.clone(), empty].iter()).unwrap();
  assert_eq!(forward, reverse);
  assert_eq!(forward, a);

  let other_bounds = HistogramBucket::from_samples(&[1.0, 5.0], &[]);
  assert_eq!(
    HistogramBucket::merge([other_bounds.clone(), other_bounds].iter())
      .unwrap()
      .bins
      .len(),
    2
  );
}

#[test]
fn merge_bounds_mismatch() {
  let a = HistogramBucket::from_samples(BOUNDS, &[2.0]);
  let b = HistogramBucket::from_samples(&[1.0, 5.0], &[2.0]);
  assert_matches!(
    HistogramBucket::merge([a, b].iter()),
    Err(AggregationError::BoundsMismatch)
  );
}

#[test]
fn quantiles() {
  let samples: Vec<f64> = (1 ..= 100).map(f64::from).collect();
  let bucket = HistogramBucket::from_samples(&[25.0, 50.0, 75.0, 100.0], &samples);
  assert_eq!(bucket.quantile(0.5), 50.0);
  assert_eq!(bucket.quantile(0.25), 25.0);
  assert_eq!(bucket.quantile(1.0), 100.0);
  assert_eq!(bucket.quantile(0.0), 1.0);

  let p90 = bucket.quantile(0.9);
  assert!((75.0 ..= 100.0).contains(&p90));
}

#[test]
fn quantile_never_leaves_observed_range() {
  let bucket = HistogramBucket::from_samples(&[10.0, 1000.0], &[400.0, 410.0]);
  for q in [0.0, 0.1, 0.5, 0.99, 1.0] {
    let value = bucket.quantile(q);
    assert!((400.0 ..= 410.0).contains(&value), "q={q} value={value}");
  }
  assert_eq!(HistogramBucket::default().quantile(0.5), 0.0);
}
