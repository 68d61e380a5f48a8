// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


mod counter;
mod gauge;
mod histogram;

pub use self::counter::CounterBucket;
pub use self::gauge::GaugeBucket;
pub use self::histogram::{HistogramBin, HistogramBucket};
use crate::model::{BucketNumber, MetricType};
use serde::{Deserialize, Serialize};

//
// AggregationError
//

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AggregationError {
  #[error("no input buckets to aggregate")]
  Empty,
  #[error("expected {expected} bucket but found {found}")]
  KindMismatch {
    expected: MetricType,
    found: MetricType,
  },
  #[error("histogram bounds do not match")]
  BoundsMismatch,
}

pub type Result<T> = std::result::Result<T, AggregationError>;

//
// BucketData
//

// Aggregated data for one window. The variant always matches the declared type of the metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketData {
  Counter(CounterBucket),
  Gauge(GaugeBucket),
  Histogram(HistogramBucket),
}

impl BucketData {
  #[must_use]
  pub const fn mtype(&self) -> MetricType {
    match self {
      Self::Counter(_) => MetricType::Counter,
      Self::Gauge(_) => MetricType::Gauge,
      Self::Histogram(_) => MetricType::Histogram,
    }
  }
}

//
// Bucket
//

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
  pub number: BucketNumber,
  pub data: BucketData,
}

impl Bucket {
  #[must_use]
  pub const fn new(number: BucketNumber, data: BucketData) -> Self {
    Self { number, data }
  }
}

// Fold a sequence of finer buckets into a single bucket with the given number. Inputs must all be
// of the metric's declared type and should be ordered by bucket number. The same ordered inputs
// always produce an identical output.
pub fn aggregate(mtype: MetricType, number: BucketNumber, inputs: &[Bucket]) -> Result<Bucket> {
  if inputs.is_empty() {
    return Err(AggregationError::Empty);
  }
  if let Some(mismatch) = inputs.iter().find(|b| b.data.mtype() != mtype) {
    return Err(AggregationError::KindMismatch {
      expected: mtype,
      found: mismatch.data.mtype(),
    });
  }

  let data = match mtype {
    MetricType::Counter => BucketData::Counter(CounterBucket::merge(inputs.iter().filter_map(
      |b| match &b.data {
        BucketData::Counter(c) => Some(c),
        _ => None,
      },
    ))),
    MetricType::Gauge => BucketData::Gauge(GaugeBucket::merge(inputs.iter().filter_map(
      |b| match &b.data {
        BucketData::Gauge(g) => Some(g),
        _ => None,
      },
    ))),
    MetricType::Histogram => BucketData::Histogram(HistogramBucket::merge(
      inputs.iter().filter_map(|b| match &b.data {
        BucketData::Histogram(h) => Some(h),
        _ => None,
      }),
    )?),
  };

  Ok(Bucket::new(number, data))
}

//
// Quantile
//

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
  pub quantile: f64,
  pub value: f64,
}

//
// SummaryData
//

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryData {
  Counter {
    count: f64,
  },
  Gauge {
    min: f64,
    max: f64,
    avg: f64,
    last: f64,
  },
  Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    quantiles: Vec<Quantile>,
  },
}

//
// Summary
//

// Statistics derived from a single bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
  pub number: BucketNumber,
  pub data: SummaryData,
}

impl Summary {
  #[must_use]
  pub fn from_bucket(bucket: &Bucket, quantiles: &[f64]) -> Self {
    let data = match &bucket.data {
      BucketData::Counter(counter) => SummaryData::Counter {
        count: counter.value,
      },
      BucketData::Gauge(gauge) => SummaryData::Gauge {
        min: gauge.min,
        max: gauge.max,
        avg: gauge.avg(),
        last: gauge.last,
      },
      BucketData::Histogram(histogram) => SummaryData::Histogram {
        count: histogram.count,
        sum: histogram.sum,
        min: histogram.min,
        max: histogram.max,
        mean: histogram.mean(),
        quantiles: quantiles
          .iter()
          .map(|q| Quantile {
            quantile: *q,
            value: histogram.quantile(*q),
          })
          .collect(),
      },
    };

    Self {
      number: bucket.number,
      data,
    }
  }
}
