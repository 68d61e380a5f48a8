// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use super::{AggregationError, Result};
use serde::{Deserialize, Serialize};
use strata_common::LossyIntoToFloat;

//
// HistogramBin
//

// Number of samples that fell at or below `le` and above the previous bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
  pub le: f64,
  pub count: u64,
}

//
// HistogramBucket
//

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
  pub bins: Vec<HistogramBin>,
  pub count: u64,
  pub sum: f64,
  pub min: f64,
  pub max: f64,
}

impl HistogramBucket {
  // Build a bucket from raw samples against fixed, ascending bounds. Samples above the last bound
  // are counted in the last bin.
  #[must_use]
  pub fn from_samples(bounds: &[f64], samples: &[f64]) -> Self {
    let mut bucket = Self {
      bins: bounds
        .iter()
        .map(|le| HistogramBin { le: *le, count: 0 })
        .collect(),
      ..Default::default()
    };

    for sample in samples {
      let index = bounds
        .iter()
        .position(|le| sample <= le)
        .unwrap_or_else(|| bounds.len().saturating_sub(1));
      if let Some(bin) = bucket.bins.get_mut(index) {
        bin.count += 1;
      }
      if bucket.count == 0 {
        bucket.min = *sample;
        bucket.max = *sample;
      } else {
        bucket.min = bucket.min.min(*sample);
        bucket.max = bucket.max.max(*sample);
      }
      bucket.count += 1;
      bucket.sum += sample;
    }

    bucket
  }

  #[must_use]
  pub fn mean(&self) -> f64 {
    if self.count > 0 {
      self.sum / self.count.lossy_to_f64()
    } else {
      0.0
    }
  }

  // Estimate a quantile by linear interpolation inside the bin that holds the target rank. The
  // first bin starts at the observed minimum and the estimate never leaves [min, max].
  #[must_use]
  pub fn quantile(&self, quantile: f64) -> f64 {
    if self.count == 0 {
      return 0.0;
    }

    let rank = quantile.clamp(0.0, 1.0) * self.count.lossy_to_f64();
    let mut seen = 0_u64;
    let mut lower = self.min;
    for bin in &self.bins {
      let upper = if bin.le.is_finite() {
        bin.le.min(self.max)
      } else {
        self.max
      };
      if bin.count > 0 && (seen + bin.count).lossy_to_f64() >= rank {
        let fraction = (rank - seen.lossy_to_f64()) / bin.count.lossy_to_f64();
        let lower = lower.max(self.min);
        return (lower + (upper - lower) * fraction).clamp(self.min, self.max);
      }
      seen += bin.count;
      lower = upper;
    }

    self.max
  }

  // The first non-empty input fixes the bounds for the window and every other non-empty input
  // must use the same bounds. Empty inputs add nothing. If every input is empty the first one
  // still provides the bounds.
  pub(super) fn merge<'a>(inputs: impl Iterator<Item = &'a Self>) -> Result<Self> {
    let inputs: Vec<&Self> = inputs.collect();
    let Some(template) = inputs
      .iter()
      .find(|input| input.count > 0)
      .or_else(|| inputs.first())
    else {
      return Ok(Self::default());
    };
    let mut merged = Self {
      bins: template
        .bins
        .iter()
        .map(|b| HistogramBin { le: b.le, count: 0 })
        .collect(),
      ..Default::default()
    };

    for input in inputs.iter().filter(|input| input.count > 0) {
      if merged.bins.len() != input.bins.len()
        || merged
          .bins
          .iter()
          .zip(&input.bins)
          .any(|(ours, theirs)| ours.le.to_bits() != theirs.le.to_bits())
      {
        return Err(AggregationError::BoundsMismatch);
      }

      for (ours, theirs) in merged.bins.iter_mut().zip(&input.bins) {
        ours.count += theirs.count;
      }
      if merged.count == 0 {
        merged.min = input.min;
        merged.max = input.max;
      } else {
        merged.min = merged.min.min(input.min);
        merged.max = merged.max.max(input.max);
      }
      merged.count += input.count;
      merged.sum += input.sum;
    }

    Ok(merged)
  }
}
