// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::{Deserialize, Serialize};
use strata_common::LossyIntoToFloat;

//
// GaugeBucket
//

// An aggregated gauge. Last is the final value seen in the window, which relies on the inputs
// being merged in bucket order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeBucket {
  pub count: u64,
  pub sum: f64,
  pub min: f64,
  pub max: f64,
  pub last: f64,
}

impl GaugeBucket {
  // A bucket holding a single sample.
  #[must_use]
  pub const fn from_value(value: f64) -> Self {
    Self {
      count: 1,
      sum: value,
      min: value,
      max: value,
      last: value,
    }
  }

  #[must_use]
  pub fn avg(&self) -> f64 {
    if self.count > 0 {
      self.sum / self.count.lossy_to_f64()
    } else {
      0.0
    }
  }

  pub(super) fn merge<'a>(inputs: impl Iterator<Item = &'a Self>) -> Self {
    let mut merged = Self {
      count: 0,
      sum: 0.0,
      min: 0.0,
      max: 0.0,
      last: 0.0,
    };

    for input in inputs.filter(|g| g.count > 0) {
      if merged.count == 0 {
        merged.min = input.min;
        merged.max = input.max;
      } else {
        merged.min = merged.min.min(input.min);
        merged.max = merged.max.max(input.max);
      }
      merged.count += input.count;
      merged.sum += input.sum;
      merged.last = input.last;
    }

    merged
  }
}
