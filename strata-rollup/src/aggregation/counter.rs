// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use serde::{Deserialize, Serialize};

//
// CounterBucket
//

// Delta counter total over the window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterBucket {
  pub value: f64,
}

impl CounterBucket {
  #[must_use]
  pub const fn new(value: f64) -> Self {
    Self { value }
  }

  pub(super) fn merge<'a>(inputs: impl Iterator<Item = &'a Self>) -> Self {
    Self {
      value: inputs.map(|c| c.value).sum(),
    }
  }
}
