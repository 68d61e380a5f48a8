// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod master;
pub mod model;
pub mod ring;
pub mod rollup;
pub mod schedule;
pub mod store;
pub mod time;
pub mod worker;

#[cfg(test)]
pub mod test;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  use strata_common::global_initialize;

  global_initialize();
}
