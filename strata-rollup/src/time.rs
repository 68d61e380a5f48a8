// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::model::Timestamp;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

//
// TimeProvider
//

pub trait TimeProvider: Send + Sync + 'static {
  fn now(&self) -> Timestamp;
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now(&self) -> Timestamp {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    Timestamp::from_millis(i64::try_from(millis).unwrap_or(i64::MAX))
  }
}

//
// TestTimeProvider
//

// Millisecond clock that only moves when a test stores into it.
#[derive(Default)]
pub struct TestTimeProvider {
  pub time: Arc<AtomicI64>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(millis: i64) -> Self {
    Self {
      time: Arc::new(AtomicI64::new(millis)),
    }
  }
}

impl TimeProvider for TestTimeProvider {
  fn now(&self) -> Timestamp {
    Timestamp::from_millis(self.time.load(Ordering::SeqCst))
  }
}
