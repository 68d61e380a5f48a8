// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test::millis;
use crate::time::TestTimeProvider;
use pretty_assertions::assert_eq;
use std::str::FromStr;
use std::sync::atomic::Ordering;

#[test]
fn cron_next_fire() {
  let time_provider = Arc::new(TestTimeProvider::new(125_000));
  let ticker = CronTicker::new(
    Schedule::from_str("0 * * * * *").unwrap(),
    time_provider.clone(),
  );
  assert_eq!(ticker.next_fire(), Some(Timestamp::from_millis(180_000)));

  // Fire instants are strictly in the future.
  time_provider.time.store(180_000, Ordering::SeqCst);
  assert_eq!(ticker.next_fire(), Some(Timestamp::from_millis(240_000)));
}

#[test]
fn cron_hourly() {
  let ticker = CronTicker::new(
    Schedule::from_str("0 0 * * * *").unwrap(),
    Arc::new(TestTimeProvider::new(3_600_000 + 1)),
  );
  assert_eq!(ticker.next_fire(), Some(Timestamp::from_millis(7_200_000)));
}

#[tokio::test(start_paused = true)]
async fn interval_start_delay() {
  let mut ticker = IntervalTicker::new(
    Duration::from_secs(10),
    Duration::from_secs(60),
    Arc::new(TestTimeProvider::new(42)),
  );
  let start = Instant::now();
  assert_eq!(ticker.next().await, Timestamp::from_millis(42));
  assert!(start.elapsed() >= Duration::from_secs(10));
  ticker.next().await;
  assert!(start.elapsed() >= Duration::from_secs(70));
}

#[test]
fn schedule_names() {
  assert_eq!(tick_schedule_name(millis(60_000)), "tick:1m");
}
