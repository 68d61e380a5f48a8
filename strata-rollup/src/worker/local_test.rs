// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::master::Event;
use crate::model::MetricType;
use crate::test::{make_metric, make_tick, memory_engine};
use bd_server_stats::test::util::stats::Helper;
use matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio_test::assert_err;

fn ids(ids: &[&str]) -> HashSet<WorkerId> {
  ids.iter().map(|id| WorkerId::from(*id)).collect()
}

#[tokio::test]
async fn dispatch_and_stop() {
  let helper = Helper::new();
  let (engine, _) = memory_engine(&[1000, 60_000], &helper.collector().scope("test"));
  let (master, mut events) = MasterHandle::detached();
  let pool = LocalWorkerPool::spawn(ids(&["w1", "w2"]), &engine, &master, 4);

  let mut registered = HashSet::new();
  for _ in 0 .. 2 {
    match events.recv().await {
      Some(Event::Register(id)) => {
        registered.insert(id);
      },
      other => panic!("unexpected event {other:?}"),
    }
  }
  assert_eq!(ids(&["w1", "w2"]), registered);
  assert_eq!(ids(&["w1", "w2"]), pool.live_workers().await.unwrap());

  pool.broadcast_heartbeat();
  pool
    .dispatch(
      &"w2".into(),
      WorkBatch {
        tick: make_tick(60_000, 0),
        metrics: vec![make_metric("requests", MetricType::Counter, &[])],
      },
    )
    .unwrap();
  assert_matches!(events.recv().await, Some(Event::WorkDone(id)) if id == WorkerId::from("w2"));

  assert_err!(pool.dispatch(
    &"w3".into(),
    WorkBatch {
      tick: make_tick(60_000, 0),
      metrics: vec![],
    },
  ));

  pool.stop_all();
  assert!(pool.live_workers().await.unwrap().is_empty());
  assert_err!(pool.dispatch(
    &"w1".into(),
    WorkBatch {
      tick: make_tick(60_000, 0),
      metrics: vec![],
    },
  ));
}

#[tokio::test]
async fn factory_names_workers_after_node() {
  let helper = Helper::new();
  let (engine, _) = memory_engine(&[1000, 60_000], &helper.collector().scope("test"));
  let factory = LocalWorkerPoolFactory::new("node-a", 2, engine, 4);
  let (master, _events) = MasterHandle::detached();

  let pool = factory.create(master);
  assert_eq!(
    ids(&["node-a/worker-0", "node-a/worker-1"]),
    pool.live_workers().await.unwrap()
  );
  pool.stop_all();
}
