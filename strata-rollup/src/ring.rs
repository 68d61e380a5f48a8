// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./ring_test.rs"]
mod ring_test;

use crate::model::{Metric, Tick, WindowDuration, WorkerId};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::BuildHasher;
use xxhash_rust::xxh64::Xxh64Builder;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RingError {
  #[error("no workers are registered")]
  NoWorkers,
}

//
// WorkBatch
//

// A bounded set of metrics to roll up for one duration, up to and including the tick's window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkBatch {
  pub tick: Tick,
  pub metrics: Vec<Metric>,
}

//
// PendingDuration
//

// Queued metrics for one duration. A metric appears at most once and always runs against the
// newest tick seen for the duration.
struct PendingDuration {
  tick: Tick,
  queue: VecDeque<Metric>,
  queued: HashSet<Metric>,
}

impl PendingDuration {
  fn new(tick: Tick) -> Self {
    Self {
      tick,
      queue: VecDeque::new(),
      queued: HashSet::new(),
    }
  }
}

//
// AffinityRing
//

// Consistent hash ring with virtual nodes. Ownership is sticky: once a metric is assigned it keeps
// its owner until that owner leaves, so joins never move work and a departure only moves the
// departing worker's metrics.
pub struct AffinityRing {
  virtual_nodes: u32,
  hash_builder: Xxh64Builder,
  nodes: BTreeMap<u64, WorkerId>,
  pending: HashMap<WorkerId, BTreeMap<WindowDuration, PendingDuration>>,
  assignments: HashMap<Metric, WorkerId>,
  pending_count: usize,
}

impl AffinityRing {
  #[must_use]
  pub fn new(virtual_nodes: u32) -> Self {
    Self {
      virtual_nodes: virtual_nodes.max(1),
      hash_builder: Xxh64Builder::new(0),
      nodes: BTreeMap::new(),
      pending: HashMap::new(),
      assignments: HashMap::new(),
      pending_count: 0,
    }
  }

  // Returns false if the worker was already a member.
  pub fn register_worker(&mut self, worker: &WorkerId) -> bool {
    if self.pending.contains_key(worker) {
      return false;
    }

    for replica in 0 .. self.virtual_nodes {
      let point = self.hash_builder.hash_one((worker.as_str(), replica));
      // On the rare point collision the earlier member keeps the point.
      self.nodes.entry(point).or_insert_with(|| worker.clone());
    }
    self.pending.insert(worker.clone(), BTreeMap::new());
    true
  }

  // Removes the worker and hands exactly the metrics it owned, including its queued work, to the
  // remaining members. Returns the number of reassigned metrics. If no member remains the metrics
  // become untracked and are picked up again by the next assignment.
  pub fn remove_worker(&mut self, worker: &WorkerId) -> usize {
    let Some(queued) = self.pending.remove(worker) else {
      return 0;
    };
    self.nodes.retain(|_, owner| owner != worker);
    self.pending_count -= queued.values().map(|p| p.queue.len()).sum::<usize>();

    let orphaned: Vec<Metric> = self
      .assignments
      .iter()
      .filter(|(_, owner)| *owner == worker)
      .map(|(metric, _)| metric.clone())
      .collect();
    if self.nodes.is_empty() {
      for metric in &orphaned {
        self.assignments.remove(metric);
      }
      return 0;
    }

    for metric in &orphaned {
      if let Some(owner) = self.lookup(metric) {
        self.assignments.insert(metric.clone(), owner);
      }
    }
    for pending in queued.into_values() {
      for metric in pending.queue {
        self.enqueue(pending.tick, metric);
      }
    }

    orphaned.len()
  }

  #[cfg(test)]
  #[must_use]
  pub fn contains_worker(&self, worker: &WorkerId) -> bool {
    self.pending.contains_key(worker)
  }

  #[must_use]
  pub fn owner(&self, metric: &Metric) -> Option<&WorkerId> {
    self.assignments.get(metric)
  }

  // Queue the metrics for the tick's duration on their owners. Metrics not yet tracked are given
  // the nearest worker clockwise from their hash.
  pub fn assign(
    &mut self,
    tick: &Tick,
    metrics: impl IntoIterator<Item = Metric>,
  ) -> Result<(), RingError> {
    if self.nodes.is_empty() {
      return Err(RingError::NoWorkers);
    }

    for metric in metrics {
      self.enqueue(*tick, metric);
    }
    Ok(())
  }

  // Forget assignments of metrics that are no longer active and have no queued work.
  pub fn prune(&mut self, active: &HashSet<Metric>) {
    let pending = &self.pending;
    self.assignments.retain(|metric, owner| {
      active.contains(metric)
        || pending
          .get(owner)
          .is_some_and(|durations| durations.values().any(|p| p.queued.contains(metric)))
    });
  }

  // Pop up to `max` metrics for the worker, finest duration first.
  pub fn next_metrics(&mut self, worker: &WorkerId, max: usize) -> Option<WorkBatch> {
    let mut first = self.pending.get_mut(worker)?.first_entry()?;
    let pending = first.get_mut();
    let count = max.max(1).min(pending.queue.len());
    let metrics: Vec<Metric> = pending.queue.drain(.. count).collect();
    for metric in &metrics {
      pending.queued.remove(metric);
    }
    let tick = pending.tick;
    if pending.queue.is_empty() {
      first.remove();
    }

    self.pending_count -= metrics.len();
    Some(WorkBatch { tick, metrics })
  }

  #[must_use]
  pub fn has_pending_metrics(&self, worker: &WorkerId) -> bool {
    self
      .pending
      .get(worker)
      .is_some_and(|durations| !durations.is_empty())
  }

  #[must_use]
  pub const fn pending_count(&self) -> usize {
    self.pending_count
  }

  fn lookup(&self, metric: &Metric) -> Option<WorkerId> {
    let hash = self.hash_builder.hash_one(metric);
    self
      .nodes
      .range(hash ..)
      .next()
      .or_else(|| self.nodes.iter().next())
      .map(|(_, worker)| worker.clone())
  }

  fn enqueue(&mut self, tick: Tick, metric: Metric) {
    let owner = match self.assignments.get(&metric) {
      Some(owner) => owner.clone(),
      None => {
        let Some(owner) = self.lookup(&metric) else {
          return;
        };
        self.assignments.insert(metric.clone(), owner.clone());
        owner
      },
    };
    let Some(durations) = self.pending.get_mut(&owner) else {
      debug_assert!(false, "assignment to unknown worker {owner}");
      return;
    };

    let pending = match durations.entry(tick.duration()) {
      Entry::Occupied(entry) => entry.into_mut(),
      Entry::Vacant(entry) => entry.insert(PendingDuration::new(tick)),
    };
    if tick.bucket > pending.tick.bucket {
      pending.tick = tick;
    }
    if pending.queued.insert(metric.clone()) {
      pending.queue.push_back(metric);
      self.pending_count += 1;
    }
  }
}
