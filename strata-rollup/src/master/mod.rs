// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::config::Settings;
use crate::model::{Metric, Tick, Timestamp, WorkerId};
use crate::ring::{AffinityRing, RingError, WorkBatch};
use crate::schedule::{
  DISCOVERY_SCHEDULE,
  LEADERSHIP_SCHEDULE,
  ScheduleFactory,
  Ticker,
  tick_schedule_name,
};
use crate::store::{LeaderLock, MetadataStore};
use crate::worker::{WorkerPoolFactory, WorkerTransport};
use anyhow::anyhow;
use bd_server_stats::stats::Scope;
use bd_shutdown::ComponentShutdown;
use prometheus::{Histogram, IntCounter, IntGauge};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

//
// Stats
//

struct Stats {
  ticks: IntCounter,
  ticks_skipped: IntCounter,
  ticks_completed: IntCounter,
  tick_time: Histogram,
  work_done: IntCounter,
  work_error: IntCounter,
  dispatch_failed: IntCounter,
  leadership_acquired: IntCounter,
  leadership_check_failed: IntCounter,
  step_down: IntCounter,
  unreachable_workers: IntCounter,
  workers: IntGauge,
  pending_metrics: IntGauge,
}

impl Stats {
  fn new(scope: &Scope) -> Self {
    let scope = scope.scope("master");
    Self {
      ticks: scope.counter("ticks"),
      ticks_skipped: scope.counter("ticks_skipped"),
      ticks_completed: scope.counter("ticks_completed"),
      tick_time: scope.histogram("tick_time"),
      work_done: scope.counter("work_done"),
      work_error: scope.counter("work_error"),
      dispatch_failed: scope.counter("dispatch_failed"),
      leadership_acquired: scope.counter("leadership_acquired"),
      leadership_check_failed: scope.counter("leadership_check_failed"),
      step_down: scope.counter("step_down"),
      unreachable_workers: scope.counter("unreachable_workers"),
      workers: scope.gauge("workers"),
      pending_metrics: scope.gauge("pending_metrics"),
    }
  }
}

//
// Event
//

// Everything the coordinator reacts to. Results of asynchronous calls come back as events so that
// coordination state is only ever touched by the coordinator loop.
#[derive(Debug)]
pub(crate) enum Event {
  Initialized,
  LeadershipTimer,
  LeadershipResult(anyhow::Result<bool>),
  Released,
  LivenessTimer,
  LiveWorkers {
    term: u64,
    result: anyhow::Result<HashSet<WorkerId>>,
  },
  Tick(Tick),
  CatalogFetched {
    term: u64,
    generation: u64,
    tick: Tick,
    result: anyhow::Result<Vec<Metric>>,
  },
  Register(WorkerId),
  Unregister(WorkerId),
  Terminated(WorkerId),
  WorkDone(WorkerId),
  WorkError {
    worker: WorkerId,
    failed: Vec<Metric>,
  },
  Snapshot(oneshot::Sender<MasterSnapshot>),
}

//
// Role
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
  Uninitialized,
  BackupLeader,
  Leader,
}

//
// MasterSnapshot
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterSnapshot {
  pub role: Role,
  pub term: u64,
  pub idle: Vec<WorkerId>,
  pub busy: Vec<WorkerId>,
  pub pending: usize,
  // Consecutive lock failures in the current role.
  pub leadership_failures: u32,
}

//
// MasterHandle
//

// Cheap to clone. Used by workers and the transport to report back to the coordinator.
#[derive(Clone, Debug)]
pub struct MasterHandle {
  sender: mpsc::UnboundedSender<Event>,
}

impl MasterHandle {
  #[cfg(test)]
  pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Event>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }

  pub fn register(&self, worker: WorkerId) {
    self.send(Event::Register(worker));
  }

  pub fn unregister(&self, worker: WorkerId) {
    self.send(Event::Unregister(worker));
  }

  pub fn terminated(&self, worker: WorkerId) {
    self.send(Event::Terminated(worker));
  }

  pub fn work_done(&self, worker: WorkerId) {
    self.send(Event::WorkDone(worker));
  }

  pub fn work_error(&self, worker: WorkerId, failed: Vec<Metric>) {
    self.send(Event::WorkError { worker, failed });
  }

  pub async fn snapshot(&self) -> anyhow::Result<MasterSnapshot> {
    let (reply, response) = oneshot::channel();
    if !self.send(Event::Snapshot(reply)) {
      return Err(anyhow!("master is not running"));
    }
    Ok(response.await?)
  }

  fn send(&self, event: Event) -> bool {
    self.sender.send(event).is_ok()
  }
}

//
// MasterDeps
//

pub struct MasterDeps {
  pub lock: Arc<dyn LeaderLock>,
  pub metadata: Arc<dyn MetadataStore>,
  pub pool_factory: Arc<dyn WorkerPoolFactory>,
  pub schedules: Arc<dyn ScheduleFactory>,
}

fn spawn_scheduler(
  handle: MasterHandle,
  mut ticker: Box<dyn Ticker>,
  event: impl Fn(Timestamp) -> Event + Send + 'static,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      let fired_at = ticker.next().await;
      if !handle.send(event(fired_at)) {
        return;
      }
    }
  })
}

fn gauge_value(value: usize) -> i64 {
  i64::try_from(value).unwrap_or(i64::MAX)
}

//
// LeaderState
//

// Coordination state for one leadership term. Dropped wholesale on step-down.
struct LeaderState {
  term: u64,
  pool: Arc<dyn WorkerTransport>,
  schedulers: Vec<JoinHandle<()>>,
  ring: AffinityRing,
  idle: BTreeSet<WorkerId>,
  busy: BTreeSet<WorkerId>,
  check_failures: u32,
  next_generation: u64,
  // Generation and start of the oldest tick that has not completed yet.
  tick_started: Option<(u64, Instant)>,
  batch_size: usize,
}

impl LeaderState {
  fn is_tracked(&self, worker: &WorkerId) -> bool {
    self.idle.contains(worker) || self.busy.contains(worker)
  }

  fn register(&mut self, worker: WorkerId, stats: &Stats) {
    if self.is_tracked(&worker) {
      log::debug!("worker {worker} already registered");
      return;
    }
    log::info!("worker {worker} registered");
    self.ring.register_worker(&worker);
    self.idle.insert(worker);
    self.update_gauges(stats);
  }

  fn remove(&mut self, worker: &WorkerId, stats: &Stats) {
    if !self.idle.remove(worker) && !self.busy.remove(worker) {
      return;
    }
    let moved = self.ring.remove_worker(worker);
    log::info!("worker {worker} removed, {moved} metrics reassigned");
    self.dispatch_idle(stats);
    self.update_gauges(stats);
    self.check_tick_complete(stats);
  }

  // Send the worker its next batch. Returns false if the worker had to be dropped because the
  // transport could not reach it.
  fn dispatch_next(&mut self, worker: &WorkerId, stats: &Stats) -> bool {
    let Some(batch) = self.ring.next_metrics(worker, self.batch_size) else {
      return true;
    };
    match self.pool.dispatch(worker, batch.clone()) {
      Ok(()) => {
        log::debug!(
          "dispatched {} metrics for {} to {worker}",
          batch.metrics.len(),
          batch.tick
        );
        if self.idle.remove(worker) {
          self.busy.insert(worker.clone());
        }
        true
      },
      Err(e) => {
        log::warn!("failed to dispatch to {worker}, removing it: {e:#}");
        stats.dispatch_failed.inc();
        self.idle.remove(worker);
        self.busy.remove(worker);
        self.ring.remove_worker(worker);
        self.requeue(batch);
        false
      },
    }
  }

  fn requeue(&mut self, batch: WorkBatch) {
    let count = batch.metrics.len();
    if let Err(RingError::NoWorkers) = self.ring.assign(&batch.tick, batch.metrics) {
      log::warn!("no workers left, dropping {count} metrics until the next tick");
    }
  }

  fn dispatch_idle(&mut self, stats: &Stats) {
    loop {
      let idle: Vec<WorkerId> = self.idle.iter().cloned().collect();
      let mut dropped = false;
      for worker in &idle {
        if self.idle.contains(worker) && !self.dispatch_next(worker, stats) {
          dropped = true;
        }
      }
      if !dropped {
        break;
      }
    }
  }

  fn on_catalog(&mut self, generation: u64, tick: &Tick, metrics: Vec<Metric>, stats: &Stats) {
    let active: HashSet<Metric> = metrics.iter().cloned().collect();
    self.ring.prune(&active);
    if let Err(e) = self.ring.assign(tick, metrics) {
      log::warn!("skipping {tick}: {e}");
      stats.ticks_skipped.inc();
      return;
    }

    if self.tick_started.is_none() {
      self.tick_started = Some((generation, Instant::now()));
    }
    log::debug!(
      "{tick} generation {generation}: {} metrics pending",
      self.ring.pending_count()
    );
    self.dispatch_idle(stats);
    self.update_gauges(stats);
    self.check_tick_complete(stats);
  }

  fn on_work_finished(&mut self, worker: &WorkerId, stats: &Stats) {
    if !self.busy.contains(worker) {
      log::debug!("ignoring completion from {worker} which is not busy");
      return;
    }

    if self.ring.has_pending_metrics(worker) {
      if !self.dispatch_next(worker, stats) {
        self.dispatch_idle(stats);
      }
    } else {
      self.busy.remove(worker);
      self.idle.insert(worker.clone());
    }
    self.update_gauges(stats);
    self.check_tick_complete(stats);
  }

  fn check_tick_complete(&mut self, stats: &Stats) {
    if !self.busy.is_empty() {
      return;
    }
    if let Some((generation, started)) = self.tick_started.take() {
      let elapsed = started.elapsed();
      log::info!("tick generation {generation} complete in {elapsed:?}");
      stats.ticks_completed.inc();
      stats.tick_time.observe(elapsed.as_secs_f64());
    }
  }

  fn update_gauges(&self, stats: &Stats) {
    stats
      .workers
      .set(gauge_value(self.idle.len() + self.busy.len()));
    stats
      .pending_metrics
      .set(gauge_value(self.ring.pending_count()));
  }
}

//
// State
//

enum State {
  Uninitialized,
  BackupLeader { acquire_failures: u32 },
  Leader(Box<LeaderState>),
}

//
// Coordinator
//

// The single owner of coordination state. Every handler is synchronous; anything that needs I/O is
// spawned and reports back through the inbox.
struct Coordinator {
  settings: Arc<Settings>,
  deps: MasterDeps,
  handle: MasterHandle,
  state: State,
  term: u64,
  lock_call_in_flight: bool,
  // Set from step-down until the lock release completes. Acquiring is re-entrant for the holder,
  // so an acquire racing the release would win leadership on a lock that is about to be freed.
  release_in_flight: bool,
  stats: Stats,
}

impl Coordinator {
  fn handle(&mut self, event: Event) {
    match event {
      Event::Snapshot(reply) => {
        let _ignored = reply.send(self.snapshot());
        return;
      },
      Event::Released => {
        self.release_in_flight = false;
        return;
      },
      _ => {},
    }

    match self.state {
      State::Uninitialized => self.handle_uninitialized(event),
      State::BackupLeader { .. } => self.handle_backup_leader(event),
      State::Leader(_) => self.handle_leader(event),
    }
  }

  fn handle_uninitialized(&mut self, event: Event) {
    match event {
      Event::Initialized => {
        log::info!("master initialized, waiting for leadership");
        self.state = State::BackupLeader {
          acquire_failures: 0,
        };
      },
      other => log::debug!("ignoring {other:?} before initialization"),
    }
  }

  fn handle_backup_leader(&mut self, event: Event) {
    match event {
      Event::LeadershipTimer => self.call_lock(),
      Event::LeadershipResult(result) => {
        self.lock_call_in_flight = false;
        let State::BackupLeader { acquire_failures } = &mut self.state else {
          return;
        };
        match result {
          Ok(true) => self.become_leader(),
          Ok(false) => {
            *acquire_failures += 1;
            log::debug!("leadership held elsewhere");
          },
          Err(e) => {
            *acquire_failures += 1;
            log::warn!("failed to acquire leadership lock: {e:#}");
          },
        }
      },
      other => log::debug!("backup leader ignoring {other:?}"),
    }
  }

  fn handle_leader(&mut self, event: Event) {
    let threshold = self.settings.config.leadership.failure_threshold;
    let State::Leader(leader) = &mut self.state else {
      return;
    };
    let stats = &self.stats;

    match event {
      Event::LeadershipTimer => self.call_lock(),
      Event::LeadershipResult(result) => {
        self.lock_call_in_flight = false;
        match result {
          Ok(true) => leader.check_failures = 0,
          failed => {
            leader.check_failures += 1;
            stats.leadership_check_failed.inc();
            log::warn!(
              "leadership check failed ({}/{threshold}): {:?}",
              leader.check_failures,
              failed.map_err(|e| format!("{e:#}"))
            );
            if leader.check_failures >= threshold {
              self.step_down();
            }
          },
        }
      },
      Event::LivenessTimer => {
        leader.pool.broadcast_heartbeat();
        let pool = leader.pool.clone();
        let handle = self.handle.clone();
        let term = leader.term;
        tokio::spawn(async move {
          let result = pool.live_workers().await;
          handle.send(Event::LiveWorkers { term, result });
        });
      },
      Event::LiveWorkers { term, result } if term == leader.term => match result {
        Ok(live) => {
          let unreachable: Vec<WorkerId> = leader
            .idle
            .iter()
            .chain(leader.busy.iter())
            .filter(|worker| !live.contains(*worker))
            .cloned()
            .collect();
          for worker in unreachable {
            log::warn!("worker {worker} is unreachable");
            stats.unreachable_workers.inc();
            leader.remove(&worker, stats);
          }
        },
        Err(e) => log::warn!("failed to query live workers: {e:#}"),
      },
      Event::Tick(tick) => {
        stats.ticks.inc();
        let generation = leader.next_generation;
        leader.next_generation += 1;
        let metadata = self.deps.metadata.clone();
        let handle = self.handle.clone();
        let term = leader.term;
        log::debug!("{tick} fired, fetching active metrics for generation {generation}");
        tokio::spawn(async move {
          let result = metadata.all_active_metrics().await;
          handle.send(Event::CatalogFetched {
            term,
            generation,
            tick,
            result,
          });
        });
      },
      Event::CatalogFetched {
        term,
        generation,
        tick,
        result,
      } if term == leader.term => match result {
        Ok(metrics) => leader.on_catalog(generation, &tick, metrics, stats),
        Err(e) => {
          log::warn!("failed to fetch active metrics, skipping {tick}: {e:#}");
          stats.ticks_skipped.inc();
        },
      },
      Event::Register(worker) => {
        leader.register(worker, stats);
        leader.dispatch_idle(stats);
      },
      Event::Unregister(worker) | Event::Terminated(worker) => leader.remove(&worker, stats),
      Event::WorkDone(worker) => {
        stats.work_done.inc();
        leader.on_work_finished(&worker, stats);
      },
      Event::WorkError { worker, failed } => {
        stats.work_error.inc();
        log::warn!(
          "worker {worker} failed {} metrics, they will be retried on the next tick",
          failed.len()
        );
        for metric in &failed {
          if let Some(owner) = leader.ring.owner(metric) {
            log::debug!("{metric} stays assigned to {owner}");
          }
        }
        leader.on_work_finished(&worker, stats);
      },
      other => log::debug!("leader ignoring {other:?}"),
    }
  }

  fn call_lock(&mut self) {
    if self.lock_call_in_flight {
      log::debug!("leadership lock call still in flight");
      return;
    }
    if self.release_in_flight {
      log::debug!("leadership lock release still in flight");
      return;
    }
    self.lock_call_in_flight = true;
    let lock = self.deps.lock.clone();
    let handle = self.handle.clone();
    tokio::spawn(async move {
      let result = lock.acquire().await;
      handle.send(Event::LeadershipResult(result));
    });
  }

  fn become_leader(&mut self) {
    self.term += 1;
    log::info!("acquired leadership, starting term {}", self.term);
    self.stats.leadership_acquired.inc();

    let config = &self.settings.config;
    let mut schedulers = vec![spawn_scheduler(
      self.handle.clone(),
      self.deps.schedules.interval(
        DISCOVERY_SCHEDULE,
        config.discovery.start_delay,
        config.discovery.interval,
      ),
      |_| Event::LivenessTimer,
    )];
    for (duration, schedule) in &self.settings.ticks {
      let duration = *duration;
      schedulers.push(spawn_scheduler(
        self.handle.clone(),
        self
          .deps
          .schedules
          .cron(&tick_schedule_name(duration), schedule),
        move |fired_at| Event::Tick(Tick::fired_at(fired_at, duration)),
      ));
    }

    self.state = State::Leader(Box::new(LeaderState {
      term: self.term,
      pool: self.deps.pool_factory.create(self.handle.clone()),
      schedulers,
      ring: AffinityRing::new(config.ring.virtual_nodes),
      idle: BTreeSet::new(),
      busy: BTreeSet::new(),
      check_failures: 0,
      next_generation: 0,
      tick_started: None,
      batch_size: config.dispatch.batch_size,
    }));
  }

  // Drop all coordination state without draining. Work that was in flight is redone under the next
  // leader from the persisted watermarks. Returns the lock release so the caller decides whether
  // to wait for it.
  fn abandon_leadership(&mut self) -> Option<JoinHandle<()>> {
    let State::Leader(leader) = std::mem::replace(
      &mut self.state,
      State::BackupLeader {
        acquire_failures: 0,
      },
    ) else {
      return None;
    };

    for scheduler in &leader.schedulers {
      scheduler.abort();
    }
    leader.pool.stop_all();
    self.stats.workers.set(0);
    self.stats.pending_metrics.set(0);

    self.release_in_flight = true;
    let lock = self.deps.lock.clone();
    let handle = self.handle.clone();
    Some(tokio::spawn(async move {
      match lock.release().await {
        Ok(released) => log::info!("leadership lock released: {released}"),
        Err(e) => log::warn!("failed to release leadership lock: {e:#}"),
      }
      handle.send(Event::Released);
    }))
  }

  fn step_down(&mut self) {
    log::warn!("stepping down from leadership");
    self.stats.step_down.inc();
    self.abandon_leadership();
  }

  fn snapshot(&self) -> MasterSnapshot {
    match &self.state {
      State::Uninitialized => MasterSnapshot {
        role: Role::Uninitialized,
        term: self.term,
        idle: vec![],
        busy: vec![],
        pending: 0,
        leadership_failures: 0,
      },
      State::BackupLeader { acquire_failures } => MasterSnapshot {
        role: Role::BackupLeader,
        term: self.term,
        idle: vec![],
        busy: vec![],
        pending: 0,
        leadership_failures: *acquire_failures,
      },
      State::Leader(leader) => MasterSnapshot {
        role: Role::Leader,
        term: self.term,
        idle: leader.idle.iter().cloned().collect(),
        busy: leader.busy.iter().cloned().collect(),
        pending: leader.ring.pending_count(),
        leadership_failures: leader.check_failures,
      },
    }
  }
}

//
// Master
//

// Leader/follower cluster coordinator. All events are handled one at a time by `run`.
pub struct Master {
  coordinator: Coordinator,
  inbox: mpsc::UnboundedReceiver<Event>,
}

impl Master {
  #[must_use]
  pub fn new(settings: Arc<Settings>, deps: MasterDeps, scope: &Scope) -> Self {
    let (sender, inbox) = mpsc::unbounded_channel();
    Self {
      coordinator: Coordinator {
        settings,
        deps,
        handle: MasterHandle { sender },
        state: State::Uninitialized,
        term: 0,
        lock_call_in_flight: false,
        release_in_flight: false,
        stats: Stats::new(scope),
      },
      inbox,
    }
  }

  #[must_use]
  pub fn handle(&self) -> MasterHandle {
    self.coordinator.handle.clone()
  }

  pub async fn run(mut self, mut shutdown: ComponentShutdown) {
    let leadership = spawn_scheduler(
      self.coordinator.handle.clone(),
      self.coordinator.deps.schedules.interval(
        LEADERSHIP_SCHEDULE,
        Duration::ZERO,
        self.coordinator.settings.config.leadership.check_interval,
      ),
      |_| Event::LeadershipTimer,
    );
    self.coordinator.handle(Event::Initialized);

    loop {
      tokio::select! {
        () = shutdown.cancelled() => break,
        Some(event) = self.inbox.recv() => self.coordinator.handle(event),
      }
    }

    log::info!("master shutting down");
    leadership.abort();
    if let Some(release) = self.coordinator.abandon_leadership() {
      let _ignored = release.await;
    }
  }
}
