// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The task tracker: every active task's state machine plus the timeout
//! engine that re-drives stuck tasks.
//!
//! One mutex guards the indices; critical sections stay short and no tree
//! or reservation call happens under it. Deadlines live in a single heap
//! drained by one loop; an entry only fires if the task is still in the
//! state it was armed for, so state transitions implicitly cancel stale
//! timers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::id::{JobID, ResPoolID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::{Gang, Task, TaskType};
use peloton_util::backoff::delay_for_cycle;

use crate::config::ResmgrConfig;
use crate::restree::Tree;
use crate::task::{RMTask, TaskState};

/// Task-level knobs the tracker needs, cut from the full config.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub placing_timeout: Duration,
    pub launching_timeout: Duration,
    pub reserving_timeout: Duration,
    pub placement_retry_backoff: Duration,
    pub placement_retry_cycle: u32,
    pub placement_attempts_percycle: u32,
    pub enable_placement_backoff: bool,
    pub enable_host_reservation: bool,
}

impl From<&ResmgrConfig> for TaskConfig {
    fn from(config: &ResmgrConfig) -> Self {
        Self {
            placing_timeout: config.placing_timeout(),
            launching_timeout: config.launching_timeout(),
            reserving_timeout: config.reserving_timeout(),
            placement_retry_backoff: config.placement_retry_backoff(),
            placement_retry_cycle: config.placement_retry_cycle,
            placement_attempts_percycle: config.placement_attempts_percycle,
            enable_placement_backoff: config.enable_placement_backoff,
            enable_host_reservation: config.enable_host_reservation,
        }
    }
}

/// Host manager seam used when a chronically unplaceable task is promoted
/// to an exclusive host reservation.
#[async_trait]
pub trait HostReserver: Send + Sync {
    async fn reserve_host(
        &self,
        task_ids: Vec<TaskID>,
        needed: Resources,
        duration: Duration,
    ) -> PelotonResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Placing,
    Launching,
    Reserving,
    BackoffDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeadlineEntry {
    deadline: Instant,
    seq: u64,
    task_id: TaskID,
    expected_state: TaskState,
    kind: DeadlineKind,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Reservation request produced by the timeout engine, executed outside
/// the tracker lock by the timeout loop.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub task_ids: Vec<TaskID>,
    pub needed: Resources,
    pub duration: Duration,
}

struct TrackerState {
    tasks: HashMap<TaskID, RMTask>,
    host_to_tasks: HashMap<String, HashSet<TaskID>>,
    pool_to_tasks: HashMap<ResPoolID, HashSet<TaskID>>,
    gang_members: HashMap<TaskID, Vec<TaskID>>,
    /// Gangs already sitting in a ready queue; guards double requeue.
    ready_queued: HashSet<TaskID>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    seq: u64,
}

pub struct Tracker {
    config: TaskConfig,
    tree: Arc<Tree>,
    inner: Mutex<TrackerState>,
}

impl Tracker {
    pub fn new(tree: Arc<Tree>, config: TaskConfig) -> Self {
        Self {
            config,
            tree,
            inner: Mutex::new(TrackerState {
                tasks: HashMap::new(),
                host_to_tasks: HashMap::new(),
                pool_to_tasks: HashMap::new(),
                gang_members: HashMap::new(),
                ready_queued: HashSet::new(),
                deadlines: BinaryHeap::new(),
                seq: 0,
            }),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Track a new task. No allocation changes until admission.
    pub fn add_task(&self, task: Task, gang_id: TaskID, pool_id: ResPoolID) -> PelotonResult<()> {
        let mut state = self.inner.lock();
        if let Some(existing) = state.tasks.get(&task.id) {
            if !existing.state.is_terminal() {
                return Err(PelotonError::already_exists(format!(
                    "task {} already tracked in state {:?}",
                    task.id, existing.state
                )));
            }
        }
        let id = task.id.clone();
        let rm_task = RMTask::new(task, gang_id.clone(), pool_id.clone());
        state.tasks.insert(id.clone(), rm_task);
        state.pool_to_tasks.entry(pool_id).or_default().insert(id.clone());
        state.gang_members.entry(gang_id).or_default().push(id);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskID) -> Option<RMTask> {
        self.inner.lock().tasks.get(id).cloned()
    }

    pub fn task_state(&self, id: &TaskID) -> Option<TaskState> {
        self.inner.lock().tasks.get(id).map(|t| t.state)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Validated transition on one task.
    pub fn transit(&self, id: &TaskID, new_state: TaskState) -> PelotonResult<()> {
        let mut state = self.inner.lock();
        if new_state == TaskState::Placing {
            state.ready_queued.remove(id);
        }
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("task {id} not tracked")))?;
        task.transit_to(new_state)
    }

    /// Mark a gang as sitting in its pool's ready queue.
    pub fn mark_ready_queued(&self, gang_id: &TaskID) {
        self.inner.lock().ready_queued.insert(gang_id.clone());
    }

    /// Record the host a task was placed on and maintain the host index.
    pub fn set_placement(&self, id: &TaskID, hostname: &str) -> PelotonResult<()> {
        let mut state = self.inner.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("task {id} not tracked")))?;
        let old_host = task.host.replace(hostname.to_string());
        if let Some(old) = old_host {
            let emptied = state
                .host_to_tasks
                .get_mut(&old)
                .map(|set| {
                    set.remove(id);
                    set.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                state.host_to_tasks.remove(&old);
            }
        }
        state
            .host_to_tasks
            .entry(hostname.to_string())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    /// Active tasks on the given hosts, filtered by type.
    pub fn tasks_by_hosts(
        &self,
        hostnames: &[String],
        task_type: TaskType,
    ) -> HashMap<String, Vec<RMTask>> {
        let state = self.inner.lock();
        let mut out = HashMap::new();
        for hostname in hostnames {
            let Some(ids) = state.host_to_tasks.get(hostname) else {
                continue;
            };
            let tasks: Vec<RMTask> = ids
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .filter(|t| t.task.task_type == task_type)
                .cloned()
                .collect();
            if !tasks.is_empty() {
                out.insert(hostname.clone(), tasks);
            }
        }
        out
    }

    /// Active tasks, optionally filtered by job and state.
    pub fn get_active_tasks(
        &self,
        job_id: Option<&JobID>,
        task_state: Option<TaskState>,
    ) -> Vec<RMTask> {
        let state = self.inner.lock();
        state
            .tasks
            .values()
            .filter(|t| job_id.is_none_or(|j| &t.task.job_id == j))
            .filter(|t| task_state.is_none_or(|s| t.state == s))
            .cloned()
            .collect()
    }

    /// Preemptible, allocation-holding tasks of one pool, for the victim
    /// scan.
    pub fn preemption_candidates(&self, pool_id: &ResPoolID) -> Vec<RMTask> {
        let state = self.inner.lock();
        let Some(ids) = state.pool_to_tasks.get(pool_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.task.preemptible && t.state.holds_allocation() && t.state != TaskState::Preempting)
            .cloned()
            .collect()
    }

    /// Finish a task: remove it from all indices and release its pool
    /// allocation if its state held one. From INITIALIZED or PENDING this
    /// is a no-op on allocation.
    pub fn mark_it_done(&self, id: &TaskID) -> PelotonResult<()> {
        let (held, resource, pool_id) = {
            let mut state = self.inner.lock();
            let task = state
                .tasks
                .remove(id)
                .ok_or_else(|| PelotonError::not_found(format!("task {id} not tracked")))?;
            if let Some(host) = &task.host {
                let emptied = state
                    .host_to_tasks
                    .get_mut(host)
                    .map(|set| {
                        set.remove(id);
                        set.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    state.host_to_tasks.remove(host);
                }
            }
            if let Some(set) = state.pool_to_tasks.get_mut(&task.respool_id) {
                set.remove(id);
            }
            let gang_emptied = state
                .gang_members
                .get_mut(&task.gang_id)
                .map(|members| {
                    members.retain(|m| m != id);
                    members.is_empty()
                })
                .unwrap_or(false);
            if gang_emptied {
                state.gang_members.remove(&task.gang_id);
                state.ready_queued.remove(&task.gang_id);
            }
            (
                task.state.holds_allocation(),
                task.task.resource,
                task.respool_id,
            )
        };
        if held {
            self.tree.subtract_from_allocation(&pool_id, &resource)?;
        }
        Ok(())
    }

    /// Reset a failed task for another run: fresh broker identity, back to
    /// PENDING, allocation released. Returns the task for re-enqueueing.
    pub fn retry_task(&self, id: &TaskID) -> PelotonResult<Task> {
        let (held, resource, pool_id, task) = {
            let mut state = self.inner.lock();
            let rm_task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| PelotonError::not_found(format!("task {id} not tracked")))?;
            let held = rm_task.state.holds_allocation();
            let resource = rm_task.task.resource;
            let pool_id = rm_task.respool_id.clone();
            let old_host = rm_task.host.take();
            rm_task.failures_count += 1;
            rm_task.reset_for_retry();
            rm_task.transit_to(TaskState::Pending)?;
            let task = rm_task.task.clone();
            if let Some(host) = old_host {
                if let Some(set) = state.host_to_tasks.get_mut(&host) {
                    set.remove(id);
                }
            }
            (held, resource, pool_id, task)
        };
        if held {
            self.tree.subtract_from_allocation(&pool_id, &resource)?;
        }
        Ok(task)
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.tasks.clear();
        state.host_to_tasks.clear();
        state.pool_to_tasks.clear();
        state.gang_members.clear();
        state.ready_queued.clear();
        state.deadlines.clear();
    }

    // ── Deadline management ─────────────────────────────────────────

    pub fn arm_placing_timeout(&self, id: &TaskID) {
        self.arm(id, self.config.placing_timeout, TaskState::Placing, DeadlineKind::Placing);
    }

    /// Launching timeouts cover both the placed-but-not-dispatched and the
    /// dispatched-but-not-launched windows.
    pub fn arm_launching_timeout(&self, id: &TaskID, expected: TaskState) {
        self.arm(id, self.config.launching_timeout, expected, DeadlineKind::Launching);
    }

    pub fn arm_reserving_timeout(&self, id: &TaskID) {
        self.arm(id, self.config.reserving_timeout, TaskState::Reserved, DeadlineKind::Reserving);
    }

    fn arm(&self, id: &TaskID, after: Duration, expected: TaskState, kind: DeadlineKind) {
        let mut state = self.inner.lock();
        state.seq += 1;
        let entry = DeadlineEntry {
            deadline: Instant::now() + after,
            seq: state.seq,
            task_id: id.clone(),
            expected_state: expected,
            kind,
        };
        state.deadlines.push(Reverse(entry));
    }

    fn arm_at(state: &mut TrackerState, at: Instant, id: &TaskID, expected: TaskState, kind: DeadlineKind) {
        state.seq += 1;
        let entry = DeadlineEntry {
            deadline: at,
            seq: state.seq,
            task_id: id.clone(),
            expected_state: expected,
            kind,
        };
        state.deadlines.push(Reverse(entry));
    }

    /// Drain due deadlines and apply the timeout rules. Gangs whose every
    /// member returned to READY are requeued on their pool's ready queue.
    /// Reservation promotions are returned for the caller to execute.
    pub fn process_due(&self, now: Instant) -> Vec<ReserveRequest> {
        let mut requeues: Vec<(ResPoolID, Gang, TaskID)> = Vec::new();
        let mut reservations: Vec<ReserveRequest> = Vec::new();

        {
            let mut state = self.inner.lock();
            while let Some(Reverse(head)) = state.deadlines.peek() {
                if head.deadline > now {
                    break;
                }
                let entry = state.deadlines.pop().expect("peeked entry").0;
                self.fire(&mut state, entry, now, &mut requeues, &mut reservations);
            }
        }

        for (pool_id, gang, gang_id) in requeues {
            if let Err(err) = self.tree.requeue_ready_gang(&pool_id, gang) {
                tracing::error!(pool = %pool_id, gang = %gang_id, %err, "failed to requeue gang");
            }
        }
        reservations
    }

    fn fire(
        &self,
        state: &mut TrackerState,
        entry: DeadlineEntry,
        now: Instant,
        requeues: &mut Vec<(ResPoolID, Gang, TaskID)>,
        reservations: &mut Vec<ReserveRequest>,
    ) {
        enum Outcome {
            Nothing,
            Requeue,
            Backoff(Duration),
            Reserve(Resources),
        }

        // First mutate the task under its own borrow, then act on the
        // shared indices.
        let outcome = {
            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                return;
            };
            // A transition since arming invalidates the timer.
            if task.state != entry.expected_state {
                return;
            }

            match entry.kind {
                DeadlineKind::Placing | DeadlineKind::Launching => {
                    if task.transit_to(TaskState::Ready).is_err() {
                        return;
                    }
                    task.placement_retry_count += 1;
                    task.placement_attempt_count += 1;
                    tracing::info!(
                        task = %entry.task_id,
                        kind = ?entry.kind,
                        retries = task.placement_retry_count,
                        "task timed out, back to ready"
                    );

                    let attempts = self.config.placement_attempts_percycle.max(1);
                    if task.placement_retry_count % attempts == 0 {
                        let completed_cycles = task.placement_retry_count / attempts;
                        if completed_cycles >= self.config.placement_retry_cycle
                            && self.config.enable_host_reservation
                        {
                            match task.transit_to(TaskState::Reserved) {
                                Ok(()) => Outcome::Reserve(task.task.resource),
                                Err(_) => Outcome::Nothing,
                            }
                        } else if self.config.enable_placement_backoff {
                            let delay = delay_for_cycle(
                                self.config.placement_retry_backoff,
                                completed_cycles,
                                self.config.placing_timeout,
                            );
                            task.backoff_until = Some(now + delay);
                            Outcome::Backoff(delay)
                        } else {
                            Outcome::Requeue
                        }
                    } else {
                        Outcome::Requeue
                    }
                }
                DeadlineKind::BackoffDone => {
                    task.backoff_until = None;
                    Outcome::Requeue
                }
                DeadlineKind::Reserving => {
                    tracing::info!(task = %entry.task_id, "host reservation expired");
                    match task.transit_to(TaskState::Ready) {
                        Ok(()) => Outcome::Requeue,
                        Err(_) => Outcome::Nothing,
                    }
                }
            }
        };

        match outcome {
            Outcome::Nothing => {}
            Outcome::Requeue => {
                Self::collect_gang_requeue(state, &entry.task_id, now, requeues);
            }
            Outcome::Backoff(delay) => {
                Self::arm_at(
                    state,
                    now + delay,
                    &entry.task_id,
                    TaskState::Ready,
                    DeadlineKind::BackoffDone,
                );
            }
            Outcome::Reserve(needed) => {
                reservations.push(ReserveRequest {
                    task_ids: vec![entry.task_id.clone()],
                    needed,
                    duration: self.config.reserving_timeout,
                });
                Self::arm_at(
                    state,
                    now + self.config.reserving_timeout,
                    &entry.task_id,
                    TaskState::Reserved,
                    DeadlineKind::Reserving,
                );
            }
        }
    }

    /// Abandon a reservation attempt that could not be fulfilled: the task
    /// returns to READY and its gang goes back on the ready queue.
    pub fn cancel_reservation(&self, id: &TaskID) -> PelotonResult<()> {
        let mut requeues: Vec<(ResPoolID, Gang, TaskID)> = Vec::new();
        {
            let mut state = self.inner.lock();
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| PelotonError::not_found(format!("task {id} not tracked")))?;
            if task.state != TaskState::Reserved {
                return Ok(());
            }
            task.transit_to(TaskState::Ready)?;
            Self::collect_gang_requeue(&mut state, id, Instant::now(), &mut requeues);
        }
        for (pool_id, gang, gang_id) in requeues {
            if let Err(err) = self.tree.requeue_ready_gang(&pool_id, gang) {
                tracing::error!(pool = %pool_id, gang = %gang_id, %err, "failed to requeue gang");
            }
        }
        Ok(())
    }

    /// Requeue the whole gang once every member is back in READY and out
    /// of backoff. The `ready_queued` set keeps a gang from being queued
    /// twice when members fire in the same batch.
    fn collect_gang_requeue(
        state: &mut TrackerState,
        task_id: &TaskID,
        now: Instant,
        requeues: &mut Vec<(ResPoolID, Gang, TaskID)>,
    ) {
        let Some(task) = state.tasks.get(task_id) else {
            return;
        };
        let gang_id = task.gang_id.clone();
        let pool_id = task.respool_id.clone();
        if state.ready_queued.contains(&gang_id) {
            return;
        }
        let Some(members) = state.gang_members.get(&gang_id) else {
            return;
        };
        let mut member_tasks = Vec::with_capacity(members.len());
        for member_id in members {
            match state.tasks.get(member_id) {
                Some(member)
                    if member.state == TaskState::Ready && !member.in_backoff(now) =>
                {
                    member_tasks.push(member.task.clone());
                }
                _ => return,
            }
        }
        member_tasks.sort_by(|a, b| a.id.cmp(&b.id));
        state.ready_queued.insert(gang_id.clone());
        requeues.push((pool_id, Gang::new(member_tasks), gang_id));
    }
}

/// The timeout loop: one task re-driving every armed deadline, plus the
/// reservation calls promoted tasks need.
pub fn start_timeout_loop(
    tracker: Arc<Tracker>,
    reserver: Option<Arc<dyn HostReserver>>,
    tick: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(tick) => {
                    let requests = tracker.process_due(Instant::now());
                    for request in requests {
                        let Some(reserver) = reserver.as_ref() else {
                            tracing::warn!(tasks = ?request.task_ids, "no host reserver wired, dropping reservation");
                            continue;
                        };
                        match reserver
                            .reserve_host(request.task_ids.clone(), request.needed, request.duration)
                            .await
                        {
                            Ok(hostname) => {
                                tracing::info!(tasks = ?request.task_ids, host = %hostname, "host reserved");
                            }
                            Err(err) => {
                                tracing::warn!(tasks = ?request.task_ids, %err, "host reservation failed");
                                for task_id in &request.task_ids {
                                    let _ = tracker.cancel_reservation(task_id);
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}
