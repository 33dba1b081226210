// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource manager service facade.
//!
//! `ResourceManager` is the contract the placement engine and job manager
//! call; `ResourceManagerService` implements it over the tree and tracker.
//! Status-update delivery is at-least-once: events are deduplicated by
//! stream offset, so redelivery is a no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use peloton_common::id::{JobID, ResPoolID, TaskID};
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::{BrokerTaskState, Gang, Placement, TaskStatusEvent, TaskType};

use crate::restree::Tree;
use crate::task::{RMTask, TaskState};
use crate::tracker::Tracker;

/// The resource manager surface consumed by the other services.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Queue gangs at a leaf pool. Returns per-task failures; tasks of a
    /// failed gang are not partially enqueued.
    async fn enqueue_gangs(
        &self,
        pool_id: &ResPoolID,
        gangs: Vec<Gang>,
    ) -> Vec<(TaskID, PelotonError)>;

    /// Pull admitted gangs of one task type. Dequeued tasks move
    /// READY → PLACING with the placing timeout armed.
    async fn dequeue_gangs(&self, limit: usize, task_type: TaskType) -> PelotonResult<Vec<Gang>>;

    /// Record successful placements (PLACING → PLACED). Failed tasks are
    /// reported back; their gangs recycle via the placing timeout.
    async fn set_placements(&self, placements: Vec<Placement>) -> Vec<(TaskID, PelotonError)>;

    /// Hand placements to the launcher (PLACED → LAUNCHING).
    async fn get_placements(
        &self,
        limit: usize,
        task_type: TaskType,
    ) -> PelotonResult<Vec<Placement>>;

    /// Apply broker status updates. Returns the purge offset: the highest
    /// offset applied, up to which the stream may be acknowledged.
    async fn notify_task_updates(&self, events: Vec<TaskStatusEvent>) -> PelotonResult<u64>;

    /// Snapshot of active tasks, optionally filtered.
    async fn get_active_tasks(
        &self,
        job_id: Option<JobID>,
        state: Option<TaskState>,
    ) -> Vec<RMTask>;
}

pub struct ResourceManagerService {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    placements: Mutex<VecDeque<Placement>>,
    /// Offset one past the last applied status event.
    progress: AtomicU64,
}

impl ResourceManagerService {
    pub fn new(tree: Arc<Tree>, tracker: Arc<Tracker>) -> Self {
        Self {
            tree,
            tracker,
            placements: Mutex::new(VecDeque::new()),
            progress: AtomicU64::new(0),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn queued_placements(&self) -> usize {
        self.placements.lock().len()
    }

    fn enqueue_one_gang(&self, pool_id: &ResPoolID, gang: &Gang) -> PelotonResult<()> {
        if gang.is_empty() {
            return Err(PelotonError::invalid_argument("empty gang"));
        }
        // Validate the pool up front so a failure leaves no tracked tasks.
        if !self.tree.children(pool_id)?.is_empty() {
            return Err(PelotonError::invalid_argument(format!(
                "pool {pool_id} is not a leaf, jobs queue at leaves only"
            )));
        }
        let gang_id = gang.id().clone();
        let mut added: Vec<TaskID> = Vec::with_capacity(gang.len());
        for task in &gang.tasks {
            match self
                .tracker
                .add_task(task.clone(), gang_id.clone(), pool_id.clone())
            {
                Ok(()) => added.push(task.id.clone()),
                Err(err) => {
                    // Unwind the members already added: no partial gangs.
                    for id in added {
                        let _ = self.tracker.mark_it_done(&id);
                    }
                    return Err(err);
                }
            }
        }
        for id in &added {
            self.tracker.transit(id, TaskState::Pending)?;
        }
        self.tree.enqueue_gang(pool_id, gang.clone())?;
        Ok(())
    }

    /// Terminal-event path: retry the task in its pool, or finish it.
    fn finish_or_retry(&self, task_id: &TaskID, terminal: TaskState) -> PelotonResult<()> {
        let Some(task) = self.tracker.get_task(task_id) else {
            // Redelivered terminal for an already-finished task.
            return Ok(());
        };

        let preempted = task.state == TaskState::Preempting;
        let retryable = match terminal {
            // LOST counts as FAILED with a retryable reason.
            TaskState::Failed | TaskState::Lost => {
                task.failures_count < task.task.max_failures
            }
            // A kill only recycles the task when preemption caused it.
            TaskState::Killed => preempted,
            _ => false,
        };

        if retryable {
            let fresh = self.tracker.retry_task(task_id)?;
            let pool_id = task.respool_id.clone();
            self.tree.enqueue_gang(&pool_id, Gang::of(fresh))?;
            tracing::info!(task = %task_id, pool = %pool_id, "task re-enqueued for retry");
            return Ok(());
        }

        let final_state = match terminal {
            TaskState::Lost => TaskState::Failed,
            other => other,
        };
        if let Err(err) = self.tracker.transit(task_id, final_state) {
            tracing::warn!(task = %task_id, %err, "terminal transition rejected");
        }
        self.tracker.mark_it_done(task_id)
    }
}

#[async_trait]
impl ResourceManager for ResourceManagerService {
    async fn enqueue_gangs(
        &self,
        pool_id: &ResPoolID,
        gangs: Vec<Gang>,
    ) -> Vec<(TaskID, PelotonError)> {
        let mut failed = Vec::new();
        for gang in gangs {
            if let Err(err) = self.enqueue_one_gang(pool_id, &gang) {
                tracing::warn!(pool = %pool_id, gang = %gang.id(), %err, "gang enqueue failed");
                for task in &gang.tasks {
                    failed.push((task.id.clone(), err.clone()));
                }
            }
        }
        failed
    }

    async fn dequeue_gangs(&self, limit: usize, task_type: TaskType) -> PelotonResult<Vec<Gang>> {
        let gangs = self.tree.dequeue_ready_by_type(task_type, limit);
        for gang in &gangs {
            for task in &gang.tasks {
                // A task deleted mid-flight must not strand the rest of
                // the batch.
                match self.tracker.transit(&task.id, TaskState::Placing) {
                    Ok(()) => self.tracker.arm_placing_timeout(&task.id),
                    Err(err) => {
                        tracing::warn!(task = %task.id, %err, "dequeued task failed placing transition");
                    }
                }
            }
        }
        Ok(gangs)
    }

    async fn set_placements(&self, placements: Vec<Placement>) -> Vec<(TaskID, PelotonError)> {
        let mut failed = Vec::new();
        for placement in placements {
            let mut placement_ok = true;
            for task_id in &placement.tasks {
                let result = self
                    .tracker
                    .transit(task_id, TaskState::Placed)
                    .and_then(|()| self.tracker.set_placement(task_id, &placement.hostname));
                match result {
                    Ok(()) => {
                        self.tracker
                            .arm_launching_timeout(task_id, TaskState::Placed);
                    }
                    Err(err) => {
                        // The rest of the gang recycles via placing timeout.
                        tracing::warn!(task = %task_id, %err, "placement rejected");
                        failed.push((task_id.clone(), err));
                        placement_ok = false;
                    }
                }
            }
            if placement_ok {
                self.placements.lock().push_back(placement);
            }
        }
        failed
    }

    async fn get_placements(
        &self,
        limit: usize,
        task_type: TaskType,
    ) -> PelotonResult<Vec<Placement>> {
        let mut selected = Vec::new();
        {
            let mut queue = self.placements.lock();
            let mut remaining = VecDeque::with_capacity(queue.len());
            while let Some(placement) = queue.pop_front() {
                if selected.len() < limit && placement.task_type == task_type {
                    selected.push(placement);
                } else {
                    remaining.push_back(placement);
                }
            }
            *queue = remaining;
        }
        for placement in &selected {
            for task_id in &placement.tasks {
                match self.tracker.transit(task_id, TaskState::Launching) {
                    Ok(()) => self
                        .tracker
                        .arm_launching_timeout(task_id, TaskState::Launching),
                    Err(err) => {
                        tracing::warn!(task = %task_id, %err, "placement task failed launching transition");
                    }
                }
            }
        }
        Ok(selected)
    }

    async fn notify_task_updates(&self, events: Vec<TaskStatusEvent>) -> PelotonResult<u64> {
        let mut purge = self.progress.load(Ordering::SeqCst).saturating_sub(1);
        for event in events {
            let progress = self.progress.load(Ordering::SeqCst);
            if event.offset < progress {
                // At-least-once redelivery.
                continue;
            }

            let result = match event.state {
                BrokerTaskState::Starting => self
                    .tracker
                    .transit(&event.task_id, TaskState::Launched),
                BrokerTaskState::Running => {
                    self.tracker.transit(&event.task_id, TaskState::Running)
                }
                BrokerTaskState::Finished => self
                    .tracker
                    .transit(&event.task_id, TaskState::Succeeded)
                    .and_then(|()| self.tracker.mark_it_done(&event.task_id)),
                BrokerTaskState::Failed => {
                    self.finish_or_retry(&event.task_id, TaskState::Failed)
                }
                BrokerTaskState::Lost => self.finish_or_retry(&event.task_id, TaskState::Lost),
                BrokerTaskState::Killed => {
                    self.finish_or_retry(&event.task_id, TaskState::Killed)
                }
            };
            if let Err(err) = result {
                tracing::warn!(task = %event.task_id, offset = event.offset, %err, "status update not applied");
            }
            self.progress.store(event.offset + 1, Ordering::SeqCst);
            purge = event.offset;
        }
        Ok(purge)
    }

    async fn get_active_tasks(
        &self,
        job_id: Option<JobID>,
        state: Option<TaskState>,
    ) -> Vec<RMTask> {
        self.tracker.get_active_tasks(job_id.as_ref(), state)
    }
}
