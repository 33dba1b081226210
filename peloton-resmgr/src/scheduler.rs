// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Admission scheduler: drains pending queues into ready queues.
//!
//! Every tick, each leaf pool admits gangs class by class while
//! `allocation + gang <= entitlement` holds. Admission is head-of-line per
//! class: priority order is preserved and a blocked head blocks its class.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::respool::QueueClass;
use crate::restree::Tree;
use crate::task::TaskState;
use crate::tracker::Tracker;

pub struct TaskScheduler {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
}

impl TaskScheduler {
    pub fn new(tree: Arc<Tree>, tracker: Arc<Tracker>) -> Self {
        Self { tree, tracker }
    }

    /// One admission sweep over all leaf pools. Returns the number of
    /// gangs admitted.
    pub fn schedule_once(&self) -> usize {
        let mut admitted = 0;
        for pool_id in self.tree.leaf_pool_ids() {
            for class in QueueClass::ALL {
                while let Some(gang) = self.tree.try_admit(&pool_id, class) {
                    for task in &gang.tasks {
                        if let Err(err) = self.tracker.transit(&task.id, TaskState::Ready) {
                            tracing::error!(task = %task.id, %err, "admitted task failed ready transition");
                        }
                    }
                    self.tracker.mark_ready_queued(gang.id());
                    admitted += 1;
                    tracing::debug!(pool = %pool_id, gang = %gang.id(), ?class, "admitted gang");
                }
            }
        }
        admitted
    }
}

/// The ready-queue drain loop.
pub fn start_scheduler_loop(
    scheduler: Arc<TaskScheduler>,
    period: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    scheduler.schedule_once();
                }
            }
        }
    })
}
