// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Preemption engine.
//!
//! Pools can transiently run over their entitlement after it shrinks. A
//! pool that stays over for `sustained_over_allocation_count` consecutive
//! cycles donates back: preemptible tasks are picked ordered by priority
//! ascending then start time descending until the excess is covered, moved
//! to PREEMPTING and handed to the killer. Preempted tasks re-enter the
//! pipeline as INITIALIZED once their termination event arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::id::{ResPoolID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::status::PelotonResult;

use crate::config::ResmgrConfig;
use crate::restree::Tree;
use crate::task::TaskState;
use crate::tracker::Tracker;

/// Kill-request seam toward the job manager / host manager.
#[async_trait]
pub trait TaskKiller: Send + Sync {
    async fn kill(&self, mesos_task_ids: Vec<String>) -> PelotonResult<()>;
}

#[derive(Debug, Clone)]
pub struct PreemptorConfig {
    pub period: Duration,
    pub sustained_over_allocation_count: u32,
    pub enabled: bool,
}

impl From<&ResmgrConfig> for PreemptorConfig {
    fn from(config: &ResmgrConfig) -> Self {
        Self {
            period: config.task_preemption_period(),
            sustained_over_allocation_count: config.sustained_over_allocation_count,
            enabled: config.preemption_enabled,
        }
    }
}

pub struct Preemptor {
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    killer: Arc<dyn TaskKiller>,
    config: PreemptorConfig,
    /// Consecutive over-allocation cycles per pool.
    over_counts: Mutex<HashMap<ResPoolID, u32>>,
}

impl Preemptor {
    pub fn new(
        tree: Arc<Tree>,
        tracker: Arc<Tracker>,
        killer: Arc<dyn TaskKiller>,
        config: PreemptorConfig,
    ) -> Self {
        Self {
            tree,
            tracker,
            killer,
            config,
            over_counts: Mutex::new(HashMap::new()),
        }
    }

    /// One preemption cycle. Returns the ids of tasks moved to PREEMPTING.
    pub async fn check_once(&self) -> Vec<TaskID> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut all_victims = Vec::new();
        for pool_id in self.tree.leaf_pool_ids() {
            let (Some(allocation), Some(entitlement)) = (
                self.tree.allocation(&pool_id),
                self.tree.entitlement(&pool_id),
            ) else {
                continue;
            };

            let over = !entitlement.contains(&allocation);
            let sustained = {
                let mut counts = self.over_counts.lock();
                if over {
                    let count = counts.entry(pool_id.clone()).or_insert(0);
                    *count += 1;
                    *count >= self.config.sustained_over_allocation_count
                } else {
                    counts.remove(&pool_id);
                    false
                }
            };
            if !sustained {
                continue;
            }

            let excess = allocation.exceeding(&entitlement);
            let victims = self.select_victims(&pool_id, &excess);
            if victims.is_empty() {
                tracing::warn!(pool = %pool_id, %excess, "over-allocated pool has no preemptible tasks");
                continue;
            }

            let mut mesos_ids = Vec::with_capacity(victims.len());
            let mut preempting = Vec::with_capacity(victims.len());
            for (task_id, mesos_id) in victims {
                match self.tracker.transit(&task_id, TaskState::Preempting) {
                    Ok(()) => {
                        mesos_ids.push(mesos_id);
                        preempting.push(task_id);
                    }
                    Err(err) => {
                        tracing::warn!(task = %task_id, %err, "victim moved on before preemption");
                    }
                }
            }
            tracing::info!(pool = %pool_id, victims = preempting.len(), %excess, "preempting tasks");
            if let Err(err) = self.killer.kill(mesos_ids).await {
                // Kills are retried next cycle; the pool stays over.
                tracing::error!(pool = %pool_id, %err, "kill request failed");
            }
            self.over_counts.lock().remove(&pool_id);
            all_victims.extend(preempting);
        }
        all_victims
    }

    /// Pick victims ordered by (priority asc, start time desc), whole
    /// gangs at a time, until the excess is covered.
    fn select_victims(&self, pool_id: &ResPoolID, excess: &Resources) -> Vec<(TaskID, String)> {
        let mut candidates = self.tracker.preemption_candidates(pool_id);
        candidates.sort_by(|a, b| {
            a.task
                .priority
                .cmp(&b.task.priority)
                .then(b.start_time.cmp(&a.start_time))
                .then(a.task.id.cmp(&b.task.id))
        });

        let by_id: HashMap<TaskID, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task.id.clone(), i))
            .collect();

        let mut chosen: Vec<(TaskID, String)> = Vec::new();
        let mut chosen_ids: HashSet<TaskID> = HashSet::new();
        let mut reclaimed = Resources::ZERO;

        for candidate in &candidates {
            if reclaimed.contains(excess) {
                break;
            }
            if chosen_ids.contains(&candidate.task.id) {
                continue;
            }
            // Gangs preempt atomically: pull every still-running member.
            let mut gang_member_ids: Vec<TaskID> = candidates
                .iter()
                .filter(|t| t.gang_id == candidate.gang_id)
                .map(|t| t.task.id.clone())
                .collect();
            gang_member_ids.sort();
            for member_id in gang_member_ids {
                if !chosen_ids.insert(member_id.clone()) {
                    continue;
                }
                let member = &candidates[by_id[&member_id]];
                reclaimed.add(&member.task.resource);
                chosen.push((member_id, member.mesos_task_id.to_string()));
            }
        }
        chosen
    }
}

/// Periodic preemption loop. Failures are logged and retried next cycle.
pub fn start_preemption_loop(
    preemptor: Arc<Preemptor>,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = preemptor.config.period;
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    preemptor.check_once().await;
                }
            }
        }
    })
}

/// Test double recording every kill request.
#[derive(Default)]
pub struct RecordingTaskKiller {
    killed: Mutex<Vec<String>>,
}

impl RecordingTaskKiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().clone()
    }
}

#[async_trait]
impl TaskKiller for RecordingTaskKiller {
    async fn kill(&self, mesos_task_ids: Vec<String>) -> PelotonResult<()> {
        self.killed.lock().extend(mesos_task_ids);
        Ok(())
    }
}
