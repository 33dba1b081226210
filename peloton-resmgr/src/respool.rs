// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource pool node.
//!
//! A pool is an arena node: children are held as ordered ids, the parent as
//! an id, both resolved through the tree's index. Leaves hold the queues;
//! only leaves accept jobs.

use serde::{Deserialize, Serialize};

use peloton_common::id::ResPoolID;
use peloton_common::resources::{FixedPoint, ResourceKind, Resources};
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::Gang;

use crate::queue::MultiLevelList;

/// Id of the root pool.
pub const ROOT_RESPOOL_ID: &str = "root";

/// Per-kind pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: ResourceKind,
    pub reservation: f64,
    pub limit: f64,
    pub share: f64,
}

/// How a pool drains its pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    PriorityFifo,
}

/// Externally supplied pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResPoolConfig {
    pub name: String,
    pub parent: Option<ResPoolID>,
    pub resources: Vec<ResourceConfig>,
    pub policy: SchedulingPolicy,
}

impl ResPoolConfig {
    pub fn new(name: impl Into<String>, parent: Option<ResPoolID>) -> Self {
        Self {
            name: name.into(),
            parent,
            resources: Vec::new(),
            policy: SchedulingPolicy::PriorityFifo,
        }
    }

    pub fn with_resource(mut self, kind: ResourceKind, reservation: f64, limit: f64, share: f64) -> Self {
        self.resources.push(ResourceConfig {
            kind,
            reservation,
            limit,
            share,
        });
        self
    }

    pub fn validate(&self) -> PelotonResult<()> {
        if self.name.is_empty() {
            return Err(PelotonError::invalid_argument("pool name must not be empty"));
        }
        for res in &self.resources {
            if res.reservation < 0.0 || res.limit < 0.0 || res.share < 0.0 {
                return Err(PelotonError::invalid_argument(format!(
                    "pool {}: negative {} config",
                    self.name, res.kind
                )));
            }
            if res.reservation > res.limit {
                return Err(PelotonError::invalid_argument(format!(
                    "pool {}: {} reservation {} exceeds limit {}",
                    self.name, res.kind, res.reservation, res.limit
                )));
            }
        }
        Ok(())
    }

    fn vector_of(&self, select: impl Fn(&ResourceConfig) -> f64) -> Resources {
        let mut out = Resources::ZERO;
        for res in &self.resources {
            out.set(res.kind, FixedPoint::from_f64(select(res)));
        }
        out
    }
}

/// Pending sub-queues so each workload class drains under its own gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Controller,
    NonPreemptible,
    Revocable,
    Default,
}

impl QueueClass {
    pub const ALL: [QueueClass; 4] = [
        QueueClass::Controller,
        QueueClass::NonPreemptible,
        QueueClass::Revocable,
        QueueClass::Default,
    ];

    /// Classify a gang by its first task's flags.
    pub fn for_gang(gang: &Gang) -> QueueClass {
        let task = &gang.tasks[0];
        if task.controller {
            QueueClass::Controller
        } else if task.revocable {
            QueueClass::Revocable
        } else if !task.preemptible {
            QueueClass::NonPreemptible
        } else {
            QueueClass::Default
        }
    }
}

/// Gang priority is the first task's priority.
pub fn gang_priority(gang: &Gang) -> u32 {
    gang.tasks[0].priority
}

/// One node of the resource-pool tree. All fields are mutated under the
/// tree's lock.
pub struct ResPool {
    pub id: ResPoolID,
    pub name: String,
    pub parent: Option<ResPoolID>,
    pub children: Vec<ResPoolID>,

    pub reservation: Resources,
    pub limit: Resources,
    pub share: Resources,
    pub policy: SchedulingPolicy,

    pending_controller: MultiLevelList<Gang>,
    pending_non_preemptible: MultiLevelList<Gang>,
    pending_revocable: MultiLevelList<Gang>,
    pending_default: MultiLevelList<Gang>,
    ready: MultiLevelList<Gang>,

    pub allocation: Resources,
    pub demand: Resources,
    pub entitlement: Resources,
}

impl ResPool {
    pub fn from_config(id: ResPoolID, config: &ResPoolConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            parent: config.parent.clone(),
            children: Vec::new(),
            reservation: config.vector_of(|r| r.reservation),
            limit: config.vector_of(|r| r.limit),
            share: config.vector_of(|r| r.share),
            policy: config.policy,
            pending_controller: MultiLevelList::new(),
            pending_non_preemptible: MultiLevelList::new(),
            pending_revocable: MultiLevelList::new(),
            pending_default: MultiLevelList::new(),
            ready: MultiLevelList::new(),
            allocation: Resources::ZERO,
            demand: Resources::ZERO,
            entitlement: Resources::ZERO,
        }
    }

    /// Apply a config change in place, preserving queues and accounting.
    pub fn apply_config(&mut self, config: &ResPoolConfig) {
        self.name = config.name.clone();
        self.parent = config.parent.clone();
        self.reservation = config.vector_of(|r| r.reservation);
        self.limit = config.vector_of(|r| r.limit);
        self.share = config.vector_of(|r| r.share);
        self.policy = config.policy;
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether any gang is queued or admitted here.
    pub fn has_queued_work(&self) -> bool {
        self.pending_len() > 0 || self.ready.len() > 0 || !self.allocation.is_zero()
    }

    fn pending_mut(&mut self, class: QueueClass) -> &mut MultiLevelList<Gang> {
        match class {
            QueueClass::Controller => &mut self.pending_controller,
            QueueClass::NonPreemptible => &mut self.pending_non_preemptible,
            QueueClass::Revocable => &mut self.pending_revocable,
            QueueClass::Default => &mut self.pending_default,
        }
    }

    fn pending(&self, class: QueueClass) -> &MultiLevelList<Gang> {
        match class {
            QueueClass::Controller => &self.pending_controller,
            QueueClass::NonPreemptible => &self.pending_non_preemptible,
            QueueClass::Revocable => &self.pending_revocable,
            QueueClass::Default => &self.pending_default,
        }
    }

    pub fn pending_len(&self) -> usize {
        QueueClass::ALL.iter().map(|c| self.pending(*c).len()).sum()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Queue a gang in its class's pending queue.
    pub fn enqueue_gang(&mut self, gang: Gang) {
        let class = QueueClass::for_gang(&gang);
        let priority = gang_priority(&gang);
        self.pending_mut(class).push(priority, gang);
    }

    /// Admit the head gang of one class if the pool has entitlement
    /// headroom: `allocation + gang.resource <= entitlement`. The admitted
    /// gang moves to the ready queue and its resources join the allocation.
    pub fn try_admit_one(&mut self, class: QueueClass) -> Option<Gang> {
        let gang_resource = {
            let head = self.pending(class).peek_highest()?;
            head.resource()
        };
        let mut would_be = self.allocation;
        would_be.add(&gang_resource);
        if !self.entitlement.contains(&would_be) {
            return None;
        }
        let gang = self.pending_mut(class).pop_highest()?;
        self.allocation.add(&gang_resource);
        self.ready.push(gang_priority(&gang), gang.clone());
        Some(gang)
    }

    /// Pop the first ready gang matching the predicate.
    pub fn dequeue_ready_match(&mut self, pred: impl FnMut(&Gang) -> bool) -> Option<Gang> {
        self.ready.pop_first_match(pred)
    }

    /// Put an admitted gang back on the ready queue (placement retry). The
    /// gang's allocation is untouched: it was charged at admission and only
    /// MarkItDone releases it.
    pub fn requeue_ready(&mut self, gang: Gang) {
        self.ready.push(gang_priority(&gang), gang);
    }

    /// Recompute pending demand: the sum of all queued gangs' resources.
    pub fn calculate_demand(&mut self) -> Resources {
        let mut demand = Resources::ZERO;
        for class in QueueClass::ALL {
            for gang in self.pending(class).iter() {
                demand.add(&gang.resource());
            }
        }
        self.demand = demand;
        demand
    }

    pub fn add_to_allocation(&mut self, delta: &Resources) {
        self.allocation.add(delta);
    }

    pub fn subtract_from_allocation(&mut self, delta: &Resources) {
        self.allocation.subtract(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peloton_common::task::Task;

    fn pool_config() -> ResPoolConfig {
        ResPoolConfig::new("respool1", Some(ResPoolID::from(ROOT_RESPOOL_ID)))
            .with_resource(ResourceKind::Cpu, 100.0, 1000.0, 1.0)
            .with_resource(ResourceKind::Mem, 100.0, 1000.0, 1.0)
            .with_resource(ResourceKind::Disk, 100.0, 1000.0, 1.0)
            .with_resource(ResourceKind::Gpu, 2.0, 4.0, 1.0)
    }

    fn gang(id: &str, cpu: f64, priority: u32) -> Gang {
        let mut task = Task::new(id, "job1", Resources::new(cpu, 0.0, 0.0, 0.0));
        task.priority = priority;
        Gang::of(task)
    }

    #[test]
    fn test_config_validation() {
        pool_config().validate().unwrap();

        let bad = ResPoolConfig::new("bad", None).with_resource(ResourceKind::Cpu, 10.0, 5.0, 1.0);
        let err = bad.validate().unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_config_vectors() {
        let pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        assert_eq!(pool.reservation.cpu.to_f64(), 100.0);
        assert_eq!(pool.limit.gpu.to_f64(), 4.0);
        assert_eq!(pool.share.mem.to_f64(), 1.0);
        assert!(pool.is_leaf());
    }

    #[test]
    fn test_enqueue_dequeue_priority_fifo() {
        let mut pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        pool.entitlement = Resources::new(100.0, 100.0, 100.0, 100.0);

        pool.enqueue_gang(gang("job1-1", 1.0, 0));
        pool.enqueue_gang(gang("job1-2", 1.0, 0));
        assert_eq!(pool.pending_len(), 2);

        let first = pool.try_admit_one(QueueClass::Default).unwrap();
        let second = pool.try_admit_one(QueueClass::Default).unwrap();
        assert_eq!(first.id().value(), "job1-1");
        assert_eq!(second.id().value(), "job1-2");
        assert_eq!(pool.ready_len(), 2);
    }

    #[test]
    fn test_admit_respects_entitlement() {
        let mut pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        pool.entitlement = Resources::new(2.0, 0.0, 0.0, 0.0);

        pool.enqueue_gang(gang("job1-1", 2.0, 0));
        pool.enqueue_gang(gang("job1-2", 1.0, 0));

        assert!(pool.try_admit_one(QueueClass::Default).is_some());
        assert_eq!(pool.allocation.cpu.to_f64(), 2.0);
        // Next gang would exceed entitlement; head-of-line blocks.
        assert!(pool.try_admit_one(QueueClass::Default).is_none());
        assert_eq!(pool.pending_len(), 1);
    }

    #[test]
    fn test_classes_have_separate_queues() {
        let mut pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        pool.entitlement = Resources::new(100.0, 100.0, 100.0, 100.0);

        let mut controller = Task::new("job1-0", "job1", Resources::new(1.0, 0.0, 0.0, 0.0));
        controller.controller = true;
        let mut pinned = Task::new("job1-1", "job1", Resources::new(1.0, 0.0, 0.0, 0.0));
        pinned.preemptible = false;

        pool.enqueue_gang(Gang::of(controller));
        pool.enqueue_gang(Gang::of(pinned));
        pool.enqueue_gang(gang("job1-2", 1.0, 0));

        assert!(pool.try_admit_one(QueueClass::Controller).is_some());
        assert!(pool.try_admit_one(QueueClass::NonPreemptible).is_some());
        assert!(pool.try_admit_one(QueueClass::Default).is_some());
        assert!(pool.try_admit_one(QueueClass::Revocable).is_none());
    }

    #[test]
    fn test_calculate_demand_sums_pending_only() {
        let mut pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        pool.entitlement = Resources::new(100.0, 100.0, 100.0, 100.0);

        pool.enqueue_gang(gang("job1-1", 2.0, 0));
        pool.enqueue_gang(gang("job1-2", 3.0, 1));
        assert_eq!(pool.calculate_demand().cpu.to_f64(), 5.0);

        // Admitted gangs leave demand.
        pool.try_admit_one(QueueClass::Default);
        assert_eq!(pool.calculate_demand().cpu.to_f64(), 2.0);
    }

    #[test]
    fn test_dequeue_ready_match() {
        let mut pool = ResPool::from_config(ResPoolID::from("respool1"), &pool_config());
        pool.entitlement = Resources::new(100.0, 100.0, 100.0, 100.0);
        pool.enqueue_gang(gang("job1-1", 1.0, 0));
        pool.try_admit_one(QueueClass::Default);

        let gang = pool.dequeue_ready_match(|_| true).unwrap();
        assert_eq!(gang.id().value(), "job1-1");
        assert_eq!(pool.ready_len(), 0);

        // Requeue keeps allocation untouched.
        let alloc = pool.allocation;
        pool.requeue_ready(gang);
        assert_eq!(pool.ready_len(), 1);
        assert_eq!(pool.allocation, alloc);
    }
}
