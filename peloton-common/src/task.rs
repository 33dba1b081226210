// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task, gang and placement model shared across services.

use serde::{Deserialize, Serialize};

use crate::constraints::Constraint;
use crate::id::{JobID, OfferID, TaskID};
use crate::resources::Resources;

/// Workload classes; the placement engine runs one loop per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Batch,
    Stateless,
    Daemon,
    Stateful,
}

/// A task as submitted to the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskID,
    pub job_id: JobID,
    pub task_type: TaskType,
    /// Higher value schedules first within a pool.
    pub priority: u32,
    pub resource: Resources,
    pub num_ports: u32,
    pub preemptible: bool,
    pub revocable: bool,
    /// Controller tasks drain under their own quota.
    pub controller: bool,
    pub constraint: Option<Constraint>,
    /// Prefer this host when matching, e.g. after a host reservation or a
    /// previous run there.
    pub host_hint: Option<String>,
    pub max_failures: u32,
}

impl Task {
    /// A minimal batch task, used pervasively by tests.
    pub fn new(id: impl Into<String>, job_id: impl Into<String>, resource: Resources) -> Self {
        Self {
            id: TaskID::new(id),
            job_id: JobID::new(job_id),
            task_type: TaskType::Batch,
            priority: 0,
            resource,
            num_ports: 0,
            preemptible: true,
            revocable: false,
            controller: false,
            constraint: None,
            host_hint: None,
            max_failures: 0,
        }
    }
}

/// An ordered set of tasks placed atomically (all or none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gang {
    pub tasks: Vec<Task>,
}

impl Gang {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn of(task: Task) -> Self {
        Self { tasks: vec![task] }
    }

    /// The gang id is the first task's id.
    pub fn id(&self) -> &TaskID {
        &self.tasks[0].id
    }

    /// Aggregate resource demand of the whole gang.
    pub fn resource(&self) -> Resources {
        Resources::sum(self.tasks.iter().map(|t| &t.resource))
    }

    pub fn num_ports(&self) -> u32 {
        self.tasks.iter().map(|t| t.num_ports).sum()
    }

    pub fn task_type(&self) -> TaskType {
        self.tasks[0].task_type
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// A pairing of tasks with a host's offers, produced by the placement
/// engine and consumed by the job manager's launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub tasks: Vec<TaskID>,
    pub hostname: String,
    pub offer_ids: Vec<OfferID>,
    pub ports: Vec<u32>,
    pub task_type: TaskType,
}

/// Terminal-or-not task states as reported by the external broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerTaskState {
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

/// One entry in the broker's status-update stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    /// Monotonic stream offset; consumers dedupe on it.
    pub offset: u64,
    pub task_id: TaskID,
    pub state: BrokerTaskState,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gang_id_is_first_task() {
        let gang = Gang::new(vec![
            Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)),
            Task::new("job1-1", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)),
        ]);
        assert_eq!(gang.id().value(), "job1-0");
        assert_eq!(gang.len(), 2);
    }

    #[test]
    fn test_gang_aggregate_resource() {
        let gang = Gang::new(vec![
            Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)),
            Task::new("job1-1", "job1", Resources::new(2.0, 30.0, 5.0, 1.0)),
        ]);
        assert_eq!(gang.resource(), Resources::new(3.0, 40.0, 5.0, 1.0));
    }

    #[test]
    fn test_status_event_serde() {
        let event = TaskStatusEvent {
            offset: 7,
            task_id: TaskID::from("job1-0"),
            state: BrokerTaskState::Running,
            reason: None,
            message: Some("started".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TaskStatusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
