// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The per-task state machine of the resource manager.
//!
//! Every transition is validated against a predecessor set; illegal
//! transitions are rejected with `FailedPrecondition`, never silently
//! accepted.

use std::time::Instant;

use peloton_common::id::{MesosTaskID, ResPoolID, TaskID};
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::{Task, TaskType};

/// Scheduler-side task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Initialized,
    Pending,
    Ready,
    Placing,
    Placed,
    Launching,
    Launched,
    Running,
    Succeeded,
    Failed,
    Killed,
    Lost,
    Preempting,
    Reserved,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Killed)
    }

    /// States whose tasks are charged against the pool allocation. The
    /// charge is added exactly once at the READY transition and released
    /// exactly once at MarkItDone.
    pub fn holds_allocation(self) -> bool {
        matches!(
            self,
            TaskState::Ready
                | TaskState::Placing
                | TaskState::Placed
                | TaskState::Launching
                | TaskState::Launched
                | TaskState::Running
                | TaskState::Reserved
                | TaskState::Preempting
        )
    }

    fn allowed_predecessors(self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            // Terminal retries re-enter the pipeline from the top.
            Initialized => &[Failed, Lost, Killed, Preempting],
            Pending => &[Initialized],
            Ready => &[Pending, Placing, Placed, Launching, Reserved],
            Placing => &[Ready],
            Placed => &[Placing],
            Launching => &[Placed],
            Launched => &[Launching],
            Running => &[Launching, Launched],
            Succeeded => &[Launched, Running],
            Failed => &[Launching, Launched, Running],
            Killed => &[
                Initialized,
                Pending,
                Ready,
                Placing,
                Placed,
                Launching,
                Launched,
                Running,
                Reserved,
                Preempting,
            ],
            Lost => &[Launching, Launched, Running],
            Preempting => &[Ready, Placing, Placed, Launching, Launched, Running],
            Reserved => &[Ready],
        }
    }
}

/// A task as tracked by the resource manager.
#[derive(Debug, Clone)]
pub struct RMTask {
    pub task: Task,
    /// The gang this task is scheduled with; equals its own id for
    /// singleton gangs.
    pub gang_id: TaskID,
    pub state: TaskState,
    pub goal_state: TaskState,
    pub respool_id: ResPoolID,
    pub mesos_task_id: MesosTaskID,
    pub host: Option<String>,
    pub placement_retry_count: u32,
    pub placement_attempt_count: u32,
    /// While set and in the future, the task sits out of the ready queue.
    pub backoff_until: Option<Instant>,
    pub failures_count: u32,
    pub start_time: Option<Instant>,
    pub last_action_time: Instant,
}

impl RMTask {
    pub fn new(task: Task, gang_id: TaskID, respool_id: ResPoolID) -> Self {
        let goal_state = match task.task_type {
            TaskType::Batch => TaskState::Succeeded,
            TaskType::Stateless | TaskType::Daemon | TaskType::Stateful => TaskState::Running,
        };
        let mesos_task_id = MesosTaskID::new(task.id.clone());
        Self {
            task,
            gang_id,
            state: TaskState::Initialized,
            goal_state,
            respool_id,
            mesos_task_id,
            host: None,
            placement_retry_count: 0,
            placement_attempt_count: 0,
            backoff_until: None,
            failures_count: 0,
            start_time: None,
            last_action_time: Instant::now(),
        }
    }

    /// Validated state transition.
    pub fn transit_to(&mut self, new_state: TaskState) -> PelotonResult<()> {
        if !new_state.allowed_predecessors().contains(&self.state) {
            return Err(PelotonError::failed_precondition(format!(
                "task {}: illegal transition {:?} -> {:?}",
                self.task.id, self.state, new_state
            )));
        }
        tracing::debug!(task = %self.task.id, from = ?self.state, to = ?new_state, "task transition");
        self.state = new_state;
        self.last_action_time = Instant::now();
        if new_state == TaskState::Running && self.start_time.is_none() {
            self.start_time = Some(self.last_action_time);
        }
        Ok(())
    }

    /// The placement retry cycle this task is in (0-based, advances every
    /// `attempts_percycle` failed attempts).
    pub fn placement_cycle(&self, attempts_percycle: u32) -> u32 {
        self.placement_retry_count / attempts_percycle.max(1)
    }

    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Reset for a retry run: fresh broker identity, back to INITIALIZED.
    pub fn reset_for_retry(&mut self) {
        self.mesos_task_id = self.mesos_task_id.next_attempt();
        self.state = TaskState::Initialized;
        self.host = None;
        self.start_time = None;
        self.placement_retry_count = 0;
        self.placement_attempt_count = 0;
        self.backoff_until = None;
        self.last_action_time = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peloton_common::resources::Resources;

    fn rm_task() -> RMTask {
        let task = Task::new("job1-1", "job1", Resources::new(1.0, 100.0, 10.0, 0.0));
        RMTask::new(task, TaskID::from("job1-1"), ResPoolID::from("respool-1"))
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = rm_task();
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
            TaskState::Launched,
            TaskState::Running,
            TaskState::Succeeded,
        ] {
            t.transit_to(state).unwrap();
        }
        assert!(t.state.is_terminal());
        assert!(t.start_time.is_some());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut t = rm_task();
        let err = t.transit_to(TaskState::Running).unwrap_err();
        assert!(err.is_failed_precondition());
        assert_eq!(t.state, TaskState::Initialized);

        t.transit_to(TaskState::Pending).unwrap();
        assert!(t.transit_to(TaskState::Placed).is_err());
    }

    #[test]
    fn test_timeout_transitions_back_to_ready() {
        let mut t = rm_task();
        t.transit_to(TaskState::Pending).unwrap();
        t.transit_to(TaskState::Ready).unwrap();
        t.transit_to(TaskState::Placing).unwrap();
        // Placing timeout.
        t.transit_to(TaskState::Ready).unwrap();
        t.transit_to(TaskState::Placing).unwrap();
        t.transit_to(TaskState::Placed).unwrap();
        t.transit_to(TaskState::Launching).unwrap();
        // Launching timeout.
        t.transit_to(TaskState::Ready).unwrap();
    }

    #[test]
    fn test_reservation_cycle() {
        let mut t = rm_task();
        t.transit_to(TaskState::Pending).unwrap();
        t.transit_to(TaskState::Ready).unwrap();
        t.transit_to(TaskState::Reserved).unwrap();
        // Reserving timeout drops back to ready.
        t.transit_to(TaskState::Ready).unwrap();
    }

    #[test]
    fn test_allocation_holding_states() {
        assert!(!TaskState::Initialized.holds_allocation());
        assert!(!TaskState::Pending.holds_allocation());
        assert!(TaskState::Ready.holds_allocation());
        assert!(TaskState::Running.holds_allocation());
        assert!(TaskState::Preempting.holds_allocation());
        assert!(!TaskState::Succeeded.holds_allocation());
    }

    #[test]
    fn test_placement_cycle() {
        let mut t = rm_task();
        t.placement_retry_count = 5;
        assert_eq!(t.placement_cycle(3), 1);
        t.placement_retry_count = 6;
        assert_eq!(t.placement_cycle(3), 2);
    }

    #[test]
    fn test_reset_for_retry() {
        let mut t = rm_task();
        t.transit_to(TaskState::Pending).unwrap();
        t.transit_to(TaskState::Ready).unwrap();
        t.transit_to(TaskState::Placing).unwrap();
        t.transit_to(TaskState::Placed).unwrap();
        t.transit_to(TaskState::Launching).unwrap();
        t.transit_to(TaskState::Running).unwrap();
        t.transit_to(TaskState::Failed).unwrap();

        let old_attempt = t.mesos_task_id.attempt;
        t.reset_for_retry();
        assert_eq!(t.state, TaskState::Initialized);
        assert_eq!(t.mesos_task_id.attempt, old_attempt + 1);
        assert!(t.host.is_none());
    }

    #[test]
    fn test_goal_state_by_type() {
        let t = rm_task();
        assert_eq!(t.goal_state, TaskState::Succeeded);

        let mut stateless = Task::new("job2-0", "job2", Resources::new(1.0, 0.0, 0.0, 0.0));
        stateless.task_type = TaskType::Stateless;
        let t = RMTask::new(stateless, TaskID::from("job2-0"), ResPoolID::from("respool-1"));
        assert_eq!(t.goal_state, TaskState::Running);
    }
}
