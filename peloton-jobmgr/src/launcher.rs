// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task launcher: pulls placements from the resource manager and turns
//! them into launch calls against the host manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::id::TaskID;
use peloton_common::status::PelotonResult;
use peloton_common::task::{Placement, TaskType};
use peloton_hostmgr::broker::LaunchableTask;
use peloton_hostmgr::service::HostManager;
use peloton_resmgr::service::ResourceManager;
use peloton_resmgr::task::{RMTask, TaskState};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub task_type: TaskType,
    pub batch_size: usize,
    pub pace: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            task_type: TaskType::Batch,
            batch_size: 10,
            pace: Duration::from_millis(100),
        }
    }
}

pub struct TaskLauncher {
    resmgr: Arc<dyn ResourceManager>,
    hostmgr: Arc<dyn HostManager>,
    config: LauncherConfig,
}

impl TaskLauncher {
    pub fn new(
        resmgr: Arc<dyn ResourceManager>,
        hostmgr: Arc<dyn HostManager>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            resmgr,
            hostmgr,
            config,
        }
    }

    /// One pump iteration. Returns the number of placements launched.
    /// A failed launch is killed at the broker and left to the launching
    /// timeout to recycle.
    pub async fn launch_once(&self) -> PelotonResult<usize> {
        let placements = self
            .resmgr
            .get_placements(self.config.batch_size, self.config.task_type)
            .await?;
        if placements.is_empty() {
            return Ok(0);
        }

        // Dequeued placements moved their tasks to LAUNCHING; snapshot
        // them for broker identities and resource shapes.
        let launching: HashMap<TaskID, RMTask> = self
            .resmgr
            .get_active_tasks(None, Some(TaskState::Launching))
            .await
            .into_iter()
            .map(|t| (t.task.id.clone(), t))
            .collect();

        let mut launched = 0;
        for placement in placements {
            match self.launch_placement(&placement, &launching).await {
                Ok(()) => launched += 1,
                Err(err) => {
                    tracing::error!(
                        host = %placement.hostname,
                        tasks = placement.tasks.len(),
                        %err,
                        "placement launch failed"
                    );
                }
            }
        }
        Ok(launched)
    }

    async fn launch_placement(
        &self,
        placement: &Placement,
        launching: &HashMap<TaskID, RMTask>,
    ) -> PelotonResult<()> {
        let mut tasks = Vec::with_capacity(placement.tasks.len());
        let mut ports = placement.ports.iter().copied();
        for task_id in &placement.tasks {
            let Some(rm_task) = launching.get(task_id) else {
                tracing::warn!(task = %task_id, "placement task no longer launching, skipping");
                continue;
            };
            let task_ports: Vec<u32> = ports.by_ref().take(rm_task.task.num_ports as usize).collect();
            tasks.push(LaunchableTask {
                mesos_task_id: rm_task.mesos_task_id.to_string(),
                name: task_id.value().to_string(),
                resources: rm_task.task.resource,
                ports: task_ports,
            });
        }
        if tasks.is_empty() {
            return Ok(());
        }

        let mesos_ids: Vec<String> = tasks.iter().map(|t| t.mesos_task_id.clone()).collect();
        match self
            .hostmgr
            .launch_tasks(&placement.hostname, tasks, false)
            .await
        {
            Ok(()) => {
                tracing::info!(host = %placement.hostname, tasks = mesos_ids.len(), "tasks launched");
                Ok(())
            }
            Err(err) => {
                // Best-effort kill so nothing half-launched survives; the
                // launching timeout recycles the tasks either way.
                if let Err(kill_err) = self.hostmgr.kill_tasks(mesos_ids).await {
                    tracing::warn!(%kill_err, "kill after failed launch also failed");
                }
                Err(err)
            }
        }
    }
}

/// The launcher pump loop.
pub fn start_launcher_loop(
    launcher: Arc<TaskLauncher>,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pace = launcher.config.pace;
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(pace) => {
                    if let Err(err) = launcher.launch_once().await {
                        tracing::warn!(%err, "launcher iteration failed");
                    }
                }
            }
        }
    })
}
