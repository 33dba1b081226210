// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The placement loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::{Gang, Placement, TaskType};
use peloton_hostmgr::matcher::HostFilter;
use peloton_hostmgr::service::HostManager;
use peloton_resmgr::service::ResourceManager;
use peloton_util::backoff::ExponentialBackoff;

use crate::hosts::CandidateHost;

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub task_type: TaskType,
    /// Ready gangs pulled per iteration.
    pub batch_size: usize,
    /// Deadline on every outbound call.
    pub call_timeout: Duration,
    /// Sleep between productive iterations.
    pub pace: Duration,
    /// Backoff bounds for empty iterations.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            task_type: TaskType::Batch,
            batch_size: 10,
            call_timeout: Duration::from_secs(10),
            pace: Duration::from_millis(100),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

pub struct PlacementEngine {
    resmgr: Arc<dyn ResourceManager>,
    hostmgr: Arc<dyn HostManager>,
    config: PlacementConfig,
}

impl PlacementEngine {
    pub fn new(
        resmgr: Arc<dyn ResourceManager>,
        hostmgr: Arc<dyn HostManager>,
        config: PlacementConfig,
    ) -> Self {
        Self {
            resmgr,
            hostmgr,
            config,
        }
    }

    /// One iteration: dequeue, acquire, match, report, release. Returns
    /// the number of gangs placed. Unplaced gangs are left to the placing
    /// timeout, which recycles them through the ready queue.
    pub async fn place_once(&self) -> PelotonResult<usize> {
        let gangs = self
            .bounded(self.resmgr.dequeue_gangs(self.config.batch_size, self.config.task_type))
            .await??;
        if gangs.is_empty() {
            return Ok(0);
        }

        let filter = build_filter(&gangs);
        let (host_offers, result_counts) = self
            .bounded(self.hostmgr.acquire_host_offers(&filter))
            .await??;
        if host_offers.is_empty() {
            tracing::debug!(
                gangs = gangs.len(),
                ?result_counts,
                "no hosts matched, gangs recycle via placing timeout"
            );
            return Ok(0);
        }

        let mut candidates: Vec<CandidateHost> =
            host_offers.into_iter().map(CandidateHost::new).collect();

        // First fit, whole gang on one host, one gang per host: the
        // launch path claims every offer on the host at once.
        let mut placements = Vec::new();
        for gang in &gangs {
            let Some(candidate) = candidates.iter_mut().find(|c| !c.assigned && c.fits(gang))
            else {
                tracing::debug!(gang = %gang.id(), "no candidate host fits gang");
                continue;
            };
            let ports = candidate.assign(gang);
            placements.push(Placement {
                tasks: gang.tasks.iter().map(|t| t.id.clone()).collect(),
                hostname: candidate.offer.hostname.clone(),
                offer_ids: candidate.offer.offer_ids(),
                ports,
                task_type: self.config.task_type,
            });
        }

        let failed = self.resmgr.set_placements(placements.clone()).await;
        let failed_tasks: HashSet<_> = failed.iter().map(|(id, _)| id.clone()).collect();
        if !failed.is_empty() {
            tracing::warn!(failed = failed.len(), "some placements were rejected");
        }

        // Hosts that hold no accepted placement go back to READY.
        let kept_hosts: HashSet<String> = placements
            .iter()
            .filter(|p| p.tasks.iter().all(|t| !failed_tasks.contains(t)))
            .map(|p| p.hostname.clone())
            .collect();
        let unused: Vec<_> = candidates
            .iter()
            .filter(|c| !kept_hosts.contains(&c.offer.hostname))
            .map(|c| c.offer.clone())
            .collect();
        if !unused.is_empty() {
            self.bounded(self.hostmgr.release_host_offers(&unused))
                .await??;
        }

        Ok(kept_hosts.len())
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> PelotonResult<T> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .map_err(|_| PelotonError::unavailable("placement call deadline exceeded"))
    }
}

/// Build the host filter for a batch: each matched host must fit the
/// largest gang whole, and we want at most one host per gang. Host hints
/// carried by the tasks are tried first.
fn build_filter(gangs: &[Gang]) -> HostFilter {
    let mut minimum = Resources::ZERO;
    let mut num_ports = 0u32;
    let mut hints = Vec::new();
    for gang in gangs {
        minimum = minimum.component_max(&gang.resource());
        num_ports = num_ports.max(gang.num_ports());
        for task in &gang.tasks {
            if let Some(hint) = &task.host_hint {
                if !hints.contains(hint) {
                    hints.push(hint.clone());
                }
            }
        }
    }
    let mut filter = HostFilter::with_minimum(minimum, gangs.len() as u32);
    filter.resource_constraint.num_ports = num_ports;
    filter.hint.hostnames = hints;
    filter
}

/// The per-task-type placement loop: backs off while idle, paces while
/// productive, exits within one tick of cancellation.
pub fn start_placement_loop(
    engine: Arc<PlacementEngine>,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = engine.config.clone();
        let mut backoff =
            ExponentialBackoff::new(config.backoff_initial, 2.0, config.backoff_max);
        loop {
            let sleep = match engine.place_once().await {
                Ok(0) => backoff.next_delay_with_jitter(),
                Ok(placed) => {
                    tracing::debug!(placed, task_type = ?config.task_type, "placed gangs");
                    backoff.reset();
                    config.pace
                }
                Err(err) => {
                    tracing::warn!(%err, "placement iteration failed");
                    backoff.next_delay_with_jitter()
                }
            };
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    })
}
