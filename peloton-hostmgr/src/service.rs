// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Host manager service facade.
//!
//! `HostManager` is the contract the placement engine and job manager
//! program against; `HostService` is the in-process implementation backed
//! by the offer pool and the broker stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use peloton_common::id::TaskID;
use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};

use crate::broker::{Call, CallKind, FrameworkInfoProvider, LaunchableTask, Operation, SchedulerClient};
use crate::matcher::{HostFilter, HostFilterResult};
use crate::offer::Offer;
use crate::pool::OfferPool;

/// One matched host with its claimed offers.
#[derive(Debug, Clone)]
pub struct HostOffer {
    pub hostname: String,
    pub offers: Vec<Offer>,
}

impl HostOffer {
    pub fn unreserved_amount(&self) -> Resources {
        crate::offer::unreserved_sum(self.offers.iter())
    }

    /// All ports available across this host's unreserved offers.
    pub fn available_ports(&self) -> Vec<u32> {
        self.offers
            .iter()
            .filter(|o| !o.is_reserved())
            .flat_map(|o| o.ports.iter().copied())
            .collect()
    }

    pub fn offer_ids(&self) -> Vec<peloton_common::id::OfferID> {
        self.offers.iter().map(|o| o.id.clone()).collect()
    }
}

/// The host manager surface consumed by the other services.
#[async_trait]
pub trait HostManager: Send + Sync {
    /// Claim hosts matching the filter. An empty result is not an error.
    async fn acquire_host_offers(
        &self,
        filter: &HostFilter,
    ) -> PelotonResult<(Vec<HostOffer>, HashMap<HostFilterResult, u32>)>;

    /// Return unused claimed hosts to READY. Idempotent: hosts already
    /// returned (or reset by the placing-hold expiry) are skipped.
    async fn release_host_offers(&self, offers: &[HostOffer]) -> PelotonResult<()>;

    /// Consume a placed host's offers with a LAUNCH accept.
    async fn launch_tasks(
        &self,
        hostname: &str,
        tasks: Vec<LaunchableTask>,
        use_reserved: bool,
    ) -> PelotonResult<()>;

    /// Forward kill requests to the broker.
    async fn kill_tasks(&self, task_ids: Vec<String>) -> PelotonResult<()>;

    /// Pin a host able to run the given resource shape to the tasks.
    async fn reserve_hosts(
        &self,
        task_ids: Vec<TaskID>,
        needed: Resources,
        duration: Duration,
    ) -> PelotonResult<String>;

    /// Ask the broker to re-send the status of every known task.
    async fn reconcile_tasks(&self) -> PelotonResult<()>;

    /// Snapshot of the unreserved amounts cached across all hosts.
    fn cluster_capacity(&self) -> Resources;
}

/// In-process host manager.
pub struct HostService {
    pool: Arc<OfferPool>,
    scheduler_client: Arc<dyn SchedulerClient>,
    framework: Arc<dyn FrameworkInfoProvider>,
}

impl HostService {
    pub fn new(
        pool: Arc<OfferPool>,
        scheduler_client: Arc<dyn SchedulerClient>,
        framework: Arc<dyn FrameworkInfoProvider>,
    ) -> Self {
        Self {
            pool,
            scheduler_client,
            framework,
        }
    }

    pub fn pool(&self) -> &Arc<OfferPool> {
        &self.pool
    }
}

#[async_trait]
impl HostManager for HostService {
    async fn acquire_host_offers(
        &self,
        filter: &HostFilter,
    ) -> PelotonResult<(Vec<HostOffer>, HashMap<HostFilterResult, u32>)> {
        let (host_offers, counts) = self.pool.claim_for_place(filter)?;
        let result = host_offers
            .into_iter()
            .map(|(hostname, offers)| HostOffer { hostname, offers })
            .collect();
        Ok((result, counts))
    }

    async fn release_host_offers(&self, offers: &[HostOffer]) -> PelotonResult<()> {
        for host_offer in offers {
            if let Err(err) = self.pool.return_unused_offers(&host_offer.hostname) {
                // Already returned or reset; releasing twice is fine.
                tracing::warn!(host = %host_offer.hostname, %err, "skipping host offer release");
            }
        }
        Ok(())
    }

    async fn launch_tasks(
        &self,
        hostname: &str,
        tasks: Vec<LaunchableTask>,
        use_reserved: bool,
    ) -> PelotonResult<()> {
        if tasks.is_empty() {
            return Err(PelotonError::invalid_argument("no tasks to launch"));
        }
        let claimed = self.pool.claim_for_launch(hostname, use_reserved)?;
        if claimed.is_empty() {
            return Err(PelotonError::failed_precondition(format!(
                "no offers left on host {hostname} to launch on"
            )));
        }

        let call = Call {
            framework_id: self.framework.framework_id(),
            kind: CallKind::Accept {
                offer_ids: claimed.keys().cloned().collect(),
                operations: vec![Operation::Launch { tasks }],
            },
        };
        let stream_id = self.framework.stream_id();
        self.scheduler_client.call(&stream_id, call).await.map_err(|err| {
            // The offers are already consumed from the pool; the broker's
            // offer timeout reclaims them on its side.
            tracing::error!(host = hostname, %err, "launch accept failed");
            err
        })
    }

    async fn kill_tasks(&self, task_ids: Vec<String>) -> PelotonResult<()> {
        let stream_id = self.framework.stream_id();
        for task_id in task_ids {
            let call = Call {
                framework_id: self.framework.framework_id(),
                kind: CallKind::Kill { task_id },
            };
            self.scheduler_client.call(&stream_id, call).await?;
        }
        Ok(())
    }

    async fn reserve_hosts(
        &self,
        task_ids: Vec<TaskID>,
        needed: Resources,
        duration: Duration,
    ) -> PelotonResult<String> {
        self.pool.find_and_reserve_host(task_ids, &needed, duration)
    }

    async fn reconcile_tasks(&self) -> PelotonResult<()> {
        let call = Call {
            framework_id: self.framework.framework_id(),
            kind: CallKind::Reconcile,
        };
        let stream_id = self.framework.stream_id();
        self.scheduler_client.call(&stream_id, call).await
    }

    fn cluster_capacity(&self) -> Resources {
        self.pool.total_unreserved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{RecordingSchedulerClient, StaticFrameworkInfo};
    use crate::summary::HostStatus;

    fn service() -> (HostService, Arc<RecordingSchedulerClient>) {
        let client = Arc::new(RecordingSchedulerClient::new());
        let framework = Arc::new(StaticFrameworkInfo::new("peloton-fw"));
        let pool = Arc::new(OfferPool::new(
            Duration::from_secs(300),
            Duration::from_secs(300),
            Arc::clone(&client) as Arc<dyn SchedulerClient>,
            Arc::clone(&framework) as Arc<dyn FrameworkInfoProvider>,
        ));
        (
            HostService::new(pool, client.clone(), framework),
            client,
        )
    }

    fn launchable(id: &str) -> LaunchableTask {
        LaunchableTask {
            mesos_task_id: format!("{id}-1"),
            name: id.to_string(),
            resources: Resources::new(1.0, 10.0, 0.0, 0.0),
            ports: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_acquire_then_release_restores_ready() {
        let (svc, _) = service();
        svc.pool()
            .add_offers(vec![Offer::new("o1", "h1", Resources::new(4.0, 100.0, 0.0, 0.0))]);

        let filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 1);
        let (offers, _) = svc.acquire_host_offers(&filter).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(svc.pool().host_status("h1"), Some(HostStatus::Placing));

        svc.release_host_offers(&offers).await.unwrap();
        assert_eq!(svc.pool().host_status("h1"), Some(HostStatus::Ready));

        // Double release is a no-op.
        svc.release_host_offers(&offers).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_tasks_sends_accept() {
        let (svc, client) = service();
        svc.pool()
            .add_offers(vec![Offer::new("o1", "h1", Resources::new(4.0, 100.0, 0.0, 0.0))]);

        let filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 1);
        svc.acquire_host_offers(&filter).await.unwrap();

        svc.launch_tasks("h1", vec![launchable("job1-0")], false)
            .await
            .unwrap();
        let launched = client.launched_tasks();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].name, "job1-0");
    }

    #[tokio::test]
    async fn test_launch_without_placement_fails() {
        let (svc, _) = service();
        svc.pool()
            .add_offers(vec![Offer::new("o1", "h1", Resources::new(4.0, 100.0, 0.0, 0.0))]);

        let err = svc
            .launch_tasks("h1", vec![launchable("job1-0")], false)
            .await
            .unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[tokio::test]
    async fn test_kill_tasks() {
        let (svc, client) = service();
        svc.kill_tasks(vec!["job1-0-1".into(), "job1-1-1".into()])
            .await
            .unwrap();
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cluster_capacity_tracks_all_hosts() {
        let (svc, _) = service();
        svc.pool().add_offers(vec![
            Offer::new("o1", "h1", Resources::new(4.0, 100.0, 0.0, 0.0)),
            Offer::new("o2", "h2", Resources::new(2.0, 50.0, 0.0, 0.0)),
        ]);
        assert_eq!(
            svc.cluster_capacity(),
            Resources::new(6.0, 150.0, 0.0, 0.0)
        );
    }
}
