// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The offer pool: a concurrent cache of broker offers keyed by host.
//!
//! Two indices are kept in step: `host_index` (hostname → summary) and
//! `timed_offers` (offer id → hostname + expiration) for O(1) rescind and
//! expiry scans. Lock order is host_index → summary → timed_offers.
//!
//! `ready_resources` and `placing_resources` account the unreserved scalar
//! amount of hosts by status; the pair moves only together with the owning
//! summary's status transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use peloton_common::id::{OfferID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};

use crate::broker::{Call, CallKind, FrameworkInfoProvider, Operation, SchedulerClient};
use crate::matcher::{HostFilter, HostFilterResult, Matcher};
use crate::offer::Offer;
use crate::summary::{HostStatus, HostSummary};

/// Hostname and expiration of a cached offer, for rescind and pruning.
#[derive(Debug, Clone)]
pub struct TimedOffer {
    pub hostname: String,
    pub expiration: Instant,
}

/// Plain counters read by tests and debug endpoints.
#[derive(Default)]
pub struct PoolMetrics {
    pub decline_fail: AtomicU64,
    /// Rescind observed while the host was mid-placement. The placement
    /// settles via SetPlacements failure + placing timeout, so this is a
    /// counter rather than an error.
    pub race_on_rescind: AtomicU64,
    pub unreserve: AtomicU64,
    pub unreserve_fail: AtomicU64,
}

pub struct OfferPool {
    host_index: RwLock<HashMap<String, Arc<HostSummary>>>,
    timed_offers: Mutex<HashMap<OfferID, TimedOffer>>,

    offer_hold_time: Duration,
    placing_hold_time: Duration,

    /// Hosts with at least one offer, READY and PLACING included.
    available_hosts: AtomicU32,
    ready_resources: Mutex<Resources>,
    placing_resources: Mutex<Resources>,

    scheduler_client: Arc<dyn SchedulerClient>,
    framework: Arc<dyn FrameworkInfoProvider>,

    pub metrics: PoolMetrics,
}

impl OfferPool {
    pub fn new(
        offer_hold_time: Duration,
        placing_hold_time: Duration,
        scheduler_client: Arc<dyn SchedulerClient>,
        framework: Arc<dyn FrameworkInfoProvider>,
    ) -> Self {
        Self {
            host_index: RwLock::new(HashMap::new()),
            timed_offers: Mutex::new(HashMap::new()),
            offer_hold_time,
            placing_hold_time,
            available_hosts: AtomicU32::new(0),
            ready_resources: Mutex::new(Resources::ZERO),
            placing_resources: Mutex::new(Resources::ZERO),
            scheduler_client,
            framework,
            metrics: PoolMetrics::default(),
        }
    }

    /// Index offers under their hosts, creating summaries as needed.
    pub fn add_offers(&self, offers: Vec<Offer>) {
        let expiration = Instant::now() + self.offer_hold_time;
        for offer in offers {
            let timed = TimedOffer {
                hostname: offer.hostname.clone(),
                expiration,
            };
            let id = offer.id.clone();
            if !self.try_add_offer(&offer) {
                self.add_offer_new_host(offer);
            }
            self.timed_offers.lock().insert(id, timed);
        }
    }

    /// Fast path: host already known, read lock suffices.
    fn try_add_offer(&self, offer: &Offer) -> bool {
        let index = self.host_index.read();
        let Some(summary) = index.get(&offer.hostname) else {
            return false;
        };
        if !summary.has_any_offer() {
            self.available_hosts.fetch_add(1, Ordering::SeqCst);
        }
        let status = summary.add_offer(offer.clone());
        self.credit_bucket(status, &offer.unreserved_resources());
        true
    }

    /// Slow path: take the write lock to create the summary.
    fn add_offer_new_host(&self, offer: Offer) {
        let mut index = self.host_index.write();
        let summary = index
            .entry(offer.hostname.clone())
            .or_insert_with(|| {
                Arc::new(HostSummary::new(&offer.hostname, self.placing_hold_time))
            });
        if !summary.has_any_offer() {
            self.available_hosts.fetch_add(1, Ordering::SeqCst);
        }
        let delta = offer.unreserved_resources();
        let status = summary.add_offer(offer);
        self.credit_bucket(status, &delta);
    }

    /// Remove one offer by id. Returns whether the offer was in the pool.
    pub fn rescind_offer(&self, offer_id: &OfferID) -> bool {
        let index = self.host_index.read();
        let Some(timed) = self.timed_offers.lock().remove(offer_id) else {
            tracing::warn!(offer_id = %offer_id, "rescinded offer not found in pool");
            return false;
        };

        let Some(summary) = index.get(&timed.hostname) else {
            tracing::warn!(host = %timed.hostname, offer_id = %offer_id, "host not found in index");
            return false;
        };

        let (status, removed) = summary.remove_offer(offer_id);
        if let Some(offer) = removed {
            if status == HostStatus::Placing {
                self.metrics.race_on_rescind.fetch_add(1, Ordering::SeqCst);
            }
            self.debit_bucket(status, &offer.unreserved_resources());
            if !summary.has_any_offer() {
                self.available_hosts.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!(
                host = %timed.hostname,
                offer_id = %offer_id,
                ?status,
                "removed rescinded offer"
            );
        }
        true
    }

    /// Drop every offer past its expiration. Returns the removed offer ids
    /// (for declining at the broker) and the count of offers still held.
    pub fn remove_expired_offers(&self, now: Instant) -> (Vec<OfferID>, usize) {
        let index = self.host_index.read();
        let mut timed = self.timed_offers.lock();

        let expired: Vec<(OfferID, TimedOffer)> = timed
            .iter()
            .filter(|(_, t)| now > t.expiration)
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        for (id, _) in &expired {
            timed.remove(id);
        }
        let remaining = timed.len();
        drop(timed);

        for (id, t) in &expired {
            let Some(summary) = index.get(&t.hostname) else {
                continue;
            };
            let (status, removed) = summary.remove_offer(id);
            if let Some(offer) = removed {
                self.debit_bucket(status, &offer.unreserved_resources());
                if !summary.has_any_offer() {
                    self.available_hosts.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!(host = %t.hostname, offer_id = %id, "removed expired offer");
            }
        }

        (expired.into_iter().map(|(id, _)| id).collect(), remaining)
    }

    /// Claim hosts matching the filter for a placement attempt. Matched
    /// hosts move READY → PLACING; their unreserved amount moves from the
    /// ready bucket to the placing bucket. Offers stay in their summaries
    /// until launch or return.
    pub fn claim_for_place(
        &self,
        filter: &HostFilter,
    ) -> PelotonResult<(HashMap<String, Vec<Offer>>, HashMap<HostFilterResult, u32>)> {
        let index = self.host_index.read();
        let mut matcher = Matcher::new(filter);

        for hostname in &filter.hint.hostnames {
            if let Some(summary) = index.get(hostname) {
                matcher.try_match(summary);
            }
        }
        for summary in index.values() {
            if matcher.has_enough_hosts() {
                break;
            }
            matcher.try_match(summary);
        }
        let (host_offers, result_counts) = matcher.into_results();

        let mut delta = Resources::ZERO;
        for offers in host_offers.values() {
            delta.add(&crate::offer::unreserved_sum(offers.iter()));
        }
        if !host_offers.is_empty() {
            self.move_ready_to_placing(&delta);
            tracing::debug!(
                hosts = host_offers.len(),
                %delta,
                ?result_counts,
                "claimed offers for placement"
            );
        }
        Ok((host_offers, result_counts))
    }

    /// Take a placed host's offers out of the pool for launch. The caller
    /// forwards them to the broker in an ACCEPT.
    pub fn claim_for_launch(
        &self,
        hostname: &str,
        use_reserved: bool,
    ) -> PelotonResult<HashMap<OfferID, Offer>> {
        let index = self.host_index.read();
        let summary = index
            .get(hostname)
            .ok_or_else(|| PelotonError::not_found(format!("host {hostname} not in pool")))?;

        let claimed = summary.claim_for_launch(use_reserved)?;

        let mut timed = self.timed_offers.lock();
        for id in claimed.keys() {
            if timed.remove(id).is_none() {
                tracing::warn!(offer_id = %id, host = hostname, "offer id not in timed index");
            }
        }
        drop(timed);

        let delta = crate::offer::unreserved_sum(claimed.values());
        if use_reserved {
            // Reserved-host offers were still accounted READY.
            self.debit_bucket(HostStatus::Ready, &delta);
        } else {
            self.debit_bucket(HostStatus::Placing, &delta);
        }
        if !claimed.is_empty() && !summary.has_any_offer() {
            self.available_hosts.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(claimed)
    }

    /// Return a placed host to READY without consuming its offers.
    pub fn return_unused_offers(&self, hostname: &str) -> PelotonResult<()> {
        let index = self.host_index.read();
        let Some(summary) = index.get(hostname) else {
            tracing::warn!(host = hostname, "offers returned but host not found, maybe pruned");
            return Ok(());
        };

        summary.cas_status(HostStatus::Placing, HostStatus::Ready)?;
        let delta = summary.unreserved_amount();
        self.move_placing_to_ready(&delta);
        tracing::debug!(host = hostname, %delta, "returned offers to ready");
        Ok(())
    }

    /// Force hosts stuck in PLACING past their hold back to READY.
    /// Returns the hostnames that were reset.
    pub fn reset_expired_host_summaries(&self, now: Instant) -> Vec<String> {
        let index = self.host_index.read();
        let mut reset = Vec::new();
        for (hostname, summary) in index.iter() {
            if let Some(delta) = summary.reset_expired_placing(now) {
                self.move_placing_to_ready(&delta);
                reset.push(hostname.clone());
                tracing::info!(host = %hostname, %delta, "reset expired placing host");
            }
        }
        reset
    }

    /// Release host reservations past their window. Returns released hosts.
    pub fn release_expired_reservations(&self, now: Instant) -> Vec<String> {
        let index = self.host_index.read();
        let mut released = Vec::new();
        for (hostname, summary) in index.iter() {
            if summary.release_expired_reservation(now) {
                released.push(hostname.clone());
                tracing::info!(host = %hostname, "released expired host reservation");
            }
        }
        released
    }

    /// Pin a specific READY host to the given tasks.
    pub fn reserve_host(
        &self,
        hostname: &str,
        task_ids: Vec<TaskID>,
        duration: Duration,
    ) -> PelotonResult<()> {
        let index = self.host_index.read();
        let summary = index
            .get(hostname)
            .ok_or_else(|| PelotonError::not_found(format!("host {hostname} not in pool")))?;
        summary.reserve(task_ids, duration)
    }

    /// Find a READY host satisfying `needed` and pin it. Returns the chosen
    /// hostname, or `ResourceExhausted` when no host qualifies.
    pub fn find_and_reserve_host(
        &self,
        task_ids: Vec<TaskID>,
        needed: &Resources,
        duration: Duration,
    ) -> PelotonResult<String> {
        let index = self.host_index.read();
        for (hostname, summary) in index.iter() {
            if summary.status() != HostStatus::Ready {
                continue;
            }
            if !summary.unreserved_amount().contains(needed) {
                continue;
            }
            summary.reserve(task_ids, duration)?;
            return Ok(hostname.clone());
        }
        Err(PelotonError::resource_exhausted(
            "no ready host satisfies the reservation",
        ))
    }

    /// Decline offers at the broker. On failure we log and count: the
    /// broker's own offer timeout will eventually invalidate them.
    pub async fn decline_offers(&self, offer_ids: Vec<OfferID>) -> PelotonResult<()> {
        if offer_ids.is_empty() {
            return Ok(());
        }
        let call = Call {
            framework_id: self.framework.framework_id(),
            kind: CallKind::Decline { offer_ids },
        };
        let stream_id = self.framework.stream_id();
        if let Err(err) = self.scheduler_client.call(&stream_id, call).await {
            tracing::warn!(%err, "failed to decline offers");
            self.metrics.decline_fail.fetch_add(1, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    /// Unreserve label-reserved offers that carry no persistent volume.
    pub async fn clean_reservation_resources(&self) {
        let unused: Vec<Offer> = {
            let index = self.host_index.read();
            index
                .values()
                .flat_map(|s| s.remove_unused_reserved_offers())
                .collect()
        };
        if unused.is_empty() {
            return;
        }
        {
            let mut timed = self.timed_offers.lock();
            for offer in &unused {
                timed.remove(&offer.id);
            }
        }
        for offer in unused {
            let call = Call {
                framework_id: self.framework.framework_id(),
                kind: CallKind::Accept {
                    offer_ids: vec![offer.id.clone()],
                    operations: vec![Operation::Unreserve],
                },
            };
            let stream_id = self.framework.stream_id();
            match self.scheduler_client.call(&stream_id, call).await {
                Ok(()) => {
                    self.metrics.unreserve.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(host = %offer.hostname, offer_id = %offer.id, "unreserved unused offer");
                }
                Err(err) => {
                    self.metrics.unreserve_fail.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(host = %offer.hostname, offer_id = %offer.id, %err, "failed to unreserve offer");
                }
            }
        }
    }

    /// Drop all cached state (leadership loss).
    pub fn clear(&self) {
        tracing::info!("clearing offer pool");
        let mut index = self.host_index.write();
        let mut timed = self.timed_offers.lock();
        index.clear();
        timed.clear();
        *self.ready_resources.lock() = Resources::ZERO;
        *self.placing_resources.lock() = Resources::ZERO;
        self.available_hosts.store(0, Ordering::SeqCst);
    }

    /// Sum of all hosts' unreserved amounts; the entitlement calculator
    /// adds current allocation to form the cluster capacity snapshot.
    pub fn total_unreserved(&self) -> Resources {
        let index = self.host_index.read();
        let mut total = Resources::ZERO;
        for summary in index.values() {
            total.add(&summary.unreserved_amount());
        }
        total
    }

    pub fn ready_resources(&self) -> Resources {
        *self.ready_resources.lock()
    }

    pub fn placing_resources(&self) -> Resources {
        *self.placing_resources.lock()
    }

    pub fn available_host_count(&self) -> u32 {
        self.available_hosts.load(Ordering::SeqCst)
    }

    pub fn host_status(&self, hostname: &str) -> Option<HostStatus> {
        self.host_index.read().get(hostname).map(|s| s.status())
    }

    pub fn timed_offer_count(&self) -> usize {
        self.timed_offers.lock().len()
    }

    fn credit_bucket(&self, status: HostStatus, delta: &Resources) {
        match status {
            HostStatus::Placing => self.placing_resources.lock().add(delta),
            // Reserved hosts keep their offers accounted in ready.
            HostStatus::Ready | HostStatus::Reserved => self.ready_resources.lock().add(delta),
        }
    }

    fn debit_bucket(&self, status: HostStatus, delta: &Resources) {
        match status {
            HostStatus::Placing => self.placing_resources.lock().subtract(delta),
            HostStatus::Ready | HostStatus::Reserved => {
                self.ready_resources.lock().subtract(delta)
            }
        }
    }

    fn move_ready_to_placing(&self, delta: &Resources) {
        self.ready_resources.lock().subtract(delta);
        self.placing_resources.lock().add(delta);
    }

    fn move_placing_to_ready(&self, delta: &Resources) {
        self.placing_resources.lock().subtract(delta);
        self.ready_resources.lock().add(delta);
    }
}
