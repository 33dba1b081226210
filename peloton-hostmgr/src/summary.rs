// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Per-host summary: the aggregated view of all offers from one host, plus
//! the host state machine.
//!
//! Transitions:
//! - READY → PLACING when a placement claims the host (CAS under the
//!   summary lock; the summary records a placing expiration).
//! - PLACING → READY when unused offers are returned or the placing hold
//!   expires (crashed placement recovery).
//! - PLACING → READY (summary emptied) on claim-for-launch.
//! - READY → RESERVED when the host is pinned to task ids; back to READY
//!   when the reservation expires or the held tasks launch.
//!
//! Claimed offers stay in the summary until launch or return; only their
//! accounting bucket moves between the pool's ready and placing gauges.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use peloton_common::id::{OfferID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};

use crate::matcher::{HostFilter, HostFilterResult};
use crate::offer::Offer;

/// Host cache status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    /// Offers are available for claiming.
    Ready,
    /// Held by an in-flight placement attempt.
    Placing,
    /// Pinned to one or more task ids.
    Reserved,
}

/// An exclusive host reservation for a set of tasks.
#[derive(Debug, Clone)]
pub struct HostReservation {
    pub task_ids: Vec<TaskID>,
    pub expiration: Instant,
}

struct SummaryState {
    status: HostStatus,
    placing_expiration: Option<Instant>,
    reservation: Option<HostReservation>,
    offers: HashMap<OfferID, Offer>,
    attributes: HashMap<String, String>,
}

/// The aggregated view of one host. All mutation goes through the interior
/// lock; the pool only ever holds its map lock around summary lookups, never
/// across summary mutation.
pub struct HostSummary {
    hostname: String,
    placing_hold: Duration,
    state: Mutex<SummaryState>,
}

impl HostSummary {
    pub fn new(hostname: impl Into<String>, placing_hold: Duration) -> Self {
        Self {
            hostname: hostname.into(),
            placing_hold,
            state: Mutex::new(SummaryState {
                status: HostStatus::Ready,
                placing_expiration: None,
                reservation: None,
                offers: HashMap::new(),
                attributes: HashMap::new(),
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn status(&self) -> HostStatus {
        self.state.lock().status
    }

    pub fn has_any_offer(&self) -> bool {
        !self.state.lock().offers.is_empty()
    }

    pub fn offer_count(&self) -> usize {
        self.state.lock().offers.len()
    }

    /// Sum of the unreserved offers currently cached for this host.
    pub fn unreserved_amount(&self) -> Resources {
        let state = self.state.lock();
        crate::offer::unreserved_sum(state.offers.values())
    }

    pub fn attributes(&self) -> HashMap<String, String> {
        self.state.lock().attributes.clone()
    }

    pub fn has_gpu_offers(&self) -> bool {
        let state = self.state.lock();
        state.offers.values().any(|o| o.resources.has_gpu())
    }

    pub fn reservation(&self) -> Option<HostReservation> {
        self.state.lock().reservation.clone()
    }

    /// Add an offer. Returns the host status at the time so the pool can
    /// credit the right accounting bucket.
    pub fn add_offer(&self, offer: Offer) -> HostStatus {
        let mut state = self.state.lock();
        for (key, value) in &offer.attributes {
            state.attributes.insert(key.clone(), value.clone());
        }
        state.offers.insert(offer.id.clone(), offer);
        state.status
    }

    /// Remove one offer (rescind or expiry). Returns the status at removal
    /// time and the offer, if it was present.
    pub fn remove_offer(&self, offer_id: &OfferID) -> (HostStatus, Option<Offer>) {
        let mut state = self.state.lock();
        let removed = state.offers.remove(offer_id);
        (state.status, removed)
    }

    /// Atomic status swap. Entering PLACING arms the placing expiration;
    /// leaving it clears it.
    pub fn cas_status(&self, old: HostStatus, new: HostStatus) -> PelotonResult<()> {
        let mut state = self.state.lock();
        if state.status != old {
            return Err(PelotonError::failed_precondition(format!(
                "host {} is {:?}, expected {:?}",
                self.hostname, state.status, old
            )));
        }
        state.status = new;
        state.placing_expiration = match new {
            HostStatus::Placing => Some(Instant::now() + self.placing_hold),
            _ => None,
        };
        Ok(())
    }

    /// Evaluate the filter against this host and, on a match, atomically
    /// move READY → PLACING and hand back the unreserved offers. The whole
    /// check-and-claim runs under one lock so no two placements can claim
    /// the same host.
    pub fn try_claim_for_place(&self, filter: &HostFilter) -> Result<Vec<Offer>, HostFilterResult> {
        let mut state = self.state.lock();

        if state.offers.is_empty() {
            return Err(HostFilterResult::NoOffer);
        }
        if state.status != HostStatus::Ready {
            return Err(HostFilterResult::MismatchStatus);
        }

        let minimum = &filter.resource_constraint.minimum;
        let available = crate::offer::unreserved_sum(state.offers.values());
        let host_has_gpu = state.offers.values().any(|o| o.resources.has_gpu());
        if minimum.has_gpu() && !host_has_gpu {
            return Err(HostFilterResult::MismatchGpu);
        }
        if !available.contains(minimum) {
            return Err(HostFilterResult::InsufficientResources);
        }
        let num_ports: usize = state
            .offers
            .values()
            .filter(|o| !o.is_reserved())
            .map(|o| o.ports.len())
            .sum();
        if (num_ports as u32) < filter.resource_constraint.num_ports {
            return Err(HostFilterResult::InsufficientResources);
        }
        if let Some(constraint) = &filter.scheduling_constraint {
            if !constraint.evaluate(&state.attributes) {
                return Err(HostFilterResult::MismatchConstraints);
            }
        }

        state.status = HostStatus::Placing;
        state.placing_expiration = Some(Instant::now() + self.placing_hold);

        let claimed: Vec<Offer> = state
            .offers
            .values()
            .filter(|o| !o.is_reserved())
            .cloned()
            .collect();
        Ok(claimed)
    }

    /// Take the host's offers out for launch.
    ///
    /// `use_reserved = false` requires PLACING: the unreserved offers leave
    /// the summary and the host returns to READY. `use_reserved = true`
    /// requires RESERVED (an exclusive host reservation): all offers leave,
    /// the reservation is dropped and the host returns to READY.
    pub fn claim_for_launch(
        &self,
        use_reserved: bool,
    ) -> PelotonResult<HashMap<OfferID, Offer>> {
        let mut state = self.state.lock();
        if use_reserved {
            if state.status != HostStatus::Reserved {
                return Err(PelotonError::failed_precondition(format!(
                    "host {} is {:?}, cannot claim reserved offers",
                    self.hostname, state.status
                )));
            }
            let claimed = std::mem::take(&mut state.offers);
            state.reservation = None;
            state.status = HostStatus::Ready;
            return Ok(claimed);
        }

        if state.status != HostStatus::Placing {
            return Err(PelotonError::failed_precondition(format!(
                "host {} is {:?}, expected Placing for launch",
                self.hostname, state.status
            )));
        }
        let unreserved_ids: Vec<OfferID> = state
            .offers
            .values()
            .filter(|o| !o.is_reserved())
            .map(|o| o.id.clone())
            .collect();
        let mut claimed = HashMap::with_capacity(unreserved_ids.len());
        for id in unreserved_ids {
            if let Some(offer) = state.offers.remove(&id) {
                claimed.insert(id, offer);
            }
        }
        state.status = HostStatus::Ready;
        state.placing_expiration = None;
        Ok(claimed)
    }

    /// Recovery for crashed placements: if the placing hold has expired,
    /// force the host back to READY. Returns the unreserved amount to move
    /// from the placing bucket back to ready.
    pub fn reset_expired_placing(&self, now: Instant) -> Option<Resources> {
        let mut state = self.state.lock();
        if state.status != HostStatus::Placing {
            return None;
        }
        match state.placing_expiration {
            Some(expiration) if now > expiration => {
                state.status = HostStatus::Ready;
                state.placing_expiration = None;
                Some(crate::offer::unreserved_sum(state.offers.values()))
            }
            _ => None,
        }
    }

    /// Pin this host to a set of tasks for a bounded window.
    pub fn reserve(&self, task_ids: Vec<TaskID>, duration: Duration) -> PelotonResult<()> {
        let mut state = self.state.lock();
        if state.status != HostStatus::Ready {
            return Err(PelotonError::failed_precondition(format!(
                "host {} is {:?}, cannot reserve",
                self.hostname, state.status
            )));
        }
        state.status = HostStatus::Reserved;
        state.reservation = Some(HostReservation {
            task_ids,
            expiration: Instant::now() + duration,
        });
        Ok(())
    }

    /// Drop an expired host reservation. Returns true when released.
    pub fn release_expired_reservation(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.status != HostStatus::Reserved {
            return false;
        }
        let expired = state
            .reservation
            .as_ref()
            .is_some_and(|r| now > r.expiration);
        if expired {
            state.reservation = None;
            state.status = HostStatus::Ready;
        }
        expired
    }

    /// Drain label-reserved offers that have no persistent volume, so the
    /// pool can unreserve them at the broker.
    pub fn remove_unused_reserved_offers(&self) -> Vec<Offer> {
        let mut state = self.state.lock();
        let unused_ids: Vec<OfferID> = state
            .offers
            .values()
            .filter(|o| {
                o.reservation
                    .as_ref()
                    .is_some_and(|r| r.volume_id.is_none())
            })
            .map(|o| o.id.clone())
            .collect();
        unused_ids
            .into_iter()
            .filter_map(|id| state.offers.remove(&id))
            .collect()
    }
}
