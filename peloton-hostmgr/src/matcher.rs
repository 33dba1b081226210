// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Host filter evaluation.
//!
//! The matcher walks host summaries, claims matching READY hosts and
//! classifies every considered host by its reject reason. Hinted hostnames
//! are tried first; GPU hosts are kept as a last resort for non-GPU work.

use std::collections::HashMap;
use std::sync::Arc;

use peloton_common::constraints::Constraint;
use peloton_common::resources::Resources;

use crate::offer::Offer;
use crate::summary::HostSummary;

/// Resource requirement a matched host must satisfy from unreserved offers.
#[derive(Debug, Clone, Default)]
pub struct ResourceConstraint {
    pub minimum: Resources,
    pub num_ports: u32,
}

/// Bounds on how many hosts one acquire call may claim.
#[derive(Debug, Clone)]
pub struct QuantityControl {
    pub max_hosts: u32,
}

impl Default for QuantityControl {
    fn default() -> Self {
        Self { max_hosts: 10 }
    }
}

/// Preferred hosts, honored first in the given order.
#[derive(Debug, Clone, Default)]
pub struct FilterHint {
    pub hostnames: Vec<String>,
}

/// The filter a placement attempt hands to the offer pool.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub resource_constraint: ResourceConstraint,
    pub scheduling_constraint: Option<Constraint>,
    pub quantity: QuantityControl,
    pub hint: FilterHint,
}

impl HostFilter {
    pub fn with_minimum(minimum: Resources, max_hosts: u32) -> Self {
        Self {
            resource_constraint: ResourceConstraint {
                minimum,
                num_ports: 0,
            },
            scheduling_constraint: None,
            quantity: QuantityControl { max_hosts },
            hint: FilterHint::default(),
        }
    }
}

/// Why a considered host did or did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFilterResult {
    Matched,
    NoOffer,
    MismatchStatus,
    InsufficientResources,
    MismatchConstraints,
    MismatchGpu,
    MismatchMaxHosts,
}

/// One matching pass over the host index.
pub struct Matcher<'a> {
    filter: &'a HostFilter,
    host_offers: HashMap<String, Vec<Offer>>,
    result_counts: HashMap<HostFilterResult, u32>,
    /// GPU hosts deferred while the filter itself needs no GPU; tried only
    /// when the non-GPU hosts could not fill the quota.
    deferred_gpu_hosts: Vec<Arc<HostSummary>>,
}

impl<'a> Matcher<'a> {
    pub fn new(filter: &'a HostFilter) -> Self {
        Self {
            filter,
            host_offers: HashMap::new(),
            result_counts: HashMap::new(),
            deferred_gpu_hosts: Vec::new(),
        }
    }

    pub fn has_enough_hosts(&self) -> bool {
        self.host_offers.len() as u32 >= self.filter.quantity.max_hosts
    }

    /// Consider one host. Claims it (READY → PLACING) on a match.
    pub fn try_match(&mut self, summary: &Arc<HostSummary>) {
        if self.host_offers.contains_key(summary.hostname()) {
            return;
        }
        if self.has_enough_hosts() {
            self.count(HostFilterResult::MismatchMaxHosts);
            return;
        }
        if !self.filter.resource_constraint.minimum.has_gpu() && summary.has_gpu_offers() {
            self.deferred_gpu_hosts.push(Arc::clone(summary));
            return;
        }
        self.claim(summary);
    }

    /// Flush deferred GPU hosts. Called once iteration over the index is
    /// done; hosts still unneeded are classified as GPU mismatches.
    pub fn finish(&mut self) {
        let deferred = std::mem::take(&mut self.deferred_gpu_hosts);
        for summary in deferred {
            if self.has_enough_hosts() {
                self.count(HostFilterResult::MismatchGpu);
            } else {
                self.claim(&summary);
            }
        }
    }

    /// The matched offers grouped by hostname, plus per-reason counts for
    /// every considered host.
    pub fn into_results(
        mut self,
    ) -> (HashMap<String, Vec<Offer>>, HashMap<HostFilterResult, u32>) {
        self.finish();
        (self.host_offers, self.result_counts)
    }

    fn claim(&mut self, summary: &Arc<HostSummary>) {
        match summary.try_claim_for_place(self.filter) {
            Ok(offers) => {
                self.count(HostFilterResult::Matched);
                self.host_offers
                    .insert(summary.hostname().to_string(), offers);
            }
            Err(reason) => self.count(reason),
        }
    }

    fn count(&mut self, result: HostFilterResult) {
        *self.result_counts.entry(result).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use peloton_common::constraints::LabelPredicate;

    fn host(name: &str, cpu: f64, gpu: f64) -> Arc<HostSummary> {
        let s = Arc::new(HostSummary::new(name, Duration::from_secs(300)));
        s.add_offer(Offer::new(
            format!("{name}-o1"),
            name,
            Resources::new(cpu, 1024.0, 0.0, gpu),
        ));
        s
    }

    #[test]
    fn test_matches_up_to_max_hosts() {
        let filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 2);
        let hosts = [host("h1", 4.0, 0.0), host("h2", 4.0, 0.0), host("h3", 4.0, 0.0)];

        let mut matcher = Matcher::new(&filter);
        for h in &hosts {
            matcher.try_match(h);
        }
        let (offers, counts) = matcher.into_results();

        assert_eq!(offers.len(), 2);
        assert_eq!(counts[&HostFilterResult::Matched], 2);
        assert_eq!(counts[&HostFilterResult::MismatchMaxHosts], 1);
    }

    #[test]
    fn test_classifies_rejects() {
        let filter = HostFilter::with_minimum(Resources::new(3.0, 0.0, 0.0, 0.0), 10);
        let small = host("small", 1.0, 0.0);
        let empty = Arc::new(HostSummary::new("empty", Duration::from_secs(300)));
        let good = host("good", 4.0, 0.0);

        let mut matcher = Matcher::new(&filter);
        matcher.try_match(&small);
        matcher.try_match(&empty);
        matcher.try_match(&good);
        let (offers, counts) = matcher.into_results();

        assert_eq!(offers.len(), 1);
        assert!(offers.contains_key("good"));
        assert_eq!(counts[&HostFilterResult::InsufficientResources], 1);
        assert_eq!(counts[&HostFilterResult::NoOffer], 1);
    }

    #[test]
    fn test_non_gpu_work_avoids_gpu_hosts_when_possible() {
        let filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 1);
        let gpu_host = host("gpu1", 4.0, 2.0);
        let cpu_host = host("cpu1", 4.0, 0.0);

        // GPU host is considered first but deferred; the CPU host fills
        // the quota, so the GPU host ends up a mismatch.
        let mut matcher = Matcher::new(&filter);
        matcher.try_match(&gpu_host);
        matcher.try_match(&cpu_host);
        let (offers, counts) = matcher.into_results();

        assert_eq!(offers.len(), 1);
        assert!(offers.contains_key("cpu1"));
        assert_eq!(counts[&HostFilterResult::MismatchGpu], 1);
    }

    #[test]
    fn test_non_gpu_work_falls_back_to_gpu_hosts() {
        let filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 1);
        let gpu_host = host("gpu1", 4.0, 2.0);

        let mut matcher = Matcher::new(&filter);
        matcher.try_match(&gpu_host);
        let (offers, _) = matcher.into_results();

        assert_eq!(offers.len(), 1);
        assert!(offers.contains_key("gpu1"));
    }

    #[test]
    fn test_scheduling_constraint() {
        let mut filter = HostFilter::with_minimum(Resources::new(1.0, 0.0, 0.0, 0.0), 10);
        filter.scheduling_constraint = Some(Constraint::Label(LabelPredicate::equal(
            "zone", "us-east-1",
        )));

        let matching = Arc::new(HostSummary::new("east", Duration::from_secs(300)));
        matching.add_offer(
            Offer::new("east-o1", "east", Resources::new(4.0, 0.0, 0.0, 0.0))
                .with_attribute("zone", "us-east-1"),
        );
        let other = Arc::new(HostSummary::new("west", Duration::from_secs(300)));
        other.add_offer(
            Offer::new("west-o1", "west", Resources::new(4.0, 0.0, 0.0, 0.0))
                .with_attribute("zone", "us-west-2"),
        );

        let mut matcher = Matcher::new(&filter);
        matcher.try_match(&matching);
        matcher.try_match(&other);
        let (offers, counts) = matcher.into_results();

        assert_eq!(offers.len(), 1);
        assert!(offers.contains_key("east"));
        assert_eq!(counts[&HostFilterResult::MismatchConstraints], 1);
    }
}
