// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Bookkeeping for acquired hosts during one placement round.

use std::collections::HashMap;

use peloton_common::resources::Resources;
use peloton_common::task::Gang;
use peloton_hostmgr::service::HostOffer;

/// One acquired host with what is left of it as gangs get assigned.
pub struct CandidateHost {
    pub offer: HostOffer,
    remaining: Resources,
    free_ports: Vec<u32>,
    pub assigned: bool,
}

impl CandidateHost {
    pub fn new(offer: HostOffer) -> Self {
        let remaining = offer.unreserved_amount();
        let free_ports = offer.available_ports();
        Self {
            offer,
            remaining,
            free_ports,
            assigned: false,
        }
    }

    fn attributes(&self) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        for offer in &self.offer.offers {
            for (key, value) in &offer.attributes {
                attributes.insert(key.clone(), value.clone());
            }
        }
        attributes
    }

    /// Whether the whole gang fits on what is left of this host.
    pub fn fits(&self, gang: &Gang) -> bool {
        if !self.remaining.contains(&gang.resource()) {
            return false;
        }
        if (self.free_ports.len() as u32) < gang.num_ports() {
            return false;
        }
        let attributes = self.attributes();
        gang.tasks.iter().all(|task| {
            task.constraint
                .as_ref()
                .is_none_or(|c| c.evaluate(&attributes))
        })
    }

    /// Consume resources and ports for the gang. Caller checks `fits`.
    pub fn assign(&mut self, gang: &Gang) -> Vec<u32> {
        self.remaining.subtract(&gang.resource());
        let take = gang.num_ports() as usize;
        let ports: Vec<u32> = self.free_ports.drain(..take).collect();
        self.assigned = true;
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peloton_common::constraints::{Constraint, LabelPredicate};
    use peloton_common::task::Task;
    use peloton_hostmgr::offer::Offer;

    fn host(cpu: f64, ports: Vec<u32>) -> CandidateHost {
        CandidateHost::new(HostOffer {
            hostname: "h1".to_string(),
            offers: vec![Offer::new("o1", "h1", Resources::new(cpu, 1000.0, 0.0, 0.0))
                .with_ports(ports)
                .with_attribute("zone", "us-east-1")],
        })
    }

    fn gang(cpu: f64, num_ports: u32) -> Gang {
        let mut task = Task::new("job1-0", "job1", Resources::new(cpu, 10.0, 0.0, 0.0));
        task.num_ports = num_ports;
        Gang::of(task)
    }

    #[test]
    fn test_fits_and_assign_consume_capacity() {
        let mut host = host(4.0, vec![31000, 31001]);
        let g = gang(3.0, 1);
        assert!(host.fits(&g));

        let ports = host.assign(&g);
        assert_eq!(ports, vec![31000]);
        assert!(host.assigned);

        // Not enough cpu left for a second copy.
        assert!(!host.fits(&g));
    }

    #[test]
    fn test_fits_checks_ports() {
        let host = host(8.0, vec![31000]);
        assert!(!host.fits(&gang(1.0, 2)));
    }

    #[test]
    fn test_fits_checks_constraints() {
        let host = host(8.0, vec![]);
        let mut task = Task::new("job1-0", "job1", Resources::new(1.0, 0.0, 0.0, 0.0));
        task.constraint = Some(Constraint::Label(LabelPredicate::equal("zone", "eu-west-1")));
        assert!(!host.fits(&Gang::of(task.clone())));

        task.constraint = Some(Constraint::Label(LabelPredicate::equal("zone", "us-east-1")));
        assert!(host.fits(&Gang::of(task)));
    }
}
