// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Cached offer model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use peloton_common::id::{AgentID, OfferID};
use peloton_common::resources::Resources;

/// A resource reservation attached to an offer. Reserved offers without a
/// persistent volume are unreserved by the cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub label: String,
    pub volume_id: Option<String>,
}

/// A time-bounded resource grant on one host, as cached by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferID,
    pub hostname: String,
    pub agent_id: AgentID,
    pub resources: Resources,
    pub ports: Vec<u32>,
    pub attributes: HashMap<String, String>,
    pub reservation: Option<Reservation>,
}

impl Offer {
    /// An unreserved offer.
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, resources: Resources) -> Self {
        let hostname = hostname.into();
        Self {
            id: OfferID::new(id),
            hostname: hostname.clone(),
            agent_id: AgentID::new(format!("agent-{hostname}")),
            resources,
            ports: Vec::new(),
            attributes: HashMap::new(),
            reservation: None,
        }
    }

    pub fn with_ports(mut self, ports: Vec<u32>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_reservation(mut self, label: impl Into<String>, volume_id: Option<String>) -> Self {
        self.reservation = Some(Reservation {
            label: label.into(),
            volume_id,
        });
        self
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    /// The portion of this offer counted against the pool's ready/placing
    /// accounting. Reserved offers are tracked per label, not pooled.
    pub fn unreserved_resources(&self) -> Resources {
        if self.is_reserved() {
            Resources::ZERO
        } else {
            self.resources
        }
    }
}

/// Sum the unreserved portion of a batch of offers.
pub fn unreserved_sum<'a>(offers: impl IntoIterator<Item = &'a Offer>) -> Resources {
    let mut total = Resources::ZERO;
    for offer in offers {
        total.add(&offer.unreserved_resources());
    }
    total
}
