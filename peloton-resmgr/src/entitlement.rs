// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Entitlement calculation.
//!
//! Runs periodically in two passes over the tree. Bottom-up: leaf demand is
//! the sum of pending-queue resources, internal demand the sum of children.
//! Top-down, per resource kind independently:
//!
//! 1. Floor: every child gets `min(reservation, demand + allocation)`.
//! 2. Share: the parent's remainder is split among siblings proportional to
//!    their configured share, capped by `min(limit, demand + allocation)`.
//! 3. Slack: leftovers keep flowing to siblings with residual headroom,
//!    proportional to share, until a fixed point or the residual is below
//!    epsilon.
//!
//! Reservation is honored whenever demand exists, spare capacity flows to
//! the neediest subtrees under fair shares, and `limit` is a hard cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::id::ResPoolID;
use peloton_common::resources::{FixedPoint, ResourceKind, Resources};

use crate::restree::Tree;

/// Residual below which the slack loop stops (one fixed-point unit).
const EPSILON: f64 = 1e-4;
/// Slack redistribution rounds before declaring a fixed point.
const MAX_SLACK_ROUNDS: usize = 8;

/// Source of the cluster capacity snapshot (sum of unreserved amounts
/// cached by the host manager).
pub trait ClusterCapacityProvider: Send + Sync {
    fn capacity(&self) -> Resources;
}

impl<F> ClusterCapacityProvider for F
where
    F: Fn() -> Resources + Send + Sync,
{
    fn capacity(&self) -> Resources {
        self()
    }
}

pub struct EntitlementCalculator;

impl EntitlementCalculator {
    /// Recompute demand and entitlement for every pool. `available` is the
    /// free capacity snapshot; in-use capacity is added back from the
    /// tree's allocations so entitlement covers running work.
    pub fn calculate(tree: &Tree, available: Resources) {
        let root = tree.root_id().clone();
        let mut pools = tree.pools_write();

        // Post-order walk for the bottom-up passes.
        let order = post_order(&pools_children(&pools), &root);

        // Leaf demand from pending queues, aggregated up.
        let mut demand: HashMap<ResPoolID, Resources> = HashMap::new();
        let mut wants: HashMap<ResPoolID, Resources> = HashMap::new();
        for id in &order {
            let Some(pool) = pools.get_mut(id) else { continue };
            if pool.is_leaf() {
                let d = pool.calculate_demand();
                let mut w = d;
                w.add(&pool.allocation);
                demand.insert(id.clone(), d);
                wants.insert(id.clone(), w);
            } else {
                let mut d = Resources::ZERO;
                let mut w = Resources::ZERO;
                for child in pool.children.clone() {
                    if let Some(cd) = demand.get(&child) {
                        d.add(cd);
                    }
                    if let Some(cw) = wants.get(&child) {
                        w.add(cw);
                    }
                }
                pool.demand = d;
                demand.insert(id.clone(), d);
                wants.insert(id.clone(), w);
            }
        }

        // Root entitlement is the whole cluster: free plus in use.
        let mut root_entitlement = available;
        let in_use = pools
            .values()
            .filter(|p| p.is_leaf())
            .fold(Resources::ZERO, |mut acc, p| {
                acc.add(&p.allocation);
                acc
            });
        root_entitlement.add(&in_use);
        if let Some(root_pool) = pools.get_mut(&root) {
            root_pool.entitlement = root_entitlement;
        }

        // Top-down distribution, breadth-first.
        let mut queue = std::collections::VecDeque::from([root]);
        while let Some(parent_id) = queue.pop_front() {
            let (parent_entitlement, children) = match pools.get(&parent_id) {
                Some(p) => (p.entitlement, p.children.clone()),
                None => continue,
            };
            if children.is_empty() {
                continue;
            }

            for kind in ResourceKind::ALL {
                let targets = distribute_kind(&pools, &wants, &children, kind, parent_entitlement.get(kind).to_f64());
                for (child_id, value) in children.iter().zip(targets) {
                    if let Some(child) = pools.get_mut(child_id) {
                        child.entitlement.set(kind, FixedPoint::from_f64(value));
                    }
                }
            }
            for child in children {
                queue.push_back(child);
            }
        }
    }
}

/// Distribute one resource kind of a parent's entitlement to its children.
/// Returns the per-child entitlement in `children` order.
fn distribute_kind(
    pools: &HashMap<ResPoolID, crate::respool::ResPool>,
    wants: &HashMap<ResPoolID, Resources>,
    children: &[ResPoolID],
    kind: ResourceKind,
    parent_amount: f64,
) -> Vec<f64> {
    let n = children.len();
    let mut reservation = vec![0.0; n];
    let mut limit = vec![0.0; n];
    let mut share = vec![0.0; n];
    let mut want = vec![0.0; n];
    for (i, id) in children.iter().enumerate() {
        if let Some(pool) = pools.get(id) {
            reservation[i] = pool.reservation.get(kind).to_f64();
            limit[i] = pool.limit.get(kind).to_f64();
            share[i] = pool.share.get(kind).to_f64();
        }
        want[i] = wants.get(id).map_or(0.0, |w| w.get(kind).to_f64());
    }

    // Floor phase.
    let mut targets: Vec<f64> = (0..n).map(|i| reservation[i].min(want[i])).collect();
    let floor_sum: f64 = targets.iter().sum();
    let mut remaining = parent_amount - floor_sum;
    if remaining < 0.0 {
        // Capacity below the demanded reservations: scale floors down.
        if floor_sum > 0.0 {
            let scale = parent_amount / floor_sum;
            for t in &mut targets {
                *t *= scale;
            }
        }
        remaining = 0.0;
    }

    let cap: Vec<f64> = (0..n)
        .map(|i| targets[i].max(limit[i].min(want[i])))
        .collect();

    // Share phase plus slack redistribution to a fixed point.
    for _ in 0..MAX_SLACK_ROUNDS {
        if remaining <= EPSILON {
            break;
        }
        let eligible: Vec<usize> = (0..n)
            .filter(|&i| share[i] > 0.0 && targets[i] + EPSILON < cap[i])
            .collect();
        if eligible.is_empty() {
            break;
        }
        let total_share: f64 = eligible.iter().map(|&i| share[i]).sum();
        let pool_at_round_start = remaining;
        for &i in &eligible {
            let offered = pool_at_round_start * share[i] / total_share;
            let taken = offered.min(cap[i] - targets[i]);
            targets[i] += taken;
            remaining -= taken;
        }
    }

    targets
}

fn pools_children(
    pools: &HashMap<ResPoolID, crate::respool::ResPool>,
) -> HashMap<ResPoolID, Vec<ResPoolID>> {
    pools
        .iter()
        .map(|(id, pool)| (id.clone(), pool.children.clone()))
        .collect()
}

fn post_order(children: &HashMap<ResPoolID, Vec<ResPoolID>>, root: &ResPoolID) -> Vec<ResPoolID> {
    let mut out = Vec::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        stack.push((id.clone(), true));
        if let Some(kids) = children.get(&id) {
            for child in kids {
                stack.push((child.clone(), false));
            }
        }
    }
    out
}

/// Periodic entitlement loop. Failures to snapshot capacity are logged and
/// retried next cycle; the loop itself never gives up.
pub fn start_entitlement_loop(
    tree: Arc<Tree>,
    provider: Arc<dyn ClusterCapacityProvider>,
    period: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    let capacity = provider.capacity();
                    EntitlementCalculator::calculate(&tree, capacity);
                    tracing::debug!(%capacity, "recomputed entitlements");
                }
            }
        }
    })
}
