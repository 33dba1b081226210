// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The resource-pool tree.
//!
//! Pools are stored arena-style in one map keyed by id; parent/child edges
//! are ids resolved through the map. One RwLock guards the whole tree:
//! mutations are rare and take WRITE, traversals take READ. No I/O happens
//! under the lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use peloton_common::id::ResPoolID;
use peloton_common::resources::{ResourceKind, Resources};
use peloton_common::status::{PelotonError, PelotonResult};
use peloton_common::task::{Gang, TaskType};

use crate::respool::{QueueClass, ResPool, ResPoolConfig, ROOT_RESPOOL_ID};

pub struct Tree {
    pools: RwLock<HashMap<ResPoolID, ResPool>>,
    root: ResPoolID,
}

impl Tree {
    /// Build a tree from a config map. The map must contain the root pool
    /// under id "root".
    pub fn create(configs: HashMap<String, ResPoolConfig>) -> PelotonResult<Self> {
        if !configs.contains_key(ROOT_RESPOOL_ID) {
            return Err(PelotonError::invalid_argument("missing root pool config"));
        }
        let tree = Self {
            pools: RwLock::new(HashMap::new()),
            root: ResPoolID::from(ROOT_RESPOOL_ID),
        };
        // Insert parents before children so upsert validation sees them.
        let mut remaining: Vec<(String, ResPoolConfig)> = configs.into_iter().collect();
        remaining.sort_by(|a, b| a.0.cmp(&b.0));
        let mut made_progress = true;
        while !remaining.is_empty() && made_progress {
            made_progress = false;
            let mut deferred = Vec::new();
            for (id, config) in remaining {
                let parent_ready = match &config.parent {
                    None => true,
                    Some(parent) => tree.pools.read().contains_key(parent),
                };
                if parent_ready {
                    tree.upsert(&ResPoolID::new(id), config)?;
                    made_progress = true;
                } else {
                    deferred.push((id, config));
                }
            }
            remaining = deferred;
        }
        if !remaining.is_empty() {
            let orphans: Vec<String> = remaining.into_iter().map(|(id, _)| id).collect();
            return Err(PelotonError::invalid_argument(format!(
                "pools with unknown parents: {orphans:?}"
            )));
        }
        Ok(tree)
    }

    /// Insert or update one pool.
    pub fn upsert(&self, id: &ResPoolID, config: ResPoolConfig) -> PelotonResult<()> {
        config.validate()?;

        let mut pools = self.pools.write();

        let is_root = id.value() == ROOT_RESPOOL_ID;
        if is_root != config.parent.is_none() {
            return Err(PelotonError::invalid_argument(format!(
                "pool {id}: only the root pool has no parent"
            )));
        }

        if let Some(existing) = pools.get(id) {
            if existing.parent != config.parent {
                return Err(PelotonError::invalid_argument(format!(
                    "pool {id}: re-parenting is not supported"
                )));
            }
        }

        if let Some(parent_id) = &config.parent {
            let parent = pools.get(parent_id).ok_or_else(|| {
                PelotonError::not_found(format!("parent pool {parent_id} not found"))
            })?;

            // Jobs only queue at leaves: a pool that holds work cannot
            // grow children.
            if !pools.contains_key(id) && parent.has_queued_work() {
                return Err(PelotonError::invalid_argument(format!(
                    "pool {parent_id} holds jobs and cannot take child pools"
                )));
            }

            for sibling_id in &parent.children {
                if sibling_id == id {
                    continue;
                }
                if let Some(sibling) = pools.get(sibling_id) {
                    if sibling.name == config.name {
                        return Err(PelotonError::already_exists(format!(
                            "pool name {} already exists under {parent_id}",
                            config.name
                        )));
                    }
                }
            }

            // Children's reservations must fit inside the parent's.
            let new_pool_reservation =
                ResPool::from_config(id.clone(), &config).reservation;
            let mut sibling_sum = new_pool_reservation;
            for sibling_id in &parent.children {
                if sibling_id == id {
                    continue;
                }
                if let Some(sibling) = pools.get(sibling_id) {
                    sibling_sum.add(&sibling.reservation);
                }
            }
            let parent_reservation = pools.get(parent_id).map(|p| p.reservation);
            if let Some(parent_reservation) = parent_reservation {
                if !parent_reservation.contains(&sibling_sum) {
                    return Err(PelotonError::invalid_argument(format!(
                        "children reservations exceed parent {parent_id} reservation"
                    )));
                }
            }
        }

        match pools.get_mut(id) {
            Some(pool) => {
                pool.apply_config(&config);
            }
            None => {
                let parent = config.parent.clone();
                pools.insert(id.clone(), ResPool::from_config(id.clone(), &config));
                if let Some(parent_id) = parent {
                    if let Some(parent) = pools.get_mut(&parent_id) {
                        parent.children.push(id.clone());
                    }
                }
            }
        }
        tracing::info!(pool = %id, "upserted resource pool");
        Ok(())
    }

    /// Delete a pool: only leaves without queued or allocated work.
    pub fn delete(&self, id: &ResPoolID) -> PelotonResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get(id)
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))?;

        if id == &self.root {
            return Err(PelotonError::invalid_argument("cannot delete the root pool"));
        }
        if !pool.is_leaf() {
            return Err(PelotonError::failed_precondition(format!(
                "pool {id} has children"
            )));
        }
        if pool.has_queued_work() {
            return Err(PelotonError::failed_precondition(format!(
                "pool {id} still holds work"
            )));
        }
        let parent = pool.parent.clone();
        pools.remove(id);
        if let Some(parent_id) = parent {
            if let Some(parent) = pools.get_mut(&parent_id) {
                parent.children.retain(|c| c != id);
            }
        }
        tracing::info!(pool = %id, "deleted resource pool");
        Ok(())
    }

    pub fn exists(&self, id: &ResPoolID) -> bool {
        self.pools.read().contains_key(id)
    }

    /// Resolve a slash path ("/respool1/respool11") to a pool id.
    pub fn lookup_path(&self, path: &str) -> PelotonResult<ResPoolID> {
        let pools = self.pools.read();
        let mut current = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let pool = pools
                .get(&current)
                .ok_or_else(|| PelotonError::not_found(format!("pool {current} not found")))?;
            let next = pool.children.iter().find(|child_id| {
                pools
                    .get(child_id)
                    .is_some_and(|child| child.name == segment)
            });
            match next {
                Some(child_id) => current = child_id.clone(),
                None => {
                    return Err(PelotonError::not_found(format!(
                        "no pool named {segment} under {current}"
                    )))
                }
            }
        }
        Ok(current)
    }

    pub fn children(&self, id: &ResPoolID) -> PelotonResult<Vec<ResPoolID>> {
        let pools = self.pools.read();
        pools
            .get(id)
            .map(|p| p.children.clone())
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))
    }

    pub fn all_pool_ids(&self) -> Vec<ResPoolID> {
        let mut ids: Vec<ResPoolID> = self.pools.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn leaf_pool_ids(&self) -> Vec<ResPoolID> {
        let pools = self.pools.read();
        let mut ids: Vec<ResPoolID> = pools
            .iter()
            .filter(|(_, p)| p.is_leaf())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Queue a gang at a leaf pool.
    pub fn enqueue_gang(&self, id: &ResPoolID, gang: Gang) -> PelotonResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))?;
        if !pool.is_leaf() {
            return Err(PelotonError::invalid_argument(format!(
                "pool {id} is not a leaf, jobs queue at leaves only"
            )));
        }
        pool.enqueue_gang(gang);
        Ok(())
    }

    /// Admit the head gang of one class at a pool, if entitlement allows.
    pub fn try_admit(&self, id: &ResPoolID, class: QueueClass) -> Option<Gang> {
        self.pools.write().get_mut(id)?.try_admit_one(class)
    }

    /// Pop up to `limit` ready gangs of the given task type across leaves.
    pub fn dequeue_ready_by_type(&self, task_type: TaskType, limit: usize) -> Vec<Gang> {
        let mut out = Vec::new();
        let leaf_ids = self.leaf_pool_ids();
        let mut pools = self.pools.write();
        for id in leaf_ids {
            if out.len() >= limit {
                break;
            }
            let Some(pool) = pools.get_mut(&id) else {
                continue;
            };
            while out.len() < limit {
                match pool.dequeue_ready_match(|g| g.task_type() == task_type) {
                    Some(gang) => out.push(gang),
                    None => break,
                }
            }
        }
        out
    }

    /// Return an admitted gang to its pool's ready queue.
    pub fn requeue_ready_gang(&self, id: &ResPoolID, gang: Gang) -> PelotonResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))?;
        pool.requeue_ready(gang);
        Ok(())
    }

    pub fn add_to_allocation(&self, id: &ResPoolID, delta: &Resources) -> PelotonResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))?;
        pool.add_to_allocation(delta);
        Ok(())
    }

    pub fn subtract_from_allocation(&self, id: &ResPoolID, delta: &Resources) -> PelotonResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(id)
            .ok_or_else(|| PelotonError::not_found(format!("pool {id} not found")))?;
        pool.subtract_from_allocation(delta);
        Ok(())
    }

    pub fn allocation(&self, id: &ResPoolID) -> Option<Resources> {
        self.pools.read().get(id).map(|p| p.allocation)
    }

    pub fn entitlement(&self, id: &ResPoolID) -> Option<Resources> {
        self.pools.read().get(id).map(|p| p.entitlement)
    }

    pub fn demand(&self, id: &ResPoolID) -> Option<Resources> {
        self.pools.read().get(id).map(|p| p.demand)
    }

    pub fn reservation(&self, id: &ResPoolID) -> Option<Resources> {
        self.pools.read().get(id).map(|p| p.reservation)
    }

    pub fn pending_len(&self, id: &ResPoolID) -> usize {
        self.pools.read().get(id).map_or(0, |p| p.pending_len())
    }

    pub fn ready_len(&self, id: &ResPoolID) -> usize {
        self.pools.read().get(id).map_or(0, |p| p.ready_len())
    }

    /// Sum of leaf allocations: the in-use part of cluster capacity.
    pub fn total_allocation(&self) -> Resources {
        let pools = self.pools.read();
        let mut total = Resources::ZERO;
        for pool in pools.values().filter(|p| p.is_leaf()) {
            total.add(&pool.allocation);
        }
        total
    }

    pub fn root_id(&self) -> &ResPoolID {
        &self.root
    }

    pub(crate) fn pools_write(&self) -> parking_lot::RwLockWriteGuard<'_, HashMap<ResPoolID, ResPool>> {
        self.pools.write()
    }
}

/// The standard pool resource block used by config files and tests: equal
/// reservation/limit/share across cpu, mem and disk. Pools serving GPU work
/// add a gpu entry explicitly; an absent kind means zero entitlement for it.
pub fn standard_resources(reservation: f64, limit: f64, share: f64) -> ResPoolConfig {
    ResPoolConfig::new("", None)
        .with_resource(ResourceKind::Cpu, reservation, limit, share)
        .with_resource(ResourceKind::Mem, reservation, limit, share)
        .with_resource(ResourceKind::Disk, reservation, limit, share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peloton_common::task::Task;

    fn config(
        name: &str,
        parent: Option<&str>,
        reservation: f64,
        limit: f64,
    ) -> ResPoolConfig {
        let mut c = ResPoolConfig::new(name, parent.map(ResPoolID::from));
        c.resources = standard_resources(reservation, limit, 1.0).resources;
        c
    }

    /// The reference tree: root with three children, nested pools below.
    fn build_tree() -> Tree {
        let mut configs = HashMap::new();
        configs.insert("root".to_string(), config("root", None, 1000.0, 10000.0));
        configs.insert("respool1".to_string(), config("respool1", Some("root"), 100.0, 1000.0));
        configs.insert("respool2".to_string(), config("respool2", Some("root"), 100.0, 1000.0));
        configs.insert("respool3".to_string(), config("respool3", Some("root"), 100.0, 1000.0));
        configs.insert(
            "respool11".to_string(),
            config("respool11", Some("respool1"), 50.0, 1000.0),
        );
        configs.insert(
            "respool12".to_string(),
            config("respool12", Some("respool1"), 50.0, 1000.0),
        );
        configs.insert(
            "respool21".to_string(),
            config("respool21", Some("respool2"), 50.0, 1000.0),
        );
        configs.insert(
            "respool22".to_string(),
            config("respool22", Some("respool2"), 50.0, 1000.0),
        );
        Tree::create(configs).unwrap()
    }

    #[test]
    fn test_get_children() {
        let tree = build_tree();
        assert_eq!(tree.children(&ResPoolID::from("root")).unwrap().len(), 3);
        assert_eq!(tree.children(&ResPoolID::from("respool1")).unwrap().len(), 2);
        assert_eq!(tree.children(&ResPoolID::from("respool2")).unwrap().len(), 2);
    }

    #[test]
    fn test_lookup_path() {
        let tree = build_tree();
        assert_eq!(
            tree.lookup_path("/respool1/respool11").unwrap(),
            ResPoolID::from("respool11")
        );
        assert_eq!(tree.lookup_path("/").unwrap(), ResPoolID::from("root"));
        assert!(tree.lookup_path("/respool1/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_upsert_existing_and_new() {
        let tree = build_tree();
        // Update in place.
        tree.upsert(
            &ResPoolID::from("respool22"),
            config("respool22", Some("respool2"), 10.0, 50.0),
        )
        .unwrap();
        // Brand new child.
        tree.upsert(
            &ResPoolID::from("respool23"),
            config("respool23", Some("respool2"), 10.0, 50.0),
        )
        .unwrap();
        assert_eq!(tree.children(&ResPoolID::from("respool2")).unwrap().len(), 3);
    }

    #[test]
    fn test_upsert_validations() {
        let tree = build_tree();

        // Reservation above limit.
        let err = tree
            .upsert(
                &ResPoolID::from("bad"),
                config("bad", Some("root"), 100.0, 10.0),
            )
            .unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::InvalidArgument);

        // Unknown parent.
        let err = tree
            .upsert(
                &ResPoolID::from("orphan"),
                config("orphan", Some("missing"), 1.0, 10.0),
            )
            .unwrap_err();
        assert!(err.is_not_found());

        // Duplicate name under the same parent.
        let err = tree
            .upsert(
                &ResPoolID::from("respool1-copy"),
                config("respool1", Some("root"), 1.0, 10.0),
            )
            .unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::AlreadyExists);

        // Children reservation sum above the parent's.
        let err = tree
            .upsert(
                &ResPoolID::from("respool13"),
                config("respool13", Some("respool1"), 60.0, 100.0),
            )
            .unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_jobs_queue_at_leaves_only() {
        let tree = build_tree();
        let gang = Gang::of(Task::new("job1-1", "job1", Resources::new(1.0, 0.0, 0.0, 0.0)));

        let err = tree
            .enqueue_gang(&ResPoolID::from("respool1"), gang.clone())
            .unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::InvalidArgument);

        tree.enqueue_gang(&ResPoolID::from("respool11"), gang).unwrap();
        assert_eq!(tree.pending_len(&ResPoolID::from("respool11")), 1);

        // A pool holding jobs cannot take children.
        let err = tree
            .upsert(
                &ResPoolID::from("respool111"),
                config("respool111", Some("respool11"), 1.0, 10.0),
            )
            .unwrap_err();
        assert_eq!(err.kind, peloton_common::status::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_delete() {
        let tree = build_tree();

        // Non-leaf cannot go.
        assert!(tree
            .delete(&ResPoolID::from("respool1"))
            .unwrap_err()
            .is_failed_precondition());

        tree.delete(&ResPoolID::from("respool3")).unwrap();
        assert!(!tree.exists(&ResPoolID::from("respool3")));
        assert_eq!(tree.children(&ResPoolID::from("root")).unwrap().len(), 2);

        // A pool with queued work cannot go.
        let gang = Gang::of(Task::new("job1-1", "job1", Resources::new(1.0, 0.0, 0.0, 0.0)));
        tree.enqueue_gang(&ResPoolID::from("respool11"), gang).unwrap();
        assert!(tree
            .delete(&ResPoolID::from("respool11"))
            .unwrap_err()
            .is_failed_precondition());
    }

    #[test]
    fn test_dequeue_ready_by_type() {
        let tree = build_tree();
        let pool_id = ResPoolID::from("respool11");
        {
            let mut pools = tree.pools_write();
            let pool = pools.get_mut(&pool_id).unwrap();
            pool.entitlement = Resources::new(100.0, 100.0, 100.0, 100.0);
        }

        let mut stateless = Task::new("job2-0", "job2", Resources::new(1.0, 0.0, 0.0, 0.0));
        stateless.task_type = TaskType::Stateless;
        tree.enqueue_gang(&pool_id, Gang::of(stateless)).unwrap();
        tree.enqueue_gang(
            &pool_id,
            Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 0.0, 0.0, 0.0))),
        )
        .unwrap();

        tree.try_admit(&pool_id, QueueClass::Default);
        tree.try_admit(&pool_id, QueueClass::Default);
        assert_eq!(tree.ready_len(&pool_id), 2);

        let batch = tree.dequeue_ready_by_type(TaskType::Batch, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id().value(), "job1-0");
        let stateless = tree.dequeue_ready_by_type(TaskType::Stateless, 10);
        assert_eq!(stateless.len(), 1);
        assert_eq!(tree.ready_len(&pool_id), 0);
    }
}
