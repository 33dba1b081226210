// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Integration tests wiring the placement engine against a real offer
//! pool and resource manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peloton_common::id::{OfferID, ResPoolID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::task::{Gang, Task, TaskType};

use peloton_hostmgr::broker::{
    FrameworkInfoProvider, RecordingSchedulerClient, SchedulerClient, StaticFrameworkInfo,
};
use peloton_hostmgr::offer::Offer;
use peloton_hostmgr::pool::OfferPool;
use peloton_hostmgr::service::{HostManager, HostService};
use peloton_hostmgr::summary::HostStatus;

use peloton_resmgr::entitlement::EntitlementCalculator;
use peloton_resmgr::respool::ResPoolConfig;
use peloton_resmgr::restree::{standard_resources, Tree};
use peloton_resmgr::scheduler::TaskScheduler;
use peloton_resmgr::service::{ResourceManager, ResourceManagerService};
use peloton_resmgr::task::TaskState;
use peloton_resmgr::tracker::{TaskConfig, Tracker};

use peloton_placement::engine::{PlacementConfig, PlacementEngine};

struct World {
    pool: Arc<OfferPool>,
    hostmgr: Arc<HostService>,
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    resmgr: Arc<ResourceManagerService>,
    engine: PlacementEngine,
}

fn world() -> World {
    let client = Arc::new(RecordingSchedulerClient::new());
    let framework = Arc::new(StaticFrameworkInfo::new("peloton-fw"));
    let pool = Arc::new(OfferPool::new(
        Duration::from_secs(300),
        Duration::from_secs(300),
        Arc::clone(&client) as Arc<dyn SchedulerClient>,
        Arc::clone(&framework) as Arc<dyn FrameworkInfoProvider>,
    ));
    let hostmgr = Arc::new(HostService::new(
        Arc::clone(&pool),
        client,
        framework,
    ));

    let mut configs = HashMap::new();
    let mut root = ResPoolConfig::new("root", None);
    root.resources = standard_resources(100.0, 10000.0, 1.0).resources;
    configs.insert("root".to_string(), root);
    let mut leaf = ResPoolConfig::new("L", Some(ResPoolID::from("root")));
    leaf.resources = standard_resources(100.0, 1000.0, 1.0).resources;
    configs.insert("L".to_string(), leaf);
    let tree = Arc::new(Tree::create(configs).unwrap());

    let tracker = Arc::new(Tracker::new(
        Arc::clone(&tree),
        TaskConfig {
            placing_timeout: Duration::from_millis(50),
            launching_timeout: Duration::from_millis(50),
            reserving_timeout: Duration::from_secs(30),
            placement_retry_backoff: Duration::from_millis(10),
            placement_retry_cycle: 3,
            placement_attempts_percycle: 3,
            enable_placement_backoff: false,
            enable_host_reservation: false,
        },
    ));
    let resmgr = Arc::new(ResourceManagerService::new(
        Arc::clone(&tree),
        Arc::clone(&tracker),
    ));

    let engine = PlacementEngine::new(
        Arc::clone(&resmgr) as Arc<dyn ResourceManager>,
        Arc::clone(&hostmgr) as Arc<dyn HostManager>,
        PlacementConfig::default(),
    );

    World {
        pool,
        hostmgr,
        tree,
        tracker,
        resmgr,
        engine,
    }
}

impl World {
    async fn enqueue_and_admit(&self, gangs: Vec<Gang>, capacity_cpu: f64) {
        let failed = self.resmgr.enqueue_gangs(&ResPoolID::from("L"), gangs).await;
        assert!(failed.is_empty());
        EntitlementCalculator::calculate(
            &self.tree,
            Resources::new(capacity_cpu, 10000.0, 0.0, 0.0),
        );
        TaskScheduler::new(Arc::clone(&self.tree), Arc::clone(&self.tracker)).schedule_once();
    }
}

#[tokio::test]
async fn single_task_is_placed_on_matching_host() {
    let w = world();
    w.pool
        .add_offers(vec![Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 0.0, 0.0))]);

    w.enqueue_and_admit(
        vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)))],
        10.0,
    )
    .await;

    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 1);

    let id = TaskID::from("job1-0");
    assert_eq!(w.tracker.task_state(&id), Some(TaskState::Placed));
    assert_eq!(w.tracker.get_task(&id).unwrap().host.as_deref(), Some("h1"));
    assert_eq!(w.resmgr.queued_placements(), 1);
    // The host stays claimed for the launcher.
    assert_eq!(w.pool.host_status("h1"), Some(HostStatus::Placing));
}

#[tokio::test]
async fn no_offers_leaves_tasks_placing_for_recycle() {
    let w = world();

    w.enqueue_and_admit(
        vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)))],
        10.0,
    )
    .await;

    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 0);

    let id = TaskID::from("job1-0");
    assert_eq!(w.tracker.task_state(&id), Some(TaskState::Placing));

    // The placing timeout brings the gang back to ready for another try.
    w.tracker
        .process_due(std::time::Instant::now() + Duration::from_secs(1));
    assert_eq!(w.tracker.task_state(&id), Some(TaskState::Ready));
    assert_eq!(w.tree.ready_len(&ResPoolID::from("L")), 1);
}

#[tokio::test]
async fn rescind_during_placement_recycles_task() {
    let w = world();
    w.pool
        .add_offers(vec![Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 0.0, 0.0))]);

    w.enqueue_and_admit(
        vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)))],
        10.0,
    )
    .await;

    // The broker rescinds between dequeue and acquire: the engine sees
    // no offers, the task recycles, accounting stays consistent.
    assert!(w.pool.rescind_offer(&OfferID::from("o1")));
    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 0);

    assert_eq!(w.pool.ready_resources(), Resources::ZERO);
    assert_eq!(w.pool.placing_resources(), Resources::ZERO);
    w.tracker
        .process_due(std::time::Instant::now() + Duration::from_secs(1));
    assert_eq!(
        w.tracker.task_state(&TaskID::from("job1-0")),
        Some(TaskState::Ready)
    );
}

#[tokio::test]
async fn gang_never_places_partially() {
    // A gang of three 4-cpu tasks with only 6-cpu hosts available: the
    // gang must not land anywhere.
    let w = world();
    w.pool.add_offers(vec![
        Offer::new("o1", "h1", Resources::new(6.0, 1000.0, 0.0, 0.0)),
        Offer::new("o2", "h2", Resources::new(6.0, 1000.0, 0.0, 0.0)),
    ]);

    let gang = Gang::new(
        (0..3)
            .map(|i| Task::new(format!("job1-{i}"), "job1", Resources::new(4.0, 0.0, 0.0, 0.0)))
            .collect(),
    );
    w.enqueue_and_admit(vec![gang], 100.0).await;

    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 0);

    for i in 0..3 {
        let state = w
            .tracker
            .task_state(&TaskID::from(format!("job1-{i}").as_str()))
            .unwrap();
        assert_ne!(state, TaskState::Placed);
    }
    // Both hosts were released back to READY.
    assert_eq!(w.pool.host_status("h1"), Some(HostStatus::Ready));
    assert_eq!(w.pool.host_status("h2"), Some(HostStatus::Ready));
    assert_eq!(w.resmgr.queued_placements(), 0);
}

#[tokio::test]
async fn unused_hosts_are_released() {
    let w = world();
    w.pool.add_offers(vec![
        Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 0.0, 0.0)),
        Offer::new("o2", "h2", Resources::new(10.0, 1000.0, 0.0, 0.0)),
    ]);

    w.enqueue_and_admit(
        vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)))],
        10.0,
    )
    .await;

    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 1);

    // Exactly one host is held; the other went back to READY.
    let statuses = [
        w.pool.host_status("h1").unwrap(),
        w.pool.host_status("h2").unwrap(),
    ];
    assert_eq!(
        statuses.iter().filter(|s| **s == HostStatus::Placing).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == HostStatus::Ready).count(),
        1
    );
}

#[tokio::test]
async fn placement_respects_ports() {
    let w = world();
    w.pool.add_offers(vec![
        Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 0.0, 0.0)),
        Offer::new("o2", "h2", Resources::new(10.0, 1000.0, 0.0, 0.0))
            .with_ports(vec![31000, 31001]),
    ]);

    let mut task = Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0));
    task.num_ports = 2;
    w.enqueue_and_admit(vec![Gang::of(task)], 10.0).await;

    let placed = w.engine.place_once().await.unwrap();
    assert_eq!(placed, 1);

    let placements = w.resmgr.get_placements(10, TaskType::Batch).await.unwrap();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].hostname, "h2");
    assert_eq!(placements[0].ports, vec![31000, 31001]);
}

#[tokio::test]
async fn hostmgr_capacity_feeds_entitlement() {
    let w = world();
    w.pool.add_offers(vec![
        Offer::new("o1", "h1", Resources::new(8.0, 800.0, 0.0, 0.0)),
        Offer::new("o2", "h2", Resources::new(8.0, 800.0, 0.0, 0.0)),
    ]);

    let failed = w
        .resmgr
        .enqueue_gangs(
            &ResPoolID::from("L"),
            vec![Gang::of(Task::new("job1-0", "job1", Resources::new(4.0, 10.0, 0.0, 0.0)))],
        )
        .await;
    assert!(failed.is_empty());

    // Entitlement computed from the live capacity snapshot.
    EntitlementCalculator::calculate(&w.tree, w.hostmgr.cluster_capacity());
    assert!(
        w.tree
            .entitlement(&ResPoolID::from("L"))
            .unwrap()
            .cpu
            .to_f64()
            >= 4.0
    );
    TaskScheduler::new(Arc::clone(&w.tree), Arc::clone(&w.tracker)).schedule_once();
    assert_eq!(w.engine.place_once().await.unwrap(), 1);
}
