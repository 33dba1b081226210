// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end tests across all four services: offers in, task running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peloton_common::id::{ResPoolID, TaskID};
use peloton_common::resources::Resources;
use peloton_common::task::{BrokerTaskState, Gang, Task, TaskStatusEvent};

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

use peloton_jobmgr::event::StatusUpdateForwarder;
use peloton_jobmgr::launcher::{LauncherConfig, TaskLauncher};

struct Cluster {
    broker: Arc<RecordingSchedulerClient>,
    pool: Arc<OfferPool>,
    tree: Arc<Tree>,
    tracker: Arc<Tracker>,
    resmgr: Arc<ResourceManagerService>,
    engine: PlacementEngine,
    launcher: TaskLauncher,
    forwarder: StatusUpdateForwarder,
}

fn cluster() -> Cluster {
    let broker = Arc::new(RecordingSchedulerClient::new());
    let framework = Arc::new(StaticFrameworkInfo::new("peloton-fw"));
    let pool = Arc::new(OfferPool::new(
        Duration::from_secs(300),
        Duration::from_secs(300),
        Arc::clone(&broker) as Arc<dyn SchedulerClient>,
        Arc::clone(&framework) as Arc<dyn FrameworkInfoProvider>,
    ));
    let hostmgr = Arc::new(HostService::new(
        Arc::clone(&pool),
        Arc::clone(&broker) as Arc<dyn SchedulerClient>,
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
            placing_timeout: Duration::from_secs(600),
            launching_timeout: Duration::from_secs(1200),
            reserving_timeout: Duration::from_secs(1800),
            placement_retry_backoff: Duration::from_secs(300),
            placement_retry_cycle: 3,
            placement_attempts_percycle: 3,
            enable_placement_backoff: true,
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
    let launcher = TaskLauncher::new(
        Arc::clone(&resmgr) as Arc<dyn ResourceManager>,
        Arc::clone(&hostmgr) as Arc<dyn HostManager>,
        LauncherConfig::default(),
    );
    let forwarder = StatusUpdateForwarder::new(
        Arc::clone(&resmgr) as Arc<dyn ResourceManager>,
        Duration::from_millis(10),
    );

    Cluster {
        broker,
        pool,
        tree,
        tracker,
        resmgr,
        engine,
        launcher,
        forwarder,
    }
}

#[tokio::test]
async fn happy_path_offer_to_running() {
    let c = cluster();

    // One host worth of offers arrives from the broker.
    c.pool
        .add_offers(vec![Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 100.0, 0.0))]);

    // A one-cpu task enters the resource manager.
    let failed = c
        .resmgr
        .enqueue_gangs(
            &ResPoolID::from("L"),
            vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 1.0, 0.0)))],
        )
        .await;
    assert!(failed.is_empty());

    // Entitlement tick: the leaf is entitled to at least the task.
    EntitlementCalculator::calculate(&c.tree, c.pool.total_unreserved());
    let entitlement = c.tree.entitlement(&ResPoolID::from("L")).unwrap();
    assert!(entitlement.cpu.to_f64() >= 1.0);

    // Scheduling tick: the gang is admitted and placed.
    TaskScheduler::new(Arc::clone(&c.tree), Arc::clone(&c.tracker)).schedule_once();
    assert_eq!(c.engine.place_once().await.unwrap(), 1);

    let id = TaskID::from("job1-0");
    assert_eq!(c.tracker.task_state(&id), Some(TaskState::Placed));

    // The launcher consumes the placement; the broker receives an ACCEPT
    // with a LAUNCH for the host's offer.
    assert_eq!(c.launcher.launch_once().await.unwrap(), 1);
    let launched = c.broker.launched_tasks();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].mesos_task_id, "job1-0-1");
    assert_eq!(c.tracker.task_state(&id), Some(TaskState::Launching));
    assert_eq!(c.pool.host_status("h1"), Some(HostStatus::Ready));

    // The status stream reports RUNNING.
    c.forwarder
        .forward(vec![TaskStatusEvent {
            offset: 0,
            task_id: id.clone(),
            state: BrokerTaskState::Running,
            reason: None,
            message: None,
        }])
        .await
        .unwrap();
    assert_eq!(c.tracker.task_state(&id), Some(TaskState::Running));

    // Completion releases the pool allocation.
    c.forwarder
        .forward(vec![TaskStatusEvent {
            offset: 1,
            task_id: id.clone(),
            state: BrokerTaskState::Finished,
            reason: None,
            message: None,
        }])
        .await
        .unwrap();
    assert!(c.tree.allocation(&ResPoolID::from("L")).unwrap().is_zero());
    assert!(c.tracker.get_task(&id).is_none());
}

#[tokio::test]
async fn failed_launch_kills_and_recycles() {
    let c = cluster();
    c.pool
        .add_offers(vec![Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 0.0, 0.0))]);

    c.resmgr
        .enqueue_gangs(
            &ResPoolID::from("L"),
            vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 0.0, 0.0)))],
        )
        .await;
    EntitlementCalculator::calculate(&c.tree, c.pool.total_unreserved());
    TaskScheduler::new(Arc::clone(&c.tree), Arc::clone(&c.tracker)).schedule_once();
    c.engine.place_once().await.unwrap();

    // The broker stream drops before the launch goes out.
    c.broker.set_failing(true);
    assert_eq!(c.launcher.launch_once().await.unwrap(), 0);

    let id = TaskID::from("job1-0");
    assert_eq!(c.tracker.task_state(&id), Some(TaskState::Launching));

    // The launching timeout recycles the task back through ready.
    c.tracker
        .process_due(std::time::Instant::now() + Duration::from_secs(2000));
    assert_eq!(c.tracker.task_state(&id), Some(TaskState::Ready));
}

#[tokio::test]
async fn preempted_task_reenters_pipeline() {
    let c = cluster();
    c.pool
        .add_offers(vec![Offer::new("o1", "h1", Resources::new(10.0, 1000.0, 100.0, 0.0))]);

    c.resmgr
        .enqueue_gangs(
            &ResPoolID::from("L"),
            vec![Gang::of(Task::new("job1-0", "job1", Resources::new(1.0, 10.0, 1.0, 0.0)))],
        )
        .await;
    EntitlementCalculator::calculate(&c.tree, c.pool.total_unreserved());
    TaskScheduler::new(Arc::clone(&c.tree), Arc::clone(&c.tracker)).schedule_once();
    c.engine.place_once().await.unwrap();
    c.launcher.launch_once().await.unwrap();
    c.forwarder
        .forward(vec![TaskStatusEvent {
            offset: 0,
            task_id: TaskID::from("job1-0"),
            state: BrokerTaskState::Running,
            reason: None,
            message: None,
        }])
        .await
        .unwrap();

    // Preemption marks the task and the broker later confirms the kill.
    let id = TaskID::from("job1-0");
    c.tracker.transit(&id, TaskState::Preempting).unwrap();
    c.forwarder
        .forward(vec![TaskStatusEvent {
            offset: 1,
            task_id: id.clone(),
            state: BrokerTaskState::Killed,
            reason: Some("preempted".into()),
            message: None,
        }])
        .await
        .unwrap();

    // The task re-entered the pending pipeline with a fresh broker id
    // and its allocation was returned until re-admission.
    let rm_task = c.tracker.get_task(&id).unwrap();
    assert_eq!(rm_task.state, TaskState::Pending);
    assert_eq!(rm_task.mesos_task_id.attempt, 2);
    assert!(c.tree.allocation(&ResPoolID::from("L")).unwrap().is_zero());
    assert_eq!(c.tree.pending_len(&ResPoolID::from("L")), 1);
}
