// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource manager binary entry point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;

use peloton_common::resources::Resources;
use peloton_common::status::PelotonResult;
use peloton_resmgr::config::ResmgrConfig;
use peloton_resmgr::entitlement::start_entitlement_loop;
use peloton_resmgr::preemption::{
    start_preemption_loop, Preemptor, PreemptorConfig, TaskKiller,
};
use peloton_resmgr::respool::ResPoolConfig;
use peloton_resmgr::restree::{standard_resources, Tree};
use peloton_resmgr::scheduler::{start_scheduler_loop, TaskScheduler};
use peloton_resmgr::service::ResourceManagerService;
use peloton_resmgr::tracker::{start_timeout_loop, TaskConfig, Tracker};

#[derive(Parser, Debug)]
#[command(name = "peloton-resmgr", about = "Peloton Resource Manager")]
struct Args {
    /// JSON overrides for the resource manager config
    #[arg(long)]
    config_json: Option<String>,

    /// Path to a JSON map of resource pool configs (id -> config)
    #[arg(long)]
    respool_config: Option<String>,

    /// Log directory
    #[arg(long)]
    log_dir: Option<String>,

    /// Standalone cluster capacity snapshot: cpus
    #[arg(long, default_value_t = 0.0)]
    capacity_cpus: f64,

    /// Standalone cluster capacity snapshot: memory MB
    #[arg(long, default_value_t = 0.0)]
    capacity_mem_mb: f64,

    /// Standalone cluster capacity snapshot: disk MB
    #[arg(long, default_value_t = 0.0)]
    capacity_disk_mb: f64,

    /// Standalone cluster capacity snapshot: gpus
    #[arg(long, default_value_t = 0.0)]
    capacity_gpus: f64,
}

/// Kill sink for standalone operation: requests are logged only, real
/// deployments wire the host manager here.
struct LoggingTaskKiller;

#[async_trait]
impl TaskKiller for LoggingTaskKiller {
    async fn kill(&self, mesos_task_ids: Vec<String>) -> PelotonResult<()> {
        tracing::warn!(tasks = ?mesos_task_ids, "kill requested but no host manager wired");
        Ok(())
    }
}

fn default_pools() -> HashMap<String, ResPoolConfig> {
    let mut configs = HashMap::new();
    // An effectively unbounded limit for the out-of-the-box tree.
    const OPEN_LIMIT: f64 = 1e9;
    let mut root = ResPoolConfig::new("root", None);
    root.resources = standard_resources(0.0, OPEN_LIMIT, 1.0).resources;
    configs.insert("root".to_string(), root);
    let mut default = ResPoolConfig::new(
        "default",
        Some(peloton_common::id::ResPoolID::from("root")),
    );
    default.resources = standard_resources(0.0, OPEN_LIMIT, 1.0).resources;
    configs.insert("default".to_string(), default);
    configs
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    peloton_util::logging::init_logging(
        "resmgr",
        args.log_dir.as_ref().map(std::path::Path::new),
        0,
    );

    let config = match &args.config_json {
        Some(json) => ResmgrConfig::from_json(json)?,
        None => ResmgrConfig::default(),
    };
    config.validate()?;

    let pool_configs = match &args.respool_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        }
        None => default_pools(),
    };
    let tree = Arc::new(Tree::create(pool_configs)?);
    if !config.recover_from_active_jobs {
        tracing::info!("recovery from active jobs disabled");
    }

    let tracker = Arc::new(Tracker::new(Arc::clone(&tree), TaskConfig::from(&config)));
    let _service = Arc::new(ResourceManagerService::new(
        Arc::clone(&tree),
        Arc::clone(&tracker),
    ));

    let capacity = Resources::new(
        args.capacity_cpus,
        args.capacity_mem_mb,
        args.capacity_disk_mb,
        args.capacity_gpus,
    );
    tracing::info!(%capacity, "starting resource manager loops");

    let (entitlement_tx, entitlement_rx) = tokio::sync::mpsc::channel(1);
    let entitlement_handle = start_entitlement_loop(
        Arc::clone(&tree),
        Arc::new(move || capacity),
        config.entitlement_calculation_period(),
        entitlement_rx,
    );

    let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&tree), Arc::clone(&tracker)));
    let (scheduler_tx, scheduler_rx) = tokio::sync::mpsc::channel(1);
    let scheduler_handle =
        start_scheduler_loop(scheduler, config.task_scheduling_period(), scheduler_rx);

    let (timeout_tx, timeout_rx) = tokio::sync::mpsc::channel(1);
    let timeout_handle = start_timeout_loop(
        Arc::clone(&tracker),
        None,
        Duration::from_millis(100),
        timeout_rx,
    );

    let preemptor = Arc::new(Preemptor::new(
        Arc::clone(&tree),
        Arc::clone(&tracker),
        Arc::new(LoggingTaskKiller),
        PreemptorConfig::from(&config),
    ));
    let (preemption_tx, preemption_rx) = tokio::sync::mpsc::channel(1);
    let preemption_handle = start_preemption_loop(preemptor, preemption_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("resource manager shutting down");

    for tx in [entitlement_tx, scheduler_tx, timeout_tx, preemption_tx] {
        let _ = tx.send(()).await;
    }
    for handle in [
        entitlement_handle,
        scheduler_handle,
        timeout_handle,
        preemption_handle,
    ] {
        let _ = handle.await;
    }
    Ok(())
}
