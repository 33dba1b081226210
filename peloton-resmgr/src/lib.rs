// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource manager: arbitrates scheduling across a hierarchical
//! resource-pool tree.
//!
//! Tasks enter through `EnqueueGangs` and land in their pool's pending
//! queue. The entitlement calculator periodically recomputes each pool's
//! share of the cluster; the admission scheduler moves gangs whose pool has
//! headroom into the ready queue; the preemption engine reclaims from pools
//! that stay over their entitlement.

pub mod config;
pub mod entitlement;
pub mod preemption;
pub mod queue;
pub mod respool;
pub mod restree;
pub mod scheduler;
pub mod service;
pub mod task;
pub mod tracker;
