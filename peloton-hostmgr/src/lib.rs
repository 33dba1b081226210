// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Host manager: caches resource offers from the external broker and
//! executes placements against them.
//!
//! The offer pool indexes offers by host; each host carries a small state
//! machine (READY / PLACING / RESERVED) guaranteeing at most one concurrent
//! placement per host and a two-phase claim (place, then launch).

pub mod broker;
pub mod matcher;
pub mod offer;
pub mod pool;
pub mod pruner;
pub mod service;
pub mod summary;
