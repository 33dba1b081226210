// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Placement engine: matches ready gangs to host offers.
//!
//! One engine loop runs per task type. Each iteration dequeues a batch of
//! ready gangs from the resource manager, acquires candidate hosts from
//! the host manager, pairs gangs with hosts atomically, reports the
//! placements back and releases whatever it did not use.

pub mod engine;
pub mod hosts;
