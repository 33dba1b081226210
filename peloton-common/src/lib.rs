// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for Peloton: resources, IDs, Status/Error, constraints,
//! and the task/gang model shared by the host, resource, placement and job
//! managers.

pub mod constraints;
pub mod id;
pub mod resources;
pub mod status;
pub mod task;
