// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Job manager pieces owned by this core: the task launcher pump that
//! turns placements into broker launches, and the status-update forwarder
//! that feeds broker events back into the resource manager.

pub mod event;
pub mod launcher;
pub mod reconciler;
