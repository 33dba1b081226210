// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Call envelope and client trait for the external resource-offer broker.
//!
//! The broker itself is out of scope; this module pins down the wire shape
//! of outbound calls and the seam tests fake.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use peloton_common::id::OfferID;
use peloton_common::resources::Resources;
use peloton_common::status::{PelotonError, PelotonResult};

/// A task in a form the broker can launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchableTask {
    pub mesos_task_id: String,
    pub name: String,
    pub resources: Resources,
    pub ports: Vec<u32>,
}

/// An operation inside an ACCEPT call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Launch { tasks: Vec<LaunchableTask> },
    Reserve { resources: Resources, label: String },
    Unreserve,
    Create { volume_id: String },
    Destroy { volume_id: String },
}

/// The call payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallKind {
    Accept {
        offer_ids: Vec<OfferID>,
        operations: Vec<Operation>,
    },
    Decline {
        offer_ids: Vec<OfferID>,
    },
    Kill {
        task_id: String,
    },
    Acknowledge {
        task_id: String,
        offset: u64,
    },
    Reconcile,
}

/// One message on the broker's persistent scheduler stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub framework_id: String,
    pub kind: CallKind,
}

/// Identity of this framework's registration with the broker.
pub trait FrameworkInfoProvider: Send + Sync {
    fn framework_id(&self) -> String;
    fn stream_id(&self) -> String;
}

/// A static framework identity, enough for a non-failing-over deployment.
pub struct StaticFrameworkInfo {
    pub framework_id: String,
    pub stream_id: String,
}

impl StaticFrameworkInfo {
    pub fn new(framework_id: impl Into<String>) -> Self {
        let framework_id = framework_id.into();
        Self {
            stream_id: format!("{framework_id}-stream"),
            framework_id,
        }
    }
}

impl FrameworkInfoProvider for StaticFrameworkInfo {
    fn framework_id(&self) -> String {
        self.framework_id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }
}

/// Outbound scheduler call channel. Any call may fail transiently with
/// `Unavailable`; callers decide whether to retry or rely on broker-side
/// timeouts.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn call(&self, stream_id: &str, call: Call) -> PelotonResult<()>;
}

/// Test double: records every call and can be flipped into a failing mode.
#[derive(Default)]
pub struct RecordingSchedulerClient {
    calls: Mutex<Vec<Call>>,
    fail: AtomicBool,
}

impl RecordingSchedulerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Offer ids declined across all recorded DECLINE calls.
    pub fn declined_offer_ids(&self) -> Vec<OfferID> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.kind {
                CallKind::Decline { offer_ids } => Some(offer_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The LAUNCH operations seen across all recorded ACCEPT calls.
    pub fn launched_tasks(&self) -> Vec<LaunchableTask> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match &c.kind {
                CallKind::Accept { operations, .. } => Some(operations.clone()),
                _ => None,
            })
            .flatten()
            .filter_map(|op| match op {
                Operation::Launch { tasks } => Some(tasks),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[async_trait]
impl SchedulerClient for RecordingSchedulerClient {
    async fn call(&self, _stream_id: &str, call: Call) -> PelotonResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PelotonError::unavailable("broker stream disconnected"));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}
