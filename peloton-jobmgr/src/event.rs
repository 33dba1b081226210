// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Status-update forwarding.
//!
//! Broker task status events arrive on a stream with monotonic offsets.
//! The forwarder delivers them to the resource manager at-least-once and
//! in order, tracking a progress offset so redelivered events are skipped
//! and transient `Unavailable` failures only delay the stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_common::status::PelotonResult;
use peloton_common::task::TaskStatusEvent;
use peloton_resmgr::service::ResourceManager;

pub struct StatusUpdateForwarder {
    resmgr: Arc<dyn ResourceManager>,
    /// Offset one past the last event known forwarded.
    progress: AtomicU64,
    /// Wait before retrying after a delivery failure.
    error_wait: Duration,
}

impl StatusUpdateForwarder {
    pub fn new(resmgr: Arc<dyn ResourceManager>, error_wait: Duration) -> Self {
        Self {
            resmgr,
            progress: AtomicU64::new(0),
            error_wait,
        }
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Forward a batch, skipping events already behind the progress
    /// offset. Returns the purge offset acknowledged by the resource
    /// manager.
    pub async fn forward(&self, events: Vec<TaskStatusEvent>) -> PelotonResult<u64> {
        let progress = self.progress.load(Ordering::SeqCst);
        let fresh: Vec<TaskStatusEvent> = events
            .into_iter()
            .filter(|e| e.offset >= progress)
            .collect();
        if fresh.is_empty() {
            return Ok(progress.saturating_sub(1));
        }
        let purge = self.resmgr.notify_task_updates(fresh).await?;
        self.progress.store(purge + 1, Ordering::SeqCst);
        Ok(purge)
    }
}

/// Pump events from the broker stream into the resource manager. Failed
/// batches are retried after `error_wait` without losing events.
pub fn start_forwarder_loop(
    forwarder: Arc<StatusUpdateForwarder>,
    mut events_rx: mpsc::Receiver<TaskStatusEvent>,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: VecDeque<TaskStatusEvent> = VecDeque::new();
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                event = events_rx.recv() => {
                    match event {
                        Some(event) => pending.push_back(event),
                        None => break,
                    }
                    // Drain whatever else is already buffered.
                    while let Ok(event) = events_rx.try_recv() {
                        pending.push_back(event);
                    }
                    while !pending.is_empty() {
                        let batch: Vec<TaskStatusEvent> = pending.iter().cloned().collect();
                        match forwarder.forward(batch).await {
                            Ok(_) => pending.clear(),
                            Err(err) => {
                                tracing::warn!(%err, queued = pending.len(), "status update delivery failed, retrying");
                                tokio::time::sleep(forwarder.error_wait).await;
                            }
                        }
                    }
                }
            }
        }
    })
}
