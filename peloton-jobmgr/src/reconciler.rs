// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task reconciliation: periodically asks the broker for the status of
//! every known task so missed updates eventually converge through the
//! normal event stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use peloton_hostmgr::service::HostManager;

pub fn start_reconciliation_loop(
    hostmgr: Arc<dyn HostManager>,
    period: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    match hostmgr.reconcile_tasks().await {
                        Ok(()) => tracing::debug!("task reconciliation requested"),
                        Err(err) => tracing::warn!(%err, "task reconciliation failed"),
                    }
                }
            }
        }
    })
}
