// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Background maintenance loops over the offer pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pool::OfferPool;

/// Periodically prune expired offers (declining them at the broker), reset
/// hosts stuck in PLACING and release expired host reservations.
pub fn start_offer_pruner(
    pool: Arc<OfferPool>,
    period: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    let now = Instant::now();
                    let (expired, remaining) = pool.remove_expired_offers(now);
                    if !expired.is_empty() {
                        tracing::info!(expired = expired.len(), remaining, "pruned expired offers");
                        let _ = pool.decline_offers(expired).await;
                    }
                    let reset = pool.reset_expired_host_summaries(now);
                    if !reset.is_empty() {
                        tracing::warn!(hosts = ?reset, "reset hosts stuck in placing");
                    }
                    pool.release_expired_reservations(now);
                }
            }
        }
    })
}

/// Periodically unreserve label-reserved offers with no persistent volume.
pub fn start_reservation_cleaner(
    pool: Arc<OfferPool>,
    period: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => break,
                _ = tokio::time::sleep(period) => {
                    pool.clean_reservation_resources().await;
                }
            }
        }
    })
}
