// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Async-aware wait utilities for tests.

use std::future::Future;
use std::time::Duration;

/// Poll a synchronous condition every 10ms until it returns true or timeout.
///
/// Returns `true` if the condition was met, `false` on timeout.
pub async fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an async condition every 10ms until it returns true or timeout.
///
/// Returns `true` if the condition was met, `false` on timeout.
pub async fn wait_for_condition_async<F, Fut>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_condition_immediate_true() {
        assert!(wait_for_condition(|| true, 1000).await);
    }

    #[tokio::test]
    async fn test_wait_for_condition_timeout_false() {
        assert!(!wait_for_condition(|| false, 50).await);
    }

    #[tokio::test]
    async fn test_wait_for_condition_eventual_true() {
        let counter = Arc::new(AtomicI32::new(0));
        let counter_clone = Arc::clone(&counter);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter_clone.store(1, Ordering::SeqCst);
        });

        assert!(wait_for_condition(|| counter.load(Ordering::SeqCst) == 1, 1000).await);
    }

    #[tokio::test]
    async fn test_wait_for_condition_async_timeout() {
        assert!(!wait_for_condition_async(|| async { false }, 50).await);
    }
}
