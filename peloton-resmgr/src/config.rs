// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource manager configuration.
//!
//! A plain struct with defaults, JSON overrides and `PELOTON_<field>`
//! environment overrides. Every knob is validated at startup.

use std::time::Duration;

use peloton_common::status::{PelotonError, PelotonResult};

/// All resource manager knobs. Durations are stored in milliseconds.
#[derive(Debug, Clone)]
pub struct ResmgrConfig {
    /// Ready-queue drain tick.
    pub task_scheduling_period_ms: u64,
    pub entitlement_calculation_period_ms: u64,
    pub task_reconciliation_period_ms: u64,

    // ─── Task timeouts ────────────────────────────────────────
    pub placing_timeout_ms: u64,
    pub launching_timeout_ms: u64,
    pub reserving_timeout_ms: u64,

    // ─── Placement retry ──────────────────────────────────────
    pub placement_retry_backoff_ms: u64,
    pub placement_retry_cycle: u32,
    pub placement_attempts_percycle: u32,
    pub backoff_policy_name: String,
    pub enable_placement_backoff: bool,
    pub enable_host_reservation: bool,

    // ─── Preemption ───────────────────────────────────────────
    pub task_preemption_period_ms: u64,
    pub sustained_over_allocation_count: u32,
    pub preemption_enabled: bool,

    // ─── Host lifecycle / recovery ────────────────────────────
    pub host_drainer_period_ms: u64,
    pub recover_from_active_jobs: bool,
}

impl Default for ResmgrConfig {
    fn default() -> Self {
        Self {
            task_scheduling_period_ms: 100,
            entitlement_calculation_period_ms: 60_000,
            task_reconciliation_period_ms: 3_600_000,
            placing_timeout_ms: 10 * 60_000,
            launching_timeout_ms: 20 * 60_000,
            reserving_timeout_ms: 30 * 60_000,
            placement_retry_backoff_ms: 5 * 60_000,
            placement_retry_cycle: 3,
            placement_attempts_percycle: 3,
            backoff_policy_name: "exponential-policy".to_string(),
            enable_placement_backoff: true,
            enable_host_reservation: false,
            task_preemption_period_ms: 60_000,
            sustained_over_allocation_count: 5,
            preemption_enabled: true,
            host_drainer_period_ms: 60_000,
            recover_from_active_jobs: true,
        }
    }
}

impl ResmgrConfig {
    /// Parse from a JSON object, starting from defaults.
    pub fn from_json(json: &str) -> PelotonResult<Self> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| PelotonError::invalid_argument(format!("config parse error: {e}")))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
            };
            ($field:ident, u32) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v as u32;
                }
            };
            ($field:ident, bool) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_bool()) {
                    config.$field = v;
                }
            };
            ($field:ident, String) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_str()) {
                    config.$field = v.to_string();
                }
            };
        }

        set_field!(task_scheduling_period_ms, u64);
        set_field!(entitlement_calculation_period_ms, u64);
        set_field!(task_reconciliation_period_ms, u64);
        set_field!(placing_timeout_ms, u64);
        set_field!(launching_timeout_ms, u64);
        set_field!(reserving_timeout_ms, u64);
        set_field!(placement_retry_backoff_ms, u64);
        set_field!(placement_retry_cycle, u32);
        set_field!(placement_attempts_percycle, u32);
        set_field!(backoff_policy_name, String);
        set_field!(enable_placement_backoff, bool);
        set_field!(enable_host_reservation, bool);
        set_field!(task_preemption_period_ms, u64);
        set_field!(sustained_over_allocation_count, u32);
        set_field!(preemption_enabled, bool);
        set_field!(host_drainer_period_ms, u64);
        set_field!(recover_from_active_jobs, bool);

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides of the form `PELOTON_<field>`.
    fn apply_env_overrides(&mut self) {
        macro_rules! env_override {
            ($field:ident, u64) => {
                if let Ok(val) = std::env::var(concat!("PELOTON_", stringify!($field))) {
                    if let Ok(v) = val.parse::<u64>() {
                        self.$field = v;
                    }
                }
            };
            ($field:ident, u32) => {
                if let Ok(val) = std::env::var(concat!("PELOTON_", stringify!($field))) {
                    if let Ok(v) = val.parse::<u32>() {
                        self.$field = v;
                    }
                }
            };
            ($field:ident, bool) => {
                if let Ok(val) = std::env::var(concat!("PELOTON_", stringify!($field))) {
                    if let Ok(v) = val.parse::<bool>() {
                        self.$field = v;
                    }
                }
            };
        }

        env_override!(task_scheduling_period_ms, u64);
        env_override!(entitlement_calculation_period_ms, u64);
        env_override!(placing_timeout_ms, u64);
        env_override!(launching_timeout_ms, u64);
        env_override!(reserving_timeout_ms, u64);
        env_override!(placement_retry_cycle, u32);
        env_override!(placement_attempts_percycle, u32);
        env_override!(enable_placement_backoff, bool);
        env_override!(enable_host_reservation, bool);
        env_override!(preemption_enabled, bool);
    }

    /// Validate ranges. Run once at startup; a bad config never gets to
    /// drive the loops.
    pub fn validate(&self) -> PelotonResult<()> {
        let nonzero = [
            ("task_scheduling_period_ms", self.task_scheduling_period_ms),
            (
                "entitlement_calculation_period_ms",
                self.entitlement_calculation_period_ms,
            ),
            ("placing_timeout_ms", self.placing_timeout_ms),
            ("launching_timeout_ms", self.launching_timeout_ms),
            ("reserving_timeout_ms", self.reserving_timeout_ms),
            ("task_preemption_period_ms", self.task_preemption_period_ms),
            ("host_drainer_period_ms", self.host_drainer_period_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(PelotonError::invalid_argument(format!(
                    "{name} must be positive"
                )));
            }
        }
        if self.placement_retry_cycle == 0 {
            return Err(PelotonError::invalid_argument(
                "placement_retry_cycle must be at least 1",
            ));
        }
        if self.placement_attempts_percycle == 0 {
            return Err(PelotonError::invalid_argument(
                "placement_attempts_percycle must be at least 1",
            ));
        }
        if self.sustained_over_allocation_count == 0 {
            return Err(PelotonError::invalid_argument(
                "sustained_over_allocation_count must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn task_scheduling_period(&self) -> Duration {
        Duration::from_millis(self.task_scheduling_period_ms)
    }
    pub fn entitlement_calculation_period(&self) -> Duration {
        Duration::from_millis(self.entitlement_calculation_period_ms)
    }
    pub fn placing_timeout(&self) -> Duration {
        Duration::from_millis(self.placing_timeout_ms)
    }
    pub fn launching_timeout(&self) -> Duration {
        Duration::from_millis(self.launching_timeout_ms)
    }
    pub fn reserving_timeout(&self) -> Duration {
        Duration::from_millis(self.reserving_timeout_ms)
    }
    pub fn placement_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.placement_retry_backoff_ms)
    }
    pub fn task_preemption_period(&self) -> Duration {
        Duration::from_millis(self.task_preemption_period_ms)
    }
}
