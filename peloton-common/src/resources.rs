// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scalar resource vector and fixed-point arithmetic.
//!
//! Resource quantities can be fractional (0.5 cpu). `FixedPoint` stores the
//! value as `value * RESOURCE_UNIT_SCALING` internally for exact integer
//! arithmetic, so repeated add/subtract round trips never drift.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scaling factor for fixed-point resource quantities (1/10000 granularity).
pub const RESOURCE_UNIT_SCALING: i64 = 10_000;

/// Fixed-point representation for fractional resource quantities.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(RESOURCE_UNIT_SCALING);

    /// Create from a double value (multiply by scaling factor).
    pub fn from_f64(value: f64) -> Self {
        Self((value * RESOURCE_UNIT_SCALING as f64).round() as i64)
    }

    /// Convert to double value.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RESOURCE_UNIT_SCALING as f64
    }

    /// Get the raw internal representation.
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self((self.0 - rhs.0).max(0))
    }

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }

    pub fn max(self, rhs: Self) -> Self {
        Self(self.0.max(rhs.0))
    }
}

impl std::ops::Add for FixedPoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for FixedPoint {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for FixedPoint {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedPoint({})", self.to_f64())
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// The resource dimensions tracked by pools, offers and tasks.
///
/// Ports are intentionally not a dimension: they are matched as explicit
/// port counts on offers and filters, never pooled or entitled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Cpu,
    Mem,
    Disk,
    Gpu,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Mem,
        ResourceKind::Disk,
        ResourceKind::Gpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Mem => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scalar resource vector: cpu cores, memory MB, disk MB and gpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: FixedPoint,
    pub mem: FixedPoint,
    pub disk: FixedPoint,
    pub gpu: FixedPoint,
}

impl Resources {
    pub const ZERO: Self = Self {
        cpu: FixedPoint::ZERO,
        mem: FixedPoint::ZERO,
        disk: FixedPoint::ZERO,
        gpu: FixedPoint::ZERO,
    };

    pub fn new(cpu: f64, mem: f64, disk: f64, gpu: f64) -> Self {
        Self {
            cpu: FixedPoint::from_f64(cpu),
            mem: FixedPoint::from_f64(mem),
            disk: FixedPoint::from_f64(disk),
            gpu: FixedPoint::from_f64(gpu),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> FixedPoint {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Mem => self.mem,
            ResourceKind::Disk => self.disk,
            ResourceKind::Gpu => self.gpu,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, value: FixedPoint) {
        match kind {
            ResourceKind::Cpu => self.cpu = value,
            ResourceKind::Mem => self.mem = value,
            ResourceKind::Disk => self.disk = value,
            ResourceKind::Gpu => self.gpu = value,
        }
    }

    /// Add another vector componentwise.
    pub fn add(&mut self, other: &Resources) {
        self.cpu += other.cpu;
        self.mem += other.mem;
        self.disk += other.disk;
        self.gpu += other.gpu;
    }

    /// Subtract another vector componentwise, clamping each dimension at
    /// zero. Callers must never subtract what is not contained; when that
    /// happens anyway (missed offer tracking, double release) we log loudly
    /// and proceed so accounting can recover instead of wedging.
    pub fn subtract(&mut self, other: &Resources) {
        if !self.contains(other) {
            tracing::error!(current = ?self, delta = ?other, "not enough resources to subtract delta");
        }
        self.cpu = self.cpu.saturating_sub(other.cpu);
        self.mem = self.mem.saturating_sub(other.mem);
        self.disk = self.disk.saturating_sub(other.disk);
        self.gpu = self.gpu.saturating_sub(other.gpu);
    }

    /// Strict subtraction: `None` when `other` is not contained.
    pub fn try_subtract(&self, other: &Resources) -> Option<Resources> {
        if !self.contains(other) {
            return None;
        }
        Some(Resources {
            cpu: self.cpu - other.cpu,
            mem: self.mem - other.mem,
            disk: self.disk - other.disk,
            gpu: self.gpu - other.gpu,
        })
    }

    /// Componentwise `>=`.
    pub fn contains(&self, other: &Resources) -> bool {
        self.cpu >= other.cpu
            && self.mem >= other.mem
            && self.disk >= other.disk
            && self.gpu >= other.gpu
    }

    pub fn is_zero(&self) -> bool {
        self.cpu.is_zero() && self.mem.is_zero() && self.disk.is_zero() && self.gpu.is_zero()
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_positive()
    }

    /// The amount by which this vector exceeds `other`, componentwise,
    /// clamped at zero. Unlike `subtract` this is an expected comparison,
    /// not an accounting violation.
    pub fn exceeding(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            mem: self.mem.saturating_sub(other.mem),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Componentwise maximum.
    pub fn component_max(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.max(other.cpu),
            mem: self.mem.max(other.mem),
            disk: self.disk.max(other.disk),
            gpu: self.gpu.max(other.gpu),
        }
    }

    /// Sum an iterator of vectors.
    pub fn sum<'a>(iter: impl IntoIterator<Item = &'a Resources>) -> Resources {
        let mut total = Resources::ZERO;
        for r in iter {
            total.add(r);
        }
        total
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu:{} mem:{} disk:{} gpu:{}",
            self.cpu, self.mem, self.disk, self.gpu
        )
    }
}
