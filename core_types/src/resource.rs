//! Resource budget primitives
//!
//! - **Resources are finite and must be explicit**
//! - **Budgets are enforced, not advisory**
//! - **Accounting is deterministic and testable**
//!
//! Compute is counted in abstract units charged by the execution engine's
//! instruction meter; memory in bytes. Exceeding either hard limit
//! discards the active weave.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::KernelError;
use crate::time::TimeDelta;

/// Abstract compute units (metered instructions, not real cycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ComputeUnits(pub u64);

impl ComputeUnits {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for ComputeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} compute units", self.0)
    }
}

/// Memory measured in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MemoryBytes(pub u64);

impl MemoryBytes {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for MemoryBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Immutable limits attached to a process at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Compute units available per weave.
    pub compute_max: ComputeUnits,
    /// Total memory quota (blobs, channel rings, module memories).
    pub mem_max: MemoryBytes,
    /// Wall-equivalent time budget per weave, in virtual nanoseconds.
    pub time_budget: TimeDelta,
}

impl ResourceLimits {
    pub fn new(compute_max: ComputeUnits, mem_max: MemoryBytes, time_budget: TimeDelta) -> Self {
        Self { compute_max, mem_max, time_budget }
    }
}

/// Running consumption against a `ResourceLimits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub compute_used: ComputeUnits,
    pub mem_used: MemoryBytes,
}

impl ResourceUsage {
    pub fn new() -> Self {
        Self { compute_used: ComputeUnits(0), mem_used: MemoryBytes(0) }
    }

    /// Charges compute units; errors when the budget is exhausted.
    pub fn charge_compute(&mut self, units: ComputeUnits, limits: &ResourceLimits) -> Result<(), KernelError> {
        let next = self.compute_used.saturating_add(units);
        if next > limits.compute_max {
            self.compute_used = next;
            return Err(KernelError::Timeout(format!(
                "compute budget exhausted: used {} of {}",
                next.0, limits.compute_max.0
            )));
        }
        self.compute_used = next;
        Ok(())
    }

    /// Charges memory; errors when the quota would be exceeded.
    pub fn charge_memory(&mut self, bytes: MemoryBytes, limits: &ResourceLimits) -> Result<(), KernelError> {
        let next = self.mem_used.saturating_add(bytes);
        if next > limits.mem_max {
            return Err(KernelError::Oom(format!(
                "memory quota exceeded: {} requested, {} of {} in use",
                bytes.0, self.mem_used.0, limits.mem_max.0
            )));
        }
        self.mem_used = next;
        Ok(())
    }

    /// Credits memory back (saturating at zero).
    pub fn credit_memory(&mut self, bytes: MemoryBytes) {
        self.mem_used = self.mem_used.saturating_sub(bytes);
    }

    /// Resets per-weave counters (compute only; memory is long-lived).
    pub fn reset_weave(&mut self) {
        self.compute_used = ComputeUnits(0);
    }
}
