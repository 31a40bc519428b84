//! Execution context and scheduling classification

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution context of a module instance.
///
/// The context determines what the runtime guarantees and what it
/// forbids; it is declared in the module info block and fixed for the
/// life of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionContext {
    /// Fully deterministic: linear memory and globals reset at weave
    /// start, entropy only from the provided seed, NaN canonicalization
    /// and instruction metering enforced.
    Logic,
    /// Trusted low-latency context; allocation only from pre-reserved
    /// pools, never the host heap.
    System,
    /// Host-managed context with relaxed determinism guarantees.
    Managed,
}

impl ExecutionContext {
    /// Decodes the ABI representation.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ExecutionContext::Logic),
            1 => Some(ExecutionContext::System),
            2 => Some(ExecutionContext::Managed),
            _ => None,
        }
    }

    /// Encodes the ABI representation.
    pub fn as_u32(&self) -> u32 {
        match self {
            ExecutionContext::Logic => 0,
            ExecutionContext::System => 1,
            ExecutionContext::Managed => 2,
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionContext::Logic => write!(f, "logic"),
            ExecutionContext::System => write!(f, "system"),
            ExecutionContext::Managed => write!(f, "managed"),
        }
    }
}

/// Whether an instance may be pooled and recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingMode {
    /// Instance state persists across weaves; `user_data` survives.
    Stateful,
    /// Instance may be served by any pooled body; `user_data` is zeroed
    /// and memory restored to the post-init snapshot every weave.
    Stateless,
}

impl PoolingMode {
    /// Decodes the ABI representation.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PoolingMode::Stateful),
            1 => Some(PoolingMode::Stateless),
            _ => None,
        }
    }

    /// Encodes the ABI representation.
    pub fn as_u32(&self) -> u32 {
        match self {
            PoolingMode::Stateful => 0,
            PoolingMode::Stateless => 1,
        }
    }
}

/// How a process participates in the global cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// Runs on the shared pool behind the global barrier; weaves align
    /// with every other shared process.
    Shared,
    /// Runs independently and never blocks the global cycle.
    Dedicated,
}

impl SchedulingPolicy {
    /// Decodes the ABI representation.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SchedulingPolicy::Shared),
            1 => Some(SchedulingPolicy::Dedicated),
            _ => None,
        }
    }

    /// Encodes the ABI representation.
    pub fn as_u32(&self) -> u32 {
        match self {
            SchedulingPolicy::Shared => 0,
            SchedulingPolicy::Dedicated => 1,
        }
    }
}
