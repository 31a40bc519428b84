//! Process state
//!
//! A process is a pipeline of module instances with its own timeline,
//! staging area, limits, capability set, and supervision links. All of
//! it is owned by the kernel table; nothing here is shared across
//! threads except through channels.

use std::collections::VecDeque;

use capability::CapabilitySet;
use core_types::{
    ChannelId, ExecutionContext, KernelError, ModuleAlias, PoolingMode, ProcessId,
    ResourceLimits, ResourceUsage, SchedulingPolicy, VirtualTime,
};
use engine::{InstanceId, ModuleDigest};

use crate::event::EventRecord;
use crate::spawn::Binding;
use crate::staging::StagingArea;
use crate::timeline::Timeline;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Has work to do; runs in the next cycle.
    Ready,
    /// Sleeping until an inbound event or timer arrives.
    Parked,
    /// Marked faulted by `filament/core/panic` or a fatal trap; never
    /// scheduled again until the host intervenes.
    Faulted,
}

/// One module instance in a pipeline.
#[derive(Debug)]
pub struct ModuleSlot {
    pub alias: ModuleAlias,
    pub digest: ModuleDigest,
    pub context: ExecutionContext,
    pub pooling: PoolingMode,
    pub instance: InstanceId,
    /// Scalar preserved across yield/park; zeroed for Stateless.
    pub user_data: u64,
    pub mem_required: u64,
}

/// An event waiting in the inbound queue with its wake bits.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub record: EventRecord,
    pub wake: u64,
}

/// Pre-reserved allocation pool for System-context modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReservedPool {
    capacity: u64,
    used: u64,
}

impl ReservedPool {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.used
    }

    /// Takes bytes from the pool; the pool never touches the host heap
    /// accounting.
    pub fn take(&mut self, bytes: u64) -> Result<(), KernelError> {
        if self.used.saturating_add(bytes) > self.capacity {
            return Err(KernelError::Oom(format!(
                "reserved pool exhausted: {} requested, {} available",
                bytes,
                self.available()
            )));
        }
        self.used += bytes;
        Ok(())
    }

    pub fn give_back(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// One hosted process.
#[derive(Debug)]
pub struct Process {
    pub id: ProcessId,
    pub parent: Option<ProcessId>,
    pub modules: Vec<ModuleSlot>,
    pub bindings: Vec<Binding>,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub capabilities: CapabilitySet,
    pub timeline: Timeline,
    pub staging: StagingArea,
    pub owned_channels: Vec<ChannelId>,
    pub children: Vec<ProcessId>,
    pub inbound: VecDeque<InboundEvent>,
    pub policy: SchedulingPolicy,
    pub state: ProcessState,
    pub system_pool: ReservedPool,
    /// Base entropy seed; per-weave seeds derive from it.
    pub base_seed: u64,
    /// Completed weaves; also the per-process tick counter in args.
    pub weave_count: u64,
    pub last_weave_at: VirtualTime,
    pub fault_reason: Option<String>,
}

impl Process {
    /// Whether the next cycle should run a weave on this process.
    pub fn runnable(&self) -> bool {
        match self.state {
            ProcessState::Ready => true,
            ProcessState::Parked => !self.inbound.is_empty(),
            ProcessState::Faulted => false,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ProcessState::Faulted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_pool_accounting() {
        let mut pool = ReservedPool::new(1_000);
        pool.take(600).unwrap();
        assert_eq!(pool.available(), 400);
        assert!(matches!(pool.take(500), Err(KernelError::Oom(_))));
        pool.give_back(600);
        assert_eq!(pool.available(), 1_000);
    }
}
