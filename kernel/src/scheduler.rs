//! Cycle scheduling
//!
//! - **Determinism first**: shared processes run in pid order behind the
//!   global barrier; same inputs, same schedule.
//! - **No hidden yields**: a weave is one synchronous invocation; the
//!   only suspension points are `PARK`/`YIELD` returns and involuntary
//!   preemption by the meter.
//!
//! `Dedicated` processes never join the barrier: the host steps them
//! independently (typically from their own worker thread) and the global
//! cycle skips them.

use serde::{Deserialize, Serialize};

use core_types::{ProcessId, SchedulingPolicy};

/// Scheduling event for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleEvent {
    /// A weave began on a process.
    WeaveStarted { pid: ProcessId },
    /// The weave committed `events` timeline events.
    WeaveCommitted { pid: ProcessId, events: usize },
    /// The weave was discarded with the given ABI code.
    WeaveDiscarded { pid: ProcessId, code: i64 },
    /// The process had nothing to do this cycle.
    WeaveSkipped { pid: ProcessId },
}

/// Membership of the global barrier.
#[derive(Debug, Default)]
pub struct Scheduler {
    shared: Vec<ProcessId>,
    dedicated: Vec<ProcessId>,
    audit: Vec<CycleEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pid: ProcessId, policy: SchedulingPolicy) {
        match policy {
            SchedulingPolicy::Shared => self.shared.push(pid),
            SchedulingPolicy::Dedicated => self.dedicated.push(pid),
        }
    }

    pub fn unregister(&mut self, pid: ProcessId) {
        self.shared.retain(|p| *p != pid);
        self.dedicated.retain(|p| *p != pid);
    }

    /// Barrier order: shared processes by ascending pid.
    pub fn shared_order(&self) -> Vec<ProcessId> {
        let mut order = self.shared.clone();
        order.sort();
        order
    }

    pub fn is_dedicated(&self, pid: ProcessId) -> bool {
        self.dedicated.contains(&pid)
    }

    pub fn shared_count(&self) -> usize {
        self.shared.len()
    }

    pub fn dedicated_count(&self) -> usize {
        self.dedicated.len()
    }

    pub fn record(&mut self, event: CycleEvent) {
        self.audit.push(event);
    }

    pub fn audit(&self) -> &[CycleEvent] {
        &self.audit
    }

    pub fn clear_audit(&mut self) {
        self.audit.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&CycleEvent) -> bool,
    {
        self.audit.iter().any(predicate)
    }
}
