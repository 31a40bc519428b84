//! One-shot timer wheel over virtual time
//!
//! Timers are registered through `filament/time/set` and fire as
//! `filament/time/fire` inbound events once the virtual clock reaches
//! their target. The wheel only moves when the clock is advanced, which
//! keeps firing order deterministic: targets ascending, registration
//! order breaking ties. Past targets fire on the next advance.

use std::collections::BTreeMap;

use core_types::{ProcessId, TimeDelta, TimerId, VirtualTime};

/// A timer that came due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub id: TimerId,
    pub pid: ProcessId,
    pub target: VirtualTime,
    /// `actual - target` at the moment of firing.
    pub skew: TimeDelta,
}

/// Pending one-shot timers ordered by (target, registration id).
#[derive(Debug, Default)]
pub struct TimerWheel {
    pending: BTreeMap<(u64, u64), ProcessId>,
    next: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self { pending: BTreeMap::new(), next: 1 }
    }

    /// Registers a one-shot timer targeting `target` virtual time.
    pub fn set(&mut self, pid: ProcessId, target: VirtualTime) -> TimerId {
        let id = self.next;
        self.next += 1;
        self.pending.insert((target.as_nanos(), id), pid);
        TimerId::from_raw(id)
    }

    /// Pops every timer with `target <= now`, in deterministic order.
    pub fn due(&mut self, now: VirtualTime) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        let ready: Vec<(u64, u64)> = self
            .pending
            .range(..=(now.as_nanos(), u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in ready {
            let pid = self.pending.remove(&key).expect("key just observed");
            let target = VirtualTime::from_nanos(key.0);
            fired.push(FiredTimer {
                id: TimerId::from_raw(key.1),
                pid,
                target,
                skew: now.delta_since(target),
            });
        }
        fired
    }

    /// Drops every pending timer of a terminating process.
    pub fn cancel_for_process(&mut self, pid: ProcessId) {
        self.pending.retain(|_, owner| *owner != pid);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
