//! Supervision audit trail
//!
//! Spawn and terminate logic lives on the kernel itself; this module
//! holds the audit events tests assert against.

use serde::{Deserialize, Serialize};

use core_types::ProcessId;

/// Supervision event for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorEvent {
    /// Process registered and initialized.
    Spawned { pid: ProcessId, parent: Option<ProcessId> },
    /// Spawn request rejected before any module ran.
    SpawnRejected { parent: Option<ProcessId>, reason: String },
    /// A spawn pending in a weave was discarded by a same-weave
    /// termination; `init` and the first weave never ran.
    SpawnDropped { pid: ProcessId },
    /// Process terminated. `cascade` marks parent-death propagation.
    Terminated { pid: ProcessId, cascade: bool },
    /// A module asked to terminate a process outside its subtree.
    TerminationRejected { requester: ProcessId, target: ProcessId, reason: String },
    /// Process marked faulted.
    Faulted { pid: ProcessId, reason: String },
}

/// Audit log for supervision decisions (test-only inspection).
#[derive(Debug, Clone, Default)]
pub struct SupervisorAuditLog {
    events: Vec<SupervisorEvent>,
}

impl SupervisorAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: SupervisorEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SupervisorEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SupervisorEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SupervisorEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_queries() {
        let mut log = SupervisorAuditLog::new();
        log.record(SupervisorEvent::Spawned { pid: ProcessId::from_raw(1), parent: None });
        log.record(SupervisorEvent::Terminated { pid: ProcessId::from_raw(1), cascade: false });
        assert!(log.has_event(|e| matches!(e, SupervisorEvent::Spawned { .. })));
        assert_eq!(log.count_events(|e| matches!(e, SupervisorEvent::Terminated { .. })), 1);
    }
}
