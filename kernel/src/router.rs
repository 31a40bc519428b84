//! Capability router
//!
//! Every outbound event is looked up against the process capability set
//! before it goes anywhere; an ungranted topic aborts the weave. Topics
//! under `filament/` are kernel-handled requests (timers, logging,
//! panic, kv, async I/O, hardware) rather than plain events; everything
//! else is a static topic staged for the timeline.

use serde::{Deserialize, Serialize};

use core_types::{KernelError, ProcessId};

use crate::channel::CHANNEL_NAMESPACE;

pub const TOPIC_TIME_SET: &str = "filament/time/set";
pub const TOPIC_TIME_FIRE: &str = "filament/time/fire";
pub const TOPIC_CORE_LOG: &str = "filament/core/log";
pub const TOPIC_CORE_PANIC: &str = "filament/core/panic";
pub const TOPIC_KV_SET: &str = "filament/kv/set";
pub const TOPIC_KV_GET: &str = "filament/kv/get";
pub const TOPIC_KV_RESULT: &str = "filament/kv/result";
pub const TOPIC_LIFECYCLE_PREFIX: &str = "filament/lifecycle/";
pub const TOPIC_FS_PREFIX: &str = "filament/fs/";
pub const TOPIC_HTTP_PREFIX: &str = "filament/net/http/";
pub const TOPIC_HW_PREFIX: &str = "filament/hw/";
pub const TOPIC_ENV_PREFIX: &str = "filament/env/";

/// Where an outbound event goes after the capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundRoute {
    /// Static topic: staged, committed to the timeline.
    Staging,
    /// Write into a dynamic channel ring.
    Channel,
    /// One-shot timer registration.
    TimeSet,
    /// Telemetry record for the host sink.
    CoreLog,
    /// Marks the process faulted and forces rollback.
    CorePanic,
    /// Buffered kv write.
    KvSet,
    /// Snapshot kv read, replied into staging.
    KvGet,
    /// Asynchronous host I/O (fs, http), replied in a later weave.
    AsyncIo,
    /// Hardware side-effect, buffered until commit flush.
    Hardware,
}

/// Classifies an outbound topic. Unknown topics inside the `filament/`
/// namespace are rejected rather than silently staged.
pub fn classify_outbound(topic: &str) -> Result<OutboundRoute, KernelError> {
    if topic.starts_with(CHANNEL_NAMESPACE) {
        return Ok(OutboundRoute::Channel);
    }
    match topic {
        TOPIC_TIME_SET => return Ok(OutboundRoute::TimeSet),
        TOPIC_CORE_LOG => return Ok(OutboundRoute::CoreLog),
        TOPIC_CORE_PANIC => return Ok(OutboundRoute::CorePanic),
        TOPIC_KV_SET => return Ok(OutboundRoute::KvSet),
        TOPIC_KV_GET => return Ok(OutboundRoute::KvGet),
        _ => {}
    }
    if topic.starts_with(TOPIC_FS_PREFIX) || topic.starts_with(TOPIC_HTTP_PREFIX) {
        return Ok(OutboundRoute::AsyncIo);
    }
    if topic.starts_with(TOPIC_HW_PREFIX) {
        return Ok(OutboundRoute::Hardware);
    }
    if topic.starts_with("filament/") {
        return Err(KernelError::Invalid(format!("unknown kernel topic {}", topic)));
    }
    Ok(OutboundRoute::Staging)
}

/// Wake bit attached to an inbound event by its topic.
pub fn wake_bits_for(topic: &str) -> u64 {
    if topic == TOPIC_TIME_FIRE {
        abi::WAKE_TIMER
    } else if topic == TOPIC_KV_RESULT {
        abi::WAKE_KV
    } else if topic.starts_with(TOPIC_HW_PREFIX) {
        abi::WAKE_HW
    } else if topic.starts_with(TOPIC_LIFECYCLE_PREFIX) {
        abi::WAKE_LIFECYCLE
    } else {
        abi::WAKE_IO
    }
}

/// Routing event for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterEvent {
    /// Outbound event passed the capability check.
    Routed { pid: ProcessId, topic: String, route: OutboundRoute },
    /// Outbound event rejected; the weave aborts.
    Rejected { pid: ProcessId, topic: String, code: i64 },
    /// Inbound event deposited into staging.
    Delivered { pid: ProcessId, topic: String, wake: u64 },
}

/// Audit log for routing decisions (test-only inspection).
#[derive(Debug, Clone, Default)]
pub struct RouterAuditLog {
    events: Vec<RouterEvent>,
}

impl RouterAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: RouterEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[RouterEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&RouterEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&RouterEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_topics_classify() {
        assert_eq!(classify_outbound(TOPIC_TIME_SET).unwrap(), OutboundRoute::TimeSet);
        assert_eq!(classify_outbound(TOPIC_CORE_LOG).unwrap(), OutboundRoute::CoreLog);
        assert_eq!(classify_outbound(TOPIC_CORE_PANIC).unwrap(), OutboundRoute::CorePanic);
        assert_eq!(classify_outbound(TOPIC_KV_SET).unwrap(), OutboundRoute::KvSet);
        assert_eq!(classify_outbound(TOPIC_KV_GET).unwrap(), OutboundRoute::KvGet);
        assert_eq!(classify_outbound("filament/fs/open").unwrap(), OutboundRoute::AsyncIo);
        assert_eq!(classify_outbound("filament/net/http/get").unwrap(), OutboundRoute::AsyncIo);
        assert_eq!(classify_outbound("filament/hw/gpio/set").unwrap(), OutboundRoute::Hardware);
        assert_eq!(classify_outbound("filament/chan/4").unwrap(), OutboundRoute::Channel);
    }

    #[test]
    fn test_static_topics_stage() {
        assert_eq!(classify_outbound("sensor/out").unwrap(), OutboundRoute::Staging);
        assert_eq!(classify_outbound("out").unwrap(), OutboundRoute::Staging);
    }

    #[test]
    fn test_unknown_kernel_topic_rejected() {
        assert!(matches!(
            classify_outbound("filament/bogus/thing"),
            Err(KernelError::Invalid(_))
        ));
    }

    #[test]
    fn test_wake_bits() {
        assert_eq!(wake_bits_for(TOPIC_TIME_FIRE), abi::WAKE_TIMER);
        assert_eq!(wake_bits_for(TOPIC_KV_RESULT), abi::WAKE_KV);
        assert_eq!(wake_bits_for("filament/fs/reply"), abi::WAKE_IO);
        assert_eq!(wake_bits_for("filament/hw/irq/3"), abi::WAKE_HW);
        assert_eq!(wake_bits_for("filament/lifecycle/stop"), abi::WAKE_LIFECYCLE);
        assert_eq!(wake_bits_for("some/other"), abi::WAKE_IO);
    }

    #[test]
    fn test_audit_log_queries() {
        let mut log = RouterAuditLog::new();
        log.record(RouterEvent::Rejected {
            pid: ProcessId::from_raw(1),
            topic: "x".to_string(),
            code: core_types::ERR_PERM,
        });
        assert!(log.has_event(|e| matches!(e, RouterEvent::Rejected { .. })));
        assert_eq!(log.count_events(|e| matches!(e, RouterEvent::Routed { .. })), 0);
    }
}
