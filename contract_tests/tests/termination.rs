//! Cascading termination: descendants die post-order, owned channels
//! are destroyed waking blocked readers, and quota returns to parents.

use std::time::Duration;

use abi::{ChannelDirection, ValueTag};
use contract_tests::{module_spec, spawn_request, KernelBuilder};
use core_types::{KernelError, MemoryBytes, ProcessId};
use engine::SimProgram;
use kernel::{ChannelSpec, SupervisorEvent};

fn idle_program() -> SimProgram {
    SimProgram::with_weave(contract_tests::logic_info(), Box::new(|_| core_types::PARK))
}

/// Spawns an idle process whose memory quota fits inside its parent's.
fn spawn_idle(
    kernel: &mut kernel::Kernel,
    digest: engine::ModuleDigest,
    parent: Option<ProcessId>,
    mem_max: u64,
) -> ProcessId {
    let mut request = spawn_request(vec![module_spec("idle", digest)]);
    request.limits.mem_max = MemoryBytes(mem_max);
    kernel.spawn_process(parent, request).unwrap()
}

const MIB: u64 = 1 << 20;

#[test]
fn test_cascade_is_post_order() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"idle:v1", idle_program());
    let mut kernel = builder.build();

    let p = spawn_idle(&mut kernel, digest, None, 16 * MIB);
    let c1 = spawn_idle(&mut kernel, digest, Some(p), 4 * MIB);
    let c2 = spawn_idle(&mut kernel, digest, Some(c1), MIB);

    kernel.terminate_process(p).unwrap();

    let order: Vec<ProcessId> = kernel
        .supervisor_audit()
        .events()
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Terminated { pid, .. } => Some(*pid),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![c2, c1, p]);

    assert!(kernel.process(p).is_none());
    assert!(kernel.process(c1).is_none());
    assert!(kernel.process(c2).is_none());
    assert_eq!(kernel.metrics().process_count, 0);
}

#[test]
fn test_termination_credits_parent_quota() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"idle:v1", idle_program());
    let mut kernel = builder.build();

    let p = spawn_idle(&mut kernel, digest, None, 16 * MIB);
    let before = kernel.process(p).unwrap().usage.mem_used;

    let c1 = spawn_idle(&mut kernel, digest, Some(p), 4 * MIB);
    let charged = kernel.process(p).unwrap().usage.mem_used;
    assert!(charged > before);

    kernel.terminate_process(c1).unwrap();
    // Credited back in full.
    assert_eq!(kernel.process(p).unwrap().usage.mem_used, before);
    assert!(kernel.process(p).unwrap().children.is_empty());
}

#[test]
fn test_destroying_channels_wakes_blocked_readers() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"idle:v1", idle_program());
    let mut kernel = builder.build();

    let mut request = spawn_request(vec![module_spec("idle", digest)]);
    request.channels = vec![ChannelSpec {
        schema_uri: "schema/feed/v1".to_string(),
        capacity: 4,
        msg_size: 64,
        direction: ChannelDirection::Outbound,
        root_type: ValueTag::U64,
    }];
    let pid = kernel.spawn_process(None, request).unwrap();

    let channel = kernel.find_channel("filament/chan/1").unwrap();
    let reader = std::sync::Arc::clone(&channel);
    let waiter = std::thread::spawn(move || reader.pop_blocking(Duration::from_secs(5)));
    std::thread::sleep(Duration::from_millis(20));

    kernel.terminate_process(pid).unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(KernelError::NotFound(_))));
    assert!(kernel.find_channel("filament/chan/1").is_none());
}

#[test]
fn test_child_spawn_fails_when_parent_quota_exhausted() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"idle:v1", idle_program());
    let mut kernel = builder.build();

    let p = spawn_idle(&mut kernel, digest, None, 16 * MIB);

    // A child asking for more memory than the parent has left.
    let mut request = spawn_request(vec![module_spec("idle", digest)]);
    request.limits.mem_max = MemoryBytes(1 << 40);
    let err = kernel.spawn_process(Some(p), request).unwrap_err();
    assert!(matches!(err, KernelError::Oom(_)));
    assert!(kernel
        .supervisor_audit()
        .has_event(|e| matches!(e, SupervisorEvent::SpawnRejected { .. })));
}

#[test]
fn test_child_capabilities_must_be_subset() {
    use capability::{Affinity, CapabilityGrant, CapabilitySet, CapabilityUrn, TopicSet};
    use kernel::SpawnCapabilities;

    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"idle:v1", idle_program());
    let mut kernel = builder.build();

    let p = spawn_idle(&mut kernel, digest, None, 16 * MIB);

    let rogue = CapabilitySet::new(vec![CapabilityGrant::new(
        CapabilityUrn::parse("urn:filament:cap:rogue").unwrap(),
        Affinity::Agnostic,
    )
    .with_outbound(TopicSet::parse(&["secret/*"]).unwrap())]);
    let mut request = spawn_request(vec![module_spec("idle", digest)]);
    request.limits.mem_max = MemoryBytes(MIB);
    request.capabilities = SpawnCapabilities::Explicit(rogue.clone());
    let err = kernel.spawn_process(Some(p), request).unwrap_err();
    assert!(matches!(err, KernelError::Permission(_)));

    // The same set passes with host-granted escalation.
    let mut request = spawn_request(vec![module_spec("idle", digest)]);
    request.limits.mem_max = MemoryBytes(MIB);
    request.capabilities = SpawnCapabilities::Explicit(rogue);
    request.escalation = true;
    assert!(kernel.spawn_process(Some(p), request).is_ok());
}
