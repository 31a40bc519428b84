//! # Contract Tests
//!
//! Golden end-to-end scenarios for the kernel runtime: determinism
//! replay, rollback on panic, channel backpressure, cascading
//! termination, cursor invalidation under pruning, and DMA fallback.
//! The helpers here assemble a kernel over the simulated engine with
//! registered test programs and a wide-open capability set, so each
//! scenario file reads as the behavior it pins down.

use abi::{structs::ABI_VERSION, Encoding, ModuleInfo};
use capability::{Affinity, CapabilityGrant, CapabilitySet, CapabilityUrn, HostFn, TopicSet};
use core_types::{
    ComputeUnits, ExecutionContext, KernelError, MemoryBytes, ModuleAlias, PoolingMode,
    ResourceLimits, SchedulingPolicy, TimeDelta, MAGIC,
};
use engine::{ModuleDigest, SimCallCtx, SimEngine, SimProgram};
use kernel::{Kernel, ModuleSpec, SpawnCapabilities, SpawnRequest};
use value::Value;

/// Assembles a kernel over a `SimEngine` with registered test programs.
pub struct KernelBuilder {
    engine: SimEngine,
    artifacts: Vec<Vec<u8>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self { engine: SimEngine::new(), artifacts: Vec::new() }
    }

    /// Registers a program under the digest of `artifact`.
    pub fn program(&mut self, artifact: &[u8], program: SimProgram) -> ModuleDigest {
        let digest = ModuleDigest::of(artifact);
        self.engine.register_program(digest, program);
        self.artifacts.push(artifact.to_vec());
        digest
    }

    pub fn build(self) -> Kernel {
        self.build_with(|kernel| kernel)
    }

    /// Builds the kernel after applying configuration (`with_*` calls).
    pub fn build_with(self, configure: impl FnOnce(Kernel) -> Kernel) -> Kernel {
        let mut kernel = configure(Kernel::new(Box::new(self.engine)));
        for artifact in self.artifacts {
            kernel.register_artifact(artifact);
        }
        kernel
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Module info block for a Logic/Stateful test module.
pub fn logic_info() -> ModuleInfo {
    ModuleInfo {
        magic: MAGIC,
        abi_version: ABI_VERSION,
        mem_required: 8_192,
        context: ExecutionContext::Logic.as_u32(),
        pooling: PoolingMode::Stateful.as_u32(),
        entry_count: 4,
        user_flags: 0,
    }
}

/// Module info block with explicit context and pooling.
pub fn info_for(context: ExecutionContext, pooling: PoolingMode) -> ModuleInfo {
    ModuleInfo {
        context: context.as_u32(),
        pooling: pooling.as_u32(),
        ..logic_info()
    }
}

/// A capability set granting every host function and the topic families
/// the scenarios exercise.
pub fn full_capabilities() -> CapabilitySet {
    let grant = CapabilityGrant::new(
        CapabilityUrn::parse("urn:filament:cap:test").expect("static urn"),
        Affinity::Agnostic,
    )
    .with_host_fns([
        HostFn::Read,
        HostFn::Write,
        HostFn::BlobAlloc,
        HostFn::BlobMap,
        HostFn::BlobRetain,
        HostFn::TlOpen,
        HostFn::TlNext,
        HostFn::TlClose,
        HostFn::ChannelCreate,
        HostFn::ProcessSpawn,
        HostFn::ProcessTerminate,
    ])
    .with_outbound(
        TopicSet::parse(&[
            "out",
            "aux/*",
            "filament/time/set",
            "filament/core/log",
            "filament/core/panic",
            "filament/kv/set",
            "filament/kv/get",
            "filament/fs/*",
            "filament/net/http/*",
            "filament/hw/*",
        ])
        .expect("static patterns"),
    )
    .with_inbound(TopicSet::parse(&["filament/chan/*"]).expect("static patterns"));
    CapabilitySet::new(vec![grant])
}

/// Default limits generous enough for every scenario.
pub fn default_limits() -> ResourceLimits {
    ResourceLimits::new(
        ComputeUnits(1_000_000),
        MemoryBytes(16 << 20),
        TimeDelta::from_millis(5),
    )
}

/// One-module spawn request with full capabilities.
pub fn spawn_request(modules: Vec<ModuleSpec>) -> SpawnRequest {
    SpawnRequest {
        modules,
        channels: Vec::new(),
        capabilities: SpawnCapabilities::Explicit(full_capabilities()),
        limits: default_limits(),
        policy: SchedulingPolicy::Shared,
        bindings: Vec::new(),
        system_pool_bytes: 0,
        base_seed: 0,
        escalation: false,
    }
}

/// Logic/Stateful module spec.
pub fn module_spec(alias: &str, digest: ModuleDigest) -> ModuleSpec {
    ModuleSpec {
        alias: ModuleAlias::new(alias),
        digest,
        context: ExecutionContext::Logic,
        pooling: PoolingMode::Stateful,
        init_args: Vec::new(),
    }
}

/// Emits a value-encoded event from inside a sim program.
pub fn emit(ctx: &mut SimCallCtx<'_>, topic: &str, value: &Value) -> i64 {
    let mut payload = Vec::new();
    value::emit_value(value, 0, &mut payload).expect("well-formed test value");
    ctx.host.write(topic, &payload, Encoding::Value)
}

/// Reads the next event on `topic` starting at `start`; returns the
/// parsed payload value and the next cursor offset.
pub fn read_value(ctx: &mut SimCallCtx<'_>, topic: &str, start: u64) -> Option<(Value, u64)> {
    let mut frame = Vec::new();
    let end = ctx.host.read(topic, start, &mut frame);
    if end <= 0 || frame.is_empty() {
        return None;
    }
    let decoded = abi::decode_event(&frame).ok()?;
    let parsed = value::parse_value(decoded.payload, 0).ok()?;
    Some((parsed, end as u64))
}

/// Asserts an error kind without caring about the message.
pub fn assert_error_kind(result: Result<impl std::fmt::Debug, KernelError>, code: i64) {
    match result {
        Err(err) => assert_eq!(err.code(), code, "unexpected error kind: {}", err),
        Ok(ok) => panic!("expected error code {}, got Ok({:?})", code, ok),
    }
}
