//! The kernel executive
//!
//! A single owning container passed by reference through every
//! operation: process table, channel registry, blob table, kv store,
//! timer wheel, cursor table, and the bridges out of the deterministic
//! core. There are no ambient singletons; constructing a second kernel
//! gives a second, fully independent universe.
//!
//! The weave driver lives here: ingress, serial pipeline execution
//! under the resource watch, then a two-phase commit (validate all
//! results, then persist) or a full discard that leaves every durable
//! structure bit-identical to its pre-weave state.

use std::collections::HashMap;

use abi::{WeaveArgs, WAKE_INIT};
use capability::{CapabilityGrant, CapabilitySet};
use core_types::{
    ComputeUnits, ExecutionContext, KernelError, MemoryBytes, PoolingMode, ProcessId, TimeDelta,
    Topic, VirtualTime, WeaveVerdict,
};
use engine::{EntryPoint, ExecutionEngine, ModuleDigest};
use value::Value;

use crate::blob::BlobTable;
use crate::bridge::{HardwareBridge, HostIoBridge, NullHardwareBridge, NullIoBridge};
use crate::channel::{ChannelMessage, ChannelRegistry};
use crate::event::{EventMeta, EventRecord};
use crate::kv::KvStore;
use crate::module::{bootstrap_module, derive_seed, map_engine_error, WEAVE_ARGS_USER_DATA_OFFSET};
use crate::process::{InboundEvent, ModuleSlot, Process, ProcessState, ReservedPool};
use crate::router::{wake_bits_for, RouterAuditLog, TOPIC_TIME_FIRE};
use crate::scheduler::{CycleEvent, Scheduler};
use crate::spawn::{BindingRole, SpawnCapabilities, SpawnRequest};
use crate::staging::{StagedOrigin, StagingArea};
use crate::supervisor::{SupervisorAuditLog, SupervisorEvent};
use crate::telemetry::{TelemetrySink, TracingSink};
use crate::timeline::{CursorTable, MutableLog, Prunable, RetentionPolicy, Strict, Timeline};
use crate::timer::TimerWheel;
use crate::weave::{PendingSpawn, WeaveHost, WeaveJournal};

/// Retention policy selection for a process timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelinePolicy {
    Strict,
    Prunable,
    Mutable,
}

impl TimelinePolicy {
    fn build(self) -> Box<dyn RetentionPolicy> {
        match self {
            TimelinePolicy::Strict => Box::new(Strict),
            TimelinePolicy::Prunable => Box::new(Prunable),
            TimelinePolicy::Mutable => Box::new(MutableLog),
        }
    }
}

/// Result of one weave on one process.
#[derive(Debug, Clone, PartialEq)]
pub enum WeaveOutcome {
    /// All modules returned non-negative; tentative state persisted.
    Committed {
        /// Events appended to the timeline.
        events: usize,
        /// At least one module asked for immediate rescheduling.
        yielded: bool,
    },
    /// A module failed; every tentative mutation was unwound.
    Discarded { error: KernelError },
    /// The process had nothing to do.
    Skipped,
}

/// Point-in-time counters for host dashboards and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMetrics {
    pub process_count: usize,
    pub channel_count: usize,
    pub blob_count: usize,
    pub blob_bytes: u64,
    pub pending_inbound: usize,
    pub pending_timers: usize,
    pub virt_time: VirtualTime,
}

/// The kernel.
pub struct Kernel {
    engine: Box<dyn ExecutionEngine>,
    artifacts: HashMap<ModuleDigest, Vec<u8>>,
    processes: HashMap<u64, Process>,
    channels: ChannelRegistry,
    blobs: BlobTable,
    kv: KvStore,
    timers: TimerWheel,
    cursors: CursorTable,
    scheduler: Scheduler,
    telemetry: Box<dyn TelemetrySink>,
    io_bridge: Box<dyn HostIoBridge>,
    hw_bridge: Box<dyn HardwareBridge>,
    router_audit: RouterAuditLog,
    supervisor_audit: SupervisorAuditLog,
    timeline_policy: TimelinePolicy,
    staging_capacity: usize,
    clock: VirtualTime,
    wall_clock: u64,
    next_pid: u64,
    next_req: u64,
}

impl Kernel {
    pub fn new(engine: Box<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            artifacts: HashMap::new(),
            processes: HashMap::new(),
            channels: ChannelRegistry::new(),
            blobs: BlobTable::new(0),
            kv: KvStore::new(),
            timers: TimerWheel::new(),
            cursors: CursorTable::new(),
            scheduler: Scheduler::new(),
            telemetry: Box::new(TracingSink),
            io_bridge: Box::new(NullIoBridge),
            hw_bridge: Box::new(NullHardwareBridge),
            router_audit: RouterAuditLog::new(),
            supervisor_audit: SupervisorAuditLog::new(),
            timeline_policy: TimelinePolicy::Strict,
            staging_capacity: core_types::MIN_BUS_BYTES,
            clock: VirtualTime::ZERO,
            wall_clock: 0,
            next_pid: 1,
            next_req: 1,
        }
    }

    /// Sets the DMA pool budget; only meaningful before any allocation.
    pub fn with_dma_pool(mut self, bytes: u64) -> Self {
        self.blobs = BlobTable::new(bytes);
        self
    }

    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_io_bridge(mut self, bridge: Box<dyn HostIoBridge>) -> Self {
        self.io_bridge = bridge;
        self
    }

    pub fn with_hardware_bridge(mut self, bridge: Box<dyn HardwareBridge>) -> Self {
        self.hw_bridge = bridge;
        self
    }

    /// Retention policy applied to timelines of subsequently spawned
    /// processes.
    pub fn with_timeline_policy(mut self, policy: TimelinePolicy) -> Self {
        self.timeline_policy = policy;
        self
    }

    pub fn with_staging_capacity(mut self, bytes: usize) -> Self {
        self.staging_capacity = bytes;
        self
    }

    /// Registers a module artifact; returns its content digest.
    pub fn register_artifact(&mut self, bytes: Vec<u8>) -> ModuleDigest {
        let digest = ModuleDigest::of(&bytes);
        self.artifacts.insert(digest, bytes);
        digest
    }

    pub fn now(&self) -> VirtualTime {
        self.clock
    }

    /// Sets the informational wall-clock stamp used in event headers.
    pub fn set_wall_clock(&mut self, wall_ts: u64) {
        self.wall_clock = wall_ts;
    }

    /// Advances virtual time and fires due timers into inbound queues.
    pub fn advance_time(&mut self, delta: TimeDelta) {
        self.clock = self.clock + delta;
        let fired = self.timers.due(self.clock);
        for timer in fired {
            let payload = Value::Map(vec![
                ("target".to_string(), Value::U64(timer.target.as_nanos())),
                ("skew".to_string(), Value::U64(timer.skew.as_nanos())),
            ]);
            let topic = Topic::new(TOPIC_TIME_FIRE).expect("constant topic");
            let mut meta = EventMeta::at(self.clock);
            meta.wall_ts = self.wall_clock;
            if let Ok(record) = EventRecord::from_value(topic, &payload, meta) {
                self.deliver(timer.pid, record);
            }
        }
    }

    /// Injects a host-originated inbound event (ingress path for fs,
    /// http, env, lifecycle replies).
    pub fn inject_event(&mut self, pid: ProcessId, record: EventRecord) -> Result<(), KernelError> {
        if !self.processes.contains_key(&pid.as_u64()) {
            return Err(KernelError::NotFound(format!("no process {}", pid)));
        }
        self.deliver(pid, record);
        Ok(())
    }

    fn deliver(&mut self, pid: ProcessId, record: EventRecord) {
        if let Some(proc) = self.processes.get_mut(&pid.as_u64()) {
            let wake = wake_bits_for(record.topic.as_str());
            proc.inbound.push_back(InboundEvent { record, wake });
        }
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Spawns a process from a host-side request.
    pub fn spawn_process(
        &mut self,
        parent: Option<ProcessId>,
        request: SpawnRequest,
    ) -> Result<ProcessId, KernelError> {
        let pid = ProcessId::from_raw(self.next_pid);
        self.next_pid += 1;
        match self.spawn_with_pid(parent, request, pid) {
            Ok(()) => Ok(pid),
            Err(err) => {
                self.supervisor_audit.record(SupervisorEvent::SpawnRejected {
                    parent,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn resolve_capabilities(
        &self,
        parent: Option<ProcessId>,
        request: &SpawnRequest,
    ) -> Result<CapabilitySet, KernelError> {
        let parent_caps = match parent {
            Some(pid) => Some(
                &self
                    .processes
                    .get(&pid.as_u64())
                    .ok_or_else(|| KernelError::NotFound(format!("no parent {}", pid)))?
                    .capabilities,
            ),
            None => None,
        };
        match &request.capabilities {
            SpawnCapabilities::Explicit(set) => {
                if let Some(parent_caps) = parent_caps {
                    if !request.escalation && !set.is_subset_of(parent_caps) {
                        return Err(KernelError::Permission(
                            "child capabilities exceed parent's".to_string(),
                        ));
                    }
                }
                Ok(set.clone())
            }
            SpawnCapabilities::Inherit(urns) => {
                let parent_caps = parent_caps.ok_or_else(|| {
                    KernelError::Invalid("root spawn cannot inherit capabilities".to_string())
                })?;
                let mut grants: Vec<CapabilityGrant> = Vec::with_capacity(urns.len());
                for urn in urns {
                    let grant = parent_caps
                        .grants()
                        .iter()
                        .find(|g| g.urn == *urn)
                        .ok_or_else(|| {
                            KernelError::Permission(format!("parent holds no grant {}", urn))
                        })?;
                    grants.push(grant.clone());
                }
                Ok(CapabilitySet::new(grants))
            }
        }
    }

    fn spawn_with_pid(
        &mut self,
        parent: Option<ProcessId>,
        request: SpawnRequest,
        pid: ProcessId,
    ) -> Result<(), KernelError> {
        let capabilities = self.resolve_capabilities(parent, &request)?;
        for spec in &request.modules {
            capabilities.check_affinity(spec.pooling)?;
        }
        if request.modules.is_empty() {
            return Err(KernelError::Invalid("pipeline needs at least one module".to_string()));
        }

        // Child memory comes out of the parent's budget.
        if let Some(parent_pid) = parent {
            let limits = request.limits;
            let parent_proc = self
                .processes
                .get_mut(&parent_pid.as_u64())
                .ok_or_else(|| KernelError::NotFound(format!("no parent {}", parent_pid)))?;
            parent_proc.usage.charge_memory(limits.mem_max, &parent_proc.limits)?;
        }

        match self.spawn_inner(parent, &request, pid, capabilities) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(parent_pid) = parent {
                    if let Some(parent_proc) = self.processes.get_mut(&parent_pid.as_u64()) {
                        parent_proc.usage.credit_memory(request.limits.mem_max);
                    }
                }
                Err(err)
            }
        }
    }

    fn spawn_inner(
        &mut self,
        parent: Option<ProcessId>,
        request: &SpawnRequest,
        pid: ProcessId,
        capabilities: CapabilitySet,
    ) -> Result<(), KernelError> {
        let mut usage = core_types::ResourceUsage::new();
        let mut owned_channels = Vec::with_capacity(request.channels.len());

        let result = (|| -> Result<Vec<ModuleSlot>, KernelError> {
            for spec in &request.channels {
                usage.charge_memory(
                    MemoryBytes((spec.capacity as u64) * (spec.msg_size as u64)),
                    &request.limits,
                )?;
                let channel = self.channels.create(
                    pid,
                    &spec.schema_uri,
                    spec.capacity,
                    spec.msg_size,
                    spec.direction,
                    spec.root_type,
                )?;
                owned_channels.push(channel.id);
            }

            // Producer and consumer must agree byte-for-byte on schema
            // and on the declared root value type.
            for binding in &request.bindings {
                let channel = self.channels.find_uri(&binding.channel_uri).ok_or_else(|| {
                    KernelError::NotFound(format!("bound channel {} missing", binding.channel_uri))
                })?;
                if channel.schema_uri != binding.schema_uri {
                    return Err(KernelError::Type(format!(
                        "schema mismatch on {}: '{}' vs '{}'",
                        binding.channel_uri, binding.schema_uri, channel.schema_uri
                    )));
                }
                if channel.root_type != binding.root_type {
                    return Err(KernelError::Type(format!(
                        "root type mismatch on {}",
                        binding.channel_uri
                    )));
                }
            }

            usage.charge_memory(MemoryBytes(request.system_pool_bytes), &request.limits)?;

            let mut slots = Vec::with_capacity(request.modules.len());
            for spec in &request.modules {
                let artifact = self
                    .artifacts
                    .get(&spec.digest)
                    .ok_or_else(|| {
                        KernelError::NotFound(format!("no artifact for digest {}", spec.digest))
                    })?
                    .clone();
                // Init cost is metered against the parent's compute
                // budget; a root spawn meters against the child's own.
                let fuel = match parent {
                    Some(parent_pid) => {
                        let parent_proc = self
                            .processes
                            .get(&parent_pid.as_u64())
                            .ok_or_else(|| KernelError::NotFound("parent vanished".to_string()))?;
                        parent_proc
                            .limits
                            .compute_max
                            .saturating_sub(parent_proc.usage.compute_used)
                            .0
                    }
                    None => request.limits.compute_max.0,
                };
                let booted = bootstrap_module(
                    self.engine.as_mut(),
                    &artifact,
                    spec,
                    request.limits.mem_max.0,
                    fuel,
                )?;
                usage.charge_memory(MemoryBytes(booted.info.mem_required), &request.limits)?;
                if let Some(parent_pid) = parent {
                    let parent_proc = self
                        .processes
                        .get_mut(&parent_pid.as_u64())
                        .ok_or_else(|| KernelError::NotFound("parent vanished".to_string()))?;
                    let parent_limits = parent_proc.limits;
                    parent_proc
                        .usage
                        .charge_compute(ComputeUnits(booted.fuel_used), &parent_limits)?;
                }
                slots.push(ModuleSlot {
                    alias: spec.alias.clone(),
                    digest: spec.digest,
                    context: spec.context,
                    pooling: spec.pooling,
                    instance: booted.instance,
                    user_data: 0,
                    mem_required: booted.info.mem_required,
                });
            }
            Ok(slots)
        })();

        let modules = match result {
            Ok(slots) => slots,
            Err(err) => {
                for id in owned_channels {
                    if let Some(channel) = self.channels.remove(id) {
                        channel.destroy();
                    }
                }
                return Err(err);
            }
        };

        let process = Process {
            id: pid,
            parent,
            modules,
            bindings: request.bindings.clone(),
            limits: request.limits,
            usage,
            capabilities,
            timeline: Timeline::new(self.timeline_policy.build()),
            staging: StagingArea::new(self.staging_capacity),
            owned_channels,
            children: Vec::new(),
            inbound: std::collections::VecDeque::new(),
            policy: request.policy,
            state: ProcessState::Ready,
            system_pool: ReservedPool::new(request.system_pool_bytes),
            base_seed: request.base_seed,
            weave_count: 0,
            last_weave_at: self.clock,
            fault_reason: None,
        };
        self.processes.insert(pid.as_u64(), process);
        if let Some(parent_pid) = parent {
            if let Some(parent_proc) = self.processes.get_mut(&parent_pid.as_u64()) {
                parent_proc.children.push(pid);
            }
        }
        self.scheduler.register(pid, request.policy);
        self.supervisor_audit.record(SupervisorEvent::Spawned { pid, parent });
        Ok(())
    }

    /// Terminates a process and, post-order, all of its descendants.
    pub fn terminate_process(&mut self, pid: ProcessId) -> Result<(), KernelError> {
        if !self.processes.contains_key(&pid.as_u64()) {
            return Err(KernelError::NotFound(format!("no process {}", pid)));
        }
        self.terminate_inner(pid, false);
        Ok(())
    }

    fn terminate_inner(&mut self, pid: ProcessId, cascade: bool) {
        let children = match self.processes.get(&pid.as_u64()) {
            Some(proc) => proc.children.clone(),
            None => return,
        };
        for child in children {
            self.terminate_inner(child, true);
        }

        let proc = match self.processes.remove(&pid.as_u64()) {
            Some(proc) => proc,
            None => return,
        };

        for channel_id in &proc.owned_channels {
            if let Some(channel) = self.channels.remove(*channel_id) {
                let drained = channel.destroy();
                for message in drained {
                    let credits = self.blobs.channel_release(&message.blob_refs);
                    self.apply_blob_credits(credits);
                }
            }
        }

        self.blobs.release_process(pid);
        self.timers.cancel_for_process(pid);
        self.cursors.remove_for_process(pid);
        self.io_bridge.cancel(pid);
        self.scheduler.unregister(pid);

        if let Some(parent_pid) = proc.parent {
            if let Some(parent_proc) = self.processes.get_mut(&parent_pid.as_u64()) {
                parent_proc.usage.credit_memory(proc.limits.mem_max);
                parent_proc.children.retain(|c| *c != pid);
            }
        }

        self.supervisor_audit.record(SupervisorEvent::Terminated { pid, cascade });
    }

    fn apply_blob_credits(&mut self, credits: Vec<(ProcessId, u64)>) {
        for (owner, bytes) in credits {
            if let Some(owner_proc) = self.processes.get_mut(&owner.as_u64()) {
                owner_proc.usage.credit_memory(MemoryBytes(bytes));
            }
        }
    }

    /// True when `target` is `requester` itself or inside its subtree.
    fn within_subtree(&self, requester: ProcessId, target: ProcessId) -> bool {
        if requester == target {
            return true;
        }
        let mut cursor = self.processes.get(&target.as_u64()).and_then(|p| p.parent);
        while let Some(ancestor) = cursor {
            if ancestor == requester {
                return true;
            }
            cursor = self.processes.get(&ancestor.as_u64()).and_then(|p| p.parent);
        }
        false
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Runs one global-barrier cycle over every `Shared` process.
    pub fn run_cycle(&mut self) -> Vec<(ProcessId, WeaveOutcome)> {
        let order = self.scheduler.shared_order();
        let mut outcomes = Vec::with_capacity(order.len());
        for pid in order {
            let outcome = self.step_process(pid).unwrap_or_else(|error| WeaveOutcome::Discarded { error });
            outcomes.push((pid, outcome));
        }
        outcomes
    }

    /// Runs cycles until every shared process parks (or faults), up to
    /// `max_cycles`.
    pub fn run_until_parked(&mut self, max_cycles: usize) {
        for _ in 0..max_cycles {
            let outcomes = self.run_cycle();
            let busy = outcomes.iter().any(|(_, o)| !matches!(o, WeaveOutcome::Skipped));
            if !busy {
                break;
            }
        }
    }

    /// Runs one weave on one process (dedicated workers and tests).
    pub fn step_process(&mut self, pid: ProcessId) -> Result<WeaveOutcome, KernelError> {
        let proc = self
            .processes
            .get(&pid.as_u64())
            .ok_or_else(|| KernelError::NotFound(format!("no process {}", pid)))?;
        if !proc.runnable() {
            self.scheduler.record(CycleEvent::WeaveSkipped { pid });
            return Ok(WeaveOutcome::Skipped);
        }
        let outcome = self.run_weave(pid);
        match &outcome {
            WeaveOutcome::Committed { events, .. } => {
                self.scheduler.record(CycleEvent::WeaveCommitted { pid, events: *events });
            }
            WeaveOutcome::Discarded { error } => {
                self.scheduler.record(CycleEvent::WeaveDiscarded { pid, code: error.code() });
            }
            WeaveOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    // ========================================================================
    // The weave driver
    // ========================================================================

    fn run_weave(&mut self, pid: ProcessId) -> WeaveOutcome {
        self.scheduler.record(CycleEvent::WeaveStarted { pid });

        let mut journal = WeaveJournal::new();
        let mut failure: Option<KernelError> = None;
        let mut yielded = false;

        let (spawns, terminations, outcome) = {
            let Kernel {
                processes,
                engine,
                channels,
                blobs,
                kv,
                timers,
                cursors,
                telemetry,
                io_bridge,
                hw_bridge,
                router_audit,
                supervisor_audit,
                clock,
                wall_clock,
                next_pid,
                next_req,
                ..
            } = self;
            let proc = processes.get_mut(&pid.as_u64()).expect("existence checked");

            // --- Phase 1: ingress -------------------------------------------
            proc.staging.reset();
            proc.usage.reset_weave();
            let mut wake: u64 = if proc.weave_count == 0 { WAKE_INIT } else { 0 };

            while let Some(event) = proc.inbound.pop_front() {
                wake |= event.wake;
                if let Err(err) = proc.staging.append(StagedOrigin::Inbound, event.record.clone()) {
                    journal.inbound_consumed.push(event);
                    failure = Some(err);
                    break;
                }
                journal.inbound_consumed.push(event);
            }

            if failure.is_none() {
                let bindings = proc.bindings.clone();
                'bindings: for binding in bindings.iter().filter(|b| b.role == BindingRole::Consume) {
                    let channel = match channels.find_uri(&binding.channel_uri) {
                        Some(channel) => channel,
                        None => continue,
                    };
                    loop {
                        let message = match channel.try_pop() {
                            Ok(Some(message)) => message,
                            Ok(None) => break,
                            Err(_) => break,
                        };
                        blobs.channel_dequeue(pid, &message.blob_refs);
                        let record = match abi::decode_event(&message.frame)
                            .map_err(KernelError::from)
                            .and_then(|frame| EventRecord::from_frame(&frame))
                        {
                            Ok(mut record) => {
                                record.topic = binding.topic.clone();
                                record
                            }
                            Err(err) => {
                                journal.consumed.push((channel.id, message));
                                failure = Some(err);
                                break 'bindings;
                            }
                        };
                        wake |= abi::WAKE_IO;
                        if let Err(err) = proc.staging.append(StagedOrigin::Inbound, record) {
                            journal.consumed.push((channel.id, message));
                            failure = Some(err);
                            break 'bindings;
                        }
                        journal.consumed.push((channel.id, message));
                    }
                }
            }

            // --- Phase 2 + 3: execute under the resource watch --------------
            if failure.is_none() {
                let bound_uris: Vec<String> =
                    proc.bindings.iter().map(|b| b.channel_uri.clone()).collect();
                let tick_counter = proc.weave_count + 1;
                let delta = if proc.weave_count == 0 {
                    0
                } else {
                    clock.delta_since(proc.last_weave_at).as_nanos()
                };

                for index in 0..proc.modules.len() {
                    let (instance, context, pooling, user_data_in) = {
                        let slot = &proc.modules[index];
                        let user_data =
                            if slot.pooling == PoolingMode::Stateless { 0 } else { slot.user_data };
                        (slot.instance, slot.context, slot.pooling, user_data)
                    };

                    // Logic memory resets every weave; Stateless bodies
                    // restore the post-init snapshot.
                    if context == ExecutionContext::Logic || pooling == PoolingMode::Stateless {
                        if let Err(err) = engine.reset_memory(instance) {
                            failure = Some(map_engine_error(err));
                            break;
                        }
                    }

                    let remaining_fuel = proc
                        .limits
                        .compute_max
                        .saturating_sub(proc.usage.compute_used)
                        .0;
                    if let Err(err) = engine.set_fuel(instance, remaining_fuel) {
                        failure = Some(map_engine_error(err));
                        break;
                    }

                    let args = WeaveArgs {
                        ctx: (pid.as_u64() << 8) | index as u64,
                        time_budget_nanos: proc.limits.time_budget.as_nanos(),
                        compute_used: proc.usage.compute_used.0,
                        compute_max: proc.limits.compute_max.0,
                        mem_max: proc.limits.mem_max.0,
                        rand_seed: derive_seed(proc.base_seed, tick_counter, index as u64),
                        virt_time: clock.as_nanos(),
                        trace: abi::AbiTraceContext::default(),
                        delta_nanos: delta,
                        tick: tick_counter,
                        wake_flags: wake,
                        user_data: user_data_in,
                    };
                    let mut block = Vec::with_capacity(abi::WEAVE_ARGS_SIZE);
                    args.encode(&mut block);
                    if let Err(err) = engine.write_memory(instance, engine::WEAVE_ARGS_REGION, &block)
                    {
                        failure = Some(map_engine_error(err));
                        break;
                    }

                    let mut host = WeaveHost {
                        pid,
                        context,
                        virt_time: *clock,
                        wall_ts: *wall_clock,
                        caps: &proc.capabilities,
                        limits: proc.limits,
                        staging: &mut proc.staging,
                        journal: &mut journal,
                        blobs: &mut *blobs,
                        channels: &mut *channels,
                        cursors: &mut *cursors,
                        timeline: &proc.timeline,
                        kv: &*kv,
                        usage: &mut proc.usage,
                        system_pool: &mut proc.system_pool,
                        owned_channels: &proc.owned_channels,
                        bound_uris: &bound_uris,
                        audit: &mut *router_audit,
                        next_pid: &mut *next_pid,
                        next_req: &mut *next_req,
                        high_water: 0,
                        abort: None,
                    };
                    let call_result =
                        engine.call(instance, EntryPoint::Weave, args.ctx, engine::WEAVE_ARGS_REGION, &mut host);
                    let high_water = host.high_water;
                    let abort = host.abort.take();
                    drop(host);

                    // Resource watch: charge consumed fuel against the
                    // compute budget before interpreting the result.
                    match engine.fuel_used(instance) {
                        Ok(fuel) => {
                            let limits = proc.limits;
                            if let Err(err) =
                                proc.usage.charge_compute(ComputeUnits(fuel), &limits)
                            {
                                failure = Some(err);
                                break;
                            }
                        }
                        Err(err) => {
                            failure = Some(map_engine_error(err));
                            break;
                        }
                    }

                    let status = match call_result {
                        Ok(status) => status,
                        Err(err) => {
                            failure = Some(map_engine_error(err));
                            break;
                        }
                    };
                    if let Some(err) = abort {
                        failure = Some(err);
                        break;
                    }
                    if journal.panic.is_some() {
                        break;
                    }

                    match WeaveVerdict::from_raw(status) {
                        WeaveVerdict::Abort(err) => {
                            failure = Some(err);
                            break;
                        }
                        WeaveVerdict::Yield => yielded = true,
                        WeaveVerdict::Park => {
                            // Unread inputs upgrade a park to a yield.
                            if high_water < proc.staging.inputs_end() {
                                yielded = true;
                            }
                        }
                    }

                    if pooling == PoolingMode::Stateful {
                        match engine.read_memory(
                            instance,
                            engine::WEAVE_ARGS_REGION + WEAVE_ARGS_USER_DATA_OFFSET,
                            8,
                        ) {
                            Ok(raw) => {
                                let mut bytes = [0u8; 8];
                                bytes.copy_from_slice(&raw);
                                proc.modules[index].user_data = u64::from_le_bytes(bytes);
                            }
                            Err(err) => {
                                failure = Some(map_engine_error(err));
                                break;
                            }
                        }
                    }
                }
            }

            // --- Phase 4 or 5: commit or discard ----------------------------
            let panicked = journal.panic.clone();
            if failure.is_none() && panicked.is_none() {
                // Validate first: every pending publish (direct writes
                // plus bound forwards) must fit its ring.
                let mut forwards = Vec::new();
                for record in proc.staging.outputs() {
                    for binding in
                        proc.bindings.iter().filter(|b| b.role == BindingRole::Produce)
                    {
                        if binding.topic != record.topic {
                            continue;
                        }
                        match channels.find_uri(&binding.channel_uri) {
                            Some(channel) => {
                                if record.payload.len() > channel.msg_size {
                                    failure = Some(KernelError::Invalid(format!(
                                        "bound payload exceeds slot size on {}",
                                        channel.uri
                                    )));
                                } else {
                                    let mut frame = Vec::with_capacity(record.frame_len());
                                    record.encode_frame(0, &mut frame);
                                    forwards.push((
                                        channel.id,
                                        ChannelMessage {
                                            frame,
                                            blob_refs: record.blob_refs.clone(),
                                        },
                                    ));
                                }
                            }
                            None => {
                                failure = Some(KernelError::Io(format!(
                                    "bound channel {} vanished",
                                    binding.channel_uri
                                )));
                            }
                        }
                        if failure.is_some() {
                            break;
                        }
                    }
                    if failure.is_some() {
                        break;
                    }
                }

                if failure.is_none() {
                    let mut demand: HashMap<u64, usize> = HashMap::new();
                    for publish in &journal.publishes {
                        *demand.entry(publish.channel.as_u64()).or_default() += 1;
                    }
                    for (channel_id, _) in &forwards {
                        *demand.entry(channel_id.as_u64()).or_default() += 1;
                    }
                    for (channel_id, count) in &demand {
                        match channels.get(core_types::ChannelId::from_raw(*channel_id)) {
                            Some(channel) => {
                                if let Err(err) = channel.can_accept(*count) {
                                    failure = Some(err);
                                    break;
                                }
                            }
                            None => {
                                failure = Some(KernelError::Io("channel vanished".to_string()));
                                break;
                            }
                        }
                    }
                }

                if failure.is_none() {
                    // Persist: assign ticks, append, publish, apply
                    // journals, flush side effects.
                    let outputs: Vec<EventRecord> = proc.staging.outputs().cloned().collect();
                    let committed = outputs.len();
                    for record in outputs {
                        for blob in &record.blob_refs {
                            blobs.mark_committed(*blob);
                        }
                        proc.timeline.append(record);
                    }

                    for publish in journal.publishes.drain(..) {
                        if let Some(channel) = channels.get(publish.channel) {
                            blobs.channel_enqueue(&publish.message.blob_refs);
                            let _ = channel.try_push(publish.message, 0);
                        }
                    }
                    for (channel_id, message) in forwards {
                        if let Some(channel) = channels.get(channel_id) {
                            blobs.channel_enqueue(&message.blob_refs);
                            let _ = channel.try_push(message, 0);
                        }
                    }

                    kv.apply(std::mem::take(&mut journal.kv));

                    for id in &journal.retains {
                        let _ = blobs.apply_retain(*id);
                    }
                    for alloc in &journal.allocated {
                        let drop_it = blobs
                            .get(alloc.id)
                            .map(|e| !e.retained && !e.committed)
                            .unwrap_or(false);
                        if drop_it {
                            blobs.free(alloc.id);
                            if alloc.from_system_pool {
                                proc.system_pool.give_back(alloc.billed);
                            } else {
                                proc.usage.credit_memory(MemoryBytes(alloc.billed));
                            }
                        }
                    }

                    for target in journal.timer_targets.drain(..) {
                        timers.set(pid, target);
                    }
                    for log in journal.logs.drain(..) {
                        telemetry.emit(&log);
                    }
                    for request in journal.io_requests.drain(..) {
                        io_bridge.dispatch(request);
                    }
                    for command in journal.hw_commands.drain(..) {
                        hw_bridge.flush(command);
                    }

                    proc.owned_channels.extend(journal.channels_created.drain(..));
                    proc.state = if yielded { ProcessState::Ready } else { ProcessState::Parked };
                    proc.weave_count += 1;
                    proc.last_weave_at = *clock;

                    let spawns = std::mem::take(&mut journal.spawns);
                    let terminations = std::mem::take(&mut journal.terminations);
                    (
                        spawns,
                        terminations,
                        WeaveOutcome::Committed { events: committed, yielded },
                    )
                } else {
                    let error = failure.clone().expect("validation failure recorded");
                    discard(proc, channels, blobs, cursors, &mut journal, supervisor_audit, panicked);
                    (Vec::new(), Vec::new(), WeaveOutcome::Discarded { error })
                }
            } else {
                let error = failure.clone().unwrap_or_else(|| {
                    KernelError::Invalid(format!(
                        "module panic: {}",
                        panicked.clone().unwrap_or_default()
                    ))
                });
                discard(proc, channels, blobs, cursors, &mut journal, supervisor_audit, panicked);
                (Vec::new(), Vec::new(), WeaveOutcome::Discarded { error })
            }
        };

        // Pending spawns and terminations apply after the borrow of the
        // weaving process ends. A termination of a pid spawned in this
        // same weave simply drops the pending spawn record.
        let doomed: Vec<ProcessId> = terminations.iter().map(|(_, target)| *target).collect();
        for spawn in spawns {
            if doomed.contains(&spawn.pid) {
                self.supervisor_audit.record(SupervisorEvent::SpawnDropped { pid: spawn.pid });
                continue;
            }
            let PendingSpawn { pid: child_pid, request, requested_by } = spawn;
            if let Err(err) = self.spawn_with_pid(Some(requested_by), request, child_pid) {
                self.supervisor_audit.record(SupervisorEvent::SpawnRejected {
                    parent: Some(requested_by),
                    reason: err.to_string(),
                });
            }
        }
        for (requester, target) in terminations {
            if !self.processes.contains_key(&target.as_u64()) {
                continue;
            }
            if self.within_subtree(requester, target) {
                self.terminate_inner(target, false);
            } else {
                self.supervisor_audit.record(SupervisorEvent::TerminationRejected {
                    requester,
                    target,
                    reason: "target outside requester subtree".to_string(),
                });
            }
        }

        outcome
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid.as_u64())
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn blobs(&self) -> &BlobTable {
        &self.blobs
    }

    pub fn find_channel(&self, uri: &str) -> Option<std::sync::Arc<crate::channel::Channel>> {
        self.channels.find_uri(uri)
    }

    pub fn channel_uri(&self, pid: ProcessId, index: usize) -> Option<String> {
        let proc = self.processes.get(&pid.as_u64())?;
        let id = proc.owned_channels.get(index)?;
        self.channels.get(*id).map(|c| c.uri.clone())
    }

    pub fn router_audit(&self) -> &RouterAuditLog {
        &self.router_audit
    }

    pub fn supervisor_audit(&self) -> &SupervisorAuditLog {
        &self.supervisor_audit
    }

    pub fn cycle_audit(&self) -> &[CycleEvent] {
        self.scheduler.audit()
    }

    /// Prunes a process timeline (policy permitting).
    pub fn prune_timeline(&mut self, pid: ProcessId, upto: core_types::Tick) -> Result<(), KernelError> {
        let proc = self
            .processes
            .get_mut(&pid.as_u64())
            .ok_or_else(|| KernelError::NotFound(format!("no process {}", pid)))?;
        proc.timeline.prune(upto)
    }

    /// Redacts one committed event (policy permitting).
    pub fn redact_event(&mut self, pid: ProcessId, tick: core_types::Tick) -> Result<(), KernelError> {
        let proc = self
            .processes
            .get_mut(&pid.as_u64())
            .ok_or_else(|| KernelError::NotFound(format!("no process {}", pid)))?;
        proc.timeline.redact(tick)
    }

    pub fn metrics(&self) -> KernelMetrics {
        KernelMetrics {
            process_count: self.processes.len(),
            channel_count: self.channels.count(),
            blob_count: self.blobs.count(),
            blob_bytes: self.blobs.total_bytes(),
            pending_inbound: self.processes.values().map(|p| p.inbound.len()).sum(),
            pending_timers: self.timers.pending_count(),
            virt_time: self.clock,
        }
    }
}

/// Unwinds every tentative mutation of a discarded weave.
#[allow(clippy::too_many_arguments)]
fn discard(
    proc: &mut Process,
    channels: &mut ChannelRegistry,
    blobs: &mut BlobTable,
    cursors: &mut CursorTable,
    journal: &mut WeaveJournal,
    supervisor_audit: &mut SupervisorAuditLog,
    panicked: Option<String>,
) {
    // Consumed channel messages go back to the ring front in their
    // original order.
    let mut per_channel: Vec<(core_types::ChannelId, Vec<ChannelMessage>)> = Vec::new();
    for (channel_id, message) in journal.consumed.drain(..) {
        match per_channel.iter_mut().find(|(id, _)| *id == channel_id) {
            Some((_, messages)) => messages.push(message),
            None => per_channel.push((channel_id, vec![message])),
        }
    }
    for (channel_id, messages) in per_channel {
        if let Some(channel) = channels.get(channel_id) {
            channel.restore_front(messages);
        }
    }

    for event in journal.inbound_consumed.drain(..).rev() {
        proc.inbound.push_front(event);
    }

    for alloc in journal.allocated.drain(..) {
        blobs.free(alloc.id);
        if alloc.from_system_pool {
            proc.system_pool.give_back(alloc.billed);
        } else {
            proc.usage.credit_memory(MemoryBytes(alloc.billed));
        }
    }

    for channel_id in journal.channels_created.drain(..) {
        if let Some(channel) = channels.remove(channel_id) {
            proc.usage.credit_memory(MemoryBytes(channel.billed_bytes()));
            channel.destroy();
        }
    }

    cursors.remove_batch(&journal.cursors_opened);
    proc.staging.reset();

    match panicked {
        Some(reason) => {
            proc.state = ProcessState::Faulted;
            proc.fault_reason = Some(reason.clone());
            supervisor_audit.record(SupervisorEvent::Faulted { pid: proc.id, reason });
        }
        None => {
            proc.state = ProcessState::Parked;
        }
    }
}
