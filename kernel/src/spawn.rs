//! Process spawn requests
//!
//! `SpawnRequest` is the kernel-native description of a child process.
//! Hosts build it from a manifest; modules build it on the wire as a
//! `ProcessSpawnArgs` block. The wire form carries capability URNs by
//! reference: the child inherits the parent's grant for each named URN,
//! which makes the subset rule hold by construction on that path.

use abi::{
    AbiArray, AbiResourceLimits, AbiString, ByteReader, ChannelDefinition, ChannelDirection,
    ModuleDefinition, ProcessSpawnArgs, ValueTag, MODULE_DEFINITION_SIZE,
    PROCESS_SPAWN_ARGS_SIZE,
};
use capability::{CapabilitySet, CapabilityUrn};
use core_types::{
    ExecutionContext, KernelError, ModuleAlias, PoolingMode, ResourceLimits, SchedulingPolicy,
    Topic,
};
use engine::ModuleDigest;

/// One pipeline module in a spawn request.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub alias: ModuleAlias,
    pub digest: ModuleDigest,
    pub context: ExecutionContext,
    pub pooling: PoolingMode,
    /// Config payload copied into the module's reserved region at init.
    pub init_args: Vec<u8>,
}

/// One channel the child will own.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub schema_uri: String,
    pub capacity: u32,
    pub msg_size: u32,
    pub direction: ChannelDirection,
    pub root_type: ValueTag,
}

/// Which side of a bound channel this process takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    /// Ingress pulls channel events into staging under the topic.
    Consume,
    /// Commit forwards staged outputs on the topic into the channel.
    Produce,
}

/// Binding of an internal static topic to an external channel URI.
///
/// The declared schema URI and root type must match the channel's
/// byte-exactly; the supervisor verifies this at spawn.
#[derive(Debug, Clone)]
pub struct Binding {
    pub topic: Topic,
    pub channel_uri: String,
    pub role: BindingRole,
    pub schema_uri: String,
    pub root_type: ValueTag,
}

/// How the child's capability set is established.
#[derive(Debug, Clone)]
pub enum SpawnCapabilities {
    /// Fully specified grants (host/manifest path). Verified to be a
    /// subset of the parent's unless escalation was granted.
    Explicit(CapabilitySet),
    /// Named URNs inherited verbatim from the parent (wire path).
    Inherit(Vec<CapabilityUrn>),
}

/// Complete description of a process to spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub modules: Vec<ModuleSpec>,
    pub channels: Vec<ChannelSpec>,
    pub capabilities: SpawnCapabilities,
    pub limits: ResourceLimits,
    pub policy: SchedulingPolicy,
    pub bindings: Vec<Binding>,
    /// Pre-reserved pool for System-context allocations.
    pub system_pool_bytes: u64,
    /// Base entropy seed; per-weave seeds derive from it.
    pub base_seed: u64,
    /// Host-granted permission to exceed the parent's capability set.
    pub escalation: bool,
}

impl SpawnRequest {
    /// Total ring bytes of the declared channels.
    pub fn channel_bytes(&self) -> u64 {
        self.channels.iter().map(|c| (c.capacity as u64) * (c.msg_size as u64)).sum()
    }
}

/// Encodes a spawn request as a self-contained `ProcessSpawnArgs` block.
///
/// Only the wire-representable parts are encoded: modules, channels,
/// capability URNs, limits, and policy.
pub fn encode_spawn_args(request: &SpawnRequest) -> Vec<u8> {
    let urns: Vec<&str> = match &request.capabilities {
        SpawnCapabilities::Explicit(set) => set.grants().iter().map(|g| g.urn.as_str()).collect(),
        SpawnCapabilities::Inherit(urns) => urns.iter().map(|u| u.as_str()).collect(),
    };

    // Fixed-size sections first, strings pooled at the tail.
    let modules_off = PROCESS_SPAWN_ARGS_SIZE as u64;
    let channels_off = modules_off + (request.modules.len() * MODULE_DEFINITION_SIZE) as u64;
    let caps_off =
        channels_off + (request.channels.len() * abi::CHANNEL_DEFINITION_SIZE) as u64;
    let limits_off = caps_off + (urns.len() * abi::ABI_STRING_SIZE) as u64;
    let mut string_off = limits_off + abi::ABI_RESOURCE_LIMITS_SIZE as u64;

    let mut pooled: Vec<String> = Vec::new();
    let mut string_view = |text: &str, pooled: &mut Vec<String>| -> AbiString {
        let view = AbiString { offset: string_off, len: text.len() as u64 };
        string_off += text.len() as u64;
        pooled.push(text.to_string());
        view
    };
    let module_aliases: Vec<AbiString> = request
        .modules
        .iter()
        .map(|m| string_view(m.alias.as_str(), &mut pooled))
        .collect();
    let channel_schemas: Vec<AbiString> = request
        .channels
        .iter()
        .map(|c| string_view(&c.schema_uri, &mut pooled))
        .collect();
    let cap_views: Vec<AbiString> = urns.iter().map(|u| string_view(u, &mut pooled)).collect();

    let mut out = Vec::new();
    ProcessSpawnArgs {
        modules: AbiArray { offset: modules_off, count: request.modules.len() as u64 },
        channels: AbiArray { offset: channels_off, count: request.channels.len() as u64 },
        capabilities: AbiArray { offset: caps_off, count: urns.len() as u64 },
        limits_offset: limits_off,
        policy: request.policy.as_u32(),
    }
    .encode(&mut out);

    for (module, alias) in request.modules.iter().zip(&module_aliases) {
        ModuleDefinition {
            alias: *alias,
            digest: *module.digest.as_bytes(),
            context: module.context.as_u32(),
            pooling: module.pooling.as_u32(),
            user_flags: 0,
        }
        .encode(&mut out);
    }
    for (channel, schema) in request.channels.iter().zip(&channel_schemas) {
        ChannelDefinition {
            schema_uri: *schema,
            capacity: channel.capacity,
            msg_size: channel.msg_size,
            direction: channel.direction.as_u32(),
            root_type: channel.root_type.as_u32(),
        }
        .encode(&mut out);
    }
    for view in &cap_views {
        view.encode(&mut out);
    }
    AbiResourceLimits::from_limits(&request.limits).encode(&mut out);
    for text in &pooled {
        out.extend_from_slice(text.as_bytes());
    }
    out
}

fn read_string(buf: &[u8], view: &AbiString) -> Result<String, KernelError> {
    let start = view.offset as usize;
    let end = start
        .checked_add(view.len as usize)
        .ok_or_else(|| KernelError::Invalid("string view overflows".to_string()))?;
    if end > buf.len() {
        return Err(KernelError::Invalid(format!(
            "string view {}..{} escapes args block of {} bytes",
            start,
            end,
            buf.len()
        )));
    }
    String::from_utf8(buf[start..end].to_vec())
        .map_err(|_| KernelError::Invalid("string view is not UTF-8".to_string()))
}

fn section<'a>(buf: &'a [u8], array: &AbiArray, entry_size: usize) -> Result<&'a [u8], KernelError> {
    let start = array.offset as usize;
    let len = (array.count as usize)
        .checked_mul(entry_size)
        .ok_or_else(|| KernelError::Invalid("array size overflows".to_string()))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| KernelError::Invalid("array view overflows".to_string()))?;
    if end > buf.len() {
        return Err(KernelError::Invalid(format!(
            "array {}..{} escapes args block of {} bytes",
            start,
            end,
            buf.len()
        )));
    }
    Ok(&buf[start..end])
}

/// Decodes a wire spawn-argument block.
///
/// Bindings, init args, and pools are host-side concepts and come back
/// empty; capabilities come back as inherited URN references.
pub fn decode_spawn_args(buf: &[u8]) -> Result<SpawnRequest, KernelError> {
    let args = ProcessSpawnArgs::decode(&mut ByteReader::new(buf))?;

    let mut modules = Vec::with_capacity(args.modules.count as usize);
    let module_bytes = section(buf, &args.modules, MODULE_DEFINITION_SIZE)?;
    let mut r = ByteReader::new(module_bytes);
    for _ in 0..args.modules.count {
        let def = ModuleDefinition::decode(&mut r)?;
        let alias = read_string(buf, &def.alias)?;
        if alias.is_empty() {
            return Err(KernelError::Invalid("module alias is empty".to_string()));
        }
        modules.push(ModuleSpec {
            alias: ModuleAlias::new(alias),
            digest: ModuleDigest::from_bytes(def.digest),
            context: ExecutionContext::from_u32(def.context)
                .ok_or_else(|| KernelError::Invalid(format!("bad context {}", def.context)))?,
            pooling: PoolingMode::from_u32(def.pooling)
                .ok_or_else(|| KernelError::Invalid(format!("bad pooling {}", def.pooling)))?,
            init_args: Vec::new(),
        });
    }

    let mut channels = Vec::with_capacity(args.channels.count as usize);
    let channel_bytes = section(buf, &args.channels, abi::CHANNEL_DEFINITION_SIZE)?;
    let mut r = ByteReader::new(channel_bytes);
    for _ in 0..args.channels.count {
        let def = ChannelDefinition::decode(&mut r)?;
        channels.push(ChannelSpec {
            schema_uri: read_string(buf, &def.schema_uri)?,
            capacity: def.capacity,
            msg_size: def.msg_size,
            direction: ChannelDirection::from_u32(def.direction)?,
            root_type: ValueTag::from_u32(def.root_type)?,
        });
    }

    let mut urns = Vec::with_capacity(args.capabilities.count as usize);
    let cap_bytes = section(buf, &args.capabilities, abi::ABI_STRING_SIZE)?;
    let mut r = ByteReader::new(cap_bytes);
    for _ in 0..args.capabilities.count {
        let view = AbiString::decode(&mut r)?;
        urns.push(CapabilityUrn::parse(read_string(buf, &view)?)?);
    }

    let limits_bytes = section(
        buf,
        &AbiArray { offset: args.limits_offset, count: 1 },
        abi::ABI_RESOURCE_LIMITS_SIZE,
    )?;
    let limits = AbiResourceLimits::decode(&mut ByteReader::new(limits_bytes))?.to_limits();

    Ok(SpawnRequest {
        modules,
        channels,
        capabilities: SpawnCapabilities::Inherit(urns),
        limits,
        policy: SchedulingPolicy::from_u32(args.policy)
            .ok_or_else(|| KernelError::Invalid(format!("bad policy {}", args.policy)))?,
        bindings: Vec::new(),
        system_pool_bytes: 0,
        base_seed: 0,
        escalation: false,
    })
}
