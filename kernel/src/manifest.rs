//! Typed process manifests
//!
//! Hosts describe processes in JSON. The schema is strict
//! (`deny_unknown_fields`) and every field maps losslessly onto the
//! spawn argument ABI; bindings, init payloads, pools, and seeds are
//! host-side extras the wire path does not carry.

use serde::Deserialize;

use abi::{ChannelDirection, ValueTag};
use capability::{Affinity, CapabilityGrant, CapabilitySet, CapabilityUrn, HostFn, TopicSet};
use core_types::{
    ComputeUnits, ExecutionContext, KernelError, MemoryBytes, ModuleAlias, PoolingMode,
    ResourceLimits, SchedulingPolicy, TimeDelta, Topic,
};
use engine::ModuleDigest;

use crate::spawn::{Binding, BindingRole, ChannelSpec, ModuleSpec, SpawnCapabilities, SpawnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestContext {
    Logic,
    System,
    Managed,
}

impl ManifestContext {
    fn to_context(self) -> ExecutionContext {
        match self {
            ManifestContext::Logic => ExecutionContext::Logic,
            ManifestContext::System => ExecutionContext::System,
            ManifestContext::Managed => ExecutionContext::Managed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestPooling {
    Stateful,
    Stateless,
}

impl ManifestPooling {
    fn to_pooling(self) -> PoolingMode {
        match self {
            ManifestPooling::Stateful => PoolingMode::Stateful,
            ManifestPooling::Stateless => PoolingMode::Stateless,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestPolicy {
    Shared,
    Dedicated,
}

impl Default for ManifestPolicy {
    fn default() -> Self {
        ManifestPolicy::Shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestDirection {
    Inbound,
    Outbound,
    Duplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestRootType {
    Unit,
    Bool,
    I64,
    U64,
    F64,
    String,
    Blob,
    Map,
    List,
    Bytes,
}

impl ManifestRootType {
    fn to_tag(self) -> ValueTag {
        match self {
            ManifestRootType::Unit => ValueTag::Unit,
            ManifestRootType::Bool => ValueTag::Bool,
            ManifestRootType::I64 => ValueTag::I64,
            ManifestRootType::U64 => ValueTag::U64,
            ManifestRootType::F64 => ValueTag::F64,
            ManifestRootType::String => ValueTag::String,
            ManifestRootType::Blob => ValueTag::BlobRef,
            ManifestRootType::Map => ValueTag::Map,
            ManifestRootType::List => ValueTag::List,
            ManifestRootType::Bytes => ValueTag::Bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestModule {
    alias: String,
    /// SHA-256 artifact digest, 64 hex chars.
    digest: String,
    context: ManifestContext,
    pooling: ManifestPooling,
    #[serde(default)]
    init_args_hex: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestChannel {
    schema_uri: String,
    capacity: u32,
    msg_size: u32,
    direction: ManifestDirection,
    root_type: ManifestRootType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestAffinity {
    Agnostic,
    Pinned,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestCapability {
    urn: String,
    #[serde(default = "default_affinity")]
    affinity: ManifestAffinity,
    #[serde(default)]
    host_fns: Vec<String>,
    #[serde(default)]
    inbound: Vec<String>,
    #[serde(default)]
    outbound: Vec<String>,
}

fn default_affinity() -> ManifestAffinity {
    ManifestAffinity::Agnostic
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestLimits {
    compute_max: u64,
    mem_max: u64,
    time_budget_ns: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestBinding {
    topic: String,
    channel_uri: String,
    role: ManifestBindingRole,
    schema_uri: String,
    root_type: ManifestRootType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManifestBindingRole {
    Consume,
    Produce,
}

/// A parsed process manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    modules: Vec<ManifestModule>,
    #[serde(default)]
    channels: Vec<ManifestChannel>,
    #[serde(default)]
    capabilities: Vec<ManifestCapability>,
    limits: ManifestLimits,
    #[serde(default)]
    policy: ManifestPolicy,
    #[serde(default)]
    bindings: Vec<ManifestBinding>,
    #[serde(default)]
    system_pool_bytes: u64,
    #[serde(default)]
    seed: u64,
}

impl Manifest {
    /// Parses a JSON manifest. Unknown fields are rejected: ambiguous
    /// manifests are a spawn-time error, not a runtime surprise.
    pub fn from_json(text: &str) -> Result<Self, KernelError> {
        serde_json::from_str(text)
            .map_err(|e| KernelError::Invalid(format!("manifest parse error: {}", e)))
    }

    /// Lowers the manifest into a spawn request.
    pub fn to_spawn_request(&self) -> Result<SpawnRequest, KernelError> {
        let mut modules = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            if module.alias.is_empty() {
                return Err(KernelError::Invalid("module alias is empty".to_string()));
            }
            modules.push(ModuleSpec {
                alias: ModuleAlias::new(module.alias.clone()),
                digest: parse_digest(&module.digest)?,
                context: module.context.to_context(),
                pooling: module.pooling.to_pooling(),
                init_args: parse_hex(&module.init_args_hex)?,
            });
        }

        let channels = self
            .channels
            .iter()
            .map(|c| ChannelSpec {
                schema_uri: c.schema_uri.clone(),
                capacity: c.capacity,
                msg_size: c.msg_size,
                direction: match c.direction {
                    ManifestDirection::Inbound => ChannelDirection::Inbound,
                    ManifestDirection::Outbound => ChannelDirection::Outbound,
                    ManifestDirection::Duplex => ChannelDirection::Duplex,
                },
                root_type: c.root_type.to_tag(),
            })
            .collect();

        let mut grants = Vec::with_capacity(self.capabilities.len());
        for cap in &self.capabilities {
            let mut grant = CapabilityGrant::new(
                CapabilityUrn::parse(cap.urn.clone())?,
                match cap.affinity {
                    ManifestAffinity::Agnostic => Affinity::Agnostic,
                    ManifestAffinity::Pinned => Affinity::Pinned,
                },
            );
            let fns: Vec<HostFn> =
                cap.host_fns.iter().map(|name| parse_host_fn(name)).collect::<Result<_, _>>()?;
            grant = grant.with_host_fns(fns);
            let inbound: Vec<&str> = cap.inbound.iter().map(|s| s.as_str()).collect();
            let outbound: Vec<&str> = cap.outbound.iter().map(|s| s.as_str()).collect();
            grant = grant
                .with_inbound(TopicSet::parse(&inbound).map_err(KernelError::from)?)
                .with_outbound(TopicSet::parse(&outbound).map_err(KernelError::from)?);
            grants.push(grant);
        }

        let mut bindings = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            bindings.push(Binding {
                topic: Topic::new(binding.topic.clone())?,
                channel_uri: binding.channel_uri.clone(),
                role: match binding.role {
                    ManifestBindingRole::Consume => BindingRole::Consume,
                    ManifestBindingRole::Produce => BindingRole::Produce,
                },
                schema_uri: binding.schema_uri.clone(),
                root_type: binding.root_type.to_tag(),
            });
        }

        Ok(SpawnRequest {
            modules,
            channels,
            capabilities: SpawnCapabilities::Explicit(CapabilitySet::new(grants)),
            limits: ResourceLimits::new(
                ComputeUnits(self.limits.compute_max),
                MemoryBytes(self.limits.mem_max),
                TimeDelta::from_nanos(self.limits.time_budget_ns),
            ),
            policy: match self.policy {
                ManifestPolicy::Shared => SchedulingPolicy::Shared,
                ManifestPolicy::Dedicated => SchedulingPolicy::Dedicated,
            },
            bindings,
            system_pool_bytes: self.system_pool_bytes,
            base_seed: self.seed,
            escalation: false,
        })
    }
}

fn parse_host_fn(name: &str) -> Result<HostFn, KernelError> {
    let host_fn = match name {
        "read" => HostFn::Read,
        "write" => HostFn::Write,
        "blob_alloc" => HostFn::BlobAlloc,
        "blob_map" => HostFn::BlobMap,
        "blob_retain" => HostFn::BlobRetain,
        "tl_open" => HostFn::TlOpen,
        "tl_next" => HostFn::TlNext,
        "tl_close" => HostFn::TlClose,
        "channel_create" => HostFn::ChannelCreate,
        "process_spawn" => HostFn::ProcessSpawn,
        "process_terminate" => HostFn::ProcessTerminate,
        other => {
            return Err(KernelError::Invalid(format!("unknown host function '{}'", other)))
        }
    };
    Ok(host_fn)
}

fn parse_hex(text: &str) -> Result<Vec<u8>, KernelError> {
    if text.len() % 2 != 0 {
        return Err(KernelError::Invalid("hex string has odd length".to_string()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| KernelError::Invalid(format!("bad hex at offset {}", i)))
        })
        .collect()
}

fn parse_digest(text: &str) -> Result<ModuleDigest, KernelError> {
    let bytes = parse_hex(text)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KernelError::Invalid("digest must be 32 bytes of hex".to_string()))?;
    Ok(ModuleDigest::from_bytes(arr))
}
