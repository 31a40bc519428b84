//! Fixed-size ABI structures
//!
//! Each struct encodes to exactly its documented size; the size
//! constants are part of the ABI and asserted in tests. Reserved bytes
//! are emitted as zero and skipped on decode.

use core_types::{ComputeUnits, MemoryBytes, ResourceLimits, TimeDelta, TraceContext, MAGIC};

use crate::bytes::{ByteReader, ByteWriter};
use crate::AbiError;

/// Current ABI revision negotiated in `get_info`.
pub const ABI_VERSION: u32 = 1;

pub const ABI_STRING_SIZE: usize = 16;
pub const ABI_BLOB_SIZE: usize = 24;
pub const ABI_ARRAY_SIZE: usize = 16;
pub const ABI_PAIR_SIZE: usize = 48;
pub const ABI_VALUE_SIZE: usize = 32;
pub const ABI_TRACE_CONTEXT_SIZE: usize = 32;
pub const ABI_RESOURCE_LIMITS_SIZE: usize = 24;
pub const HOST_INFO_SIZE: usize = 48;
pub const MODULE_INFO_SIZE: usize = 56;
pub const WEAVE_ARGS_SIZE: usize = 128;
pub const CHANNEL_DEFINITION_SIZE: usize = 40;
pub const MODULE_DEFINITION_SIZE: usize = 64;
pub const PROCESS_SPAWN_ARGS_SIZE: usize = 64;

/// View of a string in the surrounding memory space: offset + byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiString {
    pub offset: u64,
    pub len: u64,
}

impl AbiString {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.offset);
        w.put_u64(self.len);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        Ok(Self { offset: r.get_u64()?, len: r.get_u64()? })
    }
}

/// Reference to a kernel blob: handle, byte size, permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiBlob {
    pub id: u64,
    pub size: u64,
    /// R=1, W=2, X=4.
    pub perms: u32,
}

impl AbiBlob {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.id);
        w.put_u64(self.size);
        w.put_u32(self.perms);
        w.put_pad(4);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let id = r.get_u64()?;
        let size = r.get_u64()?;
        let perms = r.get_u32()?;
        r.skip(4)?;
        Ok(Self { id, size, perms })
    }
}

/// View of a homogeneous array in the surrounding memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiArray {
    pub offset: u64,
    pub count: u64,
}

impl AbiArray {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.offset);
        w.put_u64(self.count);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        Ok(Self { offset: r.get_u64()?, count: r.get_u64()? })
    }
}

/// Trace propagation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiTraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub flags: u32,
}

impl AbiTraceContext {
    pub fn from_trace(trace: &TraceContext) -> Self {
        Self { trace_id: trace.trace_id, span_id: trace.span_id, flags: trace.flags }
    }

    pub fn to_trace(&self) -> TraceContext {
        TraceContext { trace_id: self.trace_id, span_id: self.span_id, flags: self.flags }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_bytes(&self.trace_id);
        w.put_bytes(&self.span_id);
        w.put_u32(self.flags);
        w.put_pad(4);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let trace_id = r.get_array_16()?;
        let span_id = r.get_array_8()?;
        let flags = r.get_u32()?;
        r.skip(4)?;
        Ok(Self { trace_id, span_id, flags })
    }
}

/// Raw value envelope: tag, flags, 16-byte discriminated payload.
///
/// Interpretation of the payload belongs to the `value` crate; at this
/// layer it is an opaque 16-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiValue {
    pub tag: u32,
    pub flags: u32,
    pub payload: [u8; 16],
}

impl AbiValue {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u32(self.tag);
        w.put_u32(self.flags);
        w.put_bytes(&self.payload);
        w.put_pad(8);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let tag = r.get_u32()?;
        let flags = r.get_u32()?;
        let payload = r.get_array_16()?;
        r.skip(8)?;
        Ok(Self { tag, flags, payload })
    }
}

/// Key-value pair inside a map payload: key string view + value envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiPair {
    pub key: AbiString,
    pub value: AbiValue,
}

impl AbiPair {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.key.encode(out);
        self.value.encode(out);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        Ok(Self { key: AbiString::decode(r)?, value: AbiValue::decode(r)? })
    }
}

/// Resource limits in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbiResourceLimits {
    pub compute_max: u64,
    pub mem_max: u64,
    pub time_budget_nanos: u64,
}

impl AbiResourceLimits {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            compute_max: limits.compute_max.0,
            mem_max: limits.mem_max.0,
            time_budget_nanos: limits.time_budget.as_nanos(),
        }
    }

    pub fn to_limits(&self) -> ResourceLimits {
        ResourceLimits::new(
            ComputeUnits(self.compute_max),
            MemoryBytes(self.mem_max),
            TimeDelta::from_nanos(self.time_budget_nanos),
        )
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.compute_max);
        w.put_u64(self.mem_max);
        w.put_u64(self.time_budget_nanos);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        Ok(Self {
            compute_max: r.get_u64()?,
            mem_max: r.get_u64()?,
            time_budget_nanos: r.get_u64()?,
        })
    }
}

/// Host description handed to `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub kernel_version: u32,
    pub abi_version: u32,
    pub capability_flags: u64,
    pub max_pipeline_len: u32,
    pub max_channels: u32,
    pub min_bus_bytes: u32,
    pub min_blob_bytes: u32,
}

impl HostInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u32(self.kernel_version);
        w.put_u32(self.abi_version);
        w.put_u64(self.capability_flags);
        w.put_u32(self.max_pipeline_len);
        w.put_u32(self.max_channels);
        w.put_u32(self.min_bus_bytes);
        w.put_u32(self.min_blob_bytes);
        w.put_pad(16);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let info = Self {
            kernel_version: r.get_u32()?,
            abi_version: r.get_u32()?,
            capability_flags: r.get_u64()?,
            max_pipeline_len: r.get_u32()?,
            max_channels: r.get_u32()?,
            min_bus_bytes: r.get_u32()?,
            min_blob_bytes: r.get_u32()?,
        };
        r.skip(16)?;
        Ok(info)
    }
}

/// Module self-description returned by `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    pub magic: u32,
    pub abi_version: u32,
    pub mem_required: u64,
    pub context: u32,
    pub pooling: u32,
    pub entry_count: u32,
    pub user_flags: u64,
}

impl ModuleInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u32(self.magic);
        w.put_u32(self.abi_version);
        w.put_u64(self.mem_required);
        w.put_u32(self.context);
        w.put_u32(self.pooling);
        w.put_u32(self.entry_count);
        w.put_pad(4);
        w.put_u64(self.user_flags);
        w.put_pad(16);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let magic = r.get_u32()?;
        if magic != MAGIC {
            return Err(AbiError::BadMagic(magic));
        }
        let abi_version = r.get_u32()?;
        let mem_required = r.get_u64()?;
        let context = r.get_u32()?;
        let pooling = r.get_u32()?;
        let entry_count = r.get_u32()?;
        r.skip(4)?;
        let user_flags = r.get_u64()?;
        r.skip(16)?;
        Ok(Self { magic, abi_version, mem_required, context, pooling, entry_count, user_flags })
    }
}

/// Argument block of the `weave` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeaveArgs {
    /// Thread-local context handle; never crosses threads.
    pub ctx: u64,
    pub time_budget_nanos: u64,
    pub compute_used: u64,
    pub compute_max: u64,
    pub mem_max: u64,
    /// Sole entropy source for Logic-context modules.
    pub rand_seed: u64,
    pub virt_time: u64,
    pub trace: AbiTraceContext,
    /// Virtual nanoseconds since this instance last ran.
    pub delta_nanos: u64,
    pub tick: u64,
    pub wake_flags: u64,
    /// Preserved scalar; zero for Stateless contexts and on `WAKE_INIT`.
    pub user_data: u64,
}

impl WeaveArgs {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ByteWriter::new(out);
        w.put_u64(self.ctx);
        w.put_u64(self.time_budget_nanos);
        w.put_u64(self.compute_used);
        w.put_u64(self.compute_max);
        w.put_u64(self.mem_max);
        w.put_u64(self.rand_seed);
        w.put_u64(self.virt_time);
        drop(w);
        self.trace.encode(out);
        let mut w = ByteWriter::new(out);
        w.put_u64(self.delta_nanos);
        w.put_u64(self.tick);
        w.put_u64(self.wake_flags);
        w.put_u64(self.user_data);
        w.put_pad(8);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let ctx = r.get_u64()?;
        let time_budget_nanos = r.get_u64()?;
        let compute_used = r.get_u64()?;
        let compute_max = r.get_u64()?;
        let mem_max = r.get_u64()?;
        let rand_seed = r.get_u64()?;
        let virt_time = r.get_u64()?;
        let trace = AbiTraceContext::decode(r)?;
        let delta_nanos = r.get_u64()?;
        let tick = r.get_u64()?;
        let wake_flags = r.get_u64()?;
        let user_data = r.get_u64()?;
        r.skip(8)?;
        Ok(Self {
            ctx,
            time_budget_nanos,
            compute_used,
            compute_max,
            mem_max,
            rand_seed,
            virt_time,
            trace,
            delta_nanos,
            tick,
            wake_flags,
            user_data,
        })
    }
}

/// Direction of a channel relative to its declaring process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelDirection {
    Inbound = 0,
    Outbound = 1,
    Duplex = 2,
}

impl ChannelDirection {
    pub fn from_u32(raw: u32) -> Result<Self, AbiError> {
        match raw {
            0 => Ok(ChannelDirection::Inbound),
            1 => Ok(ChannelDirection::Outbound),
            2 => Ok(ChannelDirection::Duplex),
            other => Err(AbiError::UnknownDiscriminant { field: "channel direction", value: other as u64 }),
        }
    }

    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

/// Declaration of a dynamic channel in spawn arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDefinition {
    /// View of the schema URI in the argument memory.
    pub schema_uri: AbiString,
    pub capacity: u32,
    pub msg_size: u32,
    pub direction: u32,
    /// Declared root value tag of every message.
    pub root_type: u32,
}

impl ChannelDefinition {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.schema_uri.encode(out);
        let mut w = ByteWriter::new(out);
        w.put_u32(self.capacity);
        w.put_u32(self.msg_size);
        w.put_u32(self.direction);
        w.put_u32(self.root_type);
        w.put_pad(8);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let schema_uri = AbiString::decode(r)?;
        let capacity = r.get_u32()?;
        let msg_size = r.get_u32()?;
        let direction = r.get_u32()?;
        let root_type = r.get_u32()?;
        r.skip(8)?;
        Ok(Self { schema_uri, capacity, msg_size, direction, root_type })
    }
}

/// Declaration of one pipeline module in spawn arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDefinition {
    /// View of the alias string in the argument memory.
    pub alias: AbiString,
    /// SHA-256 content digest of the module artifact.
    pub digest: [u8; 32],
    pub context: u32,
    pub pooling: u32,
    pub user_flags: u32,
}

impl ModuleDefinition {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.alias.encode(out);
        let mut w = ByteWriter::new(out);
        w.put_bytes(&self.digest);
        w.put_u32(self.context);
        w.put_u32(self.pooling);
        w.put_u32(self.user_flags);
        w.put_pad(4);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let alias = AbiString::decode(r)?;
        let digest = r.get_array_32()?;
        let context = r.get_u32()?;
        let pooling = r.get_u32()?;
        let user_flags = r.get_u32()?;
        r.skip(4)?;
        Ok(Self { alias, digest, context, pooling, user_flags })
    }
}

/// Top-level spawn argument block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSpawnArgs {
    /// Array of `ModuleDefinition`.
    pub modules: AbiArray,
    /// Array of `ChannelDefinition`.
    pub channels: AbiArray,
    /// Array of `AbiString` capability URNs.
    pub capabilities: AbiArray,
    /// Offset of an `AbiResourceLimits` block.
    pub limits_offset: u64,
    /// `SchedulingPolicy` discriminant.
    pub policy: u32,
}

impl ProcessSpawnArgs {
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.modules.encode(out);
        self.channels.encode(out);
        self.capabilities.encode(out);
        let mut w = ByteWriter::new(out);
        w.put_u64(self.limits_offset);
        w.put_u32(self.policy);
        w.put_pad(4);
    }

    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, AbiError> {
        let modules = AbiArray::decode(r)?;
        let channels = AbiArray::decode(r)?;
        let capabilities = AbiArray::decode(r)?;
        let limits_offset = r.get_u64()?;
        let policy = r.get_u32()?;
        r.skip(4)?;
        Ok(Self { modules, channels, capabilities, limits_offset, policy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_len(encode: impl Fn(&mut Vec<u8>)) -> usize {
        let mut buf = Vec::new();
        encode(&mut buf);
        buf.len()
    }

    #[test]
    fn test_struct_sizes_are_fixed() {
        assert_eq!(encoded_len(|b| AbiString::default().encode(b)), ABI_STRING_SIZE);
        assert_eq!(encoded_len(|b| AbiBlob::default().encode(b)), ABI_BLOB_SIZE);
        assert_eq!(encoded_len(|b| AbiArray::default().encode(b)), ABI_ARRAY_SIZE);
        assert_eq!(encoded_len(|b| AbiPair::default().encode(b)), ABI_PAIR_SIZE);
        assert_eq!(encoded_len(|b| AbiValue::default().encode(b)), ABI_VALUE_SIZE);
        assert_eq!(encoded_len(|b| AbiTraceContext::default().encode(b)), ABI_TRACE_CONTEXT_SIZE);
        assert_eq!(encoded_len(|b| AbiResourceLimits::default().encode(b)), ABI_RESOURCE_LIMITS_SIZE);
        assert_eq!(encoded_len(|b| WeaveArgs::default().encode(b)), WEAVE_ARGS_SIZE);

        let host = HostInfo {
            kernel_version: 1,
            abi_version: ABI_VERSION,
            capability_flags: 0,
            max_pipeline_len: 16,
            max_channels: 64,
            min_bus_bytes: 65_536,
            min_blob_bytes: 128,
        };
        assert_eq!(encoded_len(|b| host.encode(b)), HOST_INFO_SIZE);

        let info = ModuleInfo {
            magic: MAGIC,
            abi_version: ABI_VERSION,
            mem_required: 0,
            context: 0,
            pooling: 0,
            entry_count: 4,
            user_flags: 0,
        };
        assert_eq!(encoded_len(|b| info.encode(b)), MODULE_INFO_SIZE);

        let chan = ChannelDefinition {
            schema_uri: AbiString::default(),
            capacity: 2,
            msg_size: 64,
            direction: 0,
            root_type: 0,
        };
        assert_eq!(encoded_len(|b| chan.encode(b)), CHANNEL_DEFINITION_SIZE);

        let module = ModuleDefinition {
            alias: AbiString::default(),
            digest: [0; 32],
            context: 0,
            pooling: 0,
            user_flags: 0,
        };
        assert_eq!(encoded_len(|b| module.encode(b)), MODULE_DEFINITION_SIZE);

        let spawn = ProcessSpawnArgs {
            modules: AbiArray::default(),
            channels: AbiArray::default(),
            capabilities: AbiArray::default(),
            limits_offset: 0,
            policy: 0,
        };
        assert_eq!(encoded_len(|b| spawn.encode(b)), PROCESS_SPAWN_ARGS_SIZE);
    }

    #[test]
    fn test_weave_args_roundtrip() {
        let args = WeaveArgs {
            ctx: 0xAAAA,
            time_budget_nanos: 1_000_000,
            compute_used: 5,
            compute_max: 1_000,
            mem_max: 1 << 20,
            rand_seed: 0xDEAD_BEEF,
            virt_time: 1_000,
            trace: AbiTraceContext { trace_id: [1; 16], span_id: [2; 8], flags: 1 },
            delta_nanos: 10,
            tick: 3,
            wake_flags: crate::codes::WAKE_TIMER,
            user_data: 99,
        };
        let mut buf = Vec::new();
        args.encode(&mut buf);
        let decoded = WeaveArgs::decode(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_module_info_rejects_bad_magic() {
        let info = ModuleInfo {
            magic: MAGIC,
            abi_version: ABI_VERSION,
            mem_required: 4096,
            context: 0,
            pooling: 1,
            entry_count: 4,
            user_flags: 0,
        };
        let mut buf = Vec::new();
        info.encode(&mut buf);
        buf[0] ^= 0xFF;
        let result = ModuleInfo::decode(&mut ByteReader::new(&buf));
        assert!(matches!(result, Err(AbiError::BadMagic(_))));
    }

    #[test]
    fn test_spawn_args_roundtrip() {
        let spawn = ProcessSpawnArgs {
            modules: AbiArray { offset: 64, count: 2 },
            channels: AbiArray { offset: 192, count: 1 },
            capabilities: AbiArray { offset: 232, count: 3 },
            limits_offset: 280,
            policy: 1,
        };
        let mut buf = Vec::new();
        spawn.encode(&mut buf);
        assert_eq!(buf.len(), PROCESS_SPAWN_ARGS_SIZE);
        let decoded = ProcessSpawnArgs::decode(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(decoded, spawn);
    }

    #[test]
    fn test_resource_limits_conversion() {
        let limits = AbiResourceLimits { compute_max: 10, mem_max: 20, time_budget_nanos: 30 };
        let typed = limits.to_limits();
        assert_eq!(AbiResourceLimits::from_limits(&typed), limits);
    }
}
