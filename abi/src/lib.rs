//! # ABI
//!
//! Byte-exact wire structures shared between the kernel and hosted
//! modules.
//!
//! ## Format rules
//!
//! - Little-endian, 8-byte aligned.
//! - Pointers are 64-bit: linear-memory offsets for sandboxed modules,
//!   virtual addresses for native ones. Handles are opaque 64-bit ids.
//! - Reserved pad bytes are zero on emission; readers ignore them.
//! - Struct sizes are fixed and asserted by tests; a size change is an
//!   ABI break.
//!
//! Every exported or imported function takes `(ctx: u64, args_ptr: u64)`
//! and returns `i64`; the structs here are what `args_ptr` points at.

pub mod bytes;
pub mod codes;
pub mod event;
pub mod structs;

pub use bytes::{ByteReader, ByteWriter};
pub use codes::{
    Encoding, ValueTag, WAKE_HW, WAKE_INIT, WAKE_IO, WAKE_KV, WAKE_LIFECYCLE, WAKE_TIMER,
};
pub use event::{decode_event, encode_event, event_frame_len, DecodedEvent, EventHeader, EVENT_HEADER_SIZE};
pub use structs::{
    AbiArray, AbiBlob, AbiPair, AbiResourceLimits, AbiString, AbiTraceContext, AbiValue,
    ChannelDefinition, ChannelDirection, HostInfo, ModuleDefinition, ModuleInfo,
    ProcessSpawnArgs, ABI_ARRAY_SIZE, ABI_BLOB_SIZE, ABI_PAIR_SIZE, ABI_RESOURCE_LIMITS_SIZE,
    ABI_STRING_SIZE, ABI_TRACE_CONTEXT_SIZE, ABI_VALUE_SIZE, ABI_VERSION,
    CHANNEL_DEFINITION_SIZE, HOST_INFO_SIZE, MODULE_DEFINITION_SIZE, MODULE_INFO_SIZE,
    PROCESS_SPAWN_ARGS_SIZE, WEAVE_ARGS_SIZE, WeaveArgs,
};

use thiserror::Error;

/// Errors raised while encoding or decoding ABI structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    /// Buffer ended before the structure did.
    #[error("buffer truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// Magic number mismatch in a module info block.
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    /// A discriminant field held an unknown value.
    #[error("unknown discriminant {value} for {field}")]
    UnknownDiscriminant { field: &'static str, value: u64 },

    /// Declared lengths disagree with the buffer.
    #[error("length mismatch: {0}")]
    LengthMismatch(String),
}

impl From<AbiError> for core_types::KernelError {
    fn from(err: AbiError) -> Self {
        core_types::KernelError::Invalid(err.to_string())
    }
}
