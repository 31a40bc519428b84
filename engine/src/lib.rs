//! # Engine
//!
//! The contract between the kernel and an embedded execution engine,
//! plus a deterministic in-process engine for testing.
//!
//! ## Philosophy
//!
//! The kernel stays unaware of the specific engine. It loads verified
//! artifacts, instantiates them against a memory cap, and calls entry
//! points under an instruction meter. WebAssembly interpreters, JITs, or
//! native loaders all fit behind `ExecutionEngine`; the kernel never
//! branches on which one it is talking to.
//!
//! ## Import surface
//!
//! Modules call back into the kernel through the `filament` namespace.
//! Those imports are routed through the `ModuleHost` trait passed to
//! each `call`: the kernel hands in a host bound to the active weave,
//! and the binding dies with the call. Context handles are thread-local
//! and never escape.

pub mod sim;

pub use sim::{
    LinearMemory, Meter, SimCallCtx, SimEngine, SimProgram, INFO_REGION, RESERVE_BASE,
    WEAVE_ARGS_REGION,
};

use sha2::{Digest as _, Sha256};
use std::fmt;
use thiserror::Error;

/// SHA-256 content digest of a module artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleDigest([u8; 32]);

impl ModuleDigest {
    /// Computes the digest of an artifact.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ModuleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Why a call trapped inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrapKind {
    /// Instruction meter exhausted.
    OutOfFuel,
    /// Access outside the memory cap.
    MemoryFault,
    /// Module-initiated abort.
    Abort(i64),
}

/// Errors surfaced by an execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("artifact digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: ModuleDigest, actual: ModuleDigest },

    #[error("no artifact registered for digest {0}")]
    UnknownArtifact(ModuleDigest),

    #[error("unknown image {0}")]
    UnknownImage(u64),

    #[error("unknown instance {0}")]
    UnknownInstance(u64),

    #[error("declared memory requirement {required} exceeds cap {cap}")]
    MemoryExceeded { required: u64, cap: u64 },

    #[error("trap: {0:?}")]
    Trap(TrapKind),
}

/// Loaded, digest-verified code image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u64);

/// Instantiated module with its own linear memory and meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// The four entry points every module exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    GetInfo,
    Reserve,
    Init,
    Weave,
}

impl EntryPoint {
    pub fn symbol(&self) -> &'static str {
        match self {
            EntryPoint::GetInfo => "get_info",
            EntryPoint::Reserve => "reserve",
            EntryPoint::Init => "init",
            EntryPoint::Weave => "weave",
        }
    }
}

/// Kernel-side import surface bound to the active weave.
///
/// Every method mirrors one host function of the `filament` namespace
/// and returns a raw ABI status (`>= 0` success, negative `ERR_*`).
pub trait ModuleHost {
    /// Reads the next event matching `topic` at or after byte offset
    /// `start` of the staging area into `out`; returns the end offset of
    /// the frame, or 0 when nothing further matches. For channel URIs
    /// the read is destructive, `start` is ignored, and the return value
    /// is the frame length.
    fn read(&mut self, topic: &str, start: u64, out: &mut Vec<u8>) -> i64;

    /// Emits an event on `topic` with the given payload.
    fn write(&mut self, topic: &str, payload: &[u8], encoding: abi::Encoding) -> i64;

    /// Allocates a blob; returns its handle.
    fn blob_alloc(&mut self, size: u64, flags: u32) -> i64;

    /// Maps a blob for access under `perms` (R=1, W=2, X=4).
    fn blob_map(&mut self, id: u64, perms: u32) -> i64;

    /// Provisionally retains a blob for the next weave.
    fn blob_retain(&mut self, id: u64) -> i64;

    /// Direct access to a mapped blob's bytes (zero-copy path of the
    /// in-process engine; a sandboxed engine would expose pages instead).
    fn blob_bytes(&mut self, id: u64) -> Option<&mut Vec<u8>>;

    /// Opens a timeline cursor; returns its handle. Bounds are
    /// inclusive-start/exclusive-end over ticks, or over virtual time
    /// when `by_virtual_time` is set.
    fn tl_open(
        &mut self,
        topic_prefix: &str,
        start: u64,
        end: u64,
        descending: bool,
        by_virtual_time: bool,
    ) -> i64;

    /// Streams whole relocated events into `out` up to `capacity` bytes;
    /// returns bytes written, 0 at end of stream.
    fn tl_next(&mut self, cursor: u64, capacity: u64, out: &mut Vec<u8>) -> i64;

    /// Closes a timeline cursor.
    fn tl_close(&mut self, cursor: u64) -> i64;

    /// Creates a dynamic channel; on success the auto-generated URI is
    /// written to `uri_out`.
    fn channel_create(
        &mut self,
        schema_uri: &str,
        capacity: u32,
        msg_size: u32,
        direction: u32,
        root_type: u32,
        uri_out: &mut String,
    ) -> i64;

    /// Requests a child process spawn from an encoded argument block.
    /// The spawn is applied at commit; returns the provisional pid.
    fn process_spawn(&mut self, args: &[u8]) -> i64;

    /// Requests termination of a process owned by the caller's subtree.
    fn process_terminate(&mut self, pid: u64) -> i64;
}

/// A pluggable execution engine.
///
/// `call` runs under the instance's instruction meter; fuel is set by
/// the kernel before the call and the consumption read back afterwards.
pub trait ExecutionEngine {
    /// Verifies `bytes` against the expected digest and loads an image.
    fn load(&mut self, bytes: &[u8], expected: &ModuleDigest) -> Result<ImageId, EngineError>;

    /// Instantiates an image with a private linear memory bounded by
    /// `mem_cap` bytes.
    fn instantiate(&mut self, image: ImageId, mem_cap: u64) -> Result<InstanceId, EngineError>;

    /// Invokes an entry point as `(ctx, args_ptr) -> i64`.
    fn call(
        &mut self,
        instance: InstanceId,
        entry: EntryPoint,
        ctx: u64,
        args_ptr: u64,
        host: &mut dyn ModuleHost,
    ) -> Result<i64, EngineError>;

    /// Sets the instruction budget for subsequent calls.
    fn set_fuel(&mut self, instance: InstanceId, fuel: u64) -> Result<(), EngineError>;

    /// Fuel consumed since the last `set_fuel`.
    fn fuel_used(&self, instance: InstanceId) -> Result<u64, EngineError>;

    /// Records the current memory as the reset baseline (taken after
    /// `init` for Logic and Stateless contexts).
    fn snapshot_memory(&mut self, instance: InstanceId) -> Result<(), EngineError>;

    /// Restores memory to the recorded baseline.
    fn reset_memory(&mut self, instance: InstanceId) -> Result<(), EngineError>;

    /// Toggles NaN canonicalization for deterministic float results.
    fn set_nan_canonicalization(&mut self, instance: InstanceId, on: bool) -> Result<(), EngineError>;

    /// Copies bytes into instance memory (argument marshalling).
    fn write_memory(&mut self, instance: InstanceId, offset: u64, bytes: &[u8]) -> Result<(), EngineError>;

    /// Copies bytes out of instance memory.
    fn read_memory(&self, instance: InstanceId, offset: u64, len: u64) -> Result<Vec<u8>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = ModuleDigest::of(b"artifact");
        let b = ModuleDigest::of(b"artifact");
        let c = ModuleDigest::of(b"artifact2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_bytes().len(), 32);
    }

    #[test]
    fn test_digest_display_is_hex() {
        let digest = ModuleDigest::of(b"x");
        let text = format!("{}", digest);
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_entry_symbols() {
        assert_eq!(EntryPoint::GetInfo.symbol(), "get_info");
        assert_eq!(EntryPoint::Weave.symbol(), "weave");
    }
}
