//! Module runtime
//!
//! Bootstrapping follows the fixed ABI sequence: `get_info` (verify
//! magic, ABI revision, declared memory against the context limit),
//! `reserve` (the module carves out room for its config payload), copy
//! of the init args, then `init`. A failed `init` aborts the spawn.
//! After a successful init the memory baseline is snapshotted for
//! Logic and Stateless instances, which are reset to it at every weave
//! start.

use abi::{structs::ABI_VERSION, ByteReader, Encoding, ModuleInfo, MODULE_INFO_SIZE};
use core_types::{ExecutionContext, KernelError, PoolingMode};
use engine::{
    EngineError, EntryPoint, ExecutionEngine, InstanceId, ModuleHost, TrapKind,
};

use crate::spawn::ModuleSpec;

/// Offset of `user_data` within the weave argument block; read back
/// after each call so the scalar survives yield/park.
pub const WEAVE_ARGS_USER_DATA_OFFSET: u64 = 112;

/// Translates engine failures into kernel error kinds.
///
/// Traps surface as timeout or allocation failures; integrity failures
/// during load are permission errors.
pub fn map_engine_error(err: EngineError) -> KernelError {
    match err {
        EngineError::Trap(TrapKind::OutOfFuel) => {
            KernelError::Timeout("instruction meter exhausted".to_string())
        }
        EngineError::Trap(TrapKind::MemoryFault) => {
            KernelError::Oom("sandbox memory fault".to_string())
        }
        EngineError::Trap(TrapKind::Abort(code)) => {
            KernelError::Invalid(format!("module aborted with {}", code))
        }
        EngineError::DigestMismatch { expected, actual } => KernelError::Permission(format!(
            "artifact digest mismatch: expected {}, got {}",
            expected, actual
        )),
        EngineError::MemoryExceeded { required, cap } => KernelError::Oom(format!(
            "module requires {} bytes, context limit is {}",
            required, cap
        )),
        EngineError::UnknownArtifact(digest) => {
            KernelError::NotFound(format!("no artifact for digest {}", digest))
        }
        EngineError::UnknownImage(id) => KernelError::NotFound(format!("no image {}", id)),
        EngineError::UnknownInstance(id) => KernelError::NotFound(format!("no instance {}", id)),
    }
}

/// Host surface used during bootstrap: modules may not perform I/O
/// before their first weave.
pub struct DeniedHost;

impl ModuleHost for DeniedHost {
    fn read(&mut self, _: &str, _: u64, _: &mut Vec<u8>) -> i64 {
        core_types::ERR_PERM
    }
    fn write(&mut self, _: &str, _: &[u8], _: Encoding) -> i64 {
        core_types::ERR_PERM
    }
    fn blob_alloc(&mut self, _: u64, _: u32) -> i64 {
        core_types::ERR_PERM
    }
    fn blob_map(&mut self, _: u64, _: u32) -> i64 {
        core_types::ERR_PERM
    }
    fn blob_retain(&mut self, _: u64) -> i64 {
        core_types::ERR_PERM
    }
    fn blob_bytes(&mut self, _: u64) -> Option<&mut Vec<u8>> {
        None
    }
    fn tl_open(&mut self, _: &str, _: u64, _: u64, _: bool, _: bool) -> i64 {
        core_types::ERR_PERM
    }
    fn tl_next(&mut self, _: u64, _: u64, _: &mut Vec<u8>) -> i64 {
        core_types::ERR_PERM
    }
    fn tl_close(&mut self, _: u64) -> i64 {
        core_types::ERR_PERM
    }
    fn channel_create(&mut self, _: &str, _: u32, _: u32, _: u32, _: u32, _: &mut String) -> i64 {
        core_types::ERR_PERM
    }
    fn process_spawn(&mut self, _: &[u8]) -> i64 {
        core_types::ERR_PERM
    }
    fn process_terminate(&mut self, _: u64) -> i64 {
        core_types::ERR_PERM
    }
}

/// Outcome of a successful bootstrap.
#[derive(Debug)]
pub struct BootstrapResult {
    pub instance: InstanceId,
    pub info: ModuleInfo,
    /// Fuel burned by `get_info`/`reserve`/`init`; charged to the
    /// spawning parent.
    pub fuel_used: u64,
}

/// Loads, instantiates, and initializes one module instance.
pub fn bootstrap_module(
    engine: &mut dyn ExecutionEngine,
    artifact: &[u8],
    spec: &ModuleSpec,
    mem_cap: u64,
    fuel: u64,
) -> Result<BootstrapResult, KernelError> {
    let image = engine.load(artifact, &spec.digest).map_err(map_engine_error)?;
    let instance = engine.instantiate(image, mem_cap).map_err(map_engine_error)?;
    engine.set_fuel(instance, fuel).map_err(map_engine_error)?;

    let ctx = instance.0;
    let mut host = DeniedHost;

    // get_info: returns a pointer to the module info block.
    let info_ptr = engine
        .call(instance, EntryPoint::GetInfo, ctx, 0, &mut host)
        .map_err(map_engine_error)?;
    if info_ptr < 0 {
        return Err(KernelError::Invalid(format!("get_info failed with {}", info_ptr)));
    }
    let raw = engine
        .read_memory(instance, info_ptr as u64, MODULE_INFO_SIZE as u64)
        .map_err(map_engine_error)?;
    let info = ModuleInfo::decode(&mut ByteReader::new(&raw))?;

    if info.abi_version != ABI_VERSION {
        return Err(KernelError::Invalid(format!(
            "module ABI revision {} incompatible with kernel {}",
            info.abi_version, ABI_VERSION
        )));
    }
    if info.mem_required > mem_cap {
        return Err(KernelError::Oom(format!(
            "module requires {} bytes, context limit is {}",
            info.mem_required, mem_cap
        )));
    }
    let declared_context = ExecutionContext::from_u32(info.context)
        .ok_or_else(|| KernelError::Invalid(format!("bad context {}", info.context)))?;
    let declared_pooling = PoolingMode::from_u32(info.pooling)
        .ok_or_else(|| KernelError::Invalid(format!("bad pooling {}", info.pooling)))?;
    if declared_context != spec.context || declared_pooling != spec.pooling {
        return Err(KernelError::Type(format!(
            "module declares {}/{:?}, spawn request says {}/{:?}",
            declared_context, declared_pooling, spec.context, spec.pooling
        )));
    }

    // reserve: the module carves out room for its config payload, then
    // the kernel copies the init args into that region.
    let mut reserve_args = Vec::with_capacity(24);
    for word in [spec.init_args.len() as u64, 8u64, 0u64] {
        reserve_args.extend_from_slice(&word.to_le_bytes());
    }
    engine.write_memory(instance, 0, &reserve_args).map_err(map_engine_error)?;
    let args_ptr = engine
        .call(instance, EntryPoint::Reserve, ctx, 0, &mut host)
        .map_err(map_engine_error)?;
    if args_ptr < 0 {
        return Err(KernelError::Oom(format!("reserve failed with {}", args_ptr)));
    }
    if !spec.init_args.is_empty() {
        engine
            .write_memory(instance, args_ptr as u64, &spec.init_args)
            .map_err(map_engine_error)?;
    }

    // init: pointers in the args are valid only for this call.
    let status = engine
        .call(instance, EntryPoint::Init, ctx, args_ptr as u64, &mut host)
        .map_err(map_engine_error)?;
    if status != 0 {
        return Err(KernelError::Invalid(format!(
            "module '{}' init failed with {}",
            spec.alias, status
        )));
    }

    if spec.context == ExecutionContext::Logic || spec.pooling == PoolingMode::Stateless {
        engine.snapshot_memory(instance).map_err(map_engine_error)?;
    }
    if spec.context == ExecutionContext::Logic {
        engine.set_nan_canonicalization(instance, true).map_err(map_engine_error)?;
    }

    let fuel_used = engine.fuel_used(instance).map_err(map_engine_error)?;
    Ok(BootstrapResult { instance, info, fuel_used })
}

/// Derives the per-weave entropy seed from the process base seed, the
/// weave ordinal, and the module position. SplitMix64 finalizer.
pub fn derive_seed(base: u64, weave: u64, module_index: u64) -> u64 {
    let mut z = base
        .wrapping_add(weave.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(module_index.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{ModuleAlias, MAGIC};
    use engine::{ModuleDigest, SimEngine, SimProgram};

    fn info(context: u32, pooling: u32) -> ModuleInfo {
        ModuleInfo {
            magic: MAGIC,
            abi_version: ABI_VERSION,
            mem_required: 4_096,
            context,
            pooling,
            entry_count: 4,
            user_flags: 0,
        }
    }

    fn spec(context: ExecutionContext, pooling: PoolingMode, init_args: Vec<u8>) -> ModuleSpec {
        ModuleSpec {
            alias: ModuleAlias::new("m"),
            digest: ModuleDigest::of(b"artifact"),
            context,
            pooling,
            init_args,
        }
    }

    #[test]
    fn test_bootstrap_happy_path() {
        let mut engine = SimEngine::new();
        engine.register_program(
            ModuleDigest::of(b"artifact"),
            SimProgram {
                info: info(0, 0),
                init: Box::new(|ctx| {
                    // The config payload is visible at args_ptr.
                    let args = ctx.init_args(2).unwrap();
                    if args == vec![7, 9] {
                        0
                    } else {
                        -1
                    }
                }),
                weave: Box::new(|_| 0),
            },
        );
        let result = bootstrap_module(
            &mut engine,
            b"artifact",
            &spec(ExecutionContext::Logic, PoolingMode::Stateful, vec![7, 9]),
            8_192,
            10_000,
        )
        .unwrap();
        assert!(result.fuel_used > 0);
        assert_eq!(result.info.mem_required, 4_096);
    }

    #[test]
    fn test_bootstrap_rejects_context_mismatch() {
        let mut engine = SimEngine::new();
        engine.register_program(
            ModuleDigest::of(b"artifact"),
            SimProgram::with_weave(info(1, 0), Box::new(|_| 0)),
        );
        let err = bootstrap_module(
            &mut engine,
            b"artifact",
            &spec(ExecutionContext::Logic, PoolingMode::Stateful, Vec::new()),
            8_192,
            10_000,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Type(_)));
    }

    #[test]
    fn test_bootstrap_rejects_failed_init() {
        let mut engine = SimEngine::new();
        engine.register_program(
            ModuleDigest::of(b"artifact"),
            SimProgram {
                info: info(0, 0),
                init: Box::new(|_| -1),
                weave: Box::new(|_| 0),
            },
        );
        let err = bootstrap_module(
            &mut engine,
            b"artifact",
            &spec(ExecutionContext::Logic, PoolingMode::Stateful, Vec::new()),
            8_192,
            10_000,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Invalid(_)));
    }

    #[test]
    fn test_bootstrap_rejects_tampered_artifact() {
        let mut engine = SimEngine::new();
        engine.register_program(
            ModuleDigest::of(b"artifact"),
            SimProgram::with_weave(info(0, 0), Box::new(|_| 0)),
        );
        let err = bootstrap_module(
            &mut engine,
            b"tampered",
            &spec(ExecutionContext::Logic, PoolingMode::Stateful, Vec::new()),
            8_192,
            10_000,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Permission(_)));
    }

    #[test]
    fn test_seed_derivation_is_deterministic_and_spread() {
        assert_eq!(derive_seed(1, 2, 3), derive_seed(1, 2, 3));
        assert_ne!(derive_seed(1, 2, 3), derive_seed(1, 2, 4));
        assert_ne!(derive_seed(1, 2, 3), derive_seed(1, 3, 3));
        assert_ne!(derive_seed(0, 0, 0), 0);
    }
}
