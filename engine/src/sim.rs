//! # Simulated Execution Engine
//!
//! Deterministic in-process engine for testing.
//!
//! ## Philosophy
//!
//! **Determinism enables thorough testing.** Programs are plain Rust
//! hooks registered under the digest of their artifact bytes, with a
//! byte-vector linear memory, an explicit fuel meter, and the same
//! entry-point discipline a sandboxed engine would enforce. This is not
//! a mock: `load` really verifies digests, `reserve` really bump-
//! allocates, and memory snapshots really restore byte-for-byte.
//!
//! ## Memory layout convention
//!
//! - `INFO_REGION` (offset 64): `get_info` writes the module info block
//!   here and returns the offset.
//! - `WEAVE_ARGS_REGION` (offset 128): the kernel marshals the weave
//!   argument block here each cycle.
//! - `RESERVE_BASE` (offset 256): `reserve` hands out bump allocations
//!   from here upwards.

use std::collections::HashMap;
use std::sync::Arc;

use abi::{ByteReader, ModuleInfo, WeaveArgs, MODULE_INFO_SIZE, WEAVE_ARGS_SIZE};

use crate::{
    EngineError, EntryPoint, ExecutionEngine, ImageId, InstanceId, ModuleDigest, ModuleHost,
    TrapKind,
};

/// Offset where `get_info` places the encoded module info.
pub const INFO_REGION: u64 = 64;
/// Offset where the kernel marshals weave argument blocks.
pub const WEAVE_ARGS_REGION: u64 = 128;
/// First offset handed out by `reserve`.
pub const RESERVE_BASE: u64 = 256;

/// Fuel charged for entering any entry point.
const CALL_BASE_COST: u64 = 10;

/// Instruction meter for one instance.
#[derive(Debug, Clone, Default)]
pub struct Meter {
    budget: u64,
    used: u64,
}

impl Meter {
    /// Charges fuel; exhaustion is detected by the engine after the call.
    pub fn charge(&mut self, units: u64) {
        self.used = self.used.saturating_add(units);
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn reset(&mut self, budget: u64) {
        self.budget = budget;
        self.used = 0;
    }

    fn exhausted(&self) -> bool {
        self.used > self.budget
    }
}

/// Byte-vector linear memory bounded by the instantiation cap.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    baseline: Option<Vec<u8>>,
}

impl LinearMemory {
    fn new(cap: u64) -> Self {
        Self { bytes: vec![0; cap as usize], baseline: None }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<&[u8], EngineError> {
        let start = offset as usize;
        let end = start.checked_add(len as usize).ok_or(EngineError::Trap(TrapKind::MemoryFault))?;
        if end > self.bytes.len() {
            return Err(EngineError::Trap(TrapKind::MemoryFault));
        }
        Ok(&self.bytes[start..end])
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(EngineError::Trap(TrapKind::MemoryFault))?;
        if end > self.bytes.len() {
            return Err(EngineError::Trap(TrapKind::MemoryFault));
        }
        self.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn snapshot(&mut self) {
        self.baseline = Some(self.bytes.clone());
    }

    fn reset(&mut self) {
        match &self.baseline {
            Some(baseline) => self.bytes.copy_from_slice(baseline),
            None => self.bytes.fill(0),
        }
    }
}

/// Call context handed to program hooks.
pub struct SimCallCtx<'a> {
    pub memory: &'a mut LinearMemory,
    pub host: &'a mut dyn ModuleHost,
    pub meter: &'a mut Meter,
    /// Offset of the argument block in `memory`.
    pub args_ptr: u64,
}

impl SimCallCtx<'_> {
    /// Decodes the weave argument block at `args_ptr`.
    pub fn weave_args(&self) -> Option<WeaveArgs> {
        let bytes = self.memory.read(self.args_ptr, WEAVE_ARGS_SIZE as u64).ok()?;
        WeaveArgs::decode(&mut ByteReader::new(bytes)).ok()
    }

    /// Reads the raw init argument block at `args_ptr` with the given length.
    pub fn init_args(&self, len: u64) -> Option<Vec<u8>> {
        self.memory.read(self.args_ptr, len).ok().map(|b| b.to_vec())
    }
}

type HookFn = Box<dyn Fn(&mut SimCallCtx<'_>) -> i64 + Send + Sync>;

/// A registered test program: module info plus init/weave hooks.
pub struct SimProgram {
    pub info: ModuleInfo,
    pub init: HookFn,
    pub weave: HookFn,
}

impl SimProgram {
    /// A program with a no-op init.
    pub fn with_weave(info: ModuleInfo, weave: HookFn) -> Self {
        Self { info, init: Box::new(|_| 0), weave }
    }
}

struct SimInstance {
    image: ImageId,
    memory: LinearMemory,
    meter: Meter,
    bump: u64,
    /// Honored implicitly: sim programs produce canonical floats already.
    #[allow(dead_code)]
    nan_canonicalization: bool,
}

/// Deterministic in-process execution engine.
#[derive(Default)]
pub struct SimEngine {
    programs: HashMap<ModuleDigest, Arc<SimProgram>>,
    images: Vec<ModuleDigest>,
    instances: HashMap<u64, SimInstance>,
    next_instance: u64,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a program under the digest of its artifact bytes.
    pub fn register_program(&mut self, digest: ModuleDigest, program: SimProgram) {
        self.programs.insert(digest, Arc::new(program));
    }

    fn instance(&self, id: InstanceId) -> Result<&SimInstance, EngineError> {
        self.instances.get(&id.0).ok_or(EngineError::UnknownInstance(id.0))
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut SimInstance, EngineError> {
        self.instances.get_mut(&id.0).ok_or(EngineError::UnknownInstance(id.0))
    }

    fn program_for_image(&self, image: ImageId) -> Result<Arc<SimProgram>, EngineError> {
        let digest = self.images.get(image.0 as usize).ok_or(EngineError::UnknownImage(image.0))?;
        self.programs.get(digest).cloned().ok_or(EngineError::UnknownArtifact(*digest))
    }
}

impl ExecutionEngine for SimEngine {
    fn load(&mut self, bytes: &[u8], expected: &ModuleDigest) -> Result<ImageId, EngineError> {
        let actual = ModuleDigest::of(bytes);
        if actual != *expected {
            return Err(EngineError::DigestMismatch { expected: *expected, actual });
        }
        if !self.programs.contains_key(expected) {
            return Err(EngineError::UnknownArtifact(*expected));
        }
        let id = ImageId(self.images.len() as u64);
        self.images.push(*expected);
        Ok(id)
    }

    fn instantiate(&mut self, image: ImageId, mem_cap: u64) -> Result<InstanceId, EngineError> {
        let program = self.program_for_image(image)?;
        if program.info.mem_required > mem_cap {
            return Err(EngineError::MemoryExceeded {
                required: program.info.mem_required,
                cap: mem_cap,
            });
        }
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        self.instances.insert(
            id.0,
            SimInstance {
                image,
                memory: LinearMemory::new(program.info.mem_required),
                meter: Meter::default(),
                bump: RESERVE_BASE,
                nan_canonicalization: false,
            },
        );
        Ok(id)
    }

    fn call(
        &mut self,
        instance: InstanceId,
        entry: EntryPoint,
        _ctx: u64,
        args_ptr: u64,
        host: &mut dyn ModuleHost,
    ) -> Result<i64, EngineError> {
        let program = {
            let inst = self.instance(instance)?;
            self.program_for_image(inst.image)?
        };
        let inst = self.instance_mut(instance)?;
        inst.meter.charge(CALL_BASE_COST);
        if inst.meter.exhausted() {
            return Err(EngineError::Trap(TrapKind::OutOfFuel));
        }

        let status = match entry {
            EntryPoint::GetInfo => {
                let mut encoded = Vec::with_capacity(MODULE_INFO_SIZE);
                program.info.encode(&mut encoded);
                inst.memory.write(INFO_REGION, &encoded)?;
                INFO_REGION as i64
            }
            EntryPoint::Reserve => {
                // Argument block: size u64, alignment u64, flags u64.
                let raw = inst.memory.read(args_ptr, 24)?.to_vec();
                let mut r = ByteReader::new(&raw);
                let size = r.get_u64().map_err(|_| EngineError::Trap(TrapKind::MemoryFault))?;
                let align = r.get_u64().map_err(|_| EngineError::Trap(TrapKind::MemoryFault))?.max(1);
                let base = inst.bump.div_ceil(align) * align;
                let end = base.checked_add(size).ok_or(EngineError::Trap(TrapKind::MemoryFault))?;
                if end > inst.memory.len() as u64 {
                    return Err(EngineError::Trap(TrapKind::MemoryFault));
                }
                inst.bump = end;
                base as i64
            }
            EntryPoint::Init | EntryPoint::Weave => {
                let SimInstance { memory, meter, .. } = inst;
                let mut ctx = SimCallCtx { memory, host, meter, args_ptr };
                match entry {
                    EntryPoint::Init => (program.init)(&mut ctx),
                    _ => (program.weave)(&mut ctx),
                }
            }
        };

        let inst = self.instance(instance)?;
        if inst.meter.exhausted() {
            return Err(EngineError::Trap(TrapKind::OutOfFuel));
        }
        Ok(status)
    }

    fn set_fuel(&mut self, instance: InstanceId, fuel: u64) -> Result<(), EngineError> {
        self.instance_mut(instance)?.meter.reset(fuel);
        Ok(())
    }

    fn fuel_used(&self, instance: InstanceId) -> Result<u64, EngineError> {
        Ok(self.instance(instance)?.meter.used())
    }

    fn snapshot_memory(&mut self, instance: InstanceId) -> Result<(), EngineError> {
        self.instance_mut(instance)?.memory.snapshot();
        Ok(())
    }

    fn reset_memory(&mut self, instance: InstanceId) -> Result<(), EngineError> {
        self.instance_mut(instance)?.memory.reset();
        Ok(())
    }

    fn set_nan_canonicalization(&mut self, instance: InstanceId, on: bool) -> Result<(), EngineError> {
        self.instance_mut(instance)?.nan_canonicalization = on;
        Ok(())
    }

    fn write_memory(&mut self, instance: InstanceId, offset: u64, bytes: &[u8]) -> Result<(), EngineError> {
        self.instance_mut(instance)?.memory.write(offset, bytes)
    }

    fn read_memory(&self, instance: InstanceId, offset: u64, len: u64) -> Result<Vec<u8>, EngineError> {
        Ok(self.instance(instance)?.memory.read(offset, len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::structs::ABI_VERSION;
    use core_types::MAGIC;

    struct NullHost;

    impl ModuleHost for NullHost {
        fn read(&mut self, _: &str, _: u64, _: &mut Vec<u8>) -> i64 {
            0
        }
        fn write(&mut self, _: &str, _: &[u8], _: abi::Encoding) -> i64 {
            0
        }
        fn blob_alloc(&mut self, _: u64, _: u32) -> i64 {
            core_types::ERR_OOM
        }
        fn blob_map(&mut self, _: u64, _: u32) -> i64 {
            core_types::ERR_NOT_FOUND
        }
        fn blob_retain(&mut self, _: u64) -> i64 {
            core_types::ERR_NOT_FOUND
        }
        fn blob_bytes(&mut self, _: u64) -> Option<&mut Vec<u8>> {
            None
        }
        fn tl_open(&mut self, _: &str, _: u64, _: u64, _: bool, _: bool) -> i64 {
            core_types::ERR_PERM
        }
        fn tl_next(&mut self, _: u64, _: u64, _: &mut Vec<u8>) -> i64 {
            core_types::ERR_NOT_FOUND
        }
        fn tl_close(&mut self, _: u64) -> i64 {
            core_types::ERR_NOT_FOUND
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

    fn info() -> ModuleInfo {
        ModuleInfo {
            magic: MAGIC,
            abi_version: ABI_VERSION,
            mem_required: 4_096,
            context: 0,
            pooling: 0,
            entry_count: 4,
            user_flags: 0,
        }
    }

    fn engine_with(artifact: &[u8], program: SimProgram) -> (SimEngine, ModuleDigest) {
        let digest = ModuleDigest::of(artifact);
        let mut engine = SimEngine::new();
        engine.register_program(digest, program);
        (engine, digest)
    }

    #[test]
    fn test_load_verifies_digest() {
        let (mut engine, digest) = engine_with(b"artifact", SimProgram::with_weave(info(), Box::new(|_| 0)));
        assert!(engine.load(b"artifact", &digest).is_ok());
        let err = engine.load(b"tampered", &digest).unwrap_err();
        assert!(matches!(err, EngineError::DigestMismatch { .. }));
    }

    #[test]
    fn test_instantiate_respects_mem_cap() {
        let (mut engine, digest) = engine_with(b"a", SimProgram::with_weave(info(), Box::new(|_| 0)));
        let image = engine.load(b"a", &digest).unwrap();
        assert!(matches!(
            engine.instantiate(image, 1_024),
            Err(EngineError::MemoryExceeded { .. })
        ));
        assert!(engine.instantiate(image, 8_192).is_ok());
    }

    #[test]
    fn test_get_info_and_reserve() {
        let (mut engine, digest) = engine_with(b"a", SimProgram::with_weave(info(), Box::new(|_| 0)));
        let image = engine.load(b"a", &digest).unwrap();
        let inst = engine.instantiate(image, 8_192).unwrap();
        engine.set_fuel(inst, 1_000).unwrap();

        let ptr = engine.call(inst, EntryPoint::GetInfo, 1, 0, &mut NullHost).unwrap();
        assert_eq!(ptr, INFO_REGION as i64);
        let raw = engine.read_memory(inst, ptr as u64, MODULE_INFO_SIZE as u64).unwrap();
        let decoded = ModuleInfo::decode(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(decoded, info());

        // reserve(48, 16, 0)
        let mut args = Vec::new();
        for word in [48u64, 16, 0] {
            args.extend_from_slice(&word.to_le_bytes());
        }
        engine.write_memory(inst, 0, &args).unwrap();
        let first = engine.call(inst, EntryPoint::Reserve, 1, 0, &mut NullHost).unwrap();
        assert_eq!(first as u64 % 16, 0);
        assert!(first as u64 >= RESERVE_BASE);
        let second = engine.call(inst, EntryPoint::Reserve, 1, 0, &mut NullHost).unwrap();
        assert!(second as u64 >= first as u64 + 48);
    }

    #[test]
    fn test_fuel_exhaustion_traps() {
        let program = SimProgram::with_weave(
            info(),
            Box::new(|ctx| {
                ctx.meter.charge(1_000);
                0
            }),
        );
        let (mut engine, digest) = engine_with(b"a", program);
        let image = engine.load(b"a", &digest).unwrap();
        let inst = engine.instantiate(image, 8_192).unwrap();
        engine.set_fuel(inst, 100).unwrap();
        let err = engine.call(inst, EntryPoint::Weave, 1, WEAVE_ARGS_REGION, &mut NullHost).unwrap_err();
        assert!(matches!(err, EngineError::Trap(TrapKind::OutOfFuel)));
    }

    #[test]
    fn test_memory_snapshot_reset() {
        let program = SimProgram::with_weave(
            info(),
            Box::new(|ctx| {
                ctx.memory.write(512, &[0xAB; 4]).unwrap();
                0
            }),
        );
        let (mut engine, digest) = engine_with(b"a", program);
        let image = engine.load(b"a", &digest).unwrap();
        let inst = engine.instantiate(image, 8_192).unwrap();
        engine.set_fuel(inst, 1_000).unwrap();
        engine.snapshot_memory(inst).unwrap();

        engine.call(inst, EntryPoint::Weave, 1, WEAVE_ARGS_REGION, &mut NullHost).unwrap();
        assert_eq!(engine.read_memory(inst, 512, 4).unwrap(), vec![0xAB; 4]);

        engine.reset_memory(inst).unwrap();
        assert_eq!(engine.read_memory(inst, 512, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_memory_bounds_fault() {
        let (mut engine, digest) = engine_with(b"a", SimProgram::with_weave(info(), Box::new(|_| 0)));
        let image = engine.load(b"a", &digest).unwrap();
        let inst = engine.instantiate(image, 4_096).unwrap();
        let err = engine.write_memory(inst, 4_095, &[0, 0]).unwrap_err();
        assert!(matches!(err, EngineError::Trap(TrapKind::MemoryFault)));
    }
}
