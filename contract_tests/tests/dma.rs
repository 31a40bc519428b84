//! DMA fallback: optional DMA degrades to standard memory on hosts
//! without a pool; required DMA fails with an allocation error.

use contract_tests::{emit, module_spec, spawn_request, KernelBuilder};
use engine::SimProgram;
use kernel::{DMA_OPTIONAL, DMA_REQUIRED};
use value::Value;

const MIB: u64 = 1 << 20;

fn alloc_program() -> SimProgram {
    SimProgram::with_weave(
        contract_tests::logic_info(),
        Box::new(|ctx| {
            let optional = ctx.host.blob_alloc(MIB, DMA_REQUIRED | DMA_OPTIONAL);
            let required = ctx.host.blob_alloc(MIB, DMA_REQUIRED);
            emit(
                ctx,
                "out",
                &Value::Map(vec![
                    ("optional".to_string(), Value::I64(optional)),
                    ("required".to_string(), Value::I64(required)),
                ]),
            );
            core_types::PARK
        }),
    )
}

fn alloc_results(kernel: &mut kernel::Kernel, pid: core_types::ProcessId) -> (i64, i64) {
    kernel.run_cycle();
    let proc = kernel.process(pid).unwrap();
    let result = proc.timeline.events()[0].record.value().unwrap();
    let pairs = match result {
        Value::Map(pairs) => pairs,
        other => panic!("expected map, got {:?}", other),
    };
    let get = |name: &str| {
        pairs
            .iter()
            .find_map(|(k, v)| match (k == name, v) {
                (true, Value::I64(code)) => Some(*code),
                _ => None,
            })
            .unwrap()
    };
    (get("optional"), get("required"))
}

#[test]
fn test_host_without_dma_pool() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"alloc:v1", alloc_program());
    let mut kernel = builder.build();
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("alloc", digest)])).unwrap();

    let (optional, required) = alloc_results(&mut kernel, pid);
    // Both-bits-set is treated as optional: standard allocation succeeds.
    assert!(optional > 0);
    // DMA-required cannot be satisfied.
    assert_eq!(required, core_types::ERR_OOM);
}

#[test]
fn test_host_with_dma_pool() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"alloc:v1", alloc_program());
    let mut kernel = builder.build_with(|k| k.with_dma_pool(8 * MIB));
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("alloc", digest)])).unwrap();

    let (optional, required) = alloc_results(&mut kernel, pid);
    assert!(optional > 0);
    assert!(required > 0);
}

#[test]
fn test_unretained_blob_does_not_survive_the_weave() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"ephemeral:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                let args = ctx.weave_args().expect("weave args present");
                if args.tick == 1 {
                    let kept = ctx.host.blob_alloc(256, 0);
                    let dropped = ctx.host.blob_alloc(256, 0);
                    assert!(kept > 0 && dropped > 0);
                    assert_eq!(ctx.host.blob_retain(kept as u64), 0);
                    // Stash the two handles for the next weave.
                    let mut block = ctx.memory.read(ctx.args_ptr, 128).unwrap().to_vec();
                    let packed = ((kept as u64) << 32) | dropped as u64;
                    block[112..120].copy_from_slice(&packed.to_le_bytes());
                    ctx.memory.write(ctx.args_ptr, &block).unwrap();
                    return core_types::YIELD;
                }
                let kept = args.user_data >> 32;
                let dropped = args.user_data & 0xFFFF_FFFF;
                let kept_code = ctx.host.blob_map(kept, kernel::PERM_READ);
                let dropped_code = ctx.host.blob_map(dropped, kernel::PERM_READ);
                emit(
                    ctx,
                    "out",
                    &Value::Map(vec![
                        ("kept".to_string(), Value::I64(kept_code)),
                        ("dropped".to_string(), Value::I64(dropped_code)),
                    ]),
                );
                core_types::PARK
            }),
        ),
    );
    let mut kernel = builder.build();
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("eph", digest)])).unwrap();
    kernel.run_until_parked(5);

    let proc = kernel.process(pid).unwrap();
    let result = proc.timeline.events()[0].record.value().unwrap();
    match result {
        Value::Map(pairs) => {
            // Retained blob is still reachable next weave.
            assert!(pairs.iter().any(|(k, v)| k == "kept" && *v == Value::I64(0)));
            // The ephemeral one is gone.
            assert!(pairs
                .iter()
                .any(|(k, v)| k == "dropped" && *v == Value::I64(core_types::ERR_NOT_FOUND)));
        }
        other => panic!("expected map, got {:?}", other),
    }
}
