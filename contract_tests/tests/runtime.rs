//! Module runtime contracts: the stateless reset discipline, user_data
//! preservation for stateful instances, metering preemption, and
//! manifest-driven spawns.

use capability::{Affinity, CapabilityGrant, CapabilitySet, CapabilityUrn};
use contract_tests::{emit, info_for, module_spec, spawn_request, KernelBuilder};
use core_types::{ExecutionContext, KernelError, PoolingMode};
use engine::{ModuleDigest, SimProgram};
use kernel::{Manifest, SpawnCapabilities, WeaveOutcome};
use value::Value;

#[test]
fn test_stateless_user_data_and_memory_reset() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"stateless:v1",
        SimProgram {
            info: info_for(ExecutionContext::Logic, PoolingMode::Stateless),
            init: Box::new(|ctx| {
                // Post-init snapshot carries this marker.
                ctx.memory.write(4_096, &[0xEE; 4]).unwrap();
                0
            }),
            weave: Box::new(|ctx| {
                let args = ctx.weave_args().expect("weave args present");
                let marker = ctx.memory.read(4_096, 4).unwrap().to_vec();
                let scratch = ctx.memory.read(5_000, 4).unwrap().to_vec();
                emit(
                    ctx,
                    "out",
                    &Value::Map(vec![
                        ("user_data".to_string(), Value::U64(args.user_data)),
                        ("marker_ok".to_string(), Value::Bool(marker == vec![0xEE; 4])),
                        ("scratch_clean".to_string(), Value::Bool(scratch == vec![0; 4])),
                    ]),
                );
                // Dirty scratch memory and user_data; neither survives.
                ctx.memory.write(5_000, &[0xAA; 4]).unwrap();
                let mut block = ctx.memory.read(ctx.args_ptr, 128).unwrap().to_vec();
                block[112..120].copy_from_slice(&7u64.to_le_bytes());
                ctx.memory.write(ctx.args_ptr, &block).unwrap();
                if args.tick < 2 {
                    core_types::YIELD
                } else {
                    core_types::PARK
                }
            }),
        },
    );
    let mut kernel = builder.build();
    let mut request = spawn_request(vec![module_spec("stateless", digest)]);
    request.modules[0].pooling = PoolingMode::Stateless;
    let pid = kernel.spawn_process(None, request).unwrap();
    kernel.run_until_parked(5);

    let proc = kernel.process(pid).unwrap();
    assert_eq!(proc.timeline.len(), 2);
    for committed in proc.timeline.events() {
        match committed.record.value().unwrap() {
            Value::Map(pairs) => {
                assert!(pairs.iter().any(|(k, v)| k == "user_data" && *v == Value::U64(0)));
                assert!(pairs.iter().any(|(k, v)| k == "marker_ok" && *v == Value::Bool(true)));
                assert!(pairs.iter().any(|(k, v)| k == "scratch_clean" && *v == Value::Bool(true)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }
}

#[test]
fn test_stateful_user_data_survives_yield() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"counter:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                let args = ctx.weave_args().expect("weave args present");
                let count = args.user_data + 1;
                emit(ctx, "out", &Value::U64(count));
                let mut block = ctx.memory.read(ctx.args_ptr, 128).unwrap().to_vec();
                block[112..120].copy_from_slice(&count.to_le_bytes());
                ctx.memory.write(ctx.args_ptr, &block).unwrap();
                if count < 3 {
                    core_types::YIELD
                } else {
                    core_types::PARK
                }
            }),
        ),
    );
    let mut kernel = builder.build();
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("counter", digest)])).unwrap();
    kernel.run_until_parked(10);

    let proc = kernel.process(pid).unwrap();
    let counts: Vec<Value> =
        proc.timeline.events().iter().map(|e| e.record.value().unwrap()).collect();
    assert_eq!(counts, vec![Value::U64(1), Value::U64(2), Value::U64(3)]);
}

#[test]
fn test_metering_preempts_runaway_module() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"spin:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                ctx.meter.charge(u64::MAX / 2);
                0
            }),
        ),
    );
    let mut kernel = builder.build();
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("spin", digest)])).unwrap();

    let outcomes = kernel.run_cycle();
    match &outcomes[0].1 {
        WeaveOutcome::Discarded { error } => assert_eq!(error.code(), core_types::ERR_TIMEOUT),
        other => panic!("expected discard, got {:?}", other),
    }
    // The weave left no trace.
    assert!(kernel.process(pid).unwrap().timeline.is_empty());
}

#[test]
fn test_pinned_capability_refuses_stateless_module() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"stateless2:v1",
        SimProgram::with_weave(
            info_for(ExecutionContext::Logic, PoolingMode::Stateless),
            Box::new(|_| core_types::PARK),
        ),
    );
    let mut kernel = builder.build();

    let pinned = CapabilitySet::new(vec![CapabilityGrant::new(
        CapabilityUrn::parse("urn:filament:cap:hw").unwrap(),
        Affinity::Pinned,
    )]);
    let mut request = spawn_request(vec![module_spec("s", digest)]);
    request.modules[0].pooling = PoolingMode::Stateless;
    request.capabilities = SpawnCapabilities::Explicit(pinned);
    let err = kernel.spawn_process(None, request).unwrap_err();
    assert!(matches!(err, KernelError::Permission(_)));
}

#[test]
fn test_ungranted_topic_aborts_the_weave() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"sneaky:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                emit(ctx, "out", &Value::U64(1));
                let code = emit(ctx, "secret/exfil", &Value::U64(2));
                assert_eq!(code, core_types::ERR_PERM);
                // Even a compliant return cannot save the weave now.
                core_types::PARK
            }),
        ),
    );
    let mut kernel = builder.build();
    let pid = kernel.spawn_process(None, spawn_request(vec![module_spec("sneaky", digest)])).unwrap();

    let outcomes = kernel.run_cycle();
    match &outcomes[0].1 {
        WeaveOutcome::Discarded { error } => assert_eq!(error.code(), core_types::ERR_PERM),
        other => panic!("expected discard, got {:?}", other),
    }
    assert!(kernel.process(pid).unwrap().timeline.is_empty());
    assert!(kernel
        .router_audit()
        .has_event(|e| matches!(e, kernel::RouterEvent::Rejected { topic, .. } if topic == "secret/exfil")));
}

#[test]
fn test_manifest_driven_spawn() {
    let mut builder = KernelBuilder::new();
    let digest: ModuleDigest = builder.program(
        b"manifested:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                emit(ctx, "out", &Value::String("alive".to_string()));
                core_types::PARK
            }),
        ),
    );
    let mut kernel = builder.build();

    let text = format!(
        r#"{{
            "modules": [
                {{"alias": "manifested", "digest": "{}", "context": "logic", "pooling": "stateful"}}
            ],
            "capabilities": [
                {{"urn": "urn:filament:cap:io", "host_fns": ["read", "write"], "outbound": ["out"]}}
            ],
            "limits": {{"compute_max": 1000000, "mem_max": 16777216, "time_budget_ns": 5000000}},
            "seed": 42
        }}"#,
        digest
    );
    let request = Manifest::from_json(&text).unwrap().to_spawn_request().unwrap();
    let pid = kernel.spawn_process(None, request).unwrap();
    kernel.run_cycle();

    let proc = kernel.process(pid).unwrap();
    assert_eq!(
        proc.timeline.events()[0].record.value().unwrap(),
        Value::String("alive".to_string())
    );
}
