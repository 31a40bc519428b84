//! Channel backpressure: writes past capacity fail immediately with an
//! I/O error and never block; a destructive read frees one slot.

use abi::ChannelDirection;
use contract_tests::{emit, module_spec, read_value, spawn_request, KernelBuilder};
use abi::ValueTag;
use engine::SimProgram;
use kernel::{ChannelSpec, WeaveOutcome};
use value::Value;

/// First weave: three consecutive writes, reporting the three status
/// codes. Second weave: one destructive read, then one more write.
fn pressure_program() -> SimProgram {
    SimProgram::with_weave(
        contract_tests::logic_info(),
        Box::new(|ctx| {
            let args = ctx.weave_args().expect("weave args present");
            // The first channel of the first process: deterministic URI.
            let uri = "filament/chan/1";
            if args.tick == 1 {
                let codes: Vec<Value> = (0..3)
                    .map(|i| Value::I64(emit(ctx, uri, &Value::U64(i))))
                    .collect();
                emit(ctx, "out", &Value::List(codes));
            } else {
                let oldest = read_value(ctx, uri, 0).map(|(v, _)| v).unwrap_or(Value::Unit);
                let retry = emit(ctx, uri, &Value::U64(99));
                emit(
                    ctx,
                    "out",
                    &Value::Map(vec![
                        ("oldest".to_string(), oldest),
                        ("retry".to_string(), Value::I64(retry)),
                    ]),
                );
            }
            core_types::PARK
        }),
    )
}

fn channel_spec() -> ChannelSpec {
    ChannelSpec {
        schema_uri: "schema/pressure/v1".to_string(),
        capacity: 2,
        msg_size: 64,
        direction: ChannelDirection::Duplex,
        root_type: ValueTag::U64,
    }
}

#[test]
fn test_writes_past_capacity_return_io() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(b"pressure:v1", pressure_program());
    let mut kernel = builder.build();

    let mut request = spawn_request(vec![module_spec("pressure", digest)]);
    request.channels = vec![channel_spec()];
    let pid = kernel.spawn_process(None, request).unwrap();

    let outcomes = kernel.run_cycle();
    assert!(matches!(outcomes[0].1, WeaveOutcome::Committed { .. }));

    // OK, OK, ERR_IO; the failure was immediate, not blocking.
    let proc = kernel.process(pid).unwrap();
    let codes = proc.timeline.events()[0].record.value().unwrap();
    assert_eq!(
        codes,
        Value::List(vec![Value::I64(0), Value::I64(0), Value::I64(core_types::ERR_IO)])
    );

    // The two accepted writes were published at commit.
    let channel = kernel.find_channel("filament/chan/1").unwrap();
    assert_eq!(channel.len(), 2);

    // Second weave: read the oldest, then a write succeeds again.
    let topic = core_types::Topic::new("wake").unwrap();
    let record = kernel::EventRecord::new(
        topic,
        Vec::new(),
        kernel::EventMeta::at(kernel.now()),
    )
    .unwrap();
    kernel.inject_event(pid, record).unwrap();
    let outcomes = kernel.run_cycle();
    assert!(matches!(outcomes[0].1, WeaveOutcome::Committed { .. }));

    let proc = kernel.process(pid).unwrap();
    let second = proc.timeline.events()[1].record.value().unwrap();
    match second {
        Value::Map(pairs) => {
            assert!(pairs.iter().any(|(k, v)| k == "oldest" && *v == Value::U64(0)));
            assert!(pairs.iter().any(|(k, v)| k == "retry" && *v == Value::I64(0)));
        }
        other => panic!("expected map, got {:?}", other),
    }
    // One read, one new write: occupancy back at capacity.
    let channel = kernel.find_channel("filament/chan/1").unwrap();
    assert_eq!(channel.len(), 2);
}

#[test]
fn test_oversize_write_is_invalid() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"oversize:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                let big = Value::Bytes(vec![0xAB; 128]);
                let code = emit(ctx, "filament/chan/1", &big);
                emit(ctx, "out", &Value::I64(code));
                core_types::PARK
            }),
        ),
    );
    let mut kernel = builder.build();
    let mut request = spawn_request(vec![module_spec("oversize", digest)]);
    request.channels = vec![channel_spec()];
    let pid = kernel.spawn_process(None, request).unwrap();

    kernel.run_cycle();
    let proc = kernel.process(pid).unwrap();
    let code = proc.timeline.events()[0].record.value().unwrap();
    assert_eq!(code, Value::I64(core_types::ERR_INVALID));
}

#[test]
fn test_type_mismatch_is_rejected() {
    let mut builder = KernelBuilder::new();
    let digest = builder.program(
        b"badtype:v1",
        SimProgram::with_weave(
            contract_tests::logic_info(),
            Box::new(|ctx| {
                // Channel declares u64 roots; a string must bounce.
                let code = emit(ctx, "filament/chan/1", &Value::String("nope".to_string()));
                emit(ctx, "out", &Value::I64(code));
                core_types::PARK
            }),
        ),
    );
    let mut kernel = builder.build();
    let mut request = spawn_request(vec![module_spec("badtype", digest)]);
    request.channels = vec![channel_spec()];
    let pid = kernel.spawn_process(None, request).unwrap();

    kernel.run_cycle();
    let proc = kernel.process(pid).unwrap();
    let code = proc.timeline.events()[0].record.value().unwrap();
    assert_eq!(code, Value::I64(core_types::ERR_TYPE));
}
