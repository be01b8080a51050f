use std::sync::{Arc, Mutex};

use super::Simulator;
use crate::{
    Address, CallOrder, Context, ControlFlow, IPoint, Image, InstrumentationHost as _,
    Instruction, Instrumenter, InstructionFlags, SourceLocation, ThreadId, Trace, TraceHooks,
};

///////////////////////////////////////////////////////////////////////////////
// Recording Instrumenter
///////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct Recorder {
    instrumented: Mutex<u32>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Instrumenter for Recorder {
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {
        *self.instrumented.lock().unwrap() += 1;

        for instruction in trace.instructions() {
            let events = self.events.clone();
            hooks.insert(instruction, IPoint::Before, CallOrder::Late, move |args| {
                events.lock().unwrap().push(format!("late {:x}", args.ip));
            });

            let events = self.events.clone();
            hooks.insert(instruction, IPoint::Before, CallOrder::First, move |args| {
                events.lock().unwrap().push(format!("first {:x}", args.ip));
            });

            if instruction.has_fallthrough() {
                let events = self.events.clone();
                hooks.insert(instruction, IPoint::After, CallOrder::Default, move |args| {
                    events.lock().unwrap().push(format!("after {:x}", args.ip));
                });
            }

            if instruction.is_valid_for_taken_branch() {
                let events = self.events.clone();
                hooks.insert(
                    instruction,
                    IPoint::TakenBranch,
                    CallOrder::Default,
                    move |args| {
                        let target = args.branch_target.unwrap();
                        events.lock().unwrap().push(format!("taken {target:x}"));
                    },
                );
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tests
///////////////////////////////////////////////////////////////////////////////

fn jump_trace() -> Trace {
    Trace::single(vec![
        Instruction::new(0x1000u64, &[0x90]),
        Instruction::new(0x1001u64, &[0x75, 0x10])
            .with_control_flow(ControlFlow::Direct {
                target: Address(0x2000),
                call: false,
            })
            .with_flags(InstructionFlags::FALLTHROUGH),
    ])
}

#[test]
fn hooks_run_by_stage_then_point() {
    let sim = Simulator::new();
    let recorder = Arc::new(Recorder::default());
    sim.add_instrumenter(recorder.clone());

    let mut context = Context::new(0x1000u64, 0x8000u64);
    sim.execute(ThreadId(0), &jump_trace(), &mut context, Some(Address(0x2000)));

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        [
            "first 1000",
            "late 1000",
            "after 1000",
            "first 1001",
            "late 1001",
            "taken 2000",
        ]
    );
}

#[test]
fn not_taken_branch_falls_through() {
    let sim = Simulator::new();
    let recorder = Arc::new(Recorder::default());
    sim.add_instrumenter(recorder.clone());

    let mut context = Context::new(0x1000u64, 0x8000u64);
    sim.execute(ThreadId(0), &jump_trace(), &mut context, None);

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.last().map(String::as_str), Some("after 1001"));
}

#[test]
fn traces_are_instrumented_once() {
    let sim = Simulator::new();
    let recorder = Arc::new(Recorder::default());
    sim.add_instrumenter(recorder.clone());

    let trace = jump_trace();
    let mut context = Context::default();
    sim.execute(ThreadId(0), &trace, &mut context, None);
    sim.execute(ThreadId(1), &trace, &mut context, None);
    assert_eq!(*recorder.instrumented.lock().unwrap(), 1);

    sim.flush_cache();
    sim.execute(ThreadId(0), &trace, &mut context, None);
    assert_eq!(*recorder.instrumented.lock().unwrap(), 2);
}

#[test]
fn memory_and_symbols() {
    let sim = Simulator::new();
    sim.load_image(
        ThreadId(0),
        Image::new("/usr/lib/libfoo.so", 0x40_0000u64, 0x40_ffffu64)
            .with_routine("foo", 0x40_1000u64)
            .with_routine("bar", 0x40_2000u64),
    );
    sim.set_source_location(
        Address(0x40_2010),
        SourceLocation {
            file: "bar.c".into(),
            line: 12,
            column: 3,
        },
    );
    sim.write_c_string(Address(0x9000), "region");

    let info = sim.symbolize(Address(0x40_2010), true);
    assert_eq!(info.routine_name, "bar");
    assert_eq!(info.routine_id, Some(1));
    assert_eq!(info.image.unwrap().low_address, Address(0x40_0000));
    assert_eq!(info.source.unwrap().line, 12);

    let info = sim.symbolize(Address(0x50_0000), true);
    assert_eq!(info.image, None);
    assert_eq!(info.routine_name, "");

    assert_eq!(
        sim.read_c_string(Address(0x9000), 128).as_deref(),
        Some("region")
    );
    assert_eq!(sim.read_c_string(Address(0x9000), 3), None);

    let mut buffer = [0u8; 8];
    assert_eq!(sim.fetch_code(Address(0x9000), &mut buffer), 7);
    assert_eq!(&buffer[..6], b"region");

    assert_eq!(sim.undecorate("ns::foo(int, char)"), "ns::foo");
}
