use std::sync::{Arc, Mutex};

use instlib_core::{
    Address, Context, ControlFlow, Image, InstrumentationHost, Instruction, Instrumenter as _,
    SourceLocation, ThreadId, Trace, sim::Simulator,
};

use super::CallStackManager;
use crate::{CallStack, CallStackOptions, UNKNOWN_IMAGE};

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const TID: ThreadId = ThreadId(0);

type Log = Arc<Mutex<Vec<(&'static str, Address)>>>;

fn recorder(log: &Log, tag: &'static str) -> impl Fn(Option<&Context>, Address, ThreadId) + use<> {
    let log = log.clone();
    move |_, ip, _| log.lock().unwrap().push((tag, ip))
}

fn manager(options: CallStackOptions) -> (Arc<Simulator>, Arc<CallStackManager>) {
    let sim = Simulator::new();
    let host: Arc<dyn InstrumentationHost> = sim.clone();
    let manager = CallStackManager::new(host, options);
    (sim, manager)
}

fn app_image() -> Image {
    Image::new("/bin/app", 0x40_0000u64, 0x40_ffffu64)
        .with_routine("main", 0x40_0100u64)
        .with_routine("ns::compute(int)", 0x40_1000u64)
}

/// Drives the manager the way the call hooks do.
fn call(manager: &CallStackManager, sp: u64, target: u64) {
    let target = Address(target);
    manager
        .stack(TID)
        .lock()
        .unwrap()
        .process_call(Address(sp), target);

    if manager.target_interesting(target) {
        manager.on_call(TID, None, target);
    }
}

/// Drives the manager the way the return hooks do.
fn ret(manager: &CallStackManager, sp: u64, ip: u64) {
    manager
        .stack(TID)
        .lock()
        .unwrap()
        .process_return(Address(sp), Address(ip));

    if manager.on_ret_should_fire(TID) {
        manager.on_ret_fire(TID, None, Address(ip));
    }
}

///////////////////////////////////////////////////////////////////////////////
// Enter / Exit
///////////////////////////////////////////////////////////////////////////////

#[test]
fn self_recursion_fires_exit_once() {
    let (_sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_ip_enter(Address(0xa000), false, recorder(&log, "enter"));
    manager.on_function_ip_exit(Address(0xa000), false, recorder(&log, "exit"));
    manager.thread_start(TID, &Context::default());

    call(&manager, 0x1000, 0xa000);
    call(&manager, 0x0ff0, 0xa000);
    call(&manager, 0x0fe0, 0xa000);

    ret(&manager, 0x0fd8, 0xa010);
    ret(&manager, 0x0fe8, 0xa010);
    assert_eq!(log.lock().unwrap().len(), 3, "only enters so far");

    ret(&manager, 0x0ff8, 0xa020);

    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        [
            ("enter", Address(0xa000)),
            ("enter", Address(0xa000)),
            ("enter", Address(0xa000)),
            ("exit", Address(0xa020)),
        ]
    );
}

#[test]
fn recursion_rearms_after_exit() {
    let (_sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_ip_exit(Address(0xa000), false, recorder(&log, "exit"));
    manager.thread_start(TID, &Context::default());

    for _ in 0..2 {
        call(&manager, 0x1000, 0xa000);
        call(&manager, 0x0ff0, 0xa000);
        ret(&manager, 0x0fe8, 0xa010);
        ret(&manager, 0x0ff8, 0xa010);
    }

    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn multi_depth_unwind_fires_deepest_first() {
    let (_sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_ip_exit(Address(0xb000), false, recorder(&log, "b"));
    manager.on_function_ip_exit(Address(0xa000), false, recorder(&log, "a"));
    manager.thread_start(TID, &Context::default());

    call(&manager, 0x1000, 0x1);
    call(&manager, 0x0ff0, 0x2);
    call(&manager, 0x0fe0, 0xb000); // armed at depth 3
    call(&manager, 0x0fd0, 0x3);
    call(&manager, 0x0fc0, 0xa000); // armed at depth 5
    call(&manager, 0x0fb0, 0x4);
    assert_eq!(manager.get_stack(TID).depth(), 6);

    // Unwinds three frames at once, then returns from the fourth.
    ret(&manager, 0x0fd8, 0x7777);
    assert_eq!(manager.get_stack(TID).depth(), 2);

    assert_eq!(
        log.lock().unwrap().clone(),
        [("a", Address(0x7777)), ("b", Address(0x7777))]
    );

    // Nothing left armed.
    ret(&manager, 0x0ff8, 0x8888);
    assert!(!manager.on_ret_should_fire(TID));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn should_fire_only_below_armed_depth() {
    let (_sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_ip_exit(Address(0xa000), false, recorder(&log, "exit"));
    manager.thread_start(TID, &Context::default());

    call(&manager, 0x1000, 0xa000);
    call(&manager, 0x0ff0, 0x1);
    ret(&manager, 0x0fe8, 0x10);
    assert!(log.lock().unwrap().is_empty());

    ret(&manager, 0x0ff8, 0x20);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
#[should_panic(expected = "no call stack")]
fn unknown_thread_panics() {
    let (_sim, manager) = manager(CallStackOptions::default());
    manager.get_stack(ThreadId(7));
}

///////////////////////////////////////////////////////////////////////////////
// Instrumentation
///////////////////////////////////////////////////////////////////////////////

#[test]
fn named_watchpoints_resolve_on_image_load() {
    let (sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_enter("compute", true, {
        let log = log.clone();
        move |context, ip, _| {
            assert!(context.is_some());
            log.lock().unwrap().push(("enter", ip));
        }
    });
    manager.on_function_exit("compute", false, recorder(&log, "exit"));
    manager.activate();
    manager.activate();

    assert!(!manager.target_interesting(Address(0x40_1000)));
    sim.load_image(TID, app_image());
    assert!(manager.target_interesting(Address(0x40_1000)));

    let mut context = Context::new(0x40_0100u64, 0x7000u64);
    sim.start_thread(TID, &context);

    let main = Trace::single(vec![
        Instruction::new(0x40_0100u64, &[0x90]),
        Instruction::new(0x40_0101u64, &[0xe8, 0xfa, 0x0e, 0x00, 0x00]).with_control_flow(
            ControlFlow::Direct {
                target: Address(0x40_1000),
                call: true,
            },
        ),
    ]);
    let compute = Trace::single(vec![
        Instruction::new(0x40_1000u64, &[0xc3]).with_control_flow(ControlFlow::Return),
    ]);

    sim.execute(TID, &main, &mut context, Some(Address(0x40_1000)));
    assert_eq!(manager.get_stack(TID).top_target(), Some(Address(0x40_1000)));

    context.sp = Address(0x6ff8);
    sim.execute(TID, &compute, &mut context, Some(Address(0x40_0106)));

    assert_eq!(manager.get_stack(TID).depth(), 0);
    assert_eq!(
        log.lock().unwrap().clone(),
        [("enter", Address(0x40_1000)), ("exit", Address(0x40_1000))]
    );
}

#[test]
fn indirect_calls_use_runtime_target() {
    let (sim, manager) = manager(CallStackOptions::default());
    let log = Log::default();

    manager.on_function_ip_enter(Address(0x5000), false, recorder(&log, "enter"));
    manager.activate();

    let mut context = Context::new(0x100u64, 0x7000u64);
    sim.start_thread(TID, &context);

    let trace = Trace::single(vec![
        Instruction::new(0x100u64, &[0xff, 0xd0])
            .with_control_flow(ControlFlow::Indirect { call: true }),
    ]);

    sim.execute(TID, &trace, &mut context, Some(Address(0x4000)));
    sim.execute(TID, &trace, &mut context, Some(Address(0x5000)));

    assert_eq!(log.lock().unwrap().clone(), [("enter", Address(0x5000))]);
    // Same SP both times: the second transfer replaced the first frame.
    assert_eq!(manager.get_stack(TID).targets(), [Address(0x5000)]);
}

///////////////////////////////////////////////////////////////////////////////
// Symbol Information
///////////////////////////////////////////////////////////////////////////////

#[test]
fn ip_info_resolves_and_caches() {
    let (sim, manager) = manager(CallStackOptions::default());
    sim.load_image(TID, app_image());
    sim.set_source_location(
        Address(0x40_1000),
        SourceLocation {
            file: "main.c".into(),
            line: 42,
            column: 7,
        },
    );

    let info = manager.ip_info(Address(0x40_1000));
    assert_eq!(info.function_name, "compute");
    assert_eq!(info.image_name, "/bin/app:0x1000");
    assert_eq!(info.file_name.as_deref(), Some("main.c"));
    assert_eq!((info.line, info.column), (42, 7));

    let info = manager.ip_info(Address(0x9999));
    assert_eq!(info.image_name, UNKNOWN_IMAGE);
    assert_eq!(info.function_name, "");
    assert_eq!(info.file_name, None);

    // Cached: a later image covering the address does not change the
    // answer.
    sim.load_image(TID, Image::new("/lib/late.so", 0x9000u64, 0x9fffu64));
    assert_eq!(manager.ip_info(Address(0x9999)).image_name, UNKNOWN_IMAGE);
}

#[test]
fn emit_stack_without_source() {
    let (sim, manager) = manager(CallStackOptions {
        source_location: false,
    });
    sim.load_image(TID, app_image());
    manager.thread_start(TID, &Context::default());

    call(&manager, 0x1000, 0x9999);
    call(&manager, 0x0ff0, 0x40_1000);

    let lines = manager.get_stack(TID).emit_stack(10, &manager);
    assert_eq!(lines.len(), 4);

    assert!(lines[0].starts_with("#                IP"));
    assert!(lines[0].ends_with(" FUNCTION                                        IMAGE NAME \n"));
    assert_eq!(lines[0].len(), 3 + 16 + 20 + 50 + 1);

    assert_eq!(
        lines[1],
        " 0# 0x0000000000401000  compute             /bin/app:0x1000     \n"
    );
    assert_eq!(
        lines[2],
        " 1# 0x0000000000009999                      UNKNOWN IMAGE       \n"
    );
    assert_eq!(lines[3], "\n");

    let lines = manager.get_stack(TID).emit_stack(1, &manager);
    assert_eq!(lines.len(), 3);

    let lines = manager.get_stack(TID).emit_stack(0, &manager);
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with(" 0# 0x0000000000401000"));

    let lines = CallStack::new().emit_stack(0, &manager);
    assert_eq!(lines.len(), 2);
}

#[test]
fn emit_stack_with_source() {
    let (sim, manager) = manager(CallStackOptions::default());
    sim.load_image(TID, app_image());
    sim.set_source_location(
        Address(0x40_1000),
        SourceLocation {
            file: "main.c".into(),
            line: 42,
            column: 7,
        },
    );
    manager.thread_start(TID, &Context::default());
    call(&manager, 0x1000, 0x40_1000);

    let lines = manager.get_stack(TID).emit_stack(5, &manager);
    assert!(lines[0].ends_with(" FILE NAME:LINE:COLUMN\n"));
    assert_eq!(
        lines[1],
        " 0# 0x0000000000401000  compute             /bin/app:0x1000      at main.c:42:7\n"
    );
}
