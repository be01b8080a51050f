//! A tool and its controller sharing one call-stack manager.

use std::sync::{Arc, Mutex};

use instlib::{
    Address, Context, ControlFlow, Image, InstrumentationHost, Instruction, ThreadId, Trace,
    callstack::{CallStackManager, CallStackOptions},
    control::{ControlConfig, ControlEvent, ControlManager, EventId},
    sim::Simulator,
};

const TID: ThreadId = ThreadId(0);

#[test]
fn function_region() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let sim = Simulator::new();
    let host: Arc<dyn InstrumentationHost> = sim.clone();

    let call_stack = CallStackManager::new(host.clone(), CallStackOptions::default());
    let entries = Arc::new(Mutex::new(Vec::new()));
    call_stack.on_function_enter("compute", false, {
        let entries = entries.clone();
        move |_, ip, _| entries.lock().unwrap().push(ip)
    });

    let controller = ControlManager::new(
        host,
        ControlConfig::default().with_control("start:enter_func:compute,stop:exit_func:compute"),
    );
    controller.set_call_stack_manager(call_stack.clone()).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    controller
        .register_handler(
            Arc::new({
                let events = events.clone();
                move |event: &ControlEvent<'_>| events.lock().unwrap().push((event.event, event.ip))
            }),
            false,
            None,
        )
        .unwrap();
    controller.activate().unwrap();

    sim.load_image(
        TID,
        Image::new("/bin/app", 0x40_0000u64, 0x40_ffffu64)
            .with_routine("main", 0x40_0100u64)
            .with_routine("ns::compute(int)", 0x40_1000u64),
    );

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
    context.sp = Address(0x6ff8);
    sim.execute(TID, &compute, &mut context, Some(Address(0x40_0106)));
    sim.fini();

    assert_eq!(entries.lock().unwrap().clone(), [Address(0x40_1000)]);
    assert_eq!(
        events.lock().unwrap().clone(),
        [
            (EventId::START, Address(0x40_1000)),
            (EventId::STOP, Address(0x40_1000)),
        ]
    );
    assert_eq!(controller.chains()[0].passes(TID), 1);
    assert_eq!(call_stack.get_stack(TID).depth(), 0);
}
