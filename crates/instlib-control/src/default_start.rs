use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use instlib_core::{CallOrder, IPoint, Instrumenter, MAX_THREADS, Trace, TraceHooks};

use crate::{ControlEvent, ControlManager, EventId};

/// Fires `start` on the first instruction each thread executes.
///
/// Installed when no chain declares a start event, so tools that only
/// configure a stop condition begin in the running state.
pub(crate) struct DefaultStart {
    manager: Weak<ControlManager>,
    started: Arc<[AtomicBool]>,
}

impl DefaultStart {
    pub fn new(manager: Weak<ControlManager>) -> Self {
        Self {
            manager,
            started: (0..MAX_THREADS).map(|_| AtomicBool::new(false)).collect(),
        }
    }
}

impl Instrumenter for DefaultStart {
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {
        let manager = self.manager.clone();
        let started = self.started.clone();

        // Every thread enters through some trace head.
        hooks.insert(trace.blocks()[0].head(), IPoint::Before, CallOrder::First, move |args| {
            if started[args.tid.index()].swap(true, Ordering::AcqRel) {
                return;
            }

            let Some(manager) = manager.upgrade()
            else {
                return;
            };

            tracing::debug!(tid = %args.tid, ip = %args.ip, "default start");
            manager.fire(
                &ControlEvent {
                    event: EventId::START,
                    context: Some(args.context),
                    ip: args.ip,
                    tid: args.tid,
                    broadcast: false,
                },
                None,
            );
        });
    }
}
