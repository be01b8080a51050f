use std::sync::{
    Arc, PoisonError,
    atomic::Ordering,
};

use instlib_callstack::CallStackManager;
use instlib_core::{
    Address, AnalysisArgs, CallOrder, Context, ContextChange, ContextChangeReason, Hex, IPoint,
    Image, Instruction, Instrumenter, Opcode, ThreadId, Trace, TraceHooks,
};

use super::{AddressTarget, Alarm, AlarmKind, SIM_CMD_MARKER, find_pattern, ssc_marker};

/// Longest region name `MPI_Pcontrol` alarms compare, including the NUL.
const MAX_PCONTROL_REGION: usize = 128;

impl Alarm {
    /// Registers the alarm's instrumentation.
    ///
    /// Function enter/exit alarms register with the call-stack manager
    /// returned by `call_stack`; every other kind registers with the host.
    pub(crate) fn activate(self: &Arc<Self>, call_stack: impl FnOnce() -> Arc<CallStackManager>) {
        match &self.kind {
            AlarmKind::Itext(bytes) => tracing::debug!(
                alarm = self.kind.name(),
                tid = ?self.tid,
                target = self.target(),
                itext = %Hex(bytes.as_slice()),
                "alarm activated"
            ),
            AlarmKind::Ssc(marker) => tracing::debug!(
                alarm = self.kind.name(),
                tid = ?self.tid,
                target = self.target(),
                ssc = %Hex(*marker),
                "alarm activated"
            ),
            _ => tracing::debug!(
                alarm = self.kind.name(),
                tid = ?self.tid,
                target = self.target(),
                "alarm activated"
            ),
        }

        let (name, exit) = match &self.kind {
            AlarmKind::EnterFunc(name) => (name.clone(), false),
            AlarmKind::ExitFunc(name) => (name.clone(), true),
            _ => {
                self.host.add_instrumenter(self.clone());
                return;
            }
        };

        let manager = call_stack();
        let alarm = Arc::downgrade(self);
        let handler = move |context: Option<&Context>, ip: Address, tid: ThreadId| {
            if let Some(alarm) = alarm.upgrade()
                && alarm.count(tid, 1)
            {
                alarm.fire(context, ip, tid);
            }
        };

        if exit {
            manager.on_function_exit(name, self.need_context, handler);
        }
        else {
            manager.on_function_enter(name, self.need_context, handler);
        }

        manager.activate();
    }

    /// Inserts a hook that fires the alarm when `predicate` holds.
    fn insert_fire(
        &self,
        hooks: &mut TraceHooks,
        instruction: &Instruction,
        point: IPoint,
        predicate: impl Fn(&Alarm, &AnalysisArgs<'_>) -> bool + Send + Sync + 'static,
    ) {
        let Some(alarm) = self.me.upgrade()
        else {
            return;
        };

        hooks.insert(instruction, point, CallOrder::Default, move |args| {
            if predicate(&alarm, args) {
                alarm.fire(Some(args.context), args.ip, args.tid);
            }
        });

        self.insert_late(hooks, instruction);
    }

    /// Inserts a hook that counts `n` recognitions and fires at the
    /// target.
    fn insert_count(&self, hooks: &mut TraceHooks, instruction: &Instruction, point: IPoint, n: u64) {
        self.insert_fire(hooks, instruction, point, move |alarm, args| {
            alarm.count(args.tid, n)
        });
    }

    /// Delivers the late notification once `instruction` has completed.
    ///
    /// System calls and interrupts end the trace, so nothing after them is
    /// precise; they get no late notification.
    fn insert_late(&self, hooks: &mut TraceHooks, instruction: &Instruction) {
        if !self.late || instruction.is_syscall_or_interrupt() {
            return;
        }

        let Some(alarm) = self.me.upgrade()
        else {
            return;
        };

        let mut points = Vec::with_capacity(2);
        if instruction.has_fallthrough() {
            points.push(IPoint::After);
        }
        if instruction.is_valid_for_taken_branch() {
            points.push(IPoint::TakenBranch);
        }

        for point in points {
            let alarm = alarm.clone();
            hooks.insert(instruction, point, CallOrder::Late, move |args| {
                if alarm.activate_late(args.tid) {
                    alarm.late_fire(Some(args.context), args.ip, args.tid);
                }
            });
        }
    }

    /// Counts `n` instructions ahead of every other hook at `point`, then
    /// checks the target.
    ///
    /// An alarm armed by another alarm firing on the same block starts
    /// counting with the next block.
    fn insert_icount(&self, hooks: &mut TraceHooks, tail: &Instruction, point: IPoint, n: u64) {
        let Some(alarm) = self.me.upgrade()
        else {
            return;
        };

        hooks.insert(tail, point, CallOrder::First, move |args| alarm.tally(args.tid, n));
        self.insert_fire(hooks, tail, point, |alarm, args| alarm.reached(args.tid));
    }

    /// Counts each block's instructions once the block has run.
    fn instrument_icount(&self, trace: &Trace, hooks: &mut TraceHooks) {
        for block in trace.blocks() {
            let tail = block.tail();
            let n = block.len() as u64;

            let fallthrough = tail.has_fallthrough();
            let taken = tail.is_valid_for_taken_branch();

            if fallthrough {
                self.insert_icount(hooks, tail, IPoint::After, n);
            }
            if taken {
                self.insert_icount(hooks, tail, IPoint::TakenBranch, n);
            }
            if !fallthrough && !taken {
                self.insert_icount(hooks, tail, IPoint::Before, n);
            }
        }
    }

    fn instrument_address(&self, trace: &Trace, hooks: &mut TraceHooks) {
        let Some(address) = self.address()
        else {
            return;
        };

        let in_trace = trace.address() <= address && address <= trace.end_address();

        for block in trace.blocks() {
            let tail = block.tail();

            match tail.direct_target() {
                Some(target) if target == address => {
                    self.insert_count(hooks, tail, IPoint::TakenBranch, 1);
                }
                Some(_) => {}
                None if tail.is_valid_for_taken_branch() => {
                    self.insert_fire(hooks, tail, IPoint::TakenBranch, move |alarm, args| {
                        args.branch_target == Some(address) && alarm.count(args.tid, 1)
                    });
                }
                None => {}
            }

            if !in_trace {
                continue;
            }

            for instruction in block.instructions() {
                // A thread may start right at the address.
                if instruction.address() == address {
                    let point = if instruction.is_valid_for_taken_branch() {
                        IPoint::TakenBranch
                    }
                    else {
                        IPoint::After
                    };

                    if point == IPoint::TakenBranch || instruction.has_fallthrough() {
                        self.insert_fire(hooks, instruction, point, move |alarm, args| {
                            alarm.take_first_ip(args.tid) == Some(address) && alarm.count(args.tid, 1)
                        });
                    }
                }

                if !instruction.has_fallthrough() {
                    break;
                }

                if instruction.next_address() == address {
                    self.insert_count(hooks, instruction, IPoint::After, 1);
                }
            }
        }
    }

    fn instrument_pattern(&self, trace: &Trace, hooks: &mut TraceHooks, pattern: &[u8]) {
        for instruction in find_pattern(&*self.host, trace, pattern) {
            tracing::trace!(
                alarm = self.kind.name(),
                address = %instruction.address(),
                pattern = %Hex(pattern),
                "pattern found"
            );
            self.insert_count(hooks, instruction, IPoint::Before, 1);
        }
    }

    fn instrument_instructions(&self, trace: &Trace, hooks: &mut TraceHooks) {
        for instruction in trace.instructions() {
            match &self.kind {
                AlarmKind::Int3 if instruction.opcode() == Opcode::Int3 => {
                    self.insert_count(hooks, instruction, IPoint::Before, 1);
                    hooks.delete(instruction);
                }
                AlarmKind::IsaCategory(category) if instruction.category() == category => {
                    self.insert_count(hooks, instruction, IPoint::Before, 1);
                }
                AlarmKind::IsaExtension(extension) if instruction.extension() == extension => {
                    self.insert_count(hooks, instruction, IPoint::Before, 1);
                }
                AlarmKind::Cpuid(leaf) if instruction.opcode() == Opcode::Cpuid => {
                    let leaf = u64::from(*leaf);
                    self.insert_fire(hooks, instruction, IPoint::Before, move |alarm, args| {
                        args.context.ax == leaf && alarm.count(args.tid, 1)
                    });
                }
                AlarmKind::Magic { a, b } if instruction.opcode() == Opcode::XchgBxBx => {
                    let (a, b) = (u64::from(*a), u64::from(*b));
                    self.insert_fire(hooks, instruction, IPoint::Before, move |alarm, args| {
                        let context = args.context;
                        context.ax == SIM_CMD_MARKER
                            && context.bx == a
                            && context.cx == b
                            && alarm.count(args.tid, 1)
                    });
                }
                AlarmKind::Pcontrol(region)
                    if self.pcontrol_entries().contains(&instruction.address()) =>
                {
                    let region = region.clone();
                    self.insert_fire(hooks, instruction, IPoint::Before, move |alarm, args| {
                        alarm.pcontrol_region(args).as_deref() == Some(region.as_str())
                            && alarm.count(args.tid, 1)
                    });
                }
                _ => {}
            }
        }
    }

    /// Checks an armed-only condition at every block head.
    fn instrument_block_heads(
        &self,
        trace: &Trace,
        hooks: &mut TraceHooks,
        condition: impl Fn(&Alarm) -> bool + Clone + Send + Sync + 'static,
    ) {
        for block in trace.blocks() {
            let condition = condition.clone();
            self.insert_fire(hooks, block.head(), IPoint::Before, move |alarm, args| {
                alarm.armed_for(args.tid) && condition(alarm)
            });
        }
    }

    fn pcontrol_region(&self, args: &AnalysisArgs<'_>) -> Option<String> {
        let pointer = args.context.function_argument(1)?;
        self.host.read_c_string(Address(pointer), MAX_PCONTROL_REGION)
    }

    fn take_first_ip(&self, tid: ThreadId) -> Option<Address> {
        match self.first_ip[tid.index()].swap(0, Ordering::AcqRel) {
            0 => None,
            ip => Some(Address(ip)),
        }
    }

    fn resolve(&self, address: Address) {
        tracing::debug!(alarm = self.kind.name(), %address, "alarm address resolved");
        self.address.store(address.0, Ordering::Release);
    }
}

impl Instrumenter for Alarm {
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {
        match &self.kind {
            AlarmKind::Icount { .. } => self.instrument_icount(trace, hooks),
            AlarmKind::Address(_) => self.instrument_address(trace, hooks),
            AlarmKind::Ssc(value) => self.instrument_pattern(trace, hooks, &ssc_marker(*value)),
            AlarmKind::Itext(bytes) => self.instrument_pattern(trace, hooks, bytes),
            AlarmKind::Timeout(_) => self.instrument_block_heads(trace, hooks, |alarm| {
                alarm.timer.as_ref().is_some_and(|timer| timer.expired())
            }),
            AlarmKind::Interactive => self.instrument_block_heads(trace, hooks, |alarm| {
                alarm
                    .listener
                    .as_ref()
                    .is_some_and(|listener| listener.signal_pending())
            }),
            AlarmKind::Int3
            | AlarmKind::IsaCategory(_)
            | AlarmKind::IsaExtension(_)
            | AlarmKind::Cpuid(_)
            | AlarmKind::Magic { .. }
            | AlarmKind::Pcontrol(_) => self.instrument_instructions(trace, hooks),
            AlarmKind::EnterFunc(_)
            | AlarmKind::ExitFunc(_)
            | AlarmKind::Signal(_)
            | AlarmKind::ImageLoad(_) => {}
        }
    }

    fn image_load(&self, image: &Image) {
        match &self.kind {
            AlarmKind::Address(AddressTarget::Symbol(symbol)) => {
                if let Some(found) = image.symbols.iter().find(|candidate| &candidate.name == symbol) {
                    self.resolve(Address(found.value.wrapping_add(image.load_offset)));
                }
            }
            AlarmKind::Address(AddressTarget::Image { name, offset }) => {
                if &image.name == name || image.basename() == name {
                    self.resolve(image.low_address + *offset);
                }
            }
            AlarmKind::Pcontrol(_) => {
                let mut entries = self.pcontrol.write().unwrap_or_else(PoisonError::into_inner);
                for routine in &image.routines {
                    if routine.name.contains("MPI_Pcontrol") {
                        entries.insert(routine.address);
                    }
                }
            }
            AlarmKind::ImageLoad(name) => {
                if image.basename() != name {
                    return;
                }

                let tid = self.host.current_thread();
                if self.armed_for(tid) {
                    self.fire(None, image.low_address, tid);
                }
            }
            _ => {}
        }
    }

    fn thread_start(&self, tid: ThreadId, context: &Context) {
        if matches!(self.kind, AlarmKind::Address(_)) {
            self.first_ip[tid.index()].store(context.ip.0, Ordering::Release);
        }
    }

    fn context_change(&self, change: &ContextChange<'_>) {
        let AlarmKind::Signal(signal) = self.kind
        else {
            return;
        };

        if change.reason != ContextChangeReason::Signal || change.signal != signal {
            return;
        }

        if self.armed_for(change.tid) {
            let ip = change.from.map(|from| from.ip).unwrap_or_default();
            self.fire(change.from, ip, change.tid);
        }
    }
}
