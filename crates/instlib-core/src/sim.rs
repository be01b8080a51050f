//! A deterministic, in-process instrumentation host.
//!
//! [`Simulator`] plays the role of the instrumentation engine for tests and
//! demos. It does not decode or run machine code; callers describe what
//! executes, trace by trace, and the simulator drives the registered
//! [`Instrumenter`]s exactly the way the engine would:
//!
//! - the first execution of a trace instruments it, later executions reuse
//!   the cached hooks,
//! - for every instruction, [`IPoint::Before`] hooks run first, then either
//!   the [`IPoint::TakenBranch`] hooks (final instruction of the trace when
//!   a branch target is given) or the [`IPoint::After`] hooks (when the
//!   instruction falls through),
//! - hooks sharing a point run by [`CallOrder`], then by insertion.
//!
//! Only the final instruction of a trace transfers control; every other
//! instruction falls through.
//!
//! [`CallOrder`]: crate::CallOrder

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{
    Address, AnalysisArgs, Context, ContextChange, ContextChangeReason, IPoint, Image,
    ImageLocation, InstrumentationHost, Instrumenter, SourceLocation, Symbolization, ThreadId,
    Trace, TraceHooks,
};

/// A deterministic instrumentation host.
pub struct Simulator {
    instrumenters: RwLock<Vec<Arc<dyn Instrumenter>>>,
    memory: Mutex<HashMap<u64, u8>>,
    images: RwLock<Vec<Image>>,
    sources: Mutex<HashMap<Address, SourceLocation>>,
    traces: Mutex<HashMap<Address, Arc<TraceHooks>>>,
    current: Mutex<ThreadId>,
}

impl Simulator {
    /// Creates a simulator with nothing loaded.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instrumenters: RwLock::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
            images: RwLock::new(Vec::new()),
            sources: Mutex::new(HashMap::new()),
            traces: Mutex::new(HashMap::new()),
            current: Mutex::new(ThreadId(0)),
        })
    }

    fn instrumenters(&self) -> Vec<Arc<dyn Instrumenter>> {
        self.instrumenters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Writes `bytes` to application memory.
    pub fn write_memory(&self, address: Address, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        for (offset, byte) in bytes.iter().enumerate() {
            memory.insert(address.0 + offset as u64, *byte);
        }
    }

    /// Writes a NUL-terminated string to application memory.
    pub fn write_c_string(&self, address: Address, value: &str) {
        self.write_memory(address, value.as_bytes());
        self.write_memory(address + value.len() as u64, &[0]);
    }

    /// Attaches a source position to `address`.
    pub fn set_source_location(&self, address: Address, location: SourceLocation) {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner).insert(address, location);
    }

    /// Loads an image on thread `tid` and notifies instrumenters.
    pub fn load_image(&self, tid: ThreadId, image: Image) {
        tracing::debug!(name = %image.name, low = %image.low_address, "image load");

        self.images.write().unwrap_or_else(PoisonError::into_inner).push(image.clone());
        self.set_current(tid);

        for instrumenter in self.instrumenters() {
            instrumenter.image_load(&image);
        }
    }

    /// Starts thread `tid` with the given initial context.
    pub fn start_thread(&self, tid: ThreadId, context: &Context) {
        self.set_current(tid);

        for instrumenter in self.instrumenters() {
            instrumenter.thread_start(tid, context);
        }
    }

    /// Ends thread `tid`.
    pub fn exit_thread(&self, tid: ThreadId) {
        self.set_current(tid);

        for instrumenter in self.instrumenters() {
            instrumenter.thread_fini(tid);
        }
    }

    /// Delivers signal `signal` to thread `tid`, interrupting `from`.
    pub fn deliver_signal(&self, tid: ThreadId, signal: i32, from: &Context) {
        self.set_current(tid);

        let change = ContextChange {
            tid,
            reason: ContextChangeReason::Signal,
            from: Some(from),
            to: None,
            signal,
        };

        for instrumenter in self.instrumenters() {
            instrumenter.context_change(&change);
        }
    }

    /// Notifies instrumenters that the process is exiting.
    pub fn fini(&self) {
        for instrumenter in self.instrumenters() {
            instrumenter.fini();
        }
    }

    /// Discards all cached instrumentation.
    pub fn flush_cache(&self) {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Returns `true` if instrumentation deleted the instruction at
    /// `address` in a cached trace.
    pub fn is_deleted(&self, address: Address) -> bool {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|hooks| hooks.is_deleted(address))
    }

    /// Executes `trace` on thread `tid`.
    ///
    /// `context.ip` is updated before every instruction; the caller owns
    /// every other register. When `branch_target` is set, the final
    /// instruction's branch is taken to that target.
    pub fn execute(
        &self,
        tid: ThreadId,
        trace: &Trace,
        context: &mut Context,
        branch_target: Option<Address>,
    ) {
        self.set_current(tid);
        let hooks = self.hooks_for(trace);

        let count = trace.instructions().count();
        for (index, instruction) in trace.instructions().enumerate() {
            context.ip = instruction.address();

            run(&hooks, tid, context, IPoint::Before, None);

            let last = index + 1 == count;
            match branch_target {
                Some(target) if last => {
                    run(&hooks, tid, context, IPoint::TakenBranch, Some(target))
                }
                _ if instruction.has_fallthrough() => {
                    run(&hooks, tid, context, IPoint::After, None)
                }
                _ => {}
            }
        }
    }

    fn hooks_for(&self, trace: &Trace) -> Arc<TraceHooks> {
        if let Some(hooks) = self.traces.lock().unwrap_or_else(PoisonError::into_inner).get(&trace.address()) {
            return hooks.clone();
        }

        for instruction in trace.instructions() {
            self.write_memory(instruction.address(), instruction.bytes());
        }

        let mut hooks = TraceHooks::new();
        for instrumenter in self.instrumenters() {
            instrumenter.instrument_trace(trace, &mut hooks);
        }

        tracing::trace!(address = %trace.address(), hooks = hooks.len(), "trace instrumented");

        let hooks = Arc::new(hooks);
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(trace.address(), hooks.clone());
        hooks
    }

    fn set_current(&self, tid: ThreadId) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = tid;
    }
}

fn run(
    hooks: &TraceHooks,
    tid: ThreadId,
    context: &Context,
    point: IPoint,
    branch_target: Option<Address>,
) {
    let args = AnalysisArgs {
        tid,
        ip: context.ip,
        context,
        branch_target,
    };

    for call in hooks.calls(context.ip, point) {
        (call.callback)(&args);
    }
}

impl InstrumentationHost for Simulator {
    fn add_instrumenter(&self, instrumenter: Arc<dyn Instrumenter>) {
        self.instrumenters.write().unwrap_or_else(PoisonError::into_inner).push(instrumenter);
    }

    fn symbolize(&self, address: Address, source_location: bool) -> Symbolization {
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        let mut result = Symbolization::default();

        if let Some(image) = images.iter().find(|image| image.contains(address)) {
            result.image = Some(ImageLocation {
                name: image.name.clone(),
                low_address: image.low_address,
            });

            let routine = image
                .routines
                .iter()
                .enumerate()
                .filter(|(_, routine)| routine.address <= address)
                .max_by_key(|(_, routine)| routine.address);

            if let Some((index, routine)) = routine {
                result.routine_id = Some(index as u32);
                result.routine_name = routine.name.clone();
            }
        }

        if source_location {
            result.source = self.sources.lock().unwrap_or_else(PoisonError::into_inner).get(&address).cloned();
        }

        result
    }

    fn undecorate(&self, name: &str) -> String {
        match name.find('(') {
            Some(pos) => name[..pos].to_owned(),
            None => name.to_owned(),
        }
    }

    fn fetch_code(&self, address: Address, buffer: &mut [u8]) -> usize {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);

        let mut copied = 0;
        for (offset, slot) in buffer.iter_mut().enumerate() {
            match memory.get(&(address.0 + offset as u64)) {
                Some(byte) => *slot = *byte,
                None => break,
            }
            copied += 1;
        }

        copied
    }

    fn read_c_string(&self, address: Address, max_len: usize) -> Option<String> {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);

        let mut bytes = Vec::new();
        for offset in 0..max_len as u64 {
            match memory.get(&(address.0 + offset))? {
                0 => return String::from_utf8(bytes).ok(),
                byte => bytes.push(*byte),
            }
        }

        None
    }

    fn current_thread(&self) -> ThreadId {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "sim_tests.rs"]
mod tests;
