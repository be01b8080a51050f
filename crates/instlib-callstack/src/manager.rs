use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use instlib_core::{
    Address, AnalysisArgs, CallOrder, Context, ControlFlow, IPoint, Image, InstructionFlags,
    InstrumentationHost, Instrumenter, ThreadId, Trace, TraceHooks,
};
use smallvec::SmallVec;

use crate::{
    CallStack, CallStackInfo, CallStackOptions,
    info::{UNKNOWN_IMAGE, remove_namespace},
};

/// A function enter or exit handler.
///
/// Receives the register context (only when some registration asked for
/// it), the instruction pointer (the function entry for enter handlers,
/// the unwinding return for exit handlers) and the thread.
pub type CallStackHandler = Arc<dyn Fn(Option<&Context>, Address, ThreadId) + Send + Sync>;

/// Shared handle to a thread's call stack.
pub type CallStackHandle = Arc<Mutex<CallStack>>;

/// A registered watchpoint.
struct Watch {
    handler: CallStackHandler,

    /// Routine name to resolve on image load, `None` for watchpoints
    /// registered by address.
    function_name: Option<String>,
}

type Watches = SmallVec<[Arc<Watch>; 2]>;

#[derive(Default)]
struct Watchpoints {
    named_enter: Vec<Arc<Watch>>,
    named_exit: Vec<Arc<Watch>>,
    enter: HashMap<Address, Watches>,
    exit: HashMap<Address, Watches>,
}

/// An exit watchpoint armed at some call-stack depth.
struct PendingExit {
    entry: Address,
    watches: Watches,
}

/// Process-wide call-stack tracking.
///
/// Owns one [`CallStack`] per thread and dispatches function enter/exit
/// notifications. An exit watchpoint for function `F` is armed when a call
/// to `F` is taken, remembering the call-stack depth at that point; it
/// fires on the first return that unwinds below that depth. While armed,
/// recursive calls to `F` do not re-arm it, so `F -> F -> F` reports a
/// single exit when the outermost `F` returns.
///
/// Construct one manager per process and share the [`Arc`]. Call stacks
/// live in the manager for the rest of the process.
///
/// # Locking
///
/// Every shared table has its own lock, taken for a single lookup or
/// update. Handlers run with no manager lock held.
pub struct CallStackManager {
    me: Weak<Self>,
    host: Arc<dyn InstrumentationHost>,
    options: CallStackOptions,
    activated: AtomicBool,
    need_context: AtomicBool,

    /// Call stack of every thread seen so far.
    stacks: Mutex<HashMap<ThreadId, CallStackHandle>>,

    /// Permanent symbol cache. Loaded images are assumed not to change
    /// their symbol tables.
    info: Mutex<HashMap<Address, CallStackInfo>>,

    watchpoints: RwLock<Watchpoints>,

    /// Armed exit watchpoints per thread, keyed by depth.
    pending: Mutex<HashMap<ThreadId, BTreeMap<usize, PendingExit>>>,

    /// Entry addresses with an armed exit watchpoint.
    marked: Mutex<HashSet<Address>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CallStackManager {
    /// Creates a manager. Nothing is instrumented until [`activate`].
    ///
    /// [`activate`]: Self::activate
    pub fn new(host: Arc<dyn InstrumentationHost>, options: CallStackOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host,
            options,
            activated: AtomicBool::new(false),
            need_context: AtomicBool::new(false),
            stacks: Mutex::new(HashMap::new()),
            info: Mutex::new(HashMap::new()),
            watchpoints: RwLock::new(Watchpoints::default()),
            pending: Mutex::new(HashMap::new()),
            marked: Mutex::new(HashSet::new()),
        })
    }

    /// Registers the manager with the host. Later calls do nothing.
    pub fn activate(self: &Arc<Self>) {
        if self.activated.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(
            source_location = self.options.source_location,
            "call stack manager activated"
        );

        self.host.add_instrumenter(self.clone());
    }

    /// Returns the options the manager was created with.
    pub fn options(&self) -> CallStackOptions {
        self.options
    }

    /// Returns `true` if any handler asked for the register context.
    pub fn need_context(&self) -> bool {
        self.need_context.load(Ordering::Relaxed)
    }

    /// Stores the call stack of thread `tid`, replacing any previous one.
    pub fn add_stack(&self, tid: ThreadId, stack: CallStack) {
        lock(&self.stacks).insert(tid, Arc::new(Mutex::new(stack)));
    }

    /// Returns the live call stack of thread `tid`.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no call stack.
    pub fn stack(&self, tid: ThreadId) -> CallStackHandle {
        match lock(&self.stacks).get(&tid) {
            Some(stack) => stack.clone(),
            None => panic!("no call stack for thread {tid}"),
        }
    }

    /// Returns a snapshot of the call stack of thread `tid`.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no call stack.
    pub fn get_stack(&self, tid: ThreadId) -> CallStack {
        lock(&self.stack(tid)).clone()
    }

    fn depth(&self, tid: ThreadId) -> usize {
        lock(&self.stack(tid)).depth()
    }

    /// Returns symbol information for `ip`, resolving it on first use.
    pub fn ip_info(&self, ip: Address) -> CallStackInfo {
        if let Some(info) = lock(&self.info).get(&ip) {
            return info.clone();
        }

        let symbolization = self.host.symbolize(ip, self.options.source_location);
        let undecorated = self.host.undecorate(&symbolization.routine_name);

        let image_name = match &symbolization.image {
            Some(image) => format!("{}:{:#x}", image.name, ip - image.low_address),
            None => String::from(UNKNOWN_IMAGE),
        };

        let mut info = CallStackInfo {
            routine_id: symbolization.routine_id,
            function_name: remove_namespace(&undecorated).to_owned(),
            image_name,
            ..Default::default()
        };

        if let Some(source) = symbolization.source.filter(|source| !source.file.is_empty()) {
            info.file_name = Some(source.file);
            info.line = source.line;
            info.column = source.column;
        }

        lock(&self.info).entry(ip).or_insert(info).clone()
    }

    /// Calls `handler` whenever a routine named `function_name` is entered.
    ///
    /// The name is matched against undecorated routine names without
    /// namespace, in images loaded after registration.
    pub fn on_function_enter(
        &self,
        function_name: impl Into<String>,
        need_context: bool,
        handler: impl Fn(Option<&Context>, Address, ThreadId) + Send + Sync + 'static,
    ) {
        let watch = self.watch(Some(function_name.into()), need_context, handler);
        self.write_watchpoints().named_enter.push(watch);
    }

    /// Calls `handler` whenever a routine named `function_name` returns
    /// to its outermost caller.
    pub fn on_function_exit(
        &self,
        function_name: impl Into<String>,
        need_context: bool,
        handler: impl Fn(Option<&Context>, Address, ThreadId) + Send + Sync + 'static,
    ) {
        let watch = self.watch(Some(function_name.into()), need_context, handler);
        self.write_watchpoints().named_exit.push(watch);
    }

    /// Calls `handler` whenever control enters `address`.
    pub fn on_function_ip_enter(
        &self,
        address: Address,
        need_context: bool,
        handler: impl Fn(Option<&Context>, Address, ThreadId) + Send + Sync + 'static,
    ) {
        let watch = self.watch(None, need_context, handler);
        self.write_watchpoints()
            .enter
            .entry(address)
            .or_default()
            .push(watch);
    }

    /// Calls `handler` whenever the function at `address` returns to its
    /// outermost caller.
    pub fn on_function_ip_exit(
        &self,
        address: Address,
        need_context: bool,
        handler: impl Fn(Option<&Context>, Address, ThreadId) + Send + Sync + 'static,
    ) {
        let watch = self.watch(None, need_context, handler);
        self.write_watchpoints()
            .exit
            .entry(address)
            .or_default()
            .push(watch);
    }

    fn watch(
        &self,
        function_name: Option<String>,
        need_context: bool,
        handler: impl Fn(Option<&Context>, Address, ThreadId) + Send + Sync + 'static,
    ) -> Arc<Watch> {
        if need_context {
            self.need_context.store(true, Ordering::Relaxed);
        }

        Arc::new(Watch {
            handler: Arc::new(handler),
            function_name,
        })
    }

    fn write_watchpoints(&self) -> std::sync::RwLockWriteGuard<'_, Watchpoints> {
        self.watchpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_watchpoints(&self) -> std::sync::RwLockReadGuard<'_, Watchpoints> {
        self.watchpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if `address` has an enter or exit watchpoint.
    pub fn target_interesting(&self, address: Address) -> bool {
        let watchpoints = self.read_watchpoints();
        watchpoints.enter.contains_key(&address) || watchpoints.exit.contains_key(&address)
    }

    /// Handles a taken transfer to an interesting `target`.
    ///
    /// Runs the enter handlers of `target`, then arms its exit watchpoint
    /// at the current depth unless it is already armed.
    pub fn on_call(&self, tid: ThreadId, context: Option<&Context>, target: Address) {
        let (enter, exit) = {
            let watchpoints = self.read_watchpoints();
            (
                watchpoints.enter.get(&target).cloned(),
                watchpoints.exit.get(&target).cloned(),
            )
        };

        for watch in enter.iter().flatten() {
            (watch.handler)(context, target, tid);
        }

        let Some(watches) = exit
        else {
            return;
        };

        // Recursion while armed: only the outermost call reports the exit.
        if !lock(&self.marked).insert(target) {
            return;
        }

        let depth = self.depth(tid);
        tracing::trace!(%tid, %target, depth, "exit watchpoint armed");

        let replaced = lock(&self.pending).entry(tid).or_default().insert(
            depth,
            PendingExit {
                entry: target,
                watches,
            },
        );

        if let Some(replaced) = replaced {
            lock(&self.marked).remove(&replaced.entry);
        }
    }

    /// Returns `true` if the last return unwound below an armed exit
    /// watchpoint of thread `tid`.
    pub fn on_ret_should_fire(&self, tid: ThreadId) -> bool {
        let depth = self.depth(tid);

        lock(&self.pending)
            .get(&tid)
            .is_some_and(|pending| pending.range(depth + 1..).next().is_some())
    }

    /// Fires and disarms every exit watchpoint of thread `tid` armed
    /// deeper than the current depth, deepest first.
    pub fn on_ret_fire(&self, tid: ThreadId, context: Option<&Context>, ip: Address) {
        let depth = self.depth(tid);

        let fired = match lock(&self.pending).get_mut(&tid) {
            Some(pending) => pending.split_off(&(depth + 1)),
            None => return,
        };

        for (armed_depth, exit) in fired.into_iter().rev() {
            tracing::trace!(%tid, entry = %exit.entry, armed_depth, depth, "exit watchpoint fired");

            for watch in &exit.watches {
                (watch.handler)(context, ip, tid);
            }

            lock(&self.marked).remove(&exit.entry);
        }
    }

    fn context<'a>(&self, args: &AnalysisArgs<'a>) -> Option<&'a Context> {
        self.need_context().then_some(args.context)
    }
}

impl Instrumenter for CallStackManager {
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {
        let Some(me) = self.me.upgrade()
        else {
            return;
        };

        for block in trace.blocks() {
            let tail = block.tail();

            if tail.flags().contains(InstructionFlags::RTM) {
                continue;
            }

            match tail.control_flow() {
                ControlFlow::Direct { target, .. } => {
                    let manager = me.clone();
                    hooks.insert(tail, IPoint::Before, CallOrder::Default, move |args| {
                        lock(&manager.stack(args.tid)).process_call(args.context.sp, target);
                    });

                    if self.target_interesting(target) {
                        let manager = me.clone();
                        hooks.insert(
                            tail,
                            IPoint::TakenBranch,
                            CallOrder::Default,
                            move |args| {
                                manager.on_call(args.tid, manager.context(args), target);
                            },
                        );
                    }
                }
                ControlFlow::Indirect { .. } => {
                    let manager = me.clone();
                    hooks.insert(
                        tail,
                        IPoint::TakenBranch,
                        CallOrder::Default,
                        move |args| {
                            let Some(target) = args.branch_target
                            else {
                                return;
                            };

                            lock(&manager.stack(args.tid)).process_call(args.context.sp, target);

                            if manager.target_interesting(target) {
                                manager.on_call(args.tid, manager.context(args), target);
                            }
                        },
                    );
                }
                ControlFlow::Return => {
                    let manager = me.clone();
                    hooks.insert(tail, IPoint::Before, CallOrder::Default, move |args| {
                        lock(&manager.stack(args.tid)).process_return(args.context.sp, args.ip);
                    });

                    let manager = me.clone();
                    hooks.insert(
                        tail,
                        IPoint::TakenBranch,
                        CallOrder::Default,
                        move |args| {
                            if manager.on_ret_should_fire(args.tid) {
                                manager.on_ret_fire(args.tid, manager.context(args), args.ip);
                            }
                        },
                    );
                }
                ControlFlow::None => {}
            }
        }
    }

    fn image_load(&self, image: &Image) {
        let mut watchpoints = self.write_watchpoints();
        let Watchpoints {
            named_enter,
            named_exit,
            enter,
            exit,
        } = &mut *watchpoints;

        let mut resolved = 0;
        for routine in &image.routines {
            let undecorated = self.host.undecorate(&routine.name);
            let name = remove_namespace(&undecorated);

            for (named, map) in [(&*named_enter, &mut *enter), (&*named_exit, &mut *exit)] {
                for watch in named
                    .iter()
                    .filter(|watch| watch.function_name.as_deref() == Some(name))
                {
                    map.entry(routine.address).or_default().push(watch.clone());
                    resolved += 1;
                }
            }
        }

        if resolved > 0 {
            tracing::debug!(image = %image.name, resolved, "call stack watchpoints resolved");
        }
    }

    fn thread_start(&self, tid: ThreadId, _context: &Context) {
        self.add_stack(tid, CallStack::new());
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
