use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use instlib_callstack::{CallStackManager, CallStackOptions};
use instlib_core::{
    Address, CallOrder, Context, IPoint, InstrumentationHost, Instrumenter, MAX_THREADS, ThreadId,
    Trace, TraceHooks,
};
use once_cell::sync::OnceCell;

use crate::{
    AlarmManager, ChainSpec, ControlChain, ControlConfig, ControlError, ControllerEvents, EventId,
    InteractiveListener, RegionChain, RegionTracker,
    alarm_manager::AlarmSetup,
    chain::ChainRegion,
    default_start::DefaultStart,
    legacy::legacy_chains,
    log::EventLog,
};

/// An event delivered to control handlers.
#[derive(Debug, Clone, Copy)]
pub struct ControlEvent<'a> {
    /// The fired event.
    pub event: EventId,

    /// Register state at the firing instruction, when the handler asked for
    /// it and the alarm could provide it.
    pub context: Option<&'a Context>,

    /// Address of the firing instruction.
    pub ip: Address,

    /// The firing thread.
    pub tid: ThreadId,

    /// The event applies to every thread.
    pub broadcast: bool,
}

/// A control event handler.
pub type ControlHandler = Arc<dyn Fn(&ControlEvent<'_>) + Send + Sync>;

struct Registration {
    handler: ControlHandler,
    pass_context: bool,
    late: Option<ControlHandler>,
}

struct RegionSource {
    chains: Vec<RegionChain>,
    tracker: Arc<dyn RegionTracker>,
}

struct PendingChain {
    spec: ChainSpec,
    region: Option<ChainRegion>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every control chain and dispatches their events to tool handlers.
///
/// A tool creates the manager, registers its handlers and calls
/// [`activate`]. Activation parses the configured chains, instruments their
/// alarms and, when nothing declares a start event, starts every thread
/// on its first instruction.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use instlib_control::{ControlConfig, ControlEvent, ControlManager, EventId};
/// # fn example(host: Arc<dyn instlib_core::InstrumentationHost>) -> Result<(), instlib_control::ControlError> {
/// let config = ControlConfig::default().with_control("start:icount:100,stop:icount:200");
/// let manager = ControlManager::new(host, config);
/// manager.register_handler(
///     Arc::new(|event: &ControlEvent<'_>| {
///         if event.event == EventId::START {
///             println!("thread {} started at {}", event.tid, event.ip);
///         }
///     }),
///     false,
///     None,
/// )?;
/// manager.activate()?;
/// # Ok(())
/// # }
/// ```
///
/// [`activate`]: Self::activate
pub struct ControlManager {
    me: Weak<Self>,
    host: Arc<dyn InstrumentationHost>,
    config: ControlConfig,

    events: RwLock<ControllerEvents>,
    pending: Mutex<Vec<Registration>>,
    handlers: OnceCell<Vec<Registration>>,
    activated: AtomicBool,

    chains: OnceCell<Vec<Arc<ControlChain>>>,
    call_stack: OnceCell<Arc<CallStackManager>>,

    regions: Mutex<Option<RegionSource>>,
    external: Mutex<Option<RegionSource>>,
    tracker: OnceCell<Arc<dyn RegionTracker>>,

    listener: OnceCell<Arc<InteractiveListener>>,
    log: OnceCell<EventLog>,
    default_start: OnceCell<Arc<DefaultStart>>,
}

impl ControlManager {
    /// Creates a manager. Nothing is parsed or instrumented until
    /// [`activate`].
    ///
    /// [`activate`]: Self::activate
    pub fn new(host: Arc<dyn InstrumentationHost>, config: ControlConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host,
            config,
            events: RwLock::new(ControllerEvents::default()),
            pending: Mutex::new(Vec::new()),
            handlers: OnceCell::new(),
            activated: AtomicBool::new(false),
            chains: OnceCell::new(),
            call_stack: OnceCell::new(),
            regions: Mutex::new(None),
            external: Mutex::new(None),
            tracker: OnceCell::new(),
            listener: OnceCell::new(),
            log: OnceCell::new(),
            default_start: OnceCell::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    fn check_not_activated(&self) -> Result<(), ControlError> {
        if self.activated.load(Ordering::Acquire) {
            return Err(ControlError::AlreadyActivated);
        }

        Ok(())
    }

    /// Registers an event handler, and optionally a handler for the late
    /// delivery after the firing instruction completes.
    ///
    /// Handlers run in registration order. `pass_context` requests the
    /// register context; without it handlers see `context: None`.
    pub fn register_handler(
        &self,
        handler: ControlHandler,
        pass_context: bool,
        late_handler: Option<ControlHandler>,
    ) -> Result<(), ControlError> {
        self.check_not_activated()?;

        lock(&self.pending).push(Registration {
            handler,
            pass_context,
            late: late_handler,
        });

        Ok(())
    }

    /// Registers a tool-defined event, returning its id.
    pub fn add_event(&self, name: &str) -> EventId {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(name)
    }

    /// Returns the name of event `id`.
    pub fn event_name(&self, id: EventId) -> Option<String> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name(id)
            .map(str::to_owned)
    }

    /// Returns the id of event `name`.
    pub fn event_id(&self, name: &str) -> Option<EventId> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id(name)
    }

    /// Supplies the chains of an in-process region controller.
    pub fn set_region_controller(
        &self,
        chains: Vec<RegionChain>,
        tracker: Arc<dyn RegionTracker>,
    ) -> Result<(), ControlError> {
        self.check_not_activated()?;
        *lock(&self.regions) = Some(RegionSource { chains, tracker });
        Ok(())
    }

    /// Supplies the chains of an external region source.
    pub fn add_external_region_chains(
        &self,
        chains: Vec<RegionChain>,
        tracker: Arc<dyn RegionTracker>,
    ) -> Result<(), ControlError> {
        self.check_not_activated()?;

        let mut external = lock(&self.external);
        match &mut *external {
            Some(source) => source.chains.extend(chains),
            None => *external = Some(RegionSource { chains, tracker }),
        }

        Ok(())
    }

    /// Shares the tool's call-stack manager with function alarms. Without
    /// one, the controller creates its own on demand.
    pub fn set_call_stack_manager(&self, manager: Arc<CallStackManager>) -> Result<(), ControlError> {
        self.check_not_activated()?;

        self.call_stack
            .set(manager)
            .map_err(|_| ControlError::Conflict("call stack manager already set"))
    }

    fn call_stack(&self) -> Arc<CallStackManager> {
        self.call_stack
            .get_or_init(|| CallStackManager::new(self.host.clone(), CallStackOptions::default()))
            .clone()
    }

    /// Parses and activates every configured chain.
    pub fn activate(self: &Arc<Self>) -> Result<(), ControlError> {
        if self.activated.swap(true, Ordering::AcqRel) {
            return Err(ControlError::AlreadyActivated);
        }

        let handlers = std::mem::take(&mut *lock(&self.pending));
        let late = handlers.iter().any(|registration| registration.late.is_some());
        let pass_context = late || handlers.iter().any(|registration| registration.pass_context);
        let _ = self.handlers.set(handlers);

        let regions = lock(&self.regions).take().filter(|source| !source.chains.is_empty());
        let external = lock(&self.external).take().filter(|source| !source.chains.is_empty());
        let has_control = !self.config.control.is_empty();
        let interactive = self.config.interactive_file.is_some();

        if regions.is_some() {
            if has_control {
                return Err(ControlError::Conflict("-control and region controller"));
            }
            if interactive {
                return Err(ControlError::Conflict("interactive and region controller"));
            }
            if self.config.has_legacy() {
                return Err(ControlError::Conflict("legacy knobs and region controller"));
            }
        }

        if external.is_some() {
            if has_control || interactive || regions.is_some() {
                return Err(ControlError::Conflict(
                    "external regions with -control, interactive or region controller",
                ));
            }
            if self.config.has_legacy() {
                return Err(ControlError::Conflict("legacy knobs and external regions"));
            }
        }

        if interactive && self.config.has_legacy() {
            return Err(ControlError::Conflict("legacy knobs and interactive controller"));
        }

        if self.config.log {
            let log = EventLog::create(&self.config.log_file)?;
            tracing::info!(path = %self.config.log_file.display(), "controller log opened");
            let _ = self.log.set(log);
        }

        if let Some(file) = &self.config.interactive_file {
            let listener = InteractiveListener::bind(file)?;
            tracing::info!(name = %file.display(), "interactive controller created");
            let _ = self.listener.set(Arc::new(listener));
        }

        let mut pending = Vec::new();

        for (index, control) in self.config.control.iter().enumerate() {
            tracing::info!(knob = index, %control, "normal controller knob");
            pending.push(PendingChain {
                spec: ChainSpec::parse(control)?,
                region: None,
            });
        }

        if let Some(source) = regions {
            for (index, chain) in source.chains.iter().enumerate() {
                tracing::info!(knob = index, control = %chain.control, "regions controller knob");
                pending.push(region_chain(chain)?);
            }

            let _ = self.tracker.set(source.tracker);
        }

        if self.config.has_legacy() {
            for spec in legacy_chains(&self.config)? {
                pending.push(PendingChain { spec, region: None });
            }
        }

        if let Some(source) = external {
            for (index, chain) in source.chains.iter().enumerate() {
                tracing::info!(
                    knob = index,
                    control = %chain.control,
                    "external regions controller knob"
                );
                pending.push(region_chain(chain)?);
            }

            let _ = self.tracker.set(source.tracker);
        }

        let chains = self.build_chains(pending, pass_context, late)?;

        if self.config.debug {
            for chain in &chains {
                tracing::info!(?chain, "control chain");
                for alarm in chain.alarms() {
                    tracing::info!(chain = chain.id(), ?alarm, "control alarm");
                }
            }
        }

        let _ = self.chains.set(chains);

        // The log's instruction clock runs ahead of every alarm.
        self.host.add_instrumenter(self.clone());

        let call_stack = || self.call_stack();
        for chain in self.chains() {
            chain.activate(&call_stack);
        }

        if self.config.default_start && !self.has_start_event() {
            tracing::debug!("no start event configured, starting every thread");

            let default_start = Arc::new(DefaultStart::new(self.me.clone()));
            self.host.add_instrumenter(default_start.clone());
            let _ = self.default_start.set(default_start);
        }

        tracing::info!(chains = self.chains().len(), "controller activated");
        Ok(())
    }

    fn build_chains(
        &self,
        pending: Vec<PendingChain>,
        pass_context: bool,
        late: bool,
    ) -> Result<Vec<Arc<ControlChain>>, ControlError> {
        let uniforms = pending
            .iter()
            .flat_map(|chain| &chain.spec.alarms)
            .filter(|alarm| alarm.uniform.is_some())
            .count();

        if uniforms > 1 {
            return Err(ControlError::DuplicateUniform);
        }

        let mut names = HashMap::new();
        let mut chains = Vec::with_capacity(pending.len());

        for (id, PendingChain { spec, region }) in pending.iter().enumerate() {
            let waitfor = match &spec.waitfor {
                Some(name) => Some(
                    *names
                        .get(name.as_str())
                        .ok_or_else(|| ControlError::UnknownChain(name.clone()))?,
                ),
                None => None,
            };

            if let Some(name) = &spec.name
                && names.insert(name.as_str(), id).is_some()
            {
                tracing::warn!(%name, chain = id, "chain name reused");
            }

            chains.push(Arc::new(ControlChain::new(
                id,
                self.me.clone(),
                spec.repeat,
                spec.name.clone(),
                waitfor,
                *region,
            )));
        }

        for (chain, PendingChain { spec, .. }) in chains.iter().zip(&pending) {
            let setup = AlarmSetup {
                host: self.host.clone(),
                chain: Arc::downgrade(chain),
                clock: chain.clock().clone(),
                need_context: pass_context,
                late,
                listener: self.listener.get().cloned(),
            };

            let alarms = spec
                .alarms
                .iter()
                .enumerate()
                .map(|(id, alarm)| {
                    let event = self
                        .event_id(&alarm.event)
                        .ok_or_else(|| ControlError::UnknownEvent(alarm.event.clone()))?;

                    AlarmManager::new(id, alarm, event, &setup)
                })
                .collect::<Result<Vec<_>, _>>()?;

            chain.set_alarms(alarms);
        }

        for chain in &chains {
            let waiting = chains
                .iter()
                .filter(|waiter| waiter.waitfor() == Some(chain.id()))
                .map(Arc::downgrade)
                .collect();

            chain.set_waiting(waiting);
        }

        Ok(chains)
    }

    /// Returns the chains, empty before activation.
    pub fn chains(&self) -> &[Arc<ControlChain>] {
        self.chains.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the id of the chain named `name`.
    pub fn chain_id(&self, name: &str) -> Option<usize> {
        self.chains()
            .iter()
            .find(|chain| chain.name() == Some(name))
            .map(|chain| chain.id())
    }

    /// Returns `true` if some chain or region source declares a start
    /// event.
    pub fn has_start_event(&self) -> bool {
        self.tracker.get().is_some() || self.chains().iter().any(|chain| chain.has_start_event())
    }

    fn uniform_alarm(&self) -> Option<&Arc<AlarmManager>> {
        self.chains()
            .iter()
            .flat_map(|chain| chain.alarms())
            .find(|alarm| alarm.is_uniform())
    }

    /// Returns `true` if a uniform region alarm is configured.
    pub fn uniform_active(&self) -> bool {
        self.uniform_alarm().is_some()
    }

    /// Returns `true` once the uniform alarm produced all its regions.
    pub fn uniform_done(&self) -> bool {
        self.uniform_alarm().is_some_and(|alarm| alarm.uniform_done())
    }

    /// Returns the interactive listener, if one was configured.
    pub fn listener(&self) -> Option<&Arc<InteractiveListener>> {
        self.listener.get()
    }

    /// Returns `true` once [`activate`] ran.
    ///
    /// [`activate`]: Self::activate
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    fn handlers(&self) -> &[Registration] {
        self.handlers.get().map(Vec::as_slice).unwrap_or_default()
    }

    fn icount(&self, tid: ThreadId) -> u64 {
        self.log.get().map_or(0, |log| log.icount(tid))
    }

    /// Dispatches `event` to every handler.
    pub(crate) fn fire(&self, event: &ControlEvent<'_>, chain: Option<&ControlChain>) {
        let region = chain.and_then(ControlChain::region);
        let tag = region.map_or(0, |region| region.tag);
        let tid = event.tid;

        let name = self.event_name(event.event).unwrap_or_default();
        tracing::debug!(%tid, event = %name, ip = %event.ip, broadcast = event.broadcast, "control event");

        if let Some(log) = self.log.get() {
            log.line(format_args!(
                "TID{tid}:  event: {name} at icount: {} ip: {:#x} handler: {tag:#x}",
                self.icount(tid),
                event.ip,
            ));
        }

        if let (Some(chain), Some(region), Some(tracker)) = (chain, region, self.tracker.get())
            && !tracker.triggered(tid, event.event, region.tag)
        {
            if let Some(log) = self.log.get() {
                log.line(format_args!(
                    "TID{tid}:  ignore non legal event: {name} at icount: {} ip: {:#x} handler: {tag:#x}",
                    self.icount(tid),
                    event.ip,
                ));
            }

            tracing::warn!(
                %tid,
                event = %name,
                chain = chain.id(),
                "illegal region event, chain blocked"
            );
            chain.block();
            return;
        }

        for registration in self.handlers() {
            dispatch(&registration.handler, registration.pass_context, event);
        }
    }

    /// Dispatches the late delivery of `event`.
    pub(crate) fn late_fire(&self, event: &ControlEvent<'_>) {
        let tid = event.tid;

        if let Some(log) = self.log.get() {
            let name = self.event_name(event.event).unwrap_or_default();
            log.line(format_args!(
                "TID{tid}:  late Fire event: {name} at icount: {} ip: {:#x}",
                self.icount(tid),
                event.ip,
            ));
        }

        for registration in self.handlers() {
            if let Some(late) = &registration.late {
                dispatch(late, registration.pass_context, event);
            }
        }
    }
}

fn dispatch(handler: &ControlHandler, pass_context: bool, event: &ControlEvent<'_>) {
    if pass_context {
        handler(event);
    }
    else {
        handler(&ControlEvent {
            context: None,
            ..*event
        });
    }
}

fn region_chain(chain: &RegionChain) -> Result<PendingChain, ControlError> {
    if chain.tid.0 as usize >= MAX_THREADS {
        return Err(ControlError::ThreadOutOfRange(chain.tid.0));
    }

    Ok(PendingChain {
        spec: ChainSpec::parse(&chain.control)?,
        region: Some(ChainRegion {
            tag: chain.tag,
            tid: chain.tid,
        }),
    })
}

impl Instrumenter for ControlManager {
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {
        if self.log.get().is_none() {
            return;
        }

        for block in trace.blocks() {
            let manager = self.me.clone();
            let n = block.len() as u64;

            hooks.insert(block.head(), IPoint::Before, CallOrder::First, move |args| {
                if let Some(manager) = manager.upgrade()
                    && let Some(log) = manager.log.get()
                {
                    log.add_instructions(args.tid, n);
                }
            });
        }
    }

    fn fini(&self) {
        if let Some(listener) = self.listener.get() {
            listener.close();
        }

        if let Some(log) = self.log.get() {
            log.flush();
        }

        tracing::debug!("controller finished");
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
