use std::sync::{
    Arc, Mutex, PoisonError, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use instlib_callstack::CallStackManager;
use instlib_core::{Address, Context, InstrumentationHost, ThreadId};

use crate::{
    Alarm, AlarmKind, AlarmSpec, ControlChain, ControlError, ControlEvent, EventId,
    InteractiveListener, Timeout,
    alarm::AlarmParams,
    chain::ChainClock,
};

/// What every alarm of one chain is built with.
pub(crate) struct AlarmSetup {
    pub host: Arc<dyn InstrumentationHost>,
    pub chain: Weak<ControlChain>,
    pub clock: Arc<ChainClock>,
    pub need_context: bool,
    pub late: bool,
    pub listener: Option<Arc<InteractiveListener>>,
}

#[derive(Debug)]
struct UniformState {
    remaining: u64,
    period: u64,
    length: u64,
}

/// Binds one [`Alarm`] to its place in a [`ControlChain`].
///
/// The manager owns the event the alarm fires, the thread and broadcast
/// policy used when it fires, and for uniform alarms the region state
/// machine that flips between `start` and `stop`.
pub struct AlarmManager {
    id: usize,
    chain: Weak<ControlChain>,
    alarm: Arc<Alarm>,

    event: AtomicU32,
    start_event: bool,
    last_event: AtomicU32,

    tid: Option<ThreadId>,
    bcast: bool,
    global: bool,

    uniform: Option<Mutex<UniformState>>,

    /// Whether firing arms the next alarm of the chain. Uniform alarms
    /// hold the chain until their last region.
    arm_next: AtomicBool,
}

impl AlarmManager {
    pub(crate) fn new(
        id: usize,
        spec: &AlarmSpec,
        event: EventId,
        setup: &AlarmSetup,
    ) -> Result<Arc<Self>, ControlError> {
        let timer = match spec.kind {
            AlarmKind::Timeout(duration) => Some(Timeout::spawn(duration)?),
            _ => None,
        };

        let listener = match spec.kind {
            AlarmKind::Interactive => Some(
                setup
                    .listener
                    .clone()
                    .ok_or(ControlError::InteractiveWithoutListener)?,
            ),
            _ => None,
        };

        let uniform = spec.uniform.map(|uniform| {
            Mutex::new(UniformState {
                remaining: uniform.count,
                period: uniform.period,
                length: uniform.length,
            })
        });

        tracing::debug!(
            chain = ?setup.chain.upgrade().map(|chain| chain.id()),
            alarm = id,
            kind = spec.kind.name(),
            %event,
            tid = ?spec.tid,
            bcast = spec.bcast,
            global = spec.global,
            "alarm created"
        );

        Ok(Arc::new_cyclic(|me| Self {
            id,
            chain: setup.chain.clone(),
            alarm: Alarm::new(AlarmParams {
                host: setup.host.clone(),
                manager: me.clone(),
                kind: spec.kind.clone(),
                target: spec.target,
                tid: spec.tid,
                global: spec.global,
                need_context: setup.need_context,
                late: setup.late,
                clock: setup.clock.clone(),
                timer,
                listener,
            }),
            event: AtomicU32::new(event.0),
            start_event: event == EventId::START,
            last_event: AtomicU32::new(event.0),
            tid: spec.tid,
            bcast: spec.bcast,
            global: spec.global,
            arm_next: AtomicBool::new(uniform.is_none()),
            uniform,
        }))
    }

    /// Returns the alarm's position in its chain.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the managed alarm.
    pub fn alarm(&self) -> &Arc<Alarm> {
        &self.alarm
    }

    /// Returns the event the alarm fires next.
    pub fn event(&self) -> EventId {
        EventId(self.event.load(Ordering::Acquire))
    }

    /// Returns the thread filter.
    pub fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    /// Returns `true` if firing disarms and rearms every thread.
    pub fn is_bcast(&self) -> bool {
        self.bcast
    }

    /// Returns `true` if the alarm counts across threads.
    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Returns `true` if the alarm fires `start`.
    pub fn has_start_event(&self) -> bool {
        self.start_event
    }

    /// Returns `true` if the alarm fires `precond`, which is not delivered
    /// to handlers.
    pub fn is_precond(&self) -> bool {
        self.event() == EventId::PRECOND
    }

    /// Returns `true` for a uniform region alarm.
    pub fn is_uniform(&self) -> bool {
        self.uniform.is_some()
    }

    /// Returns `true` once a uniform alarm has produced all its regions.
    pub fn uniform_done(&self) -> bool {
        self.uniform
            .as_ref()
            .is_some_and(|uniform| lock(uniform).remaining == 0)
    }

    pub(crate) fn activate(&self, call_stack: &dyn Fn() -> Arc<CallStackManager>) {
        self.alarm.activate(call_stack);
    }

    pub(crate) fn arm_all(&self) {
        self.alarm.arm();
    }

    pub(crate) fn arm_thread(&self, tid: ThreadId) {
        self.alarm.arm_thread(tid);
    }

    pub(crate) fn reset(&self) {
        self.alarm.reset();
    }

    pub(crate) fn reset_thread(&self, tid: ThreadId) {
        self.alarm.reset_thread(tid);
    }

    /// Disarms after a recognition. Returns `false` if another thread
    /// already consumed a global firing.
    fn disarm(&self, tid: ThreadId) -> bool {
        if self.global {
            return self.alarm.disarm_global();
        }

        if self.bcast {
            self.alarm.disarm();
        }
        else {
            self.alarm.disarm_thread(tid);
        }

        true
    }

    /// Handles a firing of the managed alarm.
    pub(crate) fn fire(&self, context: Option<&Context>, ip: Address, tid: ThreadId) {
        if !self.disarm(tid) {
            return;
        }

        let event = self.event();
        let mut broadcast = self.bcast;

        if let Some(uniform) = &self.uniform {
            let mut state = lock(uniform);
            if state.remaining > 0 {
                // Uniform regions restart every counter.
                self.alarm.disarm();
                broadcast = true;
                self.next_uniform_event(&mut state);
            }
        }

        self.last_event.store(event.0, Ordering::Release);

        let Some(chain) = self.chain.upgrade()
        else {
            return;
        };

        let event = ControlEvent {
            event,
            context,
            ip,
            tid,
            broadcast,
        };

        chain.fire(self.id, self.arm_next.load(Ordering::Acquire), &event);
    }

    /// Handles the late notification of the last firing.
    pub(crate) fn late_fire(&self, context: Option<&Context>, ip: Address, tid: ThreadId) {
        let Some(chain) = self.chain.upgrade()
        else {
            return;
        };

        chain.late_fire(&ControlEvent {
            event: EventId(self.last_event.load(Ordering::Acquire)),
            context,
            ip,
            tid,
            broadcast: self.bcast,
        });
    }

    fn next_uniform_event(&self, state: &mut UniformState) {
        match self.event() {
            EventId::START => {
                self.event.store(EventId::STOP.0, Ordering::Release);
                self.alarm.set_target(state.length);
                self.alarm.arm();
            }
            EventId::STOP => {
                state.remaining -= 1;

                if state.remaining == 0 {
                    tracing::debug!(alarm = self.id, "uniform regions done");
                    self.arm_next.store(true, Ordering::Release);
                    return;
                }

                self.event.store(EventId::START.0, Ordering::Release);
                self.alarm.set_target(state.period - state.length);
                self.alarm.arm();
            }
            _ => {}
        }
    }
}

fn lock(uniform: &Mutex<UniformState>) -> std::sync::MutexGuard<'_, UniformState> {
    uniform.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for AlarmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmManager")
            .field("id", &self.id)
            .field("kind", self.alarm.kind())
            .field("event", &self.event())
            .field("tid", &self.tid)
            .field("bcast", &self.bcast)
            .field("global", &self.global)
            .finish()
    }
}
