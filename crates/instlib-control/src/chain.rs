use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
};

use instlib_callstack::CallStackManager;
use instlib_core::{MAX_THREADS, ThreadId};
use once_cell::sync::OnceCell;

use crate::{AlarmManager, ControlEvent, ControlManager, EventId, Repeat};

const CLOCK_FOLLOW: u8 = 0;
const CLOCK_RUNNING: u8 = 1;
const CLOCK_STOPPED: u8 = 2;

/// Per-thread instruction clock of a chain.
///
/// Absolute `icount` alarms count only while the clock runs for the
/// executing thread. A thread without its own state follows the chain-wide
/// flag.
pub(crate) struct ChainClock {
    all: AtomicBool,
    threads: Box<[AtomicU8]>,
}

impl ChainClock {
    pub fn new() -> Self {
        Self {
            all: AtomicBool::new(false),
            threads: (0..MAX_THREADS).map(|_| AtomicU8::new(CLOCK_FOLLOW)).collect(),
        }
    }

    pub fn start_all(&self) {
        self.all.store(true, Ordering::Release);
        for state in &self.threads {
            state.store(CLOCK_FOLLOW, Ordering::Release);
        }
    }

    pub fn stop_all(&self) {
        self.all.store(false, Ordering::Release);
        for state in &self.threads {
            state.store(CLOCK_FOLLOW, Ordering::Release);
        }
    }

    pub fn start(&self, tid: ThreadId) {
        self.threads[tid.index()].store(CLOCK_RUNNING, Ordering::Release);
    }

    pub fn stop(&self, tid: ThreadId) {
        self.threads[tid.index()].store(CLOCK_STOPPED, Ordering::Release);
    }

    pub fn running(&self, tid: ThreadId) -> bool {
        match self.threads[tid.index()].load(Ordering::Acquire) {
            CLOCK_RUNNING => true,
            CLOCK_STOPPED => false,
            _ => self.all.load(Ordering::Acquire),
        }
    }
}

/// Region membership of a chain built by a region controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainRegion {
    pub tag: u64,
    pub tid: ThreadId,
}

/// An ordered sequence of alarms parsed from one control string.
///
/// Only the next alarm of a chain is armed. When it fires, the chain
/// forwards the event to the [`ControlManager`] and arms its successor;
/// after the last alarm it either starts another pass or releases the
/// chains waiting for it.
pub struct ControlChain {
    id: usize,
    manager: Weak<ControlManager>,
    alarms: OnceCell<Vec<Arc<AlarmManager>>>,
    clock: Arc<ChainClock>,
    repeat: Repeat,
    passes: Box<[AtomicU32]>,
    name: Option<String>,
    waitfor: Option<usize>,
    waiting: OnceCell<Vec<Weak<ControlChain>>>,
    blocked: AtomicBool,
    region: Option<ChainRegion>,
}

impl ControlChain {
    pub(crate) fn new(
        id: usize,
        manager: Weak<ControlManager>,
        repeat: Repeat,
        name: Option<String>,
        waitfor: Option<usize>,
        region: Option<ChainRegion>,
    ) -> Self {
        Self {
            id,
            manager,
            alarms: OnceCell::new(),
            clock: Arc::new(ChainClock::new()),
            repeat,
            passes: (0..MAX_THREADS).map(|_| AtomicU32::new(0)).collect(),
            name,
            waitfor,
            waiting: OnceCell::new(),
            blocked: AtomicBool::new(false),
            region,
        }
    }

    pub(crate) fn clock(&self) -> &Arc<ChainClock> {
        &self.clock
    }

    pub(crate) fn set_alarms(&self, alarms: Vec<Arc<AlarmManager>>) {
        if self.alarms.set(alarms).is_err() {
            tracing::warn!(chain = self.id, "chain alarms already set");
        }
    }

    pub(crate) fn set_waiting(&self, waiting: Vec<Weak<ControlChain>>) {
        if self.waiting.set(waiting).is_err() {
            tracing::warn!(chain = self.id, "chain waiters already set");
        }
    }

    /// Returns the chain's position in the manager.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the chain's name, if it was given one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the id of the chain this one waits for.
    pub fn waitfor(&self) -> Option<usize> {
        self.waitfor
    }

    /// Returns how many passes the chain makes per thread.
    pub fn repeat(&self) -> Repeat {
        self.repeat
    }

    /// Returns the alarms in firing order.
    pub fn alarms(&self) -> &[Arc<AlarmManager>] {
        self.alarms.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the number of completed passes on `tid`.
    pub fn passes(&self, tid: ThreadId) -> u32 {
        self.passes[tid.index()].load(Ordering::Acquire)
    }

    /// Returns `true` once the region tracker rejected one of the chain's
    /// events.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn block(&self) {
        self.blocked.store(true, Ordering::Release);
    }

    pub(crate) fn region(&self) -> Option<ChainRegion> {
        self.region
    }

    /// Returns `true` if any alarm fires `start`.
    pub fn has_start_event(&self) -> bool {
        self.alarms().iter().any(|alarm| alarm.has_start_event())
    }

    /// Activates every alarm and, unless the chain waits for another one,
    /// arms the first alarm.
    pub(crate) fn activate(&self, call_stack: &dyn Fn() -> Arc<CallStackManager>) {
        for alarm in self.alarms() {
            alarm.activate(call_stack);
        }

        if self.waitfor.is_some() {
            tracing::debug!(chain = self.id, waitfor = ?self.waitfor, "chain waiting");
            return;
        }

        let Some(first) = self.alarms().first()
        else {
            return;
        };

        let tid = self.region.map(|region| region.tid).or(first.tid());
        match tid {
            Some(tid) if !first.is_global() => {
                self.clock.start(tid);
                first.arm_thread(tid);
            }
            _ => {
                self.clock.start_all();
                first.arm_all();
            }
        }
    }

    /// Handles the firing of alarm `alarm_id`.
    pub(crate) fn fire(&self, alarm_id: usize, arm_next: bool, event: &ControlEvent<'_>) {
        if self.is_blocked() {
            return;
        }

        if event.event != EventId::PRECOND
            && let Some(manager) = self.manager.upgrade()
        {
            manager.fire(event, Some(self));
        }

        // The manager may have blocked the chain.
        if self.is_blocked() {
            return;
        }

        if arm_next {
            self.arm_next_alarm(alarm_id, event.tid, event.broadcast);
        }
    }

    pub(crate) fn late_fire(&self, event: &ControlEvent<'_>) {
        if self.is_blocked() {
            return;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.late_fire(event);
        }
    }

    fn arm(&self, alarm_id: usize, tid: ThreadId, bcast: bool) {
        let Some(alarm) = self.alarms().get(alarm_id)
        else {
            return;
        };

        if bcast || alarm.is_global() {
            alarm.arm_all();
        }
        else {
            alarm.arm_thread(tid);
        }
    }

    fn arm_next_alarm(&self, alarm_id: usize, tid: ThreadId, bcast: bool) {
        if alarm_id + 1 < self.alarms().len() {
            self.arm(alarm_id + 1, tid, bcast);
            return;
        }

        let passes = self.passes[tid.index()].fetch_add(1, Ordering::AcqRel) + 1;
        let again = match self.repeat {
            Repeat::Forever => true,
            Repeat::Times(times) => passes < times,
        };

        if again {
            tracing::debug!(chain = self.id, %tid, passes, "chain repeats");
            for alarm in self.alarms() {
                if bcast || alarm.is_global() {
                    alarm.reset();
                }
                else {
                    alarm.reset_thread(tid);
                }
            }

            self.arm(0, tid, bcast);
            return;
        }

        tracing::debug!(chain = self.id, %tid, passes, "chain finished");
        if bcast {
            self.clock.stop_all();
        }
        else {
            self.clock.stop(tid);
        }

        self.arm_waiting_chains(tid);
    }

    fn arm_waiting_chains(&self, tid: ThreadId) {
        let Some(waiting) = self.waiting.get()
        else {
            return;
        };

        for chain in waiting.iter().filter_map(Weak::upgrade) {
            tracing::debug!(chain = chain.id, released_by = self.id, %tid, "chain released");
            chain.arm_chain(tid);
        }
    }

    fn arm_chain(&self, tid: ThreadId) {
        for alarm in self.alarms() {
            alarm.reset_thread(tid);
        }

        self.clock.start(tid);

        if let Some(first) = self.alarms().first() {
            first.arm_thread(tid);
        }
    }
}

impl std::fmt::Debug for ControlChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChain")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("waitfor", &self.waitfor)
            .field("repeat", &self.repeat)
            .field("alarms", &self.alarms().len())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
