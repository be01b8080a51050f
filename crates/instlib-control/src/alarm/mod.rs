//! Alarms: recognizers of runtime conditions.
//!
//! An [`Alarm`] watches for one [`AlarmKind`] of condition. Instrumentation
//! for every kind is inserted once, when the alarm is activated; whether a
//! recognized condition counts is decided at run time by the alarm's
//! per-thread state:
//!
//! - `armed[tid]`: set by the owning chain when this alarm is next,
//! - `count[tid]`: recognitions so far, compared against the target,
//! - a global armed flag and counter for `global` alarms.
//!
//! Absolute `icount` alarms are the exception: they count whenever the
//! chain's instruction clock runs for the thread, armed or not, so that
//! `start:icount:100,stop:icount:200` stops after the 200th instruction
//! rather than 200 instructions after the start.

mod instrument;
mod kind;
mod pattern;
mod timeout;

use std::{
    collections::HashSet,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use instlib_core::{Address, Context, InstrumentationHost, MAX_THREADS, ThreadId};

pub use self::{
    kind::{AddressTarget, AlarmKind, MAX_INSTRUCTION_SIZE, SIM_CMD_MARKER},
    pattern::{find_pattern, ssc_marker},
    timeout::Timeout,
};
use crate::{AlarmManager, InteractiveListener, chain::ChainClock};

fn per_thread<T>(init: impl Fn() -> T) -> Box<[T]> {
    (0..MAX_THREADS).map(|_| init()).collect()
}

/// Everything an alarm is built from.
pub(crate) struct AlarmParams {
    pub host: Arc<dyn InstrumentationHost>,
    pub manager: Weak<AlarmManager>,
    pub kind: AlarmKind,
    pub target: u64,
    pub tid: Option<ThreadId>,
    pub global: bool,
    pub need_context: bool,
    pub late: bool,
    pub clock: Arc<ChainClock>,
    pub timer: Option<Timeout>,
    pub listener: Option<Arc<InteractiveListener>>,
}

/// A runtime condition recognizer.
pub struct Alarm {
    me: Weak<Self>,
    host: Arc<dyn InstrumentationHost>,
    manager: Weak<AlarmManager>,
    kind: AlarmKind,
    tid: Option<ThreadId>,
    global: bool,
    need_context: bool,

    /// Deliver a second, late notification after the firing instruction.
    late: bool,

    target: AtomicU64,
    clock: Arc<ChainClock>,

    armed: Box<[AtomicBool]>,
    counts: Box<[AtomicU64]>,
    global_armed: AtomicBool,
    global_count: AtomicU64,
    late_pending: Box<[AtomicBool]>,

    /// Resolved address of `address` alarms; 0 until resolved.
    address: AtomicU64,

    /// First instruction each thread executed, for `address` alarms.
    first_ip: Box<[AtomicU64]>,

    /// Entry points of `MPI_Pcontrol` routines seen so far.
    pcontrol: RwLock<HashSet<Address>>,

    timer: Option<Timeout>,
    listener: Option<Arc<InteractiveListener>>,
}

impl Alarm {
    pub(crate) fn new(params: AlarmParams) -> Arc<Self> {
        let address = match &params.kind {
            AlarmKind::Address(AddressTarget::Raw(address)) => address.0,
            _ => 0,
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host: params.host,
            manager: params.manager,
            kind: params.kind,
            tid: params.tid,
            global: params.global,
            need_context: params.need_context,
            late: params.late,
            target: AtomicU64::new(params.target),
            clock: params.clock,
            armed: per_thread(|| AtomicBool::new(false)),
            counts: per_thread(|| AtomicU64::new(0)),
            global_armed: AtomicBool::new(false),
            global_count: AtomicU64::new(0),
            late_pending: per_thread(|| AtomicBool::new(false)),
            address: AtomicU64::new(address),
            first_ip: per_thread(|| AtomicU64::new(0)),
            pcontrol: RwLock::new(HashSet::new()),
            timer: params.timer,
            listener: params.listener,
        })
    }

    /// Returns what the alarm recognizes.
    pub fn kind(&self) -> &AlarmKind {
        &self.kind
    }

    /// Returns the thread filter.
    pub fn tid(&self) -> Option<ThreadId> {
        self.tid
    }

    /// Returns `true` if the alarm counts across threads.
    pub fn has_global_counter(&self) -> bool {
        self.global
    }

    /// Returns the number of recognitions needed to fire.
    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }

    pub(crate) fn set_target(&self, target: u64) {
        self.target.store(target, Ordering::Release);
    }

    /// Returns the resolved address of an `address` alarm.
    pub fn address(&self) -> Option<Address> {
        match self.address.load(Ordering::Acquire) {
            0 => None,
            address => Some(Address(address)),
        }
    }

    fn correct_tid(&self, tid: ThreadId) -> bool {
        self.tid.is_none_or(|filter| filter == tid)
    }

    /// Absolute instruction counts run on the chain clock.
    fn counts_on_clock(&self) -> bool {
        matches!(self.kind, AlarmKind::Icount { relative: false })
    }

    /// Returns `true` if the alarm is armed for `tid`.
    pub fn is_armed(&self, tid: ThreadId) -> bool {
        if self.global {
            return self.global_armed.load(Ordering::Acquire);
        }

        self.armed[tid.index()].load(Ordering::Acquire)
    }

    /// Returns the per-thread count of `tid`.
    pub fn count_of(&self, tid: ThreadId) -> u64 {
        self.counts[tid.index()].load(Ordering::Acquire)
    }

    /// Returns the global count.
    pub fn global_count_value(&self) -> u64 {
        self.global_count.load(Ordering::Acquire)
    }

    /// Adds `n` recognitions on `tid`. Returns `true` if the alarm should
    /// fire now.
    pub fn count(&self, tid: ThreadId, n: u64) -> bool {
        self.tally(tid, n);
        self.reached(tid)
    }

    /// Adds `n` recognitions on `tid` without checking the target.
    ///
    /// Absolute instruction counts accumulate while the chain clock runs;
    /// everything else accumulates only while armed.
    pub fn tally(&self, tid: ThreadId, n: u64) {
        if !self.correct_tid(tid) {
            return;
        }

        let counting = if self.counts_on_clock() {
            self.clock.running(tid)
        }
        else {
            self.is_armed(tid)
        };

        if !counting {
            return;
        }

        if self.global {
            self.global_count.fetch_add(n, Ordering::AcqRel);
        }
        else {
            self.counts[tid.index()].fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Returns `true` if the alarm is armed for `tid` and its count has
    /// reached the target.
    pub fn reached(&self, tid: ThreadId) -> bool {
        if !self.armed_for(tid) {
            return false;
        }

        let count = if self.global {
            self.global_count.load(Ordering::Acquire)
        }
        else {
            self.counts[tid.index()].load(Ordering::Acquire)
        };

        count >= self.target()
    }

    /// Returns `true` if the alarm is armed for `tid` and passes the
    /// thread filter. Used by alarms that fire without counting.
    fn armed_for(&self, tid: ThreadId) -> bool {
        self.correct_tid(tid) && self.is_armed(tid)
    }

    /// Requests the owning manager to fire.
    pub fn fire(&self, context: Option<&Context>, ip: Address, tid: ThreadId) {
        let Some(manager) = self.manager.upgrade()
        else {
            return;
        };

        if self.kind == AlarmKind::Interactive
            && !self
                .listener
                .as_ref()
                .is_some_and(|listener| listener.check_clear_signal())
        {
            return;
        }

        tracing::trace!(alarm = self.kind.name(), %tid, %ip, "alarm fired");

        if self.late && !manager.is_precond() {
            self.late_pending[tid.index()].store(true, Ordering::Release);
        }

        let context = if self.need_context { context } else { None };
        manager.fire(context, ip, tid);
    }

    /// Returns `true` if a late notification is pending for `tid`.
    fn activate_late(&self, tid: ThreadId) -> bool {
        self.correct_tid(tid) && self.late_pending[tid.index()].load(Ordering::Acquire)
    }

    /// Delivers a pending late notification.
    fn late_fire(&self, context: Option<&Context>, ip: Address, tid: ThreadId) {
        if !self.late_pending[tid.index()].swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(manager) = self.manager.upgrade()
        else {
            return;
        };

        let context = if self.need_context { context } else { None };
        manager.late_fire(context, ip, tid);
    }

    /// Arms every thread and the global flag.
    pub fn arm(&self) {
        for armed in &self.armed {
            armed.store(true, Ordering::Release);
        }
        self.global_armed.store(true, Ordering::Release);

        if let Some(timer) = &self.timer {
            timer.arm();
        }
    }

    /// Arms thread `tid`.
    pub fn arm_thread(&self, tid: ThreadId) {
        self.armed[tid.index()].store(true, Ordering::Release);

        if let Some(timer) = &self.timer {
            timer.arm();
        }
    }

    /// Disarms every thread and resets every counter.
    pub fn disarm(&self) {
        for (armed, count) in self.armed.iter().zip(&self.counts) {
            armed.store(false, Ordering::Release);
            count.store(0, Ordering::Release);
        }

        self.global_armed.store(false, Ordering::Release);
        self.global_count.store(0, Ordering::Release);
    }

    /// Disarms thread `tid` and resets its counter.
    pub fn disarm_thread(&self, tid: ThreadId) {
        let index = tid.index();
        self.armed[index].store(false, Ordering::Release);
        self.counts[index].store(0, Ordering::Release);
    }

    /// Clears the global armed flag and counter. Returns `true` for the
    /// one caller that found the flag set.
    pub fn disarm_global(&self) -> bool {
        if !self.global_armed.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.global_count.store(0, Ordering::Release);
        true
    }

    /// Resets the counter of `tid` without touching the armed flag.
    pub fn reset_thread(&self, tid: ThreadId) {
        self.counts[tid.index()].store(0, Ordering::Release);
    }

    /// Resets every counter without touching the armed flags.
    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Release);
        }
        self.global_count.store(0, Ordering::Release);
    }

    fn pcontrol_entries(&self) -> std::sync::RwLockReadGuard<'_, HashSet<Address>> {
        self.pcontrol.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}

#[cfg(test)]
#[path = "alarm_tests.rs"]
mod tests;
