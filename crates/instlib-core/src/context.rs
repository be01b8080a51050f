use serde::{Deserialize, Serialize};

use crate::{Address, ThreadId};

/// Architectural state visible to analysis hooks.
///
/// Only the registers the library inspects are modelled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Instruction pointer.
    pub ip: Address,

    /// Stack pointer.
    pub sp: Address,

    /// `rax`.
    pub ax: u64,

    /// `rbx`.
    pub bx: u64,

    /// `rcx`.
    pub cx: u64,

    /// `rdx`.
    pub dx: u64,

    /// `rdi`.
    pub di: u64,

    /// `rsi`.
    pub si: u64,
}

impl Context {
    /// Creates a context with the given instruction and stack pointers.
    pub fn new(ip: impl Into<Address>, sp: impl Into<Address>) -> Self {
        Self {
            ip: ip.into(),
            sp: sp.into(),
            ..Default::default()
        }
    }

    /// Returns the `index`-th integer argument at a function entry point
    /// (System V order: `rdi`, `rsi`, `rdx`, `rcx`).
    ///
    /// Returns `None` for arguments that are not passed in a modelled
    /// register.
    pub fn function_argument(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.di),
            1 => Some(self.si),
            2 => Some(self.dx),
            3 => Some(self.cx),
            _ => None,
        }
    }
}

/// Why a thread's context changed outside normal control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextChangeReason {
    /// A signal that terminates the process.
    FatalSignal,

    /// A signal delivered to a handler.
    Signal,

    /// Return from a signal handler.
    SignalReturn,

    /// An asynchronous procedure call.
    Apc,

    /// An exception dispatch.
    Exception,

    /// A kernel-to-user callback.
    Callback,
}

/// A context change notification.
#[derive(Debug, Clone, Copy)]
pub struct ContextChange<'a> {
    /// The affected thread.
    pub tid: ThreadId,

    /// Why the context changed.
    pub reason: ContextChangeReason,

    /// The interrupted context, if any.
    pub from: Option<&'a Context>,

    /// The context execution resumes at, if any.
    pub to: Option<&'a Context>,

    /// Signal number for signal-related reasons.
    pub signal: i32,
}
