//! Shadow call-stack tracking.
//!
//! [`CallStackManager`] mirrors each application thread's call stack from
//! observed calls and returns, and lets tools watch function entries and
//! exits either by routine name (resolved when images load) or by address.
//!
//! The shadow stack is reconciled against the live stack pointer on every
//! transfer, so frames skipped by `longjmp` or exception unwinding are
//! dropped on the next call or return instead of accumulating.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use instlib_callstack::{CallStackManager, CallStackOptions};
//! # fn example(host: Arc<dyn instlib_core::InstrumentationHost>) {
//! let manager = CallStackManager::new(host, CallStackOptions::default());
//! manager.on_function_exit("malloc", false, |_, ip, tid| {
//!     println!("malloc returned at {ip} on thread {tid}");
//! });
//! manager.activate();
//! # }
//! ```

mod info;
mod manager;
mod stack;

pub use self::{
    info::{CallStackInfo, CallStackOptions, UNKNOWN_IMAGE},
    manager::{CallStackHandle, CallStackHandler, CallStackManager},
    stack::{CallEntry, CallStack},
};
