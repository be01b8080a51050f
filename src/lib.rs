//! Building blocks for dynamic binary instrumentation tools.
//!
//! `instlib` bundles three crates behind one dependency:
//!
//! - [`instlib_core`] (re-exported at the crate root) defines addresses,
//!   instructions, traces, register contexts and the
//!   [`InstrumentationHost`] / [`Instrumenter`] boundary to the engine.
//! - [`callstack`] keeps a shadow call stack per thread and notifies tools
//!   on function entry and exit.
//! - [`control`] turns control strings such as
//!   `start:address:main,stop:icount:1000000` into `start`/`stop` events.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! use instlib::{
//!     InstrumentationHost,
//!     control::{ControlConfig, ControlEvent, ControlManager, EventId},
//! };
//!
//! # fn example(host: Arc<dyn InstrumentationHost>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControlConfig::default()
//!     .with_control("start:enter_func:compute,stop:exit_func:compute,repeat");
//!
//! let controller = ControlManager::new(host, config);
//! controller.register_handler(
//!     Arc::new(|event: &ControlEvent<'_>| match event.event {
//!         EventId::START => tracing::info!(tid = %event.tid, "region start"),
//!         EventId::STOP => tracing::info!(tid = %event.tid, "region stop"),
//!         _ => {}
//!     }),
//!     false,
//!     None,
//! )?;
//! controller.activate()?;
//! # Ok(())
//! # }
//! ```

pub use instlib_core::*;

/// Shadow call stacks.
#[cfg(feature = "callstack")]
pub mod callstack {
    pub use instlib_callstack::*;
}

/// Alarms, control chains and controller events.
#[cfg(feature = "control")]
pub mod control {
    pub use instlib_control::*;
}
