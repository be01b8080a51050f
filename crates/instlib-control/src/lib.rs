//! Alarm and controller engine.
//!
//! A tool describes when it wants to be told about events with control
//! strings. Each string is a [`ControlChain`] of alarms; each alarm
//! recognizes one runtime condition (an instruction count, an address, a
//! byte pattern, a signal, ...) and fires a named event once it has seen
//! the condition often enough:
//!
//! ```text
//! start:address:main,stop:icount:1000000,repeat:2,name:warm
//! start:ssc:111:tid0,stop:ssc:222:tid0,waitfor:warm
//! ```
//!
//! The [`ControlManager`] parses the chains, activates their alarms and
//! forwards every fired event to the handlers the tool registered.
//! Handlers that need the firing instruction's completed effect can ask
//! for a second, late delivery.

mod alarm;
mod alarm_manager;
mod chain;
mod config;
mod default_start;
mod error;
mod event;
mod interactive;
mod legacy;
mod log;
mod manager;
mod parser;
mod region;

pub use self::{
    alarm::{
        AddressTarget, Alarm, AlarmKind, MAX_INSTRUCTION_SIZE, SIM_CMD_MARKER, Timeout,
        find_pattern, ssc_marker,
    },
    alarm_manager::AlarmManager,
    chain::ControlChain,
    config::ControlConfig,
    error::ControlError,
    event::{ControllerEvents, EventId},
    interactive::InteractiveListener,
    manager::{ControlEvent, ControlHandler, ControlManager},
    parser::{AlarmSpec, ChainSpec, Repeat, UniformSpec, parse_hex_bytes, parse_unsigned},
    region::{RegionChain, RegionTracker},
};
