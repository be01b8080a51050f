//! Core types for instlib.
//!
//! This crate defines the vocabulary shared by the call-stack tracker and
//! the alarm/controller engine: addresses and thread ids, the decoded
//! instruction and trace model, the register context, loaded images, and
//! the two traits that form the boundary to the instrumentation engine:
//!
//! - [`InstrumentationHost`] is the engine. It registers clients, answers
//!   symbol queries and reads application memory.
//! - [`Instrumenter`] is a client. It receives trace, image, thread and
//!   context-change callbacks and inserts typed analysis hooks
//!   ([`TraceHooks`]).
//!
//! With the `sim` feature, the [`sim`] module provides a deterministic
//! in-process host that executes synthetic traces.

mod context;
mod core;
mod hooks;
mod host;
mod image;
mod instruction;
#[cfg(feature = "sim")]
pub mod sim;

pub use self::{
    context::{Context, ContextChange, ContextChangeReason},
    core::{Address, Hex, MAX_THREADS, ThreadId},
    hooks::{AnalysisArgs, AnalysisCall, AnalysisFn, CallOrder, IPoint, TraceHooks},
    host::{ImageLocation, InstrumentationHost, Instrumenter, SourceLocation, Symbolization},
    image::{Image, Routine, Symbol, basename},
    instruction::{BasicBlock, ControlFlow, Instruction, InstructionFlags, Opcode, Trace},
};
