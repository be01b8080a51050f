use std::sync::Arc;

use crate::{Address, Context, ContextChange, Image, ThreadId, Trace, TraceHooks};

/// A source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file name.
    pub file: String,

    /// 1-based line.
    pub line: u32,

    /// 1-based column, or 0 when unknown.
    pub column: u32,
}

/// The image that maps an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    /// Full image name.
    pub name: String,

    /// Lowest mapped address of the image.
    pub low_address: Address,
}

/// What the host knows about an address.
///
/// Misses are represented by empty values rather than errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Symbolization {
    /// Id of the containing routine.
    pub routine_id: Option<u32>,

    /// Name of the containing routine, empty if unknown.
    pub routine_name: String,

    /// The image mapping the address.
    pub image: Option<ImageLocation>,

    /// Source position, only when requested and available.
    pub source: Option<SourceLocation>,
}

/// Callbacks an instrumentation client receives from the host.
///
/// Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait Instrumenter: Send + Sync + 'static {
    /// Called once per trace before it is first executed. Insert analysis
    /// hooks into `hooks`.
    fn instrument_trace(&self, trace: &Trace, hooks: &mut TraceHooks) {}

    /// Called when an image is loaded, on the loading thread.
    fn image_load(&self, image: &Image) {}

    /// Called when a thread starts, before its first instruction.
    fn thread_start(&self, tid: ThreadId, context: &Context) {}

    /// Called when a thread exits.
    fn thread_fini(&self, tid: ThreadId) {}

    /// Called on asynchronous context changes (signals, exceptions).
    fn context_change(&self, change: &ContextChange<'_>) {}

    /// Called when the process is about to exit.
    fn fini(&self) {}
}

/// The instrumentation engine, as seen by the library.
pub trait InstrumentationHost: Send + Sync + 'static {
    /// Registers an instrumentation client. Clients are invoked in
    /// registration order.
    fn add_instrumenter(&self, instrumenter: Arc<dyn Instrumenter>);

    /// Resolves routine, image and (optionally) source information for
    /// `address`.
    fn symbolize(&self, address: Address, source_location: bool) -> Symbolization;

    /// Undecorates a symbol name, keeping only the (qualified) name.
    fn undecorate(&self, name: &str) -> String {
        name.to_owned()
    }

    /// Copies code bytes starting at `address` into `buffer`. Returns the
    /// number of bytes copied.
    fn fetch_code(&self, address: Address, buffer: &mut [u8]) -> usize;

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    fn read_c_string(&self, address: Address, max_len: usize) -> Option<String>;

    /// Returns the thread currently executing a host callback.
    fn current_thread(&self) -> ThreadId;
}
