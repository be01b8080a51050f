use instlib_core::ThreadId;

use crate::EventId;

/// Tracks which region each thread is in.
///
/// A region controller supplies one chain per region boundary and is told
/// about every event those chains fire. An event it considers illegal,
/// such as the start of a region overlapping the active one, blocks the
/// firing chain for good.
pub trait RegionTracker: Send + Sync + 'static {
    /// Records `event` of the region tagged `tag` on `tid`. Returns `false`
    /// if the event is illegal.
    fn triggered(&self, tid: ThreadId, event: EventId, tag: u64) -> bool;
}

/// A control string supplied by a region controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionChain {
    /// The control string.
    pub control: String,

    /// Opaque region tag, passed back to the tracker and printed as the
    /// handler in the event log.
    pub tag: u64,

    /// The thread the region belongs to.
    pub tid: ThreadId,
}

impl RegionChain {
    /// Creates a region chain.
    pub fn new(control: impl Into<String>, tag: u64, tid: ThreadId) -> Self {
        Self {
            control: control.into(),
            tag,
            tid,
        }
    }
}
