mod hex;
mod macros;

use serde::{Deserialize, Serialize};

pub use self::hex::Hex;
use self::macros::impl_ops;

/// Maximum number of threads tracked by per-thread tables.
///
/// Thread ids are dense indices handed out by the instrumentation engine,
/// so per-thread state is kept in fixed-size tables indexed by
/// [`ThreadId::index`].
pub const MAX_THREADS: usize = 2048;

impl_ops!(Address, u64, "virtual address in the instrumented process");

/// An instrumentation-engine thread id.
///
/// Ids are small, dense and reused after a thread exits.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Returns the id as an index into a per-thread table.
    ///
    /// # Panics
    ///
    /// Panics if the id is not below [`MAX_THREADS`].
    pub fn index(self) -> usize {
        let index = self.0 as usize;
        assert!(index < MAX_THREADS, "thread id {index} out of range");
        index
    }
}

impl From<u32> for ThreadId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl ::std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
