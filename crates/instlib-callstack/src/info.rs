use serde::{Deserialize, Serialize};

/// Image name used when no loaded image maps an address.
pub const UNKNOWN_IMAGE: &str = "UNKNOWN IMAGE";

/// Symbol and source information about an instruction address.
///
/// Resolution misses are represented by sentinel values and are valid,
/// displayable data.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackInfo {
    /// Id of the containing routine.
    pub routine_id: Option<u32>,

    /// Undecorated routine name without namespace; empty if unknown.
    pub function_name: String,

    /// `<image>:<offset>` or [`UNKNOWN_IMAGE`].
    pub image_name: String,

    /// Source file, when source locations are enabled and known.
    pub file_name: Option<String>,

    /// Source line, valid when `file_name` is set.
    pub line: u32,

    /// Source column, or 0.
    pub column: u32,
}

/// Call-stack manager options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallStackOptions {
    /// Resolve file, line and column for emitted stacks.
    pub source_location: bool,
}

impl Default for CallStackOptions {
    fn default() -> Self {
        Self {
            source_location: true,
        }
    }
}

/// Strips everything up to the last `:` of a qualified name.
pub(crate) fn remove_namespace(name: &str) -> &str {
    match name.rfind(':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}
