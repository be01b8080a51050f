/// An error in controller configuration.
///
/// Every variant is a setup-time failure. A tool is expected to report it
/// and abort; no partially activated controller is usable.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    /// The alarm kind is not known.
    #[error("unsupported alarm: {0}")]
    UnknownAlarm(String),

    /// The event name was never registered.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// A control string does not follow the grammar.
    #[error("malformed control string {input:?}: {reason}")]
    Malformed {
        /// The offending input.
        input: String,

        /// What is wrong with it.
        reason: &'static str,
    },

    /// A number could not be parsed.
    #[error("invalid number: {0:?}")]
    InvalidNumber(String),

    /// A hex byte string could not be parsed.
    #[error("invalid hex string: {0:?}")]
    InvalidHex(String),

    /// An instruction byte pattern is longer than an instruction can be.
    #[error("pattern of {0} bytes exceeds the maximum instruction length")]
    PatternTooLong(usize),

    /// The value of an alarm is not valid for its kind.
    #[error("invalid value {value:?} for alarm {alarm}")]
    InvalidValue {
        /// Alarm kind.
        alarm: &'static str,

        /// The rejected value.
        value: String,
    },

    /// A trailing token is not recognized.
    #[error("unknown token: {0}")]
    UnknownToken(String),

    /// A trailing token appears more than once.
    #[error("redundant token: {0}")]
    RedundantToken(String),

    /// A thread id is not below `MAX_THREADS`.
    #[error("thread id {0} out of range")]
    ThreadOutOfRange(u32),

    /// `global` was used without a count.
    #[error("global token requires a count or an icount alarm")]
    GlobalWithoutCount,

    /// `tid` and `global` were combined.
    #[error("tid and global tokens are mutually exclusive")]
    TidWithGlobal,

    /// The uniform period is shorter than the region length.
    #[error("uniform period {period} is shorter than length {length}")]
    UniformPeriod {
        /// Uniform period.
        period: u64,

        /// Region length.
        length: u64,
    },

    /// More than one uniform specification was given.
    #[error("only one uniform control is supported")]
    DuplicateUniform,

    /// A `waitfor` token names a chain that does not exist (yet).
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    /// An interactive alarm was configured without a listener file.
    #[error("interactive alarms require an interactive file")]
    InteractiveWithoutListener,

    /// Two controller modes that cannot be combined were configured.
    #[error("conflicting controller modes: {0}")]
    Conflict(&'static str),

    /// The controller was already activated.
    #[error("controller already activated")]
    AlreadyActivated,

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
