use std::time::Duration;

use instlib_core::Address;
use smallvec::SmallVec;

use crate::{
    ControlError,
    parser::{parse_hex_bytes, parse_unsigned, split},
};

/// Longest x86 instruction, in bytes.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// `rax` value identifying a simulator magic instruction.
pub const SIM_CMD_MARKER: u64 = 0x4711;

/// Where an `address` alarm points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressTarget {
    /// A raw address (`0x...`).
    Raw(Address),

    /// A symbol, resolved when an image defining it loads.
    Symbol(String),

    /// An offset into an image, matched by full name or basename.
    Image {
        /// Image name.
        name: String,

        /// Offset from the image's low address.
        offset: u64,
    },
}

/// What an alarm recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmKind {
    /// Executed instructions.
    ///
    /// Absolute counts are measured on the chain's instruction clock;
    /// relative counts only run while the alarm is armed.
    Icount {
        /// Count only while armed.
        relative: bool,
    },

    /// Control reaching an address.
    Address(AddressTarget),

    /// An SSC marker with the given immediate.
    Ssc(u32),

    /// An exact instruction encoding.
    Itext(SmallVec<[u8; 16]>),

    /// `int3`, which is removed from the executed code.
    Int3,

    /// An instruction of the given ISA extension.
    IsaExtension(String),

    /// An instruction of the given ISA category.
    IsaCategory(String),

    /// A signal from the interactive listener.
    Interactive,

    /// Entry of a named function.
    EnterFunc(String),

    /// Exit of a named function.
    ExitFunc(String),

    /// `cpuid` with the given leaf in `rax`.
    Cpuid(u32),

    /// `xchg bx, bx` with [`SIM_CMD_MARKER`] in `rax` and `a`, `b` in
    /// `rbx`, `rcx`.
    Magic {
        /// Expected `rbx`.
        a: u32,

        /// Expected `rcx`.
        b: u32,
    },

    /// `MPI_Pcontrol` called with the given region name.
    Pcontrol(String),

    /// Wall-clock time since the alarm was armed.
    Timeout(Duration),

    /// Delivery of a signal.
    Signal(i32),

    /// Load of an image with the given basename.
    ImageLoad(String),
}

impl AlarmKind {
    /// Parses alarm `name` with its `value`.
    ///
    /// Every alarm except `interactive` requires a value.
    pub fn parse(name: &str, value: Option<&str>) -> Result<Self, ControlError> {
        if name == "interactive" {
            return Ok(Self::Interactive);
        }

        let alarm = Self::static_name(name).ok_or_else(|| ControlError::UnknownAlarm(name.to_owned()))?;
        let value = value.ok_or_else(|| ControlError::Malformed {
            input: name.to_owned(),
            reason: "alarm with no value",
        })?;

        let invalid = || ControlError::InvalidValue {
            alarm,
            value: value.to_owned(),
        };

        let u32_value = || {
            parse_unsigned(value).and_then(|number| u32::try_from(number).map_err(|_| invalid()))
        };

        Ok(match alarm {
            "icount" => {
                parse_unsigned(value)?;
                Self::Icount { relative: false }
            }
            "address" => Self::Address(parse_address(value).ok_or_else(invalid)??),
            "ssc" => Self::Ssc(
                u32::from_str_radix(value.trim_start_matches("0x"), 16)
                    .map_err(|_| ControlError::InvalidHex(value.to_owned()))?,
            ),
            "itext" => {
                let bytes = parse_hex_bytes(value)?;
                if bytes.len() > MAX_INSTRUCTION_SIZE {
                    return Err(ControlError::PatternTooLong(bytes.len()));
                }
                Self::Itext(bytes)
            }
            "int3" => Self::Int3,
            "isa_extension" => Self::IsaExtension(value.to_owned()),
            "isa_category" => Self::IsaCategory(value.to_owned()),
            "enter_func" => Self::EnterFunc(value.to_owned()),
            "exit_func" => Self::ExitFunc(value.to_owned()),
            "cpuid" => Self::Cpuid(u32_value()?),
            "magic" => {
                let mut parts = split(value, '.');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(a), Some(b), None) => Self::Magic {
                        a: u32::try_from(parse_unsigned(a)?).map_err(|_| invalid())?,
                        b: u32::try_from(parse_unsigned(b)?).map_err(|_| invalid())?,
                    },
                    _ => return Err(invalid()),
                }
            }
            "pcontrol" => {
                if value.len() + 1 >= 128 {
                    return Err(invalid());
                }
                Self::Pcontrol(value.to_owned())
            }
            "timeout" => Self::Timeout(Duration::from_secs(parse_unsigned(value)?)),
            "signal" => Self::Signal(parse_signal(value).ok_or_else(invalid)?),
            "image_load" => Self::ImageLoad(value.to_owned()),
            _ => return Err(ControlError::UnknownAlarm(name.to_owned())),
        })
    }

    fn static_name(name: &str) -> Option<&'static str> {
        [
            "icount",
            "address",
            "ssc",
            "itext",
            "int3",
            "isa_extension",
            "isa_category",
            "interactive",
            "enter_func",
            "exit_func",
            "cpuid",
            "magic",
            "pcontrol",
            "timeout",
            "signal",
            "image_load",
        ]
        .into_iter()
        .find(|known| *known == name)
    }

    /// Returns the configuration name of the alarm kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Icount { .. } => "icount",
            Self::Address(_) => "address",
            Self::Ssc(_) => "ssc",
            Self::Itext(_) => "itext",
            Self::Int3 => "int3",
            Self::IsaExtension(_) => "isa_extension",
            Self::IsaCategory(_) => "isa_category",
            Self::Interactive => "interactive",
            Self::EnterFunc(_) => "enter_func",
            Self::ExitFunc(_) => "exit_func",
            Self::Cpuid(_) => "cpuid",
            Self::Magic { .. } => "magic",
            Self::Pcontrol(_) => "pcontrol",
            Self::Timeout(_) => "timeout",
            Self::Signal(_) => "signal",
            Self::ImageLoad(_) => "image_load",
        }
    }

    /// Returns `true` if the alarm needs the call-stack manager.
    pub fn uses_call_stack(&self) -> bool {
        matches!(self, Self::EnterFunc(_) | Self::ExitFunc(_))
    }
}

/// `0x<hex>` is raw, `<image>+<offset>` is image-relative, anything else
/// is a symbol. Returns `None` for a malformed image-relative value.
fn parse_address(value: &str) -> Option<Result<AddressTarget, ControlError>> {
    if value.starts_with("0x") {
        return Some(parse_unsigned(value).map(|address| AddressTarget::Raw(Address(address))));
    }

    let Some((name, offset)) = value.split_once('+')
    else {
        return Some(Ok(AddressTarget::Symbol(value.to_owned())));
    };

    if name.is_empty() || offset.is_empty() || offset.contains('+') {
        return None;
    }

    Some(parse_unsigned(offset).map(|offset| AddressTarget::Image {
        name: name.to_owned(),
        offset,
    }))
}

/// Parses a signal number or name (`SIGUSR1`, `USR1`).
fn parse_signal(value: &str) -> Option<i32> {
    if let Ok(number) = parse_unsigned(value) {
        return i32::try_from(number).ok();
    }

    let name = value.strip_prefix("SIG").unwrap_or(value);
    let signal = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "TRAP" => libc::SIGTRAP,
        "ABRT" => libc::SIGABRT,
        "BUS" => libc::SIGBUS,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "SEGV" => libc::SIGSEGV,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "TTIN" => libc::SIGTTIN,
        "TTOU" => libc::SIGTTOU,
        "URG" => libc::SIGURG,
        "XCPU" => libc::SIGXCPU,
        "XFSZ" => libc::SIGXFSZ,
        "VTALRM" => libc::SIGVTALRM,
        "PROF" => libc::SIGPROF,
        "WINCH" => libc::SIGWINCH,
        "SYS" => libc::SIGSYS,
        _ => return None,
    };

    Some(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals() {
        assert_eq!(parse_signal("10"), Some(10));
        assert_eq!(parse_signal("USR2"), Some(libc::SIGUSR2));
        assert_eq!(parse_signal("SIGTERM"), Some(libc::SIGTERM));
        assert_eq!(parse_signal("SIGNOPE"), None);
    }

    #[test]
    fn addresses() {
        assert!(parse_address("a+").is_none());
        assert!(parse_address("+1").is_none());
        assert!(matches!(
            parse_address("0xzz"),
            Some(Err(ControlError::InvalidNumber(_)))
        ));
    }

    #[test]
    fn values_are_required() {
        assert!(matches!(
            AlarmKind::parse("int3", None),
            Err(ControlError::Malformed { .. })
        ));
        assert_eq!(AlarmKind::parse("int3", Some("1")).unwrap(), AlarmKind::Int3);
        assert!(matches!(
            AlarmKind::parse("itext", Some(&"90".repeat(16))),
            Err(ControlError::PatternTooLong(16))
        ));
        assert!(matches!(
            AlarmKind::parse("ssc", Some("xyz")),
            Err(ControlError::InvalidHex(_))
        ));
        assert!(AlarmKind::parse("enter_func", Some("main")).unwrap().uses_call_stack());
    }
}
