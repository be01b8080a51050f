//! Control string grammar.
//!
//! A control string is a comma-separated list of alarms and chain tokens:
//!
//! ```text
//! <event>:<alarm>:<value>[:tid<N>][:count<N>][:bcast][:global][:repeat]
//! uniform:<period>:<length>:<count>[:tid<N>]
//! repeat[:<N>] | name:<id> | waitfor:<id>
//! ```
//!
//! Empty fields are skipped, so `a::b` reads as `a:b`.

use instlib_core::{MAX_THREADS, ThreadId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{AlarmKind, ControlError};

/// Iterates the non-empty fields of `input` separated by `separator`.
pub(crate) fn split(input: &str, separator: char) -> impl Iterator<Item = &str> {
    input.split(separator).filter(|token| !token.is_empty())
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_unsigned(input: &str) -> Result<u64, ControlError> {
    let result = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse(),
    };

    result.map_err(|_| ControlError::InvalidNumber(input.to_owned()))
}

/// Parses a string of hex digit pairs (`"0f1f00"`) into bytes.
pub fn parse_hex_bytes(input: &str) -> Result<SmallVec<[u8; 16]>, ControlError> {
    let invalid = || ControlError::InvalidHex(input.to_owned());

    if input.is_empty() || input.len() % 2 != 0 {
        return Err(invalid());
    }

    input
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
            u8::from_str_radix(pair, 16).map_err(|_| invalid())
        })
        .collect()
}

fn parse_u32(input: &str) -> Result<u32, ControlError> {
    u32::try_from(parse_unsigned(input)?).map_err(|_| ControlError::InvalidNumber(input.to_owned()))
}

fn parse_tid(value: &str) -> Result<ThreadId, ControlError> {
    let tid = parse_u32(value)?;
    if tid as usize >= MAX_THREADS {
        return Err(ControlError::ThreadOutOfRange(tid));
    }

    Ok(ThreadId(tid))
}

/// Uniform region parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformSpec {
    /// Instructions from one region start to the next.
    pub period: u64,

    /// Instructions inside a region.
    pub length: u64,

    /// Number of regions.
    pub count: u64,
}

/// One parsed alarm of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmSpec {
    /// Name of the event to fire.
    pub event: String,

    /// What the alarm recognizes.
    pub kind: AlarmKind,

    /// Number of recognitions needed to fire. For `icount` alarms this is
    /// the instruction count.
    pub target: u64,

    /// Thread filter, `None` for all threads.
    pub tid: Option<ThreadId>,

    /// Firing disarms every thread, and the next alarm is armed on every
    /// thread.
    pub bcast: bool,

    /// Count across all threads instead of per thread.
    pub global: bool,

    /// Set for uniform region alarms.
    pub uniform: Option<UniformSpec>,
}

impl AlarmSpec {
    /// Parses one alarm.
    pub fn parse(input: &str) -> Result<Self, ControlError> {
        let malformed = |reason| ControlError::Malformed {
            input: input.to_owned(),
            reason,
        };

        let tokens = split(input, ':').collect::<Vec<_>>();
        let Some(&first) = tokens.first()
        else {
            return Err(malformed("no event"));
        };

        let (mut spec, rest) = if first == "uniform" {
            if tokens.len() < 4 {
                return Err(malformed("usage: uniform:<period>:<length>:<count>[:tid<N>]"));
            }

            Self::parse_uniform(&tokens)?
        }
        else {
            let Some(&alarm) = tokens.get(1)
            else {
                return Err(malformed("no alarm"));
            };

            let (value, rest) = if alarm == "interactive" {
                (None, &tokens[2..])
            }
            else {
                let Some(&value) = tokens.get(2)
                else {
                    return Err(malformed("alarm with no value"));
                };
                (Some(value), &tokens[3..])
            };

            let kind = AlarmKind::parse(alarm, value)?;
            let target = match kind {
                AlarmKind::Icount { .. } => parse_unsigned(value.unwrap_or_default())?,
                _ => 1,
            };

            let spec = Self {
                event: first.to_owned(),
                kind,
                target,
                tid: None,
                bcast: false,
                global: false,
                uniform: None,
            };

            (spec, rest)
        };

        spec.parse_common(rest)?;
        Ok(spec)
    }

    fn parse_uniform<'a>(tokens: &'a [&'a str]) -> Result<(Self, &'a [&'a str]), ControlError> {
        let uniform = UniformSpec {
            period: parse_unsigned(tokens[1])?,
            length: parse_unsigned(tokens[2])?,
            count: parse_unsigned(tokens[3])?,
        };

        if uniform.period < uniform.length {
            return Err(ControlError::UniformPeriod {
                period: uniform.period,
                length: uniform.length,
            });
        }

        let (tid, rest) = match tokens.get(4).and_then(|token| token.strip_prefix("tid")) {
            Some(tid) => (Some(parse_tid(tid)?), &tokens[5..]),
            None => (None, &tokens[4..]),
        };

        let spec = Self {
            event: "start".to_owned(),
            kind: AlarmKind::Icount { relative: true },
            target: 1,
            tid,
            bcast: false,
            global: false,
            uniform: Some(uniform),
        };

        Ok((spec, rest))
    }

    fn parse_common(&mut self, tokens: &[&str]) -> Result<(), ControlError> {
        let mut used_tid = false;
        let mut used_count = false;
        let mut used_bcast = false;
        let mut used_global = false;

        for &token in tokens {
            let used = if let Some(tid) = token.strip_prefix("tid") {
                self.tid = Some(parse_tid(tid)?);
                &mut used_tid
            }
            else if let Some(count) = token.strip_prefix("count") {
                if matches!(self.kind, AlarmKind::Icount { .. }) {
                    return Err(ControlError::UnknownToken(token.to_owned()));
                }
                self.target = parse_unsigned(count)?;
                &mut used_count
            }
            else if token.starts_with("bcast") {
                self.bcast = true;
                &mut used_bcast
            }
            else if token.starts_with("global") {
                self.global = true;
                &mut used_global
            }
            else if token.starts_with("repeat") {
                // The chain-level token governs repetition.
                continue;
            }
            else {
                return Err(ControlError::UnknownToken(token.to_owned()));
            };

            if std::mem::replace(used, true) {
                return Err(ControlError::RedundantToken(token.to_owned()));
            }
        }

        if self.global && !used_count && !matches!(self.kind, AlarmKind::Icount { .. }) {
            return Err(ControlError::GlobalWithoutCount);
        }

        if self.global && self.tid.is_some() {
            return Err(ControlError::TidWithGlobal);
        }

        Ok(())
    }

    /// Returns `true` if the alarm applies to `tid`.
    pub fn matches_thread(&self, tid: ThreadId) -> bool {
        self.tid.is_none_or(|filter| filter == tid)
    }
}

/// How many times a chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Repeat {
    /// A fixed number of passes.
    Times(u32),

    /// Forever.
    Forever,
}

impl Default for Repeat {
    fn default() -> Self {
        Self::Times(1)
    }
}

/// A parsed control string.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// Alarms in firing order.
    pub alarms: Vec<AlarmSpec>,

    /// Number of passes per thread.
    pub repeat: Repeat,

    /// Name other chains can wait for.
    pub name: Option<String>,

    /// Name of the chain this one waits for.
    pub waitfor: Option<String>,
}

impl ChainSpec {
    /// Parses a control string.
    pub fn parse(input: &str) -> Result<Self, ControlError> {
        let mut chain = Self::default();

        for part in split(input, ',') {
            let mut tokens = split(part, ':');

            match tokens.next() {
                Some("repeat") => {
                    chain.repeat = match tokens.next() {
                        Some(count) => Repeat::Times(parse_u32(count)?),
                        None => Repeat::Forever,
                    };
                }
                Some("name") => {
                    chain.name = Some(chain_token_value(part, tokens.next())?);
                }
                Some("waitfor") => {
                    chain.waitfor = Some(chain_token_value(part, tokens.next())?);
                }
                _ => chain.alarms.push(AlarmSpec::parse(part)?),
            }
        }

        if chain.alarms.is_empty() {
            return Err(ControlError::Malformed {
                input: input.to_owned(),
                reason: "chain without alarms",
            });
        }

        Ok(chain)
    }

    /// Returns `true` if any alarm fires `event`.
    pub fn fires(&self, event: &str) -> bool {
        self.alarms.iter().any(|alarm| alarm.event == event)
    }
}

fn chain_token_value(part: &str, value: Option<&str>) -> Result<String, ControlError> {
    value.map(str::to_owned).ok_or_else(|| ControlError::Malformed {
        input: part.to_owned(),
        reason: "chain token without value",
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use instlib_core::Address;

    use super::*;
    use crate::AddressTarget;

    #[test]
    fn numbers() {
        assert_eq!(parse_unsigned("100").unwrap(), 100);
        assert_eq!(parse_unsigned("0x4711").unwrap(), 0x4711);
        assert!(matches!(
            parse_unsigned("12k"),
            Err(ControlError::InvalidNumber(_))
        ));
        assert!(parse_unsigned("").is_err());
    }

    #[test]
    fn hex_bytes() {
        assert_eq!(parse_hex_bytes("0f1fAB").unwrap().as_slice(), [0x0f, 0x1f, 0xab]);
        assert!(matches!(parse_hex_bytes("0f1"), Err(ControlError::InvalidHex(_))));
        assert!(matches!(parse_hex_bytes("zz"), Err(ControlError::InvalidHex(_))));
        assert!(parse_hex_bytes("").is_err());
    }

    #[test]
    fn alarm_with_tokens() {
        let spec = AlarmSpec::parse("stop:ssc:4711:count3:tid2:bcast:repeat").unwrap();
        assert_eq!(spec.event, "stop");
        assert_eq!(spec.kind, AlarmKind::Ssc(0x4711));
        assert_eq!(spec.target, 3);
        assert_eq!(spec.tid, Some(ThreadId(2)));
        assert!(spec.bcast);
        assert!(!spec.global);
        assert!(spec.matches_thread(ThreadId(2)));
        assert!(!spec.matches_thread(ThreadId(0)));
    }

    #[test]
    fn thread_ids_are_bounded() {
        assert_eq!(
            AlarmSpec::parse("start:icount:10:tid2047").unwrap().tid,
            Some(ThreadId(2047))
        );
        assert!(matches!(
            AlarmSpec::parse("start:icount:10:tid5000"),
            Err(ControlError::ThreadOutOfRange(5000))
        ));
        assert!(matches!(
            AlarmSpec::parse("start:icount:10:tid2048"),
            Err(ControlError::ThreadOutOfRange(2048))
        ));
        assert!(matches!(
            AlarmSpec::parse("uniform:1000:100:3:tid5000"),
            Err(ControlError::ThreadOutOfRange(5000))
        ));
    }

    #[test]
    fn alarm_values() {
        let spec = AlarmSpec::parse("start:icount:0x100").unwrap();
        assert_eq!(spec.kind, AlarmKind::Icount { relative: false });
        assert_eq!(spec.target, 0x100);

        let spec = AlarmSpec::parse("start:address:libc.so+0x20").unwrap();
        assert_eq!(
            spec.kind,
            AlarmKind::Address(AddressTarget::Image {
                name: "libc.so".into(),
                offset: 0x20
            })
        );

        let spec = AlarmSpec::parse("start:address:0x401000").unwrap();
        assert_eq!(
            spec.kind,
            AlarmKind::Address(AddressTarget::Raw(Address(0x401000)))
        );

        let spec = AlarmSpec::parse("start:address:main").unwrap();
        assert_eq!(spec.kind, AlarmKind::Address(AddressTarget::Symbol("main".into())));

        let spec = AlarmSpec::parse("start:interactive:tid0").unwrap();
        assert_eq!(spec.kind, AlarmKind::Interactive);
        assert_eq!(spec.tid, Some(ThreadId(0)));

        let spec = AlarmSpec::parse("stop:timeout:5").unwrap();
        assert_eq!(spec.kind, AlarmKind::Timeout(Duration::from_secs(5)));

        let spec = AlarmSpec::parse("stop:signal:SIGUSR1").unwrap();
        assert_eq!(spec.kind, AlarmKind::Signal(libc::SIGUSR1));

        let spec = AlarmSpec::parse("stop:magic:1.2").unwrap();
        assert_eq!(spec.kind, AlarmKind::Magic { a: 1, b: 2 });
    }

    #[test]
    fn alarm_errors() {
        assert!(matches!(
            AlarmSpec::parse("start:nonsense:1"),
            Err(ControlError::UnknownAlarm(_))
        ));
        assert!(matches!(
            AlarmSpec::parse("start:icount"),
            Err(ControlError::Malformed { .. })
        ));
        assert!(matches!(
            AlarmSpec::parse("start:ssc:1:tid1:tid2"),
            Err(ControlError::RedundantToken(_))
        ));
        assert!(matches!(
            AlarmSpec::parse("start:ssc:1:bogus"),
            Err(ControlError::UnknownToken(_))
        ));
        assert!(matches!(
            AlarmSpec::parse("start:ssc:1:global"),
            Err(ControlError::GlobalWithoutCount)
        ));
        assert!(matches!(
            AlarmSpec::parse("start:ssc:1:count2:global:tid1"),
            Err(ControlError::TidWithGlobal)
        ));
        assert!(matches!(
            AlarmSpec::parse("start:itext:0f1"),
            Err(ControlError::InvalidHex(_))
        ));
        assert!(matches!(
            AlarmSpec::parse("start:magic:1"),
            Err(ControlError::InvalidValue { alarm: "magic", .. })
        ));

        // `global` with an icount alarm needs no count token.
        assert!(AlarmSpec::parse("start:icount:10:global").is_ok());
    }

    #[test]
    fn uniform() {
        let spec = AlarmSpec::parse("uniform:1000:100:3:tid1").unwrap();
        assert_eq!(spec.event, "start");
        assert_eq!(spec.kind, AlarmKind::Icount { relative: true });
        assert_eq!(spec.target, 1);
        assert_eq!(spec.tid, Some(ThreadId(1)));
        assert_eq!(
            spec.uniform,
            Some(UniformSpec {
                period: 1000,
                length: 100,
                count: 3
            })
        );

        assert!(matches!(
            AlarmSpec::parse("uniform:10:100:3"),
            Err(ControlError::UniformPeriod {
                period: 10,
                length: 100
            })
        ));
        assert!(matches!(
            AlarmSpec::parse("uniform:10:1"),
            Err(ControlError::Malformed { .. })
        ));
    }

    #[test]
    fn chain_tokens() {
        let chain = ChainSpec::parse("start:icount:100,stop:icount:200,repeat:2,name:first").unwrap();
        assert_eq!(chain.alarms.len(), 2);
        assert_eq!(chain.repeat, Repeat::Times(2));
        assert_eq!(chain.name.as_deref(), Some("first"));
        assert_eq!(chain.waitfor, None);
        assert!(chain.fires("start"));
        assert!(!chain.fires("warmup-start"));

        let chain = ChainSpec::parse("stop:int3:1,repeat,waitfor:first").unwrap();
        assert_eq!(chain.repeat, Repeat::Forever);
        assert_eq!(chain.waitfor.as_deref(), Some("first"));

        assert!(matches!(
            ChainSpec::parse("repeat:2"),
            Err(ControlError::Malformed { .. })
        ));
        assert!(matches!(
            ChainSpec::parse("start:icount:1,name"),
            Err(ControlError::Malformed { .. })
        ));
    }
}
