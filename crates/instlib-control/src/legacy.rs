//! Translation of the per-purpose legacy knobs into chains.
//!
//! Each legacy value reads `value[:count][:tid<N>][:repeat]` and becomes
//! the chain `event:alarm:value[:count<N>][:tid<N>][,repeat]`. A region
//! length turns every start knob into a start/stop pair whose stop counts
//! from the start.

use crate::{AlarmKind, AlarmSpec, ChainSpec, ControlConfig, ControlError, parser::split};

/// Returns the chains the legacy knobs of `config` describe.
pub(crate) fn legacy_chains(config: &ControlConfig) -> Result<Vec<ChainSpec>, ControlError> {
    let mut chains = Vec::new();
    let mut has_start = false;

    for (event, alarm, values) in config.legacy_knobs() {
        for value in values {
            let mut chain = ChainSpec::parse(&translate(event, alarm, value)?)?;

            if event == "start" {
                has_start = true;
                if let Some(length) = config.length {
                    chain.alarms.push(relative_stop(length));
                }
            }

            tracing::debug!(event, alarm, value = %value, "legacy knob");
            chains.push(chain);
        }
    }

    if let Some(skip) = config.skip {
        has_start = true;

        let mut chain = ChainSpec::parse(&format!("start:icount:{skip}"))?;
        if let Some(length) = config.length {
            chain.alarms.push(relative_stop(length));
        }

        chains.push(chain);
    }

    if !has_start && let Some(length) = config.length {
        chains.push(ChainSpec::parse(&format!("stop:icount:{length}"))?);
    }

    Ok(chains)
}

fn translate(event: &str, alarm: &str, input: &str) -> Result<String, ControlError> {
    let mut tokens = split(input, ':');
    let Some(value) = tokens.next()
    else {
        return Err(ControlError::Malformed {
            input: input.to_owned(),
            reason: "legacy knob without value",
        });
    };

    let mut control = format!("{event}:{alarm}:{value}");
    let mut repeat = false;

    for token in tokens {
        if token.starts_with("tid") {
            control.push(':');
            control.push_str(token);
        }
        else if token == "repeat" {
            repeat = true;
        }
        else {
            control.push_str(":count");
            control.push_str(token);
        }
    }

    if repeat {
        control.push_str(",repeat");
    }

    Ok(control)
}

fn relative_stop(length: u64) -> AlarmSpec {
    AlarmSpec {
        event: "stop".to_owned(),
        kind: AlarmKind::Icount { relative: true },
        target: length,
        tid: None,
        bcast: false,
        global: false,
        uniform: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTarget, Repeat};

    #[test]
    fn knob_value_translation() {
        assert_eq!(
            translate("start", "address", "0x1000:3:tid2:repeat").unwrap(),
            "start:address:0x1000:count3:tid2,repeat"
        );
        assert_eq!(translate("stop", "ssc", "111").unwrap(), "stop:ssc:111");
        assert!(translate("stop", "ssc", "").is_err());
    }

    #[test]
    fn start_knob_with_length() {
        let config = ControlConfig {
            start_address: vec!["main:2".into()],
            length: Some(500),
            ..Default::default()
        };

        let chains = legacy_chains(&config).unwrap();
        assert_eq!(chains.len(), 1);

        let chain = &chains[0];
        assert_eq!(chain.alarms.len(), 2);
        assert_eq!(
            chain.alarms[0].kind,
            AlarmKind::Address(AddressTarget::Symbol("main".into()))
        );
        assert_eq!(chain.alarms[0].target, 2);
        assert_eq!(chain.alarms[1].kind, AlarmKind::Icount { relative: true });
        assert_eq!(chain.alarms[1].target, 500);
    }

    #[test]
    fn skip_and_length() {
        let config = ControlConfig {
            skip: Some(100),
            length: Some(50),
            ..Default::default()
        };

        let chains = legacy_chains(&config).unwrap();
        assert_eq!(chains.len(), 1);

        let alarms = &chains[0].alarms;
        assert_eq!(alarms[0].event, "start");
        assert_eq!(alarms[0].kind, AlarmKind::Icount { relative: false });
        assert_eq!(alarms[0].target, 100);
        assert_eq!(alarms[1].event, "stop");
        assert_eq!(alarms[1].kind, AlarmKind::Icount { relative: true });
        assert_eq!(alarms[1].target, 50);
    }

    #[test]
    fn length_alone_stops() {
        let config = ControlConfig {
            length: Some(1000),
            stop_int3: vec!["1:repeat".into()],
            ..Default::default()
        };

        let chains = legacy_chains(&config).unwrap();
        assert_eq!(chains.len(), 2);

        assert_eq!(chains[0].alarms[0].kind, AlarmKind::Int3);
        assert_eq!(chains[0].repeat, Repeat::Forever);

        assert_eq!(chains[1].alarms.len(), 1);
        assert_eq!(chains[1].alarms[0].event, "stop");
        assert_eq!(chains[1].alarms[0].kind, AlarmKind::Icount { relative: false });
        assert_eq!(chains[1].alarms[0].target, 1000);
    }
}
