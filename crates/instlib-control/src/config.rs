use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Controller knobs.
///
/// Filled by the tool from whatever option source it uses; every field
/// has a default, so partial configurations deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control strings, one chain each.
    pub control: Vec<String>,

    /// Write the controller event log.
    pub log: bool,

    /// Event log file name.
    pub log_file: PathBuf,

    /// Start every thread when no chain declares a start event.
    pub default_start: bool,

    /// Trace every dispatched event.
    pub debug: bool,

    /// Base name of the interactive listener's port file.
    pub interactive_file: Option<PathBuf>,

    /// Legacy: number of instructions to skip before starting.
    pub skip: Option<u64>,

    /// Legacy: number of instructions to run before stopping.
    pub length: Option<u64>,

    /// Legacy: start at an address.
    pub start_address: Vec<String>,

    /// Legacy: stop at an address.
    pub stop_address: Vec<String>,

    /// Legacy: start at an SSC marker.
    pub start_ssc_mark: Vec<String>,

    /// Legacy: stop at an SSC marker.
    pub stop_ssc_mark: Vec<String>,

    /// Legacy: start at an instruction encoding.
    pub start_itext: Vec<String>,

    /// Legacy: stop at an instruction encoding.
    pub stop_itext: Vec<String>,

    /// Legacy: start at an `int3`.
    pub start_int3: Vec<String>,

    /// Legacy: stop at an `int3`.
    pub stop_int3: Vec<String>,

    /// Legacy: start at an ISA extension.
    pub start_extension: Vec<String>,

    /// Legacy: stop at an ISA extension.
    pub stop_extension: Vec<String>,

    /// Legacy: start at an ISA category.
    pub start_category: Vec<String>,

    /// Legacy: stop at an ISA category.
    pub stop_category: Vec<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            control: Vec::new(),
            log: false,
            log_file: PathBuf::from("controller-log.txt"),
            default_start: true,
            debug: false,
            interactive_file: None,
            skip: None,
            length: None,
            start_address: Vec::new(),
            stop_address: Vec::new(),
            start_ssc_mark: Vec::new(),
            stop_ssc_mark: Vec::new(),
            start_itext: Vec::new(),
            stop_itext: Vec::new(),
            start_int3: Vec::new(),
            stop_int3: Vec::new(),
            start_extension: Vec::new(),
            stop_extension: Vec::new(),
            start_category: Vec::new(),
            stop_category: Vec::new(),
        }
    }
}

impl ControlConfig {
    /// Adds a control string.
    pub fn with_control(mut self, control: impl Into<String>) -> Self {
        self.control.push(control.into());
        self
    }

    /// Returns `true` if any legacy knob is set.
    pub fn has_legacy(&self) -> bool {
        self.skip.is_some()
            || self.length.is_some()
            || self
                .legacy_knobs()
                .any(|(_, _, values)| !values.is_empty())
    }

    /// Iterates the per-purpose legacy knobs as
    /// `(event, alarm, values)`.
    pub(crate) fn legacy_knobs(
        &self,
    ) -> impl Iterator<Item = (&'static str, &'static str, &[String])> {
        [
            ("start", "address", &self.start_address),
            ("stop", "address", &self.stop_address),
            ("start", "ssc", &self.start_ssc_mark),
            ("stop", "ssc", &self.stop_ssc_mark),
            ("start", "itext", &self.start_itext),
            ("stop", "itext", &self.stop_itext),
            ("start", "int3", &self.start_int3),
            ("stop", "int3", &self.stop_int3),
            ("start", "isa_extension", &self.start_extension),
            ("stop", "isa_extension", &self.stop_extension),
            ("start", "isa_category", &self.start_category),
            ("stop", "isa_category", &self.stop_category),
        ]
        .into_iter()
        .map(|(event, alarm, values)| (event, alarm, values.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use serde::de::value::{Error, MapDeserializer};

    use super::*;

    fn from_pairs(pairs: &[(&'static str, &'static str)]) -> ControlConfig {
        let map: MapDeserializer<'_, _, Error> = MapDeserializer::new(pairs.iter().copied());
        ControlConfig::deserialize(map).unwrap()
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = from_pairs(&[("log_file", "events.txt")]);
        assert_eq!(config.log_file, PathBuf::from("events.txt"));
        assert!(config.default_start);
        assert!(config.control.is_empty());
        assert!(!config.has_legacy());

        let config = from_pairs(&[]);
        assert_eq!(config, ControlConfig::default());
        assert_eq!(config.log_file, PathBuf::from("controller-log.txt"));
    }

    #[test]
    fn legacy_detection() {
        let config = ControlConfig {
            stop_int3: vec!["1".into()],
            ..Default::default()
        };
        assert!(config.has_legacy());

        let config = ControlConfig {
            skip: Some(10),
            ..Default::default()
        };
        assert!(config.has_legacy());

        assert!(!ControlConfig::default().with_control("stop:icount:10").has_legacy());
    }
}
