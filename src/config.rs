use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionOptions;
use crate::tracker::TrackerOptions;

/// The configuration used for reaching a tracked device: which device
/// to look for, and how to connect to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter expression selecting the device of interest.
    /// See [`PortFilter`](crate::filter::PortFilter).
    pub filter: String,

    /// Connection parameters (baud rate, sharing mode, lock directory).
    pub connection: ConnectionOptions,

    /// Tracker parameters (scan interval).
    pub tracker: TrackerOptions,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            filter: "vid_pid:0403:6010".into(),
            connection: ConnectionOptions {
                baud: 57_600,
                ..Default::default()
            },
            tracker: TrackerOptions::default(),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }
}
