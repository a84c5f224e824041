//! YAML station configuration.

use crate::battery::{BatteryId, BatteryModule};
use crate::protocol::Channel;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wait between two cycles of a multi-cycle test.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WaitTimes {
    #[serde(default = "WaitTimes::default_pulse", with = "humantime_serde")]
    pub pulse: Duration,
    #[serde(default = "WaitTimes::default_capacity", with = "humantime_serde")]
    pub capacity: Duration,
    #[serde(default = "WaitTimes::default_drive_cycle", with = "humantime_serde")]
    pub drive_cycle: Duration,
}

impl WaitTimes {
    fn default_pulse() -> Duration {
        Duration::from_secs(10)
    }

    fn default_capacity() -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn default_drive_cycle() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl Default for WaitTimes {
    fn default() -> Self {
        Self {
            pulse: Self::default_pulse(),
            capacity: Self::default_capacity(),
            drive_cycle: Self::default_drive_cycle(),
        }
    }
}

/// Battery id tested on each converter channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelBatteries {
    #[serde(default)]
    pub a: Option<BatteryId>,
    #[serde(default)]
    pub b: Option<BatteryId>,
}

impl ChannelBatteries {
    pub fn get(&self, channel: Channel) -> Option<BatteryId> {
        match channel {
            Channel::A => self.a,
            Channel::B => self.b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StationConfig {
    #[serde(default = "StationConfig::default_interface")]
    pub interface: String,
    #[serde(
        default = "StationConfig::default_transmit_period",
        with = "humantime_serde"
    )]
    pub transmit_period: Duration,
    #[serde(
        default = "StationConfig::default_poll_period",
        with = "humantime_serde"
    )]
    pub poll_period: Duration,
    #[serde(
        default = "StationConfig::default_debug_period",
        with = "humantime_serde"
    )]
    pub debug_period: Duration,
    #[serde(default)]
    pub restart_wait: WaitTimes,
    #[serde(default = "StationConfig::default_drive_cycle")]
    pub drive_cycle: PathBuf,
    /// Packs known to the station. Used as the simulated plate on dry runs.
    #[serde(default)]
    pub packs: Vec<BatteryModule>,
    #[serde(default)]
    pub channels: ChannelBatteries,
}

impl StationConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "abc150.yaml";

    fn default_interface() -> String {
        "can0".into()
    }

    fn default_transmit_period() -> Duration {
        crate::converter::DEFAULT_TRANSMIT_PERIOD
    }

    fn default_poll_period() -> Duration {
        crate::manager::POLL_PERIOD
    }

    fn default_debug_period() -> Duration {
        crate::manager::DEFAULT_DEBUG_PERIOD
    }

    fn default_drive_cycle() -> PathBuf {
        PathBuf::from("drive_cycle.csv")
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads the configuration file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Config file {path:?} not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_reader(file)?)
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            interface: Self::default_interface(),
            transmit_period: Self::default_transmit_period(),
            poll_period: Self::default_poll_period(),
            debug_period: Self::default_debug_period(),
            restart_wait: WaitTimes::default(),
            drive_cycle: Self::default_drive_cycle(),
            packs: Vec::new(),
            channels: ChannelBatteries::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_gives_defaults() {
        let config = StationConfig::from_yaml("{}").unwrap();
        assert_eq!(config, StationConfig::default());
        assert_eq!(config.transmit_period, Duration::from_millis(500));
        assert_eq!(config.restart_wait.capacity, Duration::from_secs(900));
    }

    #[test]
    fn parses_station_file() {
        let yaml = r#"
interface: vcan0
transmit_period: 250ms
restart_wait:
  pulse: 30s
drive_cycle: /tmp/cycle.csv
packs:
  - id: 7
    voltage: 350.5
  - id: 9
channels:
  a: 7
"#;
        let config = StationConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.interface, "vcan0");
        assert_eq!(config.transmit_period, Duration::from_millis(250));
        assert_eq!(config.restart_wait.pulse, Duration::from_secs(30));
        assert_eq!(config.restart_wait.capacity, Duration::from_secs(900));
        assert_eq!(config.packs.len(), 2);
        assert_eq!(config.packs[0].voltage, 350.5);
        assert_eq!(config.channels.get(Channel::A), Some(7));
        assert_eq!(config.channels.get(Channel::B), None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StationConfig::load(dir.path().join("none.yaml")).unwrap();
        assert_eq!(config.interface, "can0");
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interface: can1\npoll_period: 50ms").unwrap();
        let config = StationConfig::load(file.path()).unwrap();
        assert_eq!(config.interface, "can1");
        assert_eq!(config.poll_period, Duration::from_millis(50));
    }

    #[test]
    fn bad_yaml_is_an_error() {
        assert!(matches!(
            StationConfig::from_yaml("transmit_period: soon"),
            Err(Error::Yaml(_))
        ));
    }
}
