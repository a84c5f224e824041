use abc150_lib::config::StationConfig;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Start the converter engine and the test manager with an interactive console
    Run {
        /// Use an in-memory bus that answers like a converter instead of a CAN interface
        #[clap(long, action)]
        dry_run: bool,
    },
    /// Decode a single CAN frame and print it
    Decode {
        /// Frame identifier in hex (e.g., 0x103 or 103)
        id: String,
        /// Payload bytes in hex (e.g., "00 64 01 0b 00" or 0064010b00)
        data: String,
    },
    /// List the registered tests
    List {
        /// Print the list as JSON
        #[clap(long, action)]
        json: bool,
    },
}

const fn about_text() -> &'static str {
    "ABC150 converter battery test station"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// The station configuration file
    #[arg(short, long, default_value_t = StationConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    /// CAN interface name, overrides the configuration file (e.g., can0, vcan0)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Transmit period of the converter setpoints, overrides the configuration file (e.g., "500ms")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub transmit_period: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}

impl CliArgs {
    /// Loads the configuration file and applies the command line overrides.
    pub fn station_config(&self) -> Result<StationConfig, abc150_lib::Error> {
        let mut config = StationConfig::load(&self.config)?;
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if let Some(period) = self.transmit_period {
            config.transmit_period = period;
        }
        Ok(config)
    }
}
