use abc150_lib::battery::{BatteryCollection, SimulatedPlate};
use abc150_lib::bus::{CanBus, CanReceiver, LoopbackBus};
use abc150_lib::clock::{Clock, SystemClock};
use abc150_lib::config::StationConfig;
use abc150_lib::converter::Converter;
use abc150_lib::drive_cycle::CsvDriveCycleFile;
use abc150_lib::lifecycle::Station;
use abc150_lib::manager::TestManager;
use abc150_lib::plate::PlateDriveCycleTest;
use abc150_lib::protocol::{CanFrame, Channel, DecodedFrame};
use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::sync::Arc;
use std::{ops::Deref, panic};

mod commandline;
mod console;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn parse_hex_bytes(data: &str) -> Result<Vec<u8>> {
    let digits: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.is_ascii() {
        bail!("Invalid hex payload '{data}'");
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{data}'");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn parse_frame_id(id: &str) -> Result<u16> {
    let digits = id.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid frame identifier '{id}'"))
}

fn decode(id: &str, data: &str) -> Result<()> {
    let frame = CanFrame::new(parse_frame_id(id)?, &parse_hex_bytes(data)?)
        .with_context(|| "Cannot build frame")?;
    match DecodedFrame::decode(&frame).with_context(|| format!("Cannot decode {frame}"))? {
        Some(decoded) => println!("{frame}: {decoded:#?}"),
        None => println!("{frame}: not an ABC150 frame"),
    }
    Ok(())
}

type BusPair = (Arc<dyn CanBus>, Box<dyn CanReceiver>);

fn open_bus(config: &StationConfig, dry_run: bool) -> Result<BusPair> {
    if dry_run {
        info!("Dry run, using the simulated converter");
        let bus = Arc::new(LoopbackBus::with_converter_echo());
        let receiver: Box<dyn CanReceiver> = Box::new(bus.receiver());
        let bus: Arc<dyn CanBus> = bus;
        return Ok((bus, receiver));
    }
    open_can_interface(&config.interface)
}

#[cfg(feature = "socketcan")]
fn open_can_interface(interface: &str) -> Result<BusPair> {
    use abc150_lib::bus::socket::SocketCanBus;

    let bus = SocketCanBus::open(interface)
        .with_context(|| format!("Cannot open CAN interface '{interface}'"))?;
    let receiver = bus
        .receiver()
        .with_context(|| format!("Cannot open CAN receiver on '{interface}'"))?;
    let receiver: Box<dyn CanReceiver> = Box::new(receiver);
    let bus: Arc<dyn CanBus> = Arc::new(bus);
    Ok((bus, receiver))
}

#[cfg(not(feature = "socketcan"))]
fn open_can_interface(interface: &str) -> Result<BusPair> {
    bail!(
        "Cannot open CAN interface '{interface}': built without the 'socketcan' feature, use --dry-run"
    )
}

fn build_station(config: &StationConfig, bus: Arc<dyn CanBus>) -> Station {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let converter = Arc::new(Converter::with_period(bus, clock, config.transmit_period));
    let batteries = Arc::new(BatteryCollection::from_modules(config.packs.clone()));
    let plate = Arc::new(SimulatedPlate::new(batteries.clone()));
    Station::new(converter, batteries, plate)
}

fn build_manager(
    config: &StationConfig,
    station: Station,
) -> (TestManager, Arc<PlateDriveCycleTest>) {
    let drive_cycle = Arc::new(CsvDriveCycleFile::new(&config.drive_cycle));
    let (manager, plate_drive_cycle) =
        TestManager::with_standard_tests(station, &config.restart_wait, drive_cycle);
    manager.set_debug_period(config.debug_period);
    for channel in Channel::ALL {
        if let Some(battery) = config.channels.get(channel) {
            manager.assign_battery(channel, battery);
        }
    }
    (manager, plate_drive_cycle)
}

fn run(config: StationConfig, dry_run: bool) -> Result<()> {
    info!("Starting station: {config:?}");
    let (bus, receiver) = open_bus(&config, dry_run)?;
    let station = build_station(&config, bus);
    let converter = station.converter.clone();

    let _receiver_task = converter
        .spawn_receiver(receiver)
        .with_context(|| "Cannot start the receive task")?;
    let _transmit_task = converter
        .spawn_transmitter()
        .with_context(|| "Cannot start the transmit task")?;
    converter
        .request_converter()
        .with_context(|| "Cannot request the converter greeting")?;

    let (manager, plate_drive_cycle) = build_manager(&config, station.clone());
    let manager = Arc::new(manager);
    let _poll_task = manager
        .spawn_poll_loop(config.poll_period)
        .with_context(|| "Cannot start the test manager")?;
    let _drive_cycle_task = plate_drive_cycle
        .spawn_ticker()
        .with_context(|| "Cannot start the drive cycle task")?;

    console::run(std::io::stdin().lock(), &manager, &station)?;

    manager.stop_all();
    info!("Station stopped");
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = args
        .station_config()
        .with_context(|| format!("Cannot load station config '{}'", args.config))?;

    match &args.command {
        CliCommands::Run { dry_run } => run(config, *dry_run)?,
        CliCommands::Decode { id, data } => decode(id, data)?,
        CliCommands::List { json } => {
            let station = build_station(&config, Arc::new(LoopbackBus::new()));
            let (manager, _) = build_manager(&config, station);
            if *json {
                let list = serde_json::to_string_pretty(&manager.list())
                    .with_context(|| "Cannot serialize test list")?;
                println!("{list}");
            } else {
                console::print_list(&manager);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_payloads() {
        assert_eq!(parse_hex_bytes("00 64 01:0b").unwrap(), vec![0x00, 0x64, 0x01, 0x0B]);
        assert!(parse_hex_bytes("123").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn frame_ids() {
        assert_eq!(parse_frame_id("0x123").unwrap(), 0x123);
        assert_eq!(parse_frame_id("1E0").unwrap(), 0x1E0);
        assert!(parse_frame_id("0xgg").is_err());
    }
}
