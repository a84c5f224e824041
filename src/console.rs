use abc150_lib::lifecycle::Station;
use abc150_lib::manager::{TestKind, TestManager};
use abc150_lib::protocol::{Bound, Channel, Limits, LoadMode};
use anyhow::{bail, Context, Result};
use log::*;
use std::io::BufRead;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    Limits {
        channel: Channel,
        bound: Bound,
        limits: Limits,
    },
    Voltage(Channel, f32),
    Current(Channel, f32),
    Power(Channel, f32),
    Load(Channel, LoadMode),
    Enable(Channel),
    Disable(Channel),
    Take(Channel),
    Release(Channel),
    Start {
        kind: TestKind,
        index: usize,
        cycles: Option<u32>,
        destination_voltage: Option<f32>,
    },
    Stop(TestKind, usize),
    StopAll,
    Override,
    Results(TestKind, usize),
    List,
    Bind(Channel, u32),
    Debug,
    Status,
    Quit,
}

fn arg<'a>(args: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .copied()
        .with_context(|| format!("Missing argument <{name}>"))
}

fn parse<T>(args: &[&str], index: usize, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = arg(args, index, name)?;
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid <{name}> '{value}': {e}"))
}

fn parse_opt<T>(args: &[&str], index: usize, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if args.len() > index {
        parse(args, index, name).map(Some)
    } else {
        Ok(None)
    }
}

fn parse_kind(value: &str) -> Result<TestKind> {
    match value {
        "single" => Ok(TestKind::Single),
        "dual" => Ok(TestKind::Dual),
        _ => bail!("Invalid test kind '{value}', expected single or dual"),
    }
}

impl ConsoleCommand {
    /// Parses one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Ok(None);
        };
        let cmd = match command {
            "limits" => {
                let bound = match arg(args, 1, "lower|upper")? {
                    "lower" => Bound::Lower,
                    "upper" => Bound::Upper,
                    other => bail!("Invalid bound '{other}', expected lower or upper"),
                };
                ConsoleCommand::Limits {
                    channel: parse(args, 0, "channel")?,
                    bound,
                    limits: Limits::new(
                        parse(args, 2, "voltage")?,
                        parse(args, 3, "current")?,
                        parse(args, 4, "power")?,
                    ),
                }
            }
            "voltage" => {
                ConsoleCommand::Voltage(parse(args, 0, "channel")?, parse(args, 1, "value")?)
            }
            "current" => {
                ConsoleCommand::Current(parse(args, 0, "channel")?, parse(args, 1, "value")?)
            }
            "power" => ConsoleCommand::Power(parse(args, 0, "channel")?, parse(args, 1, "value")?),
            "load" => ConsoleCommand::Load(parse(args, 0, "channel")?, parse(args, 1, "mode")?),
            "enable" => ConsoleCommand::Enable(parse(args, 0, "channel")?),
            "disable" => ConsoleCommand::Disable(parse(args, 0, "channel")?),
            "take" => ConsoleCommand::Take(parse(args, 0, "channel")?),
            "release" => ConsoleCommand::Release(parse(args, 0, "channel")?),
            "start-single" | "start-dual" => ConsoleCommand::Start {
                kind: if command == "start-single" {
                    TestKind::Single
                } else {
                    TestKind::Dual
                },
                index: parse(args, 0, "index")?,
                cycles: parse_opt(args, 1, "cycles")?,
                destination_voltage: parse_opt(args, 2, "destination voltage")?,
            },
            "stop-single" => ConsoleCommand::Stop(TestKind::Single, parse(args, 0, "index")?),
            "stop-dual" => ConsoleCommand::Stop(TestKind::Dual, parse(args, 0, "index")?),
            "stop-all" => ConsoleCommand::StopAll,
            "override" => ConsoleCommand::Override,
            "results" => ConsoleCommand::Results(
                parse_kind(arg(args, 0, "single|dual")?)?,
                parse(args, 1, "index")?,
            ),
            "list" => ConsoleCommand::List,
            "bind" => {
                ConsoleCommand::Bind(parse(args, 0, "channel")?, parse(args, 1, "battery id")?)
            }
            "debug" => ConsoleCommand::Debug,
            "status" => ConsoleCommand::Status,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => bail!("Unknown command '{other}'"),
        };
        Ok(Some(cmd))
    }
}

const HELP: &str = "commands: limits <ch> <lower|upper> <V> <A> <W> | voltage|current|power <ch> <value> | \
load <ch> <independent|parallel|differential|keep> | enable|disable|take|release <ch> | \
start-single|start-dual <idx> [cycles] [dest V] | stop-single|stop-dual <idx> | stop-all | override | \
results <single|dual> <idx> | list | bind <ch> <battery id> | debug | status | quit";

pub fn print_list(manager: &TestManager) {
    for summary in manager.list() {
        println!("{summary}");
    }
}

fn print_status(station: &Station) -> Result<()> {
    println!("--- Status at {} ---", chrono::Local::now().to_rfc3339());
    let converter = &station.converter;
    let device = serde_json::to_string_pretty(&converter.device())
        .with_context(|| "Cannot serialize device identity")?;
    println!("Device: {device}");
    for channel in Channel::ALL {
        let state = serde_json::to_string_pretty(&converter.channel(channel))
            .with_context(|| format!("Cannot serialize channel {channel}"))?;
        println!("Channel {channel}: {state}");
    }
    println!("--------------------------");
    Ok(())
}

/// Applies one command. Returns `false` once the console should exit.
pub fn execute(command: ConsoleCommand, manager: &TestManager, station: &Station) -> Result<bool> {
    let converter = &station.converter;
    match command {
        ConsoleCommand::Limits {
            channel,
            bound: Bound::Lower,
            limits,
        } => converter.set_lower_limits(channel, limits),
        ConsoleCommand::Limits {
            channel,
            bound: Bound::Upper,
            limits,
        } => converter.set_upper_limits(channel, limits),
        ConsoleCommand::Voltage(channel, value) => converter.set_voltage(channel, value),
        ConsoleCommand::Current(channel, value) => converter.set_current(channel, value),
        ConsoleCommand::Power(channel, value) => converter.set_power(channel, value),
        ConsoleCommand::Load(channel, mode) => converter.set_load_mode(channel, mode),
        ConsoleCommand::Enable(channel) => converter
            .enable(channel)
            .with_context(|| format!("Cannot enable channel {channel}"))?,
        ConsoleCommand::Disable(channel) => converter.disable(channel),
        ConsoleCommand::Take(channel) => converter
            .take_control(channel)
            .with_context(|| format!("Cannot take control of channel {channel}"))?,
        ConsoleCommand::Release(channel) => converter.release_control(channel),
        ConsoleCommand::Start {
            kind,
            index,
            cycles,
            destination_voltage,
        } => {
            let started = match kind {
                TestKind::Single => manager.run_single(index, cycles, destination_voltage),
                TestKind::Dual => manager.run_dual(index, cycles, destination_voltage),
            };
            started.with_context(|| format!("Cannot start {kind} test {index}"))?;
        }
        ConsoleCommand::Stop(kind, index) => manager
            .stop(kind, index)
            .with_context(|| format!("Cannot stop {kind} test {index}"))?,
        ConsoleCommand::StopAll => manager.stop_all(),
        ConsoleCommand::Override => manager.stop_all_override(),
        ConsoleCommand::Results(kind, index) => {
            for line in manager.results(kind, index)? {
                println!("{line}");
            }
        }
        ConsoleCommand::List => print_list(manager),
        ConsoleCommand::Bind(channel, battery) => manager.assign_battery(channel, battery),
        ConsoleCommand::Debug => {
            let enabled = manager.toggle_debug();
            println!("Debug telemetry {}", if enabled { "on" } else { "off" });
        }
        ConsoleCommand::Status => print_status(station)?,
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Reads commands from `input` until `quit` or end of input.
pub fn run<R: BufRead>(input: R, manager: &TestManager, station: &Station) -> Result<()> {
    println!("{HELP}");
    for line in input.lines() {
        let line = line.with_context(|| "Cannot read console input")?;
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                error!("{e}");
                println!("{HELP}");
                continue;
            }
        };
        match execute(command, manager, station) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => error!("{e:#}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_setpoints() {
        assert_eq!(
            ConsoleCommand::parse("voltage B 350.5").unwrap(),
            Some(ConsoleCommand::Voltage(Channel::B, 350.5))
        );
        assert_eq!(
            ConsoleCommand::parse("load a parallel").unwrap(),
            Some(ConsoleCommand::Load(Channel::A, LoadMode::Parallel))
        );
        assert_eq!(
            ConsoleCommand::parse("limits A upper 406 6 2460").unwrap(),
            Some(ConsoleCommand::Limits {
                channel: Channel::A,
                bound: Bound::Upper,
                limits: Limits::new(406.0, 6.0, 2460.0),
            })
        );
    }

    #[test]
    fn parses_test_commands() {
        assert_eq!(
            ConsoleCommand::parse("start-single 2 3").unwrap(),
            Some(ConsoleCommand::Start {
                kind: TestKind::Single,
                index: 2,
                cycles: Some(3),
                destination_voltage: None,
            })
        );
        assert_eq!(
            ConsoleCommand::parse("start-dual 0 1 380").unwrap(),
            Some(ConsoleCommand::Start {
                kind: TestKind::Dual,
                index: 0,
                cycles: Some(1),
                destination_voltage: Some(380.0),
            })
        );
        assert_eq!(
            ConsoleCommand::parse("stop-dual 1").unwrap(),
            Some(ConsoleCommand::Stop(TestKind::Dual, 1))
        );
        assert_eq!(
            ConsoleCommand::parse("results single 4").unwrap(),
            Some(ConsoleCommand::Results(TestKind::Single, 4))
        );
    }

    #[test]
    fn blank_and_invalid_lines() {
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert!(ConsoleCommand::parse("voltage C 10").is_err());
        assert!(ConsoleCommand::parse("enable").is_err());
        assert!(ConsoleCommand::parse("launch").is_err());
    }
}
