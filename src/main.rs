use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use ltc_afe_lib::balancing::pack;
use ltc_afe_lib::diag::LogReporter;
use ltc_afe_lib::pec::pec15;
use ltc_afe_lib::simulator::SimulatedChain;
use ltc_afe_lib::store::{MemoryStore, StringSnapshot};
use ltc_afe_lib::{AfeDriver, ChainConfig, RequestError, RequestKind, StateRequest};
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

pub type Driver = AfeDriver<SimulatedChain, LogReporter, MemoryStore>;

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

fn load_config(path: Option<&str>) -> Result<ChainConfig> {
    match path {
        Some(path) => ChainConfig::load(path)
            .with_context(|| format!("Cannot load chain config from '{path}'")),
        None => Ok(ChainConfig::default()),
    }
}

fn build_driver(config: ChainConfig) -> Result<Driver> {
    let buses = (0..config.strings)
        .map(|_| SimulatedChain::new(&config))
        .collect();
    let store = MemoryStore::new(&config);
    AfeDriver::new(config, buses, LogReporter, store).with_context(|| "Cannot create AFE driver")
}

/// Initializes every string and waits for the first complete measurement cycle.
pub fn initialize(driver: &mut Driver, max_triggers: usize) -> Result<()> {
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .with_context(|| "Cannot request initialization")?;
    if !driver.run_until(max_triggers, |d| d.is_first_cycle_finished()) {
        bail!("First measurement cycle not finished after {max_triggers} triggers");
    }
    Ok(())
}

/// Places a side request and triggers until the driver has served it.
pub fn serve(driver: &mut Driver, request: StateRequest, max_triggers: usize) -> Result<()> {
    let mut accepted = false;
    for _ in 0..max_triggers {
        match driver.set_state_request(request) {
            Ok(()) => {
                accepted = true;
                break;
            }
            Err(RequestError::Pending) => {
                driver.trigger();
            }
            Err(e) => return Err(e).with_context(|| format!("Cannot request {:?}", request.kind)),
        }
    }
    if !accepted {
        bail!("Request mailbox still busy after {max_triggers} triggers");
    }
    let handle = driver.handle();
    let served = driver.run_until(max_triggers, |d| {
        !handle.has_pending_request() && d.acquisition().request.is_none()
    });
    if !served {
        bail!("{:?} not served after {max_triggers} triggers", request.kind);
    }
    Ok(())
}

fn snapshot(driver: &Driver, string: usize) -> Result<StringSnapshot> {
    driver
        .store()
        .snapshot(string)
        .with_context(|| format!("String {string} does not exist"))
}

fn print_measurements(string: usize, snapshot: &StringSnapshot) {
    let voltages = &snapshot.cell_voltages;
    println!(
        "String {string}: {} mV, {} valid cells",
        voltages.pack_millivolts, voltages.valid_cells
    );
    for device in 0..voltages.cells.devices() {
        let cells: Vec<Option<u16>> = (0..voltages.cells.entries())
            .map(|cell| voltages.cells.get(device, cell))
            .collect();
        let temperatures: Vec<Option<f32>> = (0..snapshot.cell_temperatures.entries())
            .map(|sensor| {
                snapshot
                    .cell_temperatures
                    .get(device, sensor)
                    .map(|t| f32::from(t) / 10.0)
            })
            .collect();
        let gpio: Vec<Option<u16>> = (0..snapshot.gpio_voltages.entries())
            .map(|gpio| snapshot.gpio_voltages.get(device, gpio))
            .collect();
        println!("  Device {device}:");
        println!("    Cell voltages [mV]: {cells:?}");
        println!("    Cell temperatures [°C]: {temperatures:?}");
        println!("    GPIO voltages [mV]: {gpio:?}");
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = load_config(args.config.as_deref())?;
    let max_triggers = args.max_triggers;

    match args.command {
        CliCommands::Config => {
            print!(
                "{}",
                serde_yaml::to_string(&config).with_context(|| "Cannot serialize config")?
            );
        }
        CliCommands::Pec { bytes } => {
            println!("PEC15: {:04X}", pec15(&bytes));
        }
        CliCommands::Measure => {
            let mut driver = build_driver(config)?;
            initialize(&mut driver, max_triggers)?;
            for string in 0..driver.config().strings {
                print_measurements(string, &snapshot(&driver, string)?);
            }
        }
        CliCommands::OpenWire {
            string,
            device,
            wires,
        } => {
            let mut driver = build_driver(config)?;
            let bus = driver
                .bus_mut(string)
                .with_context(|| format!("String {string} does not exist"))?;
            if device >= bus.devices() {
                bail!("Device {device} does not exist");
            }
            for wire in wires {
                bus.set_open_wire(device, wire, true);
            }
            initialize(&mut driver, max_triggers)?;
            serve(
                &mut driver,
                StateRequest::new(RequestKind::OpenWireCheck, string),
                max_triggers,
            )?;
            let report = snapshot(&driver, string)?
                .open_wire
                .with_context(|| "No open wire result")?;
            println!("Open wires on string {string}: {}", report.open_count);
            for (device, mask) in report.open.iter().enumerate() {
                let open: Vec<usize> = (0..32).filter(|wire| mask.is_open(*wire)).collect();
                println!("  Device {device}: {open:?}");
            }
        }
        CliCommands::Balance {
            string,
            device,
            cells,
        } => {
            let cell_to_input = config.cell_to_input();
            let mut requested = vec![false; config.cell_blocks()];
            for cell in cells {
                let Some(slot) = requested.get_mut(cell) else {
                    bail!("Cell block {cell} does not exist");
                };
                *slot = true;
            }
            let expected = pack(&requested, &cell_to_input);
            let mut driver = build_driver(config)?;
            initialize(&mut driver, max_triggers)?;
            for (cell, on) in requested.iter().enumerate() {
                driver.store().set_balancing(string, device, cell, *on);
            }
            let reached = driver.run_until(max_triggers, |d| {
                d.bus(string)
                    .is_some_and(|bus| bus.discharge(device) == expected)
            });
            if !reached {
                bail!("Discharge registers not written after {max_triggers} triggers");
            }
            println!(
                "String {string} device {device}: DCC A {:03X}, DCC B {:02X}",
                expected.register_a, expected.register_b
            );
        }
        CliCommands::Peripherals {
            string,
            io_outputs,
            eeprom_address,
            eeprom_value,
        } => {
            let mut driver = build_driver(config)?;
            initialize(&mut driver, max_triggers)?;
            let devices = driver.config().devices_per_string;
            if let Some(outputs) = io_outputs {
                driver
                    .store()
                    .set_io_expander_outputs(string, &vec![outputs; devices]);
                serve(
                    &mut driver,
                    StateRequest::new(RequestKind::IoExpanderWrite, string),
                    max_triggers,
                )?;
            }
            if let Some(value) = eeprom_value {
                driver
                    .store()
                    .set_eeprom_write_data(string, &vec![value; devices]);
                serve(
                    &mut driver,
                    StateRequest::new(
                        RequestKind::EepromWrite {
                            address: eeprom_address,
                        },
                        string,
                    ),
                    max_triggers,
                )?;
            }
            for kind in [
                RequestKind::IoExpanderRead,
                RequestKind::EepromRead {
                    address: eeprom_address,
                },
                RequestKind::TemperatureSensorRead,
                RequestKind::BalancingFeedback,
            ] {
                serve(&mut driver, StateRequest::new(kind, string), max_triggers)?;
            }
            let snapshot = snapshot(&driver, string)?;
            println!("Port expander inputs: {:?}", snapshot.io_expander_inputs);
            println!("EEPROM: {:?}", snapshot.eeprom_data);
            println!(
                "Board temperatures [0.1 °C]: {:?}",
                snapshot.board_temperatures
            );
            let feedback: Vec<Option<u16>> = (0..devices)
                .map(|device| snapshot.balancing_feedback.get(device, 0))
                .collect();
            println!("Balancing feedback codes: {feedback:?}");
        }
        CliCommands::Daemon {
            output,
            interval,
            metrics,
            open_wire_every,
        } => {
            let mut driver = build_driver(config)?;
            initialize(&mut driver, max_triggers)?;
            daemon::run(driver, output, interval, metrics, open_wire_every, max_triggers)?;
        }
    }

    Ok(())
}
