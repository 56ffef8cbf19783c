use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn parse_hex_byte(value: &str) -> Result<u8, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("'{value}' is not a hex byte: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Initialize the chain, run one measurement cycle and show all strings
    Measure,
    /// Open sense wires on the simulated chain and run the open wire check
    OpenWire {
        #[arg(long, short, default_value_t = 0)]
        string: usize,
        #[arg(long, short, default_value_t = 0)]
        device: usize,
        /// Comma-separated sense wire indices to disconnect (0 is the bottom wire)
        #[arg(long, short, use_value_delimiter = true)]
        wires: Vec<usize>,
    },
    /// Request balancing of cell blocks and show the discharge registers
    Balance {
        #[arg(long, short, default_value_t = 0)]
        string: usize,
        #[arg(long, short, default_value_t = 0)]
        device: usize,
        /// Comma-separated cell block indices to discharge
        #[arg(long, short, use_value_delimiter = true)]
        cells: Vec<usize>,
    },
    /// Exercise the peripherals behind the I2C bridge
    Peripherals {
        #[arg(long, short, default_value_t = 0)]
        string: usize,
        /// Value to write to the port expander outputs before reading its inputs
        #[arg(long, value_parser = parse_hex_byte)]
        io_outputs: Option<u8>,
        /// EEPROM address to read (and write, see --eeprom-value)
        #[arg(long, default_value_t = 0)]
        eeprom_address: u16,
        /// Value to write to the EEPROM before reading it back
        #[arg(long, value_parser = parse_hex_byte)]
        eeprom_value: Option<u8>,
    },
    /// Compute the PEC15 of hex bytes (e.g. "00 01" for WRCFGA)
    Pec {
        #[arg(required = true, value_parser = parse_hex_byte)]
        bytes: Vec<u8>,
    },
    /// Print the effective chain configuration as YAML
    Config,
    /// Run in daemon mode, periodically outputting measurements
    Daemon {
        /// Output destination for measurements
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval between outputs (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of measurements to output (e.g., cell-voltages,cell-temperatures or all)
        #[clap(
            long,
            short,
            use_value_delimiter = true,
            default_value = "cell-voltages,cell-temperatures"
        )]
        metrics: Vec<String>,
        /// Run an open wire check on every string after this many outputs
        #[clap(long)]
        open_wire_every: Option<u32>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print measurements to the standard output (console).
    Console,
    /// Publish measurements to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "LTC68xx daisy chain command line tool (runs against the chain simulator)"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Chain configuration file (YAML); built-in defaults if omitted
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Give up after this many triggers without reaching the expected state
    #[arg(long, default_value_t = 100_000)]
    pub max_triggers: usize,
}
