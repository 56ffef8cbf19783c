//! Deployment configuration of the daisy chain.

use crate::calibration::{CurvePoint, TemperatureCurve};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_I2C_ADDRESS: u8 = 0x7F;

/// Supported monitor families.
///
/// The family decides the register layout and the open wire boundary rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChipFamily {
    /// 12 cell inputs, register groups A-D, GPIO1-5.
    Ltc6811,
    /// 18 cell inputs, register groups A-F, GPIO1-9, second configuration group.
    Ltc6813,
}

impl ChipFamily {
    pub const fn voltage_inputs(self) -> usize {
        match self {
            ChipFamily::Ltc6811 => 12,
            ChipFamily::Ltc6813 => 18,
        }
    }

    pub const fn voltage_register_groups(self) -> usize {
        self.voltage_inputs() / 3
    }

    pub const fn gpio_inputs(self) -> usize {
        match self {
            ChipFamily::Ltc6811 => 5,
            ChipFamily::Ltc6813 => 9,
        }
    }

    pub const fn aux_register_groups(self) -> usize {
        match self {
            ChipFamily::Ltc6811 => 2,
            ChipFamily::Ltc6813 => 4,
        }
    }

    /// GPIO index (zero based) carried by each slot of an auxiliary register
    /// group. `None` marks the reference or reserved slots.
    pub const fn aux_slots(self, group: usize) -> [Option<usize>; 3] {
        match (self, group) {
            (_, 0) => [Some(0), Some(1), Some(2)],
            (_, 1) => [Some(3), Some(4), None],
            (ChipFamily::Ltc6813, 2) => [Some(5), Some(6), Some(7)],
            (ChipFamily::Ltc6813, 3) => [Some(8), None, None],
            _ => [None, None, None],
        }
    }

    pub const fn has_config_b(self) -> bool {
        matches!(self, ChipFamily::Ltc6813)
    }
}

/// ADC conversion speed (MD bits with ADCOPT cleared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdcMode {
    /// 27 kHz
    Fast,
    /// 7 kHz
    Normal,
    /// 26 Hz
    Filtered,
}

/// Cell channel selection of a cell conversion (CH bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellChannel {
    All,
    /// Cell pair 1 to 6, e.g. pair 1 converts cells 1, 7 (and 13).
    Pair(u8),
}

impl CellChannel {
    pub const fn selector(self) -> u8 {
        match self {
            CellChannel::All => 0,
            CellChannel::Pair(n) if n >= 1 && n <= 6 => n,
            CellChannel::Pair(_) => 0,
        }
    }

    pub const fn is_single(self) -> bool {
        self.selector() != 0
    }
}

/// GPIO channel selection of an auxiliary conversion (CHG bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpioChannel {
    All,
    /// GPIO1 to GPIO5.
    Gpio(u8),
    SecondReference,
}

impl GpioChannel {
    pub const fn selector(self) -> u8 {
        match self {
            GpioChannel::All => 0,
            GpioChannel::Gpio(n) if n >= 1 && n <= 5 => n,
            GpioChannel::Gpio(_) => 0,
            GpioChannel::SecondReference => 6,
        }
    }

    pub const fn is_single(self) -> bool {
        self.selector() != 0
    }
}

/// One entry of the multiplexer sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxStep {
    /// Multiplexer id on every device (0 to 3).
    pub mux: u8,
    /// Channel to select; `None` deselects all channels and skips the conversion.
    #[serde(default)]
    pub channel: Option<u8>,
    /// Temperature sensor fed by this channel; raw voltages are stored otherwise.
    #[serde(default)]
    pub sensor: Option<usize>,
}

/// 7 bit I2C addresses of the bridged peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralAddresses {
    /// Address of multiplexer 0; multiplexer `n` lives at `mux_base + n`.
    pub mux_base: u8,
    pub io_expander: u8,
    pub eeprom: u8,
    pub temperature_sensor: u8,
}

impl PeripheralAddresses {
    /// Address of multiplexer `mux`.
    pub fn mux(&self, mux: u8) -> u8 {
        self.mux_base.saturating_add(mux)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let addresses = [
            ("mux_base", self.mux_base),
            ("io_expander", self.io_expander),
            ("eeprom", self.eeprom),
            ("temperature_sensor", self.temperature_sensor),
        ];
        for (name, address) in addresses {
            if address > MAX_I2C_ADDRESS {
                return Err(ConfigError::Invalid(format!(
                    "{name} address {address:#04X} is not a 7 bit I2C address"
                )));
            }
        }
        if self.mux_base > MAX_I2C_ADDRESS - 3 {
            return Err(ConfigError::Invalid(format!(
                "multiplexers at {:#04X} to {:#04X} exceed the 7 bit I2C address range",
                self.mux_base,
                u16::from(self.mux_base) + 3
            )));
        }
        Ok(())
    }
}

impl Default for PeripheralAddresses {
    fn default() -> Self {
        Self {
            mux_base: 0x4C,
            io_expander: 0x20,
            eeprom: 0x50,
            temperature_sensor: 0x48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub family: ChipFamily,
    /// Number of independent strings, each with its own bus interface.
    pub strings: usize,
    pub devices_per_string: usize,
    /// Which physical voltage inputs carry a cell block.
    pub voltage_inputs_used: Vec<bool>,
    pub temperature_sensors_per_device: usize,
    pub bus_clock_hz: u32,
    /// Period of the external trigger; all settle times are counted in these ticks.
    #[serde(with = "humantime_serde")]
    pub trigger_period: Duration,
    pub adc_mode: AdcMode,
    pub discharge_permitted: bool,
    /// Number of probe commands issued per open wire direction.
    pub open_wire_probes: u8,
    pub open_wire_threshold_mv: i32,
    /// Accept every frame even if its PEC does not match.
    pub pec_bypass: bool,
    pub mux_sequence: Vec<MuxStep>,
    /// GPIO (one based) the multiplexer outputs are wired to.
    pub mux_gpio: u8,
    /// Convert and store every GPIO after the multiplexer sequence.
    pub measure_all_gpios: bool,
    /// GPIO (one based) used for the balancing feedback measurement.
    pub balancing_feedback_gpio: u8,
    pub temperature_curve: Vec<CurvePoint>,
    pub peripherals: PeripheralAddresses,
}

impl Default for ChainConfig {
    fn default() -> Self {
        let mux_sequence = (0..8)
            .map(|channel| MuxStep {
                mux: 0,
                channel: Some(channel),
                sensor: Some(channel as usize),
            })
            .chain(std::iter::once(MuxStep {
                mux: 0,
                channel: None,
                sensor: None,
            }))
            .collect();
        Self {
            family: ChipFamily::Ltc6811,
            strings: 1,
            devices_per_string: 2,
            voltage_inputs_used: vec![true; ChipFamily::Ltc6811.voltage_inputs()],
            temperature_sensors_per_device: 8,
            bus_clock_hz: 1_000_000,
            trigger_period: Duration::from_millis(1),
            adc_mode: AdcMode::Normal,
            discharge_permitted: false,
            open_wire_probes: 2,
            open_wire_threshold_mv: -400,
            pec_bypass: false,
            mux_sequence,
            mux_gpio: 1,
            measure_all_gpios: true,
            balancing_feedback_gpio: 3,
            temperature_curve: TemperatureCurve::default_ntc().points().to_vec(),
            peripherals: PeripheralAddresses::default(),
        }
    }
}

impl ChainConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "afe.yaml";

    pub fn load(config_file_path: &str) -> Result<Self, ConfigError> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path).map_err(|source| {
            ConfigError::Io {
                path: config_file_path.to_string(),
                source,
            }
        })?;
        let config: Self = serde_yaml::from_reader(&config_file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.strings == 0 {
            return invalid("at least one string is required".into());
        }
        if self.devices_per_string == 0 {
            return invalid("at least one device per string is required".into());
        }
        if self.voltage_inputs_used.len() != self.family.voltage_inputs() {
            return invalid(format!(
                "voltage_inputs_used has {} entries, {:?} has {} inputs",
                self.voltage_inputs_used.len(),
                self.family,
                self.family.voltage_inputs()
            ));
        }
        if self.cell_blocks() == 0 {
            return invalid("no voltage input is used".into());
        }
        if self.bus_clock_hz == 0 {
            return invalid("bus clock must not be zero".into());
        }
        if self.trigger_period.is_zero() {
            return invalid("trigger period must not be zero".into());
        }
        if self.open_wire_probes == 0 {
            return invalid("at least one open wire probe is required".into());
        }
        if self.open_wire_threshold_mv >= 0 {
            return invalid("open wire threshold must be negative".into());
        }
        if !(1..=5).contains(&self.mux_gpio) {
            return invalid(format!("mux_gpio {} is not GPIO1-5", self.mux_gpio));
        }
        if !(1..=5).contains(&self.balancing_feedback_gpio) {
            return invalid(format!(
                "balancing_feedback_gpio {} is not GPIO1-5",
                self.balancing_feedback_gpio
            ));
        }
        for (i, step) in self.mux_sequence.iter().enumerate() {
            if step.mux > 3 {
                return invalid(format!("mux sequence step {i}: mux id {} > 3", step.mux));
            }
            if matches!(step.channel, Some(channel) if channel > 7) {
                return invalid(format!("mux sequence step {i}: channel > 7"));
            }
            if matches!(step.sensor, Some(sensor) if sensor >= self.temperature_sensors_per_device)
            {
                return invalid(format!(
                    "mux sequence step {i}: sensor index out of range"
                ));
            }
        }
        self.peripherals.validate()?;
        TemperatureCurve::new(self.temperature_curve.clone())?;
        Ok(())
    }

    /// Number of cell blocks monitored by each device.
    pub fn cell_blocks(&self) -> usize {
        self.voltage_inputs_used.iter().filter(|used| **used).count()
    }

    /// Sense wires per device, one more than cell blocks.
    pub fn wires(&self) -> usize {
        self.cell_blocks() + 1
    }

    pub fn gpios(&self) -> usize {
        self.family.gpio_inputs()
    }

    /// Slots for raw multiplexer voltages: 4 multiplexers with 8 channels.
    pub fn mux_slots(&self) -> usize {
        32
    }

    /// Map of physical voltage input to logical cell block.
    pub fn input_to_cell(&self) -> Vec<Option<usize>> {
        let mut next = 0;
        self.voltage_inputs_used
            .iter()
            .map(|used| {
                if *used {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Map of logical cell block to physical voltage input.
    pub fn cell_to_input(&self) -> Vec<usize> {
        self.voltage_inputs_used
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(input, _)| input)
            .collect()
    }

    pub fn frame_len(&self) -> usize {
        crate::frame::frame_len(self.devices_per_string)
    }
}
