//! Measurement store the driver publishes into.

use crate::config::ChainConfig;
use crate::measurement::{
    BalancingControl, BalancingFeedback, CellTemperatures, CellVoltages, GpioVoltages, MuxVoltages,
};
use crate::open_wire::OpenWireReport;
use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// Shared measurement database.
///
/// Every call is a short critical section; the driver never holds a store
/// borrow across a bus transfer.
pub trait MeasurementStore {
    fn write_cell_voltages(&self, string: usize, voltages: &CellVoltages);
    fn write_cell_temperatures(&self, string: usize, temperatures: &CellTemperatures);
    fn write_gpio_voltages(&self, string: usize, gpio: &GpioVoltages);
    fn write_mux_voltages(&self, string: usize, mux: &MuxVoltages);
    fn write_balancing_feedback(&self, string: usize, feedback: &BalancingFeedback);
    fn read_balancing_control(&self, string: usize) -> BalancingControl;
    fn write_open_wire(&self, string: usize, report: &OpenWireReport);
    /// Output port value per device.
    fn read_io_expander_outputs(&self, string: usize) -> Vec<u8>;
    fn write_io_expander_inputs(&self, string: usize, inputs: &[Option<u8>]);
    /// Byte to write per device.
    fn read_eeprom_write_data(&self, string: usize) -> Vec<u8>;
    fn write_eeprom_data(&self, string: usize, address: u16, data: &[Option<u8>]);
    /// Board temperatures in 0.1 °C.
    fn write_board_temperatures(&self, string: usize, temperatures: &[Option<i16>]);
}

/// Everything known about one string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct StringSnapshot {
    pub cell_voltages: CellVoltages,
    pub cell_temperatures: CellTemperatures,
    pub gpio_voltages: GpioVoltages,
    pub mux_voltages: MuxVoltages,
    pub balancing_feedback: BalancingFeedback,
    pub balancing_control: BalancingControl,
    pub open_wire: Option<OpenWireReport>,
    pub io_expander_outputs: Vec<u8>,
    pub io_expander_inputs: Vec<Option<u8>>,
    pub eeprom_write_data: Vec<u8>,
    /// Last EEPROM read with its address.
    pub eeprom_data: Option<(u16, Vec<Option<u8>>)>,
    pub board_temperatures: Vec<Option<i16>>,
    /// Number of committed cell voltage measurements.
    pub voltage_updates: u64,
}

impl StringSnapshot {
    fn new(config: &ChainConfig) -> Self {
        let devices = config.devices_per_string;
        let cells = config.cell_blocks();
        Self {
            cell_voltages: CellVoltages::new(devices, cells),
            cell_temperatures: CellTemperatures::new(devices, config.temperature_sensors_per_device),
            gpio_voltages: GpioVoltages::new(devices, config.gpios()),
            mux_voltages: MuxVoltages::new(devices, config.mux_slots()),
            balancing_feedback: BalancingFeedback::new(devices, 1),
            balancing_control: BalancingControl::new(devices, cells),
            open_wire: None,
            io_expander_outputs: vec![0; devices],
            io_expander_inputs: vec![None; devices],
            eeprom_write_data: vec![0; devices],
            eeprom_data: None,
            board_temperatures: vec![None; devices],
            voltage_updates: 0,
        }
    }
}

/// In-memory store, cheap to clone and shareable across threads.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    strings: Arc<Mutex<Vec<StringSnapshot>>>,
}

impl MemoryStore {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            strings: Arc::new(Mutex::new(
                (0..config.strings).map(|_| StringSnapshot::new(config)).collect(),
            )),
        }
    }

    pub fn snapshot(&self, string: usize) -> Option<StringSnapshot> {
        self.strings.lock().get(string).cloned()
    }

    pub fn snapshots(&self) -> Vec<StringSnapshot> {
        self.strings.lock().clone()
    }

    /// Requests or releases balancing of one cell block.
    pub fn set_balancing(&self, string: usize, device: usize, cell: usize, on: bool) {
        if let Some(slot) = self
            .strings
            .lock()
            .get_mut(string)
            .and_then(|s| s.balancing_control.requested.get_mut(device))
            .and_then(|d| d.get_mut(cell))
        {
            *slot = on;
        } else {
            log::warn!("No cell block {cell} on string {string} device {device}");
        }
    }

    pub fn set_io_expander_outputs(&self, string: usize, outputs: &[u8]) {
        self.with_string(string, |s| copy_into(&mut s.io_expander_outputs, outputs));
    }

    pub fn set_eeprom_write_data(&self, string: usize, data: &[u8]) {
        self.with_string(string, |s| copy_into(&mut s.eeprom_write_data, data));
    }

    fn with_string(&self, string: usize, f: impl FnOnce(&mut StringSnapshot)) {
        match self.strings.lock().get_mut(string) {
            Some(snapshot) => f(snapshot),
            None => log::warn!("String {string} does not exist"),
        }
    }

    fn read<T>(&self, string: usize, f: impl FnOnce(&StringSnapshot) -> T) -> Option<T> {
        self.strings.lock().get(string).map(f)
    }
}

fn copy_into<T: Clone>(target: &mut [T], source: &[T]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t = s.clone();
    }
}

impl MeasurementStore for MemoryStore {
    fn write_cell_voltages(&self, string: usize, voltages: &CellVoltages) {
        self.with_string(string, |s| {
            s.cell_voltages = voltages.clone();
            s.voltage_updates += 1;
        });
    }

    fn write_cell_temperatures(&self, string: usize, temperatures: &CellTemperatures) {
        self.with_string(string, |s| s.cell_temperatures = temperatures.clone());
    }

    fn write_gpio_voltages(&self, string: usize, gpio: &GpioVoltages) {
        self.with_string(string, |s| s.gpio_voltages = gpio.clone());
    }

    fn write_mux_voltages(&self, string: usize, mux: &MuxVoltages) {
        self.with_string(string, |s| s.mux_voltages = mux.clone());
    }

    fn write_balancing_feedback(&self, string: usize, feedback: &BalancingFeedback) {
        self.with_string(string, |s| s.balancing_feedback = feedback.clone());
    }

    fn read_balancing_control(&self, string: usize) -> BalancingControl {
        self.read(string, |s| s.balancing_control.clone())
            .unwrap_or_else(|| BalancingControl::new(0, 0))
    }

    fn write_open_wire(&self, string: usize, report: &OpenWireReport) {
        self.with_string(string, |s| s.open_wire = Some(report.clone()));
    }

    fn read_io_expander_outputs(&self, string: usize) -> Vec<u8> {
        self.read(string, |s| s.io_expander_outputs.clone())
            .unwrap_or_default()
    }

    fn write_io_expander_inputs(&self, string: usize, inputs: &[Option<u8>]) {
        self.with_string(string, |s| s.io_expander_inputs = inputs.to_vec());
    }

    fn read_eeprom_write_data(&self, string: usize) -> Vec<u8> {
        self.read(string, |s| s.eeprom_write_data.clone())
            .unwrap_or_default()
    }

    fn write_eeprom_data(&self, string: usize, address: u16, data: &[Option<u8>]) {
        self.with_string(string, |s| s.eeprom_data = Some((address, data.to_vec())));
    }

    fn write_board_temperatures(&self, string: usize, temperatures: &[Option<i16>]) {
        self.with_string(string, |s| s.board_temperatures = temperatures.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let config = ChainConfig::default();
        let store = MemoryStore::new(&config);
        let other = store.clone();
        store.set_balancing(0, 1, 4, true);
        assert!(other.read_balancing_control(0).requested[1][4]);
        assert_eq!(other.read_balancing_control(0).active(), 1);
    }

    #[test]
    fn unknown_string_is_ignored() {
        let store = MemoryStore::new(&ChainConfig::default());
        store.set_balancing(3, 0, 0, true);
        store.write_io_expander_inputs(3, &[Some(1)]);
        assert!(store.snapshot(3).is_none());
        assert!(store.read_io_expander_outputs(3).is_empty());
        assert_eq!(store.read_balancing_control(3).active(), 0);
    }

    #[test]
    fn commits_count_updates() {
        let config = ChainConfig::default();
        let store = MemoryStore::new(&config);
        let mut voltages = CellVoltages::new(2, 12);
        voltages.cells.set(0, 0, 3700);
        store.write_cell_voltages(0, &voltages);
        store.write_cell_voltages(0, &voltages);
        let snapshot = store.snapshot(0).unwrap();
        assert_eq!(snapshot.voltage_updates, 2);
        assert_eq!(snapshot.cell_voltages.cells.get(0, 0), Some(3700));
    }

    #[test]
    fn peripheral_data() {
        let store = MemoryStore::new(&ChainConfig::default());
        store.set_io_expander_outputs(0, &[0xAA, 0x55]);
        store.set_eeprom_write_data(0, &[7]);
        assert_eq!(store.read_io_expander_outputs(0), vec![0xAA, 0x55]);
        assert_eq!(store.read_eeprom_write_data(0), vec![7, 0]);
        store.write_eeprom_data(0, 0x10, &[Some(7), None]);
        assert_eq!(
            store.snapshot(0).unwrap().eeprom_data,
            Some((0x10, vec![Some(7), None]))
        );
    }
}
