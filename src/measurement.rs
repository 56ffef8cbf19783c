//! Measurement buffers and the per-device error table.

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// Bitset of invalid entries; bit `n` is set while entry `n` is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct ValidityMask(u32);

impl ValidityMask {
    pub const ALL_VALID: Self = Self(0);

    pub fn all_invalid(entries: usize) -> Self {
        if entries >= 32 {
            Self(u32::MAX)
        } else {
            Self((1u32 << entries) - 1)
        }
    }

    pub fn is_valid(self, entry: usize) -> bool {
        self.0 & (1 << entry) == 0
    }

    pub fn set_valid(&mut self, entry: usize, valid: bool) {
        if valid {
            self.0 &= !(1 << entry);
        } else {
            self.0 |= 1 << entry;
        }
    }

    pub fn invalid_count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Values of one kind for every device of a string, with per entry validity.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct DeviceTable<T> {
    pub values: Vec<Vec<T>>,
    pub validity: Vec<ValidityMask>,
}

impl<T: Copy + Default> DeviceTable<T> {
    /// Creates a zeroed table with every entry invalid.
    pub fn new(devices: usize, entries: usize) -> Self {
        Self {
            values: vec![vec![T::default(); entries]; devices],
            validity: vec![ValidityMask::all_invalid(entries); devices],
        }
    }

    pub fn devices(&self) -> usize {
        self.values.len()
    }

    pub fn entries(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    /// The value, if it is valid.
    pub fn get(&self, device: usize, entry: usize) -> Option<T> {
        self.validity[device]
            .is_valid(entry)
            .then(|| self.values[device][entry])
    }

    pub fn set(&mut self, device: usize, entry: usize, value: T) {
        self.values[device][entry] = value;
        self.validity[device].set_valid(entry, true);
    }

    /// Marks the entry invalid and keeps the last value.
    pub fn invalidate(&mut self, device: usize, entry: usize) {
        self.validity[device].set_valid(entry, false);
    }

    pub fn valid_entries(&self) -> usize {
        let entries = self.entries();
        self.validity
            .iter()
            .map(|mask| (0..entries).filter(|e| mask.is_valid(*e)).count())
            .sum()
    }
}

pub type CellTemperatures = DeviceTable<i16>;
pub type GpioVoltages = DeviceTable<u16>;
pub type MuxVoltages = DeviceTable<u16>;
pub type BalancingFeedback = DeviceTable<u16>;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct CellVoltages {
    /// Cell block voltages in mV.
    pub cells: DeviceTable<u16>,
    /// Sum of every valid cell block.
    pub pack_millivolts: u32,
    pub valid_cells: usize,
}

impl CellVoltages {
    pub fn new(devices: usize, cells: usize) -> Self {
        Self {
            cells: DeviceTable::new(devices, cells),
            pack_millivolts: 0,
            valid_cells: 0,
        }
    }

    /// Aggregates the pack voltage and the number of valid cells.
    pub fn finalize(&mut self) {
        let mut pack = 0u32;
        let mut valid = 0;
        for (values, mask) in self.cells.values.iter().zip(&self.cells.validity) {
            for (cell, mv) in values.iter().enumerate() {
                if mask.is_valid(cell) {
                    pack += u32::from(*mv);
                    valid += 1;
                }
            }
        }
        self.pack_millivolts = pack;
        self.valid_cells = valid;
    }

    /// Returns `true` when every cell block of `device` is valid.
    pub fn device_valid(&self, device: usize) -> bool {
        self.cells.validity[device].invalid_count() == 0
    }
}

/// Balancing requests per device and cell block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct BalancingControl {
    pub requested: Vec<Vec<bool>>,
}

impl BalancingControl {
    pub fn new(devices: usize, cells: usize) -> Self {
        Self {
            requested: vec![vec![false; cells]; devices],
        }
    }

    pub fn active(&self) -> usize {
        self.requested.iter().flatten().filter(|on| **on).count()
    }
}

/// Register group a receive frame was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// Cell voltage group, 0 for RDCVA.
    Voltage(usize),
    /// Auxiliary group, 0 for RDAUXA.
    Aux(usize),
    Comm,
    Config,
}

impl RegisterGroup {
    const fn bit(self) -> usize {
        match self {
            Self::Voltage(group) => group,
            Self::Aux(group) => 8 + group,
            Self::Comm => 16,
            Self::Config => 17,
        }
    }
}

/// PEC failures per register group and multiplexer acknowledge state of every device.
///
/// A failure stays recorded until the same group is read again with a good PEC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTable {
    pec: Vec<Vec<ValidityMask>>,
    mux_ack_failed: Vec<Vec<[bool; 4]>>,
}

impl ErrorTable {
    pub fn new(strings: usize, devices: usize) -> Self {
        Self {
            pec: vec![vec![ValidityMask::ALL_VALID; devices]; strings],
            mux_ack_failed: vec![vec![[false; 4]; devices]; strings],
        }
    }

    pub fn reset(&mut self) {
        self.pec
            .iter_mut()
            .flatten()
            .for_each(|mask| *mask = ValidityMask::ALL_VALID);
        self.mux_ack_failed
            .iter_mut()
            .flatten()
            .for_each(|muxes| *muxes = [false; 4]);
    }

    pub fn set_pec(&mut self, string: usize, device: usize, group: RegisterGroup, ok: bool) {
        self.pec[string][device].set_valid(group.bit(), ok);
    }

    /// Result of the last PEC check of `group`.
    pub fn pec_ok(&self, string: usize, device: usize, group: RegisterGroup) -> bool {
        self.pec[string][device].is_valid(group.bit())
    }

    /// `true` while no register group of the device has a PEC failure recorded.
    pub fn device_pec_ok(&self, string: usize, device: usize) -> bool {
        self.pec[string][device].invalid_count() == 0
    }

    pub fn set_mux_ack_failed(&mut self, string: usize, device: usize, mux: u8, failed: bool) {
        self.mux_ack_failed[string][device][usize::from(mux)] = failed;
    }

    pub fn mux_ack_failed(&self, string: usize, device: usize, mux: u8) -> bool {
        self.mux_ack_failed[string][device][usize::from(mux)]
    }
}
