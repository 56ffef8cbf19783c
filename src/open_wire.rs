//! Open sense wire detection from a pull-up and a pull-down snapshot.
//!
//! Device `n` has `cells + 1` sense wires. Wire `k` sits between cell block
//! `k - 1` and cell block `k`.

use crate::config::ChipFamily;
use crate::measurement::CellVoltages;
use crate::registers::code_to_millivolts;

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

/// How an open outermost wire shows up in the snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum BoundaryRule {
    /// The boundary cell reads a zero code.
    ZeroCode,
    /// The boundary cell reads the full scale code.
    FullScaleCode,
}

impl BoundaryRule {
    pub const fn for_family(family: ChipFamily) -> Self {
        match family {
            ChipFamily::Ltc6811 => BoundaryRule::ZeroCode,
            ChipFamily::Ltc6813 => BoundaryRule::FullScaleCode,
        }
    }

    pub const fn sentinel_code(self) -> u16 {
        match self {
            BoundaryRule::ZeroCode => 0x0000,
            BoundaryRule::FullScaleCode => 0xFFFF,
        }
    }

    pub const fn sentinel_millivolts(self) -> u16 {
        code_to_millivolts(self.sentinel_code())
    }
}

/// Open wires of one device, bit `k` set when wire `k` is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct WireMask(u32);

impl WireMask {
    pub fn is_open(self, wire: usize) -> bool {
        self.0 & (1 << wire) != 0
    }

    pub fn set_open(&mut self, wire: usize) {
        self.0 |= 1 << wire;
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub struct OpenWireReport {
    pub pull_up: Vec<Vec<u16>>,
    pub pull_down: Vec<Vec<u16>>,
    /// Pull-up minus pull-down in mV.
    pub delta: Vec<Vec<i32>>,
    pub open: Vec<WireMask>,
    pub open_count: usize,
}

impl OpenWireReport {
    pub fn new(devices: usize, cells: usize) -> Self {
        Self {
            pull_up: vec![vec![0; cells]; devices],
            pull_down: vec![vec![0; cells]; devices],
            delta: vec![vec![0; cells]; devices],
            open: vec![WireMask::default(); devices],
            open_count: 0,
        }
    }
}

/// Evaluates both snapshots.
///
/// Cell blocks that are invalid in either snapshot are not evaluated.
pub fn detect(
    pull_up: &CellVoltages,
    pull_down: &CellVoltages,
    rule: BoundaryRule,
    threshold_mv: i32,
) -> OpenWireReport {
    let devices = pull_up.cells.devices();
    let cells = pull_up.cells.entries();
    let sentinel = rule.sentinel_millivolts();
    let mut report = OpenWireReport::new(devices, cells);

    for device in 0..devices {
        let up = |cell: usize| pull_up.cells.get(device, cell);
        let down = |cell: usize| pull_down.cells.get(device, cell);

        for cell in 0..cells {
            report.pull_up[device][cell] = pull_up.cells.values[device][cell];
            report.pull_down[device][cell] = pull_down.cells.values[device][cell];
            report.delta[device][cell] = i32::from(pull_up.cells.values[device][cell])
                - i32::from(pull_down.cells.values[device][cell]);
        }
        if cells == 0 {
            continue;
        }

        let open = &mut report.open[device];
        if up(0) == Some(sentinel) {
            open.set_open(0);
        }
        // a top cell at the sentinel belongs to the top wire
        let top_open = down(cells - 1) == Some(sentinel);
        for cell in 1..cells {
            if top_open && cell == cells - 1 {
                continue;
            }
            if let (Some(u), Some(d)) = (up(cell), down(cell)) {
                if i32::from(u) - i32::from(d) < threshold_mv {
                    open.set_open(cell);
                }
            }
        }
        if top_open {
            open.set_open(cells);
        }
        if open.count() > 0 {
            log::warn!(
                "Open wire detected on device {} wires={:#b}",
                device,
                open.bits()
            );
        }
    }

    report.open_count = report.open.iter().map(|mask| mask.count() as usize).sum();
    report
}
