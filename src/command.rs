//! Closed catalog of LTC68xx commands.
//!
//! Every entry carries its PEC15, computed at compile time, so building a
//! frame never has to checksum the command word at runtime.

use crate::config::{AdcMode, CellChannel, GpioChannel};
use crate::pec::pec15;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Command {
    opcode: u16,
    pec: u16,
}

impl Command {
    pub const fn new(opcode: u16) -> Self {
        Self {
            opcode,
            pec: pec15(&opcode.to_be_bytes()),
        }
    }

    pub const fn opcode(&self) -> u16 {
        self.opcode
    }

    pub const fn pec(&self) -> u16 {
        self.pec
    }

    /// The four command bytes as they appear at the start of every frame.
    pub const fn bytes(&self) -> [u8; 4] {
        let op = self.opcode.to_be_bytes();
        let pec = self.pec.to_be_bytes();
        [op[0], op[1], pec[0], pec[1]]
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:#05X}, pec={:#06X})", self.opcode, self.pec)
    }
}

pub const WRCFGA: Command = Command::new(0x001);
pub const RDCFGA: Command = Command::new(0x002);
pub const WRCFGB: Command = Command::new(0x024);
pub const RDCFGB: Command = Command::new(0x026);

/// Cell voltage register groups A to F.
pub const RDCV: [Command; 6] = [
    Command::new(0x004),
    Command::new(0x006),
    Command::new(0x008),
    Command::new(0x00A),
    Command::new(0x009),
    Command::new(0x00B),
];

/// Auxiliary register groups A to D.
pub const RDAUX: [Command; 4] = [
    Command::new(0x00C),
    Command::new(0x00E),
    Command::new(0x00D),
    Command::new(0x00F),
];

pub const WRCOMM: Command = Command::new(0x721);
pub const RDCOMM: Command = Command::new(0x722);
pub const STCOMM: Command = Command::new(0x723);

/// Pull direction of the open wire probe current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDirection {
    PullUp,
    PullDown,
}

const ADC_MODES: usize = 3;
const CELL_CHANNELS: usize = 7;
const GPIO_CHANNELS: usize = 7;

const fn adcv_opcode(md: u16, dcp: bool, ch: u16) -> u16 {
    0x260 | (md << 7) | ((dcp as u16) << 4) | ch
}

const fn adow_opcode(md: u16, pull_up: bool, dcp: bool) -> u16 {
    0x228 | (md << 7) | ((pull_up as u16) << 6) | ((dcp as u16) << 4)
}

const fn adax_opcode(md: u16, chg: u16) -> u16 {
    0x460 | (md << 7) | chg
}

const fn build_adcv() -> [[[Command; CELL_CHANNELS]; 2]; ADC_MODES] {
    let mut table = [[[Command::new(0x360); CELL_CHANNELS]; 2]; ADC_MODES];
    let mut mode = 0;
    while mode < ADC_MODES {
        let mut dcp = 0;
        while dcp < 2 {
            let mut ch = 0;
            while ch < CELL_CHANNELS {
                table[mode][dcp][ch] =
                    Command::new(adcv_opcode(mode as u16 + 1, dcp == 1, ch as u16));
                ch += 1;
            }
            dcp += 1;
        }
        mode += 1;
    }
    table
}

const fn build_adow() -> [[[Command; 2]; 2]; ADC_MODES] {
    let mut table = [[[Command::new(0x368); 2]; 2]; ADC_MODES];
    let mut mode = 0;
    while mode < ADC_MODES {
        let mut dir = 0;
        while dir < 2 {
            let mut dcp = 0;
            while dcp < 2 {
                table[mode][dir][dcp] =
                    Command::new(adow_opcode(mode as u16 + 1, dir == 0, dcp == 1));
                dcp += 1;
            }
            dir += 1;
        }
        mode += 1;
    }
    table
}

const fn build_adax() -> [[Command; GPIO_CHANNELS]; ADC_MODES] {
    let mut table = [[Command::new(0x560); GPIO_CHANNELS]; ADC_MODES];
    let mut mode = 0;
    while mode < ADC_MODES {
        let mut chg = 0;
        while chg < GPIO_CHANNELS {
            table[mode][chg] = Command::new(adax_opcode(mode as u16 + 1, chg as u16));
            chg += 1;
        }
        mode += 1;
    }
    table
}

/// ADCV indexed by mode, discharge permitted and channel selection.
const ADCV: [[[Command; CELL_CHANNELS]; 2]; ADC_MODES] = build_adcv();
/// ADOW indexed by mode, direction (pull-up first) and discharge permitted.
const ADOW: [[[Command; 2]; 2]; ADC_MODES] = build_adow();
/// ADAX indexed by mode and GPIO channel selection.
const ADAX: [[Command; GPIO_CHANNELS]; ADC_MODES] = build_adax();

const fn mode_index(mode: AdcMode) -> usize {
    match mode {
        AdcMode::Fast => 0,
        AdcMode::Normal => 1,
        AdcMode::Filtered => 2,
    }
}

/// Start cell voltage conversion.
pub const fn start_cell_adc(mode: AdcMode, discharge_permitted: bool, channel: CellChannel) -> Command {
    ADCV[mode_index(mode)][discharge_permitted as usize][channel.selector() as usize]
}

/// Start an open wire probe conversion of all cells.
pub const fn start_open_wire(
    mode: AdcMode,
    direction: ProbeDirection,
    discharge_permitted: bool,
) -> Command {
    let dir = match direction {
        ProbeDirection::PullUp => 0,
        ProbeDirection::PullDown => 1,
    };
    ADOW[mode_index(mode)][dir][discharge_permitted as usize]
}

/// Start GPIO (auxiliary) conversion.
pub const fn start_gpio_adc(mode: AdcMode, channel: GpioChannel) -> Command {
    ADAX[mode_index(mode)][channel.selector() as usize]
}
