//! Register level model of one daisy chained string.
//!
//! The model answers the command catalog the way the monitors do, including
//! the I2C bridge with multiplexers, a port expander, an EEPROM and a
//! temperature sensor behind every device. Faults can be injected per device.

use crate::balancing::DischargeMask;
use crate::command::{
    Command, RDAUX, RDCFGA, RDCFGB, RDCOMM, RDCV, STCOMM, WRCFGA, WRCFGB, WRCOMM,
};
use crate::config::{ChainConfig, ChipFamily, PeripheralAddresses};
use crate::error::BusError;
use crate::frame::{frame_len, Payload, COMMAND_LENGTH, DEVICE_SLOT_LENGTH, PAYLOAD_LENGTH};
use crate::i2c::{self, CommField, Icom, SLAVE_ACK, SLAVE_ACK_STOP, SLAVE_NACK, SLAVE_NACK_STOP};
use crate::pec::{pec15, verify};
use crate::registers::{discharge_from_config, CLEARED_CODE};
use crate::transport::BusTransport;

const EEPROM_SIZE: usize = 256;
const FULL_SCALE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slave {
    Mux(u8),
    IoExpander,
    Eeprom,
    TemperatureSensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusPhase {
    Idle,
    Write { slave: Slave, written: usize },
    Read { slave: Slave, read: usize },
}

#[derive(Debug, Clone)]
struct SimDevice {
    config_a: Payload,
    config_b: Payload,
    cell_millivolts: Vec<u16>,
    cell_codes: Vec<u16>,
    gpio_millivolts: Vec<u16>,
    aux_codes: Vec<u16>,
    comm: Payload,
    open_wires: Vec<bool>,
    corrupt_pec: bool,
    corrupt_opcodes: Vec<u16>,
    nack: bool,
    mux_channels: [Option<u8>; 4],
    mux_inputs: [[u16; 8]; 4],
    io_outputs: u8,
    io_inputs: u8,
    eeprom: Vec<u8>,
    eeprom_pointer: u16,
    board_deci_celsius: i16,
    phase: BusPhase,
}

impl SimDevice {
    fn new(device: usize, inputs: usize, gpios: usize) -> Self {
        Self {
            config_a: [0; PAYLOAD_LENGTH],
            config_b: [0; PAYLOAD_LENGTH],
            cell_millivolts: (0..inputs)
                .map(|input| 3600 + 10 * input as u16 + device as u16)
                .collect(),
            cell_codes: vec![CLEARED_CODE; inputs],
            gpio_millivolts: vec![1500; gpios],
            aux_codes: vec![CLEARED_CODE; 12],
            comm: [0; PAYLOAD_LENGTH],
            open_wires: vec![false; inputs + 1],
            corrupt_pec: false,
            corrupt_opcodes: Vec::new(),
            nack: false,
            mux_channels: [None; 4],
            mux_inputs: [[1700; 8]; 4],
            io_outputs: 0,
            io_inputs: 0,
            eeprom: vec![0xFF; EEPROM_SIZE],
            eeprom_pointer: 0,
            board_deci_celsius: 250,
            phase: BusPhase::Idle,
        }
    }
}

/// Simulated string implementing [`BusTransport`].
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    family: ChipFamily,
    mux_gpio: u8,
    addresses: PeripheralAddresses,
    devices: Vec<SimDevice>,
    awake: bool,
    fail_transfers: usize,
    opcodes: Vec<u16>,
}

impl SimulatedChain {
    pub fn new(config: &ChainConfig) -> Self {
        let family = config.family;
        Self {
            family,
            mux_gpio: config.mux_gpio,
            addresses: config.peripherals,
            devices: (0..config.devices_per_string)
                .map(|device| SimDevice::new(device, family.voltage_inputs(), family.gpio_inputs()))
                .collect(),
            awake: false,
            fail_transfers: 0,
            opcodes: Vec::new(),
        }
    }

    pub fn devices(&self) -> usize {
        self.devices.len()
    }

    /// Makes the next `count` bus calls fail.
    pub fn fail_next_transfers(&mut self, count: usize) {
        self.fail_transfers = count;
    }

    pub fn set_corrupt_pec(&mut self, device: usize, corrupt: bool) {
        self.devices[device].corrupt_pec = corrupt;
    }

    /// Corrupts the PEC of `device` in answers to the read command `opcode` only.
    pub fn set_corrupt_pec_on(&mut self, device: usize, opcode: u16, corrupt: bool) {
        let opcodes = &mut self.devices[device].corrupt_opcodes;
        opcodes.retain(|o| *o != opcode);
        if corrupt {
            opcodes.push(opcode);
        }
    }

    /// Disconnects sense wire `wire` (0 to inputs) of `device`.
    pub fn set_open_wire(&mut self, device: usize, wire: usize, open: bool) {
        self.devices[device].open_wires[wire] = open;
    }

    /// Every bridged peripheral of `device` stops acknowledging.
    pub fn set_i2c_nack(&mut self, device: usize, nack: bool) {
        self.devices[device].nack = nack;
    }

    pub fn set_cell_millivolts(&mut self, device: usize, input: usize, millivolts: u16) {
        self.devices[device].cell_millivolts[input] = millivolts;
    }

    pub fn set_gpio_millivolts(&mut self, device: usize, gpio: usize, millivolts: u16) {
        self.devices[device].gpio_millivolts[gpio] = millivolts;
    }

    pub fn set_mux_input(&mut self, device: usize, mux: u8, channel: u8, millivolts: u16) {
        self.devices[device].mux_inputs[usize::from(mux)][usize::from(channel)] = millivolts;
    }

    pub fn set_io_expander_inputs(&mut self, device: usize, inputs: u8) {
        self.devices[device].io_inputs = inputs;
    }

    pub fn set_board_temperature(&mut self, device: usize, deci_celsius: i16) {
        self.devices[device].board_deci_celsius = deci_celsius;
    }

    pub fn set_eeprom(&mut self, device: usize, address: u16, value: u8) {
        self.devices[device].eeprom[usize::from(address) % EEPROM_SIZE] = value;
    }

    pub fn eeprom(&self, device: usize, address: u16) -> u8 {
        self.devices[device].eeprom[usize::from(address) % EEPROM_SIZE]
    }

    pub fn io_expander_outputs(&self, device: usize) -> u8 {
        self.devices[device].io_outputs
    }

    pub fn mux_channel(&self, device: usize, mux: u8) -> Option<u8> {
        self.devices[device].mux_channels[usize::from(mux)]
    }

    /// Discharge switches as currently configured.
    pub fn discharge(&self, device: usize) -> DischargeMask {
        let d = &self.devices[device];
        discharge_from_config(
            &d.config_a,
            self.family.has_config_b().then_some(&d.config_b[..]),
        )
    }

    pub fn config_a(&self, device: usize) -> Payload {
        self.devices[device].config_a
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Opcodes received since the last call to [`Self::clear_opcodes`].
    pub fn opcodes(&self) -> &[u16] {
        &self.opcodes
    }

    pub fn clear_opcodes(&mut self) {
        self.opcodes.clear();
    }

    fn injected_failure(&mut self) -> Result<(), BusError> {
        if self.fail_transfers > 0 {
            self.fail_transfers -= 1;
            return Err(BusError::Transfer("injected failure".into()));
        }
        Ok(())
    }

    fn command(&mut self, frame: &[u8]) -> Result<u16, BusError> {
        if frame.len() < COMMAND_LENGTH {
            return Err(BusError::Length {
                expected: COMMAND_LENGTH,
                received: frame.len(),
            });
        }
        let opcode = u16::from_be_bytes([frame[0], frame[1]]);
        if !verify(&frame[..2], frame[2], frame[3]) {
            log::warn!("Simulator: command PEC mismatch on {:02X?}", &frame[..4]);
            return Err(BusError::Transfer("command PEC mismatch".into()));
        }
        log::trace!("Simulator: opcode {opcode:#05X}");
        self.opcodes.push(opcode);
        Ok(opcode)
    }

    /// Payloads of a write frame in logical device order; `None` on a slot PEC error.
    fn write_payloads(&self, frame: &[u8]) -> Vec<Option<Payload>> {
        let devices = self.devices.len();
        (0..devices)
            .map(|device| {
                let offset = COMMAND_LENGTH + (devices - 1 - device) * DEVICE_SLOT_LENGTH;
                let slot = frame.get(offset..offset + DEVICE_SLOT_LENGTH)?;
                let payload = &slot[..PAYLOAD_LENGTH];
                if !verify(payload, slot[PAYLOAD_LENGTH], slot[PAYLOAD_LENGTH + 1]) {
                    log::warn!("Simulator: device {device} dropped a write with bad PEC");
                    return None;
                }
                payload.try_into().ok()
            })
            .collect()
    }

    fn write_register(&mut self, opcode: u16, frame: &[u8]) {
        let payloads = self.write_payloads(frame);
        for (device, payload) in self.devices.iter_mut().zip(payloads) {
            let Some(payload) = payload else {
                continue;
            };
            match opcode {
                op if op == WRCFGA.opcode() => device.config_a = payload,
                op if op == WRCFGB.opcode() => device.config_b = payload,
                _ => {
                    device.comm = payload;
                }
            }
        }
    }

    fn convert_cells(&mut self, selector: u8) {
        let inputs = self.family.voltage_inputs();
        for device in &mut self.devices {
            for input in 0..inputs {
                if selector == 0 || input % 6 == usize::from(selector - 1) {
                    device.cell_codes[input] = device.cell_millivolts[input].saturating_mul(10);
                }
            }
        }
    }

    fn probe_open_wires(&mut self, pull_up: bool) {
        let inputs = self.family.voltage_inputs();
        let sentinel = match self.family {
            ChipFamily::Ltc6811 => 0,
            ChipFamily::Ltc6813 => FULL_SCALE,
        };
        for device in &mut self.devices {
            for input in 0..inputs {
                device.cell_codes[input] = device.cell_millivolts[input].saturating_mul(10);
            }
            for wire in 0..=inputs {
                if !device.open_wires[wire] {
                    continue;
                }
                if wire == 0 {
                    if pull_up {
                        device.cell_codes[0] = sentinel;
                    }
                } else if wire == inputs {
                    if !pull_up {
                        device.cell_codes[inputs - 1] = sentinel;
                    }
                } else if pull_up {
                    device.cell_codes[wire] = 0;
                } else {
                    device.cell_codes[wire] = FULL_SCALE;
                }
            }
        }
    }

    fn convert_gpios(&mut self, selector: u8) {
        let mux_gpio = usize::from(self.mux_gpio.saturating_sub(1));
        let gpios = self.family.gpio_inputs();
        for device in &mut self.devices {
            let mux_output = device
                .mux_channels
                .iter()
                .enumerate()
                .find_map(|(mux, channel)| channel.map(|c| device.mux_inputs[mux][usize::from(c)]));
            for gpio in 0..gpios {
                if selector != 0 && usize::from(selector) != gpio + 1 {
                    continue;
                }
                let millivolts = match mux_output {
                    Some(mv) if gpio == mux_gpio => mv,
                    _ => device.gpio_millivolts[gpio],
                };
                device.aux_codes[aux_index(self.family, gpio)] = millivolts.saturating_mul(10);
            }
            if selector == 0 || selector == 6 {
                // second reference, slot 3 of group B
                device.aux_codes[5] = 30_000;
            }
        }
    }

    fn start_conversion(&mut self, opcode: u16) {
        if opcode & 0x668 == 0x260 {
            self.convert_cells((opcode & 0x07) as u8);
        } else if opcode & 0x628 == 0x228 {
            self.probe_open_wires(opcode & 0x40 != 0);
        } else if opcode & 0x660 == 0x460 {
            self.convert_gpios((opcode & 0x07) as u8);
        } else {
            log::warn!("Simulator: unknown command {opcode:#05X}");
        }
    }

    fn read_register(&self, opcode: u16, device: &SimDevice) -> Payload {
        let codes = |codes: &[u16], group: usize| -> Payload {
            let mut payload = [0xFF; PAYLOAD_LENGTH];
            for slot in 0..3 {
                if let Some(code) = codes.get(group * 3 + slot) {
                    payload[2 * slot..2 * slot + 2].copy_from_slice(&code.to_le_bytes());
                }
            }
            payload
        };
        if let Some(group) = RDCV.iter().position(|c| c.opcode() == opcode) {
            return codes(&device.cell_codes, group);
        }
        if let Some(group) = RDAUX.iter().position(|c| c.opcode() == opcode) {
            return codes(&device.aux_codes, group);
        }
        match opcode {
            op if op == RDCFGA.opcode() => device.config_a,
            op if op == RDCFGB.opcode() => device.config_b,
            op if op == RDCOMM.opcode() => device.comm,
            _ => [0xFF; PAYLOAD_LENGTH],
        }
    }

    fn slave_at(&self, address: u8) -> Option<Slave> {
        let a = &self.addresses;
        match address {
            x if x == a.io_expander => Some(Slave::IoExpander),
            x if x == a.eeprom => Some(Slave::Eeprom),
            x if x == a.temperature_sensor => Some(Slave::TemperatureSensor),
            x if (a.mux_base..a.mux_base.saturating_add(4)).contains(&x) => {
                Some(Slave::Mux(x - a.mux_base))
            }
            _ => None,
        }
    }

    /// Shifts the COMM register of every device out on its I2C bus.
    fn run_i2c(&mut self) {
        for index in 0..self.devices.len() {
            let fields = i2c::decode(&self.devices[index].comm);
            let mut readback = fields;
            for (field, out) in fields.iter().zip(readback.iter_mut()) {
                *out = self.clock_byte(index, *field);
            }
            self.devices[index].comm = i2c::encode_fields(&readback);
        }
    }

    fn clock_byte(&mut self, index: usize, field: CommField) -> CommField {
        let stop = field.fcom == i2c::Fcom::NackStop as u8;
        let mut out = field;
        match field.icom {
            icom if icom == Icom::Start as u8 => {
                let slave = self.slave_at(field.data >> 1);
                let device = &mut self.devices[index];
                let ack = slave.filter(|_| !device.nack);
                out.fcom = slave_ack(ack.is_some(), stop);
                device.phase = match ack {
                    Some(slave) if field.data & 1 == 1 => BusPhase::Read { slave, read: 0 },
                    Some(slave) => BusPhase::Write { slave, written: 0 },
                    None => BusPhase::Idle,
                };
            }
            icom if icom == Icom::Blank as u8 => {
                let device = &mut self.devices[index];
                match device.phase {
                    BusPhase::Write { slave, written } => {
                        slave_write(device, slave, written, field.data);
                        device.phase = BusPhase::Write {
                            slave,
                            written: written + 1,
                        };
                        out.fcom = slave_ack(true, stop);
                    }
                    BusPhase::Read { slave, read } => {
                        out.data = slave_read(device, slave, read);
                        device.phase = BusPhase::Read {
                            slave,
                            read: read + 1,
                        };
                    }
                    BusPhase::Idle => out.fcom = slave_ack(false, stop),
                }
            }
            icom if icom == Icom::Stop as u8 => self.devices[index].phase = BusPhase::Idle,
            _ => {}
        }
        if stop {
            self.devices[index].phase = BusPhase::Idle;
        }
        out
    }

    fn answer(&self, frame: &[u8], rx: &mut [u8], opcode: u16) {
        rx[..COMMAND_LENGTH].copy_from_slice(&frame[..COMMAND_LENGTH]);
        for (index, device) in self.devices.iter().enumerate() {
            let offset = COMMAND_LENGTH + index * DEVICE_SLOT_LENGTH;
            let payload = if self.awake {
                self.read_register(opcode, device)
            } else {
                [0xFF; PAYLOAD_LENGTH]
            };
            let mut pec = pec15(&payload).to_be_bytes();
            if device.corrupt_pec || device.corrupt_opcodes.contains(&opcode) || !self.awake {
                pec[1] ^= 0x01;
            }
            rx[offset..offset + PAYLOAD_LENGTH].copy_from_slice(&payload);
            rx[offset + PAYLOAD_LENGTH..offset + DEVICE_SLOT_LENGTH].copy_from_slice(&pec);
        }
    }
}

fn aux_index(family: ChipFamily, gpio: usize) -> usize {
    let slots = (0..family.aux_register_groups()).flat_map(|group| {
        family
            .aux_slots(group)
            .into_iter()
            .enumerate()
            .map(move |(slot, input)| (group * 3 + slot, input))
    });
    slots
        .into_iter()
        .find_map(|(index, input)| (input == Some(gpio)).then_some(index))
        .unwrap_or(11)
}

fn slave_ack(ack: bool, stop: bool) -> u8 {
    match (ack, stop) {
        (true, false) => SLAVE_ACK,
        (true, true) => SLAVE_ACK_STOP,
        (false, false) => SLAVE_NACK,
        (false, true) => SLAVE_NACK_STOP,
    }
}

fn slave_write(device: &mut SimDevice, slave: Slave, written: usize, data: u8) {
    match slave {
        Slave::Mux(mux) => {
            device.mux_channels[usize::from(mux)] =
                (data != 0).then(|| data.trailing_zeros() as u8);
        }
        Slave::IoExpander => device.io_outputs = data,
        Slave::Eeprom => match written {
            0 => device.eeprom_pointer = u16::from(data) << 8,
            1 => device.eeprom_pointer |= u16::from(data),
            _ => {
                let address = usize::from(device.eeprom_pointer) % EEPROM_SIZE;
                device.eeprom[address] = data;
                device.eeprom_pointer = device.eeprom_pointer.wrapping_add(1);
            }
        },
        Slave::TemperatureSensor => {}
    }
}

fn slave_read(device: &mut SimDevice, slave: Slave, read: usize) -> u8 {
    match slave {
        Slave::Mux(mux) => device.mux_channels[usize::from(mux)].map_or(0, |c| 1 << c),
        Slave::IoExpander => device.io_inputs,
        Slave::Eeprom => {
            let value = device.eeprom[usize::from(device.eeprom_pointer) % EEPROM_SIZE];
            device.eeprom_pointer = device.eeprom_pointer.wrapping_add(1);
            value
        }
        Slave::TemperatureSensor => {
            let raw = ((i32::from(device.board_deci_celsius) * 16 / 10) << 4) as i16;
            raw.to_be_bytes()[read.min(1)]
        }
    }
}

impl BusTransport for SimulatedChain {
    fn transmit_command(&mut self, frame: &[u8]) -> Result<(), BusError> {
        self.injected_failure()?;
        log::trace!("Simulator: transmit {:02X?}", frame);
        let opcode = self.command(frame)?;
        if !self.awake {
            log::debug!("Simulator: chain asleep, {opcode:#05X} ignored");
            return Ok(());
        }
        if [WRCFGA, WRCFGB, WRCOMM].iter().any(|c| c.opcode() == opcode) {
            self.write_register(opcode, frame);
        } else if opcode == STCOMM.opcode() {
            self.run_i2c();
        } else {
            self.start_conversion(opcode);
        }
        Ok(())
    }

    fn transmit_receive(&mut self, frame: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        self.injected_failure()?;
        let expected = frame_len(self.devices.len());
        if frame.len() != expected || rx.len() != expected {
            return Err(BusError::Length {
                expected,
                received: rx.len().min(frame.len()),
            });
        }
        let opcode = self.command(frame)?;
        self.answer(frame, rx, opcode);
        log::trace!("Simulator: answer {:02X?}", rx);
        Ok(())
    }

    fn transmit_wake_up(&mut self) -> Result<(), BusError> {
        self.injected_failure()?;
        self.awake = true;
        Ok(())
    }

    fn transmit_i2c_bridge_clock(&mut self, strobe: &[u8]) -> Result<(), BusError> {
        self.injected_failure()?;
        let opcode = self.command(strobe)?;
        if opcode != STCOMM.opcode() {
            return Err(BusError::Transfer(format!(
                "expected STCOMM, got {:?}",
                Command::new(opcode)
            )));
        }
        if self.awake {
            self.run_i2c();
        }
        Ok(())
    }
}
