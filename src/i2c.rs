//! I2C bridge codec for the COMM register group.
//!
//! The COMM register holds three I2C bytes. Each byte is framed by an ICOM
//! nibble (what the bridge does before the byte) and an FCOM nibble (what it
//! does after it):
//!
//! ```text
//! payload[2i]     = ICOM << 4 | data >> 4
//! payload[2i + 1] = data << 4 | FCOM
//! ```
//!
//! After STCOMM the register reads back the bytes that were on the bus, with
//! the FCOM nibble replaced by the acknowledge the slave gave.

use crate::command::STCOMM;
use crate::error::Error;
use crate::frame::{device_payload, Payload};

/// ICOM nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Icom {
    Start = 0x6,
    Stop = 0x1,
    Blank = 0x0,
    NoTransmit = 0x7,
}

/// FCOM nibble sent by the bridge (the bus master).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fcom {
    Ack = 0x0,
    Nack = 0x8,
    NackStop = 0x9,
}

/// FCOM nibbles read back after a byte was written to a slave.
pub const SLAVE_ACK: u8 = 0x7;
pub const SLAVE_NACK: u8 = 0xF;
pub const SLAVE_ACK_STOP: u8 = 0x1;
pub const SLAVE_NACK_STOP: u8 = 0x9;

/// Number of SCL clocks STCOMM needs to shift three bytes.
pub const BRIDGE_CLOCKS: usize = 72;

/// One byte slot of the COMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommByte {
    /// The bridge drives `data` onto the bus.
    Write { icom: Icom, data: u8, fcom: Fcom },
    /// The bridge clocks a byte in from the slave.
    Read { fcom: Fcom },
    /// Nothing is transmitted.
    Idle,
}

impl CommByte {
    fn nibbles(self) -> (u8, u8, u8) {
        match self {
            CommByte::Write { icom, data, fcom } => (icom as u8, data, fcom as u8),
            CommByte::Read { fcom } => (Icom::Blank as u8, 0xFF, fcom as u8),
            CommByte::Idle => (Icom::NoTransmit as u8, 0xFF, Fcom::NackStop as u8),
        }
    }

    /// Readback FCOM expected for a positively acknowledged write.
    fn expected_ack(self) -> Option<u8> {
        match self {
            CommByte::Write {
                fcom: Fcom::NackStop,
                ..
            } => Some(SLAVE_ACK_STOP),
            CommByte::Write { .. } => Some(SLAVE_ACK),
            _ => None,
        }
    }
}

/// The three bytes of one COMM register write.
pub type Transaction = [CommByte; 3];

/// Raw fields of one COMM byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommField {
    pub icom: u8,
    pub data: u8,
    pub fcom: u8,
}

pub fn encode(transaction: &Transaction) -> Payload {
    let mut payload = [0; 6];
    for (i, byte) in transaction.iter().enumerate() {
        let (icom, data, fcom) = byte.nibbles();
        payload[2 * i] = (icom << 4) | (data >> 4);
        payload[2 * i + 1] = (data << 4) | (fcom & 0x0F);
    }
    payload
}

pub fn decode(payload: &[u8]) -> [CommField; 3] {
    std::array::from_fn(|i| CommField {
        icom: payload[2 * i] >> 4,
        data: (payload[2 * i] << 4) | (payload[2 * i + 1] >> 4),
        fcom: payload[2 * i + 1] & 0x0F,
    })
}

pub fn encode_fields(fields: &[CommField; 3]) -> Payload {
    let mut payload = [0; 6];
    for (i, field) in fields.iter().enumerate() {
        payload[2 * i] = (field.icom << 4) | (field.data >> 4);
        payload[2 * i + 1] = (field.data << 4) | (field.fcom & 0x0F);
    }
    payload
}

/// Returns `true` if the slave acknowledged every byte written to it.
pub fn acknowledged(transaction: &Transaction, readback: &[u8]) -> bool {
    let fields = decode(readback);
    transaction
        .iter()
        .zip(fields.iter())
        .all(|(byte, field)| byte.expected_ack().map_or(true, |ack| field.fcom == ack))
}

/// Checks PEC and acknowledge of one device and returns the three data bytes.
pub fn read_back(
    rx: &[u8],
    device: usize,
    transaction: &Transaction,
    pec_ok: bool,
    string: usize,
) -> Result<[u8; 3], Error> {
    if !pec_ok {
        return Err(Error::Integrity { string, device });
    }
    let readback = device_payload(rx, device);
    if !acknowledged(transaction, readback) {
        log::warn!(
            "I2C NACK on string {} device {} - readback={:02X?}",
            string,
            device,
            readback
        );
        return Err(Error::BridgeAck { string, device });
    }
    let fields = decode(readback);
    Ok([fields[0].data, fields[1].data, fields[2].data])
}

/// STCOMM followed by the dummy bytes that clock the three I2C bytes out.
pub fn bridge_strobe() -> Vec<u8> {
    let mut strobe = STCOMM.bytes().to_vec();
    strobe.extend(std::iter::repeat(0xFF).take(BRIDGE_CLOCKS / 8));
    strobe
}

pub const fn write_address(address: u8) -> u8 {
    address << 1
}

pub const fn read_address(address: u8) -> u8 {
    (address << 1) | 1
}

fn start(data: u8) -> CommByte {
    CommByte::Write {
        icom: Icom::Start,
        data,
        fcom: Fcom::Nack,
    }
}

fn data(data: u8, fcom: Fcom) -> CommByte {
    CommByte::Write {
        icom: Icom::Blank,
        data,
        fcom,
    }
}

/// Selects `channel` on an 8 channel multiplexer, `None` opens every switch.
pub fn mux_select(address: u8, channel: Option<u8>) -> Transaction {
    let switches = channel.map_or(0, |channel| 1u8 << (channel & 0x07));
    [
        start(write_address(address)),
        data(switches, Fcom::NackStop),
        CommByte::Idle,
    ]
}

pub fn io_expander_write(address: u8, outputs: u8) -> Transaction {
    [
        start(write_address(address)),
        data(outputs, Fcom::NackStop),
        CommByte::Idle,
    ]
}

/// The input port ends up in data byte 1.
pub fn io_expander_read(address: u8) -> Transaction {
    [
        start(read_address(address)),
        CommByte::Read {
            fcom: Fcom::NackStop,
        },
        CommByte::Idle,
    ]
}

/// The temperature register ends up in data bytes 1 and 2.
pub fn temperature_sensor_read(address: u8) -> Transaction {
    [
        start(read_address(address)),
        CommByte::Read { fcom: Fcom::Ack },
        CommByte::Read {
            fcom: Fcom::NackStop,
        },
    ]
}

/// Converts the left aligned 12 bit temperature register (0.0625 °C) to 0.1 °C.
pub fn temperature_from_bytes(high: u8, low: u8) -> i16 {
    let raw = i32::from(i16::from_be_bytes([high, low]) >> 4);
    (raw * 10 / 16) as i16
}

/// Sets the EEPROM address pointer and keeps the bus.
pub fn eeprom_address_phase(address: u8, memory_address: u16) -> Transaction {
    let [high, low] = memory_address.to_be_bytes();
    [
        start(write_address(address)),
        data(high, Fcom::Nack),
        data(low, Fcom::Nack),
    ]
}

pub fn eeprom_write_phase(value: u8) -> Transaction {
    [data(value, Fcom::NackStop), CommByte::Idle, CommByte::Idle]
}

/// Repeated start for reading; the EEPROM byte ends up in data byte 1.
pub fn eeprom_read_phase(address: u8) -> Transaction {
    [
        start(read_address(address)),
        CommByte::Read {
            fcom: Fcom::NackStop,
        },
        CommByte::Idle,
    ]
}
