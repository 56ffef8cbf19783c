//! Register payload encoding and decoding.

use crate::balancing::DischargeMask;
use crate::config::ChipFamily;
use crate::frame::{device_payload, Payload};
use crate::measurement::{CellVoltages, DeviceTable};

/// Code value of an ADC register after reset or an unfinished conversion.
pub const CLEARED_CODE: u16 = 0xFFFF;

const REFON: u8 = 1 << 2;
const GPIO_PULLDOWNS_OFF: u8 = 0xF8;
const GPIOB_PULLDOWNS_OFF: u8 = 0x0F;

/// Converts a 100 µV ADC code to mV.
pub const fn code_to_millivolts(code: u16) -> u16 {
    code / 10
}

pub fn read_code(payload: &[u8], slot: usize) -> u16 {
    u16::from_le_bytes([payload[2 * slot], payload[2 * slot + 1]])
}

/// Decodes one cell voltage register group into `voltages`.
///
/// Devices whose PEC failed get the cell blocks carried by this group marked
/// invalid; validity of every other group is left as is.
pub fn decode_voltage_group(
    rx: &[u8],
    group: usize,
    pec_ok: &[bool],
    input_to_cell: &[Option<usize>],
    voltages: &mut CellVoltages,
) {
    for (device, ok) in pec_ok.iter().enumerate() {
        let payload = device_payload(rx, device);
        for slot in 0..3 {
            let Some(cell) = input_to_cell.get(group * 3 + slot).copied().flatten() else {
                continue;
            };
            if *ok {
                let code = read_code(payload, slot);
                log::trace!(
                    "Group #{} device #{} cell #{} code={:04X}",
                    group,
                    device,
                    cell,
                    code
                );
                voltages.cells.set(device, cell, code_to_millivolts(code));
            } else {
                voltages.cells.invalidate(device, cell);
            }
        }
    }
}

/// Decodes one auxiliary register group into GPIO voltages.
pub fn decode_gpio_group(
    rx: &[u8],
    family: ChipFamily,
    group: usize,
    pec_ok: &[bool],
    gpio: &mut DeviceTable<u16>,
) {
    for (device, ok) in pec_ok.iter().enumerate() {
        let payload = device_payload(rx, device);
        for (slot, input) in family.aux_slots(group).iter().enumerate() {
            let Some(input) = *input else {
                continue;
            };
            if *ok {
                gpio.set(device, input, code_to_millivolts(read_code(payload, slot)));
            } else {
                gpio.invalidate(device, input);
            }
        }
    }
}

/// Auxiliary register group and slot holding a GPIO (one based).
pub fn gpio_location(gpio: u8) -> (usize, usize) {
    let index = usize::from(gpio.saturating_sub(1));
    (index / 3, index % 3)
}

/// Reads the code of a single GPIO from a received auxiliary group.
pub fn gpio_code(rx: &[u8], device: usize, gpio: u8) -> u16 {
    let (_, slot) = gpio_location(gpio);
    read_code(device_payload(rx, device), slot)
}

/// Configuration register group A for one device.
pub fn config_a(discharge: DischargeMask) -> Payload {
    let dcc = discharge.register_a;
    [
        GPIO_PULLDOWNS_OFF | REFON,
        0x00,
        0x00,
        0x00,
        (dcc & 0xFF) as u8,
        ((dcc >> 8) & 0x0F) as u8,
    ]
}

/// Configuration register group B (LTC6813 only) for one device.
pub fn config_b(discharge: DischargeMask) -> Payload {
    let dcc = discharge.register_b;
    [
        GPIOB_PULLDOWNS_OFF | ((dcc & 0x0F) << 4),
        (dcc >> 4) & 0x03,
        0x00,
        0x00,
        0x00,
        0x00,
    ]
}

/// Extracts the discharge bits from configuration payloads.
pub fn discharge_from_config(a: &[u8], b: Option<&[u8]>) -> DischargeMask {
    let register_a = u16::from(a[4]) | (u16::from(a[5] & 0x0F) << 8);
    let register_b = b.map_or(0, |b| ((b[0] >> 4) & 0x0F) | ((b[1] & 0x03) << 4));
    DischargeMask {
        register_a,
        register_b,
    }
}

/// Checks the read back configuration against what was written.
///
/// Only REFON, ADCOPT and the discharge bits are compared, the GPIO bits read
/// back the pin levels.
pub fn config_matches(written: &Payload, read: &[u8]) -> bool {
    written[0] & 0x05 == read[0] & 0x05 && written[4] == read[4] && written[5] & 0x0F == read[5] & 0x0F
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RDCV;
    use crate::frame::{build_read_frame, COMMAND_LENGTH, DEVICE_SLOT_LENGTH};
    use crate::pec::pec15;

    fn rx_frame(payloads: &[Payload]) -> Vec<u8> {
        let mut rx = build_read_frame(RDCV[0], 0);
        for payload in payloads {
            rx.extend_from_slice(payload);
            rx.extend_from_slice(&pec15(payload).to_be_bytes());
        }
        assert_eq!(rx.len(), COMMAND_LENGTH + DEVICE_SLOT_LENGTH * payloads.len());
        rx
    }

    fn codes(a: u16, b: u16, c: u16) -> Payload {
        let (a, b, c) = (a.to_le_bytes(), b.to_le_bytes(), c.to_le_bytes());
        [a[0], a[1], b[0], b[1], c[0], c[1]]
    }

    #[test]
    fn code_scaling() {
        assert_eq!(code_to_millivolts(0x0000), 0);
        assert_eq!(code_to_millivolts(0x0FFF), 409);
        assert_eq!(code_to_millivolts(0xFFFF), 6553);
        assert_eq!(code_to_millivolts(36000), 3600);
    }

    #[test]
    fn decodes_little_endian_codes_into_cells() {
        let map: Vec<Option<usize>> = (0..12).map(Some).collect();
        let mut voltages = CellVoltages::new(2, 12);
        let rx = rx_frame(&[codes(36000, 0, 0xFFFF), codes(1, 2, 3)]);
        decode_voltage_group(&rx, 1, &[true, true], &map, &mut voltages);
        assert_eq!(voltages.cells.get(0, 3), Some(3600));
        assert_eq!(voltages.cells.get(0, 4), Some(0));
        assert_eq!(voltages.cells.get(0, 5), Some(6553));
        assert_eq!(voltages.cells.get(1, 5), Some(0));
        assert_eq!(voltages.cells.get(0, 0), None);
    }

    #[test]
    fn unused_inputs_are_skipped() {
        let map = vec![Some(0), None, Some(1), Some(2)];
        let mut voltages = CellVoltages::new(1, 3);
        let rx = rx_frame(&[codes(10, 20, 30)]);
        decode_voltage_group(&rx, 0, &[true], &map, &mut voltages);
        assert_eq!(voltages.cells.get(0, 0), Some(1));
        assert_eq!(voltages.cells.get(0, 1), Some(3));
        assert_eq!(voltages.cells.get(0, 2), None);
    }

    #[test]
    fn pec_failure_only_touches_its_group() {
        let map: Vec<Option<usize>> = (0..12).map(Some).collect();
        let mut voltages = CellVoltages::new(2, 12);
        let rx_a = rx_frame(&[codes(30000, 30000, 30000), codes(31000, 31000, 31000)]);
        decode_voltage_group(&rx_a, 0, &[true, true], &map, &mut voltages);
        let before = voltages.cells.validity[1];

        let rx_b = rx_frame(&[codes(32000, 32000, 32000), codes(33000, 33000, 33000)]);
        decode_voltage_group(&rx_b, 1, &[true, false], &map, &mut voltages);

        // device 1 keeps group A validity, group B slots are invalid, values untouched
        for cell in 0..3 {
            assert_eq!(voltages.cells.validity[1].is_valid(cell), before.is_valid(cell));
            assert_eq!(voltages.cells.get(1, cell), Some(3100));
        }
        for cell in 3..6 {
            assert_eq!(voltages.cells.get(1, cell), None);
            assert_eq!(voltages.cells.values[1][cell], 0);
            assert_eq!(voltages.cells.get(0, cell), Some(3200));
        }
    }

    #[test]
    fn gpio_groups_follow_family_layout() {
        let mut gpio = DeviceTable::<u16>::new(1, 9);
        let rx = rx_frame(&[codes(10000, 20000, 30000)]);
        decode_gpio_group(&rx, ChipFamily::Ltc6813, 1, &[true], &mut gpio);
        assert_eq!(gpio.get(0, 3), Some(1000));
        assert_eq!(gpio.get(0, 4), Some(2000));
        assert_eq!(gpio.get(0, 5), None);
        decode_gpio_group(&rx, ChipFamily::Ltc6813, 3, &[true], &mut gpio);
        assert_eq!(gpio.get(0, 8), Some(1000));
    }

    #[test]
    fn gpio_location_mapping() {
        assert_eq!(gpio_location(1), (0, 0));
        assert_eq!(gpio_location(3), (0, 2));
        assert_eq!(gpio_location(4), (1, 0));
        assert_eq!(gpio_location(5), (1, 1));
    }

    #[test]
    fn config_registers_carry_discharge_bits() {
        let mask = DischargeMask {
            register_a: 0x0A01,
            register_b: 0x22,
        };
        let a = config_a(mask);
        assert_eq!(a, [0xFC, 0x00, 0x00, 0x00, 0x01, 0x0A]);
        let b = config_b(mask);
        assert_eq!(b[0], 0x2F);
        assert_eq!(b[1], 0x02);
        assert_eq!(discharge_from_config(&a, Some(&b)), mask);
        assert!(config_matches(&a, &a));
        let mut changed = a;
        changed[4] = 0;
        assert!(!config_matches(&a, &changed));
    }
}
