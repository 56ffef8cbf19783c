//! Daisy chain frame layout.
//!
//! ```text
//! [opHi, opLo, pecHi, pecLo, (payload[6], pecHi, pecLo) x devices]
//! ```
//!
//! The chain is a shift register: the first device on the chain receives the
//! last payload slot of a write frame, but answers in the first slot of a read.

use crate::command::Command;
use crate::pec::{pec15, verify};

pub const COMMAND_LENGTH: usize = 4;
pub const PAYLOAD_LENGTH: usize = 6;
pub const DEVICE_SLOT_LENGTH: usize = PAYLOAD_LENGTH + 2;

/// Register payload of one device.
pub type Payload = [u8; PAYLOAD_LENGTH];

pub const fn frame_len(devices: usize) -> usize {
    COMMAND_LENGTH + DEVICE_SLOT_LENGTH * devices
}

fn slot_offset(slot: usize) -> usize {
    COMMAND_LENGTH + slot * DEVICE_SLOT_LENGTH
}

/// Builds a write frame; `payloads[0]` belongs to the first device on the chain.
pub fn build_write_frame(command: Command, payloads: &[Payload]) -> Vec<u8> {
    let devices = payloads.len();
    let mut frame = vec![0; frame_len(devices)];
    frame[..COMMAND_LENGTH].copy_from_slice(&command.bytes());
    for (device, payload) in payloads.iter().enumerate() {
        let offset = slot_offset(devices - 1 - device);
        frame[offset..offset + PAYLOAD_LENGTH].copy_from_slice(payload);
        let pec = pec15(payload).to_be_bytes();
        frame[offset + PAYLOAD_LENGTH] = pec[0];
        frame[offset + PAYLOAD_LENGTH + 1] = pec[1];
    }
    log::trace!("build_write_frame: {:02X?}", frame);
    frame
}

/// Builds a read frame padded with 0xFF to the full receive length.
pub fn build_read_frame(command: Command, devices: usize) -> Vec<u8> {
    let mut frame = vec![0xFF; frame_len(devices)];
    frame[..COMMAND_LENGTH].copy_from_slice(&command.bytes());
    frame
}

/// Builds a command-only frame.
pub fn build_command_frame(command: Command) -> Vec<u8> {
    command.bytes().to_vec()
}

/// Payload bytes of `device` in a received frame.
pub fn device_payload(rx: &[u8], device: usize) -> &[u8] {
    let offset = slot_offset(device);
    &rx[offset..offset + PAYLOAD_LENGTH]
}

/// Validates every device slot of a received frame.
///
/// With `bypass` set each slot is reported valid, but mismatches are still
/// computed and logged.
pub fn check_frame_pec(rx: &[u8], devices: usize, bypass: bool) -> Vec<bool> {
    (0..devices)
        .map(|device| {
            let offset = slot_offset(device);
            if rx.len() < offset + DEVICE_SLOT_LENGTH {
                log::warn!(
                    "Invalid buffer size - required={} received={}",
                    offset + DEVICE_SLOT_LENGTH,
                    rx.len()
                );
                return bypass;
            }
            let payload = &rx[offset..offset + PAYLOAD_LENGTH];
            let valid = verify(
                payload,
                rx[offset + PAYLOAD_LENGTH],
                rx[offset + PAYLOAD_LENGTH + 1],
            );
            if !valid {
                log::warn!(
                    "Invalid PEC device={} calculated={:04X} received={:02X?}",
                    device,
                    pec15(payload),
                    &rx[offset + PAYLOAD_LENGTH..offset + DEVICE_SLOT_LENGTH]
                );
            }
            valid || bypass
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RDCV, WRCFGA};

    fn payloads() -> Vec<Payload> {
        vec![[1, 2, 3, 4, 5, 6], [0xFC, 0, 0, 0, 0, 0], [9, 9, 9, 9, 9, 9]]
    }

    /// Turns a write frame into what the chain would answer on a read: slots in
    /// logical device order.
    fn as_received(frame: &[u8]) -> Vec<u8> {
        let devices = (frame.len() - COMMAND_LENGTH) / DEVICE_SLOT_LENGTH;
        let mut rx = frame[..COMMAND_LENGTH].to_vec();
        for slot in (0..devices).rev() {
            let offset = slot_offset(slot);
            rx.extend_from_slice(&frame[offset..offset + DEVICE_SLOT_LENGTH]);
        }
        rx
    }

    #[test]
    fn write_frame_layout() {
        let frame = build_write_frame(WRCFGA, &payloads());
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[..4], &[0x00, 0x01, 0x3D, 0x6E]);
        // first logical device is transmitted last
        assert_eq!(&frame[20..28], &[1, 2, 3, 4, 5, 6, 0x22, 0xEE]);
        assert_eq!(&frame[12..20], &[0xFC, 0, 0, 0, 0, 0, 0x4F, 0x82]);
        assert_eq!(&frame[4..10], &[9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn read_frame_is_padded() {
        let frame = build_read_frame(RDCV[0], 2);
        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[..4], &[0x00, 0x04, 0x07, 0xC2]);
        assert!(frame[4..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn unmodified_frame_is_valid() {
        let frame = build_write_frame(WRCFGA, &payloads());
        assert_eq!(check_frame_pec(&frame, 3, false), vec![true, true, true]);
        let rx = as_received(&frame);
        assert_eq!(device_payload(&rx, 0), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn corruption_flips_only_that_device() {
        let rx = as_received(&build_write_frame(WRCFGA, &payloads()));
        for device in 0..3 {
            for byte in 0..PAYLOAD_LENGTH {
                let mut corrupted = rx.clone();
                corrupted[slot_offset(device) + byte] ^= 0x10;
                let validity = check_frame_pec(&corrupted, 3, false);
                for (other, valid) in validity.iter().enumerate() {
                    assert_eq!(*valid, other != device);
                }
            }
        }
    }

    #[test]
    fn bypass_forces_success() {
        let mut rx = as_received(&build_write_frame(WRCFGA, &payloads()));
        rx[slot_offset(1)] ^= 0xFF;
        assert_eq!(check_frame_pec(&rx, 3, true), vec![true, true, true]);
    }

    #[test]
    fn short_frame_is_invalid() {
        let rx = vec![0; 10];
        assert_eq!(check_frame_pec(&rx, 2, false), vec![false, false]);
    }
}
