//! Packs cell block balancing requests into discharge (DCC) bits.

use crate::measurement::BalancingControl;

/// Inputs served by configuration register group A.
pub const REGISTER_A_INPUTS: usize = 12;
/// Inputs served by configuration register group B.
pub const REGISTER_B_INPUTS: usize = 6;

/// Discharge bits of one device.
///
/// Bit `n` of `register_a` switches physical input `n` (0-11), bit `n` of
/// `register_b` switches physical input `12 + n` (12-17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DischargeMask {
    pub register_a: u16,
    pub register_b: u8,
}

impl DischargeMask {
    pub fn set_input(&mut self, input: usize) {
        if input < REGISTER_A_INPUTS {
            self.register_a |= 1 << input;
        } else if input < REGISTER_A_INPUTS + REGISTER_B_INPUTS {
            self.register_b |= 1 << (input - REGISTER_A_INPUTS);
        } else {
            log::warn!("Discharge input {input} does not exist");
        }
    }

    pub fn is_set(&self, input: usize) -> bool {
        if input < REGISTER_A_INPUTS {
            self.register_a & (1 << input) != 0
        } else if input < REGISTER_A_INPUTS + REGISTER_B_INPUTS {
            self.register_b & (1 << (input - REGISTER_A_INPUTS)) != 0
        } else {
            false
        }
    }

    pub fn count(&self) -> u32 {
        self.register_a.count_ones() + self.register_b.count_ones()
    }
}

/// Maps the requested cell blocks of one device onto its physical inputs.
pub fn pack(requested: &[bool], cell_to_input: &[usize]) -> DischargeMask {
    let mut mask = DischargeMask::default();
    for (cell, _) in requested.iter().enumerate().filter(|(_, on)| **on) {
        match cell_to_input.get(cell) {
            Some(input) => mask.set_input(*input),
            None => log::warn!("Balancing request for unknown cell block {cell}"),
        }
    }
    mask
}

/// Packs the requests of every device in logical order.
pub fn pack_string(control: &BalancingControl, cell_to_input: &[usize]) -> Vec<DischargeMask> {
    control
        .requested
        .iter()
        .map(|requested| pack(requested, cell_to_input))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_0_and_13() {
        let cell_to_input: Vec<usize> = (0..18).collect();
        let mut requested = vec![false; 18];
        requested[0] = true;
        requested[13] = true;
        let mask = pack(&requested, &cell_to_input);
        assert_eq!(mask.register_a, 0b1);
        assert_eq!(mask.register_b, 0b10);
        assert_eq!(mask.count(), 2);
        assert!(mask.is_set(13));
    }

    #[test]
    fn unused_inputs_are_skipped() {
        // input 4 is not connected, block 4 therefore sits on input 5
        let cell_to_input = vec![0, 1, 2, 3, 5, 6, 7, 8, 9, 10, 11];
        let mut requested = vec![false; 11];
        requested[4] = true;
        requested[10] = true;
        let mask = pack(&requested, &cell_to_input);
        assert_eq!(mask.register_a, (1 << 5) | (1 << 11));
        assert_eq!(mask.register_b, 0);
    }

    #[test]
    fn nothing_requested() {
        let cell_to_input: Vec<usize> = (0..12).collect();
        assert_eq!(pack(&[false; 12], &cell_to_input), DischargeMask::default());
    }

    #[test]
    fn string_keeps_device_order() {
        let cell_to_input: Vec<usize> = (0..12).collect();
        let mut control = BalancingControl::new(2, 12);
        control.requested[1][2] = true;
        let masks = pack_string(&control, &cell_to_input);
        assert_eq!(masks[0], DischargeMask::default());
        assert_eq!(masks[1].register_a, 0b100);
    }
}
