//! Settle times, counted in ticks of the trigger period.

use crate::config::{AdcMode, ChainConfig};
use crate::i2c::BRIDGE_CLOCKS;
use std::time::Duration;

/// Wake up time of one device on the isoSPI chain.
const WAKE_UP_PER_DEVICE_US: u64 = 400;

/// Conversion times in µs per ADC mode (fast, normal, filtered).
const CELL_ALL_US: [u64; 3] = [1113, 2335, 201_317];
const CELL_SINGLE_US: [u64; 3] = [201, 405, 34_237];
const GPIO_ALL_US: [u64; 3] = [1202, 2343, 201_325];
const GPIO_SINGLE_US: [u64; 3] = [201, 405, 34_237];

const fn mode_index(mode: AdcMode) -> usize {
    match mode {
        AdcMode::Fast => 0,
        AdcMode::Normal => 1,
        AdcMode::Filtered => 2,
    }
}

/// Settle times derived once from bus clock, chain length and trigger period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTimes {
    pub wake_up: u16,
    pub transfer: u16,
    pub bridge_clock: u16,
    pub cell_all: u16,
    pub cell_single: u16,
    pub gpio_all: u16,
    pub gpio_single: u16,
    pub open_wire: u16,
}

impl SettleTimes {
    pub fn new(config: &ChainConfig) -> Self {
        let period = config.trigger_period;
        let ticks = |us: u64| to_ticks(Duration::from_micros(us), period);
        let frame_bits = config.frame_len() as u64 * 8;
        let clock = u64::from(config.bus_clock_hz.max(1));
        let transfer_us = (frame_bits * 1_000_000).div_ceil(clock);
        let bridge_us = ((BRIDGE_CLOCKS as u64 + frame_bits) * 1_000_000).div_ceil(clock);
        let mode = mode_index(config.adc_mode);
        let times = Self {
            wake_up: ticks(config.devices_per_string as u64 * WAKE_UP_PER_DEVICE_US),
            transfer: ticks(transfer_us),
            bridge_clock: ticks(bridge_us),
            cell_all: ticks(CELL_ALL_US[mode]),
            cell_single: ticks(CELL_SINGLE_US[mode]),
            gpio_all: ticks(GPIO_ALL_US[mode]),
            gpio_single: ticks(GPIO_SINGLE_US[mode]),
            open_wire: ticks(CELL_ALL_US[mode]),
        };
        log::debug!("Settle times in ticks of {period:?}: {times:?}");
        times
    }
}

/// Rounds up to whole ticks; at least one tick.
pub fn to_ticks(time: Duration, period: Duration) -> u16 {
    let period = period.as_micros().max(1);
    let ticks = time.as_micros().div_ceil(period).max(1);
    u16::try_from(ticks).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        let ms = Duration::from_millis(1);
        assert_eq!(to_ticks(Duration::from_micros(2335), ms), 3);
        assert_eq!(to_ticks(Duration::from_micros(1000), ms), 1);
        assert_eq!(to_ticks(Duration::ZERO, ms), 1);
        assert_eq!(to_ticks(Duration::from_secs(3600), Duration::from_micros(1)), u16::MAX);
    }

    #[test]
    fn default_config() {
        let times = SettleTimes::new(&ChainConfig::default());
        assert_eq!(times.wake_up, 1);
        assert_eq!(times.transfer, 1);
        assert_eq!(times.cell_all, 3);
        assert_eq!(times.gpio_all, 3);
        assert_eq!(times.cell_single, 1);
    }

    #[test]
    fn filtered_mode_and_long_chain() {
        let config = ChainConfig {
            adc_mode: AdcMode::Filtered,
            devices_per_string: 10,
            bus_clock_hz: 10_000,
            ..Default::default()
        };
        let times = SettleTimes::new(&config);
        assert_eq!(times.wake_up, 4);
        assert_eq!(times.cell_all, 202);
        assert_eq!(times.open_wire, times.cell_all);
        // 84 bytes at 10 kHz
        assert_eq!(times.transfer, 68);
        assert!(times.bridge_clock > times.transfer);
    }
}
