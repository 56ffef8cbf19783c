//! Packet error code (PEC15) used by the LTC68xx family on every command and
//! register payload.

const CRC15_POLYNOMIAL: u16 = 0x4599;
const CRC15_SEED: u16 = 16;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut remainder = (i as u16) << 7;
        let mut bit = 0;
        while bit < 8 {
            if remainder & 0x4000 != 0 {
                remainder = (remainder << 1) ^ CRC15_POLYNOMIAL;
            } else {
                remainder <<= 1;
            }
            bit += 1;
        }
        table[i] = remainder;
        i += 1;
    }
    table
}

/// Precomputed remainders for every byte value.
pub const PEC15_TABLE: [u16; 256] = build_table();

/// Calculates the PEC15 of `data`.
///
/// The returned word holds the 15 bit checksum shifted left by one, which is
/// the layout the devices expect on the wire (high byte first).
///
/// # Panics
///
/// Panics if `data` is empty, which is always a programming error.
pub const fn pec15(data: &[u8]) -> u16 {
    assert!(!data.is_empty(), "PEC15 over empty buffer");
    let mut remainder = CRC15_SEED;
    let mut i = 0;
    while i < data.len() {
        let address = ((remainder >> 7) ^ data[i] as u16) & 0xFF;
        remainder = (remainder << 8) ^ PEC15_TABLE[address as usize];
        i += 1;
    }
    (remainder & 0x7FFF) << 1
}

/// Returns `true` when the two bytes following `data` carry its PEC15.
pub fn verify(data: &[u8], pec_high: u8, pec_low: u8) -> bool {
    pec15(data) == u16::from_be_bytes([pec_high, pec_low])
}
