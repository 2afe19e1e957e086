//! CRC-8 (polynomial 0x07, initial value 0x00) used to validate record bodies.

/// Computes the CRC-8 checksum of `data` using polynomial 0x07.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
