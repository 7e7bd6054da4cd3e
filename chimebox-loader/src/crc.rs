//! CRC-8 checksums for EEPROM image sections.
//!
//! The device firmware validates every section (the address table and
//! each payload chunk) with an 8-bit checksum derived from a reflected
//! CRC-8 table, polynomial 0x1D. The fold below is what the deployed
//! firmware computes; it must match bit-for-bit or the device rejects
//! every section.

const POLYNOMIAL: u8 = 0x1D;

/// Reflected CRC-8 lookup table, one entry per dividend byte.
pub const CRC_TABLE: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut dividend: usize = 0;
    while dividend < 256 {
        let mut remainder = dividend as u8;
        let mut bit = 0;
        while bit < 8 {
            if remainder & 0x01 != 0 {
                remainder = (remainder >> 1) ^ POLYNOMIAL;
            } else {
                remainder >>= 1;
            }
            bit += 1;
        }
        table[dividend] = remainder;
        dividend += 1;
    }
    table
}

/// Calculates the section checksum over a slice of bytes.
///
/// The `(crc << 8) & 0xFF` term always truncates to zero, so the fold
/// reduces to a plain table lookup. The deployed firmware computes the
/// same truncated recurrence, so it is kept verbatim rather than
/// replaced with a conventional CRC update.
pub fn crc(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc = CRC_TABLE[(byte ^ crc) as usize] ^ (((crc as u16) << 8) & 0xFF) as u8;
    }
    crc
}
