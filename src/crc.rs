//! Table-driven CRC-8 used by the telemetry frames.
//!
//! Polynomial 0xE7, MSB first, seeded with zero and no final xor. Because the
//! reflection and xor are both absent, running the digest over a message with
//! its own checksum appended always yields zero, which is how frames are checked.

const POLY: u8 = 0xe7;

const fn make_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub const CRC8_TABLE: [u8; 256] = make_table();

/// Incremental CRC-8 digest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Crc8 {
    crc: u8,
}

impl Crc8 {
    pub const fn new() -> Self {
        Self { crc: 0 }
    }

    pub fn reset(&mut self) {
        self.crc = 0;
    }

    pub fn compute(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc = CRC8_TABLE[(byte ^ self.crc) as usize];
        }
    }

    pub const fn get_checksum(&self) -> u8 {
        self.crc
    }
}

/// Returns the CRC-8 of `data`.
pub fn crc8(data: &[u8]) -> u8 {
    let mut digest = Crc8::new();
    digest.compute(data);
    digest.get_checksum()
}

/// Checks data whose last byte is its own CRC-8.
pub fn verify(data_with_crc: &[u8]) -> bool {
    crc8(data_with_crc) == 0
}
