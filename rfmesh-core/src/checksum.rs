//! Frame integrity trailers.
//!
//! Protocol version 1 uses a 16-bit additive checksum: `sum(bytes) mod 65536`.
//! It catches every single-bit error but is blind to reordering within the
//! summed region (swapped bytes, swapped fields) and to compensating errors
//! (+1 in one byte, -1 in another). Version 2 replaces it with
//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), which the version byte
//! already announces to receivers.

use crate::types::{MeshError, Result};

/// Protocol version using the additive checksum.
pub const VERSION_SUM16: u8 = 1;

/// Protocol version using CRC-16/CCITT-FALSE.
pub const VERSION_CRC16: u8 = 2;

const POLY: u16 = 0x1021;

// ---------------------------------------------------------------------------
// CRC lookup table (compile-time)
// ---------------------------------------------------------------------------

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_crc_table();

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// Additive checksum, `sum(data) mod 65536`.
pub fn sum16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// CRC-16/CCITT-FALSE.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[((crc >> 8) ^ byte as u16) as usize & 0xFF];
    }
    crc
}

/// Trailer algorithm selected by the frame's protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Sum16,
    Crc16,
}

impl ChecksumKind {
    /// Algorithm for a protocol version, or `UnsupportedVersion`.
    pub fn for_version(version: u8) -> Result<Self> {
        match version {
            VERSION_SUM16 => Ok(ChecksumKind::Sum16),
            VERSION_CRC16 => Ok(ChecksumKind::Crc16),
            other => Err(MeshError::UnsupportedVersion(other)),
        }
    }

    pub fn compute(&self, data: &[u8]) -> u16 {
        match self {
            ChecksumKind::Sum16 => sum16(data),
            ChecksumKind::Crc16 => crc16(data),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
