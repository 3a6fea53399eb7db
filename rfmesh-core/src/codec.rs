//! Field codecs: fixed-point compression of observation fields.
//!
//! All transforms are lossy and clamp instead of rejecting:
//! - Position: lat/lon x 1e7, alt x 1e2, three big-endian i32 (12 bytes)
//! - RSSI: `clamp(dBm + 120, 0, 255)` as u8, one-way
//! - Signal info: frequency in kHz (u32) + channel (u16), 6 bytes
//! - Speed/direction: `speed << 8 | round(direction / 360 * 255)`
//!
//! Direction resolution is 360/255 ≈ 1.41 degrees.

use crate::types::GeoPosition;

/// Fixed-point scale for latitude and longitude.
pub const LAT_LON_SCALE: f64 = 1e7;

/// Fixed-point scale for altitude.
pub const ALT_SCALE: f64 = 1e2;

/// Size of a compressed position.
pub const POSITION_LEN: usize = 12;

/// Size of a compressed signal-info blob.
pub const SIGNAL_INFO_LEN: usize = 6;

/// Offset added to dBm before truncating to a byte.
const RSSI_OFFSET: f64 = 120.0;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

fn to_fixed(value: f64, scale: f64) -> i32 {
    // `as` saturates at the i32 bounds and maps NaN to 0.
    (value * scale).round() as i32
}

/// Compress a position into 12 big-endian bytes.
pub fn compress_position(pos: &GeoPosition) -> [u8; POSITION_LEN] {
    let mut out = [0u8; POSITION_LEN];
    out[0..4].copy_from_slice(&to_fixed(pos.lat, LAT_LON_SCALE).to_be_bytes());
    out[4..8].copy_from_slice(&to_fixed(pos.lon, LAT_LON_SCALE).to_be_bytes());
    out[8..12].copy_from_slice(&to_fixed(pos.alt, ALT_SCALE).to_be_bytes());
    out
}

/// Inverse of [`compress_position`], within ±5e-8 degrees and ±0.005 m.
pub fn decompress_position(bytes: &[u8; POSITION_LEN]) -> GeoPosition {
    let field = |i: usize| i32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
    GeoPosition {
        lat: field(0) as f64 / LAT_LON_SCALE,
        lon: field(4) as f64 / LAT_LON_SCALE,
        alt: field(8) as f64 / ALT_SCALE,
    }
}

// ---------------------------------------------------------------------------
// RSSI
// ---------------------------------------------------------------------------

/// Compress a dBm reading into a byte. Not invertible: the result is only
/// ever compared, never mapped back to dBm.
pub fn compress_rssi(rssi_dbm: f64) -> u8 {
    // NaN clamps to NaN, which `as` turns into 0.
    (rssi_dbm + RSSI_OFFSET).clamp(0.0, 255.0) as u8
}

/// Element-wise [`compress_rssi`].
pub fn compress_rssi_series(samples: &[f64]) -> Vec<u8> {
    samples.iter().map(|&s| compress_rssi(s)).collect()
}

// ---------------------------------------------------------------------------
// Signal info
// ---------------------------------------------------------------------------

/// Compress carrier frequency and channel into the 6-byte signal-info blob.
pub fn compress_signal_info(frequency_hz: f64, channel: u16) -> [u8; SIGNAL_INFO_LEN] {
    let khz = (frequency_hz / 1e3).clamp(0.0, u32::MAX as f64) as u32;
    let mut out = [0u8; SIGNAL_INFO_LEN];
    out[0..4].copy_from_slice(&khz.to_be_bytes());
    out[4..6].copy_from_slice(&channel.to_be_bytes());
    out
}

/// Recover `(frequency_hz, channel)` from a signal-info blob.
///
/// Returns `None` unless the blob is exactly [`SIGNAL_INFO_LEN`] bytes; relays
/// treat the blob as opaque and never need this.
pub fn decompress_signal_info(blob: &[u8]) -> Option<(f64, u16)> {
    if blob.len() != SIGNAL_INFO_LEN {
        return None;
    }
    let khz = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let channel = u16::from_be_bytes([blob[4], blob[5]]);
    Some((khz as f64 * 1e3, channel))
}

// ---------------------------------------------------------------------------
// Speed / direction
// ---------------------------------------------------------------------------

/// Pack speed (m/s, high byte) and direction (degrees, low byte) into 16 bits.
pub fn encode_speed_direction(speed: f64, direction: f64) -> u16 {
    let speed_byte = speed.clamp(0.0, 255.0) as u16;
    let dir = if direction.is_finite() {
        direction.rem_euclid(360.0)
    } else {
        0.0
    };
    let dir_byte = (dir / 360.0 * 255.0).round().min(255.0) as u16;
    (speed_byte << 8) | dir_byte
}

/// Unpack into `(speed m/s, direction degrees)`.
pub fn decode_speed_direction(packed: u16) -> (f64, f64) {
    let speed = (packed >> 8) as f64;
    let direction = (packed & 0xFF) as f64 / 255.0 * 360.0;
    (speed, direction)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
