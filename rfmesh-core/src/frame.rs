//! Assemble and parse observation frames.
//!
//! ```text
//! offset  field                      size
//! 0       protocol_version           1
//! 1       packet_id                  4
//! 5       source_node_id             2
//! 7       dest_node_id               2
//! 9       timestamp_ms               8
//! 17      position                   12
//! 29      signal_type                1
//! 30      signal_strength            1
//! 31      protocol                   1
//! 32      signal_info_len (N)        1
//! 33      signal_info                N
//! 33+N    strength_over_time_len (M) 1
//! 34+N    strength_over_time         M
//! 34+N+M  speed_direction            2
//! 36+N+M  packet_life_counter        1
//! 37+N+M  checksum                   2
//! ```
//!
//! All integers are big-endian. The whole frame, trailer included, must fit
//! the 255-byte radio MTU, on encode and on decode. Decoding checks the layout
//! before the trailer so a short buffer is reported as truncated rather than
//! corrupt. One consequence: a bit flip inside either length prefix surfaces
//! as `Truncated` or `LengthMismatch` instead of `Checksum`. Both are
//! integrity failures and are dropped the same way.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::checksum::{sum16, ChecksumKind, VERSION_SUM16};
use crate::codec::{self, POSITION_LEN};
use crate::types::*;

/// Radio link MTU.
pub const MAX_FRAME_LEN: usize = 255;

/// Bytes of a frame with empty variable sections.
pub const MIN_FRAME_LEN: usize = 39;

/// Hop budget stamped by originating nodes unless configured otherwise.
pub const DEFAULT_HOP_BUDGET: u8 = 5;

const SIGNAL_INFO_LEN_OFFSET: usize = 32;
const TRAILER_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One decoded (or about-to-be-encoded) frame.
///
/// Frames are values: forwarding decodes a copy, edits it, and encodes a new
/// byte buffer. The checksum is not stored; it is always derived on encode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub protocol_version: u8,
    pub packet_id: u32,
    pub source_node_id: NodeId,
    pub dest_node_id: NodeId,
    pub timestamp_ms: u64,
    pub position: [u8; POSITION_LEN],
    pub signal_type: SignalType,
    /// Compressed RSSI, see [`codec::compress_rssi`].
    pub signal_strength: u8,
    pub protocol: LinkProtocol,
    /// Opaque to relays.
    pub signal_info: Vec<u8>,
    pub strength_over_time: Vec<u8>,
    pub speed_direction: u16,
    pub packet_life_counter: u8,
}

impl Frame {
    /// Compress an observation into a broadcast frame.
    pub fn from_observation(
        obs: &SignalObservation,
        hop_budget: u8,
        packet_id: u32,
        timestamp_ms: u64,
    ) -> Self {
        Frame {
            protocol_version: VERSION_SUM16,
            packet_id,
            source_node_id: obs.source_node_id,
            dest_node_id: BROADCAST,
            timestamp_ms,
            position: codec::compress_position(&obs.position),
            signal_type: obs.signal_type,
            signal_strength: codec::compress_rssi(obs.signal_strength),
            protocol: obs.protocol,
            signal_info: codec::compress_signal_info(obs.frequency_hz, obs.channel).to_vec(),
            strength_over_time: codec::compress_rssi_series(&obs.strength_over_time),
            speed_direction: codec::encode_speed_direction(obs.speed, obs.direction),
            packet_life_counter: hop_budget,
        }
    }

    /// Size of the encoded frame, trailer included.
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.signal_info.len() + self.strength_over_time.len()
    }

    /// Serialize to wire bytes with a freshly computed trailer.
    ///
    /// Fails with `Oversize` rather than truncating either variable section.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_FRAME_LEN {
            return Err(MeshError::Oversize {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let kind = ChecksumKind::for_version(self.protocol_version)?;

        let mut out = Vec::with_capacity(len);
        out.push(self.protocol_version);
        out.extend_from_slice(&self.packet_id.to_be_bytes());
        out.extend_from_slice(&self.source_node_id.to_be_bytes());
        out.extend_from_slice(&self.dest_node_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.position);
        out.push(self.signal_type.code());
        out.push(self.signal_strength);
        out.push(self.protocol.code());
        // Both sections are < MAX_FRAME_LEN after the size check, so they fit a u8.
        out.push(self.signal_info.len() as u8);
        out.extend_from_slice(&self.signal_info);
        out.push(self.strength_over_time.len() as u8);
        out.extend_from_slice(&self.strength_over_time);
        out.extend_from_slice(&self.speed_direction.to_be_bytes());
        out.push(self.packet_life_counter);

        let checksum = kind.compute(&out);
        out.extend_from_slice(&checksum.to_be_bytes());
        debug_assert_eq!(out.len(), len);
        Ok(out)
    }

    /// Parse wire bytes.
    ///
    /// Errors, in check order:
    /// - `Oversize` when the buffer exceeds the MTU
    /// - `Truncated` when the buffer is shorter than the declared layout
    /// - `LengthMismatch` when it is longer
    /// - `Checksum` when the trailer does not match
    /// - `UnsupportedVersion` for an unknown version whose bytes are otherwise intact
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let available = bytes.len();
        if available > MAX_FRAME_LEN {
            return Err(MeshError::Oversize {
                len: available,
                max: MAX_FRAME_LEN,
            });
        }
        if available < MIN_FRAME_LEN {
            return Err(MeshError::Truncated {
                needed: MIN_FRAME_LEN,
                available,
            });
        }

        let n = bytes[SIGNAL_INFO_LEN_OFFSET] as usize;
        let stream_len_offset = SIGNAL_INFO_LEN_OFFSET + 1 + n;
        if stream_len_offset >= available {
            return Err(MeshError::Truncated {
                needed: MIN_FRAME_LEN + n,
                available,
            });
        }
        let m = bytes[stream_len_offset] as usize;
        let declared = MIN_FRAME_LEN + n + m;
        if available < declared {
            return Err(MeshError::Truncated {
                needed: declared,
                available,
            });
        }
        if available > declared {
            return Err(MeshError::LengthMismatch {
                declared,
                actual: available,
            });
        }

        let body = &bytes[..declared - TRAILER_LEN];
        let trailer = be_u16(bytes, declared - TRAILER_LEN);
        let version = bytes[0];
        match ChecksumKind::for_version(version) {
            Ok(kind) => {
                let computed = kind.compute(body);
                if computed != trailer {
                    return Err(MeshError::Checksum {
                        expected: trailer,
                        actual: computed,
                    });
                }
            }
            Err(unsupported) => {
                // A flipped version byte in a v1 frame still fails the v1 sum.
                let computed = sum16(body);
                if computed != trailer {
                    return Err(MeshError::Checksum {
                        expected: trailer,
                        actual: computed,
                    });
                }
                return Err(unsupported);
            }
        }

        let mut position = [0u8; POSITION_LEN];
        position.copy_from_slice(&bytes[17..17 + POSITION_LEN]);
        let info_start = SIGNAL_INFO_LEN_OFFSET + 1;
        let stream_start = stream_len_offset + 1;
        let tail = stream_start + m;

        Ok(Frame {
            protocol_version: version,
            packet_id: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            source_node_id: be_u16(bytes, 5),
            dest_node_id: be_u16(bytes, 7),
            timestamp_ms: u64::from_be_bytes([
                bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
                bytes[16],
            ]),
            position,
            signal_type: SignalType::from_code(bytes[29]),
            signal_strength: bytes[30],
            protocol: LinkProtocol::from_code(bytes[31]),
            signal_info: bytes[info_start..info_start + n].to_vec(),
            strength_over_time: bytes[stream_start..tail].to_vec(),
            speed_direction: be_u16(bytes, tail),
            packet_life_counter: bytes[tail + 2],
        })
    }

    /// Decompressed reporting position.
    pub fn geo_position(&self) -> GeoPosition {
        codec::decompress_position(&self.position)
    }

    /// `(speed m/s, direction degrees)`.
    pub fn speed_direction(&self) -> (f64, f64) {
        codec::decode_speed_direction(self.speed_direction)
    }

    /// `(frequency_hz, channel)` when the signal-info blob is in the standard form.
    pub fn signal_info_fields(&self) -> Option<(f64, u16)> {
        codec::decompress_signal_info(&self.signal_info)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_node_id == BROADCAST
    }
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Decode wire bytes into a [`Frame`].
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    Frame::decode(bytes)
}

// ---------------------------------------------------------------------------
// Packet ids and encoding context
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Time-derived packet ids: microseconds truncated to 32 bits.
///
/// The underlying counter never goes backwards, and two ids from one
/// generator are never equal even when the clock has not ticked.
#[derive(Debug, Default)]
pub struct PacketIdGenerator {
    last_micros: u64,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for an explicit clock reading.
    pub fn next_at(&mut self, now_micros: u64) -> u32 {
        let t = now_micros.max(self.last_micros.saturating_add(1));
        self.last_micros = t;
        (t & 0xFFFF_FFFF) as u32
    }

    pub fn next_id(&mut self) -> u32 {
        self.next_at(now_micros())
    }
}

/// Per-node encoding context: packet-id source plus protocol version.
#[derive(Debug)]
pub struct FrameEncoder {
    ids: PacketIdGenerator,
    protocol_version: u8,
}

impl FrameEncoder {
    /// Validates the version up front so every later encode can use it.
    pub fn new(protocol_version: u8) -> Result<Self> {
        ChecksumKind::for_version(protocol_version)?;
        Ok(FrameEncoder {
            ids: PacketIdGenerator::new(),
            protocol_version,
        })
    }

    /// Build the frame for an observation, stamped with a fresh id and the current time.
    pub fn frame(&mut self, obs: &SignalObservation, hop_budget: u8) -> Frame {
        let mut frame = Frame::from_observation(obs, hop_budget, self.ids.next_id(), now_ms());
        frame.protocol_version = self.protocol_version;
        frame
    }

    /// Encode an observation into wire bytes.
    pub fn encode(&mut self, obs: &SignalObservation, hop_budget: u8) -> Result<Vec<u8>> {
        self.frame(obs, hop_budget).encode()
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        FrameEncoder {
            ids: PacketIdGenerator::new(),
            protocol_version: VERSION_SUM16,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_observation(node: NodeId, samples: usize) -> SignalObservation {
    SignalObservation {
        source_node_id: node,
        position: GeoPosition::new(37.774_929_5, -122.419_415_5, 16.25),
        signal_type: SignalType::WiFi,
        signal_strength: -58.0,
        protocol: LinkProtocol::Ieee80211n,
        frequency_hz: 2.437e9,
        channel: 6,
        strength_over_time: (0..samples).map(|i| -60.0 - (i % 30) as f64).collect(),
        speed: 3.2,
        direction: 87.0,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
