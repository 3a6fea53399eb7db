//! Shared types, error enum, and wire enumerations for rfmesh-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by rfmesh-core.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("frame too large: {len} bytes exceeds the {max}-byte MTU")]
    Oversize { len: usize, max: usize },
    #[error("checksum mismatch: frame carries {expected:#06x}, computed {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("frame length mismatch: layout declares {declared} bytes, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("geometry error: {0}")]
    Geometry(String),
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl MeshError {
    /// True for decode failures that are logged and dropped rather than escalated.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            MeshError::Checksum { .. } | MeshError::Truncated { .. } | MeshError::LengthMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

// ---------------------------------------------------------------------------
// Node addressing
// ---------------------------------------------------------------------------

/// 16-bit mesh node identifier.
pub type NodeId = u16;

/// Destination id reserved for broadcast.
pub const BROADCAST: NodeId = 0xFFFF;

// ---------------------------------------------------------------------------
// Wire enumerations
// ---------------------------------------------------------------------------

/// Classification of the observed emitter.
///
/// Codes are stable on the wire. Unknown codes survive a decode/encode cycle
/// unchanged so newer senders can pass through older relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    WiFi,
    Bluetooth,
    FiveG,
    LoRa,
    Zigbee,
    Unknown(u8),
}

impl SignalType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SignalType::WiFi,
            2 => SignalType::Bluetooth,
            3 => SignalType::FiveG,
            4 => SignalType::LoRa,
            5 => SignalType::Zigbee,
            other => SignalType::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            SignalType::WiFi => 1,
            SignalType::Bluetooth => 2,
            SignalType::FiveG => 3,
            SignalType::LoRa => 4,
            SignalType::Zigbee => 5,
            SignalType::Unknown(c) => *c,
        }
    }

    /// Parse a human label such as `wifi`, `Wi-Fi`, `5g`.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "wifi" => Some(SignalType::WiFi),
            "bluetooth" | "bt" => Some(SignalType::Bluetooth),
            "5g" | "nr" => Some(SignalType::FiveG),
            "lora" => Some(SignalType::LoRa),
            "zigbee" => Some(SignalType::Zigbee),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::WiFi => write!(f, "Wi-Fi"),
            SignalType::Bluetooth => write!(f, "Bluetooth"),
            SignalType::FiveG => write!(f, "5G"),
            SignalType::LoRa => write!(f, "LoRa"),
            SignalType::Zigbee => write!(f, "Zigbee"),
            SignalType::Unknown(c) => write!(f, "unknown({c})"),
        }
    }
}

/// Link-layer protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkProtocol {
    Ieee80211n,
    Ieee80211ac,
    Ieee80211ax,
    Ble,
    ClassicBluetooth,
    Nr,
    Unknown(u8),
}

impl LinkProtocol {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => LinkProtocol::Ieee80211n,
            2 => LinkProtocol::Ieee80211ac,
            3 => LinkProtocol::Ieee80211ax,
            4 => LinkProtocol::Ble,
            5 => LinkProtocol::ClassicBluetooth,
            6 => LinkProtocol::Nr,
            other => LinkProtocol::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            LinkProtocol::Ieee80211n => 1,
            LinkProtocol::Ieee80211ac => 2,
            LinkProtocol::Ieee80211ax => 3,
            LinkProtocol::Ble => 4,
            LinkProtocol::ClassicBluetooth => 5,
            LinkProtocol::Nr => 6,
            LinkProtocol::Unknown(c) => *c,
        }
    }

    /// Parse a human label such as `802.11ac`, `ble`, `classic-bluetooth`.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "80211n" => Some(LinkProtocol::Ieee80211n),
            "80211ac" => Some(LinkProtocol::Ieee80211ac),
            "80211ax" => Some(LinkProtocol::Ieee80211ax),
            "ble" => Some(LinkProtocol::Ble),
            "classicbluetooth" | "btclassic" => Some(LinkProtocol::ClassicBluetooth),
            "nr" => Some(LinkProtocol::Nr),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkProtocol::Ieee80211n => write!(f, "802.11n"),
            LinkProtocol::Ieee80211ac => write!(f, "802.11ac"),
            LinkProtocol::Ieee80211ax => write!(f, "802.11ax"),
            LinkProtocol::Ble => write!(f, "BLE"),
            LinkProtocol::ClassicBluetooth => write!(f, "Classic Bluetooth"),
            LinkProtocol::Nr => write!(f, "NR"),
            LinkProtocol::Unknown(c) => write!(f, "unknown({c})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation (codec input)
// ---------------------------------------------------------------------------

/// Geophysical position: degrees and meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl GeoPosition {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        GeoPosition { lat, lon, alt }
    }
}

/// A measured RF emission, as handed over by the sensing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalObservation {
    pub source_node_id: NodeId,
    pub position: GeoPosition,
    pub signal_type: SignalType,
    /// dBm
    pub signal_strength: f64,
    pub protocol: LinkProtocol,
    pub frequency_hz: f64,
    pub channel: u16,
    /// RSSI samples in dBm, oldest first.
    pub strength_over_time: Vec<f64>,
    /// m/s
    pub speed: f64,
    /// Degrees, 0-360.
    pub direction: f64,
}

// ---------------------------------------------------------------------------
// Hex utilities
// ---------------------------------------------------------------------------

/// Decode a hex string into bytes. Case-insensitive, must be even length.
pub fn hex_decode(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if !hex.len().is_multiple_of(2) {
        return Err(MeshError::InvalidHex(format!("odd length {}", hex.len())));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(MeshError::InvalidHex(String::from_utf8_lossy(pair).into_owned())),
        })
        .collect()
}

/// Encode bytes as uppercase hex string.
pub fn hex_encode(data: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_type_codes_stable() {
        let expected = [
            (SignalType::WiFi, 1),
            (SignalType::Bluetooth, 2),
            (SignalType::FiveG, 3),
            (SignalType::LoRa, 4),
            (SignalType::Zigbee, 5),
        ];
        for (ty, code) in expected {
            assert_eq!(ty.code(), code);
            assert_eq!(SignalType::from_code(code), ty);
        }
    }

    #[test]
    fn test_protocol_codes_stable() {
        for code in 1..=6u8 {
            assert_eq!(LinkProtocol::from_code(code).code(), code);
        }
        assert_eq!(LinkProtocol::from_code(4), LinkProtocol::Ble);
        assert_eq!(LinkProtocol::from_code(6), LinkProtocol::Nr);
    }

    #[test]
    fn test_unknown_codes_pass_through() {
        assert_eq!(SignalType::from_code(0), SignalType::Unknown(0));
        assert_eq!(SignalType::from_code(42).code(), 42);
        assert_eq!(LinkProtocol::from_code(200).code(), 200);
    }

    #[test]
    fn test_labels() {
        assert_eq!(SignalType::from_label("Wi-Fi"), Some(SignalType::WiFi));
        assert_eq!(SignalType::from_label("5G"), Some(SignalType::FiveG));
        assert_eq!(LinkProtocol::from_label("802.11ac"), Some(LinkProtocol::Ieee80211ac));
        assert_eq!(
            LinkProtocol::from_label("Classic Bluetooth"),
            Some(LinkProtocol::ClassicBluetooth)
        );
        assert_eq!(LinkProtocol::from_label("token-ring"), None);
    }

    #[test]
    fn test_integrity_failure_class() {
        assert!(MeshError::Checksum { expected: 1, actual: 2 }.is_integrity_failure());
        assert!(MeshError::Truncated { needed: 39, available: 3 }.is_integrity_failure());
        assert!(!MeshError::UnsupportedVersion(9).is_integrity_failure());
        assert!(!MeshError::Geometry("collinear anchors".into()).is_integrity_failure());
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = hex_decode("01ffA0").unwrap();
        assert_eq!(bytes, vec![0x01, 0xFF, 0xA0]);
        assert_eq!(hex_encode(&bytes), "01FFA0");
    }

    #[test]
    fn test_hex_decode_rejects() {
        assert!(matches!(hex_decode("abc"), Err(MeshError::InvalidHex(_))));
        assert!(matches!(hex_decode("ZZ"), Err(MeshError::InvalidHex(_))));
    }
}
