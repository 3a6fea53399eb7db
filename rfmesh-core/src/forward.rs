//! Per-frame forwarding decisions.
//!
//! Every received buffer ends in exactly one of three outcomes:
//! - `Relay`: hop budget still positive after decrement; optionally enriched
//!   with the local reading, re-encoded, and handed back for rebroadcast
//! - `Deliver`: hop budget exhausted; handed to the controller, never rebroadcast
//! - `Dropped`: failed decode, or a repeat inside the recent-packet window
//!
//! The hop budget is the only loop breaker the wire format carries. The
//! recent-packet cache is a local optimisation on top of it.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::codec;
use crate::frame::Frame;
use crate::types::*;

// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------

/// Local sensing capability consulted when relaying.
pub trait Sensing {
    /// Whether this node currently hears the emitter described by `signal_info`.
    fn matches(&self, signal_info: &[u8]) -> bool;

    /// This node's current position.
    fn current_position(&self) -> GeoPosition;

    /// Local RSSI of the matched emitter in dBm.
    fn measure_rssi(&self) -> f64;
}

/// Sensing for pure relays: never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSensing;

impl Sensing for NoSensing {
    fn matches(&self, _signal_info: &[u8]) -> bool {
        false
    }

    fn current_position(&self) -> GeoPosition {
        GeoPosition::new(0.0, 0.0, 0.0)
    }

    fn measure_rssi(&self) -> f64 {
        f64::NEG_INFINITY
    }
}

/// Receiver of frames whose hop budget ran out.
pub trait Controller {
    fn deliver(&mut self, frame: Frame);
}

impl Controller for Vec<Frame> {
    fn deliver(&mut self, frame: Frame) {
        self.push(frame);
    }
}

// ---------------------------------------------------------------------------
// Recent packet cache
// ---------------------------------------------------------------------------

/// Time-windowed set of `(source, packet_id)` pairs already handled.
pub struct RecentPackets {
    ttl_ms: u64,
    seen: HashMap<(NodeId, u32), u64>, // key -> last_seen ms
}

impl RecentPackets {
    pub fn new(ttl_ms: u64) -> Self {
        RecentPackets {
            ttl_ms,
            seen: HashMap::new(),
        }
    }

    /// Record a sighting. Returns true if the pair was already seen inside the window.
    pub fn check_and_insert(&mut self, source: NodeId, packet_id: u32, now_ms: u64) -> bool {
        let ttl = self.ttl_ms;
        let previous = self.seen.insert((source, packet_id), now_ms);
        matches!(previous, Some(last) if now_ms.saturating_sub(last) <= ttl)
    }

    /// Remove expired entries.
    pub fn prune(&mut self, now_ms: u64) {
        let ttl = self.ttl_ms;
        self.seen
            .retain(|_, &mut last| now_ms.saturating_sub(last) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Why a received buffer was not acted on.
#[derive(Debug)]
pub enum DropReason {
    /// Decode failed. `MeshError::is_integrity_failure` separates
    /// log-and-drop corruption from escalation-worthy errors.
    Invalid(MeshError),
    /// Already handled inside the recent-packet window.
    Duplicate { source: NodeId, packet_id: u32 },
}

/// Outcome of one received buffer.
#[derive(Debug)]
pub enum Disposition {
    Relay {
        frame: Frame,
        bytes: Vec<u8>,
        enriched: bool,
    },
    Deliver(Frame),
    Dropped(DropReason),
}

impl Disposition {
    pub fn is_relay(&self) -> bool {
        matches!(self, Disposition::Relay { .. })
    }

    pub fn is_deliver(&self) -> bool {
        matches!(self, Disposition::Deliver(_))
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Disposition::Dropped(_))
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Stateless-per-frame forwarding logic for one node.
pub struct Forwarder<S: Sensing> {
    pub node_id: NodeId,
    sensing: S,
    recent: Option<RecentPackets>,

    // Counters
    pub received: u64,
    pub relayed: u64,
    pub delivered: u64,
    pub dropped: u64,
}

impl<S: Sensing> Forwarder<S> {
    /// `dedup_ttl_ms == 0` disables the recent-packet cache.
    pub fn new(node_id: NodeId, sensing: S, dedup_ttl_ms: u64) -> Self {
        Forwarder {
            node_id,
            sensing,
            recent: (dedup_ttl_ms > 0).then(|| RecentPackets::new(dedup_ttl_ms)),
            received: 0,
            relayed: 0,
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn sensing(&self) -> &S {
        &self.sensing
    }

    /// Mark a frame this node originated so its echo is not relayed again.
    pub fn remember(&mut self, frame: &Frame, now_ms: u64) {
        if let Some(recent) = self.recent.as_mut() {
            recent.check_and_insert(frame.source_node_id, frame.packet_id, now_ms);
        }
    }

    /// Decide what to do with one received buffer.
    pub fn on_receive(&mut self, bytes: &[u8], now_ms: u64) -> Disposition {
        self.received += 1;

        let mut frame = match Frame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                if e.is_integrity_failure() {
                    warn!(node = self.node_id, len = bytes.len(), error = %e, "dropping corrupt frame");
                } else {
                    error!(node = self.node_id, len = bytes.len(), error = %e, "dropping unusable frame");
                }
                self.dropped += 1;
                return Disposition::Dropped(DropReason::Invalid(e));
            }
        };

        if let Some(recent) = self.recent.as_mut() {
            recent.prune(now_ms);
            if recent.check_and_insert(frame.source_node_id, frame.packet_id, now_ms) {
                debug!(
                    node = self.node_id,
                    source = frame.source_node_id,
                    packet_id = frame.packet_id,
                    "duplicate frame"
                );
                self.dropped += 1;
                return Disposition::Dropped(DropReason::Duplicate {
                    source: frame.source_node_id,
                    packet_id: frame.packet_id,
                });
            }
        }

        frame.packet_life_counter = frame.packet_life_counter.saturating_sub(1);

        if frame.packet_life_counter == 0 {
            debug!(
                node = self.node_id,
                source = frame.source_node_id,
                packet_id = frame.packet_id,
                "hop budget exhausted, delivering"
            );
            self.delivered += 1;
            return Disposition::Deliver(frame);
        }

        let enriched = self.enrich(&mut frame);

        match frame.encode() {
            Ok(out) => {
                debug!(
                    node = self.node_id,
                    packet_id = frame.packet_id,
                    remaining = frame.packet_life_counter,
                    enriched,
                    "relaying frame"
                );
                self.relayed += 1;
                Disposition::Relay {
                    frame,
                    bytes: out,
                    enriched,
                }
            }
            Err(e) => {
                warn!(node = self.node_id, error = %e, "re-encode failed, dropping");
                self.dropped += 1;
                Disposition::Dropped(DropReason::Invalid(e))
            }
        }
    }

    /// Overwrite position and keep the stronger reading when this node hears
    /// the same emitter.
    fn enrich(&self, frame: &mut Frame) -> bool {
        if !self.sensing.matches(&frame.signal_info) {
            return false;
        }
        frame.position = codec::compress_position(&self.sensing.current_position());
        let local = codec::compress_rssi(self.sensing.measure_rssi());
        frame.signal_strength = frame.signal_strength.max(local);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::test_observation;

    struct FixedSensing {
        info: Vec<u8>,
        position: GeoPosition,
        rssi: f64,
    }

    impl Sensing for FixedSensing {
        fn matches(&self, signal_info: &[u8]) -> bool {
            signal_info == self.info.as_slice()
        }

        fn current_position(&self) -> GeoPosition {
            self.position
        }

        fn measure_rssi(&self) -> f64 {
            self.rssi
        }
    }

    fn encoded(hops: u8, packet_id: u32) -> Vec<u8> {
        Frame::from_observation(&test_observation(9, 5), hops, packet_id, 1_000)
            .encode()
            .unwrap()
    }

    fn relay_node() -> Forwarder<NoSensing> {
        Forwarder::new(2, NoSensing, 0)
    }

    #[test]
    fn test_last_hop_delivers() {
        let mut fwd = relay_node();
        match fwd.on_receive(&encoded(1, 1), 0) {
            Disposition::Deliver(frame) => assert_eq!(frame.packet_life_counter, 0),
            other => panic!("expected Deliver, got {other:?}"),
        }
        assert_eq!((fwd.delivered, fwd.relayed), (1, 0));
    }

    #[test]
    fn test_relay_decrements_and_revalidates() {
        let mut fwd = relay_node();
        match fwd.on_receive(&encoded(5, 1), 0) {
            Disposition::Relay {
                frame,
                bytes,
                enriched,
            } => {
                assert_eq!(frame.packet_life_counter, 4);
                assert!(!enriched);
                let again = Frame::decode(&bytes).unwrap();
                assert_eq!(again.packet_life_counter, 4);
                assert_eq!(again, frame);
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_budget_delivers() {
        let mut fwd = relay_node();
        assert!(fwd.on_receive(&encoded(0, 1), 0).is_deliver());
    }

    #[test]
    fn test_chain_terminates() {
        // Budget 5: four relays, then a delivery
        let mut bytes = encoded(5, 77);
        let mut relays = 0;
        loop {
            let mut hop = relay_node();
            match hop.on_receive(&bytes, 0) {
                Disposition::Relay { bytes: next, .. } => {
                    relays += 1;
                    bytes = next;
                }
                Disposition::Deliver(frame) => {
                    assert_eq!(frame.packet_id, 77);
                    break;
                }
                Disposition::Dropped(reason) => panic!("unexpected drop: {reason:?}"),
            }
        }
        assert_eq!(relays, 4);
    }

    #[test]
    fn test_corrupt_frame_dropped() {
        let mut fwd = relay_node();
        let mut bytes = encoded(3, 1);
        bytes[20] ^= 0x04;
        match fwd.on_receive(&bytes, 0) {
            Disposition::Dropped(DropReason::Invalid(e)) => {
                assert!(matches!(e, MeshError::Checksum { .. }));
                assert!(e.is_integrity_failure());
            }
            other => panic!("expected Dropped, got {other:?}"),
        }
        assert_eq!(fwd.dropped, 1);
    }

    #[test]
    fn test_truncated_frame_dropped() {
        let mut fwd = relay_node();
        let bytes = encoded(3, 1);
        assert!(matches!(
            fwd.on_receive(&bytes[..bytes.len() - 3], 0),
            Disposition::Dropped(DropReason::Invalid(MeshError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_unsupported_version_dropped_as_escalation() {
        let mut fwd = relay_node();
        let mut bytes = encoded(3, 1);
        bytes[0] = 9;
        let body_len = bytes.len() - 2;
        let sum = crate::checksum::sum16(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&sum.to_be_bytes());
        match fwd.on_receive(&bytes, 0) {
            Disposition::Dropped(DropReason::Invalid(e)) => {
                assert!(matches!(e, MeshError::UnsupportedVersion(9)));
                assert!(!e.is_integrity_failure());
            }
            other => panic!("expected Dropped, got {other:?}"),
        }
        assert_eq!(fwd.dropped, 1);
    }

    #[test]
    fn test_enrichment_overwrites_position_and_keeps_max() {
        let obs = test_observation(9, 0);
        let info = codec::compress_signal_info(obs.frequency_hz, obs.channel).to_vec();
        let here = GeoPosition::new(51.5, -0.12, 30.0);
        let mut fwd = Forwarder::new(
            4,
            FixedSensing {
                info,
                position: here,
                rssi: -40.0, // 80 > 62 carried in the frame
            },
            0,
        );
        match fwd.on_receive(&encoded(3, 1), 0) {
            Disposition::Relay {
                frame, enriched, ..
            } => {
                assert!(enriched);
                assert_eq!(frame.position, codec::compress_position(&here));
                assert_eq!(frame.signal_strength, 80);
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_enrichment_keeps_stronger_existing() {
        let obs = test_observation(9, 0);
        let info = codec::compress_signal_info(obs.frequency_hz, obs.channel).to_vec();
        let mut fwd = Forwarder::new(
            4,
            FixedSensing {
                info,
                position: GeoPosition::new(0.0, 0.0, 0.0),
                rssi: -100.0,
            },
            0,
        );
        match fwd.on_receive(&encoded(3, 1), 0) {
            Disposition::Relay { frame, .. } => assert_eq!(frame.signal_strength, 62),
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_non_matching_signal_untouched() {
        let mut fwd = Forwarder::new(
            4,
            FixedSensing {
                info: vec![1, 2, 3],
                position: GeoPosition::new(1.0, 1.0, 1.0),
                rssi: 0.0,
            },
            0,
        );
        let original = Frame::decode(&encoded(3, 1)).unwrap();
        match fwd.on_receive(&encoded(3, 1), 0) {
            Disposition::Relay {
                frame, enriched, ..
            } => {
                assert!(!enriched);
                assert_eq!(frame.position, original.position);
                assert_eq!(frame.signal_strength, original.signal_strength);
            }
            other => panic!("expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_suppressed_within_window() {
        let mut fwd = Forwarder::new(2, NoSensing, 1_000);
        assert!(fwd.on_receive(&encoded(3, 42), 0).is_relay());
        assert!(matches!(
            fwd.on_receive(&encoded(3, 42), 500),
            Disposition::Dropped(DropReason::Duplicate { packet_id: 42, .. })
        ));
        // Window expired
        assert!(fwd.on_receive(&encoded(3, 42), 2_000).is_relay());
    }

    #[test]
    fn test_remembered_origin_not_relayed() {
        let mut fwd = Forwarder::new(9, NoSensing, 1_000);
        let bytes = encoded(3, 5);
        fwd.remember(&Frame::decode(&bytes).unwrap(), 0);
        assert!(fwd.on_receive(&bytes, 10).is_dropped());
    }

    #[test]
    fn test_recent_packets_prune() {
        let mut recent = RecentPackets::new(10);
        recent.check_and_insert(1, 1, 0);
        recent.check_and_insert(1, 2, 5);
        assert_eq!(recent.len(), 2);
        recent.prune(12);
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_vec_controller() {
        let mut sink: Vec<Frame> = Vec::new();
        let frame = Frame::decode(&encoded(1, 1)).unwrap();
        sink.deliver(frame.clone());
        assert_eq!(sink, vec![frame]);
    }
}
