//! Collector-side fusion of delivered frames into position estimates.
//!
//! Pure logic, no I/O. Frames are grouped by their signal-info blob (one
//! group per emitter). Each group keeps a [`FusedObservation`] and the latest
//! report per anchor node; once three distinct anchors have reported, the
//! reports are trilaterated and cleared. The blend lives as long as the group:
//! it survives solves and is only dropped when the emitter goes silent for
//! longer than the session timeout. Individual reports older than the timeout
//! are discarded before each solve attempt.
//!
//! Blending is `(existing + incoming) / 2` per field. That is a recency-
//! weighted blend, not a mean: with three or more inputs the result depends on
//! arrival order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::forward::Controller;
use crate::frame::{now_ms, Frame};
use crate::trilateration::{self, Anchor, Point, RangeModel, ANCHOR_COUNT};
use crate::types::*;

/// Groups silent for longer than this are discarded by `prune_stale`.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

// ---------------------------------------------------------------------------
// Fused observation
// ---------------------------------------------------------------------------

/// Field blended across reports of one emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FieldKey {
    FrequencyHz,
    Channel,
    SignalStrength,
    Speed,
    Direction,
}

/// Running blend of every field seen for one emitter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusedObservation {
    values: BTreeMap<FieldKey, f64>,
    updates: u64,
}

impl FusedObservation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blend one value in. The first value for a key is taken as-is.
    pub fn update(&mut self, key: FieldKey, incoming: f64) {
        self.values
            .entry(key)
            .and_modify(|existing| *existing = (*existing + incoming) / 2.0)
            .or_insert(incoming);
    }

    /// Blend every field a frame carries.
    pub fn absorb(&mut self, frame: &Frame) {
        if let Some((freq, channel)) = frame.signal_info_fields() {
            self.update(FieldKey::FrequencyHz, freq);
            self.update(FieldKey::Channel, channel as f64);
        }
        self.update(FieldKey::SignalStrength, frame.signal_strength as f64);
        let (speed, direction) = frame.speed_direction();
        self.update(FieldKey::Speed, speed);
        self.update(FieldKey::Direction, direction);
        self.updates += 1;
    }

    pub fn get(&self, key: FieldKey) -> Option<f64> {
        self.values.get(&key).copied()
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldKey, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One anchor's latest report for an emitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub source_node_id: NodeId,
    pub signal_strength: u8,
    pub received_ms: u64,
}

#[derive(Debug, Clone)]
struct EmitterGroup {
    fused: FusedObservation,
    reports: Vec<Report>,
    last_seen: u64,
}

/// A solved emitter position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionEstimate {
    pub session_id: Uuid,
    pub signal_info: Vec<u8>,
    pub point: Point,
    pub sources: [NodeId; ANCHOR_COUNT],
    pub distances: [f64; ANCHOR_COUNT],
    pub fused: FusedObservation,
    pub timestamp_ms: u64,
}

/// Result of ingesting one frame.
#[derive(Debug)]
pub enum FusionEvent {
    /// Stored; waiting for more distinct anchors.
    Pending { reports: usize },
    Estimated(PositionEstimate),
    /// Three reports arrived but could not be solved; the reports are reset.
    Unsolvable(MeshError),
    /// Source node has no configured anchor position; fused but not ranged.
    UnknownAnchor(NodeId),
}

/// Per-collection-run fusion state.
///
/// Created at the start of a run and dropped at its end; abandoning a
/// half-filled group is normal.
pub struct FusionSession<M: RangeModel> {
    pub id: Uuid,
    anchors: BTreeMap<NodeId, Anchor>,
    model: M,
    timeout_ms: u64,
    groups: HashMap<Vec<u8>, EmitterGroup>,
    estimates: Vec<PositionEstimate>,

    // Counters
    pub frames: u64,
    pub solved: u64,
    pub unsolvable: u64,
}

impl<M: RangeModel> FusionSession<M> {
    pub fn new(anchors: BTreeMap<NodeId, Anchor>, model: M, timeout_ms: u64) -> Self {
        FusionSession {
            id: Uuid::new_v4(),
            anchors,
            model,
            timeout_ms,
            groups: HashMap::new(),
            estimates: Vec::new(),
            frames: 0,
            solved: 0,
            unsolvable: 0,
        }
    }

    /// Fold one delivered frame in; solve if it completes a triple.
    pub fn ingest(&mut self, frame: &Frame, now_ms: u64) -> FusionEvent {
        self.frames += 1;
        let pruned = self.prune_stale(now_ms);
        if pruned > 0 {
            debug!(session = %self.id, pruned, "stale emitter groups dropped");
        }

        let timeout = self.timeout_ms;
        let group = self
            .groups
            .entry(frame.signal_info.clone())
            .or_insert_with(|| EmitterGroup {
                fused: FusedObservation::new(),
                reports: Vec::new(),
                last_seen: now_ms,
            });
        group.fused.absorb(frame);
        group.last_seen = now_ms;
        group
            .reports
            .retain(|r| now_ms.saturating_sub(r.received_ms) <= timeout);

        let source = frame.source_node_id;
        if !self.anchors.contains_key(&source) {
            debug!(source, "report from node without anchor position");
            return FusionEvent::UnknownAnchor(source);
        }

        let report = Report {
            source_node_id: source,
            signal_strength: frame.signal_strength,
            received_ms: now_ms,
        };
        // Latest reading per anchor wins.
        match group.reports.iter_mut().find(|r| r.source_node_id == source) {
            Some(existing) => *existing = report,
            None => group.reports.push(report),
        }

        if group.reports.len() < ANCHOR_COUNT {
            return FusionEvent::Pending {
                reports: group.reports.len(),
            };
        }

        // Reports reset on every attempt; the blend carries on.
        let reports = std::mem::take(&mut group.reports);
        let fused = group.fused.clone();
        match self.solve_reports(&frame.signal_info, &reports, fused, now_ms) {
            Ok(estimate) => {
                info!(
                    session = %self.id,
                    x = estimate.point.x,
                    y = estimate.point.y,
                    "position estimate"
                );
                self.solved += 1;
                self.estimates.push(estimate.clone());
                FusionEvent::Estimated(estimate)
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "could not solve report triple");
                self.unsolvable += 1;
                FusionEvent::Unsolvable(e)
            }
        }
    }

    fn solve_reports(
        &self,
        signal_info: &[u8],
        reports: &[Report],
        fused: FusedObservation,
        now_ms: u64,
    ) -> Result<PositionEstimate> {
        let mut anchors = [Anchor::new(0.0, 0.0); ANCHOR_COUNT];
        let mut distances = [0.0; ANCHOR_COUNT];
        let mut sources = [0; ANCHOR_COUNT];
        for (i, report) in reports.iter().take(ANCHOR_COUNT).enumerate() {
            anchors[i] = *self.anchors.get(&report.source_node_id).ok_or_else(|| {
                MeshError::InvalidInput(format!("no anchor for node {}", report.source_node_id))
            })?;
            distances[i] = self.model.distance(report.signal_strength);
            sources[i] = report.source_node_id;
        }
        let point = trilateration::solve(&anchors, &distances)?;
        Ok(PositionEstimate {
            session_id: self.id,
            signal_info: signal_info.to_vec(),
            point,
            sources,
            distances,
            fused,
            timestamp_ms: now_ms,
        })
    }

    /// Discard emitter groups silent for longer than the timeout. Returns count removed.
    pub fn prune_stale(&mut self, now_ms: u64) -> usize {
        let timeout = self.timeout_ms;
        let before = self.groups.len();
        self.groups
            .retain(|_, g| now_ms.saturating_sub(g.last_seen) <= timeout);
        before - self.groups.len()
    }

    /// Current blend for an emitter, if its group has not timed out.
    pub fn fused(&self, signal_info: &[u8]) -> Option<&FusedObservation> {
        self.groups.get(signal_info).map(|g| &g.fused)
    }

    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn estimates(&self) -> &[PositionEstimate] {
        &self.estimates
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// A session shared by concurrent delivery paths. One lock per session.
pub struct SharedFusion<M: RangeModel> {
    inner: Arc<Mutex<FusionSession<M>>>,
}

impl<M: RangeModel> Clone for SharedFusion<M> {
    fn clone(&self) -> Self {
        SharedFusion {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: RangeModel> SharedFusion<M> {
    pub fn new(session: FusionSession<M>) -> Self {
        SharedFusion {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the session. A panic in another holder does not poison the data
    /// for later deliveries.
    pub fn lock(&self) -> MutexGuard<'_, FusionSession<M>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ingest(&self, frame: &Frame, now_ms: u64) -> FusionEvent {
        self.lock().ingest(frame, now_ms)
    }
}

impl<M: RangeModel> Controller for SharedFusion<M> {
    fn deliver(&mut self, frame: Frame) {
        self.ingest(&frame, now_ms());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::frame::test_observation;
    use crate::trilateration::LinearProxy;

    fn anchors() -> BTreeMap<NodeId, Anchor> {
        BTreeMap::from([
            (1, Anchor::new(0.0, 0.0)),
            (2, Anchor::new(100.0, 0.0)),
            (3, Anchor::new(50.0, 86.6)),
        ])
    }

    fn session() -> FusionSession<LinearProxy> {
        FusionSession::new(anchors(), LinearProxy, DEFAULT_TIMEOUT_MS)
    }

    fn report(source: NodeId, strength: u8) -> Frame {
        let mut frame = Frame::from_observation(&test_observation(source, 0), 0, 1, 0);
        frame.signal_strength = strength;
        frame
    }

    #[test]
    fn test_blend_is_pairwise_average() {
        let mut fused = FusedObservation::new();
        fused.update(FieldKey::Speed, 10.0);
        assert_eq!(fused.get(FieldKey::Speed), Some(10.0));
        fused.update(FieldKey::Speed, 20.0);
        assert_eq!(fused.get(FieldKey::Speed), Some(15.0));
    }

    #[test]
    fn test_blend_depends_on_arrival_order() {
        let mut forward = FusedObservation::new();
        let mut reverse = FusedObservation::new();
        for v in [10.0, 20.0, 40.0] {
            forward.update(FieldKey::SignalStrength, v);
        }
        for v in [40.0, 20.0, 10.0] {
            reverse.update(FieldKey::SignalStrength, v);
        }
        assert_eq!(forward.get(FieldKey::SignalStrength), Some(27.5));
        assert_eq!(reverse.get(FieldKey::SignalStrength), Some(20.0));
    }

    #[test]
    fn test_absorb_frame_fields() {
        let mut fused = FusedObservation::new();
        fused.absorb(&report(1, 40));
        assert_eq!(fused.get(FieldKey::FrequencyHz), Some(2.437e9));
        assert_eq!(fused.get(FieldKey::Channel), Some(6.0));
        assert_eq!(fused.get(FieldKey::SignalStrength), Some(40.0));
        assert_eq!(fused.updates(), 1);
    }

    #[test]
    fn test_pending_until_three_anchors() {
        let mut s = session();
        assert!(matches!(s.ingest(&report(1, 40), 0), FusionEvent::Pending { reports: 1 }));
        // Same anchor again replaces, does not count twice
        assert!(matches!(s.ingest(&report(1, 42), 1), FusionEvent::Pending { reports: 1 }));
        assert!(matches!(s.ingest(&report(2, 40), 2), FusionEvent::Pending { reports: 2 }));
        assert_eq!(s.open_groups(), 1);
    }

    #[test]
    fn test_three_reports_estimate() {
        let mut s = session();
        // LinearProxy: distance = 100 - strength
        let truth = Point { x: 50.0, y: 28.87 };
        let strength = |a: &Anchor| (100.0 - trilateration::distance(a, &truth)).round() as u8;
        let a = anchors();

        s.ingest(&report(1, strength(&a[&1])), 0);
        s.ingest(&report(2, strength(&a[&2])), 1);
        match s.ingest(&report(3, strength(&a[&3])), 2) {
            FusionEvent::Estimated(est) => {
                assert_eq!(est.sources, [1, 2, 3]);
                assert_eq!(est.session_id, s.id);
                assert!((est.point.x - truth.x).abs() < 2.0, "x = {}", est.point.x);
                assert!((est.point.y - truth.y).abs() < 2.0, "y = {}", est.point.y);
                assert_eq!(est.fused.updates(), 3);
            }
            other => panic!("expected estimate, got {other:?}"),
        }
        assert_eq!(s.estimates().len(), 1);
        assert_eq!(s.solved, 1);

        // Reports start over; the blend keeps accumulating
        assert!(matches!(s.ingest(&report(1, 40), 3), FusionEvent::Pending { reports: 1 }));
        let info = codec::compress_signal_info(2.437e9, 6);
        assert_eq!(s.open_groups(), 1);
        assert_eq!(s.fused(&info).unwrap().updates(), 4);
    }

    #[test]
    fn test_unknown_anchor_fused_not_ranged() {
        let mut s = session();
        assert!(matches!(s.ingest(&report(99, 50), 0), FusionEvent::UnknownAnchor(99)));
        let info = codec::compress_signal_info(2.437e9, 6);
        assert_eq!(s.fused(&info).unwrap().updates(), 1);
    }

    #[test]
    fn test_separate_emitters_grouped_apart() {
        let mut s = session();
        let mut other = report(2, 40);
        other.signal_info = codec::compress_signal_info(5.18e9, 36).to_vec();
        s.ingest(&report(1, 40), 0);
        s.ingest(&other, 0);
        assert_eq!(s.open_groups(), 2);
    }

    #[test]
    fn test_unsolvable_triple_resets_group() {
        let mut s = session();
        // Strength 100 -> zero range -> rejected by the solver
        s.ingest(&report(1, 100), 0);
        s.ingest(&report(2, 40), 0);
        assert!(matches!(
            s.ingest(&report(3, 40), 0),
            FusionEvent::Unsolvable(MeshError::InvalidInput(_))
        ));
        assert_eq!(s.unsolvable, 1);
        assert!(matches!(s.ingest(&report(1, 40), 1), FusionEvent::Pending { reports: 1 }));
    }

    #[test]
    fn test_collinear_anchors_unsolvable() {
        let line = BTreeMap::from([
            (1, Anchor::new(0.0, 0.0)),
            (2, Anchor::new(10.0, 0.0)),
            (3, Anchor::new(20.0, 0.0)),
        ]);
        let mut s = FusionSession::new(line, LinearProxy, DEFAULT_TIMEOUT_MS);
        s.ingest(&report(1, 40), 0);
        s.ingest(&report(2, 40), 0);
        assert!(matches!(
            s.ingest(&report(3, 40), 0),
            FusionEvent::Unsolvable(MeshError::Geometry(_))
        ));
    }

    #[test]
    fn test_prune_stale_groups() {
        let mut s = FusionSession::new(anchors(), LinearProxy, 1_000);
        s.ingest(&report(1, 40), 0);
        assert_eq!(s.prune_stale(500), 0);
        assert_eq!(s.prune_stale(1_500), 1);
        assert_eq!(s.open_groups(), 0);
    }

    #[test]
    fn test_late_report_not_solved_with_stale_ones() {
        let mut s = FusionSession::new(anchors(), LinearProxy, 1_000);
        s.ingest(&report(1, 40), 0);
        s.ingest(&report(2, 40), 0);
        // An hour later the earlier reports have expired with their group
        assert!(matches!(
            s.ingest(&report(3, 40), 3_600_000),
            FusionEvent::Pending { reports: 1 }
        ));
        let info = codec::compress_signal_info(2.437e9, 6);
        assert_eq!(s.fused(&info).unwrap().updates(), 1);
        assert!(s.estimates().is_empty());
    }

    #[test]
    fn test_expired_report_dropped_while_group_active() {
        let mut s = FusionSession::new(anchors(), LinearProxy, 1_000);
        s.ingest(&report(1, 40), 0);
        // Anchor 2 keeps the group alive, anchor 1's reading ages out
        s.ingest(&report(2, 40), 800);
        assert!(matches!(
            s.ingest(&report(3, 40), 1_500),
            FusionEvent::Pending { reports: 2 }
        ));
        assert_eq!(s.open_groups(), 1);
    }

    #[test]
    fn test_shared_across_threads() {
        let shared = SharedFusion::new(session());
        let handles: Vec<_> = [1u16, 2, 3]
            .into_iter()
            .map(|source| {
                let mut sink = shared.clone();
                std::thread::spawn(move || sink.deliver(report(source, 45)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = shared.lock();
        assert_eq!(s.frames, 3);
        assert_eq!(s.solved + s.unsolvable, 1);
    }
}
