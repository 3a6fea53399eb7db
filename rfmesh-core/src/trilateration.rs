//! Closed-form 2-D trilateration from exactly three anchors.
//!
//! Subtracting the first circle equation from the second and third leaves a
//! 2x2 linear system, solved with Cramer's rule:
//!
//! ```text
//! A2·x + B2·y = D2    A2 = 2(x2−x1), B2 = 2(y2−y1), D2 = r1²−r2²−x1²+x2²−y1²+y2²
//! A3·x + B3·y = D3    A3 = 2(x3−x1), B3 = 2(y3−y1), D3 = r1²−r3²−x1²+x3²−y1²+y3²
//! ```
//!
//! The estimate is not checked against the input ranges; use [`residuals`]
//! when an accuracy bound is needed.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{MeshError, Result};

/// Anchors (and ranges) required per solve.
pub const ANCHOR_COUNT: usize = 3;

/// Fixed receiving node at a known Cartesian position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

impl Anchor {
    pub fn new(x: f64, y: f64) -> Self {
        Anchor { x, y }
    }
}

/// Position estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Euclidean distance between an anchor and a point.
pub fn distance(anchor: &Anchor, point: &Point) -> f64 {
    ((point.x - anchor.x).powi(2) + (point.y - anchor.y).powi(2)).sqrt()
}

/// Estimate a position from three anchors and three positive ranges.
///
/// Fails with `InvalidInput` on a count mismatch or a non-positive/non-finite
/// range, and with `Geometry` when the anchors are collinear or coincident.
pub fn solve(anchors: &[Anchor], distances: &[f64]) -> Result<Point> {
    if anchors.len() != ANCHOR_COUNT {
        return Err(MeshError::InvalidInput(format!(
            "exactly {ANCHOR_COUNT} anchors required, got {}",
            anchors.len()
        )));
    }
    if distances.len() != ANCHOR_COUNT {
        return Err(MeshError::InvalidInput(format!(
            "exactly {ANCHOR_COUNT} distances required, got {}",
            distances.len()
        )));
    }
    if let Some(bad) = distances.iter().find(|d| !(d.is_finite() && **d > 0.0)) {
        return Err(MeshError::InvalidInput(format!(
            "distances must be positive, got {bad}"
        )));
    }

    let (x1, y1) = (anchors[0].x, anchors[0].y);
    let (x2, y2) = (anchors[1].x, anchors[1].y);
    let (x3, y3) = (anchors[2].x, anchors[2].y);
    let (r1, r2, r3) = (distances[0], distances[1], distances[2]);

    let a2 = 2.0 * (x2 - x1);
    let b2 = 2.0 * (y2 - y1);
    let d2 = r1 * r1 - r2 * r2 - x1 * x1 + x2 * x2 - y1 * y1 + y2 * y2;

    let a3 = 2.0 * (x3 - x1);
    let b3 = 2.0 * (y3 - y1);
    let d3 = r1 * r1 - r3 * r3 - x1 * x1 + x3 * x3 - y1 * y1 + y3 * y3;

    let denom = a2 * b3 - a3 * b2;
    // Relative tolerance so collinear anchors with non-integer coordinates
    // are not let through by rounding noise.
    let scale = (a2 * b3).abs() + (a3 * b2).abs();
    if denom == 0.0 || denom.abs() <= f64::EPSILON * 4.0 * scale {
        return Err(MeshError::Geometry("collinear anchors".into()));
    }

    let point = Point {
        x: (d2 * b3 - d3 * b2) / denom,
        y: (a2 * d3 - a3 * d2) / denom,
    };
    debug!(x = point.x, y = point.y, "trilaterated");
    Ok(point)
}

/// Per-anchor `|distance(anchor, point) − range|`.
pub fn residuals(anchors: &[Anchor], distances: &[f64], point: &Point) -> Vec<f64> {
    anchors
        .iter()
        .zip(distances)
        .map(|(a, r)| (distance(a, point) - r).abs())
        .collect()
}

// ---------------------------------------------------------------------------
// Range models
// ---------------------------------------------------------------------------

/// Converts a compressed signal strength (see `codec::compress_rssi`) into a
/// range estimate for [`solve`].
pub trait RangeModel {
    fn distance(&self, compressed_strength: u8) -> f64;
}

/// `100 − strength`: a monotonic proxy with no physical calibration.
/// Strengths of 100 or more produce non-positive ranges, which `solve` rejects.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearProxy;

impl RangeModel for LinearProxy {
    fn distance(&self, compressed_strength: u8) -> f64 {
        100.0 - compressed_strength as f64
    }
}

/// Log-distance path loss: `rssi = p0 − 10·n·log10(d / 1 m)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogDistance {
    /// RSSI at 1 m, dBm.
    pub reference_dbm: f64,
    /// Path-loss exponent: ~2 in free space, 2.7-4 indoors.
    pub exponent: f64,
}

impl Default for LogDistance {
    fn default() -> Self {
        LogDistance {
            reference_dbm: -40.0,
            exponent: 2.0,
        }
    }
}

impl RangeModel for LogDistance {
    fn distance(&self, compressed_strength: u8) -> f64 {
        let rssi_dbm = compressed_strength as f64 - 120.0;
        10f64.powf((self.reference_dbm - rssi_dbm) / (10.0 * self.exponent))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
