//! Range model selection for the CLI.

use clap::ValueEnum;

use rfmesh_core::trilateration::{LinearProxy, LogDistance, RangeModel};

/// Strength-to-distance model used when fusing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    /// `100 - strength`; uncalibrated
    Linear,
    /// Log-distance path loss, -40 dBm at 1 m, exponent 2
    LogDistance,
}

impl ModelArg {
    /// RSSI (dBm) a sensor at `range` would read under this model.
    pub fn expected_rssi(&self, range: f64) -> f64 {
        match self {
            ModelArg::Linear => (100.0 - range) - 120.0,
            ModelArg::LogDistance => {
                let m = LogDistance::default();
                m.reference_dbm - 10.0 * m.exponent * range.log10()
            }
        }
    }
}

impl RangeModel for ModelArg {
    fn distance(&self, compressed_strength: u8) -> f64 {
        match self {
            ModelArg::Linear => LinearProxy.distance(compressed_strength),
            ModelArg::LogDistance => LogDistance::default().distance(compressed_strength),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmesh_core::codec::compress_rssi;

    #[test]
    fn test_expected_rssi_inverts_model() {
        for model in [ModelArg::Linear, ModelArg::LogDistance] {
            // Whole-dB readings survive compression exactly
            let rssi = model.expected_rssi(10.0).round();
            let back = model.distance(compress_rssi(rssi));
            assert!((back - 10.0).abs() < 1e-9, "{model:?}: {back}");
        }
    }
}
