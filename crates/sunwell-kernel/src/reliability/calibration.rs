//! Confidence calibration (§4.7): tracks how often a stated confidence
//! actually matched the outcome, bucketed into ten-percent bands, and
//! exposes a calibrated estimate plus an overall calibration error. Ported
//! from `ConfidenceCalibrator` in `reasoning/calibration.py`; persistence
//! moves from the original's SQLite table to this kernel's JSON-everywhere
//! convention via `persist::atomic_write_json`/`load_json`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::persist::{atomic_write_json, load_json};

const BAND_SIZE: f64 = 0.1;
const BAND_COUNT: usize = 10;
const MIN_SAMPLES_PER_BAND: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BandStats {
    samples: u32,
    correct: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceCalibrator {
    bands: BTreeMap<usize, BandStats>,
}

fn band_index(confidence: f64) -> usize {
    ((confidence / BAND_SIZE) as usize).min(BAND_COUNT - 1)
}

fn band_midpoint(index: usize) -> f64 {
    (index as f64 + 0.5) * BAND_SIZE
}

impl ConfidenceCalibrator {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    /// Records one prediction-outcome pair: a stated `confidence` in
    /// `[0.0, 1.0]` and whether the prediction turned out correct.
    pub fn record(&mut self, confidence: f64, correct: bool) {
        let stats = self.bands.entry(band_index(confidence)).or_default();
        stats.samples += 1;
        if correct {
            stats.correct += 1;
        }
    }

    /// The calibration curve: band midpoint of stated confidence mapped to
    /// observed accuracy, restricted to bands with enough samples to trust.
    fn curve(&self) -> Vec<(f64, f64)> {
        self.bands
            .iter()
            .filter(|(_, stats)| stats.samples >= MIN_SAMPLES_PER_BAND)
            .map(|(&idx, stats)| (band_midpoint(idx), stats.correct as f64 / stats.samples as f64))
            .collect()
    }

    /// Calibrates a stated `confidence` against the observed curve: exact
    /// band lookup when available, linear interpolation between the
    /// nearest bands otherwise, clamped to the curve's edges.
    pub fn calibrate(&self, confidence: f64) -> f64 {
        let curve = self.curve();
        if curve.is_empty() {
            return confidence;
        }

        let target = band_midpoint(band_index(confidence));

        if let Some((_, accuracy)) = curve.iter().find(|(mid, _)| (*mid - target).abs() < f64::EPSILON) {
            return *accuracy;
        }

        if target <= curve.first().unwrap().0 {
            return curve.first().unwrap().1;
        }
        if target >= curve.last().unwrap().0 {
            return curve.last().unwrap().1;
        }

        let upper_idx = curve.iter().position(|(mid, _)| *mid > target).unwrap();
        let (lo_mid, lo_acc) = curve[upper_idx - 1];
        let (hi_mid, hi_acc) = curve[upper_idx];
        let t = (target - lo_mid) / (hi_mid - lo_mid);
        lo_acc + t * (hi_acc - lo_acc)
    }

    /// Sample-count-weighted mean absolute error between each band's
    /// midpoint confidence and its observed accuracy.
    pub fn overall_calibration_error(&self) -> f64 {
        let curve_bands: Vec<(f64, f64, u32)> = self
            .bands
            .iter()
            .filter(|(_, stats)| stats.samples >= MIN_SAMPLES_PER_BAND)
            .map(|(&idx, stats)| (band_midpoint(idx), stats.correct as f64 / stats.samples as f64, stats.samples))
            .collect();

        let total_samples: u32 = curve_bands.iter().map(|(_, _, n)| n).sum();
        if total_samples == 0 {
            return 0.0;
        }

        curve_bands.iter().map(|(mid, acc, n)| (*mid - acc).abs() * (*n as f64)).sum::<f64>() / total_samples as f64
    }

    pub fn is_well_calibrated(&self, threshold: f64) -> bool {
        self.overall_calibration_error() <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insufficient_samples_yields_identity_calibration() {
        let mut cal = ConfidenceCalibrator::default();
        cal.record(0.9, true);
        assert_eq!(cal.calibrate(0.9), 0.9);
    }

    #[test]
    fn well_calibrated_band_returns_matching_accuracy() {
        let mut cal = ConfidenceCalibrator::default();
        for _ in 0..8 {
            cal.record(0.85, true);
        }
        for _ in 0..2 {
            cal.record(0.85, false);
        }
        assert!((cal.calibrate(0.85) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn interpolates_between_adjacent_bands() {
        let mut cal = ConfidenceCalibrator::default();
        for _ in 0..10 {
            cal.record(0.25, true); // band 2, midpoint 0.25, accuracy 1.0
        }
        for _ in 0..10 {
            cal.record(0.45, false); // band 4, midpoint 0.45, accuracy 0.0
        }
        let mid = cal.calibrate(0.35); // band 3, no direct data, between 0.25 and 0.45
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn overconfident_model_has_positive_calibration_error() {
        let mut cal = ConfidenceCalibrator::default();
        for _ in 0..10 {
            cal.record(0.95, false);
        }
        assert!(cal.overall_calibration_error() > 0.5);
        assert!(!cal.is_well_calibrated(0.10));
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempdir().unwrap();
        let path = td.path().join("calibration.json");
        let mut cal = ConfidenceCalibrator::default();
        for _ in 0..6 {
            cal.record(0.7, true);
        }
        cal.save(&path).unwrap();
        let loaded = ConfidenceCalibrator::load(&path).unwrap();
        assert_eq!(cal.calibrate(0.7), loaded.calibrate(0.7));
    }

    #[test]
    fn missing_file_loads_as_empty_default() {
        let td = tempdir().unwrap();
        let cal = ConfidenceCalibrator::load(&td.path().join("nonexistent.json")).unwrap();
        assert_eq!(cal.calibrate(0.5), 0.5);
    }
}
