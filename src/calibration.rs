use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Powers of contact depth paired with `area_coefficients`, highest first.
pub const AREA_FUNCTION_EXPONENTS: [f64; 6] = [2.0, 1.0, 0.5, 0.25, 0.125, 0.0625];

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct ChannelCalibration {
    pub scale: f64,
    pub offset: f64,
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self { scale: 1.0, offset: 0.0 }
    }
}

impl ChannelCalibration {
    pub fn apply(&self, raw: f64) -> f64 {
        (raw - self.offset) * self.scale
    }

    pub fn invert(&self, value: f64) -> f64 {
        value / self.scale + self.offset
    }
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationData {
    pub calibration_date: String,
    pub force: ChannelCalibration,
    pub displacement: ChannelCalibration,
    /// Area function `A(h) = C0 h² + C1 h + C2 h^½ + ... + C5 h^(1/16)` in nm².  All zero means
    /// "uncalibrated", and the ideal indenter geometry is used instead.
    pub area_coefficients: [f64; 6],
    /// Load frame compliance in nm/µN.
    pub frame_compliance: f64,
}

impl CalibrationData {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn has_area_function(&self) -> bool {
        self.area_coefficients.iter().any(|&c| c != 0.0)
    }

    pub fn area_function(&self, contact_depth: f64) -> f64 {
        self.area_coefficients
            .iter()
            .zip(AREA_FUNCTION_EXPONENTS)
            .map(|(&c, exponent)| c * contact_depth.powf(exponent))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_calibration_round_trips_raw_values() {
        let cal = ChannelCalibration { scale: 2.5, offset: 10.0 };
        assert_eq!(cal.apply(110.0), 250.0);
        assert!((cal.apply(cal.invert(42.0)) - 42.0).abs() < 1e-12);
    }

    #[test]
    fn test_area_function_terms() {
        let mut cal = CalibrationData::default();
        assert!(!cal.has_area_function());
        cal.area_coefficients = [24.5, 100.0, 0.0, 0.0, 0.0, 16.0];
        assert!(cal.has_area_function());
        let h: f64 = 65536.0;
        let expected = 24.5 * h * h + 100.0 * h + 16.0 * 2.0;
        assert!((cal.area_function(h) - expected).abs() < 1e-6 * expected);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cal: CalibrationData =
            serde_json::from_str(r#"{ "calibration_date": "2026-03-01", "frame_compliance": 0.2 }"#).unwrap();
        assert_eq!(cal.calibration_date, "2026-03-01");
        assert_eq!(cal.force, ChannelCalibration::default());
        assert_eq!(cal.frame_compliance, 0.2);
        assert!(!cal.has_area_function());
    }
}
