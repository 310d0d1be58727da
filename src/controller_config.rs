use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;

use conv::{ConvUtil, RoundToNearest};
use serde::{Deserialize, Serialize};

use crate::indentation_error::IndentationError;
use crate::sample_buffer::MAX_BUFFER_CAPACITY;
use crate::test_parameters::TestParameters;

/// Headroom over the longest expected test when sizing the sample ring.
const CAPACITY_MARGIN: f64 = 1.1;

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub min_drive: f64,
    pub max_drive: f64,
}

impl PidGains {
    pub fn proportional(kp: f64) -> Self {
        Self { kp, ki: 0.0, kd: 0.0, min_drive: -1.0, max_drive: 1.0 }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactDetectorConfig {
    /// Minimum `ΔF/Δh` between consecutive samples, µN/nm.
    pub stiffness_threshold: f64,
    pub confirmation_count: u32,
    /// Displacement steps smaller than this (nm) can't produce a stiffness estimate.
    pub min_displacement_step: f64,
    /// Samples at or below this force (µN) during approach are taken as "not yet touching" when
    /// locating the surface.
    pub surface_force_tolerance: f64,
}

impl Default for ContactDetectorConfig {
    fn default() -> Self {
        Self {
            stiffness_threshold: 0.01,
            confirmation_count: 5,
            min_displacement_step: 1e-4,
            surface_force_tolerance: 0.05,
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct ChannelGuardConfig {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub max_per_sample_delta: Option<f64>,
}

impl ChannelGuardConfig {
    pub fn range(min: f64, max: f64) -> Self {
        Self { min, max, max_per_sample_delta: None }
    }

    pub fn sane_range(&self) -> Range<f64> {
        self.min..self.max
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub sample_rate_hz: u32,
    /// The control loop runs once every `control_divider` samples.
    pub control_divider: u32,
    pub buffer_capacity: usize,
    pub force_pid: PidGains,
    pub displacement_pid: PidGains,
    pub contact: ContactDetectorConfig,
    /// Unloading is complete once the setpoint is at or below this value.
    pub unload_zero_tolerance: f64,
    pub force_guard: ChannelGuardConfig,
    pub displacement_guard: ChannelGuardConfig,
    pub temperature_guard: ChannelGuardConfig,
    pub humidity_guard: ChannelGuardConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1000,
            control_divider: 1,
            buffer_capacity: 16384,
            force_pid: PidGains::proportional(0.02),
            displacement_pid: PidGains::proportional(0.5),
            contact: ContactDetectorConfig::default(),
            unload_zero_tolerance: 1e-9,
            force_guard: ChannelGuardConfig::range(-1.0e5, 1.0e5),
            displacement_guard: ChannelGuardConfig::range(-1.0e7, 1.0e7),
            temperature_guard: ChannelGuardConfig::range(-40.0, 125.0),
            humidity_guard: ChannelGuardConfig::range(0.0, 100.0),
        }
    }
}

impl ControllerConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: ControllerConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn control_rate_hz(&self) -> f64 {
        f64::from(self.sample_rate_hz) / f64::from(self.control_divider.max(1))
    }

    pub fn sample_period_secs(&self) -> f64 {
        1.0 / f64::from(self.sample_rate_hz)
    }

    pub fn control_period_secs(&self) -> f64 {
        1.0 / self.control_rate_hz()
    }

    /// Ring size that holds every sample of one test run with `params`, never smaller than the
    /// configured `buffer_capacity` or the requested `sample_count_target`.
    pub fn buffer_capacity_for(&self, params: &TestParameters) -> Result<usize, IndentationError> {
        params.validate()?;
        self.validate()?;
        let samples = params.max_duration_secs() * f64::from(self.sample_rate_hz) * CAPACITY_MARGIN;
        let needed = samples
            .ceil()
            .approx_as_by::<u64, RoundToNearest>()
            .map_err(|e| IndentationError::InvalidParameters(format!("test length of {samples} samples: {e}")))?;
        if needed > MAX_BUFFER_CAPACITY as u64 {
            return Err(IndentationError::InvalidParameters(format!(
                "a test of up to {:.0} s at {} Hz needs {needed} samples, more than the buffer limit of {MAX_BUFFER_CAPACITY}",
                params.max_duration_secs(), self.sample_rate_hz)));
        }
        Ok((needed as usize).max(self.buffer_capacity).max(params.sample_count_target))
    }

    pub fn validate(&self) -> Result<(), IndentationError> {
        if self.sample_rate_hz == 0 {
            return Err(invalid("sample_rate_hz must be positive"));
        }
        if self.control_divider == 0 {
            return Err(invalid("control_divider must be at least 1"));
        }
        if self.buffer_capacity < 2 {
            return Err(invalid("buffer_capacity must hold at least two samples"));
        }
        if self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(IndentationError::InvalidConfig(format!(
                "buffer_capacity {} exceeds the limit of {MAX_BUFFER_CAPACITY}", self.buffer_capacity)));
        }
        for (name, gains) in [("force_pid", &self.force_pid), ("displacement_pid", &self.displacement_pid)] {
            if ![gains.kp, gains.ki, gains.kd].iter().all(|gain| gain.is_finite()) {
                return Err(IndentationError::InvalidConfig(format!("{name} gains must be finite")));
            }
            if !(gains.min_drive.is_finite() && gains.max_drive.is_finite() && gains.min_drive <= gains.max_drive) {
                return Err(IndentationError::InvalidConfig(format!(
                    "{name} drive limits must be finite with min <= max")));
            }
        }
        if self.contact.confirmation_count == 0 {
            return Err(invalid("contact.confirmation_count must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> IndentationError {
    IndentationError::InvalidConfig(message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.control_rate_hz(), 1000.0);
    }

    #[test]
    fn test_control_divider_slows_control_rate() {
        let config = ControllerConfig { control_divider: 4, ..Default::default() };
        assert_eq!(config.control_rate_hz(), 250.0);
        assert_eq!(config.control_period_secs(), 0.004);
    }

    #[test]
    fn test_rejects_inverted_drive_limits() {
        let mut config = ControllerConfig::default();
        config.force_pid.min_drive = 2.0;
        assert!(matches!(config.validate(), Err(IndentationError::InvalidConfig(_))));
    }

    #[test]
    fn test_default_test_fits_default_buffer() {
        let config = ControllerConfig::default();
        let params = TestParameters::default();
        // 75 s worst case at 1 kHz plus margin.
        let capacity = config.buffer_capacity_for(&params).unwrap();
        assert!((82_500..=82_501).contains(&capacity), "capacity {capacity}");

        // Approach to a 200 nm surface at 100 nm/s, then 5 s each of loading, hold and unloading.
        let nominal_samples = (2.0 + 5.0 + 5.0 + 5.0) * 1000.0;
        assert!(capacity as f64 > nominal_samples);
    }

    #[test]
    fn test_buffer_never_smaller_than_requested() {
        let config = ControllerConfig { buffer_capacity: 200_000, ..Default::default() };
        assert_eq!(config.buffer_capacity_for(&TestParameters::default()), Ok(200_000));
        let params = TestParameters { sample_count_target: 300_000, ..Default::default() };
        assert_eq!(config.buffer_capacity_for(&params), Ok(300_000));
    }

    #[test]
    fn test_rejects_test_too_long_for_any_buffer() {
        let config = ControllerConfig::default();
        let params = TestParameters { hold_duration_secs: 1.0e7, ..Default::default() };
        assert!(matches!(config.buffer_capacity_for(&params), Err(IndentationError::InvalidParameters(_))));
        let params = TestParameters { sample_count_target: usize::MAX / 4, ..Default::default() };
        assert!(matches!(config.buffer_capacity_for(&params), Err(IndentationError::InvalidParameters(_))));
        let config = ControllerConfig { buffer_capacity: usize::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(IndentationError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_finite_gains() {
        let mut config = ControllerConfig::default();
        config.displacement_pid.ki = f64::NAN;
        assert!(matches!(config.validate(), Err(IndentationError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{ "sample_rate_hz": 500, "contact": { "confirmation_count": 3 } }"#).unwrap();
        assert_eq!(config.sample_rate_hz, 500);
        assert_eq!(config.contact.confirmation_count, 3);
        assert_eq!(config.contact.stiffness_threshold, 0.01);
        assert_eq!(config.force_pid, PidGains::proportional(0.02));
    }
}
