use std::f64::consts::PI;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::indentation_error::IndentationError;
use crate::sample_buffer::MAX_BUFFER_CAPACITY;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum ControlMode {
    Force,
    Displacement,
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "force" => Ok(ControlMode::Force),
            "displacement" => Ok(ControlMode::Displacement),
            other => Err(format!("unknown control mode: {other}")),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum IndenterKind {
    Berkovich,
    Vickers,
    CubeCorner,
    Spherical,
}

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndenterDescriptor {
    pub kind: IndenterKind,
    /// Tip radius in nm, required for spherical tips.
    pub radius: Option<f64>,
    /// Young's modulus of the tip material in GPa.
    pub tip_modulus: f64,
    pub tip_poisson_ratio: f64,
}

impl Default for IndenterDescriptor {
    fn default() -> Self {
        Self::diamond(IndenterKind::Berkovich)
    }
}

impl IndenterDescriptor {
    pub const DIAMOND_MODULUS_GPA: f64 = 1141.0;
    pub const DIAMOND_POISSON_RATIO: f64 = 0.07;

    pub fn diamond(kind: IndenterKind) -> Self {
        Self {
            kind,
            radius: None,
            tip_modulus: Self::DIAMOND_MODULUS_GPA,
            tip_poisson_ratio: Self::DIAMOND_POISSON_RATIO,
        }
    }

    pub fn spherical(radius: f64) -> Self {
        Self { radius: Some(radius), ..Self::diamond(IndenterKind::Spherical) }
    }

    /// Geometric constant in `h_c = h_max - ε F_max / S`.
    pub fn epsilon(&self) -> f64 {
        match self.kind {
            IndenterKind::Berkovich | IndenterKind::Vickers | IndenterKind::CubeCorner => 0.75,
            IndenterKind::Spherical => 0.75,
        }
    }

    /// Correction factor β in `E_r = √π S / (2 β √A)`.
    pub fn beta(&self) -> f64 {
        match self.kind {
            IndenterKind::Berkovich | IndenterKind::CubeCorner => 1.034,
            IndenterKind::Vickers => 1.012,
            IndenterKind::Spherical => 1.0,
        }
    }

    /// Projected contact area of a perfect tip in nm².
    pub fn ideal_area(&self, contact_depth: f64) -> f64 {
        match self.kind {
            IndenterKind::Berkovich | IndenterKind::Vickers => 24.5 * contact_depth.powi(2),
            IndenterKind::CubeCorner => 2.598 * contact_depth.powi(2),
            IndenterKind::Spherical => {
                let radius = self.radius.unwrap_or(0.0);
                if contact_depth >= radius {
                    PI * radius * radius
                } else {
                    PI * (2.0 * radius * contact_depth - contact_depth * contact_depth)
                }
            }
        }
    }

    /// The indenter's share of the reduced compliance, `(1 - ν_i²) / E_i` in 1/GPa.
    pub fn tip_compliance(&self) -> f64 {
        (1.0 - self.tip_poisson_ratio.powi(2)) / self.tip_modulus
    }
}

/// Units: forces µN, displacements nm, rates per second in the unit of the control mode,
/// durations seconds.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestParameters {
    pub max_load: f64,
    pub max_displacement: f64,
    pub loading_rate: f64,
    pub unloading_rate: f64,
    pub hold_duration_secs: f64,
    pub control_mode: ControlMode,
    pub contact_force_threshold: f64,
    pub indenter: IndenterDescriptor,
    pub sample_count_target: usize,
    pub approach_speed: f64,
    pub approach_timeout_secs: f64,
    pub contact_establishment_depth: f64,
    pub contact_establishment_tolerance: f64,
    pub sample_poisson_ratio: f64,
    pub safety_force_limit: f64,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            max_load: 1000.0,
            max_displacement: 200.0,
            loading_rate: 200.0,
            unloading_rate: 200.0,
            hold_duration_secs: 5.0,
            control_mode: ControlMode::Force,
            contact_force_threshold: 2.0,
            indenter: IndenterDescriptor::default(),
            sample_count_target: 16384,
            approach_speed: 100.0,
            approach_timeout_secs: 60.0,
            contact_establishment_depth: 5.0,
            contact_establishment_tolerance: 0.5,
            sample_poisson_ratio: 0.25,
            safety_force_limit: 5000.0,
        }
    }
}

impl TestParameters {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let params: TestParameters = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(params)
    }

    pub fn approach_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.approach_timeout_secs)
    }

    /// Setpoint at which loading stops, in the unit of `control_mode`.
    pub fn loading_target(&self) -> f64 {
        match self.control_mode {
            ControlMode::Force => self.max_load,
            ControlMode::Displacement => self.max_displacement,
        }
    }

    /// Upper bound on the length of a test: approach and contact establishment up to the timeout,
    /// then a full loading ramp, the hold and a full unloading ramp.
    pub fn max_duration_secs(&self) -> f64 {
        let target = self.loading_target();
        self.approach_timeout_secs + target / self.loading_rate + self.hold_duration_secs + target / self.unloading_rate
    }

    pub fn validate(&self) -> Result<(), IndentationError> {
        let positive = [
            ("max_load", self.max_load),
            ("max_displacement", self.max_displacement),
            ("loading_rate", self.loading_rate),
            ("unloading_rate", self.unloading_rate),
            ("contact_force_threshold", self.contact_force_threshold),
            ("approach_speed", self.approach_speed),
            ("approach_timeout_secs", self.approach_timeout_secs),
            ("contact_establishment_tolerance", self.contact_establishment_tolerance),
            ("safety_force_limit", self.safety_force_limit),
            ("indenter.tip_modulus", self.indenter.tip_modulus),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if !(self.hold_duration_secs.is_finite() && self.hold_duration_secs >= 0.0) {
            return Err(invalid(format!("hold_duration_secs must be >= 0, got {}", self.hold_duration_secs)));
        }
        if !(self.contact_establishment_depth.is_finite() && self.contact_establishment_depth >= 0.0) {
            return Err(invalid(format!(
                "contact_establishment_depth must be >= 0, got {}",
                self.contact_establishment_depth)));
        }
        if !(0.0..0.5).contains(&self.sample_poisson_ratio) {
            return Err(invalid(format!("sample_poisson_ratio must be in [0, 0.5), got {}", self.sample_poisson_ratio)));
        }
        if !(0.0..0.5).contains(&self.indenter.tip_poisson_ratio) {
            return Err(invalid(format!(
                "indenter.tip_poisson_ratio must be in [0, 0.5), got {}",
                self.indenter.tip_poisson_ratio)));
        }
        if self.contact_force_threshold >= self.safety_force_limit {
            return Err(invalid("contact_force_threshold must be below safety_force_limit".to_owned()));
        }
        if self.control_mode == ControlMode::Force && self.max_load >= self.safety_force_limit {
            return Err(invalid(format!(
                "max_load {} must be below safety_force_limit {}",
                self.max_load, self.safety_force_limit)));
        }
        if self.sample_count_target > MAX_BUFFER_CAPACITY {
            return Err(invalid(format!(
                "sample_count_target {} exceeds the buffer limit of {MAX_BUFFER_CAPACITY}",
                self.sample_count_target)));
        }
        if self.indenter.kind == IndenterKind::Spherical {
            match self.indenter.radius {
                Some(radius) if radius.is_finite() && radius > 0.0 => {}
                _ => return Err(invalid("spherical indenter requires a positive radius".to_owned())),
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> IndentationError {
    IndentationError::InvalidParameters(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(TestParameters::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let params = TestParameters { loading_rate: 0.0, ..Default::default() };
        assert!(matches!(params.validate(), Err(IndentationError::InvalidParameters(_))));
    }

    #[test]
    fn test_max_load_must_stay_below_safety_limit_in_force_mode() {
        let params = TestParameters { max_load: 6000.0, ..Default::default() };
        assert!(params.validate().is_err());
        let params = TestParameters {
            max_load: 6000.0,
            control_mode: ControlMode::Displacement,
            ..Default::default()
        };
        assert_eq!(params.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_unbounded_sample_count_target() {
        let params = TestParameters { sample_count_target: usize::MAX / 4, ..Default::default() };
        assert!(matches!(params.validate(), Err(IndentationError::InvalidParameters(_))));
        let params = TestParameters { sample_count_target: MAX_BUFFER_CAPACITY, ..Default::default() };
        assert_eq!(params.validate(), Ok(()));
    }

    #[test]
    fn test_max_duration_covers_every_phase() {
        let params = TestParameters::default();
        assert_eq!(params.max_duration_secs(), 60.0 + 5.0 + 5.0 + 5.0);
        let params = TestParameters {
            control_mode: ControlMode::Displacement,
            max_displacement: 100.0,
            loading_rate: 10.0,
            unloading_rate: 20.0,
            ..params
        };
        assert_eq!(params.max_duration_secs(), 60.0 + 10.0 + 5.0 + 5.0);
    }

    #[test]
    fn test_spherical_requires_radius() {
        let mut params = TestParameters {
            indenter: IndenterDescriptor::diamond(IndenterKind::Spherical),
            ..Default::default()
        };
        assert!(params.validate().is_err());
        params.indenter = IndenterDescriptor::spherical(5000.0);
        assert_eq!(params.validate(), Ok(()));
    }

    #[test]
    fn test_geometry_constants_follow_indenter_kind() {
        let berkovich = IndenterDescriptor::diamond(IndenterKind::Berkovich);
        let vickers = IndenterDescriptor::diamond(IndenterKind::Vickers);
        let sphere = IndenterDescriptor::spherical(1000.0);
        assert_eq!(berkovich.beta(), 1.034);
        assert_eq!(vickers.beta(), 1.012);
        assert_eq!(sphere.beta(), 1.0);
        assert_eq!(berkovich.ideal_area(10.0), 2450.0);
        assert!((sphere.ideal_area(10.0) - PI * (20000.0 - 100.0)).abs() < 1e-6);
        assert!((sphere.ideal_area(2000.0) - PI * 1.0e6).abs() < 1e-6);
    }

    #[test]
    fn test_parses_control_mode() {
        assert_eq!("Force".parse::<ControlMode>(), Ok(ControlMode::Force));
        assert_eq!("displacement".parse::<ControlMode>(), Ok(ControlMode::Displacement));
        assert!("torque".parse::<ControlMode>().is_err());
    }
}
