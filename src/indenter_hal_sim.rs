use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::calibration::ChannelCalibration;
use crate::controller_config::ControllerConfig;
use crate::indenter_hal::{HalError, HalResult, IndenterActuator, IndenterHal, IndenterSensors, SafetyInput};
use crate::test_parameters::{IndenterDescriptor, IndenterKind};

/// Convert a modulus or hardness in GPa to µN/nm².
const UN_PER_NM2_PER_GPA: f64 = 1.0e-3;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum SimulatedMaterial {
    /// Fully reversible spring, stiffness in µN/nm.
    LinearElastic { stiffness: f64 },
    /// Self-similar tip into a material of known hardness and reduced modulus (both GPa).
    /// Loading follows `F = (h / c)²` and unloading is linear from the deepest point reached, so
    /// an Oliver-Pharr analysis of any trace recovers the inputs exactly.
    ElasticPlastic {
        hardness: f64,
        reduced_modulus: f64,
        area_coefficient: f64,
        epsilon: f64,
        beta: f64,
    },
}

impl SimulatedMaterial {
    pub fn elastic_plastic(hardness: f64, reduced_modulus: f64, indenter: &IndenterDescriptor) -> Self {
        let area_coefficient = match indenter.kind {
            IndenterKind::CubeCorner => 2.598,
            _ => 24.5,
        };
        SimulatedMaterial::ElasticPlastic {
            hardness,
            reduced_modulus,
            area_coefficient,
            epsilon: indenter.epsilon(),
            beta: indenter.beta(),
        }
    }

    /// Reduced modulus (GPa) for a sample of modulus `sample_modulus` pressed by `indenter`.
    pub fn reduced_modulus_for(sample_modulus: f64, sample_poisson_ratio: f64, indenter: &IndenterDescriptor) -> f64 {
        1.0 / ((1.0 - sample_poisson_ratio.powi(2)) / sample_modulus + indenter.tip_compliance())
    }

    fn loading_force(&self, depth: f64) -> f64 {
        match *self {
            SimulatedMaterial::LinearElastic { stiffness } => stiffness * depth,
            SimulatedMaterial::ElasticPlastic { hardness, reduced_modulus, area_coefficient, epsilon, beta } => {
                let hardness = hardness * UN_PER_NM2_PER_GPA;
                let reduced_modulus = reduced_modulus * UN_PER_NM2_PER_GPA;
                let c = 1.0 / (area_coefficient * hardness).sqrt()
                    + epsilon * PI.sqrt() * hardness.sqrt() / (2.0 * beta * reduced_modulus);
                (depth / c).powi(2)
            }
        }
    }

    fn unloading_stiffness(&self, peak_force: f64) -> f64 {
        match *self {
            SimulatedMaterial::LinearElastic { stiffness } => stiffness,
            SimulatedMaterial::ElasticPlastic { hardness, reduced_modulus, beta, .. } => {
                let area = peak_force / (hardness * UN_PER_NM2_PER_GPA);
                2.0 * beta * reduced_modulus * UN_PER_NM2_PER_GPA * area.sqrt() / PI.sqrt()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedIndenterConfig {
    pub material: SimulatedMaterial,
    /// Stage position (nm from home) at which the tip touches the surface.
    pub surface_position: f64,
    /// Stage speed in nm/s at a drive of 1.0.
    pub max_speed: f64,
    /// Time the stage moves for after each drive command, seconds.
    pub control_period: f64,
    pub force_noise: f64,
    pub displacement_noise: f64,
    pub seed: u64,
    pub temperature: f64,
    pub humidity: f64,
    pub force_calibration: ChannelCalibration,
    pub displacement_calibration: ChannelCalibration,
    /// Every n-th force read fails.
    pub force_dropout_every: Option<u64>,
    /// The emergency stop engages once this many force reads have happened.
    pub emergency_stop_after_reads: Option<u64>,
}

impl SimulatedIndenterConfig {
    pub fn new(material: SimulatedMaterial, controller: &ControllerConfig) -> Self {
        Self {
            material,
            surface_position: 200.0,
            max_speed: 500.0,
            control_period: controller.control_period_secs(),
            force_noise: 0.0,
            displacement_noise: 0.0,
            seed: 0,
            temperature: 23.0,
            humidity: 35.0,
            force_calibration: ChannelCalibration::default(),
            displacement_calibration: ChannelCalibration::default(),
            force_dropout_every: None,
            emergency_stop_after_reads: None,
        }
    }
}

struct SimState {
    config: SimulatedIndenterConfig,
    position: f64,
    /// Deepest (depth, force) reached so far; unloading is relative to this point.
    peak: Option<(f64, f64)>,
    last_drive: f64,
    force_reads: u64,
    emergency_stop: bool,
    rng: StdRng,
}

impl SimState {
    fn depth(&self) -> f64 {
        self.position - self.config.surface_position
    }

    fn force(&self) -> f64 {
        let depth = self.depth();
        if depth <= 0.0 {
            return 0.0;
        }
        match (self.config.material, self.peak) {
            (SimulatedMaterial::LinearElastic { .. }, _) | (_, None) => self.config.material.loading_force(depth),
            (material, Some((peak_depth, peak_force))) => {
                if depth >= peak_depth {
                    material.loading_force(depth)
                } else {
                    let stiffness = material.unloading_stiffness(peak_force);
                    (peak_force - stiffness * (peak_depth - depth)).max(0.0)
                }
            }
        }
    }

    fn advance(&mut self, drive: f64) {
        let drive = drive.max(-1.0).min(1.0);
        self.position += drive * self.config.max_speed * self.config.control_period;
        let depth = self.depth();
        let deeper = match self.peak {
            Some((peak_depth, _)) => depth > peak_depth,
            None => depth > 0.0,
        };
        if deeper {
            self.peak = Some((depth, self.config.material.loading_force(depth)));
        }
        self.last_drive = drive;
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        if amplitude > 0.0 {
            self.rng.gen_range(-amplitude..=amplitude)
        } else {
            0.0
        }
    }
}

/// A velocity-commanded stage pressing into a simulated material.  Cloning shares the rig.
#[derive(Clone)]
pub struct SimulatedIndenter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedIndenter {
    pub fn new(config: SimulatedIndenterConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                position: 0.0,
                peak: None,
                last_drive: 0.0,
                force_reads: 0,
                emergency_stop: false,
                rng,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hal(&self) -> IndenterHal {
        IndenterHal {
            sensors: Box::new(self.clone()),
            actuator: Box::new(self.clone()),
            safety: Box::new(self.clone()),
        }
    }

    pub fn engage_emergency_stop(&self) {
        self.lock().emergency_stop = true;
    }

    pub fn position(&self) -> f64 {
        self.lock().position
    }

    pub fn true_force(&self) -> f64 {
        self.lock().force()
    }

    pub fn last_drive(&self) -> f64 {
        self.lock().last_drive
    }
}

impl IndenterSensors for SimulatedIndenter {
    fn read_force_raw(&mut self) -> HalResult<f64> {
        let mut state = self.lock();
        state.force_reads += 1;
        let reads = state.force_reads;
        if let Some(after) = state.config.emergency_stop_after_reads {
            if reads >= after {
                state.emergency_stop = true;
            }
        }
        if let Some(every) = state.config.force_dropout_every {
            if every > 0 && reads % every == 0 {
                return Err(HalError::InternalError(format!("simulated dropout on read {reads}")));
            }
        }
        let noise = state.config.force_noise;
        let force = state.force() + state.noise(noise);
        Ok(state.config.force_calibration.invert(force))
    }

    fn read_displacement_raw(&mut self) -> HalResult<f64> {
        let mut state = self.lock();
        let noise = state.config.displacement_noise;
        let displacement = state.position + state.noise(noise);
        Ok(state.config.displacement_calibration.invert(displacement))
    }

    fn read_temperature(&mut self) -> HalResult<f64> {
        Ok(self.lock().config.temperature)
    }

    fn read_humidity(&mut self) -> HalResult<f64> {
        Ok(self.lock().config.humidity)
    }
}

impl IndenterActuator for SimulatedIndenter {
    fn apply_drive(&mut self, drive: f64) -> HalResult<()> {
        if !drive.is_finite() {
            return Err(HalError::InternalError(format!("refusing non-finite drive {drive}")));
        }
        self.lock().advance(drive);
        Ok(())
    }
}

impl SafetyInput for SimulatedIndenter {
    fn is_emergency_stop_engaged(&self) -> HalResult<bool> {
        Ok(self.lock().emergency_stop)
    }
}
