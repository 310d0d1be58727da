use log::warn;
use thiserror::Error;

#[derive(Error, PartialEq, Clone, Debug)]
pub enum HalError {
    #[error("{0}")]
    DeviceNotConnected(String),
    #[error("{0}")]
    InternalError(String),
}

pub type HalResult<T> = Result<T, HalError>;

/// Raw, uncalibrated channel reads.  Force and displacement are converted by the sampler using
/// [`crate::calibration::CalibrationData`]; temperature (°C) and humidity (%RH) are used as-is.
pub trait IndenterSensors {
    fn read_force_raw(&mut self) -> HalResult<f64>;
    fn read_displacement_raw(&mut self) -> HalResult<f64>;
    fn read_temperature(&mut self) -> HalResult<f64>;
    fn read_humidity(&mut self) -> HalResult<f64>;
}

pub trait IndenterActuator {
    /// Drive is a normalized stage velocity command, already clamped by the controller.
    fn apply_drive(&mut self, drive: f64) -> HalResult<()>;
}

pub trait SafetyInput {
    fn is_emergency_stop_engaged(&self) -> HalResult<bool>;
}

pub struct IndenterHal {
    pub sensors: Box<dyn IndenterSensors + Send>,
    pub actuator: Box<dyn IndenterActuator + Send>,
    pub safety: Box<dyn SafetyInput + Send>,
}

impl IndenterHal {
    pub fn emergency_stop_engaged(&self) -> bool {
        emergency_stop_engaged(self.safety.as_ref())
    }
}

/// A safety input that can't be read is treated as engaged.
pub fn emergency_stop_engaged(safety: &dyn SafetyInput) -> bool {
    match safety.is_emergency_stop_engaged() {
        Ok(engaged) => engaged,
        Err(e) => {
            warn!("Safety input unreadable, assuming engaged: {e}");
            true
        }
    }
}
