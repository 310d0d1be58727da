use std::time::Duration;

use thiserror::Error;

use crate::indenter_hal::HalError;
use crate::sample::Channel;
use crate::test_sequencer::Phase;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndentationError {
    /// Recovered locally by the sampler; never aborts a test.
    #[error("sensor fault on {channel:?} channel: {reason}")]
    SensorFault { channel: Channel, reason: String },

    #[error("contact not confirmed within {0:?}")]
    ContactTimeout(Duration),

    #[error("unloading segment has {found} usable samples, need at least {required}")]
    InsufficientUnloadingData { found: usize, required: usize },

    #[error("emergency stop engaged during {phase:?}")]
    EmergencyStop { phase: Phase },

    #[error("measured force {force} µN exceeds safety limit {limit} µN")]
    ForceLimitExceeded { force: f64, limit: f64 },

    #[error("actuator fault: {0}")]
    ActuatorFault(HalError),

    #[error("unloading segment has no displacement spread to fit")]
    DegenerateUnloadingFit,

    #[error("non-physical result: {0}")]
    NonPhysicalResult(String),

    #[error("invalid test parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid controller config: {0}")]
    InvalidConfig(String),
}
