use std::time::Duration;

use crate::controller_config::ContactDetectorConfig;
use crate::sample::Sample;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContactEvent {
    NoContact,
    Confirming(u32),
    /// Reported on exactly one update per test.
    Declared,
    AlreadyDeclared,
}

/// Debounced contact latch: force and instantaneous stiffness must both exceed their thresholds
/// for `confirmation_count` consecutive samples.
pub struct ContactDetector {
    config: ContactDetectorConfig,
    force_threshold: f64,
    consecutive: u32,
    declared: bool,
    last_seen: Option<Duration>,
}

impl ContactDetector {
    pub fn new(config: ContactDetectorConfig, force_threshold: f64) -> Self {
        Self {
            config,
            force_threshold,
            consecutive: 0,
            declared: false,
            last_seen: None,
        }
    }

    pub fn is_declared(&self) -> bool {
        self.declared
    }

    pub fn confirmations(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.declared = false;
        self.last_seen = None;
    }

    pub fn update(&mut self, latest: &Sample, previous: Option<&Sample>) -> ContactEvent {
        if self.declared {
            return ContactEvent::AlreadyDeclared;
        }
        // The control loop can outpace the sampler; never count the same sample twice.
        if self.last_seen == Some(latest.timestamp) {
            return self.pending();
        }
        self.last_seen = Some(latest.timestamp);

        if self.criteria_hold(latest, previous) {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        if self.consecutive >= self.config.confirmation_count {
            self.declared = true;
            ContactEvent::Declared
        } else {
            self.pending()
        }
    }

    fn pending(&self) -> ContactEvent {
        match self.consecutive {
            0 => ContactEvent::NoContact,
            n => ContactEvent::Confirming(n),
        }
    }

    fn criteria_hold(&self, latest: &Sample, previous: Option<&Sample>) -> bool {
        if !latest.is_mechanically_valid() || latest.force <= self.force_threshold {
            return false;
        }
        match previous.and_then(|previous| instantaneous_stiffness(latest, previous, self.config.min_displacement_step)) {
            Some(stiffness) => stiffness > self.config.stiffness_threshold,
            None => false,
        }
    }
}

/// `ΔF/Δh` from two samples, or `None` if either is unreliable or the displacement barely moved.
pub fn instantaneous_stiffness(latest: &Sample, previous: &Sample, min_displacement_step: f64) -> Option<f64> {
    if !latest.is_mechanically_valid() || !previous.is_mechanically_valid() {
        return None;
    }
    let delta_displacement = latest.displacement - previous.displacement;
    if delta_displacement.abs() < min_displacement_step {
        return None;
    }
    Some((latest.force - previous.force) / delta_displacement)
}
