use std::marker::PhantomData;

use pid::Pid;
use serde::{Deserialize, Serialize};

use crate::controller_config::PidGains;
use crate::sample::{Channel, Sample};
use crate::test_parameters::ControlMode;

/// Selects which sample channel a controller instance regulates.
pub trait ControlAxis {
    const MODE: ControlMode;

    /// The measured value, or `None` if the sampler had to substitute it.
    fn measure(sample: &Sample) -> Option<f64>;
}

pub struct Force;

pub struct Displacement;

impl ControlAxis for Force {
    const MODE: ControlMode = ControlMode::Force;

    fn measure(sample: &Sample) -> Option<f64> {
        sample.is_fresh(Channel::Force).then(|| sample.force)
    }
}

impl ControlAxis for Displacement {
    const MODE: ControlMode = ControlMode::Displacement;

    fn measure(sample: &Sample) -> Option<f64> {
        sample.is_fresh(Channel::Displacement).then(|| sample.displacement)
    }
}

/// The terms of the last control step in drive units, and the measurement the next derivative
/// is taken against.
#[derive(Debug, Default, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct PidState {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub previous_measurement: Option<f64>,
}

pub type ForcePid = PidController<Force>;
pub type DisplacementPid = PidController<Displacement>;

/// `pid::Pid` run at a fixed tick period.  The period is folded into the integral and
/// derivative gains, every term is limited to the larger drive magnitude (which bounds the
/// integrator), and the sum is then clamped to `[min_drive, max_drive]`.
pub struct PidController<A: ControlAxis> {
    pid: Pid<f64>,
    gains: PidGains,
    period: f64,
    state: PidState,
    last_output: f64,
    _axis: PhantomData<A>,
}

impl<A: ControlAxis> PidController<A> {
    /// `period` is the control tick in seconds and must be positive.
    pub fn new(gains: PidGains, period: f64) -> Self {
        Self {
            pid: discrete_pid(&gains, period),
            gains,
            period,
            state: PidState::default(),
            last_output: clamp_drive(0.0, &gains),
            _axis: PhantomData,
        }
    }

    pub fn mode(&self) -> ControlMode {
        A::MODE
    }

    pub fn state(&self) -> PidState {
        self.state
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    /// Clears the integral and the derivative history.
    pub fn reset(&mut self) {
        self.pid = discrete_pid(&self.gains, self.period);
        self.state = PidState::default();
        self.last_output = clamp_drive(0.0, &self.gains);
    }

    pub fn update(&mut self, setpoint: f64, sample: &Sample) -> f64 {
        self.update_measured(setpoint, A::measure(sample))
    }

    /// One control step.  Holds the previous output, leaving the controller untouched, when
    /// `measured` is missing or the inputs don't produce a finite error.
    pub fn update_measured(&mut self, setpoint: f64, measured: Option<f64>) -> f64 {
        let measured = match measured {
            Some(measured) if (setpoint - measured).is_finite() => measured,
            _ => return self.last_output,
        };
        self.pid.setpoint = setpoint;
        let control = self.pid.next_control_output(measured);
        self.state = PidState {
            proportional: control.p,
            integral: control.i,
            derivative: control.d,
            previous_measurement: Some(measured),
        };
        self.last_output = clamp_drive(control.output, &self.gains);
        self.last_output
    }
}

fn discrete_pid(gains: &PidGains, period: f64) -> Pid<f64> {
    let limit = gains.min_drive.abs().max(gains.max_drive.abs());
    Pid::new(gains.kp, gains.ki * period, gains.kd / period, limit, limit, limit, limit, 0.0)
}

/// Unlike `f64::clamp` this never panics, and a NaN input lands on `min_drive`.
fn clamp_drive(value: f64, gains: &PidGains) -> f64 {
    value.max(gains.min_drive).min(gains.max_drive)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const PERIOD: f64 = 0.001;

    fn gains(kp: f64, ki: f64, kd: f64) -> PidGains {
        PidGains { kp, ki, kd, min_drive: -1.0, max_drive: 1.0 }
    }

    #[test]
    fn test_proportional_response() {
        let mut pid = ForcePid::new(gains(0.1, 0.0, 0.0), PERIOD);
        assert!((pid.update_measured(5.0, Some(2.0)) - 0.3).abs() < 1e-12);
        assert!((pid.update_measured(0.0, Some(4.0)) + 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_axis_selects_channel() {
        let sample = Sample::new(Duration::ZERO, 10.0, 250.0);
        let wide = PidGains { min_drive: -1000.0, max_drive: 1000.0, ..gains(1.0, 0.0, 0.0) };
        let mut force = ForcePid::new(wide, PERIOD);
        let mut displacement = DisplacementPid::new(wide, PERIOD);
        assert_eq!(force.update(15.0, &sample), 5.0);
        assert_eq!(displacement.update(255.0, &sample), 5.0);
        assert_eq!(force.mode(), ControlMode::Force);
        assert_eq!(displacement.mode(), ControlMode::Displacement);
    }

    #[test]
    fn test_output_always_within_drive_limits() {
        let mut rng = StdRng::seed_from_u64(0x1dea);
        let limits = PidGains { kp: 3.0, ki: 50.0, kd: 0.2, min_drive: -0.25, max_drive: 0.75 };
        let mut pid = DisplacementPid::new(limits, 0.004);
        let specials = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, f64::MAX, f64::MIN, 0.0];
        for i in 0..20_000 {
            let setpoint = if i % 97 == 0 { specials[i % specials.len()] } else { rng.gen_range(-1.0e6..1.0e6) };
            let measured = if i % 89 == 0 { None } else { Some(rng.gen_range(-1.0e6..1.0e6)) };
            let output = pid.update_measured(setpoint, measured);
            assert!(
                (limits.min_drive..=limits.max_drive).contains(&output),
                "output {output} escaped limits at iteration {i}");
        }
    }

    #[test]
    fn test_invalid_measurement_holds_previous_output() {
        let mut pid = ForcePid::new(gains(0.5, 0.0, 0.0), PERIOD);
        let output = pid.update_measured(1.0, Some(0.0));
        let state = pid.state();
        assert_eq!(pid.update_measured(100.0, None), output);
        assert_eq!(pid.update_measured(f64::NAN, Some(0.0)), output);
        assert_eq!(pid.state(), state);

        let mut sample = Sample::new(Duration::ZERO, 0.2, 0.0);
        sample.substituted.force = true;
        assert_eq!(pid.update(50.0, &sample), output);
    }

    #[test]
    fn test_integrator_bounded_while_saturated() {
        let mut pid = ForcePid::new(gains(1.0, 10.0, 0.0), 0.01);
        for _ in 0..100 {
            assert_eq!(pid.update_measured(10.0, Some(0.0)), 1.0);
        }
        assert_eq!(pid.state().integral, 1.0);

        // A reversed error unwinds from the bound, not from a thousand steps of accumulation.
        let output = pid.update_measured(0.0, Some(0.5));
        assert!((output - (-0.5 + 1.0 - 10.0 * 0.01 * 0.5)).abs() < 1e-12, "got {output}");
    }

    #[test]
    fn test_integrates_when_not_saturated() {
        let mut pid = ForcePid::new(gains(0.0, 2.0, 0.0), 0.1);
        pid.update_measured(1.0, Some(0.0));
        pid.update_measured(1.0, Some(0.0));
        assert!((pid.state().integral - 0.4).abs() < 1e-12);
        assert!((pid.last_output() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_derivative_opposes_measurement_change() {
        let mut pid = ForcePid::new(gains(0.0, 0.0, 0.01), 0.1);
        assert_eq!(pid.update_measured(5.0, Some(0.0)), 0.0);
        let output = pid.update_measured(5.0, Some(2.0));
        assert!((output + 0.2).abs() < 1e-12, "got {output}");
    }

    #[test]
    fn test_asymmetric_limits_clamp_after_the_terms() {
        let limits = PidGains { min_drive: 0.0, max_drive: 0.5, ..gains(1.0, 0.0, 0.0) };
        let mut pid = DisplacementPid::new(limits, PERIOD);
        assert_eq!(pid.update_measured(0.0, Some(0.3)), 0.0);
        assert_eq!(pid.update_measured(0.3, Some(0.0)), 0.3);
        assert_eq!(pid.update_measured(2.0, Some(0.0)), 0.5);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = ForcePid::new(gains(0.0, 1.0, 0.0), 0.5);
        pid.update_measured(1.0, Some(0.0));
        assert!(pid.state().integral > 0.0);
        pid.reset();
        assert_eq!(pid.state(), PidState::default());
        assert_eq!(pid.last_output(), 0.0);
        let output = pid.update_measured(1.0, Some(0.0));
        assert!((output - 0.5).abs() < 1e-12, "integral carried over reset: {output}");
    }

    #[test]
    fn test_reset_forgets_previous_measurement() {
        let mut pid = ForcePid::new(gains(0.0, 0.0, 0.01), 0.1);
        pid.update_measured(5.0, Some(0.0));
        assert_eq!(pid.state().previous_measurement, Some(0.0));
        pid.reset();
        // No derivative kick from the jump across the reset.
        assert_eq!(pid.update_measured(5.0, Some(3.0)), 0.0);
    }
}
