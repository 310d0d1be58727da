use std::time::Duration;

use conv::{ConvUtil, RoundToNearest};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::contact_detector::{ContactDetector, ContactEvent};
use crate::controller_config::ControllerConfig;
use crate::indentation_error::IndentationError;
use crate::indenter_hal::IndenterActuator;
use crate::pid_controller::{DisplacementPid, ForcePid, PidState};
use crate::sample::{Channel, ContactState, Sample};
use crate::test_parameters::{ControlMode, TestParameters};

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum Phase {
    Approach,
    ContactEstablishment,
    Loading,
    Hold,
    Unloading,
    Complete,
    Aborted,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Approach
    }
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted)
    }

    pub fn contact_state(&self) -> ContactState {
        match self {
            Phase::Approach | Phase::Complete | Phase::Aborted => ContactState::NoContact,
            Phase::ContactEstablishment | Phase::Hold => ContactState::Stable,
            Phase::Loading => ContactState::Loading,
            Phase::Unloading => ContactState::Unloading,
        }
    }

    /// Position in the nominal sequence.  `Aborted` shares the last slot since it may follow any phase.
    pub fn ordinal(&self) -> usize {
        match self {
            Phase::Approach => 0,
            Phase::ContactEstablishment => 1,
            Phase::Loading => 2,
            Phase::Hold => 3,
            Phase::Unloading => 4,
            Phase::Complete | Phase::Aborted => 5,
        }
    }
}

/// Snapshot of everything the sequencer decides with, published for status display.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ControllerState {
    pub phase: Phase,
    pub mode: ControlMode,
    /// In µN for force mode.  In displacement mode this is the absolute stage position during
    /// approach and the depth below the surface afterwards.
    pub setpoint: f64,
    pub drive: f64,
    pub force_pid: PidState,
    pub displacement_pid: PidState,
    pub contact_confirmations: u32,
    pub emergency: bool,
    pub surface_displacement: Option<f64>,
    pub elapsed: Duration,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            phase: Phase::Approach,
            mode: ControlMode::Displacement,
            setpoint: 0.0,
            drive: 0.0,
            force_pid: PidState::default(),
            displacement_pid: PidState::default(),
            contact_confirmations: 0,
            emergency: false,
            surface_displacement: None,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: Phase,
    /// Control tick (1-based) on which the phase was entered; 0 for the initial phase.
    pub tick: u64,
    pub elapsed: Duration,
}

pub struct TickInput<'a> {
    pub latest: &'a Sample,
    pub previous: Option<&'a Sample>,
    pub emergency_stop: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Termination {
    Complete,
    Aborted(IndentationError),
}

#[derive(Debug, PartialEq, Clone)]
pub enum TickOutcome {
    Running(Phase),
    Finished(Termination),
}

pub struct TestSequencer {
    params: TestParameters,
    detector: ContactDetector,
    force_pid: ForcePid,
    displacement_pid: DisplacementPid,
    tick_period: f64,
    unload_zero_tolerance: f64,
    surface_force_tolerance: f64,
    approach_timeout_ticks: u64,
    hold_ticks: u64,
    state: ControllerState,
    trace: Vec<PhaseChange>,
    ticks: u64,
    phase_ticks: u64,
    approach_started: bool,
    surface_candidate: Option<f64>,
    establishment_target: f64,
    termination: Option<Termination>,
}

impl TestSequencer {
    pub fn new(params: TestParameters, config: &ControllerConfig) -> Result<Self, IndentationError> {
        params.validate()?;
        config.validate()?;
        let tick_period = config.control_period_secs();
        let approach_timeout_ticks = ticks_for(params.approach_timeout_secs, tick_period)?;
        let hold_ticks = ticks_for(params.hold_duration_secs, tick_period)?;
        debug!(
            "Sequencer at {} Hz: approach timeout {approach_timeout_ticks} ticks, hold {hold_ticks} ticks",
            config.control_rate_hz());
        Ok(Self {
            detector: ContactDetector::new(config.contact, params.contact_force_threshold),
            force_pid: ForcePid::new(config.force_pid, tick_period),
            displacement_pid: DisplacementPid::new(config.displacement_pid, tick_period),
            tick_period,
            unload_zero_tolerance: config.unload_zero_tolerance,
            surface_force_tolerance: config.contact.surface_force_tolerance,
            approach_timeout_ticks,
            hold_ticks,
            state: ControllerState::default(),
            trace: vec![PhaseChange { phase: Phase::Approach, tick: 0, elapsed: Duration::ZERO }],
            ticks: 0,
            phase_ticks: 0,
            approach_started: false,
            surface_candidate: None,
            establishment_target: 0.0,
            termination: None,
            params,
        })
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn trace(&self) -> &[PhaseChange] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<PhaseChange> {
        self.trace
    }

    pub fn surface_displacement(&self) -> Option<f64> {
        self.state.surface_displacement
    }

    pub fn params(&self) -> &TestParameters {
        &self.params
    }

    pub fn tick(&mut self, input: TickInput<'_>, actuator: &mut dyn IndenterActuator) -> TickOutcome {
        if let Some(termination) = &self.termination {
            return TickOutcome::Finished(termination.clone());
        }
        self.ticks += 1;
        self.phase_ticks += 1;
        self.state.elapsed = self.elapsed();

        if let Some(e) = self.emergency_condition(&input) {
            self.state.emergency = true;
            return self.abort(e, actuator);
        }

        let latest = input.latest;
        self.advance_setpoint(latest);
        let drive = self.control(latest);
        if let Err(e) = actuator.apply_drive(drive) {
            return self.abort(IndentationError::ActuatorFault(e), actuator);
        }
        self.state.drive = drive;
        self.state.force_pid = self.force_pid.state();
        self.state.displacement_pid = self.displacement_pid.state();
        trace!(
            "tick {} {:?}: setpoint {:.4} force {:.4} displacement {:.4} drive {:.4}",
            self.ticks, self.state.phase, self.state.setpoint, latest.force, latest.displacement, drive);

        self.evaluate_transition(latest, input.previous, actuator)
    }

    fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.ticks as f64 * self.tick_period)
    }

    fn emergency_condition(&self, input: &TickInput<'_>) -> Option<IndentationError> {
        if input.emergency_stop {
            return Some(IndentationError::EmergencyStop { phase: self.state.phase });
        }
        let latest = input.latest;
        if latest.is_fresh(Channel::Force) && latest.force > self.params.safety_force_limit {
            return Some(IndentationError::ForceLimitExceeded {
                force: latest.force,
                limit: self.params.safety_force_limit,
            });
        }
        let seeking_contact = matches!(self.state.phase, Phase::Approach | Phase::ContactEstablishment);
        if seeking_contact && self.ticks > self.approach_timeout_ticks {
            return Some(IndentationError::ContactTimeout(self.params.approach_timeout()));
        }
        None
    }

    fn advance_setpoint(&mut self, latest: &Sample) {
        let step = self.tick_period;
        match self.state.phase {
            Phase::Approach => {
                if !self.approach_started {
                    self.state.setpoint = latest.displacement;
                    self.approach_started = true;
                }
                self.state.setpoint += self.params.approach_speed * step;
            }
            Phase::ContactEstablishment => self.state.setpoint = self.establishment_target,
            Phase::Loading => {
                let target = self.params.loading_target();
                self.state.setpoint = (self.state.setpoint + self.params.loading_rate * step).min(target);
            }
            Phase::Hold => {}
            Phase::Unloading => {
                self.state.setpoint = (self.state.setpoint - self.params.unloading_rate * step).max(0.0);
            }
            Phase::Complete | Phase::Aborted => {}
        }
    }

    /// Displacement setpoints past contact are depths; the PID works on absolute positions.
    fn reference(&self) -> f64 {
        match self.state.phase {
            Phase::Approach | Phase::ContactEstablishment => 0.0,
            _ => self.state.surface_displacement.unwrap_or(0.0),
        }
    }

    fn control(&mut self, latest: &Sample) -> f64 {
        match self.state.mode {
            ControlMode::Force => self.force_pid.update(self.state.setpoint, latest),
            ControlMode::Displacement => {
                let setpoint = self.state.setpoint + self.reference();
                self.displacement_pid.update(setpoint, latest)
            }
        }
    }

    fn evaluate_transition(
        &mut self,
        latest: &Sample,
        previous: Option<&Sample>,
        actuator: &mut dyn IndenterActuator,
    ) -> TickOutcome {
        match self.state.phase {
            Phase::Approach => {
                if latest.is_mechanically_valid() && latest.force <= self.surface_force_tolerance {
                    self.surface_candidate = Some(latest.displacement);
                }
                let event = self.detector.update(latest, previous);
                self.state.contact_confirmations = self.detector.confirmations();
                if event == ContactEvent::Declared {
                    let surface = match self.surface_candidate {
                        Some(surface) => surface,
                        None => {
                            warn!("No unloaded sample seen during approach, taking contact point as surface");
                            latest.displacement
                        }
                    };
                    info!("Contact at {:.3} nm, surface at {surface:.3} nm", latest.displacement);
                    self.state.surface_displacement = Some(surface);
                    self.establishment_target = latest.displacement + self.params.contact_establishment_depth;
                    self.state.setpoint = self.establishment_target;
                    self.enter(Phase::ContactEstablishment);
                }
            }
            Phase::ContactEstablishment => {
                let settled = latest.is_fresh(Channel::Displacement)
                    && (latest.displacement - self.establishment_target).abs()
                        <= self.params.contact_establishment_tolerance;
                if settled {
                    self.start_loading(latest);
                }
            }
            Phase::Loading => {
                if self.state.setpoint >= self.params.loading_target() {
                    self.enter(Phase::Hold);
                }
            }
            Phase::Hold => {
                if self.phase_ticks >= self.hold_ticks {
                    self.enter(Phase::Unloading);
                }
            }
            Phase::Unloading => {
                if self.state.setpoint <= self.unload_zero_tolerance {
                    return self.complete(actuator);
                }
            }
            Phase::Complete | Phase::Aborted => {}
        }
        TickOutcome::Running(self.state.phase)
    }

    fn start_loading(&mut self, latest: &Sample) {
        self.force_pid.reset();
        self.displacement_pid.reset();
        self.state.mode = self.params.control_mode;
        self.state.setpoint = match self.params.control_mode {
            ControlMode::Force => latest.force.max(0.0),
            ControlMode::Displacement => (latest.displacement - self.reference_after_contact()).max(0.0),
        };
        self.enter(Phase::Loading);
    }

    fn reference_after_contact(&self) -> f64 {
        self.state.surface_displacement.unwrap_or(0.0)
    }

    fn enter(&mut self, phase: Phase) {
        info!("{:?} -> {phase:?} after {:?}", self.state.phase, self.state.elapsed);
        self.state.phase = phase;
        self.phase_ticks = 0;
        self.trace.push(PhaseChange { phase, tick: self.ticks, elapsed: self.state.elapsed });
    }

    fn complete(&mut self, actuator: &mut dyn IndenterActuator) -> TickOutcome {
        if let Err(e) = actuator.apply_drive(0.0) {
            return self.abort(IndentationError::ActuatorFault(e), actuator);
        }
        self.state.drive = 0.0;
        self.enter(Phase::Complete);
        self.finish(Termination::Complete)
    }

    fn abort(&mut self, e: IndentationError, actuator: &mut dyn IndenterActuator) -> TickOutcome {
        warn!("Aborting test in {:?}: {e}", self.state.phase);
        if let Err(drive_error) = actuator.apply_drive(0.0) {
            error!("Could not zero the actuator while aborting: {drive_error}");
        }
        self.state.drive = 0.0;
        self.enter(Phase::Aborted);
        self.finish(Termination::Aborted(e))
    }

    fn finish(&mut self, termination: Termination) -> TickOutcome {
        debug!("Final controller state: {:?}", self.state);
        self.termination = Some(termination.clone());
        TickOutcome::Finished(termination)
    }
}

fn ticks_for(seconds: f64, tick_period: f64) -> Result<u64, IndentationError> {
    (seconds / tick_period)
        .approx_as_by::<u64, RoundToNearest>()
        .map_err(|e| IndentationError::InvalidParameters(format!("{seconds} s is not a usable tick count: {e}")))
}
