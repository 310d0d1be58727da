use anyhow::anyhow;
use futures_signals::signal::Mutable;
use log::{debug, info, warn};
use tokio::sync;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::calibration::CalibrationData;
use crate::controller_config::ControllerConfig;
use crate::indentation_error::IndentationError;
use crate::indenter_hal::{emergency_stop_engaged, IndenterActuator, IndenterHal, IndenterSensors, SafetyInput};
use crate::property_extractor::PropertyExtractor;
use crate::sample::Sample;
use crate::sample_buffer::{self, SampleReader, SampleWriter};
use crate::sampler::Sampler;
use crate::test_parameters::TestParameters;
use crate::test_sequencer::{ControllerState, Termination, TestSequencer, TickInput, TickOutcome};
use crate::test_session::TestOutcome;

const SAMPLE_BROADCAST_CAPACITY: usize = 1024;

struct SamplingParts {
  sensors: Box<dyn IndenterSensors + Send>,
  sampler: Sampler,
}

struct ControlParts {
  sequencer: TestSequencer,
  actuator: Box<dyn IndenterActuator + Send>,
  safety: Box<dyn SafetyInput + Send>,
  termination: Option<Termination>,
}

/// A test in progress on the tokio runtime.  Sampling and control are separate periodic tasks
/// that only meet at the sample buffer and the published status.
pub struct RunningTest {
  pub status: Mutable<ControllerState>,
  samples: broadcast::Sender<Sample>,
  reader: SampleReader,
  extractor: PropertyExtractor,
  sampling: JoinHandle<SamplingParts>,
  control: JoinHandle<ControlParts>,
  sampling_shutdown: UnboundedSender<()>,
  control_shutdown: UnboundedSender<()>,
}

impl RunningTest {
  pub fn start(
    hal: IndenterHal,
    params: TestParameters,
    calibration: &CalibrationData,
    config: &ControllerConfig,
  ) -> Result<Self, IndentationError> {
    let extractor = PropertyExtractor::new(&params, calibration);
    let capacity = config.buffer_capacity_for(&params)?;
    info!("Starting test: {params:?}");
    let sequencer = TestSequencer::new(params, config)?;
    let sampler = Sampler::new(calibration, config);
    let sample_period = Duration::from_secs_f64(config.sample_period_secs());
    let control_period = Duration::from_secs_f64(config.control_period_secs());

    let status = Mutable::new(sequencer.state().clone());
    let (writer, reader) = sample_buffer::shared(capacity);
    let (samples, _) = broadcast::channel(SAMPLE_BROADCAST_CAPACITY);
    let (sampling_shutdown, sampling_shutdown_rx) = sync::mpsc::unbounded_channel::<()>();
    let (control_shutdown, control_shutdown_rx) = sync::mpsc::unbounded_channel::<()>();

    let IndenterHal { sensors, actuator, safety } = hal;
    let sampling = tokio::spawn(run_sampling_loop(
      SamplingParts { sensors, sampler },
      writer,
      status.clone(),
      samples.clone(),
      sample_period,
      sampling_shutdown_rx));
    let control = tokio::spawn(run_control_loop(
      ControlParts { sequencer, actuator, safety, termination: None },
      reader.clone(),
      status.clone(),
      control_period,
      control_shutdown_rx));

    Ok(Self {
      status,
      samples,
      reader,
      extractor,
      sampling,
      control,
      sampling_shutdown,
      control_shutdown,
    })
  }

  /// Every committed sample from now on.  A receiver that falls behind skips ahead.
  pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
    self.samples.subscribe()
  }

  pub fn reader(&self) -> SampleReader {
    self.reader.clone()
  }

  /// Wait for the sequencer to reach a terminal phase, stop sampling and analyse the curve.
  pub async fn finish(self) -> anyhow::Result<(TestOutcome, IndenterHal)> {
    let control = self.control.await?;
    let _ = self.sampling_shutdown.send(());
    let sampling = self.sampling.await?;
    drop(self.control_shutdown);

    let termination = control
      .termination
      .ok_or_else(|| anyhow!("control loop stopped before the test finished"))?;
    let overwritten = self.reader.overwritten();
    let samples = self.reader.into_samples();
    let outcome = TestOutcome::assemble(
      termination,
      control.sequencer,
      &self.extractor,
      samples,
      sampling.sampler.fault_counts(),
      overwritten);
    let hal = IndenterHal {
      sensors: sampling.sensors,
      actuator: control.actuator,
      safety: control.safety,
    };
    Ok((outcome, hal))
  }

  /// Zero the actuator and stop both tasks without waiting for the test to end.
  pub fn cancel(&self) {
    let _ = self.control_shutdown.send(());
    let _ = self.sampling_shutdown.send(());
  }
}

async fn run_sampling_loop(
    mut parts: SamplingParts,
    mut writer: SampleWriter,
    status: Mutable<ControllerState>,
    samples: broadcast::Sender<Sample>,
    period: Duration,
    mut shutdown: UnboundedReceiver<()>) -> SamplingParts {
  let start = Instant::now();
  let mut interval = interval(period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = interval.tick() => {
        let contact_state = status.lock_ref().phase.contact_state();
        let sample = parts.sampler.tick(&mut *parts.sensors, &mut writer, start.elapsed(), contact_state);
        // No subscribers is fine.
        let _ = samples.send(sample);
      },
      _ = shutdown.recv() => {
        debug!("Sampling stopped");
        return parts;
      },
    }
  }
}

async fn run_control_loop(
    mut parts: ControlParts,
    reader: SampleReader,
    status: Mutable<ControllerState>,
    period: Duration,
    mut shutdown: UnboundedReceiver<()>) -> ControlParts {
  let mut interval = interval(period);
  interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = interval.tick() => {
        let (latest, previous) = match reader.latest_pair() {
          Some(pair) => pair,
          None => continue,
        };
        let input = TickInput {
          latest: &latest,
          previous: previous.as_ref(),
          emergency_stop: emergency_stop_engaged(parts.safety.as_ref()),
        };
        let outcome = parts.sequencer.tick(input, &mut *parts.actuator);
        status.set(parts.sequencer.state().clone());
        if let TickOutcome::Finished(termination) = outcome {
          parts.termination = Some(termination);
          return parts;
        }
      },
      _ = shutdown.recv() => {
        warn!("Control loop cancelled in {:?}", parts.sequencer.phase());
        if let Err(e) = parts.actuator.apply_drive(0.0) {
          warn!("Could not zero the actuator: {e}");
        }
        return parts;
      },
    }
  }
}
