use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::calibration::CalibrationData;
use crate::controller_config::ControllerConfig;
use crate::indentation_error::IndentationError;
use crate::indenter_hal::IndenterHal;
use crate::property_extractor::{MaterialProperties, PropertyExtractor};
use crate::sample::Sample;
use crate::sample_buffer::SampleBuffer;
use crate::sampler::{SensorFaultCounts, Sampler};
use crate::test_parameters::TestParameters;
use crate::test_sequencer::{ControllerState, PhaseChange, Termination, TestSequencer, TickInput, TickOutcome};

/// Everything a finished test produced.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub termination: Termination,
    /// `None` unless the test completed.  A completed test whose curve can't be analysed carries
    /// the analysis error here.
    pub properties: Option<Result<MaterialProperties, IndentationError>>,
    pub samples: Vec<Sample>,
    pub trace: Vec<PhaseChange>,
    /// Surface seen during approach.  The analysis refines it from the loading branch, see
    /// [`MaterialProperties::surface_displacement`].
    pub surface_displacement: Option<f64>,
    pub sensor_faults: SensorFaultCounts,
    pub overwritten_samples: u64,
    pub final_state: ControllerState,
}

impl TestOutcome {
    pub(crate) fn assemble(
        termination: Termination,
        sequencer: TestSequencer,
        extractor: &PropertyExtractor,
        samples: Vec<Sample>,
        sensor_faults: SensorFaultCounts,
        overwritten_samples: u64,
    ) -> Self {
        let surface_displacement = sequencer.surface_displacement();
        let final_state = sequencer.state().clone();
        let properties = match (&termination, surface_displacement) {
            (Termination::Complete, Some(surface)) => {
                if overwritten_samples > 0 {
                    warn!("{overwritten_samples} samples were overwritten, analysing the retained tail only");
                }
                Some(extractor.extract(&samples, extractor.locate_surface(&samples, surface)))
            }
            (Termination::Complete, None) => Some(Err(IndentationError::NonPhysicalResult(
                "test completed without a surface reference".to_owned()))),
            (Termination::Aborted(_), _) => None,
        };
        match &termination {
            Termination::Complete => info!("Test complete after {:?}, {} samples", final_state.elapsed, samples.len()),
            Termination::Aborted(e) => warn!("Test aborted after {:?}: {e}", final_state.elapsed),
        }
        if sensor_faults.total() > 0 {
            warn!("Sensor faults during test: {sensor_faults:?}");
        }
        Self {
            termination,
            properties,
            samples,
            trace: sequencer.into_trace(),
            surface_displacement,
            sensor_faults,
            overwritten_samples,
            final_state,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::Complete
    }

    pub fn report(&self) -> OutcomeReport {
        let (properties, analysis_error) = match &self.properties {
            Some(Ok(properties)) => (Some(*properties), None),
            Some(Err(e)) => (None, Some(e.to_string())),
            None => (None, None),
        };
        OutcomeReport {
            completed: self.is_complete(),
            abort_reason: match &self.termination {
                Termination::Complete => None,
                Termination::Aborted(e) => Some(e.to_string()),
            },
            properties,
            analysis_error,
            trace: self.trace.clone(),
            surface_displacement: self.surface_displacement,
            sensor_faults: self.sensor_faults,
            sample_count: self.samples.len(),
            overwritten_samples: self.overwritten_samples,
        }
    }
}

/// Serializable summary of a [`TestOutcome`], without the raw samples.
#[derive(Debug, PartialEq, Clone, Serialize)]
pub struct OutcomeReport {
    pub completed: bool,
    pub abort_reason: Option<String>,
    pub properties: Option<MaterialProperties>,
    pub analysis_error: Option<String>,
    pub trace: Vec<PhaseChange>,
    pub surface_displacement: Option<f64>,
    pub sensor_faults: SensorFaultCounts,
    pub sample_count: usize,
    pub overwritten_samples: u64,
}

impl OutcomeReport {
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

pub fn save_samples(samples: &[Sample], path: impl AsRef<Path>) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, samples)?;
    Ok(())
}

/// Runs a whole test on the calling thread against a virtual clock: one sampler tick per
/// sample period, one sequencer tick every `control_divider` samples.
pub struct IndentationSession {
    hal: IndenterHal,
    sampler: Sampler,
    sequencer: TestSequencer,
    extractor: PropertyExtractor,
    buffer: SampleBuffer,
    sample_period: f64,
    control_divider: u64,
}

impl IndentationSession {
    pub fn new(
        hal: IndenterHal,
        params: TestParameters,
        calibration: &CalibrationData,
        config: &ControllerConfig,
    ) -> Result<Self, IndentationError> {
        let extractor = PropertyExtractor::new(&params, calibration);
        let capacity = config.buffer_capacity_for(&params)?;
        let sequencer = TestSequencer::new(params, config)?;
        Ok(Self {
            hal,
            sampler: Sampler::new(calibration, config),
            sequencer,
            extractor,
            buffer: SampleBuffer::with_capacity(capacity),
            sample_period: config.sample_period_secs(),
            control_divider: u64::from(config.control_divider.max(1)),
        })
    }

    pub fn run(mut self) -> (TestOutcome, IndenterHal) {
        info!("Starting test: {:?}", self.sequencer.params());
        let mut sample_ticks: u64 = 0;
        let termination = loop {
            let timestamp = Duration::from_secs_f64(sample_ticks as f64 * self.sample_period);
            let contact_state = self.sequencer.phase().contact_state();
            let latest = self.sampler.tick(&mut *self.hal.sensors, &mut self.buffer, timestamp, contact_state);
            sample_ticks += 1;
            if sample_ticks % self.control_divider != 0 {
                continue;
            }
            let previous = self.buffer.nth_latest(1).copied();
            let input = TickInput {
                latest: &latest,
                previous: previous.as_ref(),
                emergency_stop: self.hal.emergency_stop_engaged(),
            };
            if let TickOutcome::Finished(termination) = self.sequencer.tick(input, &mut *self.hal.actuator) {
                break termination;
            }
        };

        let overwritten = self.buffer.overwritten();
        let outcome = TestOutcome::assemble(
            termination,
            self.sequencer,
            &self.extractor,
            self.buffer.into_vec(),
            self.sampler.fault_counts(),
            overwritten);
        (outcome, self.hal)
    }
}
