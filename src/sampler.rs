use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationData, ChannelCalibration};
use crate::channel_guard::ChannelGuard;
use crate::controller_config::{ChannelGuardConfig, ControllerConfig};
use crate::indentation_error::IndentationError;
use crate::indenter_hal::{HalResult, IndenterSensors};
use crate::sample::{Channel, ContactState, Sample, SubstitutedChannels};
use crate::sample_buffer::SampleSink;

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct SensorFaultCounts {
    pub force: u64,
    pub displacement: u64,
    pub temperature: u64,
    pub humidity: u64,
}

impl SensorFaultCounts {
    pub fn total(&self) -> u64 {
        self.force + self.displacement + self.temperature + self.humidity
    }

    fn increment(&mut self, channel: Channel) {
        match channel {
            Channel::Force => self.force += 1,
            Channel::Displacement => self.displacement += 1,
            Channel::Temperature => self.temperature += 1,
            Channel::Humidity => self.humidity += 1,
        }
    }
}

/// Reads, calibrates and validates every channel once per tick; never fails.
pub struct Sampler {
    force_calibration: ChannelCalibration,
    displacement_calibration: ChannelCalibration,
    force_guard: ChannelGuard,
    displacement_guard: ChannelGuard,
    temperature_guard: ChannelGuard,
    humidity_guard: ChannelGuard,
    fault_counts: SensorFaultCounts,
    last_fault: Option<IndentationError>,
}

impl Sampler {
    pub fn new(calibration: &CalibrationData, config: &ControllerConfig) -> Self {
        Self {
            force_calibration: calibration.force,
            displacement_calibration: calibration.displacement,
            force_guard: guard_from(&config.force_guard),
            displacement_guard: guard_from(&config.displacement_guard),
            temperature_guard: guard_from(&config.temperature_guard),
            humidity_guard: guard_from(&config.humidity_guard),
            fault_counts: SensorFaultCounts::default(),
            last_fault: None,
        }
    }

    pub fn fault_counts(&self) -> SensorFaultCounts {
        self.fault_counts
    }

    pub fn last_fault(&self) -> Option<&IndentationError> {
        self.last_fault.as_ref()
    }

    pub fn tick(
        &mut self,
        sensors: &mut dyn IndenterSensors,
        sink: &mut dyn SampleSink,
        timestamp: Duration,
        contact_state: ContactState,
    ) -> Sample {
        let sample = self.read(sensors, timestamp, contact_state);
        sink.push(sample);
        sample
    }

    pub fn read(
        &mut self,
        sensors: &mut dyn IndenterSensors,
        timestamp: Duration,
        contact_state: ContactState,
    ) -> Sample {
        let mut substituted = SubstitutedChannels::default();

        let force_raw = sensors.read_force_raw();
        let force_cal = self.force_calibration;
        let force = self.read_channel(Channel::Force, force_raw.map(|raw| force_cal.apply(raw)), &mut substituted);

        let displacement_raw = sensors.read_displacement_raw();
        let displacement_cal = self.displacement_calibration;
        let displacement = self.read_channel(
            Channel::Displacement,
            displacement_raw.map(|raw| displacement_cal.apply(raw)),
            &mut substituted);

        let temperature_raw = sensors.read_temperature();
        let temperature = self.read_channel(Channel::Temperature, temperature_raw, &mut substituted);
        let humidity_raw = sensors.read_humidity();
        let humidity = self.read_channel(Channel::Humidity, humidity_raw, &mut substituted);

        Sample {
            timestamp,
            force,
            displacement,
            temperature,
            humidity,
            contact_state,
            substituted,
        }
    }

    fn read_channel(&mut self, channel: Channel, reading: HalResult<f64>, substituted: &mut SubstitutedChannels) -> f64 {
        let guard = match channel {
            Channel::Force => &mut self.force_guard,
            Channel::Displacement => &mut self.displacement_guard,
            Channel::Temperature => &mut self.temperature_guard,
            Channel::Humidity => &mut self.humidity_guard,
        };
        let reason = match reading {
            Ok(value) => match guard.update(value) {
                Ok(value) => return value,
                Err(outlier) => outlier.to_string(),
            },
            Err(e) => {
                guard.mark_missing();
                e.to_string()
            }
        };
        let fallback = guard.fallback();
        substituted.mark(channel);
        self.fault_counts.increment(channel);
        warn!("{channel:?} channel fault ({reason}), holding {fallback}");
        self.last_fault = Some(IndentationError::SensorFault { channel, reason });
        fallback
    }
}

fn guard_from(config: &ChannelGuardConfig) -> ChannelGuard {
    ChannelGuard::new(config.sane_range(), config.max_per_sample_delta)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crate::indenter_hal::HalError;
    use crate::sample_buffer::SampleBuffer;

    use super::*;

    struct ScriptedSensors {
        forces: VecDeque<HalResult<f64>>,
        displacements: VecDeque<HalResult<f64>>,
    }

    impl ScriptedSensors {
        fn with_values(forces: Vec<HalResult<f64>>, displacements: Vec<HalResult<f64>>) -> Self {
            Self { forces: forces.into(), displacements: displacements.into() }
        }
    }

    impl IndenterSensors for ScriptedSensors {
        fn read_force_raw(&mut self) -> HalResult<f64> {
            self.forces.pop_front().unwrap()
        }

        fn read_displacement_raw(&mut self) -> HalResult<f64> {
            self.displacements.pop_front().unwrap()
        }

        fn read_temperature(&mut self) -> HalResult<f64> {
            Ok(23.0)
        }

        fn read_humidity(&mut self) -> HalResult<f64> {
            Ok(40.0)
        }
    }

    fn dropout() -> HalResult<f64> {
        Err(HalError::InternalError("bus timeout".to_owned()))
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_applies_calibration_and_appends() {
        let calibration = CalibrationData {
            force: ChannelCalibration { scale: 2.0, offset: 10.0 },
            displacement: ChannelCalibration { scale: 0.5, offset: -4.0 },
            ..Default::default()
        };
        let mut sampler = Sampler::new(&calibration, &ControllerConfig::default());
        let mut sensors = ScriptedSensors::with_values(vec![Ok(110.0)], vec![Ok(16.0)]);
        let mut buffer = SampleBuffer::with_capacity(4);

        let sample = sampler.tick(&mut sensors, &mut buffer, ms(1), ContactState::Loading);

        assert_eq!(sample.force, 200.0);
        assert_eq!(sample.displacement, 10.0);
        assert_eq!(sample.temperature, 23.0);
        assert_eq!(sample.humidity, 40.0);
        assert_eq!(sample.contact_state, ContactState::Loading);
        assert!(!sample.substituted.any());
        assert_eq!(buffer.latest(), Some(&sample));
    }

    #[test]
    fn test_failed_read_holds_previous_value_and_counts() {
        let mut sampler = Sampler::new(&CalibrationData::default(), &ControllerConfig::default());
        let mut sensors = ScriptedSensors::with_values(
            vec![Ok(5.0), dropout(), Ok(7.0)],
            vec![Ok(1.0), Ok(2.0), Ok(3.0)]);
        let mut buffer = SampleBuffer::with_capacity(4);

        sampler.tick(&mut sensors, &mut buffer, ms(1), ContactState::NoContact);
        let held = sampler.tick(&mut sensors, &mut buffer, ms(2), ContactState::NoContact);
        let fresh = sampler.tick(&mut sensors, &mut buffer, ms(3), ContactState::NoContact);

        assert_eq!(held.force, 5.0);
        assert!(held.substituted.force);
        assert!(!held.substituted.displacement);
        assert_eq!(held.displacement, 2.0);
        assert_eq!(fresh.force, 7.0);
        assert!(!fresh.substituted.any());
        assert_eq!(sampler.fault_counts(), SensorFaultCounts { force: 1, ..Default::default() });
        assert!(matches!(
            sampler.last_fault(),
            Some(IndentationError::SensorFault { channel: Channel::Force, .. })));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_out_of_range_reading_is_substituted() {
        let config = ControllerConfig {
            displacement_guard: ChannelGuardConfig::range(-100.0, 100.0),
            ..Default::default()
        };
        let mut sampler = Sampler::new(&CalibrationData::default(), &config);
        let mut sensors = ScriptedSensors::with_values(
            vec![Ok(1.0), Ok(1.0)],
            vec![Ok(50.0), Ok(5000.0)]);
        let mut buffer = SampleBuffer::with_capacity(4);

        sampler.tick(&mut sensors, &mut buffer, ms(1), ContactState::NoContact);
        let sample = sampler.tick(&mut sensors, &mut buffer, ms(2), ContactState::NoContact);

        assert_eq!(sample.displacement, 50.0);
        assert!(sample.substituted.displacement);
        assert_eq!(sampler.fault_counts().displacement, 1);
        assert_eq!(sampler.fault_counts().total(), 1);
    }

    #[test]
    fn test_fault_before_any_valid_reading_falls_back_to_zero() {
        let mut sampler = Sampler::new(&CalibrationData::default(), &ControllerConfig::default());
        let mut sensors = ScriptedSensors::with_values(vec![dropout()], vec![Ok(3.0)]);
        let sample = sampler.read(&mut sensors, ms(0), ContactState::NoContact);
        assert_eq!(sample.force, 0.0);
        assert!(sample.substituted.force);
        assert!(!sample.is_mechanically_valid());
    }
}
