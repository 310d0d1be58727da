use std::f64::consts::PI;
use std::ops::RangeInclusive;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationData;
use crate::indentation_error::IndentationError;
use crate::sample::Sample;
use crate::test_parameters::{IndenterDescriptor, TestParameters};

pub const GPA_PER_UN_PER_NM2: f64 = 1000.0;
pub const DEFAULT_MIN_SEGMENT_SAMPLES: usize = 10;

/// Unloading segment bounds as fractions of the peak force.
const SEGMENT_UPPER_FRACTION: f64 = 0.9;
const SEGMENT_LOWER_FRACTION: f64 = 0.001;

/// Loading samples used to locate the surface, as fractions of the peak force.
const ONSET_LOWER_FRACTION: f64 = 0.02;
const ONSET_UPPER_FRACTION: f64 = 0.5;
/// Power-law exponents accepted for the initial loading curve.  A flat punch gives 1, a sphere
/// 1.5 and a pyramid 2.
const ONSET_EXPONENTS: RangeInclusive<f64> = 0.9..=3.0;
const ONSET_SEARCH_STEPS: usize = 200;

/// Oliver-Pharr results.  Moduli and hardness in GPa, stiffness µN/nm, depths nm, area nm²,
/// work µN·nm.
#[derive(Debug, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub struct MaterialProperties {
    pub hardness: f64,
    pub elastic_modulus: f64,
    pub reduced_modulus: f64,
    pub contact_stiffness: f64,
    pub contact_depth: f64,
    pub contact_area: f64,
    /// Zero-force intercept of the fitted unloading line.
    pub plastic_depth: f64,
    pub max_force: f64,
    pub max_depth: f64,
    /// Displacement reading taken as zero depth.
    pub surface_displacement: f64,
    /// `∫ F dh` along the loading branch, from the first sample up to the peak.
    pub total_work: f64,
    /// Recovered on unloading: `∫ F dh` from the peak to the last sample, with negative forces
    /// counted as zero.  Wider than the segment the stiffness is fitted over.
    pub elastic_work: f64,
    /// `total_work - elastic_work`.
    pub plastic_work: f64,
    pub segment_samples: usize,
}

#[derive(Debug, PartialEq, Copy, Clone)]
struct LineFit {
    slope: f64,
    intercept: f64,
}

pub struct PropertyExtractor {
    indenter: IndenterDescriptor,
    sample_poisson_ratio: f64,
    contact_force_threshold: f64,
    calibration: CalibrationData,
    min_segment_samples: usize,
}

impl PropertyExtractor {
    pub fn new(params: &TestParameters, calibration: &CalibrationData) -> Self {
        Self {
            indenter: params.indenter,
            sample_poisson_ratio: params.sample_poisson_ratio,
            contact_force_threshold: params.contact_force_threshold,
            calibration: calibration.clone(),
            min_segment_samples: DEFAULT_MIN_SEGMENT_SAMPLES,
        }
    }

    pub fn with_min_segment_samples(self, min_segment_samples: usize) -> Self {
        Self { min_segment_samples: min_segment_samples.max(2), ..self }
    }

    /// Analyse a finished test.  `samples` are in acquisition order; `surface_displacement` is the
    /// displacement reading at first contact.
    pub fn extract(&self, samples: &[Sample], surface_displacement: f64) -> Result<MaterialProperties, IndentationError> {
        let curve: Vec<(f64, f64)> = samples
            .iter()
            .filter(|sample| sample.is_mechanically_valid())
            .map(|sample| (self.depth(sample, surface_displacement), sample.force))
            .collect();

        let peak = peak_index(&curve).ok_or(IndentationError::InsufficientUnloadingData {
            found: 0,
            required: self.min_segment_samples,
        })?;
        let (max_depth, max_force) = curve[peak];
        if !(max_force > 0.0) {
            return Err(IndentationError::NonPhysicalResult(format!("peak force {max_force} µN")));
        }

        let segment = unloading_segment(&curve, peak, max_force);
        if segment.len() < self.min_segment_samples {
            return Err(IndentationError::InsufficientUnloadingData {
                found: segment.len(),
                required: self.min_segment_samples,
            });
        }
        let fit = fit_line(segment).ok_or(IndentationError::DegenerateUnloadingFit)?;
        let stiffness = fit.slope;
        if !(stiffness.is_finite() && stiffness > 0.0) {
            return Err(IndentationError::NonPhysicalResult(format!("unloading stiffness {stiffness} µN/nm")));
        }
        debug!(
            "Unloading fit over {} samples: S = {stiffness:.5} µN/nm, intercept {:.5} µN",
            segment.len(), fit.intercept);

        let contact_depth = max_depth - self.indenter.epsilon() * max_force / stiffness;
        if !(contact_depth > 0.0) {
            return Err(IndentationError::NonPhysicalResult(format!("contact depth {contact_depth} nm")));
        }
        let contact_area = if self.calibration.has_area_function() {
            self.calibration.area_function(contact_depth)
        } else {
            self.indenter.ideal_area(contact_depth)
        };
        if !(contact_area.is_finite() && contact_area > 0.0) {
            return Err(IndentationError::NonPhysicalResult(format!("contact area {contact_area} nm²")));
        }

        let hardness = max_force / contact_area * GPA_PER_UN_PER_NM2;
        let reduced_modulus =
            PI.sqrt() * stiffness / (2.0 * self.indenter.beta() * contact_area.sqrt()) * GPA_PER_UN_PER_NM2;
        let sample_compliance = 1.0 / reduced_modulus - self.indenter.tip_compliance();
        if !(sample_compliance > 0.0) {
            return Err(IndentationError::NonPhysicalResult(format!(
                "reduced modulus {reduced_modulus} GPa is stiffer than the indenter itself")));
        }
        let elastic_modulus = (1.0 - self.sample_poisson_ratio.powi(2)) / sample_compliance;

        let total_work = trapezoid(&curve[..=peak]);
        let elastic_work = -trapezoid(&curve[peak..]);

        let properties = MaterialProperties {
            hardness,
            elastic_modulus,
            reduced_modulus,
            contact_stiffness: stiffness,
            contact_depth,
            contact_area,
            plastic_depth: -fit.intercept / stiffness,
            max_force,
            max_depth,
            surface_displacement,
            total_work,
            elastic_work,
            plastic_work: total_work - elastic_work,
            segment_samples: segment.len(),
        };
        info!(
            "H = {:.3} GPa, E = {:.3} GPa (E_r = {:.3} GPa) at h_c = {:.2} nm",
            properties.hardness, properties.elastic_modulus, properties.reduced_modulus, properties.contact_depth);
        Ok(properties)
    }

    /// Refines a surface reading taken during approach by fitting `F = a (h - h0)^m` to the
    /// early loading branch and taking the zero-force onset `h0`.  This removes the lag of a
    /// force threshold on a curve that starts flat, and the scatter of one noisy sample.
    /// Returns `approach_surface` unchanged when the branch is too short or the fitted exponent
    /// is implausible.
    pub fn locate_surface(&self, samples: &[Sample], approach_surface: f64) -> f64 {
        let curve: Vec<(f64, f64)> = samples
            .iter()
            .filter(|sample| sample.is_mechanically_valid())
            .map(|sample| (self.depth(sample, approach_surface), sample.force))
            .collect();
        let peak = match peak_index(&curve) {
            Some(peak) => peak,
            None => return approach_surface,
        };
        let max_force = curve[peak].1;
        let lower = self.contact_force_threshold.max(ONSET_LOWER_FRACTION * max_force);
        let upper = ONSET_UPPER_FRACTION * max_force;
        let onset_branch: Vec<(f64, f64)> = curve[..=peak]
            .iter()
            .copied()
            .filter(|&(_, force)| (lower..=upper).contains(&force))
            .collect();
        if onset_branch.len() < self.min_segment_samples {
            return approach_surface;
        }
        match loading_onset(&onset_branch) {
            Some(onset) => {
                debug!("Loading onset {onset:.3} nm from the approach surface {approach_surface:.3} nm");
                approach_surface + onset
            }
            None => {
                debug!("No plausible power law on the loading branch, keeping the approach surface");
                approach_surface
            }
        }
    }

    fn depth(&self, sample: &Sample, surface_displacement: f64) -> f64 {
        sample.displacement - surface_displacement - self.calibration.frame_compliance * sample.force
    }
}

fn peak_index(curve: &[(f64, f64)]) -> Option<usize> {
    curve
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &(_, force))| match best {
            Some((_, best_force)) if best_force >= force => best,
            _ => Some((i, force)),
        })
        .map(|(i, _)| i)
}

/// From the first post-peak point below 90% of the peak force up to, not including, the first
/// later point below 0.1%.
fn unloading_segment(curve: &[(f64, f64)], peak: usize, max_force: f64) -> &[(f64, f64)] {
    let after_peak = &curve[peak + 1..];
    let start = match after_peak.iter().position(|&(_, force)| force < SEGMENT_UPPER_FRACTION * max_force) {
        Some(start) => start,
        None => return &after_peak[after_peak.len()..],
    };
    let tail = &after_peak[start..];
    let end = tail
        .iter()
        .position(|&(_, force)| force < SEGMENT_LOWER_FRACTION * max_force)
        .unwrap_or(tail.len());
    &tail[..end]
}

/// Ordinary least squares `force = slope * depth + intercept`.
fn fit_line(points: &[(f64, f64)]) -> Option<LineFit> {
    let n = points.len() as f64;
    let (sum_x, sum_y) = points.iter().fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
    let (mean_x, mean_y) = (sum_x / n, sum_y / n);
    let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), &(x, y)| {
        let dx = x - mean_x;
        (sxx + dx * dx, sxy + dx * (y - mean_y))
    });
    if !(sxx > f64::EPSILON * n) {
        return None;
    }
    let slope = sxy / sxx;
    Some(LineFit { slope, intercept: mean_y - slope * mean_x })
}

/// Golden-section search for the onset `h0` minimising the residual of the log-log line fit of
/// `F = a (h - h0)^m`.  The onset lies below the shallowest point by at most the branch's own
/// depth span.
fn loading_onset(branch: &[(f64, f64)]) -> Option<f64> {
    let (shallowest, deepest) = branch
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), &(depth, _)| (low.min(depth), high.max(depth)));
    let span = deepest - shallowest;
    if !(span > 0.0) {
        return None;
    }
    let residual = |onset: f64| power_law_fit(branch, onset).map_or(f64::INFINITY, |(_, residual)| residual);

    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut low, mut high) = (shallowest - span, shallowest - span * 1e-9);
    let mut a = high - ratio * (high - low);
    let mut b = low + ratio * (high - low);
    let (mut residual_a, mut residual_b) = (residual(a), residual(b));
    for _ in 0..ONSET_SEARCH_STEPS {
        if residual_a <= residual_b {
            high = b;
            b = a;
            residual_b = residual_a;
            a = high - ratio * (high - low);
            residual_a = residual(a);
        } else {
            low = a;
            a = b;
            residual_a = residual_b;
            b = low + ratio * (high - low);
            residual_b = residual(b);
        }
    }
    let onset = (low + high) / 2.0;
    let (fit, _) = power_law_fit(branch, onset)?;
    ONSET_EXPONENTS.contains(&fit.slope).then(|| onset)
}

/// Line fit of `ln F` against `ln (h - onset)`, with its sum of squared residuals.
fn power_law_fit(branch: &[(f64, f64)], onset: f64) -> Option<(LineFit, f64)> {
    let logs: Vec<(f64, f64)> = branch
        .iter()
        .map(|&(depth, force)| ((depth - onset).ln(), force.ln()))
        .collect();
    let fit = fit_line(&logs)?;
    let residual = logs
        .iter()
        .map(|&(x, y)| (y - fit.slope * x - fit.intercept).powi(2))
        .sum::<f64>();
    residual.is_finite().then(|| (fit, residual))
}

/// `∫ F dh` along the path; negative forces count as zero.
fn trapezoid(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|pair| {
            let (h0, f0) = pair[0];
            let (h1, f1) = pair[1];
            (h1 - h0) * (f0.max(0.0) + f1.max(0.0)) / 2.0
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::test_parameters::IndenterKind;

    use super::*;

    fn samples_from(points: &[(f64, f64)], surface: f64) -> Vec<Sample> {
        points
            .iter()
            .enumerate()
            .map(|(i, &(depth, force))| Sample::new(Duration::from_millis(i as u64), force, depth + surface))
            .collect()
    }

    /// Quadratic loading to `(max_depth, max_force)` then a straight unload of slope `stiffness`.
    fn synthetic_curve(max_depth: f64, max_force: f64, stiffness: f64, steps: usize) -> Vec<(f64, f64)> {
        let mut points = vec![];
        for i in 0..=steps {
            let h = max_depth * i as f64 / steps as f64;
            points.push((h, max_force * (h / max_depth).powi(2)));
        }
        let final_depth = max_depth - max_force / stiffness;
        for i in 1..=steps {
            let h = max_depth - (max_depth - final_depth) * i as f64 / steps as f64;
            points.push((h, (max_force - stiffness * (max_depth - h)).max(0.0)));
        }
        points
    }

    fn extractor() -> PropertyExtractor {
        PropertyExtractor::new(&TestParameters::default(), &CalibrationData::default())
    }

    #[test]
    fn test_recovers_unloading_slope() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let properties = extractor().extract(&samples_from(&curve, 350.0), 350.0).unwrap();
        assert!((properties.contact_stiffness - 5.0).abs() < 1e-9);
        assert!((properties.contact_depth - 85.0).abs() < 1e-9);
        assert!((properties.plastic_depth - 80.0).abs() < 1e-9);
        assert_eq!(properties.max_force, 100.0);
        assert_eq!(properties.max_depth, 100.0);
        assert_eq!(properties.surface_displacement, 350.0);
    }

    #[test]
    fn test_reproduces_hardness_and_modulus_from_forward_model() {
        let params = TestParameters { sample_poisson_ratio: 0.3, ..Default::default() };
        let indenter = params.indenter;
        let (hardness, modulus) = (12.0, 150.0);
        let reduced = 1.0 / ((1.0 - 0.09) / modulus + indenter.tip_compliance());

        let contact_depth = 60.0;
        let area = 24.5 * contact_depth * contact_depth;
        let max_force = hardness / GPA_PER_UN_PER_NM2 * area;
        let stiffness = 2.0 * indenter.beta() * reduced / GPA_PER_UN_PER_NM2 * area.sqrt() / PI.sqrt();
        let max_depth = contact_depth + indenter.epsilon() * max_force / stiffness;

        let curve = synthetic_curve(max_depth, max_force, stiffness, 300);
        let properties = PropertyExtractor::new(&params, &CalibrationData::default())
            .extract(&samples_from(&curve, 0.0), 0.0)
            .unwrap();
        assert!((properties.hardness - hardness).abs() < 1e-6, "H = {}", properties.hardness);
        assert!((properties.reduced_modulus - reduced).abs() < 1e-6, "E_r = {}", properties.reduced_modulus);
        assert!((properties.elastic_modulus - modulus).abs() < 1e-6, "E = {}", properties.elastic_modulus);
    }

    #[test]
    fn test_too_few_unloading_samples() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 6);
        let result = extractor().extract(&samples_from(&curve, 0.0), 0.0);
        assert!(matches!(result, Err(IndentationError::InsufficientUnloadingData { found, required: 10 }) if found < 10));
    }

    #[test]
    fn test_empty_trace_is_not_computable() {
        assert_eq!(
            extractor().extract(&[], 0.0),
            Err(IndentationError::InsufficientUnloadingData { found: 0, required: 10 }));
    }

    #[test]
    fn test_flat_segment_is_degenerate() {
        let mut curve = synthetic_curve(100.0, 100.0, 5.0, 50);
        curve.truncate(51);
        // Stuck stage: force falls while displacement reads constant.
        for i in 1..=20 {
            curve.push((100.0, 100.0 - 4.0 * i as f64));
        }
        let result = extractor().extract(&samples_from(&curve, 0.0), 0.0);
        assert_eq!(result, Err(IndentationError::DegenerateUnloadingFit));
    }

    #[test]
    fn test_removes_frame_compliance() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let compliance = 0.05;
        let measured: Vec<(f64, f64)> = curve.iter().map(|&(h, f)| (h + compliance * f, f)).collect();
        let calibration = CalibrationData { frame_compliance: compliance, ..Default::default() };
        let properties = PropertyExtractor::new(&TestParameters::default(), &calibration)
            .extract(&samples_from(&measured, 0.0), 0.0)
            .unwrap();
        assert!((properties.contact_stiffness - 5.0).abs() < 1e-9);

        let uncorrected = extractor().extract(&samples_from(&measured, 0.0), 0.0).unwrap();
        assert!(uncorrected.contact_stiffness < 5.0);
    }

    #[test]
    fn test_uses_calibrated_area_function() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let calibration = CalibrationData { area_coefficients: [24.5, 100.0, 0.0, 0.0, 0.0, 0.0], ..Default::default() };
        let properties = PropertyExtractor::new(&TestParameters::default(), &calibration)
            .extract(&samples_from(&curve, 0.0), 0.0)
            .unwrap();
        assert!((properties.contact_area - (24.5 * 85.0 * 85.0 + 100.0 * 85.0)).abs() < 1e-6);
    }

    #[test]
    fn test_spherical_tip_constants() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let params = TestParameters { indenter: IndenterDescriptor::spherical(2000.0), ..Default::default() };
        let properties = PropertyExtractor::new(&params, &CalibrationData::default())
            .extract(&samples_from(&curve, 0.0), 0.0)
            .unwrap();
        assert_eq!(params.indenter.kind, IndenterKind::Spherical);
        let area = PI * (2.0 * 2000.0 * 85.0 - 85.0 * 85.0);
        assert!((properties.contact_area - area).abs() < 1e-6);
        let reduced = PI.sqrt() * 5.0 / (2.0 * area.sqrt()) * GPA_PER_UN_PER_NM2;
        assert!((properties.reduced_modulus - reduced).abs() < 1e-9);
    }

    #[test]
    fn test_reversible_curve_has_no_plastic_work() {
        let mut curve: Vec<(f64, f64)> = (0..=100).map(|i| (i as f64, 2.0 * i as f64)).collect();
        let unloading: Vec<(f64, f64)> = curve.iter().rev().skip(1).copied().collect();
        curve.extend(unloading);
        let properties = extractor().extract(&samples_from(&curve, 0.0), 0.0).unwrap();
        assert!((properties.total_work - 10_000.0).abs() < 1e-6);
        assert!((properties.elastic_work - properties.total_work).abs() < 1e-6);
        assert!(properties.plastic_work.abs() < 1e-6);
    }

    #[test]
    fn test_custom_minimum_segment_size() {
        // Six unloading steps leave five points between 90% and 0.1% of the peak.
        let curve = synthetic_curve(100.0, 100.0, 5.0, 6);
        let samples = samples_from(&curve, 0.0);
        let properties = extractor().with_min_segment_samples(5).extract(&samples, 0.0).unwrap();
        assert_eq!(properties.segment_samples, 5);
        assert!((properties.contact_stiffness - 5.0).abs() < 1e-9);
        assert_eq!(
            extractor().with_min_segment_samples(6).extract(&samples, 0.0),
            Err(IndentationError::InsufficientUnloadingData { found: 5, required: 6 }));
    }

    #[test]
    fn test_locates_surface_from_loading_onset() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let samples = samples_from(&curve, 350.0);
        for approach_surface in [352.0, 348.5, 350.0] {
            let surface = extractor().locate_surface(&samples, approach_surface);
            assert!((surface - 350.0).abs() < 1e-3, "from {approach_surface}: {surface}");
        }
    }

    #[test]
    fn test_linear_loading_onset() {
        let curve: Vec<(f64, f64)> = (0..=100).map(|i| (i as f64, 2.0 * i as f64)).collect();
        let samples = samples_from(&curve, 40.0);
        let surface = extractor().locate_surface(&samples, 43.0);
        assert!((surface - 40.0).abs() < 1e-3, "surface {surface}");
    }

    #[test]
    fn test_short_loading_branch_keeps_approach_surface() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 6);
        assert_eq!(extractor().locate_surface(&samples_from(&curve, 0.0), 1.5), 1.5);
        assert_eq!(extractor().locate_surface(&[], 1.5), 1.5);
    }

    #[test]
    fn test_substituted_samples_are_ignored() {
        let curve = synthetic_curve(100.0, 100.0, 5.0, 200);
        let mut samples = samples_from(&curve, 0.0);
        let glitch = samples.len() - 50;
        samples[glitch].displacement = 1.0e4;
        samples[glitch].substituted.displacement = true;
        let properties = extractor().extract(&samples, 0.0).unwrap();
        assert!((properties.contact_stiffness - 5.0).abs() < 1e-9);
    }
}
