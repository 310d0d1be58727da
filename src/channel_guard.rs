use std::ops::Range;

use thiserror::Error;

/// A step change is accepted as the new baseline once it has been rejected as a jump this many
/// times in a row.  Any other outcome in between restarts the count.
const REBASELINE_AFTER: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Outlier {
    #[error("non-finite reading")]
    NotFinite,
    #[error("reading {value} outside {min}..{max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("jump of {delta} from last sane value exceeds {max_delta}")]
    Jump { delta: f64, max_delta: f64 },
}

pub struct ChannelGuard {
    pub sane_range: Range<f64>,
    pub max_per_sample_delta: Option<f64>,
    pub last_sane_value: Option<f64>,
    pub recent_outliers: usize,
    jump_streak: usize,
}

impl ChannelGuard {
    pub fn new(sane_range: Range<f64>, max_per_sample_delta: Option<f64>) -> Self {
        Self {
            sane_range,
            max_per_sample_delta,
            last_sane_value: None,
            recent_outliers: 0,
            jump_streak: 0,
        }
    }

    pub fn update(&mut self, value: f64) -> Result<f64, Outlier> {
        match self.check(value) {
            Ok(()) => {
                self.accept(value);
                Ok(value)
            }
            Err(Outlier::Jump { .. }) if self.jump_streak + 1 >= REBASELINE_AFTER => {
                self.accept(value);
                Ok(value)
            }
            Err(outlier) => {
                self.recent_outliers += 1;
                self.jump_streak = match outlier {
                    Outlier::Jump { .. } => self.jump_streak + 1,
                    _ => 0,
                };
                Err(outlier)
            }
        }
    }

    /// Count a missing reading the same way as a rejected one.
    pub fn mark_missing(&mut self) {
        self.recent_outliers += 1;
        self.jump_streak = 0;
    }

    /// The value to substitute for a rejected reading.
    pub fn fallback(&self) -> f64 {
        self.last_sane_value.unwrap_or(0.0)
    }

    fn accept(&mut self, value: f64) {
        self.last_sane_value = Some(value);
        self.recent_outliers = 0;
        self.jump_streak = 0;
    }

    fn check(&self, value: f64) -> Result<(), Outlier> {
        if !value.is_finite() {
            return Err(Outlier::NotFinite);
        }
        if !self.sane_range.contains(&value) {
            return Err(Outlier::OutOfRange {
                value,
                min: self.sane_range.start,
                max: self.sane_range.end,
            });
        }
        if let (Some(last_sane_value), Some(max_delta)) = (self.last_sane_value, self.max_per_sample_delta) {
            let delta = (value - last_sane_value).abs();
            if delta > max_delta {
                return Err(Outlier::Jump { delta, max_delta });
            }
        }
        Ok(())
    }
}
