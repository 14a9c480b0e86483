//! Settings for a pipeline run. These are validated once, before any span is
//! processed, and then handed (immutably) to each stage.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    constants::*,
    error::ConfigurationError,
    record::{num_baselines, span_size_bytes},
};

/// How visibilities are deposited onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GriddingMode {
    /// Add each visibility to the single cell nearest to it.
    Nearest,

    /// Spread each visibility over the 3x3 neighbourhood with a Gaussian
    /// kernel.
    #[default]
    Gaussian,
}

impl FromStr for GriddingMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(GriddingMode::Nearest),
            "gaussian" => Ok(GriddingMode::Gaussian),
            _ => Err(ConfigurationError::BadGriddingMode(s.to_string())),
        }
    }
}

impl Display for GriddingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GriddingMode::Nearest => write!(f, "nearest"),
            GriddingMode::Gaussian => write!(f, "gaussian"),
        }
    }
}

/// What to do when a span fails to decode or calibrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanErrorPolicy {
    /// Log the failure, drop the span and continue with the next one.
    #[default]
    Skip,

    /// Stop the whole run.
    Halt,
}

impl FromStr for SpanErrorPolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(SpanErrorPolicy::Skip),
            "halt" => Ok(SpanErrorPolicy::Halt),
            _ => Err(ConfigurationError::BadSpanErrorPolicy(s.to_string())),
        }
    }
}

/// Settings for the simulated calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// If false, spans pass through the calibration stage unmodified.
    pub enabled: bool,

    /// The number of antennas (starting from antenna 0) used in the simulated
    /// fit. Unflagged antennas among these are calibrated.
    pub num_stands: usize,

    pub max_iterations: u32,
    pub stop_threshold: f64,
    pub min_threshold: f64,

    /// The amplitude and phase scale of the hidden gains. 0 means the hidden
    /// gains are all identity.
    pub perturbation_scale: f64,

    /// Span `i` uses the random seed `seed + i`.
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            enabled: true,
            num_stands: DEFAULT_CAL_NUM_STANDS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stop_threshold: DEFAULT_STOP_THRESHOLD,
            min_threshold: DEFAULT_MIN_THRESHOLD,
            perturbation_scale: DEFAULT_PERTURBATION_SCALE,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// The total number of antennas in the array (`N_STANDS`). This determines
    /// the number of records per span.
    pub n_stands: usize,

    /// The side length of the grid and image.
    pub fft_size: usize,

    /// Antennas excluded from gridding and calibration.
    pub flagged_antennas: BTreeSet<usize>,

    /// Also deposit the conjugate of each visibility at (-u, -v).
    pub conjugate_symmetry: bool,

    pub gridding_mode: GriddingMode,

    pub calibration: CalibrationConfig,

    pub on_span_error: SpanErrorPolicy,

    /// How many spans can be queued between two pipeline stages.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            n_stands: DEFAULT_N_STANDS,
            fft_size: DEFAULT_FFT_SIZE,
            flagged_antennas: BTreeSet::new(),
            conjugate_symmetry: false,
            gridding_mode: GriddingMode::default(),
            calibration: CalibrationConfig::default(),
            on_span_error: SpanErrorPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineConfig {
    /// The number of records in every span (`N_BASELINE`).
    pub fn num_baselines(&self) -> usize {
        num_baselines(self.n_stands)
    }

    /// The exact length of every span in bytes.
    pub fn span_size_bytes(&self) -> usize {
        span_size_bytes(self.n_stands)
    }

    /// The antennas that take part in calibration: the first `num_stands`
    /// antennas, minus any flagged ones.
    pub fn calibration_antennas(&self) -> Vec<usize> {
        (0..self.calibration.num_stands)
            .filter(|a| !self.flagged_antennas.contains(a))
            .collect()
    }

    /// Check that these settings are usable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.n_stands == 0 || self.n_stands > MAX_N_STANDS {
            return Err(ConfigurationError::BadNStands {
                n_stands: self.n_stands,
                max: MAX_N_STANDS,
            });
        }
        if self.fft_size == 0 {
            return Err(ConfigurationError::FftSizeZero(self.fft_size));
        }
        if self.fft_size % 2 != 0 {
            return Err(ConfigurationError::FftSizeOdd(self.fft_size));
        }
        if let Some(&antenna) = self
            .flagged_antennas
            .iter()
            .find(|&&a| a >= self.n_stands)
        {
            return Err(ConfigurationError::BadFlaggedAntenna {
                antenna,
                n_stands: self.n_stands,
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigurationError::ZeroChannelCapacity);
        }

        let cal = &self.calibration;
        if cal.num_stands < 2 || cal.num_stands > self.n_stands {
            return Err(ConfigurationError::BadCalNumStands {
                num_stands: cal.num_stands,
                n_stands: self.n_stands,
            });
        }
        if cal.enabled {
            let available = self.calibration_antennas().len();
            if available < 2 {
                return Err(ConfigurationError::TooFewCalAntennas {
                    available,
                    num_stands: cal.num_stands,
                });
            }
        }
        // The negations catch NaNs too.
        if !(cal.stop_threshold > 0.0)
            || !(cal.min_threshold > 0.0)
            || !(cal.stop_threshold <= cal.min_threshold)
        {
            return Err(ConfigurationError::BadThresholds {
                stop: cal.stop_threshold,
                min: cal.min_threshold,
            });
        }
        if cal.max_iterations == 0 {
            return Err(ConfigurationError::ZeroIterations);
        }
        if !(0.0..1.0).contains(&cal.perturbation_scale) {
            return Err(ConfigurationError::BadPerturbationScale(
                cal.perturbation_scale,
            ));
        }

        Ok(())
    }
}
