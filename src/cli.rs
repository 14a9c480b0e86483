//! Command-line (and argument file) settings for a pipeline run.

use std::{
    fs::File,
    io::Read,
    path::Path,
};

use clap::Parser;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    config::{CalibrationConfig, GriddingMode, PipelineConfig, SpanErrorPolicy},
    constants::*,
    error::ConfigurationError,
};

/// Pipeline settings as given by a user. Anything not given takes its default.
#[derive(Parser, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineArgs {
    /// The total number of antennas in the array. Each span has a record for
    /// every pair of these (auto-correlations included).
    #[clap(short, long, help_heading = "ARRAY")]
    pub n_stands: Option<usize>,

    /// Antennas to exclude from gridding and calibration.
    #[clap(long, multiple_values(true), help_heading = "ARRAY")]
    pub flagged_antennas: Option<Vec<usize>>,

    /// The side length of the grid and images [pixels]. Must be even.
    #[clap(short, long, help_heading = "GRIDDING")]
    pub fft_size: Option<usize>,

    /// How visibilities are put onto the grid. Valid modes are: nearest,
    /// gaussian.
    #[clap(short, long, help_heading = "GRIDDING")]
    pub gridding_mode: Option<String>,

    /// Also grid the conjugate of each visibility at (-u, -v).
    #[clap(long, help_heading = "GRIDDING")]
    pub conjugate_symmetry: bool,

    /// Pass spans through without calibrating them.
    #[clap(long, help_heading = "CALIBRATION")]
    pub no_calibration: bool,

    /// The number of antennas (starting from antenna 0) to calibrate.
    #[clap(long, help_heading = "CALIBRATION")]
    pub cal_num_stands: Option<usize>,

    /// The maximum number of iterations in each calibration solve.
    #[clap(long, help_heading = "CALIBRATION")]
    pub max_iterations: Option<u32>,

    /// The threshold at which we stop iterating a calibration solve.
    #[clap(long, help_heading = "CALIBRATION")]
    pub stop_thresh: Option<f64>,

    /// The minimum threshold for a calibration solve to be considered
    /// converged.
    #[clap(long, help_heading = "CALIBRATION")]
    pub min_thresh: Option<f64>,

    /// The scale of the simulated gain errors that calibration removes. 0
    /// means no errors. Must be in [0, 1).
    #[clap(long, help_heading = "CALIBRATION")]
    pub perturbation_scale: Option<f64>,

    /// The random seed for the simulated gains. Span i uses seed + i. If not
    /// given, a seed is drawn and reported.
    #[clap(long, help_heading = "CALIBRATION")]
    pub seed: Option<u64>,

    /// What to do when a span can't be decoded or calibrated. Valid policies
    /// are: skip, halt.
    #[clap(long, help_heading = "PIPELINE")]
    pub on_span_error: Option<String>,

    /// The number of spans that can be queued between pipeline stages.
    #[clap(long, help_heading = "PIPELINE")]
    pub channel_capacity: Option<usize>,
}

impl PipelineArgs {
    /// Combine two sets of arguments. Anything given in `self` takes
    /// precedence over `other`.
    pub fn merge(self, other: Self) -> Self {
        PipelineArgs {
            n_stands: self.n_stands.or(other.n_stands),
            flagged_antennas: self.flagged_antennas.or(other.flagged_antennas),
            fft_size: self.fft_size.or(other.fft_size),
            gridding_mode: self.gridding_mode.or(other.gridding_mode),
            conjugate_symmetry: self.conjugate_symmetry || other.conjugate_symmetry,
            no_calibration: self.no_calibration || other.no_calibration,
            cal_num_stands: self.cal_num_stands.or(other.cal_num_stands),
            max_iterations: self.max_iterations.or(other.max_iterations),
            stop_thresh: self.stop_thresh.or(other.stop_thresh),
            min_thresh: self.min_thresh.or(other.min_thresh),
            perturbation_scale: self.perturbation_scale.or(other.perturbation_scale),
            seed: self.seed.or(other.seed),
            on_span_error: self.on_span_error.or(other.on_span_error),
            channel_capacity: self.channel_capacity.or(other.channel_capacity),
        }
    }

    /// Turn the arguments into a validated [`PipelineConfig`].
    pub fn parse(self) -> Result<PipelineConfig, ConfigurationError> {
        let PipelineArgs {
            n_stands,
            flagged_antennas,
            fft_size,
            gridding_mode,
            conjugate_symmetry,
            no_calibration,
            cal_num_stands,
            max_iterations,
            stop_thresh,
            min_thresh,
            perturbation_scale,
            seed,
            on_span_error,
            channel_capacity,
        } = self;

        let gridding_mode = match gridding_mode {
            Some(m) => m.parse()?,
            None => GriddingMode::default(),
        };
        let on_span_error = match on_span_error {
            Some(p) => p.parse()?,
            None => SpanErrorPolicy::default(),
        };
        let seed = match seed {
            Some(s) => s,
            None => {
                let s = rand::random();
                info!("No calibration seed given; using {s}");
                s
            }
        };

        let config = PipelineConfig {
            n_stands: n_stands.unwrap_or(DEFAULT_N_STANDS),
            fft_size: fft_size.unwrap_or(DEFAULT_FFT_SIZE),
            flagged_antennas: flagged_antennas.unwrap_or_default().into_iter().collect(),
            conjugate_symmetry,
            gridding_mode,
            calibration: CalibrationConfig {
                enabled: !no_calibration,
                num_stands: cal_num_stands.unwrap_or(DEFAULT_CAL_NUM_STANDS),
                max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                stop_threshold: stop_thresh.unwrap_or(DEFAULT_STOP_THRESHOLD),
                min_threshold: min_thresh.unwrap_or(DEFAULT_MIN_THRESHOLD),
                perturbation_scale: perturbation_scale.unwrap_or(DEFAULT_PERTURBATION_SCALE),
                seed,
            },
            on_span_error,
            channel_capacity: channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Read [`PipelineArgs`] from a TOML file.
pub fn read_args_file<P: AsRef<Path>>(path: P) -> Result<PipelineArgs, ConfigurationError> {
    let path = path.as_ref();
    debug!("Attempting to parse argument file {}", path.display());

    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("toml") => {
            debug!("Parsing toml file...");
            let mut contents = String::new();
            let mut fh = File::open(path)?;
            fh.read_to_string(&mut contents)?;
            toml::from_str(&contents).map_err(|e| ConfigurationError::ArgFile {
                file: path.display().to_string(),
                err: e.to_string(),
            })
        }

        _ => Err(ConfigurationError::ArgFileExtension(
            path.display().to_string(),
        )),
    }
}
