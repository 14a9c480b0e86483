//! Error types for everything that can go wrong while processing spans.

use thiserror::Error;

/// A span (or a record within it) doesn't have the expected binary layout.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("Expected a span of {expected} bytes ({num_baselines} baselines), but got {actual} bytes")]
    BadSpanLength {
        expected: usize,
        actual: usize,
        num_baselines: usize,
    },

    #[error("Span length of {actual} bytes is not a multiple of the {record_size}-byte record size")]
    PartialRecord { actual: usize, record_size: usize },

    #[error("Expected {expected} baseline records, but got {actual}")]
    BadRecordCount { expected: usize, actual: usize },

    #[error("Record {record} has antenna index {value}, but indices must be integers in [0, {n_stands})")]
    BadAntennaIndex {
        record: usize,
        value: f32,
        n_stands: usize,
    },

    #[error("The span has no record for the baseline between antennas {antenna1} and {antenna2}")]
    MissingBaseline { antenna1: usize, antenna2: usize },

    #[error("The span has more than one record for the baseline between antennas {antenna1} and {antenna2}")]
    DuplicateBaseline { antenna1: usize, antenna2: usize },

    #[error("Text input line {line}: {message}")]
    BadTextRow { line: usize, message: String },
}

/// The calibration solve couldn't produce trustworthy visibilities.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Antenna {antenna} has no usable signal; the calibration solve is singular")]
    Singular { antenna: usize },

    #[error("Calibration didn't converge after {num_iterations} iterations: precision {max_precision:e} > {min_threshold:e}")]
    NotConverged {
        num_iterations: u32,
        max_precision: f64,
        min_threshold: f64,
    },

    #[error("Calibrated visibility for antennas {antenna1} and {antenna2} is not finite")]
    NonFinite { antenna1: usize, antenna2: usize },
}

/// Invalid settings, detected before any span is processed.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("The total number of antennas must be between 1 and {max}, got {n_stands}")]
    BadNStands { n_stands: usize, max: usize },

    #[error("The number of calibration antennas ({num_stands}) must be at least 2 and no more than the total number of antennas ({n_stands})")]
    BadCalNumStands { num_stands: usize, n_stands: usize },

    #[error("FFT size must be positive, got {0}")]
    FftSizeZero(usize),

    #[error("FFT size must be even, got {0}")]
    FftSizeOdd(usize),

    #[error("Flagged antenna {antenna} is not a valid index into {n_stands} antennas")]
    BadFlaggedAntenna { antenna: usize, n_stands: usize },

    #[error("Only {available} of the {num_stands} calibration antennas are unflagged; at least 2 are needed")]
    TooFewCalAntennas { available: usize, num_stands: usize },

    #[error("Calibration thresholds must be positive and stop ({stop}) must not exceed min ({min})")]
    BadThresholds { stop: f64, min: f64 },

    #[error("The maximum number of calibration iterations must be at least 1")]
    ZeroIterations,

    #[error("The perturbation scale must be in [0, 1), got {0}")]
    BadPerturbationScale(f64),

    #[error("The channel capacity between stages must be at least 1")]
    ZeroChannelCapacity,

    #[error("Unrecognised gridding mode '{0}'; valid modes are: nearest, gaussian")]
    BadGriddingMode(String),

    #[error("Unrecognised span error policy '{0}'; valid policies are: skip, halt")]
    BadSpanErrorPolicy(String),

    #[error("Couldn't decode toml structure from {file}:\n{err}")]
    ArgFile { file: String, err: String },

    #[error("Argument file '{0}' doesn't have a recognised file extension! Valid extensions are: toml")]
    ArgFileExtension(String),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Why a single span failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpanErrorKind {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// A failed span. These are isolated to the span; the pipeline either skips
/// to the next span or halts.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Span {span_index}: {kind}")]
pub struct SpanFailure {
    pub span_index: usize,
    pub kind: SpanErrorKind,
}

/// Errors from span sources.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Errors from image sinks.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Expected a {expected}x{expected} image, got {rows}x{cols}")]
    BadImageShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[cfg(feature = "fits")]
    #[error(transparent)]
    Fitsio(#[from] fitsio::errors::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Errors that stop a whole pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Halting on failed span. {0}")]
    Halted(SpanFailure),

    #[error("Couldn't read span {span_index}: {err}")]
    Source { span_index: usize, err: ReadError },

    #[error("Couldn't write the image for span {span_index}: {err}")]
    Sink { span_index: usize, err: WriteError },

    #[error("The {0} stage panicked")]
    StagePanic(&'static str),
}
