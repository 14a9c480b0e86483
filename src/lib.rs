//! Calibrate, grid and image streams of radio-interferometric visibility
//! spans.
//!
//! A span holds one visibility per antenna pair for one instant. Each span is
//! handled on its own: its records are decoded ([`record`]), a subset of
//! antennas goes through a simulated calibration ([`calibrate`]), all
//! unflagged visibilities are put onto a UV grid ([`gridding`]) and the grid
//! is Fourier transformed into an image ([`imaging`]). [`pipeline`] runs these
//! stages concurrently between a span source ([`read`]) and an image sink
//! ([`write`]).

pub mod calibrate;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod gridding;
pub mod imaging;
pub mod pipeline;
pub mod read;
pub mod record;
pub mod simulate;
pub mod write;

pub use calibrate::{CalibrationEngine, CalibrationResult};
pub use config::{CalibrationConfig, GriddingMode, PipelineConfig, SpanErrorPolicy};
pub use error::*;
pub use gridding::Gridder;
pub use imaging::ImageSynthesizer;
pub use pipeline::{run_pipeline, PipelineSummary};
pub use record::{decode_span, encode_span, BaselineRecord, UvSpan};
