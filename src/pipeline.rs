//! The span-processing pipeline.
//!
//! Each stage runs on its own thread and works on one span at a time; spans
//! move between stages through bounded channels, so a slow stage applies
//! backpressure to the stages before it:
//!
//! ```text
//! source -> calibrate (decode + calibrate) -> grid -> image -> sink
//! ```
//!
//! Spans that fail to decode or calibrate are never passed on. Depending on
//! the configured [`SpanErrorPolicy`], the failure is recorded and the run
//! continues, or the whole run halts.

use std::thread::scope;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, trace, warn};
use marlu::c64;
use ndarray::prelude::*;

use crate::{
    calibrate::CalibrationEngine,
    config::{PipelineConfig, SpanErrorPolicy},
    error::{FormatError, PipelineError, ReadError, SpanErrorKind, SpanFailure},
    gridding::Gridder,
    imaging::ImageSynthesizer,
    read::SpanSource,
    record::{decode_span, UvSpan},
    write::{write_images, ImageSink},
};

/// What happened in a pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSummary {
    pub spans_read: usize,
    pub images_written: usize,

    /// Spans that were skipped, in the order they failed.
    pub failures: Vec<SpanFailure>,
}

/// Read spans from `source`, calibrate, grid and image them, and write the
/// images to `sink`.
pub fn run_pipeline<S, K>(
    config: &PipelineConfig,
    source: &mut S,
    sink: &mut K,
    progress_bars: bool,
) -> Result<PipelineSummary, PipelineError>
where
    S: SpanSource + ?Sized,
    K: ImageSink + ?Sized,
{
    config.validate()?;
    let engine = if config.calibration.enabled {
        let engine = CalibrationEngine::new(config)?;
        info!(
            "Calibrating antennas {:?} (perturbation scale {}, seed {})",
            engine.antennas(),
            config.calibration.perturbation_scale,
            config.calibration.seed
        );
        Some(engine)
    } else {
        info!("Calibration is disabled; spans pass through uncalibrated");
        None
    };
    let gridder = Gridder::new(config);
    let synthesizer = ImageSynthesizer::new(config.fft_size);
    info!(
        "{} antennas, {} baselines per span ({} bytes); {} gridding on a {}x{} grid",
        config.n_stands,
        config.num_baselines(),
        config.span_size_bytes(),
        config.gridding_mode,
        config.fft_size,
        config.fft_size,
    );
    if !config.flagged_antennas.is_empty() {
        info!("Flagged antennas: {:?}", config.flagged_antennas);
    }

    let num_spans_hint = source.num_spans_hint();
    let multi_progress = MultiProgress::with_draw_target(if progress_bars {
        ProgressDrawTarget::stdout()
    } else {
        ProgressDrawTarget::hidden()
    });
    let cal_progress = multi_progress.add(make_progress_bar(num_spans_hint, "Calibrating"));
    let write_progress = multi_progress.add(make_progress_bar(num_spans_hint, "Imaging"));
    cal_progress.tick();
    write_progress.tick();

    let (tx_raw, rx_raw) = bounded(config.channel_capacity);
    let (tx_cal, rx_cal) = bounded(config.channel_capacity);
    let (tx_grid, rx_grid) = bounded(config.channel_capacity);
    let (tx_image, rx_image) = bounded(config.channel_capacity);
    let error = AtomicCell::new(false);

    let (read_result, cal_result, grid_result, image_result, write_result) = scope(|s| {
        let error = &error;
        let engine = engine.as_ref();
        let gridder = &gridder;
        let synthesizer = &synthesizer;

        let read_handle = {
            let bars = if num_spans_hint.is_none() {
                vec![cal_progress.clone(), write_progress.clone()]
            } else {
                vec![]
            };
            s.spawn(move || read_spans(source, tx_raw, error, &bars))
        };
        let cal_handle = s.spawn(move || {
            calibrate_spans(config, engine, rx_raw, tx_cal, error, cal_progress)
        });
        let grid_handle = s.spawn(move || grid_spans(gridder, rx_cal, tx_grid, error));
        let image_handle = s.spawn(move || image_grids(synthesizer, rx_grid, tx_image, error));
        let write_handle =
            s.spawn(move || write_images(sink, rx_image, error, Some(write_progress)));

        (
            read_handle.join(),
            cal_handle.join(),
            grid_handle.join(),
            image_handle.join(),
            write_handle.join(),
        )
    });

    let spans_read = read_result.map_err(|_| PipelineError::StagePanic("reading"))??;
    let failures = cal_result.map_err(|_| PipelineError::StagePanic("calibration"))??;
    let images_written = write_result.map_err(|_| PipelineError::StagePanic("writing"))??;
    grid_result.map_err(|_| PipelineError::StagePanic("gridding"))?;
    image_result.map_err(|_| PipelineError::StagePanic("imaging"))?;

    info!(
        "Read {spans_read} spans, wrote {images_written} images, skipped {} spans",
        failures.len()
    );
    Ok(PipelineSummary {
        spans_read,
        images_written,
        failures,
    })
}

fn make_progress_bar(len: Option<usize>, message: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} spans ({elapsed_precise}<{eta_precise})",
    )
    .map(|style| style.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(len.unwrap_or(0) as u64)
        .with_style(style)
        .with_position(0)
        .with_message(message)
}

/// Pull raw spans out of the source. If the source doesn't know how many spans
/// it has, `progress_bars` get longer as spans arrive.
fn read_spans<S: SpanSource + ?Sized>(
    source: &mut S,
    tx: Sender<(usize, Result<Vec<u8>, FormatError>)>,
    error: &AtomicCell<bool>,
    progress_bars: &[ProgressBar],
) -> Result<usize, PipelineError> {
    let mut span_index = 0;
    loop {
        // Should we continue?
        if error.load() {
            break;
        }

        match source.next_span() {
            Ok(Some(bytes)) => {
                trace!("Read span {span_index} ({} bytes)", bytes.len());
                for progress_bar in progress_bars {
                    progress_bar.inc_length(1);
                }
                if tx.send((span_index, Ok(bytes))).is_err() {
                    break;
                }
                span_index += 1;
            }

            Ok(None) => break,

            // Only this span is bad; let the span error policy handle it.
            Err(ReadError::Format(err)) => {
                trace!("Span {span_index} is malformed: {err}");
                for progress_bar in progress_bars {
                    progress_bar.inc_length(1);
                }
                if tx.send((span_index, Err(err))).is_err() {
                    break;
                }
                span_index += 1;
            }

            Err(err) => {
                error.store(true);
                return Err(PipelineError::Source { span_index, err });
            }
        }
    }
    debug!("Finished reading after {span_index} spans");

    Ok(span_index)
}

/// Decode and calibrate spans. Returns the spans that were skipped.
fn calibrate_spans(
    config: &PipelineConfig,
    engine: Option<&CalibrationEngine>,
    rx: Receiver<(usize, Result<Vec<u8>, FormatError>)>,
    tx: Sender<(usize, UvSpan)>,
    error: &AtomicCell<bool>,
    progress_bar: ProgressBar,
) -> Result<Vec<SpanFailure>, PipelineError> {
    let mut failures = vec![];
    for (span_index, bytes) in rx.iter() {
        // Should we continue?
        if error.load() {
            break;
        }

        let result = bytes
            .and_then(|bytes| decode_span(&bytes, config.n_stands))
            .map_err(SpanErrorKind::from)
            .and_then(|mut span| match engine {
                Some(engine) => engine
                    .calibrate_span(&mut span, span_index)
                    .map(|_| span),
                None => Ok(span),
            });
        progress_bar.inc(1);

        match result {
            Ok(span) => {
                debug!("Span {span_index} is ready for gridding");
                if tx.send((span_index, span)).is_err() {
                    break;
                }
            }

            Err(kind) => {
                let failure = SpanFailure { span_index, kind };
                match config.on_span_error {
                    SpanErrorPolicy::Skip => {
                        warn!("Skipping span. {failure}");
                        failures.push(failure);
                    }

                    SpanErrorPolicy::Halt => {
                        error.store(true);
                        progress_bar.abandon_with_message("Halted");
                        return Err(PipelineError::Halted(failure));
                    }
                }
            }
        }
    }
    progress_bar.abandon_with_message("Finished calibrating");

    Ok(failures)
}

fn grid_spans(
    gridder: &Gridder,
    rx: Receiver<(usize, UvSpan)>,
    tx: Sender<(usize, Array2<c64>)>,
    error: &AtomicCell<bool>,
) {
    for (span_index, span) in rx.iter() {
        // Should we continue?
        if error.load() {
            break;
        }

        let mut grid = Array2::zeros((gridder.fft_size(), gridder.fft_size()));
        let counts = gridder.grid_span_into(&span, grid.view_mut());
        debug!(
            "Span {span_index}: gridded {} records ({} flagged, {} off the grid)",
            counts.gridded, counts.flagged, counts.dropped
        );
        if tx.send((span_index, grid)).is_err() {
            break;
        }
    }
}

fn image_grids(
    synthesizer: &ImageSynthesizer,
    rx: Receiver<(usize, Array2<c64>)>,
    tx: Sender<(usize, Array2<f64>)>,
    error: &AtomicCell<bool>,
) {
    for (span_index, grid) in rx.iter() {
        // Should we continue?
        if error.load() {
            break;
        }

        let image = synthesizer.synthesize(grid.view());
        trace!("Span {span_index}: imaged");
        if tx.send((span_index, image)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use marlu::c32;

    use super::*;
    use crate::{
        config::CalibrationConfig,
        error::{ConfigurationError, WriteError},
        read::{TextSpanSource, VecSpanSource},
        record::{baseline_pairs, encode_span, BaselineRecord},
        write::RawImageWriter,
    };

    /// Four antennas, gridded onto an 8x8 grid, with no perturbation.
    fn small_config() -> PipelineConfig {
        PipelineConfig {
            n_stands: 4,
            fft_size: 8,
            calibration: CalibrationConfig {
                num_stands: 4,
                perturbation_scale: 0.0,
                seed: 42,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// All u, v are within [-0.4, 0.4], so every record rounds to the
    /// centre cell.
    fn small_span() -> UvSpan {
        let records = baseline_pairs(4)
            .into_iter()
            .enumerate()
            .map(|(i, (a1, a2))| {
                BaselineRecord::new(
                    a1,
                    a2,
                    0.1 * (i % 5) as f32 - 0.2,
                    0.4 - 0.08 * i as f32,
                    c32::new(0.1 * (i + 1) as f32, 0.05 - 0.02 * i as f32),
                )
            })
            .collect();
        UvSpan::new(4, records).unwrap()
    }

    #[test]
    fn test_end_to_end() {
        let config = small_config();
        let span = small_span();
        assert_eq!(span.len(), 10);

        // Calibration gives back the input.
        let engine = CalibrationEngine::new(&config).unwrap();
        let mut calibrated = span.clone();
        engine.calibrate_span(&mut calibrated, 0).unwrap();
        for (a, b) in span.records().iter().zip(calibrated.records()) {
            assert_abs_diff_eq!(a.vis, b.vis, epsilon = 1e-5);
        }

        // Only the 3x3 cells around the centre are touched.
        let grid = Gridder::new(&config).grid_span(&span);
        for ((x, y), g) in grid.indexed_iter() {
            if (3..=5).contains(&x) && (3..=5).contains(&y) {
                assert!(g.norm() > 0.0, "({x}, {y})");
            } else {
                assert_eq!(*g, c64::default(), "({x}, {y})");
            }
        }

        let mut source = VecSpanSource::new(vec![encode_span(&span)]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];
        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(
            summary,
            PipelineSummary {
                spans_read: 1,
                images_written: 1,
                failures: vec![]
            }
        );

        assert_eq!(sink.len(), 1);
        let (span_index, image) = &sink[0];
        assert_eq!(*span_index, 0);
        assert_eq!(image.dim(), (8, 8));
        assert!(image.iter().all(|p| p.is_finite()));
        let expected = ImageSynthesizer::new(8).synthesize(grid.view());
        assert_abs_diff_eq!(image, &expected, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_span_images_to_zero_without_calibration() {
        let mut config = small_config();
        config.calibration.enabled = false;
        let mut source = VecSpanSource::new(vec![encode_span(&UvSpan::zeroed(4)); 3]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];
        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(summary.images_written, 3);
        for (i, (span_index, image)) in sink.iter().enumerate() {
            assert_eq!(*span_index, i);
            assert!(image.iter().all(|&p| p == 0.0));
        }
    }

    #[test]
    fn test_zero_span_images_to_zero_with_calibration() {
        let mut config = small_config();
        config.calibration = CalibrationConfig {
            num_stands: 4,
            seed: 42,
            ..Default::default()
        };
        let mut source = VecSpanSource::new(vec![encode_span(&UvSpan::zeroed(4)); 2]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];
        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(summary.images_written, 2);
        assert!(summary.failures.is_empty());
        for (_, image) in &sink {
            assert!(image.iter().all(|&p| p == 0.0));
        }
    }

    #[test]
    fn test_bad_text_rows_only_skip_their_span() {
        let config = small_config();
        let mut text = String::new();
        for i_span in 0..3 {
            for (i, r) in small_span().records().iter().enumerate() {
                if i_span == 1 && i == 4 {
                    text.push_str("4 1 2 0.1 nope 1.0 0.0\n");
                } else {
                    text.push_str(&format!(
                        "{i} {} {} {} {} {} {}\n",
                        r.antenna1, r.antenna2, r.u, r.v, r.vis.re, r.vis.im
                    ));
                }
            }
        }
        let mut source = TextSpanSource::new(std::io::Cursor::new(text), 4);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];

        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(summary.spans_read, 3);
        assert_eq!(summary.images_written, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].span_index, 1);
        assert!(matches!(
            summary.failures[0].kind,
            SpanErrorKind::Format(FormatError::BadTextRow { line: 15, .. })
        ));
        let indices: Vec<usize> = sink.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_abs_diff_eq!(sink[0].1, sink[1].1, epsilon = 1e-5);
    }

    #[test]
    fn test_bad_spans_are_skipped() {
        let config = small_config();
        let good = encode_span(&small_span());
        let short = good[..good.len() - 24].to_vec();
        let mut source = VecSpanSource::new(vec![good.clone(), short, good.clone()]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];

        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(summary.spans_read, 3);
        assert_eq!(summary.images_written, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].span_index, 1);
        assert!(matches!(
            summary.failures[0].kind,
            SpanErrorKind::Format(FormatError::BadSpanLength { .. })
        ));
        let indices: Vec<usize> = sink.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_bad_spans_halt() {
        let mut config = small_config();
        config.on_span_error = SpanErrorPolicy::Halt;
        let good = encode_span(&small_span());
        let short = good[..good.len() - 24].to_vec();
        let mut source = VecSpanSource::new(vec![good.clone(), short, good.clone()]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];

        let result = run_pipeline(&config, &mut source, &mut sink, false);
        match result {
            Err(PipelineError::Halted(failure)) => assert_eq!(failure.span_index, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        // Nothing after the failed span gets through.
        assert!(sink.iter().all(|(i, _)| *i == 0));
    }

    #[test]
    fn test_calibration_failures_are_skipped() {
        let config = small_config();
        let mut bad = small_span();
        bad.records_mut()[1].vis = c32::new(f32::NAN, 0.0);
        let mut source = VecSpanSource::new(vec![encode_span(&small_span()), encode_span(&bad)]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];

        let summary = run_pipeline(&config, &mut source, &mut sink, false).unwrap();
        assert_eq!(summary.images_written, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].span_index, 1);
        assert!(matches!(
            summary.failures[0].kind,
            SpanErrorKind::Calibration(_)
        ));
    }

    struct FailingSource {
        good: Vec<u8>,
        calls: usize,
    }

    impl SpanSource for FailingSource {
        fn next_span(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
            self.calls += 1;
            if self.calls > 2 {
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "gone").into())
            } else {
                Ok(Some(self.good.clone()))
            }
        }
    }

    #[test]
    fn test_source_errors_stop_the_run() {
        let config = small_config();
        let mut source = FailingSource {
            good: encode_span(&small_span()),
            calls: 0,
        };
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];
        let result = run_pipeline(&config, &mut source, &mut sink, false);
        assert!(matches!(
            result,
            Err(PipelineError::Source { span_index: 2, .. })
        ));
    }

    #[test]
    fn test_sink_errors_stop_the_run() {
        let config = small_config();
        let mut source = VecSpanSource::new(vec![encode_span(&small_span()); 4]);
        // The wrong image size.
        let mut sink = RawImageWriter::new(vec![], 16);
        let result = run_pipeline(&config, &mut source, &mut sink, false);
        assert!(matches!(
            result,
            Err(PipelineError::Sink {
                span_index: 0,
                err: WriteError::BadImageShape { .. }
            })
        ));
    }

    #[test]
    fn test_invalid_config_fails_before_reading() {
        let mut config = small_config();
        config.fft_size = 7;
        let mut source = VecSpanSource::new(vec![encode_span(&small_span())]);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];
        let result = run_pipeline(&config, &mut source, &mut sink, false);
        assert!(matches!(
            result,
            Err(PipelineError::Configuration(ConfigurationError::FftSizeOdd(7)))
        ));
        assert_eq!(source.next_span().unwrap().map(|s| s.len()), Some(240));
    }
}
