use approx::assert_abs_diff_eq;
use marlu::c32;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::*;
use crate::{
    config::{CalibrationConfig, PipelineConfig},
    record::{baseline_pairs, BaselineRecord},
};

fn random_span(n_stands: usize, seed: u64) -> UvSpan {
    let mut rng = StdRng::seed_from_u64(seed);
    let records = baseline_pairs(n_stands)
        .into_iter()
        .map(|(a1, a2)| {
            BaselineRecord::new(
                a1,
                a2,
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-3.0..3.0),
                c32::new(rng.gen_range(0.5..2.0), rng.gen_range(-1.0..1.0)),
            )
        })
        .collect();
    UvSpan::new(n_stands, records).unwrap()
}

fn test_config(n_stands: usize, num_stands: usize, perturbation_scale: f64) -> PipelineConfig {
    PipelineConfig {
        n_stands,
        fft_size: 8,
        calibration: CalibrationConfig {
            num_stands,
            perturbation_scale,
            seed: 1234,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn assert_vis_close(a: &UvSpan, b: &UvSpan, epsilon: f32) {
    for (ra, rb) in a.records().iter().zip(b.records()) {
        assert_eq!(ra.antenna1, rb.antenna1);
        assert_eq!(ra.antenna2, rb.antenna2);
        assert_eq!(ra.u, rb.u);
        assert_eq!(ra.v, rb.v);
        assert_abs_diff_eq!(ra.vis, rb.vis, epsilon = epsilon);
    }
}

#[test]
fn test_identity_hidden_gains_recover_input() {
    for num_stands in 2..=8 {
        let config = test_config(10, num_stands, 0.0);
        let engine = CalibrationEngine::new(&config).unwrap();
        let original = random_span(10, num_stands as u64);
        let mut span = original.clone();

        let result = engine.calibrate_span(&mut span, 3).unwrap();
        assert!(result.converged, "num_stands {num_stands}");
        assert_vis_close(&span, &original, 1e-4);
    }
}

#[test]
fn test_hidden_gains_are_identity_without_perturbation() {
    let mut rng = StdRng::seed_from_u64(7);
    let hidden = generate_hidden_gains(&mut rng, 16, 0.0);
    for h in hidden {
        assert_eq!(h, c64::new(1.0, 0.0));
    }
}

#[test]
fn test_perturbed_gains_are_recovered() {
    let mut config = test_config(8, 8, 0.1);
    config.calibration.max_iterations = 200;
    config.calibration.stop_threshold = 1e-14;
    let engine = CalibrationEngine::new(&config).unwrap();
    let original = random_span(8, 99);

    for span_index in 0..5 {
        let mut span = original.clone();
        let result = engine.calibrate_span(&mut span, span_index).unwrap();
        assert!(result.converged);
        assert_vis_close(&span, &original, 1e-3);
    }
}

#[test]
fn test_perturbation_changes_visibilities() {
    let n = 6;
    let mut rng = StdRng::seed_from_u64(5);
    let v = Array2::from_shape_fn((n, n), |(i, j)| {
        if i < j {
            c64::new(rng.gen_range(0.5..2.0), rng.gen_range(-1.0..1.0))
        } else {
            c64::default()
        }
    });
    let j = generate_model_gains(&mut rng, n);
    let p = create_model(&v, &j);

    // Identity hidden gains give back the input.
    let identity = Array1::from_elem(n, c64::new(1.0, 0.0));
    let x = perturb(&p, &j, &identity);
    assert_abs_diff_eq!(x, v, epsilon = 1e-12);

    let hidden = generate_hidden_gains(&mut rng, n, 0.1);
    let x = perturb(&p, &j, &hidden);
    assert!(x
        .indexed_iter()
        .filter(|((i, j), _)| i < j)
        .any(|(ij, x)| (x - v[ij]).norm() > 1e-3));
}

#[test]
fn test_model_gain_ranges() {
    let mut rng = StdRng::seed_from_u64(0);
    let gains = generate_model_gains(&mut rng, 1000);
    assert!(gains.iter().all(|g| (0.5..1.5).contains(&g.norm())));

    let hidden = generate_hidden_gains(&mut rng, 1000, 0.1);
    assert!(hidden
        .iter()
        .all(|h| (0.9..=1.1).contains(&h.norm()) && h.arg().abs() <= 0.1 * std::f64::consts::PI));
}

#[test]
fn test_calibration_is_reproducible_per_span() {
    let config = test_config(6, 6, 0.1);
    let engine = CalibrationEngine::new(&config).unwrap();
    let original = random_span(6, 1);

    let mut a = original.clone();
    let mut b = original.clone();
    let result_a = engine.calibrate_span(&mut a, 4).unwrap();
    let result_b = engine.calibrate_span(&mut b, 4).unwrap();
    assert_eq!(a, b);
    assert_eq!(result_a, result_b);
}

#[test]
fn test_records_outside_subset_are_untouched() {
    let config = test_config(6, 3, 0.1);
    let engine = CalibrationEngine::new(&config).unwrap();
    let original = random_span(6, 2);
    let mut span = original.clone();
    engine.calibrate_span(&mut span, 0).unwrap();

    for (before, after) in original.records().iter().zip(span.records()) {
        let in_subset =
            before.antenna1 < 3 && before.antenna2 < 3 && before.antenna1 != before.antenna2;
        if !in_subset {
            assert_eq!(before, after);
        }
    }
}

#[test]
fn test_flagged_antenna_is_excluded() {
    let mut config = test_config(4, 4, 0.1);
    config.flagged_antennas.insert(1);
    let engine = CalibrationEngine::new(&config).unwrap();
    assert_eq!(engine.antennas(), &[0, 2, 3]);

    let original = random_span(4, 3);
    let mut span = original.clone();
    engine.calibrate_span(&mut span, 0).unwrap();
    for (before, after) in original.records().iter().zip(span.records()) {
        if before.involves(1) {
            assert_eq!(before, after);
        }
    }
}

#[test]
fn test_reversed_pairs_are_conjugated() {
    let config = test_config(4, 4, 0.0);
    let engine = CalibrationEngine::new(&config).unwrap();
    let mut original = random_span(4, 4);
    // Store baseline (0, 2) as (2, 0); its visibility is then the conjugate.
    let r = &mut original.records_mut()[2];
    assert_eq!((r.antenna1, r.antenna2), (0, 2));
    r.antenna1 = 2;
    r.antenna2 = 0;
    r.vis = r.vis.conj();

    let mut span = original.clone();
    engine.calibrate_span(&mut span, 0).unwrap();
    assert_vis_close(&span, &original, 1e-4);
    assert_eq!(span.records()[2].antenna1, 2);
}

#[test]
fn test_missing_baseline_is_a_format_error() {
    let config = test_config(4, 4, 0.1);
    let engine = CalibrationEngine::new(&config).unwrap();
    let mut span = random_span(4, 5);
    // Replace baseline (0, 1) with a duplicate auto-correlation.
    span.records_mut()[1].antenna2 = 0;
    let original = span.clone();

    let result = engine.calibrate_span(&mut span, 0);
    assert_eq!(
        result,
        Err(SpanErrorKind::Format(FormatError::MissingBaseline {
            antenna1: 0,
            antenna2: 1
        }))
    );
    assert_eq!(span, original);
}

#[test]
fn test_duplicate_baseline_is_a_format_error() {
    let config = test_config(5, 4, 0.1);
    let engine = CalibrationEngine::new(&config).unwrap();
    let mut span = random_span(5, 6);
    // Turn baseline (1, 4) into a second, reversed copy of (2, 1).
    let i_record = span
        .records()
        .iter()
        .position(|r| (r.antenna1, r.antenna2) == (1, 4))
        .unwrap();
    span.records_mut()[i_record].antenna1 = 2;
    span.records_mut()[i_record].antenna2 = 1;
    let original = span.clone();

    let result = engine.calibrate_span(&mut span, 0);
    assert_eq!(
        result,
        Err(SpanErrorKind::Format(FormatError::DuplicateBaseline {
            antenna1: 1,
            antenna2: 2
        }))
    );
    assert_eq!(span, original);
}

#[test]
fn test_zero_span_stays_zero() {
    let config = test_config(4, 4, 0.1);
    let engine = CalibrationEngine::new(&config).unwrap();
    let mut span = UvSpan::zeroed(4);

    let result = engine.calibrate_span(&mut span, 0).unwrap();
    assert!(result.converged);
    assert_eq!(span, UvSpan::zeroed(4));
}

#[test]
fn test_dead_antenna_is_not_a_failure() {
    let mut config = test_config(6, 6, 0.1);
    config.calibration.max_iterations = 200;
    config.calibration.stop_threshold = 1e-14;
    let engine = CalibrationEngine::new(&config).unwrap();
    let mut original = random_span(6, 21);
    for r in original.records_mut() {
        if r.involves(4) {
            r.vis = c32::default();
        }
    }
    let mut span = original.clone();

    engine.calibrate_span(&mut span, 0).unwrap();
    assert_vis_close(&span, &original, 1e-3);
}

#[test]
fn test_too_few_antennas() {
    let mut config = test_config(4, 2, 0.1);
    config.flagged_antennas.insert(0);
    assert!(matches!(
        CalibrationEngine::new(&config),
        Err(ConfigurationError::TooFewCalAntennas { available: 1, .. })
    ));
}
