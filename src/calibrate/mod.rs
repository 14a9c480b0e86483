//! Simulated calibration of visibility spans.
//!
//! Each span is calibrated on its own, using only the span's data:
//!
//! 1. The visibilities between the calibration antennas are taken as the
//!    "perfect" visibilities `V`.
//! 2. Random per-antenna gains `J` generate a model `P = J V J^H`.
//! 3. A hidden, independent set of gains `H` corrupts the model, and the known
//!    gains are removed, giving the "perturbed" visibilities
//!    `J^-1 H P H^H J^-H` (which is `H V H^H`).
//! 4. Starting from `J`, gains `G` are solved for such that `G X G^H ~ P`,
//!    where `X` are the perturbed visibilities. The calibrated visibilities are
//!    then `J^-1 (G X G^H) J^-H`; these match `V` when the solve succeeds.
//! 5. The calibrated visibilities overwrite those in the span.

mod solve;
#[cfg(test)]
mod tests;

pub use solve::CalibrationResult;

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use log::debug;
use marlu::{c32, c64};
use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use vec1::Vec1;

use crate::{
    config::{CalibrationConfig, PipelineConfig},
    error::{CalibrationError, ConfigurationError, FormatError, SpanErrorKind},
    record::UvSpan,
};

/// The per-antenna gains (scalar Jones matrices) of one calibration pass.
pub type Gains = Array1<c64>;

/// Visibilities between calibration antennas. Only the upper triangle (`i <
/// j`) is used; indices are positions in the calibration antenna list, not
/// antenna numbers.
pub type VisibilityMatrix = Array2<c64>;

/// Where the records for each calibration baseline live in a span.
struct BaselineLookup {
    /// `[i][j]` (for `i < j`) is the index of the record between calibration
    /// antennas `i` and `j`, and whether that record stores the pair swapped
    /// (i.e. holds `V[j][i]`, the conjugate).
    record_indices: Array2<Option<(usize, bool)>>,
}

impl BaselineLookup {
    fn new(span: &UvSpan, antennas: &[usize]) -> Result<BaselineLookup, FormatError> {
        let records = span.records();
        let in_set: HashSet<usize> = antennas.iter().copied().collect();
        let mut by_pair: HashMap<(usize, usize), usize> = HashMap::new();
        for (i_record, r) in records.iter().enumerate() {
            let pair = (r.antenna1.min(r.antenna2), r.antenna1.max(r.antenna2));
            if pair.0 == pair.1 || !in_set.contains(&pair.0) || !in_set.contains(&pair.1) {
                continue;
            }
            if by_pair.insert(pair, i_record).is_some() {
                return Err(FormatError::DuplicateBaseline {
                    antenna1: pair.0,
                    antenna2: pair.1,
                });
            }
        }

        let n = antennas.len();
        let mut record_indices = Array2::from_elem((n, n), None);
        for ((i, &a1), (j, &a2)) in antennas.iter().enumerate().tuple_combinations() {
            let i_record = *by_pair
                .get(&(a1.min(a2), a1.max(a2)))
                .ok_or(FormatError::MissingBaseline {
                    antenna1: a1,
                    antenna2: a2,
                })?;
            let swapped = records[i_record].antenna1 != a1;
            record_indices[[i, j]] = Some((i_record, swapped));
        }
        Ok(BaselineLookup { record_indices })
    }

    fn iter(&self) -> impl Iterator<Item = ((usize, usize), usize, bool)> + '_ {
        self.record_indices
            .indexed_iter()
            .filter_map(|(ij, found)| found.map(|(i_record, swapped)| (ij, i_record, swapped)))
    }
}

/// Calibrates spans using a simulate/perturb/recover cycle on a subset of
/// antennas.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    config: CalibrationConfig,

    /// The (unflagged) antennas taking part in calibration.
    antennas: Vec1<usize>,
}

impl CalibrationEngine {
    pub fn new(config: &PipelineConfig) -> Result<CalibrationEngine, ConfigurationError> {
        let antennas = config.calibration_antennas();
        let available = antennas.len();
        let antennas = match Vec1::try_from_vec(antennas) {
            Ok(a) if available >= 2 => a,
            _ => {
                return Err(ConfigurationError::TooFewCalAntennas {
                    available,
                    num_stands: config.calibration.num_stands,
                })
            }
        };
        Ok(CalibrationEngine {
            config: config.calibration.clone(),
            antennas,
        })
    }

    pub fn antennas(&self) -> &[usize] {
        self.antennas.as_slice()
    }

    /// Calibrate `span` in place. Only the visibilities of records between
    /// two calibration antennas are touched; if an error is returned, the
    /// span is unmodified.
    pub fn calibrate_span(
        &self,
        span: &mut UvSpan,
        span_index: usize,
    ) -> Result<CalibrationResult, SpanErrorKind> {
        let antennas = self.antennas.as_slice();
        let lookup = BaselineLookup::new(span, antennas)?;
        let perfect_v = extract_visibilities(span, &lookup, antennas.len());

        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(span_index as u64));
        let perfect_j = generate_model_gains(&mut rng, antennas.len());
        let perfect_p = create_model(&perfect_v, &perfect_j);
        let hidden_j = generate_hidden_gains(
            &mut rng,
            antennas.len(),
            self.config.perturbation_scale,
        );
        let perturbed_v = perturb(&perfect_p, &perfect_j, &hidden_j);

        let (calibrated_v, result) = solve(
            &perturbed_v,
            &perfect_j,
            &perfect_p,
            antennas,
            &self.config,
        )?;
        debug!(
            "Span {span_index}: calibrated {} antennas in {} iterations (precision {:.5e})",
            antennas.len(),
            result.num_iterations,
            result.max_precision
        );

        apply_visibilities(span, &lookup, &calibrated_v, antennas)?;
        Ok(result)
    }
}

/// Read the visibilities between calibration antennas out of a span.
fn extract_visibilities(span: &UvSpan, lookup: &BaselineLookup, n: usize) -> VisibilityMatrix {
    let records = span.records();
    let mut v = Array2::zeros((n, n));
    for ((i, j), i_record, swapped) in lookup.iter() {
        let vis = records[i_record].vis;
        let vis = c64::new(vis.re.into(), vis.im.into());
        v[[i, j]] = if swapped { vis.conj() } else { vis };
    }
    v
}

/// Overwrite the visibilities of a span with calibrated ones. Everything is
/// checked before anything is written.
fn apply_visibilities(
    span: &mut UvSpan,
    lookup: &BaselineLookup,
    calibrated_v: &VisibilityMatrix,
    antennas: &[usize],
) -> Result<(), CalibrationError> {
    let mut new_vis = Vec::with_capacity(calibrated_v.len());
    for ((i, j), i_record, swapped) in lookup.iter() {
        let v = calibrated_v[[i, j]];
        let v = if swapped { v.conj() } else { v };
        let vis = c32::new(v.re as f32, v.im as f32);
        if !vis.is_finite() {
            return Err(CalibrationError::NonFinite {
                antenna1: antennas[i],
                antenna2: antennas[j],
            });
        }
        new_vis.push((i_record, vis));
    }

    let records = span.records_mut();
    for (i_record, vis) in new_vis {
        records[i_record].vis = vis;
    }
    Ok(())
}

/// Gains used to build the model: amplitudes in [0.5, 1.5), any phase.
pub fn generate_model_gains<R: Rng>(rng: &mut R, n: usize) -> Gains {
    Array1::from_shape_fn(n, |_| {
        let amp = rng.gen_range(0.5..1.5);
        let phase = rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI);
        c64::from_polar(amp, phase)
    })
}

/// Gains used to perturb the model. With a `scale` of 0, these are exactly
/// identity.
pub fn generate_hidden_gains<R: Rng>(rng: &mut R, n: usize, scale: f64) -> Gains {
    Array1::from_shape_fn(n, |_| {
        let amp_offset: f64 = rng.gen_range(-1.0..1.0);
        let phase_offset: f64 = rng.gen_range(-1.0..1.0);
        c64::from_polar(
            1.0 + scale * amp_offset,
            scale * std::f64::consts::PI * phase_offset,
        )
    })
}

/// `P[i][j] = J[i] V[i][j] conj(J[j])`.
pub fn create_model(v: &VisibilityMatrix, j: &Gains) -> VisibilityMatrix {
    apply_gains(v, j)
}

/// Corrupt the model with hidden gains and remove the known gains:
/// `X[i][j] = H[i] P[i][j] conj(H[j]) / (J[i] conj(J[j]))`.
pub fn perturb(p: &VisibilityMatrix, j: &Gains, hidden: &Gains) -> VisibilityMatrix {
    let corrupted = apply_gains(p, hidden);
    remove_gains(&corrupted, j)
}

/// Recover visibilities from perturbed ones, given the model and the gains
/// used to make it.
pub fn solve(
    perturbed_v: &VisibilityMatrix,
    perfect_j: &Gains,
    perfect_p: &VisibilityMatrix,
    antennas: &[usize],
    config: &CalibrationConfig,
) -> Result<(VisibilityMatrix, CalibrationResult), CalibrationError> {
    if let Some(i) = perfect_j.iter().position(|g| !(g.norm_sqr() > 0.0)) {
        return Err(CalibrationError::Singular {
            antenna: antennas[i],
        });
    }

    let mut gains = perfect_j.clone();
    let result = solve::solve_gains(
        perfect_p.view(),
        perturbed_v.view(),
        gains.view_mut(),
        antennas,
        config.max_iterations,
        config.stop_threshold,
        config.min_threshold,
    )?;

    let solved_p = apply_gains(perturbed_v, &gains);
    let calibrated_v = remove_gains(&solved_p, perfect_j);
    for ((i, j), v) in calibrated_v.indexed_iter() {
        if i < j && !v.is_finite() {
            return Err(CalibrationError::NonFinite {
                antenna1: antennas[i],
                antenna2: antennas[j],
            });
        }
    }
    Ok((calibrated_v, result))
}

fn apply_gains(v: &VisibilityMatrix, gains: &Gains) -> VisibilityMatrix {
    let mut out = Array2::zeros(v.dim());
    for ((i, j), out) in out.indexed_iter_mut() {
        if i < j {
            *out = gains[i] * v[[i, j]] * gains[j].conj();
        }
    }
    out
}

fn remove_gains(v: &VisibilityMatrix, gains: &Gains) -> VisibilityMatrix {
    let mut out = Array2::zeros(v.dim());
    for ((i, j), out) in out.indexed_iter_mut() {
        if i < j {
            *out = v[[i, j]] / (gains[i] * gains[j].conj());
        }
    }
    out
}
