//! Iterative per-antenna gain solver.
//!
//! This is "MitchCal", equation 11 of Mitchell et al.
//! <https://ui.adsabs.harvard.edu/abs/2008ISTSP...2..707M/abstract>, with the
//! StEFCal trick of averaging the last two solutions on every even iteration.
//! Gains are scalars here, so there are no polarisation terms to worry about.

use log::{debug, warn};
use marlu::c64;
use ndarray::prelude::*;

use crate::error::CalibrationError;

/// Information on how a solve went.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationResult {
    pub num_iterations: u32,

    /// The largest squared change in any antenna's gain over the last
    /// iteration.
    pub max_precision: f64,

    /// Did the solve get below the stop threshold?
    pub converged: bool,
}

/// Find the `gains` that best satisfy `data[i][j] = gains[i] * model[i][j] *
/// conj(gains[j])` for all `i < j`. Only the upper triangles of `data` and
/// `model` are read. `gains` should contain a starting guess.
///
/// An antenna whose data are all exactly zero and that isn't constrained by the
/// model keeps its starting gain. Non-zero data against a zero model is
/// [`CalibrationError::Singular`].
///
/// `antennas` maps matrix indices to antenna numbers; it's only used for error
/// reporting.
pub(crate) fn solve_gains(
    data: ArrayView2<c64>,
    model: ArrayView2<c64>,
    mut gains: ArrayViewMut1<c64>,
    antennas: &[usize],
    max_iterations: u32,
    stop_threshold: f64,
    min_threshold: f64,
) -> Result<CalibrationResult, CalibrationError> {
    let num_antennas = gains.len();
    assert_eq!(data.dim(), (num_antennas, num_antennas));
    assert_eq!(model.dim(), (num_antennas, num_antennas));
    assert_eq!(antennas.len(), num_antennas);

    // An antenna without any data (e.g. a dead antenna) keeps its starting
    // gain; there is nothing to solve for.
    let no_data: Vec<bool> = (0..num_antennas)
        .map(|i| {
            (0..num_antennas)
                .filter(|&j| j != i)
                .all(|j| data[[i.min(j), i.max(j)]] == c64::default())
        })
        .collect();

    let mut old_gains = gains.to_owned();
    let mut top: Array1<c64> = Array1::zeros(num_antennas);
    let mut bot: Array1<f64> = Array1::zeros(num_antennas);
    let mut max_precision = f64::INFINITY;
    let mut converged = false;

    let mut iteration = 0;
    while iteration < max_iterations {
        iteration += 1;
        top.fill(c64::default());
        bot.fill(0.0);

        calibration_loop(data, model, gains.view(), top.view_mut(), bot.view_mut());

        for (i, ((gain, top), bot)) in gains
            .iter_mut()
            .zip(top.iter())
            .zip(bot.iter())
            .enumerate()
        {
            if no_data[i] && *bot == 0.0 {
                continue;
            }
            // The negation catches NaN.
            if !(*bot > 0.0) || !bot.is_finite() {
                return Err(CalibrationError::Singular {
                    antenna: antennas[i],
                });
            }
            let new = top / bot;
            if !new.is_finite() {
                return Err(CalibrationError::Singular {
                    antenna: antennas[i],
                });
            }
            *gain = new;
        }

        max_precision = gains
            .iter()
            .zip(old_gains.iter())
            .map(|(new, old)| (new - old).norm_sqr())
            .fold(0.0, f64::max);

        // On every even iteration, test for convergence and set the new gains
        // as the average of the last two.
        if iteration % 2 == 0 {
            gains
                .iter_mut()
                .zip(old_gains.iter())
                .for_each(|(new, old)| *new = (*new + old) * 0.5);

            if max_precision < stop_threshold {
                converged = true;
                break;
            }
        }
        old_gains.assign(&gains);
    }

    if max_precision > min_threshold {
        return Err(CalibrationError::NotConverged {
            num_iterations: iteration,
            max_precision,
            min_threshold,
        });
    }
    if converged {
        debug!("Converged ({iteration:>2}): {stop_threshold:e} > {max_precision:.5e}");
    } else {
        warn!(
            "Converged ({iteration:>2}): {min_threshold:e} > {max_precision:.5e} > {stop_threshold:e}"
        );
    }

    Ok(CalibrationResult {
        num_iterations: iteration,
        max_precision,
        converged,
    })
}

/// Sum the numerator ("top") and denominator ("bot") of each antenna's next
/// gain.
fn calibration_loop(
    data: ArrayView2<c64>,
    model: ArrayView2<c64>,
    gains: ArrayView1<c64>,
    mut top: ArrayViewMut1<c64>,
    mut bot: ArrayViewMut1<f64>,
) {
    let num_antennas = gains.len();
    for i1 in 0..num_antennas {
        for i2 in i1 + 1..num_antennas {
            let d = data[[i1, i2]];
            let m = model[[i1, i2]];

            // For antenna 1, ( D G2 M* ) / |G2 M*|^2
            let z = gains[i2] * m.conj();
            top[i1] += d * z;
            bot[i1] += z.norm_sqr();

            // For antenna 2, ( D* G1 M ) / |G1 M|^2
            let z = gains[i1] * m;
            top[i2] += d.conj() * z;
            bot[i2] += z.norm_sqr();
        }
    }
}
