//! Accumulate the visibilities of a span onto a regular UV grid.
//!
//! The grid is `fft_size x fft_size` with its origin at the centre; the cell
//! for integer coordinates `(x, y)` is `grid[[x + fft_size / 2, y + fft_size /
//! 2]]`, so the first axis is u. Only coordinates in `[-fft_size / 2, fft_size
//! / 2)` exist on the grid.

use itertools::iproduct;
use log::trace;
use marlu::{c32, c64};
use ndarray::prelude::*;

use crate::{
    config::{GriddingMode, PipelineConfig},
    constants::GAUSSIAN_KERNEL_WIDTH,
    record::UvSpan,
};

/// The Gaussian gridding kernel, evaluated at an offset from a visibility's
/// position.
#[inline]
pub fn kernel_weight(dx: f64, dy: f64) -> f64 {
    (-(dx * dx / GAUSSIAN_KERNEL_WIDTH + dy * dy / GAUSSIAN_KERNEL_WIDTH)).exp()
}

/// The sum of [`kernel_weight`] over the 3x3 integer offsets. Every deposit
/// is normalised by this, whatever its sub-cell offset.
pub fn kernel_normalisation() -> f64 {
    iproduct!(-1..=1, -1..=1)
        .map(|(dx, dy)| kernel_weight(f64::from(dx), f64::from(dy)))
        .sum()
}

/// How many records of a span ended up on the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridCounts {
    pub gridded: usize,

    /// Records skipped because an antenna is flagged.
    pub flagged: usize,

    /// Records whose nearest cell is off the grid (or whose coordinates aren't
    /// finite).
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct Gridder {
    fft_size: usize,
    mode: GriddingMode,
    conjugate_symmetry: bool,

    /// Indexed by antenna number.
    flags: Vec<bool>,

    g_sum: f64,
}

impl Gridder {
    pub fn new(config: &PipelineConfig) -> Gridder {
        let mut flags = vec![false; config.n_stands];
        for &a in &config.flagged_antennas {
            if let Some(f) = flags.get_mut(a) {
                *f = true;
            }
        }
        Gridder {
            fft_size: config.fft_size,
            mode: config.gridding_mode,
            conjugate_symmetry: config.conjugate_symmetry,
            flags,
            g_sum: kernel_normalisation(),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn is_flagged(&self, antenna: usize) -> bool {
        self.flags.get(antenna).copied().unwrap_or(false)
    }

    /// Grid a span onto a new grid.
    pub fn grid_span(&self, span: &UvSpan) -> Array2<c64> {
        let mut grid = Array2::zeros((self.fft_size, self.fft_size));
        self.grid_span_into(span, grid.view_mut());
        grid
    }

    /// Grid a span onto an existing grid. The grid is zeroed first.
    ///
    /// # Panics
    ///
    /// Panics if `grid` isn't `fft_size x fft_size`.
    pub fn grid_span_into(&self, span: &UvSpan, mut grid: ArrayViewMut2<c64>) -> GridCounts {
        assert_eq!(grid.dim(), (self.fft_size, self.fft_size));
        grid.fill(c64::default());

        let mut counts = GridCounts::default();
        for record in span.records() {
            if self.is_flagged(record.antenna1) || self.is_flagged(record.antenna2) {
                counts.flagged += 1;
                continue;
            }

            let u = f64::from(record.u);
            let v = f64::from(record.v);
            if !self.deposit(grid.view_mut(), u, v, record.vis) {
                counts.dropped += 1;
                continue;
            }
            if self.conjugate_symmetry {
                self.deposit(grid.view_mut(), -u, -v, record.vis.conj());
            }
            counts.gridded += 1;
        }
        trace!(
            "Gridded {} records ({} flagged, {} off the grid)",
            counts.gridded,
            counts.flagged,
            counts.dropped
        );

        counts
    }

    /// Add a visibility to the grid. Returns false (having added nothing) if
    /// the nearest cell isn't on the grid.
    fn deposit(&self, mut grid: ArrayViewMut2<c64>, u: f64, v: f64, vis: c32) -> bool {
        let (x0, y0) = match (self.cell(u), self.cell(v)) {
            (Some(x0), Some(y0)) => (x0, y0),
            _ => return false,
        };
        let vis = c64::new(vis.re.into(), vis.im.into());
        let half = (self.fft_size / 2) as i64;

        match self.mode {
            GriddingMode::Nearest => {
                grid[[(x0 + half) as usize, (y0 + half) as usize]] += vis;
            }

            GriddingMode::Gaussian => {
                for dx in -1..=1 {
                    let x = x0 + dx;
                    if !self.on_grid(x) {
                        continue;
                    }
                    for dy in -1..=1 {
                        let y = y0 + dy;
                        if !self.on_grid(y) {
                            continue;
                        }
                        let w = kernel_weight(x as f64 - u, y as f64 - v) / self.g_sum;
                        grid[[(x + half) as usize, (y + half) as usize]] += vis * w;
                    }
                }
            }
        }

        true
    }

    /// The nearest integer coordinate, if it's on the grid.
    fn cell(&self, coord: f64) -> Option<i64> {
        if !coord.is_finite() {
            return None;
        }
        let c = coord.round();
        let half = (self.fft_size / 2) as f64;
        if c < -half || c >= half {
            None
        } else {
            Some(c as i64)
        }
    }

    #[inline]
    fn on_grid(&self, c: i64) -> bool {
        let half = (self.fft_size / 2) as i64;
        (-half..half).contains(&c)
    }
}
