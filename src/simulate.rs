//! Synthetic spans, for testing and demonstrations.
//!
//! All positions and coordinates are in grid units (pixels), so the UV
//! coordinates of a baseline are just the difference of its antenna
//! positions.

use std::f64::consts::{PI, TAU};

use marlu::c32;
use rand::Rng;

use crate::record::UvSpan;

/// A point source at pixel offset `(l, m)` from the image centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSource {
    pub l: f64,
    pub m: f64,
    pub flux: f64,
}

/// Antenna positions of a made-up array.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedArray {
    /// `(x, y)` per antenna \[pixels\].
    positions: Vec<(f64, f64)>,
    fft_size: usize,
}

impl SimulatedArray {
    /// Scatter `n_stands` antennas uniformly over a disc small enough that
    /// every baseline (and its gridding kernel) fits on an `fft_size` grid.
    pub fn new<R: Rng>(rng: &mut R, n_stands: usize, fft_size: usize) -> SimulatedArray {
        let radius = Self::max_radius(fft_size);
        let positions = (0..n_stands)
            .map(|_| {
                let r = radius * rng.gen::<f64>().sqrt();
                let theta = rng.gen_range(0.0..TAU);
                let (s, c) = theta.sin_cos();
                (r * c, r * s)
            })
            .collect();
        SimulatedArray {
            positions,
            fft_size,
        }
    }

    /// The radius of the disc that antennas are placed in. Baselines can be
    /// up to twice this long.
    pub fn max_radius(fft_size: usize) -> f64 {
        (fft_size as f64 / 4.0 - 1.0).max(0.0)
    }

    pub fn n_stands(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[(f64, f64)] {
        &self.positions
    }

    /// The same array, rotated about its centre by `angle` \[radians\]. This
    /// mimics the sky rotating over an observation.
    pub fn rotated(&self, angle: f64) -> SimulatedArray {
        let (s, c) = angle.sin_cos();
        SimulatedArray {
            positions: self
                .positions
                .iter()
                .map(|&(x, y)| (x * c - y * s, x * s + y * c))
                .collect(),
            fft_size: self.fft_size,
        }
    }

    /// The UV coordinates of the baseline between two antennas.
    pub fn baseline_uv(&self, antenna1: usize, antenna2: usize) -> (f64, f64) {
        let (x1, y1) = self.positions[antenna1];
        let (x2, y2) = self.positions[antenna2];
        (x2 - x1, y2 - y1)
    }

    /// A span observing `sources`. Auto-correlations have zero visibility.
    pub fn point_source_span(&self, sources: &[PointSource]) -> UvSpan {
        let n = self.fft_size as f64;
        let mut span = UvSpan::zeroed(self.n_stands());
        for record in span.records_mut() {
            if record.antenna1 == record.antenna2 {
                continue;
            }
            let (u, v) = self.baseline_uv(record.antenna1, record.antenna2);
            record.u = u as f32;
            record.v = v as f32;

            // Use the coordinates as they're stored.
            let (u, v) = (f64::from(record.u), f64::from(record.v));
            let (mut re, mut im) = (0.0, 0.0);
            for source in sources {
                let phase = -2.0 * PI * (u * source.l + v * source.m) / n;
                let (s, c) = phase.sin_cos();
                re += source.flux * c;
                im += source.flux * s;
            }
            record.vis = c32::new(re as f32, im as f32);
        }
        span
    }
}
