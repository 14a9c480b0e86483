//! Turn a grid into a (real-valued) image.

use std::sync::Arc;

use marlu::c64;
use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

/// Makes images from grids of one size. The FFT plan is made once and shared
/// between spans; nothing else carries over.
#[derive(Clone)]
pub struct ImageSynthesizer {
    fft_size: usize,
    fft: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for ImageSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSynthesizer")
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

impl ImageSynthesizer {
    pub fn new(fft_size: usize) -> ImageSynthesizer {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_inverse(fft_size);
        ImageSynthesizer { fft_size, fft }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// `real(fftshift(ifft2(ifftshift(grid))))`, normalised by the number of
    /// cells. `grid` must be `fft_size x fft_size`, centred the way the
    /// [`crate::gridding::Gridder`] centres it.
    ///
    /// # Panics
    ///
    /// Panics if `grid` isn't `fft_size x fft_size`.
    pub fn synthesize(&self, grid: ArrayView2<c64>) -> Array2<f64> {
        let n = self.fft_size;
        assert_eq!(grid.dim(), (n, n));

        // For even sizes, ifftshift is the same as fftshift.
        let mut buffer: Vec<c64> = grid.iter().copied().collect();
        fftshift_inplace(&mut buffer, n);

        self.process_rows(&mut buffer);
        let mut buffer = transpose(&buffer, n);
        self.process_rows(&mut buffer);
        let mut buffer = transpose(&buffer, n);

        let norm = (n * n) as f64;
        buffer.iter_mut().for_each(|v| *v /= norm);
        fftshift_inplace(&mut buffer, n);

        Array2::from_shape_fn((n, n), |(r, c)| buffer[r * n + c].re)
    }

    fn process_rows(&self, buffer: &mut [c64]) {
        let fft = &self.fft;
        buffer.par_chunks_mut(self.fft_size).for_each_init(
            || vec![c64::default(); fft.get_inplace_scratch_len()],
            |scratch, row| fft.process_with_scratch(row, scratch),
        );
    }
}

fn transpose(buffer: &[c64], size: usize) -> Vec<c64> {
    let mut transposed = vec![c64::default(); size * size];
    for r in 0..size {
        for c in 0..size {
            transposed[c * size + r] = buffer[r * size + c];
        }
    }
    transposed
}

/// Swap quadrants of a row-major `size x size` buffer, moving the zero
/// frequency from the centre to the origin (or back; for even sizes the shift
/// is its own inverse).
pub fn fftshift_inplace<T: Copy + Default>(data: &mut [T], size: usize) {
    assert_eq!(data.len(), size * size);
    let mut shifted = vec![T::default(); data.len()];
    let half = size / 2;
    for r in 0..size {
        for c in 0..size {
            let sr = (r + half) % size;
            let sc = (c + half) % size;
            shifted[sr * size + sc] = data[r * size + c];
        }
    }
    data.copy_from_slice(&shifted);
}
