//! Useful constants and defaults.

/// The default side length of the UV grid and the synthesised image \[pixels\].
pub const DEFAULT_FFT_SIZE: usize = 512;

/// The default total number of antennas ("stands") in the array.
pub const DEFAULT_N_STANDS: usize = 250;

/// The default number of antennas used in the simulated calibration.
pub const DEFAULT_CAL_NUM_STANDS: usize = 8;

/// The default maximum number of iterations allowed in the calibration solve.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// The default threshold at which the calibration solve is considered to have
/// converged. Iteration stops once every antenna's gain precision is below
/// this value.
pub const DEFAULT_STOP_THRESHOLD: f64 = 1e-8;

/// The default minimum precision that calibration solutions must reach for
/// them to be accepted.
pub const DEFAULT_MIN_THRESHOLD: f64 = 1e-4;

/// The default scale of the hidden gains used to perturb visibilities.
pub const DEFAULT_PERTURBATION_SCALE: f64 = 0.1;

/// The default number of spans allowed to queue up between pipeline stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 5;

/// The width parameter of the Gaussian gridding kernel \[pixels^2\].
pub const GAUSSIAN_KERNEL_WIDTH: f64 = 0.5;

/// Antenna indices are stored as 32-bit floats; this is the largest number of
/// antennas whose indices all survive that conversion exactly.
pub const MAX_N_STANDS: usize = 1 << 24;
