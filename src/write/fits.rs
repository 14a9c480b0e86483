//! Images as FITS image HDUs.

use std::path::{Path, PathBuf};

use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use log::debug;
use ndarray::prelude::*;

use super::{check_shape, ImageSink};
use crate::error::WriteError;

/// Writes all images into one FITS file. Each image gets its own HDU named
/// `SPAN<index>`, with the span index also in the `SPANIDX` key.
pub struct FitsImageWriter {
    path: PathBuf,
    fptr: FitsFile,
    fft_size: usize,
}

impl FitsImageWriter {
    /// Create (or overwrite) a FITS file. The primary HDU is left empty.
    pub fn create<P: AsRef<Path>>(path: P, fft_size: usize) -> Result<FitsImageWriter, WriteError> {
        let path = path.as_ref().to_path_buf();
        let fptr = FitsFile::create(&path).overwrite().open()?;
        debug!("Created {}", path.display());
        Ok(FitsImageWriter {
            path,
            fptr,
            fft_size,
        })
    }
}

impl ImageSink for FitsImageWriter {
    fn write_image(&mut self, span_index: usize, image: ArrayView2<f64>) -> Result<(), WriteError> {
        check_shape(image, self.fft_size)?;

        let dim = [self.fft_size, self.fft_size];
        let image_description = ImageDescription {
            data_type: ImageType::Double,
            dimensions: &dim,
        };
        let hdu = self
            .fptr
            .create_image(format!("SPAN{span_index}"), &image_description)?;
        hdu.write_key(&mut self.fptr, "SPANIDX", span_index as i64)?;
        let fits_image_data: Vec<f64> = image.iter().copied().collect();
        hdu.write_image(&mut self.fptr, &fits_image_data)?;
        Ok(())
    }

    fn finalise(&mut self) -> Result<(), WriteError> {
        debug!("Finished writing {}", self.path.display());
        Ok(())
    }
}
