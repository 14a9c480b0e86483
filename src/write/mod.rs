//! Sinks for images.

#[cfg(feature = "fits")]
mod fits;

#[cfg(feature = "fits")]
pub use fits::FitsImageWriter;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crossbeam_channel::Receiver;
use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::debug;
use ndarray::prelude::*;

use crate::error::{PipelineError, WriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// All write-supported image formats.
pub enum ImageOutputType {
    Raw,
    #[cfg(feature = "fits")]
    Fits,
}

/// Something that accepts one image per span.
pub trait ImageSink: Send {
    fn write_image(&mut self, span_index: usize, image: ArrayView2<f64>) -> Result<(), WriteError>;

    /// Called once all images have been written.
    fn finalise(&mut self) -> Result<(), WriteError> {
        Ok(())
    }
}

impl ImageSink for Vec<(usize, Array2<f64>)> {
    fn write_image(&mut self, span_index: usize, image: ArrayView2<f64>) -> Result<(), WriteError> {
        self.push((span_index, image.to_owned()));
        Ok(())
    }
}

fn check_shape(image: ArrayView2<f64>, fft_size: usize) -> Result<(), WriteError> {
    let (rows, cols) = image.dim();
    if rows != fft_size || cols != fft_size {
        return Err(WriteError::BadImageShape {
            expected: fft_size,
            rows,
            cols,
        });
    }
    Ok(())
}

/// Writes each image as a little-endian `u64` span index followed by the
/// image's `f64` pixels (little endian, row major).
pub struct RawImageWriter<W: Write + Send> {
    writer: W,
    fft_size: usize,
    buffer: Vec<u8>,
}

impl<W: Write + Send> RawImageWriter<W> {
    pub fn new(writer: W, fft_size: usize) -> RawImageWriter<W> {
        RawImageWriter {
            writer,
            fft_size,
            buffer: vec![0; fft_size * fft_size * std::mem::size_of::<f64>()],
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl RawImageWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(
        path: P,
        fft_size: usize,
    ) -> Result<RawImageWriter<BufWriter<File>>, WriteError> {
        let file = File::create(path)?;
        Ok(RawImageWriter::new(BufWriter::new(file), fft_size))
    }
}

impl<W: Write + Send> ImageSink for RawImageWriter<W> {
    fn write_image(&mut self, span_index: usize, image: ArrayView2<f64>) -> Result<(), WriteError> {
        check_shape(image, self.fft_size)?;

        let pixels: Vec<f64> = image.iter().copied().collect();
        LittleEndian::write_f64_into(&pixels, &mut self.buffer);
        self.writer.write_u64::<LittleEndian>(span_index as u64)?;
        self.writer.write_all(&self.buffer)?;
        Ok(())
    }

    fn finalise(&mut self) -> Result<(), WriteError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Receive images and write them to `sink`. This function is intended to be
/// run concurrently with the other pipeline stages.
///
/// `error` is shared with the other stages; if it is `true`, another stage has
/// failed and this stage stops early. If writing fails, this function sets it.
///
/// Returns the number of images written.
pub(crate) fn write_images<K: ImageSink + ?Sized>(
    sink: &mut K,
    rx: Receiver<(usize, Array2<f64>)>,
    error: &AtomicCell<bool>,
    progress_bar: Option<ProgressBar>,
) -> Result<usize, PipelineError> {
    let mut num_written = 0;
    for (span_index, image) in rx.iter() {
        // Should we continue?
        if error.load() {
            return Ok(num_written);
        }

        debug!("Writing the image for span {span_index}");
        if let Err(err) = sink.write_image(span_index, image.view()) {
            error.store(true);
            return Err(PipelineError::Sink { span_index, err });
        }
        num_written += 1;

        if let Some(progress_bar) = progress_bar.as_ref() {
            progress_bar.inc(1);
        }
    }

    if let Some(progress_bar) = progress_bar.as_ref() {
        progress_bar.abandon_with_message("Finished writing images");
    }

    if let Err(err) = sink.finalise() {
        error.store(true);
        return Err(PipelineError::Sink {
            span_index: num_written,
            err,
        });
    }
    debug!("Finished writing");

    Ok(num_written)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use byteorder::ReadBytesExt;
    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn test_raw_writer_layout() {
        let image = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64 * 0.5);
        let mut writer = RawImageWriter::new(vec![], 4);
        writer.write_image(7, image.view()).unwrap();
        writer.write_image(9, image.t()).unwrap();
        writer.finalise().unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 2 * (8 + 16 * 8));

        let mut cursor = std::io::Cursor::new(bytes);
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 7);
        for i in 0..16 {
            assert_eq!(
                cursor.read_f64::<LittleEndian>().unwrap(),
                i as f64 * 0.5
            );
        }
        // The transposed view is written in its logical order.
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 9);
        assert_eq!(cursor.read_f64::<LittleEndian>().unwrap(), 0.0);
        assert_eq!(cursor.read_f64::<LittleEndian>().unwrap(), 2.0);
    }

    #[test]
    fn test_raw_writer_rejects_bad_shapes() {
        let mut writer = RawImageWriter::new(vec![], 4);
        let result = writer.write_image(0, Array2::zeros((4, 3)).view());
        assert!(matches!(
            result,
            Err(WriteError::BadImageShape {
                expected: 4,
                rows: 4,
                cols: 3
            })
        ));
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_raw_writer_to_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = RawImageWriter::create(file.path(), 2).unwrap();
        writer
            .write_image(0, array![[1.0, 2.0], [3.0, 4.0]].view())
            .unwrap();
        writer.finalise().unwrap();
        drop(writer);

        let mut bytes = vec![];
        File::open(file.path())
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes.len(), 8 + 4 * 8);
        assert_eq!(&bytes[8..16], &1.0_f64.to_le_bytes());
        assert_eq!(&bytes[32..40], &4.0_f64.to_le_bytes());
    }

    #[test]
    fn test_write_images_receives_in_order() {
        let (tx, rx) = bounded(2);
        let error = AtomicCell::new(false);
        let mut sink: Vec<(usize, Array2<f64>)> = vec![];

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in [0, 2, 3] {
                    tx.send((i, Array2::from_elem((2, 2), i as f64))).unwrap();
                }
                drop(tx);
            });
            let num_written = write_images(&mut sink, rx, &error, None).unwrap();
            assert_eq!(num_written, 3);
        });

        assert!(!error.load());
        let indices: Vec<usize> = sink.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(sink[2].1[[1, 1]], 3.0);
    }

    #[test]
    fn test_write_images_reports_sink_errors() {
        let (tx, rx) = bounded(2);
        let error = AtomicCell::new(false);
        let mut sink = RawImageWriter::new(vec![], 2);
        tx.send((5, Array2::zeros((3, 3)))).unwrap();
        drop(tx);

        let result = write_images(&mut sink, rx, &error, None);
        assert!(matches!(
            result,
            Err(PipelineError::Sink { span_index: 5, .. })
        ));
        assert!(error.load());
    }
}
