//! Sources of raw spans.
//!
//! Sources only chunk their input into span-sized pieces; interpreting the
//! bytes is left to [`crate::record::decode_span`], so a malformed span is
//! reported against the span that contains it.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::{
    error::{FormatError, ReadError},
    record::{num_baselines, span_size_bytes, FLOATS_PER_RECORD},
};

/// Something that supplies raw spans, one at a time.
pub trait SpanSource: Send {
    /// Get the bytes of the next span, or `None` at the end of the stream. The
    /// returned bytes are not guaranteed to be a valid span.
    ///
    /// [`ReadError::Format`] means only the current span is bad; the source
    /// has moved past it and can supply the next one. Any other error ends
    /// the stream.
    fn next_span(&mut self) -> Result<Option<Vec<u8>>, ReadError>;

    /// How many spans this source expects to supply, if known.
    fn num_spans_hint(&self) -> Option<usize> {
        None
    }
}

/// Spans stored back-to-back in their binary layout.
pub struct BinarySpanSource<R: Read + Send> {
    reader: R,
    span_size: usize,
    num_spans_hint: Option<usize>,
}

impl<R: Read + Send> BinarySpanSource<R> {
    pub fn new(reader: R, n_stands: usize) -> BinarySpanSource<R> {
        BinarySpanSource {
            reader,
            span_size: span_size_bytes(n_stands),
            num_spans_hint: None,
        }
    }
}

impl BinarySpanSource<BufReader<File>> {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        n_stands: usize,
    ) -> Result<BinarySpanSource<BufReader<File>>, ReadError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let span_size = span_size_bytes(n_stands);
        let num_spans = (len + span_size - 1) / span_size;
        debug!(
            "{}: {len} bytes, {num_spans} spans of {span_size} bytes",
            path.display()
        );
        if len % span_size != 0 {
            debug!(
                "{}: trailing {} bytes don't make a whole span",
                path.display(),
                len % span_size
            );
        }

        let mut source = BinarySpanSource::new(BufReader::new(file), n_stands);
        source.num_spans_hint = Some(num_spans);
        Ok(source)
    }
}

impl<R: Read + Send> SpanSource for BinarySpanSource<R> {
    fn next_span(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        let mut buffer = Vec::with_capacity(self.span_size);
        (&mut self.reader)
            .take(self.span_size as u64)
            .read_to_end(&mut buffer)?;
        // A short final chunk is handed on as-is; decoding rejects it.
        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buffer))
        }
    }

    fn num_spans_hint(&self) -> Option<usize> {
        self.num_spans_hint
    }
}

/// Spans as whitespace-separated text, one baseline record per row. The last
/// six columns of each row are `stand1 stand2 u v re im`; anything before them
/// (e.g. a row number) is ignored, as are blank lines and lines starting with
/// `#`. Every `N_BASELINE` rows make a span. A row that can't be parsed fails
/// the span it belongs to, but the span's remaining rows are still consumed.
pub struct TextSpanSource<R: BufRead + Send> {
    reader: R,
    num_baselines: usize,

    /// The number of lines read so far.
    line: usize,
}

impl<R: BufRead + Send> TextSpanSource<R> {
    pub fn new(reader: R, n_stands: usize) -> TextSpanSource<R> {
        TextSpanSource {
            reader,
            num_baselines: num_baselines(n_stands),
            line: 0,
        }
    }
}

impl TextSpanSource<BufReader<File>> {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        n_stands: usize,
    ) -> Result<TextSpanSource<BufReader<File>>, ReadError> {
        let file = File::open(path)?;
        Ok(TextSpanSource::new(BufReader::new(file), n_stands))
    }
}

impl<R: BufRead + Send> SpanSource for TextSpanSource<R> {
    fn next_span(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        let mut floats = Vec::with_capacity(self.num_baselines * FLOATS_PER_RECORD);
        let mut line = String::new();
        let mut num_rows = 0;
        let mut bad_row = None;
        while num_rows < self.num_baselines {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            self.line += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            num_rows += 1;
            match parse_row(trimmed, self.line) {
                Ok(row) => floats.extend_from_slice(&row),
                Err(e) => {
                    bad_row.get_or_insert(e);
                }
            }
        }

        if num_rows == 0 {
            return Ok(None);
        }
        if let Some(e) = bad_row {
            return Err(e.into());
        }
        let mut bytes = vec![0; floats.len() * std::mem::size_of::<f32>()];
        LittleEndian::write_f32_into(&floats, &mut bytes);
        Ok(Some(bytes))
    }
}

fn parse_row(row: &str, line: usize) -> Result<[f32; FLOATS_PER_RECORD], FormatError> {
    let columns: Vec<&str> = row.split_whitespace().collect();
    if columns.len() < FLOATS_PER_RECORD {
        return Err(FormatError::BadTextRow {
            line,
            message: format!(
                "expected at least {FLOATS_PER_RECORD} columns, got {}",
                columns.len()
            ),
        });
    }

    let mut out = [0.0; FLOATS_PER_RECORD];
    for (o, c) in out
        .iter_mut()
        .zip(&columns[columns.len() - FLOATS_PER_RECORD..])
    {
        *o = c.parse().map_err(|e| FormatError::BadTextRow {
            line,
            message: format!("couldn't parse '{c}' as a float: {e}"),
        })?;
    }
    Ok(out)
}

/// Spans that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct VecSpanSource {
    spans: std::collections::VecDeque<Vec<u8>>,
    total: usize,
}

impl VecSpanSource {
    pub fn new(spans: Vec<Vec<u8>>) -> VecSpanSource {
        let total = spans.len();
        VecSpanSource {
            spans: spans.into(),
            total,
        }
    }
}

impl SpanSource for VecSpanSource {
    fn next_span(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        Ok(self.spans.pop_front())
    }

    fn num_spans_hint(&self) -> Option<usize> {
        Some(self.total)
    }
}
