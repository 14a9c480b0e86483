//! The binary layout of visibility spans.
//!
//! A span is `N_BASELINE = N_STANDS * (N_STANDS + 1) / 2` records, one per
//! unique antenna pair (auto-correlations included). Each record is six
//! little-endian IEEE-754 32-bit floats:
//!
//! ```text
//! | stand1 | stand2 | u | v | re | im |
//! ```
//!
//! No other interpretation of the bytes is valid. Lengths are checked before
//! any bytes are interpreted.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use marlu::{c32, math::baseline_to_tiles};

use crate::error::FormatError;

/// The version of the span layout described in this module.
pub const SPAN_SCHEMA_VERSION: u32 = 1;

/// The number of floats in a single baseline record.
pub const FLOATS_PER_RECORD: usize = 6;

/// The number of bytes in a single baseline record.
pub const BYTES_PER_RECORD: usize = FLOATS_PER_RECORD * std::mem::size_of::<f32>();

/// The number of baselines (including auto-correlations) for an array of
/// `n_stands` antennas.
#[inline]
pub fn num_baselines(n_stands: usize) -> usize {
    n_stands * (n_stands + 1) / 2
}

/// The number of bytes in a span for an array of `n_stands` antennas.
#[inline]
pub fn span_size_bytes(n_stands: usize) -> usize {
    num_baselines(n_stands) * BYTES_PER_RECORD
}

/// All antenna pairs in span order; baseline 0 is between antenna 0 and
/// itself.
pub fn baseline_pairs(n_stands: usize) -> Vec<(usize, usize)> {
    (0..num_baselines(n_stands))
        .map(|bl| baseline_to_tiles(n_stands, bl))
        .collect()
}

/// One interferometric measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BaselineRecord {
    pub antenna1: usize,
    pub antenna2: usize,
    /// \[pixels\]
    pub u: f32,
    /// \[pixels\]
    pub v: f32,
    pub vis: c32,
}

impl BaselineRecord {
    pub fn new(antenna1: usize, antenna2: usize, u: f32, v: f32, vis: c32) -> BaselineRecord {
        BaselineRecord {
            antenna1,
            antenna2,
            u,
            v,
            vis,
        }
    }

    /// Does this record involve antenna `antenna`?
    #[inline]
    pub fn involves(&self, antenna: usize) -> bool {
        self.antenna1 == antenna || self.antenna2 == antenna
    }

    fn to_floats(self) -> [f32; FLOATS_PER_RECORD] {
        [
            self.antenna1 as f32,
            self.antenna2 as f32,
            self.u,
            self.v,
            self.vis.re,
            self.vis.im,
        ]
    }
}

/// All of the baseline records for one observation snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct UvSpan {
    /// The total number of antennas in the array that produced this span.
    n_stands: usize,

    records: Vec<BaselineRecord>,
}

impl UvSpan {
    /// Create a span from records. The number of records must be exactly
    /// `num_baselines(n_stands)`, and all antenna indices must be valid.
    pub fn new(n_stands: usize, records: Vec<BaselineRecord>) -> Result<UvSpan, FormatError> {
        let expected = num_baselines(n_stands);
        if records.len() != expected {
            return Err(FormatError::BadRecordCount {
                expected,
                actual: records.len(),
            });
        }
        for (i_record, record) in records.iter().enumerate() {
            for antenna in [record.antenna1, record.antenna2] {
                if antenna >= n_stands {
                    return Err(FormatError::BadAntennaIndex {
                        record: i_record,
                        value: antenna as f32,
                        n_stands,
                    });
                }
            }
        }
        Ok(UvSpan { n_stands, records })
    }

    /// A span with the canonical antenna pair ordering, zero UVWs and zero
    /// visibilities.
    pub fn zeroed(n_stands: usize) -> UvSpan {
        let records = baseline_pairs(n_stands)
            .into_iter()
            .map(|(a1, a2)| BaselineRecord::new(a1, a2, 0.0, 0.0, c32::default()))
            .collect();
        UvSpan { n_stands, records }
    }

    pub fn n_stands(&self) -> usize {
        self.n_stands
    }

    pub fn records(&self) -> &[BaselineRecord] {
        &self.records
    }

    /// Visibility amplitudes may be rewritten, but the record count is fixed.
    pub fn records_mut(&mut self) -> &mut [BaselineRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<BaselineRecord> {
        self.records
    }
}

/// Interpret `bytes` as a span from an array of `n_stands` antennas.
pub fn decode_span(bytes: &[u8], n_stands: usize) -> Result<UvSpan, FormatError> {
    let num_baselines = num_baselines(n_stands);
    let expected = num_baselines * BYTES_PER_RECORD;
    if bytes.len() % BYTES_PER_RECORD != 0 {
        return Err(FormatError::PartialRecord {
            actual: bytes.len(),
            record_size: BYTES_PER_RECORD,
        });
    }
    if bytes.len() != expected {
        return Err(FormatError::BadSpanLength {
            expected,
            actual: bytes.len(),
            num_baselines,
        });
    }

    let mut floats = vec![0.0_f32; num_baselines * FLOATS_PER_RECORD];
    LittleEndian::read_f32_into(bytes, &mut floats);

    let mut records = Vec::with_capacity(num_baselines);
    for (i_record, f) in floats.chunks_exact(FLOATS_PER_RECORD).enumerate() {
        let antenna1 = antenna_index(f[0], i_record, n_stands)?;
        let antenna2 = antenna_index(f[1], i_record, n_stands)?;
        records.push(BaselineRecord {
            antenna1,
            antenna2,
            u: f[2],
            v: f[3],
            vis: c32::new(f[4], f[5]),
        });
    }
    for (i_record, record) in records.iter().take(10).enumerate() {
        trace!("record {i_record}: {record:?}");
    }

    Ok(UvSpan { n_stands, records })
}

/// Serialise a span into its flat binary layout.
pub fn encode_span(span: &UvSpan) -> Vec<u8> {
    let floats: Vec<f32> = span
        .records
        .iter()
        .flat_map(|record| record.to_floats())
        .collect();
    let mut bytes = vec![0; floats.len() * std::mem::size_of::<f32>()];
    LittleEndian::write_f32_into(&floats, &mut bytes);
    bytes
}

/// Serialise records into the flat binary layout, checking that there are
/// exactly enough for an array of `n_stands` antennas.
pub fn encode_records(records: &[BaselineRecord], n_stands: usize) -> Result<Vec<u8>, FormatError> {
    let span = UvSpan::new(n_stands, records.to_vec())?;
    Ok(encode_span(&span))
}

fn antenna_index(value: f32, record: usize, n_stands: usize) -> Result<usize, FormatError> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && (value as usize) < n_stands {
        Ok(value as usize)
    } else {
        Err(FormatError::BadAntennaIndex {
            record,
            value,
            n_stands,
        })
    }
}
