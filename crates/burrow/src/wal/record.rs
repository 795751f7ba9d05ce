//! WAL entry types and their payload encodings.
//!
//! Three entry kinds are logged: series creations, sample appends and
//! tombstones. Payloads are framed by the segment writer; this module only
//! encodes and decodes the payload bytes.
//!
//! ## Payload layouts
//!
//! ```text
//! Series:  base_ref (u64 BE)
//!          repeated: ref (u64 BE), n_labels (uvarint),
//!                    n_labels × (name uvarint-str, value uvarint-str)
//! Samples: base_ref (u64 BE), base_t (i64 BE)
//!          repeated: d_ref (varint), d_t (varint), v_bits (u64 BE)
//! Deletes: repeated: ref (uvarint), mint (varint), maxt (varint)
//! ```
//!
//! The `base_ref` prefix is retained for compatibility with delta-encoded
//! series variants; series record refs are absolute. Sample refs and
//! timestamps are deltas against the batch base.

use crate::encoding::{Decbuf, Encbuf};
use crate::error::Result;
use crate::labels::{Label, Labels};

/// Kinds of entries in a WAL segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// Series creation records.
    Series = 2,
    /// Sample appends.
    Samples = 3,
    /// Tombstone intervals.
    Deletes = 4,
}

impl WalEntryType {
    /// Creates a WalEntryType from its on-disk byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(Self::Series),
            3 => Some(Self::Samples),
            4 => Some(Self::Deletes),
            _ => None,
        }
    }
}

/// Flag byte for the plain (non-delta) encoding of each entry kind.
pub(crate) const FLAG_SIMPLE: u8 = 1;

/// A series creation: labels bound to a head-assigned reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSeries {
    /// Head-assigned series reference.
    pub series_ref: u64,
    /// The series label set.
    pub labels: Labels,
}

/// A timestamp/value pair bound to a series reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefSample {
    /// Head-assigned series reference.
    pub series_ref: u64,
    /// Timestamp in milliseconds since the epoch.
    pub t: i64,
    /// Sample value.
    pub v: f64,
}

/// Deleted time ranges for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stone {
    /// Head-assigned series reference.
    pub series_ref: u64,
    /// Deleted intervals, inclusive on both ends.
    pub intervals: Vec<TimeRange>,
}

/// An inclusive time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Interval start, inclusive.
    pub min_time: i64,
    /// Interval end, inclusive.
    pub max_time: i64,
}

pub(crate) fn encode_series(buf: &mut Encbuf, series: &[RefSeries]) {
    // Base reference of the first series; record refs are absolute.
    buf.put_be64(series[0].series_ref);

    for s in series {
        buf.put_be64(s.series_ref);
        buf.put_uvarint(s.labels.len() as u64);
        for l in &s.labels {
            buf.put_uvarint_str(&l.name);
            buf.put_uvarint_str(&l.value);
        }
    }
}

/// Encodes a sample batch and returns the maximum timestamp in it.
pub(crate) fn encode_samples(buf: &mut Encbuf, samples: &[RefSample]) -> i64 {
    let first = samples[0];
    buf.put_be64(first.series_ref);
    buf.put_be64(first.t as u64);

    let mut maxt = i64::MIN;
    for s in samples {
        maxt = maxt.max(s.t);
        buf.put_varint(s.series_ref as i64 - first.series_ref as i64);
        buf.put_varint(s.t - first.t);
        buf.put_be64(s.v.to_bits());
    }
    maxt
}

pub(crate) fn encode_deletes(buf: &mut Encbuf, stones: &[Stone]) {
    for s in stones {
        for itv in &s.intervals {
            buf.put_uvarint(s.series_ref);
            buf.put_varint(itv.min_time);
            buf.put_varint(itv.max_time);
        }
    }
}

pub(crate) fn decode_series(b: &[u8]) -> Result<Vec<RefSeries>> {
    let mut d = Decbuf::new(b);
    let _base_ref = d.be64();
    d.check("series base ref")?;

    let mut series = Vec::new();
    while !d.is_empty() {
        let series_ref = d.be64();
        let n_labels = d.uvarint() as usize;
        d.check("series header")?;

        let mut labels = Vec::with_capacity(n_labels);
        for _ in 0..n_labels {
            let name = d.uvarint_str();
            let value = d.uvarint_str();
            d.check("series label")?;
            labels.push(Label::new(name, value));
        }
        series.push(RefSeries {
            series_ref,
            labels: Labels::from_sorted(labels),
        });
    }
    Ok(series)
}

pub(crate) fn decode_samples(b: &[u8]) -> Result<Vec<RefSample>> {
    let mut d = Decbuf::new(b);
    let base_ref = d.be64();
    let base_t = d.be64() as i64;
    d.check("samples base")?;

    let mut samples = Vec::new();
    while !d.is_empty() {
        let d_ref = d.varint();
        let d_t = d.varint();
        let v_bits = d.be64();
        d.check("sample")?;
        samples.push(RefSample {
            series_ref: (base_ref as i64 + d_ref) as u64,
            t: base_t + d_t,
            v: f64::from_bits(v_bits),
        });
    }
    Ok(samples)
}

pub(crate) fn decode_deletes(b: &[u8]) -> Result<Vec<Stone>> {
    let mut d = Decbuf::new(b);

    let mut stones = Vec::new();
    while !d.is_empty() {
        let series_ref = d.uvarint();
        let min_time = d.varint();
        let max_time = d.varint();
        d.check("tombstone interval")?;
        stones.push(Stone {
            series_ref,
            intervals: vec![TimeRange { min_time, max_time }],
        });
    }
    Ok(stones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().map(|&(n, v)| (n, v))).unwrap()
    }

    #[test]
    fn test_series_roundtrip() {
        let series = vec![
            RefSeries {
                series_ref: 42,
                labels: labels(&[("__name__", "up"), ("job", "node")]),
            },
            RefSeries {
                series_ref: 1 << 40,
                labels: labels(&[("__name__", "down")]),
            },
        ];
        let mut buf = Encbuf::new();
        encode_series(&mut buf, &series);
        assert_eq!(decode_series(buf.get()).unwrap(), series);
    }

    #[test]
    fn test_series_base_ref_prefix() {
        let series = vec![RefSeries {
            series_ref: 0x0102_0304_0506_0708,
            labels: labels(&[("a", "b")]),
        }];
        let mut buf = Encbuf::new();
        encode_series(&mut buf, &series);
        // Base ref and the first record ref are both absolute and big-endian.
        assert_eq!(&buf.get()[..8], &buf.get()[8..16]);
        assert_eq!(
            &buf.get()[..8],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_samples_roundtrip() {
        let samples: Vec<RefSample> = (0..10)
            .map(|i| RefSample {
                series_ref: 42 + (i % 3),
                t: 1000 * i as i64,
                v: i as f64 * 0.5,
            })
            .collect();
        let mut buf = Encbuf::new();
        let maxt = encode_samples(&mut buf, &samples);
        assert_eq!(maxt, 9000);
        assert_eq!(decode_samples(buf.get()).unwrap(), samples);
    }

    #[test]
    fn test_samples_negative_deltas() {
        let samples = vec![
            RefSample {
                series_ref: 100,
                t: 5000,
                v: f64::NAN,
            },
            RefSample {
                series_ref: 7,
                t: -3000,
                v: -0.0,
            },
        ];
        let mut buf = Encbuf::new();
        encode_samples(&mut buf, &samples);
        let out = decode_samples(buf.get()).unwrap();
        assert_eq!(out[1].series_ref, 7);
        assert_eq!(out[1].t, -3000);
        // NaN and signed zero survive via their bit patterns.
        assert!(out[0].v.is_nan());
        assert!(out[1].v.is_sign_negative());
    }

    #[test]
    fn test_deletes_roundtrip() {
        let stones = vec![
            Stone {
                series_ref: 9,
                intervals: vec![TimeRange {
                    min_time: -100,
                    max_time: 100,
                }],
            },
            Stone {
                series_ref: 10,
                intervals: vec![TimeRange {
                    min_time: 0,
                    max_time: i64::MAX,
                }],
            },
        ];
        let mut buf = Encbuf::new();
        encode_deletes(&mut buf, &stones);
        assert_eq!(decode_deletes(buf.get()).unwrap(), stones);
    }

    #[test]
    fn test_truncated_payload_errors() {
        let series = vec![RefSeries {
            series_ref: 1,
            labels: labels(&[("a", "b")]),
        }];
        let mut buf = Encbuf::new();
        encode_series(&mut buf, &series);
        let whole = buf.get();
        assert!(decode_series(&whole[..whole.len() - 1]).is_err());

        assert!(decode_samples(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_entry_type_from_u8() {
        assert_eq!(WalEntryType::from_u8(2), Some(WalEntryType::Series));
        assert_eq!(WalEntryType::from_u8(3), Some(WalEntryType::Samples));
        assert_eq!(WalEntryType::from_u8(4), Some(WalEntryType::Deletes));
        assert_eq!(WalEntryType::from_u8(0), None);
        assert_eq!(WalEntryType::from_u8(1), None);
        assert_eq!(WalEntryType::from_u8(5), None);
    }
}
