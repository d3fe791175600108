//! Equi-Depth Histograms and Most-Common-Value Tables
//!
//! Built from a reservoir sample. Each bucket holds approximately the
//! same number of values; range selectivity interpolates linearly within
//! a bucket. Strings are mapped to a scalar by stripping the sample's
//! common prefix and packing the following bytes into a double, which
//! preserves lexicographic order. The MCV list covers the listed values
//! directly and the histogram carries the residual mass.

use crate::tuple::TupleValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One equi-depth bucket over the scalar domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
    pub distinct: u64,
}

/// Equi-depth histogram over scalar-mapped values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
    /// Common prefix stripped from string values before scalar mapping
    pub string_prefix: Vec<u8>,
    total: u64,
}

impl Histogram {
    /// Build from a sample; `buckets` is the target bucket count.
    /// Null values must be excluded by the caller.
    pub fn build(sample: &[TupleValue], buckets: usize) -> Histogram {
        if sample.is_empty() || buckets == 0 {
            return Histogram::default();
        }
        let string_prefix = common_string_prefix(sample);
        let mut scalars: Vec<f64> = sample
            .iter()
            .filter_map(|v| scalar_of(v, &string_prefix))
            .collect();
        if scalars.is_empty() {
            return Histogram::default();
        }
        scalars.sort_by(f64::total_cmp);

        let n = scalars.len();
        let depth = n.div_ceil(buckets).max(1);
        let mut out = Vec::with_capacity(buckets);
        let mut start = 0;
        while start < n {
            let end = (start + depth).min(n);
            let slice = &scalars[start..end];
            let mut distinct = 1u64;
            for pair in slice.windows(2) {
                if pair[0].total_cmp(&pair[1]).is_ne() {
                    distinct += 1;
                }
            }
            out.push(Bucket {
                lower: slice[0],
                upper: slice[slice.len() - 1],
                count: slice.len() as u64,
                distinct,
            });
            start = end;
        }
        Histogram {
            buckets: out,
            string_prefix,
            total: n as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Fraction of values in `[lower, upper]`; `None` bounds are open.
    pub fn range_selectivity(
        &self,
        lower: Option<&TupleValue>,
        upper: Option<&TupleValue>,
    ) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let lo = match lower {
            Some(v) => Some(scalar_of(v, &self.string_prefix)?),
            None => None,
        };
        let hi = match upper {
            Some(v) => Some(scalar_of(v, &self.string_prefix)?),
            None => None,
        };
        let mut covered = 0.0;
        for bucket in &self.buckets {
            covered += bucket_fraction(bucket, lo, hi) * bucket.count as f64;
        }
        Some((covered / self.total as f64).clamp(0.0, 1.0))
    }

    /// Fraction of values equal to `value`, assuming uniform spread over
    /// the bucket's distinct values.
    pub fn equality_selectivity(&self, value: &TupleValue) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let scalar = scalar_of(value, &self.string_prefix)?;
        for bucket in &self.buckets {
            if scalar >= bucket.lower && scalar <= bucket.upper {
                let per_value = bucket.count as f64 / bucket.distinct.max(1) as f64;
                return Some((per_value / self.total as f64).clamp(0.0, 1.0));
            }
        }
        Some(0.0)
    }
}

/// Linear interpolation of the overlap between a bucket and a range.
fn bucket_fraction(bucket: &Bucket, lower: Option<f64>, upper: Option<f64>) -> f64 {
    let lo = lower.unwrap_or(f64::NEG_INFINITY).max(bucket.lower);
    let hi = upper.unwrap_or(f64::INFINITY).min(bucket.upper);
    if hi < lo {
        return 0.0;
    }
    let width = bucket.upper - bucket.lower;
    if width <= 0.0 {
        // Degenerate single-value bucket: all-or-nothing
        return 1.0;
    }
    ((hi - lo) / width).clamp(0.0, 1.0)
}

/// Map an orderable value to a scalar preserving relative order within
/// its type. Non-orderable values return `None`.
pub fn scalar_of(value: &TupleValue, string_prefix: &[u8]) -> Option<f64> {
    match value {
        TupleValue::Int(v) => Some(*v as f64),
        TupleValue::Float(v) => Some(*v),
        TupleValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        TupleValue::String(s) => Some(pack_bytes_to_double(s.as_bytes(), string_prefix)),
        TupleValue::Bytes(b) => Some(pack_bytes_to_double(b, string_prefix)),
        TupleValue::Null | TupleValue::Nested(_) => None,
    }
}

/// Strip the common prefix and pack the next ≤12 bytes into a double in
/// base-256 positional notation. Monotone in lexicographic order.
fn pack_bytes_to_double(bytes: &[u8], prefix: &[u8]) -> f64 {
    let rest = bytes.strip_prefix(prefix).unwrap_or(bytes);
    let mut value = 0.0f64;
    let mut scale = 1.0f64;
    for &b in rest.iter().take(12) {
        scale /= 256.0;
        value += b as f64 * scale;
    }
    value
}

/// Longest byte prefix shared by every string/bytes value in the sample.
fn common_string_prefix(sample: &[TupleValue]) -> Vec<u8> {
    let mut prefix: Option<Vec<u8>> = None;
    for value in sample {
        let bytes = match value {
            TupleValue::String(s) => s.as_bytes(),
            TupleValue::Bytes(b) => b.as_slice(),
            _ => continue,
        };
        prefix = Some(match prefix {
            None => bytes.to_vec(),
            Some(current) => {
                let shared = current
                    .iter()
                    .zip(bytes)
                    .take_while(|(a, b)| a == b)
                    .count();
                current[..shared].to_vec()
            }
        });
        if prefix.as_deref() == Some(&[]) {
            break;
        }
    }
    prefix.unwrap_or_default()
}

/// Most-common-values table with frequency thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mcv {
    /// (value, frequency) sorted by descending frequency
    pub entries: Vec<(TupleValue, f64)>,
}

impl Mcv {
    /// Build from a sample: values whose sample frequency meets
    /// `min_frequency`, at most `max_size` of them.
    pub fn build(sample: &[TupleValue], min_frequency: f64, max_size: usize) -> Mcv {
        if sample.is_empty() || max_size == 0 {
            return Mcv::default();
        }
        let mut counts: HashMap<&TupleValue, u64> = HashMap::new();
        for value in sample {
            if !value.is_null() {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        let n = sample.len() as f64;
        let mut entries: Vec<(TupleValue, f64)> = counts
            .into_iter()
            .map(|(v, c)| (v.clone(), c as f64 / n))
            .filter(|(_, freq)| *freq >= min_frequency)
            .collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(max_size);
        Mcv { entries }
    }

    /// Frequency of a listed value, if present.
    pub fn frequency(&self, value: &TupleValue) -> Option<f64> {
        self.entries
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, f)| *f)
    }

    /// Mass covered by the listed values; the histogram carries
    /// `1 - covered_mass()`.
    pub fn covered_mass(&self) -> f64 {
        self.entries.iter().map(|(_, f)| f).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
