//! Vector Indexes
//!
//! Two physical layouts share this module's metric and codec helpers:
//!
//! - flat: `I / <index> / <id> -> vector-bytes`, exhaustive scan with a
//!   bounded top-k heap;
//! - HNSW: a KV-encoded navigable small-world graph (see `hnsw`), with
//!   optionally quantized codes mirrored under `q / <id>`.
//!
//! Distance metrics: cosine (range [0, 2]), euclidean, dot product
//! (negated so lower is closer).

pub mod acorn;
pub mod flat;
pub mod hnsw;
pub mod quantizer;

pub use quantizer::{BinaryQuantizer, ProductQuantizer, Quantizer, ScalarQuantizer};

use crate::error::{Error, Result};
use crate::tuple::{Tuple, TupleValue};
use serde::{Deserialize, Serialize};

/// Distance metric for vector comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    DotProduct,
}

/// HNSW construction and search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    pub dim: usize,
    pub metric: DistanceMetric,
    /// Maximum degree per node and layer
    pub m: usize,
    /// Candidate-list width during construction
    pub ef_construction: usize,
    /// Default candidate-list width during search
    pub ef_search: usize,
    /// Optional quantized-code mirror
    pub quantizer: Option<QuantizerConfig>,
}

impl HnswParams {
    pub fn new(dim: usize, metric: DistanceMetric) -> Self {
        HnswParams {
            dim,
            metric,
            m: 16,
            ef_construction: 128,
            ef_search: 64,
            quantizer: None,
        }
    }

    /// Level-assignment normalizer: `ml = 1 / ln(M)`.
    pub fn level_norm(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

/// Quantization scheme for the code mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizerConfig {
    /// Product quantization: `m` subspaces, `2^nbits` centroids each
    Product { m: usize, nbits: u8 },
    /// Scalar quantization at 8 or 4 bits per dimension
    Scalar { bits: u8 },
    /// Binary quantization; rescoring re-ranks `k * rescore_factor`
    Binary { rescore_factor: usize },
}

/// One nearest-neighbor match.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub item_id: Tuple,
    pub distance: f32,
}

/// A nearest-neighbor query.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub k: usize,
    /// Overrides the index's default `ef_search` (HNSW only)
    pub ef_search: Option<usize>,
}

impl VectorQuery {
    pub fn nearest(vector: Vec<f32>, k: usize) -> Self {
        VectorQuery { vector, k, ef_search: None }
    }

    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.k == 0 {
            return Err(Error::Vector("k must be positive".into()));
        }
        if self.vector.len() != dim {
            return Err(Error::Vector(format!(
                "dimension mismatch: index has {dim}, query has {}",
                self.vector.len()
            )));
        }
        Ok(())
    }
}

/// Distance between two equal-length vectors under a metric.
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na <= f32::EPSILON || nb <= f32::EPSILON {
                1.0
            } else {
                (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
            }
        }
        DistanceMetric::DotProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
    }
}

/// Little-endian f32 vector bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Codec("vector bytes not a multiple of 4".into()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().expect("chunk of 4")))
        .collect())
}

/// Extract a vector from a record field value: packed f32 bytes or a
/// nested tuple of floats.
pub fn vector_of(value: &TupleValue) -> Result<Option<Vec<f32>>> {
    match value {
        TupleValue::Null => Ok(None),
        TupleValue::Bytes(bytes) => Ok(Some(decode_vector(bytes)?)),
        TupleValue::Nested(values) => {
            let mut out = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    TupleValue::Float(f) => out.push(*f as f32),
                    TupleValue::Int(i) => out.push(*i as f32),
                    _ => {
                        return Err(Error::Vector(
                            "vector tuple may only contain numbers".into(),
                        ))
                    }
                }
            }
            Ok(Some(out))
        }
        _ => Err(Error::Vector("field does not hold a vector".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_range() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = [-1.0f32, 0.0];
        assert!(distance(DistanceMetric::Cosine, &a, &a) < 1e-6);
        assert!((distance(DistanceMetric::Cosine, &a, &b) - 1.0).abs() < 1e-6);
        assert!((distance(DistanceMetric::Cosine, &a, &c) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean() {
        let a = [0.0f32, 0.0];
        let b = [3.0f32, 4.0];
        assert!((distance(DistanceMetric::Euclidean, &a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_dot_product_negated() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        assert!((distance(DistanceMetric::DotProduct, &a, &b) + 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_vector_codec_roundtrip() {
        let v = vec![1.5f32, -2.25, 0.0, f32::MAX];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_vector_of_forms() {
        let bytes = TupleValue::Bytes(encode_vector(&[1.0, 2.0]));
        assert_eq!(vector_of(&bytes).unwrap(), Some(vec![1.0, 2.0]));

        let nested = TupleValue::Nested(vec![TupleValue::Float(1.0), TupleValue::Int(2)]);
        assert_eq!(vector_of(&nested).unwrap(), Some(vec![1.0, 2.0]));

        assert_eq!(vector_of(&TupleValue::Null).unwrap(), None);
        assert!(vector_of(&TupleValue::String("x".into())).is_err());
    }

    #[test]
    fn test_query_validation() {
        let q = VectorQuery::nearest(vec![1.0, 2.0], 0);
        assert!(matches!(q.validate(2), Err(Error::Vector(_))));
        let q = VectorQuery::nearest(vec![1.0, 2.0], 3);
        assert!(q.validate(3).is_err());
        assert!(q.validate(2).is_ok());
    }
}
