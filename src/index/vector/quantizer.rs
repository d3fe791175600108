//! Vector Quantization
//!
//! Three schemes compress vectors into short codes:
//!
//! - **Product (PQ)**: the dimension splits into `m` subspaces; k-means
//!   per subspace yields `2^nbits` centroids; a vector encodes as `m`
//!   bytes. Query distance uses asymmetric distance computation via
//!   precomputed per-subspace tables.
//! - **Scalar (SQ)**: per-dimension min/max learned at training; 8-bit
//!   or 4-bit codes; distance reconstructs an approximate vector.
//! - **Binary (BQ)**: per-dimension learned threshold; packed sign
//!   bits; Hamming distance, with a rescoring factor for re-ranking
//!   under the original metric.
//!
//! Deserialization validates dimensions, sub-quantizer count, and bit
//! width against the expected configuration and fails with
//! `QuantizerParamsMismatch` on any disagreement.

use super::{distance, DistanceMetric, QuantizerConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Query state precomputed once per search.
pub enum PreparedQuery {
    /// Per-subspace ADC tables: for euclidean, squared-distance
    /// contributions; for cosine/dot, dot and squared-norm contributions
    Product {
        tables: Vec<Vec<f32>>,
        norm_tables: Option<Vec<Vec<f32>>>,
        query_norm: f32,
    },
    /// The raw query vector
    Scalar { query: Vec<f32> },
    /// The query's own packed bits
    Binary { bits: Vec<u8> },
}

/// Common quantizer surface.
pub trait Quantizer: Send + Sync + std::fmt::Debug {
    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>>;
    fn serialize(&self) -> Result<Vec<u8>>;
    fn prepare_query(&self, vector: &[f32]) -> Result<PreparedQuery>;
    fn distance_with_prepared(&self, prepared: &PreparedQuery, code: &[u8]) -> Result<f32>;
    fn dim(&self) -> usize;
}

/// Train the configured scheme on a vector sample.
pub fn train(
    config: &QuantizerConfig,
    metric: DistanceMetric,
    dim: usize,
    vectors: &[Vec<f32>],
) -> Result<Box<dyn Quantizer>> {
    if vectors.is_empty() {
        return Err(Error::Vector("cannot train a quantizer on no vectors".into()));
    }
    if vectors.iter().any(|v| v.len() != dim) {
        return Err(Error::Vector("training vector dimension mismatch".into()));
    }
    match config {
        QuantizerConfig::Product { m, nbits } => Ok(Box::new(ProductQuantizer::train(
            dim, *m, *nbits, metric, vectors,
        )?)),
        QuantizerConfig::Scalar { bits } => {
            Ok(Box::new(ScalarQuantizer::train(dim, *bits, metric, vectors)?))
        }
        QuantizerConfig::Binary { rescore_factor } => Ok(Box::new(BinaryQuantizer::train(
            dim,
            *rescore_factor,
            vectors,
        )?)),
    }
}

#[derive(Serialize, Deserialize)]
enum StoredQuantizer {
    Product(ProductQuantizer),
    Scalar(ScalarQuantizer),
    Binary(BinaryQuantizer),
}

/// Deserialize a codebook and validate it against the expected
/// configuration.
pub fn deserialize_expecting(
    bytes: &[u8],
    config: &QuantizerConfig,
    dim: usize,
) -> Result<Box<dyn Quantizer>> {
    let stored: StoredQuantizer =
        bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))?;
    match (stored, config) {
        (StoredQuantizer::Product(pq), QuantizerConfig::Product { m, nbits }) => {
            if pq.dim != dim || pq.m != *m || pq.nbits != *nbits {
                return Err(Error::QuantizerParamsMismatch(format!(
                    "stored PQ (dim {}, m {}, nbits {}) vs expected (dim {dim}, m {m}, nbits {nbits})",
                    pq.dim, pq.m, pq.nbits
                )));
            }
            Ok(Box::new(pq))
        }
        (StoredQuantizer::Scalar(sq), QuantizerConfig::Scalar { bits }) => {
            if sq.dim != dim || sq.bits != *bits {
                return Err(Error::QuantizerParamsMismatch(format!(
                    "stored SQ (dim {}, bits {}) vs expected (dim {dim}, bits {bits})",
                    sq.dim, sq.bits
                )));
            }
            Ok(Box::new(sq))
        }
        (StoredQuantizer::Binary(bq), QuantizerConfig::Binary { .. }) => {
            if bq.dim != dim {
                return Err(Error::QuantizerParamsMismatch(format!(
                    "stored BQ dim {} vs expected {dim}",
                    bq.dim
                )));
            }
            Ok(Box::new(bq))
        }
        _ => Err(Error::QuantizerParamsMismatch(
            "stored codebook scheme differs from the configured scheme".into(),
        )),
    }
}

// ── Product quantization ───────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
pub struct ProductQuantizer {
    dim: usize,
    m: usize,
    nbits: u8,
    metric: DistanceMetric,
    /// `m` codebooks of `k` centroids of `dim/m` floats each
    codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    pub fn train(
        dim: usize,
        m: usize,
        nbits: u8,
        metric: DistanceMetric,
        vectors: &[Vec<f32>],
    ) -> Result<Self> {
        if m == 0 || dim % m != 0 {
            return Err(Error::Vector(format!(
                "PQ sub-count {m} must divide dimension {dim}"
            )));
        }
        if nbits == 0 || nbits > 8 {
            return Err(Error::Vector("PQ nbits must be in 1..=8".into()));
        }
        let dsub = dim / m;
        let k = 1usize << nbits;
        let mut codebooks = Vec::with_capacity(m);
        for sub in 0..m {
            let subvectors: Vec<&[f32]> = vectors
                .iter()
                .map(|v| &v[sub * dsub..(sub + 1) * dsub])
                .collect();
            codebooks.push(kmeans(&subvectors, k, 12));
        }
        Ok(ProductQuantizer { dim, m, nbits, metric, codebooks })
    }

    fn dsub(&self) -> usize {
        self.dim / self.m
    }
}

/// Lloyd's iterations with deterministic spread initialization.
fn kmeans(points: &[&[f32]], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    let dsub = points[0].len();
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| points[(i * points.len()) / k.max(1) % points.len()].to_vec())
        .collect();
    let mut assignment = vec![0usize; points.len()];
    for _ in 0..iterations {
        // Assign
        let mut moved = false;
        for (pi, point) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = f32::INFINITY;
            for (ci, centroid) in centroids.iter().enumerate() {
                let d: f32 = point
                    .iter()
                    .zip(centroid)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if d < best_d {
                    best_d = d;
                    best = ci;
                }
            }
            if assignment[pi] != best {
                assignment[pi] = best;
                moved = true;
            }
        }
        // Update
        let mut sums = vec![vec![0.0f32; dsub]; k];
        let mut counts = vec![0usize; k];
        for (pi, point) in points.iter().enumerate() {
            let c = assignment[pi];
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(*point) {
                *s += v;
            }
        }
        for (ci, centroid) in centroids.iter_mut().enumerate() {
            if counts[ci] > 0 {
                for (c, s) in centroid.iter_mut().zip(&sums[ci]) {
                    *c = s / counts[ci] as f32;
                }
            }
        }
        if !moved {
            break;
        }
    }
    centroids
}

impl Quantizer for ProductQuantizer {
    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "PQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        let dsub = self.dsub();
        let mut code = Vec::with_capacity(self.m);
        for (sub, codebook) in self.codebooks.iter().enumerate() {
            let slice = &vector[sub * dsub..(sub + 1) * dsub];
            let mut best = 0u8;
            let mut best_d = f32::INFINITY;
            for (ci, centroid) in codebook.iter().enumerate() {
                let d: f32 = slice
                    .iter()
                    .zip(centroid)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if d < best_d {
                    best_d = d;
                    best = ci as u8;
                }
            }
            code.push(best);
        }
        Ok(code)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(&StoredQuantizer::Product(ProductQuantizer {
            dim: self.dim,
            m: self.m,
            nbits: self.nbits,
            metric: self.metric,
            codebooks: self.codebooks.clone(),
        }))
        .map_err(|e| Error::Codec(e.to_string()))
    }

    fn prepare_query(&self, vector: &[f32]) -> Result<PreparedQuery> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "PQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        let dsub = self.dsub();
        match self.metric {
            DistanceMetric::Euclidean => {
                let tables = self
                    .codebooks
                    .iter()
                    .enumerate()
                    .map(|(sub, codebook)| {
                        let slice = &vector[sub * dsub..(sub + 1) * dsub];
                        codebook
                            .iter()
                            .map(|centroid| {
                                slice
                                    .iter()
                                    .zip(centroid)
                                    .map(|(a, b)| (a - b) * (a - b))
                                    .sum()
                            })
                            .collect()
                    })
                    .collect();
                Ok(PreparedQuery::Product { tables, norm_tables: None, query_norm: 0.0 })
            }
            DistanceMetric::Cosine | DistanceMetric::DotProduct => {
                let tables = self
                    .codebooks
                    .iter()
                    .enumerate()
                    .map(|(sub, codebook)| {
                        let slice = &vector[sub * dsub..(sub + 1) * dsub];
                        codebook
                            .iter()
                            .map(|centroid| slice.iter().zip(centroid).map(|(a, b)| a * b).sum())
                            .collect()
                    })
                    .collect();
                let norm_tables = self
                    .codebooks
                    .iter()
                    .map(|codebook| {
                        codebook
                            .iter()
                            .map(|centroid| centroid.iter().map(|c| c * c).sum())
                            .collect()
                    })
                    .collect();
                let query_norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                Ok(PreparedQuery::Product {
                    tables,
                    norm_tables: Some(norm_tables),
                    query_norm,
                })
            }
        }
    }

    fn distance_with_prepared(&self, prepared: &PreparedQuery, code: &[u8]) -> Result<f32> {
        let PreparedQuery::Product { tables, norm_tables, query_norm } = prepared else {
            return Err(Error::Vector("prepared state is not PQ".into()));
        };
        if code.len() != self.m {
            return Err(Error::QuantizerParamsMismatch(format!(
                "PQ code of {} bytes, expected {}",
                code.len(),
                self.m
            )));
        }
        let mut acc = 0.0f32;
        for (sub, &c) in code.iter().enumerate() {
            acc += tables[sub]
                .get(c as usize)
                .copied()
                .ok_or_else(|| Error::QuantizerParamsMismatch("code exceeds codebook".into()))?;
        }
        match self.metric {
            DistanceMetric::Euclidean => Ok(acc.max(0.0).sqrt()),
            DistanceMetric::DotProduct => Ok(-acc),
            DistanceMetric::Cosine => {
                let norm_tables = norm_tables.as_ref().ok_or_else(|| {
                    Error::Vector("cosine PQ state missing norm tables".into())
                })?;
                let mut sq_norm = 0.0f32;
                for (sub, &c) in code.iter().enumerate() {
                    sq_norm += norm_tables[sub][c as usize];
                }
                let denom = query_norm * sq_norm.max(0.0).sqrt();
                if denom <= f32::EPSILON {
                    Ok(1.0)
                } else {
                    Ok((1.0 - acc / denom).clamp(0.0, 2.0))
                }
            }
        }
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ── Scalar quantization ────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
pub struct ScalarQuantizer {
    dim: usize,
    bits: u8,
    metric: DistanceMetric,
    mins: Vec<f32>,
    maxs: Vec<f32>,
}

impl ScalarQuantizer {
    pub fn train(
        dim: usize,
        bits: u8,
        metric: DistanceMetric,
        vectors: &[Vec<f32>],
    ) -> Result<Self> {
        if bits != 8 && bits != 4 {
            return Err(Error::Vector("SQ supports 8-bit or 4-bit codes".into()));
        }
        let mut mins = vec![f32::INFINITY; dim];
        let mut maxs = vec![f32::NEG_INFINITY; dim];
        for vector in vectors {
            for (d, v) in vector.iter().enumerate() {
                mins[d] = mins[d].min(*v);
                maxs[d] = maxs[d].max(*v);
            }
        }
        Ok(ScalarQuantizer { dim, bits, metric, mins, maxs })
    }

    fn levels(&self) -> f32 {
        ((1u32 << self.bits) - 1) as f32
    }

    fn quantize_dim(&self, d: usize, v: f32) -> u8 {
        let span = self.maxs[d] - self.mins[d];
        if span <= f32::EPSILON {
            return 0;
        }
        (((v - self.mins[d]) / span).clamp(0.0, 1.0) * self.levels()).round() as u8
    }

    fn reconstruct_dim(&self, d: usize, q: u8) -> f32 {
        let span = self.maxs[d] - self.mins[d];
        self.mins[d] + q as f32 / self.levels() * span
    }

    fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        let expected = if self.bits == 8 { self.dim } else { self.dim.div_ceil(2) };
        if code.len() != expected {
            return Err(Error::QuantizerParamsMismatch(format!(
                "SQ code of {} bytes, expected {expected}",
                code.len()
            )));
        }
        let mut out = Vec::with_capacity(self.dim);
        for d in 0..self.dim {
            let q = if self.bits == 8 {
                code[d]
            } else if d % 2 == 0 {
                code[d / 2] >> 4
            } else {
                code[d / 2] & 0x0F
            };
            out.push(self.reconstruct_dim(d, q));
        }
        Ok(out)
    }
}

impl Quantizer for ScalarQuantizer {
    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "SQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        if self.bits == 8 {
            Ok((0..self.dim).map(|d| self.quantize_dim(d, vector[d])).collect())
        } else {
            let mut out = vec![0u8; self.dim.div_ceil(2)];
            for d in 0..self.dim {
                let q = self.quantize_dim(d, vector[d]).min(15);
                if d % 2 == 0 {
                    out[d / 2] |= q << 4;
                } else {
                    out[d / 2] |= q;
                }
            }
            Ok(out)
        }
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(&StoredQuantizer::Scalar(ScalarQuantizer {
            dim: self.dim,
            bits: self.bits,
            metric: self.metric,
            mins: self.mins.clone(),
            maxs: self.maxs.clone(),
        }))
        .map_err(|e| Error::Codec(e.to_string()))
    }

    fn prepare_query(&self, vector: &[f32]) -> Result<PreparedQuery> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "SQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        Ok(PreparedQuery::Scalar { query: vector.to_vec() })
    }

    fn distance_with_prepared(&self, prepared: &PreparedQuery, code: &[u8]) -> Result<f32> {
        let PreparedQuery::Scalar { query } = prepared else {
            return Err(Error::Vector("prepared state is not SQ".into()));
        };
        let approx = self.decode(code)?;
        Ok(distance(self.metric, query, &approx))
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ── Binary quantization ────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
pub struct BinaryQuantizer {
    dim: usize,
    /// Per-dimension split point (mean of the training sample)
    thresholds: Vec<f32>,
    /// Top-(k * rescore_factor) candidates are re-ranked under the
    /// original metric
    pub rescore_factor: usize,
}

impl BinaryQuantizer {
    pub fn train(dim: usize, rescore_factor: usize, vectors: &[Vec<f32>]) -> Result<Self> {
        let mut thresholds = vec![0.0f32; dim];
        for vector in vectors {
            for (d, v) in vector.iter().enumerate() {
                thresholds[d] += v;
            }
        }
        for t in &mut thresholds {
            *t /= vectors.len() as f32;
        }
        Ok(BinaryQuantizer {
            dim,
            thresholds,
            rescore_factor: rescore_factor.max(1),
        })
    }

    fn pack_bits(&self, vector: &[f32]) -> Vec<u8> {
        let mut out = vec![0u8; self.dim.div_ceil(8)];
        for (d, v) in vector.iter().enumerate() {
            if *v > self.thresholds[d] {
                out[d / 8] |= 1 << (d % 8);
            }
        }
        out
    }
}

impl Quantizer for BinaryQuantizer {
    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "BQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        Ok(self.pack_bits(vector))
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(&StoredQuantizer::Binary(BinaryQuantizer {
            dim: self.dim,
            thresholds: self.thresholds.clone(),
            rescore_factor: self.rescore_factor,
        }))
        .map_err(|e| Error::Codec(e.to_string()))
    }

    fn prepare_query(&self, vector: &[f32]) -> Result<PreparedQuery> {
        if vector.len() != self.dim {
            return Err(Error::Vector(format!(
                "BQ expects dimension {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        Ok(PreparedQuery::Binary { bits: self.pack_bits(vector) })
    }

    fn distance_with_prepared(&self, prepared: &PreparedQuery, code: &[u8]) -> Result<f32> {
        let PreparedQuery::Binary { bits } = prepared else {
            return Err(Error::Vector("prepared state is not BQ".into()));
        };
        if code.len() != bits.len() {
            return Err(Error::QuantizerParamsMismatch(format!(
                "BQ code of {} bytes, expected {}",
                code.len(),
                bits.len()
            )));
        }
        let hamming: u32 = bits
            .iter()
            .zip(code)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        Ok(hamming as f32)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
