//! HyperLogLog++ Cardinality Sketch
//!
//! Dense register layout at precision p ∈ {12, 14, 16}. Linear counting
//! covers the small-cardinality regime; the bias-corrected raw estimate
//! (via the alpha constant) covers the rest. Merging is register-wise
//! max, which makes the union associative and commutative.

use crate::error::{Error, Result};
use crate::tuple::{Tuple, TupleValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Supported precisions.
pub const SUPPORTED_PRECISIONS: [u8; 3] = [12, 14, 16];

/// Dense HyperLogLog++ sketch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new(precision: u8) -> Result<Self> {
        if !SUPPORTED_PRECISIONS.contains(&precision) {
            return Err(Error::InvalidQuery(format!(
                "HLL precision must be one of {SUPPORTED_PRECISIONS:?}, got {precision}"
            )));
        }
        Ok(HyperLogLog {
            precision,
            registers: vec![0; 1usize << precision],
        })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    fn m(&self) -> usize {
        self.registers.len()
    }

    /// Add a 64-bit hash to the sketch.
    pub fn add_hash(&mut self, hash: u64) {
        let p = self.precision as u32;
        let index = (hash >> (64 - p)) as usize;
        let rest = hash << p;
        // rho = position of the leftmost 1-bit in the remaining 64-p bits
        let rho = if rest == 0 {
            (64 - p + 1) as u8
        } else {
            (rest.leading_zeros() + 1) as u8
        };
        if rho > self.registers[index] {
            self.registers[index] = rho;
        }
    }

    /// Add a tuple value (hashed via its packed encoding).
    pub fn add_value(&mut self, value: &TupleValue) {
        self.add_hash(hash_value(value));
    }

    /// Cardinality estimate.
    pub fn cardinality(&self) -> u64 {
        let m = self.m() as f64;
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();

        // Linear counting regime
        let raw = self.raw_estimate();
        if raw <= 2.5 * m && zeros > 0 {
            return (m * (m / zeros as f64).ln()).round() as u64;
        }
        raw.round() as u64
    }

    fn raw_estimate(&self) -> f64 {
        let m = self.m() as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        alpha(self.m()) * m * m / sum
    }

    /// Register-wise max merge. Precisions must match.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<()> {
        if self.precision != other.precision {
            return Err(Error::InvalidQuery(format!(
                "cannot merge HLL sketches of precisions {} and {}",
                self.precision, other.precision
            )));
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    /// Standard error bound: 1.04 / sqrt(m).
    pub fn relative_error(&self) -> f64 {
        1.04 / (self.m() as f64).sqrt()
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Codec(e.to_string()))
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self> {
        let sketch: HyperLogLog =
            bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))?;
        if !SUPPORTED_PRECISIONS.contains(&sketch.precision)
            || sketch.registers.len() != 1usize << sketch.precision
        {
            return Err(Error::Codec("corrupt HLL sketch".into()));
        }
        Ok(sketch)
    }
}

/// Alpha constant for the raw estimate's bias correction.
fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

/// Hash a tuple value to 64 bits via its order-preserving encoding.
pub fn hash_value(value: &TupleValue) -> u64 {
    let packed = Tuple::new(vec![value.clone()]).pack();
    hash_bytes(&packed)
}

/// First 8 bytes of SHA-256, big-endian.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsupported_precision() {
        assert!(HyperLogLog::new(10).is_err());
        assert!(HyperLogLog::new(14).is_ok());
    }

    #[test]
    fn test_small_cardinality_exactish() {
        let mut hll = HyperLogLog::new(14).unwrap();
        for i in 0..100i64 {
            hll.add_value(&TupleValue::Int(i));
        }
        let est = hll.cardinality();
        assert!((90..=110).contains(&est), "estimate {est} too far from 100");
    }

    #[test]
    fn test_duplicates_do_not_inflate() {
        let mut hll = HyperLogLog::new(12).unwrap();
        for _ in 0..50 {
            for i in 0..20i64 {
                hll.add_value(&TupleValue::Int(i));
            }
        }
        let est = hll.cardinality();
        assert!((15..=25).contains(&est), "estimate {est} too far from 20");
    }

    #[test]
    fn test_large_cardinality_within_bound() {
        let n = 100_000i64;
        let mut hll = HyperLogLog::new(14).unwrap();
        for i in 0..n {
            hll.add_value(&TupleValue::Int(i));
        }
        let est = hll.cardinality() as f64;
        let tolerance = 3.0 * hll.relative_error() * n as f64;
        assert!(
            (est - n as f64).abs() < tolerance,
            "estimate {est} outside 3σ of {n}"
        );
    }

    #[test]
    fn test_merge_matches_union() {
        let mut a = HyperLogLog::new(14).unwrap();
        let mut b = HyperLogLog::new(14).unwrap();
        let mut union = HyperLogLog::new(14).unwrap();
        for i in 0..5_000i64 {
            a.add_value(&TupleValue::Int(i));
            union.add_value(&TupleValue::Int(i));
        }
        for i in 2_500..7_500i64 {
            b.add_value(&TupleValue::Int(i));
            union.add_value(&TupleValue::Int(i));
        }
        a.merge(&b).unwrap();
        assert_eq!(a.cardinality(), union.cardinality());
    }

    #[test]
    fn test_merge_commutative() {
        let mut ab = HyperLogLog::new(12).unwrap();
        let mut ba = HyperLogLog::new(12).unwrap();
        let mut a = HyperLogLog::new(12).unwrap();
        let mut b = HyperLogLog::new(12).unwrap();
        for i in 0..1_000i64 {
            a.add_value(&TupleValue::Int(i));
        }
        for i in 500..1_500i64 {
            b.add_value(&TupleValue::Int(i));
        }
        ab.merge(&a).unwrap();
        ab.merge(&b).unwrap();
        ba.merge(&b).unwrap();
        ba.merge(&a).unwrap();
        assert_eq!(ab.cardinality(), ba.cardinality());
    }

    #[test]
    fn test_merge_precision_mismatch() {
        let mut a = HyperLogLog::new(12).unwrap();
        let b = HyperLogLog::new(14).unwrap();
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut hll = HyperLogLog::new(16).unwrap();
        for i in 0..1_000i64 {
            hll.add_value(&TupleValue::Int(i));
        }
        let bytes = hll.serialize_bytes().unwrap();
        let back = HyperLogLog::deserialize_bytes(&bytes).unwrap();
        assert_eq!(back.cardinality(), hll.cardinality());
    }
}
