//! Bitmap Index
//!
//! One bitmap per distinct key value, over single-field integer primary
//! keys used as bit positions. Layout: `I / <index-name> / <value> ->
//! serialized bitmap`. Bitmaps support `and/or/xor/not` over equal
//! lengths; out-of-range bit operations are no-ops; population count is
//! computed lazily but is exact on query.
//!
//! Serialization offers four variants: uncompressed words, byte
//! run-length, word-aligned fills, and roaring-style containers.

use crate::error::{Error, Result};
use crate::index::{key_path_values, IndexDescriptor};
use crate::kv::{KvRead, KvTransaction};
use crate::record::{DynRecord, RecordType};
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Serialization variant for persisted bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitmapCompression {
    None,
    RunLength,
    WordAligned,
    Roaring,
}

const FMT_NONE: u8 = 0;
const FMT_RLE: u8 = 1;
const FMT_WAH: u8 = 2;
const FMT_ROARING: u8 = 3;

/// Fixed-length bitmap backed by 64-bit words.
#[derive(Debug, Clone)]
pub struct Bitmap {
    len_bits: usize,
    words: Vec<u64>,
    pop_cache: Cell<Option<u64>>,
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.len_bits == other.len_bits && self.words == other.words
    }
}

impl Eq for Bitmap {}

impl Bitmap {
    pub fn new(len_bits: usize) -> Self {
        Bitmap {
            len_bits,
            words: vec![0; len_bits.div_ceil(64)],
            pop_cache: Cell::new(Some(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.len_bits
    }

    pub fn is_empty(&self) -> bool {
        self.len_bits == 0
    }

    /// Set a bit; out of range is a no-op.
    pub fn set(&mut self, bit: usize) {
        if bit < self.len_bits {
            self.words[bit / 64] |= 1u64 << (bit % 64);
            self.pop_cache.set(None);
        }
    }

    /// Clear a bit; out of range is a no-op.
    pub fn clear(&mut self, bit: usize) {
        if bit < self.len_bits {
            self.words[bit / 64] &= !(1u64 << (bit % 64));
            self.pop_cache.set(None);
        }
    }

    /// Test a bit; out of range reads as false.
    pub fn get(&self, bit: usize) -> bool {
        bit < self.len_bits && (self.words[bit / 64] >> (bit % 64)) & 1 == 1
    }

    /// Exact population count; cached until the next mutation.
    pub fn pop_count(&self) -> u64 {
        if let Some(cached) = self.pop_cache.get() {
            return cached;
        }
        let count = self.words.iter().map(|w| w.count_ones() as u64).sum();
        self.pop_cache.set(Some(count));
        count
    }

    fn check_len(&self, other: &Bitmap) -> Result<()> {
        if self.len_bits != other.len_bits {
            return Err(Error::InvalidQuery(format!(
                "bitmap length mismatch: {} vs {}",
                self.len_bits, other.len_bits
            )));
        }
        Ok(())
    }

    pub fn and(&self, other: &Bitmap) -> Result<Bitmap> {
        self.check_len(other)?;
        Ok(self.zip_words(other, |a, b| a & b))
    }

    pub fn or(&self, other: &Bitmap) -> Result<Bitmap> {
        self.check_len(other)?;
        Ok(self.zip_words(other, |a, b| a | b))
    }

    pub fn xor(&self, other: &Bitmap) -> Result<Bitmap> {
        self.check_len(other)?;
        Ok(self.zip_words(other, |a, b| a ^ b))
    }

    /// Complement within the bitmap's length; tail bits of the last word
    /// stay zero.
    pub fn not(&self) -> Bitmap {
        let mut out = self.zip_words(self, |a, _| !a);
        out.mask_tail();
        out
    }

    fn zip_words(&self, other: &Bitmap, f: impl Fn(u64, u64) -> u64) -> Bitmap {
        let words = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| f(*a, *b))
            .collect();
        Bitmap {
            len_bits: self.len_bits,
            words,
            pop_cache: Cell::new(None),
        }
    }

    fn mask_tail(&mut self) {
        let tail = self.len_bits % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }

    /// Iterate set bit positions in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(move |(wi, &word)| {
            let base = wi * 64;
            let len = self.len_bits;
            (0..64)
                .filter(move |b| (word >> b) & 1 == 1)
                .map(move |b| base + b)
                .filter(move |&bit| bit < len)
        })
    }

    // ── Serialization ──────────────────────────────────────────────────

    pub fn serialize(&self, compression: BitmapCompression) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.len_bits as u64).to_be_bytes());
        match compression {
            BitmapCompression::None => {
                out.insert(0, FMT_NONE);
                for word in &self.words {
                    out.extend_from_slice(&word.to_be_bytes());
                }
            }
            BitmapCompression::RunLength => {
                out.insert(0, FMT_RLE);
                let bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_be_bytes()).collect();
                let mut i = 0;
                while i < bytes.len() {
                    let value = bytes[i];
                    let mut run = 1u16;
                    while i + (run as usize) < bytes.len()
                        && bytes[i + run as usize] == value
                        && run < u16::MAX
                    {
                        run += 1;
                    }
                    out.push(value);
                    out.extend_from_slice(&run.to_be_bytes());
                    i += run as usize;
                }
            }
            BitmapCompression::WordAligned => {
                out.insert(0, FMT_WAH);
                let mut i = 0;
                while i < self.words.len() {
                    let word = self.words[i];
                    if word == 0 || word == u64::MAX {
                        let mut run = 1u32;
                        while i + (run as usize) < self.words.len()
                            && self.words[i + run as usize] == word
                        {
                            run += 1;
                        }
                        // Fill marker: 1 = fill, then the fill bit and run
                        out.push(1);
                        out.push(if word == 0 { 0 } else { 1 });
                        out.extend_from_slice(&run.to_be_bytes());
                        i += run as usize;
                    } else {
                        out.push(0);
                        out.extend_from_slice(&word.to_be_bytes());
                        i += 1;
                    }
                }
            }
            BitmapCompression::Roaring => {
                out.insert(0, FMT_ROARING);
                // Containers keyed by the high 16 bits of set positions
                let mut current_key: Option<u16> = None;
                let mut values: Vec<u16> = Vec::new();
                let mut containers: Vec<(u16, Vec<u16>)> = Vec::new();
                for bit in self.iter_ones() {
                    let key = (bit >> 16) as u16;
                    let low = (bit & 0xFFFF) as u16;
                    if current_key != Some(key) {
                        if let Some(k) = current_key {
                            containers.push((k, std::mem::take(&mut values)));
                        }
                        current_key = Some(key);
                    }
                    values.push(low);
                }
                if let Some(k) = current_key {
                    containers.push((k, values));
                }
                out.extend_from_slice(&(containers.len() as u32).to_be_bytes());
                for (key, lows) in containers {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&(lows.len() as u32).to_be_bytes());
                    for low in lows {
                        out.extend_from_slice(&low.to_be_bytes());
                    }
                }
            }
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Bitmap> {
        let corrupt = || Error::Codec("corrupt bitmap".into());
        let format = *bytes.first().ok_or_else(corrupt)?;
        let len_bytes: [u8; 8] = bytes.get(1..9).ok_or_else(corrupt)?.try_into().unwrap();
        let len_bits = u64::from_be_bytes(len_bytes) as usize;
        let mut bitmap = Bitmap::new(len_bits);
        let body = &bytes[9..];
        match format {
            FMT_NONE => {
                if body.len() != bitmap.words.len() * 8 {
                    return Err(corrupt());
                }
                for (i, chunk) in body.chunks_exact(8).enumerate() {
                    bitmap.words[i] = u64::from_be_bytes(chunk.try_into().unwrap());
                }
            }
            FMT_RLE => {
                let mut raw = Vec::with_capacity(bitmap.words.len() * 8);
                let mut i = 0;
                while i + 3 <= body.len() {
                    let value = body[i];
                    let run = u16::from_be_bytes([body[i + 1], body[i + 2]]) as usize;
                    raw.extend(std::iter::repeat(value).take(run));
                    i += 3;
                }
                if i != body.len() || raw.len() != bitmap.words.len() * 8 {
                    return Err(corrupt());
                }
                for (w, chunk) in raw.chunks_exact(8).enumerate() {
                    bitmap.words[w] = u64::from_be_bytes(chunk.try_into().unwrap());
                }
            }
            FMT_WAH => {
                let mut wi = 0;
                let mut i = 0;
                while i < body.len() {
                    match body[i] {
                        1 => {
                            let fill = *body.get(i + 1).ok_or_else(corrupt)?;
                            let run_bytes: [u8; 4] =
                                body.get(i + 2..i + 6).ok_or_else(corrupt)?.try_into().unwrap();
                            let run = u32::from_be_bytes(run_bytes) as usize;
                            let word = if fill == 0 { 0 } else { u64::MAX };
                            for _ in 0..run {
                                if wi >= bitmap.words.len() {
                                    return Err(corrupt());
                                }
                                bitmap.words[wi] = word;
                                wi += 1;
                            }
                            i += 6;
                        }
                        0 => {
                            let word_bytes: [u8; 8] =
                                body.get(i + 1..i + 9).ok_or_else(corrupt)?.try_into().unwrap();
                            if wi >= bitmap.words.len() {
                                return Err(corrupt());
                            }
                            bitmap.words[wi] = u64::from_be_bytes(word_bytes);
                            wi += 1;
                            i += 9;
                        }
                        _ => return Err(corrupt()),
                    }
                }
                if wi != bitmap.words.len() {
                    return Err(corrupt());
                }
                bitmap.mask_tail();
            }
            FMT_ROARING => {
                let count_bytes: [u8; 4] = body.get(..4).ok_or_else(corrupt)?.try_into().unwrap();
                let container_count = u32::from_be_bytes(count_bytes) as usize;
                let mut i = 4;
                for _ in 0..container_count {
                    let key_bytes: [u8; 2] =
                        body.get(i..i + 2).ok_or_else(corrupt)?.try_into().unwrap();
                    let key = u16::from_be_bytes(key_bytes) as usize;
                    let n_bytes: [u8; 4] =
                        body.get(i + 2..i + 6).ok_or_else(corrupt)?.try_into().unwrap();
                    let n = u32::from_be_bytes(n_bytes) as usize;
                    i += 6;
                    for _ in 0..n {
                        let low_bytes: [u8; 2] =
                            body.get(i..i + 2).ok_or_else(corrupt)?.try_into().unwrap();
                        let low = u16::from_be_bytes(low_bytes) as usize;
                        bitmap.set((key << 16) | low);
                        i += 2;
                    }
                }
                if i != body.len() {
                    return Err(corrupt());
                }
            }
            _ => return Err(corrupt()),
        }
        bitmap.pop_cache.set(None);
        Ok(bitmap)
    }

    /// Grow to at least `len_bits`, preserving contents.
    fn grow_to(&mut self, len_bits: usize) {
        if len_bits > self.len_bits {
            self.len_bits = len_bits;
            self.words.resize(len_bits.div_ceil(64), 0);
        }
    }
}

// ── Index maintenance ──────────────────────────────────────────────────

/// Bit position of a record: its single integer primary key.
fn bit_position(ty: &RecordType, record: &DynRecord) -> Result<usize> {
    let pk = ty.primary_key(record)?;
    match (pk.len(), pk.get(0)) {
        (1, Some(TupleValue::Int(v))) if *v >= 0 => Ok(*v as usize),
        _ => Err(Error::InvalidQuery(format!(
            "bitmap index requires a single non-negative integer primary key, got {pk}"
        ))),
    }
}

pub(crate) fn maintain(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    old: Option<&DynRecord>,
    new: Option<&DynRecord>,
    subspace: &Subspace,
    compression: BitmapCompression,
    tx: &mut dyn KvTransaction,
) -> Result<()> {
    let old_state = match old {
        Some(r) => Some((key_path_values(descriptor, ty, r)?, bit_position(ty, r)?)),
        None => None,
    };
    let new_state = match new {
        Some(r) => Some((key_path_values(descriptor, ty, r)?, bit_position(ty, r)?)),
        None => None,
    };
    if old_state == new_state {
        return Ok(());
    }
    if let Some((values, bit)) = old_state {
        let key = subspace.pack(&values);
        if let Some(bytes) = tx.get(&key)? {
            let mut bitmap = Bitmap::deserialize(&bytes)?;
            bitmap.clear(bit);
            if bitmap.pop_count() == 0 {
                tx.clear(&key)?;
            } else {
                tx.set(&key, &bitmap.serialize(compression))?;
            }
        }
    }
    if let Some((values, bit)) = new_state {
        let key = subspace.pack(&values);
        let mut bitmap = match tx.get(&key)? {
            Some(bytes) => Bitmap::deserialize(&bytes)?,
            None => Bitmap::new(0),
        };
        bitmap.grow_to(bit + 1);
        bitmap.set(bit);
        tx.set(&key, &bitmap.serialize(compression))?;
    }
    Ok(())
}

/// Load the bitmap for one key value.
pub fn bitmap_for_value(
    subspace: &Subspace,
    value: &Tuple,
    reader: &dyn KvRead,
) -> Result<Option<Bitmap>> {
    match reader.get(&subspace.pack(value))? {
        Some(bytes) => Ok(Some(Bitmap::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;
    use crate::kv::MemoryKv;
    use crate::tuple;

    #[test]
    fn test_set_get_clear() {
        let mut b = Bitmap::new(130);
        b.set(0);
        b.set(64);
        b.set(129);
        assert!(b.get(0) && b.get(64) && b.get(129));
        assert_eq!(b.pop_count(), 3);
        b.clear(64);
        assert!(!b.get(64));
        assert_eq!(b.pop_count(), 2);
    }

    #[test]
    fn test_out_of_range_is_noop() {
        let mut b = Bitmap::new(10);
        b.set(1000);
        b.clear(1000);
        assert!(!b.get(1000));
        assert_eq!(b.pop_count(), 0);
    }

    #[test]
    fn test_double_not_identity() {
        let mut b = Bitmap::new(100);
        for bit in [0, 3, 63, 64, 99] {
            b.set(bit);
        }
        assert_eq!(b.not().not(), b);
    }

    #[test]
    fn test_xor_self_is_empty() {
        let mut b = Bitmap::new(77);
        for bit in [1, 2, 76] {
            b.set(bit);
        }
        assert_eq!(b.xor(&b).unwrap().pop_count(), 0);
    }

    #[test]
    fn test_and_or() {
        let mut a = Bitmap::new(8);
        let mut b = Bitmap::new(8);
        a.set(1);
        a.set(2);
        b.set(2);
        b.set(3);
        let and = a.and(&b).unwrap();
        assert_eq!(and.iter_ones().collect::<Vec<_>>(), vec![2]);
        let or = a.or(&b).unwrap();
        assert_eq!(or.iter_ones().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let a = Bitmap::new(8);
        let b = Bitmap::new(16);
        assert!(a.and(&b).is_err());
    }

    #[test]
    fn test_serialize_all_variants() {
        let mut b = Bitmap::new(200_000);
        for bit in [0, 1, 63, 64, 65_536, 65_537, 131_072, 199_999] {
            b.set(bit);
        }
        for compression in [
            BitmapCompression::None,
            BitmapCompression::RunLength,
            BitmapCompression::WordAligned,
            BitmapCompression::Roaring,
        ] {
            let bytes = b.serialize(compression);
            let back = Bitmap::deserialize(&bytes).unwrap();
            assert_eq!(back, b, "roundtrip failed for {compression:?}");
        }
    }

    #[test]
    fn test_compressed_smaller_on_sparse() {
        let mut b = Bitmap::new(1_000_000);
        b.set(5);
        b.set(999_999);
        let raw = b.serialize(BitmapCompression::None).len();
        let wah = b.serialize(BitmapCompression::WordAligned).len();
        let roaring = b.serialize(BitmapCompression::Roaring).len();
        assert!(wah < raw / 100);
        assert!(roaring < raw / 100);
    }

    #[test]
    fn test_maintain_roundtrip() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let desc = IndexDescriptor::new(
            "idx_flag",
            vec!["flag"],
            IndexKind::Bitmap { compression: BitmapCompression::WordAligned },
            vec!["event"],
        );
        let ty = RecordType::new("event", vec!["id", "flag"], vec!["id"]);
        let sub = desc.subspace(&root);

        let r1 = DynRecord::new("event").with("id", 3i64).with("flag", "hot");
        let r2 = DynRecord::new("event").with("id", 9i64).with("flag", "hot");
        kv.run(|tx| {
            maintain(&desc, &ty, None, Some(&r1), &sub, BitmapCompression::WordAligned, tx)?;
            maintain(&desc, &ty, None, Some(&r2), &sub, BitmapCompression::WordAligned, tx)
        })
        .unwrap();

        let tx = kv.begin();
        let bitmap = bitmap_for_value(&sub, &tuple!["hot"], &tx).unwrap().unwrap();
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![3, 9]);

        // Moving a record to another value clears the old bit
        let r1b = DynRecord::new("event").with("id", 3i64).with("flag", "cold");
        kv.run(|tx| {
            maintain(&desc, &ty, Some(&r1), Some(&r1b), &sub, BitmapCompression::WordAligned, tx)
        })
        .unwrap();
        let tx = kv.begin();
        let hot = bitmap_for_value(&sub, &tuple!["hot"], &tx).unwrap().unwrap();
        assert_eq!(hot.iter_ones().collect::<Vec<_>>(), vec![9]);
        let cold = bitmap_for_value(&sub, &tuple!["cold"], &tx).unwrap().unwrap();
        assert_eq!(cold.iter_ones().collect::<Vec<_>>(), vec![3]);
    }
}
