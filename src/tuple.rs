//! Order-Preserving Tuple Encoding
//!
//! Packs heterogeneous tuples (null, bool, int, float, string, bytes,
//! nested tuple) into bytes whose lexicographic order agrees with the
//! semantic order of the values: first by type tag, then by value within
//! the type.
//!
//! Layout per element:
//! - Null: `00` (inside a nested tuple: `00 FF` so the terminator stays
//!   unambiguous)
//! - Bool: `01` (false) / `02` (true)
//! - Bytes: `10` + payload with `00 -> 00 FF` escape + `00` terminator
//! - String: `11` + UTF-8 payload, same escape and terminator
//! - Int: `20` + 8-byte big-endian with the sign bit flipped
//! - Float: `21` + 8 IEEE-754 bytes, sign bit flipped for positives, all
//!   bits flipped for negatives (total order, NaN included)
//! - Nested: `30` + element encodings + `00` terminator

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_BYTES: u8 = 0x10;
const TAG_STRING: u8 = 0x11;
const TAG_INT: u8 = 0x20;
const TAG_FLOAT: u8 = 0x21;
const TAG_NESTED: u8 = 0x30;

/// A single tuple element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TupleValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Nested(Vec<TupleValue>),
}

impl TupleValue {
    /// Rank used to order values of different types; matches the tag bytes.
    fn type_rank(&self) -> u8 {
        match self {
            TupleValue::Null => TAG_NULL,
            TupleValue::Bool(false) => TAG_FALSE,
            TupleValue::Bool(true) => TAG_TRUE,
            TupleValue::Int(_) => TAG_INT,
            TupleValue::Float(_) => TAG_FLOAT,
            TupleValue::String(_) => TAG_STRING,
            TupleValue::Bytes(_) => TAG_BYTES,
            TupleValue::Nested(_) => TAG_NESTED,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TupleValue::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TupleValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            TupleValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TupleValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for TupleValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TupleValue {}

impl PartialOrd for TupleValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TupleValue {
    /// Total order consistent with the packed byte order.
    fn cmp(&self, other: &Self) -> Ordering {
        use TupleValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Nested(a), Nested(b)) => a.cmp(b),
            (Null, Null) => Ordering::Equal,
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl Hash for TupleValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            TupleValue::Null | TupleValue::Bool(_) => {}
            TupleValue::Int(v) => v.hash(state),
            TupleValue::Float(v) => v.to_bits().hash(state),
            TupleValue::String(s) => s.hash(state),
            TupleValue::Bytes(b) => b.hash(state),
            TupleValue::Nested(t) => t.hash(state),
        }
    }
}

impl fmt::Display for TupleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleValue::Null => write!(f, "null"),
            TupleValue::Bool(b) => write!(f, "{b}"),
            TupleValue::Int(v) => write!(f, "{v}"),
            TupleValue::Float(v) => write!(f, "{v}"),
            TupleValue::String(s) => write!(f, "{s:?}"),
            TupleValue::Bytes(b) => write!(f, "0x{}", hex_bytes(b)),
            TupleValue::Nested(t) => {
                write!(f, "(")?;
                for (i, v) in t.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<i64> for TupleValue {
    fn from(v: i64) -> Self {
        TupleValue::Int(v)
    }
}

impl From<f64> for TupleValue {
    fn from(v: f64) -> Self {
        TupleValue::Float(v)
    }
}

impl From<&str> for TupleValue {
    fn from(v: &str) -> Self {
        TupleValue::String(v.to_string())
    }
}

impl From<String> for TupleValue {
    fn from(v: String) -> Self {
        TupleValue::String(v)
    }
}

impl From<bool> for TupleValue {
    fn from(v: bool) -> Self {
        TupleValue::Bool(v)
    }
}

impl From<Vec<u8>> for TupleValue {
    fn from(v: Vec<u8>) -> Self {
        TupleValue::Bytes(v)
    }
}

/// An ordered sequence of tuple elements.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tuple(pub Vec<TupleValue>);

impl Tuple {
    pub fn new(values: Vec<TupleValue>) -> Self {
        Tuple(values)
    }

    pub fn empty() -> Self {
        Tuple(Vec::new())
    }

    /// Single-element tuple.
    pub fn from_single(value: impl Into<TupleValue>) -> Self {
        Tuple(vec![value.into()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TupleValue> {
        self.0.get(index)
    }

    pub fn push(&mut self, value: impl Into<TupleValue>) {
        self.0.push(value.into());
    }

    /// Concatenation: `self` followed by `other`.
    pub fn concat(&self, other: &Tuple) -> Tuple {
        let mut values = self.0.clone();
        values.extend(other.0.iter().cloned());
        Tuple(values)
    }

    /// Pack into order-preserving bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 9);
        for value in &self.0 {
            encode_value(value, &mut out, false);
        }
        out
    }

    /// Unpack bytes produced by [`Tuple::pack`].
    pub fn unpack(bytes: &[u8]) -> Result<Tuple> {
        let mut values = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (value, next) = decode_value(bytes, pos, false)?;
            values.push(value);
            pos = next;
        }
        Ok(Tuple(values))
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<TupleValue>> for Tuple {
    fn from(values: Vec<TupleValue>) -> Self {
        Tuple(values)
    }
}

fn encode_value(value: &TupleValue, out: &mut Vec<u8>, nested: bool) {
    match value {
        TupleValue::Null => {
            out.push(TAG_NULL);
            if nested {
                // Disambiguate from the nested-tuple terminator
                out.push(0xFF);
            }
        }
        TupleValue::Bool(false) => out.push(TAG_FALSE),
        TupleValue::Bool(true) => out.push(TAG_TRUE),
        TupleValue::Bytes(bytes) => {
            out.push(TAG_BYTES);
            encode_escaped(bytes, out);
        }
        TupleValue::String(s) => {
            out.push(TAG_STRING);
            encode_escaped(s.as_bytes(), out);
        }
        TupleValue::Int(v) => {
            out.push(TAG_INT);
            // Flipping the sign bit makes the big-endian byte order match
            // the signed integer order
            let flipped = (*v as u64) ^ (1u64 << 63);
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        TupleValue::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&flip_float_bits(*v).to_be_bytes());
        }
        TupleValue::Nested(values) => {
            out.push(TAG_NESTED);
            for v in values {
                encode_value(v, out, true);
            }
            out.push(0x00);
        }
    }
}

/// Positive floats: flip the sign bit. Negative floats: flip every bit.
/// Yields a total order over the raw bytes identical to `f64::total_cmp`.
fn flip_float_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1u64 << 63) == 0 {
        bits ^ (1u64 << 63)
    } else {
        !bits
    }
}

fn unflip_float_bits(bits: u64) -> f64 {
    if bits & (1u64 << 63) != 0 {
        f64::from_bits(bits ^ (1u64 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

/// `00` bytes in the payload are escaped as `00 FF`; the element is
/// terminated by a bare `00`. `00 FF` sorts above the terminator, so
/// prefix strings sort first.
fn encode_escaped(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

fn decode_escaped(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    loop {
        let b = *bytes
            .get(pos)
            .ok_or_else(|| Error::InvalidEncoding("unterminated byte string".into()))?;
        pos += 1;
        if b == 0x00 {
            match bytes.get(pos) {
                Some(0xFF) => {
                    payload.push(0x00);
                    pos += 1;
                }
                _ => return Ok((payload, pos)),
            }
        } else {
            payload.push(b);
        }
    }
}

fn decode_value(bytes: &[u8], pos: usize, nested: bool) -> Result<(TupleValue, usize)> {
    let tag = *bytes
        .get(pos)
        .ok_or_else(|| Error::InvalidEncoding("truncated tuple".into()))?;
    let pos = pos + 1;
    match tag {
        TAG_NULL => {
            if nested {
                match bytes.get(pos) {
                    Some(0xFF) => Ok((TupleValue::Null, pos + 1)),
                    _ => Err(Error::InvalidEncoding("bad nested null".into())),
                }
            } else {
                Ok((TupleValue::Null, pos))
            }
        }
        TAG_FALSE => Ok((TupleValue::Bool(false), pos)),
        TAG_TRUE => Ok((TupleValue::Bool(true), pos)),
        TAG_BYTES => {
            let (payload, next) = decode_escaped(bytes, pos)?;
            Ok((TupleValue::Bytes(payload), next))
        }
        TAG_STRING => {
            let (payload, next) = decode_escaped(bytes, pos)?;
            let s = String::from_utf8(payload)
                .map_err(|e| Error::InvalidEncoding(format!("invalid utf-8 in string: {e}")))?;
            Ok((TupleValue::String(s), next))
        }
        TAG_INT => {
            let end = pos + 8;
            let slice = bytes
                .get(pos..end)
                .ok_or_else(|| Error::InvalidEncoding("truncated int".into()))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            let flipped = u64::from_be_bytes(buf) ^ (1u64 << 63);
            Ok((TupleValue::Int(flipped as i64), end))
        }
        TAG_FLOAT => {
            let end = pos + 8;
            let slice = bytes
                .get(pos..end)
                .ok_or_else(|| Error::InvalidEncoding("truncated float".into()))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(slice);
            Ok((TupleValue::Float(unflip_float_bits(u64::from_be_bytes(buf))), end))
        }
        TAG_NESTED => {
            let mut values = Vec::new();
            let mut p = pos;
            loop {
                match bytes.get(p) {
                    None => {
                        return Err(Error::InvalidEncoding("unterminated nested tuple".into()))
                    }
                    Some(0x00) if bytes.get(p + 1) != Some(&0xFF) => {
                        return Ok((TupleValue::Nested(values), p + 1));
                    }
                    Some(_) => {
                        let (value, next) = decode_value(bytes, p, true)?;
                        values.push(value);
                        p = next;
                    }
                }
            }
        }
        other => Err(Error::InvalidEncoding(format!("unknown type tag 0x{other:02x}"))),
    }
}

/// Convenience macro for building tuples in tests and call sites:
/// `tuple!["users", 42]`.
#[macro_export]
macro_rules! tuple {
    ($($value:expr),* $(,)?) => {
        $crate::tuple::Tuple::new(vec![$($crate::tuple::TupleValue::from($value)),*])
    };
}
