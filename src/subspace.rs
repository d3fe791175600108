//! Subspaces
//!
//! A subspace is a fixed byte prefix plus the tuple-packing protocol.
//! Every persistent structure in the engine addresses the KV store through
//! a subspace; raw key bytes never cross a module boundary.
//!
//! Child subspaces are derived by appending a packed tuple to the parent
//! prefix, so every child key is lexicographically bracketed by the
//! parent's range.

use crate::error::{Error, Result};
use crate::tuple::{Tuple, TupleValue};

/// A keyed prefix plus a tuple encoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// Root subspace with a raw byte prefix.
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Subspace { prefix: prefix.into() }
    }

    /// Subspace rooted at the empty prefix.
    pub fn root() -> Self {
        Subspace { prefix: Vec::new() }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Derive a child subspace by appending a packed tuple.
    pub fn subspace(&self, tuple: &Tuple) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple.pack());
        Subspace { prefix }
    }

    /// Derive a child subspace from a single value.
    pub fn child(&self, value: impl Into<TupleValue>) -> Subspace {
        self.subspace(&Tuple::new(vec![value.into()]))
    }

    /// Pack a tuple under this subspace's prefix.
    pub fn pack(&self, tuple: &Tuple) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple.pack());
        key
    }

    /// Unpack a key produced by [`Subspace::pack`]. Fails with
    /// [`Error::InvalidEncoding`] when the key does not carry this
    /// subspace's prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Tuple> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            Error::InvalidEncoding(format!(
                "key does not belong to subspace (prefix len {})",
                self.prefix.len()
            ))
        })?;
        Tuple::unpack(rest)
    }

    /// True when the key lies inside this subspace.
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The `[begin, end)` byte range covering every key in this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let begin = self.prefix.clone();
        (begin, prefix_end(&self.prefix))
    }
}

/// Smallest byte string strictly greater than every string with the given
/// prefix: increment the last non-0xFF byte and truncate. An all-0xFF
/// prefix has no such bound, so a 0xFF sentinel byte is appended instead.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last < 0xFF {
            let ix = end.len() - 1;
            end[ix] = last + 1;
            return end;
        }
        end.pop();
    }
    // Unbounded; fall back to a key beyond any packed tuple prefix
    let mut end = prefix.to_vec();
    end.push(0xFF);
    end
}
