//! Full-Text Index
//!
//! Tokens are lower-cased and split on non-alphanumeric boundaries;
//! entries live at `terms / <term> / <item-id> -> ∅`. A query carries a
//! term list and a match mode: `All` intersects the per-term id sets,
//! `Any` unions them. Matching is case-insensitive.

use crate::error::Result;
use crate::index::{key_path_values, EntryStream, IndexDescriptor, IndexEntry};
use crate::kv::{KvRead, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use std::collections::{BTreeMap, BTreeSet};

/// How multiple query terms combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Every term must match (set intersection)
    #[default]
    All,
    /// Any term may match (set union)
    Any,
}

/// A full-text query.
#[derive(Debug, Clone, Default)]
pub struct FullTextQuery {
    pub terms: Vec<String>,
    pub mode: MatchMode,
    pub limit: Option<usize>,
}

impl FullTextQuery {
    pub fn all_of(terms: Vec<&str>) -> Self {
        FullTextQuery {
            terms: terms.into_iter().map(String::from).collect(),
            mode: MatchMode::All,
            limit: None,
        }
    }

    pub fn any_of(terms: Vec<&str>) -> Self {
        FullTextQuery {
            terms: terms.into_iter().map(String::from).collect(),
            mode: MatchMode::Any,
            limit: None,
        }
    }

    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Lower-cased tokens of a text value, split on non-alphanumeric
/// boundaries, deduplicated.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Map a record to its term entries.
pub fn entries(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<BTreeMap<Tuple, Vec<u8>>> {
    let values = key_path_values(descriptor, ty, record)?;
    let pk = ty.primary_key(record)?;
    let mut out = BTreeMap::new();
    for value in &values.0 {
        let TupleValue::String(text) = value else { continue };
        for term in tokenize(text) {
            let mut key = Tuple::empty();
            key.push("terms");
            key.push(term);
            out.insert(key.concat(&pk), Vec::new());
        }
    }
    Ok(out)
}

/// Item ids matching one term, in id order.
fn ids_for_term(
    subspace: &Subspace,
    term: &str,
    reader: &dyn KvRead,
) -> Result<BTreeSet<Tuple>> {
    let term_space = subspace.child("terms").child(term.to_lowercase());
    let (begin, end) = term_space.range();
    let mut ids = BTreeSet::new();
    for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
        let (key, _) = pair?;
        ids.insert(term_space.unpack(&key)?);
    }
    Ok(ids)
}

/// Search the index; ids are emitted in primary-key order.
pub fn search<'a>(
    subspace: &Subspace,
    reader: &'a dyn KvRead,
    query: &FullTextQuery,
) -> Result<EntryStream<'a>> {
    let mut result: Option<BTreeSet<Tuple>> = None;
    for term in &query.terms {
        let ids = ids_for_term(subspace, term, reader)?;
        result = Some(match (result, query.mode) {
            (None, _) => ids,
            (Some(acc), MatchMode::All) => acc.intersection(&ids).cloned().collect(),
            (Some(acc), MatchMode::Any) => acc.union(&ids).cloned().collect(),
        });
        // Intersection can only shrink; stop early when empty
        if query.mode == MatchMode::All
            && result.as_ref().is_some_and(BTreeSet::is_empty)
        {
            break;
        }
    }
    let ids = result.unwrap_or_default();
    let limit = query.limit.unwrap_or(usize::MAX);
    Ok(Box::new(ids.into_iter().take(limit).map(|item_id| {
        Ok(IndexEntry {
            key_values: Tuple::empty(),
            item_id,
            stored_values: None,
        })
    })))
}
