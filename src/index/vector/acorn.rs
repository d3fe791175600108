//! Filtered Vector Search
//!
//! Combines HNSW traversal with a caller-supplied predicate over item
//! ids (typically closing over a record fetch). The candidate pool is
//! expanded by `expansion_factor` to offset filter selectivity,
//! optionally capped by `max_predicate_evaluations`. Results come back
//! in ascending distance order; a predicate that accepts nothing yields
//! an empty result.

use super::hnsw::HnswIndex;
use super::{VectorMatch, VectorQuery};
use crate::error::Result;
use crate::kv::KvRead;
use crate::tuple::Tuple;

/// Expansion parameters for filtered search.
#[derive(Debug, Clone, Copy)]
pub struct AcornParams {
    /// The candidate pool is `k * expansion_factor` wide
    pub expansion_factor: usize,
    /// Upper bound on predicate evaluations
    pub max_predicate_evaluations: Option<usize>,
}

impl Default for AcornParams {
    fn default() -> Self {
        AcornParams { expansion_factor: 4, max_predicate_evaluations: None }
    }
}

/// Search with a predicate filter.
pub fn filtered_search(
    index: &HnswIndex<'_>,
    reader: &dyn KvRead,
    query: &VectorQuery,
    params: &AcornParams,
    mut predicate: impl FnMut(&Tuple) -> Result<bool>,
) -> Result<Vec<VectorMatch>> {
    query.validate(index.dim())?;
    let pool_k = query.k.saturating_mul(params.expansion_factor.max(1));
    let expanded = VectorQuery {
        vector: query.vector.clone(),
        k: pool_k,
        ef_search: Some(
            query
                .ef_search
                .unwrap_or(index.default_ef_search())
                .max(pool_k),
        ),
    };
    let candidates = index.search(reader, &expanded)?;

    let mut evaluations = 0usize;
    let mut accepted = Vec::with_capacity(query.k);
    for candidate in candidates {
        if let Some(cap) = params.max_predicate_evaluations {
            if evaluations >= cap {
                break;
            }
        }
        evaluations += 1;
        if predicate(&candidate.item_id)? {
            accepted.push(candidate);
            if accepted.len() >= query.k {
                break;
            }
        }
    }
    tracing::trace!(evaluations, accepted = accepted.len(), "acorn_filtered_search");
    Ok(accepted)
}
