//! HNSW Vector Index
//!
//! A hierarchical navigable small-world graph encoded entirely as KV
//! entries, so graph mutations commit atomically with the record that
//! caused them:
//!
//! - `n / <node-id> -> (level, vector-bytes)`
//! - `e / <node-id> / <level> / <neighbor-id> -> ∅`
//! - `meta -> (entry-point, max-level)`
//! - `q / <node-id> -> quantized code` (when a codebook is trained)
//! - `qc -> serialized codebook`
//!
//! Nodes draw a level from a geometric distribution with normalizer
//! `1/ln(M)`. Insertion descends greedily from the entry point, then
//! selects diverse neighbors per layer up to degree `M`, keeping edges
//! bidirectional and pruning the reverse side with the same heuristic.
//! A mutation that would touch more nodes than the inline limit fails
//! with `GraphTooLargeForInline`; bulk loads go through [`bulk_load`],
//! which batches across transactions and is resumable.

use super::quantizer::{self, Quantizer};
use super::{distance, vector_of, DistanceMetric, HnswParams, VectorMatch, VectorQuery};
use crate::error::{Error, Result};
use crate::index::{key_path_values, IndexDescriptor};
use crate::kv::{KvRead, KvStore, KvTransaction, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

const MAX_LAYER: u8 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    level: u8,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaRecord {
    entry_point: Tuple,
    max_level: u8,
}

/// Distance-ordered candidate used by the layer search.
#[derive(Clone)]
struct Candidate {
    dist: f32,
    id: Tuple,
    vector: Vec<f32>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist && self.id == other.id
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.total_cmp(&other.dist).then_with(|| self.id.cmp(&other.id))
    }
}

/// Counts distinct nodes a mutation touches and enforces the inline
/// budget.
struct Touched {
    seen: HashSet<Vec<u8>>,
    limit: usize,
}

impl Touched {
    fn new(limit: usize) -> Self {
        Touched { seen: HashSet::new(), limit }
    }

    fn touch(&mut self, node_key: &[u8]) -> Result<()> {
        if self.seen.insert(node_key.to_vec()) && self.seen.len() > self.limit {
            return Err(Error::GraphTooLargeForInline {
                nodes: self.seen.len(),
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// Graph operations over one index subspace.
pub struct HnswIndex<'a> {
    subspace: &'a Subspace,
    params: &'a HnswParams,
    /// Node-touch budget for a single inline mutation
    pub inline_limit: usize,
}

impl<'a> HnswIndex<'a> {
    pub fn new(subspace: &'a Subspace, params: &'a HnswParams) -> Self {
        HnswIndex { subspace, params, inline_limit: 500 }
    }

    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit.max(1);
        self
    }

    pub fn dim(&self) -> usize {
        self.params.dim
    }

    pub fn default_ef_search(&self) -> usize {
        self.params.ef_search
    }

    // ── Key helpers ────────────────────────────────────────────────────

    fn node_key(&self, id: &Tuple) -> Vec<u8> {
        self.subspace.child("n").pack(id)
    }

    fn edge_space(&self, id: &Tuple, level: u8) -> Subspace {
        self.subspace.child("e").subspace(id).child(level as i64)
    }

    fn meta_key(&self) -> Vec<u8> {
        self.subspace.pack(&Tuple::from_single("meta"))
    }

    fn code_key(&self, id: &Tuple) -> Vec<u8> {
        self.subspace.child("q").pack(id)
    }

    fn codebook_key(&self) -> Vec<u8> {
        self.subspace.pack(&Tuple::from_single("qc"))
    }

    // ── Node / meta IO ─────────────────────────────────────────────────

    fn read_node(&self, id: &Tuple, reader: &dyn KvRead) -> Result<Option<NodeRecord>> {
        match reader.get(&self.node_key(id))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| Error::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn write_node(&self, id: &Tuple, node: &NodeRecord, tx: &mut dyn KvTransaction) -> Result<()> {
        let bytes = bincode::serialize(node).map_err(|e| Error::Codec(e.to_string()))?;
        tx.set(&self.node_key(id), &bytes)
    }

    fn read_meta(&self, reader: &dyn KvRead) -> Result<Option<MetaRecord>> {
        match reader.get(&self.meta_key())? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| Error::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn write_meta(&self, meta: &MetaRecord, tx: &mut dyn KvTransaction) -> Result<()> {
        let bytes = bincode::serialize(meta).map_err(|e| Error::Codec(e.to_string()))?;
        tx.set(&self.meta_key(), &bytes)
    }

    fn neighbors(&self, id: &Tuple, level: u8, reader: &dyn KvRead) -> Result<Vec<Tuple>> {
        let space = self.edge_space(id, level);
        let (begin, end) = space.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            out.push(space.unpack(&key)?);
        }
        Ok(out)
    }

    /// Replace a node's neighbor list at one level.
    fn set_neighbors(
        &self,
        id: &Tuple,
        level: u8,
        neighbors: &[Tuple],
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let space = self.edge_space(id, level);
        let (begin, end) = space.range();
        tx.clear_range(&begin, &end)?;
        for neighbor in neighbors {
            tx.set(&space.pack(neighbor), &[])?;
        }
        Ok(())
    }

    // ── Search ─────────────────────────────────────────────────────────

    /// Best-first search within one layer, candidate list bounded by
    /// `ef`. Entry points must carry their vectors.
    fn search_layer(
        &self,
        query: &[f32],
        entries: Vec<Candidate>,
        ef: usize,
        level: u8,
        reader: &dyn KvRead,
        touched: Option<&mut Touched>,
    ) -> Result<Vec<Candidate>> {
        let mut visited: HashSet<Tuple> = entries.iter().map(|c| c.id.clone()).collect();
        // Min-heap of frontier candidates, max-heap of best results
        let mut frontier: BinaryHeap<Reverse<Candidate>> =
            entries.iter().cloned().map(Reverse).collect();
        let mut best: BinaryHeap<Candidate> = entries.into_iter().collect();
        let mut budget = touched;

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = best.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
            if current.dist > worst && best.len() >= ef {
                break;
            }
            for neighbor in self.neighbors(&current.id, level, reader)? {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                if let Some(t) = budget.as_deref_mut() {
                    t.touch(&self.node_key(&neighbor))?;
                }
                let Some(node) = self.read_node(&neighbor, reader)? else {
                    continue;
                };
                let d = distance(self.params.metric, query, &node.vector);
                let worst = best.peek().map(|c| c.dist).unwrap_or(f32::INFINITY);
                if best.len() < ef || d < worst {
                    let candidate = Candidate { dist: d, id: neighbor, vector: node.vector };
                    frontier.push(Reverse(candidate.clone()));
                    best.push(candidate);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }
        let mut out: Vec<Candidate> = best.into_vec();
        out.sort();
        Ok(out)
    }

    /// Diversity-preferring neighbor selection: a candidate is kept only
    /// if it is closer to the target than to every already-selected
    /// neighbor, up to degree `M`.
    fn select_neighbors(&self, candidates: &[Candidate], m: usize) -> Vec<Candidate> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        for candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let diverse = selected.iter().all(|kept| {
                distance(self.params.metric, &candidate.vector, &kept.vector) > candidate.dist
            });
            if diverse {
                selected.push(candidate.clone());
            }
        }
        // Backfill with nearest skipped candidates if diversity starved
        if selected.len() < m {
            for candidate in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|kept| kept.id == candidate.id) {
                    selected.push(candidate.clone());
                }
            }
        }
        selected
    }

    /// Nearest-neighbor search with an `ef_search`-bounded candidate
    /// list per layer.
    pub fn search(&self, reader: &dyn KvRead, query: &VectorQuery) -> Result<Vec<VectorMatch>> {
        query.validate(self.params.dim)?;
        let Some(meta) = self.read_meta(reader)? else {
            return Ok(Vec::new());
        };
        let Some(ep_node) = self.read_node(&meta.entry_point, reader)? else {
            return Err(Error::Internal("entry point node missing".into()));
        };
        let mut entry = Candidate {
            dist: distance(self.params.metric, &query.vector, &ep_node.vector),
            id: meta.entry_point.clone(),
            vector: ep_node.vector,
        };
        for level in (1..=meta.max_level).rev() {
            let found =
                self.search_layer(&query.vector, vec![entry.clone()], 1, level, reader, None)?;
            if let Some(best) = found.into_iter().next() {
                entry = best;
            }
        }
        let ef = query.ef_search.unwrap_or(self.params.ef_search).max(query.k);
        let found = self.search_layer(&query.vector, vec![entry], ef, 0, reader, None)?;
        Ok(found
            .into_iter()
            .take(query.k)
            .map(|c| VectorMatch { item_id: c.id, distance: c.dist })
            .collect())
    }

    // ── Mutation ───────────────────────────────────────────────────────

    /// Insert or replace one node inline. Fails with
    /// `GraphTooLargeForInline` when the mutation would touch more nodes
    /// than the inline budget.
    pub fn insert(&self, id: &Tuple, vector: &[f32], tx: &mut dyn KvTransaction) -> Result<()> {
        if vector.len() != self.params.dim {
            return Err(Error::Vector(format!(
                "dimension mismatch: index has {}, vector has {}",
                self.params.dim,
                vector.len()
            )));
        }
        if self.read_node(id, &*tx)?.is_some() {
            self.remove(id, tx)?;
        }

        let mut touched = Touched::new(self.inline_limit);
        touched.touch(&self.node_key(id))?;

        let level = draw_level(self.params.level_norm());
        let node = NodeRecord { level, vector: vector.to_vec() };

        let Some(meta) = self.read_meta(&*tx)? else {
            self.write_node(id, &node, tx)?;
            self.write_code(id, vector, tx)?;
            self.write_meta(&MetaRecord { entry_point: id.clone(), max_level: level }, tx)?;
            return Ok(());
        };

        let Some(ep_node) = self.read_node(&meta.entry_point, &*tx)? else {
            return Err(Error::Internal("entry point node missing".into()));
        };
        touched.touch(&self.node_key(&meta.entry_point))?;
        let mut entry = Candidate {
            dist: distance(self.params.metric, vector, &ep_node.vector),
            id: meta.entry_point.clone(),
            vector: ep_node.vector,
        };

        // Greedy descent through layers above the new node's level
        for lc in ((level + 1)..=meta.max_level).rev() {
            let found =
                self.search_layer(vector, vec![entry.clone()], 1, lc, &*tx, Some(&mut touched))?;
            if let Some(best) = found.into_iter().next() {
                entry = best;
            }
        }

        // Connect at each layer from min(level, max_level) down to 0
        let mut entries = vec![entry];
        for lc in (0..=level.min(meta.max_level)).rev() {
            let candidates = self.search_layer(
                vector,
                entries.clone(),
                self.params.ef_construction,
                lc,
                &*tx,
                Some(&mut touched),
            )?;
            let neighbors = self.select_neighbors(&candidates, self.params.m);
            let neighbor_ids: Vec<Tuple> = neighbors.iter().map(|c| c.id.clone()).collect();
            self.set_neighbors(id, lc, &neighbor_ids, tx)?;

            // Bidirectional edges: each neighbor gains the new node and
            // prunes back to M with the same heuristic
            for neighbor in &neighbors {
                touched.touch(&self.node_key(&neighbor.id))?;
                let mut peer_ids = self.neighbors(&neighbor.id, lc, &*tx)?;
                if !peer_ids.contains(id) {
                    peer_ids.push(id.clone());
                }
                if peer_ids.len() <= self.params.m {
                    self.set_neighbors(&neighbor.id, lc, &peer_ids, tx)?;
                } else {
                    let mut peer_candidates = Vec::with_capacity(peer_ids.len());
                    for peer in &peer_ids {
                        let peer_vector = if peer == id {
                            node.vector.clone()
                        } else {
                            touched.touch(&self.node_key(peer))?;
                            match self.read_node(peer, &*tx)? {
                                Some(n) => n.vector,
                                None => continue,
                            }
                        };
                        peer_candidates.push(Candidate {
                            dist: distance(self.params.metric, &neighbor.vector, &peer_vector),
                            id: peer.clone(),
                            vector: peer_vector,
                        });
                    }
                    peer_candidates.sort();
                    let pruned = self.select_neighbors(&peer_candidates, self.params.m);
                    let pruned_ids: Vec<Tuple> = pruned.into_iter().map(|c| c.id).collect();
                    self.set_neighbors(&neighbor.id, lc, &pruned_ids, tx)?;
                }
            }
            entries = candidates;
        }

        self.write_node(id, &node, tx)?;
        self.write_code(id, vector, tx)?;
        if level > meta.max_level {
            self.write_meta(&MetaRecord { entry_point: id.clone(), max_level: level }, tx)?;
        }
        tracing::trace!(level, nodes_touched = touched.seen.len(), "hnsw_insert");
        Ok(())
    }

    /// Remove one node: drop its record, its edge lists, and the reverse
    /// edges held by its neighbors.
    pub fn remove(&self, id: &Tuple, tx: &mut dyn KvTransaction) -> Result<()> {
        let Some(node) = self.read_node(id, &*tx)? else {
            return Ok(());
        };
        for level in 0..=node.level {
            for neighbor in self.neighbors(id, level, &*tx)? {
                tx.clear(&self.edge_space(&neighbor, level).pack(id))?;
            }
            let (begin, end) = self.edge_space(id, level).range();
            tx.clear_range(&begin, &end)?;
        }
        tx.clear(&self.node_key(id))?;
        tx.clear(&self.code_key(id))?;

        // Repair the entry point if it pointed at the removed node
        if let Some(meta) = self.read_meta(&*tx)? {
            if meta.entry_point == *id {
                match self.any_node(&*tx, id)? {
                    Some((new_ep, level)) => self.write_meta(
                        &MetaRecord { entry_point: new_ep, max_level: level },
                        tx,
                    )?,
                    None => tx.clear(&self.meta_key())?,
                }
            }
        }
        Ok(())
    }

    /// Highest-level node among a bounded scan, excluding `skip`.
    fn any_node(&self, reader: &dyn KvRead, skip: &Tuple) -> Result<Option<(Tuple, u8)>> {
        let node_space = self.subspace.child("n");
        let (begin, end) = node_space.range();
        let mut best: Option<(Tuple, u8)> = None;
        for pair in reader.get_range(&begin, &end, RangeOptions::limited(128)) {
            let (key, value) = pair?;
            let id = node_space.unpack(&key)?;
            if id == *skip {
                continue;
            }
            let node: NodeRecord =
                bincode::deserialize(&value).map_err(|e| Error::Codec(e.to_string()))?;
            if best.as_ref().is_none_or(|(_, l)| node.level > *l) {
                best = Some((id, node.level));
            }
        }
        Ok(best)
    }

    // ── Quantized code mirror ──────────────────────────────────────────

    /// Write the quantized code for a vector when a codebook is trained.
    fn write_code(&self, id: &Tuple, vector: &[f32], tx: &mut dyn KvTransaction) -> Result<()> {
        let Some(config) = &self.params.quantizer else {
            return Ok(());
        };
        let Some(bytes) = tx.get(&self.codebook_key())? else {
            // Not trained yet; the training pass backfills codes
            return Ok(());
        };
        let codebook = quantizer::deserialize_expecting(&bytes, config, self.params.dim)?;
        let code = codebook.encode(vector)?;
        tx.set(&self.code_key(id), &code)
    }

    /// Train the configured quantizer from the stored vectors and
    /// backfill every node's code.
    pub fn train_quantizer(&self, tx: &mut dyn KvTransaction) -> Result<()> {
        let Some(config) = &self.params.quantizer else {
            return Err(Error::Vector("index has no quantizer configured".into()));
        };
        let node_space = self.subspace.child("n");
        let (begin, end) = node_space.range();
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for pair in tx.get_range(&begin, &end, RangeOptions::default()) {
            let (key, value) = pair?;
            let node: NodeRecord =
                bincode::deserialize(&value).map_err(|e| Error::Codec(e.to_string()))?;
            ids.push(node_space.unpack(&key)?);
            vectors.push(node.vector);
        }
        let codebook = quantizer::train(config, self.params.metric, self.params.dim, &vectors)?;
        tx.set(&self.codebook_key(), &codebook.serialize()?)?;
        for (id, vector) in ids.iter().zip(&vectors) {
            let code = codebook.encode(vector)?;
            tx.set(&self.code_key(id), &code)?;
        }
        tracing::debug!(vectors = vectors.len(), "hnsw_quantizer_trained");
        Ok(())
    }

    /// Scan the code mirror with a prepared query, returning the best
    /// `k * over` approximate candidates for rescoring.
    pub fn search_codes(
        &self,
        reader: &dyn KvRead,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        let Some(config) = &self.params.quantizer else {
            return Err(Error::Vector("index has no quantizer configured".into()));
        };
        let Some(bytes) = reader.get(&self.codebook_key())? else {
            return Err(Error::Vector("quantizer not trained".into()));
        };
        let codebook = quantizer::deserialize_expecting(&bytes, config, self.params.dim)?;
        let prepared = codebook.prepare_query(query)?;
        let code_space = self.subspace.child("q");
        let (begin, end) = code_space.range();
        let mut matches = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, code) = pair?;
            let d = codebook.distance_with_prepared(&prepared, &code)?;
            matches.push(VectorMatch { item_id: code_space.unpack(&key)?, distance: d });
        }
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(limit);
        Ok(matches)
    }
}

/// Geometric level draw with normalizer `ml`.
fn draw_level(ml: f64) -> u8 {
    let u: f64 = rand::thread_rng().gen::<f64>().max(f64::MIN_POSITIVE);
    ((-u.ln() * ml).floor() as u64).min(MAX_LAYER as u64) as u8
}

// ── Maintainer hook ────────────────────────────────────────────────────

pub(crate) fn maintain(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    old: Option<&DynRecord>,
    new: Option<&DynRecord>,
    subspace: &Subspace,
    params: &HnswParams,
    tx: &mut dyn KvTransaction,
) -> Result<()> {
    let index = HnswIndex::new(subspace, params);
    let extract = |record: &DynRecord| -> Result<Option<Vec<f32>>> {
        let values = key_path_values(descriptor, ty, record)?;
        match values.get(0) {
            Some(value) => vector_of(value),
            None => Ok(None),
        }
    };
    let old_state = match old {
        Some(r) => Some((ty.primary_key(r)?, extract(r)?)),
        None => None,
    };
    let new_state = match new {
        Some(r) => Some((ty.primary_key(r)?, extract(r)?)),
        None => None,
    };
    if old_state == new_state {
        return Ok(());
    }
    if let Some((pk, Some(_))) = &old_state {
        index.remove(pk, tx)?;
    }
    if let Some((pk, Some(vector))) = &new_state {
        index.insert(pk, vector, tx)?;
    }
    Ok(())
}

// ── Batched online indexer ─────────────────────────────────────────────

/// Outcome of a [`bulk_load`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLoadReport {
    pub inserted: usize,
    pub batches: usize,
}

/// Build the graph from a vector stream, splitting work into one
/// transaction per batch so each stays inside the host's 5-second
/// lifetime. On a retryable failure the error carries no partial batch:
/// the current transaction is rolled back and the caller may resume with
/// the remaining entries.
pub fn bulk_load(
    store: &dyn KvStore,
    subspace: &Subspace,
    params: &HnswParams,
    entries: impl IntoIterator<Item = (Tuple, Vec<f32>)>,
    batch_size: usize,
) -> Result<BulkLoadReport> {
    let batch_size = batch_size.max(1);
    let mut inserted = 0usize;
    let mut batches = 0usize;
    let mut iter = entries.into_iter().peekable();
    while iter.peek().is_some() {
        let mut tx = store.transaction();
        let index = HnswIndex::new(subspace, params).with_inline_limit(usize::MAX);
        let mut in_batch = 0usize;
        while in_batch < batch_size {
            let Some((id, vector)) = iter.next() else { break };
            if let Err(err) = index.insert(&id, &vector, tx.as_mut()) {
                tx.rollback();
                return Err(err);
            }
            in_batch += 1;
        }
        tx.commit()?;
        inserted += in_batch;
        batches += 1;
        tracing::debug!(batch = batches, inserted, "hnsw_bulk_batch_committed");
    }
    Ok(BulkLoadReport { inserted, batches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::tuple;

    fn params(dim: usize) -> HnswParams {
        HnswParams {
            dim,
            metric: DistanceMetric::Cosine,
            m: 8,
            ef_construction: 64,
            ef_search: 32,
            quantizer: None,
        }
    }

    fn insert_all(kv: &MemoryKv, sub: &Subspace, p: &HnswParams, vectors: &[(&str, Vec<f32>)]) {
        let index = HnswIndex::new(sub, p);
        kv.run(|tx| {
            for (id, v) in vectors {
                index.insert(&tuple![*id], v, tx)?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_search_ordering() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let p = params(4);
        insert_all(
            &kv,
            &sub,
            &p,
            &[
                ("exact", vec![1.0, 0.0, 0.0, 0.0]),
                ("similar", vec![0.9, 0.1, 0.0, 0.0]),
                ("different", vec![0.0, 1.0, 0.0, 0.0]),
            ],
        );
        let index = HnswIndex::new(&sub, &p);
        let tx = kv.begin();
        let matches = index
            .search(&tx, &VectorQuery::nearest(vec![1.0, 0.0, 0.0, 0.0], 3))
            .unwrap();
        let ids: Vec<&str> = matches
            .iter()
            .map(|m| m.item_id.get(0).unwrap().as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["exact", "similar", "different"]);
        assert!(matches[0].distance < 0.01);
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let p = params(4);
        let index = HnswIndex::new(&sub, &p);
        let tx = kv.begin();
        let matches = index
            .search(&tx, &VectorQuery::nearest(vec![1.0, 0.0, 0.0, 0.0], 5))
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_recall_on_grid() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        let vectors: Vec<(String, Vec<f32>)> = (0..60)
            .map(|i| (format!("n{i}"), vec![(i % 10) as f32, (i / 10) as f32]))
            .collect();
        let index = HnswIndex::new(&sub, &p);
        kv.run(|tx| {
            for (id, v) in &vectors {
                index.insert(&tuple![id.as_str()], v, tx)?;
            }
            Ok(())
        })
        .unwrap();

        let tx = kv.begin();
        let matches = index
            .search(
                &tx,
                &VectorQuery { vector: vec![5.0, 2.0], k: 1, ef_search: Some(60) },
            )
            .unwrap();
        // n25 = (5, 2) is an exact match
        assert_eq!(matches[0].item_id, tuple!["n25"]);
        assert!(matches[0].distance < 1e-6);
    }

    #[test]
    fn test_edges_bidirectional() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        insert_all(
            &kv,
            &sub,
            &p,
            &[("a", vec![0.0, 0.0]), ("b", vec![1.0, 0.0]), ("c", vec![2.0, 0.0])],
        );
        let index = HnswIndex::new(&sub, &p);
        let tx = kv.begin();
        let a_neighbors = index.neighbors(&tuple!["a"], 0, &tx).unwrap();
        for neighbor in &a_neighbors {
            let back = index.neighbors(neighbor, 0, &tx).unwrap();
            assert!(back.contains(&tuple!["a"]), "edge {neighbor:?} -> a missing");
        }
        assert!(!a_neighbors.is_empty());
    }

    #[test]
    fn test_remove_repairs_graph() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        insert_all(
            &kv,
            &sub,
            &p,
            &[("a", vec![0.0, 0.0]), ("b", vec![1.0, 0.0]), ("c", vec![2.0, 0.0])],
        );
        let index = HnswIndex::new(&sub, &p);
        kv.run(|tx| index.remove(&tuple!["b"], tx)).unwrap();

        let tx = kv.begin();
        // No dangling edges to b remain
        for id in ["a", "c"] {
            let neighbors = index.neighbors(&tuple![id], 0, &tx).unwrap();
            assert!(!neighbors.contains(&tuple!["b"]));
        }
        let matches = index
            .search(&tx, &VectorQuery::nearest(vec![1.0, 0.0], 3))
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.item_id != tuple!["b"]));
    }

    #[test]
    fn test_inline_budget_enforced() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        insert_all(
            &kv,
            &sub,
            &p,
            &[("a", vec![0.0, 0.0]), ("b", vec![1.0, 0.0]), ("c", vec![2.0, 0.0])],
        );
        let index = HnswIndex::new(&sub, &p).with_inline_limit(2);
        let mut tx = kv.begin();
        let err = index
            .insert(&tuple!["d"], &[3.0, 0.0], &mut tx)
            .unwrap_err();
        assert!(matches!(err, Error::GraphTooLargeForInline { .. }));
    }

    #[test]
    fn test_bulk_load_batches() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        let entries: Vec<(Tuple, Vec<f32>)> = (0..25)
            .map(|i| (tuple![format!("n{i}")], vec![i as f32, 0.0]))
            .collect();
        let report = bulk_load(&kv, &sub, &p, entries, 10).unwrap();
        assert_eq!(report.inserted, 25);
        assert_eq!(report.batches, 3);

        let index = HnswIndex::new(&sub, &p);
        let tx = kv.begin();
        let matches = index
            .search(
                &tx,
                &VectorQuery { vector: vec![12.0, 0.0], k: 1, ef_search: Some(50) },
            )
            .unwrap();
        assert_eq!(matches[0].item_id, tuple!["n12"]);
    }

    #[test]
    fn test_quantizer_train_and_code_search() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(8);
        p.metric = DistanceMetric::Euclidean;
        p.quantizer = Some(super::super::QuantizerConfig::Product { m: 4, nbits: 4 });
        let index = HnswIndex::new(&sub, &p);
        kv.run(|tx| {
            for i in 0..32i64 {
                let v: Vec<f32> = (0..8).map(|d| ((i * 7 + d) % 13) as f32 / 13.0).collect();
                index.insert(&tuple![format!("n{i}")], &v, tx)?;
            }
            index.train_quantizer(tx)
        })
        .unwrap();

        let tx = kv.begin();
        let query: Vec<f32> = (0..8).map(|d| ((3 * 7 + d) % 13) as f32 / 13.0).collect();
        let matches = index.search_codes(&tx, &query, 5).unwrap();
        assert_eq!(matches.len(), 5);
        // The encoded nearest neighbor is the vector itself
        assert_eq!(matches[0].item_id, tuple!["n3"]);

        // New inserts get codes without retraining
        drop(tx);
        kv.run(|tx| index.insert(&tuple!["fresh"], &[0.5; 8], tx)).unwrap();
        let tx = kv.begin();
        let all = index.search_codes(&tx, &[0.5; 8], 40).unwrap();
        assert!(all.iter().any(|m| m.item_id == tuple!["fresh"]));
    }

    #[test]
    fn test_code_search_without_training_fails() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(4);
        p.quantizer = Some(super::super::QuantizerConfig::Scalar { bits: 8 });
        let index = HnswIndex::new(&sub, &p);
        let tx = kv.begin();
        assert!(matches!(
            index.search_codes(&tx, &[0.0; 4], 5),
            Err(Error::Vector(_))
        ));
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let kv = MemoryKv::new();
        let sub = Subspace::new(b"V".to_vec());
        let mut p = params(2);
        p.metric = DistanceMetric::Euclidean;
        let index = HnswIndex::new(&sub, &p);
        kv.run(|tx| {
            index.insert(&tuple!["a"], &[0.0, 0.0], tx)?;
            index.insert(&tuple!["b"], &[5.0, 5.0], tx)?;
            index.insert(&tuple!["a"], &[9.0, 9.0], tx)
        })
        .unwrap();
        let tx = kv.begin();
        let matches = index
            .search(&tx, &VectorQuery::nearest(vec![9.0, 9.0], 1))
            .unwrap();
        assert_eq!(matches[0].item_id, tuple!["a"]);
        assert!(matches[0].distance < 1e-6);
    }
}
