//! Flat Vector Index
//!
//! Stores raw vectors at `<id-tuple> -> vector-bytes` and answers
//! queries by scanning every entry while maintaining a bounded top-k
//! heap. Exact, and the baseline the HNSW index is measured against.

use super::{decode_vector, distance, encode_vector, vector_of, DistanceMetric, VectorMatch, VectorQuery};
use crate::error::{Error, Result};
use crate::index::{key_path_values, IndexDescriptor};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry ordered by distance (max-heap keeps the worst candidate on
/// top so it can be evicted).
struct HeapEntry {
    distance: f32,
    item_id: Tuple,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.item_id == other.item_id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.item_id.cmp(&other.item_id))
    }
}

fn record_vector(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
    dim: usize,
) -> Result<Option<Vec<f32>>> {
    let values = key_path_values(descriptor, ty, record)?;
    let Some(value) = values.get(0) else {
        return Ok(None);
    };
    let Some(vector) = vector_of(value)? else {
        return Ok(None);
    };
    if vector.len() != dim {
        return Err(Error::Vector(format!(
            "index '{}' has dimension {dim}, record vector has {}",
            descriptor.name,
            vector.len()
        )));
    }
    Ok(Some(vector))
}

pub(crate) fn maintain(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    old: Option<&DynRecord>,
    new: Option<&DynRecord>,
    subspace: &Subspace,
    dim: usize,
    tx: &mut dyn KvTransaction,
) -> Result<()> {
    let old_state = match old {
        Some(r) => {
            Some((ty.primary_key(r)?, record_vector(descriptor, ty, r, dim)?))
        }
        None => None,
    };
    let new_state = match new {
        Some(r) => {
            Some((ty.primary_key(r)?, record_vector(descriptor, ty, r, dim)?))
        }
        None => None,
    };
    if old_state == new_state {
        return Ok(());
    }
    if let Some((pk, Some(_))) = &old_state {
        let gone = match &new_state {
            Some((new_pk, Some(_))) => new_pk != pk,
            _ => true,
        };
        if gone {
            tx.clear(&subspace.pack(pk))?;
        }
    }
    if let Some((pk, Some(vector))) = &new_state {
        tx.set(&subspace.pack(pk), &encode_vector(vector))?;
    } else if let Some((pk, None)) = &new_state {
        // Vector field went null: drop the entry
        tx.clear(&subspace.pack(pk))?;
    }
    Ok(())
}

/// Exhaustive top-k search.
pub fn search(
    subspace: &Subspace,
    reader: &dyn KvRead,
    metric: DistanceMetric,
    dim: usize,
    query: &VectorQuery,
) -> Result<Vec<VectorMatch>> {
    query.validate(dim)?;
    let (begin, end) = subspace.range();
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(query.k + 1);
    for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
        let (key, value) = pair?;
        let item_id = subspace.unpack(&key)?;
        let vector = decode_vector(&value)?;
        if vector.len() != dim {
            return Err(Error::Vector(format!(
                "stored vector of dimension {} in index of dimension {dim}",
                vector.len()
            )));
        }
        let d = distance(metric, &query.vector, &vector);
        heap.push(HeapEntry { distance: d, item_id });
        if heap.len() > query.k {
            heap.pop();
        }
    }
    let mut matches: Vec<VectorMatch> = heap
        .into_iter()
        .map(|e| VectorMatch { item_id: e.item_id, distance: e.distance })
        .collect();
    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vector::encode_vector;
    use crate::index::{IndexKind, IndexMaintainer, IndexRegistry};
    use crate::kv::MemoryKv;
    use crate::tuple;
    use crate::tuple::TupleValue;

    fn doc_type() -> RecordType {
        RecordType::new("doc", vec!["id", "embedding"], vec!["id"])
    }

    fn descriptor(metric: DistanceMetric) -> IndexDescriptor {
        IndexDescriptor::new(
            "idx_vec",
            vec!["embedding"],
            IndexKind::VectorFlat { dim: 4, metric },
            vec!["doc"],
        )
    }

    fn embed(v: &[f32]) -> TupleValue {
        TupleValue::Bytes(encode_vector(v))
    }

    fn seed(kv: &MemoryKv, root: &Subspace, metric: DistanceMetric) -> Subspace {
        let registry = IndexRegistry::new();
        let desc = registry.register(descriptor(metric));
        let ty = doc_type();
        let maintainer = IndexMaintainer::new(root, &registry, None);
        let docs: [(&str, [f32; 4]); 3] = [
            ("exact", [1.0, 0.0, 0.0, 0.0]),
            ("similar", [0.9, 0.1, 0.0, 0.0]),
            ("different", [0.0, 1.0, 0.0, 0.0]),
        ];
        kv.run(|tx| {
            for (id, v) in &docs {
                let rec = DynRecord::new("doc").with("id", *id).with("embedding", embed(v));
                maintainer.update(&ty, None, Some(&rec), tx)?;
            }
            Ok(())
        })
        .unwrap();
        desc.subspace(root)
    }

    #[test]
    fn test_top_k_ordering_cosine() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, DistanceMetric::Cosine);
        let tx = kv.begin();
        let matches = search(
            &sub,
            &tx,
            DistanceMetric::Cosine,
            4,
            &VectorQuery::nearest(vec![1.0, 0.0, 0.0, 0.0], 3),
        )
        .unwrap();
        let ids: Vec<&str> = matches
            .iter()
            .map(|m| m.item_id.get(0).unwrap().as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["exact", "similar", "different"]);
        assert!(matches[0].distance < 0.01);
    }

    #[test]
    fn test_k_bounds_results() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, DistanceMetric::Euclidean);
        let tx = kv.begin();
        let matches = search(
            &sub,
            &tx,
            DistanceMetric::Euclidean,
            4,
            &VectorQuery::nearest(vec![0.0, 0.0, 0.0, 0.0], 2),
        )
        .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_fails() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, DistanceMetric::Cosine);
        let tx = kv.begin();
        let err = search(
            &sub,
            &tx,
            DistanceMetric::Cosine,
            4,
            &VectorQuery::nearest(vec![1.0, 0.0], 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Vector(_)));
    }

    #[test]
    fn test_zero_k_fails() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, DistanceMetric::Cosine);
        let tx = kv.begin();
        let err = search(
            &sub,
            &tx,
            DistanceMetric::Cosine,
            4,
            &VectorQuery::nearest(vec![1.0, 0.0, 0.0, 0.0], 0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Vector(_)));
    }

    #[test]
    fn test_delete_removes_vector() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(descriptor(DistanceMetric::Euclidean));
        let ty = doc_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);
        let rec = DynRecord::new("doc")
            .with("id", "a")
            .with("embedding", embed(&[1.0, 2.0, 3.0, 4.0]));
        kv.run(|tx| {
            maintainer.update(&ty, None, Some(&rec), tx)?;
            maintainer.update(&ty, Some(&rec), None, tx)
        })
        .unwrap();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        assert!(tx.get(&sub.pack(&tuple!["a"])).unwrap().is_none());
    }
}
