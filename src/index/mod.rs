//! Index Family
//!
//! Each index kind is a (maintainer, searcher) pair dispatching on the
//! [`IndexKind`] tag. Maintenance is diff-based: a record change maps to
//! old/new entry sets and the difference becomes clears and sets inside
//! the caller's transaction, so a search observes either all or none of
//! a record's entries.
//!
//! Layouts under `I / <index-name>`:
//! - Scalar/covering: `<key-values> / <item-id> -> (stored-tuple)?`
//! - Full-text: `<term> / <item-id> -> ∅`
//! - Spatial: `<cell> / <item-id> -> ∅`
//! - Bitmap: `<value> -> bitmap bytes`
//! - Graph adjacency: `o/<src>/<label>/<tgt> -> ∅` plus the `i/` mirror
//! - Vector: see the `vector` module

pub mod bitmap;
pub mod fulltext;
pub mod graph;
pub mod scalar;
pub mod spatial;
pub mod vector;

pub use bitmap::{Bitmap, BitmapCompression};
pub use vector::{DistanceMetric, HnswParams, QuantizerConfig};

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::stats::StatisticsStore;
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Index kind tag; determines layout, maintainer, and searcher.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKind {
    /// Plain scalar index over the key paths
    Scalar,
    /// Scalar index that additionally stores projected field values
    Covering { stored_fields: Vec<String> },
    /// Per-value bitmap over single-field integer primary keys
    Bitmap { compression: BitmapCompression },
    /// Lower-cased term index over a text field
    FullText,
    /// Morton-coded cell index over a (lat, lon) field pair
    SpatialMorton { level: u8 },
    /// Exhaustive-scan vector index
    VectorFlat { dim: usize, metric: DistanceMetric },
    /// KV-encoded HNSW graph, optionally quantized
    VectorHnsw(HnswParams),
    /// Outgoing/incoming adjacency mirrors over (src, label, tgt) records
    GraphAdjacency,
}

impl IndexKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::Scalar => "scalar",
            IndexKind::Covering { .. } => "covering",
            IndexKind::Bitmap { .. } => "bitmap",
            IndexKind::FullText => "full_text",
            IndexKind::SpatialMorton { .. } => "spatial_morton",
            IndexKind::VectorFlat { .. } => "vector_flat",
            IndexKind::VectorHnsw(_) => "vector_hnsw",
            IndexKind::GraphAdjacency => "graph_adjacency",
        }
    }
}

/// Immutable binding of an index name to key paths, kind, and targets.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub key_paths: Vec<String>,
    pub kind: IndexKind,
    pub record_types: Vec<String>,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        key_paths: Vec<&str>,
        kind: IndexKind,
        record_types: Vec<&str>,
    ) -> Self {
        IndexDescriptor {
            name: name.into(),
            key_paths: key_paths.into_iter().map(String::from).collect(),
            kind,
            record_types: record_types.into_iter().map(String::from).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The index's subspace under the engine root.
    pub fn subspace(&self, root: &Subspace) -> Subspace {
        root.child("I").child(self.name.as_str())
    }

    pub fn applies_to(&self, type_name: &str) -> bool {
        self.record_types.iter().any(|t| t == type_name)
    }

    /// True when a change to any of the given fields can affect this
    /// index's entries.
    pub fn touches_fields<'a>(&self, mut changed: impl Iterator<Item = &'a str>) -> bool {
        changed.any(|f| {
            self.key_paths.iter().any(|p| p == f)
                || matches!(&self.kind, IndexKind::Covering { stored_fields }
                    if stored_fields.iter().any(|s| s == f))
        })
    }

    /// A covering index is fully covering iff its key and stored fields
    /// reach every projectable field of the type.
    pub fn is_fully_covering(&self, ty: &RecordType) -> bool {
        let IndexKind::Covering { stored_fields } = &self.kind else {
            return false;
        };
        let mut reachable: HashSet<&str> = self.key_paths.iter().map(String::as_str).collect();
        reachable.extend(stored_fields.iter().map(String::as_str));
        reachable.extend(ty.key_fields().iter().map(String::as_str));
        ty.field_names()
            .iter()
            .filter(|f| !ty.non_projectable().contains(f))
            .all(|f| reachable.contains(f.as_str()))
    }

    /// Fields reconstructible from an index entry without an item fetch.
    pub fn reachable_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.key_paths.iter().map(String::as_str).collect();
        if let IndexKind::Covering { stored_fields } = &self.kind {
            fields.extend(stored_fields.iter().map(String::as_str));
        }
        fields
    }
}

/// A single persisted index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key_values: Tuple,
    pub item_id: Tuple,
    pub stored_values: Option<Tuple>,
}

/// Lazy stream of index entries.
pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<IndexEntry>> + 'a>;

// ── Registry ───────────────────────────────────────────────────────────

/// Registry of live index descriptors.
///
/// The epoch increments on every registration or drop; cached plans
/// record the epoch they were built under and are re-validated against
/// the live set on access.
#[derive(Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<String, Arc<IndexDescriptor>>>,
    epoch: AtomicU64,
}

impl IndexRegistry {
    pub fn new() -> Self {
        IndexRegistry::default()
    }

    pub fn register(&self, descriptor: IndexDescriptor) -> Arc<IndexDescriptor> {
        let arc = Arc::new(descriptor);
        self.indexes
            .write()
            .insert(arc.name.clone(), Arc::clone(&arc));
        self.epoch.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(index = %arc.name, kind = arc.kind.name(), "index_registered");
        arc
    }

    pub fn drop_index(&self, name: &str) -> Option<Arc<IndexDescriptor>> {
        let removed = self.indexes.write().remove(name);
        if removed.is_some() {
            self.epoch.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(index = name, "index_dropped");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Result<Arc<IndexDescriptor>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.read().contains_key(name)
    }

    pub fn for_type(&self, type_name: &str) -> Vec<Arc<IndexDescriptor>> {
        let mut out: Vec<Arc<IndexDescriptor>> = self
            .indexes
            .read()
            .values()
            .filter(|d| d.applies_to(type_name))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

// ── Maintenance ────────────────────────────────────────────────────────

/// Applies index side effects for a record mutation. `old == None` is an
/// insert, `new == None` a delete, both present an update. Idempotent
/// when `old == new`.
pub struct IndexMaintainer<'a> {
    root: &'a Subspace,
    registry: &'a IndexRegistry,
    stats: Option<&'a StatisticsStore>,
}

impl<'a> IndexMaintainer<'a> {
    pub fn new(
        root: &'a Subspace,
        registry: &'a IndexRegistry,
        stats: Option<&'a StatisticsStore>,
    ) -> Self {
        IndexMaintainer { root, registry, stats }
    }

    /// Apply maintenance for every index bound to the record's type.
    pub fn update(
        &self,
        ty: &RecordType,
        old: Option<&DynRecord>,
        new: Option<&DynRecord>,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        if old.is_none() && new.is_none() {
            return Ok(());
        }
        for descriptor in self.registry.for_type(ty.name()) {
            self.update_one(&descriptor, ty, old, new, tx)?;
        }
        Ok(())
    }

    /// Apply maintenance for one index.
    pub fn update_one(
        &self,
        descriptor: &IndexDescriptor,
        ty: &RecordType,
        old: Option<&DynRecord>,
        new: Option<&DynRecord>,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let subspace = descriptor.subspace(self.root);
        match &descriptor.kind {
            IndexKind::Scalar
            | IndexKind::Covering { .. }
            | IndexKind::FullText
            | IndexKind::SpatialMorton { .. }
            | IndexKind::GraphAdjacency => {
                self.diff_entries(descriptor, ty, old, new, &subspace, tx)
            }
            IndexKind::Bitmap { compression } => {
                bitmap::maintain(descriptor, ty, old, new, &subspace, *compression, tx)
            }
            IndexKind::VectorFlat { dim, .. } => {
                vector::flat::maintain(descriptor, ty, old, new, &subspace, *dim, tx)
            }
            IndexKind::VectorHnsw(params) => {
                vector::hnsw::maintain(descriptor, ty, old, new, &subspace, params, tx)
            }
        }
    }

    fn diff_entries(
        &self,
        descriptor: &IndexDescriptor,
        ty: &RecordType,
        old: Option<&DynRecord>,
        new: Option<&DynRecord>,
        subspace: &Subspace,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let old_entries = match old {
            Some(record) => map_entries(descriptor, ty, record)?,
            None => BTreeMap::new(),
        };
        let new_entries = match new {
            Some(record) => map_entries(descriptor, ty, record)?,
            None => BTreeMap::new(),
        };

        let mut entry_delta = 0i64;
        for key in old_entries.keys() {
            if !new_entries.contains_key(key) {
                tx.clear(&subspace.pack(key))?;
                entry_delta -= 1;
            }
        }
        for (key, value) in &new_entries {
            match old_entries.get(key) {
                Some(old_value) if old_value == value => {}
                existing => {
                    if descriptor.unique && existing.is_none() {
                        self.check_unique(descriptor, ty, new, key, subspace, tx)?;
                    }
                    tx.set(&subspace.pack(key), value)?;
                    if existing.is_none() {
                        entry_delta += 1;
                    }
                }
            }
        }

        if entry_delta != 0 {
            if let Some(stats) = self.stats {
                stats.record_index_delta(&descriptor.name, entry_delta, entry_delta);
            }
        }
        Ok(())
    }

    /// Scalar unique check: no other item id may share the key values.
    fn check_unique(
        &self,
        descriptor: &IndexDescriptor,
        ty: &RecordType,
        record: Option<&DynRecord>,
        entry_key: &Tuple,
        subspace: &Subspace,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        if record.is_none() {
            return Ok(());
        }
        let id_len = ty.key_fields().len();
        if entry_key.len() < id_len {
            return Ok(());
        }
        let key_values = Tuple::new(entry_key.0[..entry_key.len() - id_len].to_vec());
        let prefix_space = subspace.subspace(&key_values);
        let (begin, end) = prefix_space.range();
        let self_key = subspace.pack(entry_key);
        for pair in tx.get_range(&begin, &end, RangeOptions::limited(2)) {
            let (key, _) = pair?;
            if key != self_key {
                return Err(Error::UniqueViolation {
                    index: descriptor.name.clone(),
                    key: format!("{key_values}"),
                });
            }
        }
        Ok(())
    }
}

/// Map a record to the full entry set of an entry-diffed index kind.
/// Keys are tuples relative to the index subspace; values are the stored
/// payload bytes.
pub fn map_entries(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<BTreeMap<Tuple, Vec<u8>>> {
    match &descriptor.kind {
        IndexKind::Scalar | IndexKind::Covering { .. } => {
            scalar::entries(descriptor, ty, record)
        }
        IndexKind::FullText => fulltext::entries(descriptor, ty, record),
        IndexKind::SpatialMorton { level } => spatial::entries(descriptor, ty, record, *level),
        IndexKind::GraphAdjacency => graph::entries(descriptor, ty, record),
        other => Err(Error::Internal(format!(
            "index kind {} is not entry-diffed",
            other.name()
        ))),
    }
}

/// Extract the tuple of key-path values from a record.
pub fn key_path_values(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<Tuple> {
    let mut values = Tuple::empty();
    for path in &descriptor.key_paths {
        let field = ty.resolve_key_path(path)?;
        values.push(ty.field_value(record, field)?.clone());
    }
    Ok(values)
}

/// Parse an entry key (relative tuple) back into key values and item id,
/// given the item id arity.
pub fn split_entry_key(entry_key: &Tuple, id_len: usize) -> Result<(Tuple, Tuple)> {
    if entry_key.len() < id_len {
        return Err(Error::InvalidEncoding(format!(
            "entry key of arity {} cannot carry an id of arity {id_len}",
            entry_key.len()
        )));
    }
    let split = entry_key.len() - id_len;
    Ok((
        Tuple::new(entry_key.0[..split].to_vec()),
        Tuple::new(entry_key.0[split..].to_vec()),
    ))
}

/// Count index entries by a full scan (used by tests and re-scan
/// verification).
pub fn count_entries(subspace: &Subspace, reader: &dyn KvRead) -> Result<usize> {
    let (begin, end) = subspace.range();
    let mut count = 0;
    for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
        pair?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::tuple;

    fn user_type() -> RecordType {
        RecordType::new("user", vec!["id", "name", "age"], vec!["id"])
    }

    fn age_index() -> IndexDescriptor {
        IndexDescriptor::new("idx_age", vec!["age"], IndexKind::Scalar, vec!["user"])
    }

    #[test]
    fn test_insert_creates_entry() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        registry.register(age_index());
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);

        let rec = DynRecord::new("user").with("id", "u1").with("age", 25i64);
        kv.run(|tx| maintainer.update(&ty, None, Some(&rec), tx)).unwrap();

        let desc = registry.get("idx_age").unwrap();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        assert_eq!(count_entries(&sub, &tx).unwrap(), 1);
        assert!(tx.get(&sub.pack(&tuple![25, "u1"])).unwrap().is_some());
    }

    #[test]
    fn test_update_moves_entry() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        registry.register(age_index());
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);

        let old = DynRecord::new("user").with("id", "u1").with("age", 25i64);
        let new = DynRecord::new("user").with("id", "u1").with("age", 26i64);
        kv.run(|tx| {
            maintainer.update(&ty, None, Some(&old), tx)?;
            maintainer.update(&ty, Some(&old), Some(&new), tx)
        })
        .unwrap();

        let sub = registry.get("idx_age").unwrap().subspace(&root);
        let tx = kv.begin();
        assert!(tx.get(&sub.pack(&tuple![25, "u1"])).unwrap().is_none());
        assert!(tx.get(&sub.pack(&tuple![26, "u1"])).unwrap().is_some());
    }

    #[test]
    fn test_noop_update_is_idempotent() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        registry.register(age_index());
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);

        let rec = DynRecord::new("user").with("id", "u1").with("age", 25i64);
        kv.run(|tx| {
            maintainer.update(&ty, None, Some(&rec), tx)?;
            maintainer.update(&ty, Some(&rec), Some(&rec), tx)
        })
        .unwrap();

        let sub = registry.get("idx_age").unwrap().subspace(&root);
        let tx = kv.begin();
        assert_eq!(count_entries(&sub, &tx).unwrap(), 1);
    }

    #[test]
    fn test_delete_clears_entry() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        registry.register(age_index());
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);

        let rec = DynRecord::new("user").with("id", "u1").with("age", 25i64);
        kv.run(|tx| {
            maintainer.update(&ty, None, Some(&rec), tx)?;
            maintainer.update(&ty, Some(&rec), None, tx)
        })
        .unwrap();

        let sub = registry.get("idx_age").unwrap().subspace(&root);
        let tx = kv.begin();
        assert_eq!(count_entries(&sub, &tx).unwrap(), 0);
    }

    #[test]
    fn test_unique_violation() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        registry.register(
            IndexDescriptor::new("idx_name", vec!["name"], IndexKind::Scalar, vec!["user"])
                .unique(),
        );
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);

        let a = DynRecord::new("user").with("id", "u1").with("name", "Alice");
        let b = DynRecord::new("user").with("id", "u2").with("name", "Alice");
        kv.run(|tx| maintainer.update(&ty, None, Some(&a), tx)).unwrap();
        let err = kv
            .run(|tx| maintainer.update(&ty, None, Some(&b), tx))
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { .. }));
    }

    #[test]
    fn test_fully_covering_flag() {
        let ty = user_type();
        let covering = IndexDescriptor::new(
            "idx_name_age",
            vec!["name"],
            IndexKind::Covering { stored_fields: vec!["age".into()] },
            vec!["user"],
        );
        assert!(covering.is_fully_covering(&ty));

        let partial = IndexDescriptor::new(
            "idx_name_only",
            vec!["name"],
            IndexKind::Covering { stored_fields: vec![] },
            vec!["user"],
        );
        assert!(!partial.is_fully_covering(&ty));
    }

    #[test]
    fn test_registry_epoch_moves() {
        let registry = IndexRegistry::new();
        let e0 = registry.epoch();
        registry.register(age_index());
        assert!(registry.epoch() > e0);
        let e1 = registry.epoch();
        registry.drop_index("idx_age");
        assert!(registry.epoch() > e1);
        assert!(!registry.contains("idx_age"));
    }
}
