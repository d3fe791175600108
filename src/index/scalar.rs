//! Scalar and Covering Indexes
//!
//! Entry layout is `<key-values> / <item-id> -> (stored-tuple)?`. A query
//! is an equality point, a prefix equality on the leading fields, or a
//! bounded range on the last referenced field; the searcher emits entries
//! in index-key order, reversible. Covering indexes store projected field
//! values alongside, so an index-only scan reconstructs the record
//! without touching the items subspace.

use crate::error::Result;
use crate::index::{key_path_values, split_entry_key, EntryStream, IndexDescriptor, IndexEntry, IndexKind};
use crate::kv::{KvRead, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::subspace::{prefix_end, Subspace};
use crate::tuple::{Tuple, TupleValue};
use std::collections::BTreeMap;

/// One bound on the field following the equality prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldBound {
    pub lower: Option<(TupleValue, bool)>,
    pub upper: Option<(TupleValue, bool)>,
}

impl FieldBound {
    pub fn at_least(value: TupleValue, inclusive: bool) -> Self {
        FieldBound { lower: Some((value, inclusive)), upper: None }
    }

    pub fn at_most(value: TupleValue, inclusive: bool) -> Self {
        FieldBound { lower: None, upper: Some((value, inclusive)) }
    }

    pub fn between(lower: (TupleValue, bool), upper: (TupleValue, bool)) -> Self {
        FieldBound { lower: Some(lower), upper: Some(upper) }
    }
}

/// A scan over a scalar or covering index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ScalarQuery {
    /// Equality values for the leading key paths, in order
    pub equality_prefix: Vec<TupleValue>,
    /// Optional bound on the key path following the prefix
    pub bound: Option<FieldBound>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ScalarQuery {
    pub fn equals(values: Vec<TupleValue>) -> Self {
        ScalarQuery { equality_prefix: values, ..Default::default() }
    }

    pub fn full() -> Self {
        ScalarQuery::default()
    }

    pub fn with_bound(mut self, bound: FieldBound) -> Self {
        self.bound = Some(bound);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Map a record to its scalar/covering entries.
pub fn entries(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<BTreeMap<Tuple, Vec<u8>>> {
    let key_values = key_path_values(descriptor, ty, record)?;
    let entry_key = key_values.concat(&ty.primary_key(record)?);
    let value = match &descriptor.kind {
        IndexKind::Covering { stored_fields } => {
            let mut stored = Tuple::empty();
            for field in stored_fields {
                stored.push(ty.field_value(record, field)?.clone());
            }
            stored.pack()
        }
        _ => Vec::new(),
    };
    let mut out = BTreeMap::new();
    out.insert(entry_key, value);
    Ok(out)
}

/// The `[begin, end)` byte range a query covers under the index subspace.
pub fn query_range(subspace: &Subspace, query: &ScalarQuery) -> (Vec<u8>, Vec<u8>) {
    let base = subspace.subspace(&Tuple::new(query.equality_prefix.clone()));
    let (mut begin, mut end) = base.range();
    if let Some(bound) = &query.bound {
        if let Some((value, inclusive)) = &bound.lower {
            let key = base.pack(&Tuple::new(vec![value.clone()]));
            begin = if *inclusive { key } else { prefix_end(&key) };
        }
        if let Some((value, inclusive)) = &bound.upper {
            let key = base.pack(&Tuple::new(vec![value.clone()]));
            end = if *inclusive { prefix_end(&key) } else { key };
        }
    }
    (begin, end)
}

/// Search the index, yielding entries lazily in key order.
pub fn search<'a>(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    subspace: &Subspace,
    reader: &'a dyn KvRead,
    query: &ScalarQuery,
) -> EntryStream<'a> {
    let (begin, end) = query_range(subspace, query);
    let id_len = ty.key_fields().len();
    let subspace = subspace.clone();
    let covering = matches!(descriptor.kind, IndexKind::Covering { .. });
    let options = RangeOptions { limit: query.limit, reverse: query.reverse };
    Box::new(reader.get_range(&begin, &end, options).map(move |pair| {
        let (key, value) = pair?;
        let entry_key = subspace.unpack(&key)?;
        let (key_values, item_id) = split_entry_key(&entry_key, id_len)?;
        let stored_values = if covering && !value.is_empty() {
            Some(Tuple::unpack(&value)?)
        } else {
            None
        };
        Ok(IndexEntry { key_values, item_id, stored_values })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexMaintainer, IndexRegistry};
    use crate::kv::MemoryKv;
    use crate::tuple;

    fn user_type() -> RecordType {
        RecordType::new("user", vec!["id", "name", "age"], vec!["id"])
    }

    fn seed(kv: &MemoryKv, registry: &IndexRegistry, root: &Subspace) {
        let ty = user_type();
        let maintainer = IndexMaintainer::new(root, registry, None);
        let records = [
            ("u1", "Alice", 25i64),
            ("u2", "Bob", 30),
            ("u3", "Carol", 35),
        ];
        kv.run(|tx| {
            for (id, name, age) in records {
                let rec = DynRecord::new("user")
                    .with("id", id)
                    .with("name", name)
                    .with("age", age);
                maintainer.update(&ty, None, Some(&rec), tx)?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_range_scan_on_last_field() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        seed(&kv, &registry, &root);

        let ty = user_type();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let query =
            ScalarQuery::full().with_bound(FieldBound::at_least(TupleValue::Int(25), false));
        let ids: Vec<Tuple> = search(&desc, &ty, &sub, &tx, &query)
            .map(|r| r.map(|e| e.item_id))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![tuple!["u2"], tuple!["u3"]]);
    }

    #[test]
    fn test_equality_point() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        seed(&kv, &registry, &root);

        let ty = user_type();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let query = ScalarQuery::equals(vec![TupleValue::Int(30)]);
        let entries: Vec<IndexEntry> = search(&desc, &ty, &sub, &tx, &query)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item_id, tuple!["u2"]);
        assert_eq!(entries[0].key_values, tuple![30]);
    }

    #[test]
    fn test_reverse_scan() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        seed(&kv, &registry, &root);

        let ty = user_type();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let ids: Vec<Tuple> = search(&desc, &ty, &sub, &tx, &ScalarQuery::full().reversed())
            .map(|r| r.map(|e| e.item_id))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![tuple!["u3"], tuple!["u2"], tuple!["u1"]]);
    }

    #[test]
    fn test_composite_prefix_with_bound() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_name_age",
            vec!["name", "age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        let ty = user_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);
        kv.run(|tx| {
            for (id, age) in [("u1", 25i64), ("u2", 30), ("u3", 35)] {
                let rec = DynRecord::new("user")
                    .with("id", id)
                    .with("name", "Alice")
                    .with("age", age);
                maintainer.update(&ty, None, Some(&rec), tx)?;
            }
            Ok(())
        })
        .unwrap();

        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let query = ScalarQuery::equals(vec![TupleValue::String("Alice".into())]).with_bound(
            FieldBound::between((TupleValue::Int(25), true), (TupleValue::Int(30), true)),
        );
        let ids: Vec<Tuple> = search(&desc, &ty, &sub, &tx, &query)
            .map(|r| r.map(|e| e.item_id))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![tuple!["u1"], tuple!["u2"]]);
    }

    #[test]
    fn test_covering_entry_carries_stored_values() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_name_age",
            vec!["name"],
            IndexKind::Covering { stored_fields: vec!["age".into()] },
            vec!["user"],
        ));
        seed(&kv, &registry, &root);

        let ty = user_type();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let query = ScalarQuery::equals(vec![TupleValue::String("Alice".into())]);
        let entries: Vec<IndexEntry> = search(&desc, &ty, &sub, &tx, &query)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stored_values, Some(tuple![25]));
    }

    #[test]
    fn test_limit() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        seed(&kv, &registry, &root);

        let ty = user_type();
        let sub = desc.subspace(&root);
        let tx = kv.begin();
        let count = search(&desc, &ty, &sub, &tx, &ScalarQuery::full().limited(2)).count();
        assert_eq!(count, 2);
    }
}
