//! Plan Execution
//!
//! Turns a physical plan into a demand-driven record stream. Scans stay
//! lazy: the next KV range chunk is only pulled when the consumer asks
//! for the next row. Sorts and join build sides materialize their
//! input, which is the only buffering in the pipeline.
//!
//! The executor counts index scans, record fetches, and output rows so
//! the engine can feed the drift detector after the stream drains.

use crate::error::{Error, Result};
use crate::index::scalar;
use crate::index::{IndexDescriptor, IndexRegistry};
use crate::kv::{KvRead, OpGuard, RangeOptions};
use crate::planner::memo::{JoinKind, PhysicalOp};
use crate::planner::query::SortKey;
use crate::planner::rules::PhysicalPlan;
use crate::record::{DynRecord, RecordRegistry, RecordType};
use crate::storage::ItemStorage;
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Lazy stream of result records.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<DynRecord>> + 'a>;

/// Counters accumulated while a stream drains.
#[derive(Debug, Default)]
pub struct ExecMetrics {
    pub index_scans: AtomicU64,
    pub record_fetches: AtomicU64,
    pub rows: AtomicU64,
}

impl ExecMetrics {
    pub fn index_scans(&self) -> u64 {
        self.index_scans.load(AtomicOrdering::Relaxed)
    }

    pub fn record_fetches(&self) -> u64 {
        self.record_fetches.load(AtomicOrdering::Relaxed)
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(AtomicOrdering::Relaxed)
    }
}

/// Executes physical plans against one reader.
pub struct PlanExecutor<'a> {
    root: &'a Subspace,
    storage: &'a ItemStorage,
    records: &'a RecordRegistry,
    indexes: &'a IndexRegistry,
    reader: &'a dyn KvRead,
    metrics: Arc<ExecMetrics>,
    guard: OpGuard,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        root: &'a Subspace,
        storage: &'a ItemStorage,
        records: &'a RecordRegistry,
        indexes: &'a IndexRegistry,
        reader: &'a dyn KvRead,
    ) -> Self {
        PlanExecutor {
            root,
            storage,
            records,
            indexes,
            reader,
            metrics: Arc::new(ExecMetrics::default()),
            guard: OpGuard::unbounded(),
        }
    }

    /// Attach a cancellation/deadline guard; the stream checks it
    /// cooperatively as rows are pulled.
    pub fn with_guard(mut self, guard: OpGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn metrics(&self) -> Arc<ExecMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Execute a plan; rows are counted as the stream drains and the
    /// guard is checked at every pull, so a cancelled stream performs
    /// no further KV work.
    pub fn execute(&'a self, plan: &PhysicalPlan) -> Result<RecordStream<'a>> {
        self.guard.check()?;
        let stream = self.exec_node(plan)?;
        let metrics = Arc::clone(&self.metrics);
        let mut guard = self.guard.clone();
        Ok(Box::new(stream.map(move |item| {
            guard.tick()?;
            if item.is_ok() {
                metrics.rows.fetch_add(1, AtomicOrdering::Relaxed);
            }
            item
        })))
    }

    fn exec_node(&'a self, plan: &PhysicalPlan) -> Result<RecordStream<'a>> {
        match &plan.op {
            PhysicalOp::SeqScan { type_name, predicate } => {
                let ty = self.records.get(type_name)?;
                let predicate = predicate.clone();
                let type_space = self.storage.type_subspace(ty.name());
                let (begin, end) = type_space.range();
                let metrics = Arc::clone(&self.metrics);
                let stream = self
                    .reader
                    .get_range(&begin, &end, RangeOptions::default())
                    .map(move |pair| {
                        metrics.record_fetches.fetch_add(1, AtomicOrdering::Relaxed);
                        let (_, value) = pair?;
                        let payload = self.storage.read_envelope(&value, self.reader)?;
                        self.storage.decode_record(&payload)
                    })
                    .filter(move |result| match result {
                        Ok(record) => predicate.eval_dyn(record),
                        Err(_) => true,
                    });
                Ok(Box::new(stream))
            }
            PhysicalOp::IndexScan { index, scalar, residual } => {
                let descriptor = self.indexes.get(index)?;
                let ty = self.records.get(&descriptor.record_types[0])?;
                let subspace = descriptor.subspace(self.root);
                self.metrics.index_scans.fetch_add(1, AtomicOrdering::Relaxed);
                let entries =
                    scalar::search(&descriptor, &ty, &subspace, self.reader, scalar);
                let residual = residual.clone();
                let metrics = Arc::clone(&self.metrics);
                let stream = entries
                    .map(move |entry| {
                        let entry = entry?;
                        metrics.record_fetches.fetch_add(1, AtomicOrdering::Relaxed);
                        self.storage
                            .load(&ty, &entry.item_id, self.reader)?
                            .ok_or_else(|| Error::Internal("index entry without record".into()))
                    })
                    .filter(move |result| match result {
                        Ok(record) => residual.eval_dyn(record),
                        Err(_) => true,
                    });
                Ok(Box::new(stream))
            }
            PhysicalOp::IndexOnlyScan { index, scalar, residual } => {
                let descriptor = self.indexes.get(index)?;
                let ty = self.records.get(&descriptor.record_types[0])?;
                let subspace = descriptor.subspace(self.root);
                self.metrics.index_scans.fetch_add(1, AtomicOrdering::Relaxed);
                let entries =
                    scalar::search(&descriptor, &ty, &subspace, self.reader, scalar);
                let residual = residual.clone();
                let stream = entries
                    .map(move |entry| {
                        let entry = entry?;
                        Ok(reconstruct(&descriptor, &ty, entry))
                    })
                    .filter(move |result: &Result<DynRecord>| match result {
                        Ok(record) => residual.eval_dyn(record),
                        Err(_) => true,
                    });
                Ok(Box::new(stream))
            }
            PhysicalOp::Filter { predicate } => {
                let child = self.exec_node(&plan.children[0])?;
                let predicate = predicate.clone();
                Ok(Box::new(child.filter(move |result| match result {
                    Ok(record) => predicate.eval_dyn(record),
                    Err(_) => true,
                })))
            }
            PhysicalOp::Sort { keys, input_sorted } => {
                let child = self.exec_node(&plan.children[0])?;
                if *input_sorted {
                    return Ok(child);
                }
                let mut rows: Vec<DynRecord> = child.collect::<Result<_>>()?;
                let keys = keys.clone();
                rows.sort_by(|a, b| compare_by_keys(a, b, &keys));
                Ok(Box::new(rows.into_iter().map(Ok)))
            }
            PhysicalOp::Limit { limit, offset } => {
                let child = self.exec_node(&plan.children[0])?;
                let taken = child.skip(*offset);
                match limit {
                    Some(l) => Ok(Box::new(taken.take(*l))),
                    None => Ok(Box::new(taken)),
                }
            }
            PhysicalOp::Projection { fields } => {
                let child = self.exec_node(&plan.children[0])?;
                let fields = fields.clone();
                Ok(Box::new(child.map(move |result| {
                    let record = result?;
                    let mut projected = DynRecord::new(record.type_name());
                    for field in &fields {
                        if let Some(value) = record.get(field) {
                            projected.set(field.clone(), value.clone());
                        }
                    }
                    Ok(projected)
                })))
            }
            PhysicalOp::DistinctAggregate => {
                let child = self.exec_node(&plan.children[0])?;
                let mut seen: HashSet<DynRecord> = HashSet::new();
                Ok(Box::new(child.filter(move |result| match result {
                    Ok(record) => seen.insert(record.clone()),
                    Err(_) => true,
                })))
            }
            PhysicalOp::NestedLoopJoin { kind, left_field, right_field } => {
                let left = self.exec_node(&plan.children[0])?;
                let right: Vec<DynRecord> =
                    self.exec_node(&plan.children[1])?.collect::<Result<_>>()?;
                Ok(nested_loop_join(left, right, *kind, left_field.clone(), right_field.clone()))
            }
            PhysicalOp::HashJoin { kind, left_field, right_field } => {
                let left = self.exec_node(&plan.children[0])?;
                let right: Vec<DynRecord> =
                    self.exec_node(&plan.children[1])?.collect::<Result<_>>()?;
                let mut table: HashMap<TupleValue, Vec<DynRecord>> = HashMap::new();
                let right_field_owned = right_field.clone();
                for record in right {
                    let Some(key) = record
                        .get(&right_field_owned)
                        .filter(|k| !k.is_null())
                        .cloned()
                    else {
                        continue;
                    };
                    table.entry(key).or_default().push(record);
                }
                let kind = *kind;
                let left_field = left_field.clone();
                Ok(Box::new(left.flat_map(move |result| {
                    let record = match result {
                        Ok(r) => r,
                        Err(e) => return vec![Err(e)],
                    };
                    let matches = record
                        .get(&left_field)
                        .filter(|k| !k.is_null())
                        .and_then(|k| table.get(k));
                    match matches {
                        Some(partners) => partners
                            .iter()
                            .map(|partner| Ok(merge_records(&record, partner)))
                            .collect(),
                        None if kind == JoinKind::Left => vec![Ok(record)],
                        None => Vec::new(),
                    }
                })))
            }
            PhysicalOp::MergeJoin { kind, left_field, right_field } => {
                let mut left: Vec<DynRecord> =
                    self.exec_node(&plan.children[0])?.collect::<Result<_>>()?;
                let mut right: Vec<DynRecord> =
                    self.exec_node(&plan.children[1])?.collect::<Result<_>>()?;
                let lf = left_field.clone();
                let rf = right_field.clone();
                left.sort_by(|a, b| value_of(a, &lf).cmp(&value_of(b, &lf)));
                right.sort_by(|a, b| value_of(a, &rf).cmp(&value_of(b, &rf)));
                Ok(merge_join(left, right, *kind, lf, rf))
            }
        }
    }
}

/// Reassemble a record from an index entry alone: key values, stored
/// values, and the primary key, no item fetch.
fn reconstruct(descriptor: &IndexDescriptor, ty: &RecordType, entry: crate::index::IndexEntry) -> DynRecord {
    let mut record = DynRecord::new(ty.name());
    for (path, value) in descriptor.key_paths.iter().zip(entry.key_values.0.iter()) {
        record.set(path.clone(), value.clone());
    }
    if let (crate::index::IndexKind::Covering { stored_fields }, Some(stored)) =
        (&descriptor.kind, &entry.stored_values)
    {
        for (field, value) in stored_fields.iter().zip(stored.0.iter()) {
            record.set(field.clone(), value.clone());
        }
    }
    for (field, value) in ty.key_fields().iter().zip(entry.item_id.0.iter()) {
        record.set(field.clone(), value.clone());
    }
    record
}

fn value_of(record: &DynRecord, field: &str) -> TupleValue {
    record.get(field).cloned().unwrap_or(TupleValue::Null)
}

fn compare_by_keys(a: &DynRecord, b: &DynRecord, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ordering = value_of(a, &key.field).cmp(&value_of(b, &key.field));
        let ordering = if key.descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Left's fields win on collision so the driving row stays intact.
fn merge_records(left: &DynRecord, right: &DynRecord) -> DynRecord {
    let mut out = DynRecord::new(left.type_name());
    for (field, value) in right.fields() {
        out.set(field.to_string(), value.clone());
    }
    for (field, value) in left.fields() {
        out.set(field.to_string(), value.clone());
    }
    out
}

fn nested_loop_join<'a>(
    left: RecordStream<'a>,
    right: Vec<DynRecord>,
    kind: JoinKind,
    left_field: String,
    right_field: String,
) -> RecordStream<'a> {
    Box::new(left.flat_map(move |result| {
        let record = match result {
            Ok(r) => r,
            Err(e) => return vec![Err(e)],
        };
        let key = record.get(&left_field).filter(|k| !k.is_null()).cloned();
        let mut out = Vec::new();
        if let Some(key) = key {
            for partner in &right {
                if partner.get(&right_field) == Some(&key) {
                    out.push(Ok(merge_records(&record, partner)));
                }
            }
        }
        if out.is_empty() && kind == JoinKind::Left {
            out.push(Ok(record));
        }
        out
    }))
}

fn merge_join<'a>(
    left: Vec<DynRecord>,
    right: Vec<DynRecord>,
    kind: JoinKind,
    left_field: String,
    right_field: String,
) -> RecordStream<'a> {
    let mut out: Vec<Result<DynRecord>> = Vec::new();
    let mut ri = 0usize;
    for record in &left {
        let key = value_of(record, &left_field);
        if key.is_null() {
            if kind == JoinKind::Left {
                out.push(Ok(record.clone()));
            }
            continue;
        }
        while ri < right.len() && value_of(&right[ri], &right_field) < key {
            ri += 1;
        }
        let mut matched = false;
        let mut rj = ri;
        while rj < right.len() && value_of(&right[rj], &right_field) == key {
            out.push(Ok(merge_records(record, &right[rj])));
            matched = true;
            rj += 1;
        }
        if !matched && kind == JoinKind::Left {
            out.push(Ok(record.clone()));
        }
    }
    Box::new(out.into_iter())
}
