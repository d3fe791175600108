//! Engine Facade
//!
//! Wires configuration, the KV handle, the record and index registries,
//! the statistics store, the planner with its plan cache, and the
//! ontology layer into one entry point. Record mutations drive index
//! maintenance inside the same transaction; executed queries feed the
//! drift detector; shutdown drains the plan cache.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::vector::acorn::{self, AcornParams};
use crate::index::vector::hnsw::{self, BulkLoadReport, HnswIndex};
use crate::index::vector::{flat, VectorMatch, VectorQuery};
use crate::index::{IndexDescriptor, IndexKind, IndexMaintainer, IndexRegistry};
use crate::index::graph::{
    Cursor, Direction, GraphTraverser, Neighbor, TraversalHit, TraversalPage, TraversalQuery,
};
use crate::kv::{KvStore, OpGuard, RangeOptions};
use crate::ontology::{
    dred, Ontology, OntologyMetadata, OntologyStore, Owl2RlMaterializer, Reasoner,
    ReasonerConfig, Triple,
};
use crate::planner::{
    ExecutionFeedback, PlanExecutor, PlanExplanation, Planner, PreparedPlan, Query,
};
use crate::record::{BincodeCodec, DynRecord, RecordRegistry, RecordType};
use crate::stats::StatisticsStore;
use crate::storage::ItemStorage;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use std::sync::Arc;
use std::time::Instant;

/// The transactional record engine.
pub struct Engine {
    config: Config,
    store: Arc<dyn KvStore>,
    root: Subspace,
    records: RecordRegistry,
    indexes: Arc<IndexRegistry>,
    stats: Arc<StatisticsStore>,
    items: ItemStorage,
    planner: Planner,
    ontologies: OntologyStore,
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn KvStore>) -> Self {
        let root = Subspace::root();
        let records = RecordRegistry::new();
        let indexes = Arc::new(IndexRegistry::new());
        let stats = Arc::new(StatisticsStore::new(config.statistics.clone()));
        let items = ItemStorage::new(
            &root,
            Arc::new(BincodeCodec),
            config.storage.inline_limit,
            config.storage.blob_chunk_size,
        );
        let planner = Planner::new(
            config.planner.clone(),
            Arc::clone(&stats),
            Arc::clone(&indexes),
            records.clone(),
        );
        let ontologies = OntologyStore::new(&root);
        Engine {
            config,
            store,
            root,
            records,
            indexes,
            stats,
            items,
            planner,
            ontologies,
        }
    }

    // ── Schema ─────────────────────────────────────────────────────────

    pub fn register_record_type(&self, ty: RecordType) -> Arc<RecordType> {
        self.records.register(ty)
    }

    /// Register an index. Existing records are not backfilled here; use
    /// [`Engine::build_index`] for that.
    pub fn register_index(&self, descriptor: IndexDescriptor) -> Result<Arc<IndexDescriptor>> {
        for type_name in &descriptor.record_types {
            let ty = self.records.get(type_name)?;
            for path in &descriptor.key_paths {
                ty.resolve_key_path(path)?;
            }
            self.planner.invalidate_type(type_name);
        }
        Ok(self.indexes.register(descriptor))
    }

    /// Drop an index and clear its persisted entries.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let Some(descriptor) = self.indexes.drop_index(name) else {
            return Err(Error::IndexNotFound(name.to_string()));
        };
        let mut tx = self.store.transaction();
        let (begin, end) = descriptor.subspace(&self.root).range();
        tx.clear_range(&begin, &end)?;
        tx.commit()?;
        self.stats.drop_index_stats(name);
        for type_name in &descriptor.record_types {
            self.planner.invalidate_type(type_name);
        }
        Ok(())
    }

    /// Backfill an index from existing records, in batches of the
    /// configured size, one transaction per batch.
    pub fn build_index(&self, name: &str) -> Result<usize> {
        let descriptor = self.indexes.get(name)?;
        let batch = self.config.index.build_batch_size.max(1);
        let mut built = 0usize;
        for type_name in &descriptor.record_types {
            let ty = self.records.get(type_name)?;
            // Collect keys first so each batch gets a fresh transaction
            let keys: Vec<Tuple> = {
                let tx = self.store.transaction();
                self.items
                    .scan_type(&ty, tx.as_ref(), RangeOptions::default())
                    .map(|r| r.map(|(pk, _)| pk))
                    .collect::<Result<_>>()?
            };
            for chunk in keys.chunks(batch) {
                let mut tx = self.store.transaction();
                let maintainer =
                    IndexMaintainer::new(&self.root, &self.indexes, Some(&self.stats));
                for pk in chunk {
                    let Some(record) = self.items.load(&ty, pk, tx.as_ref())? else {
                        continue;
                    };
                    maintainer.update_one(&descriptor, &ty, None, Some(&record), tx.as_mut())?;
                    built += 1;
                }
                tx.commit()?;
            }
        }
        tracing::debug!(index = name, records = built, "index_built");
        Ok(built)
    }

    // ── Record operations ──────────────────────────────────────────────

    /// Insert or replace a record; every affected index updates in the
    /// same transaction.
    pub fn save(&self, record: &DynRecord) -> Result<Tuple> {
        self.records.validate(record)?;
        let ty = self.records.get(record.type_name())?;
        let pk = ty.primary_key(record)?;
        let mut tx = self.store.transaction();
        let old = self.items.load(&ty, &pk, tx.as_ref())?;
        self.items.save(&ty, record, tx.as_mut())?;
        let maintainer = IndexMaintainer::new(&self.root, &self.indexes, Some(&self.stats));
        maintainer.update(&ty, old.as_ref(), Some(record), tx.as_mut())?;
        tx.commit()?;
        Ok(pk)
    }

    pub fn get(&self, type_name: &str, primary_key: &Tuple) -> Result<Option<DynRecord>> {
        let ty = self.records.get(type_name)?;
        let tx = self.store.transaction();
        self.items.load(&ty, primary_key, tx.as_ref())
    }

    /// Delete by primary key; index entries clear in the same
    /// transaction. Idempotent: deleting a missing record returns false.
    pub fn delete(&self, type_name: &str, primary_key: &Tuple) -> Result<bool> {
        let ty = self.records.get(type_name)?;
        let mut tx = self.store.transaction();
        let Some(old) = self.items.load(&ty, primary_key, tx.as_ref())? else {
            return Ok(false);
        };
        self.items.delete(&ty, primary_key, tx.as_mut())?;
        let maintainer = IndexMaintainer::new(&self.root, &self.indexes, Some(&self.stats));
        maintainer.update(&ty, Some(&old), None, tx.as_mut())?;
        tx.commit()?;
        Ok(true)
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn prepare(&self, query: &Query) -> Result<Arc<PreparedPlan>> {
        self.planner.prepare(query)
    }

    pub fn explain(&self, query: &Query) -> Result<PlanExplanation> {
        self.planner.explain(query)
    }

    /// Execute a prepared plan to completion, recording runtime
    /// feedback for the drift detector.
    pub fn execute(&self, prepared: &PreparedPlan) -> Result<Vec<DynRecord>> {
        let started = Instant::now();
        let tx = self.store.transaction();
        let executor = PlanExecutor::new(
            &self.root,
            &self.items,
            &self.records,
            &self.indexes,
            tx.as_ref(),
        );
        let metrics = executor.metrics();
        let rows: Vec<DynRecord> = executor.execute(&prepared.plan)?.collect::<Result<_>>()?;

        let feedback = ExecutionFeedback {
            estimated_rows: prepared.plan.estimated_rows,
            actual_rows: metrics.rows(),
            execution_time: started.elapsed(),
            index_scans: metrics.index_scans(),
            record_fetches: metrics.record_fetches(),
            used_indexes: prepared.plan.used_indexes().into_iter().collect(),
        };
        self.planner
            .record_feedback(&prepared.fingerprint.type_name, &feedback);
        Ok(rows)
    }

    /// Prepare and execute in one call.
    pub fn query(&self, query: &Query) -> Result<Vec<DynRecord>> {
        let prepared = self.prepare(query)?;
        self.execute(&prepared)
    }

    // ── Statistics ─────────────────────────────────────────────────────

    /// Rebuild statistics for a type from a full scan.
    pub fn analyze(&self, type_name: &str) -> Result<()> {
        let ty = self.records.get(type_name)?;
        let tx = self.store.transaction();
        let records: Vec<DynRecord> = self
            .items
            .scan_type(&ty, tx.as_ref(), RangeOptions::default())
            .map(|r| r.map(|(_, record)| record))
            .collect::<Result<_>>()?;
        self.stats.analyze(&ty, records.iter());
        Ok(())
    }

    pub fn statistics(&self) -> &StatisticsStore {
        &self.stats
    }

    // ── Vector search ──────────────────────────────────────────────────

    pub fn vector_search(&self, index: &str, query: &VectorQuery) -> Result<Vec<VectorMatch>> {
        let descriptor = self.indexes.get(index)?;
        let subspace = descriptor.subspace(&self.root);
        let tx = self.store.transaction();
        match &descriptor.kind {
            IndexKind::VectorFlat { dim, metric } => {
                flat::search(&subspace, tx.as_ref(), *metric, *dim, query)
            }
            IndexKind::VectorHnsw(params) => {
                let hnsw = HnswIndex::new(&subspace, params)
                    .with_inline_limit(self.config.index.hnsw_inline_limit);
                hnsw.search(tx.as_ref(), query)
            }
            other => Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: format!("vector search on {}", other.name()),
            }),
        }
    }

    /// Filtered (ACORN-style) vector search: the predicate runs over
    /// fetched records; candidates expand to offset its selectivity.
    pub fn filtered_vector_search(
        &self,
        index: &str,
        query: &VectorQuery,
        params: &AcornParams,
        predicate: impl Fn(&DynRecord) -> bool,
    ) -> Result<Vec<VectorMatch>> {
        let descriptor = self.indexes.get(index)?;
        let IndexKind::VectorHnsw(hnsw_params) = &descriptor.kind else {
            return Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: "filtered vector search".to_string(),
            });
        };
        let ty = self.records.get(&descriptor.record_types[0])?;
        let subspace = descriptor.subspace(&self.root);
        let tx = self.store.transaction();
        let hnsw = HnswIndex::new(&subspace, hnsw_params)
            .with_inline_limit(self.config.index.hnsw_inline_limit);
        acorn::filtered_search(&hnsw, tx.as_ref(), query, params, |item_id| {
            match self.items.load(&ty, item_id, tx.as_ref())? {
                Some(record) => Ok(predicate(&record)),
                None => Ok(false),
            }
        })
    }

    /// Train the configured quantizer of an HNSW index from its stored
    /// vectors and backfill the code mirror.
    pub fn train_quantizer(&self, index: &str) -> Result<()> {
        let descriptor = self.indexes.get(index)?;
        let IndexKind::VectorHnsw(params) = &descriptor.kind else {
            return Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: "quantizer training".to_string(),
            });
        };
        let subspace = descriptor.subspace(&self.root);
        let mut tx = self.store.transaction();
        HnswIndex::new(&subspace, params).train_quantizer(tx.as_mut())?;
        tx.commit()
    }

    /// Approximate search over the quantized code mirror; candidates
    /// come back in ascending prepared-distance order for rescoring.
    pub fn quantized_search(
        &self,
        index: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>> {
        let descriptor = self.indexes.get(index)?;
        let IndexKind::VectorHnsw(params) = &descriptor.kind else {
            return Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: "quantized search".to_string(),
            });
        };
        let subspace = descriptor.subspace(&self.root);
        let tx = self.store.transaction();
        HnswIndex::new(&subspace, params).search_codes(tx.as_ref(), query, limit)
    }

    /// Bulk-load an HNSW index from its records across batched
    /// transactions (the path for graphs too large to build inline).
    pub fn bulk_build_hnsw(&self, index: &str) -> Result<BulkLoadReport> {
        let descriptor = self.indexes.get(index)?;
        let IndexKind::VectorHnsw(params) = &descriptor.kind else {
            return Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: "hnsw bulk build".to_string(),
            });
        };
        let ty = self.records.get(&descriptor.record_types[0])?;
        let field = descriptor.key_paths.first().ok_or_else(|| {
            Error::InvalidQuery(format!("index '{index}' has no key path"))
        })?;
        let entries: Vec<(Tuple, Vec<f32>)> = {
            let tx = self.store.transaction();
            let mut out = Vec::new();
            for item in self.items.scan_type(&ty, tx.as_ref(), RangeOptions::default()) {
                let (pk, record) = item?;
                let value = ty.field_value(&record, field)?;
                if let Some(vector) = crate::index::vector::vector_of(value)? {
                    out.push((pk, vector));
                }
            }
            out
        };
        let subspace = descriptor.subspace(&self.root);
        hnsw::bulk_load(
            self.store.as_ref(),
            &subspace,
            params,
            entries,
            self.config.index.build_batch_size,
        )
    }

    // ── Graph traversal ────────────────────────────────────────────────

    pub fn graph_neighbors(
        &self,
        index: &str,
        node: &crate::tuple::TupleValue,
        label: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Neighbor>> {
        let descriptor = self.require_adjacency(index)?;
        let subspace = descriptor.subspace(&self.root);
        let tx = self.store.transaction();
        GraphTraverser::new(&subspace).neighbors(tx.as_ref(), node, label, direction)
    }

    pub fn graph_traverse(&self, index: &str, query: &TraversalQuery) -> Result<Vec<TraversalHit>> {
        let descriptor = self.require_adjacency(index)?;
        let subspace = descriptor.subspace(&self.root);
        GraphTraverser::new(&subspace).traverse(self.store.as_ref(), query)
    }

    pub fn graph_traverse_paginated(
        &self,
        index: &str,
        query: &TraversalQuery,
        cursor: Option<&Cursor>,
    ) -> Result<TraversalPage> {
        let descriptor = self.require_adjacency(index)?;
        let subspace = descriptor.subspace(&self.root);
        GraphTraverser::new(&subspace).traverse_paginated(self.store.as_ref(), query, cursor)
    }

    fn require_adjacency(&self, index: &str) -> Result<Arc<IndexDescriptor>> {
        let descriptor = self.indexes.get(index)?;
        if !matches!(descriptor.kind, IndexKind::GraphAdjacency) {
            return Err(Error::UnsupportedOperator {
                index: index.to_string(),
                op: "graph traversal".to_string(),
            });
        }
        Ok(descriptor)
    }

    // ── Ontology ───────────────────────────────────────────────────────

    pub fn load_ontology(&self, ontology: &Ontology) -> Result<()> {
        let mut tx = self.store.transaction();
        self.ontologies.load(ontology, tx.as_mut())?;
        tx.commit()
    }

    pub fn delete_ontology(&self, iri: &str) -> Result<()> {
        let mut tx = self.store.transaction();
        self.ontologies.delete(iri, tx.as_mut())?;
        tx.commit()
    }

    pub fn ontology(&self, iri: &str) -> Result<Option<OntologyMetadata>> {
        let tx = self.store.transaction();
        self.ontologies.get(iri, tx.as_ref())
    }

    pub fn ontologies(&self) -> &OntologyStore {
        &self.ontologies
    }

    fn materializer(&self, iri: &str, guard: OpGuard) -> Owl2RlMaterializer<'_> {
        Owl2RlMaterializer::new(&self.root, &self.ontologies, iri, ReasonerConfig::default())
            .with_guard(guard)
    }

    /// Assert a triple; OWL 2 RL consequences materialize in the same
    /// transaction when they fit. A materialization that exhausts the
    /// transaction's budget retries on the checkpointed batched path.
    /// Returns the newly inferred triples.
    pub fn assert_triple(&self, iri: &str, triple: &Triple) -> Result<Vec<Triple>> {
        let materializer = self.materializer(iri, OpGuard::transaction_scoped());
        let mut tx = self.store.transaction();
        match materializer.assert(triple, tx.as_mut()) {
            Ok(inferred) => {
                tx.commit()?;
                Ok(inferred)
            }
            Err(err) if err.is_retryable() => {
                tx.rollback();
                tracing::debug!(%err, "materialization_split_into_batches");
                self.assert_triple_batched(iri, triple)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Checkpointed materialization for consequences too wide for one
    /// transaction: the inference frontier carries over between
    /// batches, each batch committing in its own transaction, the way
    /// `build_index` backfills.
    fn assert_triple_batched(&self, iri: &str, triple: &Triple) -> Result<Vec<Triple>> {
        let materializer = self.materializer(iri, OpGuard::unbounded());
        let batch = self.config.index.build_batch_size.max(1);
        let mut step = {
            let mut tx = self.store.transaction();
            let step = materializer.begin_assert(triple, tx.as_mut())?;
            tx.commit()?;
            step
        };
        while !step.is_done() {
            let mut tx = self.store.transaction();
            materializer.materialize(&mut step, batch, tx.as_mut())?;
            tx.commit()?;
            tracing::debug!(pending = step.pending(), "materialization_checkpoint");
        }
        Ok(step.inferred)
    }

    /// Retract a base triple; delete-and-rederive maintains the
    /// inference set in the same transaction when it fits, otherwise
    /// on the chunked batched path.
    pub fn retract_triple(&self, iri: &str, triple: &Triple) -> Result<()> {
        let materializer = self.materializer(iri, OpGuard::transaction_scoped());
        let mut tx = self.store.transaction();
        match materializer.retract(triple, tx.as_mut()) {
            Ok(_) => tx.commit(),
            Err(err) if err.is_retryable() => {
                tx.rollback();
                tracing::debug!(%err, "retraction_split_into_batches");
                self.retract_triple_batched(iri, triple)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Checkpointed retraction: the hierarchy edge leaves in its own
    /// transaction, then DRed marks and commits verdicts in chunks.
    fn retract_triple_batched(&self, iri: &str, triple: &Triple) -> Result<()> {
        let materializer = self.materializer(iri, OpGuard::unbounded());
        {
            let mut tx = self.store.transaction();
            materializer.retract_axiom_edges(triple, tx.as_mut())?;
            tx.commit()?;
        }
        let mut guard = OpGuard::unbounded();
        dred::delete_base_batched(
            materializer.triples(),
            triple,
            self.store.as_ref(),
            self.config.index.build_batch_size.max(1),
            &mut guard,
        )?;
        Ok(())
    }

    /// Query-time reasoner for an ontology.
    pub fn reasoner(&self, iri: &str) -> Reasoner<'_> {
        Reasoner::new(&self.root, &self.ontologies, iri)
    }

    /// Direct KV handle (tests and advanced callers).
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Drain caches ahead of shutdown.
    pub fn shutdown(&self) {
        self.planner.drain();
        tracing::debug!("engine_shutdown");
    }
}
