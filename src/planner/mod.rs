//! Cost-Based Query Planner
//!
//! A Cascades-style optimizer: queries normalize into an analysis, the
//! memo enumerates equivalent plans via transformation and
//! implementation rules, the cost model scores physical candidates from
//! statistics, and prepared plans are cached by query fingerprint.
//! Runtime feedback closes the loop: sustained misestimation invalidates
//! cached plans and triggers a statistics refresh.
//!
//! ```text
//! Query -> QueryAnalyzer -> Memo + Rules -> CostModel <- Statistics
//!       -> PreparedPlan (cached by fingerprint) -> PlanExecutor
//!       -> IndexSearcher -> KV range scans -> record fetches -> rows
//! ```

pub mod cache;
pub mod cost;
pub mod executor;
pub mod memo;
pub mod query;
pub mod rules;

pub use cache::{DriftDetector, ExecutionFeedback, PlanCache, PreparedPlan};
pub use executor::{ExecMetrics, PlanExecutor, RecordStream};
pub use memo::{JoinKind, LogicalOp, Memo, PhysicalOp};
pub use query::{
    Analysis, CompareOp, Predicate, Query, QueryAnalyzer, QueryFingerprint, QueryHints, SortKey,
};
pub use rules::{Optimizer, PhysicalPlan};

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::index::IndexRegistry;
use crate::record::RecordRegistry;
use crate::stats::StatisticsStore;
use std::sync::Arc;

/// Human-readable plan description returned by `explain`.
#[derive(Debug, Clone)]
pub struct PlanExplanation {
    pub rendered: String,
    pub used_indexes: Vec<String>,
    pub estimated_rows: f64,
    pub estimated_cost: f64,
    pub estimated_record_fetches: f64,
    pub cached: bool,
}

/// The planning front end: analyze, optimize, cache, and re-plan on
/// drift. Shared across queries; each optimization owns its own memo.
pub struct Planner {
    config: PlannerConfig,
    stats: Arc<StatisticsStore>,
    indexes: Arc<IndexRegistry>,
    records: RecordRegistry,
    cache: PlanCache,
    drift: DriftDetector,
}

impl Planner {
    pub fn new(
        config: PlannerConfig,
        stats: Arc<StatisticsStore>,
        indexes: Arc<IndexRegistry>,
        records: RecordRegistry,
    ) -> Self {
        let cache = PlanCache::new(config.plan_cache_capacity);
        let drift = DriftDetector::new(config.drift_min_samples, config.drift_threshold);
        Planner { config, stats, indexes, records, cache, drift }
    }

    /// Prepare a plan, consulting the cache first. Two queries that
    /// differ only in literal values share the cached plan shape; the
    /// shape is re-bound to the new query's values on every hit. A bind
    /// failure falls back to fresh planning.
    pub fn prepare(&self, query: &Query) -> Result<Arc<PreparedPlan>> {
        let fingerprint = QueryFingerprint::of(query);
        if let Some(cached) = self.cache.get(&fingerprint, &self.indexes) {
            let ty = self.records.get(&query.record_type)?;
            match rules::rebind_plan(&cached.plan, query, &ty, &self.indexes) {
                Ok(plan) => {
                    tracing::trace!(?fingerprint, "plan_cache_hit");
                    return Ok(Arc::new(PreparedPlan {
                        plan,
                        fingerprint,
                        planned_epoch: cached.planned_epoch,
                        stats_snapshot: cached.stats_snapshot.clone(),
                    }));
                }
                Err(err) => {
                    tracing::debug!(?fingerprint, %err, "plan_rebind_failed_replanning");
                }
            }
        }

        let mut optimizer =
            Optimizer::new(&self.config, &self.stats, &self.indexes, &self.records);
        let root = optimizer.build_query(query)?;
        let plan = optimizer.optimize(root)?;
        tracing::debug!(
            record_type = %query.record_type,
            cost = plan.estimated_cost,
            rows = plan.estimated_rows,
            groups = optimizer.memo().group_count(),
            "query_planned"
        );
        let prepared = Arc::new(PreparedPlan {
            plan,
            fingerprint,
            planned_epoch: self.indexes.epoch(),
            stats_snapshot: self.stats.table(&query.record_type),
        });
        self.cache.insert(Arc::clone(&prepared));
        Ok(prepared)
    }

    /// Plan and describe without executing.
    pub fn explain(&self, query: &Query) -> Result<PlanExplanation> {
        let fingerprint = QueryFingerprint::of(query);
        let cached = self.cache.get(&fingerprint, &self.indexes).is_some();
        let prepared = self.prepare(query)?;
        Ok(PlanExplanation {
            rendered: prepared.plan.render(),
            used_indexes: prepared.plan.used_indexes().into_iter().collect(),
            estimated_rows: prepared.plan.estimated_rows,
            estimated_cost: prepared.plan.estimated_cost,
            estimated_record_fetches: prepared.plan.estimated_record_fetches(),
            cached,
        })
    }

    /// Feed one execution's outcome back. On drift, cached plans for the
    /// type are dropped and its statistics invalidated so the next
    /// prepare re-plans fresh.
    pub fn record_feedback(&self, type_name: &str, feedback: &ExecutionFeedback) {
        if self.drift.record(type_name, feedback) {
            self.cache.invalidate_type(type_name);
            self.stats.invalidate(type_name);
            tracing::debug!(record_type = type_name, "plans_invalidated_by_drift");
        }
    }

    /// Schema change: drop plans for the type.
    pub fn invalidate_type(&self, type_name: &str) {
        self.cache.invalidate_type(type_name);
        self.drift.reset(type_name);
    }

    /// Shutdown: drain the cache.
    pub fn drain(&self) {
        self.cache.drain();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatisticsConfig;
    use crate::index::{IndexDescriptor, IndexKind};
    use crate::record::{DynRecord, RecordType};

    fn planner() -> Planner {
        let stats = Arc::new(StatisticsStore::new(StatisticsConfig::default()));
        let records = RecordRegistry::new();
        let ty = records.register(RecordType::new(
            "user",
            vec!["id", "name", "age"],
            vec!["id"],
        ));
        let sample: Vec<DynRecord> = (0..500)
            .map(|i| {
                DynRecord::new("user")
                    .with("id", i as i64)
                    .with("name", format!("user{:02}", i % 50))
                    .with("age", (i % 60) as i64)
            })
            .collect();
        stats.analyze(&ty, sample.iter());

        let indexes = Arc::new(IndexRegistry::new());
        indexes.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        Planner::new(PlannerConfig::default(), stats, indexes, records)
    }

    #[test]
    fn test_prepare_caches_by_fingerprint() {
        let planner = planner();
        let a = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 25i64));
        let b = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 40i64));
        let pa = planner.prepare(&a).unwrap();
        let pb = planner.prepare(&b).unwrap();
        // Same shape: one cache entry, same operator tree
        assert_eq!(pa.fingerprint, pb.fingerprint);
        assert_eq!(planner.cache_len(), 1);
        assert_eq!(pa.plan.used_indexes(), pb.plan.used_indexes());
        // The rebound plan carries the second query's literal
        let keystone_bound = format!("{:?}", pb.plan.op);
        assert!(keystone_bound.contains("40"), "plan not rebound: {keystone_bound}");
    }

    #[test]
    fn test_explain_reports_indexes() {
        let planner = planner();
        let query = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 25i64));
        let explanation = planner.explain(&query).unwrap();
        assert_eq!(explanation.used_indexes, vec!["idx_age".to_string()]);
        assert!(!explanation.cached);
        assert!(explanation.rendered.contains("IndexScan"));

        let again = planner.explain(&query).unwrap();
        assert!(again.cached);
    }

    #[test]
    fn test_drift_invalidates_cache() {
        let planner = planner();
        let query = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 25i64));
        planner.prepare(&query).unwrap();
        assert_eq!(planner.cache_len(), 1);

        let bad = ExecutionFeedback {
            estimated_rows: 1.0,
            actual_rows: 100_000,
            ..Default::default()
        };
        for _ in 0..PlannerConfig::default().drift_min_samples {
            planner.record_feedback("user", &bad);
        }
        assert_eq!(planner.cache_len(), 0);
    }

    #[test]
    fn test_drain_empties_cache() {
        let planner = planner();
        let query = Query::new("user");
        planner.prepare(&query).unwrap();
        planner.drain();
        assert_eq!(planner.cache_len(), 0);
    }
}
