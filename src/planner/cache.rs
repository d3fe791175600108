//! Prepared Plans, Plan Cache, and Runtime Feedback
//!
//! Prepared plans are cached in an LRU keyed by query fingerprint, so
//! queries differing only in literal values share planning work. A
//! cached plan records the index-registry epoch and its planning-time
//! statistics snapshot; validation evicts plans whose indexes have been
//! dropped. Runtime feedback accumulates per type, and the drift
//! detector invalidates cached plans and triggers a statistics refresh
//! when estimates systematically miss.

use crate::index::IndexRegistry;
use crate::planner::query::QueryFingerprint;
use crate::planner::rules::PhysicalPlan;
use crate::stats::TableStatistics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A plan ready for execution.
#[derive(Debug, Clone)]
pub struct PreparedPlan {
    pub plan: PhysicalPlan,
    pub fingerprint: QueryFingerprint,
    /// Index-registry epoch at planning time
    pub planned_epoch: u64,
    /// Statistics snapshot the costs were derived from
    pub stats_snapshot: Option<Arc<TableStatistics>>,
}

/// Mutex-guarded LRU of prepared plans.
pub struct PlanCache {
    inner: Mutex<LruInner>,
    capacity: usize,
}

struct LruInner {
    map: HashMap<QueryFingerprint, Arc<PreparedPlan>>,
    order: VecDeque<QueryFingerprint>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        PlanCache {
            inner: Mutex::new(LruInner { map: HashMap::new(), order: VecDeque::new() }),
            capacity: capacity.max(1),
        }
    }

    /// Fetch a plan, validating it against the live index set. Invalid
    /// entries are evicted on access.
    pub fn get(
        &self,
        fingerprint: &QueryFingerprint,
        indexes: &IndexRegistry,
    ) -> Option<Arc<PreparedPlan>> {
        let mut inner = self.inner.lock();
        let plan = inner.map.get(fingerprint).cloned()?;
        if !validate(&plan.plan, indexes) {
            inner.map.remove(fingerprint);
            inner.order.retain(|f| f != fingerprint);
            tracing::debug!(?fingerprint, "plan_cache_evicted_invalid");
            return None;
        }
        // Move to the most-recently-used position
        inner.order.retain(|f| f != fingerprint);
        inner.order.push_back(fingerprint.clone());
        Some(plan)
    }

    pub fn insert(&self, plan: Arc<PreparedPlan>) {
        let mut inner = self.inner.lock();
        let fingerprint = plan.fingerprint.clone();
        if inner.map.insert(fingerprint.clone(), plan).is_none() {
            inner.order.push_back(fingerprint);
        } else {
            inner.order.retain(|f| f != &fingerprint);
            inner.order.push_back(fingerprint);
        }
        while inner.map.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
                tracing::trace!(?evicted, "plan_cache_evicted_lru");
            } else {
                break;
            }
        }
    }

    /// Drop every cached plan for one record type.
    pub fn invalidate_type(&self, type_name: &str) {
        let mut inner = self.inner.lock();
        inner.map.retain(|f, _| f.type_name != type_name);
        let live: Vec<QueryFingerprint> = inner
            .order
            .iter()
            .filter(|f| f.type_name != type_name)
            .cloned()
            .collect();
        inner.order = live.into();
    }

    /// Drop everything (shutdown, schema change).
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cached plan is valid only while every index it references exists.
pub fn validate(plan: &PhysicalPlan, indexes: &IndexRegistry) -> bool {
    plan.used_indexes().iter().all(|name| indexes.contains(name))
}

// ── Runtime feedback ───────────────────────────────────────────────────

/// What one plan execution actually did.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFeedback {
    pub estimated_rows: f64,
    pub actual_rows: u64,
    pub execution_time: Duration,
    pub index_scans: u64,
    pub record_fetches: u64,
    pub used_indexes: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DriftWindow {
    samples: usize,
    drifted: usize,
}

/// Flags systematic misestimation per record type.
pub struct DriftDetector {
    windows: DashMap<String, DriftWindow>,
    min_samples: usize,
    threshold: f64,
}

impl DriftDetector {
    pub fn new(min_samples: usize, threshold: f64) -> Self {
        DriftDetector {
            windows: DashMap::new(),
            min_samples: min_samples.max(1),
            threshold: threshold.max(1.0),
        }
    }

    /// Record one execution. Returns true when the type's estimates
    /// have drifted and its plans should be re-planned against fresh
    /// statistics.
    pub fn record(&self, type_name: &str, feedback: &ExecutionFeedback) -> bool {
        let estimated = feedback.estimated_rows.max(1.0);
        let actual = (feedback.actual_rows as f64).max(1.0);
        let ratio = (estimated / actual).max(actual / estimated);
        let mut window = self.windows.entry(type_name.to_string()).or_default();
        window.samples += 1;
        if ratio > self.threshold {
            window.drifted += 1;
        }
        if window.samples >= self.min_samples {
            let drifted = window.drifted * 2 > window.samples;
            if drifted {
                tracing::debug!(
                    record_type = type_name,
                    samples = window.samples,
                    drifted_samples = window.drifted,
                    "estimate_drift_detected"
                );
            }
            *window = DriftWindow::default();
            return drifted;
        }
        false
    }

    pub fn reset(&self, type_name: &str) {
        self.windows.remove(type_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexDescriptor, IndexKind};
    use crate::planner::memo::PhysicalOp;
    use crate::planner::query::{CompareOp, Predicate, Query};
    use crate::index::scalar::ScalarQuery;

    fn plan_using(index: &str) -> PhysicalPlan {
        PhysicalPlan {
            op: PhysicalOp::IndexScan {
                index: index.to_string(),
                scalar: ScalarQuery::full(),
                residual: Predicate::True,
            },
            children: vec![],
            estimated_rows: 10.0,
            estimated_cost: 12.0,
        }
    }

    fn prepared(type_name: &str, index: &str, epoch: u64) -> Arc<PreparedPlan> {
        let query =
            Query::new(type_name).filter(Predicate::field("age", CompareOp::Gt, epoch as i64));
        Arc::new(PreparedPlan {
            plan: plan_using(index),
            fingerprint: QueryFingerprint::of(&query),
            planned_epoch: epoch,
            stats_snapshot: None,
        })
    }

    #[test]
    fn test_cache_hit_and_lru_eviction() {
        let cache = PlanCache::new(2);
        let indexes = IndexRegistry::new();
        indexes.register(IndexDescriptor::new("i", vec!["age"], IndexKind::Scalar, vec!["a"]));

        let a = prepared("a", "i", 1);
        let b = prepared("b", "i", 1);
        let c = prepared("c", "i", 1);
        cache.insert(a.clone());
        cache.insert(b.clone());
        assert!(cache.get(&a.fingerprint, &indexes).is_some());

        // Inserting a third evicts the least recently used (b)
        cache.insert(c.clone());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b.fingerprint, &indexes).is_none());
        assert!(cache.get(&a.fingerprint, &indexes).is_some());
        assert!(cache.get(&c.fingerprint, &indexes).is_some());
    }

    #[test]
    fn test_dropped_index_invalidates_on_access() {
        let cache = PlanCache::new(8);
        let indexes = IndexRegistry::new();
        indexes.register(IndexDescriptor::new("i", vec!["age"], IndexKind::Scalar, vec!["a"]));
        let plan = prepared("a", "i", 1);
        cache.insert(plan.clone());
        assert!(cache.get(&plan.fingerprint, &indexes).is_some());

        indexes.drop_index("i");
        assert!(cache.get(&plan.fingerprint, &indexes).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_type() {
        let cache = PlanCache::new(8);
        let indexes = IndexRegistry::new();
        indexes.register(IndexDescriptor::new("i", vec!["age"], IndexKind::Scalar, vec!["a"]));
        let a = prepared("a", "i", 1);
        let b = prepared("b", "i", 1);
        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.invalidate_type("a");
        assert!(cache.get(&a.fingerprint, &indexes).is_none());
        assert!(cache.get(&b.fingerprint, &indexes).is_some());
    }

    #[test]
    fn test_drift_detection_fires_on_sustained_misses() {
        let detector = DriftDetector::new(4, 4.0);
        let bad = ExecutionFeedback {
            estimated_rows: 10.0,
            actual_rows: 1000,
            ..Default::default()
        };
        assert!(!detector.record("user", &bad));
        assert!(!detector.record("user", &bad));
        assert!(!detector.record("user", &bad));
        // Fourth sample completes the window and reports drift
        assert!(detector.record("user", &bad));
        // Window reset: the next sample starts fresh
        assert!(!detector.record("user", &bad));
    }

    #[test]
    fn test_accurate_estimates_do_not_drift() {
        let detector = DriftDetector::new(4, 4.0);
        let good = ExecutionFeedback {
            estimated_rows: 100.0,
            actual_rows: 120,
            ..Default::default()
        };
        for _ in 0..3 {
            assert!(!detector.record("user", &good));
        }
        assert!(!detector.record("user", &good));
    }
}
