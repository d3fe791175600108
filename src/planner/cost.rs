//! Physical Cost Model
//!
//! Plan cost is a weighted sum of index reads, record fetches, residual
//! predicate evaluations, `n log2(n)` sort work, and range-scan
//! initiations, with weights mirroring PostgreSQL's defaults (sequential
//! page 1, random page 4, cpu tuple 0.01). Row estimates come from the
//! statistics store; missing statistics fall back to conservative
//! defaults.

use crate::config::PlannerConfig;
use crate::index::IndexRegistry;
use crate::planner::memo::PhysicalOp;
use crate::planner::query::{CompareOp, Predicate};
use crate::stats::StatisticsStore;
use crate::index::scalar::ScalarQuery;
use crate::tuple::TupleValue;

/// Row count assumed for tables that were never analyzed.
pub const DEFAULT_TABLE_ROWS: f64 = 1000.0;

/// Local cost and output cardinality of one operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpCost {
    pub cost: f64,
    pub rows: f64,
}

/// Cost estimator over the statistics store.
pub struct CostModel<'a> {
    pub config: &'a PlannerConfig,
    pub stats: &'a StatisticsStore,
    pub indexes: &'a IndexRegistry,
}

impl<'a> CostModel<'a> {
    pub fn new(
        config: &'a PlannerConfig,
        stats: &'a StatisticsStore,
        indexes: &'a IndexRegistry,
    ) -> Self {
        CostModel { config, stats, indexes }
    }

    /// Estimated base cardinality of a record type.
    pub fn table_rows(&self, type_name: &str) -> f64 {
        self.stats
            .row_count(type_name)
            .map(|n| n as f64)
            .unwrap_or(DEFAULT_TABLE_ROWS)
            .max(1.0)
    }

    /// Fraction of rows a predicate passes.
    pub fn predicate_selectivity(&self, type_name: &str, predicate: &Predicate) -> f64 {
        match predicate {
            Predicate::True => 1.0,
            Predicate::False => 0.0,
            Predicate::And(ps) => ps
                .iter()
                .map(|p| self.predicate_selectivity(type_name, p))
                .product(),
            Predicate::Or(ps) => {
                let miss: f64 = ps
                    .iter()
                    .map(|p| 1.0 - self.predicate_selectivity(type_name, p))
                    .product();
                1.0 - miss
            }
            Predicate::Not(p) => 1.0 - self.predicate_selectivity(type_name, p),
            Predicate::Compare { field, op, values } => {
                self.compare_selectivity(type_name, field, *op, values)
            }
        }
    }

    fn compare_selectivity(
        &self,
        type_name: &str,
        field: &str,
        op: CompareOp,
        values: &[TupleValue],
    ) -> f64 {
        match op {
            CompareOp::Eq => self.stats.equality_selectivity(type_name, field, values.first()),
            CompareOp::Ne => {
                (1.0 - self.stats.equality_selectivity(type_name, field, values.first())).max(0.0)
            }
            CompareOp::Le => self
                .stats
                .range_selectivity(type_name, field, None, values.first()),
            CompareOp::Ge => self
                .stats
                .range_selectivity(type_name, field, values.first(), None),
            // Strict bounds shed the boundary value's own mass
            CompareOp::Lt => {
                let range = self.stats.range_selectivity(type_name, field, None, values.first());
                let eq = self.stats.equality_selectivity(type_name, field, values.first());
                (range - eq).clamp(0.0, 1.0)
            }
            CompareOp::Gt => {
                let range = self.stats.range_selectivity(type_name, field, values.first(), None);
                let eq = self.stats.equality_selectivity(type_name, field, values.first());
                (range - eq).clamp(0.0, 1.0)
            }
            CompareOp::In => {
                let eq = self.stats.equality_selectivity(type_name, field, values.first());
                (eq * values.len() as f64).min(1.0)
            }
            CompareOp::IsNil => self.stats.null_selectivity(type_name, field),
            CompareOp::IsNotNil => (1.0 - self.stats.null_selectivity(type_name, field)).max(0.0),
            CompareOp::Prefix => match values.first() {
                Some(TupleValue::String(prefix)) => {
                    let mut upper = prefix.clone();
                    upper.push(char::MAX);
                    self.stats.range_selectivity(
                        type_name,
                        field,
                        Some(&TupleValue::String(prefix.clone())),
                        Some(&TupleValue::String(upper)),
                    )
                }
                _ => 0.1,
            },
            CompareOp::Contains => 0.1,
        }
    }

    /// Fraction of index entries a scalar query's bounds cover.
    pub fn scalar_query_selectivity(
        &self,
        type_name: &str,
        key_paths: &[String],
        scalar: &ScalarQuery,
    ) -> f64 {
        let mut selectivity = 1.0;
        for (i, value) in scalar.equality_prefix.iter().enumerate() {
            let Some(field) = key_paths.get(i) else { break };
            selectivity *= self.stats.equality_selectivity(type_name, field, Some(value));
        }
        if let Some(bound) = &scalar.bound {
            if let Some(field) = key_paths.get(scalar.equality_prefix.len()) {
                let lower = bound.lower.as_ref().map(|(v, _)| v);
                let upper = bound.upper.as_ref().map(|(v, _)| v);
                let mut range = self.stats.range_selectivity(type_name, field, lower, upper);
                // Exclusive bounds shed the boundary value's own mass
                if let Some((value, false)) = &bound.lower {
                    range -= self.stats.equality_selectivity(type_name, field, Some(value));
                }
                if let Some((value, false)) = &bound.upper {
                    range -= self.stats.equality_selectivity(type_name, field, Some(value));
                }
                selectivity *= range.clamp(0.0, 1.0);
            }
        }
        selectivity.clamp(0.0, 1.0)
    }

    fn sort_cost(&self, rows: f64) -> f64 {
        let n = rows.max(2.0);
        n * n.log2() * self.config.sort_weight
    }

    /// Local cost and output rows of a physical operator given child
    /// output cardinalities.
    pub fn op_cost(&self, op: &PhysicalOp, type_name: &str, child_rows: &[f64]) -> OpCost {
        let w = self.config;
        let input = child_rows.first().copied().unwrap_or(0.0);
        match op {
            PhysicalOp::SeqScan { type_name: scanned, predicate } => {
                let rows_in = self.table_rows(scanned);
                let selectivity = self.predicate_selectivity(scanned, predicate);
                let post = if predicate.is_trivially_true() { 0.0 } else { rows_in };
                OpCost {
                    cost: w.range_initiation_weight
                        + rows_in * w.record_fetch_weight
                        + post * w.post_filter_weight,
                    rows: (rows_in * selectivity).max(0.0),
                }
            }
            PhysicalOp::IndexScan { index, scalar, residual }
            | PhysicalOp::IndexOnlyScan { index, scalar, residual } => {
                let rows_in = self.table_rows(type_name);
                let key_paths = self
                    .indexes
                    .get(index)
                    .map(|d| d.key_paths.clone())
                    .unwrap_or_default();
                let matched =
                    (rows_in * self.scalar_query_selectivity(type_name, &key_paths, scalar))
                        .max(0.0);
                let residual_sel = self.predicate_selectivity(type_name, residual);
                let fetch = matches!(op, PhysicalOp::IndexScan { .. });
                let fetch_cost = if fetch { matched * w.record_fetch_weight } else { 0.0 };
                let post = if residual.is_trivially_true() { 0.0 } else { matched };
                OpCost {
                    cost: w.range_initiation_weight
                        + matched * w.index_read_weight
                        + fetch_cost
                        + post * w.post_filter_weight,
                    rows: (matched * residual_sel).max(0.0),
                }
            }
            PhysicalOp::Filter { predicate } => OpCost {
                cost: input * w.post_filter_weight,
                rows: input * self.predicate_selectivity(type_name, predicate),
            },
            PhysicalOp::Sort { input_sorted, .. } => OpCost {
                cost: if *input_sorted { 0.0 } else { self.sort_cost(input) },
                rows: input,
            },
            PhysicalOp::Limit { limit, offset } => {
                let available = (input - *offset as f64).max(0.0);
                let rows = match limit {
                    Some(l) => available.min(*l as f64),
                    None => available,
                };
                OpCost { cost: 0.0, rows }
            }
            PhysicalOp::Projection { .. } => OpCost {
                cost: input * w.post_filter_weight,
                rows: input,
            },
            PhysicalOp::DistinctAggregate => OpCost {
                cost: input * w.post_filter_weight * 2.0,
                rows: (input * 0.5).max(1.0).min(input),
            },
            PhysicalOp::NestedLoopJoin { .. } => {
                let left = child_rows.first().copied().unwrap_or(0.0);
                let right = child_rows.get(1).copied().unwrap_or(0.0);
                OpCost {
                    cost: left * right * w.post_filter_weight,
                    rows: self.join_rows(left, right),
                }
            }
            PhysicalOp::HashJoin { .. } => {
                let left = child_rows.first().copied().unwrap_or(0.0);
                let right = child_rows.get(1).copied().unwrap_or(0.0);
                OpCost {
                    cost: (left + right) * w.post_filter_weight * 2.0,
                    rows: self.join_rows(left, right),
                }
            }
            PhysicalOp::MergeJoin { .. } => {
                let left = child_rows.first().copied().unwrap_or(0.0);
                let right = child_rows.get(1).copied().unwrap_or(0.0);
                OpCost {
                    cost: self.sort_cost(left)
                        + self.sort_cost(right)
                        + (left + right) * w.post_filter_weight,
                    rows: self.join_rows(left, right),
                }
            }
        }
    }

    /// Equi-join output estimate: cross product damped by the larger
    /// side's cardinality.
    fn join_rows(&self, left: f64, right: f64) -> f64 {
        let denom = left.max(right).max(1.0);
        (left * right / denom).max(0.0)
    }

    /// Minimum conceivable local cost for an operator kind; used by the
    /// branch-and-bound lower bound.
    pub fn lower_bound(&self, op: &PhysicalOp) -> f64 {
        match op {
            PhysicalOp::SeqScan { .. }
            | PhysicalOp::IndexScan { .. }
            | PhysicalOp::IndexOnlyScan { .. } => self.config.range_initiation_weight,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatisticsConfig;
    use crate::index::{IndexDescriptor, IndexKind};
    use crate::record::{DynRecord, RecordType};

    fn fixture() -> (PlannerConfig, StatisticsStore, IndexRegistry) {
        let stats = StatisticsStore::new(StatisticsConfig::default());
        let ty = RecordType::new("user", vec!["id", "age", "name"], vec!["id"]);
        let records: Vec<DynRecord> = (0..1000)
            .map(|i| {
                DynRecord::new("user")
                    .with("id", i as i64)
                    .with("age", (i % 50) as i64)
                    .with("name", format!("user{i}"))
            })
            .collect();
        stats.analyze(&ty, records.iter());
        let indexes = IndexRegistry::new();
        indexes.register(IndexDescriptor::new(
            "idx_age",
            vec!["age"],
            IndexKind::Scalar,
            vec!["user"],
        ));
        (PlannerConfig::default(), stats, indexes)
    }

    #[test]
    fn test_index_scan_cheaper_when_selective() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);

        let predicate = Predicate::field("age", CompareOp::Eq, 7i64);
        let seq = model.op_cost(
            &PhysicalOp::SeqScan { type_name: "user".into(), predicate: predicate.clone() },
            "user",
            &[],
        );
        let scalar = ScalarQuery::equals(vec![TupleValue::Int(7)]);
        let index = model.op_cost(
            &PhysicalOp::IndexScan {
                index: "idx_age".into(),
                scalar,
                residual: Predicate::True,
            },
            "user",
            &[],
        );
        assert!(index.cost < seq.cost, "index {index:?} vs seq {seq:?}");
        // Both estimate roughly the same output
        assert!((index.rows - seq.rows).abs() / seq.rows.max(1.0) < 0.5);
    }

    #[test]
    fn test_index_only_cheaper_than_index() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);
        let scalar = ScalarQuery::equals(vec![TupleValue::Int(7)]);
        let with_fetch = model.op_cost(
            &PhysicalOp::IndexScan {
                index: "idx_age".into(),
                scalar: scalar.clone(),
                residual: Predicate::True,
            },
            "user",
            &[],
        );
        let covering = model.op_cost(
            &PhysicalOp::IndexOnlyScan {
                index: "idx_age".into(),
                scalar,
                residual: Predicate::True,
            },
            "user",
            &[],
        );
        assert!(covering.cost < with_fetch.cost);
    }

    #[test]
    fn test_and_multiplies_selectivities() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);
        let single = model.predicate_selectivity(
            "user",
            &Predicate::field("age", CompareOp::Eq, 7i64),
        );
        let double = model.predicate_selectivity(
            "user",
            &Predicate::and(vec![
                Predicate::field("age", CompareOp::Eq, 7i64),
                Predicate::field("name", CompareOp::Eq, "user7"),
            ]),
        );
        assert!(double < single);
    }

    #[test]
    fn test_sort_cost_superlinear() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);
        let small = model.op_cost(
            &PhysicalOp::Sort { keys: vec![], input_sorted: false },
            "user",
            &[100.0],
        );
        let large = model.op_cost(
            &PhysicalOp::Sort { keys: vec![], input_sorted: false },
            "user",
            &[10_000.0],
        );
        assert!(large.cost > small.cost * 100.0);
        let sorted = model.op_cost(
            &PhysicalOp::Sort { keys: vec![], input_sorted: true },
            "user",
            &[10_000.0],
        );
        assert_eq!(sorted.cost, 0.0);
    }

    #[test]
    fn test_limit_caps_rows() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);
        let out = model.op_cost(
            &PhysicalOp::Limit { limit: Some(10), offset: 5 },
            "user",
            &[100.0],
        );
        assert_eq!(out.rows, 10.0);
        let tail = model.op_cost(
            &PhysicalOp::Limit { limit: Some(10), offset: 95 },
            "user",
            &[100.0],
        );
        assert_eq!(tail.rows, 5.0);
    }

    #[test]
    fn test_hash_join_beats_nested_loop_on_large_inputs() {
        let (config, stats, indexes) = fixture();
        let model = CostModel::new(&config, &stats, &indexes);
        let op = |op: PhysicalOp| model.op_cost(&op, "user", &[1000.0, 1000.0]);
        let nl = op(PhysicalOp::NestedLoopJoin {
            kind: crate::planner::memo::JoinKind::Inner,
            left_field: "id".into(),
            right_field: "id".into(),
        });
        let hash = op(PhysicalOp::HashJoin {
            kind: crate::planner::memo::JoinKind::Inner,
            left_field: "id".into(),
            right_field: "id".into(),
        });
        assert!(hash.cost < nl.cost);
    }
}
