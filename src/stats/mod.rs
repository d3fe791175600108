//! Statistics Engine
//!
//! Streaming sketches (reservoir, HyperLogLog++, equi-depth histogram,
//! MCV) composed into per-field and per-index statistics. The planner's
//! selectivity estimator reads published snapshots; ANALYZE rebuilds them
//! from a record scan; index maintainers feed per-index counters
//! best-effort.
//!
//! Readers are lock-free: snapshots are published through `arc-swap` and
//! a single writer serializes rebuilds.

mod histogram;
mod hll;
mod reservoir;

pub use histogram::{scalar_of, Bucket, Histogram, Mcv};
pub use hll::{hash_bytes, hash_value, HyperLogLog};
pub use reservoir::Reservoir;

use crate::config::StatisticsConfig;
use crate::record::{DynRecord, RecordType};
use crate::tuple::TupleValue;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Conservative default selectivity for equality predicates.
pub const DEFAULT_EQUALITY_SELECTIVITY: f64 = 0.01;
/// Conservative default selectivity for range predicates.
pub const DEFAULT_RANGE_SELECTIVITY: f64 = 0.3;

/// Statistics for one field of a record type.
#[derive(Debug, Clone)]
pub struct FieldStatistics {
    /// Distinct non-null values (HLL estimate)
    pub distinct: u64,
    /// Null occurrences observed at analyze time
    pub null_count: u64,
    /// Non-null occurrences observed at analyze time
    pub value_count: u64,
    pub histogram: Histogram,
    pub mcv: Mcv,
    /// The sketch itself, kept for later merging
    pub sketch: HyperLogLog,
}

impl FieldStatistics {
    /// `isNil` selectivity: nulls over all observations.
    pub fn null_selectivity(&self) -> f64 {
        let total = self.null_count + self.value_count;
        if total == 0 {
            0.0
        } else {
            self.null_count as f64 / total as f64
        }
    }
}

/// Statistics for one record type.
#[derive(Debug, Clone)]
pub struct TableStatistics {
    pub row_count: u64,
    pub sample_size: usize,
    pub analyzed_at: DateTime<Utc>,
    pub fields: HashMap<String, FieldStatistics>,
}

/// Per-index counters maintained incrementally.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStatistics {
    pub entry_count: u64,
    pub key_count: u64,
}

impl IndexStatistics {
    pub fn avg_entries_per_key(&self) -> f64 {
        if self.key_count == 0 {
            0.0
        } else {
            self.entry_count as f64 / self.key_count as f64
        }
    }
}

#[derive(Default)]
struct StatsSnapshot {
    tables: HashMap<String, Arc<TableStatistics>>,
}

/// Statistics provider shared by the planner, maintainers, and the
/// runtime feedback loop. Concurrent readers, single writer per rebuild.
pub struct StatisticsStore {
    config: StatisticsConfig,
    snapshot: ArcSwap<StatsSnapshot>,
    index_stats: DashMap<String, IndexStatistics>,
    writer: Mutex<()>,
}

impl StatisticsStore {
    pub fn new(config: StatisticsConfig) -> Self {
        StatisticsStore {
            config,
            snapshot: ArcSwap::from_pointee(StatsSnapshot::default()),
            index_stats: DashMap::new(),
            writer: Mutex::new(()),
        }
    }

    // ── ANALYZE ────────────────────────────────────────────────────────

    /// Rebuild statistics for a record type from a full scan.
    pub fn analyze<'a>(
        &self,
        ty: &RecordType,
        records: impl Iterator<Item = &'a DynRecord>,
    ) -> Arc<TableStatistics> {
        struct FieldAccum {
            nulls: u64,
            values: u64,
            sketch: HyperLogLog,
            reservoir: Reservoir<TupleValue>,
        }

        let mut accums: HashMap<&str, FieldAccum> = ty
            .field_names()
            .iter()
            .map(|name| {
                (
                    name.as_str(),
                    FieldAccum {
                        nulls: 0,
                        values: 0,
                        // Precision is config-validated at startup
                        sketch: HyperLogLog::new(self.config.hll_precision)
                            .unwrap_or_else(|_| HyperLogLog::new(14).expect("default precision")),
                        reservoir: Reservoir::new(self.config.reservoir_size),
                    },
                )
            })
            .collect();

        let mut row_count = 0u64;
        for record in records {
            row_count += 1;
            for (name, accum) in accums.iter_mut() {
                match record.get(name) {
                    None | Some(TupleValue::Null) => accum.nulls += 1,
                    Some(value) => {
                        accum.values += 1;
                        accum.sketch.add_value(value);
                        accum.reservoir.offer(value.clone());
                    }
                }
            }
        }

        let buckets = self.config.histogram_buckets;
        let min_freq = self.config.mcv_min_frequency;
        let max_mcv = self.config.mcv_max_size;
        let fields: HashMap<String, FieldStatistics> = accums
            .into_par_iter()
            .map(|(name, accum)| {
                let sample = accum.reservoir.sample();
                let stats = FieldStatistics {
                    distinct: accum.sketch.cardinality(),
                    null_count: accum.nulls,
                    value_count: accum.values,
                    histogram: Histogram::build(sample, buckets),
                    mcv: Mcv::build(sample, min_freq, max_mcv),
                    sketch: accum.sketch,
                };
                (name.to_string(), stats)
            })
            .collect();

        let table = Arc::new(TableStatistics {
            row_count,
            sample_size: self.config.reservoir_size,
            analyzed_at: Utc::now(),
            fields,
        });

        let _guard = self.writer.lock();
        let mut tables = self.snapshot.load().tables.clone();
        tables.insert(ty.name().to_string(), Arc::clone(&table));
        self.snapshot.store(Arc::new(StatsSnapshot { tables }));
        tracing::debug!(record_type = ty.name(), rows = row_count, "statistics_rebuilt");
        table
    }

    /// Drop statistics for a type (schema change, drift).
    pub fn invalidate(&self, type_name: &str) {
        let _guard = self.writer.lock();
        let mut tables = self.snapshot.load().tables.clone();
        if tables.remove(type_name).is_some() {
            self.snapshot.store(Arc::new(StatsSnapshot { tables }));
            tracing::debug!(record_type = type_name, "statistics_invalidated");
        }
    }

    pub fn table(&self, type_name: &str) -> Option<Arc<TableStatistics>> {
        self.snapshot.load().tables.get(type_name).cloned()
    }

    // ── Provider surface ───────────────────────────────────────────────

    pub fn row_count(&self, type_name: &str) -> Option<u64> {
        self.table(type_name).map(|t| t.row_count)
    }

    pub fn distinct_values(&self, type_name: &str, field: &str) -> Option<u64> {
        self.table(type_name)?.fields.get(field).map(|f| f.distinct)
    }

    /// Selectivity of `field = value`. MCV entries are answered directly;
    /// otherwise the histogram's residual mass is consulted; missing
    /// statistics fall back to the conservative default.
    pub fn equality_selectivity(
        &self,
        type_name: &str,
        field: &str,
        value: Option<&TupleValue>,
    ) -> f64 {
        let Some(table) = self.table(type_name) else {
            return DEFAULT_EQUALITY_SELECTIVITY;
        };
        let Some(stats) = table.fields.get(field) else {
            return DEFAULT_EQUALITY_SELECTIVITY;
        };
        let residual = (1.0 - stats.mcv.covered_mass()).max(0.0);
        match value {
            Some(v) => {
                if let Some(freq) = stats.mcv.frequency(v) {
                    return freq;
                }
                if let Some(sel) = stats.histogram.equality_selectivity(v) {
                    return (sel * residual).clamp(0.0, 1.0);
                }
                // No histogram: spread the residual over unlisted values
                let unlisted = stats.distinct.saturating_sub(stats.mcv.entries.len() as u64);
                if unlisted > 0 {
                    residual / unlisted as f64
                } else {
                    DEFAULT_EQUALITY_SELECTIVITY
                }
            }
            None => {
                if stats.distinct > 0 {
                    1.0 / stats.distinct as f64
                } else {
                    DEFAULT_EQUALITY_SELECTIVITY
                }
            }
        }
    }

    /// Selectivity of `lower ≤ field ≤ upper` (open bounds allowed).
    pub fn range_selectivity(
        &self,
        type_name: &str,
        field: &str,
        lower: Option<&TupleValue>,
        upper: Option<&TupleValue>,
    ) -> f64 {
        let Some(table) = self.table(type_name) else {
            return DEFAULT_RANGE_SELECTIVITY;
        };
        let Some(stats) = table.fields.get(field) else {
            return DEFAULT_RANGE_SELECTIVITY;
        };
        let residual = (1.0 - stats.mcv.covered_mass()).max(0.0);
        let Some(hist_sel) = stats.histogram.range_selectivity(lower, upper) else {
            return DEFAULT_RANGE_SELECTIVITY;
        };
        // MCV entries inside the range contribute their exact mass
        let mcv_sel: f64 = stats
            .mcv
            .entries
            .iter()
            .filter(|(v, _)| {
                lower.is_none_or(|lo| v >= lo) && upper.is_none_or(|hi| v <= hi)
            })
            .map(|(_, f)| f)
            .sum();
        (hist_sel * residual + mcv_sel).clamp(0.0, 1.0)
    }

    pub fn null_selectivity(&self, type_name: &str, field: &str) -> f64 {
        self.table(type_name)
            .and_then(|t| t.fields.get(field).map(|f| f.null_selectivity()))
            .unwrap_or(DEFAULT_EQUALITY_SELECTIVITY)
    }

    // ── Index counters (best-effort, from maintainers) ─────────────────

    pub fn index_entries(&self, index_name: &str) -> Option<IndexStatistics> {
        self.index_stats.get(index_name).map(|s| *s)
    }

    /// Apply an entry-count delta from an index maintainer.
    pub fn record_index_delta(&self, index_name: &str, entry_delta: i64, key_delta: i64) {
        let mut stats = self.index_stats.entry(index_name.to_string()).or_default();
        stats.entry_count = stats.entry_count.saturating_add_signed(entry_delta);
        stats.key_count = stats.key_count.saturating_add_signed(key_delta);
    }

    pub fn drop_index_stats(&self, index_name: &str) {
        self.index_stats.remove(index_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StatisticsStore {
        StatisticsStore::new(StatisticsConfig::default())
    }

    fn user_type() -> RecordType {
        RecordType::new("user", vec!["id", "age", "city"], vec!["id"])
    }

    fn users(n: i64) -> Vec<DynRecord> {
        (0..n)
            .map(|i| {
                DynRecord::new("user")
                    .with("id", i)
                    .with("age", 20 + (i % 50))
                    .with("city", if i % 10 == 0 { "metropolis" } else { "smallville" })
            })
            .collect()
    }

    #[test]
    fn test_analyze_row_and_distinct_counts() {
        let store = store();
        let ty = user_type();
        let records = users(1000);
        store.analyze(&ty, records.iter());

        assert_eq!(store.row_count("user"), Some(1000));
        let distinct_ages = store.distinct_values("user", "age").unwrap();
        assert!((45..=55).contains(&distinct_ages), "got {distinct_ages}");
        assert_eq!(store.distinct_values("user", "city"), Some(2));
    }

    #[test]
    fn test_equality_via_mcv() {
        let store = store();
        let ty = user_type();
        let records = users(1000);
        store.analyze(&ty, records.iter());

        let sel = store.equality_selectivity(
            "user",
            "city",
            Some(&TupleValue::String("metropolis".into())),
        );
        assert!((sel - 0.1).abs() < 0.05, "selectivity {sel} should be ~0.1");
    }

    #[test]
    fn test_range_selectivity_from_histogram() {
        let store = store();
        let ty = user_type();
        let records = users(1000);
        store.analyze(&ty, records.iter());

        let sel = store.range_selectivity(
            "user",
            "age",
            Some(&TupleValue::Int(20)),
            Some(&TupleValue::Int(44)),
        );
        assert!((sel - 0.5).abs() < 0.1, "selectivity {sel} should be ~0.5");
    }

    #[test]
    fn test_missing_stats_fall_back_to_defaults() {
        let store = store();
        assert_eq!(
            store.equality_selectivity("ghost", "x", None),
            DEFAULT_EQUALITY_SELECTIVITY
        );
        assert_eq!(
            store.range_selectivity("ghost", "x", None, None),
            DEFAULT_RANGE_SELECTIVITY
        );
        assert_eq!(store.row_count("ghost"), None);
    }

    #[test]
    fn test_null_selectivity() {
        let store = store();
        let ty = user_type();
        let mut records = users(90);
        for i in 0..10 {
            records.push(DynRecord::new("user").with("id", 1000 + i));
        }
        store.analyze(&ty, records.iter());
        let sel = store.null_selectivity("user", "age");
        assert!((sel - 0.1).abs() < 0.01, "null selectivity {sel} should be 0.1");
    }

    #[test]
    fn test_invalidate_drops_table() {
        let store = store();
        let ty = user_type();
        let records = users(10);
        store.analyze(&ty, records.iter());
        assert!(store.table("user").is_some());
        store.invalidate("user");
        assert!(store.table("user").is_none());
    }

    #[test]
    fn test_index_counters() {
        let store = store();
        store.record_index_delta("idx_age", 10, 5);
        store.record_index_delta("idx_age", -2, 0);
        let stats = store.index_entries("idx_age").unwrap();
        assert_eq!(stats.entry_count, 8);
        assert_eq!(stats.key_count, 5);
        assert!((stats.avg_entries_per_key() - 1.6).abs() < 1e-9);
        store.drop_index_stats("idx_age");
        assert!(store.index_entries("idx_age").is_none());
    }
}
