//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - keystone.toml (default configuration)
//! - keystone.local.toml (git-ignored local overrides)
//! - Environment variables (KEYSTONE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # keystone.toml
//! [storage]
//! inline_limit = 16384
//! blob_chunk_size = 65536
//!
//! [planner]
//! timeout_ms = 250
//!
//! [statistics]
//! reservoir_size = 1024
//! hll_precision = 14
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! KEYSTONE_PLANNER__TIMEOUT_MS=1000
//! KEYSTONE_STATISTICS__HISTOGRAM_BUCKETS=64
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub traversal: TraversalConfig,
}

/// Item storage thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Records encoded larger than this are chunked into the blobs subspace
    #[serde(default = "default_inline_limit")]
    pub inline_limit: usize,

    /// Blob chunk size in bytes
    #[serde(default = "default_blob_chunk_size")]
    pub blob_chunk_size: usize,
}

fn default_inline_limit() -> usize {
    16 * 1024
}
fn default_blob_chunk_size() -> usize {
    64 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            inline_limit: default_inline_limit(),
            blob_chunk_size: default_blob_chunk_size(),
        }
    }
}

/// Planner cost weights and search limits.
///
/// The weights mirror PostgreSQL's planner defaults (seq_page_cost = 1,
/// random_page_cost = 4, cpu_tuple_cost = 0.01).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Cost weight for one index entry read
    #[serde(default = "default_index_read_weight")]
    pub index_read_weight: f64,

    /// Cost weight for one record fetch (random access)
    #[serde(default = "default_record_fetch_weight")]
    pub record_fetch_weight: f64,

    /// Cost weight for evaluating a residual predicate on one row
    #[serde(default = "default_post_filter_weight")]
    pub post_filter_weight: f64,

    /// Cost weight multiplier for n*log2(n) sort work
    #[serde(default = "default_sort_weight")]
    pub sort_weight: f64,

    /// Cost weight for initiating one KV range scan
    #[serde(default = "default_range_initiation_weight")]
    pub range_initiation_weight: f64,

    /// Plan search time budget in milliseconds
    #[serde(default = "default_planning_timeout_ms")]
    pub timeout_ms: u64,

    /// Prepared plan cache capacity (entries)
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: usize,

    /// Minimum feedback samples before drift detection fires
    #[serde(default = "default_drift_min_samples")]
    pub drift_min_samples: usize,

    /// Relative misestimation ratio that counts as drift
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
}

fn default_index_read_weight() -> f64 {
    1.0
}
fn default_record_fetch_weight() -> f64 {
    4.0
}
fn default_post_filter_weight() -> f64 {
    0.01
}
fn default_sort_weight() -> f64 {
    0.02
}
fn default_range_initiation_weight() -> f64 {
    2.0
}
fn default_planning_timeout_ms() -> u64 {
    250
}
fn default_plan_cache_capacity() -> usize {
    512
}
fn default_drift_min_samples() -> usize {
    16
}
fn default_drift_threshold() -> f64 {
    4.0
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            index_read_weight: default_index_read_weight(),
            record_fetch_weight: default_record_fetch_weight(),
            post_filter_weight: default_post_filter_weight(),
            sort_weight: default_sort_weight(),
            range_initiation_weight: default_range_initiation_weight(),
            timeout_ms: default_planning_timeout_ms(),
            plan_cache_capacity: default_plan_cache_capacity(),
            drift_min_samples: default_drift_min_samples(),
            drift_threshold: default_drift_threshold(),
        }
    }
}

/// Statistics collection targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Reservoir sample size per field
    #[serde(default = "default_reservoir_size")]
    pub reservoir_size: usize,

    /// HyperLogLog precision p (register count = 2^p); one of 12, 14, 16
    #[serde(default = "default_hll_precision")]
    pub hll_precision: u8,

    /// Number of equi-depth histogram buckets
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: usize,

    /// Maximum number of most-common values tracked per field
    #[serde(default = "default_mcv_max_size")]
    pub mcv_max_size: usize,

    /// Minimum frequency for a value to enter the MCV list
    #[serde(default = "default_mcv_min_frequency")]
    pub mcv_min_frequency: f64,
}

fn default_reservoir_size() -> usize {
    1024
}
fn default_hll_precision() -> u8 {
    14
}
fn default_histogram_buckets() -> usize {
    32
}
fn default_mcv_max_size() -> usize {
    16
}
fn default_mcv_min_frequency() -> f64 {
    0.01
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            reservoir_size: default_reservoir_size(),
            hll_precision: default_hll_precision(),
            histogram_buckets: default_histogram_buckets(),
            mcv_max_size: default_mcv_max_size(),
            mcv_min_frequency: default_mcv_min_frequency(),
        }
    }
}

/// Index build and maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Items processed per transaction during bulk index builds
    #[serde(default = "default_build_batch_size")]
    pub build_batch_size: usize,

    /// Node-touch limit for a single inline HNSW mutation
    #[serde(default = "default_hnsw_inline_limit")]
    pub hnsw_inline_limit: usize,

    /// Items processed between cooperative cancellation checks
    #[serde(default = "default_yield_batch_size")]
    pub yield_batch_size: usize,
}

fn default_build_batch_size() -> usize {
    256
}
fn default_hnsw_inline_limit() -> usize {
    500
}
fn default_yield_batch_size() -> usize {
    1024
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            build_batch_size: default_build_batch_size(),
            hnsw_inline_limit: default_hnsw_inline_limit(),
            yield_batch_size: default_yield_batch_size(),
        }
    }
}

/// Graph traversal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalConfig {
    /// Nodes expanded per transaction batch during BFS
    #[serde(default = "default_bfs_batch_size")]
    pub bfs_batch_size: usize,

    /// Default per-depth node budget
    #[serde(default = "default_depth_budget")]
    pub depth_budget: usize,

    /// Default page size for paginated traversal
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_bfs_batch_size() -> usize {
    512
}
fn default_depth_budget() -> usize {
    10_000
}
fn default_page_size() -> usize {
    100
}

impl Default for TraversalConfig {
    fn default() -> Self {
        TraversalConfig {
            bfs_batch_size: default_bfs_batch_size(),
            depth_budget: default_depth_budget(),
            page_size: default_page_size(),
        }
    }
}

impl Config {
    /// Load configuration from keystone.toml, keystone.local.toml, and
    /// KEYSTONE_* environment variables (later sources win).
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("keystone.toml"))
            .merge(Toml::file("keystone.local.toml"))
            .merge(Env::prefixed("KEYSTONE_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.inline_limit, 16 * 1024);
        assert_eq!(config.statistics.hll_precision, 14);
        assert_eq!(config.planner.record_fetch_weight, 4.0);
        assert_eq!(config.index.hnsw_inline_limit, 500);
    }

    #[test]
    fn test_toml_overrides() {
        let config: Config = Figment::new()
            .merge(Toml::string(
                r#"
                [planner]
                timeout_ms = 1000

                [statistics]
                histogram_buckets = 64
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(config.planner.timeout_ms, 1000);
        assert_eq!(config.statistics.histogram_buckets, 64);
        // Untouched sections keep defaults
        assert_eq!(config.statistics.reservoir_size, 1024);
        assert_eq!(config.traversal.page_size, 100);
    }
}
