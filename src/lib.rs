//! # Keystone
//!
//! A transactional record engine layering structured persistence, rich
//! secondary indexing, and a cost-based query optimizer over an
//! ordered, transactional key-value store.
//!
//! ## Architecture
//!
//! ```text
//! Query -> QueryAnalyzer -> Cascades (memo + rules) -> CostModel <- Statistics
//!      -> PreparedPlan (cached by fingerprint) -> PlanExecutor
//!      -> IndexSearcher -> KV range scans -> record fetches -> result stream
//!
//! Record mutation -> IndexMaintainers (per affected index)
//!                 -> KV writes in the same transaction
//!                 -> OWL 2 RL materializer (ontology-bound predicates)
//!                 -> inferred triples with provenance
//! ```
//!
//! Every persistent structure is a subspace layout over order-preserving
//! tuple keys: records as envelopes (inline or blob-chained), scalar and
//! covering indexes, bitmap/full-text/spatial indexes, flat and HNSW
//! vector indexes (optionally quantized), graph adjacency mirrors, and
//! the ontology TBox with its materialized hierarchies.
//!
//! ## Usage
//!
//! ```
//! use keystone::config::Config;
//! use keystone::engine::Engine;
//! use keystone::index::{IndexDescriptor, IndexKind};
//! use keystone::kv::MemoryKv;
//! use keystone::planner::{CompareOp, Predicate, Query};
//! use keystone::record::{DynRecord, RecordType};
//! use std::sync::Arc;
//!
//! let engine = Engine::new(Config::default(), Arc::new(MemoryKv::new()));
//! engine.register_record_type(RecordType::new("user", vec!["id", "age"], vec!["id"]));
//! engine.register_index(IndexDescriptor::new(
//!     "idx_age", vec!["age"], IndexKind::Scalar, vec!["user"],
//! )).unwrap();
//!
//! engine.save(&DynRecord::new("user").with("id", "u1").with("age", 25i64)).unwrap();
//! engine.save(&DynRecord::new("user").with("id", "u2").with("age", 30i64)).unwrap();
//!
//! let rows = engine.query(
//!     &Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 25i64)),
//! ).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `tuple`, `subspace` | order-preserving keys and the subspace tree |
//! | `kv` | transactional KV abstraction + in-memory store |
//! | `record`, `storage` | record types, codecs, envelope persistence |
//! | `index` | scalar/covering, bitmap, full-text, spatial, vector, graph |
//! | `stats` | reservoir, HyperLogLog++, histograms, MCV, selectivity |
//! | `planner` | Cascades memo, rules, cost model, plan cache, executor |
//! | `ontology` | TBox store, OWL 2 RL materializer, DRed, union-find |
//! | `engine` | the wired facade |

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod kv;
pub mod ontology;
pub mod planner;
pub mod record;
pub mod stats;
pub mod storage;
pub mod subspace;
pub mod tuple;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};

/// Initialize tracing for tests and examples; safe to call repeatedly.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
