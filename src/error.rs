//! Engine Error Types
//!
//! One crate-wide error enum partitioned by kind: invalid input, not found,
//! constraint violation, resource exhaustion, encoding/format, internal.
//! Index maintainers never recover locally; any maintainer failure aborts
//! the enclosing transaction.

use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    // ── Invalid input ──────────────────────────────────────────────────

    /// Malformed or unsupported query construct
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Vector operation rejected (dimension mismatch, non-positive k, ...)
    #[error("Vector error: {0}")]
    Vector(String),

    /// Traversal cursor failed validation
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Unsupported operator for the given index kind
    #[error("Operator {op} is not supported by index '{index}'")]
    UnsupportedOperator { index: String, op: String },

    // ── Not found ──────────────────────────────────────────────────────

    /// Record type was never registered
    #[error("Record type '{0}' is not registered")]
    UnknownRecordType(String),

    /// Field name does not exist on the record type
    #[error("Field '{field}' does not exist on record type '{record_type}'")]
    UnknownField { record_type: String, field: String },

    /// Index name does not exist
    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    /// Record not found by primary key
    #[error("Record of type '{record_type}' with key {key} not found")]
    RecordNotFound { record_type: String, key: String },

    /// Ontology IRI not present in the store
    #[error("Ontology '{0}' not found")]
    OntologyNotFound(String),

    // ── Constraint violation ───────────────────────────────────────────

    /// OWL consistency check failed; aborts the enclosing transaction
    #[error("Ontology inconsistency ({rule}): {triple}")]
    Inconsistency { rule: &'static str, triple: String },

    /// Unique index rejected a duplicate key
    #[error("Unique index '{index}' violated by key {key}")]
    UniqueViolation { index: String, key: String },

    // ── Resource exhaustion ────────────────────────────────────────────

    /// The 5-second host transaction lifetime was exceeded
    #[error("Transaction lifetime exceeded after {elapsed_ms} ms")]
    TransactionExpired { elapsed_ms: u64 },

    /// Transaction operation budget was exceeded
    #[error("Transaction operation budget exceeded: {used} ops, budget {budget}")]
    OpBudgetExceeded { budget: usize, used: usize },

    /// A single HNSW mutation would touch too many nodes for one transaction
    #[error(
        "HNSW mutation would touch {nodes} nodes (inline limit {limit}); \
         use the batched online indexer"
    )]
    GraphTooLargeForInline { nodes: usize, limit: usize },

    /// Plan search exceeded its time budget with no complete plan
    #[error("Query planning timed out after {elapsed_ms} ms")]
    PlanningTimeout { elapsed_ms: u64 },

    /// Caller-requested cancellation
    #[error("Operation cancelled")]
    Cancelled,

    // ── Encoding / format ──────────────────────────────────────────────

    /// Bytes were not produced by this subspace's tuple encoding
    #[error("Invalid tuple encoding: {0}")]
    InvalidEncoding(String),

    /// Envelope version byte is unknown to this reader
    #[error("Unsupported envelope version {0}")]
    UnsupportedEnvelope(u8),

    /// Stored quantizer codebook disagrees with the requested parameters
    #[error("Quantizer parameter mismatch: {0}")]
    QuantizerParamsMismatch(String),

    /// Record payload failed to decode
    #[error("Record codec error: {0}")]
    Codec(String),

    // ── Internal invariant violations ──────────────────────────────────

    /// Memo bookkeeping violated an invariant; indicates a bug
    #[error("Memo inconsistency: {0}")]
    MemoInconsistency(String),

    /// Optimized group has no physical winner; indicates a bug
    #[error("No winner recorded for explored group {0}")]
    WinnerMissing(usize),

    /// Derivation bookkeeping produced a cycle between base triples
    #[error("Dependency graph cycle involving {0}")]
    DependencyCycle(String),

    /// Catch-all internal invariant failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when retrying at a coarser granularity (split-and-resume) can
    /// succeed. Used by bulk operations to decide whether to checkpoint
    /// and continue in a fresh transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransactionExpired { .. } | Error::OpBudgetExceeded { .. }
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransactionExpired { elapsed_ms: 5001 }.is_retryable());
        assert!(Error::OpBudgetExceeded { budget: 10, used: 11 }.is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::InvalidEncoding("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::GraphTooLargeForInline { nodes: 612, limit: 500 };
        let msg = err.to_string();
        assert!(msg.contains("612"));
        assert!(msg.contains("batched online indexer"));
    }
}
