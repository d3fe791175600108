//! Ontology Storage and OWL 2 RL Reasoning
//!
//! The TBox/RBox persists under the `O` subspace with a fixed per-IRI
//! layout; asserted and inferred triples (with provenance) persist under
//! `T`. Forward chaining fires the RL rule catalog on every triple
//! write; deletion runs delete-and-rederive over the dependency graph;
//! `sameAs` equality lives in a persisted union-find.

pub mod dred;
pub mod materializer;
pub mod store;
pub mod triples;
pub mod union_find;

pub use materializer::{MaterializationStep, Owl2RlMaterializer, Reasoner, ReasonerConfig};
pub use store::{
    CardinalityRestriction, Ontology, OntologyMetadata, OntologyStore, PropertyCharacteristics,
    StoredClassDefinition, StoredPropertyDefinition,
};
pub use triples::{InferenceProvenance, StoredTriple, Triple, TripleStatus, TripleStore};
pub use union_find::SameAsIndex;

/// IRIs are plain interned strings at this layer.
pub type Iri = String;

/// Well-known vocabulary.
pub mod vocab {
    pub const RDF_TYPE: &str = "rdf:type";
    pub const RDFS_SUB_CLASS_OF: &str = "rdfs:subClassOf";
    pub const RDFS_SUB_PROPERTY_OF: &str = "rdfs:subPropertyOf";
    pub const OWL_EQUIVALENT_CLASS: &str = "owl:equivalentClass";
    pub const OWL_EQUIVALENT_PROPERTY: &str = "owl:equivalentProperty";
    pub const OWL_SAME_AS: &str = "owl:sameAs";
    pub const OWL_DIFFERENT_FROM: &str = "owl:differentFrom";
    pub const OWL_NOTHING: &str = "owl:Nothing";
    pub const OWL_THING: &str = "owl:Thing";
}
