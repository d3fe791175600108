//! Triple Store with Provenance
//!
//! Asserted and inferred triples persist per ontology:
//!
//! - `T / <ont> / s / <subject> / <predicate> / <object> -> StoredTriple`
//! - `T / <ont> / d / <antecedent-key> / <dependent-key> -> ∅`
//!
//! An inferred triple carries one provenance entry per derivation:
//! the rule, the antecedent triples, a timestamp, a validity flag, and
//! the derivation depth. A triple is discoverable iff at least one
//! valid derivation exists (or it is asserted). The dependency index
//! maps each triple to its direct dependents, which is what
//! delete-and-rederive walks.

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::ontology::Iri;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A `(subject, predicate, object)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Iri,
    pub predicate: Iri,
    pub object: Iri,
}

impl Triple {
    pub fn new(
        subject: impl Into<Iri>,
        predicate: impl Into<Iri>,
        object: impl Into<Iri>,
    ) -> Self {
        Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    fn key_tuple(&self) -> Tuple {
        let mut t = Tuple::from_single(self.subject.as_str());
        t.push(self.predicate.as_str());
        t.push(self.object.as_str());
        t
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// Lifecycle of a stored triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripleStatus {
    Asserted,
    Inferred,
    TentativelyDeleted,
    Rederived,
    Deleted,
}

/// One derivation of an inferred triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceProvenance {
    pub rule: String,
    pub antecedents: Vec<Triple>,
    pub inferred_at: i64,
    pub valid: bool,
    pub depth: u32,
}

impl InferenceProvenance {
    pub fn new(rule: &str, antecedents: Vec<Triple>, depth: u32) -> Self {
        InferenceProvenance {
            rule: rule.to_string(),
            antecedents,
            inferred_at: Utc::now().timestamp_millis(),
            valid: true,
            depth,
        }
    }
}

/// The persisted form of a triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTriple {
    pub triple: Triple,
    pub asserted: bool,
    pub status: TripleStatus,
    pub provenance: Vec<InferenceProvenance>,
}

impl StoredTriple {
    /// Discoverable = asserted, or at least one valid derivation, and
    /// not (tentatively) deleted.
    pub fn is_visible(&self) -> bool {
        match self.status {
            TripleStatus::Deleted | TripleStatus::TentativelyDeleted => false,
            _ => self.asserted || self.provenance.iter().any(|p| p.valid),
        }
    }
}

/// Per-ontology triple storage.
pub struct TripleStore {
    triples: Subspace,
    dependents: Subspace,
}

impl TripleStore {
    pub fn new(root: &Subspace, ontology: &str) -> Self {
        let base = root.child("T").child(ontology);
        TripleStore {
            triples: base.child("s"),
            dependents: base.child("d"),
        }
    }

    fn key(&self, triple: &Triple) -> Vec<u8> {
        self.triples.pack(&triple.key_tuple())
    }

    pub fn get(&self, triple: &Triple, reader: &dyn KvRead) -> Result<Option<StoredTriple>> {
        match reader.get(&self.key(triple))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| Error::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, stored: &StoredTriple, tx: &mut dyn KvTransaction) -> Result<()> {
        let bytes = bincode::serialize(stored).map_err(|e| Error::Codec(e.to_string()))?;
        tx.set(&self.key(&stored.triple), &bytes)
    }

    pub fn remove(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<()> {
        tx.clear(&self.key(triple))
    }

    /// Record a base (asserted) triple.
    pub fn assert_base(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<StoredTriple> {
        let stored = match self.get(triple, &*tx)? {
            Some(mut existing) => {
                existing.asserted = true;
                if existing.status == TripleStatus::Deleted {
                    existing.status = TripleStatus::Asserted;
                }
                existing
            }
            None => StoredTriple {
                triple: triple.clone(),
                asserted: true,
                status: TripleStatus::Asserted,
                provenance: Vec::new(),
            },
        };
        self.put(&stored, tx)?;
        Ok(stored)
    }

    /// Record one derivation of an inferred triple and index the
    /// dependency edges. An existing triple accumulates the new
    /// provenance entry; a rederived triple returns to visibility.
    pub fn add_inference(
        &self,
        triple: &Triple,
        provenance: InferenceProvenance,
        tx: &mut dyn KvTransaction,
    ) -> Result<bool> {
        // An inference cannot be its own antecedent
        if provenance.antecedents.iter().any(|a| a == triple) {
            return Err(Error::DependencyCycle(triple.to_string()));
        }
        for antecedent in &provenance.antecedents {
            self.add_dependency(antecedent, triple, tx)?;
        }
        let (stored, fresh) = match self.get(triple, &*tx)? {
            Some(mut existing) => {
                let duplicate = existing
                    .provenance
                    .iter()
                    .any(|p| p.rule == provenance.rule && p.antecedents == provenance.antecedents);
                if !duplicate {
                    existing.provenance.push(provenance);
                }
                if existing.status == TripleStatus::Deleted
                    || existing.status == TripleStatus::TentativelyDeleted
                {
                    existing.status = TripleStatus::Rederived;
                }
                (existing, false)
            }
            None => (
                StoredTriple {
                    triple: triple.clone(),
                    asserted: false,
                    status: TripleStatus::Inferred,
                    provenance: vec![provenance],
                },
                true,
            ),
        };
        self.put(&stored, tx)?;
        Ok(fresh)
    }

    // ── Dependency graph ───────────────────────────────────────────────

    fn dependency_key(&self, antecedent: &Triple, dependent: &Triple) -> Vec<u8> {
        let mut t = Tuple::empty();
        t.push(crate::tuple::TupleValue::Nested(antecedent.key_tuple().0));
        t.push(crate::tuple::TupleValue::Nested(dependent.key_tuple().0));
        self.dependents.pack(&t)
    }

    fn add_dependency(
        &self,
        antecedent: &Triple,
        dependent: &Triple,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        tx.set(&self.dependency_key(antecedent, dependent), &[])
    }

    /// Direct dependents of a triple.
    pub fn dependents_of(&self, triple: &Triple, reader: &dyn KvRead) -> Result<BTreeSet<Triple>> {
        let space = self
            .dependents
            .subspace(&Tuple::new(vec![crate::tuple::TupleValue::Nested(
                triple.key_tuple().0,
            )]));
        let (begin, end) = space.range();
        let mut out = BTreeSet::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            let suffix = space.unpack(&key)?;
            let Some(crate::tuple::TupleValue::Nested(parts)) = suffix.get(0) else {
                return Err(Error::InvalidEncoding("bad dependency key".into()));
            };
            out.insert(triple_from_parts(parts)?);
        }
        Ok(out)
    }

    /// Drop every dependency edge pointing at a dependent (used when
    /// the dependent is finally deleted).
    pub fn clear_dependencies_on(
        &self,
        antecedent: &Triple,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let space = self
            .dependents
            .subspace(&Tuple::new(vec![crate::tuple::TupleValue::Nested(
                antecedent.key_tuple().0,
            )]));
        let (begin, end) = space.range();
        tx.clear_range(&begin, &end)
    }

    // ── Scans ──────────────────────────────────────────────────────────

    /// Visible triples with the given subject (and predicate, when
    /// provided).
    pub fn scan_subject(
        &self,
        subject: &str,
        predicate: Option<&str>,
        reader: &dyn KvRead,
    ) -> Result<Vec<StoredTriple>> {
        let mut space = self.triples.child(subject);
        if let Some(predicate) = predicate {
            space = space.child(predicate);
        }
        self.scan_space(&space, reader)
    }

    /// Every visible triple with the given predicate and object
    /// (full scan; used by subclass re-typing).
    pub fn scan_predicate_object(
        &self,
        predicate: &str,
        object: &str,
        reader: &dyn KvRead,
    ) -> Result<Vec<StoredTriple>> {
        let (begin, end) = self.triples.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (_, value) = pair?;
            let stored: StoredTriple =
                bincode::deserialize(&value).map_err(|e| Error::Codec(e.to_string()))?;
            if stored.is_visible()
                && stored.triple.predicate == predicate
                && stored.triple.object == object
            {
                out.push(stored);
            }
        }
        Ok(out)
    }

    /// Every stored triple, visible or not (DRed bookkeeping).
    pub fn scan_all(&self, reader: &dyn KvRead) -> Result<Vec<StoredTriple>> {
        let (begin, end) = self.triples.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (_, value) = pair?;
            out.push(bincode::deserialize(&value).map_err(|e| Error::Codec(e.to_string()))?);
        }
        Ok(out)
    }

    fn scan_space(&self, space: &Subspace, reader: &dyn KvRead) -> Result<Vec<StoredTriple>> {
        let (begin, end) = space.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (_, value) = pair?;
            let stored: StoredTriple =
                bincode::deserialize(&value).map_err(|e| Error::Codec(e.to_string()))?;
            if stored.is_visible() {
                out.push(stored);
            }
        }
        Ok(out)
    }
}

fn triple_from_parts(parts: &[crate::tuple::TupleValue]) -> Result<Triple> {
    let get = |i: usize| -> Result<Iri> {
        parts
            .get(i)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::InvalidEncoding("bad triple key".into()))
    };
    Ok(Triple { subject: get(0)?, predicate: get(1)?, object: get(2)? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> TripleStore {
        TripleStore::new(&Subspace::root(), "ont")
    }

    #[test]
    fn test_assert_and_get() {
        let kv = MemoryKv::new();
        let store = store();
        let t = Triple::new("alice", "rdf:type", "Employee");
        kv.run(|tx| store.assert_base(&t, tx).map(|_| ())).unwrap();

        let tx = kv.begin();
        let stored = store.get(&t, &tx).unwrap().unwrap();
        assert!(stored.asserted);
        assert!(stored.is_visible());
        assert_eq!(stored.status, TripleStatus::Asserted);
    }

    #[test]
    fn test_inference_with_provenance() {
        let kv = MemoryKv::new();
        let store = store();
        let base = Triple::new("alice", "rdf:type", "Employee");
        let inferred = Triple::new("alice", "rdf:type", "Person");
        kv.run(|tx| {
            store.assert_base(&base, tx)?;
            store.add_inference(
                &inferred,
                InferenceProvenance::new("cax-sco", vec![base.clone()], 1),
                tx,
            )?;
            Ok(())
        })
        .unwrap();

        let tx = kv.begin();
        let stored = store.get(&inferred, &tx).unwrap().unwrap();
        assert!(!stored.asserted);
        assert!(stored.is_visible());
        assert_eq!(stored.provenance.len(), 1);
        assert_eq!(stored.provenance[0].rule, "cax-sco");
        assert_eq!(stored.provenance[0].antecedents, vec![base.clone()]);

        let dependents = store.dependents_of(&base, &tx).unwrap();
        assert!(dependents.contains(&inferred));
    }

    #[test]
    fn test_duplicate_provenance_not_accumulated() {
        let kv = MemoryKv::new();
        let store = store();
        let base = Triple::new("a", "p", "b");
        let inferred = Triple::new("b", "q", "a");
        kv.run(|tx| {
            store.add_inference(
                &inferred,
                InferenceProvenance::new("prp-inv1", vec![base.clone()], 1),
                tx,
            )?;
            store.add_inference(
                &inferred,
                InferenceProvenance::new("prp-inv1", vec![base.clone()], 1),
                tx,
            )?;
            Ok(())
        })
        .unwrap();
        let tx = kv.begin();
        let stored = store.get(&inferred, &tx).unwrap().unwrap();
        assert_eq!(stored.provenance.len(), 1);
    }

    #[test]
    fn test_self_antecedent_rejected() {
        let kv = MemoryKv::new();
        let store = store();
        let t = Triple::new("a", "p", "b");
        let err = kv
            .run(|tx| {
                store.add_inference(
                    &t,
                    InferenceProvenance::new("bogus", vec![t.clone()], 1),
                    tx,
                )
            })
            .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
    }

    #[test]
    fn test_scans() {
        let kv = MemoryKv::new();
        let store = store();
        kv.run(|tx| {
            store.assert_base(&Triple::new("alice", "rdf:type", "Employee"), tx)?;
            store.assert_base(&Triple::new("alice", "worksFor", "acme"), tx)?;
            store.assert_base(&Triple::new("bob", "rdf:type", "Employee"), tx)?;
            Ok(())
        })
        .unwrap();

        let tx = kv.begin();
        assert_eq!(store.scan_subject("alice", None, &tx).unwrap().len(), 2);
        assert_eq!(
            store
                .scan_subject("alice", Some("rdf:type"), &tx)
                .unwrap()
                .len(),
            1
        );
        let employees = store
            .scan_predicate_object("rdf:type", "Employee", &tx)
            .unwrap();
        assert_eq!(employees.len(), 2);
    }

    #[test]
    fn test_deleted_not_visible() {
        let kv = MemoryKv::new();
        let store = store();
        let t = Triple::new("a", "p", "b");
        kv.run(|tx| {
            let mut stored = store.assert_base(&t, tx)?;
            stored.status = TripleStatus::Deleted;
            stored.asserted = false;
            store.put(&stored, tx)
        })
        .unwrap();
        let tx = kv.begin();
        assert!(!store.get(&t, &tx).unwrap().unwrap().is_visible());
        assert!(store.scan_subject("a", None, &tx).unwrap().is_empty());
    }
}
