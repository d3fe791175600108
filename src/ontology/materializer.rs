//! OWL 2 RL Materializer
//!
//! Forward chaining over the RL rule catalog, partitioned by strategy:
//!
//! - materialized at write: `cax-sco`, `cax-eqc1/2`, `prp-spo1`,
//!   `prp-eqp1/2`, `prp-inv1/2`, `prp-symp`, `prp-dom`, `prp-rng`,
//!   `scm-sco`, `scm-spo`, `scm-eqc1`, `scm-eqp1` (runtime
//!   `subClassOf`/`subPropertyOf`/`equivalentClass`/`equivalentProperty`
//!   axioms extend the stored hierarchies and re-derive affected
//!   triples);
//! - rewritten at query time: `prp-trp` (transitive closure) and
//!   `prp-spo2` (property chains), served by [`Reasoner`];
//! - routed through the union-find: `eq-ref/sym/trans/rep-*`;
//! - consistency checks that abort the transaction: `eq-diff1`,
//!   `prp-irp`, `prp-asyp`, `prp-pdw`, `prp-fp`, `prp-ifp`,
//!   `cls-nothing1`, `cls-com`, `cls-maxc1/2`, `cls-maxqc1/2`, `cax-dw`.
//!
//! Every inferred triple carries `(rule, antecedents)` provenance, so a
//! materialized triple is discoverable iff at least one valid
//! derivation exists, and deletion maintains the set through DRed.
//!
//! The forward chainer ticks its [`OpGuard`] per frontier entry, and
//! the `begin_assert`/`materialize` pair lets a caller drain the
//! frontier across transactions with the frontier as the checkpoint.

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, OpGuard};
use crate::ontology::dred::{self, DredOutcome};
use crate::ontology::store::OntologyStore;
use crate::ontology::triples::{InferenceProvenance, Triple, TripleStore};
use crate::ontology::union_find::SameAsIndex;
use crate::ontology::{vocab, Iri};
use crate::subspace::Subspace;
use std::collections::{BTreeSet, VecDeque};

/// Reasoner tuning knobs.
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    /// Fire the consistency-check rules on every write
    pub check_consistency: bool,
    /// Derivation depth cap for the forward chainer
    pub max_depth: u32,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        ReasonerConfig { check_consistency: true, max_depth: 16 }
    }
}

/// One in-flight materialization: the work frontier plus everything
/// inferred so far. The frontier carried between transactions is the
/// checkpoint a batched caller resumes from.
#[derive(Debug, Default)]
pub struct MaterializationStep {
    frontier: VecDeque<(Triple, u32)>,
    pub inferred: Vec<Triple>,
}

impl MaterializationStep {
    pub fn is_done(&self) -> bool {
        self.frontier.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.frontier.len()
    }
}

/// Write-side forward chainer for one ontology.
pub struct Owl2RlMaterializer<'a> {
    ontology: Iri,
    store: &'a OntologyStore,
    triples: TripleStore,
    same_as: SameAsIndex,
    config: ReasonerConfig,
    guard: OpGuard,
}

impl<'a> Owl2RlMaterializer<'a> {
    pub fn new(
        root: &Subspace,
        store: &'a OntologyStore,
        ontology: impl Into<Iri>,
        config: ReasonerConfig,
    ) -> Self {
        let ontology = ontology.into();
        let same_as = SameAsIndex::new(&store.same_as_space(&ontology));
        Owl2RlMaterializer {
            triples: TripleStore::new(root, &ontology),
            same_as,
            ontology,
            store,
            config,
            guard: OpGuard::unbounded(),
        }
    }

    /// Attach a cancellation/deadline guard, checked cooperatively as
    /// the forward chainer drains its frontier.
    pub fn with_guard(mut self, guard: OpGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn triples(&self) -> &TripleStore {
        &self.triples
    }

    pub fn same_as(&self) -> &SameAsIndex {
        &self.same_as
    }

    /// Assert a base triple and materialize its consequences in the
    /// caller's transaction. Returns the newly inferred triples.
    pub fn assert(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<Vec<Triple>> {
        let mut step = self.begin_assert(triple, tx)?;
        self.materialize(&mut step, usize::MAX, tx)?;
        Ok(step.inferred)
    }

    /// First phase of an assertion: consistency checks, the base write,
    /// schema-axiom handling, and the initial inference frontier. The
    /// returned step is the checkpoint a batched caller carries across
    /// transactions.
    pub fn begin_assert(
        &self,
        triple: &Triple,
        tx: &mut dyn KvTransaction,
    ) -> Result<MaterializationStep> {
        let mut guard = self.guard.clone();
        guard.check()?;
        if self.config.check_consistency {
            self.check_consistency(triple, tx)?;
        }
        self.triples.assert_base(triple, tx)?;

        let mut step = MaterializationStep::default();
        match triple.predicate.as_str() {
            vocab::RDFS_SUB_CLASS_OF => {
                self.on_subclass_axiom(triple, tx, &mut step, &mut guard)?;
            }
            vocab::RDFS_SUB_PROPERTY_OF => {
                self.on_subproperty_axiom(triple, tx, &mut step, &mut guard)?;
            }
            vocab::OWL_EQUIVALENT_CLASS => {
                self.on_equivalent_class_axiom(triple, tx, &mut step, &mut guard)?;
            }
            vocab::OWL_EQUIVALENT_PROPERTY => {
                self.on_equivalent_property_axiom(triple, tx, &mut step, &mut guard)?;
            }
            vocab::OWL_SAME_AS => {
                self.same_as.union(&triple.subject, &triple.object, tx)?;
            }
            _ => {
                step.frontier.push_back((triple.clone(), 0));
            }
        }
        Ok(step)
    }

    /// Drain up to `max_steps` frontier entries, materializing their
    /// consequences into the given transaction. Returns true when the
    /// frontier is exhausted.
    pub fn materialize(
        &self,
        step: &mut MaterializationStep,
        max_steps: usize,
        tx: &mut dyn KvTransaction,
    ) -> Result<bool> {
        let mut guard = self.guard.clone();
        let mut taken = 0usize;
        while taken < max_steps {
            let Some((current, depth)) = step.frontier.pop_front() else { break };
            taken += 1;
            guard.tick()?;
            if depth >= self.config.max_depth {
                tracing::debug!(triple = %current, depth, "derivation_depth_capped");
                continue;
            }
            for (target, rule, antecedents) in self.direct_consequences(&current, &*tx)? {
                if self.config.check_consistency {
                    self.check_consistency(&target, tx)?;
                }
                let fresh = self.triples.add_inference(
                    &target,
                    InferenceProvenance::new(rule, antecedents, depth + 1),
                    tx,
                )?;
                if fresh {
                    step.inferred.push(target.clone());
                    step.frontier.push_back((target, depth + 1));
                }
            }
        }
        if step.frontier.is_empty() {
            tracing::trace!(inferred = step.inferred.len(), "triples_materialized");
        }
        Ok(step.frontier.is_empty())
    }

    /// Retract a base triple; DRed maintains the inferred set, and a
    /// retracted hierarchy axiom also leaves the materialized
    /// hierarchy.
    pub fn retract(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<DredOutcome> {
        self.retract_axiom_edges(triple, tx)?;
        let mut guard = self.guard.clone();
        dred::delete_base(&self.triples, triple, tx, &mut guard)
    }

    /// Undo the hierarchy effect of a retracted schema axiom (the
    /// triple-level maintenance itself is DRed's job).
    pub fn retract_axiom_edges(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<()> {
        match triple.predicate.as_str() {
            vocab::RDFS_SUB_CLASS_OF => {
                self.store
                    .remove_subclass_edge(&self.ontology, &triple.subject, &triple.object, tx)?;
            }
            vocab::RDFS_SUB_PROPERTY_OF => {
                self.store.remove_subproperty_edge(
                    &self.ontology,
                    &triple.subject,
                    &triple.object,
                    tx,
                )?;
            }
            vocab::OWL_EQUIVALENT_CLASS => {
                self.store.remove_equivalent_class_edge(
                    &self.ontology,
                    &triple.subject,
                    &triple.object,
                    tx,
                )?;
            }
            vocab::OWL_EQUIVALENT_PROPERTY => {
                self.store.remove_equivalent_property_edge(
                    &self.ontology,
                    &triple.subject,
                    &triple.object,
                    tx,
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    // ── Rule firing ────────────────────────────────────────────────────

    /// Immediate consequences of one triple, each tagged with its rule
    /// and antecedent set.
    fn direct_consequences(
        &self,
        triple: &Triple,
        reader: &dyn KvRead,
    ) -> Result<Vec<(Triple, &'static str, Vec<Triple>)>> {
        let mut out = Vec::new();
        if triple.predicate == vocab::RDF_TYPE {
            // cax-sco (equivalences are folded into the materialized
            // hierarchy, covering cax-eqc1/2)
            for class in self.store.super_classes(&self.ontology, &triple.object, reader)? {
                out.push((
                    Triple::new(triple.subject.clone(), vocab::RDF_TYPE, class.clone()),
                    "cax-sco",
                    vec![
                        triple.clone(),
                        Triple::new(triple.object.clone(), vocab::RDFS_SUB_CLASS_OF, class),
                    ],
                ));
            }
            return Ok(out);
        }

        let Some(property) =
            self.store.get_property(&self.ontology, &triple.predicate, reader)?
        else {
            return Ok(out);
        };

        // prp-dom / prp-rng
        if let Some(domain) = &property.domain {
            out.push((
                Triple::new(triple.subject.clone(), vocab::RDF_TYPE, domain.clone()),
                "prp-dom",
                vec![triple.clone()],
            ));
        }
        if let Some(range) = &property.range {
            out.push((
                Triple::new(triple.object.clone(), vocab::RDF_TYPE, range.clone()),
                "prp-rng",
                vec![triple.clone()],
            ));
        }
        // prp-symp
        if property.characteristics.symmetric && triple.subject != triple.object {
            out.push((
                Triple::new(
                    triple.object.clone(),
                    triple.predicate.clone(),
                    triple.subject.clone(),
                ),
                "prp-symp",
                vec![triple.clone()],
            ));
        }
        // prp-inv1/2
        if let Some(inverse) =
            self.store.inverse_of(&self.ontology, &triple.predicate, reader)?
        {
            out.push((
                Triple::new(triple.object.clone(), inverse, triple.subject.clone()),
                "prp-inv1",
                vec![triple.clone()],
            ));
        }
        // prp-spo1 (equivalent properties are folded into the
        // materialized hierarchy, covering prp-eqp1/2)
        for parent in
            self.store.super_properties(&self.ontology, &triple.predicate, reader)?
        {
            out.push((
                Triple::new(triple.subject.clone(), parent.clone(), triple.object.clone()),
                "prp-spo1",
                vec![
                    triple.clone(),
                    Triple::new(
                        triple.predicate.clone(),
                        vocab::RDFS_SUB_PROPERTY_OF,
                        parent,
                    ),
                ],
            ));
        }
        Ok(out)
    }

    /// Runtime subclass axiom: extend the stored hierarchy, emit
    /// scm-sco triples, and re-type affected instances.
    fn on_subclass_axiom(
        &self,
        axiom: &Triple,
        tx: &mut dyn KvTransaction,
        step: &mut MaterializationStep,
        guard: &mut OpGuard,
    ) -> Result<()> {
        self.store
            .add_subclass_edge(&self.ontology, &axiom.subject, &axiom.object, tx)?;

        // scm-sco: the transitive closure as triples
        for ancestor in self.store.super_classes(&self.ontology, &axiom.subject, &*tx)? {
            guard.tick()?;
            if ancestor == axiom.object {
                continue;
            }
            let derived =
                Triple::new(axiom.subject.clone(), vocab::RDFS_SUB_CLASS_OF, ancestor.clone());
            let fresh = self.triples.add_inference(
                &derived,
                InferenceProvenance::new(
                    "scm-sco",
                    vec![
                        axiom.clone(),
                        Triple::new(axiom.object.clone(), vocab::RDFS_SUB_CLASS_OF, ancestor),
                    ],
                    1,
                ),
                tx,
            )?;
            if fresh {
                step.inferred.push(derived);
            }
        }

        // Re-apply typing to every instance of the subclass
        for instance in
            self.triples
                .scan_predicate_object(vocab::RDF_TYPE, &axiom.subject, &*tx)?
        {
            guard.tick()?;
            step.frontier.push_back((instance.triple.clone(), 0));
        }
        Ok(())
    }

    /// Runtime class equivalence: both directions enter the stored
    /// hierarchy, the scm-eqc subclass pair is emitted, and instances
    /// of either class re-type through the refreshed closure, which is
    /// what fires cax-eqc1/2.
    fn on_equivalent_class_axiom(
        &self,
        axiom: &Triple,
        tx: &mut dyn KvTransaction,
        step: &mut MaterializationStep,
        guard: &mut OpGuard,
    ) -> Result<()> {
        self.store.add_equivalent_class_edge(
            &self.ontology,
            &axiom.subject,
            &axiom.object,
            tx,
        )?;

        // scm-eqc1: equivalence implies both subclass directions. The
        // refreshed closure materializes as triples so a later
        // retraction can walk the full dependency chain.
        for class in [&axiom.subject, &axiom.object] {
            for ancestor in self.store.super_classes(&self.ontology, class, &*tx)? {
                guard.tick()?;
                let derived =
                    Triple::new(class.clone(), vocab::RDFS_SUB_CLASS_OF, ancestor);
                let fresh = self.triples.add_inference(
                    &derived,
                    InferenceProvenance::new("scm-eqc1", vec![axiom.clone()], 1),
                    tx,
                )?;
                if fresh {
                    step.inferred.push(derived);
                }
            }
        }

        for class in [&axiom.subject, &axiom.object] {
            for instance in self.triples.scan_predicate_object(vocab::RDF_TYPE, class, &*tx)? {
                guard.tick()?;
                step.frontier.push_back((instance.triple.clone(), 0));
            }
        }
        Ok(())
    }

    /// Runtime property equivalence: both directions enter the stored
    /// hierarchy, the scm-eqp subproperty pair is emitted, and
    /// assertions of either property re-derive through the refreshed
    /// closure, which is what fires prp-eqp1/2.
    fn on_equivalent_property_axiom(
        &self,
        axiom: &Triple,
        tx: &mut dyn KvTransaction,
        step: &mut MaterializationStep,
        guard: &mut OpGuard,
    ) -> Result<()> {
        self.store.add_equivalent_property_edge(
            &self.ontology,
            &axiom.subject,
            &axiom.object,
            tx,
        )?;

        // scm-eqp1: equivalence implies both subproperty directions,
        // materialized over the refreshed closure as for classes
        for property in [&axiom.subject, &axiom.object] {
            for ancestor in
                self.store.super_properties(&self.ontology, property, &*tx)?
            {
                guard.tick()?;
                let derived =
                    Triple::new(property.clone(), vocab::RDFS_SUB_PROPERTY_OF, ancestor);
                let fresh = self.triples.add_inference(
                    &derived,
                    InferenceProvenance::new("scm-eqp1", vec![axiom.clone()], 1),
                    tx,
                )?;
                if fresh {
                    step.inferred.push(derived);
                }
            }
        }

        for stored in self.triples.scan_all(&*tx)? {
            guard.tick()?;
            if stored.is_visible()
                && (stored.triple.predicate == axiom.subject
                    || stored.triple.predicate == axiom.object)
            {
                step.frontier.push_back((stored.triple.clone(), 0));
            }
        }
        Ok(())
    }

    /// Runtime subproperty axiom: extend the hierarchy, emit scm-spo,
    /// and re-derive assertions of the subproperty.
    fn on_subproperty_axiom(
        &self,
        axiom: &Triple,
        tx: &mut dyn KvTransaction,
        step: &mut MaterializationStep,
        guard: &mut OpGuard,
    ) -> Result<()> {
        self.store
            .add_subproperty_edge(&self.ontology, &axiom.subject, &axiom.object, tx)?;

        for ancestor in
            self.store.super_properties(&self.ontology, &axiom.subject, &*tx)?
        {
            guard.tick()?;
            if ancestor == axiom.object {
                continue;
            }
            let derived = Triple::new(
                axiom.subject.clone(),
                vocab::RDFS_SUB_PROPERTY_OF,
                ancestor.clone(),
            );
            let fresh = self.triples.add_inference(
                &derived,
                InferenceProvenance::new(
                    "scm-spo",
                    vec![
                        axiom.clone(),
                        Triple::new(
                            axiom.object.clone(),
                            vocab::RDFS_SUB_PROPERTY_OF,
                            ancestor,
                        ),
                    ],
                    1,
                ),
                tx,
            )?;
            if fresh {
                step.inferred.push(derived);
            }
        }

        for stored in self.triples.scan_all(&*tx)? {
            guard.tick()?;
            if stored.is_visible() && stored.triple.predicate == axiom.subject {
                step.frontier.push_back((stored.triple.clone(), 0));
            }
        }
        Ok(())
    }

    // ── Consistency checks ─────────────────────────────────────────────

    fn inconsistency(&self, rule: &'static str, triple: &Triple) -> Error {
        Error::Inconsistency { rule, triple: triple.to_string() }
    }

    fn check_consistency(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<()> {
        match triple.predicate.as_str() {
            vocab::RDF_TYPE => self.check_type_consistency(triple, &*tx),
            vocab::OWL_SAME_AS => {
                // eq-diff1
                let different = Triple::new(
                    triple.subject.clone(),
                    vocab::OWL_DIFFERENT_FROM,
                    triple.object.clone(),
                );
                let mirrored = Triple::new(
                    triple.object.clone(),
                    vocab::OWL_DIFFERENT_FROM,
                    triple.subject.clone(),
                );
                if self.visible(&different, &*tx)? || self.visible(&mirrored, &*tx)? {
                    return Err(self.inconsistency("eq-diff1", triple));
                }
                Ok(())
            }
            vocab::OWL_DIFFERENT_FROM => {
                if self.same_as.same(&triple.subject, &triple.object, &*tx)? {
                    return Err(self.inconsistency("eq-diff1", triple));
                }
                Ok(())
            }
            _ => self.check_property_consistency(triple, tx),
        }
    }

    fn check_type_consistency(&self, triple: &Triple, reader: &dyn KvRead) -> Result<()> {
        // cls-nothing1
        if triple.object == vocab::OWL_NOTHING {
            return Err(self.inconsistency("cls-nothing1", triple));
        }
        let Some(class) = self.store.get_class(&self.ontology, &triple.object, reader)? else {
            return Ok(());
        };
        let existing_types = self.types_direct(&triple.subject, reader)?;
        // cax-dw
        for disjoint in &class.disjoint_with {
            if existing_types.contains(disjoint) {
                return Err(self.inconsistency("cax-dw", triple));
            }
        }
        // cls-com
        if let Some(complement) = &class.complement_of {
            if existing_types.contains(complement) {
                return Err(self.inconsistency("cls-com", triple));
            }
        }
        // The other direction: an existing type may declare this one
        // disjoint
        for existing in &existing_types {
            if let Some(def) = self.store.get_class(&self.ontology, existing, reader)? {
                if def.disjoint_with.contains(&triple.object) {
                    return Err(self.inconsistency("cax-dw", triple));
                }
            }
        }
        Ok(())
    }

    fn check_property_consistency(
        &self,
        triple: &Triple,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let Some(property) =
            self.store.get_property(&self.ontology, &triple.predicate, &*tx)?
        else {
            return Ok(());
        };
        // prp-irp
        if property.characteristics.irreflexive && triple.subject == triple.object {
            return Err(self.inconsistency("prp-irp", triple));
        }
        // prp-asyp
        if property.characteristics.asymmetric {
            let reversed = Triple::new(
                triple.object.clone(),
                triple.predicate.clone(),
                triple.subject.clone(),
            );
            if self.visible(&reversed, &*tx)? {
                return Err(self.inconsistency("prp-asyp", triple));
            }
        }
        // prp-fp
        if property.characteristics.functional {
            for existing in
                self.triples
                    .scan_subject(&triple.subject, Some(&triple.predicate), &*tx)?
            {
                if existing.triple.object != triple.object
                    && !self.same_as.same(&existing.triple.object, &triple.object, &*tx)?
                {
                    return Err(self.inconsistency("prp-fp", triple));
                }
            }
        }
        // prp-ifp
        if property.characteristics.inverse_functional {
            for existing in self.triples.scan_predicate_object(
                &triple.predicate,
                &triple.object,
                &*tx,
            )? {
                if existing.triple.subject != triple.subject
                    && !self
                        .same_as
                        .same(&existing.triple.subject, &triple.subject, &*tx)?
                {
                    return Err(self.inconsistency("prp-ifp", triple));
                }
            }
        }
        // prp-pdw
        for disjoint in &property.disjoint_with {
            let sibling = Triple::new(
                triple.subject.clone(),
                disjoint.clone(),
                triple.object.clone(),
            );
            if self.visible(&sibling, &*tx)? {
                return Err(self.inconsistency("prp-pdw", triple));
            }
        }
        self.check_cardinality(triple, tx)
    }

    /// cls-maxc1/2 and cls-maxqc1/2 over the subject's classes.
    fn check_cardinality(&self, triple: &Triple, tx: &mut dyn KvTransaction) -> Result<()> {
        let types = self.types_direct(&triple.subject, &*tx)?;
        for class_iri in &types {
            let Some(class) = self.store.get_class(&self.ontology, class_iri, &*tx)? else {
                continue;
            };
            for restriction in &class.restrictions {
                if restriction.property != triple.predicate {
                    continue;
                }
                let qualified = restriction.qualified_class.as_deref();
                if let Some(q) = qualified {
                    let object_types = self.types_direct(&triple.object, &*tx)?;
                    if !object_types.contains(q)
                        && !self
                            .store
                            .super_classes(&self.ontology, q, &*tx)?
                            .iter()
                            .any(|s| object_types.contains(s))
                    {
                        continue;
                    }
                }
                let rule: &'static str = match (restriction.max, qualified) {
                    (0, None) => "cls-maxc1",
                    (0, Some(_)) => "cls-maxqc1",
                    (_, None) => "cls-maxc2",
                    (_, Some(_)) => "cls-maxqc2",
                };
                if restriction.max == 0 {
                    return Err(self.inconsistency(rule, triple));
                }
                let mut distinct: BTreeSet<Iri> = BTreeSet::new();
                distinct.insert(self.same_as.representative(&triple.object, &*tx)?);
                for existing in
                    self.triples
                        .scan_subject(&triple.subject, Some(&triple.predicate), &*tx)?
                {
                    distinct.insert(
                        self.same_as.representative(&existing.triple.object, &*tx)?,
                    );
                }
                if distinct.len() as u32 > restriction.max {
                    return Err(self.inconsistency(rule, triple));
                }
            }
        }
        Ok(())
    }

    fn visible(&self, triple: &Triple, reader: &dyn KvRead) -> Result<bool> {
        Ok(self
            .triples
            .get(triple, reader)?
            .map(|t| t.is_visible())
            .unwrap_or(false))
    }

    fn types_direct(&self, subject: &str, reader: &dyn KvRead) -> Result<BTreeSet<Iri>> {
        Ok(self
            .triples
            .scan_subject(subject, Some(vocab::RDF_TYPE), reader)?
            .into_iter()
            .map(|t| t.triple.object)
            .collect())
    }
}

// ── Query-time reasoner ────────────────────────────────────────────────

/// Read-side reasoner: applies the query-time rewrite rules `prp-trp`
/// (transitive properties) and `prp-spo2` (property chains), and
/// canonicalizes through `sameAs`.
pub struct Reasoner<'a> {
    ontology: Iri,
    store: &'a OntologyStore,
    triples: TripleStore,
    same_as: SameAsIndex,
}

impl<'a> Reasoner<'a> {
    pub fn new(root: &Subspace, store: &'a OntologyStore, ontology: impl Into<Iri>) -> Self {
        let ontology = ontology.into();
        let same_as = SameAsIndex::new(&store.same_as_space(&ontology));
        Reasoner {
            triples: TripleStore::new(root, &ontology),
            same_as,
            ontology,
            store,
        }
    }

    /// All classes of a subject (materialized, so hierarchy included).
    pub fn types_of(&self, subject: &str, reader: &dyn KvRead) -> Result<BTreeSet<Iri>> {
        let mut out = BTreeSet::new();
        for start in self.equivalents(subject, reader)? {
            for stored in self.triples.scan_subject(&start, Some(vocab::RDF_TYPE), reader)? {
                out.insert(stored.triple.object);
            }
        }
        Ok(out)
    }

    /// Objects reachable from a subject over a property, with the
    /// transitive (prp-trp) and chain (prp-spo2) rewrites applied.
    pub fn objects(
        &self,
        subject: &str,
        predicate: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        let starts = self.equivalents(subject, reader)?;
        let mut out: BTreeSet<Iri> = BTreeSet::new();
        for start in &starts {
            out.extend(self.direct_objects(start, predicate, reader)?);
        }

        // prp-trp: saturate through the transitive closure at read time
        if self.store.is_transitive(&self.ontology, predicate, reader)? {
            let mut frontier: Vec<Iri> = out.iter().cloned().collect();
            while let Some(node) = frontier.pop() {
                for next in self.direct_objects(&node, predicate, reader)? {
                    if out.insert(next.clone()) {
                        frontier.push(next);
                    }
                }
            }
        }

        // prp-spo2: compose each declared chain
        for chain in self.store.chains_for(&self.ontology, predicate, reader)? {
            let mut nodes: BTreeSet<Iri> = starts.clone();
            for link in &chain {
                let mut next: BTreeSet<Iri> = BTreeSet::new();
                for node in &nodes {
                    next.extend(self.direct_objects(node, link, reader)?);
                }
                nodes = next;
                if nodes.is_empty() {
                    break;
                }
            }
            out.extend(nodes);
        }
        Ok(out)
    }

    fn direct_objects(
        &self,
        subject: &str,
        predicate: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        Ok(self
            .triples
            .scan_subject(subject, Some(predicate), reader)?
            .into_iter()
            .map(|t| t.triple.object)
            .collect())
    }

    /// A subject plus everything `sameAs`-equal to it.
    fn equivalents(&self, subject: &str, reader: &dyn KvRead) -> Result<BTreeSet<Iri>> {
        let representative = self.same_as.representative(subject, reader)?;
        let mut out = self.same_as.members(&representative, reader)?;
        out.insert(representative);
        out.insert(subject.to_string());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::ontology::store::{
        CardinalityRestriction, Ontology, StoredClassDefinition, StoredPropertyDefinition,
    };
    use crate::ontology::triples::TripleStatus;

    const ONT: &str = "http://example.org/company";

    struct Fixture {
        kv: MemoryKv,
        root: Subspace,
        store: OntologyStore,
    }

    fn fixture(ontology: Ontology) -> Fixture {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let store = OntologyStore::new(&root);
        kv.run(|tx| store.load(&ontology, tx)).unwrap();
        Fixture { kv, root, store }
    }

    fn company() -> Ontology {
        Ontology::new(ONT)
            .with_class(StoredClassDefinition::named("Person"))
            .with_class(StoredClassDefinition::named("Employee").sub_class_of("Person"))
            .with_class(
                StoredClassDefinition::named("Robot").disjoint("Person"),
            )
            .with_property(
                StoredPropertyDefinition::named("worksFor")
                    .with_domain("Employee")
                    .with_range("Company")
                    .inverse("employs"),
            )
            .with_property(StoredPropertyDefinition::named("knows").symmetric())
            .with_property(StoredPropertyDefinition::named("partOf").transitive())
            .with_property(
                StoredPropertyDefinition::named("manages").sub_property_of("worksWith"),
            )
            .with_property(StoredPropertyDefinition::named("worksWith"))
            .with_class(StoredClassDefinition::named("Company"))
    }

    fn materializer<'a>(f: &'a Fixture) -> Owl2RlMaterializer<'a> {
        Owl2RlMaterializer::new(&f.root, &f.store, ONT, ReasonerConfig::default())
    }

    #[test]
    fn test_subclass_propagation_with_provenance() {
        let f = fixture(company());
        let m = materializer(&f);
        let base = Triple::new("alice", vocab::RDF_TYPE, "Employee");
        let inferred = f.kv.run(|tx| m.assert(&base, tx)).unwrap();
        assert_eq!(inferred, vec![Triple::new("alice", vocab::RDF_TYPE, "Person")]);

        let tx = f.kv.begin();
        let stored = m
            .triples()
            .get(&Triple::new("alice", vocab::RDF_TYPE, "Person"), &tx)
            .unwrap()
            .unwrap();
        assert_eq!(stored.provenance.len(), 1);
        assert_eq!(stored.provenance[0].rule, "cax-sco");
        assert_eq!(
            stored.provenance[0].antecedents,
            vec![
                base,
                Triple::new("Employee", vocab::RDFS_SUB_CLASS_OF, "Person"),
            ]
        );
    }

    #[test]
    fn test_domain_range_and_inverse() {
        let f = fixture(company());
        let m = materializer(&f);
        let base = Triple::new("alice", "worksFor", "acme");
        f.kv.run(|tx| m.assert(&base, tx).map(|_| ())).unwrap();

        let tx = f.kv.begin();
        for expected in [
            Triple::new("alice", vocab::RDF_TYPE, "Employee"),
            Triple::new("alice", vocab::RDF_TYPE, "Person"), // chained through cax-sco
            Triple::new("acme", vocab::RDF_TYPE, "Company"),
            Triple::new("acme", "employs", "alice"),
        ] {
            assert!(
                m.triples().get(&expected, &tx).unwrap().map(|t| t.is_visible()).unwrap_or(false),
                "missing {expected}"
            );
        }
    }

    #[test]
    fn test_symmetric_property() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv
            .run(|tx| m.assert(&Triple::new("alice", "knows", "bob"), tx).map(|_| ()))
            .unwrap();
        let tx = f.kv.begin();
        assert!(m
            .triples()
            .get(&Triple::new("bob", "knows", "alice"), &tx)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_super_property_inference() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv
            .run(|tx| m.assert(&Triple::new("alice", "manages", "bob"), tx).map(|_| ()))
            .unwrap();
        let tx = f.kv.begin();
        let derived = m
            .triples()
            .get(&Triple::new("alice", "worksWith", "bob"), &tx)
            .unwrap()
            .unwrap();
        assert_eq!(derived.provenance[0].rule, "prp-spo1");
    }

    #[test]
    fn test_dred_roundtrip_restores_on_reassert() {
        let f = fixture(company());
        let m = materializer(&f);
        let axiom = Triple::new("Contractor", vocab::RDFS_SUB_CLASS_OF, "Person");
        let typed = Triple::new("carol", vocab::RDF_TYPE, "Contractor");
        let derived = Triple::new("carol", vocab::RDF_TYPE, "Person");

        f.kv.run(|tx| {
            m.assert(&axiom, tx)?;
            m.assert(&typed, tx)?;
            Ok(())
        })
        .unwrap();
        let tx = f.kv.begin();
        assert!(m.triples().get(&derived, &tx).unwrap().unwrap().is_visible());
        drop(tx);

        // Deleting the axiom removes the derived type
        let outcome = f.kv.run(|tx| m.retract(&axiom, tx)).unwrap();
        assert!(outcome.deleted.contains(&derived));
        let tx = f.kv.begin();
        assert!(m.triples().get(&derived, &tx).unwrap().is_none());
        drop(tx);

        // Re-adding the axiom restores it with fresh provenance
        f.kv.run(|tx| m.assert(&axiom, tx).map(|_| ())).unwrap();
        let tx = f.kv.begin();
        let restored = m.triples().get(&derived, &tx).unwrap().unwrap();
        assert!(restored.is_visible());
        assert_eq!(restored.provenance.len(), 1);
        assert!(restored.provenance[0].valid);
    }

    #[test]
    fn test_disjointness_violation() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv
            .run(|tx| m.assert(&Triple::new("r2d2", vocab::RDF_TYPE, "Robot"), tx).map(|_| ()))
            .unwrap();
        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("r2d2", vocab::RDF_TYPE, "Person"), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "cax-dw", .. }));
    }

    #[test]
    fn test_nothing_violation() {
        let f = fixture(company());
        let m = materializer(&f);
        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("x", vocab::RDF_TYPE, vocab::OWL_NOTHING), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "cls-nothing1", .. }));
    }

    #[test]
    fn test_functional_property_violation() {
        let ontology = Ontology::new(ONT).with_property({
            let mut p = StoredPropertyDefinition::named("hasBirthMother");
            p.characteristics.functional = true;
            p
        });
        let f = fixture(ontology);
        let m = materializer(&f);
        f.kv
            .run(|tx| m.assert(&Triple::new("alice", "hasBirthMother", "eve"), tx).map(|_| ()))
            .unwrap();
        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("alice", "hasBirthMother", "mary"), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "prp-fp", .. }));
    }

    #[test]
    fn test_irreflexive_and_asymmetric() {
        let ontology = Ontology::new(ONT)
            .with_property({
                let mut p = StoredPropertyDefinition::named("properPartOf");
                p.characteristics.irreflexive = true;
                p.characteristics.asymmetric = true;
                p
            });
        let f = fixture(ontology);
        let m = materializer(&f);

        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("a", "properPartOf", "a"), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "prp-irp", .. }));

        f.kv
            .run(|tx| m.assert(&Triple::new("a", "properPartOf", "b"), tx).map(|_| ()))
            .unwrap();
        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("b", "properPartOf", "a"), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "prp-asyp", .. }));
    }

    #[test]
    fn test_max_cardinality() {
        let ontology = Ontology::new(ONT)
            .with_class(StoredClassDefinition {
                iri: "Monogamous".into(),
                restrictions: vec![CardinalityRestriction {
                    property: "marriedTo".into(),
                    max: 1,
                    qualified_class: None,
                }],
                ..Default::default()
            })
            .with_property(StoredPropertyDefinition::named("marriedTo"));
        let f = fixture(ontology);
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("alice", vocab::RDF_TYPE, "Monogamous"), tx)?;
            m.assert(&Triple::new("alice", "marriedTo", "bob"), tx)?;
            Ok(())
        })
        .unwrap();
        let err = f
            .kv
            .run(|tx| m.assert(&Triple::new("alice", "marriedTo", "carol"), tx))
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "cls-maxc2", .. }));
    }

    #[test]
    fn test_same_as_and_eq_diff() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("clark", vocab::OWL_SAME_AS, "superman"), tx)?;
            Ok(())
        })
        .unwrap();
        let tx = f.kv.begin();
        assert!(m.same_as().same("clark", "superman", &tx).unwrap());
        drop(tx);

        let err = f
            .kv
            .run(|tx| {
                m.assert(&Triple::new("clark", vocab::OWL_DIFFERENT_FROM, "superman"), tx)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Inconsistency { rule: "eq-diff1", .. }));
    }

    #[test]
    fn test_reasoner_transitive_rewrite() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("engine", "partOf", "car"), tx)?;
            m.assert(&Triple::new("car", "partOf", "fleet"), tx)?;
            Ok(())
        })
        .unwrap();

        let reasoner = Reasoner::new(&f.root, &f.store, ONT);
        let tx = f.kv.begin();
        let objects = reasoner.objects("engine", "partOf", &tx).unwrap();
        assert!(objects.contains("car"));
        assert!(objects.contains("fleet"));
        // The closure is query-time only: no materialized triple exists
        assert!(m
            .triples()
            .get(&Triple::new("engine", "partOf", "fleet"), &tx)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reasoner_property_chain() {
        let f = fixture(
            company().with_property(StoredPropertyDefinition {
                iri: "uncle".into(),
                chains: vec![vec!["father".into(), "brother".into()]],
                ..Default::default()
            }),
        );
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("alice", "father", "bob"), tx)?;
            m.assert(&Triple::new("bob", "brother", "carl"), tx)?;
            Ok(())
        })
        .unwrap();

        let reasoner = Reasoner::new(&f.root, &f.store, ONT);
        let tx = f.kv.begin();
        let uncles = reasoner.objects("alice", "uncle", &tx).unwrap();
        assert!(uncles.contains("carl"));
    }

    #[test]
    fn test_reasoner_same_as_expansion() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("clark", vocab::RDF_TYPE, "Employee"), tx)?;
            m.assert(&Triple::new("clark", vocab::OWL_SAME_AS, "superman"), tx)?;
            Ok(())
        })
        .unwrap();
        let reasoner = Reasoner::new(&f.root, &f.store, ONT);
        let tx = f.kv.begin();
        let types = reasoner.types_of("superman", &tx).unwrap();
        assert!(types.contains("Employee"));
        assert!(types.contains("Person"));
    }

    #[test]
    fn test_runtime_equivalent_class_axiom() {
        let f = fixture(company());
        let m = materializer(&f);
        // An instance typed before the equivalence is declared
        f.kv.run(|tx| {
            m.assert(&Triple::new("hal", vocab::RDF_TYPE, "Robot"), tx).map(|_| ())
        })
        .unwrap();

        let axiom = Triple::new("Robot", vocab::OWL_EQUIVALENT_CLASS, "Android");
        let inferred = f.kv.run(|tx| m.assert(&axiom, tx)).unwrap();
        // scm-eqc1 emits both subclass directions
        assert!(inferred.contains(&Triple::new("Robot", vocab::RDFS_SUB_CLASS_OF, "Android")));
        assert!(inferred.contains(&Triple::new("Android", vocab::RDFS_SUB_CLASS_OF, "Robot")));
        // The pre-existing instance re-types through the equivalence
        assert!(inferred.contains(&Triple::new("hal", vocab::RDF_TYPE, "Android")));

        // New instances of the equivalent class type back the other way
        let more = f
            .kv
            .run(|tx| m.assert(&Triple::new("data", vocab::RDF_TYPE, "Android"), tx))
            .unwrap();
        assert!(more.contains(&Triple::new("data", vocab::RDF_TYPE, "Robot")));
    }

    #[test]
    fn test_runtime_equivalent_class_retraction() {
        let f = fixture(company());
        let m = materializer(&f);
        let axiom = Triple::new("Robot", vocab::OWL_EQUIVALENT_CLASS, "Android");
        f.kv.run(|tx| {
            m.assert(&Triple::new("hal", vocab::RDF_TYPE, "Robot"), tx)?;
            m.assert(&axiom, tx)?;
            Ok(())
        })
        .unwrap();
        let tx = f.kv.begin();
        assert!(m
            .triples()
            .get(&Triple::new("hal", vocab::RDF_TYPE, "Android"), &tx)
            .unwrap()
            .unwrap()
            .is_visible());
        drop(tx);

        let outcome = f.kv.run(|tx| m.retract(&axiom, tx)).unwrap();
        assert!(outcome
            .deleted
            .contains(&Triple::new("hal", vocab::RDF_TYPE, "Android")));

        let tx = f.kv.begin();
        assert!(m
            .triples()
            .get(&Triple::new("hal", vocab::RDF_TYPE, "Android"), &tx)
            .unwrap()
            .is_none());
        // The hierarchy no longer links the two classes
        assert!(!f
            .store
            .super_classes(ONT, "Robot", &tx)
            .unwrap()
            .contains("Android"));
    }

    #[test]
    fn test_runtime_equivalent_property_axiom() {
        let f = fixture(company());
        let m = materializer(&f);
        f.kv.run(|tx| {
            m.assert(&Triple::new("alice", "worksWith", "bob"), tx).map(|_| ())
        })
        .unwrap();

        let axiom =
            Triple::new("worksWith", vocab::OWL_EQUIVALENT_PROPERTY, "collaboratesWith");
        let inferred = f.kv.run(|tx| m.assert(&axiom, tx)).unwrap();
        assert!(inferred.contains(&Triple::new(
            "worksWith",
            vocab::RDFS_SUB_PROPERTY_OF,
            "collaboratesWith",
        )));
        // The pre-existing assertion re-derives under the equivalent
        assert!(inferred.contains(&Triple::new("alice", "collaboratesWith", "bob")));

        // New assertions of either property derive the other
        let more = f
            .kv
            .run(|tx| m.assert(&Triple::new("carol", "collaboratesWith", "dave"), tx))
            .unwrap();
        assert!(more.contains(&Triple::new("carol", "worksWith", "dave")));
    }

    #[test]
    fn test_cancelled_materialization_aborts() {
        use crate::kv::CancelHandle;

        let f = fixture(company());
        let cancel = CancelHandle::new();
        cancel.cancel();
        let m = materializer(&f)
            .with_guard(OpGuard::new(cancel, None).with_yield_batch(1));
        let mut tx = f.kv.begin();
        let err = m
            .assert(&Triple::new("alice", vocab::RDF_TYPE, "Employee"), &mut tx)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_stepwise_materialization_matches_inline() {
        let f = fixture(company());
        let m = materializer(&f);
        // Instances whose re-typing the axiom will fan out over
        f.kv.run(|tx| {
            for i in 0..6 {
                m.assert(&Triple::new(format!("w{i}"), vocab::RDF_TYPE, "Worker"), tx)?;
            }
            Ok(())
        })
        .unwrap();

        // Drain the frontier one entry per transaction
        let axiom = Triple::new("Worker", vocab::RDFS_SUB_CLASS_OF, "Person");
        let mut step = f.kv.run(|tx| m.begin_assert(&axiom, tx)).unwrap();
        let mut rounds = 0;
        while !step.is_done() {
            f.kv.run(|tx| m.materialize(&mut step, 1, tx).map(|_| ())).unwrap();
            rounds += 1;
        }
        assert!(rounds >= 6);
        assert_eq!(step.inferred.len(), 6);

        let tx = f.kv.begin();
        for i in 0..6 {
            let derived = Triple::new(format!("w{i}"), vocab::RDF_TYPE, "Person");
            assert!(
                m.triples().get(&derived, &tx).unwrap().unwrap().is_visible(),
                "w{i} not re-typed"
            );
        }
    }

    #[test]
    fn test_rederived_status_after_partial_retract() {
        let f = fixture(company());
        let m = materializer(&f);
        // Person derivable from two independent bases
        f.kv.run(|tx| {
            m.assert(&Triple::new("dan", vocab::RDF_TYPE, "Employee"), tx)?;
            m.assert(&Triple::new("Contractor", vocab::RDFS_SUB_CLASS_OF, "Person"), tx)?;
            m.assert(&Triple::new("dan", vocab::RDF_TYPE, "Contractor"), tx)?;
            Ok(())
        })
        .unwrap();

        f.kv
            .run(|tx| m.retract(&Triple::new("dan", vocab::RDF_TYPE, "Employee"), tx))
            .unwrap();
        let tx = f.kv.begin();
        let person = m
            .triples()
            .get(&Triple::new("dan", vocab::RDF_TYPE, "Person"), &tx)
            .unwrap()
            .unwrap();
        assert!(person.is_visible());
        assert_eq!(person.status, TripleStatus::Rederived);
    }
}
