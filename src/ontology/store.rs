//! Ontology Store
//!
//! Persists class and property definitions and their materialized
//! hierarchies under a fixed per-IRI layout:
//!
//! ```text
//! O / <ontologyIRI> /
//!   0 (metadata)                     -> OntologyMetadata
//!   1 (classes) / <classIRI>         -> StoredClassDefinition
//!   2 (properties) / <propertyIRI>   -> StoredPropertyDefinition
//!   3 (axioms) / <axiomID>           -> EncodedAxiom
//!   4 (classHierarchy) /
//!      0 (super) / <sub> / <super>   -> ∅
//!      1 (sub)   / <super> / <sub>   -> ∅
//!   5 (propertyHierarchy)            (same shape)
//!   6 (inverse) / <prop>             -> <inverseProp>
//!   7 (transitive) / <prop>          -> ∅
//!   8 (chains) / <targetProp> / <id> -> JSON chain array
//!   9 (sameAs)                       (see union_find)
//! ```
//!
//! Hierarchy materialization computes the transitive closure of the
//! direct super links. Equivalent classes behave as bidirectional
//! subclass links; the closure collapses such cycles and never reports
//! a class as its own ancestor.

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::ontology::Iri;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const IX_METADATA: i64 = 0;
const IX_CLASSES: i64 = 1;
const IX_PROPERTIES: i64 = 2;
const IX_AXIOMS: i64 = 3;
const IX_CLASS_HIERARCHY: i64 = 4;
const IX_PROPERTY_HIERARCHY: i64 = 5;
const IX_INVERSE: i64 = 6;
const IX_TRANSITIVE: i64 = 7;
const IX_CHAINS: i64 = 8;
pub(crate) const IX_SAME_AS: i64 = 9;

const HIER_SUPER: i64 = 0;
const HIER_SUB: i64 = 1;

/// Ontology-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyMetadata {
    pub iri: Iri,
    pub label: Option<String>,
    pub loaded_at: i64,
    pub class_count: u64,
    pub property_count: u64,
}

/// Max-cardinality restriction carried by a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardinalityRestriction {
    pub property: Iri,
    pub max: u32,
    /// Qualified restriction: only objects of this class count
    pub qualified_class: Option<Iri>,
}

/// A class definition as persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredClassDefinition {
    pub iri: Iri,
    pub super_classes: Vec<Iri>,
    pub equivalent_classes: Vec<Iri>,
    pub disjoint_with: Vec<Iri>,
    pub complement_of: Option<Iri>,
    pub restrictions: Vec<CardinalityRestriction>,
    pub label: Option<String>,
}

impl StoredClassDefinition {
    pub fn named(iri: impl Into<Iri>) -> Self {
        StoredClassDefinition { iri: iri.into(), ..Default::default() }
    }

    pub fn sub_class_of(mut self, parent: impl Into<Iri>) -> Self {
        self.super_classes.push(parent.into());
        self
    }

    pub fn equivalent_to(mut self, other: impl Into<Iri>) -> Self {
        self.equivalent_classes.push(other.into());
        self
    }

    pub fn disjoint(mut self, other: impl Into<Iri>) -> Self {
        self.disjoint_with.push(other.into());
        self
    }
}

/// Property characteristics from the RBox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyCharacteristics {
    pub transitive: bool,
    pub symmetric: bool,
    pub functional: bool,
    pub inverse_functional: bool,
    pub irreflexive: bool,
    pub asymmetric: bool,
}

/// A property definition as persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredPropertyDefinition {
    pub iri: Iri,
    pub super_properties: Vec<Iri>,
    pub equivalent_properties: Vec<Iri>,
    pub disjoint_with: Vec<Iri>,
    pub domain: Option<Iri>,
    pub range: Option<Iri>,
    pub inverse_of: Option<Iri>,
    pub characteristics: PropertyCharacteristics,
    /// Property chains whose composition implies this property
    pub chains: Vec<Vec<Iri>>,
}

impl StoredPropertyDefinition {
    pub fn named(iri: impl Into<Iri>) -> Self {
        StoredPropertyDefinition { iri: iri.into(), ..Default::default() }
    }

    pub fn sub_property_of(mut self, parent: impl Into<Iri>) -> Self {
        self.super_properties.push(parent.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<Iri>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_range(mut self, range: impl Into<Iri>) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn inverse(mut self, other: impl Into<Iri>) -> Self {
        self.inverse_of = Some(other.into());
        self
    }

    pub fn transitive(mut self) -> Self {
        self.characteristics.transitive = true;
        self
    }

    pub fn symmetric(mut self) -> Self {
        self.characteristics.symmetric = true;
        self
    }
}

/// The input model for [`OntologyStore::load`].
#[derive(Debug, Clone, Default)]
pub struct Ontology {
    pub iri: Iri,
    pub label: Option<String>,
    pub classes: Vec<StoredClassDefinition>,
    pub properties: Vec<StoredPropertyDefinition>,
}

impl Ontology {
    pub fn new(iri: impl Into<Iri>) -> Self {
        Ontology { iri: iri.into(), ..Default::default() }
    }

    pub fn with_class(mut self, class: StoredClassDefinition) -> Self {
        self.classes.push(class);
        self
    }

    pub fn with_property(mut self, property: StoredPropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }
}

/// Persistent TBox/RBox store.
pub struct OntologyStore {
    base: Subspace,
}

impl OntologyStore {
    /// The base subspace is always rooted directly at the engine root:
    /// `list` relies on the first unpacked element being the ontology
    /// IRI.
    pub fn new(root: &Subspace) -> Self {
        OntologyStore { base: root.child("O") }
    }

    fn ontology_space(&self, iri: &str) -> Subspace {
        self.base.child(iri)
    }

    fn section(&self, iri: &str, index: i64) -> Subspace {
        self.ontology_space(iri).child(index)
    }

    pub(crate) fn same_as_space(&self, iri: &str) -> Subspace {
        self.section(iri, IX_SAME_AS)
    }

    // ── Load / delete / get ────────────────────────────────────────────

    /// Persist an ontology: definitions, materialized hierarchies,
    /// characteristic markers, and property chains.
    pub fn load(&self, ontology: &Ontology, tx: &mut dyn KvTransaction) -> Result<()> {
        let iri = &ontology.iri;
        let metadata = OntologyMetadata {
            iri: iri.clone(),
            label: ontology.label.clone(),
            loaded_at: Utc::now().timestamp_millis(),
            class_count: ontology.classes.len() as u64,
            property_count: ontology.properties.len() as u64,
        };
        tx.set(
            &self.section(iri, IX_METADATA).pack(&Tuple::empty()),
            &encode(&metadata)?,
        )?;

        let classes = self.section(iri, IX_CLASSES);
        for class in &ontology.classes {
            tx.set(&classes.pack(&Tuple::from_single(class.iri.as_str())), &encode(class)?)?;
        }
        let properties = self.section(iri, IX_PROPERTIES);
        for property in &ontology.properties {
            tx.set(
                &properties.pack(&Tuple::from_single(property.iri.as_str())),
                &encode(property)?,
            )?;
        }

        self.materialize_class_hierarchy(iri, &ontology.classes, tx)?;
        self.materialize_property_hierarchy(iri, &ontology.properties, tx)?;

        let inverse = self.section(iri, IX_INVERSE);
        let transitive = self.section(iri, IX_TRANSITIVE);
        for property in &ontology.properties {
            if let Some(other) = &property.inverse_of {
                tx.set(
                    &inverse.pack(&Tuple::from_single(property.iri.as_str())),
                    other.as_bytes(),
                )?;
                // The inverse marker is symmetric
                tx.set(
                    &inverse.pack(&Tuple::from_single(other.as_str())),
                    property.iri.as_bytes(),
                )?;
            }
            if property.characteristics.transitive {
                tx.set(&transitive.pack(&Tuple::from_single(property.iri.as_str())), &[])?;
            }
            for chain in &property.chains {
                self.add_chain(iri, &property.iri, chain, tx)?;
            }
        }

        tracing::debug!(
            ontology = %iri,
            classes = ontology.classes.len(),
            properties = ontology.properties.len(),
            "ontology_loaded"
        );
        Ok(())
    }

    /// Remove an ontology and everything under it.
    pub fn delete(&self, iri: &str, tx: &mut dyn KvTransaction) -> Result<()> {
        let (begin, end) = self.ontology_space(iri).range();
        tx.clear_range(&begin, &end)
    }

    pub fn get(&self, iri: &str, reader: &dyn KvRead) -> Result<Option<OntologyMetadata>> {
        let key = self.section(iri, IX_METADATA).pack(&Tuple::empty());
        match reader.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All loaded ontology IRIs. Keys are unpacked relative to the base
    /// subspace; the first tuple element is the ontology IRI.
    pub fn list(&self, reader: &dyn KvRead) -> Result<Vec<Iri>> {
        let (begin, end) = self.base.range();
        let mut out: BTreeSet<Iri> = BTreeSet::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            let tuple = self.base.unpack(&key)?;
            debug_assert!(tuple.len() >= 2, "ontology key missing section index");
            if let Some(iri) = tuple.get(0).and_then(|v| v.as_str()) {
                out.insert(iri.to_string());
            }
        }
        Ok(out.into_iter().collect())
    }

    pub fn get_class(
        &self,
        iri: &str,
        class: &str,
        reader: &dyn KvRead,
    ) -> Result<Option<StoredClassDefinition>> {
        let key = self.section(iri, IX_CLASSES).pack(&Tuple::from_single(class));
        match reader.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_property(
        &self,
        iri: &str,
        property: &str,
        reader: &dyn KvRead,
    ) -> Result<Option<StoredPropertyDefinition>> {
        let key = self
            .section(iri, IX_PROPERTIES)
            .pack(&Tuple::from_single(property));
        match reader.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every class definition of an ontology.
    pub fn all_classes(&self, iri: &str, reader: &dyn KvRead) -> Result<Vec<StoredClassDefinition>> {
        let section = self.section(iri, IX_CLASSES);
        let (begin, end) = section.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (_, value) = pair?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Every property definition of an ontology.
    pub fn all_properties(
        &self,
        iri: &str,
        reader: &dyn KvRead,
    ) -> Result<Vec<StoredPropertyDefinition>> {
        let section = self.section(iri, IX_PROPERTIES);
        let (begin, end) = section.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (_, value) = pair?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Add a runtime subclass axiom and re-materialize the class
    /// hierarchy from the updated definitions.
    pub fn add_subclass_edge(
        &self,
        iri: &str,
        sub: &str,
        parent: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let mut class = self
            .get_class(iri, sub, &*tx)?
            .unwrap_or_else(|| StoredClassDefinition::named(sub));
        if !class.super_classes.iter().any(|s| s == parent) {
            class.super_classes.push(parent.to_string());
        }
        let classes_section = self.section(iri, IX_CLASSES);
        tx.set(&classes_section.pack(&Tuple::from_single(sub)), &encode(&class)?)?;
        let classes = self.all_classes(iri, &*tx)?;
        self.materialize_class_hierarchy(iri, &classes, tx)
    }

    /// Remove a subclass axiom and re-materialize.
    pub fn remove_subclass_edge(
        &self,
        iri: &str,
        sub: &str,
        parent: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let Some(mut class) = self.get_class(iri, sub, &*tx)? else {
            return Ok(());
        };
        class.super_classes.retain(|s| s != parent);
        let classes_section = self.section(iri, IX_CLASSES);
        tx.set(&classes_section.pack(&Tuple::from_single(sub)), &encode(&class)?)?;
        let classes = self.all_classes(iri, &*tx)?;
        self.materialize_class_hierarchy(iri, &classes, tx)
    }

    /// Add a runtime class-equivalence axiom (both directions) and
    /// re-materialize the class hierarchy.
    pub fn add_equivalent_class_edge(
        &self,
        iri: &str,
        a: &str,
        b: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let classes_section = self.section(iri, IX_CLASSES);
        for (class, other) in [(a, b), (b, a)] {
            let mut def = self
                .get_class(iri, class, &*tx)?
                .unwrap_or_else(|| StoredClassDefinition::named(class));
            if !def.equivalent_classes.iter().any(|e| e == other) {
                def.equivalent_classes.push(other.to_string());
            }
            tx.set(&classes_section.pack(&Tuple::from_single(class)), &encode(&def)?)?;
        }
        let classes = self.all_classes(iri, &*tx)?;
        self.materialize_class_hierarchy(iri, &classes, tx)
    }

    /// Remove a class-equivalence axiom and re-materialize.
    pub fn remove_equivalent_class_edge(
        &self,
        iri: &str,
        a: &str,
        b: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let classes_section = self.section(iri, IX_CLASSES);
        for (class, other) in [(a, b), (b, a)] {
            let Some(mut def) = self.get_class(iri, class, &*tx)? else {
                continue;
            };
            def.equivalent_classes.retain(|e| e != other);
            tx.set(&classes_section.pack(&Tuple::from_single(class)), &encode(&def)?)?;
        }
        let classes = self.all_classes(iri, &*tx)?;
        self.materialize_class_hierarchy(iri, &classes, tx)
    }

    /// Add a runtime property-equivalence axiom (both directions) and
    /// re-materialize the property hierarchy.
    pub fn add_equivalent_property_edge(
        &self,
        iri: &str,
        a: &str,
        b: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let section = self.section(iri, IX_PROPERTIES);
        for (property, other) in [(a, b), (b, a)] {
            let mut def = self
                .get_property(iri, property, &*tx)?
                .unwrap_or_else(|| StoredPropertyDefinition::named(property));
            if !def.equivalent_properties.iter().any(|e| e == other) {
                def.equivalent_properties.push(other.to_string());
            }
            tx.set(&section.pack(&Tuple::from_single(property)), &encode(&def)?)?;
        }
        let properties = self.all_properties(iri, &*tx)?;
        self.materialize_property_hierarchy(iri, &properties, tx)
    }

    /// Remove a property-equivalence axiom and re-materialize.
    pub fn remove_equivalent_property_edge(
        &self,
        iri: &str,
        a: &str,
        b: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let section = self.section(iri, IX_PROPERTIES);
        for (property, other) in [(a, b), (b, a)] {
            let Some(mut def) = self.get_property(iri, property, &*tx)? else {
                continue;
            };
            def.equivalent_properties.retain(|e| e != other);
            tx.set(&section.pack(&Tuple::from_single(property)), &encode(&def)?)?;
        }
        let properties = self.all_properties(iri, &*tx)?;
        self.materialize_property_hierarchy(iri, &properties, tx)
    }

    /// Add a runtime subproperty axiom and re-materialize the property
    /// hierarchy.
    pub fn add_subproperty_edge(
        &self,
        iri: &str,
        sub: &str,
        parent: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let mut property = self
            .get_property(iri, sub, &*tx)?
            .unwrap_or_else(|| StoredPropertyDefinition::named(sub));
        if !property.super_properties.iter().any(|s| s == parent) {
            property.super_properties.push(parent.to_string());
        }
        let section = self.section(iri, IX_PROPERTIES);
        tx.set(&section.pack(&Tuple::from_single(sub)), &encode(&property)?)?;
        let properties = self.all_properties(iri, &*tx)?;
        self.materialize_property_hierarchy(iri, &properties, tx)
    }

    /// Remove a subproperty axiom and re-materialize.
    pub fn remove_subproperty_edge(
        &self,
        iri: &str,
        sub: &str,
        parent: &str,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let Some(mut property) = self.get_property(iri, sub, &*tx)? else {
            return Ok(());
        };
        property.super_properties.retain(|s| s != parent);
        let section = self.section(iri, IX_PROPERTIES);
        tx.set(&section.pack(&Tuple::from_single(sub)), &encode(&property)?)?;
        let properties = self.all_properties(iri, &*tx)?;
        self.materialize_property_hierarchy(iri, &properties, tx)
    }

    // ── Hierarchies ────────────────────────────────────────────────────

    fn materialize_class_hierarchy(
        &self,
        iri: &str,
        classes: &[StoredClassDefinition],
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let mut direct: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for class in classes {
            direct
                .entry(class.iri.as_str())
                .or_default()
                .extend(class.super_classes.iter().map(String::as_str));
            // Equivalent classes act as bidirectional subclass links
            for eq in &class.equivalent_classes {
                direct.entry(class.iri.as_str()).or_default().insert(eq.as_str());
                direct.entry(eq.as_str()).or_default().insert(class.iri.as_str());
            }
        }
        self.write_closure(&self.section(iri, IX_CLASS_HIERARCHY), &direct, tx)
    }

    fn materialize_property_hierarchy(
        &self,
        iri: &str,
        properties: &[StoredPropertyDefinition],
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let mut direct: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for property in properties {
            direct
                .entry(property.iri.as_str())
                .or_default()
                .extend(property.super_properties.iter().map(String::as_str));
            for eq in &property.equivalent_properties {
                direct
                    .entry(property.iri.as_str())
                    .or_default()
                    .insert(eq.as_str());
                direct
                    .entry(eq.as_str())
                    .or_default()
                    .insert(property.iri.as_str());
            }
        }
        self.write_closure(&self.section(iri, IX_PROPERTY_HIERARCHY), &direct, tx)
    }

    /// Transitive closure with explicit cycle handling: the walk tracks
    /// a visited set per root, so equivalence cycles terminate, and the
    /// root itself is excluded from its own ancestor set.
    fn write_closure(
        &self,
        section: &Subspace,
        direct: &HashMap<&str, BTreeSet<&str>>,
        tx: &mut dyn KvTransaction,
    ) -> Result<()> {
        let (begin, end) = section.range();
        tx.clear_range(&begin, &end)?;
        let super_space = section.child(HIER_SUPER);
        let sub_space = section.child(HIER_SUB);

        let mut roots: BTreeSet<&str> = direct.keys().copied().collect();
        for supers in direct.values() {
            roots.extend(supers.iter().copied());
        }
        for root in roots {
            let mut visited: BTreeSet<&str> = BTreeSet::new();
            let mut stack: Vec<&str> = direct
                .get(root)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            while let Some(current) = stack.pop() {
                if !visited.insert(current) {
                    continue;
                }
                if let Some(next) = direct.get(current) {
                    stack.extend(next.iter().copied());
                }
            }
            visited.remove(root);
            for ancestor in visited {
                let mut fwd = Tuple::from_single(root);
                fwd.push(ancestor);
                tx.set(&super_space.pack(&fwd), &[])?;
                let mut rev = Tuple::from_single(ancestor);
                rev.push(root);
                tx.set(&sub_space.pack(&rev), &[])?;
            }
        }
        Ok(())
    }

    /// Materialized ancestors (excluding the class itself).
    pub fn super_classes(
        &self,
        iri: &str,
        class: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        self.hierarchy_scan(&self.section(iri, IX_CLASS_HIERARCHY), HIER_SUPER, class, reader)
    }

    pub fn sub_classes(
        &self,
        iri: &str,
        class: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        self.hierarchy_scan(&self.section(iri, IX_CLASS_HIERARCHY), HIER_SUB, class, reader)
    }

    pub fn super_properties(
        &self,
        iri: &str,
        property: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        self.hierarchy_scan(
            &self.section(iri, IX_PROPERTY_HIERARCHY),
            HIER_SUPER,
            property,
            reader,
        )
    }

    pub fn sub_properties(
        &self,
        iri: &str,
        property: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        self.hierarchy_scan(
            &self.section(iri, IX_PROPERTY_HIERARCHY),
            HIER_SUB,
            property,
            reader,
        )
    }

    fn hierarchy_scan(
        &self,
        section: &Subspace,
        direction: i64,
        node: &str,
        reader: &dyn KvRead,
    ) -> Result<BTreeSet<Iri>> {
        let space = section.child(direction).child(node);
        let (begin, end) = space.range();
        let mut out = BTreeSet::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            let suffix = space.unpack(&key)?;
            if let Some(other) = suffix.get(0).and_then(|v| v.as_str()) {
                out.insert(other.to_string());
            }
        }
        Ok(out)
    }

    // ── Characteristics ────────────────────────────────────────────────

    pub fn inverse_of(&self, iri: &str, property: &str, reader: &dyn KvRead) -> Result<Option<Iri>> {
        let key = self.section(iri, IX_INVERSE).pack(&Tuple::from_single(property));
        match reader.get(&key)? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| Error::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn is_transitive(&self, iri: &str, property: &str, reader: &dyn KvRead) -> Result<bool> {
        let key = self
            .section(iri, IX_TRANSITIVE)
            .pack(&Tuple::from_single(property));
        Ok(reader.get(&key)?.is_some())
    }

    // ── Property chains ────────────────────────────────────────────────

    /// Add a chain implying `target`. Chain ids come from a reserved
    /// monotonic counter inside the chains section, safe under the
    /// host's serializable transactions.
    pub fn add_chain(
        &self,
        iri: &str,
        target: &str,
        chain: &[Iri],
        tx: &mut dyn KvTransaction,
    ) -> Result<i64> {
        let chains = self.section(iri, IX_CHAINS);
        let counter_key = chains.pack(&Tuple::from_single("ctr"));
        let next = match tx.get(&counter_key)? {
            Some(bytes) => {
                let mut buf = [0u8; 8];
                if bytes.len() != 8 {
                    return Err(Error::Codec("bad chain counter".into()));
                }
                buf.copy_from_slice(&bytes);
                i64::from_be_bytes(buf) + 1
            }
            None => 0,
        };
        tx.set(&counter_key, &next.to_be_bytes())?;
        let mut key = Tuple::from_single(target);
        key.push(next);
        let body = serde_json::to_vec(chain).map_err(|e| Error::Codec(e.to_string()))?;
        tx.set(&chains.pack(&key), &body)?;
        Ok(next)
    }

    /// Every chain implying `target`.
    pub fn chains_for(
        &self,
        iri: &str,
        target: &str,
        reader: &dyn KvRead,
    ) -> Result<Vec<Vec<Iri>>> {
        let space = self.section(iri, IX_CHAINS).child(target);
        let (begin, end) = space.range();
        let mut out = BTreeMap::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, value) = pair?;
            let suffix = space.unpack(&key)?;
            let id = suffix.get(0).and_then(|v| v.as_int()).unwrap_or_default();
            let chain: Vec<Iri> =
                serde_json::from_slice(&value).map_err(|e| Error::Codec(e.to_string()))?;
            out.insert(id, chain);
        }
        Ok(out.into_values().collect())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Codec(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const ONT: &str = "http://example.org/ont";

    fn company_ontology() -> Ontology {
        Ontology::new(ONT)
            .with_class(StoredClassDefinition::named("Person"))
            .with_class(StoredClassDefinition::named("Employee").sub_class_of("Person"))
            .with_class(StoredClassDefinition::named("Manager").sub_class_of("Employee"))
            .with_property(
                StoredPropertyDefinition::named("manages")
                    .with_domain("Manager")
                    .with_range("Employee")
                    .inverse("managedBy"),
            )
            .with_property(StoredPropertyDefinition::named("partOf").transitive())
    }

    #[test]
    fn test_load_get_delete() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        kv.run(|tx| store.load(&company_ontology(), tx)).unwrap();

        let tx = kv.begin();
        let metadata = store.get(ONT, &tx).unwrap().unwrap();
        assert_eq!(metadata.class_count, 3);
        assert_eq!(metadata.property_count, 2);
        assert_eq!(store.list(&tx).unwrap(), vec![ONT.to_string()]);
        drop(tx);

        kv.run(|tx| store.delete(ONT, tx)).unwrap();
        let tx = kv.begin();
        assert!(store.get(ONT, &tx).unwrap().is_none());
        assert!(store.list(&tx).unwrap().is_empty());
    }

    #[test]
    fn test_hierarchy_is_transitive_closure() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        kv.run(|tx| store.load(&company_ontology(), tx)).unwrap();

        let tx = kv.begin();
        let supers = store.super_classes(ONT, "Manager", &tx).unwrap();
        assert_eq!(
            supers.into_iter().collect::<Vec<_>>(),
            vec!["Employee".to_string(), "Person".to_string()]
        );
        let subs = store.sub_classes(ONT, "Person", &tx).unwrap();
        assert_eq!(
            subs.into_iter().collect::<Vec<_>>(),
            vec!["Employee".to_string(), "Manager".to_string()]
        );
    }

    #[test]
    fn test_equivalence_cycle_excludes_self() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        let ontology = Ontology::new(ONT)
            .with_class(StoredClassDefinition::named("Human").equivalent_to("Person"))
            .with_class(StoredClassDefinition::named("Person").sub_class_of("Agent"))
            .with_class(StoredClassDefinition::named("Agent"));
        kv.run(|tx| store.load(&ontology, tx)).unwrap();

        let tx = kv.begin();
        let supers = store.super_classes(ONT, "Human", &tx).unwrap();
        // The equivalence cycle collapses: Person and Agent are above
        // Human, Human is not above itself
        assert!(supers.contains("Person"));
        assert!(supers.contains("Agent"));
        assert!(!supers.contains("Human"));
        let person_supers = store.super_classes(ONT, "Person", &tx).unwrap();
        assert!(person_supers.contains("Human"));
        assert!(!person_supers.contains("Person"));
    }

    #[test]
    fn test_inverse_and_transitive_markers() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        kv.run(|tx| store.load(&company_ontology(), tx)).unwrap();

        let tx = kv.begin();
        assert_eq!(
            store.inverse_of(ONT, "manages", &tx).unwrap(),
            Some("managedBy".to_string())
        );
        assert_eq!(
            store.inverse_of(ONT, "managedBy", &tx).unwrap(),
            Some("manages".to_string())
        );
        assert!(store.is_transitive(ONT, "partOf", &tx).unwrap());
        assert!(!store.is_transitive(ONT, "manages", &tx).unwrap());
    }

    #[test]
    fn test_chain_ids_monotonic() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        kv.run(|tx| store.load(&Ontology::new(ONT), tx)).unwrap();

        let ids = kv
            .run(|tx| {
                let a = store.add_chain(
                    ONT,
                    "uncle",
                    &["father".to_string(), "brother".to_string()],
                    tx,
                )?;
                let b = store.add_chain(
                    ONT,
                    "uncle",
                    &["mother".to_string(), "brother".to_string()],
                    tx,
                )?;
                Ok((a, b))
            })
            .unwrap();
        assert!(ids.1 > ids.0);

        let tx = kv.begin();
        let chains = store.chains_for(ONT, "uncle", &tx).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0], vec!["father".to_string(), "brother".to_string()]);
    }

    #[test]
    fn test_property_hierarchy() {
        let kv = MemoryKv::new();
        let store = OntologyStore::new(&Subspace::root());
        let ontology = Ontology::new(ONT)
            .with_property(StoredPropertyDefinition::named("hasParent").sub_property_of("hasAncestor"))
            .with_property(StoredPropertyDefinition::named("hasAncestor").sub_property_of("relatedTo"))
            .with_property(StoredPropertyDefinition::named("relatedTo"));
        kv.run(|tx| store.load(&ontology, tx)).unwrap();

        let tx = kv.begin();
        let supers = store.super_properties(ONT, "hasParent", &tx).unwrap();
        assert!(supers.contains("hasAncestor"));
        assert!(supers.contains("relatedTo"));
    }
}
