//! Query Model and Analysis
//!
//! A logical query is a typed predicate tree plus sort keys, limit and
//! offset, an optional projection, and hints. The analyzer normalizes
//! the predicate into per-field conjunctive conditions that index
//! selection consumes; whatever the conditions cannot capture stays as a
//! residual predicate evaluated after the scan.
//!
//! A query fingerprint is the structural shape with literal values
//! erased: two queries differing only in literals share a fingerprint
//! and therefore a cached plan.

use crate::error::{Error, Result};
use crate::record::{DynRecord, RecordType};
use crate::stats::hash_bytes;
use crate::tuple::TupleValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    IsNil,
    IsNotNil,
    Prefix,
    Contains,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::IsNil => "is_nil",
            CompareOp::IsNotNil => "is_not_nil",
            CompareOp::Prefix => "prefix",
            CompareOp::Contains => "contains",
        };
        f.write_str(s)
    }
}

/// A typed predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        field: String,
        op: CompareOp,
        /// One value for binary operators, any number for `In`, none
        /// for the nil tests
        values: Vec<TupleValue>,
    },
}

impl Predicate {
    pub fn field(field: impl Into<String>, op: CompareOp, value: impl Into<TupleValue>) -> Self {
        Predicate::Compare { field: field.into(), op, values: vec![value.into()] }
    }

    pub fn is_nil(field: impl Into<String>) -> Self {
        Predicate::Compare { field: field.into(), op: CompareOp::IsNil, values: vec![] }
    }

    pub fn is_not_nil(field: impl Into<String>) -> Self {
        Predicate::Compare { field: field.into(), op: CompareOp::IsNotNil, values: vec![] }
    }

    pub fn in_set(field: impl Into<String>, values: Vec<TupleValue>) -> Self {
        Predicate::Compare { field: field.into(), op: CompareOp::In, values }
    }

    pub fn and(preds: Vec<Predicate>) -> Self {
        match preds.len() {
            0 => Predicate::True,
            1 => preds.into_iter().next().expect("len checked"),
            _ => Predicate::And(preds),
        }
    }

    pub fn or(preds: Vec<Predicate>) -> Self {
        match preds.len() {
            0 => Predicate::False,
            1 => preds.into_iter().next().expect("len checked"),
            _ => Predicate::Or(preds),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn is_trivially_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Every field name the predicate references.
    pub fn referenced_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::True | Predicate::False => {}
            Predicate::And(ps) | Predicate::Or(ps) => {
                for p in ps {
                    p.referenced_fields(out);
                }
            }
            Predicate::Not(p) => p.referenced_fields(out),
            Predicate::Compare { field, .. } => {
                out.insert(field.clone());
            }
        }
    }

    /// Evaluate against a record. Missing fields read as null.
    pub fn eval(&self, ty: &RecordType, record: &DynRecord) -> Result<bool> {
        match self {
            Predicate::True => Ok(true),
            Predicate::False => Ok(false),
            Predicate::And(ps) => {
                for p in ps {
                    if !p.eval(ty, record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(ps) => {
                for p in ps {
                    if p.eval(ty, record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(p) => Ok(!p.eval(ty, record)?),
            Predicate::Compare { field, op, values } => {
                let actual = ty.field_value(record, field)?;
                Ok(compare(actual, *op, values))
            }
        }
    }

    /// Evaluate without a type descriptor: unknown fields read as null.
    /// Used over joined rows whose schema spans multiple types.
    pub fn eval_dyn(&self, record: &DynRecord) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(ps) => ps.iter().all(|p| p.eval_dyn(record)),
            Predicate::Or(ps) => ps.iter().any(|p| p.eval_dyn(record)),
            Predicate::Not(p) => !p.eval_dyn(record),
            Predicate::Compare { field, op, values } => {
                let actual = record.get(field).unwrap_or(&TupleValue::Null);
                compare(actual, *op, values)
            }
        }
    }
}

fn compare(actual: &TupleValue, op: CompareOp, values: &[TupleValue]) -> bool {
    match op {
        CompareOp::IsNil => actual.is_null(),
        CompareOp::IsNotNil => !actual.is_null(),
        CompareOp::In => values.iter().any(|v| v == actual),
        CompareOp::Prefix => match (actual, values.first()) {
            (TupleValue::String(s), Some(TupleValue::String(prefix))) => s.starts_with(prefix),
            _ => false,
        },
        CompareOp::Contains => match (actual, values.first()) {
            (TupleValue::String(s), Some(TupleValue::String(needle))) => s.contains(needle),
            _ => false,
        },
        CompareOp::Eq | CompareOp::Ne | CompareOp::Lt | CompareOp::Le | CompareOp::Gt
        | CompareOp::Ge => {
            let Some(expected) = values.first() else { return false };
            // Comparisons against null are never satisfied
            if actual.is_null() {
                return false;
            }
            let ordering = actual.cmp(expected);
            match op {
                CompareOp::Eq => ordering.is_eq(),
                CompareOp::Ne => ordering.is_ne(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        SortKey { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortKey { field: field.into(), descending: true }
    }
}

/// Planner hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryHints {
    /// Restrict index selection to this index
    pub use_index: Option<String>,
}

/// A logical query over one record type.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub record_type: String,
    pub predicate: Predicate,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub projection: Option<Vec<String>>,
    pub distinct: bool,
    pub hints: QueryHints,
}

impl Query {
    pub fn new(record_type: impl Into<String>) -> Self {
        Query {
            record_type: record_type.into(),
            predicate: Predicate::True,
            sort: Vec::new(),
            limit: None,
            offset: None,
            projection: None,
            distinct: false,
            hints: QueryHints::default(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = match self.predicate {
            Predicate::True => predicate,
            existing => Predicate::And(vec![existing, predicate]),
        };
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn project(mut self, fields: Vec<&str>) -> Self {
        self.projection = Some(fields.into_iter().map(String::from).collect());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_index_hint(mut self, index: impl Into<String>) -> Self {
        self.hints.use_index = Some(index.into());
        self
    }
}

// ── Analysis ───────────────────────────────────────────────────────────

/// Conjunctive conditions on one field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldCondition {
    pub equals: Option<TupleValue>,
    pub in_set: Option<Vec<TupleValue>>,
    pub lower: Option<(TupleValue, bool)>,
    pub upper: Option<(TupleValue, bool)>,
    pub is_nil: Option<bool>,
    pub prefix: Option<String>,
}

impl FieldCondition {
    fn tighten_lower(&mut self, value: TupleValue, inclusive: bool) {
        let replace = match &self.lower {
            None => true,
            Some((current, current_inc)) => {
                value > *current || (value == *current && *current_inc && !inclusive)
            }
        };
        if replace {
            self.lower = Some((value, inclusive));
        }
    }

    fn tighten_upper(&mut self, value: TupleValue, inclusive: bool) {
        let replace = match &self.upper {
            None => true,
            Some((current, current_inc)) => {
                value < *current || (value == *current && *current_inc && !inclusive)
            }
        };
        if replace {
            self.upper = Some((value, inclusive));
        }
    }
}

/// Derived view of a query used by index selection and costing.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Per-field conjunctive conditions from the top-level conjunction
    pub conditions: BTreeMap<String, FieldCondition>,
    /// Conjuncts the conditions could not capture
    pub residual: Vec<Predicate>,
    pub referenced_fields: BTreeSet<String>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Normalizes a query's predicate into an [`Analysis`].
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn analyze(query: &Query, ty: &RecordType) -> Result<Analysis> {
        let mut analysis = Analysis {
            sort: query.sort.clone(),
            limit: query.limit,
            offset: query.offset,
            ..Analysis::default()
        };
        query
            .predicate
            .referenced_fields(&mut analysis.referenced_fields);
        for field in &analysis.referenced_fields {
            if !ty.has_field(field) {
                return Err(Error::UnknownField {
                    record_type: ty.name().to_string(),
                    field: field.clone(),
                });
            }
        }
        for field in &query.sort {
            if !ty.has_field(&field.field) {
                return Err(Error::UnknownField {
                    record_type: ty.name().to_string(),
                    field: field.field.clone(),
                });
            }
        }
        Self::collect(&query.predicate, &mut analysis);
        Ok(analysis)
    }

    /// Walk the top-level conjunction; disjunctions and negations stay
    /// residual as a whole.
    fn collect(predicate: &Predicate, analysis: &mut Analysis) {
        match predicate {
            Predicate::True => {}
            Predicate::And(ps) => {
                for p in ps {
                    Self::collect(p, analysis);
                }
            }
            Predicate::Compare { field, op, values } => {
                let condition = analysis.conditions.entry(field.clone()).or_default();
                let captured = match (op, values.first()) {
                    (CompareOp::Eq, Some(v)) => {
                        condition.equals = Some(v.clone());
                        true
                    }
                    (CompareOp::In, _) if !values.is_empty() => {
                        condition.in_set = Some(values.clone());
                        true
                    }
                    (CompareOp::Lt, Some(v)) => {
                        condition.tighten_upper(v.clone(), false);
                        true
                    }
                    (CompareOp::Le, Some(v)) => {
                        condition.tighten_upper(v.clone(), true);
                        true
                    }
                    (CompareOp::Gt, Some(v)) => {
                        condition.tighten_lower(v.clone(), false);
                        true
                    }
                    (CompareOp::Ge, Some(v)) => {
                        condition.tighten_lower(v.clone(), true);
                        true
                    }
                    (CompareOp::IsNil, _) => {
                        condition.is_nil = Some(true);
                        true
                    }
                    (CompareOp::IsNotNil, _) => {
                        condition.is_nil = Some(false);
                        true
                    }
                    (CompareOp::Prefix, Some(TupleValue::String(p))) => {
                        condition.prefix = Some(p.clone());
                        true
                    }
                    _ => false,
                };
                if !captured {
                    analysis.residual.push(predicate.clone());
                }
            }
            other => analysis.residual.push(other.clone()),
        }
    }
}

// ── Fingerprint ────────────────────────────────────────────────────────

/// Structural hash of a query with literal values erased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryFingerprint {
    pub type_name: String,
    pub shape_hash: u64,
}

impl QueryFingerprint {
    pub fn of(query: &Query) -> QueryFingerprint {
        let mut shape = String::new();
        shape.push_str(&query.record_type);
        shape.push('|');
        write_predicate_shape(&query.predicate, &mut shape);
        shape.push('|');
        for key in &query.sort {
            shape.push_str(&key.field);
            shape.push(if key.descending { '-' } else { '+' });
        }
        shape.push('|');
        shape.push(if query.limit.is_some() { 'L' } else { '.' });
        shape.push(if query.offset.is_some() { 'O' } else { '.' });
        shape.push(if query.distinct { 'D' } else { '.' });
        if let Some(projection) = &query.projection {
            shape.push('|');
            for field in projection {
                shape.push_str(field);
                shape.push(',');
            }
        }
        if let Some(index) = &query.hints.use_index {
            shape.push('|');
            shape.push_str(index);
        }
        QueryFingerprint {
            type_name: query.record_type.clone(),
            shape_hash: hash_bytes(shape.as_bytes()),
        }
    }
}

/// Operators and field names survive; values are erased.
fn write_predicate_shape(predicate: &Predicate, out: &mut String) {
    match predicate {
        Predicate::True => out.push('T'),
        Predicate::False => out.push('F'),
        Predicate::And(ps) => {
            out.push_str("and(");
            for p in ps {
                write_predicate_shape(p, out);
                out.push(',');
            }
            out.push(')');
        }
        Predicate::Or(ps) => {
            out.push_str("or(");
            for p in ps {
                write_predicate_shape(p, out);
                out.push(',');
            }
            out.push(')');
        }
        Predicate::Not(p) => {
            out.push_str("not(");
            write_predicate_shape(p, out);
            out.push(')');
        }
        Predicate::Compare { field, op, .. } => {
            out.push_str(field);
            out.push(' ');
            out.push_str(&op.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_type() -> RecordType {
        RecordType::new("user", vec!["id", "name", "age"], vec!["id"])
    }

    #[test]
    fn test_eval_comparisons() {
        let ty = user_type();
        let rec = DynRecord::new("user")
            .with("id", "u1")
            .with("name", "Alice")
            .with("age", 25i64);
        let cases = [
            (Predicate::field("age", CompareOp::Eq, 25i64), true),
            (Predicate::field("age", CompareOp::Gt, 20i64), true),
            (Predicate::field("age", CompareOp::Lt, 20i64), false),
            (Predicate::field("name", CompareOp::Prefix, "Al"), true),
            (Predicate::field("name", CompareOp::Contains, "lic"), true),
            (Predicate::in_set("age", vec![24i64.into(), 25i64.into()]), true),
            (Predicate::is_nil("name"), false),
        ];
        for (predicate, expected) in cases {
            assert_eq!(predicate.eval(&ty, &rec).unwrap(), expected, "{predicate:?}");
        }
    }

    #[test]
    fn test_eval_null_semantics() {
        let ty = user_type();
        let rec = DynRecord::new("user").with("id", "u1");
        assert!(Predicate::is_nil("age").eval(&ty, &rec).unwrap());
        assert!(!Predicate::field("age", CompareOp::Gt, 1i64).eval(&ty, &rec).unwrap());
        assert!(!Predicate::field("age", CompareOp::Eq, 0i64).eval(&ty, &rec).unwrap());
    }

    #[test]
    fn test_eval_boolean_composition() {
        let ty = user_type();
        let rec = DynRecord::new("user").with("id", "u1").with("age", 25i64);
        let p = Predicate::and(vec![
            Predicate::field("age", CompareOp::Ge, 20i64),
            Predicate::or(vec![
                Predicate::field("age", CompareOp::Gt, 30i64),
                Predicate::field("age", CompareOp::Eq, 25i64),
            ]),
        ]);
        assert!(p.eval(&ty, &rec).unwrap());
        assert!(!p.clone().negate().eval(&ty, &rec).unwrap());
    }

    #[test]
    fn test_analysis_captures_conjunction() {
        let ty = user_type();
        let query = Query::new("user").filter(Predicate::and(vec![
            Predicate::field("age", CompareOp::Gt, 20i64),
            Predicate::field("age", CompareOp::Le, 40i64),
            Predicate::field("name", CompareOp::Eq, "Alice"),
        ]));
        let analysis = QueryAnalyzer::analyze(&query, &ty).unwrap();
        let age = &analysis.conditions["age"];
        assert_eq!(age.lower, Some((TupleValue::Int(20), false)));
        assert_eq!(age.upper, Some((TupleValue::Int(40), true)));
        let name = &analysis.conditions["name"];
        assert_eq!(name.equals, Some(TupleValue::String("Alice".into())));
        assert!(analysis.residual.is_empty());
    }

    #[test]
    fn test_analysis_tightens_bounds() {
        let ty = user_type();
        let query = Query::new("user").filter(Predicate::and(vec![
            Predicate::field("age", CompareOp::Gt, 10i64),
            Predicate::field("age", CompareOp::Gt, 20i64),
            Predicate::field("age", CompareOp::Ge, 20i64),
        ]));
        let analysis = QueryAnalyzer::analyze(&query, &ty).unwrap();
        // The strict bound at 20 wins over both the looser and the
        // inclusive one
        assert_eq!(
            analysis.conditions["age"].lower,
            Some((TupleValue::Int(20), false))
        );
    }

    #[test]
    fn test_analysis_keeps_disjunction_residual() {
        let ty = user_type();
        let query = Query::new("user").filter(Predicate::and(vec![
            Predicate::field("age", CompareOp::Gt, 20i64),
            Predicate::or(vec![
                Predicate::field("name", CompareOp::Eq, "Alice"),
                Predicate::field("name", CompareOp::Eq, "Bob"),
            ]),
        ]));
        let analysis = QueryAnalyzer::analyze(&query, &ty).unwrap();
        assert!(analysis.conditions.contains_key("age"));
        assert_eq!(analysis.residual.len(), 1);
        assert!(matches!(analysis.residual[0], Predicate::Or(_)));
    }

    #[test]
    fn test_analysis_rejects_unknown_field() {
        let ty = user_type();
        let query = Query::new("user").filter(Predicate::field("wage", CompareOp::Eq, 1i64));
        assert!(matches!(
            QueryAnalyzer::analyze(&query, &ty),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn test_fingerprint_erases_values() {
        let a = Query::new("user")
            .filter(Predicate::field("age", CompareOp::Gt, 25i64))
            .sort_by(SortKey::asc("name"))
            .limit(10);
        let b = Query::new("user")
            .filter(Predicate::field("age", CompareOp::Gt, 99i64))
            .sort_by(SortKey::asc("name"))
            .limit(5);
        assert_eq!(QueryFingerprint::of(&a), QueryFingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_shape() {
        let base = Query::new("user").filter(Predicate::field("age", CompareOp::Gt, 25i64));
        let other_op = Query::new("user").filter(Predicate::field("age", CompareOp::Ge, 25i64));
        let other_field = Query::new("user").filter(Predicate::field("id", CompareOp::Gt, 25i64));
        let with_limit = base.clone().limit(1);
        let fp = QueryFingerprint::of(&base);
        assert_ne!(fp, QueryFingerprint::of(&other_op));
        assert_ne!(fp, QueryFingerprint::of(&other_field));
        assert_ne!(fp, QueryFingerprint::of(&with_limit));
    }
}
