//! Cascades Memo
//!
//! The memo holds equivalence groups of logical and physical
//! expressions. An expression references child groups, never child
//! expressions, so equivalent subtrees are shared automatically.
//! Invariants:
//!
//! - groups are hash-consed: inserting a logical expression that is
//!   structurally identical to an existing one lands in the existing
//!   group;
//! - every physical expression carries a cost once optimized;
//! - the winner of a group under a required property set is the
//!   cheapest physical expression whose delivered properties cover the
//!   requirement.

use crate::error::{Error, Result};
use crate::index::scalar::ScalarQuery;
use crate::planner::query::{Predicate, SortKey};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Group identifier (index into the memo's group arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// Expression identifier (index into the memo's expression arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.0)
    }
}

/// Join variants (inner joins participate in commutativity and
/// associativity; left joins do not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    Left,
}

/// Logical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    Scan { type_name: String },
    Filter { predicate: Predicate },
    /// Access path extracted from a filtered scan
    IndexAccess { index: String, scalar: ScalarQuery, residual: Predicate },
    Project { fields: Vec<String> },
    Distinct,
    Sort { keys: Vec<SortKey> },
    Limit { limit: Option<usize>, offset: usize },
    Join { kind: JoinKind, left_field: String, right_field: String },
}

/// Physical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhysicalOp {
    SeqScan { type_name: String, predicate: Predicate },
    IndexScan { index: String, scalar: ScalarQuery, residual: Predicate },
    IndexOnlyScan { index: String, scalar: ScalarQuery, residual: Predicate },
    Filter { predicate: Predicate },
    Sort { keys: Vec<SortKey>, input_sorted: bool },
    Limit { limit: Option<usize>, offset: usize },
    NestedLoopJoin { kind: JoinKind, left_field: String, right_field: String },
    HashJoin { kind: JoinKind, left_field: String, right_field: String },
    MergeJoin { kind: JoinKind, left_field: String, right_field: String },
    Projection { fields: Vec<String> },
    DistinctAggregate,
}

impl PhysicalOp {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::SeqScan { .. } => "SeqScan",
            PhysicalOp::IndexScan { .. } => "IndexScan",
            PhysicalOp::IndexOnlyScan { .. } => "IndexOnlyScan",
            PhysicalOp::Filter { .. } => "Filter",
            PhysicalOp::Sort { .. } => "Sort",
            PhysicalOp::Limit { .. } => "Limit",
            PhysicalOp::NestedLoopJoin { .. } => "NestedLoopJoin",
            PhysicalOp::HashJoin { .. } => "HashJoin",
            PhysicalOp::MergeJoin { .. } => "MergeJoin",
            PhysicalOp::Projection { .. } => "Projection",
            PhysicalOp::DistinctAggregate => "DistinctAggregate",
        }
    }
}

/// Either side of the expression space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operator {
    Logical(LogicalOp),
    Physical(PhysicalOp),
}

/// A memo expression: an operator over child groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MExpr {
    pub op: Operator,
    pub children: Vec<GroupId>,
}

/// Output shape of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Record type producing the rows (left side for joins)
    pub type_name: String,
    pub fields: BTreeSet<String>,
}

impl Schema {
    pub fn merge(&self, other: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema { type_name: self.type_name.clone(), fields }
    }
}

/// Required or delivered physical properties.
pub type SortProps = Vec<SortKey>;

/// Winning physical expression for one property requirement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Winner {
    pub expr: ExprId,
    pub cost: f64,
    pub rows: f64,
}

/// One equivalence group.
#[derive(Debug)]
pub struct Group {
    pub logical: Vec<ExprId>,
    pub physical: Vec<ExprId>,
    pub explored: bool,
    pub schema: Schema,
    winners: HashMap<SortProps, Winner>,
}

impl Group {
    pub fn winner(&self, props: &SortProps) -> Option<Winner> {
        self.winners.get(props).copied()
    }
}

/// The memo itself. Owned by exactly one optimization; never shared
/// across queries.
pub struct Memo {
    groups: Vec<Group>,
    exprs: Vec<MExpr>,
    expr_group: Vec<GroupId>,
    dedup: HashMap<MExpr, ExprId>,
}

impl Memo {
    pub fn new() -> Self {
        Memo {
            groups: Vec::new(),
            exprs: Vec::new(),
            expr_group: Vec::new(),
            dedup: HashMap::new(),
        }
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.0]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.0]
    }

    pub fn expr(&self, id: ExprId) -> &MExpr {
        &self.exprs[id.0]
    }

    pub fn group_of(&self, expr: ExprId) -> GroupId {
        self.expr_group[expr.0]
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    /// Insert a logical expression, creating a new group unless the
    /// expression already exists (hash-consing).
    pub fn insert_logical(
        &mut self,
        op: LogicalOp,
        children: Vec<GroupId>,
        schema: Schema,
    ) -> (GroupId, ExprId) {
        let key = MExpr { op: Operator::Logical(op), children };
        if let Some(&existing) = self.dedup.get(&key) {
            return (self.expr_group[existing.0], existing);
        }
        let expr_id = ExprId(self.exprs.len());
        self.exprs.push(key.clone());
        self.dedup.insert(key, expr_id);
        let group_id = GroupId(self.groups.len());
        self.groups.push(Group {
            logical: vec![expr_id],
            physical: Vec::new(),
            explored: false,
            schema,
            winners: HashMap::new(),
        });
        self.expr_group.push(group_id);
        (group_id, expr_id)
    }

    /// Add an equivalent logical expression to an existing group.
    /// Returns `None` when the expression is already present somewhere.
    pub fn insert_logical_into(
        &mut self,
        group: GroupId,
        op: LogicalOp,
        children: Vec<GroupId>,
    ) -> Option<ExprId> {
        let key = MExpr { op: Operator::Logical(op), children };
        if let Some(&existing) = self.dedup.get(&key) {
            if self.expr_group[existing.0] != group {
                // The same shape surfaced in two groups; the groups are
                // semantically equal but this memo does not merge them
                tracing::trace!(expr = existing.0, "memo_duplicate_across_groups");
            }
            return None;
        }
        let expr_id = ExprId(self.exprs.len());
        self.exprs.push(key.clone());
        self.dedup.insert(key, expr_id);
        self.groups[group.0].logical.push(expr_id);
        self.expr_group.push(group);
        Some(expr_id)
    }

    /// Add a physical implementation to a group.
    pub fn insert_physical(
        &mut self,
        group: GroupId,
        op: PhysicalOp,
        children: Vec<GroupId>,
    ) -> ExprId {
        let key = MExpr { op: Operator::Physical(op), children };
        if let Some(&existing) = self.dedup.get(&key) {
            return existing;
        }
        let expr_id = ExprId(self.exprs.len());
        self.exprs.push(key.clone());
        self.dedup.insert(key, expr_id);
        self.groups[group.0].physical.push(expr_id);
        self.expr_group.push(group);
        expr_id
    }

    /// Record a winner if it beats the current one for these properties.
    pub fn offer_winner(
        &mut self,
        group: GroupId,
        props: SortProps,
        winner: Winner,
    ) -> bool {
        let winners = &mut self.groups[group.0].winners;
        match winners.get(&props) {
            Some(current) if current.cost <= winner.cost => false,
            _ => {
                winners.insert(props, winner);
                true
            }
        }
    }

    /// The winner for a property set; internal error when the group was
    /// explored but no winner exists.
    pub fn required_winner(&self, group: GroupId, props: &SortProps) -> Result<Winner> {
        self.groups[group.0]
            .winner(props)
            .ok_or(Error::WinnerMissing(group.0))
    }
}

impl Default for Memo {
    fn default() -> Self {
        Memo::new()
    }
}
