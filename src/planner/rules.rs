//! Optimizer Rules and Search
//!
//! Top-down branch-and-bound exploration over the memo. Transformation
//! rules (logical to logical): filter merge, filter pushdown through
//! joins, filter-to-index-scan extraction, join commutativity and
//! associativity, projection pruning. Implementation rules (logical to
//! physical): sequential scan, index scan, index-only scan, filter,
//! the three join algorithms, sort, limit, projection, distinct.
//!
//! Ordering requirements propagate as required properties: scans
//! deliver their key order, order-preserving operators pass the
//! requirement through, and the sort implementation elides itself when
//! its child can deliver the order natively. A per-query deadline aborts
//! the search; the best complete plan found so far survives the abort.

use crate::config::PlannerConfig;
use crate::error::{Error, Result};
use crate::index::scalar::{FieldBound, ScalarQuery};
use crate::index::{IndexDescriptor, IndexKind, IndexRegistry};
use crate::planner::cost::CostModel;
use crate::planner::memo::{
    ExprId, GroupId, JoinKind, LogicalOp, MExpr, Memo, Operator, PhysicalOp, Schema, SortProps,
    Winner,
};
use crate::planner::query::{
    Analysis, CompareOp, FieldCondition, Predicate, Query, QueryAnalyzer, SortKey,
};
use crate::record::{RecordRegistry, RecordType};
use crate::stats::StatisticsStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// A finished physical plan extracted from the memo.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalPlan {
    pub op: PhysicalOp,
    pub children: Vec<PhysicalPlan>,
    pub estimated_rows: f64,
    pub estimated_cost: f64,
}

impl PhysicalPlan {
    /// Names of every index the plan reads.
    pub fn used_indexes(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_indexes(&mut out);
        out
    }

    fn collect_indexes(&self, out: &mut BTreeSet<String>) {
        match &self.op {
            PhysicalOp::IndexScan { index, .. } | PhysicalOp::IndexOnlyScan { index, .. } => {
                out.insert(index.clone());
            }
            _ => {}
        }
        for child in &self.children {
            child.collect_indexes(out);
        }
    }

    /// Total estimated record fetches (zero for index-only plans).
    pub fn estimated_record_fetches(&self) -> f64 {
        let own = match &self.op {
            PhysicalOp::SeqScan { .. } => self.estimated_rows,
            PhysicalOp::IndexScan { .. } => self.estimated_rows,
            _ => 0.0,
        };
        own + self.children.iter().map(|c| c.estimated_record_fetches()).sum::<f64>()
    }

    /// Render the plan as an indented tree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(0, &mut out);
        out
    }

    fn render_into(&self, depth: usize, out: &mut String) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(self.op.name());
        match &self.op {
            PhysicalOp::SeqScan { type_name, .. } => {
                out.push_str(&format!(" on {type_name}"));
            }
            PhysicalOp::IndexScan { index, .. } | PhysicalOp::IndexOnlyScan { index, .. } => {
                out.push_str(&format!(" using {index}"));
            }
            _ => {}
        }
        out.push_str(&format!(
            " (rows={:.0}, cost={:.2})\n",
            self.estimated_rows, self.estimated_cost
        ));
        for child in &self.children {
            child.render_into(depth + 1, out);
        }
    }
}

/// Everything one optimization run needs.
pub struct Optimizer<'a> {
    config: &'a PlannerConfig,
    stats: &'a StatisticsStore,
    indexes: &'a IndexRegistry,
    records: &'a RecordRegistry,
    memo: Memo,
    /// Query projection, consulted by the index-only rule
    projection: Option<Vec<String>>,
    hint_index: Option<String>,
    deadline: Instant,
}

impl<'a> Optimizer<'a> {
    pub fn new(
        config: &'a PlannerConfig,
        stats: &'a StatisticsStore,
        indexes: &'a IndexRegistry,
        records: &'a RecordRegistry,
    ) -> Self {
        let deadline = Instant::now() + std::time::Duration::from_millis(config.timeout_ms);
        Optimizer {
            config,
            stats,
            indexes,
            records,
            memo: Memo::new(),
            projection: None,
            hint_index: None,
            deadline,
        }
    }

    fn model(&self) -> CostModel<'a> {
        CostModel::new(self.config, self.stats, self.indexes)
    }

    fn check_deadline(&self) -> Result<()> {
        if Instant::now() > self.deadline {
            return Err(Error::PlanningTimeout {
                elapsed_ms: self.config.timeout_ms,
            });
        }
        Ok(())
    }

    // ── Logical tree construction ──────────────────────────────────────

    /// Build the initial logical tree for a single-type query.
    pub fn build_query(&mut self, query: &Query) -> Result<GroupId> {
        let ty = self.records.get(&query.record_type)?;
        QueryAnalyzer::analyze(query, &ty)?;
        self.projection = query.projection.clone();
        self.hint_index = query.hints.use_index.clone();

        let schema = Schema {
            type_name: ty.name().to_string(),
            fields: ty.field_names().iter().cloned().collect(),
        };
        let (mut group, _) = self.memo.insert_logical(
            LogicalOp::Scan { type_name: ty.name().to_string() },
            vec![],
            schema.clone(),
        );
        if !query.predicate.is_trivially_true() {
            let (g, _) = self.memo.insert_logical(
                LogicalOp::Filter { predicate: query.predicate.clone() },
                vec![group],
                schema.clone(),
            );
            group = g;
        }
        if !query.sort.is_empty() {
            let (g, _) = self.memo.insert_logical(
                LogicalOp::Sort { keys: query.sort.clone() },
                vec![group],
                schema.clone(),
            );
            group = g;
        }
        if let Some(fields) = &query.projection {
            let narrowed = Schema {
                type_name: schema.type_name.clone(),
                fields: fields.iter().cloned().collect(),
            };
            let (g, _) = self.memo.insert_logical(
                LogicalOp::Project { fields: fields.clone() },
                vec![group],
                narrowed,
            );
            group = g;
        }
        if query.distinct {
            let child_schema = self.memo.group(group).schema.clone();
            let (g, _) =
                self.memo
                    .insert_logical(LogicalOp::Distinct, vec![group], child_schema);
            group = g;
        }
        if query.limit.is_some() || query.offset.is_some() {
            let child_schema = self.memo.group(group).schema.clone();
            let (g, _) = self.memo.insert_logical(
                LogicalOp::Limit {
                    limit: query.limit,
                    offset: query.offset.unwrap_or(0),
                },
                vec![group],
                child_schema,
            );
            group = g;
        }
        Ok(group)
    }

    /// Programmatic join tree for multi-type plans.
    pub fn build_join(
        &mut self,
        left: GroupId,
        right: GroupId,
        kind: JoinKind,
        left_field: &str,
        right_field: &str,
    ) -> GroupId {
        let schema = self
            .memo
            .group(left)
            .schema
            .merge(&self.memo.group(right).schema);
        let (group, _) = self.memo.insert_logical(
            LogicalOp::Join {
                kind,
                left_field: left_field.to_string(),
                right_field: right_field.to_string(),
            },
            vec![left, right],
            schema,
        );
        group
    }

    /// Wrap a group in a filter (for join-tree construction).
    pub fn wrap_filter(&mut self, group: GroupId, predicate: Predicate) -> GroupId {
        let schema = self.memo.group(group).schema.clone();
        let (g, _) = self
            .memo
            .insert_logical(LogicalOp::Filter { predicate }, vec![group], schema);
        g
    }

    /// Scan group for a registered type (join-tree construction).
    pub fn scan_group(&mut self, type_name: &str) -> Result<GroupId> {
        let ty = self.records.get(type_name)?;
        let schema = Schema {
            type_name: ty.name().to_string(),
            fields: ty.field_names().iter().cloned().collect(),
        };
        let (g, _) = self.memo.insert_logical(
            LogicalOp::Scan { type_name: ty.name().to_string() },
            vec![],
            schema,
        );
        Ok(g)
    }

    // ── Top-level search ───────────────────────────────────────────────

    /// Optimize a group and extract the winning plan. On timeout the
    /// best complete plan found so far is returned if one exists.
    pub fn optimize(&mut self, root: GroupId) -> Result<PhysicalPlan> {
        let result = self.optimize_group(root, &vec![], f64::INFINITY);
        match result {
            Ok(Some(_)) => self.extract(root, &vec![]),
            Ok(None) => Err(Error::MemoInconsistency(format!(
                "no implementation produced a plan for {root}"
            ))),
            Err(Error::PlanningTimeout { elapsed_ms }) => {
                if self.memo.group(root).winner(&vec![]).is_some() {
                    tracing::debug!(elapsed_ms, "planning_timeout_best_so_far");
                    self.extract(root, &vec![])
                } else {
                    Err(Error::PlanningTimeout { elapsed_ms })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Returns the winner for the required properties, `None` when the
    /// group cannot satisfy them.
    fn optimize_group(
        &mut self,
        group: GroupId,
        required: &SortProps,
        upper: f64,
    ) -> Result<Option<Winner>> {
        if let Some(winner) = self.memo.group(group).winner(required) {
            return Ok(Some(winner));
        }
        self.check_deadline()?;
        self.explore(group)?;

        let logical: Vec<ExprId> = self.memo.group(group).logical.clone();
        let mut best: Option<Winner> = None;
        for expr_id in logical {
            self.check_deadline()?;
            let expr = self.memo.expr(expr_id).clone();
            let Operator::Logical(op) = &expr.op else { continue };
            let upper_here = best.map(|w| w.cost).unwrap_or(upper);
            let candidates = self.implementations(group, op, &expr.children, required)?;
            for (physical, children) in candidates {
                let outcome = self.cost_physical(
                    group,
                    physical,
                    &children,
                    required,
                    upper_here.min(best.map(|w| w.cost).unwrap_or(f64::INFINITY)),
                )?;
                if let Some(winner) = outcome {
                    if best.map(|b| winner.cost < b.cost).unwrap_or(true) {
                        best = Some(winner);
                    }
                }
            }
        }
        if let Some(winner) = best {
            self.memo.offer_winner(group, required.clone(), winner);
            tracing::trace!(group = group.0, cost = winner.cost, "memo_winner");
        }
        Ok(self.memo.group(group).winner(required))
    }

    /// Cost one physical candidate: optimize children under the props
    /// the operator demands, prune against the upper bound, and offer
    /// the result as a winner when it covers the requirement.
    fn cost_physical(
        &mut self,
        group: GroupId,
        op: PhysicalOp,
        children: &[GroupId],
        required: &SortProps,
        upper: f64,
    ) -> Result<Option<Winner>> {
        let child_props = child_required(&op, required);
        let mut child_cost = 0.0;
        let mut child_rows = Vec::with_capacity(children.len());
        for (i, &child) in children.iter().enumerate() {
            let props = child_props.get(i).cloned().unwrap_or_default();
            let child_upper = upper - child_cost - self.model().lower_bound(&op);
            let Some(winner) = self.optimize_group(child, &props, child_upper)? else {
                return Ok(None);
            };
            child_cost += winner.cost;
            child_rows.push(winner.rows);
            if child_cost > upper {
                // Branch-and-bound prune
                return Ok(None);
            }
        }

        let type_name = self.memo.group(group).schema.type_name.clone();
        let local = self.model().op_cost(&op, &type_name, &child_rows);
        let total = local.cost + child_cost;
        if total > upper {
            return Ok(None);
        }
        if !self.delivers(&op, required) {
            return Ok(None);
        }
        let expr = self.memo.insert_physical(group, op, children.to_vec());
        let winner = Winner { expr, cost: total, rows: local.rows };
        self.memo.offer_winner(group, required.clone(), winner);
        Ok(Some(winner))
    }

    /// Whether a physical operator (with children optimized under
    /// `child_required`) delivers the required sort properties.
    fn delivers(&self, op: &PhysicalOp, required: &SortProps) -> bool {
        if required.is_empty() {
            return true;
        }
        match op {
            PhysicalOp::Sort { keys, .. } => props_cover(keys, required),
            PhysicalOp::SeqScan { type_name, .. } => {
                let Ok(ty) = self.records.get(type_name) else { return false };
                let natural: Vec<SortKey> =
                    ty.key_fields().iter().map(SortKey::asc).collect();
                props_cover(&natural, required)
            }
            PhysicalOp::IndexScan { index, scalar, .. }
            | PhysicalOp::IndexOnlyScan { index, scalar, .. } => {
                let Ok(descriptor) = self.indexes.get(index) else { return false };
                props_cover(&index_order(&descriptor, scalar), required)
            }
            // Order preservers pass the requirement to their child
            PhysicalOp::Filter { .. }
            | PhysicalOp::Limit { .. }
            | PhysicalOp::Projection { .. }
            | PhysicalOp::DistinctAggregate => true,
            PhysicalOp::NestedLoopJoin { .. }
            | PhysicalOp::HashJoin { .. }
            | PhysicalOp::MergeJoin { .. } => false,
        }
    }

    // ── Exploration (transformation rules) ─────────────────────────────

    fn explore(&mut self, group: GroupId) -> Result<()> {
        if self.memo.group(group).explored {
            return Ok(());
        }
        self.memo.group_mut(group).explored = true;
        let mut worklist: Vec<ExprId> = self.memo.group(group).logical.clone();
        while let Some(expr_id) = worklist.pop() {
            self.check_deadline()?;
            let expr = self.memo.expr(expr_id).clone();
            let Operator::Logical(op) = &expr.op else { continue };
            let generated = self.transform(group, op, &expr.children)?;
            for (new_op, new_children) in generated {
                if let Some(id) = self.memo.insert_logical_into(group, new_op, new_children) {
                    worklist.push(id);
                }
            }
        }
        Ok(())
    }

    /// Apply every transformation rule to one logical expression,
    /// in descending promise order.
    fn transform(
        &mut self,
        group: GroupId,
        op: &LogicalOp,
        children: &[GroupId],
    ) -> Result<Vec<(LogicalOp, Vec<GroupId>)>> {
        let mut out = Vec::new();
        match op {
            LogicalOp::Filter { predicate } => {
                let child = children[0];
                // FilterToIndexScan has the highest promise
                out.extend(self.filter_to_index_access(predicate, child)?);
                out.extend(self.merge_filters(predicate, child));
                out.extend(self.push_filter_through_join(group, predicate, child)?);
            }
            LogicalOp::Scan { type_name } => {
                // Bare index access: useful when an index provides order
                for descriptor in self.scalar_indexes(type_name) {
                    out.push((
                        LogicalOp::IndexAccess {
                            index: descriptor.name.clone(),
                            scalar: ScalarQuery::full(),
                            residual: Predicate::True,
                        },
                        vec![],
                    ));
                }
            }
            LogicalOp::Join { kind: JoinKind::Inner, left_field, right_field } => {
                // Commutativity
                out.push((
                    LogicalOp::Join {
                        kind: JoinKind::Inner,
                        left_field: right_field.clone(),
                        right_field: left_field.clone(),
                    },
                    vec![children[1], children[0]],
                ));
                out.extend(self.associate_joins(left_field, right_field, children)?);
            }
            LogicalOp::Project { fields } => {
                // ProjectionPruning: collapse stacked projections
                let child = children[0];
                let grand: Vec<(Vec<String>, Vec<GroupId>)> = self
                    .memo
                    .group(child)
                    .logical
                    .iter()
                    .filter_map(|&e| {
                        let expr = self.memo.expr(e);
                        match &expr.op {
                            Operator::Logical(LogicalOp::Project { fields: inner }) => {
                                Some((inner.clone(), expr.children.clone()))
                            }
                            _ => None,
                        }
                    })
                    .collect();
                for (inner_fields, inner_children) in grand {
                    let narrowed: Vec<String> = fields
                        .iter()
                        .filter(|f| inner_fields.contains(f))
                        .cloned()
                        .collect();
                    out.push((LogicalOp::Project { fields: narrowed }, inner_children));
                }
            }
            _ => {}
        }
        Ok(out)
    }

    fn scalar_indexes(&self, type_name: &str) -> Vec<Arc<IndexDescriptor>> {
        self.indexes
            .for_type(type_name)
            .into_iter()
            .filter(|d| matches!(d.kind, IndexKind::Scalar | IndexKind::Covering { .. }))
            .filter(|d| {
                self.hint_index
                    .as_ref()
                    .map(|h| *h == d.name)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Filter(Scan) to IndexAccess for every applicable index.
    fn filter_to_index_access(
        &mut self,
        predicate: &Predicate,
        child: GroupId,
    ) -> Result<Vec<(LogicalOp, Vec<GroupId>)>> {
        let is_scan = self.memo.group(child).logical.iter().any(|&e| {
            matches!(
                self.memo.expr(e).op,
                Operator::Logical(LogicalOp::Scan { .. })
            )
        });
        if !is_scan {
            return Ok(Vec::new());
        }
        let type_name = self.memo.group(child).schema.type_name.clone();
        let Ok(ty) = self.records.get(&type_name) else {
            return Ok(Vec::new());
        };

        let mut analysis = Analysis::default();
        collect_into(predicate, &mut analysis);

        let mut out = Vec::new();
        for descriptor in self.scalar_indexes(&type_name) {
            let Some((scalar, residual)) = extract_scalar_query(&descriptor, &ty, &analysis)
            else {
                continue;
            };
            out.push((
                LogicalOp::IndexAccess {
                    index: descriptor.name.clone(),
                    scalar,
                    residual,
                },
                vec![],
            ));
        }
        Ok(out)
    }

    /// Filter(Filter(x)) to Filter(And) over x.
    fn merge_filters(
        &self,
        predicate: &Predicate,
        child: GroupId,
    ) -> Vec<(LogicalOp, Vec<GroupId>)> {
        let mut out = Vec::new();
        for &e in &self.memo.group(child).logical {
            if let Operator::Logical(LogicalOp::Filter { predicate: inner }) =
                &self.memo.expr(e).op
            {
                let merged =
                    Predicate::and(vec![predicate.clone(), inner.clone()]);
                out.push((
                    LogicalOp::Filter { predicate: merged },
                    self.memo.expr(e).children.clone(),
                ));
            }
        }
        out
    }

    /// Filter over Join: push conjuncts that reference only one side.
    fn push_filter_through_join(
        &mut self,
        _group: GroupId,
        predicate: &Predicate,
        child: GroupId,
    ) -> Result<Vec<(LogicalOp, Vec<GroupId>)>> {
        let joins: Vec<(JoinKind, String, String, Vec<GroupId>)> = self
            .memo
            .group(child)
            .logical
            .iter()
            .filter_map(|&e| {
                let expr = self.memo.expr(e);
                match &expr.op {
                    Operator::Logical(LogicalOp::Join { kind, left_field, right_field }) => Some((
                        *kind,
                        left_field.clone(),
                        right_field.clone(),
                        expr.children.clone(),
                    )),
                    _ => None,
                }
            })
            .collect();

        let mut out = Vec::new();
        for (kind, left_field, right_field, join_children) in joins {
            let left = join_children[0];
            let right = join_children[1];
            let left_fields = self.memo.group(left).schema.fields.clone();
            let right_fields = self.memo.group(right).schema.fields.clone();

            let conjuncts = flatten_and(predicate);
            let mut to_left = Vec::new();
            let mut to_right = Vec::new();
            let mut keep = Vec::new();
            for conjunct in conjuncts {
                let mut fields = BTreeSet::new();
                conjunct.referenced_fields(&mut fields);
                if !fields.is_empty() && fields.iter().all(|f| left_fields.contains(f)) {
                    to_left.push(conjunct);
                } else if !fields.is_empty() && fields.iter().all(|f| right_fields.contains(f)) {
                    to_right.push(conjunct);
                } else {
                    keep.push(conjunct);
                }
            }
            if to_left.is_empty() && to_right.is_empty() {
                continue;
            }
            let new_left = if to_left.is_empty() {
                left
            } else {
                let schema = self.memo.group(left).schema.clone();
                self.memo
                    .insert_logical(
                        LogicalOp::Filter { predicate: Predicate::and(to_left) },
                        vec![left],
                        schema,
                    )
                    .0
            };
            let new_right = if to_right.is_empty() {
                right
            } else {
                let schema = self.memo.group(right).schema.clone();
                self.memo
                    .insert_logical(
                        LogicalOp::Filter { predicate: Predicate::and(to_right) },
                        vec![right],
                        schema,
                    )
                    .0
            };
            let join_op = LogicalOp::Join {
                kind,
                left_field: left_field.clone(),
                right_field: right_field.clone(),
            };
            if keep.is_empty() {
                out.push((join_op, vec![new_left, new_right]));
            } else {
                let schema = self
                    .memo
                    .group(new_left)
                    .schema
                    .merge(&self.memo.group(new_right).schema);
                let (joined, _) =
                    self.memo
                        .insert_logical(join_op, vec![new_left, new_right], schema);
                out.push((
                    LogicalOp::Filter { predicate: Predicate::and(keep) },
                    vec![joined],
                ));
            }
        }
        Ok(out)
    }

    /// (A join B) join C to A join (B join C) when the outer key comes
    /// from B.
    fn associate_joins(
        &mut self,
        outer_left_field: &str,
        outer_right_field: &str,
        children: &[GroupId],
    ) -> Result<Vec<(LogicalOp, Vec<GroupId>)>> {
        let left = children[0];
        let right = children[1];
        let inner_joins: Vec<(String, String, Vec<GroupId>)> = self
            .memo
            .group(left)
            .logical
            .iter()
            .filter_map(|&e| {
                let expr = self.memo.expr(e);
                match &expr.op {
                    Operator::Logical(LogicalOp::Join {
                        kind: JoinKind::Inner,
                        left_field,
                        right_field,
                    }) => Some((left_field.clone(), right_field.clone(), expr.children.clone())),
                    _ => None,
                }
            })
            .collect();

        let mut out = Vec::new();
        for (inner_lf, inner_rf, inner_children) in inner_joins {
            let a = inner_children[0];
            let b = inner_children[1];
            // The outer join key must come from B to rotate
            if !self.memo.group(b).schema.fields.contains(outer_left_field) {
                continue;
            }
            let bc_schema = self.memo.group(b).schema.merge(&self.memo.group(right).schema);
            let (bc, _) = self.memo.insert_logical(
                LogicalOp::Join {
                    kind: JoinKind::Inner,
                    left_field: outer_left_field.to_string(),
                    right_field: outer_right_field.to_string(),
                },
                vec![b, right],
                bc_schema,
            );
            out.push((
                LogicalOp::Join {
                    kind: JoinKind::Inner,
                    left_field: inner_lf.clone(),
                    right_field: inner_rf.clone(),
                },
                vec![a, bc],
            ));
        }
        Ok(out)
    }

    // ── Implementation rules ───────────────────────────────────────────

    /// Physical candidates for one logical expression, most promising
    /// first.
    fn implementations(
        &mut self,
        group: GroupId,
        op: &LogicalOp,
        children: &[GroupId],
        _required: &SortProps,
    ) -> Result<Vec<(PhysicalOp, Vec<GroupId>)>> {
        let mut out: Vec<(PhysicalOp, Vec<GroupId>)> = Vec::new();
        match op {
            LogicalOp::Scan { type_name } => {
                out.push((
                    PhysicalOp::SeqScan {
                        type_name: type_name.clone(),
                        predicate: Predicate::True,
                    },
                    vec![],
                ));
            }
            LogicalOp::IndexAccess { index, scalar, residual } => {
                out.push((
                    PhysicalOp::IndexScan {
                        index: index.clone(),
                        scalar: scalar.clone(),
                        residual: residual.clone(),
                    },
                    vec![],
                ));
                // Reverse direction serves descending order requirements
                let mut reversed = scalar.clone();
                reversed.reverse = !reversed.reverse;
                out.push((
                    PhysicalOp::IndexScan {
                        index: index.clone(),
                        scalar: reversed.clone(),
                        residual: residual.clone(),
                    },
                    vec![],
                ));
                if self.index_only_applicable(group, index, residual) {
                    out.insert(
                        0,
                        (
                            PhysicalOp::IndexOnlyScan {
                                index: index.clone(),
                                scalar: scalar.clone(),
                                residual: residual.clone(),
                            },
                            vec![],
                        ),
                    );
                    out.push((
                        PhysicalOp::IndexOnlyScan {
                            index: index.clone(),
                            scalar: reversed,
                            residual: residual.clone(),
                        },
                        vec![],
                    ));
                }
            }
            LogicalOp::Filter { predicate } => {
                out.push((PhysicalOp::Filter { predicate: predicate.clone() }, children.to_vec()));
                // Fused filtered scan
                let scans: Vec<String> = self
                    .memo
                    .group(children[0])
                    .logical
                    .iter()
                    .filter_map(|&e| match &self.memo.expr(e).op {
                        Operator::Logical(LogicalOp::Scan { type_name }) => {
                            Some(type_name.clone())
                        }
                        _ => None,
                    })
                    .collect();
                for type_name in scans {
                    out.push((
                        PhysicalOp::SeqScan { type_name, predicate: predicate.clone() },
                        vec![],
                    ));
                }
            }
            LogicalOp::Sort { keys } => {
                // Elide the sort when the child can deliver the order
                let child_ordered =
                    self.optimize_group(children[0], keys, f64::INFINITY)?;
                if child_ordered.is_some() {
                    out.push((
                        PhysicalOp::Sort { keys: keys.clone(), input_sorted: true },
                        children.to_vec(),
                    ));
                }
                out.push((
                    PhysicalOp::Sort { keys: keys.clone(), input_sorted: false },
                    children.to_vec(),
                ));
            }
            LogicalOp::Limit { limit, offset } => {
                out.push((
                    PhysicalOp::Limit { limit: *limit, offset: *offset },
                    children.to_vec(),
                ));
            }
            LogicalOp::Project { fields } => {
                out.push((
                    PhysicalOp::Projection { fields: fields.clone() },
                    children.to_vec(),
                ));
            }
            LogicalOp::Distinct => {
                out.push((PhysicalOp::DistinctAggregate, children.to_vec()));
            }
            LogicalOp::Join { kind, left_field, right_field } => {
                out.push((
                    PhysicalOp::HashJoin {
                        kind: *kind,
                        left_field: left_field.clone(),
                        right_field: right_field.clone(),
                    },
                    children.to_vec(),
                ));
                out.push((
                    PhysicalOp::MergeJoin {
                        kind: *kind,
                        left_field: left_field.clone(),
                        right_field: right_field.clone(),
                    },
                    children.to_vec(),
                ));
                out.push((
                    PhysicalOp::NestedLoopJoin {
                        kind: *kind,
                        left_field: left_field.clone(),
                        right_field: right_field.clone(),
                    },
                    children.to_vec(),
                ));
            }
        }
        Ok(out)
    }

    /// Index-only scans require a fully covering index, a projection
    /// within the index's reachable fields, and a residual evaluable
    /// from those fields.
    fn index_only_applicable(&self, group: GroupId, index: &str, residual: &Predicate) -> bool {
        let Some(projection) = &self.projection else { return false };
        let Ok(descriptor) = self.indexes.get(index) else { return false };
        let type_name = &self.memo.group(group).schema.type_name;
        let Ok(ty) = self.records.get(type_name) else { return false };
        if !descriptor.is_fully_covering(&ty) {
            return false;
        }
        let mut reachable: BTreeSet<&str> =
            descriptor.reachable_fields().into_iter().collect();
        reachable.extend(ty.key_fields().iter().map(String::as_str));
        if !projection.iter().all(|f| reachable.contains(f.as_str())) {
            return false;
        }
        let mut residual_fields = BTreeSet::new();
        residual.referenced_fields(&mut residual_fields);
        residual_fields.iter().all(|f| reachable.contains(f.as_str()))
    }

    // ── Plan extraction ────────────────────────────────────────────────

    fn extract(&self, group: GroupId, required: &SortProps) -> Result<PhysicalPlan> {
        let winner = self.memo.required_winner(group, required)?;
        let expr: &MExpr = self.memo.expr(winner.expr);
        let Operator::Physical(op) = &expr.op else {
            return Err(Error::MemoInconsistency(format!(
                "winner of {group} is not physical"
            )));
        };
        let child_props = child_required(op, required);
        let mut children = Vec::with_capacity(expr.children.len());
        for (i, &child) in expr.children.iter().enumerate() {
            let props = child_props.get(i).cloned().unwrap_or_default();
            children.push(self.extract(child, &props)?);
        }
        Ok(PhysicalPlan {
            op: op.clone(),
            children,
            estimated_rows: winner.rows,
            estimated_cost: winner.cost,
        })
    }

    pub fn memo(&self) -> &Memo {
        &self.memo
    }
}

/// Bind a cached plan shape to a new query's literal values. Two
/// queries with the same fingerprint differ only in literals, so the
/// operator tree is reusable: scan bounds re-extract from the new
/// predicate, residuals and filters take the new predicate, and limit
/// and offset take the new values. Join shapes are not fingerprint
/// cached and report a bind failure, which makes the caller re-plan.
pub(crate) fn rebind_plan(
    plan: &PhysicalPlan,
    query: &Query,
    ty: &RecordType,
    indexes: &IndexRegistry,
) -> Result<PhysicalPlan> {
    let mut analysis = Analysis::default();
    collect_into(&query.predicate, &mut analysis);
    rebind_node(plan, query, ty, indexes, &analysis)
}

fn rebind_node(
    plan: &PhysicalPlan,
    query: &Query,
    ty: &RecordType,
    indexes: &IndexRegistry,
    analysis: &Analysis,
) -> Result<PhysicalPlan> {
    let bind_scan = |index: &String, scalar: &ScalarQuery| -> Result<(ScalarQuery, Predicate)> {
        if scalar.equality_prefix.is_empty() && scalar.bound.is_none() {
            // Bare order-driven scan: nothing to bind
            return Ok((
                ScalarQuery { reverse: scalar.reverse, limit: scalar.limit, ..Default::default() },
                Predicate::True,
            ));
        }
        let descriptor = indexes.get(index)?;
        let (mut bound, residual) =
            extract_scalar_query(&descriptor, ty, analysis).ok_or_else(|| {
                Error::InvalidQuery("cached plan shape no longer binds".into())
            })?;
        bound.reverse = scalar.reverse;
        bound.limit = scalar.limit;
        Ok((bound, residual))
    };

    let op = match &plan.op {
        PhysicalOp::SeqScan { type_name, predicate } => PhysicalOp::SeqScan {
            type_name: type_name.clone(),
            predicate: if predicate.is_trivially_true() {
                Predicate::True
            } else {
                query.predicate.clone()
            },
        },
        PhysicalOp::Filter { .. } => {
            PhysicalOp::Filter { predicate: query.predicate.clone() }
        }
        PhysicalOp::IndexScan { index, scalar, .. } => {
            let (scalar, residual) = bind_scan(index, scalar)?;
            PhysicalOp::IndexScan { index: index.clone(), scalar, residual }
        }
        PhysicalOp::IndexOnlyScan { index, scalar, .. } => {
            let (scalar, residual) = bind_scan(index, scalar)?;
            PhysicalOp::IndexOnlyScan { index: index.clone(), scalar, residual }
        }
        PhysicalOp::Limit { .. } => PhysicalOp::Limit {
            limit: query.limit,
            offset: query.offset.unwrap_or(0),
        },
        PhysicalOp::Sort { keys, input_sorted } => {
            PhysicalOp::Sort { keys: keys.clone(), input_sorted: *input_sorted }
        }
        PhysicalOp::Projection { fields } => PhysicalOp::Projection { fields: fields.clone() },
        PhysicalOp::DistinctAggregate => PhysicalOp::DistinctAggregate,
        PhysicalOp::NestedLoopJoin { .. }
        | PhysicalOp::HashJoin { .. }
        | PhysicalOp::MergeJoin { .. } => {
            return Err(Error::InvalidQuery("join plans are not rebindable".into()))
        }
    };
    let mut children = Vec::with_capacity(plan.children.len());
    for child in &plan.children {
        children.push(rebind_node(child, query, ty, indexes, analysis)?);
    }
    Ok(PhysicalPlan {
        op,
        children,
        estimated_rows: plan.estimated_rows,
        estimated_cost: plan.estimated_cost,
    })
}

/// The properties each child must satisfy for an operator optimized
/// under `required`.
fn child_required(op: &PhysicalOp, required: &SortProps) -> Vec<SortProps> {
    match op {
        PhysicalOp::Sort { keys, input_sorted } => {
            vec![if *input_sorted { keys.clone() } else { vec![] }]
        }
        PhysicalOp::Filter { .. }
        | PhysicalOp::Limit { .. }
        | PhysicalOp::Projection { .. }
        | PhysicalOp::DistinctAggregate => vec![required.clone()],
        PhysicalOp::NestedLoopJoin { .. }
        | PhysicalOp::HashJoin { .. }
        | PhysicalOp::MergeJoin { .. } => vec![vec![], vec![]],
        _ => vec![],
    }
}

/// Whether delivered sort keys cover a requirement (prefix match).
fn props_cover(delivered: &[SortKey], required: &[SortKey]) -> bool {
    required.len() <= delivered.len()
        && delivered.iter().zip(required).all(|(d, r)| d == r)
}

/// Sort order an index scan delivers: the key paths after the equality
/// prefix, flipped when scanning in reverse.
fn index_order(descriptor: &IndexDescriptor, scalar: &ScalarQuery) -> Vec<SortKey> {
    descriptor
        .key_paths
        .iter()
        .skip(scalar.equality_prefix.len())
        .map(|field| SortKey { field: field.clone(), descending: scalar.reverse })
        .collect()
}

/// Flatten a conjunction into its conjunct list.
fn flatten_and(predicate: &Predicate) -> Vec<Predicate> {
    match predicate {
        Predicate::And(ps) => ps.iter().flat_map(flatten_and).collect(),
        other => vec![other.clone()],
    }
}

/// Collect per-field conditions from a predicate: the analyzer's
/// top-level-conjunction walk, reused for filter-to-index extraction.
fn collect_into(predicate: &Predicate, analysis: &mut Analysis) {
    match predicate {
        Predicate::True => {}
        Predicate::And(ps) => {
            for p in ps {
                collect_into(p, analysis);
            }
        }
        Predicate::Compare { field, op, values } => {
            let condition = analysis.conditions.entry(field.clone()).or_default();
            let captured = match (op, values.first()) {
                (CompareOp::Eq, Some(v)) => {
                    condition.equals = Some(v.clone());
                    true
                }
                (CompareOp::Lt, Some(v)) => {
                    condition.upper = Some((v.clone(), false));
                    true
                }
                (CompareOp::Le, Some(v)) => {
                    condition.upper = Some((v.clone(), true));
                    true
                }
                (CompareOp::Gt, Some(v)) => {
                    condition.lower = Some((v.clone(), false));
                    true
                }
                (CompareOp::Ge, Some(v)) => {
                    condition.lower = Some((v.clone(), true));
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

/// Build the scalar query an index can answer from the analysis,
/// returning the residual predicate alongside. `None` when the index
/// captures nothing.
fn extract_scalar_query(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    analysis: &Analysis,
) -> Option<(ScalarQuery, Predicate)> {
    let mut equality_prefix = Vec::new();
    let mut bound: Option<FieldBound> = None;
    let mut used_equality: BTreeSet<&str> = BTreeSet::new();
    let mut bound_field: Option<&str> = None;

    for path in &descriptor.key_paths {
        let Ok(field) = ty.resolve_key_path(path) else { return None };
        let Some(condition) = analysis.conditions.get(field) else { break };
        if let Some(value) = &condition.equals {
            equality_prefix.push(value.clone());
            used_equality.insert(path.as_str());
            continue;
        }
        if condition.lower.is_some() || condition.upper.is_some() {
            bound = Some(FieldBound {
                lower: condition.lower.clone(),
                upper: condition.upper.clone(),
            });
            bound_field = Some(path.as_str());
        }
        break;
    }
    if equality_prefix.is_empty() && bound.is_none() {
        return None;
    }

    // Residual: uncapturable conjuncts plus conditions on fields the
    // scan does not constrain
    let mut residual = analysis.residual.clone();
    for (field, condition) in &analysis.conditions {
        let fully_captured = used_equality.contains(field.as_str());
        let bound_captured = bound_field == Some(field.as_str());
        if fully_captured {
            continue;
        }
        residual.extend(condition_predicates(field, condition, bound_captured));
    }
    Some((
        ScalarQuery { equality_prefix, bound, reverse: false, limit: None },
        Predicate::and(residual),
    ))
}

/// Regenerate the predicates a field condition represents. When the
/// range was captured by the scan, only the non-range aspects remain.
fn condition_predicates(
    field: &str,
    condition: &FieldCondition,
    range_captured: bool,
) -> Vec<Predicate> {
    let mut out = Vec::new();
    if let Some(value) = &condition.equals {
        out.push(Predicate::field(field, CompareOp::Eq, value.clone()));
    }
    if let Some(values) = &condition.in_set {
        out.push(Predicate::in_set(field, values.clone()));
    }
    if !range_captured {
        if let Some((value, inclusive)) = &condition.lower {
            let op = if *inclusive { CompareOp::Ge } else { CompareOp::Gt };
            out.push(Predicate::field(field, op, value.clone()));
        }
        if let Some((value, inclusive)) = &condition.upper {
            let op = if *inclusive { CompareOp::Le } else { CompareOp::Lt };
            out.push(Predicate::field(field, op, value.clone()));
        }
    }
    if let Some(nil) = condition.is_nil {
        out.push(if nil { Predicate::is_nil(field) } else { Predicate::is_not_nil(field) });
    }
    if let Some(prefix) = &condition.prefix {
        out.push(Predicate::field(field, CompareOp::Prefix, prefix.clone()));
    }
    out
}
