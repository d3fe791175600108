//! Graph Adjacency Index and Traversal
//!
//! Edge records project into two mirrors under the index subspace:
//!
//! - outgoing: `o / <src> / <label> / <tgt> -> ∅`
//! - incoming: `i / <tgt> / <label> / <src> -> ∅`
//!
//! The traverser offers 1-hop neighbors (a single range scan), budgeted
//! multi-hop BFS, and cursor-paginated BFS. Nodes at each depth are
//! sorted lexicographically before yielding, so the same query with the
//! same cursor deterministically produces the same page. BFS expands one
//! depth per transaction so any one transaction stays inside the host's
//! 5-second bound.

use crate::error::{Error, Result};
use crate::index::{key_path_values, IndexDescriptor};
use crate::kv::{KvRead, KvStore, OpGuard, RangeOptions};
use crate::record::{DynRecord, RecordType};
use crate::stats::hash_bytes;
use crate::subspace::Subspace;
use crate::tuple::{Tuple, TupleValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Edge direction relative to the queried node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    fn mirror(self) -> &'static str {
        match self {
            Direction::Outgoing => "o",
            Direction::Incoming => "i",
        }
    }
}

/// One adjacent node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Neighbor {
    pub node: TupleValue,
    pub label: String,
}

/// Map an edge record (src, label, tgt key paths, in that order) to both
/// mirrors.
pub fn entries(
    descriptor: &IndexDescriptor,
    ty: &RecordType,
    record: &DynRecord,
) -> Result<BTreeMap<Tuple, Vec<u8>>> {
    let values = key_path_values(descriptor, ty, record)?;
    let [src, label, tgt]: [TupleValue; 3] = values.0.try_into().map_err(|_| {
        Error::InvalidQuery(format!(
            "graph adjacency index '{}' requires (src, label, tgt) key paths",
            descriptor.name
        ))
    })?;
    let mut out = BTreeMap::new();
    out.insert(
        Tuple::new(vec!["o".into(), src.clone(), label.clone(), tgt.clone()]),
        Vec::new(),
    );
    out.insert(Tuple::new(vec!["i".into(), tgt, label, src]), Vec::new());
    Ok(out)
}

/// A multi-hop traversal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalQuery {
    pub start: TupleValue,
    pub max_depth: usize,
    /// Restrict edges to one label
    pub label: Option<String>,
    pub direction: Direction,
    /// Maximum nodes discovered per depth
    pub depth_budget: usize,
    /// Page size for paginated traversal
    pub page_size: usize,
}

impl TraversalQuery {
    pub fn from_node(start: impl Into<TupleValue>) -> Self {
        TraversalQuery {
            start: start.into(),
            max_depth: 3,
            label: None,
            direction: Direction::Outgoing,
            depth_budget: 10_000,
            page_size: 100,
        }
    }

    pub fn with_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Hash binding a cursor to the query that produced it.
    fn params_hash(&self) -> u64 {
        let bytes = bincode::serialize(self).unwrap_or_default();
        hash_bytes(&bytes)
    }
}

/// One discovered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalHit {
    pub node: TupleValue,
    pub depth: usize,
}

/// Resumable position inside a paginated traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub depth: usize,
    /// Index into the sorted node list of that depth
    pub offset: usize,
    params_hash: u64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let bytes = bincode::serialize(self).unwrap_or_default();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(text: &str) -> Result<Cursor> {
        if text.len() % 2 != 0 {
            return Err(Error::InvalidCursor("odd-length cursor".into()));
        }
        let bytes: Vec<u8> = (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::InvalidCursor("non-hex cursor".into()))?;
        bincode::deserialize(&bytes).map_err(|e| Error::InvalidCursor(e.to_string()))
    }
}

/// One page of a paginated traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalPage {
    pub hits: Vec<TraversalHit>,
    /// Present when more results remain
    pub next: Option<Cursor>,
}

/// Traversal operations over one adjacency index subspace.
pub struct GraphTraverser<'a> {
    subspace: &'a Subspace,
    guard: OpGuard,
}

impl<'a> GraphTraverser<'a> {
    pub fn new(subspace: &'a Subspace) -> Self {
        GraphTraverser { subspace, guard: OpGuard::unbounded() }
    }

    /// Attach a cancellation guard, checked as BFS expands nodes.
    pub fn with_guard(mut self, guard: OpGuard) -> Self {
        self.guard = guard;
        self
    }

    /// 1-hop neighbors: a single range scan over one mirror.
    pub fn neighbors(
        &self,
        reader: &dyn KvRead,
        node: &TupleValue,
        label: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Neighbor>> {
        let mut base = self.subspace.child(direction.mirror()).child(node.clone());
        if let Some(label) = label {
            base = base.child(label);
        }
        let (begin, end) = base.range();
        let mut out = Vec::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            let suffix = base.unpack(&key)?;
            let neighbor = match label {
                Some(l) => Neighbor {
                    label: l.to_string(),
                    node: suffix
                        .get(0)
                        .ok_or_else(|| Error::InvalidEncoding("bad adjacency key".into()))?
                        .clone(),
                },
                None => Neighbor {
                    label: suffix
                        .get(0)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| Error::InvalidEncoding("bad adjacency key".into()))?
                        .to_string(),
                    node: suffix
                        .get(1)
                        .ok_or_else(|| Error::InvalidEncoding("bad adjacency key".into()))?
                        .clone(),
                },
            };
            out.push(neighbor);
        }
        Ok(out)
    }

    /// BFS levels up to `max_depth`, one transaction per depth, each
    /// level sorted and capped by the depth budget.
    fn bfs_levels(&self, store: &dyn KvStore, query: &TraversalQuery) -> Result<Vec<Vec<TupleValue>>> {
        let mut visited: BTreeSet<TupleValue> = BTreeSet::new();
        visited.insert(query.start.clone());
        let mut levels: Vec<Vec<TupleValue>> = Vec::new();
        let mut frontier = vec![query.start.clone()];
        let mut guard = self.guard.clone();

        for depth in 1..=query.max_depth {
            if frontier.is_empty() {
                break;
            }
            let tx = store.transaction();
            let mut discovered: BTreeSet<TupleValue> = BTreeSet::new();
            for node in &frontier {
                guard.tick()?;
                for neighbor in
                    self.neighbors(tx.as_ref(), node, query.label.as_deref(), query.direction)?
                {
                    if !visited.contains(&neighbor.node) {
                        discovered.insert(neighbor.node);
                        if discovered.len() >= query.depth_budget {
                            break;
                        }
                    }
                }
                if discovered.len() >= query.depth_budget {
                    tracing::debug!(depth, budget = query.depth_budget, "bfs_depth_budget_hit");
                    break;
                }
            }
            drop(tx);
            visited.extend(discovered.iter().cloned());
            // BTreeSet iteration is already sorted; keep as the level order
            frontier = discovered.into_iter().collect();
            levels.push(frontier.clone());
        }
        Ok(levels)
    }

    /// Multi-hop BFS with a per-depth budget.
    pub fn traverse(
        &self,
        store: &dyn KvStore,
        query: &TraversalQuery,
    ) -> Result<Vec<TraversalHit>> {
        let levels = self.bfs_levels(store, query)?;
        Ok(levels
            .into_iter()
            .enumerate()
            .flat_map(|(i, level)| {
                level
                    .into_iter()
                    .map(move |node| TraversalHit { node, depth: i + 1 })
            })
            .collect())
    }

    /// Cursor-paginated BFS. Resuming with the returned cursor yields
    /// the exact continuation of this page; a cursor from a different
    /// query fails validation.
    pub fn traverse_paginated(
        &self,
        store: &dyn KvStore,
        query: &TraversalQuery,
        cursor: Option<&Cursor>,
    ) -> Result<TraversalPage> {
        let params_hash = query.params_hash();
        let (mut depth_ix, mut offset) = match cursor {
            Some(cursor) => {
                if cursor.params_hash != params_hash {
                    return Err(Error::InvalidCursor(
                        "cursor does not belong to this query".into(),
                    ));
                }
                (cursor.depth, cursor.offset)
            }
            None => (0, 0),
        };

        let levels = self.bfs_levels(store, query)?;
        let mut hits = Vec::with_capacity(query.page_size);
        while depth_ix < levels.len() && hits.len() < query.page_size {
            let level = &levels[depth_ix];
            while offset < level.len() && hits.len() < query.page_size {
                hits.push(TraversalHit { node: level[offset].clone(), depth: depth_ix + 1 });
                offset += 1;
            }
            if offset >= level.len() {
                depth_ix += 1;
                offset = 0;
            }
        }

        let exhausted =
            depth_ix >= levels.len() || (depth_ix == levels.len() - 1 && offset >= levels[depth_ix].len());
        let next = if exhausted {
            None
        } else {
            Some(Cursor { depth: depth_ix, offset, params_hash })
        };
        Ok(TraversalPage { hits, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexKind, IndexMaintainer, IndexRegistry};
    use crate::kv::MemoryKv;

    fn edge_type() -> RecordType {
        RecordType::new("edge", vec!["src", "label", "tgt"], vec!["src", "label", "tgt"])
    }

    fn descriptor() -> IndexDescriptor {
        IndexDescriptor::new(
            "idx_adj",
            vec!["src", "label", "tgt"],
            IndexKind::GraphAdjacency,
            vec!["edge"],
        )
    }

    fn seed(kv: &MemoryKv, root: &Subspace, edges: &[(&str, &str, &str)]) -> Subspace {
        let registry = IndexRegistry::new();
        let desc = registry.register(descriptor());
        let ty = edge_type();
        let maintainer = IndexMaintainer::new(root, &registry, None);
        kv.run(|tx| {
            for (src, label, tgt) in edges {
                let rec = DynRecord::new("edge")
                    .with("src", *src)
                    .with("label", *label)
                    .with("tgt", *tgt);
                maintainer.update(&ty, None, Some(&rec), tx)?;
            }
            Ok(())
        })
        .unwrap();
        desc.subspace(root)
    }

    fn names(hits: &[TraversalHit]) -> Vec<(String, usize)> {
        hits.iter()
            .map(|h| (h.node.as_str().unwrap().to_string(), h.depth))
            .collect()
    }

    #[test]
    fn test_one_hop_neighbors() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(
            &kv,
            &root,
            &[("a", "knows", "b"), ("a", "likes", "c"), ("b", "knows", "c")],
        );
        let traverser = GraphTraverser::new(&sub);
        let tx = kv.begin();

        let all = traverser
            .neighbors(&tx, &"a".into(), None, Direction::Outgoing)
            .unwrap();
        assert_eq!(all.len(), 2);

        let knows = traverser
            .neighbors(&tx, &"a".into(), Some("knows"), Direction::Outgoing)
            .unwrap();
        assert_eq!(knows.len(), 1);
        assert_eq!(knows[0].node.as_str(), Some("b"));

        // Incoming mirror
        let into_c = traverser
            .neighbors(&tx, &"c".into(), None, Direction::Incoming)
            .unwrap();
        let mut sources: Vec<&str> = into_c.iter().map(|n| n.node.as_str().unwrap()).collect();
        sources.sort();
        assert_eq!(sources, vec!["a", "b"]);
    }

    #[test]
    fn test_bfs_depths_and_dedup() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        // Diamond: a -> b, a -> c, b -> d, c -> d
        let sub = seed(
            &kv,
            &root,
            &[("a", "e", "b"), ("a", "e", "c"), ("b", "e", "d"), ("c", "e", "d")],
        );
        let traverser = GraphTraverser::new(&sub);
        let query = TraversalQuery::from_node("a").with_depth(3);
        let hits = traverser.traverse(&kv, &query).unwrap();
        assert_eq!(
            names(&hits),
            vec![
                ("b".to_string(), 1),
                ("c".to_string(), 1),
                ("d".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_cycle_terminates() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, &[("a", "e", "b"), ("b", "e", "a")]);
        let traverser = GraphTraverser::new(&sub);
        let hits = traverser
            .traverse(&kv, &TraversalQuery::from_node("a").with_depth(10))
            .unwrap();
        assert_eq!(names(&hits), vec![("b".to_string(), 1)]);
    }

    #[test]
    fn test_pagination_resumes_exactly() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let edges: Vec<(String, String, String)> = (0..7)
            .map(|i| ("a".to_string(), "e".to_string(), format!("n{i}")))
            .collect();
        let edge_refs: Vec<(&str, &str, &str)> = edges
            .iter()
            .map(|(s, l, t)| (s.as_str(), l.as_str(), t.as_str()))
            .collect();
        let sub = seed(&kv, &root, &edge_refs);
        let traverser = GraphTraverser::new(&sub);
        let query = TraversalQuery::from_node("a").with_depth(1).with_page_size(3);

        let full = traverser.traverse(&kv, &query).unwrap();
        let mut paged = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = traverser
                .traverse_paginated(&kv, &query, cursor.as_ref())
                .unwrap();
            assert!(page.hits.len() <= 3);
            paged.extend(page.hits);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(paged, full);
    }

    #[test]
    fn test_cursor_roundtrip_and_validation() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, &[("a", "e", "b"), ("a", "e", "c"), ("a", "e", "d")]);
        let traverser = GraphTraverser::new(&sub);
        let query = TraversalQuery::from_node("a").with_depth(1).with_page_size(2);
        let page = traverser.traverse_paginated(&kv, &query, None).unwrap();
        let cursor = page.next.unwrap();

        // Encode/decode roundtrip
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);

        // A different query rejects the cursor
        let other = TraversalQuery::from_node("a").with_depth(2).with_page_size(2);
        let err = traverser
            .traverse_paginated(&kv, &other, Some(&cursor))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCursor(_)));

        assert!(Cursor::decode("zz").is_err());
        assert!(Cursor::decode("abc").is_err());
    }

    #[test]
    fn test_cancelled_traversal_aborts() {
        use crate::error::Error;
        use crate::kv::{CancelHandle, OpGuard};

        let kv = MemoryKv::new();
        let root = Subspace::root();
        let sub = seed(&kv, &root, &[("a", "e", "b"), ("b", "e", "c")]);
        let cancel = CancelHandle::new();
        cancel.cancel();
        let traverser = GraphTraverser::new(&sub)
            .with_guard(OpGuard::new(cancel, None).with_yield_batch(1));
        let err = traverser
            .traverse(&kv, &TraversalQuery::from_node("a").with_depth(3))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_depth_budget_caps_level() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let edges: Vec<(String, String, String)> = (0..20)
            .map(|i| ("a".to_string(), "e".to_string(), format!("n{i:02}")))
            .collect();
        let edge_refs: Vec<(&str, &str, &str)> = edges
            .iter()
            .map(|(s, l, t)| (s.as_str(), l.as_str(), t.as_str()))
            .collect();
        let sub = seed(&kv, &root, &edge_refs);
        let traverser = GraphTraverser::new(&sub);
        let mut query = TraversalQuery::from_node("a").with_depth(1);
        query.depth_budget = 5;
        let hits = traverser.traverse(&kv, &query).unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_edge_delete_clears_both_mirrors() {
        let kv = MemoryKv::new();
        let root = Subspace::root();
        let registry = IndexRegistry::new();
        let desc = registry.register(descriptor());
        let ty = edge_type();
        let maintainer = IndexMaintainer::new(&root, &registry, None);
        let rec = DynRecord::new("edge")
            .with("src", "a")
            .with("label", "e")
            .with("tgt", "b");
        kv.run(|tx| {
            maintainer.update(&ty, None, Some(&rec), tx)?;
            maintainer.update(&ty, Some(&rec), None, tx)
        })
        .unwrap();
        let sub = desc.subspace(&root);
        let traverser = GraphTraverser::new(&sub);
        let tx = kv.begin();
        assert!(traverser
            .neighbors(&tx, &"a".into(), None, Direction::Outgoing)
            .unwrap()
            .is_empty());
        assert!(traverser
            .neighbors(&tx, &"b".into(), None, Direction::Incoming)
            .unwrap()
            .is_empty());
    }
}
