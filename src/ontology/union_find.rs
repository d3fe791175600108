//! Persistent Union-Find for `sameAs`
//!
//! Path-compressed with union by rank; parent pointers, ranks, and the
//! representative-to-members index all persist under the ontology's
//! sameAs section:
//!
//! ```text
//! 9 (sameAs) / 0 (parent)  / <ind>            -> <rep>
//!            / 1 (rank)    / <ind>            -> u32
//!            / 2 (members) / <rep> / <member> -> ∅
//! ```

use crate::error::{Error, Result};
use crate::kv::{KvRead, KvTransaction, RangeOptions};
use crate::ontology::Iri;
use crate::subspace::Subspace;
use crate::tuple::Tuple;
use std::collections::BTreeSet;

const IX_PARENT: i64 = 0;
const IX_RANK: i64 = 1;
const IX_MEMBERS: i64 = 2;

/// Union-find over individuals, keyed by IRI.
pub struct SameAsIndex {
    parent: Subspace,
    rank: Subspace,
    members: Subspace,
}

impl SameAsIndex {
    /// `section` is the ontology's sameAs subspace.
    pub fn new(section: &Subspace) -> Self {
        SameAsIndex {
            parent: section.child(IX_PARENT),
            rank: section.child(IX_RANK),
            members: section.child(IX_MEMBERS),
        }
    }

    fn parent_of(&self, individual: &str, reader: &dyn KvRead) -> Result<Option<Iri>> {
        match reader.get(&self.parent.pack(&Tuple::from_single(individual)))? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| Error::Codec(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn rank_of(&self, individual: &str, reader: &dyn KvRead) -> Result<u32> {
        match reader.get(&self.rank.pack(&Tuple::from_single(individual)))? {
            Some(bytes) => {
                let buf: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Codec("bad rank".into()))?;
                Ok(u32::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    /// Representative of an individual's equivalence class, with path
    /// compression written back into the transaction.
    pub fn find(&self, individual: &str, tx: &mut dyn KvTransaction) -> Result<Iri> {
        let mut path: Vec<Iri> = Vec::new();
        let mut current = individual.to_string();
        while let Some(parent) = self.parent_of(&current, &*tx)? {
            if parent == current {
                break;
            }
            path.push(current.clone());
            current = parent;
        }
        // Compress: every visited node points straight at the root
        for node in path {
            if node != current {
                tx.set(
                    &self.parent.pack(&Tuple::from_single(node.as_str())),
                    current.as_bytes(),
                )?;
            }
        }
        Ok(current)
    }

    /// Read-only representative lookup (no compression).
    pub fn representative(&self, individual: &str, reader: &dyn KvRead) -> Result<Iri> {
        let mut current = individual.to_string();
        while let Some(parent) = self.parent_of(&current, reader)? {
            if parent == current {
                break;
            }
            current = parent;
        }
        Ok(current)
    }

    /// Merge two equivalence classes by rank.
    pub fn union(&self, a: &str, b: &str, tx: &mut dyn KvTransaction) -> Result<Iri> {
        let root_a = self.find(a, tx)?;
        let root_b = self.find(b, tx)?;
        if root_a == root_b {
            return Ok(root_a);
        }
        let rank_a = self.rank_of(&root_a, &*tx)?;
        let rank_b = self.rank_of(&root_b, &*tx)?;
        let (winner, loser) = if rank_a >= rank_b {
            (root_a.clone(), root_b.clone())
        } else {
            (root_b.clone(), root_a.clone())
        };
        tx.set(
            &self.parent.pack(&Tuple::from_single(loser.as_str())),
            winner.as_bytes(),
        )?;
        if rank_a == rank_b {
            tx.set(
                &self.rank.pack(&Tuple::from_single(winner.as_str())),
                &(rank_a + 1).to_be_bytes(),
            )?;
        }

        // Fold the loser's member list into the winner's
        let mut moved: Vec<Iri> = vec![loser.clone()];
        let loser_members = self.members.child(loser.as_str());
        let (begin, end) = loser_members.range();
        let doomed: Vec<(Vec<u8>, Iri)> = tx
            .get_range(&begin, &end, RangeOptions::default())
            .map(|pair| {
                let (key, _) = pair?;
                let suffix = loser_members.unpack(&key)?;
                let member = suffix
                    .get(0)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::InvalidEncoding("bad member key".into()))?
                    .to_string();
                Ok((key, member))
            })
            .collect::<Result<_>>()?;
        for (key, member) in doomed {
            tx.clear(&key)?;
            moved.push(member);
        }
        let winner_members = self.members.child(winner.as_str());
        for member in moved {
            tx.set(&winner_members.pack(&Tuple::from_single(member.as_str())), &[])?;
        }
        // The winner itself is listed among its members
        tx.set(&winner_members.pack(&Tuple::from_single(winner.as_str())), &[])?;
        Ok(winner)
    }

    /// Every member of a representative's class (the representative
    /// included once anything was merged into it).
    pub fn members(&self, representative: &str, reader: &dyn KvRead) -> Result<BTreeSet<Iri>> {
        let space = self.members.child(representative);
        let (begin, end) = space.range();
        let mut out = BTreeSet::new();
        for pair in reader.get_range(&begin, &end, RangeOptions::default()) {
            let (key, _) = pair?;
            let suffix = space.unpack(&key)?;
            if let Some(member) = suffix.get(0).and_then(|v| v.as_str()) {
                out.insert(member.to_string());
            }
        }
        Ok(out)
    }

    /// Whether two individuals are in the same class.
    pub fn same(&self, a: &str, b: &str, reader: &dyn KvRead) -> Result<bool> {
        Ok(a == b || self.representative(a, reader)? == self.representative(b, reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn index() -> SameAsIndex {
        SameAsIndex::new(&Subspace::new(b"S".to_vec()))
    }

    #[test]
    fn test_singleton_is_own_representative() {
        let kv = MemoryKv::new();
        let index = index();
        let mut tx = kv.begin();
        assert_eq!(index.find("alice", &mut tx).unwrap(), "alice");
        assert!(index.same("alice", "alice", &tx).unwrap());
        assert!(!index.same("alice", "bob", &tx).unwrap());
    }

    #[test]
    fn test_union_merges_classes() {
        let kv = MemoryKv::new();
        let index = index();
        kv.run(|tx| {
            index.union("alice", "bob", tx)?;
            index.union("carol", "dave", tx)?;
            Ok(())
        })
        .unwrap();

        let tx = kv.begin();
        assert!(index.same("alice", "bob", &tx).unwrap());
        assert!(index.same("carol", "dave", &tx).unwrap());
        assert!(!index.same("alice", "carol", &tx).unwrap());
    }

    #[test]
    fn test_transitive_union() {
        let kv = MemoryKv::new();
        let index = index();
        kv.run(|tx| {
            index.union("a", "b", tx)?;
            index.union("b", "c", tx)?;
            index.union("c", "d", tx)?;
            Ok(())
        })
        .unwrap();
        let tx = kv.begin();
        assert!(index.same("a", "d", &tx).unwrap());
    }

    #[test]
    fn test_members_follow_merges() {
        let kv = MemoryKv::new();
        let index = index();
        let rep = kv
            .run(|tx| {
                index.union("a", "b", tx)?;
                index.union("c", "d", tx)?;
                index.union("a", "c", tx)
            })
            .unwrap();
        let tx = kv.begin();
        let members = index.members(&rep, &tx).unwrap();
        for individual in ["a", "b", "c", "d"] {
            assert!(
                members.contains(individual),
                "{individual} missing from {members:?}"
            );
        }
    }

    #[test]
    fn test_path_compression_persists() {
        let kv = MemoryKv::new();
        let index = index();
        kv.run(|tx| {
            index.union("a", "b", tx)?;
            index.union("b", "c", tx)?;
            index.union("c", "d", tx)?;
            // A find after the chain compresses the path
            index.find("a", tx)?;
            Ok(())
        })
        .unwrap();

        // After compression every node's parent is the root itself
        let tx = kv.begin();
        let root = index.representative("a", &tx).unwrap();
        for node in ["a", "b", "c", "d"] {
            if node == root {
                continue;
            }
            let parent = index.parent_of(node, &tx).unwrap();
            assert_eq!(parent, Some(root.clone()), "{node} not compressed");
        }
    }

    #[test]
    fn test_idempotent_union() {
        let kv = MemoryKv::new();
        let index = index();
        let r1 = kv.run(|tx| index.union("x", "y", tx)).unwrap();
        let r2 = kv.run(|tx| index.union("x", "y", tx)).unwrap();
        assert_eq!(r1, r2);
    }
}
