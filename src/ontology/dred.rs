//! Delete-and-Rederive (DRed)
//!
//! Incremental maintenance for the materialized inference set. On
//! base-triple deletion:
//!
//! 1. every transitively dependent inferred triple is marked
//!    tentatively deleted (the overestimate);
//! 2. each marked triple attempts re-derivation through alternative
//!    provenance whose antecedents all survive;
//! 3. survivors become `Rederived`, the rest become `Deleted` and their
//!    own dependents recurse into the overestimate.
//!
//! The dependency graph is a DAG by construction (an inference can
//! never be its own antecedent), so the fixpoint terminates. Every
//! loop ticks the caller's [`OpGuard`], and [`delete_base_batched`]
//! splits the marking and verdict phases across transactions so a wide
//! dependency fan-out stays inside the host's 5-second bound; the
//! chunk boundaries are the resumption checkpoints.

use crate::error::Result;
use crate::kv::{KvRead, KvStore, KvTransaction, OpGuard};
use crate::ontology::triples::{StoredTriple, Triple, TripleStatus, TripleStore};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Outcome of one deletion pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DredOutcome {
    pub deleted: Vec<Triple>,
    pub rederived: Vec<Triple>,
}

/// Transitive dependents of a triple (the overestimate BFS).
pub fn collect_dependents(
    store: &TripleStore,
    triple: &Triple,
    reader: &dyn KvRead,
    guard: &mut OpGuard,
) -> Result<BTreeSet<Triple>> {
    let mut doomed: BTreeSet<Triple> = BTreeSet::new();
    let mut queue: VecDeque<Triple> = VecDeque::new();
    queue.push_back(triple.clone());
    while let Some(current) = queue.pop_front() {
        guard.tick()?;
        for dependent in store.dependents_of(&current, reader)? {
            if doomed.insert(dependent.clone()) {
                queue.push_back(dependent);
            }
        }
    }
    Ok(doomed)
}

/// Invalidate every derivation that runs through the deleted base or
/// the overestimate, and mark the entry tentatively deleted.
fn invalidate_entry(entry: &mut StoredTriple, base: &Triple, doomed: &BTreeSet<Triple>) {
    for provenance in &mut entry.provenance {
        if provenance.antecedents.contains(base)
            || provenance.antecedents.iter().any(|a| doomed.contains(a))
        {
            provenance.valid = false;
        }
    }
    if !entry.asserted {
        entry.status = TripleStatus::TentativelyDeleted;
    }
}

/// Re-derivation fixpoint: a marked triple survives when some
/// derivation's antecedents are all alive (outside the overestimate, or
/// themselves already rederived).
fn rederive_fixpoint(
    base: &Triple,
    doomed: &BTreeSet<Triple>,
    marked: &mut BTreeMap<Triple, StoredTriple>,
    guard: &mut OpGuard,
) -> Result<BTreeSet<Triple>> {
    let mut rederived: BTreeSet<Triple> = BTreeSet::new();
    loop {
        let mut changed = false;
        for (candidate, entry) in marked.iter_mut() {
            guard.tick()?;
            if rederived.contains(candidate) || entry.asserted {
                continue;
            }
            let mut supported = false;
            for provenance in &mut entry.provenance {
                let alive = provenance.antecedents.iter().all(|antecedent| {
                    antecedent != base
                        && (!doomed.contains(antecedent) || rederived.contains(antecedent))
                });
                if alive {
                    provenance.valid = true;
                    supported = true;
                }
            }
            if supported {
                rederived.insert(candidate.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(rederived)
}

/// Write one marked triple's verdict.
fn commit_verdict(
    store: &TripleStore,
    candidate: &Triple,
    mut entry: StoredTriple,
    survives: bool,
    tx: &mut dyn KvTransaction,
    outcome: &mut DredOutcome,
) -> Result<()> {
    if entry.asserted || survives {
        entry.status = if entry.asserted {
            TripleStatus::Asserted
        } else {
            TripleStatus::Rederived
        };
        let asserted = entry.asserted;
        store.put(&entry, tx)?;
        if !asserted {
            outcome.rederived.push(candidate.clone());
        }
    } else {
        store.remove(candidate, tx)?;
        store.clear_dependencies_on(candidate, tx)?;
        outcome.deleted.push(candidate.clone());
    }
    Ok(())
}

/// The deleted base itself: gone unless an inference still supports it.
fn commit_base(
    store: &TripleStore,
    triple: &Triple,
    stored: &mut StoredTriple,
    tx: &mut dyn KvTransaction,
) -> Result<()> {
    if stored.provenance.iter().any(|p| p.valid) {
        stored.status = TripleStatus::Rederived;
        store.put(stored, tx)
    } else {
        store.remove(triple, tx)?;
        store.clear_dependencies_on(triple, tx)
    }
}

/// Delete a base triple and maintain the inference set within the
/// caller's transaction.
pub fn delete_base(
    store: &TripleStore,
    triple: &Triple,
    tx: &mut dyn KvTransaction,
    guard: &mut OpGuard,
) -> Result<DredOutcome> {
    let Some(mut stored) = store.get(triple, &*tx)? else {
        return Ok(DredOutcome::default());
    };
    stored.asserted = false;

    // Phase 1: overestimate, then mark
    let doomed = collect_dependents(store, triple, &*tx, guard)?;
    let mut marked: BTreeMap<Triple, StoredTriple> = BTreeMap::new();
    for candidate in &doomed {
        guard.tick()?;
        if let Some(mut entry) = store.get(candidate, &*tx)? {
            invalidate_entry(&mut entry, triple, &doomed);
            marked.insert(candidate.clone(), entry);
        }
    }
    commit_base(store, triple, &mut stored, tx)?;

    // Phase 2: rederive to fixpoint
    let rederived = rederive_fixpoint(triple, &doomed, &mut marked, guard)?;

    // Phase 3: commit the verdicts
    let mut outcome = DredOutcome::default();
    for (candidate, entry) in marked {
        guard.tick()?;
        let survives = rederived.contains(&candidate);
        commit_verdict(store, &candidate, entry, survives, tx, &mut outcome)?;
    }
    tracing::debug!(
        base = %triple,
        deleted = outcome.deleted.len(),
        rederived = outcome.rederived.len(),
        "dred_pass"
    );
    Ok(outcome)
}

/// Delete a base triple whose dependency fan-out is too wide for one
/// transaction: the marking and verdict phases commit in chunks of
/// `batch`, one transaction each. Between chunks the overestimate is
/// visible as tentatively-deleted (invisible) triples, which phase 3
/// resolves; re-running the retraction resumes from that state.
pub fn delete_base_batched(
    store: &TripleStore,
    triple: &Triple,
    kv: &dyn KvStore,
    batch: usize,
    guard: &mut OpGuard,
) -> Result<DredOutcome> {
    let batch = batch.max(1);

    // Phase 1a: read the base and walk the overestimate (reads only)
    let (mut stored, doomed) = {
        let tx = kv.transaction();
        let Some(stored) = store.get(triple, tx.as_ref())? else {
            return Ok(DredOutcome::default());
        };
        let doomed = collect_dependents(store, triple, tx.as_ref(), guard)?;
        (stored, doomed)
    };
    stored.asserted = false;

    // Phase 1b: mark in chunks, one transaction per chunk
    let mut marked: BTreeMap<Triple, StoredTriple> = BTreeMap::new();
    let doomed_list: Vec<Triple> = doomed.iter().cloned().collect();
    for chunk in doomed_list.chunks(batch) {
        let mut tx = kv.transaction();
        for candidate in chunk {
            guard.tick()?;
            if let Some(mut entry) = store.get(candidate, tx.as_ref())? {
                invalidate_entry(&mut entry, triple, &doomed);
                store.put(&entry, tx.as_mut())?;
                marked.insert(candidate.clone(), entry);
            }
        }
        tx.commit()?;
        tracing::debug!(marked = marked.len(), total = doomed_list.len(), "dred_mark_checkpoint");
    }
    {
        let mut tx = kv.transaction();
        commit_base(store, triple, &mut stored, tx.as_mut())?;
        tx.commit()?;
    }

    // Phase 2: in-memory fixpoint over the marked entries
    let rederived = rederive_fixpoint(triple, &doomed, &mut marked, guard)?;

    // Phase 3: commit verdicts in chunks
    let mut outcome = DredOutcome::default();
    let verdicts: Vec<(Triple, StoredTriple)> = marked.into_iter().collect();
    for chunk in verdicts.chunks(batch) {
        let mut tx = kv.transaction();
        for (candidate, entry) in chunk {
            guard.tick()?;
            let survives = rederived.contains(candidate);
            commit_verdict(store, candidate, entry.clone(), survives, tx.as_mut(), &mut outcome)?;
        }
        tx.commit()?;
    }
    tracing::debug!(
        base = %triple,
        deleted = outcome.deleted.len(),
        rederived = outcome.rederived.len(),
        "dred_batched_pass"
    );
    Ok(outcome)
}
