//! Transactional KV Abstraction
//!
//! The host KV store is an external collaborator: serializable
//! transactions, snapshot reads, lexicographic range scans, and a hard
//! 5-second transaction lifetime. This module defines the traits the rest
//! of the engine programs against, plus [`MemoryKv`], an in-process
//! ordered store with the same semantics used by every test.
//!
//! Range scans are demand-driven: the returned iterator is the pull
//! boundary, and a slow consumer never forces the producer to buffer an
//! unbounded prefix.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One key-value pair from a range scan.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy stream of range-scan results.
pub type KvStream<'a> = Box<dyn Iterator<Item = Result<KvPair>> + 'a>;

/// Options for a range scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Maximum number of pairs to yield
    pub limit: Option<usize>,
    /// Yield in descending key order
    pub reverse: bool,
}

impl RangeOptions {
    pub fn limited(limit: usize) -> Self {
        RangeOptions { limit: Some(limit), reverse: false }
    }

    pub fn reversed() -> Self {
        RangeOptions { limit: None, reverse: true }
    }
}

/// Read surface shared by snapshots and transactions.
pub trait KvRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Lexicographic scan over `[begin, end)`.
    fn get_range<'a>(&'a self, begin: &[u8], end: &[u8], options: RangeOptions) -> KvStream<'a>;
}

/// Writable transaction. All derived writes (index entries, inferred
/// triples) must go through the same transaction as the record mutation
/// that caused them.
pub trait KvTransaction: KvRead {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn clear(&mut self, key: &[u8]) -> Result<()>;
    fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()>;

    /// Atomically apply the transaction's writes. The transaction is
    /// spent afterwards; further operations error.
    fn commit(&mut self) -> Result<()>;

    /// Drop all buffered writes.
    fn rollback(&mut self);
}

/// A handle that can open transactions. Long-running work (bulk index
/// builds, materialization, multi-hop traversal) splits itself across
/// transactions obtained here, checkpointing between them.
pub trait KvStore: Send + Sync {
    fn transaction(&self) -> Box<dyn KvTransaction>;
}

// ── Cooperative cancellation ───────────────────────────────────────────

/// Cancellation handle shared with a long-running operation.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Guard threaded through CPU-heavy and KV-touching loops.
///
/// Checked cooperatively at batch boundaries: every `yield_batch` calls to
/// [`OpGuard::tick`] perform a cancellation and deadline check. A
/// cancelled operation performs no further KV work.
#[derive(Clone)]
pub struct OpGuard {
    cancel: CancelHandle,
    started: Instant,
    deadline: Option<Duration>,
    yield_batch: usize,
    ticks: usize,
}

impl OpGuard {
    pub fn new(cancel: CancelHandle, deadline: Option<Duration>) -> Self {
        OpGuard {
            cancel,
            started: Instant::now(),
            deadline,
            yield_batch: 1024,
            ticks: 0,
        }
    }

    /// Guard with no deadline and no external cancellation.
    pub fn unbounded() -> Self {
        OpGuard::new(CancelHandle::new(), None)
    }

    /// Guard bounded by the host transaction lifetime.
    pub fn transaction_scoped() -> Self {
        OpGuard::new(CancelHandle::new(), Some(Duration::from_secs(5)))
    }

    pub fn with_yield_batch(mut self, yield_batch: usize) -> Self {
        self.yield_batch = yield_batch.max(1);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Count one unit of work; check cancellation and deadline at batch
    /// boundaries.
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        if self.ticks % self.yield_batch == 0 {
            self.check()
        } else {
            Ok(())
        }
    }

    /// Unconditional cancellation and deadline check.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            let elapsed = self.started.elapsed();
            if elapsed > deadline {
                return Err(Error::TransactionExpired {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

// ── In-memory store ────────────────────────────────────────────────────

/// Limits applied to each [`MemoryTransaction`], emulating the host.
#[derive(Debug, Clone, Copy)]
pub struct TransactionLimits {
    /// Mutation budget per transaction
    pub op_budget: usize,
    /// Transaction lifetime
    pub lifetime: Duration,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        TransactionLimits {
            op_budget: 100_000,
            lifetime: Duration::from_secs(5),
        }
    }
}

/// Ordered in-process KV store with snapshot transactions.
///
/// Transactions read from a point-in-time snapshot overlaid with their own
/// writes (read-your-writes) and apply atomically on commit.
#[derive(Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    limits: Arc<RwLock<TransactionLimits>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }

    pub fn with_limits(limits: TransactionLimits) -> Self {
        MemoryKv {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            limits: Arc::new(RwLock::new(limits)),
        }
    }

    /// Begin a transaction against the current snapshot.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction {
            store: Arc::clone(&self.data),
            snapshot: self.data.read().clone(),
            writes: BTreeMap::new(),
            cleared: Vec::new(),
            limits: *self.limits.read(),
            started: Instant::now(),
            ops: 0,
            done: false,
        }
    }

    /// Run `f` inside a transaction, committing on success.
    pub fn run<T>(&self, f: impl FnOnce(&mut MemoryTransaction) -> Result<T>) -> Result<T> {
        let mut tx = self.begin();
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Number of live keys (test helper).
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn transaction(&self) -> Box<dyn KvTransaction> {
        Box::new(self.begin())
    }
}

/// A snapshot-isolated transaction over [`MemoryKv`].
pub struct MemoryTransaction {
    store: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Buffered writes: `Some` = set, `None` = cleared
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Ranges cleared by `clear_range`, in application order
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    limits: TransactionLimits,
    started: Instant,
    ops: usize,
    done: bool,
}

impl MemoryTransaction {
    fn charge(&mut self) -> Result<()> {
        if self.done {
            return Err(Error::Internal("transaction already finished".into()));
        }
        let elapsed = self.started.elapsed();
        if elapsed > self.limits.lifetime {
            return Err(Error::TransactionExpired { elapsed_ms: elapsed.as_millis() as u64 });
        }
        self.ops += 1;
        if self.ops > self.limits.op_budget {
            return Err(Error::OpBudgetExceeded {
                budget: self.limits.op_budget,
                used: self.ops,
            });
        }
        Ok(())
    }

    fn key_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|(begin, end)| key >= begin.as_slice() && key < end.as_slice())
    }
}

impl KvRead for MemoryTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Err(Error::Internal("transaction already finished".into()));
        }
        match self.writes.get(key) {
            Some(Some(value)) => Ok(Some(value.clone())),
            Some(None) => Ok(None),
            None => {
                if self.key_cleared(key) {
                    Ok(None)
                } else {
                    Ok(self.snapshot.get(key).cloned())
                }
            }
        }
    }

    fn get_range<'a>(&'a self, begin: &[u8], end: &[u8], options: RangeOptions) -> KvStream<'a> {
        if self.done {
            return Box::new(std::iter::once(Err(Error::Internal(
                "transaction already finished".into(),
            ))));
        }
        if begin >= end {
            return Box::new(std::iter::empty());
        }
        let range = begin.to_vec()..end.to_vec();
        let snap: BoxedPairs<'a> = {
            let iter = self
                .snapshot
                .range(range.clone())
                .filter(move |(k, _)| !self.key_cleared(k) && !self.writes.contains_key(*k))
                .map(|(k, v)| (k.as_slice(), v.as_slice()));
            if options.reverse {
                Box::new(iter.rev())
            } else {
                Box::new(iter)
            }
        };
        let writes: BoxedPairs<'a> = {
            let iter = self
                .writes
                .range(range)
                .filter_map(|(k, v)| v.as_deref().map(|v| (k.as_slice(), v)));
            if options.reverse {
                Box::new(iter.rev())
            } else {
                Box::new(iter)
            }
        };
        let merged = MergedRange {
            left: snap.peekable(),
            right: writes.peekable(),
            reverse: options.reverse,
        };
        let limit = options.limit.unwrap_or(usize::MAX);
        Box::new(
            merged
                .take(limit)
                .map(|(k, v)| Ok((k.to_vec(), v.to_vec()))),
        )
    }
}

type BoxedPairs<'a> = Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>;

/// Merge of two key-sorted streams; the right stream (buffered writes)
/// wins on equal keys.
struct MergedRange<'a> {
    left: Peekable<BoxedPairs<'a>>,
    right: Peekable<BoxedPairs<'a>>,
    reverse: bool,
}

impl<'a> Iterator for MergedRange<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        match (self.left.peek(), self.right.peek()) {
            (None, None) => None,
            (Some(_), None) => self.left.next(),
            (None, Some(_)) => self.right.next(),
            (Some((lk, _)), Some((rk, _))) => {
                if lk == rk {
                    self.left.next();
                    return self.right.next();
                }
                let left_first = if self.reverse { lk > rk } else { lk < rk };
                if left_first {
                    self.left.next()
                } else {
                    self.right.next()
                }
            }
        }
    }
}

impl KvTransaction for MemoryTransaction {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.charge()?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn clear(&mut self, key: &[u8]) -> Result<()> {
        self.charge()?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.charge()?;
        // Later sets re-add keys, so earlier buffered writes in the range
        // are dropped and the range itself is recorded.
        let keys: Vec<Vec<u8>> = self
            .writes
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.writes.remove(&key);
        }
        self.cleared.push((begin.to_vec(), end.to_vec()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.done {
            return Err(Error::Internal("transaction already finished".into()));
        }
        let elapsed = self.started.elapsed();
        if elapsed > self.limits.lifetime {
            return Err(Error::TransactionExpired { elapsed_ms: elapsed.as_millis() as u64 });
        }
        self.done = true;
        let mut data = self.store.write();
        for (begin, end) in self.cleared.drain(..) {
            let doomed: Vec<Vec<u8>> = data.range(begin..end).map(|(k, _)| k.clone()).collect();
            for key in doomed {
                data.remove(&key);
            }
        }
        for (key, value) in std::mem::take(&mut self.writes) {
            match value {
                Some(v) => {
                    data.insert(key, v);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        tracing::trace!(ops = self.ops, "kv_commit");
        Ok(())
    }

    fn rollback(&mut self) {
        self.done = true;
        self.writes.clear();
        self.cleared.clear();
    }
}
