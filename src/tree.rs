//! The public index type

use std::{
    fmt, io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{self as epoch, Guard};
use crossbeam_utils::Backoff;

use crate::{
    error::{Interrupt, NeedRestart},
    key::Key,
    nodes::{
        self,
        visitor::{
            DotPrinter, DotPrinterSettings, MalformedTreeError, NodeCensus, Recovery,
            RecoveryReport, TreeStatsCollector, TreeView, WellFormedChecker,
        },
        Ctx, InnerNode, InnerNode256, NodePtr, OpaqueNodePtr, Prefix,
    },
    pool::PmPool,
    reclaim::Reclaimer,
    Config, Error, Result, TreeConfig,
};

/// The outcome of a point mutation.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationResult {
    /// The tree was changed.
    Success,
    /// The key was already present, nothing was changed.
    Existed,
    /// The key was not present, nothing was changed.
    NotFound,
}

/// A monotonic counter shared by all threads using a tree.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters updated by the operations of a tree.
#[derive(Debug, Default)]
pub(crate) struct TreeStats {
    pub max_level: Counter,
    pub restarts: Counter,
    pub bucket_splits: Counter,
    pub fingerprint_splits: Counter,
    pub grown_nodes: Counter,
    pub prefix_recoveries: Counter,
}

/// A point-in-time copy of the counters of a [`Tree`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Deepest level of a fixed node seen by an insert.
    pub max_level: u64,
    /// Attempts that observed a concurrent change and started over.
    pub restarts: u64,
    /// Leaf buckets replaced by a node routing on their keys.
    pub bucket_splits: u64,
    /// Fingerprint buckets replaced by a fixed node.
    pub fingerprint_splits: u64,
    /// Fixed nodes replaced by a larger copy.
    pub grown_nodes: u64,
    /// Node prefixes rewritten from a leaf.
    pub prefix_recoveries: u64,
    /// Nodes, leaves and slice buffers handed to the reclaimer.
    pub retired: u64,
    /// Bytes handed out by the pool allocator so far.
    pub pool_used: u64,
    /// Bytes sitting in the pool free lists.
    pub pool_free: u64,
}

/// The result of a bounded range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeScan {
    /// The entries found, in ascending key order.
    pub entries: Vec<Key>,
    /// The key of the first entry that did not fit. Passing it as the start
    /// of the next scan resumes where this one stopped.
    pub continuation: Option<Box<[u8]>>,
}

/// A concurrent adaptive radix tree stored in a persistent pool.
///
/// Every method takes `&self`, a tree is shared between threads by reference
/// or through an [`Arc`]. Point operations are linearizable. Range scans are
/// consistent per chunk: every entry of a [`RangeScan`] was present at some
/// point during the scan.
///
/// # Examples
///
/// ```rust
/// use part::{Key, OperationResult, Tree, TreeConfig};
///
/// let tree = Tree::volatile(TreeConfig::default(), 1 << 22).unwrap();
///
/// assert_eq!(tree.insert(&Key::from(("apple", "1"))).unwrap(), OperationResult::Success);
/// assert_eq!(tree.insert(&Key::from(("apple", "2"))).unwrap(), OperationResult::Existed);
/// assert_eq!(tree.lookup(b"apple").as_deref(), Some(&b"1"[..]));
///
/// assert_eq!(tree.remove(b"apple"), OperationResult::Success);
/// assert_eq!(tree.lookup(b"apple"), None);
/// ```
pub struct Tree {
    pool: Arc<PmPool>,
    reclaimer: Reclaimer,
    config: TreeConfig,
    root: NodePtr<InnerNode256>,
    stats: TreeStats,
    recovery: Option<RecoveryReport>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("pool", &self.pool.path())
            .field("generation", &self.pool.generation())
            .field("config", &self.config)
            .field("root", &self.root)
            .finish()
    }
}

impl Tree {
    /// Open the tree stored in the pool described by `config`, creating the
    /// pool if it does not exist.
    ///
    /// An existing pool keeps the leaf layout it was created with. If
    /// [`TreeConfig::rebuild_on_open`] is set, reopening walks the whole tree
    /// to repair what a crash left behind.
    pub fn open(config: &Config) -> Result<Self> {
        let pool = PmPool::open(&config.pool, config.tree.leaf_layout)?;
        Self::with_pool(pool, config.tree.clone())
    }

    /// Create a tree in an anonymous pool of `capacity` bytes. Nothing is
    /// written to disk.
    pub fn volatile(config: TreeConfig, capacity: u64) -> Result<Self> {
        let pool = PmPool::anonymous(capacity, config.leaf_layout)?;
        Self::with_pool(pool, config)
    }

    fn with_pool(pool: PmPool, mut config: TreeConfig) -> Result<Self> {
        config.leaf_layout = pool.leaf_layout();
        let pool = Arc::new(pool);

        let root = match pool.root() {
            0 => {
                let root = InnerNode256::allocate(&pool, pool.generation(), 0, Prefix::empty())?;
                root.persist(&pool);
                if !pool.compare_exchange_root(0, root.to_opaque().to_raw()) {
                    return Err(invalid_pool(&pool, "root slot changed while it was created"));
                }
                root
            },
            raw => OpaqueNodePtr::from_raw(raw)
                .and_then(|root| root.cast::<InnerNode256>())
                .ok_or_else(|| invalid_pool(&pool, "root slot does not hold a 256-way node"))?,
        };

        let recovery = if pool.is_recovered() && config.rebuild_on_open {
            let guard = epoch::pin();
            let report = Recovery::run(
                TreeView::new(&pool, &guard),
                root.to_opaque(),
                pool.generation(),
            );
            tracing::info!(
                generation = pool.generation(),
                nodes = report.nodes,
                leaves = report.leaves,
                repaired_slots = report.repaired_slots,
                pruned = report.pruned,
                reclaimed_bytes = report.reclaimed_bytes,
                "rebuilt tree after reopen"
            );
            Some(report)
        } else {
            None
        };

        Ok(Tree {
            reclaimer: Reclaimer::new(Arc::clone(&pool)),
            pool,
            config,
            root,
            stats: TreeStats::default(),
            recovery,
        })
    }

    /// The pool holding the tree.
    pub fn pool(&self) -> &PmPool {
        &self.pool
    }

    /// The settings in effect. The leaf layout is the one recorded in the
    /// pool.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// What the rebuild pass did when the pool was reopened, if it ran.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.recovery
    }

    fn ctx<'a>(&'a self, guard: &'a Guard) -> Ctx<'a> {
        Ctx {
            pool: &self.pool,
            reclaimer: &self.reclaimer,
            guard,
            config: &self.config,
            stats: &self.stats,
            root: self.root,
            generation: self.pool.generation(),
        }
    }

    /// Run `attempt` until it completes without observing a concurrent
    /// modification.
    fn until_done<T>(&self, mut attempt: impl FnMut(&Ctx<'_>) -> Result<T, NeedRestart>) -> T {
        let backoff = Backoff::new();
        let mut guard = epoch::pin();
        loop {
            let result = attempt(&self.ctx(&guard));
            match result {
                Ok(output) => return output,
                Err(NeedRestart) => self.restarted(&backoff, &mut guard),
            }
        }
    }

    /// Like [`Tree::until_done`], for attempts that can also fail for good.
    fn try_until_done<T>(
        &self,
        mut attempt: impl FnMut(&Ctx<'_>) -> Result<T, Interrupt>,
    ) -> Result<T> {
        let backoff = Backoff::new();
        let mut guard = epoch::pin();
        loop {
            let result = attempt(&self.ctx(&guard));
            match result {
                Ok(output) => return Ok(output),
                Err(Interrupt::Fatal(err)) => return Err(err),
                Err(Interrupt::Restart) => self.restarted(&backoff, &mut guard),
            }
        }
    }

    fn restarted(&self, backoff: &Backoff, guard: &mut Guard) {
        self.stats.restarts.increment();
        tracing::trace!(restarts = self.stats.restarts.get(), "restarting operation");
        // Let retired nodes go before the next attempt
        guard.repin();
        backoff.snooze();
    }

    /// Return a copy of the value stored under `key`.
    pub fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        if key.is_empty() {
            return None;
        }
        self.until_done(|ctx| {
            let leaf = nodes::lookup(ctx, key)?;
            Ok(leaf.map(|leaf| leaf.value(ctx.pool, ctx.guard).to_vec()))
        })
    }

    /// Return true if `key` is stored in the tree.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        !key.is_empty() && self.until_done(|ctx| Ok(nodes::lookup(ctx, key)?.is_some()))
    }

    /// Insert `key` unless it is already present.
    ///
    /// # Errors
    ///  - [`Error::EmptyKey`] for a key without bytes.
    ///  - [`Error::KeyPrefixConflict`] if the key and another key on its path
    ///    are prefixes of each other, and the two cannot share a bucket.
    ///  - [`Error::PoolExhausted`] if the pool has no room for the new nodes.
    pub fn insert(&self, key: &Key) -> Result<OperationResult> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.try_until_done(|ctx| nodes::insert(ctx, key.key(), key.value()))
    }

    /// Remove `key`. Returns [`OperationResult::NotFound`] if it is absent.
    pub fn remove(&self, key: &[u8]) -> OperationResult {
        if key.is_empty() {
            return OperationResult::NotFound;
        }
        self.until_done(|ctx| nodes::remove(ctx, key))
    }

    /// Replace the value of an existing key. Returns
    /// [`OperationResult::NotFound`] if it is absent.
    ///
    /// # Errors
    ///  - [`Error::PoolExhausted`] if the pool has no room for the new leaf.
    pub fn update(&self, key: &Key) -> Result<OperationResult> {
        if key.is_empty() {
            return Ok(OperationResult::NotFound);
        }
        self.try_until_done(|ctx| nodes::update(ctx, key.key(), key.value()))
    }

    /// Collect up to `capacity` entries with keys in `start..end`, in ascending
    /// order. A missing bound leaves that side of the range open.
    ///
    /// If more entries are left, [`RangeScan::continuation`] holds the key to
    /// pass as `start` to continue the scan.
    pub fn lookup_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        capacity: usize,
    ) -> RangeScan {
        let mut entries = self.until_done(|ctx| {
            nodes::scan(ctx, start, end, capacity.saturating_add(1))
        });

        let continuation = if entries.len() > capacity {
            entries.pop().map(|next| Box::from(next.key()))
        } else {
            None
        };
        RangeScan {
            entries,
            continuation,
        }
    }

    /// Iterate over the entries with keys in `start..end`, fetching `chunk`
    /// entries at a time.
    ///
    /// Each chunk is a separate scan, so entries inserted or removed behind
    /// the iterator may or may not be observed.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, chunk: usize) -> RangeIter<'_> {
        RangeIter {
            tree: self,
            next_start: Some(start.map(Box::from)),
            end: end.map(Box::from),
            chunk: chunk.max(1),
            buffered: Vec::new().into_iter(),
        }
    }

    /// Read the counters of the tree.
    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.stats;
        StatsSnapshot {
            max_level: stats.max_level.get(),
            restarts: stats.restarts.get(),
            bucket_splits: stats.bucket_splits.get(),
            fingerprint_splits: stats.fingerprint_splits.get(),
            grown_nodes: stats.grown_nodes.get(),
            prefix_recoveries: stats.prefix_recoveries.get(),
            retired: self.reclaimer.retired(),
            pool_used: self.pool.bump() - crate::pool::DATA_START,
            pool_free: self.pool.free_bytes(),
        }
    }

    /// Take a census of the nodes of the tree.
    pub fn tree_stats(&self) -> NodeCensus {
        TreeStatsCollector::collect(self)
    }

    /// Check the structural invariants of the tree, returning the number of
    /// entries.
    pub fn check_well_formed(&self) -> Result<usize, MalformedTreeError> {
        WellFormedChecker::check(self)
    }

    /// Write the tree in Graphviz dot format.
    pub fn write_dot<O: io::Write>(&self, output: O, settings: DotPrinterSettings) -> io::Result<()> {
        DotPrinter::print_tree(output, self, settings)
    }

    /// Run `f` with the pool, a pinned guard and the root of the tree.
    pub(crate) fn with_view<R>(&self, f: impl FnOnce(TreeView<'_>, OpaqueNodePtr) -> R) -> R {
        let guard = epoch::pin();
        f(TreeView::new(&self.pool, &guard), self.root.to_opaque())
    }
}

fn invalid_pool(pool: &PmPool, reason: &str) -> Error {
    Error::InvalidPool {
        path: pool.path().map(Path::to_path_buf).unwrap_or_default(),
        reason: reason.into(),
    }
}

/// An iterator over a key range, see [`Tree::range`].
pub struct RangeIter<'t> {
    tree: &'t Tree,
    /// Start of the next chunk, `None` once the range is exhausted.
    next_start: Option<Option<Box<[u8]>>>,
    end: Option<Box<[u8]>>,
    chunk: usize,
    buffered: std::vec::IntoIter<Key>,
}

impl Iterator for RangeIter<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.next() {
                return Some(entry);
            }

            let start = self.next_start.take()?;
            let scan = self
                .tree
                .lookup_range(start.as_deref(), self.end.as_deref(), self.chunk);
            self.next_start = scan.continuation.map(Some);
            if scan.entries.is_empty() && self.next_start.is_none() {
                return None;
            }
            self.buffered = scan.entries.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeafLayout;

    fn tree() -> Tree {
        Tree::volatile(TreeConfig::default(), 1 << 22).unwrap()
    }

    #[test]
    fn counters() {
        let counter = Counter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);

        counter.record_max(7);
        counter.record_max(3);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn empty_key_is_rejected() {
        let tree = tree();
        assert!(matches!(
            tree.insert(&Key::from(("", "v"))),
            Err(Error::EmptyKey)
        ));
        assert_eq!(tree.lookup(b""), None);
        assert_eq!(tree.remove(b""), OperationResult::NotFound);
        assert_eq!(
            tree.update(&Key::from(("", "v"))).unwrap(),
            OperationResult::NotFound
        );
    }

    #[test]
    fn update_replaces_value() {
        let tree = tree();
        assert_eq!(
            tree.update(&Key::from(("k", "1"))).unwrap(),
            OperationResult::NotFound
        );
        assert_eq!(
            tree.insert(&Key::from(("k", "1"))).unwrap(),
            OperationResult::Success
        );
        assert_eq!(
            tree.update(&Key::from(("k", "2"))).unwrap(),
            OperationResult::Success
        );
        assert_eq!(tree.lookup(b"k").as_deref(), Some(&b"2"[..]));
        assert_eq!(tree.stats().retired, 1);
    }

    #[test]
    fn pool_layout_wins_over_config() {
        let pool = PmPool::anonymous(1 << 22, LeafLayout::Direct).unwrap();
        let tree = Tree::with_pool(pool, TreeConfig::default()).unwrap();
        assert_eq!(tree.config().leaf_layout, LeafLayout::Direct);
        assert!(tree.recovery_report().is_none());
    }

    #[test]
    fn range_iter_walks_all_chunks() {
        let tree = tree();
        for idx in 0..10u8 {
            let key = [b'k', b'0' + idx];
            let _ = tree.insert(&Key::new(&key[..], &key[..])).unwrap();
        }

        let keys: Vec<_> = tree
            .range(Some(&b"k2"[..]), Some(&b"k8"[..]), 4)
            .map(|entry| entry.key().to_vec())
            .collect();
        let expected: Vec<_> = (2..8u8).map(|idx| vec![b'k', b'0' + idx]).collect();
        assert_eq!(keys, expected);

        assert_eq!(tree.range(None, None, 0).count(), 10);
    }

    #[test]
    fn lookup_range_sets_continuation() {
        let tree = tree();
        for key in ["a", "b", "c"] {
            let _ = tree.insert(&Key::from((key, "v"))).unwrap();
        }

        let scan = tree.lookup_range(None, None, 2);
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.continuation.as_deref(), Some(&b"c"[..]));

        let scan = tree.lookup_range(Some(&b"c"[..]), None, 2);
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.continuation, None);
    }
}
