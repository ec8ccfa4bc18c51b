use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BTreeStatsSnapshot {
    /// Leaf pages reached by a descent
    pub leaf_searches: u64,
    /// Internal pages passed through by a descent
    pub internal_searches: u64,
    /// Leaf page splits
    pub leaf_splits: u64,
    /// Internal page splits
    pub internal_splits: u64,
    /// Times the root split and the tree grew a level
    pub root_splits: u64,
    /// In-place page compactions that avoided a split
    pub compactions: u64,
    /// Cells placed into reclaimed tombstone space
    pub tombstone_reuses: u64,
    /// Successful inserts
    pub inserts: u64,
    /// Successful deletes
    pub deletes: u64,
}

/// Relaxed counters for tree operations.
#[derive(Default)]
pub struct BTreeStats {
    leaf_searches: AtomicU64,
    internal_searches: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    compactions: AtomicU64,
    tombstone_reuses: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf page searches.
    pub fn leaf_searches(&self) -> u64 {
        self.leaf_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal page searches.
    pub fn internal_searches(&self) -> u64 {
        self.internal_searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of leaf page splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of internal page splits.
    pub fn internal_splits(&self) -> u64 {
        self.internal_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns how many times a new root was created.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of page compactions.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of cells written into tombstone space.
    pub fn tombstone_reuses(&self) -> u64 {
        self.tombstone_reuses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of successful inserts.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of successful deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_searches(&self) {
        self.leaf_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_searches(&self) {
        self.internal_searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_compactions(&self) {
        self.compactions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_tombstone_reuses(&self) {
        self.tombstone_reuses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inserts(&self) {
        self.inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_deletes(&self) {
        self.deletes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_searches: self.leaf_searches(),
            internal_searches: self.internal_searches(),
            leaf_splits: self.leaf_splits(),
            internal_splits: self.internal_splits(),
            root_splits: self.root_splits(),
            compactions: self.compactions(),
            tombstone_reuses: self.tombstone_reuses(),
            inserts: self.inserts(),
            deletes: self.deletes(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "pagetree::stats",
            leaf_searches = snapshot.leaf_searches,
            internal_searches = snapshot.internal_searches,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            root_splits = snapshot.root_splits,
            compactions = snapshot.compactions,
            tombstone_reuses = snapshot.tombstone_reuses,
            inserts = snapshot.inserts,
            deletes = snapshot.deletes,
            "btree stats snapshot"
        );
    }
}
