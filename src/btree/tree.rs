use std::sync::Arc;

use smallvec::SmallVec;

use super::arena::PageArena;
use super::cell::{self, CellRef};
use super::page::{Page, Probe};
use super::split::{self, SplitOutcome};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::types::page::MAX_CELL_FOOTPRINT;
use crate::types::{PageId, PagetreeError, Result};

/// Configuration knobs for the tree.
#[derive(Clone, Debug, Default)]
pub struct BTreeOptions {
    /// Upper bound on live pages; allocation past it fails with `OutOfPages`.
    pub max_pages: Option<usize>,
    /// Run the page checker on both halves after every split.
    pub verify_after_split: bool,
}

/// Location of a live cell: owning page plus slot index.
///
/// Valid until the next mutation of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    /// Leaf page holding the cell.
    pub page: PageId,
    /// Slot index inside that page.
    pub index: usize,
}

/// One step of a root-to-leaf descent: the internal page and the descent
/// index taken out of it.
#[derive(Clone, Copy, Debug)]
pub(super) struct PathEntry {
    pub(super) page_id: PageId,
    pub(super) child_index: usize,
}

pub(super) type Path = SmallVec<[PathEntry; 8]>;

/// In-memory B-tree of variable-length byte keys and values stored in
/// fixed-size slotted pages.
pub struct BTree {
    pub(super) arena: PageArena,
    pub(super) root: PageId,
    pub(super) len: usize,
    pub(super) options: BTreeOptions,
    pub(super) stats: Arc<BTreeStats>,
}

impl BTree {
    /// Creates an empty tree: a single leaf flagged as root.
    pub fn new() -> Result<Self> {
        Self::with_options(BTreeOptions::default())
    }

    /// Creates an empty tree with explicit options.
    pub fn with_options(options: BTreeOptions) -> Result<Self> {
        let mut arena = PageArena::with_limit(options.max_pages);
        let root = arena.allocate(true, true)?;
        Ok(Self {
            arena,
            root,
            len: 0,
            options,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Return the root page identifier.
    pub fn root_page(&self) -> PageId {
        self.root
    }

    /// Number of key/value pairs stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live pages.
    pub fn page_count(&self) -> usize {
        self.arena.live_pages()
    }

    /// Levels from root to leaf, `1` for a lone root leaf.
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut current = self.root;
        loop {
            let page = self.arena.get(current)?;
            if page.is_leaf() {
                return Ok(height);
            }
            current = page.child_at(0)?;
            height += 1;
        }
    }

    /// Read-only access to a page, for inspection.
    pub fn page(&self, id: PageId) -> Result<&Page> {
        self.arena.get(id)
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Locates `key`. Never mutates page state.
    pub fn search(&self, key: &[u8]) -> Result<Option<SlotRef>> {
        let leaf_id = self.find_leaf(key)?;
        let leaf = self.arena.get(leaf_id)?;
        Ok(match leaf.binary_search(key) {
            Probe::Hit(index) => Some(SlotRef {
                page: leaf_id,
                index,
            }),
            Probe::Miss(_) => None,
        })
    }

    /// Value stored under `key`, borrowed from its page.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        match self.search(key)? {
            Some(slot) => Ok(Some(self.cell(slot)?.value)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.search(key)?.is_some())
    }

    /// Decodes the cell a [`SlotRef`] points at.
    pub fn cell(&self, slot: SlotRef) -> Result<CellRef<'_>> {
        let page = self.arena.get(slot.page)?;
        if !page.is_leaf() {
            return Err(PagetreeError::Invalid("slot reference does not name a leaf"));
        }
        if slot.index >= page.size() {
            return Err(PagetreeError::Invalid("slot reference is stale"));
        }
        Ok(page.cell(slot.index))
    }

    /// Inserts a new key. Fails with `DuplicateKey` if it already exists, in
    /// which case the tree is unchanged.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_cell_capacity(key.len(), value.len())?;
        let (leaf_id, path) = self.find_leaf_with_path(key)?;
        let index = match self.arena.get(leaf_id)?.binary_search(key) {
            Probe::Hit(_) => return Err(PagetreeError::DuplicateKey),
            Probe::Miss(index) => index,
        };
        if self.make_room(leaf_id, key.len(), value.len())? {
            self.write_leaf_cell(leaf_id, index, key, value)?;
        } else {
            // Every level on the path may split, plus a new root.
            self.arena.ensure_available(path.len() + 2)?;
            self.stats.inc_leaf_splits();
            let outcome = split::split_leaf(&mut self.arena, leaf_id)?;
            self.check_split(leaf_id, &outcome)?;
            let target = if key >= outcome.separator.as_slice() {
                outcome.sibling
            } else {
                leaf_id
            };
            if !self.make_room(target, key.len(), value.len())? {
                return Err(PagetreeError::Corruption("split leaf has no room for the new cell"));
            }
            let index = match self.arena.get(target)?.binary_search(key) {
                Probe::Hit(_) => return Err(PagetreeError::Corruption("key appeared during split")),
                Probe::Miss(index) => index,
            };
            self.write_leaf_cell(target, index, key, value)?;
            self.propagate_split(path, leaf_id, outcome)?;
        }
        self.len += 1;
        self.stats.inc_inserts();
        Ok(())
    }

    /// Inserts or overwrites `key`, returning the value it replaced. An
    /// overwrite counts as one delete plus one insert in the stats.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        check_cell_capacity(key.len(), value.len())?;
        let Some(slot) = self.search(key)? else {
            self.insert(key, value)?;
            return Ok(None);
        };
        let previous = self.cell(slot)?.value.to_vec();
        let height = self.height()?;
        self.arena.ensure_available(height + 1)?;
        self.arena.get_mut(slot.page)?.remove_slot(slot.index);
        self.len -= 1;
        self.stats.inc_deletes();
        self.insert(key, value)?;
        Ok(Some(previous))
    }

    /// Removes `key`. Leaves are not merged or rebalanced afterwards.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let leaf_id = self.find_leaf(key)?;
        let removed = self.arena.get_mut(leaf_id)?.delete_key(key);
        if removed {
            self.len -= 1;
            self.stats.inc_deletes();
        }
        Ok(removed)
    }

    /// Releases every page back to the arena and starts over from an empty
    /// root leaf. Released ids are handed out again by later splits.
    pub fn clear(&mut self) -> Result<()> {
        let mut pending = vec![self.root];
        while let Some(id) = pending.pop() {
            let page = self.arena.get(id)?;
            if !page.is_leaf() {
                pending.extend(page.children()?);
            }
            self.arena.release(id)?;
        }
        self.root = self.arena.allocate(true, true)?;
        self.len = 0;
        Ok(())
    }

    pub(super) fn find_leaf(&self, key: &[u8]) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let page = self.arena.get(current)?;
            if page.is_leaf() {
                self.stats.inc_leaf_searches();
                tracing::trace!(
                    target: "pagetree::search",
                    page = current.0,
                    kind = "leaf",
                    "located target leaf"
                );
                return Ok(current);
            }
            self.stats.inc_internal_searches();
            tracing::trace!(
                target: "pagetree::search",
                page = current.0,
                kind = "internal",
                "descending through internal page"
            );
            current = page.child_at(page.descent_index(key))?;
        }
    }

    fn find_leaf_with_path(&self, key: &[u8]) -> Result<(PageId, Path)> {
        let mut current = self.root;
        let mut path = Path::new();
        loop {
            let page = self.arena.get(current)?;
            if page.is_leaf() {
                self.stats.inc_leaf_searches();
                return Ok((current, path));
            }
            self.stats.inc_internal_searches();
            let child_index = page.descent_index(key);
            path.push(PathEntry {
                page_id: current,
                child_index,
            });
            current = page.child_at(child_index)?;
        }
    }

    /// Makes sure `page_id` can take a cell of this shape, compacting it when
    /// only the free list's fragmentation stands in the way. Returns `false`
    /// when the page must split.
    fn make_room(&mut self, page_id: PageId, key_size: usize, value_size: usize) -> Result<bool> {
        let page = self.arena.get_mut(page_id)?;
        if !page.is_full(key_size, value_size) {
            return Ok(true);
        }
        if !page.fits_after_compaction(cell::footprint(key_size, value_size)) {
            return Ok(false);
        }
        let reclaimed = page.tombstone_bytes();
        page.compact();
        self.stats.inc_compactions();
        tracing::debug!(
            target: "pagetree::compact",
            page = page_id.0,
            reclaimed,
            "compacted page instead of splitting"
        );
        Ok(!self.arena.get(page_id)?.is_full(key_size, value_size))
    }

    fn write_leaf_cell(
        &mut self,
        page_id: PageId,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let page = self.arena.get_mut(page_id)?;
        let offset = page.acquire_offset(key.len(), value.len());
        if offset == 0 {
            return Err(PagetreeError::Corruption("is_full and acquire_offset disagree"));
        }
        if offset >= page.cell_offset() {
            self.stats.inc_tombstone_reuses();
        }
        page.insert_leaf_cell(offset, index, key, value);
        Ok(())
    }

    /// Walks the recorded path upward, linking each new sibling into its
    /// parent and splitting parents that have no room. Grows a new root when
    /// the walk runs off the top.
    fn propagate_split(
        &mut self,
        path: Path,
        mut left: PageId,
        mut outcome: SplitOutcome,
    ) -> Result<()> {
        let mut path = path;
        while let Some(frame) = path.pop() {
            let parent_id = frame.page_id;
            let separator_len = outcome.separator.len();
            if self.make_room(parent_id, separator_len, 0)? {
                let index = self.link_child(parent_id, &outcome.separator, left, outcome.sibling)?;
                if index != frame.child_index {
                    return Err(PagetreeError::Corruption(
                        "separator landed away from the descent path",
                    ));
                }
                return Ok(());
            }
            self.stats.inc_internal_splits();
            let parent_split = split::split_internal(&mut self.arena, parent_id)?;
            self.check_split(parent_id, &parent_split)?;
            let target = if outcome.separator >= parent_split.separator {
                parent_split.sibling
            } else {
                parent_id
            };
            if !self.make_room(target, separator_len, 0)? {
                return Err(PagetreeError::Corruption(
                    "split internal page has no room for the separator",
                ));
            }
            self.link_child(target, &outcome.separator, left, outcome.sibling)?;
            tracing::trace!(
                target: "pagetree::split",
                parent = parent_id.0,
                child_index = frame.child_index,
                "split propagated through full parent"
            );
            left = parent_id;
            outcome = parent_split;
        }
        self.grow_root(left, outcome)
    }

    /// Inserts `separator` into `page_id` so that `left` covers keys below it
    /// and `right` takes over the range `left` used to cover above it. Returns
    /// the slot the separator was written to.
    fn link_child(
        &mut self,
        page_id: PageId,
        separator: &[u8],
        left: PageId,
        right: PageId,
    ) -> Result<usize> {
        let page = self.arena.get_mut(page_id)?;
        let index = match page.binary_search(separator) {
            Probe::Hit(_) => {
                return Err(PagetreeError::Corruption("separator already present in parent"))
            }
            Probe::Miss(index) => index,
        };
        if page.child_at(index)? != left {
            return Err(PagetreeError::Corruption(
                "split page is not the child at the separator position",
            ));
        }
        page.set_child_at(index, right)?;
        let offset = page.acquire_offset(separator.len(), 0);
        if offset == 0 {
            return Err(PagetreeError::Corruption("is_full and acquire_offset disagree"));
        }
        page.insert_internal_cell(offset, index, separator, left);
        self.arena.get_mut(left)?.set_parent(Some(page_id));
        self.arena.get_mut(right)?.set_parent(Some(page_id));
        Ok(index)
    }

    fn grow_root(&mut self, old_root: PageId, outcome: SplitOutcome) -> Result<()> {
        let new_root = self.arena.allocate(false, true)?;
        {
            let page = self.arena.get_mut(new_root)?;
            let offset = page.acquire_offset(outcome.separator.len(), 0);
            if offset == 0 {
                return Err(PagetreeError::Corruption("empty root cannot hold separator"));
            }
            page.insert_internal_cell(offset, 0, &outcome.separator, old_root);
            page.set_rightmost_child(Some(outcome.sibling));
        }
        {
            let page = self.arena.get_mut(old_root)?;
            page.set_root(false);
            page.set_parent(Some(new_root));
        }
        self.arena
            .get_mut(outcome.sibling)?
            .set_parent(Some(new_root));
        self.root = new_root;
        self.stats.inc_root_splits();
        tracing::debug!(
            target: "pagetree::root",
            old_root = old_root.0,
            sibling = outcome.sibling.0,
            new_root = new_root.0,
            "grew a new root"
        );
        Ok(())
    }

    fn check_split(&self, origin: PageId, outcome: &SplitOutcome) -> Result<()> {
        if !self.options.verify_after_split {
            return Ok(());
        }
        super::verify::check_page(self.arena.get(origin)?)?;
        super::verify::check_page(self.arena.get(outcome.sibling)?)
    }

    /// In-order iterator over every key/value pair.
    pub fn iter(&self) -> Result<Iter<'_>> {
        let mut leaves = Vec::new();
        let mut pending = vec![self.root];
        while let Some(id) = pending.pop() {
            let page = self.arena.get(id)?;
            if page.is_leaf() {
                leaves.push(page);
            } else {
                pending.extend(page.children()?.into_iter().rev());
            }
        }
        Ok(Iter {
            leaves: leaves.into_iter(),
            current: None,
        })
    }
}

/// Iterator returned by [`BTree::iter`].
pub struct Iter<'a> {
    leaves: std::vec::IntoIter<&'a Page>,
    current: Option<(&'a Page, usize)>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.current {
                Some((page, idx)) if idx < page.size() => {
                    self.current = Some((page, idx + 1));
                    let cell = page.cell(idx);
                    return Some((cell.key, cell.value));
                }
                _ => self.current = Some((self.leaves.next()?, 0)),
            }
        }
    }
}

fn check_cell_capacity(key_len: usize, value_len: usize) -> Result<()> {
    let footprint = cell::footprint(key_len, value_len);
    if footprint > MAX_CELL_FOOTPRINT {
        return Err(PagetreeError::CellTooLarge {
            footprint,
            limit: MAX_CELL_FOOTPRINT,
        });
    }
    Ok(())
}
