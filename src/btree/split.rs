//! Byte-balanced page splits.
//!
//! Leaves split copy-up: cells from the partition index onward move to a new
//! sibling and the sibling's first key is promoted. Internal pages split
//! pop-up: the partition cell's key is promoted and removed, its child becomes
//! the origin's rightmost child, and the cells after it move to the sibling.

use super::arena::PageArena;
use super::page::Page;
use crate::types::page::PAGE_SIZE;
use crate::types::{PageId, PagetreeError, Result};

/// Result of splitting one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Freshly allocated right-hand page.
    pub sibling: PageId,
    /// Key promoted to the parent; every key under `sibling` is `>=` it.
    pub separator: Vec<u8>,
    /// Slot index at which the origin was partitioned.
    pub partition: usize,
}

/// First slot index at which the cumulative cell footprint reaches half a page.
///
/// Cells are variable length, so balancing by slot count could leave one half
/// nearly empty in bytes.
pub fn partition_index(page: &Page) -> usize {
    let half = PAGE_SIZE / 2;
    let mut running = 0usize;
    let mut idx = 0usize;
    while idx < page.size() && running < half {
        running += page.cell_footprint(idx);
        idx += 1;
    }
    idx
}

/// Splits the leaf `origin`, returning the new right sibling and its first key.
pub fn split_leaf(arena: &mut PageArena, origin: PageId) -> Result<SplitOutcome> {
    let (size, parent) = {
        let page = arena.get(origin)?;
        if !page.is_leaf() {
            return Err(PagetreeError::Invalid("split_leaf called on an internal page"));
        }
        (page.size(), page.parent())
    };
    if size < 2 {
        return Err(PagetreeError::Corruption("cannot split a leaf with fewer than two cells"));
    }
    let partition = partition_index(arena.get(origin)?).clamp(1, size - 1);
    let sibling = arena.allocate(true, false)?;
    let (src, dst) = arena.pair_mut(origin, sibling)?;
    dst.set_parent(parent);
    move_cells(src, dst, partition)?;
    src.truncate_slots(partition);
    let separator = dst.key_at(0).to_vec();
    tracing::debug!(
        target: "pagetree::split",
        origin = origin.0,
        sibling = sibling.0,
        partition,
        moved = size - partition,
        "split leaf page"
    );
    Ok(SplitOutcome {
        sibling,
        separator,
        partition,
    })
}

/// Splits the internal page `origin`, popping the partition key up.
pub fn split_internal(arena: &mut PageArena, origin: PageId) -> Result<SplitOutcome> {
    let (size, parent) = {
        let page = arena.get(origin)?;
        if page.is_leaf() {
            return Err(PagetreeError::Invalid("split_internal called on a leaf page"));
        }
        (page.size(), page.parent())
    };
    if size < 3 {
        return Err(PagetreeError::Corruption(
            "cannot split an internal page with fewer than three cells",
        ));
    }
    let partition = partition_index(arena.get(origin)?).clamp(1, size - 2);
    let sibling = arena.allocate(false, false)?;
    let (separator, moved_children) = {
        let (src, dst) = arena.pair_mut(origin, sibling)?;
        dst.set_parent(parent);
        let separator = src.key_at(partition).to_vec();
        let popped_child = src.child_at(partition)?;
        move_cells(src, dst, partition + 1)?;
        dst.set_rightmost_child(src.rightmost_child());
        src.tombstone_slot(partition);
        src.truncate_slots(partition);
        src.set_rightmost_child(Some(popped_child));
        (separator, dst.children()?)
    };
    for child in moved_children {
        arena.get_mut(child)?.set_parent(Some(sibling));
    }
    tracing::debug!(
        target: "pagetree::split",
        origin = origin.0,
        sibling = sibling.0,
        partition,
        moved = size - partition - 1,
        "split internal page"
    );
    Ok(SplitOutcome {
        sibling,
        separator,
        partition,
    })
}

/// Copies every cell from slot `from` onward into `dst` in order, tombstoning
/// each source cell as it goes. Source slots are left for the caller to trim.
fn move_cells(src: &mut Page, dst: &mut Page, from: usize) -> Result<()> {
    for idx in from..src.size() {
        dst.append_raw_cell(src.raw_cell(idx))?;
        src.tombstone_slot(idx);
    }
    Ok(())
}
