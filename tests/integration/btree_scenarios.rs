#![allow(missing_docs)]

use pagetree::btree::arena::PageArena;
use pagetree::btree::{cell, split, Page, Probe};
use pagetree::types::page::PAGE_SIZE;
use pagetree::{BTree, PagetreeError, Result};

fn insert_into_page(page: &mut Page, key: &[u8], value: &[u8]) -> Result<()> {
    let idx = match page.binary_search(key) {
        Probe::Hit(_) => return Err(PagetreeError::DuplicateKey),
        Probe::Miss(idx) => idx,
    };
    let offset = page.acquire_offset(key.len(), value.len());
    if offset == 0 {
        return Err(PagetreeError::Invalid("page full"));
    }
    page.insert_leaf_cell(offset, idx, key, value);
    Ok(())
}

#[test]
fn out_of_order_keys_search_in_lexicographic_slots() -> Result<()> {
    let mut page = Page::alloc();
    page.init(true, true);
    for key in ["test2", "test0", "test3", "test1"] {
        insert_into_page(&mut page, key.as_bytes(), b"value")?;
    }
    for (expected, key) in ["test0", "test1", "test2", "test3"].iter().enumerate() {
        assert_eq!(page.binary_search(key.as_bytes()), Probe::Hit(expected));
    }
    assert!(page.cell_offset() >= page.slot_end());
    Ok(())
}

#[test]
fn sixteen_byte_pairs_force_root_split() -> Result<()> {
    let mut tree = BTree::new()?;
    let mut n = 0u64;
    while tree.stats_snapshot().root_splits == 0 {
        let bytes = format!("{n:016}");
        tree.insert(bytes.as_bytes(), bytes.as_bytes())?;
        n += 1;
    }
    assert!(tree.stats_snapshot().leaf_splits >= 1);

    let root = tree.page(tree.root_page())?;
    assert!(!root.is_leaf());
    assert_eq!(root.size(), 1);
    let [left, right] = <[_; 2]>::try_from(root.children()?)
        .map_err(|_| PagetreeError::Invalid("root must have two children"))?;
    assert!(tree.page(left)?.size() > 0);
    assert!(tree.page(right)?.size() > 0);

    let report = tree.verify()?;
    assert!(report.success, "{:#?}", report.findings);
    assert_eq!(report.height, Some(2));
    assert_eq!(report.counts.entries, n);
    Ok(())
}

#[test]
fn deleted_key_space_is_reused() -> Result<()> {
    let mut tree = BTree::new()?;
    for key in ["apple", "berry", "cherry", "damson"] {
        tree.insert(key.as_bytes(), b"0123456789")?;
    }
    assert!(tree.delete(b"berry")?);
    assert_eq!(tree.search(b"berry")?, None);
    assert_eq!(tree.get(b"berry")?, None);

    let root = tree.root_page();
    let freed = tree.page(root)?.tombstone_bytes();
    assert_eq!(freed, cell::footprint(5, 10));
    // Same footprint, different key.
    tree.insert(b"elder", b"abcdefghij")?;
    assert_eq!(
        tree.page(root)?.tombstone_bytes(),
        freed - cell::footprint(5, 10)
    );
    assert_eq!(tree.get(b"elder")?, Some(&b"abcdefghij"[..]));
    Ok(())
}

#[test]
fn monotonic_split_partitions_by_bytes() -> Result<()> {
    let mut arena = PageArena::default();
    let origin = arena.allocate(true, true)?;
    let mut n = 0u32;
    {
        let page = arena.get_mut(origin)?;
        loop {
            let key = format!("mono-{n:06}");
            // A run of small values followed by large ones.
            let len = if n < 300 { 4 } else { 900 };
            if page.is_full(key.len(), len) {
                break;
            }
            insert_into_page(page, key.as_bytes(), &vec![b'x'; len])?;
            n += 1;
        }
    }
    let size = arena.get(origin)?.size();
    let partition = split::partition_index(arena.get(origin)?);
    let outcome = split::split_leaf(&mut arena, origin)?;
    assert_eq!(outcome.partition, partition);

    let left = arena.get(origin)?;
    let right = arena.get(outcome.sibling)?;
    assert_eq!(left.size() + right.size(), size);
    let left_bytes = left.live_bytes();
    let right_bytes = right.live_bytes();
    assert!(left_bytes >= PAGE_SIZE / 2);
    assert!(left_bytes.abs_diff(right_bytes) < PAGE_SIZE / 4);
    // Slot-count halving would have put nearly every large cell on the right.
    assert!(partition > size / 2);
    Ok(())
}
