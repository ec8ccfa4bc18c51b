use super::{cell, BTree, BTreeOptions, SlotRef};
use crate::types::page::{MAX_CELL_FOOTPRINT, PAGE_SIZE};
use crate::types::{PageId, PagetreeError, Result};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pagetree=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn key(n: u64) -> Vec<u8> {
    format!("key-{n:08}").into_bytes()
}

fn assert_clean(tree: &BTree) -> Result<()> {
    let report = tree.verify()?;
    assert!(report.is_clean(), "verify findings: {:#?}", report.findings);
    Ok(())
}

fn assert_tree_matches_reference(
    tree: &BTree,
    reference: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> Result<()> {
    assert_eq!(tree.len(), reference.len());
    for (k, v) in reference {
        assert_eq!(tree.get(k)?, Some(v.as_slice()), "key {:?}", String::from_utf8_lossy(k));
    }
    let actual: Vec<(Vec<u8>, Vec<u8>)> = tree
        .iter()?
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = reference
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(actual, expected);
    Ok(())
}

/// Leaf ids in key order.
fn leaves(tree: &BTree) -> Result<Vec<PageId>> {
    let mut out = Vec::new();
    let mut pending = vec![tree.root_page()];
    while let Some(id) = pending.pop() {
        let page = tree.page(id)?;
        if page.is_leaf() {
            out.push(id);
        } else {
            pending.extend(page.children()?.into_iter().rev());
        }
    }
    Ok(out)
}

#[test]
fn insert_get_and_missing_keys() -> Result<()> {
    let mut tree = BTree::new()?;
    assert!(tree.is_empty());
    tree.insert(b"beta", b"2")?;
    tree.insert(b"alpha", b"1")?;
    tree.insert(b"gamma", b"3")?;
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.get(b"alpha")?, Some(&b"1"[..]));
    assert_eq!(tree.get(b"gamma")?, Some(&b"3"[..]));
    assert_eq!(tree.get(b"delta")?, None);
    assert!(!tree.contains_key(b"")?);

    let slot = tree.search(b"beta")?.ok_or(PagetreeError::Invalid("beta missing"))?;
    assert_eq!(slot.page, tree.root_page());
    assert_eq!(slot.index, 1);
    let cell = tree.cell(slot)?;
    assert_eq!(cell.key, b"beta");
    assert_eq!(cell.value, b"2");
    Ok(())
}

#[test]
fn empty_and_prefix_keys_sort_first() -> Result<()> {
    let mut tree = BTree::new()?;
    tree.insert(b"abc", b"3")?;
    tree.insert(b"ab", b"2")?;
    tree.insert(b"", b"0")?;
    tree.insert(b"a", b"1")?;
    let keys: Vec<&[u8]> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![&b""[..], &b"a"[..], &b"ab"[..], &b"abc"[..]]);
    assert_eq!(tree.get(b"")?, Some(&b"0"[..]));
    Ok(())
}

#[test]
fn duplicate_insert_leaves_tree_untouched() -> Result<()> {
    let mut tree = BTree::new()?;
    tree.insert(b"k", b"original")?;
    let before = tree.page(tree.root_page())?.as_bytes().to_vec();
    assert!(matches!(
        tree.insert(b"k", b"other"),
        Err(PagetreeError::DuplicateKey)
    ));
    assert_eq!(tree.page(tree.root_page())?.as_bytes(), before.as_slice());
    assert_eq!(tree.len(), 1);
    assert_eq!(tree.get(b"k")?, Some(&b"original"[..]));
    Ok(())
}

#[test]
fn oversized_cells_are_rejected() -> Result<()> {
    let mut tree = BTree::new()?;
    let value = vec![0u8; MAX_CELL_FOOTPRINT];
    match tree.insert(b"big", &value) {
        Err(PagetreeError::CellTooLarge { footprint, limit }) => {
            assert_eq!(footprint, cell::footprint(3, value.len()));
            assert_eq!(limit, MAX_CELL_FOOTPRINT);
        }
        other => panic!("expected CellTooLarge, got {other:?}"),
    }
    assert!(tree.put(b"big", &value).is_err());
    assert!(tree.is_empty());

    // The largest admissible cell still goes in.
    let fits = vec![1u8; MAX_CELL_FOOTPRINT - 16 - 3];
    tree.insert(b"big", &fits)?;
    assert_eq!(tree.get(b"big")?.map(<[u8]>::len), Some(fits.len()));
    Ok(())
}

#[test]
fn first_root_split_leaves_one_separator() -> Result<()> {
    init_tracing();
    let mut tree = BTree::new()?;
    let first_root = tree.root_page();
    let mut n = 0u64;
    while tree.height()? == 1 {
        let k = format!("{n:016}");
        tree.insert(k.as_bytes(), k.as_bytes())?;
        n += 1;
        assert!(n < 10_000, "root never split");
    }

    let root = tree.page(tree.root_page())?;
    assert_ne!(tree.root_page(), first_root);
    assert!(!root.is_leaf());
    assert!(root.is_root());
    assert_eq!(root.size(), 1);
    let children = root.children()?;
    assert_eq!(children.len(), 2);
    assert_eq!(children[0], first_root);
    for child in &children {
        let page = tree.page(*child)?;
        assert!(page.is_leaf());
        assert!(!page.is_root());
        assert_eq!(page.parent(), Some(tree.root_page()));
        assert!(page.size() > 0);
    }
    let separator = root.key_at(0);
    assert_eq!(tree.page(children[1])?.key_at(0), separator);

    let stats = tree.stats_snapshot();
    assert_eq!(stats.leaf_splits, 1);
    assert_eq!(stats.root_splits, 1);
    assert_eq!(stats.inserts, n);
    let report = tree.verify()?;
    assert!(report.is_clean(), "{:#?}", report.findings);
    assert_eq!(report.height, Some(2));
    assert_eq!(report.counts.leaf_pages, 2);
    for i in 0..n {
        let k = format!("{i:016}");
        assert_eq!(tree.get(k.as_bytes())?, Some(k.as_bytes()));
    }
    Ok(())
}

#[test]
fn monotonic_inserts_split_by_bytes() -> Result<()> {
    let mut tree = BTree::new()?;
    let value_len = |n: u64| if n % 7 == 0 { 1_500 } else { 8 + (n % 5) as usize * 40 };
    for n in 0..3_000u64 {
        tree.insert(&key(n), &vec![b'v'; value_len(n)])?;
    }
    let leaf_ids = leaves(&tree)?;
    assert!(leaf_ids.len() > 3);
    // Every leaf but the last was the left half of a split and never saw
    // another insert afterwards.
    for id in &leaf_ids[..leaf_ids.len() - 1] {
        let live = tree.page(*id)?.live_bytes();
        assert!(live >= PAGE_SIZE / 2, "leaf {id} holds {live} bytes");
        assert!(live < PAGE_SIZE / 2 + MAX_CELL_FOOTPRINT);
    }
    assert_clean(&tree)
}

#[test]
fn delete_then_reuse_tombstone() -> Result<()> {
    let mut tree = BTree::new()?;
    for k in ["test2", "test0", "test3", "test1"] {
        tree.insert(k.as_bytes(), b"payload!")?;
    }
    assert!(tree.delete(b"test1")?);
    assert!(!tree.delete(b"test1")?);
    assert_eq!(tree.search(b"test1")?, None);
    assert_eq!(tree.len(), 3);

    let root = tree.root_page();
    let reclaimable = tree.page(root)?.tombstone_bytes();
    assert_eq!(reclaimable, cell::footprint(5, 8));
    let low_water = tree.page(root)?.cell_offset();
    tree.insert(b"test9", b"PAYLOAD!")?;
    let page = tree.page(root)?;
    assert_eq!(page.tombstone_bytes(), reclaimable - cell::footprint(5, 8));
    assert_eq!(page.cell_offset(), low_water);
    assert_eq!(tree.stats_snapshot().tombstone_reuses, 1);
    assert_eq!(tree.get(b"test9")?, Some(&b"PAYLOAD!"[..]));
    assert_clean(&tree)
}

#[test]
fn put_overwrites_and_returns_previous() -> Result<()> {
    let mut tree = BTree::new()?;
    assert_eq!(tree.put(b"k", b"one")?, None);
    assert_eq!(tree.put(b"k", b"a much longer second value")?, Some(b"one".to_vec()));
    assert_eq!(tree.get(b"k")?, Some(&b"a much longer second value"[..]));
    assert_eq!(tree.len(), 1);
    assert_clean(&tree)
}

#[test]
fn stale_slot_refs_are_invalid() -> Result<()> {
    let mut tree = BTree::new()?;
    tree.insert(b"a", b"1")?;
    let slot = SlotRef {
        page: tree.root_page(),
        index: 5,
    };
    assert!(matches!(tree.cell(slot), Err(PagetreeError::Invalid(_))));
    let missing = SlotRef {
        page: PageId(99),
        index: 0,
    };
    assert!(tree.cell(missing).is_err());
    Ok(())
}

#[test]
fn compaction_avoids_needless_split() -> Result<()> {
    let mut tree = BTree::new()?;
    let root = tree.root_page();
    let mut n = 0u64;
    while !tree.page(root)?.is_full(key(n).len(), 100) {
        tree.insert(&key(n), &[1u8; 100])?;
        n += 1;
    }
    for i in (0..n).step_by(2) {
        assert!(tree.delete(&key(i))?);
    }
    // Too large for any single tombstone, so only compaction makes room.
    tree.insert(b"zz-wide", &[2u8; 1_500])?;
    let stats = tree.stats_snapshot();
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.leaf_splits, 0);
    assert_eq!(tree.height()?, 1);
    assert_eq!(tree.page(root)?.tombstone_bytes(), 0);
    assert_eq!(tree.get(b"zz-wide")?, Some(&[2u8; 1_500][..]));
    assert_clean(&tree)
}

#[test]
fn long_keys_grow_three_levels() -> Result<()> {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut tree = BTree::with_options(BTreeOptions {
        verify_after_split: true,
        ..BTreeOptions::default()
    })?;
    let mut reference = BTreeMap::new();
    while reference.len() < 2_500 {
        let id: u32 = rng.gen();
        let mut k = format!("{id:010}").into_bytes();
        k.resize(900, b'.');
        let v = id.to_le_bytes().to_vec();
        if reference.contains_key(&k) {
            continue;
        }
        tree.insert(&k, &v)?;
        reference.insert(k, v);
    }
    assert!(tree.height()? >= 3);
    let stats = tree.stats_snapshot();
    assert!(stats.internal_splits >= 1);
    assert!(stats.root_splits >= 2);
    assert_tree_matches_reference(&tree, &reference)?;
    assert_clean(&tree)
}

#[test]
fn page_limit_fails_split_without_damage() -> Result<()> {
    let mut tree = BTree::with_options(BTreeOptions {
        max_pages: Some(2),
        ..BTreeOptions::default()
    })?;
    let mut n = 0u64;
    let err = loop {
        match tree.insert(&key(n), &[0u8; 64]) {
            Ok(()) => n += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, PagetreeError::OutOfPages { limit: 2 }));
    assert_eq!(tree.len() as u64, n);
    assert_eq!(tree.page_count(), 1);
    assert_eq!(tree.get(&key(n))?, None);
    assert_clean(&tree)
}

#[test]
fn clear_recycles_pages() -> Result<()> {
    let mut tree = BTree::new()?;
    for n in 0..2_000 {
        tree.insert(&key(n), &[3u8; 64])?;
    }
    let pages_before = tree.page_count();
    let mut ids_before = leaves(&tree)?;
    ids_before.push(tree.root_page());
    ids_before.sort();
    assert!(pages_before > 1);

    tree.clear()?;
    assert!(tree.is_empty());
    assert_eq!(tree.page_count(), 1);
    assert_eq!(tree.height()?, 1);
    assert_eq!(tree.root_page(), PageId(1));
    assert_eq!(tree.get(&key(5))?, None);
    assert_clean(&tree)?;

    // The same workload lands on the released ids, not on fresh ones.
    for n in 0..2_000 {
        tree.insert(&key(n), &[3u8; 64])?;
    }
    assert_eq!(tree.page_count(), pages_before);
    let mut ids_after = leaves(&tree)?;
    ids_after.push(tree.root_page());
    ids_after.sort();
    assert_eq!(ids_after, ids_before);
    assert_clean(&tree)
}

#[test]
fn overwrite_counts_as_delete_and_insert() -> Result<()> {
    let mut tree = BTree::new()?;
    for n in 0..50 {
        tree.put(&key(n), b"first")?;
    }
    for n in 0..50 {
        assert_eq!(tree.put(&key(n), b"second")?, Some(b"first".to_vec()));
    }
    assert!(tree.delete(&key(0))?);
    let stats = tree.stats_snapshot();
    assert_eq!(stats.inserts, 100);
    assert_eq!(stats.deletes, 51);
    assert_eq!((stats.inserts - stats.deletes) as usize, tree.len());
    Ok(())
}

#[test]
fn stats_track_operations() -> Result<()> {
    let mut tree = BTree::new()?;
    tree.insert(b"a", b"1")?;
    tree.insert(b"b", b"2")?;
    assert!(tree.delete(b"a")?);
    assert!(!tree.delete(b"zzz")?);
    let _ = tree.get(b"b")?;
    let snapshot = tree.stats_snapshot();
    assert_eq!(snapshot.inserts, 2);
    assert_eq!(snapshot.deletes, 1);
    assert!(snapshot.leaf_searches >= 5);
    assert_eq!(snapshot.internal_searches, 0);
    assert_eq!(tree.stats().inserts(), 2);
    let json = serde_json::to_string(&snapshot).map_err(|_| PagetreeError::Invalid("json"))?;
    assert!(json.contains("\"inserts\":2"));
    tree.emit_stats();
    Ok(())
}

#[test]
fn random_workload_matches_btreemap() -> Result<()> {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut tree = BTree::new()?;
    let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for step in 0..6_000 {
        let roll = rng.gen_range(0..10);
        if roll < 6 || reference.is_empty() {
            let len = rng.gen_range(1..48);
            let k: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'h')).collect();
            let v = vec![rng.gen::<u8>(); rng.gen_range(0..700)];
            let previous = tree.put(&k, &v)?;
            assert_eq!(previous, reference.insert(k, v));
        } else if roll < 9 {
            let idx = rng.gen_range(0..reference.len());
            let k = reference
                .keys()
                .nth(idx)
                .cloned()
                .ok_or(PagetreeError::Invalid("reference empty"))?;
            assert!(tree.delete(&k)?);
            reference.remove(&k);
        } else {
            let k = vec![b'z'; rng.gen_range(1..4)];
            assert_eq!(tree.delete(&k)?, reference.remove(&k).is_some());
        }
        if step % 1_000 == 999 {
            assert_clean(&tree)?;
        }
    }
    assert_tree_matches_reference(&tree, &reference)?;
    assert_clean(&tree)
}

#[derive(Clone, Debug)]
enum PropOp {
    Put(u16, usize),
    Insert(u16, usize),
    Delete(u16),
}

fn op_strategy() -> impl Strategy<Value = PropOp> {
    let key_range = 0u16..96;
    let value_len = 0usize..2_000;
    prop_oneof![
        (key_range.clone(), value_len.clone()).prop_map(|(k, v)| PropOp::Put(k, v)),
        (key_range.clone(), value_len).prop_map(|(k, v)| PropOp::Insert(k, v)),
        key_range.prop_map(PropOp::Delete),
    ]
}

fn prop_key(k: u16) -> Vec<u8> {
    format!("prop-{k:03}").into_bytes()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]
    #[test]
    fn btree_matches_btreemap_random_ops(ops in prop::collection::vec(op_strategy(), 1..160)) {
        let mut tree = BTree::new().expect("new tree");
        let mut reference = BTreeMap::new();

        for op in ops {
            match op {
                PropOp::Put(k, len) => {
                    let value = vec![(k % 251) as u8; len];
                    let previous = tree.put(&prop_key(k), &value).expect("put");
                    prop_assert_eq!(previous, reference.insert(prop_key(k), value));
                }
                PropOp::Insert(k, len) => {
                    let value = vec![(len % 251) as u8; len];
                    let result = tree.insert(&prop_key(k), &value);
                    if reference.contains_key(&prop_key(k)) {
                        prop_assert!(matches!(result, Err(PagetreeError::DuplicateKey)));
                    } else {
                        prop_assert!(result.is_ok());
                        reference.insert(prop_key(k), value);
                    }
                }
                PropOp::Delete(k) => {
                    let expected = reference.remove(&prop_key(k)).is_some();
                    prop_assert_eq!(tree.delete(&prop_key(k)).expect("delete"), expected);
                }
            }
        }

        let report = tree.verify().expect("verify");
        prop_assert!(report.is_clean(), "{:#?}", report.findings);
        let actual: BTreeMap<Vec<u8>, Vec<u8>> = tree
            .iter()
            .expect("iter")
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        prop_assert_eq!(actual, reference);
    }
}
