#![allow(missing_docs)]

use std::collections::BTreeMap;

use pagetree::{BTree, BTreeOptions, PagetreeError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(4..120);
    (0..len).map(|_| rng.gen_range(b'0'..=b'z')).collect()
}

fn assert_matches(tree: &BTree, reference: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    assert_eq!(tree.len(), reference.len());
    let mut expected = reference.iter();
    for (key, value) in tree.iter()? {
        let (ek, ev) = expected
            .next()
            .ok_or(PagetreeError::Invalid("tree has extra entries"))?;
        assert_eq!(key, ek.as_slice());
        assert_eq!(value, ev.as_slice());
    }
    assert!(expected.next().is_none());
    Ok(())
}

#[test]
fn churn_keeps_structure_valid() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0xb7ee);
    let mut tree = BTree::new()?;
    let mut reference = BTreeMap::new();

    for round in 0..4 {
        for _ in 0..4_000 {
            let key = random_key(&mut rng);
            let value = vec![round as u8; rng.gen_range(0..1_200)];
            tree.put(&key, &value)?;
            reference.insert(key, value);
        }
        // Drop roughly half, leaving tombstones scattered across every leaf.
        let doomed: Vec<Vec<u8>> = reference
            .keys()
            .filter(|_| rng.gen_bool(0.5))
            .cloned()
            .collect();
        for key in doomed {
            assert!(tree.delete(&key)?);
            reference.remove(&key);
        }
        let report = tree.verify()?;
        assert!(report.is_clean(), "round {round}: {:#?}", report.findings);
        assert_eq!(report.counts.entries as usize, reference.len());
    }

    for (key, value) in &reference {
        assert_eq!(tree.get(key)?, Some(value.as_slice()));
    }
    assert_matches(&tree, &reference)?;

    let stats = tree.stats_snapshot();
    assert!(stats.leaf_splits > 0);
    assert!(stats.tombstone_reuses > 0);
    Ok(())
}

#[test]
fn page_limit_is_a_clean_stop() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut tree = BTree::with_options(BTreeOptions {
        max_pages: Some(24),
        verify_after_split: true,
    })?;
    let mut reference = BTreeMap::new();
    loop {
        let key = random_key(&mut rng);
        let value = vec![0xab; rng.gen_range(100..2_000)];
        if reference.contains_key(&key) {
            continue;
        }
        match tree.insert(&key, &value) {
            Ok(()) => {
                reference.insert(key, value);
            }
            Err(PagetreeError::OutOfPages { limit }) => {
                assert_eq!(limit, 24);
                assert_eq!(tree.get(&key)?, None);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    assert!(tree.page_count() <= 24);
    let report = tree.verify()?;
    assert!(report.is_clean(), "{:#?}", report.findings);
    assert_matches(&tree, &reference)
}

#[test]
fn drain_and_refill() -> Result<()> {
    let mut tree = BTree::new()?;
    let keys: Vec<Vec<u8>> = (0..5_000u32)
        .map(|n| format!("{:08x}", n.wrapping_mul(2_654_435_761)).into_bytes())
        .collect();
    for key in &keys {
        tree.insert(key, key)?;
    }
    let height = tree.height()?;
    for key in &keys {
        assert!(tree.delete(key)?);
    }
    assert!(tree.is_empty());
    assert_eq!(tree.iter()?.count(), 0);
    // Leaves stay allocated and empty; nothing is merged.
    assert_eq!(tree.height()?, height);
    assert!(tree.verify()?.success);

    for key in keys.iter().rev() {
        tree.insert(key, b"refill")?;
    }
    assert_eq!(tree.len(), keys.len());
    assert!(tree.verify()?.is_clean());
    Ok(())
}
