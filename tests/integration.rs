//! End-to-end tests driving the tree through its public API only.

use bplus::storage::{MemBackingStore, MmapBackingStore};
use bplus::{BackingStore, EngineError, Tree};
use tempfile::NamedTempFile;

#[test]
fn empty_tree_misses_every_lookup() {
    let tree = Tree::init(MemBackingStore::new()).unwrap();
    assert_eq!(tree.lookup(1).unwrap(), None);
    assert_eq!(tree.lookup(0).unwrap(), None);
    assert_eq!(tree.range_forward(None).unwrap(), vec![]);
    assert_eq!(tree.range_backward().unwrap(), vec![]);
}

#[test]
fn single_insert_then_lookup_then_forward_scan() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    tree.insert(5, 50).unwrap();
    assert_eq!(tree.lookup(5).unwrap(), Some(50));
    assert_eq!(tree.lookup(6).unwrap(), None);
    assert_eq!(tree.range_forward(None).unwrap(), vec![(5, 50)]);
}

#[test]
fn three_reverse_order_inserts_scan_both_directions() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    tree.insert(300, 3).unwrap();
    tree.insert(200, 2).unwrap();
    tree.insert(100, 1).unwrap();

    assert_eq!(
        tree.range_forward(None).unwrap(),
        vec![(100, 1), (200, 2), (300, 3)]
    );
    assert_eq!(
        tree.range_backward().unwrap(),
        vec![(300, 3), (200, 2), (100, 1)]
    );
    assert_eq!(
        tree.range_forward(Some(150)).unwrap(),
        vec![(200, 2), (300, 3)]
    );
}

/// Inserting 255 keys forces at least one leaf split: the array backing
/// a leaf's values has 254 slots, so key number 255 cannot land without
/// one. The root must then be a node page, and a full forward scan must
/// still yield every key in order.
#[test]
fn inserting_255_keys_splits_the_root_leaf_into_a_node() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    for key in 1..=255u64 {
        tree.insert(key, key * 10).unwrap();
    }

    let root = tree.root().unwrap();
    assert_ne!(root, 0);
    {
        let page = tree.store().page_ref(root).unwrap();
        assert_eq!(
            bplus::storage::page::get_type_raw(page),
            bplus::storage::PageType::Node as u8
        );
    }

    let expected: Vec<(u64, u64)> = (1..=255u64).map(|k| (k, k * 10)).collect();
    assert_eq!(tree.range_forward(None).unwrap(), expected);

    for key in 1..=255u64 {
        assert_eq!(tree.lookup(key).unwrap(), Some(key * 10));
    }
}

/// Re-inserting an already-present key must be a pure value update: it
/// must not change the leaf list's shape or any leaf's value count.
#[test]
fn split_then_reinsert_existing_key_is_idempotent_on_shape() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    for key in 1..=400u64 {
        tree.insert(key, key).unwrap();
    }
    let before = tree.range_forward(None).unwrap();

    tree.insert(200, 999).unwrap();

    let after = tree.range_forward(None).unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        if b.0 == 200 {
            assert_eq!(a, &(200, 999));
        } else {
            assert_eq!(a, b);
        }
    }
    assert_eq!(tree.lookup(200).unwrap(), Some(999));
}

#[test]
fn reserved_key_bit_is_rejected_at_the_api_boundary() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    let reserved_key = 1u64 << 63;
    match tree.insert(reserved_key, 1) {
        Err(EngineError::ReservedKeyBit { key }) => assert_eq!(key, reserved_key),
        other => panic!("expected ReservedKeyBit, got {other:?}"),
    }
}

/// The leaf list always has exactly `live_leaves + 2` nodes in it: the
/// two sentinels never go away, and every split adds exactly one leaf.
#[test]
fn sentinel_leaves_survive_every_split() {
    let mut tree = Tree::init(MemBackingStore::new()).unwrap();
    for key in 0..600u64 {
        tree.insert(key, key).unwrap();
    }
    let rend = tree.rend_sentinel().unwrap();
    let end = tree.end_sentinel().unwrap();

    let mut live_leaves = 0usize;
    let mut offset = {
        let page = tree.store().page_ref(rend).unwrap();
        bplus::storage::leaf::leaf_get_next(page)
    };
    while offset != end {
        live_leaves += 1;
        let page = tree.store().page_ref(offset).unwrap();
        offset = bplus::storage::leaf::leaf_get_next(page);
    }
    assert!(live_leaves >= 2, "600 keys should span more than one leaf");

    let scanned = tree.range_forward(None).unwrap();
    assert_eq!(scanned.len(), 600);
}

#[test]
fn mmap_backed_store_persists_across_reopen() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path();

    {
        let store = MmapBackingStore::create(path).unwrap();
        let mut tree = Tree::init(store).unwrap();
        for key in 1..=20u64 {
            tree.insert(key, key * 2).unwrap();
        }
        tree.into_store().flush().unwrap();
    }

    let store = MmapBackingStore::open(path).unwrap();
    let tree = Tree::open(store);
    for key in 1..=20u64 {
        assert_eq!(tree.lookup(key).unwrap(), Some(key * 2));
    }
    let expected: Vec<(u64, u64)> = (1..=20u64).map(|k| (k, k * 2)).collect();
    assert_eq!(tree.range_forward(None).unwrap(), expected);
}
