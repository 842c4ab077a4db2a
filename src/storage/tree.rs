//! Top-level tree operations composed from the node/leaf primitives:
//! lookup, ordered range scan, and insert-with-split.

use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::storage::alloc::{alloc_page, BackingStore};
use crate::storage::leaf::{
    leaf_find, leaf_get_key_at, leaf_get_next, leaf_get_nvalues, leaf_get_prev, leaf_get_value_at,
    leaf_insert_key_at, leaf_insert_value_at, leaf_set_key_at, leaf_set_next, leaf_set_nvalues,
    leaf_set_prev, leaf_set_value_at, LEAF_MAX_ENTRIES,
};
use crate::storage::meta::{
    get_end_sentinel, get_free_list, get_next_offset, get_rend_sentinel, get_root, get_snapshots,
    get_version, meta_init, set_end_sentinel, set_next_offset, set_rend_sentinel, set_root,
};
use crate::storage::node::{
    node_find, node_get_child_at, node_get_key_at, node_get_nchildren, node_insert_child_at,
    node_insert_key_at, node_set_child_at, node_set_key_at, node_set_nchildren,
};
use crate::storage::page::{get_type_raw, page_init, PageType, ORDER};

/// Page offset of the meta page. The meta page is always the first page
/// of a store managed by this engine.
pub const META_OFFSET: i64 = 0;

const RESERVED_KEY_BIT: u64 = 1 << 63;

fn check_key(key: u64) -> Result<()> {
    if key & RESERVED_KEY_BIT != 0 {
        return Err(EngineError::ReservedKeyBit { key });
    }
    Ok(())
}

/// A B+ tree bound to a backing store. `S` is the collaborator that owns
/// the actual bytes — an in-memory buffer, a memory-mapped file, or
/// anything else implementing `BackingStore`.
pub struct Tree<S> {
    store: S,
}

impl<S: BackingStore> Tree<S> {
    /// Writes a fresh meta page, allocates the two sentinel leaves, and
    /// leaves the tree empty (`Root == 0`).
    pub fn init(mut store: S) -> Result<Self> {
        store.ensure_capacity(META_OFFSET)?;
        {
            let meta = store.page_mut(META_OFFSET)?;
            meta_init(meta);
            set_next_offset(meta, crate::storage::page::PAGE_SIZE as i64);
        }

        let rend_offset = alloc_page(&mut store, META_OFFSET)?;
        let end_offset = alloc_page(&mut store, META_OFFSET)?;

        {
            let rend = store.page_mut(rend_offset)?;
            page_init(rend, PageType::Leaf, 0);
            leaf_set_prev(rend, 0);
            leaf_set_next(rend, end_offset);
        }
        {
            let end = store.page_mut(end_offset)?;
            page_init(end, PageType::Leaf, 0);
            leaf_set_prev(end, rend_offset);
            leaf_set_next(end, 0);
        }
        {
            let meta = store.page_mut(META_OFFSET)?;
            set_rend_sentinel(meta, rend_offset);
            set_end_sentinel(meta, end_offset);
            set_root(meta, 0);
        }

        debug!(rend_offset, end_offset, "tree initialized");
        Ok(Self { store })
    }

    /// Wraps a store that already holds an initialized meta page.
    pub fn open(store: S) -> Self {
        Self { store }
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn meta_field<T>(&self, f: impl Fn(&[u8; crate::storage::page::PAGE_SIZE]) -> T) -> Result<T> {
        Ok(f(self.store.page_ref(META_OFFSET)?))
    }

    pub fn root(&self) -> Result<i64> {
        self.meta_field(get_root)
    }

    pub fn version(&self) -> Result<u64> {
        self.meta_field(get_version)
    }

    pub fn end_sentinel(&self) -> Result<i64> {
        self.meta_field(get_end_sentinel)
    }

    pub fn rend_sentinel(&self) -> Result<i64> {
        self.meta_field(get_rend_sentinel)
    }

    pub fn free_list_head(&self) -> Result<i64> {
        self.meta_field(get_free_list)
    }

    pub fn snapshots_head(&self) -> Result<i64> {
        self.meta_field(get_snapshots)
    }

    pub fn next_offset(&self) -> Result<i64> {
        self.meta_field(get_next_offset)
    }

    /// Point lookup. Descends via `node_find` until a leaf, then
    /// `leaf_find`.
    pub fn lookup(&self, key: u64) -> Result<Option<u64>> {
        check_key(key)?;
        let root = self.root()?;
        if root == 0 {
            return Ok(None);
        }
        let mut offset = root;
        loop {
            let page = self.store.page_ref(offset)?;
            match get_type_raw(page) {
                t if t == PageType::Node as u8 => {
                    let idx = node_find(page, key);
                    offset = node_get_child_at(page, idx);
                }
                t if t == PageType::Leaf as u8 => {
                    let (idx, ok) = leaf_find(page, key);
                    return Ok(if ok {
                        Some(leaf_get_value_at(page, idx as usize))
                    } else {
                        None
                    });
                }
                _ => {
                    return Err(EngineError::Corruption {
                        offset,
                        detail: "page is neither node nor leaf".to_string(),
                    })
                }
            }
        }
    }

    /// Inserts or overwrites `(key, value)`. Splits leaves and nodes as
    /// needed, cascading up to a newly allocated root if the existing
    /// root splits.
    pub fn insert(&mut self, key: u64, value: u64) -> Result<()> {
        check_key(key)?;
        let root = self.root()?;
        if root == 0 {
            self.insert_into_empty_tree(key, value)?;
            return Ok(());
        }

        // Descend, recording the path of node offsets from root to the
        // leaf's parent.
        let mut path: Vec<i64> = Vec::new();
        let mut offset = root;
        loop {
            let page = self.store.page_ref(offset)?;
            if get_type_raw(page) == PageType::Leaf as u8 {
                break;
            }
            let idx = node_find(page, key);
            let child = node_get_child_at(page, idx);
            path.push(offset);
            offset = child;
        }

        let split = self.insert_into_leaf(offset, key, value)?;
        let Some((mut promoted_key, mut new_child)) = split else {
            return Ok(());
        };

        while let Some(node_offset) = path.pop() {
            match self.insert_into_node(node_offset, promoted_key, new_child)? {
                Some((k, c)) => {
                    promoted_key = k;
                    new_child = c;
                }
                None => return Ok(()),
            }
        }

        // The root itself split; allocate a fresh root node above it.
        let old_root = self.root()?;
        let new_root_offset = alloc_page(&mut self.store, META_OFFSET)?;
        {
            let new_root = self.store.page_mut(new_root_offset)?;
            page_init(new_root, PageType::Node, 2);
            node_set_child_at(new_root, old_root, -1);
            node_set_child_at(new_root, new_child, 0);
            node_set_key_at(new_root, promoted_key, 0);
        }
        let meta = self.store.page_mut(META_OFFSET)?;
        set_root(meta, new_root_offset);
        trace!(new_root_offset, "root split, new root allocated");
        Ok(())
    }

    fn insert_into_empty_tree(&mut self, key: u64, value: u64) -> Result<()> {
        let rend = self.rend_sentinel()?;
        let leaf_offset = alloc_page(&mut self.store, META_OFFSET)?;
        {
            let leaf = self.store.page_mut(leaf_offset)?;
            page_init(leaf, PageType::Leaf, 0);
        }
        self.link_leaf_after(rend, leaf_offset)?;
        {
            let leaf = self.store.page_mut(leaf_offset)?;
            leaf_insert_key_at(leaf, key, 0);
            leaf_insert_value_at(leaf, value, 0);
        }
        let meta = self.store.page_mut(META_OFFSET)?;
        set_root(meta, leaf_offset);
        Ok(())
    }

    /// Splices `new_offset` in between `pred_offset` and whatever
    /// currently follows it.
    fn link_leaf_after(&mut self, pred_offset: i64, new_offset: i64) -> Result<()> {
        let succ_offset = {
            let pred = self.store.page_ref(pred_offset)?;
            leaf_get_next(pred)
        };
        {
            let pred = self.store.page_mut(pred_offset)?;
            leaf_set_next(pred, new_offset);
        }
        {
            let new_leaf = self.store.page_mut(new_offset)?;
            leaf_set_prev(new_leaf, pred_offset);
            leaf_set_next(new_leaf, succ_offset);
        }
        {
            let succ = self.store.page_mut(succ_offset)?;
            leaf_set_prev(succ, new_offset);
        }
        Ok(())
    }

    /// Inserts into a leaf, splitting it first if it is already full.
    /// Returns `Some((median_key, new_leaf_offset))` when a split
    /// happened and must be propagated to the parent.
    fn insert_into_leaf(
        &mut self,
        leaf_offset: i64,
        key: u64,
        value: u64,
    ) -> Result<Option<(u64, i64)>> {
        let (idx, ok) = {
            let page = self.store.page_ref(leaf_offset)?;
            leaf_find(page, key)
        };
        if ok {
            let page = self.store.page_mut(leaf_offset)?;
            leaf_set_value_at(page, value, idx as usize);
            return Ok(None);
        }
        let insert_pos = (idx + 1) as usize;

        let n = {
            let page = self.store.page_ref(leaf_offset)?;
            leaf_get_nvalues(page) as usize
        };
        if n < LEAF_MAX_ENTRIES {
            let page = self.store.page_mut(leaf_offset)?;
            leaf_insert_key_at(page, key, insert_pos);
            leaf_insert_value_at(page, value, insert_pos);
            return Ok(None);
        }

        self.split_full_leaf(leaf_offset, key, value, insert_pos)
            .map(Some)
    }

    /// Splits a full leaf, inserting `(key, value)` at `insert_pos` into
    /// whichever half it belongs to. Builds the combined sequence in a
    /// scratch `Vec` so the physical arrays are never written past
    /// capacity.
    fn split_full_leaf(
        &mut self,
        leaf_offset: i64,
        key: u64,
        value: u64,
        insert_pos: usize,
    ) -> Result<(u64, i64)> {
        let n = {
            let page = self.store.page_ref(leaf_offset)?;
            leaf_get_nvalues(page) as usize
        };
        let mut entries: Vec<(u64, u64)> = Vec::with_capacity(n + 1);
        {
            let page = self.store.page_ref(leaf_offset)?;
            for i in 0..n {
                entries.push((leaf_get_key_at(page, i), leaf_get_value_at(page, i)));
            }
        }
        entries.insert(insert_pos, (key, value));

        let mid = entries.len() / 2;
        let (left, right) = entries.split_at(mid);

        {
            let page = self.store.page_mut(leaf_offset)?;
            for (i, &(k, v)) in left.iter().enumerate() {
                leaf_set_key_at(page, k, i);
                leaf_set_value_at(page, v, i);
            }
            leaf_set_nvalues(page, left.len() as u8);
        }

        let new_leaf_offset = alloc_page(&mut self.store, META_OFFSET)?;
        {
            let new_leaf = self.store.page_mut(new_leaf_offset)?;
            page_init(new_leaf, PageType::Leaf, 0);
            for (i, &(k, v)) in right.iter().enumerate() {
                leaf_set_key_at(new_leaf, k, i);
                leaf_set_value_at(new_leaf, v, i);
            }
            leaf_set_nvalues(new_leaf, right.len() as u8);
        }
        self.link_leaf_after(leaf_offset, new_leaf_offset)?;

        let median_key = right[0].0;
        Ok((median_key, new_leaf_offset))
    }

    /// Inserts `(promoted_key, new_child)` into `node_offset`, splitting
    /// it first if full. Returns `Some((median_key, new_node_offset))`
    /// when a split must propagate further up.
    fn insert_into_node(
        &mut self,
        node_offset: i64,
        promoted_key: u64,
        new_child: i64,
    ) -> Result<Option<(u64, i64)>> {
        let n = {
            let page = self.store.page_ref(node_offset)?;
            node_get_nchildren(page) as usize
        };
        // node_insert_child_at requires N.Children < ORDER - 2.
        if n < ORDER - 2 {
            let child_idx = self.child_index_after_split(node_offset, promoted_key)?;
            let page = self.store.page_mut(node_offset)?;
            node_insert_key_at(page, promoted_key, child_idx);
            node_insert_child_at(page, new_child, child_idx as i32);
            return Ok(None);
        }
        self.split_full_node(node_offset, promoted_key, new_child)
            .map(Some)
    }

    /// The separator key we're inserting always corresponds to the child
    /// immediately after the one that just split, so the key's index is
    /// `node_find(promoted_key)`'s existing child slot, and the new
    /// child goes one slot to its right.
    fn child_index_after_split(&self, node_offset: i64, promoted_key: u64) -> Result<usize> {
        let page = self.store.page_ref(node_offset)?;
        let idx = node_find(page, promoted_key);
        Ok((idx + 1) as usize)
    }

    /// Splits a full internal node. Unlike a leaf split, the promoted key
    /// is removed from both halves (it moves up to the grandparent), and
    /// the right half's `ChildPage0` is the child that followed it.
    fn split_full_node(
        &mut self,
        node_offset: i64,
        promoted_key: u64,
        new_child: i64,
    ) -> Result<(u64, i64)> {
        let n = {
            let page = self.store.page_ref(node_offset)?;
            node_get_nchildren(page) as usize
        };
        let k = n - 1; // separator keys in use
        let child_idx = self.child_index_after_split(node_offset, promoted_key)?;

        // children[0] corresponds to ChildPage0; children[i+1] corresponds
        // to the existing Children[i].
        let mut keys: Vec<u64> = Vec::with_capacity(k + 1);
        let mut children: Vec<i64> = Vec::with_capacity(n + 1);
        {
            let page = self.store.page_ref(node_offset)?;
            children.push(node_get_child_at(page, -1));
            for i in 0..k {
                keys.push(node_get_key_at(page, i));
                children.push(node_get_child_at(page, i as i32));
            }
        }
        keys.insert(child_idx, promoted_key);
        children.insert(child_idx + 1, new_child);

        let mid = keys.len() / 2;
        let median_key = keys[mid];

        let left_keys = &keys[..mid];
        let left_children = &children[..mid + 1];
        let right_keys = &keys[mid + 1..];
        let right_children = &children[mid + 1..];

        {
            let page = self.store.page_mut(node_offset)?;
            node_set_child_at(page, left_children[0], -1);
            for (i, &kk) in left_keys.iter().enumerate() {
                node_set_key_at(page, kk, i);
            }
            for (i, &c) in left_children[1..].iter().enumerate() {
                node_set_child_at(page, c, i as i32);
            }
            node_set_nchildren(page, left_children.len() as u8);
        }

        let new_node_offset = alloc_page(&mut self.store, META_OFFSET)?;
        {
            let page = self.store.page_mut(new_node_offset)?;
            page_init(page, PageType::Node, right_children.len() as u8);
            node_set_child_at(page, right_children[0], -1);
            for (i, &kk) in right_keys.iter().enumerate() {
                node_set_key_at(page, kk, i);
            }
            for (i, &c) in right_children[1..].iter().enumerate() {
                node_set_child_at(page, c, i as i32);
            }
        }

        Ok((median_key, new_node_offset))
    }

    /// Resolves the leaf that would contain `key` (the same descent
    /// `lookup` does), for range scans that need a starting point.
    fn find_leaf_for(&self, key: u64) -> Result<i64> {
        let root = self.root()?;
        if root == 0 {
            return Ok(self.end_sentinel()?);
        }
        let mut offset = root;
        loop {
            let page = self.store.page_ref(offset)?;
            if get_type_raw(page) == PageType::Leaf as u8 {
                return Ok(offset);
            }
            let idx = node_find(page, key);
            offset = node_get_child_at(page, idx);
        }
    }

    /// Forward range scan starting at the first key `>= start` (or the
    /// beginning of the tree if `start` is `None`), yielding pairs in
    /// ascending key order until the end sentinel is reached.
    pub fn range_forward(&self, start: Option<u64>) -> Result<Vec<(u64, u64)>> {
        if let Some(k) = start {
            check_key(k)?;
        }
        let end = self.end_sentinel()?;
        let mut out = Vec::new();
        let root = self.root()?;
        if root == 0 {
            return Ok(out);
        }

        let (mut leaf_offset, mut start_idx) = match start {
            None => (self.leaf_after_rend()?, 0usize),
            Some(k) => {
                let leaf_offset = self.find_leaf_for(k)?;
                let page = self.store.page_ref(leaf_offset)?;
                let (idx, ok) = leaf_find(page, k);
                (leaf_offset, if ok { idx as usize } else { (idx + 1) as usize })
            }
        };

        loop {
            if leaf_offset == end {
                break;
            }
            let page = self.store.page_ref(leaf_offset)?;
            let n = leaf_get_nvalues(page) as usize;
            for i in start_idx..n {
                out.push((leaf_get_key_at(page, i), leaf_get_value_at(page, i)));
            }
            leaf_offset = leaf_get_next(page);
            start_idx = 0;
        }
        Ok(out)
    }

    /// Backward range scan, yielding pairs in descending key order from
    /// the end of the tree.
    pub fn range_backward(&self) -> Result<Vec<(u64, u64)>> {
        let rend = self.rend_sentinel()?;
        let mut out = Vec::new();
        let mut leaf_offset = {
            let end = self.store.page_ref(self.end_sentinel()?)?;
            leaf_get_prev(end)
        };
        while leaf_offset != rend {
            let page = self.store.page_ref(leaf_offset)?;
            let n = leaf_get_nvalues(page) as usize;
            for i in (0..n).rev() {
                out.push((leaf_get_key_at(page, i), leaf_get_value_at(page, i)));
            }
            leaf_offset = leaf_get_prev(page);
        }
        Ok(out)
    }

    fn leaf_after_rend(&self) -> Result<i64> {
        let rend = self.rend_sentinel()?;
        let page = self.store.page_ref(rend)?;
        Ok(leaf_get_next(page))
    }

    /// Walks the leaf list from `RendSentinel` to `0`, counting hops.
    /// Used by the sentinel-invariant test: it must be exactly `L + 2`
    /// where `L` is the live leaf count.
    #[cfg(test)]
    fn count_leaf_list_hops(&self) -> Result<usize> {
        let rend = self.rend_sentinel()?;
        let mut offset = rend;
        let mut hops = 0;
        loop {
            let page = self.store.page_ref(offset)?;
            offset = leaf_get_next(page);
            hops += 1;
            if offset == 0 {
                break;
            }
        }
        Ok(hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::alloc::MemBackingStore;

    fn new_tree() -> Tree<MemBackingStore> {
        Tree::init(MemBackingStore::new()).unwrap()
    }

    #[test]
    fn empty_tree_lookup_misses_and_scans_empty() {
        let t = new_tree();
        assert_eq!(t.lookup(42).unwrap(), None);
        assert_eq!(t.range_forward(None).unwrap(), vec![]);
    }

    #[test]
    fn single_insert_roundtrips() {
        let mut t = new_tree();
        t.insert(7, 700).unwrap();
        assert_eq!(t.lookup(7).unwrap(), Some(700));
        assert_eq!(t.range_forward(None).unwrap(), vec![(7, 700)]);
    }

    #[test]
    fn reverse_order_inserts_scan_in_order() {
        let mut t = new_tree();
        t.insert(30, 3).unwrap();
        t.insert(20, 2).unwrap();
        t.insert(10, 1).unwrap();
        assert_eq!(
            t.range_forward(None).unwrap(),
            vec![(10, 1), (20, 2), (30, 3)]
        );
        assert_eq!(
            t.range_backward().unwrap(),
            vec![(30, 3), (20, 2), (10, 1)]
        );
    }

    #[test]
    fn update_existing_key_does_not_change_count_or_links() {
        let mut t = new_tree();
        t.insert(1, 100).unwrap();
        t.insert(2, 200).unwrap();
        let leaf = t.find_leaf_for(1).unwrap();
        let before_n = {
            let p = t.store.page_ref(leaf).unwrap();
            leaf_get_nvalues(p)
        };
        let before_next = {
            let p = t.store.page_ref(leaf).unwrap();
            leaf_get_next(p)
        };
        t.insert(1, 999).unwrap();
        let after_n = {
            let p = t.store.page_ref(leaf).unwrap();
            leaf_get_nvalues(p)
        };
        let after_next = {
            let p = t.store.page_ref(leaf).unwrap();
            leaf_get_next(p)
        };
        assert_eq!(before_n, after_n);
        assert_eq!(before_next, after_next);
        assert_eq!(t.lookup(1).unwrap(), Some(999));
    }

    #[test]
    fn many_inserts_force_a_split_and_scan_all() {
        let mut t = new_tree();
        for k in 1..=255u64 {
            t.insert(k, k * 10).unwrap();
        }
        let root = t.root().unwrap();
        let page = t.store.page_ref(root).unwrap();
        assert_eq!(get_type_raw(page), PageType::Node as u8);

        let scanned = t.range_forward(None).unwrap();
        let expected: Vec<(u64, u64)> = (1..=255u64).map(|k| (k, k * 10)).collect();
        assert_eq!(scanned, expected);

        for k in 1..=255u64 {
            assert_eq!(t.lookup(k).unwrap(), Some(k * 10));
        }
    }

    #[test]
    fn sentinel_invariants_hold_after_inserts() {
        let mut t = new_tree();
        for k in 0..50u64 {
            t.insert(k, k).unwrap();
        }
        let rend = t.rend_sentinel().unwrap();
        let end = t.end_sentinel().unwrap();
        {
            let p = t.store.page_ref(rend).unwrap();
            assert_eq!(leaf_get_prev(p), 0);
        }
        {
            let p = t.store.page_ref(end).unwrap();
            assert_eq!(leaf_get_next(p), 0);
        }

        // Count live leaves by walking the list.
        let mut live = 0usize;
        let mut offset = {
            let p = t.store.page_ref(rend).unwrap();
            leaf_get_next(p)
        };
        while offset != end {
            live += 1;
            let p = t.store.page_ref(offset).unwrap();
            offset = leaf_get_next(p);
        }

        assert_eq!(t.count_leaf_list_hops().unwrap(), live + 2);
    }

    #[test]
    fn reinserting_exact_match_is_idempotent() {
        let mut t = new_tree();
        for k in 1..=300u64 {
            t.insert(k, k).unwrap();
        }
        let before = t.range_forward(None).unwrap();
        t.insert(150, 150).unwrap();
        let after = t.range_forward(None).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn reserved_key_bit_is_rejected() {
        let mut t = new_tree();
        let reserved = 1u64 << 63;
        assert!(matches!(
            t.insert(reserved, 1),
            Err(EngineError::ReservedKeyBit { .. })
        ));
        assert!(matches!(
            t.lookup(reserved),
            Err(EngineError::ReservedKeyBit { .. })
        ));
    }
}
