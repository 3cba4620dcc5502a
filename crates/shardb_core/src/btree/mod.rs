//! Paged B+-tree.
//!
//! Entries are fixed-size (key, value) pairs encoded by a [`KeyCodec`]. The
//! tree lives in a [`crate::cache::PageCache`]: block 0 is the head, every
//! other block is a leaf or an inner node. Leaves are chained both ways so
//! that searches can fall through to a neighbour and cursors can walk the
//! whole key range.
//!
//! Ordering is not part of the codec. Every search or insert takes a
//! comparison closure, so keys can refer to data stored elsewhere.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut tree = Btree::create(cache, U64Pair)?;
//! tree.insert(&7, &70, |k| Ok(k.cmp(&7)))?;
//! let found = tree.find_next(|k| Ok(k.cmp(&5)))?;
//! let cursor = tree.cursor(found)?;
//! ```

mod cursor;
mod layout;
mod tree;

pub use cursor::Cursor;
pub use tree::{Btree, KeyCodec, Ref};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheHost, PageCache};
    use crate::error::CoreError;
    use crate::tasks::TaskPool;
    use proptest::prelude::*;
    use shardb_storage::{FileBackend, InMemoryBackend, StorageBackend};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct U64Pair;

    impl KeyCodec for U64Pair {
        type Key = u64;
        type Value = u64;

        fn key_size(&self) -> usize {
            8
        }
        fn value_size(&self) -> usize {
            8
        }
        fn read_key(&self, bytes: &[u8]) -> u64 {
            u64::from_le_bytes(bytes.try_into().unwrap_or([0; 8]))
        }
        fn write_key(&self, key: &u64, out: &mut [u8]) {
            out.copy_from_slice(&key.to_le_bytes());
        }
        fn read_value(&self, bytes: &[u8]) -> u64 {
            self.read_key(bytes)
        }
        fn write_value(&self, value: &u64, out: &mut [u8]) {
            self.write_key(value, out);
        }
    }

    fn cache_over(backend: Box<dyn StorageBackend>) -> PageCache {
        let host = Arc::new(CacheHost::new(8 * 256));
        let io = Arc::new(TaskPool::new("btree-io", 2).unwrap());
        PageCache::open(host, io, backend, 256).unwrap()
    }

    fn new_tree() -> Btree<U64Pair> {
        Btree::create(cache_over(Box::new(InMemoryBackend::new())), U64Pair).unwrap()
    }

    fn insert(tree: &mut Btree<U64Pair>, key: u64) {
        tree.insert(&key, &(key * 10), |k| Ok(k.cmp(&key))).unwrap();
    }

    fn collect(tree: &Btree<U64Pair>) -> Vec<(u64, u64)> {
        let mut cursor = tree.cursor(tree.find_first().unwrap()).unwrap();
        let mut out = Vec::new();
        while cursor.valid() {
            out.push((cursor.key().unwrap(), cursor.value().unwrap()));
            cursor.forward().unwrap();
        }
        out
    }

    #[test]
    fn empty_tree() {
        let tree = new_tree();
        assert_eq!(tree.find_first().unwrap(), None);
        assert_eq!(tree.find_next(|k| Ok(k.cmp(&1))).unwrap(), None);
        assert_eq!(tree.find_prev(|k| Ok(k.cmp(&1))).unwrap(), None);
        assert!(!tree.cursor(None).unwrap().valid());
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn splits_grow_depth_and_keep_order() {
        let mut tree = new_tree();
        for key in (0..500u64).rev() {
            insert(&mut tree, key * 2);
        }

        assert!(tree.depth() >= 3);
        let entries = collect(&tree);
        assert_eq!(entries.len(), 500);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(entries.iter().all(|&(k, v)| v == k * 10));
    }

    #[test]
    fn directional_search() {
        let mut tree = new_tree();
        for key in 0..200u64 {
            insert(&mut tree, key * 10);
        }

        let key_at = |r: Option<Ref>| tree.cursor(r).unwrap().key().unwrap();

        assert_eq!(key_at(tree.find_next(|k| Ok(k.cmp(&55))).unwrap()), 60);
        assert_eq!(key_at(tree.find_next(|k| Ok(k.cmp(&60))).unwrap()), 60);
        assert_eq!(key_at(tree.find_prev(|k| Ok(k.cmp(&55))).unwrap()), 50);
        assert_eq!(key_at(tree.find_prev(|k| Ok(k.cmp(&60))).unwrap()), 60);
        assert_eq!(tree.find_next(|k| Ok(k.cmp(&1991))).unwrap(), None);
        assert_eq!(tree.find_prev(|k| Ok(k.cmp(&0))).map(key_at).unwrap(), 0);

        let before_all = tree.find_prev(|k| Ok(k.cmp(&0).then(std::cmp::Ordering::Greater)));
        assert_eq!(before_all.unwrap(), None);
    }

    #[test]
    fn every_boundary_resolves_across_leaves() {
        let mut tree = new_tree();
        for key in 0..300u64 {
            insert(&mut tree, key * 3);
        }
        for target in 0..=897u64 {
            let next = tree.find_next(|k| Ok(k.cmp(&target))).unwrap();
            let expected_next = (target + 2) / 3 * 3;
            assert_eq!(tree.cursor(next).unwrap().key().unwrap(), expected_next);

            let prev = tree.find_prev(|k| Ok(k.cmp(&target))).unwrap();
            assert_eq!(tree.cursor(prev).unwrap().key().unwrap(), target / 3 * 3);
        }
    }

    #[test]
    fn set_value_through_cursor() {
        let mut tree = new_tree();
        for key in 0..50u64 {
            insert(&mut tree, key);
        }
        let found = tree.find_next(|k| Ok(k.cmp(&20))).unwrap();
        tree.cursor(found).unwrap().set_value(&1).unwrap();

        let found = tree.find_next(|k| Ok(k.cmp(&20))).unwrap();
        assert_eq!(tree.cursor(found).unwrap().value().unwrap(), 1);
    }

    #[test]
    fn compare_errors_propagate() {
        let mut tree = new_tree();
        insert(&mut tree, 1);
        let result = tree.insert(&2, &2, |_| Err(CoreError::invariant("boom")));
        assert!(result.is_err());
        assert_eq!(collect(&tree).len(), 1);
    }

    #[test]
    fn reopen_after_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let cache = cache_over(Box::new(FileBackend::create(&path).unwrap()));
            let mut tree = Btree::create(cache, U64Pair).unwrap();
            for key in 0..100u64 {
                insert(&mut tree, key);
            }
            tree.flush().unwrap();
        }

        let cache = cache_over(Box::new(FileBackend::open(&path).unwrap()));
        let tree = Btree::open(cache, U64Pair).unwrap();
        assert_eq!(collect(&tree).len(), 100);
    }

    #[test]
    fn open_rejects_foreign_file() {
        let mut backend = InMemoryBackend::new();
        backend.write_at(0, &[0xAB; 256]).unwrap();
        assert!(matches!(
            Btree::open(cache_over(Box::new(backend)), U64Pair),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn traversal_is_sorted_and_lossless(keys in prop::collection::vec(0u64..5_000, 0..400)) {
            let mut tree = new_tree();
            let mut model = BTreeSet::new();
            for key in keys {
                if model.insert(key) {
                    insert(&mut tree, key);
                }
            }

            let entries = collect(&tree);
            let traversed: Vec<u64> = entries.iter().map(|&(k, _)| k).collect();
            let expected: Vec<u64> = model.into_iter().collect();
            prop_assert_eq!(traversed, expected);
        }

        #[test]
        fn searches_agree_with_ordered_set(
            keys in prop::collection::vec(0u64..2_000, 0..300),
            targets in prop::collection::vec(0u64..2_100, 1..40),
        ) {
            let mut tree = new_tree();
            let mut model = BTreeSet::new();
            for key in keys {
                if model.insert(key) {
                    insert(&mut tree, key);
                }
            }

            let key_of =
                |found: Option<Ref>| found.map(|r| tree.cursor(Some(r)).unwrap().key().unwrap());
            for target in targets {
                let next = key_of(tree.find_next(|k| Ok(k.cmp(&target))).unwrap());
                prop_assert_eq!(next, model.range(target..).next().copied());

                let prev = key_of(tree.find_prev(|k| Ok(k.cmp(&target))).unwrap());
                prop_assert_eq!(prev, model.range(..=target).next_back().copied());
            }
        }

        #[test]
        fn duplicates_are_kept(keys in prop::collection::vec(0u64..20, 1..200)) {
            let mut tree = new_tree();
            for &key in &keys {
                insert(&mut tree, key);
            }
            let traversed: Vec<u64> = collect(&tree).into_iter().map(|(k, _)| k).collect();
            let mut expected = keys;
            expected.sort_unstable();
            prop_assert_eq!(traversed, expected);
        }
    }
}
