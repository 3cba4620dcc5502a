//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use shardb_core::btree::{Btree, KeyCodec};
use shardb_core::cache::{CacheHost, PageCache};
use shardb_core::{Config, DriverRegistry, Shard, StorageIndex, TaskPool, FLEX_STORAGE};
use shardb_storage::InMemoryBackend;
use std::sync::Arc;
use tempfile::TempDir;

/// Generate random document data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct keys in random order.
pub fn shuffled_keys(count: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<u64> = (0..count).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    keys
}

/// Little-endian `u64` keys and values.
pub struct U64Codec;

impl KeyCodec for U64Codec {
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

/// An empty in-memory tree whose cache holds `cache_pages` pages.
pub fn memory_tree(page_size: usize, cache_pages: u64) -> Btree<U64Codec> {
    let host = Arc::new(CacheHost::new(cache_pages * page_size as u64));
    let io = Arc::new(TaskPool::new("bench-io", 2).expect("Failed to start I/O pool"));
    let cache = PageCache::open(host, io, Box::new(InMemoryBackend::new()), page_size)
        .expect("Failed to open page cache");
    Btree::create(cache, U64Codec).expect("Failed to create tree")
}

/// A fresh shard in a temporary directory with one storage `docs`.
pub fn bench_shard(config: Config) -> (TempDir, Shard, StorageIndex) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let shard = Shard::create(dir.path(), config, DriverRegistry::with_builtin())
        .expect("Failed to create shard");
    let docs = shard
        .create_storage(FLEX_STORAGE, "docs")
        .expect("Failed to create storage");
    (dir, shard, docs)
}
