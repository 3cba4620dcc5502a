//! Shared memory budget across page caches.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Something that occupies memory under a [`CacheHost`] budget.
pub trait Cacheable: Send + Sync {
    /// Bytes charged against the budget while listed.
    fn footprint(&self) -> u64;

    /// Called after the host dropped this item from its LRU list.
    ///
    /// The item decides when the memory actually goes away; a pinned page
    /// stays resident until its last user lets go.
    fn release(&self);
}

/// (cache id, page number)
pub(crate) type CacheKey = (u32, u64);

struct HostState {
    lru: LruCache<CacheKey, Arc<dyn Cacheable>>,
    footprint: u64,
    evictions: u64,
}

/// One LRU list and byte budget shared by every page cache of a shard.
///
/// Listing a page that pushes the total over the limit releases pages from
/// the least recently used end until it fits again. `release` callbacks run
/// after the host lock is dropped, so they are free to call back into the
/// host.
pub struct CacheHost {
    limit: u64,
    next_id: AtomicU32,
    state: Mutex<HostState>,
}

impl CacheHost {
    /// Creates a host with a budget of `limit` bytes.
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            next_id: AtomicU32::new(0),
            state: Mutex::new(HostState {
                lru: LruCache::unbounded(),
                footprint: 0,
                evictions: 0,
            }),
        }
    }

    /// Hands out a fresh id for a page cache.
    pub fn register(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lists `item` as most recently used, then releases least recently used
    /// items until the footprint is back under the limit.
    pub(crate) fn request_acquire(&self, key: CacheKey, item: Arc<dyn Cacheable>) {
        let victims = {
            let mut state = self.state.lock();
            state.footprint += item.footprint();
            if let Some((_, replaced)) = state.lru.push(key, item) {
                state.footprint -= replaced.footprint();
            }

            let mut victims = Vec::new();
            while state.footprint > self.limit {
                let Some((_, victim)) = state.lru.pop_lru() else {
                    break;
                };
                state.footprint -= victim.footprint();
                state.evictions += 1;
                victims.push(victim);
            }
            victims
        };

        if !victims.is_empty() {
            tracing::debug!(count = victims.len(), "releasing cached pages");
        }
        for victim in victims {
            victim.release();
        }
    }

    /// Lists `item` as least recently used without releasing anything, so
    /// that the next acquisition picks it first.
    pub(crate) fn restore(&self, key: CacheKey, item: Arc<dyn Cacheable>) {
        let mut state = self.state.lock();
        state.footprint += item.footprint();
        if let Some((_, replaced)) = state.lru.push(key, item) {
            state.footprint -= replaced.footprint();
        }
        state.lru.demote(&key);
    }

    /// Marks `key` as most recently used. Does nothing for unlisted keys.
    pub(crate) fn on_access(&self, key: CacheKey) {
        self.state.lock().lru.promote(&key);
    }

    /// Unlists `key` without calling its release hook.
    pub(crate) fn forget(&self, key: CacheKey) {
        let mut state = self.state.lock();
        if let Some(item) = state.lru.pop(&key) {
            state.footprint -= item.footprint();
        }
    }

    /// Unlists every item of one cache.
    pub(crate) fn forget_cache(&self, cache_id: u32) {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> = state
            .lru
            .iter()
            .map(|(key, _)| *key)
            .filter(|(id, _)| *id == cache_id)
            .collect();
        for key in keys {
            if let Some(item) = state.lru.pop(&key) {
                state.footprint -= item.footprint();
            }
        }
    }

    /// Budget in bytes.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes currently charged by listed items.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.state.lock().footprint
    }

    /// Number of listed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    /// Whether nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items released for budget reasons since creation.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.state.lock().evictions
    }
}

impl std::fmt::Debug for CacheHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheHost")
            .field("limit", &self.limit)
            .field("footprint", &state.footprint)
            .field("items", &state.lru.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Item {
        size: u64,
        released: AtomicUsize,
    }

    impl Item {
        fn new(size: u64) -> Arc<Self> {
            Arc::new(Self {
                size,
                released: AtomicUsize::new(0),
            })
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl Cacheable for Item {
        fn footprint(&self) -> u64 {
            self.size
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn register_hands_out_distinct_ids() {
        let host = CacheHost::new(100);
        let a = host.register();
        let b = host.register();
        assert_ne!(a, b);
    }

    #[test]
    fn evicts_least_recently_used_over_limit() {
        let host = CacheHost::new(30);
        let items: Vec<_> = (0..4).map(|_| Item::new(10)).collect();
        for (i, item) in items.iter().enumerate() {
            host.request_acquire((0, i as u64), item.clone());
        }

        assert_eq!(items[0].released(), 1);
        assert_eq!(items[1].released(), 0);
        assert_eq!(host.footprint(), 30);
        assert_eq!(host.len(), 3);
        assert_eq!(host.evictions(), 1);
    }

    #[test]
    fn access_protects_from_eviction() {
        let host = CacheHost::new(30);
        let items: Vec<_> = (0..3).map(|_| Item::new(10)).collect();
        for (i, item) in items.iter().enumerate() {
            host.request_acquire((0, i as u64), item.clone());
        }
        host.on_access((0, 0));

        let extra = Item::new(10);
        host.request_acquire((0, 3), extra);

        assert_eq!(items[0].released(), 0);
        assert_eq!(items[1].released(), 1);
    }

    #[test]
    fn restored_item_is_next_in_line() {
        let host = CacheHost::new(20);
        let items: Vec<_> = (0..2).map(|_| Item::new(10)).collect();
        host.request_acquire((0, 0), items[0].clone());
        host.request_acquire((0, 1), items[1].clone());
        let returned = Item::new(10);
        host.restore((0, 2), returned.clone());
        assert_eq!(host.footprint(), 30);
        assert_eq!(returned.released(), 0);

        host.request_acquire((0, 3), Item::new(10));
        assert_eq!(returned.released(), 1);
        assert_eq!(items[0].released(), 1);
        assert_eq!(items[1].released(), 0);
    }

    #[test]
    fn forget_cache_only_touches_that_cache() {
        let host = CacheHost::new(100);
        host.request_acquire((1, 0), Item::new(10));
        host.request_acquire((1, 1), Item::new(10));
        host.request_acquire((2, 0), Item::new(10));

        host.forget_cache(1);
        assert_eq!(host.len(), 1);
        assert_eq!(host.footprint(), 10);

        host.forget((2, 0));
        assert!(host.is_empty());
        assert_eq!(host.footprint(), 0);
    }
}
