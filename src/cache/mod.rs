//! Bounded in-memory LRU cache mapping raw request bytes to raw response bytes.
//!
//! The recency chain and the keyed lookup are the same structure: an
//! [`IndexMap`] preserves insertion order, so the front of the map is the
//! least-recently-used entry and the back is the most-recently-used one.
//! Promotion is a remove-then-reinsert at the back, which is the idiomatic
//! Rust rendition of the spec's "arena plus stable indices" doubly-linked
//! list — no unsafe, no generational handles, same O(1) amortized behavior.

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Fixed per-entry bookkeeping overhead counted against the total-bytes budget.
const ENTRY_OVERHEAD: u64 = 64;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub inserted_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
}

impl CacheEntry {
    fn new(body: Bytes) -> Self {
        let now = Instant::now();
        Self {
            body,
            inserted_at: now,
            last_access_at: now,
            access_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// A snapshot returned from a successful `lookup`. Cheap to clone: `body` is
/// a refcounted `Bytes` view over the stored response.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub body: Bytes,
    pub access_count: u64,
}

fn accounted_size(key_len: usize, body_len: usize) -> u64 {
    key_len as u64 + body_len as u64 + ENTRY_OVERHEAD
}

struct Inner {
    entries: IndexMap<Bytes, CacheEntry>,
    total_bytes: u64,
}

impl Inner {
    fn entry_size(&self, key: &Bytes, entry: &CacheEntry) -> u64 {
        accounted_size(key.len(), entry.len())
    }

    /// Evict least-recently-used entries until `incoming_size` fits within
    /// `max_total_bytes`. Returns the number of entries evicted.
    fn evict_to_fit(&mut self, incoming_size: u64, max_total_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.total_bytes + incoming_size > max_total_bytes {
            match self.entries.shift_remove_index(0) {
                Some((key, entry)) => {
                    self.total_bytes -= self.entry_size(&key, &entry);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded-size, read-mostly LRU cache.
///
/// Concurrency: lookups take the lock in upgradable-read mode, clone out the
/// body on the fast path, then upgrade to a writer only to promote the entry
/// — re-validating the key is still present, since an eviction or a
/// concurrent `insert` with the same key may have removed it between the
/// initial check and the upgrade.
pub struct LruCache {
    inner: RwLock<Inner>,
    max_total_bytes: u64,
    max_entry_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LruCache {
    pub fn new(max_total_bytes: u64, max_entry_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: IndexMap::new(),
                total_bytes: 0,
            }),
            max_total_bytes,
            max_entry_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn lookup(&self, key: &[u8]) -> Option<EntrySnapshot> {
        let upgradable = self.inner.upgradable_read();

        if !upgradable.entries.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut writer = parking_lot::RwLockUpgradableReadGuard::upgrade(upgradable);

        // Re-validate: the entry may have been evicted or replaced between
        // the read check above and acquiring the writer.
        let Some(index) = writer.entries.get_index_of(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // Move to the back (most-recently-used end) without disturbing the
        // relative order of any other entry.
        writer
            .entries
            .move_index(index, writer.entries.len() - 1);

        let entry = writer
            .entries
            .get_mut(key)
            .expect("just validated presence above");
        entry.last_access_at = Instant::now();
        entry.access_count += 1;

        let snapshot = EntrySnapshot {
            body: entry.body.clone(),
            access_count: entry.access_count,
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(snapshot)
    }

    /// Insert or replace `key`. Returns `false` (without modifying the
    /// cache) when the entry alone would exceed `max_entry_bytes`.
    pub fn insert(&self, key: Bytes, body: Bytes) -> bool {
        let incoming_size = accounted_size(key.len(), body.len());
        if incoming_size > self.max_entry_bytes {
            return false;
        }

        let mut inner = self.inner.write();

        if let Some(old) = inner.entries.shift_remove(&key) {
            inner.total_bytes -= accounted_size(key.len(), old.len());
        }

        let evicted = inner.evict_to_fit(incoming_size, self.max_total_bytes);
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }

        inner.total_bytes += incoming_size;
        inner.entries.insert(key, CacheEntry::new(body));

        true
    }

    /// Remove the single least-recently-used entry. No-op when empty.
    pub fn evict_one(&self) {
        let mut inner = self.inner.write();
        if let Some((key, entry)) = inner.entries.shift_remove_index(0) {
            inner.total_bytes -= accounted_size(key.len(), entry.len());
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn miss_then_hit() {
        let cache = LruCache::new(1024, 256);
        assert!(cache.lookup(b"k").is_none());
        assert!(cache.insert(bytes("k"), bytes("v")));
        let snap = cache.lookup(b"k").unwrap();
        assert_eq!(snap.body, bytes("v"));
        assert_eq!(snap.access_count, 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn hit_is_idempotent_and_repeatable() {
        let cache = LruCache::new(1024, 256);
        cache.insert(bytes("k"), bytes("HELLO"));
        let first = cache.lookup(b"k").unwrap();
        let second = cache.lookup(b"k").unwrap();
        assert_eq!(first.body, second.body);
    }

    #[test]
    fn rejects_oversize_entry() {
        let cache = LruCache::new(1024, 8);
        assert!(!cache.insert(bytes("k"), bytes("too long for the entry cap")));
        assert!(cache.lookup(b"k").is_none());
    }

    #[test]
    fn duplicate_key_replaces_and_promotes() {
        let cache = LruCache::new(1024, 256);
        cache.insert(bytes("a"), bytes("1"));
        cache.insert(bytes("b"), bytes("2"));
        cache.insert(bytes("a"), bytes("3"));

        assert_eq!(cache.lookup(b"a").unwrap().body, bytes("3"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lru_eviction_order() {
        // Each entry accounts for len("X") + len("A") + ENTRY_OVERHEAD = 1 + 1 + 64 = 66.
        // Budget for exactly two entries.
        let per_entry = accounted_size(1, 1);
        let cache = LruCache::new(per_entry * 2, per_entry);

        cache.insert(bytes("A"), bytes("1"));
        cache.insert(bytes("B"), bytes("2"));
        cache.insert(bytes("C"), bytes("3"));

        assert!(cache.lookup(b"A").is_none(), "A should have been evicted");
        assert!(cache.lookup(b"B").is_some());
        assert!(cache.lookup(b"C").is_some());
    }

    #[test]
    fn touching_b_protects_it_from_eviction() {
        let per_entry = accounted_size(1, 1);
        let cache = LruCache::new(per_entry * 2, per_entry);

        cache.insert(bytes("A"), bytes("1"));
        cache.insert(bytes("B"), bytes("2"));
        // Promote A to MRU; B becomes LRU.
        cache.lookup(b"A");
        cache.insert(bytes("C"), bytes("3"));

        assert!(cache.lookup(b"B").is_none(), "B should have been evicted");
        assert!(cache.lookup(b"A").is_some());
        assert!(cache.lookup(b"C").is_some());
    }

    #[test]
    fn total_bytes_never_exceeds_budget() {
        let cache = LruCache::new(300, 100);
        for i in 0..50u32 {
            let k = Bytes::copy_from_slice(&i.to_le_bytes());
            cache.insert(k, bytes("payload"));
            assert!(cache.total_bytes() <= 300);
        }
    }

    #[test]
    fn evict_one_removes_lru() {
        let cache = LruCache::new(1024, 256);
        cache.insert(bytes("a"), bytes("1"));
        cache.insert(bytes("b"), bytes("2"));
        cache.evict_one();
        assert!(cache.lookup(b"a").is_none());
        assert!(cache.lookup(b"b").is_some());
    }

    #[test]
    fn evict_one_on_empty_is_noop() {
        let cache = LruCache::new(1024, 256);
        cache.evict_one();
        assert_eq!(cache.len(), 0);
    }
}
