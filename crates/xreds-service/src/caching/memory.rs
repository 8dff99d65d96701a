use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::CacheKey;

/// Timestamps of a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub inserted_at: Instant,
    /// The entry is not served anymore at or after this instant.
    pub expires_at: Instant,
    /// The last time the entry was inserted or requested.
    pub last_requested_at: Instant,
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    info: EntryInfo,
    /// Orders requests that happened at the same instant.
    request_seq: u64,
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<CacheKey, Entry<T>>,
    next_seq: u64,
}

impl<T> Inner<T> {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// A process-local cache with a fixed time-to-live and least-recently-requested eviction.
///
/// The lifetime of an entry starts when it is inserted and is never extended by hits. Expired
/// entries are removed lazily when they are looked up.
///
/// The internal lock is never held across an `.await`.
#[derive(Debug)]
pub struct LocalCache<T> {
    ttl: Duration,
    /// Maximum number of entries, `0` meaning unbounded.
    max_entries: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> LocalCache<T> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Returns the value of a live entry.
    ///
    /// This does not count as a request, use [`touch`](Self::touch) for that.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(key)?;
        if now < entry.info.expires_at {
            return Some(entry.value.clone());
        }

        tracing::debug!(%key, "Dataset expired from memory cache");
        inner.entries.remove(key);
        None
    }

    /// Inserts or overwrites an entry, with a lifetime starting now.
    ///
    /// Evicts the least recently requested entries when the cache grows beyond its maximum size.
    /// The entry that was just inserted is never evicted. Returns the number of evicted entries.
    pub fn insert(&self, key: CacheKey, value: T) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let request_seq = inner.next_seq();
        let entry = Entry {
            value,
            info: EntryInfo {
                inserted_at: now,
                expires_at: now + self.ttl,
                last_requested_at: now,
            },
            request_seq,
        };
        inner.entries.insert(key.clone(), entry);

        if self.max_entries == 0 || inner.entries.len() <= self.max_entries {
            return 0;
        }

        let mut candidates: Vec<_> = inner
            .entries
            .iter()
            .filter(|(k, _)| **k != key)
            .map(|(k, entry)| (entry.info.last_requested_at, entry.request_seq, k.clone()))
            .collect();
        candidates.sort_unstable();

        let excess = inner.entries.len() - self.max_entries;
        for (_, _, evicted) in candidates.into_iter().take(excess) {
            tracing::debug!(key = %evicted, "Evicting dataset from memory cache");
            inner.entries.remove(&evicted);
        }
        metric!(counter("datasets.memory.evicted") += excess as i64);
        excess
    }

    /// Marks an entry as requested now, without changing its expiration.
    ///
    /// Returns `false` if there is no such entry.
    pub fn touch(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let request_seq = inner.next_seq();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.info.last_requested_at = now;
                entry.request_seq = request_seq;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(key).map(|entry| entry.value)
    }

    /// The number of entries, including expired ones that were not looked up since.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The timestamps of an entry, whether or not it is expired.
    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|entry| entry.info)
    }
}
