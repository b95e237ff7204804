//! Read-through cache for directory listings.
//!
//! Backed by a bounded `moka` cache. Entries expire after a TTL and are
//! dropped wholesale, per storage, on any mutation. Each storage carries a
//! generation counter bumped on invalidation; a listing computed before a
//! bump is not stored after it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::protocol::FileEntry;

/// Time source for expiry checks
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// One directory level, by storage-relative path
    Directory(String),
    /// The whole storage
    Recursive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub storage: String,
    pub scope: CacheScope,
    pub show_hidden: bool,
}

impl CacheKey {
    pub fn directory(storage: &str, path: &str, show_hidden: bool) -> Self {
        Self {
            storage: storage.to_string(),
            scope: CacheScope::Directory(path.to_string()),
            show_hidden,
        }
    }

    pub fn recursive(storage: &str, show_hidden: bool) -> Self {
        Self {
            storage: storage.to_string(),
            scope: CacheScope::Recursive,
            show_hidden,
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    files: Arc<Vec<FileEntry>>,
    captured_at: Instant,
}

/// Upper bound on cached listings when none is configured
pub const DEFAULT_CAPACITY: u64 = 10_000;

pub struct ListingCache {
    entries: Cache<CacheKey, CacheEntry>,
    generations: RwLock<HashMap<String, u64>>,
    last_sweep: Mutex<Instant>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY, clock)
    }

    pub fn with_capacity(ttl: Duration, capacity: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            generations: RwLock::new(HashMap::new()),
            last_sweep: Mutex::new(clock.now()),
            ttl,
            clock,
        }
    }

    /// A listing captured within the TTL, if any
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<FileEntry>>> {
        let entry = self.entries.get(key)?;
        if self.is_expired(&entry, self.clock.now()) {
            self.entries.invalidate(key);
            return None;
        }
        Some(entry.files)
    }

    /// Current generation of a storage; pass it back to [`ListingCache::insert`]
    pub fn generation(&self, storage: &str) -> u64 {
        let generations = self.generations.read().unwrap_or_else(|e| e.into_inner());
        generations.get(storage).copied().unwrap_or(0)
    }

    /// Store a listing computed while the storage was at `generation`.
    /// Returns false (and stores nothing) if the storage was invalidated since.
    pub fn insert(&self, key: CacheKey, files: Arc<Vec<FileEntry>>, generation: u64) -> bool {
        let now = self.clock.now();
        {
            // held across the insert so an invalidation cannot slip in between
            let generations = self.generations.read().unwrap_or_else(|e| e.into_inner());
            let current = generations.get(&key.storage).copied().unwrap_or(0);
            if current != generation {
                return false;
            }
            self.entries.insert(
                key,
                CacheEntry {
                    files,
                    captured_at: now,
                },
            );
        }
        self.sweep_if_due(now);
        true
    }

    /// Drop every entry of `storage`. Returns how many were removed.
    pub fn invalidate_storage(&self, storage: &str) -> usize {
        let mut generations = self.generations.write().unwrap_or_else(|e| e.into_inner());
        *generations.entry(storage.to_string()).or_insert(0) += 1;

        let stale: Vec<Arc<CacheKey>> = self
            .entries
            .iter()
            .filter(|(key, _)| key.storage == storage)
            .map(|(key, _)| key)
            .collect();
        for key in &stale {
            self.entries.invalidate(key.as_ref());
        }
        stale.len()
    }

    /// Drop entries past their TTL
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Arc<CacheKey>> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.entries.invalidate(key.as_ref());
        }
        self.entries.run_pending_tasks();
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.captured_at) > self.ttl
    }

    /// At most once per TTL, evict what has expired
    fn sweep_if_due(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if now.saturating_duration_since(*last) < self.ttl {
                return;
            }
            *last = now;
        }
        let purged = self.purge_expired();
        if purged > 0 {
            tracing::debug!("Evicted {} expired listings", purged);
        }
    }
}
