//! Background and on-demand reindexing.
//!
//! Each storage moves `Stale -> Indexing -> Fresh`. Only one walk per
//! storage runs at a time: a request that arrives while one is running
//! marks the storage for exactly one more pass after the current one, so
//! a burst of mutations costs at most two walks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::protocol::{IndexPhase, IndexStatus, StorageError, StorageResult};

use super::cache::ListingCache;
use super::config::Mount;
use super::index::{IndexStore, RebuildStats};
use super::security::PathResolver;
use super::walker::RecursiveWalker;

#[derive(Debug, Clone)]
struct StorageSlot {
    phase: IndexPhase,
    rerun: bool,
    last_count: Option<u64>,
    last_indexed_at: Option<DateTime<Utc>>,
}

impl StorageSlot {
    fn stale() -> Self {
        Self {
            phase: IndexPhase::Stale,
            rerun: false,
            last_count: None,
            last_indexed_at: None,
        }
    }
}

struct SchedulerInner {
    resolver: Arc<PathResolver>,
    walker: RecursiveWalker,
    index: Arc<IndexStore>,
    cache: Arc<ListingCache>,
    slots: DashMap<String, StorageSlot>,
    interval: Duration,
    passes: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct IndexScheduler {
    inner: Arc<SchedulerInner>,
}

impl IndexScheduler {
    pub fn new(
        resolver: Arc<PathResolver>,
        walker: RecursiveWalker,
        index: Arc<IndexStore>,
        cache: Arc<ListingCache>,
        interval: Duration,
    ) -> Self {
        let slots = DashMap::new();
        for mount in resolver.mounts() {
            slots.insert(mount.name.clone(), StorageSlot::stale());
        }
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                resolver,
                walker,
                index,
                cache,
                slots,
                interval,
                passes: AtomicU64::new(0),
                shutdown_tx,
            }),
        }
    }

    /// Spawn the periodic loop: one full pass right away, then one per
    /// interval, until [`IndexScheduler::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(scheduler.inner.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown_rx.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = timer.tick() => {
                        let purged = scheduler.inner.cache.purge_expired();
                        if purged > 0 {
                            tracing::debug!("Purged {} expired listings", purged);
                        }
                        scheduler.reindex_all().await;
                    }
                    _ = shutdown_rx.changed() => {}
                }
            }
            tracing::info!("Index scheduler stopped");
        })
    }

    /// Stop the periodic loop. Walks already running finish on their own.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Reindex every storage concurrently and wait for all of them
    pub async fn reindex_all(&self) {
        let started = Instant::now();
        let mut jobs = JoinSet::new();
        for mount in self.inner.resolver.mounts() {
            let scheduler = self.clone();
            let name = mount.name.clone();
            jobs.spawn(async move {
                if let Err(e) = scheduler.reindex_storage(&name).await {
                    tracing::error!("Failed to index storage {}: {}", name, e);
                }
            });
        }
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Index job panicked: {}", e);
            }
        }
        self.inner.passes.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Full index pass finished in {:?}", started.elapsed());
    }

    /// Fire-and-forget reindex of one storage
    pub fn trigger(&self, storage: &str) -> JoinHandle<()> {
        let scheduler = self.clone();
        let storage = storage.to_string();
        tokio::spawn(async move {
            if let Err(e) = scheduler.reindex_storage(&storage).await {
                tracing::error!("Failed to index storage {}: {}", storage, e);
            }
        })
    }

    /// Fire-and-forget reindex of every storage
    pub fn trigger_all(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.reindex_all().await })
    }

    /// Walk `storage` and swap its index rows.
    ///
    /// Returns `None` when a walk was already running; that walk will make
    /// one more pass on its own.
    pub async fn reindex_storage(&self, storage: &str) -> StorageResult<Option<RebuildStats>> {
        let mount = self.inner.resolver.mount(storage)?.clone();
        if !self.try_begin(&mount.name) {
            tracing::debug!("Index of {} already running, queued another pass", mount.name);
            return Ok(None);
        }

        loop {
            let result = self.run_pass(&mount).await;
            let rerun = self.finish(&mount.name, result.as_ref().ok().map(|s| s.inserted));
            if !rerun {
                return result.map(Some);
            }
            tracing::debug!("Re-indexing {} for changes made during the last pass", mount.name);
        }
    }

    pub fn status(&self) -> Vec<IndexStatus> {
        self.inner
            .resolver
            .mounts()
            .iter()
            .map(|mount| {
                let slot = self
                    .inner
                    .slots
                    .get(&mount.name)
                    .map(|s| s.value().clone())
                    .unwrap_or_else(StorageSlot::stale);
                IndexStatus {
                    storage: mount.name.clone(),
                    phase: slot.phase,
                    last_count: slot.last_count,
                    last_indexed_at: slot.last_indexed_at,
                }
            })
            .collect()
    }

    /// Number of completed full passes
    pub fn completed_passes(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    async fn run_pass(&self, mount: &Mount) -> StorageResult<RebuildStats> {
        let started = Instant::now();
        let walker = self.inner.walker.clone();
        let index = self.inner.index.clone();
        let root = mount.root.clone();
        let name = mount.name.clone();

        tracing::info!("Indexing storage {} ({})", mount.name, mount.root.display());
        let stats = tokio::task::spawn_blocking(move || {
            let entries = walker.walk_all(&root, false)?;
            index.rebuild(&name, &entries)
        })
        .await
        .map_err(|e| StorageError::IoError {
            message: format!("index task failed: {}", e),
        })??;

        tracing::info!(
            "Indexed {}: {} entries ({} skipped) in {:?}",
            mount.name,
            stats.inserted,
            stats.skipped,
            started.elapsed()
        );
        Ok(stats)
    }

    /// Claim the storage for a walk. If one is running, ask it to go again.
    fn try_begin(&self, storage: &str) -> bool {
        let mut slot = self
            .inner
            .slots
            .entry(storage.to_string())
            .or_insert_with(StorageSlot::stale);
        if slot.phase == IndexPhase::Indexing {
            slot.rerun = true;
            return false;
        }
        slot.phase = IndexPhase::Indexing;
        true
    }

    /// Record a finished walk. Returns true if another pass was requested,
    /// in which case the storage stays claimed.
    fn finish(&self, storage: &str, indexed: Option<u64>) -> bool {
        let mut slot = self
            .inner
            .slots
            .entry(storage.to_string())
            .or_insert_with(StorageSlot::stale);
        if let Some(count) = indexed {
            slot.last_count = Some(count);
            slot.last_indexed_at = Some(Utc::now());
        }
        if slot.rerun {
            slot.rerun = false;
            return true;
        }
        slot.phase = if indexed.is_some() {
            IndexPhase::Fresh
        } else {
            IndexPhase::Stale
        };
        false
    }
}
