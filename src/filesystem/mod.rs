//! Storage indexing and caching engine

pub mod cache;
pub mod config;
pub mod filter;
pub mod index;
pub mod lister;
pub mod mime;
pub mod operations;
pub mod path_utils;
pub mod platform;
pub mod scheduler;
pub mod security;
pub mod thumbnail;
pub mod walker;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;

use crate::protocol::{
    FileEntry, IndexStatus, SearchPage, StorageError, StorageInfo, StorageResult,
};

use cache::{CacheKey, Clock, ListingCache, SystemClock};
use config::StorageConfig;
use index::{IndexStore, SearchQuery};
use lister::ConcurrentLister;
use operations::{OpenedFile, StorageDriver};
use scheduler::IndexScheduler;
use security::PathResolver;
use thumbnail::{FfmpegThumbnailer, Thumbnailer};
use walker::RecursiveWalker;

/// The one handle consumers hold: listings through the cache, searches
/// through the index, and mutations that keep both honest.
pub struct StorageService {
    config: Arc<StorageConfig>,
    resolver: Arc<PathResolver>,
    driver: StorageDriver,
    lister: ConcurrentLister,
    walker: RecursiveWalker,
    index: Arc<IndexStore>,
    cache: Arc<ListingCache>,
    scheduler: IndexScheduler,
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl StorageService {
    /// Open the on-disk index named in `config`. Does not start indexing.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        let index = IndexStore::open(&config.index_path, config.filter.hidden_prefixes.clone())?;
        Ok(Self::with_parts(
            config,
            index,
            Arc::new(SystemClock),
            Arc::new(FfmpegThumbnailer::new()),
        ))
    }

    pub fn with_parts(
        config: StorageConfig,
        index: IndexStore,
        clock: Arc<dyn Clock>,
        thumbnailer: Arc<dyn Thumbnailer>,
    ) -> Self {
        let config = Arc::new(config);
        let filter = Arc::new(config.filter.clone());
        let resolver = Arc::new(PathResolver::new(config.mounts.clone()));
        let driver = StorageDriver::new(resolver.clone());
        let lister = ConcurrentLister::new(filter.clone(), config.list_workers);
        let walker = RecursiveWalker::new(filter);
        let index = Arc::new(index);
        let cache = Arc::new(ListingCache::with_capacity(
            config.cache_ttl,
            config.cache_capacity,
            clock,
        ));
        let scheduler = IndexScheduler::new(
            resolver.clone(),
            walker.clone(),
            index.clone(),
            cache.clone(),
            config.reindex_interval,
        );

        Self {
            config,
            resolver,
            driver,
            lister,
            walker,
            index,
            cache,
            scheduler,
            thumbnailer,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        self.config.as_ref()
    }

    pub fn scheduler(&self) -> &IndexScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &ListingCache {
        self.cache.as_ref()
    }

    /// Start the periodic reindex loop (first pass runs immediately)
    pub fn start_indexing(&self) -> JoinHandle<()> {
        self.scheduler.start()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn list_storages(&self) -> Vec<StorageInfo> {
        self.driver.list_storages()
    }

    /// List one directory level, or the whole storage when `recursive`
    /// (in which case `path` is ignored). Served from cache within the TTL.
    pub async fn list(
        &self,
        storage: &str,
        path: &str,
        show_hidden: bool,
        recursive: bool,
    ) -> StorageResult<Vec<FileEntry>> {
        require(storage, "storage")?;

        if recursive {
            let mount = self.resolver.mount(storage)?.clone();
            let key = CacheKey::recursive(&mount.name, show_hidden);
            if let Some(files) = self.cache.get(&key) {
                return Ok(files.as_ref().clone());
            }
            let generation = self.cache.generation(&mount.name);
            let walker = self.walker.clone();
            let files = tokio::task::spawn_blocking(move || walker.walk_all(&mount.root, show_hidden))
                .await
                .map_err(|e| StorageError::IoError {
                    message: format!("listing task failed: {}", e),
                })??;
            self.cache.insert(key, Arc::new(files.clone()), generation);
            return Ok(files);
        }

        let target = self.resolver.resolve(storage, path)?;
        let relative = target.protocol_path();
        let key = CacheKey::directory(&target.storage, &relative, show_hidden);
        if let Some(files) = self.cache.get(&key) {
            return Ok(files.as_ref().clone());
        }

        let generation = self.cache.generation(&target.storage);
        let metadata = tokio::fs::metadata(&target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &target.absolute))?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory { path: relative });
        }
        let files = self
            .lister
            .list(&target.absolute, &relative, show_hidden)
            .await?;
        self.cache.insert(key, Arc::new(files.clone()), generation);
        Ok(files)
    }

    /// Indexed files of a storage, newest first, with the total match count
    pub async fn search(
        &self,
        storage: &str,
        extensions: &[String],
        limit: i64,
        offset: i64,
        days: i64,
    ) -> StorageResult<SearchPage> {
        require(storage, "storage")?;
        let query = SearchQuery {
            storage: self.resolver.mount(storage)?.name.clone(),
            extensions: extensions.to_vec(),
            limit,
            offset,
            days,
        };
        let index = self.index.clone();
        run_blocking(move || index.search(&query)).await
    }

    pub async fn recent(
        &self,
        storage: &str,
        limit: i64,
        offset: i64,
    ) -> StorageResult<Vec<FileEntry>> {
        require(storage, "storage")?;
        let name = self.resolver.mount(storage)?.name.clone();
        let index = self.index.clone();
        run_blocking(move || index.recent(&name, limit, offset)).await
    }

    /// Per-group file counts; see [`IndexStore::stats`]
    pub async fn stats(
        &self,
        storage: &str,
        groups: BTreeMap<String, Vec<String>>,
    ) -> StorageResult<BTreeMap<String, u64>> {
        require(storage, "storage")?;
        let name = self.resolver.mount(storage)?.name.clone();
        let index = self.index.clone();
        run_blocking(move || index.stats(&name, &groups)).await
    }

    /// Fire-and-forget reindex of one storage, or all of them
    pub fn reindex(&self, storage: Option<&str>) -> StorageResult<()> {
        match storage {
            Some(storage) => {
                let name = self.resolver.mount(storage)?.name.clone();
                self.scheduler.trigger(&name);
            }
            None => {
                self.scheduler.trigger_all();
            }
        }
        Ok(())
    }

    pub fn index_status(&self) -> Vec<IndexStatus> {
        self.scheduler.status()
    }

    pub async fn create_folder(&self, storage: &str, path: &str) -> StorageResult<()> {
        require(storage, "storage")?;
        require(path, "path")?;
        self.driver.create_folder(storage, path).await?;
        self.after_mutation(storage);
        Ok(())
    }

    /// Store an uploaded stream at `path`; returns the bytes written
    pub async fn upload<R>(&self, storage: &str, path: &str, src: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        require(storage, "storage")?;
        require(path, "path")?;
        let written = self.driver.save_file(storage, path, src).await?;
        self.after_mutation(storage);
        Ok(written)
    }

    pub async fn rename(&self, storage: &str, old_path: &str, new_path: &str) -> StorageResult<()> {
        require(storage, "storage")?;
        require(old_path, "old_path")?;
        require(new_path, "new_path")?;
        self.driver.rename(storage, old_path, new_path).await?;
        self.after_mutation(storage);
        Ok(())
    }

    pub async fn copy(&self, storage: &str, src_path: &str, dst_path: &str) -> StorageResult<()> {
        require(storage, "storage")?;
        require(src_path, "old_path")?;
        require(dst_path, "new_path")?;
        self.driver.copy(storage, src_path, dst_path).await?;
        self.after_mutation(storage);
        Ok(())
    }

    /// Copy `path` next to itself under a free `_copy` name; returns the new path
    pub async fn duplicate(&self, storage: &str, path: &str) -> StorageResult<String> {
        require(storage, "storage")?;
        require(path, "path")?;
        let source = self.resolver.resolve(storage, path)?;
        let target = self.driver.duplicate_target(storage, path).await?;
        let target_path = target.protocol_path();
        self.driver
            .copy(storage, &source.protocol_path(), &target_path)
            .await?;
        self.after_mutation(storage);
        Ok(target_path)
    }

    pub async fn delete(&self, storage: &str, path: &str) -> StorageResult<()> {
        require(storage, "storage")?;
        require(path, "path")?;
        self.driver.delete(storage, path).await?;
        self.after_mutation(storage);
        Ok(())
    }

    pub async fn open_file(&self, storage: &str, path: &str) -> StorageResult<OpenedFile> {
        require(storage, "storage")?;
        require(path, "path")?;
        self.driver.open_file(storage, path).await
    }

    pub fn real_path(&self, storage: &str, path: &str) -> StorageResult<std::path::PathBuf> {
        self.resolver.real_path(storage, path)
    }

    pub async fn is_directory(&self, storage: &str, path: &str) -> StorageResult<bool> {
        self.driver.is_directory(storage, path).await
    }

    pub async fn stat(&self, storage: &str, path: &str) -> StorageResult<FileEntry> {
        self.driver.stat(storage, path).await
    }

    /// JPEG still of a video file
    pub async fn thumbnail(&self, storage: &str, path: &str) -> StorageResult<Vec<u8>> {
        require(storage, "storage")?;
        require(path, "path")?;
        let target = self.resolver.resolve(storage, path)?;
        if !mime::is_video(&target.protocol_path()) {
            return Err(StorageError::validation(format!(
                "{} is not a video",
                target.protocol_path()
            )));
        }
        self.thumbnailer.thumbnail(&target.absolute).await
    }

    /// Drop the storage's cached listings now; fix its index later
    fn after_mutation(&self, storage: &str) {
        let Ok(mount) = self.resolver.mount(storage) else {
            return;
        };
        let dropped = self.cache.invalidate_storage(&mount.name);
        tracing::debug!("Invalidated {} cached listings for {}", dropped, mount.name);
        self.scheduler.trigger(&mount.name);
    }
}

fn require(value: &str, field: &str) -> StorageResult<()> {
    if value.trim().is_empty() {
        return Err(StorageError::validation(format!("{} is required", field)));
    }
    Ok(())
}

async fn run_blocking<T, F>(task: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StorageError::IndexUnavailable {
            message: format!("index task failed: {}", e),
        })?
}
