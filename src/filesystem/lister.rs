use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::mpsc;

use crate::protocol::{FileEntry, StorageError, StorageResult};

use super::filter::FilterPolicy;
use super::operations::build_file_entry;

/// One-level directory listing with per-entry stats fanned out over a
/// fixed pool of worker tasks.
///
/// Result order follows stat completion, not directory order.
#[derive(Clone)]
pub struct ConcurrentLister {
    filter: Arc<FilterPolicy>,
    workers: usize,
}

struct StatJob {
    name: String,
    path: std::path::PathBuf,
    relative: String,
}

impl ConcurrentLister {
    pub fn new(filter: Arc<FilterPolicy>, workers: usize) -> Self {
        Self {
            filter,
            workers: workers.max(1),
        }
    }

    /// List `dir`, whose storage-relative form is `relative_dir`
    pub async fn list(
        &self,
        dir: &Path,
        relative_dir: &str,
        show_hidden: bool,
    ) -> StorageResult<Vec<FileEntry>> {
        let mut read_dir = fs::read_dir(dir)
            .await
            .map_err(|e| StorageError::from_io(e, dir))?;

        let mut jobs = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, dir))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && self.filter.is_hidden(&name) {
                continue;
            }
            let relative = if relative_dir.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", relative_dir, name)
            };
            jobs.push(StatJob {
                name,
                path: entry.path(),
                relative,
            });
        }

        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let total = jobs.len();
        let (job_tx, job_rx) = async_channel::bounded::<StatJob>(total);
        let (result_tx, mut result_rx) = mpsc::channel::<FileEntry>(total);

        for _ in 0..self.workers.min(total) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                while let Ok(job) = job_rx.recv().await {
                    match build_file_entry(&job.path, &job.name, job.relative).await {
                        Ok(entry) => {
                            if result_tx.send(entry).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Skipping {} in listing: {}", job.path.display(), e);
                        }
                    }
                }
            });
        }
        drop(result_tx);
        drop(job_rx);

        for job in jobs {
            // capacity equals the job count, so this never waits
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        job_tx.close();

        let mut files = Vec::with_capacity(total);
        while let Some(entry) = result_rx.recv().await {
            files.push(entry);
        }

        Ok(files)
    }
}
