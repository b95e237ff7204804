//! Named storage mounts with a durable search index and a listing cache.

pub mod daemon;
pub mod filesystem;
pub mod protocol;

pub use filesystem::config::{Mount, StorageConfig};
pub use filesystem::StorageService;
pub use protocol::{
    FileEntry, IndexPhase, IndexStatus, SearchPage, StorageError, StorageInfo, StorageResult,
};
