use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::protocol::{StorageError, StorageResult};

/// Produces a JPEG still for a video file
#[async_trait]
pub trait Thumbnailer: Send + Sync {
    async fn thumbnail(&self, real_path: &Path) -> StorageResult<Vec<u8>>;
}

/// Grabs the frame at one second with `ffmpeg`
#[derive(Debug, Clone)]
pub struct FfmpegThumbnailer {
    program: PathBuf,
}

impl FfmpegThumbnailer {
    pub fn new() -> Self {
        Self::with_program("ffmpeg")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegThumbnailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Thumbnailer for FfmpegThumbnailer {
    async fn thumbnail(&self, real_path: &Path) -> StorageResult<Vec<u8>> {
        let output = Command::new(&self.program)
            .arg("-ss")
            .arg("00:00:01")
            .arg("-i")
            .arg(real_path)
            .args(["-vframes", "1", "-f", "mjpeg", "-q:v", "5", "pipe:1"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| StorageError::IoError {
                message: format!("failed to run {}: {}", self.program.display(), e),
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            tracing::debug!(
                "Thumbnail extraction failed for {} (status {})",
                real_path.display(),
                output.status
            );
            return Err(StorageError::IoError {
                message: format!("no thumbnail for {}", real_path.display()),
            });
        }

        Ok(output.stdout)
    }
}
